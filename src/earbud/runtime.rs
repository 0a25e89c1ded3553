use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::{Earbud, Input};
use crate::collaborators::Platform;

impl<P: Platform> Earbud<P> {
    /// Runs the core until `cancel` fires or the input channel closes,
    /// firing timers as their deadlines pass. Returns the core so callers
    /// can inspect where it ended up.
    #[instrument(skip_all, level = "info")]
    pub async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<Input>,
        cancel: CancellationToken,
    ) -> Self {
        loop {
            self.process_pending();
            let deadline = self.next_deadline();

            tokio::select! {
                () = cancel.cancelled() => {
                    info!("earbud core stopping");
                    break;
                }
                input = inputs.recv() => match input {
                    Some(input) => self.post(input),
                    None => {
                        debug!("input channel closed");
                        break;
                    }
                },
                () = sleep_until_deadline(deadline) => self.fire_due_timers(Instant::now()),
            }
        }
        self.process_pending();
        self
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

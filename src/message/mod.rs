//! Building blocks for the cooperative, message-driven components: task
//! identities, per-task interest lists, lock-gated conditional delivery and
//! a monotonic timer queue.

mod conditional;
mod envelope;
mod outbox;
mod task;
mod timers;

pub use conditional::ConditionalQueue;
pub use envelope::{Message, StateChange};
pub use outbox::Outbox;
pub use task::{TaskId, TaskList};
pub use timers::TimerQueue;

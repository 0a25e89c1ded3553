use std::collections::VecDeque;

use super::TaskId;

/// Messages a component has produced but the composition root has not yet
/// routed.
#[derive(Debug, Clone)]
pub struct Outbox<M> {
    queue: VecDeque<(TaskId, M)>,
}

impl<M> Default for Outbox<M> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }
}

impl<M> Outbox<M> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, to: TaskId, message: M) {
        self.queue.push_back((to, message));
    }

    /// Sends a copy of `message` to every task in `tasks`.
    pub fn send_all(&mut self, tasks: impl IntoIterator<Item = TaskId>, message: M)
    where
        M: Clone,
    {
        for task in tasks {
            self.send(task, message.clone());
        }
    }

    pub fn pop(&mut self) -> Option<(TaskId, M)> {
        self.queue.pop_front()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (TaskId, M)> + '_ {
        self.queue.drain(..)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

use std::collections::VecDeque;

/// Messages held back until a lock word reaches zero.
///
/// The owner sets and clears lock bits as operations start and finish, and
/// calls [`ConditionalQueue::pop_ready`] after every handled message. Each
/// released message may lock again, so messages are handed out one at a time
/// and in the order they were queued.
#[derive(Debug, Clone)]
pub struct ConditionalQueue<M> {
    lock: u16,
    held: VecDeque<M>,
}

impl<M> Default for ConditionalQueue<M> {
    fn default() -> Self {
        Self {
            lock: 0,
            held: VecDeque::new(),
        }
    }
}

impl<M> ConditionalQueue<M> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `message` behind the lock and behind anything already queued.
    pub fn push(&mut self, message: M) {
        self.held.push_back(message);
    }

    pub fn set_lock(&mut self, bits: u16) {
        self.lock |= bits;
    }

    pub fn clear_lock(&mut self, bits: u16) {
        self.lock &= !bits;
    }

    #[must_use]
    pub fn lock(&self) -> u16 {
        self.lock
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock != 0
    }

    /// Releases the oldest queued message if the lock is clear.
    pub fn pop_ready(&mut self) -> Option<M> {
        if self.is_locked() {
            return None;
        }
        self.held.pop_front()
    }

    /// Removes queued messages matching `cancel` and returns them in order.
    pub fn cancel_where(&mut self, mut cancel: impl FnMut(&M) -> bool) -> Vec<M> {
        let mut cancelled = Vec::new();
        let mut kept = VecDeque::with_capacity(self.held.len());
        for message in self.held.drain(..) {
            if cancel(&message) {
                cancelled.push(message);
            } else {
                kept.push_back(message);
            }
        }
        self.held = kept;
        cancelled
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.held.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &M> {
        self.held.iter()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn messages_wait_for_every_lock_bit() {
        let mut queue = ConditionalQueue::new();
        queue.set_lock(0b011);
        queue.push("first");
        queue.push("second");

        queue.clear_lock(0b001);
        assert_eq!(None, queue.pop_ready());

        queue.clear_lock(0b010);
        assert_eq!(Some("first"), queue.pop_ready());

        queue.set_lock(0b100);
        assert_eq!(None, queue.pop_ready());
        queue.clear_lock(0b100);
        assert_eq!(Some("second"), queue.pop_ready());
        assert_eq!(None, queue.pop_ready());
    }

    #[test]
    fn cancel_where_keeps_remaining_order() {
        let mut queue = ConditionalQueue::new();
        queue.set_lock(1);
        for value in 1..=5 {
            queue.push(value);
        }

        let cancelled = queue.cancel_where(|value| value % 2 == 0);

        assert_eq!(vec![2, 4], cancelled);
        assert_eq!(vec![1, 3, 5], queue.iter().copied().collect::<Vec<_>>());
    }
}

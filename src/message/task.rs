use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Identity of a message receiver.
///
/// Components owned by the composition root have fixed identities; anything
/// else that registers for confirmations or indications is a `Client`.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskId {
    #[display("app_sm")]
    AppSm,
    #[display("peer_signalling")]
    PeerSignalling,
    #[display("shadow_profile")]
    ShadowProfile,
    #[display("handset_service")]
    HandsetService,
    #[display("topology")]
    Topology,
    #[display("client_{_0}")]
    Client(u16),
}

/// Ordered list of tasks, each carrying a piece of data.
///
/// Insertion order is preserved so that deliveries to several tasks happen in
/// registration order.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TaskList<D = ()> {
    entries: Vec<(TaskId, D)>,
}

impl<D> Default for TaskList<D> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<D> TaskList<D> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `task` with `data`, returning `false` if it was already listed.
    pub fn add_with_data(&mut self, task: TaskId, data: D) -> bool {
        if self.contains(task) {
            return false;
        }
        self.entries.push((task, data));
        true
    }

    /// Removes `task`, returning its data if it was listed.
    pub fn remove(&mut self, task: TaskId) -> Option<D> {
        let index = self.entries.iter().position(|(entry, _)| *entry == task)?;
        Some(self.entries.remove(index).1)
    }

    #[must_use]
    pub fn contains(&self, task: TaskId) -> bool {
        self.entries.iter().any(|(entry, _)| *entry == task)
    }

    #[must_use]
    pub fn data(&self, task: TaskId) -> Option<&D> {
        self.entries
            .iter()
            .find(|(entry, _)| *entry == task)
            .map(|(_, data)| data)
    }

    pub fn data_mut(&mut self, task: TaskId) -> Option<&mut D> {
        self.entries
            .iter_mut()
            .find(|(entry, _)| *entry == task)
            .map(|(_, data)| data)
    }

    pub fn iter(&self) -> impl Iterator<Item = (TaskId, &D)> {
        self.entries.iter().map(|(task, data)| (*task, data))
    }

    pub fn tasks(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.entries.iter().map(|(task, _)| *task)
    }

    /// Keeps only the entries for which `keep` returns `true`.
    pub fn retain(&mut self, mut keep: impl FnMut(TaskId, &mut D) -> bool) {
        self.entries.retain_mut(|(task, data)| keep(*task, data));
    }

    /// Removes and returns every entry.
    pub fn drain(&mut self) -> impl Iterator<Item = (TaskId, D)> + '_ {
        self.entries.drain(..)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TaskList<()> {
    /// Adds `task`, returning `false` if it was already listed.
    pub fn add(&mut self, task: TaskId) -> bool {
        self.add_with_data(task, ())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn add_keeps_registration_order_and_rejects_duplicates() {
        let mut list = TaskList::new();
        assert!(list.add(TaskId::Client(2)));
        assert!(list.add(TaskId::AppSm));
        assert!(!list.add(TaskId::Client(2)));

        let tasks: Vec<TaskId> = list.tasks().collect();
        assert_eq!(vec![TaskId::Client(2), TaskId::AppSm], tasks);
    }

    #[test]
    fn data_can_be_updated_in_place() {
        let mut list = TaskList::new();
        list.add_with_data(TaskId::Client(1), 0b01_u32);
        if let Some(mask) = list.data_mut(TaskId::Client(1)) {
            *mask |= 0b10;
        }

        assert_eq!(Some(&0b11), list.data(TaskId::Client(1)));
        assert_eq!(Some(0b11), list.remove(TaskId::Client(1)));
        assert!(list.is_empty());
    }

    #[test]
    fn task_ids_display_as_snake_case() {
        assert_eq!("client_7", TaskId::Client(7).to_string());
        assert_eq!("handset_service", TaskId::HandsetService.to_string());
    }
}

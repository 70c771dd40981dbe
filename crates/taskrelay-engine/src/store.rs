//! In-memory task store.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

use taskrelay_core::{Task, TaskId};

/// Tasks indexed by id.
///
/// Reads take a shared lock; state transitions take the write lock only
/// for the duration of the mutation, never across an await.
#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: Task) {
        self.tasks.write().insert(task.id.clone(), task);
    }

    /// Snapshot of a task.
    pub fn get(&self, id: &TaskId) -> Option<Task> {
        self.tasks.read().get(id).cloned()
    }

    /// Apply `f` to a task under the write lock.
    pub fn update<R>(&self, id: &TaskId, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
        self.tasks.write().get_mut(id).map(f)
    }

    pub fn remove(&self, id: &TaskId) -> Option<Task> {
        self.tasks.write().remove(id)
    }

    /// Snapshots of every task matching `predicate`.
    pub fn filter(&self, predicate: impl Fn(&Task) -> bool) -> Vec<Task> {
        self.tasks
            .read()
            .values()
            .filter(|task| predicate(task))
            .cloned()
            .collect()
    }

    /// Remove tasks more than `grace` past their expiry. Returns the
    /// removed ids.
    pub fn sweep_expired(&self, now: DateTime<Utc>, grace: Duration) -> Vec<TaskId> {
        let mut tasks = self.tasks.write();
        let expired: Vec<TaskId> = tasks
            .values()
            .filter(|task| task.is_sweepable(now, grace))
            .map(|task| task.id.clone())
            .collect();
        for id in &expired {
            tasks.remove(id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }
}

// src/scheduler/queue.rs

use std::collections::VecDeque;

use tracing::debug;

use crate::types::TaskId;

/// Bounded FIFO of tasks waiting for a free worker.
///
/// Semantics:
/// - `capacity` is the backlog limit: the number of `pending` tasks the
///   service is willing to hold. A full queue rejects new entries instead of
///   growing.
/// - Entries leave either from the front (a worker claims the oldest task)
///   or from anywhere (a pending task was cancelled).
#[derive(Debug)]
pub struct DispatchQueue {
    capacity: usize,
    entries: VecDeque<TaskId>,
}

impl DispatchQueue {
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Append `id`, or hand it back if the queue is full.
    pub fn try_push(&mut self, id: TaskId) -> Result<(), TaskId> {
        if self.is_full() {
            return Err(id);
        }
        self.entries.push_back(id);
        debug!(task_id = %id, queued = self.entries.len(), "task queued");
        Ok(())
    }

    /// Oldest waiting task.
    pub fn pop(&mut self) -> Option<TaskId> {
        self.entries.pop_front()
    }

    /// Remove `id` wherever it is. Returns whether it was queued.
    pub fn remove(&mut self, id: &TaskId) -> bool {
        match self.entries.iter().position(|queued| queued == id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Take every waiting task, oldest first.
    pub fn drain(&mut self) -> Vec<TaskId> {
        self.entries.drain(..).collect()
    }
}

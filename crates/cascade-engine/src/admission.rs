use chrono::{DateTime, Utc};

use cascade_core::types::WorkflowId;

#[derive(Debug, Clone)]
struct QueuedWorkflow {
    id: WorkflowId,
    priority: u8,
    queued_at: DateTime<Utc>,
    seq: u64,
}

/// Bounded wait queue for workflows that could not get a slot.
/// Higher priority first, then first come first served.
#[derive(Debug)]
pub struct AdmissionQueue {
    entries: Vec<QueuedWorkflow>,
    capacity: usize,
    next_seq: u64,
}

impl AdmissionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
            next_seq: 0,
        }
    }

    /// Returns false when the queue is full.
    pub fn push(&mut self, id: WorkflowId, priority: u8, queued_at: DateTime<Utc>) -> bool {
        if self.entries.len() >= self.capacity {
            return false;
        }
        if self.contains(&id) {
            return true;
        }
        self.entries.push(QueuedWorkflow {
            id,
            priority,
            queued_at,
            seq: self.next_seq,
        });
        self.next_seq += 1;
        true
    }

    pub fn pop(&mut self) -> Option<WorkflowId> {
        let best = self
            .entries
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.queued_at.cmp(&b.queued_at))
                    .then(a.seq.cmp(&b.seq))
            })
            .map(|(i, _)| i)?;
        Some(self.entries.remove(best).id)
    }

    pub fn remove(&mut self, id: &WorkflowId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| &e.id != id);
        self.entries.len() != before
    }

    pub fn contains(&self, id: &WorkflowId) -> bool {
        self.entries.iter().any(|e| &e.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_then_fifo() {
        let mut q = AdmissionQueue::new(10);
        let now = Utc::now();
        let low = WorkflowId::from_str("low");
        let high_a = WorkflowId::from_str("high-a");
        let high_b = WorkflowId::from_str("high-b");

        assert!(q.push(low.clone(), 2, now));
        assert!(q.push(high_a.clone(), 9, now));
        assert!(q.push(high_b.clone(), 9, now));

        assert_eq!(q.pop(), Some(high_a));
        assert_eq!(q.pop(), Some(high_b));
        assert_eq!(q.pop(), Some(low));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_capacity_and_remove() {
        let mut q = AdmissionQueue::new(1);
        let a = WorkflowId::from_str("a");
        assert!(q.push(a.clone(), 5, Utc::now()));
        assert!(!q.push(WorkflowId::from_str("b"), 5, Utc::now()));
        assert!(q.remove(&a));
        assert!(!q.remove(&a));
        assert!(q.is_empty());
    }
}

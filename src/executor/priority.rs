use super::task::{Priority, Task};
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;

#[derive(Debug)]
struct PriorityTask {
    task: Task,
    priority: Priority,
    seq: u64,
}

impl PartialEq for PriorityTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for PriorityTask {}

impl PartialOrd for PriorityTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // max-heap: most urgent priority first, then oldest
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct Heap {
    tasks: BinaryHeap<PriorityTask>,
    next_seq: u64,
}

/// Heap for tasks whose priority differs from [`Priority::Normal`].
#[derive(Debug, Default)]
pub(crate) struct PriorityQueue {
    heap: Mutex<Heap>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, task: Task) {
        let mut heap = self.heap.lock();
        let seq = heap.next_seq;
        heap.next_seq += 1;
        heap.tasks.push(PriorityTask {
            priority: task.priority,
            task,
            seq,
        });
    }

    /// Pop the most urgent task, if it is at least as urgent as `bound`.
    pub fn pop_at_most(&self, bound: Priority) -> Option<Task> {
        let mut heap = self.heap.lock();
        match heap.tasks.peek() {
            Some(top) if top.priority <= bound => heap.tasks.pop().map(|pt| pt.task),
            _ => None,
        }
    }

    pub fn pop(&self) -> Option<Task> {
        self.heap.lock().tasks.pop().map(|pt| pt.task)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.heap.lock().tasks.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.heap.lock().tasks.len()
    }

    #[cfg(test)]
    pub fn peek(&self) -> Option<Priority> {
        self.heap.lock().tasks.peek().map(|pt| pt.priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(priority: Priority) -> Task {
        Task::with_priority(|| {}, priority)
    }

    #[test]
    fn test_priority_queue() {
        let queue = PriorityQueue::new();

        queue.push(task(Priority::Low));
        queue.push(task(Priority::High));
        queue.push(task(Priority::Background));

        assert_eq!(queue.peek(), Some(Priority::High));
        queue.pop();
        assert_eq!(queue.peek(), Some(Priority::Low));
        queue.pop();
        assert_eq!(queue.peek(), Some(Priority::Background));
        queue.pop();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_same_priority_is_fifo() {
        let queue = PriorityQueue::new();
        let first = task(Priority::Low);
        let second = task(Priority::Low);
        let (first_id, second_id) = (first.id, second.id);

        queue.push(first);
        queue.push(second);

        assert_eq!(queue.pop().map(|t| t.id), Some(first_id));
        assert_eq!(queue.pop().map(|t| t.id), Some(second_id));
    }

    #[test]
    fn test_pop_at_most_respects_bound() {
        let queue = PriorityQueue::new();
        queue.push(task(Priority::Background));

        assert!(queue.pop_at_most(Priority::High).is_none());
        assert_eq!(queue.len(), 1);
        assert!(queue.pop_at_most(Priority::Background).is_some());
    }
}

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

/// Identifies a scheduled task so it can be cancelled before it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

/// A queue of deferred work items ordered by a monotonic due-time.
///
/// The event loop uses this queue as its only source of time-driven work:
/// [`next_due_in`](TaskQueue::next_due_in) bounds how long the loop may wait
/// for socket traffic, and [`pop_due`](TaskQueue::pop_due) hands out the
/// soonest task once that wait elapses. Cancellation tombstones the entry;
/// tombstones are skipped when they surface at the head of the heap.
pub struct TaskQueue<T> {
    heap: BinaryHeap<Entry<T>>,
    live: HashSet<u64>,
    cancelled: HashSet<u64>,
    next_id: u64,
}

struct Entry<T> {
    due_at: Instant,
    id: u64,
    payload: T,
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        TaskQueue {
            heap: BinaryHeap::new(),
            live: HashSet::new(),
            cancelled: HashSet::new(),
            next_id: 0,
        }
    }

    /// Schedule `payload` to fire `due_in` from now. Several tasks may share
    /// a due-time; their relative order is unspecified.
    pub fn add(&mut self, due_in: Duration, payload: T) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        self.live.insert(id);
        self.heap.push(Entry {
            due_at: Instant::now() + due_in,
            id,
            payload,
        });
        TaskId(id)
    }

    /// Interval until the soonest pending task, zero if it is already due,
    /// or `None` when nothing is scheduled.
    pub fn next_due_in(&mut self) -> Option<Duration> {
        self.skim();
        self.heap
            .peek()
            .map(|entry| entry.due_at.saturating_duration_since(Instant::now()))
    }

    /// Remove and return the soonest pending task. The caller runs it; a
    /// popped task can never fire twice because it no longer exists here.
    pub fn pop_due(&mut self) -> Option<(TaskId, T)> {
        self.skim();
        let entry = self.heap.pop()?;
        self.live.remove(&entry.id);
        Some((TaskId(entry.id), entry.payload))
    }

    /// Cancel a task that has not fired yet. Cancelling a task that already
    /// fired, or was never scheduled, is a no-op.
    pub fn cancel(&mut self, task: TaskId) {
        if self.live.remove(&task.0) {
            self.cancelled.insert(task.0);
        }
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    // Drop tombstoned entries sitting at the head of the heap.
    fn skim(&mut self) {
        while let Some(entry) = self.heap.peek() {
            if !self.cancelled.contains(&entry.id) {
                break;
            }
            self.cancelled.remove(&entry.id);
            self.heap.pop();
        }
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        TaskQueue::new()
    }
}

// The heap is a max-heap; entries compare inverted so the soonest due-time
// surfaces first. Ties break on insertion order.
impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due_at
            .cmp(&self.due_at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Entry<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_due_order() {
        let mut queue = TaskQueue::new();
        queue.add(Duration::from_millis(30), "third");
        queue.add(Duration::from_millis(10), "first");
        queue.add(Duration::from_millis(20), "second");

        assert_eq!(queue.pop_due().unwrap().1, "first");
        assert_eq!(queue.pop_due().unwrap().1, "second");
        assert_eq!(queue.pop_due().unwrap().1, "third");
        assert!(queue.pop_due().is_none());
    }

    #[test]
    fn next_due_in_is_none_when_empty() {
        let mut queue: TaskQueue<()> = TaskQueue::new();
        assert!(queue.next_due_in().is_none());
    }

    #[test]
    fn overdue_task_is_due_now() {
        let mut queue = TaskQueue::new();
        queue.add(Duration::ZERO, ());
        assert_eq!(queue.next_due_in(), Some(Duration::ZERO));
    }

    #[test]
    fn cancel_removes_pending_task() {
        let mut queue = TaskQueue::new();
        let keep = queue.add(Duration::from_millis(10), "keep");
        let gone = queue.add(Duration::from_millis(5), "gone");
        queue.cancel(gone);

        assert_eq!(queue.len(), 1);
        let (id, payload) = queue.pop_due().unwrap();
        assert_eq!(id, keep);
        assert_eq!(payload, "keep");
        assert!(queue.is_empty());
    }

    #[test]
    fn cancel_after_pop_is_noop() {
        let mut queue = TaskQueue::new();
        let task = queue.add(Duration::ZERO, ());
        queue.pop_due().unwrap();
        queue.cancel(task);
        assert!(queue.is_empty());
        assert!(queue.next_due_in().is_none());
    }

    #[test]
    fn cancelled_task_does_not_mask_the_next_deadline() {
        let mut queue = TaskQueue::new();
        let soon = queue.add(Duration::ZERO, "soon");
        queue.add(Duration::from_secs(60), "later");
        queue.cancel(soon);

        let due_in = queue.next_due_in().unwrap();
        assert!(due_in > Duration::from_secs(50));
    }
}

use crate::scheduler::task::Task;
use crossbeam_deque::{Injector, Steal};
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// FIFO task queue with an activation flag. Multi-producer and
/// multi-consumer: submitters push from any thread, the owning worker and
/// stealers pop concurrently.
pub struct TaskQueue<T> {
    injector: Injector<T>,
    active: AtomicBool,
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            injector: Injector::new(),
            active: AtomicBool::new(true),
        }
    }

    pub fn push(&self, task: T) {
        self.injector.push(task);
    }

    /// Non-blocking pop. Returns `None` when the queue is empty or has been
    /// deactivated.
    pub fn try_pop(&self) -> Option<T> {
        if !self.active() {
            return None;
        }
        loop {
            match self.injector.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Empty => return None,
                Steal::Retry => {}
            }
        }
    }

    pub fn size(&self) -> usize {
        self.injector.len()
    }

    pub fn empty(&self) -> bool {
        self.injector.is_empty()
    }

    pub fn active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// NUMA placement hook: the owning worker calls this on its first tick so
    /// internal buffers are first-touched on the worker's node. The lock-free
    /// injector allocates blocks lazily on push, so there is nothing to
    /// rebuild here; the call site is preserved for allocators that need it.
    pub fn reconstruct(&self) {}

    /// Pops regardless of the activation flag. Used by scheduler teardown to
    /// drop tasks left behind after `stop()`.
    pub(crate) fn drain(&self) -> Vec<T> {
        let mut out = Vec::new();
        loop {
            match self.injector.steal() {
                Steal::Success(task) => out.push(task),
                Steal::Empty => return out,
                Steal::Retry => {}
            }
        }
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct DelayedEntry {
    not_before: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.not_before == other.not_before && self.seq == other.seq
    }
}

impl Eq for DelayedEntry {}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    // reversed so the BinaryHeap pops the earliest instant first; seq keeps
    // push order among equal instants
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.not_before, other.seq).cmp(&(self.not_before, self.seq))
    }
}

/// Per-worker queue of delayed tasks ordered by their `not_before` instant.
/// Push is safe from any thread; only the owning worker pops.
pub struct DelayedQueue {
    heap: Mutex<BinaryHeap<DelayedEntry>>,
    seq: AtomicU64,
    active: AtomicBool,
}

impl DelayedQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            active: AtomicBool::new(true),
        }
    }

    pub fn push(&self, task: Task) {
        let not_before = task.not_before().unwrap_or_else(Instant::now);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.heap.lock().push(DelayedEntry {
            not_before,
            seq,
            task,
        });
    }

    /// Pops the earliest task whose `not_before` has elapsed; `None` when the
    /// queue is empty, inactive, or the head is not yet ripe.
    pub fn try_pop(&self) -> Option<Task> {
        if !self.active() {
            return None;
        }
        let mut heap = self.heap.lock();
        if heap.peek()?.not_before > Instant::now() {
            return None;
        }
        heap.pop().map(|entry| entry.task)
    }

    /// Moves every ripe task out in `not_before` order.
    pub fn drain_ready(&self, now: Instant) -> Vec<Task> {
        if !self.active() {
            return Vec::new();
        }
        let mut heap = self.heap.lock();
        let mut out = Vec::new();
        while let Some(head) = heap.peek() {
            if head.not_before > now {
                break;
            }
            if let Some(entry) = heap.pop() {
                out.push(entry.task);
            }
        }
        out
    }

    pub fn size(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    pub fn active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// See `TaskQueue::reconstruct`.
    pub fn reconstruct(&self) {}

    pub(crate) fn drain(&self) -> Vec<Task> {
        self.heap
            .lock()
            .drain()
            .map(|entry| entry.task)
            .collect()
    }
}

impl Default for DelayedQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{DelayedQueue, TaskQueue};
    use crate::scheduler::task::Task;
    use std::time::{Duration, Instant};

    #[test]
    fn task_queue_is_fifo() {
        let q = TaskQueue::new();
        for i in 0..10 {
            q.push(i);
        }
        assert_eq!(q.size(), 10);
        for i in 0..10 {
            assert_eq!(q.try_pop(), Some(i));
        }
        assert!(q.try_pop().is_none());
        assert!(q.empty());
    }

    #[test]
    fn deactivated_queue_refuses_pop() {
        let q = TaskQueue::new();
        q.push(1);
        q.deactivate();
        assert!(!q.active());
        assert!(q.try_pop().is_none());
        // the element is still there for teardown draining
        assert_eq!(q.size(), 1);
        assert_eq!(q.drain().len(), 1);
    }

    #[test]
    fn delayed_queue_gates_on_not_before() {
        let q = DelayedQueue::new();
        q.push(Task::new_delayed(
            Instant::now() + Duration::from_millis(50),
            |_| {},
        ));
        assert!(q.try_pop().is_none());
        assert_eq!(q.size(), 1);
        std::thread::sleep(Duration::from_millis(60));
        assert!(q.try_pop().is_some());
        assert!(q.empty());
    }

    #[test]
    fn drain_ready_returns_only_ripe_tasks() {
        let q = DelayedQueue::new();
        let now = Instant::now();
        q.push(Task::new_delayed(now, |_| {}));
        q.push(Task::new_delayed(now + Duration::from_secs(60), |_| {}));
        let ready = q.drain_ready(Instant::now());
        assert_eq!(ready.len(), 1);
        assert_eq!(q.size(), 1);
    }
}

use crate::scheduler::PoolState;
use crate::scheduler::task::Task;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::error;

/// Dynamic per-worker state handed by reference into every task action.
pub struct Context {
    index: usize,
    last_steal_from: usize,
}

impl Context {
    pub(crate) fn new(index: usize, worker_count: usize) -> Self {
        Self {
            index,
            // anchor the steal rotation at the next peer so the cursor never
            // rests on the owning worker
            last_steal_from: (index + 1) % worker_count.max(1),
        }
    }

    /// 0-origin index of the worker this context belongs to.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Index of the worker most recently stolen from.
    pub fn last_steal_from(&self) -> usize {
        self.last_steal_from
    }
}

#[derive(Default)]
pub(crate) struct WorkerStat {
    pub(crate) executed: AtomicU64,
    pub(crate) stolen: AtomicU64,
    pub(crate) empty_polls: AtomicU64,
}

/// Point-in-time copy of one worker's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStatSnapshot {
    pub executed: u64,
    pub stolen: u64,
    pub empty_polls: u64,
}

impl WorkerStat {
    pub(crate) fn snapshot(&self) -> WorkerStatSnapshot {
        WorkerStatSnapshot {
            executed: self.executed.load(Ordering::Relaxed),
            stolen: self.stolen.load(Ordering::Relaxed),
            empty_polls: self.empty_polls.load(Ordering::Relaxed),
        }
    }
}

/// Worker loop bound to one pool slot. Owns no state of its own; everything
/// lives in the shared pool so the testing hatch can drive ticks by hand.
pub(crate) struct Worker {
    state: Arc<PoolState>,
    index: usize,
}

impl Worker {
    pub(crate) fn new(state: Arc<PoolState>, index: usize) -> Self {
        Self { state, index }
    }

    pub(crate) fn run(&self, ctx: &mut Context) {
        if let Some(initializer) = self.state.initializer() {
            initializer(self.index);
        }
        // first tick on the owning thread: rebuild queue internals so buffers
        // are first-touched on this worker's NUMA node
        self.state.local_queues[self.index].reconstruct();
        self.state.sticky_queues[self.index].reconstruct();
        self.state.delayed_queues[self.index].reconstruct();

        while self.state.local_queues[self.index].active() {
            if !self.process_next(ctx) {
                self.state.stats[self.index]
                    .empty_polls
                    .fetch_add(1, Ordering::Relaxed);
                if self.state.cfg.lazy_worker {
                    std::thread::sleep(Duration::from_micros(100));
                } else {
                    std::thread::yield_now();
                }
            }
        }
    }

    /// One scheduling tick: ripe delayed tasks first, then local, then
    /// sticky, then a bounded steal attempt. Returns whether a task ran.
    pub(crate) fn process_next(&self, ctx: &mut Context) -> bool {
        let index = self.index;
        for task in self.state.delayed_queues[index].drain_ready(Instant::now()) {
            self.state.local_queues[index].push(task);
        }
        if let Some(task) = self.state.local_queues[index].try_pop() {
            self.execute(task, ctx);
            return true;
        }
        if let Some(task) = self.state.sticky_queues[index].try_pop() {
            self.execute(task, ctx);
            return true;
        }
        self.try_steal(ctx)
    }

    fn try_steal(&self, ctx: &mut Context) -> bool {
        let size = self.state.local_queues.len();
        if size < 2 {
            return false;
        }
        let mut from = ctx.last_steal_from;
        for _ in 0..self.state.cfg.steal_retry_limit {
            if from != self.index {
                if let Some(task) = self.state.local_queues[from].try_pop() {
                    ctx.last_steal_from = from;
                    self.state.stats[self.index]
                        .stolen
                        .fetch_add(1, Ordering::Relaxed);
                    self.execute(task, ctx);
                    return true;
                }
            }
            from = (from + 1) % size;
            if from == self.index {
                from = (from + 1) % size;
            }
        }
        false
    }

    fn execute(&self, task: Task, ctx: &Context) {
        self.state.stats[self.index]
            .executed
            .fetch_add(1, Ordering::Relaxed);
        if catch_unwind(AssertUnwindSafe(|| task.run(ctx))).is_err() {
            error!(worker = self.index, "task action panicked; worker continues");
        }
    }
}

use crate::scheduler::PoolState;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::error;

/// Watcher loop that polls the conditional queue: ripe tasks run, the rest
/// are re-enqueued for the next poll. Single consumer, so `check` authors
/// never see concurrent invocations.
pub(crate) struct ConditionalWorker {
    state: Arc<PoolState>,
}

impl ConditionalWorker {
    pub(crate) fn new(state: Arc<PoolState>) -> Self {
        Self { state }
    }

    pub(crate) fn run(&self) {
        let queue = &self.state.conditional_queue;
        queue.reconstruct();
        while queue.active() {
            self.poll_once();
            self.state.watcher_park(self.state.cfg.watcher_interval);
        }
    }

    /// Drains every task currently enqueued, evaluates each predicate once,
    /// and re-enqueues the negatives. Exposed to the pool so the testing
    /// hatch can drive the watcher by hand.
    pub(crate) fn poll_once(&self) {
        let queue = &self.state.conditional_queue;
        let mut negatives = Vec::new();
        while let Some(mut task) = queue.try_pop() {
            match catch_unwind(AssertUnwindSafe(|| task.check())) {
                Ok(true) => {
                    if catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
                        error!("conditional task action panicked");
                    }
                }
                Ok(false) => negatives.push(task),
                // a panicking predicate would fail on every future poll, so
                // the task is dropped instead of re-enqueued
                Err(_) => error!("conditional task check panicked; task dropped"),
            }
        }
        for task in negatives {
            queue.push(task);
        }
    }
}

//! Stealing-based task scheduler: a fixed pool of worker threads, each
//! owning a local/sticky/delayed queue triple, plus one watcher thread
//! polling a shared conditional queue.

mod queue;
mod task;
mod watcher;
mod worker;

pub use queue::{DelayedQueue, TaskQueue};
pub use task::{ConditionalTask, Task};
pub use worker::{Context, WorkerStatSnapshot};

use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;
use watcher::ConditionalWorker;
use worker::{Worker, WorkerStat};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Number of worker threads (and queue triples).
    pub thread_count: usize,
    /// Pin each submitting thread to a lazily chosen worker instead of
    /// round-robin per submission.
    pub use_preferred_worker_for_current_thread: bool,
    /// Pause between conditional-queue polls; zero means yield only.
    pub watcher_interval: Duration,
    /// Peer visits per steal attempt before the worker gives up the tick.
    pub steal_retry_limit: usize,
    /// Park idle workers with a bounded sleep instead of spinning.
    pub lazy_worker: bool,
    /// Create queues and workers but no threads; tests drive ticks by hand.
    pub empty_thread: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            thread_count: 5,
            use_preferred_worker_for_current_thread: false,
            watcher_interval: Duration::from_micros(10),
            steal_retry_limit: 3,
            lazy_worker: false,
            empty_thread: false,
        }
    }
}

type Initializer = Arc<dyn Fn(usize) + Send + Sync>;

pub(crate) struct PoolState {
    pub(crate) cfg: SchedulerConfig,
    pub(crate) local_queues: Vec<TaskQueue<Task>>,
    pub(crate) sticky_queues: Vec<TaskQueue<Task>>,
    pub(crate) delayed_queues: Vec<DelayedQueue>,
    pub(crate) conditional_queue: TaskQueue<ConditionalTask>,
    pub(crate) stats: Vec<WorkerStat>,
    initializer: Mutex<Option<Initializer>>,
    watcher_lock: Mutex<()>,
    watcher_cv: Condvar,
}

impl PoolState {
    pub(crate) fn initializer(&self) -> Option<Initializer> {
        self.initializer.lock().clone()
    }

    pub(crate) fn watcher_park(&self, interval: Duration) {
        if interval.is_zero() {
            std::thread::yield_now();
            return;
        }
        let mut guard = self.watcher_lock.lock();
        self.watcher_cv.wait_for(&mut guard, interval);
    }

    fn watcher_wake(&self) {
        self.watcher_cv.notify_all();
    }
}

static NEXT_SCHEDULER_INSTANCE: AtomicU64 = AtomicU64::new(0);

thread_local! {
    // preferred worker per (thread, scheduler instance)
    static PREFERRED_WORKER: RefCell<HashMap<u64, usize>> = RefCell::new(HashMap::new());
}

/// Work-stealing scheduler tuned for steady-state throughput of short
/// service tasks with a minority of long-lived sticky ones.
pub struct Scheduler {
    state: Arc<PoolState>,
    instance: u64,
    started: AtomicBool,
    next_index: AtomicUsize,
    initial_tasks: Mutex<Vec<Vec<Task>>>,
    worker_threads: Mutex<Vec<JoinHandle<()>>>,
    watcher_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(cfg: SchedulerConfig) -> Self {
        let size = cfg.thread_count.max(1);
        let state = PoolState {
            cfg: SchedulerConfig {
                thread_count: size,
                ..cfg
            },
            local_queues: (0..size).map(|_| TaskQueue::new()).collect(),
            sticky_queues: (0..size).map(|_| TaskQueue::new()).collect(),
            delayed_queues: (0..size).map(|_| DelayedQueue::new()).collect(),
            conditional_queue: TaskQueue::new(),
            stats: (0..size).map(|_| WorkerStat::default()).collect(),
            initializer: Mutex::new(None),
            watcher_lock: Mutex::new(()),
            watcher_cv: Condvar::new(),
        };
        Self {
            state: Arc::new(state),
            instance: NEXT_SCHEDULER_INSTANCE.fetch_add(1, Ordering::Relaxed),
            started: AtomicBool::new(false),
            next_index: AtomicUsize::new(0),
            initial_tasks: Mutex::new((0..size).map(|_| Vec::new()).collect()),
            worker_threads: Mutex::new(Vec::new()),
            watcher_thread: Mutex::new(None),
        }
    }

    /// Number of workers (threads and queue triples).
    pub fn size(&self) -> usize {
        self.state.local_queues.len()
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Function called on each worker thread with the worker id before its
    /// first tick. Must be set before `start()`.
    pub fn set_initializer(&self, initializer: impl Fn(usize) + Send + Sync + 'static) {
        *self.state.initializer.lock() = Some(Arc::new(initializer));
    }

    /// Worker index this scheduler prefers for the calling thread, assigned
    /// on first use from the round-robin counter. Thread-safe.
    pub fn preferred_worker_for_current_thread(&self) -> usize {
        PREFERRED_WORKER.with(|map| {
            *map.borrow_mut()
                .entry(self.instance)
                .or_insert_with(|| self.next_worker())
        })
    }

    pub fn next_worker(&self) -> usize {
        self.next_index.fetch_add(1, Ordering::Relaxed) % self.size()
    }

    /// Schedules a task on the preferred worker (when configured) or the
    /// next round-robin slot. Thread-safe.
    pub fn schedule(&self, task: Task) {
        let index = if self.state.cfg.use_preferred_worker_for_current_thread {
            self.preferred_worker_for_current_thread()
        } else {
            self.next_worker()
        };
        self.schedule_at(task, index);
    }

    /// Schedules a task on the queue of worker `index`. Stealing may still
    /// move a non-sticky task elsewhere. Thread-safe.
    pub fn schedule_at(&self, task: Task, index: usize) {
        assert!(index < self.size(), "worker index out of range");
        if !self.started() {
            self.initial_tasks.lock()[index].push(task);
            return;
        }
        self.route(task, index);
    }

    fn route(&self, task: Task, index: usize) {
        // delayed wins over sticky when both flags are set
        if task.delayed() {
            self.state.delayed_queues[index].push(task);
        } else if task.sticky() {
            self.state.sticky_queues[index].push(task);
        } else {
            self.state.local_queues[index].push(task);
        }
    }

    /// Hands a conditional task to the watcher. Thread-safe.
    pub fn schedule_conditional(&self, task: ConditionalTask) {
        self.state.conditional_queue.push(task);
        self.state.watcher_wake();
    }

    /// Starts worker and watcher threads and drains pre-start submissions
    /// into the real queues. Not thread-safe; call once.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let buffered: Vec<Vec<Task>> = {
            let mut initial = self.initial_tasks.lock();
            initial.iter_mut().map(std::mem::take).collect()
        };
        for (index, tasks) in buffered.into_iter().enumerate() {
            for task in tasks {
                self.route(task, index);
            }
        }
        if self.state.cfg.empty_thread {
            return;
        }
        let mut threads = self.worker_threads.lock();
        for index in 0..self.size() {
            let state = Arc::clone(&self.state);
            let handle = std::thread::Builder::new()
                .name(format!("forecourt-worker-{index}"))
                .spawn(move || {
                    let worker = Worker::new(Arc::clone(&state), index);
                    let mut ctx = Context::new(index, state.local_queues.len());
                    worker.run(&mut ctx);
                })
                .expect("spawn worker thread");
            threads.push(handle);
        }
        let state = Arc::clone(&self.state);
        *self.watcher_thread.lock() = Some(
            std::thread::Builder::new()
                .name("forecourt-watcher".to_string())
                .spawn(move || ConditionalWorker::new(state).run())
                .expect("spawn watcher thread"),
        );
        debug!(workers = self.size(), "scheduler started");
    }

    /// Deactivates every queue, joins all threads, and drops the tasks left
    /// behind. Not thread-safe; safe to call more than once.
    pub fn stop(&self) {
        for q in &self.state.local_queues {
            q.deactivate();
        }
        for q in &self.state.sticky_queues {
            q.deactivate();
        }
        for q in &self.state.delayed_queues {
            q.deactivate();
        }
        self.state.conditional_queue.deactivate();
        self.state.watcher_wake();
        for handle in self.worker_threads.lock().drain(..) {
            let _ = handle.join();
        }
        if let Some(handle) = self.watcher_thread.lock().take() {
            let _ = handle.join();
        }
        for q in &self.state.local_queues {
            drop(q.drain());
        }
        for q in &self.state.sticky_queues {
            drop(q.drain());
        }
        for q in &self.state.delayed_queues {
            drop(q.drain());
        }
        drop(self.state.conditional_queue.drain());
        self.started.store(false, Ordering::Release);
        debug!("scheduler stopped");
    }

    pub fn worker_stats(&self) -> Vec<WorkerStatSnapshot> {
        self.state.stats.iter().map(WorkerStat::snapshot).collect()
    }

    /// Local queue accessor for testing.
    pub fn local_queue(&self, index: usize) -> &TaskQueue<Task> {
        &self.state.local_queues[index]
    }

    /// Sticky queue accessor for testing.
    pub fn sticky_queue(&self, index: usize) -> &TaskQueue<Task> {
        &self.state.sticky_queues[index]
    }

    /// Delayed queue accessor for testing.
    pub fn delayed_queue(&self, index: usize) -> &DelayedQueue {
        &self.state.delayed_queues[index]
    }

    /// Conditional queue accessor for testing.
    pub fn conditional_queue(&self) -> &TaskQueue<ConditionalTask> {
        &self.state.conditional_queue
    }

    /// Creates a context for driving a worker by hand in `empty_thread`
    /// mode.
    pub fn new_context(&self, index: usize) -> Context {
        Context::new(index, self.size())
    }

    /// Executes at most one task on the worker slot of `ctx`. Testing hatch
    /// for `empty_thread` mode.
    pub fn process_next(&self, ctx: &mut Context) -> bool {
        Worker::new(Arc::clone(&self.state), ctx.index()).process_next(ctx)
    }

    /// Runs one watcher poll pass by hand. Testing hatch for `empty_thread`
    /// mode.
    pub fn poll_conditional_once(&self) {
        ConditionalWorker::new(Arc::clone(&self.state)).poll_once();
    }

    pub fn print_diagnostic(&self, out: &mut dyn Write) -> std::io::Result<()> {
        if !self.started() {
            return Ok(());
        }
        writeln!(out, "worker_count: {}", self.size())?;
        writeln!(out, "workers:")?;
        for index in 0..self.size() {
            let stat = self.state.stats[index].snapshot();
            writeln!(out, "  - worker_index: {index}")?;
            writeln!(
                out,
                "    stats: executed={} stolen={} empty_polls={}",
                stat.executed, stat.stolen, stat.empty_polls
            )?;
            writeln!(out, "    queues:")?;
            writeln!(
                out,
                "      local: task_count={}",
                self.state.local_queues[index].size()
            )?;
            writeln!(
                out,
                "      sticky: task_count={}",
                self.state.sticky_queues[index].size()
            )?;
            writeln!(
                out,
                "      delayed: task_count={}",
                self.state.delayed_queues[index].size()
            )?;
        }
        writeln!(
            out,
            "conditional: task_count={}",
            self.state.conditional_queue.size()
        )?;
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::{Scheduler, SchedulerConfig, Task};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{Duration, Instant};

    fn empty_thread_scheduler(thread_count: usize) -> Scheduler {
        Scheduler::new(SchedulerConfig {
            thread_count,
            empty_thread: true,
            ..Default::default()
        })
    }

    #[test]
    fn pre_start_submissions_buffer_until_start() {
        let scheduler = empty_thread_scheduler(2);
        scheduler.schedule_at(Task::new(|_| {}), 0);
        assert!(scheduler.local_queue(0).empty());
        scheduler.start();
        assert_eq!(scheduler.local_queue(0).size(), 1);
    }

    #[test]
    fn schedule_at_routes_by_task_flags() {
        let scheduler = empty_thread_scheduler(2);
        scheduler.start();
        scheduler.schedule_at(Task::new(|_| {}), 0);
        scheduler.schedule_at(Task::new_sticky(|_| {}), 0);
        scheduler.schedule_at(
            Task::new_delayed(Instant::now() + Duration::from_secs(10), |_| {}),
            0,
        );
        assert_eq!(scheduler.local_queue(0).size(), 1);
        assert_eq!(scheduler.sticky_queue(0).size(), 1);
        assert_eq!(scheduler.delayed_queue(0).size(), 1);
    }

    #[test]
    fn process_next_prefers_local_then_sticky() {
        let scheduler = empty_thread_scheduler(1);
        scheduler.start();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let o = Arc::clone(&order);
        scheduler.schedule_at(
            Task::new_sticky(move |_| {
                o.lock().push("sticky");
            }),
            0,
        );
        let o = Arc::clone(&order);
        scheduler.schedule_at(
            Task::new(move |_| {
                o.lock().push("local");
            }),
            0,
        );
        let mut ctx = scheduler.new_context(0);
        assert!(scheduler.process_next(&mut ctx));
        assert!(scheduler.process_next(&mut ctx));
        assert!(!scheduler.process_next(&mut ctx));
        assert_eq!(*order.lock(), vec!["local", "sticky"]);
    }

    #[test]
    fn stealing_updates_last_steal_from() {
        let scheduler = empty_thread_scheduler(3);
        scheduler.start();
        let counter = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&counter);
        scheduler.schedule_at(
            Task::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            2,
        );
        let mut ctx = scheduler.new_context(0);
        assert!(scheduler.process_next(&mut ctx));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.last_steal_from(), 2);
        assert_ne!(ctx.last_steal_from(), ctx.index());
        let stats = scheduler.worker_stats();
        assert_eq!(stats[0].executed, 1);
        assert_eq!(stats[0].stolen, 1);
    }

    #[test]
    fn sticky_queue_is_never_stolen() {
        let scheduler = empty_thread_scheduler(2);
        scheduler.start();
        scheduler.schedule_at(Task::new_sticky(|_| {}), 1);
        let mut ctx = scheduler.new_context(0);
        assert!(!scheduler.process_next(&mut ctx));
        assert_eq!(scheduler.sticky_queue(1).size(), 1);
    }

    #[test]
    fn ripe_delayed_task_drains_into_local_queue() {
        let scheduler = empty_thread_scheduler(1);
        scheduler.start();
        let counter = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&counter);
        scheduler.schedule_at(
            Task::new_delayed(Instant::now(), move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            0,
        );
        let mut ctx = scheduler.new_context(0);
        assert!(scheduler.process_next(&mut ctx));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn conditional_poll_runs_ripe_and_requeues_negatives() {
        let scheduler = empty_thread_scheduler(1);
        scheduler.start();
        let fired = Arc::new(AtomicU64::new(0));
        let f = Arc::clone(&fired);
        let mut polls = 0;
        scheduler.schedule_conditional(super::ConditionalTask::new(
            move || {
                polls += 1;
                polls >= 3
            },
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
        ));
        scheduler.poll_conditional_once();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        scheduler.poll_conditional_once();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        scheduler.poll_conditional_once();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(scheduler.conditional_queue().empty());
    }

    #[test]
    fn panicking_task_does_not_poison_the_worker() {
        let scheduler = empty_thread_scheduler(1);
        scheduler.start();
        scheduler.schedule_at(Task::new(|_| panic!("boom")), 0);
        let counter = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&counter);
        scheduler.schedule_at(
            Task::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            0,
        );
        let mut ctx = scheduler.new_context(0);
        assert!(scheduler.process_next(&mut ctx));
        assert!(scheduler.process_next(&mut ctx));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_drops_unexecuted_tasks() {
        let scheduler = empty_thread_scheduler(1);
        scheduler.start();
        scheduler.schedule_at(Task::new(|_| {}), 0);
        scheduler.stop();
        assert!(!scheduler.started());
        assert!(scheduler.local_queue(0).empty());
    }
}

use crate::scheduler::Context;
use std::fmt;
use std::time::Instant;

type TaskAction = Box<dyn FnOnce(&Context) + Send + 'static>;
type ConditionalCheck = Box<dyn FnMut() -> bool + Send + 'static>;
type ConditionalAction = Box<dyn FnOnce() + Send + 'static>;

/// Unit of work scheduled on the worker pool. Move-only: the action is
/// consumed on execution.
///
/// A plain task may be stolen by any worker; a sticky task runs only on the
/// worker it was scheduled at; a delayed task is a sticky task that becomes
/// runnable once its `not_before` instant has passed.
pub struct Task {
    action: TaskAction,
    sticky: bool,
    not_before: Option<Instant>,
}

impl Task {
    pub fn new(action: impl FnOnce(&Context) + Send + 'static) -> Self {
        Self {
            action: Box::new(action),
            sticky: false,
            not_before: None,
        }
    }

    pub fn new_sticky(action: impl FnOnce(&Context) + Send + 'static) -> Self {
        Self {
            action: Box::new(action),
            sticky: true,
            not_before: None,
        }
    }

    pub fn new_delayed(not_before: Instant, action: impl FnOnce(&Context) + Send + 'static) -> Self {
        Self {
            action: Box::new(action),
            sticky: true,
            not_before: Some(not_before),
        }
    }

    pub fn sticky(&self) -> bool {
        self.sticky
    }

    pub fn delayed(&self) -> bool {
        self.not_before.is_some()
    }

    pub fn not_before(&self) -> Option<Instant> {
        self.not_before
    }

    pub(crate) fn run(self, ctx: &Context) {
        (self.action)(ctx);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("sticky", &self.sticky)
            .field("not_before", &self.not_before)
            .finish_non_exhaustive()
    }
}

/// Task that becomes runnable only when its predicate holds. Evaluated by
/// the watcher thread, never by pool workers.
pub struct ConditionalTask {
    check: ConditionalCheck,
    action: ConditionalAction,
}

impl ConditionalTask {
    pub fn new(
        check: impl FnMut() -> bool + Send + 'static,
        action: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            check: Box::new(check),
            action: Box::new(action),
        }
    }

    pub(crate) fn check(&mut self) -> bool {
        (self.check)()
    }

    pub(crate) fn run(self) {
        (self.action)();
    }
}

impl fmt::Debug for ConditionalTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionalTask").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::{ConditionalTask, Task};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{Duration, Instant};

    #[test]
    fn task_flags_reflect_construction() {
        let plain = Task::new(|_| {});
        assert!(!plain.sticky());
        assert!(!plain.delayed());

        let sticky = Task::new_sticky(|_| {});
        assert!(sticky.sticky());
        assert!(!sticky.delayed());

        let at = Instant::now() + Duration::from_millis(5);
        let delayed = Task::new_delayed(at, |_| {});
        assert!(delayed.sticky());
        assert!(delayed.delayed());
        assert_eq!(delayed.not_before(), Some(at));
    }

    #[test]
    fn conditional_task_check_then_run() {
        let counter = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&counter);
        let mut calls = 0;
        let mut task = ConditionalTask::new(
            move || {
                calls += 1;
                calls >= 2
            },
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert!(!task.check());
        assert!(task.check());
        task.run();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}

use forecourt::scheduler::{ConditionalTask, Scheduler, SchedulerConfig, Task};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

fn wait_for(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

#[test]
fn smoke_ten_thousand_plain_tasks() {
    let scheduler = Scheduler::new(SchedulerConfig {
        thread_count: 4,
        ..Default::default()
    });
    scheduler.start();

    let counter = Arc::new(AtomicU64::new(0));
    for _ in 0..10_000 {
        let counter = Arc::clone(&counter);
        scheduler.schedule(Task::new(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));
    }
    assert!(
        wait_for(Duration::from_secs(10), || {
            counter.load(Ordering::Relaxed) == 10_000
        }),
        "only {} of 10000 tasks ran",
        counter.load(Ordering::Relaxed)
    );
    scheduler.stop();
    assert_eq!(counter.load(Ordering::Relaxed), 10_000);

    let executed: u64 = scheduler.worker_stats().iter().map(|s| s.executed).sum();
    assert_eq!(executed, 10_000);
}

#[test]
fn preferred_worker_submissions_are_stolen_by_the_idle_peer() {
    let scheduler = Scheduler::new(SchedulerConfig {
        thread_count: 2,
        use_preferred_worker_for_current_thread: true,
        ..Default::default()
    });
    scheduler.start();

    // all submissions from this thread land on one preferred slot; the
    // other worker has nothing but what it steals
    let preferred = scheduler.preferred_worker_for_current_thread();
    assert_eq!(preferred, scheduler.preferred_worker_for_current_thread());

    let counter = Arc::new(AtomicU64::new(0));
    for _ in 0..1_000 {
        let counter = Arc::clone(&counter);
        scheduler.schedule(Task::new(move |_| {
            // long enough that the backlog outlives the submission loop
            std::thread::sleep(Duration::from_micros(50));
            counter.fetch_add(1, Ordering::Relaxed);
        }));
    }
    assert!(wait_for(Duration::from_secs(20), || {
        counter.load(Ordering::Relaxed) == 1_000
    }));
    scheduler.stop();

    let stats = scheduler.worker_stats();
    assert!(stats[0].executed > 0, "worker 0 executed nothing");
    assert!(stats[1].executed > 0, "worker 1 executed nothing");
    let thief = 1 - preferred;
    assert!(
        stats[thief].stolen > 0,
        "worker {thief} never stole from the loaded slot"
    );
}

#[test]
fn sticky_tasks_execute_in_push_order() {
    let scheduler = Scheduler::new(SchedulerConfig {
        thread_count: 2,
        ..Default::default()
    });
    scheduler.start();

    let order = Arc::new(Mutex::new(Vec::new()));
    // background load on every slot
    for _ in 0..100 {
        scheduler.schedule(Task::new(|_| {
            std::thread::sleep(Duration::from_micros(10));
        }));
    }
    for id in 1..=3u32 {
        let order = Arc::clone(&order);
        scheduler.schedule_at(
            Task::new_sticky(move |_| {
                order.lock().push(id);
            }),
            0,
        );
    }
    assert!(wait_for(Duration::from_secs(5), || order.lock().len() == 3));
    scheduler.stop();
    assert_eq!(*order.lock(), vec![1, 2, 3]);
}

#[test]
fn delayed_task_waits_for_its_instant() {
    let scheduler = Scheduler::new(SchedulerConfig {
        thread_count: 1,
        ..Default::default()
    });
    scheduler.start();

    let fired_at = Arc::new(Mutex::new(None));
    let scheduled_at = Instant::now();
    let not_before = scheduled_at + Duration::from_millis(20);
    let slot = Arc::clone(&fired_at);
    scheduler.schedule_at(
        Task::new_delayed(not_before, move |_| {
            *slot.lock() = Some(Instant::now());
        }),
        0,
    );
    assert!(wait_for(Duration::from_secs(5), || fired_at.lock().is_some()));
    scheduler.stop();
    let fired = fired_at.lock().expect("task fired");
    assert!(fired >= not_before);
}

#[test]
fn conditional_task_fires_once_after_its_predicate_turns_true() {
    let scheduler = Scheduler::new(SchedulerConfig {
        thread_count: 1,
        watcher_interval: Duration::from_millis(1),
        ..Default::default()
    });
    scheduler.start();

    let fired = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&fired);
    let mut checks = 0u32;
    let scheduled_at = Instant::now();
    scheduler.schedule_conditional(ConditionalTask::new(
        move || {
            checks += 1;
            checks > 3
        },
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        },
    ));
    assert!(wait_for(Duration::from_secs(5), || {
        fired.load(Ordering::SeqCst) == 1
    }));
    let elapsed = scheduled_at.elapsed();
    // three failed checks each cost one watcher interval
    assert!(elapsed >= Duration::from_millis(3), "fired after {elapsed:?}");
    // give the watcher time to prove the action does not run again
    std::thread::sleep(Duration::from_millis(20));
    scheduler.stop();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn panicking_tasks_do_not_stop_the_pool() {
    let scheduler = Scheduler::new(SchedulerConfig {
        thread_count: 2,
        ..Default::default()
    });
    scheduler.start();

    let counter = Arc::new(AtomicU64::new(0));
    for i in 0..100 {
        let counter = Arc::clone(&counter);
        scheduler.schedule(Task::new(move |_| {
            if i % 10 == 0 {
                panic!("task {i} failing on purpose");
            }
            counter.fetch_add(1, Ordering::Relaxed);
        }));
    }
    assert!(wait_for(Duration::from_secs(10), || {
        counter.load(Ordering::Relaxed) == 90
    }));
    scheduler.stop();
    assert_eq!(counter.load(Ordering::Relaxed), 90);
}

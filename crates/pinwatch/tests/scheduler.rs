//! Scheduler behaviour under slow, failing and panicking tasks (paused clock).

use pinwatch::{FnTask, Scheduler, SchedulerError, SchedulerState, Task};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_test::{assert_err, assert_ok};

const PERIOD: Duration = Duration::from_millis(100);

#[derive(Default)]
struct TickCounters {
    started: AtomicU64,
    finished: AtomicU64,
    in_flight: AtomicU64,
    max_in_flight: AtomicU64,
}

/// Task that takes `work` to finish and records overlap.
fn slow_task(counters: Arc<TickCounters>, work: Duration) -> Arc<dyn Task> {
    Arc::new(FnTask(move || {
        let counters = Arc::clone(&counters);
        async move {
            counters.started.fetch_add(1, Ordering::SeqCst);
            let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            counters.max_in_flight.fetch_max(now, Ordering::SeqCst);
            sleep(work).await;
            counters.in_flight.fetch_sub(1, Ordering::SeqCst);
            counters.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }))
}

#[tokio::test(start_paused = true)]
async fn slow_tick_is_never_overlapped() {
    let counters = Arc::new(TickCounters::default());
    let s = Scheduler::new("slow");
    assert_ok!(
        s.start(slow_task(Arc::clone(&counters), Duration::from_millis(250)), PERIOD)
            .await
    );
    sleep(Duration::from_millis(1_000)).await;
    s.stop().await;

    let stats = s.stats();
    assert_eq!(counters.max_in_flight.load(Ordering::SeqCst), 1);
    assert!(stats.ticks_skipped() >= 2, "skipped {}", stats.ticks_skipped());
    assert_eq!(stats.ticks_started(), counters.started.load(Ordering::SeqCst));
    assert_eq!(stats.ticks_failed(), 0);
}

#[tokio::test(start_paused = true)]
async fn failing_ticks_do_not_stop_the_loop() {
    let calls = Arc::new(AtomicU64::new(0));
    let task = {
        let calls = Arc::clone(&calls);
        Arc::new(FnTask(move || {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n % 2 == 0 {
                    anyhow::bail!("node unreachable");
                }
                Ok(())
            }
        }))
    };
    let s = Scheduler::new("flaky");
    assert_ok!(s.start(task, PERIOD).await);
    sleep(Duration::from_millis(450)).await;
    s.stop().await;

    let stats = s.stats();
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(stats.ticks_failed(), 3);
    assert_eq!(stats.ticks_completed(), 2);
}

#[tokio::test(start_paused = true)]
async fn panicking_tick_counts_as_failure() {
    let calls = Arc::new(AtomicU64::new(0));
    let task = {
        let calls = Arc::clone(&calls);
        Arc::new(FnTask(move || {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("handler bug");
                }
                Ok(())
            }
        }))
    };
    let s = Scheduler::new("panicky");
    assert_ok!(s.start(task, PERIOD).await);
    sleep(Duration::from_millis(350)).await;
    s.stop().await;

    assert!(calls.load(Ordering::SeqCst) >= 3);
    assert_eq!(s.stats().ticks_failed(), 1);
    assert_eq!(s.state().await, SchedulerState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn stop_waits_for_in_flight_tick_then_goes_quiet() {
    let counters = Arc::new(TickCounters::default());
    let s = Scheduler::new("stopper");
    assert_ok!(
        s.start(slow_task(Arc::clone(&counters), Duration::from_millis(80)), PERIOD)
            .await
    );
    sleep(Duration::from_millis(130)).await;
    // Second tick (t=100) is mid-flight.
    assert_eq!(counters.in_flight.load(Ordering::SeqCst), 1);

    s.stop().await;
    assert_eq!(counters.in_flight.load(Ordering::SeqCst), 0);
    let started = counters.started.load(Ordering::SeqCst);
    let finished = counters.finished.load(Ordering::SeqCst);
    assert_eq!(started, finished);

    sleep(Duration::from_secs(5)).await;
    assert_eq!(counters.started.load(Ordering::SeqCst), started);
    assert_eq!(counters.finished.load(Ordering::SeqCst), finished);
}

#[tokio::test(start_paused = true)]
async fn stopped_scheduler_cannot_restart() {
    let counters = Arc::new(TickCounters::default());
    let task = slow_task(counters, Duration::from_millis(1));
    let s = Scheduler::new("once");
    assert_ok!(s.start(Arc::clone(&task), PERIOD).await);
    s.stop().await;
    let err = assert_err!(s.start(task, PERIOD).await);
    assert_eq!(err, SchedulerError::Stopped("once".into()));
}

#[tokio::test(start_paused = true)]
async fn dropping_a_running_scheduler_stops_ticking() {
    let counters = Arc::new(TickCounters::default());
    {
        let s = Scheduler::new("dropped");
        assert_ok!(
            s.start(slow_task(Arc::clone(&counters), Duration::from_millis(1)), PERIOD)
                .await
        );
        sleep(Duration::from_millis(150)).await;
    }
    sleep(Duration::from_millis(10)).await;
    let started = counters.started.load(Ordering::SeqCst);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(counters.started.load(Ordering::SeqCst), started);
}

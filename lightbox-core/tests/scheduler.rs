//! Scheduler behaviour: ordering, dedup/upgrade, inheritance,
//! cancellation, pruning, source jobs and shutdown.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use lightbox_core::Priority;
use lightbox_core::notifications::NotificationSender;
use lightbox_core::scheduler::{
    SourceJob, SubmitOutcome, TaskFn, TaskOutput, TaskScheduler, TaskSpec, task_fn,
};
use lightbox_protocol::{Notification, NotificationKind};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

fn new_scheduler(workers: usize) -> (Arc<TaskScheduler>, tokio::sync::mpsc::Receiver<Notification>) {
    let (notifications, rx) = NotificationSender::channel(256);
    (Arc::new(TaskScheduler::new(workers, notifications)), rx)
}

fn recording_task(log: &Arc<Mutex<Vec<String>>>, label: &str) -> TaskFn {
    let log = Arc::clone(log);
    let label = label.to_string();
    task_fn(move |_ctx| {
        let log = Arc::clone(&log);
        let label = label.clone();
        async move {
            log.lock().unwrap().push(label);
            Ok(TaskOutput::None)
        }
    })
}

fn noop_task() -> TaskFn {
    task_fn(|_ctx| async { Ok(TaskOutput::None) })
}

/// A task that parks its worker until a permit is released.
fn blocking_task(gate: &Arc<Semaphore>) -> TaskFn {
    let gate = Arc::clone(gate);
    task_fn(move |_ctx| {
        let gate = Arc::clone(&gate);
        async move {
            let permit = gate.acquire().await;
            drop(permit);
            Ok(TaskOutput::None)
        }
    })
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within 5s");
}

#[tokio::test]
async fn fifo_within_a_priority_level() {
    let (scheduler, _rx) = new_scheduler(1);
    let log = Arc::new(Mutex::new(Vec::new()));

    // Submit before starting so nothing is consumed mid-submission.
    for i in 0..5 {
        let label = format!("t{i}");
        scheduler.submit_task(TaskSpec::new(
            label.clone(),
            Priority::Normal,
            recording_task(&log, &label),
        ));
    }
    scheduler.start();
    wait_until(|| log.lock().unwrap().len() == 5).await;
    assert_eq!(
        *log.lock().unwrap(),
        vec!["t0", "t1", "t2", "t3", "t4"],
        "same-priority tasks must run in submission order"
    );
    scheduler.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn higher_priority_overtakes_earlier_submissions() {
    let (scheduler, _rx) = new_scheduler(1);
    let log = Arc::new(Mutex::new(Vec::new()));

    scheduler.submit_task(TaskSpec::new("low", Priority::Low, recording_task(&log, "low")));
    scheduler.submit_task(TaskSpec::new(
        "normal",
        Priority::Normal,
        recording_task(&log, "normal"),
    ));
    scheduler.submit_task(TaskSpec::new(
        "gui",
        Priority::GuiRequest,
        recording_task(&log, "gui"),
    ));
    scheduler.start();
    wait_until(|| log.lock().unwrap().len() == 3).await;
    assert_eq!(*log.lock().unwrap(), vec!["gui", "normal", "low"]);
    scheduler.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn dedup_and_upgrade_runs_once_at_the_higher_priority() {
    let (scheduler, _rx) = new_scheduler(1);
    let runs = Arc::new(AtomicUsize::new(0));
    let observed_priority = Arc::new(Mutex::new(None));
    let weak: Weak<TaskScheduler> = Arc::downgrade(&scheduler);

    let spec_at = |priority: Priority| {
        let runs = Arc::clone(&runs);
        let observed = Arc::clone(&observed_priority);
        let weak = weak.clone();
        TaskSpec::new(
            "T",
            priority,
            task_fn(move |ctx| {
                let runs = Arc::clone(&runs);
                let observed = Arc::clone(&observed);
                let weak = weak.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    if let Some(scheduler) = weak.upgrade() {
                        *observed.lock().unwrap() = scheduler.task_priority(&ctx.task_id);
                    }
                    Ok(TaskOutput::None)
                }
            }),
        )
    };

    assert_eq!(scheduler.submit_task(spec_at(Priority::Low)), SubmitOutcome::Submitted);
    assert_eq!(
        scheduler.submit_task(spec_at(Priority::High)),
        SubmitOutcome::Upgraded
    );
    assert_eq!(scheduler.task_priority("T"), Some(Priority::High));

    scheduler.start();
    wait_until(|| runs.load(Ordering::SeqCst) > 0).await;
    // Give the stale queue entry a chance to be (correctly) discarded.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1, "exactly one run despite two submissions");
    assert_eq!(*observed_priority.lock().unwrap(), Some(Priority::High));
    scheduler.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn equal_priority_resubmission_updates_the_payload() {
    let (scheduler, _rx) = new_scheduler(1);
    let log = Arc::new(Mutex::new(Vec::new()));

    scheduler.submit_task(TaskSpec::new("T", Priority::Normal, recording_task(&log, "v1")));
    let outcome =
        scheduler.submit_task(TaskSpec::new("T", Priority::Normal, recording_task(&log, "v2")));
    assert_eq!(outcome, SubmitOutcome::Updated);

    scheduler.start();
    wait_until(|| !log.lock().unwrap().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    // Last writer wins: only the refreshed payload runs.
    assert_eq!(*log.lock().unwrap(), vec!["v2"]);
    scheduler.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn dependency_chain_runs_in_order_and_prunes() {
    let (scheduler, _rx) = new_scheduler(2);
    let log = Arc::new(Mutex::new(Vec::new()));

    scheduler.submit_task(
        TaskSpec::new("B", Priority::Normal, recording_task(&log, "B"))
            .with_dependencies(["A"]),
    );
    scheduler.submit_task(TaskSpec::new("A", Priority::Normal, recording_task(&log, "A")));

    scheduler.start();
    wait_until(|| log.lock().unwrap().len() == 2).await;
    assert_eq!(*log.lock().unwrap(), vec!["A", "B"]);

    // Terminal pruning: both ids leave the graph once finished.
    wait_until(|| scheduler.graph_len() == 0).await;
    scheduler.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn priority_inheritance_raises_dependencies() {
    let (scheduler, _rx) = new_scheduler(1);
    let log = Arc::new(Mutex::new(Vec::new()));

    scheduler.submit_task(TaskSpec::new("other-low", Priority::Low, recording_task(&log, "other-low")));
    scheduler.submit_task(TaskSpec::new("A", Priority::Low, recording_task(&log, "A")));
    scheduler.submit_task(
        TaskSpec::new("B", Priority::High, recording_task(&log, "B")).with_dependencies(["A"]),
    );

    // The dependency was raised to the dependent's priority.
    assert_eq!(scheduler.task_priority("A"), Some(Priority::High));

    scheduler.start();
    wait_until(|| log.lock().unwrap().len() == 3).await;
    // A overtakes the other LOW task, and B follows A.
    assert_eq!(*log.lock().unwrap(), vec!["A", "B", "other-low"]);
    scheduler.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn cancelled_queued_task_is_discarded_without_running() {
    let (scheduler, _rx) = new_scheduler(1);
    let gate = Arc::new(Semaphore::new(0));
    let ran = Arc::new(AtomicBool::new(false));

    scheduler.submit_task(TaskSpec::new("blocker", Priority::High, blocking_task(&gate)));
    scheduler.start();
    wait_until(|| scheduler.running_task_count() == 1).await;

    let ran_clone = Arc::clone(&ran);
    scheduler.submit_task(TaskSpec::new(
        "T",
        Priority::Normal,
        task_fn(move |_ctx| {
            let ran = Arc::clone(&ran_clone);
            async move {
                ran.store(true, Ordering::SeqCst);
                Ok(TaskOutput::None)
            }
        }),
    ));
    assert!(scheduler.cancel_task("T"));
    gate.add_permits(1);

    wait_until(|| scheduler.running_task_count() == 0 && scheduler.queue_len() == 0).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!ran.load(Ordering::SeqCst), "cancelled task must not run");
    scheduler.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn running_task_observes_cooperative_cancellation() {
    let (scheduler, _rx) = new_scheduler(1);
    let expensive_step = Arc::new(AtomicBool::new(false));
    let started = Arc::new(tokio::sync::Notify::new());

    let expensive = Arc::clone(&expensive_step);
    let started_tx = Arc::clone(&started);
    scheduler.submit_task(TaskSpec::new(
        "T",
        Priority::Normal,
        task_fn(move |ctx| {
            let expensive = Arc::clone(&expensive);
            let started = Arc::clone(&started_tx);
            async move {
                started.notify_one();
                // Cooperative point before the expensive step.
                ctx.cancel.cancelled().await;
                if ctx.cancel.is_cancelled() {
                    return Ok(TaskOutput::None);
                }
                expensive.store(true, Ordering::SeqCst);
                Ok(TaskOutput::None)
            }
        }),
    ));
    scheduler.start();
    started.notified().await;
    assert!(scheduler.cancel_task("T"));

    wait_until(|| scheduler.running_task_count() == 0).await;
    assert!(
        !expensive_step.load(Ordering::SeqCst),
        "expensive step must be skipped after cancellation"
    );
    scheduler.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn upgrade_preserves_the_original_cancel_token() {
    let (scheduler, _rx) = new_scheduler(1);
    let gate = Arc::new(Semaphore::new(0));
    let ran = Arc::new(AtomicBool::new(false));
    let token = CancellationToken::new();

    scheduler.submit_task(TaskSpec::new("blocker", Priority::High, blocking_task(&gate)));
    scheduler.start();
    wait_until(|| scheduler.running_task_count() == 1).await;

    let ran_clone = Arc::clone(&ran);
    let run_flagger = move || {
        let ran = Arc::clone(&ran_clone);
        task_fn(move |_ctx| {
            let ran = Arc::clone(&ran);
            async move {
                ran.store(true, Ordering::SeqCst);
                Ok(TaskOutput::None)
            }
        })
    };

    scheduler.submit_task(
        TaskSpec::new("T", Priority::Low, run_flagger()).with_cancel(token.clone()),
    );
    // Upgrade with a *different* token: the original must survive.
    scheduler.submit_task(
        TaskSpec::new("T", Priority::GuiRequest, run_flagger())
            .with_cancel(CancellationToken::new()),
    );
    token.cancel();
    gate.add_permits(1);

    wait_until(|| scheduler.running_task_count() == 0 && scheduler.queue_len() == 0).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        !ran.load(Ordering::SeqCst),
        "cancel through the original token must stop the upgraded task"
    );
    scheduler.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn downgrade_lowers_pending_tasks_only() {
    let (scheduler, _rx) = new_scheduler(1);
    let log = Arc::new(Mutex::new(Vec::new()));

    scheduler.submit_task(TaskSpec::new("hot", Priority::GuiRequest, recording_task(&log, "hot")));
    scheduler.submit_task(TaskSpec::new(
        "steady",
        Priority::Normal,
        recording_task(&log, "steady"),
    ));
    scheduler.downgrade_task_priorities(["hot".to_string()], Priority::GuiRequestLow);
    assert_eq!(scheduler.task_priority("hot"), Some(Priority::GuiRequestLow));

    scheduler.start();
    wait_until(|| log.lock().unwrap().len() == 2).await;
    assert_eq!(*log.lock().unwrap(), vec!["steady", "hot"]);
    scheduler.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn callback_for_finished_task_fires_immediately() {
    let (scheduler, _rx) = new_scheduler(1);

    // Keep "T" in the graph after completion by giving it a dependent
    // that can never start (unknown second dependency).
    scheduler.submit_task(TaskSpec::new("T", Priority::Normal, noop_task()));
    scheduler.submit_task(
        TaskSpec::new("waiter", Priority::Normal, noop_task())
            .with_dependencies(["T", "never-submitted"]),
    );
    scheduler.start();
    wait_until(|| scheduler.task_state("T").is_some_and(|s| s.is_terminal())).await;

    let fired = Arc::new(AtomicBool::new(false));
    let fired_clone = Arc::clone(&fired);
    let outcome = scheduler.submit_with_callback(
        TaskSpec::new("T", Priority::Normal, noop_task()),
        Some(Box::new(move |task_id, result| {
            assert_eq!(task_id, "T");
            assert!(result.is_ok());
            fired_clone.store(true, Ordering::SeqCst);
        })),
    );
    assert_eq!(outcome, SubmitOutcome::AlreadyDone);
    assert!(fired.load(Ordering::SeqCst), "late callback fires immediately");
    scheduler.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn late_callback_replays_the_terminal_result() {
    let (scheduler, _rx) = new_scheduler(1);

    // Keep both tasks in the graph after finishing: the waiter holds them
    // as dependencies and can itself never start.
    scheduler.submit_task(TaskSpec::new(
        "made",
        Priority::Normal,
        task_fn(|_ctx| async {
            Ok(TaskOutput::CachePath(std::path::PathBuf::from(
                "/cache/thumbnails/ab.jpg",
            )))
        }),
    ));
    scheduler.submit_task(TaskSpec::new(
        "broken",
        Priority::Normal,
        task_fn(|_ctx| async {
            Err(lightbox_core::CoreError::Internal("kaput".into()))
        }),
    ));
    scheduler.submit_task(
        TaskSpec::new("waiter", Priority::Normal, noop_task())
            .with_dependencies(["made", "broken", "never-submitted"]),
    );
    scheduler.start();
    wait_until(|| {
        scheduler.task_state("made").is_some_and(|s| s.is_terminal())
            && scheduler.task_state("broken").is_some_and(|s| s.is_terminal())
    })
    .await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    for id in ["made", "broken"] {
        let seen = Arc::clone(&seen);
        let outcome = scheduler.submit_with_callback(
            TaskSpec::new(id, Priority::Normal, noop_task()),
            Some(Box::new(move |task_id, result| {
                let summary = match result {
                    Ok(TaskOutput::CachePath(path)) => {
                        format!("{task_id}: {}", path.display())
                    }
                    Ok(_) => format!("{task_id}: ok"),
                    Err(err) => format!("{task_id}: error: {err}"),
                };
                seen.lock().unwrap().push(summary);
            })),
        );
        assert_eq!(outcome, SubmitOutcome::AlreadyDone);
    }

    // The known results are replayed, not fabricated.
    let seen = seen.lock().unwrap();
    assert_eq!(seen[0], "made: /cache/thumbnails/ab.jpg");
    assert!(
        seen[1].starts_with("broken: error:"),
        "a failed task's late callback must observe the failure, got {:?}",
        seen[1]
    );
    drop(seen);
    scheduler.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn failed_task_reports_through_the_callback() {
    let (scheduler, _rx) = new_scheduler(1);
    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = Arc::new(Mutex::new(Some(tx)));

    let tx_clone = Arc::clone(&tx);
    scheduler.submit_with_callback(
        TaskSpec::new(
            "boom",
            Priority::Normal,
            task_fn(|_ctx| async {
                Err(lightbox_core::CoreError::Internal("kaput".into()))
            }),
        ),
        Some(Box::new(move |_task_id, result| {
            let failed = result.is_err();
            if let Some(tx) = tx_clone.lock().unwrap().take() {
                let _ = tx.send(failed);
            }
        })),
    );
    scheduler.start();
    assert!(rx.await.unwrap(), "callback must observe the failure");
    scheduler.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn shutdown_rejects_new_work_and_empties_the_graph() {
    let (scheduler, _rx) = new_scheduler(2);
    let gate = Arc::new(Semaphore::new(0));

    scheduler.submit_task(TaskSpec::new("running", Priority::High, blocking_task(&gate)));
    for i in 0..10 {
        scheduler.submit_task(TaskSpec::new(
            format!("queued-{i}"),
            Priority::Low,
            noop_task(),
        ));
    }
    scheduler.start();
    wait_until(|| scheduler.running_task_count() >= 1).await;

    scheduler.prepare_for_shutdown();
    assert_eq!(
        scheduler.submit_task(TaskSpec::new("late", Priority::High, noop_task())),
        SubmitOutcome::Rejected
    );

    gate.add_permits(1);
    scheduler.shutdown(Duration::from_secs(5)).await;
    assert_eq!(scheduler.graph_len(), 0, "graph must be empty after shutdown");
    assert_eq!(scheduler.running_task_count(), 0);
}

// ── Source jobs ─────────────────────────────────────────────────────────

fn batches_of(paths: Vec<Vec<&str>>) -> lightbox_core::scheduler::BatchStream {
    let owned: Vec<Vec<std::path::PathBuf>> = paths
        .into_iter()
        .map(|batch| batch.into_iter().map(std::path::PathBuf::from).collect())
        .collect();
    Box::pin(futures::stream::iter(owned))
}

#[tokio::test]
async fn source_job_streams_progress_and_completes() {
    let (scheduler, mut rx) = new_scheduler(2);
    scheduler.start();

    let job = SourceJob::new(
        "gui_scan_tasks::sess-1::/photos",
        Priority::GuiRequestLow,
        batches_of(vec![vec!["/photos/a.jpg", "/photos/b.jpg"], vec!["/photos/c.jpg"]]),
    )
    .notifications_only();
    scheduler.submit_source_job(job);

    let mut progress_batches = 0;
    let mut complete_seen = false;
    while let Ok(Some(notification)) =
        tokio::time::timeout(Duration::from_secs(5), rx.recv()).await
    {
        match notification.kind {
            NotificationKind::ScanProgress => {
                assert_eq!(notification.session_id.as_deref(), Some("sess-1"));
                progress_batches += 1;
            }
            NotificationKind::ScanComplete => {
                assert_eq!(notification.session_id.as_deref(), Some("sess-1"));
                complete_seen = true;
                break;
            }
            _ => {}
        }
    }
    assert_eq!(progress_batches, 2);
    assert!(complete_seen);
    wait_until(|| scheduler.active_job_ids().is_empty()).await;
    scheduler.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn daemon_index_jobs_are_silent_and_session_less() {
    let (scheduler, mut rx) = new_scheduler(2);
    scheduler.start();

    scheduler.submit_source_job(
        SourceJob::new(
            "daemon_idx::/library",
            Priority::BackgroundScan,
            batches_of(vec![vec!["/library/a.jpg"]]),
        )
        .notifications_only(),
    );
    wait_until(|| scheduler.active_job_ids().is_empty()).await;
    // Neither progress nor completion leaks to the GUI for daemon jobs.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
    scheduler.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn duplicate_job_submission_is_a_no_op() {
    let (scheduler, _rx) = new_scheduler(1);
    // Not started: the registry keeps the first job active.
    scheduler.submit_source_job(
        SourceJob::new(
            "daemon_idx::/x",
            Priority::BackgroundScan,
            batches_of(vec![vec!["/x/a.jpg"]]),
        )
        .notifications_only(),
    );
    scheduler.submit_source_job(
        SourceJob::new(
            "daemon_idx::/x",
            Priority::BackgroundScan,
            batches_of(vec![vec!["/x/b.jpg"]]),
        )
        .notifications_only(),
    );
    assert_eq!(scheduler.active_job_ids().len(), 1);
    scheduler.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn cancelled_job_stops_and_leaves_the_registry() {
    let (scheduler, _rx) = new_scheduler(1);
    scheduler.submit_source_job(
        SourceJob::new(
            "gui_scan_tasks::s::/big",
            Priority::GuiRequestLow,
            batches_of(vec![vec!["/big/a.jpg"], vec!["/big/b.jpg"]]),
        )
        .notifications_only(),
    );
    scheduler.cancel_job("gui_scan_tasks::s::/big");
    assert!(scheduler.active_job_ids().is_empty());
    scheduler.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn source_job_creates_tasks_via_its_factory() {
    let (scheduler, _rx) = new_scheduler(2);
    scheduler.start();
    let created = Arc::new(Mutex::new(Vec::new()));

    let factory_log = Arc::clone(&created);
    let run_log = Arc::new(Mutex::new(Vec::new()));
    let run_log_clone = Arc::clone(&run_log);
    let factory: lightbox_core::scheduler::TaskFactory =
        Arc::new(move |path: std::path::PathBuf, priority: Priority| {
            let factory_log = Arc::clone(&factory_log);
            let run_log = Arc::clone(&run_log_clone);
            Box::pin(async move {
                factory_log
                    .lock()
                    .unwrap()
                    .push((path.clone(), priority));
                let label = path.display().to_string();
                vec![TaskSpec::new(
                    label.clone(),
                    priority,
                    recording_task(&run_log, &label),
                )]
            })
        });

    scheduler.submit_source_job(
        SourceJob::new(
            "post_scan::sess::/p",
            Priority::GuiRequestLow,
            batches_of(vec![vec!["/p/a.jpg", "/p/b.jpg"]]),
        )
        .with_task_factory(factory)
        .with_task_priority(Priority::Normal),
    );

    wait_until(|| run_log.lock().unwrap().len() == 2).await;
    let created = created.lock().unwrap();
    assert!(created.iter().all(|(_, priority)| *priority == Priority::Normal));
    scheduler.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn background_job_parks_on_full_cache_and_resumes() {
    let (scheduler, mut rx) = new_scheduler(2);
    let cache_full = Arc::new(AtomicBool::new(true));
    {
        let cache_full = Arc::clone(&cache_full);
        scheduler.set_cache_gate(Arc::new(move || cache_full.load(Ordering::SeqCst)));
    }
    scheduler.start();

    scheduler.submit_source_job(
        SourceJob::new(
            "gui_scan_tasks::s::/lib",
            Priority::BackgroundScan,
            batches_of(vec![vec!["/lib/a.jpg"]]),
        )
        .notifications_only(),
    );

    // Parked: the job stays registered and produces nothing.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(scheduler.active_job_ids().len(), 1);
    assert!(rx.try_recv().is_err());

    // Eviction freed space: the chain resumes and finishes.
    cache_full.store(false, Ordering::SeqCst);
    scheduler.resume_deferred_jobs();
    wait_until(|| scheduler.active_job_ids().is_empty()).await;
    scheduler.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn demoted_job_keeps_running_at_the_lower_priority() {
    let (scheduler, _rx) = new_scheduler(1);
    scheduler.submit_source_job(
        SourceJob::new(
            "gui_scan_tasks::sess-2::/dir",
            Priority::GuiRequestLow,
            batches_of(vec![vec!["/dir/a.jpg"], vec!["/dir/b.jpg"]]),
        )
        .notifications_only(),
    );
    scheduler.demote_job("gui_scan_tasks::sess-2::/dir", Priority::OrphanScan);
    assert_eq!(
        scheduler.job_priority("gui_scan_tasks::sess-2::/dir"),
        Some(Priority::OrphanScan)
    );

    scheduler.start();
    // Not cancelled: the job drains to completion.
    wait_until(|| scheduler.active_job_ids().is_empty()).await;
    scheduler.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn demotion_never_raises_a_background_job() {
    let (scheduler, _rx) = new_scheduler(1);
    // Stage-C view-image jobs already run at the floor; disconnect
    // handling must not bump them up to ORPHAN_SCAN.
    scheduler.submit_source_job(
        SourceJob::new(
            "gui_view_images::sess-3::/dir",
            Priority::BackgroundScan,
            batches_of(vec![vec!["/dir/a.jpg"]]),
        )
        .notifications_only(),
    );
    scheduler.demote_job("gui_view_images::sess-3::/dir", Priority::OrphanScan);
    assert_eq!(
        scheduler.job_priority("gui_view_images::sess-3::/dir"),
        Some(Priority::BackgroundScan)
    );

    scheduler.start();
    wait_until(|| scheduler.active_job_ids().is_empty()).await;
    scheduler.shutdown(Duration::from_secs(5)).await;
}

//! End-to-end tests for workflow creation and execution.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{attempts, registry, test_manager, Recorder};
use tokio::sync::Notify;
use weave_agent::{Executor, FnExecutor, ManagerError, SchedulerConfig};
use weave_core::error::ValidationError;
use weave_core::storage::WorkflowStore;
use weave_core::types::{
    TaskId, TaskSpec, TaskStatus, WorkflowStatus, META_MAX_RETRIES, META_TIMEOUT_SECONDS,
};

fn task(id: &str) -> TaskSpec {
    TaskSpec::new(id, id)
}

#[tokio::test]
async fn test_two_step_workflow_completes() {
    let recorder = Recorder::new();
    let reg = registry(vec![("general", recorder.executor("general", Duration::ZERO, &[]))]);
    let (_temp, manager, _store) = test_manager(reg, SchedulerConfig::default()).await;

    manager
        .create("wf1", vec![task("a"), task("b").depends_on("a")])
        .await
        .unwrap();
    let report = manager.start("wf1").await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);

    let wf = manager.status("wf1").await.unwrap();
    assert_eq!(wf.status, WorkflowStatus::Completed);
    for id in ["a", "b"] {
        assert_eq!(wf.task(&TaskId::new(id)).unwrap().status, TaskStatus::Completed);
    }

    // b saw a's result
    let b_calls = recorder.calls_for("b");
    assert_eq!(b_calls.len(), 1);
    assert_eq!(b_calls[0].instruction, "Results from a:\noutput of a\n\nTask:\nb");
}

#[tokio::test]
async fn test_failed_dependency_blocks_dependent() {
    let recorder = Recorder::new();
    let reg = registry(vec![("general", recorder.executor("general", Duration::ZERO, &["a"]))]);
    let (_temp, manager, _store) = test_manager(reg, SchedulerConfig::default()).await;

    manager
        .create("wf1", vec![task("a"), task("b").depends_on("a")])
        .await
        .unwrap();
    let report = manager.start("wf1").await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Failed);

    let wf = manager.status("wf1").await.unwrap();
    let a = wf.task(&TaskId::new("a")).unwrap();
    assert_eq!(a.status, TaskStatus::Failed);
    assert_eq!(a.retry_count, 3);
    assert!(a.error.as_deref().unwrap().contains("a always fails"));

    let b = wf.task(&TaskId::new("b")).unwrap();
    assert_eq!(b.status, TaskStatus::Failed);
    assert_eq!(b.error.as_deref(), Some("blocked by dependency 'a'"));
    assert_eq!(b.retry_count, 0);
    assert!(recorder.calls_for("b").is_empty());
}

#[tokio::test]
async fn test_fan_in_runs_level_concurrently() {
    let recorder = Recorder::new();
    let reg = registry(vec![(
        "general",
        recorder.executor("general", Duration::from_millis(50), &[]),
    )]);
    let (_temp, manager, _store) = test_manager(reg, SchedulerConfig::default()).await;

    manager
        .create(
            "fan",
            vec![
                task("x"),
                task("y"),
                task("z"),
                task("join").depends_on("x").depends_on("y").depends_on("z"),
            ],
        )
        .await
        .unwrap();
    let report = manager.start("fan").await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);

    let calls = recorder.calls();
    let join = recorder.calls_for("join").remove(0);
    for id in ["x", "y", "z"] {
        let dep = calls.iter().find(|c| c.task == id).unwrap();
        assert!(dep.finished <= join.started, "{id} must finish before join starts");
        assert!(join.instruction.contains(&format!("Results from {id}:\noutput of {id}")));
    }
    assert_eq!(recorder.peak_concurrency(), 3);
}

#[tokio::test]
async fn test_priority_one_attempt_budget() {
    let recorder = Recorder::new();
    let reg = registry(vec![
        ("browser", recorder.executor("browser", Duration::ZERO, &["flaky"])),
        ("general", recorder.executor("general", Duration::ZERO, &["flaky"])),
    ]);
    let (_temp, manager, _store) = test_manager(reg, SchedulerConfig::default()).await;

    manager
        .create("wf", vec![task("flaky").capability("browser").priority(1)])
        .await
        .unwrap();
    let report = manager.start("wf").await.unwrap();

    // initial + 3 retries + 1 fallback
    assert_eq!(recorder.calls_for("flaky").len(), 5);
    assert_eq!(attempts(&report)["flaky"], 5);
    let wf = manager.status("wf").await.unwrap();
    let flaky = wf.task(&TaskId::new("flaky")).unwrap();
    assert_eq!(flaky.status, TaskStatus::Failed);
    assert!(flaky.error.as_deref().unwrap().contains("fallback 'general' failed"));
}

#[tokio::test]
async fn test_budget_by_priority_without_fallback() {
    let recorder = Recorder::new();
    let reg = registry(vec![("general", recorder.executor("general", Duration::ZERO, &["p2", "p5", "none"]))]);
    let (_temp, manager, _store) = test_manager(reg, SchedulerConfig::default()).await;

    manager
        .create(
            "wf",
            vec![
                task("p2").priority(2),
                task("p5").priority(5),
                task("none").meta(META_MAX_RETRIES, 0),
            ],
        )
        .await
        .unwrap();
    manager.start("wf").await.unwrap();

    assert_eq!(recorder.calls_for("p2").len(), 3);
    assert_eq!(recorder.calls_for("p5").len(), 2);
    assert_eq!(recorder.calls_for("none").len(), 1);
}

#[tokio::test]
async fn test_blocked_propagation_is_transitive() {
    let recorder = Recorder::new();
    let reg = registry(vec![("general", recorder.executor("general", Duration::ZERO, &["root"]))]);
    let (_temp, manager, _store) = test_manager(reg, SchedulerConfig::default()).await;

    manager
        .create(
            "wf",
            vec![
                task("root").priority(5),
                task("mid").depends_on("root"),
                task("leaf").depends_on("mid"),
                task("side"),
            ],
        )
        .await
        .unwrap();
    let report = manager.start("wf").await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Failed);
    assert_eq!(report.completed, 1);
    assert_eq!(report.failed, 3);

    let wf = manager.status("wf").await.unwrap();
    assert_eq!(
        wf.task(&TaskId::new("leaf")).unwrap().error.as_deref(),
        Some("blocked by dependency 'mid'")
    );
    assert_eq!(wf.task(&TaskId::new("side")).unwrap().status, TaskStatus::Completed);
    assert!(recorder.calls_for("mid").is_empty());
    assert!(recorder.calls_for("leaf").is_empty());
}

#[tokio::test]
async fn test_cycle_rejected_and_not_persisted() {
    let reg = registry(vec![]);
    let (_temp, manager, store) = test_manager(reg, SchedulerConfig::default()).await;

    let err = manager
        .create("loop", vec![task("a").depends_on("b"), task("b").depends_on("a")])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ManagerError::Validation(ValidationError::CycleDetected(_))
    ));
    assert!(err.to_string().contains("a -> b -> a"));
    assert!(!store.exists("loop").await.unwrap());
    assert!(manager.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_status_is_idempotent() {
    let recorder = Recorder::new();
    let reg = registry(vec![("general", recorder.executor("general", Duration::ZERO, &[]))]);
    let (_temp, manager, _store) = test_manager(reg, SchedulerConfig::default()).await;

    manager.create("wf", vec![task("a")]).await.unwrap();
    assert_eq!(manager.status("wf").await.unwrap(), manager.status("wf").await.unwrap());

    manager.start("wf").await.unwrap();
    assert_eq!(manager.status("wf").await.unwrap(), manager.status("wf").await.unwrap());
}

#[tokio::test]
async fn test_start_twice_rejected() {
    let recorder = Recorder::new();
    let reg = registry(vec![(
        "general",
        recorder.executor("general", Duration::from_millis(100), &[]),
    )]);
    let (_temp, manager, _store) = test_manager(reg, SchedulerConfig::default()).await;

    manager.create("wf", vec![task("a")]).await.unwrap();
    let running = manager.spawn("wf").await.unwrap();
    assert!(matches!(
        manager.start("wf").await,
        Err(ManagerError::AlreadyStarted(_))
    ));

    let report = running.await.unwrap().unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);
    assert!(matches!(
        manager.start("wf").await,
        Err(ManagerError::AlreadyStarted(_))
    ));
    assert_eq!(recorder.calls_for("a").len(), 1);
}

#[tokio::test]
async fn test_delete_and_not_found() {
    let reg = registry(vec![]);
    let (_temp, manager, _store) = test_manager(reg, SchedulerConfig::default()).await;

    manager.create("wf", vec![task("a")]).await.unwrap();
    manager.delete("wf").await.unwrap();
    assert!(matches!(manager.status("wf").await, Err(ManagerError::NotFound(_))));
    assert!(matches!(manager.delete("wf").await, Err(ManagerError::NotFound(_))));
    assert!(matches!(manager.start("wf").await, Err(ManagerError::NotFound(_))));
}

#[tokio::test]
async fn test_delete_running_workflow_discards_run() {
    let recorder = Recorder::new();
    let reg = registry(vec![(
        "general",
        recorder.executor("general", Duration::from_millis(200), &[]),
    )]);
    let (_temp, manager, store) = test_manager(reg, SchedulerConfig::default()).await;

    manager.create("wf", vec![task("a"), task("b").depends_on("a")]).await.unwrap();
    let running = manager.spawn("wf").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    manager.delete("wf").await.unwrap();
    running.await.unwrap().unwrap();

    assert!(!store.exists("wf").await.unwrap());
    assert!(!manager.is_active("wf"));
}

#[tokio::test]
async fn test_timeout_counts_as_failure() {
    let recorder = Recorder::new();
    let reg = registry(vec![(
        "general",
        recorder.executor("general", Duration::from_millis(500), &[]),
    )]);
    let (_temp, manager, _store) = test_manager(reg, SchedulerConfig::default()).await;

    manager
        .create("wf", vec![task("slow").priority(3).meta(META_TIMEOUT_SECONDS, 0.05)])
        .await
        .unwrap();
    let report = manager.start("wf").await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Failed);
    assert_eq!(attempts(&report)["slow"], 2);

    let wf = manager.status("wf").await.unwrap();
    let slow = wf.task(&TaskId::new("slow")).unwrap();
    assert!(slow.error.as_deref().unwrap().starts_with("timeout:"));
    assert_eq!(slow.retry_count, 1);
}

#[tokio::test]
async fn test_resume_interrupted_workflow() {
    let recorder = Recorder::new();
    let reg = registry(vec![("general", recorder.executor("general", Duration::ZERO, &[]))]);
    let (_temp, manager, store) = test_manager(reg, SchedulerConfig::default()).await;

    manager
        .create("wf", vec![task("a"), task("b").depends_on("a"), task("c").depends_on("b")])
        .await
        .unwrap();

    // Simulate a process that died while b was in flight
    let mut wf = store.load("wf").await.unwrap();
    wf.mark_running();
    wf.task_mut(&TaskId::new("a")).unwrap().complete("saved a".into());
    wf.task_mut(&TaskId::new("b")).unwrap().start();
    store.save(&wf).await.unwrap();

    let report = manager.resume("wf").await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);
    assert!(recorder.calls_for("a").is_empty());
    assert_eq!(
        recorder.calls_for("b")[0].instruction,
        "Results from a:\nsaved a\n\nTask:\nb"
    );
    assert!(matches!(
        manager.resume("wf").await,
        Err(ManagerError::NotResumable(_, WorkflowStatus::Completed))
    ));
}

#[tokio::test]
async fn test_adaptive_mode_completes_workflow() {
    let recorder = Recorder::new();
    let failing = ["f1", "f2", "f3"];
    let reg = registry(vec![(
        "general",
        recorder.executor("general", Duration::from_millis(10), &failing),
    )]);
    let config = SchedulerConfig {
        adaptive: true,
        window: 4,
        ..Default::default()
    };
    let (_temp, manager, _store) = test_manager(reg, config).await;

    let mut tasks: Vec<TaskSpec> = failing
        .iter()
        .map(|id| task(id).meta(META_MAX_RETRIES, 0))
        .collect();
    tasks.push(task("gate"));
    tasks.extend((0..4).map(|i| task(&format!("ok{i}")).depends_on("gate")));

    manager.create("wf", tasks).await.unwrap();
    let report = manager.start("wf").await.unwrap();
    assert_eq!(report.completed, 5);
    assert_eq!(report.failed, 3);

    // After three failures in a window of four, the ok tasks ran one at a time
    let oks: Vec<_> = recorder
        .calls()
        .into_iter()
        .filter(|c| c.task.starts_with("ok"))
        .collect();
    assert_eq!(oks.len(), 4);
    for (i, a) in oks.iter().enumerate() {
        for b in &oks[i + 1..] {
            assert!(a.finished <= b.started || b.finished <= a.started);
        }
    }
}

#[tokio::test]
async fn test_create_from_definition_file() {
    let recorder = Recorder::new();
    let reg = registry(vec![("general", recorder.executor("general", Duration::ZERO, &[]))]);
    let (temp, manager, _store) = test_manager(reg, SchedulerConfig::default()).await;
    let path = temp.path().join("plan.yaml");
    tokio::fs::write(
        &path,
        "workflow_id: from_file\ntasks:\n  - task_id: a\n    description: hi\n  - task_id: b\n    description: there\n    dependencies: [a]\n",
    )
    .await
    .unwrap();

    let wf = manager.create_from_file(&path, None).await.unwrap();
    assert_eq!(wf.workflow_id, "from_file");
    let report = manager.start("from_file").await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);

    let other = manager.create_from_file(&path, Some("copy")).await.unwrap();
    assert_eq!(other.workflow_id, "copy");
    assert_eq!(manager.list().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_recreate_after_delete_during_run() {
    let recorder = Recorder::new();
    let reg = registry(vec![(
        "general",
        recorder.executor("general", Duration::from_millis(300), &[]),
    )]);
    let (_temp, manager, store) = test_manager(reg, SchedulerConfig::default()).await;

    manager.create("wf", vec![task("a")]).await.unwrap();
    let old_run = manager.spawn("wf").await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    manager.delete("wf").await.unwrap();

    manager.create("wf", vec![task("b")]).await.unwrap();
    let new_run = manager.spawn("wf").await.unwrap();

    // The discarded run finishing must not release the new run's claim
    old_run.await.unwrap().unwrap();
    assert!(manager.is_active("wf"));

    let report = new_run.await.unwrap().unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);
    assert!(!manager.is_active("wf"));

    let wf = store.load("wf").await.unwrap();
    assert_eq!(wf.status, WorkflowStatus::Completed);
    assert!(wf.task(&TaskId::new("a")).is_none());
    assert_eq!(wf.task(&TaskId::new("b")).unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_dropped_start_can_be_resumed() {
    let recorder = Recorder::new();
    let reg = registry(vec![(
        "general",
        recorder.executor("general", Duration::from_millis(500), &[]),
    )]);
    let (_temp, manager, _store) = test_manager(reg, SchedulerConfig::default()).await;

    manager
        .create("wf", vec![task("a"), task("b").depends_on("a")])
        .await
        .unwrap();
    let cut_short = tokio::time::timeout(Duration::from_millis(100), manager.start("wf")).await;
    assert!(cut_short.is_err());
    assert!(!manager.is_active("wf"));
    assert_eq!(
        manager.status("wf").await.unwrap().status,
        WorkflowStatus::Running
    );

    let report = manager.resume("wf").await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);
    assert_eq!(recorder.calls_for("a").len(), 1);
    assert_eq!(recorder.calls_for("b").len(), 1);
}

#[tokio::test]
async fn test_serial_mode_keeps_level_order() {
    let recorder = Recorder::new();
    let failing = ["f1", "f2", "f3"];
    let reg = registry(vec![(
        "general",
        recorder.executor("general", Duration::from_millis(5), &failing),
    )]);
    let config = SchedulerConfig {
        adaptive: true,
        window: 4,
        ..Default::default()
    };
    let (_temp, manager, _store) = test_manager(reg, config).await;

    let mut tasks = vec![task("gate")];
    tasks.extend(failing.iter().map(|id| task(id).meta(META_MAX_RETRIES, 0)));
    tasks.push(task("p").depends_on("gate"));
    tasks.push(task("q").depends_on("gate").priority(9));
    tasks.push(task("r").depends_on("p"));

    manager.create("wf", tasks).await.unwrap();
    let report = manager.start("wf").await.unwrap();
    assert_eq!(report.completed, 4);
    assert_eq!(report.failed, 3);

    // r outranks q on priority but sits one level higher
    let order: Vec<String> = recorder
        .calls()
        .into_iter()
        .map(|c| c.task)
        .filter(|t| ["p", "q", "r"].contains(&t.as_str()))
        .collect();
    assert_eq!(order, vec!["p", "q", "r"]);
}

#[tokio::test]
async fn test_checkpoints_show_progress_mid_run() {
    let release = Arc::new(Notify::new());
    let gate = Arc::clone(&release);
    let held: Arc<dyn Executor> = Arc::new(FnExecutor::new("held", move |s: String| {
        let gate = Arc::clone(&gate);
        async move {
            gate.notified().await;
            Ok(s)
        }
    }));
    let recorder = Recorder::new();
    let reg = registry(vec![
        ("general", recorder.executor("general", Duration::ZERO, &[])),
        ("held", held),
    ]);
    let (_temp, manager, _store) = test_manager(reg, SchedulerConfig::default()).await;

    manager
        .create("wf", vec![task("fast"), task("slow").capability("held")])
        .await
        .unwrap();
    let running = manager.spawn("wf").await.unwrap();

    let mut snapshot = manager.status("wf").await.unwrap();
    for _ in 0..200 {
        if snapshot.task(&TaskId::new("fast")).unwrap().status == TaskStatus::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        snapshot = manager.status("wf").await.unwrap();
    }
    assert_eq!(snapshot.status, WorkflowStatus::Running);
    assert_eq!(
        snapshot.task(&TaskId::new("fast")).unwrap().status,
        TaskStatus::Completed
    );
    assert_eq!(
        snapshot.task(&TaskId::new("slow")).unwrap().status,
        TaskStatus::Running
    );

    release.notify_one();
    let report = running.await.unwrap().unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);
}

mod support;

use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use common::{FailureKind, JobStatus, OrchestratorError, PublicState};
use master::CancelOutcome;
use support::{wait_active, wait_terminal, TestEnv, DEFAULT_PARAMS};

const BLOCKING: &str = "echo started\nwhile true; do sleep 1; done";
const IGNORES_TERM: &str = "trap '' TERM\necho started\nwhile true; do sleep 1; done";

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelling_a_queued_job_removes_every_trace() {
    let env = TestEnv::new(BLOCKING, 1);
    let orch = env.open();
    let pool = orch.start_workers();

    let running = orch.submit(DEFAULT_PARAMS, &env.upload("first.el")).unwrap().id;
    let waiting = orch.submit(DEFAULT_PARAMS, &env.upload("second.el")).unwrap().id;
    wait_active(&orch, &running).await;
    assert_eq!(orch.get_status(&waiting).unwrap().state, PublicState::Queued);

    let outcome = orch.cancel(&waiting).await.unwrap();
    assert_eq!(outcome, CancelOutcome::Removed);
    assert_matches!(orch.get_status(&waiting), Err(OrchestratorError::NotFound(_)));
    assert!(!orch.store().job_dir(&waiting).exists());
    assert_eq!(orch.queue().pending_len(), 0);

    // el que corre no se entera
    assert_eq!(orch.get_status(&running).unwrap().state, PublicState::Active);
    orch.cancel(&running).await.unwrap();
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelling_an_active_job_fails_it() {
    let env = TestEnv::new(BLOCKING, 1);
    let orch = env.open();
    let pool = orch.start_workers();

    let id = orch.submit(DEFAULT_PARAMS, &env.upload("yeast.el")).unwrap().id;
    wait_active(&orch, &id).await;

    let outcome = orch.cancel(&id).await.unwrap();
    assert_eq!(outcome, CancelOutcome::Terminated(JobStatus::Failed));

    let view = orch.get_status(&id).unwrap();
    assert_eq!(view.state, PublicState::Failed);
    assert_eq!(view.failure, Some(FailureKind::Cancelled));
    assert!(view.log.contains("[Cancelled]"));
    assert_eq!(orch.queue().leased_len(), 0);

    pool.shutdown().await;
}

#[tokio::test]
async fn concurrent_cancels_of_an_active_job_agree() {
    let env = TestEnv::new(BLOCKING, 1);
    let orch = env.open();
    let pool = orch.start_workers();

    let id = orch.submit(DEFAULT_PARAMS, &env.upload("yeast.el")).unwrap().id;
    wait_active(&orch, &id).await;

    // en un runtime de un solo hilo: el disco no bloquea al worker
    let (first, second) = tokio::join!(orch.cancel(&id), orch.cancel(&id));
    assert_eq!(first.unwrap(), CancelOutcome::Terminated(JobStatus::Failed));
    assert_eq!(second.unwrap().final_status(), Some(JobStatus::Failed));

    let view = orch.get_status(&id).unwrap();
    assert_eq!(view.failure, Some(FailureKind::Cancelled));
    assert_eq!(view.log.matches("[Cancelled]").count(), 1);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_escalates_when_the_binary_ignores_sigterm() {
    let env = TestEnv::new(IGNORES_TERM, 1);
    let orch = env.open();
    let pool = orch.start_workers();

    let id = orch.submit(DEFAULT_PARAMS, &env.upload("yeast.el")).unwrap().id;
    support::wait_for(&orch, &id, |v| v.log.contains("started")).await;

    let started = Instant::now();
    let outcome = orch.cancel(&id).await.unwrap();
    // grace de 300 ms + margen; nunca el cancel_wait completo
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(outcome, CancelOutcome::Terminated(JobStatus::Failed));
    assert_eq!(
        orch.get_status(&id).unwrap().failure,
        Some(FailureKind::Cancelled)
    );

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelling_a_finished_job_is_a_no_op() {
    let env = TestEnv::new("echo done\nexit 0", 1);
    let orch = env.open();
    let pool = orch.start_workers();

    let id = orch.submit(DEFAULT_PARAMS, &env.upload("yeast.el")).unwrap().id;
    assert_eq!(wait_terminal(&orch, &id).await.state, PublicState::Completed);

    let outcome = orch.cancel(&id).await.unwrap();
    assert_eq!(outcome, CancelOutcome::AlreadyTerminal(JobStatus::Completed));
    assert_eq!(orch.get_status(&id).unwrap().state, PublicState::Completed);

    pool.shutdown().await;
}

#[tokio::test]
async fn cancelling_an_unknown_job_is_not_found() {
    let env = TestEnv::new("exit 0", 1);
    let orch = env.open();
    assert_matches!(
        orch.cancel("0123456789abcdef").await,
        Err(OrchestratorError::NotFound(_))
    );
    assert_matches!(
        orch.cancel("../etc").await,
        Err(OrchestratorError::NotFound(_))
    );
}

#[tokio::test]
async fn cancelling_a_job_without_queue_entry_marks_it_cancelled() {
    let env = TestEnv::new("exit 0", 1);
    let orch = env.open();

    // a mitad del submit: existe en el store pero todavía no en la cola
    orch.store()
        .create("midsubmit", DEFAULT_PARAMS, "yeast.el")
        .unwrap();

    let outcome = orch.cancel("midsubmit").await.unwrap();
    assert_eq!(outcome, CancelOutcome::Terminated(JobStatus::Failed));
    let manifest = orch.store().read("midsubmit").unwrap();
    assert_eq!(manifest.failure, Some(FailureKind::Cancelled));

    // un enqueue tardío no revive el job
    orch.queue()
        .enqueue("midsubmit", serde_json::json!({}))
        .unwrap();
    let pool = orch.start_workers();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(orch.store().read("midsubmit").unwrap().status, JobStatus::Failed);
    assert_eq!(orch.store().read("midsubmit").unwrap().attempts, 0);
    pool.shutdown().await;
}

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use datamover_copy::{AsyncCopyController, AsyncCopyState};
use datamover_location::memory::{MemoryStore, Operation};
use datamover_location::{
    AccessCondition, BlobKind, ContentProperties, CopyState, Location, Metadata,
    ObjectDestination, ObjectSource, ProviderError,
};
use datamover_transfer::{
    ControllerBase, CopyPollOptions, JobStatus, ProgressEvent, TransferController, TransferError,
    TransferJob, TransferOptions, drive,
};
use tokio_util::sync::CancellationToken;

fn blob(name: &str) -> Location {
    Location::blob("https://acct.test", "data", name, BlobKind::Block)
}

fn base(job: TransferJob) -> ControllerBase {
    ControllerBase::new(Arc::new(job), Arc::new(TransferOptions::default()))
}

fn seeded(store: &MemoryStore, src: &Location, len: usize) -> Vec<u8> {
    let data: Vec<u8> = (0..len).map(|i| (i % 241) as u8).collect();
    let properties = ContentProperties {
        content_type: Some("video/mp4".into()),
        ..ContentProperties::default()
    };
    let metadata = Metadata::from([("origin".to_string(), "camera".to_string())]);
    store.put(src, data.clone(), properties, metadata);
    data
}

fn object_copy(store: &MemoryStore, base: ControllerBase, src: &Location, dst: &Location) -> AsyncCopyController {
    let source: Arc<dyn ObjectSource> = store.object(src.clone());
    AsyncCopyController::builder(base, store.object(dst.clone()))
        .source(source)
        .build()
        .unwrap()
}

async fn wait_for_start(store: &MemoryStore, dst: &Location) {
    while store.count(Operation::StartCopy, dst) == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn object_copy_polls_until_done_and_applies_attributes() {
    let store = MemoryStore::new();
    let (src, dst) = (blob("clip.mp4"), blob("clip-copy.mp4"));
    let data = seeded(&store, &src, 10 * 1024);
    store.set_copy_step(1024);

    let job = TransferJob::new(src.clone(), dst.clone());
    let reported = Arc::new(AtomicU64::new(0));
    let sink = Arc::clone(&reported);
    let base = base(job).with_progress(Arc::new(move |e: ProgressEvent| {
        sink.fetch_add(e.bytes_transferred_delta, Ordering::Relaxed);
    }));
    let c = Arc::new(object_copy(&store, base, &src, &dst));

    drive(Arc::clone(&c) as Arc<dyn TransferController>, 1).await.unwrap();

    assert_eq!(c.state(), AsyncCopyState::Finished);
    assert_eq!(store.data(&dst).unwrap(), data);
    assert_eq!(store.count(Operation::StartCopy, &dst), 1);
    assert_eq!(store.count(Operation::GetCopyStatus, &dst), 10);
    assert_eq!(store.count(Operation::Commit, &dst), 1);
    assert_eq!(reported.load(Ordering::Relaxed), 10 * 1024);
    let attrs = store.attributes(&dst).unwrap();
    assert_eq!(attrs.properties.content_type.as_deref(), Some("video/mp4"));
    assert_eq!(attrs.metadata.get("origin").map(String::as_str), Some("camera"));
    assert_eq!(c.job().status(), JobStatus::Finished);
    assert!(c.copy_id().is_some());
}

#[tokio::test(start_paused = true)]
async fn uri_copy_keeps_what_the_service_carried() {
    let store = MemoryStore::new();
    let (src, dst) = (blob("a.bin"), blob("b.bin"));
    let data = seeded(&store, &src, 4096);

    let c = AsyncCopyController::builder(base(TransferJob::new(src.clone(), dst.clone())), store.object(dst.clone()))
        .source_uri(src.copy_source_uri().unwrap())
        .build()
        .unwrap();
    drive(Arc::new(c), 1).await.unwrap();

    assert_eq!(store.data(&dst).unwrap(), data);
    assert_eq!(store.count(Operation::FetchAttributes, &src), 0);
    assert_eq!(store.count(Operation::Commit, &dst), 0);
    assert_eq!(store.attributes(&dst).unwrap().metadata.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn pending_copy_from_the_same_source_is_adopted() {
    let store = MemoryStore::new();
    let (src, dst) = (blob("a.bin"), blob("b.bin"));
    let data = seeded(&store, &src, 2048);
    let uri = src.copy_source_uri().unwrap();
    store.set_pending_copy(&dst, "copy-x", &uri, 2048);

    let c = Arc::new(object_copy(&store, base(TransferJob::new(src.clone(), dst.clone())), &src, &dst));
    drive(Arc::clone(&c) as Arc<dyn TransferController>, 1).await.unwrap();

    assert_eq!(c.copy_id().as_deref(), Some("copy-x"));
    assert_eq!(c.job().copy_id().as_deref(), Some("copy-x"));
    assert_eq!(store.data(&dst).unwrap(), data);
}

#[tokio::test(start_paused = true)]
async fn pending_copy_of_another_snapshot_is_not_adopted() {
    let store = MemoryStore::new();
    let (src, dst) = (blob("a.bin"), blob("b.bin"));
    seeded(&store, &src, 2048);
    let uri = src.copy_source_uri().unwrap();
    store.set_pending_copy(&dst, "copy-x", &format!("{uri}?snapshot=2026-01-01T00:00:00Z"), 2048);

    let c = Arc::new(object_copy(&store, base(TransferJob::new(src.clone(), dst.clone())), &src, &dst));
    let err = drive(Arc::clone(&c) as Arc<dyn TransferController>, 1).await.unwrap_err();

    assert!(matches!(err, TransferError::Provider(ProviderError::CopyPending(_))), "{err:?}");
    assert_eq!(c.state(), AsyncCopyState::Error);
    assert_eq!(store.count(Operation::GetCopyStatus, &dst), 0);
}

#[tokio::test(start_paused = true)]
async fn aborted_copy_fails_the_job() {
    let store = MemoryStore::new();
    let (src, dst) = (blob("a.bin"), blob("b.bin"));
    seeded(&store, &src, 64 * 1024);
    store.set_copy_step(1);

    let c = object_copy(&store, base(TransferJob::new(src.clone(), dst.clone())), &src, &dst);
    let run = tokio::spawn(drive(Arc::new(c), 1));
    wait_for_start(&store, &dst).await;
    store.end_copy(&dst, CopyState::Aborted, "aborted by operator");

    let err = run.await.unwrap().unwrap_err();
    match err {
        TransferError::CopyFailed { status, description } => {
            assert_eq!(status, CopyState::Aborted);
            assert_eq!(description, "aborted by operator");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn no_work_between_polls() {
    let store = MemoryStore::new();
    let (src, dst) = (blob("a.bin"), blob("b.bin"));
    seeded(&store, &src, 4096);
    store.set_copy_step(1024);
    let c = object_copy(&store, base(TransferJob::new(src.clone(), dst.clone())), &src, &dst);

    while c.state() != AsyncCopyState::GetCopyState {
        assert!(c.has_work());
        c.do_work().await;
    }

    assert!(!c.has_work());
    let due = c.eligible_at().unwrap();
    assert!(due > tokio::time::Instant::now());
    tokio::time::advance(Duration::from_millis(100)).await;
    assert!(c.has_work());
    c.do_work().await;
    assert_eq!(store.count(Operation::GetCopyStatus, &dst), 1);
    assert!(!c.has_work());
}

#[tokio::test(start_paused = true)]
async fn persisted_monitor_job_polls_without_restarting() {
    let store = MemoryStore::new();
    let (src, dst) = (blob("a.bin"), blob("b.bin"));
    let data = seeded(&store, &src, 3000);
    let copy_id = store
        .object(dst.clone())
        .start_copy(src.copy_source_uri().unwrap(), AccessCondition::none())
        .await
        .unwrap();
    let job = TransferJob::new(src.clone(), dst.clone());
    job.begin_monitor(copy_id);
    let restored = TransferJob::from_json(&job.to_json().unwrap()).unwrap();
    store.clear_calls();

    let c = object_copy(&store, base(restored), &src, &dst);
    assert_eq!(c.state(), AsyncCopyState::GetCopyState);
    drive(Arc::new(c), 1).await.unwrap();

    assert_eq!(store.count(Operation::StartCopy, &dst), 0);
    assert_eq!(store.count(Operation::GetCopyStatus, &dst), 1);
    assert_eq!(store.data(&dst).unwrap(), data);
}

#[tokio::test(start_paused = true)]
async fn refused_overwrite_skips_without_copying() {
    let store = MemoryStore::new();
    let (src, dst) = (blob("a.bin"), blob("b.bin"));
    seeded(&store, &src, 1024);
    store.put(&dst, vec![9; 10], ContentProperties::default(), Metadata::new());

    let base = base(TransferJob::new(src.clone(), dst.clone()))
        .with_overwrite_policy(Arc::new(|_: &str, _: &str, exists: bool| !exists));
    let c = object_copy(&store, base, &src, &dst);
    let err = drive(Arc::new(c), 1).await.unwrap_err();

    assert!(matches!(err, TransferError::Skipped(_)), "{err:?}");
    assert_eq!(store.count(Operation::StartCopy, &dst), 0);
    assert_eq!(store.data(&dst).unwrap(), vec![9; 10]);
}

#[tokio::test(start_paused = true)]
async fn cancel_while_monitoring() {
    let store = MemoryStore::new();
    let (src, dst) = (blob("a.bin"), blob("b.bin"));
    seeded(&store, &src, 64 * 1024);
    store.set_copy_step(1);

    let token = CancellationToken::new();
    let base = base(TransferJob::new(src.clone(), dst.clone())).with_cancellation(token.clone());
    let c = object_copy(&store, base, &src, &dst);
    let run = tokio::spawn(drive(Arc::new(c), 1));
    wait_for_start(&store, &dst).await;
    token.cancel();

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(err, TransferError::Cancelled), "{err:?}");
}

#[tokio::test(start_paused = true)]
async fn job_status_follows_the_copy() {
    let store = MemoryStore::new();
    let (src, dst) = (blob("a.bin"), blob("b.bin"));
    seeded(&store, &src, 4096);
    store.set_copy_step(1024);
    let c = object_copy(&store, base(TransferJob::new(src.clone(), dst.clone())), &src, &dst);
    assert_eq!(c.job().status(), JobStatus::NotStarted);

    c.do_work().await;
    assert_eq!(c.state(), AsyncCopyState::GetDestination);
    assert_eq!(c.job().status(), JobStatus::Transfer);

    while c.state() != AsyncCopyState::GetCopyState {
        c.do_work().await;
    }
    assert_eq!(c.job().status(), JobStatus::Monitor);
    assert_eq!(c.job().snapshot().status, JobStatus::Monitor);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_a_long_poll_wait_is_prompt() {
    let store = MemoryStore::new();
    let (src, dst) = (blob("a.bin"), blob("b.bin"));
    seeded(&store, &src, 64 * 1024);
    store.set_copy_step(1);

    let options = TransferOptions {
        copy_poll: CopyPollOptions {
            near_completion_bytes: 0,
            polls_before_backoff: 1,
            ..CopyPollOptions::default()
        },
        ..TransferOptions::default()
    };
    let token = CancellationToken::new();
    let job = Arc::new(TransferJob::new(src.clone(), dst.clone()));
    let base = ControllerBase::new(job, Arc::new(options)).with_cancellation(token.clone());
    let c = object_copy(&store, base, &src, &dst);
    let run = tokio::spawn(drive(Arc::new(c), 1));

    // Waits grow 1s, 10s, 100s, then sit at the 300s maximum.
    while store.count(Operation::GetCopyStatus, &dst) < 4 {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    let cancelled_at = tokio::time::Instant::now();
    token.cancel();

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(err, TransferError::Cancelled), "{err:?}");
    assert!(cancelled_at.elapsed() < Duration::from_secs(1), "{:?}", cancelled_at.elapsed());
    assert_eq!(store.count(Operation::GetCopyStatus, &dst), 4);
}

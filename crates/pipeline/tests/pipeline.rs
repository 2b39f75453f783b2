//! End-to-end runs of the chunked pipeline against the bundled providers.

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use datamover_location::local::LocalObject;
use datamover_location::memory::{MemoryStore, Operation};
use datamover_location::stream::StreamSource;
use datamover_location::{
    BlobKind, ContentProperties, Location, Metadata, ObjectDestination, ObjectSource,
    ProviderError,
};
use datamover_pipeline::ChunkedTransferController;
use datamover_transfer::{
    CheckpointSnapshot, ControllerBase, JobStatus, ProgressEvent, TransferError, TransferJob,
    TransferOptions, content_md5, drive,
};
use tokio_util::sync::CancellationToken;

const KIB: u64 = 1024;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn blob(name: &str, kind: BlobKind) -> Location {
    Location::blob("https://acct.test", "data", name, kind)
}

fn options(block_size: u64) -> TransferOptions {
    TransferOptions {
        block_size,
        segment_size: block_size,
        single_put_threshold: 0,
        ..TransferOptions::default()
    }
}

fn memory_pair(store: &MemoryStore, src: &Location, dst: &Location) -> (Arc<dyn ObjectSource>, Arc<dyn ObjectDestination>) {
    let source: Arc<dyn ObjectSource> = store.object(src.clone());
    let dest: Arc<dyn ObjectDestination> = store.object(dst.clone());
    (source, dest)
}

async fn run(
    base: ControllerBase,
    source: Arc<dyn ObjectSource>,
    dest: Arc<dyn ObjectDestination>,
    parallelism: usize,
) -> Result<(), TransferError> {
    let controller = ChunkedTransferController::new(base, source, dest)?;
    drive(Arc::new(controller), parallelism).await
}

async fn copy_between(
    store: &MemoryStore,
    src: &Location,
    dst: &Location,
    options: TransferOptions,
) -> (Result<(), TransferError>, Arc<TransferJob>) {
    let job = Arc::new(TransferJob::new(src.clone(), dst.clone()));
    let base = ControllerBase::new(Arc::clone(&job), Arc::new(options));
    let (source, dest) = memory_pair(store, src, dst);
    (run(base, source, dest, 4).await, job)
}

#[tokio::test]
async fn block_upload_stages_every_chunk_and_commits_once() {
    let store = MemoryStore::new();
    let src = blob("src.bin", BlobKind::Block);
    let dst = blob("dst.bin", BlobKind::Block);
    let data = pattern(300 * KIB as usize);
    store.put(&src, data.clone(), ContentProperties::default(), Metadata::new());

    let (result, job) = copy_between(&store, &src, &dst, options(64 * KIB)).await;

    result.unwrap();
    assert_eq!(store.data(&dst).unwrap(), data);
    assert_eq!(store.count(Operation::WriteChunk, &dst), 5);
    assert_eq!(store.count(Operation::SubmitBlockList, &dst), 1);
    assert_eq!(store.count(Operation::PutWhole, &dst), 0);
    // The block list call defaulted the content type; it is cleared again.
    assert_eq!(store.attributes(&dst).unwrap().properties.content_type, None);
    assert_eq!(job.status(), JobStatus::Finished);
    assert_eq!(job.checkpoint().window_len(), 0);
}

#[tokio::test]
async fn small_block_object_goes_out_in_one_put() {
    let store = MemoryStore::new();
    let src = blob("small.txt", BlobKind::Block);
    let dst = blob("small-copy.txt", BlobKind::Block);
    let data = pattern(10 * KIB as usize);
    let metadata = Metadata::from([("origin".to_string(), "test".to_string())]);
    store.put(&src, data.clone(), ContentProperties::default(), metadata.clone());

    let (result, _) = copy_between(&store, &src, &dst, TransferOptions::default()).await;

    result.unwrap();
    assert_eq!(store.data(&dst).unwrap(), data);
    assert_eq!(store.count(Operation::PutWhole, &dst), 1);
    assert_eq!(store.count(Operation::WriteChunk, &dst), 0);
    assert_eq!(store.count(Operation::SubmitBlockList, &dst), 0);
    let attrs = store.attributes(&dst).unwrap();
    assert_eq!(attrs.metadata, metadata);
    assert_eq!(attrs.properties.content_type, None);
}

#[tokio::test]
async fn single_put_keeps_an_explicit_content_type() {
    let store = MemoryStore::new();
    let src = blob("page.html", BlobKind::Block);
    let dst = blob("page-copy.html", BlobKind::Block);
    let props = ContentProperties {
        content_type: Some("text/html".into()),
        ..ContentProperties::default()
    };
    store.put(&src, pattern(2048), props, Metadata::new());

    let (result, _) = copy_between(&store, &src, &dst, TransferOptions::default()).await;

    result.unwrap();
    let attrs = store.attributes(&dst).unwrap();
    assert_eq!(attrs.properties.content_type.as_deref(), Some("text/html"));
    assert_eq!(store.count(Operation::SetProperties, &dst), 0);
}

#[tokio::test]
async fn empty_source_commits_an_empty_block_list() {
    let store = MemoryStore::new();
    let src = blob("empty", BlobKind::Block);
    let dst = blob("empty-copy", BlobKind::Block);
    store.put(&src, Vec::new(), ContentProperties::default(), Metadata::new());

    let (result, job) = copy_between(&store, &src, &dst, options(64 * KIB)).await;

    result.unwrap();
    assert_eq!(store.data(&dst).unwrap(), Vec::<u8>::new());
    assert_eq!(store.count(Operation::WriteChunk, &dst), 0);
    assert_eq!(store.count(Operation::SubmitBlockList, &dst), 1);
    assert_eq!(job.status(), JobStatus::Finished);
}

#[tokio::test]
async fn page_destination_skips_empty_ranges() {
    let store = MemoryStore::new();
    let src = blob("disk.vhd", BlobKind::Page);
    let dst = blob("disk-copy.vhd", BlobKind::Page);
    let chunk = pattern(KIB as usize);
    store.put_sparse(&src, 4 * KIB, vec![(0, chunk.clone()), (2 * KIB, chunk.clone())]);

    let (result, _) = copy_between(&store, &src, &dst, options(KIB)).await;

    result.unwrap();
    let mut expected = vec![0u8; 4 * KIB as usize];
    expected[..KIB as usize].copy_from_slice(&chunk);
    expected[2 * KIB as usize..3 * KIB as usize].copy_from_slice(&chunk);
    assert_eq!(store.data(&dst).unwrap(), expected);
    assert_eq!(store.count(Operation::Create, &dst), 1);
    assert_eq!(store.count(Operation::WriteChunk, &dst), 2);
    assert_eq!(store.count(Operation::Commit, &dst), 1);
}

#[tokio::test]
async fn page_destination_rejects_unaligned_source() {
    let store = MemoryStore::new();
    let src = blob("odd.bin", BlobKind::Block);
    let dst = blob("odd.vhd", BlobKind::Page);
    store.put(&src, pattern(1000), ContentProperties::default(), Metadata::new());

    let (result, _) = copy_between(&store, &src, &dst, options(KIB)).await;

    assert!(matches!(result, Err(TransferError::InvalidConfiguration(_))));
    assert_eq!(store.count(Operation::Create, &dst), 0);
}

#[tokio::test]
async fn append_destination_is_written_in_order() {
    let store = MemoryStore::new();
    let src = blob("log.txt", BlobKind::Block);
    let dst = blob("log-copy.txt", BlobKind::Append);
    let data = pattern(5 * KIB as usize);
    store.put(&src, data.clone(), ContentProperties::default(), Metadata::new());

    let (result, _) = copy_between(&store, &src, &dst, options(KIB)).await;

    result.unwrap();
    assert_eq!(store.data(&dst).unwrap(), data);
    assert_eq!(store.count(Operation::Create, &dst), 1);
    let offsets: Vec<u64> = store
        .calls()
        .into_iter()
        .filter(|c| c.op == Operation::WriteChunk)
        .filter_map(|c| c.offset)
        .collect();
    assert_eq!(offsets, vec![0, KIB, 2 * KIB, 3 * KIB, 4 * KIB]);
}

fn resumed_job(src: &Location, dst: &Location, window: &[u64]) -> Arc<TransferJob> {
    let mut snapshot = TransferJob::new(src.clone(), dst.clone()).snapshot();
    snapshot.status = JobStatus::Transfer;
    snapshot.checkpoint = CheckpointSnapshot {
        entry_offset: 0,
        window: window.iter().copied().collect(),
    };
    Arc::new(TransferJob::from_snapshot(snapshot))
}

#[tokio::test]
async fn append_resume_accepts_a_chunk_that_already_landed() {
    let store = MemoryStore::new();
    let src = blob("events", BlobKind::Block);
    let dst = blob("events-copy", BlobKind::Append);
    let data = pattern(3 * KIB as usize);
    store.put(&src, data.clone(), ContentProperties::default(), Metadata::new());
    // The first chunk was appended but the response never arrived.
    store.put(&dst, data[..KIB as usize].to_vec(), ContentProperties::default(), Metadata::new());

    let job = resumed_job(&src, &dst, &[0]);
    let base = ControllerBase::new(job, Arc::new(options(KIB)));
    let (source, dest) = memory_pair(&store, &src, &dst);

    run(base, source, dest, 2).await.unwrap();

    assert_eq!(store.data(&dst).unwrap(), data);
    assert_eq!(store.count(Operation::Create, &dst), 0);
    assert_eq!(store.count(Operation::ReadBack, &dst), 1);
}

#[tokio::test]
async fn append_resume_detects_diverged_content() {
    let store = MemoryStore::new();
    let src = blob("events", BlobKind::Block);
    let dst = blob("events-copy", BlobKind::Append);
    let data = pattern(3 * KIB as usize);
    store.put(&src, data.clone(), ContentProperties::default(), Metadata::new());
    store.put(&dst, data[..KIB as usize].to_vec(), ContentProperties::default(), Metadata::new());
    store.tamper(&dst, 100, b"x");

    let job = resumed_job(&src, &dst, &[0]);
    let base = ControllerBase::new(Arc::clone(&job), Arc::new(options(KIB)));
    let (source, dest) = memory_pair(&store, &src, &dst);

    let err = run(base, source, dest, 2).await.unwrap_err();

    assert!(matches!(err, TransferError::ContentMismatch { offset: 100 }), "{err:?}");
    assert_ne!(job.status(), JobStatus::Finished);
}

#[tokio::test]
async fn interrupted_block_upload_resumes_from_its_checkpoint() {
    let store = MemoryStore::new();
    let src = blob("big.bin", BlobKind::Block);
    let dst = blob("big-copy.bin", BlobKind::Block);
    let data = pattern(8 * KIB as usize);
    store.put(&src, data.clone(), ContentProperties::default(), Metadata::new());
    store.fail_after(Operation::WriteChunk, Some(&dst), 3, || ProviderError::Service {
        status: 500,
        message: "internal error".into(),
    });

    let job = Arc::new(TransferJob::new(src.clone(), dst.clone()));
    let base = ControllerBase::new(Arc::clone(&job), Arc::new(options(KIB)));
    let (source, dest) = memory_pair(&store, &src, &dst);
    let err = run(base, source, dest, 1).await.unwrap_err();
    assert!(matches!(err, TransferError::Provider(_)), "{err:?}");
    assert_eq!(store.count(Operation::SubmitBlockList, &dst), 0);

    let saved = job.to_json().unwrap();
    let restored = Arc::new(TransferJob::from_json(&saved).unwrap());
    assert!(!restored.checkpoint().is_fresh());
    store.clear_calls();

    let base = ControllerBase::new(Arc::clone(&restored), Arc::new(options(KIB)));
    let (source, dest) = memory_pair(&store, &src, &dst);
    run(base, source, dest, 1).await.unwrap();

    assert_eq!(store.data(&dst).unwrap(), data);
    assert_eq!(store.count(Operation::WriteChunk, &dst), 5);
    assert_eq!(store.count(Operation::SubmitBlockList, &dst), 1);
    assert_eq!(restored.status(), JobStatus::Finished);
}

#[tokio::test]
async fn refused_overwrite_skips_the_object() {
    let store = MemoryStore::new();
    let src = blob("a", BlobKind::Block);
    let dst = blob("b", BlobKind::Block);
    store.put(&src, pattern(4096), ContentProperties::default(), Metadata::new());
    store.put(&dst, b"keep me".to_vec(), ContentProperties::default(), Metadata::new());

    let job = Arc::new(TransferJob::new(src.clone(), dst.clone()));
    let base = ControllerBase::new(Arc::clone(&job), Arc::new(options(KIB)))
        .with_overwrite_policy(Arc::new(|_: &str, _: &str, exists: bool| !exists));
    let (source, dest) = memory_pair(&store, &src, &dst);

    let err = run(base, source, dest, 4).await.unwrap_err();

    assert!(matches!(err, TransferError::Skipped(_)), "{err:?}");
    assert_eq!(store.data(&dst).unwrap(), b"keep me");
    assert_eq!(store.count(Operation::WriteChunk, &dst), 0);
    assert_eq!(job.overwrite(), Some(false));
}

#[tokio::test]
async fn existing_object_of_another_kind_is_rejected() {
    let store = MemoryStore::new();
    let src = blob("a", BlobKind::Block);
    let dst = blob("b", BlobKind::Block);
    store.put(&src, pattern(4096), ContentProperties::default(), Metadata::new());
    store.put(&blob("b", BlobKind::Page), vec![0; 512], ContentProperties::default(), Metadata::new());

    let (result, _) = copy_between(&store, &src, &dst, options(KIB)).await;

    assert!(matches!(result, Err(TransferError::DestinationTypeMismatch(_))));
    assert_eq!(store.count(Operation::WriteChunk, &dst), 0);
}

#[tokio::test]
async fn cancelled_job_touches_nothing() {
    let store = MemoryStore::new();
    let src = blob("a", BlobKind::Block);
    let dst = blob("b", BlobKind::Block);
    store.put(&src, pattern(4096), ContentProperties::default(), Metadata::new());

    let token = CancellationToken::new();
    token.cancel();
    let job = Arc::new(TransferJob::new(src.clone(), dst.clone()));
    let base = ControllerBase::new(job, Arc::new(options(KIB))).with_cancellation(token);
    let (source, dest) = memory_pair(&store, &src, &dst);

    let err = run(base, source, dest, 4).await.unwrap_err();

    assert!(matches!(err, TransferError::Cancelled));
    assert_eq!(store.count(Operation::FetchAttributes, &dst), 0);
    assert!(store.data(&dst).is_none());
}

#[tokio::test]
async fn cancelling_mid_transfer_stops_the_job() {
    let store = MemoryStore::new();
    let src = blob("a", BlobKind::Block);
    let dst = blob("b", BlobKind::Block);
    store.put(&src, pattern(64 * KIB as usize), ContentProperties::default(), Metadata::new());
    store.set_latency(Some(Duration::from_millis(20)));

    let token = CancellationToken::new();
    let job = Arc::new(TransferJob::new(src.clone(), dst.clone()));
    let base = ControllerBase::new(job, Arc::new(options(KIB))).with_cancellation(token.clone());
    let (source, dest) = memory_pair(&store, &src, &dst);

    let handle = tokio::spawn(run(base, source, dest, 4));
    tokio::time::sleep(Duration::from_millis(60)).await;
    token.cancel();

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, TransferError::Cancelled), "{err:?}");
    assert_eq!(store.count(Operation::SubmitBlockList, &dst), 0);
}

#[tokio::test]
async fn content_md5_is_stored_on_commit() {
    let store = MemoryStore::new();
    let src = blob("a", BlobKind::Block);
    let dst = blob("b", BlobKind::Block);
    let data = pattern(10 * KIB as usize);
    store.put(&src, data.clone(), ContentProperties::default(), Metadata::new());

    let opts = TransferOptions {
        compute_content_md5: true,
        ..options(4 * KIB)
    };
    let (result, _) = copy_between(&store, &src, &dst, opts).await;

    result.unwrap();
    let attrs = store.attributes(&dst).unwrap();
    assert_eq!(attrs.properties.content_md5, Some(content_md5(&data)));
}

#[tokio::test]
async fn chunk_checksums_pass_for_intact_data() {
    let store = MemoryStore::new();
    let src = blob("a", BlobKind::Block);
    let dst = Location::file("https://acct.test", "share", "dir/b");
    let data = pattern(6 * KIB as usize);
    store.put(&src, data.clone(), ContentProperties::default(), Metadata::new());

    let opts = TransferOptions {
        verify_chunk_checksums: true,
        ..options(KIB)
    };
    let (result, _) = copy_between(&store, &src, &dst, opts).await;

    result.unwrap();
    assert_eq!(store.data(&dst).unwrap(), data);
}

#[tokio::test]
async fn many_chunks_with_interleaved_completion() {
    let store = MemoryStore::new();
    let src = blob("a", BlobKind::Block);
    let dst = blob("b", BlobKind::Block);
    let data = pattern(64 * KIB as usize);
    store.put(&src, data.clone(), ContentProperties::default(), Metadata::new());
    store.set_latency(Some(Duration::from_millis(1)));

    let job = Arc::new(TransferJob::new(src.clone(), dst.clone()));
    let opts = TransferOptions {
        max_window_size: 8,
        ..options(KIB)
    };
    let base = ControllerBase::new(job, Arc::new(opts));
    let (source, dest) = memory_pair(&store, &src, &dst);

    run(base, source, dest, 8).await.unwrap();

    assert_eq!(store.data(&dst).unwrap(), data);
    assert_eq!(store.count(Operation::WriteChunk, &dst), 64);
    assert_eq!(store.count(Operation::SubmitBlockList, &dst), 1);
}

#[tokio::test]
async fn local_file_to_local_file_reports_every_byte() {
    let dir = tempfile::tempdir().unwrap();
    let src_path = dir.path().join("in.bin");
    let dst_path = dir.path().join("out.bin");
    let data = pattern(100 * KIB as usize);
    tokio::fs::write(&src_path, &data).await.unwrap();

    let source = Arc::new(LocalObject::new(&src_path));
    let dest = Arc::new(LocalObject::new(&dst_path));
    let job = Arc::new(TransferJob::new(Location::local(&src_path), Location::local(&dst_path)));

    let reported = Arc::new(AtomicU64::new(0));
    let sink = Arc::clone(&reported);
    let base = ControllerBase::new(job, Arc::new(options(16 * KIB))).with_progress(Arc::new(
        move |event: ProgressEvent| {
            sink.fetch_add(event.bytes_transferred_delta, Ordering::Relaxed);
        },
    ));

    run(base, source, dest, 4).await.unwrap();

    assert_eq!(tokio::fs::read(&dst_path).await.unwrap(), data);
    assert_eq!(reported.load(Ordering::Relaxed), data.len() as u64);
}

#[tokio::test]
async fn stream_of_unknown_length_lands_in_a_local_file() {
    let dir = tempfile::tempdir().unwrap();
    let dst_path = dir.path().join("piped.bin");
    let data = pattern(37 * KIB as usize + 5);

    let source = Arc::new(StreamSource::new("stdin", Cursor::new(data.clone()), None));
    let dest = Arc::new(LocalObject::new(&dst_path));
    let job = Arc::new(TransferJob::new(Location::stream("stdin"), Location::local(&dst_path)));
    let base = ControllerBase::new(Arc::clone(&job), Arc::new(options(8 * KIB)));

    run(base, source, dest, 4).await.unwrap();

    assert_eq!(tokio::fs::read(&dst_path).await.unwrap(), data);
    assert_eq!(job.status(), JobStatus::Finished);
}

#[tokio::test]
async fn stream_of_unknown_length_uploads_as_blocks() {
    let store = MemoryStore::new();
    let dst = blob("upload.bin", BlobKind::Block);
    let data = pattern(20 * KIB as usize);

    let source = Arc::new(StreamSource::new("stdin", Cursor::new(data.clone()), None));
    let dest: Arc<dyn ObjectDestination> = store.object(dst.clone());
    let job = Arc::new(TransferJob::new(Location::stream("stdin"), dst.clone()));
    let base = ControllerBase::new(job, Arc::new(options(8 * KIB)));

    run(base, source, dest, 4).await.unwrap();

    assert_eq!(store.data(&dst).unwrap(), data);
    assert_eq!(store.count(Operation::WriteChunk, &dst), 3);
    assert_eq!(store.count(Operation::SubmitBlockList, &dst), 1);
}

#[tokio::test]
async fn uri_destination_is_rejected_up_front() {
    let store = MemoryStore::new();
    let src = blob("a", BlobKind::Block);
    let source: Arc<dyn ObjectSource> = store.object(src.clone());
    let dest: Arc<dyn ObjectDestination> = store.object(Location::uri("https://elsewhere.test/x"));
    let job = Arc::new(TransferJob::new(src, Location::uri("https://elsewhere.test/x")));

    let result = ChunkedTransferController::new(
        ControllerBase::new(job, Arc::new(TransferOptions::default())),
        source,
        dest,
    );

    assert!(matches!(result, Err(TransferError::InvalidConfiguration(_))));
}

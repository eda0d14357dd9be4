use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use kis_core::archive::sha256_hex;
use kis_core::naming::checksum_from_key;
use kis_core::{
    ActiveSegment, Archiver, Backfill, IngestError, Ingestor, MemoryRecordStore, RecordCodec, RecordStore,
    RemoteTarget, Rotator, StoreError, Trigger, run_trigger_loop, spawn_inactivity_monitor,
};

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<InMemory>,
    db: Arc<MemoryRecordStore>,
    rotator: Arc<Rotator>,
    ingestor: Ingestor,
}

fn harness(rotate_interval: usize) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemory::new());
    let db = Arc::new(MemoryRecordStore::new());

    let segment = Arc::new(ActiveSegment::open(dir.path().join("kong.log"), 1024).unwrap());
    let remote = RemoteTarget {
        store: store.clone(),
        folder: "kong".into(),
        remove_sent_file: true,
    };
    let archiver = Arc::new(Archiver::new(Some(remote), 6));
    let rotator = Arc::new(Rotator::new(segment, archiver, rotate_interval, 1, 100));
    let db_dyn: Arc<dyn RecordStore> = db.clone();
    let ingestor = Ingestor::new(Some(db_dyn), rotator.clone(), RecordCodec::default());

    Harness { _dir: dir, store, db, rotator, ingestor }
}

async fn keys(store: &InMemory) -> Vec<String> {
    let mut keys: Vec<String> = store
        .list(None)
        .map_ok(|meta| meta.location.to_string())
        .try_collect()
        .await
        .unwrap();
    keys.sort();
    keys
}

async fn fetch(store: &InMemory, key: &str) -> Vec<u8> {
    store.get(&ObjectPath::from(key)).await.unwrap().bytes().await.unwrap().to_vec()
}

fn gunzip(data: &[u8]) -> Vec<u8> {
    use std::io::Read;
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(data).read_to_end(&mut out).unwrap();
    out
}

#[tokio::test]
async fn batches_are_archived_and_backfill_reproduces_live_rows() {
    let h = harness(2);
    let cancel = CancellationToken::new();

    h.ingestor.ingest(br#"[{"started_at":1700000000000,"id":1}]"#, &cancel).await.unwrap();
    assert_eq!(h.rotator.segment().appended(), 1);
    h.ingestor.ingest(br#"[{"started_at":1700000001000,"id":2}]"#, &cancel).await.unwrap();
    assert!(h.rotator.wait_detached(Duration::from_secs(10)).await);

    assert_eq!(h.rotator.segment().appended(), 0);
    let keys = keys(&h.store).await;
    assert_eq!(keys.len(), 1);
    assert!(keys[0].starts_with("kong/"));
    assert!(keys[0].ends_with(".gz"));

    let plain = gunzip(&fetch(&h.store, &keys[0]).await);
    assert_eq!(
        plain,
        b"{\"started_at\":1700000000000,\"id\":1}\n{\"started_at\":1700000001000,\"id\":2}\n"
    );
    assert_eq!(checksum_from_key(&keys[0]), Some(sha256_hex(&plain).as_str()));

    // Replay into a fresh database: same rows as the live path produced.
    let live = h.db.live_rows();
    let replay = Arc::new(MemoryRecordStore::new());
    let report = Backfill::new(h.store.clone(), replay.clone(), "kong", 4).run().await.unwrap();
    assert_eq!(report.processed(), 1);
    assert_eq!(replay.live_rows(), live);

    // Replay into the same database: nothing changes.
    Backfill::new(h.store.clone(), h.db.clone(), "kong", 4).run().await.unwrap();
    assert_eq!(h.db.live_rows(), live);
}

#[tokio::test]
async fn rotation_happens_only_at_threshold() {
    for threshold in 1..=4 {
        let h = harness(threshold);
        let cancel = CancellationToken::new();

        for n in 1..=threshold * 2 {
            let body = format!(r#"[{{"started_at":{n}}}]"#);
            h.ingestor.ingest(body.as_bytes(), &cancel).await.unwrap();

            let expected = n % threshold;
            assert_eq!(h.rotator.segment().appended(), expected, "threshold {threshold}, record {n}");
        }
        assert!(h.rotator.wait_detached(Duration::from_secs(10)).await);
        assert_eq!(keys(&h.store).await.len(), 2, "threshold {threshold}");
    }
}

#[tokio::test]
async fn broken_database_does_not_block_durability() {
    let h = harness(100);
    h.db.fail_copies(StoreError::connect("connection refused"));

    let n = h
        .ingestor
        .ingest(br#"[{"started_at":1},{"started_at":2}]"#, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(n, 2);
    assert_eq!(h.rotator.segment().appended(), 2);
    assert_eq!(h.db.live_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_request_skips_the_append() {
    let h = harness(100);
    h.db.delay_copies(Duration::from_secs(60));
    let cancel = CancellationToken::new();

    let timer = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            cancel.cancel();
        })
    };

    let err = h.ingestor.ingest(br#"[{"started_at":1}]"#, &cancel).await.unwrap_err();
    timer.await.unwrap();

    assert!(matches!(err, IngestError::Cancelled));
    assert_eq!(h.rotator.segment().appended(), 0);
    assert_eq!(std::fs::read_to_string(h.rotator.segment().path()).unwrap(), "");
}

#[tokio::test]
async fn corrupted_archive_is_skipped_and_the_rest_is_restored() {
    let h = harness(1);
    let cancel = CancellationToken::new();
    for n in 1..=3 {
        let body = format!(r#"[{{"started_at":{n}000}}]"#);
        h.ingestor.ingest(body.as_bytes(), &cancel).await.unwrap();
        // Sequential rotations so each archive gets its own name.
        assert!(h.rotator.wait_detached(Duration::from_secs(10)).await);
    }
    let keys = keys(&h.store).await;
    assert_eq!(keys.len(), 3);

    // Same key, different content.
    let mut tampered = gunzip(&fetch(&h.store, &keys[1]).await);
    tampered[0] ^= 0x01;
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    std::io::Write::write_all(&mut encoder, &tampered).unwrap();
    h.store
        .put(&ObjectPath::from(keys[1].as_str()), PutPayload::from(encoder.finish().unwrap()))
        .await
        .unwrap();

    let db = Arc::new(MemoryRecordStore::new());
    let report = Backfill::new(h.store.clone(), db.clone(), "kong", 2).run().await.unwrap();

    assert_eq!(report.listed, 3);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.staged, 2);
    assert_eq!(db.live_len(), 2);
}

#[tokio::test(start_paused = true)]
async fn inactivity_flushes_a_partial_file() {
    let h = harness(1000);
    let token = CancellationToken::new();
    let (tx, rx) = mpsc::channel(4);
    let segment = h.rotator.segment().clone();

    let monitor = spawn_inactivity_monitor(segment.clone(), Duration::from_secs(30), tx, token.clone());
    let trigger_loop = tokio::spawn(run_trigger_loop(rx, h.rotator.clone(), token.clone()));

    h.ingestor
        .ingest(br#"[{"started_at":1700000000000}]"#, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(segment.appended(), 1);

    // First tick sees the new timestamp, the second sees no progress.
    tokio::time::sleep(Duration::from_secs(61)).await;
    for _ in 0..100 {
        if segment.appended() == 0 && !keys(&h.store).await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(segment.appended(), 0);
    assert_eq!(keys(&h.store).await.len(), 1);

    token.cancel();
    monitor.await.unwrap();
    trigger_loop.await.unwrap();
}

#[tokio::test]
async fn operator_trigger_flushes_below_threshold() {
    let h = harness(1000);
    let token = CancellationToken::new();
    let (tx, rx) = mpsc::channel(1);
    let trigger_loop = tokio::spawn(run_trigger_loop(rx, h.rotator.clone(), token.clone()));

    h.ingestor.ingest(br#"[{"started_at":5}]"#, &CancellationToken::new()).await.unwrap();
    tx.send(Trigger::Operator).await.unwrap();
    drop(tx);
    trigger_loop.await.unwrap();

    assert_eq!(h.rotator.segment().appended(), 0);
    assert_eq!(keys(&h.store).await.len(), 1);
}

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use codedrop::access::AccessGate;
use codedrop::database;
use codedrop::expiry::ExpiryScheduler;
use codedrop::store::{ContentStore, PutRequest, StoreError, StoreOptions};

struct TestStore {
    store: Arc<ContentStore>,
    shutdown: CancellationToken,
    files_root: PathBuf,
    _dir: TempDir,
}

impl Drop for TestStore {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn database_url(dir: &Path) -> String {
    format!("sqlite://{}/meta.db?mode=rwc", dir.display())
}

fn base_options(dir: &Path) -> StoreOptions {
    let mut options = StoreOptions::new(dir.join("files"));
    // cheap hashing so key tests stay fast
    options.gate = AccessGate::new(64, 1, 1);
    options
}

async fn open_at(
    dir: &Path,
    run_scheduler: bool,
    configure: impl FnOnce(&mut StoreOptions),
) -> (Arc<ContentStore>, CancellationToken) {
    let pool = database::create_pool(&database_url(dir)).await.unwrap();
    database::create_tables(&pool).await.unwrap();

    let mut options = base_options(dir);
    configure(&mut options);

    let scheduler = ExpiryScheduler::new();
    let store = Arc::new(
        ContentStore::open(pool, options, scheduler.clone())
            .await
            .unwrap(),
    );

    let shutdown = CancellationToken::new();
    if run_scheduler {
        tokio::spawn(scheduler.run(store.clone(), shutdown.clone()));
    }

    (store, shutdown)
}

async fn open_store(configure: impl FnOnce(&mut StoreOptions)) -> TestStore {
    let dir = TempDir::new().unwrap();
    let files_root = dir.path().join("files");
    let (store, shutdown) = open_at(dir.path(), true, configure).await;

    TestStore {
        store,
        shutdown,
        files_root,
        _dir: dir,
    }
}

fn put_text(payload: &str) -> PutRequest {
    PutRequest {
        payload: payload.as_bytes().to_vec(),
        content_type: "text/plain".to_string(),
        filename: "note.txt".to_string(),
        ..PutRequest::default()
    }
}

#[tokio::test]
async fn round_trip_and_counter_exhaustion() {
    let ts = open_store(|_| {}).await;

    let code = ts
        .store
        .put(PutRequest {
            downloads: Some(2),
            ..put_text("hello")
        })
        .await
        .unwrap();

    let (payload, meta) = ts.store.get(&code, None).await.unwrap();
    assert_eq!(payload, b"hello");
    assert_eq!(meta.remaining_downloads, 2);
    assert_eq!(meta.filename, "note.txt");

    let (payload, meta) = ts.store.get(&code, None).await.unwrap();
    assert_eq!(payload, b"hello");
    assert_eq!(meta.remaining_downloads, 1);

    assert!(matches!(
        ts.store.get(&code, None).await,
        Err(StoreError::NotFound)
    ));
    assert!(!ts.store.exists(&code).await.unwrap());
    assert!(!ts.files_root.join(&code).exists());
}

#[tokio::test]
async fn key_gate_blocks_without_spending_downloads() {
    let ts = open_store(|_| {}).await;

    let code = ts
        .store
        .put(PutRequest {
            key: Some("secret".to_string()),
            downloads: Some(1),
            ..put_text("guarded")
        })
        .await
        .unwrap();

    assert!(matches!(
        ts.store.get(&code, None).await,
        Err(StoreError::KeyMismatch)
    ));
    assert!(matches!(
        ts.store.get(&code, Some("")).await,
        Err(StoreError::KeyMismatch)
    ));
    assert!(matches!(
        ts.store.get(&code, Some("wrong")).await,
        Err(StoreError::KeyMismatch)
    ));

    // the failed attempts must not have consumed the single download
    let (payload, _) = ts.store.get(&code, Some("secret")).await.unwrap();
    assert_eq!(payload, b"guarded");

    assert!(matches!(
        ts.store.get(&code, Some("secret")).await,
        Err(StoreError::NotFound)
    ));
}

#[tokio::test]
async fn explicit_code_conflicts_until_released() {
    let ts = open_store(|options| options.code_length = 2).await;

    let code = ts
        .store
        .put(PutRequest {
            code: Some("99".to_string()),
            ..put_text("first")
        })
        .await
        .unwrap();
    assert_eq!(code, "99");

    assert!(matches!(
        ts.store
            .put(PutRequest {
                code: Some("99".to_string()),
                ..put_text("second")
            })
            .await,
        Err(StoreError::CodeInUse)
    ));

    ts.store.delete("99").await.unwrap();

    let code = ts
        .store
        .put(PutRequest {
            code: Some("99".to_string()),
            ..put_text("third")
        })
        .await
        .unwrap();
    assert_eq!(code, "99");
}

#[tokio::test]
async fn malformed_explicit_codes_are_rejected() {
    let ts = open_store(|options| options.code_length = 2).await;

    for bad in ["abc", "A!", "é9"] {
        assert!(matches!(
            ts.store
                .put(PutRequest {
                    code: Some(bad.to_string()),
                    ..put_text("x")
                })
                .await,
            Err(StoreError::InvalidCode { expected: 2 })
        ));
    }
}

#[tokio::test]
async fn allocation_is_unique_and_reports_exhaustion() {
    let ts = open_store(|options| options.code_length = 1).await;

    let mut seen = std::collections::HashSet::new();
    for i in 0..36 {
        let code = ts.store.put(put_text(&format!("payload {i}"))).await.unwrap();
        assert!(seen.insert(code), "two live entries shared a code");
    }

    assert!(matches!(
        ts.store.put(put_text("overflow")).await,
        Err(StoreError::CodesExhausted)
    ));

    // releasing one code makes it allocatable again
    let freed = seen.iter().next().unwrap().clone();
    ts.store.delete(&freed).await.unwrap();

    let code = ts.store.put(put_text("reuse")).await.unwrap();
    assert_eq!(code, freed);
}

#[tokio::test]
async fn downloads_and_ttl_are_clamped() {
    let ts = open_store(|_| {}).await;
    let now = time::OffsetDateTime::now_utc();

    let code = ts
        .store
        .put(PutRequest {
            downloads: Some(0),
            ..put_text("low")
        })
        .await
        .unwrap();
    let (_, meta) = ts.store.get(&code, None).await.unwrap();
    assert_eq!(meta.remaining_downloads, 1);

    let code = ts
        .store
        .put(PutRequest {
            downloads: Some(999),
            ..put_text("high")
        })
        .await
        .unwrap();
    let (_, meta) = ts.store.get(&code, None).await.unwrap();
    assert_eq!(meta.remaining_downloads, 3);

    let code = ts
        .store
        .put(PutRequest {
            ttl: Some("1 sec".to_string()),
            ..put_text("short")
        })
        .await
        .unwrap();
    let (_, meta) = ts.store.get(&code, None).await.unwrap();
    assert!(meta.expires_at - now >= time::Duration::seconds(59));

    let code = ts
        .store
        .put(PutRequest {
            ttl: Some("30 days".to_string()),
            ..put_text("long")
        })
        .await
        .unwrap();
    let (_, meta) = ts.store.get(&code, None).await.unwrap();
    assert!(meta.expires_at - now <= time::Duration::days(7) + time::Duration::minutes(1));

    assert!(matches!(
        ts.store
            .put(PutRequest {
                ttl: Some("whenever".to_string()),
                ..put_text("bad")
            })
            .await,
        Err(StoreError::InvalidTtl(_))
    ));
}

#[tokio::test]
async fn ttl_expiry_fires_regardless_of_remaining_downloads() {
    let ts = open_store(|options| options.min_ttl = Duration::from_secs(1)).await;

    let code = ts
        .store
        .put(PutRequest {
            downloads: Some(3),
            ttl: Some("1 sec".to_string()),
            ..put_text("fleeting")
        })
        .await
        .unwrap();
    assert!(ts.store.exists(&code).await.unwrap());

    tokio::time::sleep(Duration::from_secs(4)).await;

    assert!(!ts.store.exists(&code).await.unwrap());
    assert!(matches!(
        ts.store.get(&code, None).await,
        Err(StoreError::NotFound)
    ));
    assert!(!ts.files_root.join(&code).exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_fetches_spend_exactly_the_counter() {
    let ts = open_store(|_| {}).await;

    let code = ts
        .store
        .put(PutRequest {
            downloads: Some(2),
            ..put_text("race")
        })
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = ts.store.clone();
        let code = code.clone();
        handles.push(tokio::spawn(
            async move { store.get(&code, None).await },
        ));
    }

    let mut served = 0;
    let mut missing = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok((payload, _)) => {
                assert_eq!(payload, b"race");
                served += 1;
            }
            Err(StoreError::NotFound) => missing += 1,
            Err(other) => panic!("unexpected outcome: {other}"),
        }
    }

    assert_eq!(served, 2);
    assert_eq!(missing, 6);
    assert!(!ts.store.exists(&code).await.unwrap());
}

#[tokio::test]
async fn reopening_restores_entries_and_purges_orphans() {
    let dir = TempDir::new().unwrap();
    let files_root = dir.path().join("files");

    let (store, _shutdown) = open_at(dir.path(), false, |_| {}).await;

    let kept = store
        .put(PutRequest {
            downloads: Some(3),
            ttl: Some("1 hour".to_string()),
            ..put_text("persist me")
        })
        .await
        .unwrap();
    let broken = store.put(put_text("loses its payload")).await.unwrap();
    drop(store);

    // simulate a crash that left artifacts half-written
    std::fs::remove_file(files_root.join(&broken)).unwrap();
    std::fs::write(files_root.join("zzz"), b"orphan payload").unwrap();

    let (store, _shutdown) = open_at(dir.path(), true, |_| {}).await;

    assert!(store.exists(&kept).await.unwrap());
    let (payload, meta) = store.get(&kept, None).await.unwrap();
    assert_eq!(payload, b"persist me");
    assert_eq!(meta.remaining_downloads, 3);

    // the row without a payload is gone and its code is free again
    assert!(!store.exists(&broken).await.unwrap());
    let reclaimed = store
        .put(PutRequest {
            code: Some(broken.clone()),
            ..put_text("rebound")
        })
        .await
        .unwrap();
    assert_eq!(reclaimed, broken);

    // the payload without a row was swept away
    assert!(!files_root.join("zzz").exists());
}

#[tokio::test]
async fn overdue_entries_expire_shortly_after_reopen() {
    let dir = TempDir::new().unwrap();

    let (store, _shutdown) =
        open_at(dir.path(), false, |options| options.min_ttl = Duration::from_secs(1)).await;
    let code = store
        .put(PutRequest {
            ttl: Some("1 sec".to_string()),
            ..put_text("already overdue")
        })
        .await
        .unwrap();
    drop(store);

    tokio::time::sleep(Duration::from_secs(2)).await;

    let (store, _shutdown) =
        open_at(dir.path(), true, |options| options.min_ttl = Duration::from_secs(1)).await;

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(!store.exists(&code).await.unwrap());
}

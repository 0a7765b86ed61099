use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jjop_storage::{FsObjectStore, ObjectMeta, ObjectStore, StoreError};
use jjop_sync::{Lease, LeaseSettings, RemoteDatabase};
use tempfile::TempDir;

const KEY: &str = "jobs/sql/jobs.sqlite";
const BACKUPS: &str = "jobs/sql/backup";

struct Fixture {
    _dir: TempDir,
    store: Arc<FsObjectStore>,
    db: RemoteDatabase,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(FsObjectStore::new(dir.path().join("bucket")));
    let db = RemoteDatabase::new(store.clone(), KEY, dir.path().join("local").join("jobs.sqlite"))
        .with_backup_prefix(Some(BACKUPS.to_string()));
    Fixture { _dir: dir, store, db }
}

async fn backups(store: &FsObjectStore) -> Vec<String> {
    store
        .list(BACKUPS)
        .await
        .expect("list")
        .into_iter()
        .map(|m| m.key)
        .collect()
}

#[tokio::test]
async fn download_then_upload_round_trip_stays_up_to_date() {
    let f = fixture();
    f.store.put(KEY, b"version-1".to_vec()).await.expect("seed");
    assert!(!f.db.is_up_to_date().await);

    f.db.download().await.expect("download");
    assert!(f.db.is_up_to_date().await);
    assert_eq!(tokio::fs::read(f.db.local_path()).await.expect("local"), b"version-1");

    tokio::fs::write(f.db.local_path(), b"version-2").await.expect("modify");
    f.db.upload().await.expect("upload");
    assert!(f.db.is_up_to_date().await);
    assert_eq!(f.store.get(KEY).await.expect("get"), Some(b"version-2".to_vec()));
}

#[tokio::test]
async fn missing_fingerprint_forces_a_download() {
    let f = fixture();
    f.store.put(KEY, b"remote".to_vec()).await.expect("seed");
    tokio::fs::create_dir_all(f.db.local_path().parent().expect("parent"))
        .await
        .expect("mkdir");
    tokio::fs::write(f.db.local_path(), b"remote").await.expect("local copy");
    assert!(!f.db.is_up_to_date().await);
}

#[tokio::test]
async fn backup_only_when_the_key_already_exists() {
    let f = fixture();
    tokio::fs::create_dir_all(f.db.local_path().parent().expect("parent"))
        .await
        .expect("mkdir");

    tokio::fs::write(f.db.local_path(), b"first").await.expect("write");
    let backup = f.db.upload().await.expect("first upload");
    assert_eq!(backup, None);
    assert!(backups(&f.store).await.is_empty());

    tokio::fs::write(f.db.local_path(), b"second").await.expect("write");
    let backup = f.db.upload().await.expect("second upload").expect("backup key");
    let keys = backups(&f.store).await;
    assert_eq!(keys, vec![backup.clone()]);
    assert_eq!(f.store.get(&backup).await.expect("get"), Some(b"first".to_vec()));
    assert_eq!(f.store.get(KEY).await.expect("get"), Some(b"second".to_vec()));
}

#[tokio::test]
async fn failed_body_still_writes_back_partial_progress() {
    let f = fixture();
    f.store.put(KEY, b"before".to_vec()).await.expect("seed");

    let run = f
        .db
        .with_synced_database(|path| async move {
            tokio::fs::write(&path, b"half-done").await?;
            Err::<(), _>(anyhow::anyhow!("import blew up halfway"))
        })
        .await
        .expect("scope");

    assert!(run.output.is_err());
    assert!(run.write_back.is_ok());
    assert_eq!(f.store.get(KEY).await.expect("get"), Some(b"half-done".to_vec()));
    assert_eq!(backups(&f.store).await.len(), 1);
}

#[tokio::test]
async fn first_run_without_remote_uploads_the_new_database() {
    let f = fixture();
    let run = f
        .db
        .with_synced_database(|path| async move {
            tokio::fs::create_dir_all(path.parent().expect("parent")).await?;
            tokio::fs::write(&path, b"fresh").await?;
            Ok(7)
        })
        .await
        .expect("scope");

    assert_eq!(run.output.expect("body"), 7);
    assert_eq!(run.write_back.expect("upload"), None);
    assert_eq!(f.store.get(KEY).await.expect("get"), Some(b"fresh".to_vec()));
}

/// Every remote call fails except `head`, which reports the key as present.
struct BrokenStore;

#[async_trait]
impl ObjectStore for BrokenStore {
    fn describe(&self) -> String {
        "broken://".into()
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Err(StoreError::Status {
            status: 503,
            key: key.into(),
            body: "unavailable".into(),
        })
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        Ok(Some(ObjectMeta {
            key: key.into(),
            etag: "remote-etag".into(),
            size: 10,
            last_modified: None,
        }))
    }

    async fn put(&self, key: &str, _body: Vec<u8>) -> Result<ObjectMeta, StoreError> {
        Err(StoreError::Config(format!("read-only: {key}")))
    }

    async fn copy(&self, _from: &str, to: &str) -> Result<(), StoreError> {
        Err(StoreError::Config(format!("read-only: {to}")))
    }

    async fn delete(&self, _key: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn list(&self, _prefix: &str) -> Result<Vec<ObjectMeta>, StoreError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn download_failure_aborts_before_the_body_runs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = RemoteDatabase::new(Arc::new(BrokenStore), KEY, dir.path().join("jobs.sqlite"));
    let ran = AtomicBool::new(false);

    let result = db
        .with_synced_database(|_| async {
            ran.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await;

    assert!(result.is_err());
    assert!(!ran.load(Ordering::SeqCst));
    assert!(!dir.path().join("jobs.sqlite").exists());
}

#[tokio::test]
async fn live_lease_of_another_owner_blocks_the_run() {
    let f = fixture();
    let other = Lease {
        owner: "someone-else".into(),
        acquired_at: Utc::now(),
        expires_at: Utc::now() + chrono::Duration::hours(1),
    };
    f.store
        .put(&f.db.lease_key(), serde_json::to_vec(&other).expect("json"))
        .await
        .expect("lease");

    let db = f.db.clone().with_lease(Some(LeaseSettings {
        owner: "me".into(),
        ttl: Duration::from_secs(60),
    }));
    let result = db.with_synced_database(|_| async { Ok(()) }).await;
    assert!(result.is_err());
    assert!(f.store.get(KEY).await.expect("get").is_none());
}

#[tokio::test]
async fn expired_lease_is_taken_over_and_released() {
    let f = fixture();
    let stale = Lease {
        owner: "crashed-run".into(),
        acquired_at: Utc::now() - chrono::Duration::hours(5),
        expires_at: Utc::now() - chrono::Duration::hours(3),
    };
    f.store
        .put(&f.db.lease_key(), serde_json::to_vec(&stale).expect("json"))
        .await
        .expect("lease");

    let db = f.db.clone().with_lease(Some(LeaseSettings {
        owner: "me".into(),
        ttl: Duration::from_secs(60),
    }));
    let lease_key = db.lease_key();
    let store = f.store.clone();
    let run = db
        .with_synced_database(|path| async move {
            let held: Lease = serde_json::from_slice(&store.get(&lease_key).await?.expect("lease"))?;
            assert_eq!(held.owner, "me");
            tokio::fs::create_dir_all(path.parent().expect("parent")).await?;
            tokio::fs::write(&path, b"db").await?;
            Ok(())
        })
        .await
        .expect("scope");

    run.output.expect("body");
    run.write_back.expect("upload");
    assert!(f.store.get(&f.db.lease_key()).await.expect("get").is_none());
}

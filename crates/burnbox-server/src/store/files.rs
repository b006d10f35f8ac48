use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::model::SecretRecord;

const RECORD_EXT: &str = "json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("custom name {0:?} is already taken")]
    NameTaken(String),
    #[error("storage i/o: {0}")]
    Io(#[from] io::Error),
    #[error("malformed secret record: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store lock poisoned")]
    LockPoisoned,
}

/// Outcome of the most recent expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub last_run: Option<DateTime<Utc>>,
    pub deleted: usize,
    /// Records that could not be read, parsed or removed.
    pub errors: usize,
}

/// Thread-safe handle to the on-disk secret directory: one `<id>.json` per secret.
///
/// A single reader/writer lock covers all file I/O. Lookups share it; create,
/// delete and the sweep hold it exclusively, so the custom-name check and the
/// write that follows it are atomic within this process.
#[derive(Clone)]
pub struct FileStore {
    inner: Arc<Inner>,
}

struct Inner {
    dir: PathBuf,
    lock: RwLock<()>,
    stats: Mutex<SweepStats>,
}

impl FileStore {
    /// Open (or create) the storage directory at `dir`.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o750))?;
        }
        Ok(Self {
            inner: Arc::new(Inner {
                dir: dir.to_owned(),
                lock: RwLock::new(()),
                stats: Mutex::new(SweepStats::default()),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Persist a new record. Fails with [`StoreError::NameTaken`] when another
    /// unexpired record already holds the same custom name.
    pub fn create(&self, record: &SecretRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock()?;

        if let Some(name) = record.custom_name.as_deref() {
            let now = Utc::now();
            let taken = self
                .scan()?
                .into_iter()
                .any(|r| r.id != record.id && r.has_name(name) && !r.is_expired(now));
            if taken {
                return Err(StoreError::NameTaken(name.to_owned()));
            }
        }

        self.write_record(record)?;
        debug!(id = %record.id, "stored secret");
        Ok(())
    }

    /// Fetch a record by id. Absent records are `Ok(None)`; nothing is deleted here.
    pub fn get_by_id(&self, id: &Uuid) -> Result<Option<SecretRecord>, StoreError> {
        let _guard = self.read_lock()?;
        match fs::read(self.path_for(id)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Linear scan for a record carrying `name`. An unexpired holder wins over
    /// an expired one, so a stale record never shadows a live alias.
    pub fn get_by_custom_name(&self, name: &str) -> Result<Option<SecretRecord>, StoreError> {
        let _guard = self.read_lock()?;
        let now = Utc::now();
        let mut expired_match = None;
        for record in self.scan()? {
            if !record.has_name(name) {
                continue;
            }
            if !record.is_expired(now) {
                return Ok(Some(record));
            }
            expired_match.get_or_insert(record);
        }
        Ok(expired_match)
    }

    /// Remove a record. Returns whether this call removed it; a missing record
    /// is not an error.
    pub fn delete(&self, id: &Uuid) -> Result<bool, StoreError> {
        let _guard = self.write_lock()?;
        match fs::remove_file(self.path_for(id)) {
            Ok(()) => {
                debug!(id = %id, "deleted secret");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every record whose expiry has passed. Unreadable records and
    /// failed removals are logged and counted, never fatal.
    pub fn sweep_expired(&self) -> Result<SweepStats, StoreError> {
        let now = Utc::now();
        let mut stats = SweepStats {
            last_run: Some(now),
            ..SweepStats::default()
        };

        {
            let _guard = self.write_lock()?;
            for path in self.record_paths()? {
                let record = match read_record(&path) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(file = %path.display(), error = %e, "skipping unreadable secret record");
                        stats.errors += 1;
                        continue;
                    }
                };
                if !record.is_expired(now) {
                    continue;
                }
                match fs::remove_file(&path) {
                    Ok(()) => stats.deleted += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        error!(file = %path.display(), error = %e, "failed to delete expired secret");
                        stats.errors += 1;
                    }
                }
            }
        }

        *self.inner.stats.lock().map_err(|_| StoreError::LockPoisoned)? = stats;
        if stats.deleted > 0 || stats.errors > 0 {
            info!(deleted = stats.deleted, errors = stats.errors, "swept expired secrets");
        } else {
            debug!("sweep found no expired secrets");
        }
        Ok(stats)
    }

    /// Statistics from the most recent sweep.
    pub fn stats(&self) -> SweepStats {
        self.inner
            .stats
            .lock()
            .map(|s| *s)
            .unwrap_or_default()
    }

    /// Spawn a background Tokio task that sweeps every `interval`.
    ///
    /// When `shutdown` flips to `true` (or its sender is dropped) the task runs
    /// one final sweep and exits. A sweep already in progress always finishes.
    pub fn spawn_sweep(self, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "starting expiry sweep");
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_expired() {
                            warn!(error = %e, "background sweep error");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("expiry sweep shutting down, running final sweep");
            if let Err(e) = self.sweep_expired() {
                error!(error = %e, "final sweep failed");
            }
        })
    }

    fn read_lock(&self) -> Result<RwLockReadGuard<'_, ()>, StoreError> {
        self.inner.lock.read().map_err(|_| StoreError::LockPoisoned)
    }

    fn write_lock(&self) -> Result<RwLockWriteGuard<'_, ()>, StoreError> {
        self.inner.lock.write().map_err(|_| StoreError::LockPoisoned)
    }

    fn path_for(&self, id: &Uuid) -> PathBuf {
        self.inner.dir.join(format!("{id}.{RECORD_EXT}"))
    }

    /// Paths of all `<uuid>.json` files. Temp files and strays are ignored.
    fn record_paths(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.inner.dir)? {
            let path = entry?.path();
            let is_record = path.extension().is_some_and(|ext| ext == RECORD_EXT)
                && path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .is_some_and(|s| Uuid::parse_str(s).is_ok());
            if is_record && path.is_file() {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    /// Every readable record. Caller holds the lock.
    fn scan(&self) -> Result<Vec<SecretRecord>, StoreError> {
        let mut records = Vec::new();
        for path in self.record_paths()? {
            match read_record(&path) {
                Ok(r) => records.push(r),
                Err(e) => debug!(file = %path.display(), error = %e, "skipping unreadable record"),
            }
        }
        Ok(records)
    }

    /// Write to a temp file and rename, so readers never see a partial record.
    fn write_record(&self, record: &SecretRecord) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(record)?;
        let tmp = self.inner.dir.join(format!(".{}.{RECORD_EXT}.tmp", record.id));

        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let mut file = opts.open(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        if let Err(e) = fs::rename(&tmp, self.path_for(&record.id)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

fn read_record(path: &Path) -> Result<SecretRecord, StoreError> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::tempdir;

    fn make_store() -> (FileStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = FileStore::open(&dir.path().join("secrets")).unwrap();
        (store, dir)
    }

    fn record(name: Option<&str>, expires_in: Option<ChronoDuration>) -> SecretRecord {
        let now = Utc::now();
        SecretRecord {
            id: Uuid::new_v4(),
            custom_name: name.map(str::to_owned),
            created_at: now,
            expires_at: expires_in.map(|d| now + d),
            is_burn_after_reading: false,
            server_encrypted: false,
            encrypted_payload: b"enc.salt.iv".to_vec(),
        }
    }

    #[test]
    fn create_get_delete() {
        let (s, _dir) = make_store();
        let r = record(Some("hello"), Some(ChronoDuration::minutes(10)));
        s.create(&r).unwrap();

        assert_eq!(s.get_by_id(&r.id).unwrap(), Some(r.clone()));
        assert_eq!(s.get_by_custom_name("hello").unwrap(), Some(r.clone()));
        assert!(s.delete(&r.id).unwrap());
        assert_eq!(s.get_by_id(&r.id).unwrap(), None);
        assert_eq!(s.get_by_custom_name("hello").unwrap(), None);
    }

    #[test]
    fn delete_is_idempotent() {
        let (s, _dir) = make_store();
        let r = record(None, None);
        s.create(&r).unwrap();
        assert!(s.delete(&r.id).unwrap());
        assert!(!s.delete(&r.id).unwrap());
        assert!(!s.delete(&Uuid::new_v4()).unwrap());
    }

    #[test]
    fn one_file_per_secret_named_by_id() {
        let (s, _dir) = make_store();
        let r = record(None, None);
        s.create(&r).unwrap();

        let names: Vec<String> = fs::read_dir(s.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![format!("{}.json", r.id)]);
    }

    #[cfg(unix)]
    #[test]
    fn record_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let (s, _dir) = make_store();
        let r = record(None, None);
        s.create(&r).unwrap();
        let mode = fs::metadata(s.path_for(&r.id)).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn name_taken_by_active_secret() {
        let (s, _dir) = make_store();
        s.create(&record(Some("dup"), Some(ChronoDuration::hours(1)))).unwrap();
        let err = s
            .create(&record(Some("dup"), Some(ChronoDuration::hours(1))))
            .unwrap_err();
        assert!(matches!(err, StoreError::NameTaken(n) if n == "dup"));

        // Distinct or absent names never conflict.
        s.create(&record(Some("other"), None)).unwrap();
        s.create(&record(None, None)).unwrap();
        s.create(&record(None, None)).unwrap();
    }

    #[test]
    fn expired_holder_frees_the_name() {
        let (s, _dir) = make_store();
        let stale = record(Some("reuse"), Some(ChronoDuration::seconds(-5)));
        s.create(&stale).unwrap();

        let fresh = record(Some("reuse"), Some(ChronoDuration::hours(1)));
        s.create(&fresh).unwrap();
        assert_eq!(s.get_by_custom_name("reuse").unwrap(), Some(fresh));
    }

    #[test]
    fn lookup_by_name_returns_expired_holder_when_alone() {
        let (s, _dir) = make_store();
        let stale = record(Some("gone"), Some(ChronoDuration::seconds(-5)));
        s.create(&stale).unwrap();
        assert_eq!(s.get_by_custom_name("gone").unwrap(), Some(stale));
    }

    #[test]
    fn concurrent_creates_with_same_name_admit_exactly_one() {
        let (s, _dir) = make_store();
        let results: Vec<Result<(), StoreError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let s = s.clone();
                    scope.spawn(move || s.create(&record(Some("race"), Some(ChronoDuration::hours(1)))))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let ok = results.iter().filter(|r| r.is_ok()).count();
        let taken = results
            .iter()
            .filter(|r| matches!(r, Err(StoreError::NameTaken(_))))
            .count();
        assert_eq!(ok, 1);
        assert_eq!(taken, 7);
    }

    #[test]
    fn sweep_removes_only_expired() {
        let (s, _dir) = make_store();
        let dead = record(None, Some(ChronoDuration::seconds(-1)));
        let live = record(None, Some(ChronoDuration::hours(1)));
        let forever = record(None, None);
        for r in [&dead, &live, &forever] {
            s.create(r).unwrap();
        }

        // Still retrievable until a sweep runs.
        assert!(s.get_by_id(&dead.id).unwrap().is_some());

        let stats = s.sweep_expired().unwrap();
        assert_eq!(stats.deleted, 1);
        assert_eq!(stats.errors, 0);
        assert!(stats.last_run.is_some());
        assert_eq!(s.stats(), stats);

        assert!(s.get_by_id(&dead.id).unwrap().is_none());
        assert!(s.get_by_id(&live.id).unwrap().is_some());
        assert!(s.get_by_id(&forever.id).unwrap().is_some());
    }

    #[test]
    fn sweep_with_nothing_expired_deletes_nothing() {
        let (s, _dir) = make_store();
        s.create(&record(None, Some(ChronoDuration::hours(1)))).unwrap();
        let stats = s.sweep_expired().unwrap();
        assert_eq!(stats.deleted, 0);
        assert_eq!(stats.errors, 0);
    }

    #[test]
    fn sweep_skips_corrupt_records() {
        let (s, _dir) = make_store();
        let dead = record(None, Some(ChronoDuration::seconds(-1)));
        s.create(&dead).unwrap();
        let corrupt = s.path_for(&Uuid::new_v4());
        fs::write(&corrupt, b"{not json").unwrap();

        let stats = s.sweep_expired().unwrap();
        assert_eq!(stats.deleted, 1);
        assert_eq!(stats.errors, 1);
        assert!(corrupt.exists());
    }

    #[test]
    fn stray_files_are_ignored() {
        let (s, _dir) = make_store();
        fs::write(s.dir().join("README.txt"), b"hi").unwrap();
        fs::write(s.dir().join("not-a-uuid.json"), b"{}").unwrap();
        let stats = s.sweep_expired().unwrap();
        assert_eq!(stats.errors, 0);
        assert_eq!(s.get_by_custom_name("anything").unwrap(), None);
    }

    #[tokio::test]
    async fn background_sweep_runs_final_pass_on_shutdown() {
        let (s, _dir) = make_store();
        let (tx, rx) = watch::channel(false);
        let handle = s.clone().spawn_sweep(Duration::from_secs(3600), rx);

        let dead = record(None, Some(ChronoDuration::seconds(-1)));
        s.create(&dead).unwrap();

        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(s.get_by_id(&dead.id).unwrap().is_none());
        assert_eq!(s.stats().deleted, 1);
    }
}

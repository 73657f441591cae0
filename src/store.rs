use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sqlx::SqlitePool;
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::fs;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::access::{AccessError, AccessGate};
use crate::codes::{CodeAllocator, CodeError};
use crate::expiry::ExpiryScheduler;
use crate::ttl::{self, TtlError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no entry is bound to this code")]
    NotFound,
    #[error("key does not match")]
    KeyMismatch,
    #[error("code is already bound to an entry")]
    CodeInUse,
    #[error("code must be {expected} lowercase letters or digits")]
    InvalidCode { expected: usize },
    #[error("all codes are in use")]
    CodesExhausted,
    #[error("invalid lifetime: {0}")]
    InvalidTtl(#[from] TtlError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("key hashing error: {0}")]
    Access(#[from] AccessError),
    #[error("stored expiry timestamp is invalid: {0}")]
    TimestampParse(#[from] time::error::Parse),
    #[error("expiry timestamp could not be formatted: {0}")]
    TimestampFormat(#[from] time::error::Format),
}

/// Knobs for a store instance.
pub struct StoreOptions {
    pub root: PathBuf,
    pub code_length: usize,
    pub max_downloads: u32,
    pub default_ttl: String,
    pub min_ttl: Duration,
    pub max_ttl: Duration,
    pub gate: AccessGate,
}

impl StoreOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            code_length: 3,
            max_downloads: 3,
            default_ttl: ttl::DEFAULT_TTL.to_string(),
            min_ttl: ttl::MIN_TTL,
            max_ttl: ttl::MAX_TTL,
            gate: AccessGate::default(),
        }
    }
}

/// Everything the store needs to create an entry.
#[derive(Debug, Clone, Default)]
pub struct PutRequest {
    /// Caller-chosen code; allocated when absent.
    pub code: Option<String>,
    pub payload: Vec<u8>,
    pub content_type: String,
    pub filename: String,
    /// Plaintext retrieval key; only its hash is stored.
    pub key: Option<String>,
    /// Requested download count, clamped into `[1, max_downloads]`.
    pub downloads: Option<u32>,
    /// Requested lifetime phrase; the configured default when absent.
    pub ttl: Option<String>,
}

/// Entry metadata as it stood before the fetch that returned it.
#[derive(Debug, Clone)]
pub struct EntryMeta {
    pub content_type: String,
    pub filename: String,
    pub remaining_downloads: u32,
    pub expires_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct EntryRow {
    code: String,
    content_type: String,
    filename: String,
    key: Option<String>,
    n: i64,
    time: String,
}

impl EntryRow {
    fn expires_at(&self) -> Result<OffsetDateTime, StoreError> {
        Ok(OffsetDateTime::parse(&self.time, &Rfc3339)?)
    }

    fn meta(&self) -> Result<EntryMeta, StoreError> {
        Ok(EntryMeta {
            content_type: self.content_type.clone(),
            filename: self.filename.clone(),
            remaining_downloads: self.n.max(0) as u32,
            expires_at: self.expires_at()?,
        })
    }
}

/// The ephemeral content store.
///
/// Owns the two persisted artifacts of every entry (a raw payload file
/// named by the code, and a metadata row), the code bookkeeping, and the
/// expiry timers. Every mutation of a single code's entry goes through that
/// code's async mutex, so a download counter can never be spent twice and
/// no fetch can complete against an entry another path already deleted.
pub struct ContentStore {
    pool: SqlitePool,
    root: PathBuf,
    allocator: Mutex<CodeAllocator>,
    // per-code serialization points; bounded by the keyspace, never pruned
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    scheduler: ExpiryScheduler,
    gate: AccessGate,
    max_downloads: u32,
    default_ttl: String,
    min_ttl: Duration,
    max_ttl: Duration,
}

impl ContentStore {
    /// Open a store over its persisted state and re-arm every surviving
    /// entry's expiry. Half-written leftovers (rows without a payload file,
    /// payload files without a row) are purged so the code/entry pairing is
    /// exact before the first request is served.
    pub async fn open(
        pool: SqlitePool,
        options: StoreOptions,
        scheduler: ExpiryScheduler,
    ) -> Result<Self, StoreError> {
        fs::create_dir_all(&options.root).await?;

        let store = Self {
            pool,
            root: options.root,
            allocator: Mutex::new(CodeAllocator::new(options.code_length)),
            locks: Mutex::new(HashMap::new()),
            scheduler,
            gate: options.gate,
            max_downloads: options.max_downloads.max(1),
            default_ttl: options.default_ttl,
            min_ttl: options.min_ttl,
            max_ttl: options.max_ttl,
        };

        store.reconcile().await?;

        Ok(store)
    }

    /// Create an entry and return the code it is bound to.
    pub async fn put(&self, request: PutRequest) -> Result<String, StoreError> {
        let now = OffsetDateTime::now_utc();
        let requested = match request.ttl.as_deref() {
            Some(raw) => ttl::parse_ttl(raw)?,
            None => ttl::parse_ttl(&self.default_ttl)?,
        };
        let expires_at = ttl::clamp_expiry(now, requested, self.min_ttl, self.max_ttl);
        let downloads = request.downloads.unwrap_or(1).clamp(1, self.max_downloads);
        let filename = sanitize_filename(&request.filename);

        // Hash before touching the code pool; hashing is slow and must not
        // hold a reservation hostage.
        let key_hash = match request.key.as_deref().filter(|key| !key.is_empty()) {
            Some(key) => Some(self.gate.hash(key).await?),
            None => None,
        };

        let code = match request.code.as_deref() {
            Some(raw) => {
                let code = raw.trim().to_ascii_lowercase();
                self.allocator.lock().reserve(&code)?;
                code
            }
            None => self.allocator.lock().allocate()?,
        };

        // Hold the code's lock across persist + schedule so a consumer that
        // drains the entry right away cannot interleave with the timer
        // arming and leave a stale deadline behind.
        let lock = self.lock_for(&code);
        let _guard = lock.lock().await;

        if let Err(err) = self
            .persist_new_entry(
                &code,
                &request.payload,
                &request.content_type,
                &filename,
                key_hash.as_deref(),
                downloads,
                expires_at,
            )
            .await
        {
            // a failed write must not leave the code marked live
            let _ = fs::remove_file(self.payload_path(&code)).await;
            self.allocator.lock().release(&code);
            return Err(err);
        }

        self.scheduler.schedule(&code, expires_at);

        info!(
            target: "store",
            code = %code,
            downloads,
            expires_at = %expires_at,
            size = request.payload.len(),
            "entry stored"
        );

        Ok(code)
    }

    /// Fetch an entry's payload and spend one download.
    ///
    /// The returned payload and metadata reflect the entry as it stood
    /// before the decrement; when the counter hits zero the entry is fully
    /// gone before this returns.
    pub async fn get(
        &self,
        code: &str,
        key: Option<&str>,
    ) -> Result<(Vec<u8>, EntryMeta), StoreError> {
        let Some(code) = self.normalize_code(code) else {
            return Err(StoreError::NotFound);
        };

        let lock = self.lock_for(&code);
        let _guard = lock.lock().await;

        let Some(row) = self.load_row(&code).await? else {
            return Err(StoreError::NotFound);
        };

        if let Some(stored_hash) = row.key.as_deref() {
            let presented = key.unwrap_or("");
            if !self.gate.verify(presented, stored_hash).await? {
                debug!(target: "store", code = %code, "fetch rejected: key mismatch");
                return Err(StoreError::KeyMismatch);
            }
        }

        let payload = fs::read(self.payload_path(&code)).await?;
        let meta = row.meta()?;

        let remaining = row.n - 1;
        if remaining <= 0 {
            self.remove_entry(&code).await?;
            info!(target: "store", code = %code, "entry consumed and removed");
        } else {
            sqlx::query("UPDATE entries SET n = ? WHERE code = ?")
                .bind(remaining)
                .bind(&code)
                .execute(&self.pool)
                .await?;
            debug!(target: "store", code = %code, remaining, "download spent");
        }

        Ok((payload, meta))
    }

    /// Whether the code is currently bound to an entry.
    pub async fn exists(&self, code: &str) -> Result<bool, StoreError> {
        let Some(code) = self.normalize_code(code) else {
            return Ok(false);
        };

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entries WHERE code = ?")
            .bind(&code)
            .fetch_one(&self.pool)
            .await?;

        Ok(count > 0)
    }

    /// Remove an entry, its pending expiry and its code binding. Idempotent;
    /// deleting an absent code is a no-op.
    pub async fn delete(&self, code: &str) -> Result<(), StoreError> {
        let Some(code) = self.normalize_code(code) else {
            return Ok(());
        };

        let lock = self.lock_for(&code);
        let _guard = lock.lock().await;

        if self.remove_entry(&code).await? {
            info!(target: "store", code = %code, "entry deleted");
        }

        Ok(())
    }

    /// Scheduler entry point: delete the entry behind a fired timer.
    ///
    /// A firing that lost the race against counter-exhaustion deletion finds
    /// no row and does nothing. A firing that observes a code already
    /// re-bound to a fresh entry (whose expiry lies in the future) also does
    /// nothing; the fresh entry's own timer is armed separately.
    pub(crate) async fn expire(&self, code: &str) {
        match self.try_expire(code).await {
            Ok(true) => info!(target: "expiry", code = %code, "entry expired"),
            Ok(false) => debug!(target: "expiry", code = %code, "expiry fired for an entry already gone"),
            Err(err) => warn!(target: "expiry", code = %code, %err, "failed to expire entry"),
        }
    }

    async fn try_expire(&self, code: &str) -> Result<bool, StoreError> {
        let lock = self.lock_for(code);
        let _guard = lock.lock().await;

        let Some(row) = self.load_row(code).await? else {
            return Ok(false);
        };
        if row.expires_at()? > OffsetDateTime::now_utc() {
            return Ok(false);
        }

        self.remove_entry(code).await?;
        Ok(true)
    }

    /// Rebuild in-memory bookkeeping from persisted state.
    async fn reconcile(&self) -> Result<(), StoreError> {
        let rows: Vec<EntryRow> =
            sqlx::query_as("SELECT code, content_type, filename, key, n, time FROM entries")
                .fetch_all(&self.pool)
                .await?;

        let now = OffsetDateTime::now_utc();
        let mut restored = 0usize;

        for row in rows {
            let payload_present = fs::try_exists(self.payload_path(&row.code))
                .await
                .unwrap_or(false);
            let expires_at = row.expires_at().ok();

            let usable = payload_present
                && expires_at.is_some()
                && row.n > 0
                && self.allocator.lock().reserve(&row.code).is_ok();

            if !usable {
                warn!(target: "store", code = %row.code, "purging unusable entry found at startup");
                sqlx::query("DELETE FROM entries WHERE code = ?")
                    .bind(&row.code)
                    .execute(&self.pool)
                    .await?;
                let _ = fs::remove_file(self.payload_path(&row.code)).await;
                continue;
            }

            // overdue entries are scheduled a moment out, never skipped
            let fire_at = expires_at
                .unwrap_or(now)
                .max(now + time::Duration::seconds(1));
            self.scheduler.schedule(&row.code, fire_at);
            restored += 1;
        }

        // payload files whose row is gone are unreachable; drop them
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(dirent) = dir.next_entry().await? {
            let name = dirent.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let (valid, live) = {
                let allocator = self.allocator.lock();
                (allocator.is_valid_format(name), allocator.is_live(name))
            };
            if valid && !live {
                warn!(target: "store", code = %name, "removing orphaned payload found at startup");
                let _ = fs::remove_file(dirent.path()).await;
            }
        }

        info!(target: "store", entries = restored, "content store reconciled with persisted state");

        Ok(())
    }

    async fn persist_new_entry(
        &self,
        code: &str,
        payload: &[u8],
        content_type: &str,
        filename: &str,
        key_hash: Option<&str>,
        downloads: u32,
        expires_at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let time_text = expires_at.format(&Rfc3339)?;

        fs::write(self.payload_path(code), payload).await?;

        sqlx::query(
            r#"
            INSERT INTO entries (code, content_type, filename, key, n, time)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(code)
        .bind(content_type)
        .bind(filename)
        .bind(key_hash)
        .bind(downloads as i64)
        .bind(&time_text)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Drop both artifacts, disarm the timer and free the code. Must run
    /// under the code's lock. Returns whether an entry was actually there.
    async fn remove_entry(&self, code: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM entries WHERE code = ?")
            .bind(code)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        self.scheduler.cancel(code);

        match fs::remove_file(self.payload_path(code)).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(target: "store", code = %code, "payload already absent on disk");
            }
            Err(err) => {
                // the row is gone, so the payload is unreachable either way;
                // a startup scan removes it if it survives until then
                warn!(target: "store", code = %code, %err, "failed to remove payload from disk");
            }
        }

        self.allocator.lock().release(code);

        Ok(true)
    }

    async fn load_row(&self, code: &str) -> Result<Option<EntryRow>, StoreError> {
        let row = sqlx::query_as::<_, EntryRow>(
            "SELECT code, content_type, filename, key, n, time FROM entries WHERE code = ?",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    fn lock_for(&self, code: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        locks.entry(code.to_string()).or_default().clone()
    }

    fn normalize_code(&self, raw: &str) -> Option<String> {
        let code = raw.trim().to_ascii_lowercase();
        self.allocator
            .lock()
            .is_valid_format(&code)
            .then_some(code)
    }

    fn payload_path(&self, code: &str) -> PathBuf {
        self.root.join(code)
    }
}

/// Keep only the final path segment of an uploader-sent filename.
fn sanitize_filename(raw: &str) -> String {
    const FALLBACK: &str = "upload.bin";

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return FALLBACK.to_string();
    }

    let candidate = Path::new(trimmed)
        .file_name()
        .and_then(|segment| segment.to_str())
        .unwrap_or(FALLBACK);

    let cleaned: String = candidate.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return FALLBACK.to_string();
    }

    cleaned.chars().take(255).collect()
}

impl From<CodeError> for StoreError {
    fn from(err: CodeError) -> Self {
        match err {
            CodeError::InvalidFormat { expected } => StoreError::InvalidCode { expected },
            CodeError::AlreadyInUse => StoreError::CodeInUse,
            CodeError::Exhausted => StoreError::CodesExhausted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames_lose_their_path_components() {
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("/etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("dir/sub/note.txt"), "note.txt");
        assert_eq!(sanitize_filename("  "), "upload.bin");
        assert_eq!(sanitize_filename("\u{7}"), "upload.bin");
    }
}

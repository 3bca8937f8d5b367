//! Durable, tamper-evident audit log.
//!
//! Append-only JSONL segments with hash chaining: each record commits to the
//! previous one via `sha256(previousHash || canonical_json(entry))`, and a
//! record only counts once its write-ahead line and segment line are on disk.
//! A single writer task serializes appends; callers that need the durability
//! guarantee await the commit.
//!
//! On-disk layout under the audit root (mode 0700):
//!
//! ```text
//! current.jsonl          active segment
//! archive/<ts>.jsonl     rotated segments
//! integrity/last.hash    final hash of the most recently rotated segment
//! wal.jsonl              write-ahead journal
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::AuditConfig;
use crate::crypto::{self, CryptoError, GENESIS_HASH};
use crate::utils::paths;

mod entry;
/// Secret scrubbing applied to payloads before hashing.
pub mod redact;

pub use entry::{AuditEntry, AuditKind, CredentialOperation, credential_access_data};

const ACTIVE_FILE: &str = "current.jsonl";
const ARCHIVE_DIR: &str = "archive";
const INTEGRITY_DIR: &str = "integrity";
const LAST_HASH_FILE: &str = "last.hash";
const WAL_FILE: &str = "wal.jsonl";

/// Bounded depth of the writer queue; absorbs bursts without letting a stuck
/// disk grow memory unboundedly.
const QUEUE_DEPTH: usize = 256;

/// Audit subsystem errors.
#[derive(Debug, Error)]
pub enum AuditError {
    /// File or fsync error.
    #[error("audit i/o error")]
    Io(#[from] std::io::Error),

    /// (De)serialization failed.
    #[error("audit serialization error")]
    Serialize(#[from] serde_json::Error),

    /// Canonicalization/hashing failed.
    #[error("audit hashing error")]
    Crypto(#[from] CryptoError),

    /// The writer task is gone; the broker must not continue appending.
    #[error("audit writer is not running")]
    Closed,
}

/// One write-ahead journal line.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WalRecord {
    Pending { entry: AuditEntry },
    Committed { id: String },
}

/// A single problem found by verification.
#[derive(Debug, Clone)]
pub struct IntegrityError {
    /// Segment file name.
    pub segment: String,
    /// Zero-based entry index within the segment.
    pub index: usize,
    /// Human-readable description including both hashes where applicable.
    pub detail: String,
}

/// Result of walking the chain.
#[derive(Debug, Clone)]
pub struct VerifyReport {
    /// True when no errors were found.
    pub valid: bool,
    /// All collected mismatches, in walk order.
    pub errors: Vec<IntegrityError>,
    /// Entries visited.
    pub entry_count: u64,
    /// The chain tail after the walk.
    pub final_hash: String,
}

/// Filter for [`AuditLogger::get_entries`].
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    /// Only entries of this kind.
    pub kind: Option<AuditKind>,
    /// Only entries for this session.
    pub session_id: Option<String>,
    /// Skip this many matching entries.
    pub offset: usize,
    /// Return at most this many entries.
    pub limit: Option<usize>,
}

/// Writer-side counters.
#[derive(Debug, Clone)]
pub struct AuditStats {
    /// Entries in the active segment.
    pub entry_count: u64,
    /// Current chain tail.
    pub last_hash: String,
}

enum WriterJob {
    Append {
        kind: AuditKind,
        session_id: String,
        agent_id: String,
        data: serde_json::Value,
        reply: Option<oneshot::Sender<Result<AuditEntry, AuditError>>>,
    },
    Rotate {
        reply: oneshot::Sender<Result<PathBuf, AuditError>>,
    },
    Stats {
        reply: oneshot::Sender<AuditStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the audit log. Cheap to clone; all clones feed one writer.
#[derive(Debug, Clone)]
pub struct AuditLogger {
    inner: Option<Arc<LoggerInner>>,
}

#[derive(Debug)]
struct LoggerInner {
    tx: mpsc::Sender<WriterJob>,
    dir: PathBuf,
    stopping: AtomicBool,
    writer_exited: CancellationToken,
}

impl AuditLogger {
    /// A logger that records nothing and returns `None` from `append`.
    #[must_use]
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Whether appends reach disk.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Create the directory tree, replay the journal, recover the chain tail,
    /// and start the writer task.
    pub async fn initialize(config: &AuditConfig) -> Result<Self, AuditError> {
        if !config.enabled {
            return Ok(Self::disabled());
        }

        let dir = config.dir.clone();
        paths::create_private_dir(&dir)?;
        paths::create_private_dir(&dir.join(ARCHIVE_DIR))?;
        paths::create_private_dir(&dir.join(INTEGRITY_DIR))?;

        let state = WriterState::recover(dir.clone()).await?;
        tracing::info!(
            dir = %dir.display(),
            entries = state.entry_count,
            "audit log ready"
        );

        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let writer_exited = CancellationToken::new();
        let exit_token = writer_exited.clone();
        tokio::spawn(async move {
            // The guard cancels the token even if the writer panics, so the
            // broker can notice the loss of durability and shut down.
            let _guard = exit_token.drop_guard();
            writer_loop(state, rx).await;
        });

        Ok(Self {
            inner: Some(Arc::new(LoggerInner {
                tx,
                dir,
                stopping: AtomicBool::new(false),
                writer_exited,
            })),
        })
    }

    /// Append one entry and wait for it to commit.
    ///
    /// Returns `Ok(None)` when the logger is disabled.
    pub async fn append(
        &self,
        kind: AuditKind,
        session_id: &str,
        agent_id: &str,
        data: serde_json::Value,
    ) -> Result<Option<AuditEntry>, AuditError> {
        let Some(inner) = &self.inner else {
            return Ok(None);
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        inner
            .tx
            .send(WriterJob::Append {
                kind,
                session_id: session_id.to_owned(),
                agent_id: agent_id.to_owned(),
                data,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| AuditError::Closed)?;

        let entry = reply_rx.await.map_err(|_| AuditError::Closed)??;
        Ok(Some(entry))
    }

    /// Best-effort append that never blocks the caller.
    ///
    /// Used for entries emitted on cancellation paths where nothing can await
    /// the commit. Failures are logged and swallowed.
    pub fn append_background(
        &self,
        kind: AuditKind,
        session_id: &str,
        agent_id: &str,
        data: serde_json::Value,
    ) {
        let Some(inner) = &self.inner else { return };
        let job = WriterJob::Append {
            kind,
            session_id: session_id.to_owned(),
            agent_id: agent_id.to_owned(),
            data,
            reply: None,
        };
        if let Err(err) = inner.tx.try_send(job) {
            tracing::warn!(error = %err, "dropping best-effort audit entry");
        }
    }

    /// Archive the active segment and start a fresh one chained from its
    /// final hash. Returns the archive path, or `None` when disabled.
    pub async fn rotate(&self) -> Result<Option<PathBuf>, AuditError> {
        let Some(inner) = &self.inner else {
            return Ok(None);
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        inner
            .tx
            .send(WriterJob::Rotate { reply: reply_tx })
            .await
            .map_err(|_| AuditError::Closed)?;
        Ok(Some(reply_rx.await.map_err(|_| AuditError::Closed)??))
    }

    /// Writer counters, or `None` when disabled.
    pub async fn stats(&self) -> Result<Option<AuditStats>, AuditError> {
        let Some(inner) = &self.inner else {
            return Ok(None);
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        inner
            .tx
            .send(WriterJob::Stats { reply: reply_tx })
            .await
            .map_err(|_| AuditError::Closed)?;
        reply_rx.await.map(Some).map_err(|_| AuditError::Closed)
    }

    /// Drain the queue, flush, and join the writer. Safe to call repeatedly.
    pub async fn stop(&self) {
        let Some(inner) = &self.inner else { return };
        if inner.stopping.swap(true, Ordering::SeqCst) {
            inner.writer_exited.cancelled().await;
            return;
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        if inner
            .tx
            .send(WriterJob::Shutdown { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
        inner.writer_exited.cancelled().await;
    }

    /// Token cancelled when the writer task exits. While [`Self::stop`] has
    /// not been called, a cancellation means the writer died: the broker must
    /// treat that as fatal rather than keep serving without durability.
    #[must_use]
    pub fn writer_exited(&self) -> Option<CancellationToken> {
        self.inner.as_ref().map(|i| i.writer_exited.clone())
    }

    /// Whether [`Self::stop`] has been requested.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|i| i.stopping.load(Ordering::SeqCst))
    }

    /// Walk every segment recomputing the chain.
    pub fn verify_integrity(&self) -> Result<VerifyReport, AuditError> {
        match &self.inner {
            Some(inner) => verify_directory(&inner.dir),
            None => Ok(VerifyReport {
                valid: true,
                errors: Vec::new(),
                entry_count: 0,
                final_hash: GENESIS_HASH.to_owned(),
            }),
        }
    }

    /// Read-only filtered view over archive plus active segments.
    pub fn get_entries(&self, filter: &EntryFilter) -> Result<Vec<AuditEntry>, AuditError> {
        let Some(inner) = &self.inner else {
            return Ok(Vec::new());
        };
        let entries = load_entries(&inner.dir)?;
        Ok(entries
            .into_iter()
            .filter(|e| filter.kind.is_none_or(|k| e.kind == k))
            .filter(|e| {
                filter
                    .session_id
                    .as_deref()
                    .is_none_or(|s| e.session_id == s)
            })
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect())
    }

    /// The last `n` entries across all segments.
    pub fn tail(&self, n: usize) -> Result<Vec<AuditEntry>, AuditError> {
        let Some(inner) = &self.inner else {
            return Ok(Vec::new());
        };
        let entries = load_entries(&inner.dir)?;
        let skip = entries.len().saturating_sub(n);
        Ok(entries.into_iter().skip(skip).collect())
    }
}

/// Recompute `hash` for an entry from its other fields.
fn hash_for_entry(entry: &AuditEntry) -> Result<String, AuditError> {
    let mut value = serde_json::to_value(entry)?;
    if let Some(obj) = value.as_object_mut() {
        obj.remove("hash");
    }
    let bytes = crypto::canonical_json(&value)?;
    Ok(crypto::chained_hash(&bytes, &entry.previous_hash))
}

struct WriterState {
    dir: PathBuf,
    active_path: PathBuf,
    wal_path: PathBuf,
    active: tokio::fs::File,
    wal: tokio::fs::File,
    entry_count: u64,
    last_hash: String,
    last_timestamp: DateTime<Utc>,
}

async fn open_append(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

async fn open_truncated(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await
}

impl WriterState {
    async fn recover(dir: PathBuf) -> Result<Self, AuditError> {
        let active_path = dir.join(ACTIVE_FILE);
        let wal_path = dir.join(WAL_FILE);

        Self::replay_wal(&active_path, &wal_path).await?;

        // Scan the active segment for the chain tail.
        let mut entry_count = 0u64;
        let mut first_prev: Option<String> = None;
        let mut tail_hash: Option<String> = None;
        let mut last_timestamp = DateTime::<Utc>::UNIX_EPOCH;
        if tokio::fs::try_exists(&active_path).await? {
            let content = tokio::fs::read_to_string(&active_path).await?;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<AuditEntry>(line) {
                    Ok(entry) => {
                        entry_count += 1;
                        if first_prev.is_none() {
                            first_prev = Some(entry.previous_hash.clone());
                        }
                        tail_hash = Some(entry.hash.clone());
                        last_timestamp = entry.timestamp;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "skipping corrupt audit line during recovery");
                    }
                }
            }
        }

        let anchor_path = dir.join(INTEGRITY_DIR).join(LAST_HASH_FILE);
        let anchor = match tokio::fs::read_to_string(&anchor_path).await {
            Ok(raw) => {
                let trimmed = raw.trim().to_owned();
                (!trimmed.is_empty()).then_some(trimmed)
            }
            Err(_) => None,
        };

        // The first active entry must chain from the rotated anchor. The
        // source of truth is the segment; a disagreement is surfaced loudly
        // but does not refuse startup.
        if let (Some(first), Some(anchor)) = (first_prev.as_ref(), anchor.as_ref()) {
            if first != anchor {
                tracing::warn!(
                    segment_prev = %first,
                    anchor = %anchor,
                    "audit segment disagrees with integrity anchor; trusting the segment"
                );
            }
        }

        let last_hash = tail_hash
            .or(anchor)
            .unwrap_or_else(|| GENESIS_HASH.to_owned());

        let active = open_append(&active_path).await?;
        let wal = open_append(&wal_path).await?;

        Ok(Self {
            dir,
            active_path,
            wal_path,
            active,
            wal,
            entry_count,
            last_hash,
            last_timestamp,
        })
    }

    /// Re-apply journal entries that never reached the segment, then clear
    /// the journal.
    async fn replay_wal(active_path: &Path, wal_path: &Path) -> Result<(), AuditError> {
        if !tokio::fs::try_exists(wal_path).await? {
            return Ok(());
        }
        let content = tokio::fs::read_to_string(wal_path).await?;

        let mut pending: Vec<AuditEntry> = Vec::new();
        let mut committed: HashSet<String> = HashSet::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<WalRecord>(line) {
                Ok(WalRecord::Pending { entry }) => pending.push(entry),
                Ok(WalRecord::Committed { id }) => {
                    committed.insert(id);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "skipping corrupt journal line");
                }
            }
        }

        let uncommitted: Vec<AuditEntry> = pending
            .into_iter()
            .filter(|e| !committed.contains(&e.id))
            .collect();

        if !uncommitted.is_empty() {
            let existing: HashSet<String> = if tokio::fs::try_exists(active_path).await? {
                tokio::fs::read_to_string(active_path)
                    .await?
                    .lines()
                    .filter_map(|l| serde_json::from_str::<AuditEntry>(l).ok())
                    .map(|e| e.id)
                    .collect()
            } else {
                HashSet::new()
            };

            let mut active = open_append(active_path).await?;
            let mut replayed = 0u64;
            for entry in uncommitted {
                if existing.contains(&entry.id) {
                    continue;
                }
                let line = crypto::canonical_json(&entry)?;
                active.write_all(&line).await?;
                active.write_all(b"\n").await?;
                replayed += 1;
            }
            active.sync_all().await?;
            if replayed > 0 {
                tracing::info!(replayed, "replayed uncommitted audit entries from journal");
            }
        }

        // The journal has served its purpose.
        let wal = open_truncated(wal_path).await?;
        wal.sync_all().await?;
        Ok(())
    }

    async fn write_wal(&mut self, record: &WalRecord) -> Result<(), AuditError> {
        let line = serde_json::to_vec(record)?;
        self.wal.write_all(&line).await?;
        self.wal.write_all(b"\n").await?;
        self.wal.sync_all().await?;
        Ok(())
    }

    async fn write_segment_line(&mut self, line: &[u8]) -> Result<(), AuditError> {
        self.active.write_all(line).await?;
        self.active.write_all(b"\n").await?;
        self.active.sync_all().await?;
        Ok(())
    }

    async fn append_entry(
        &mut self,
        kind: AuditKind,
        session_id: String,
        agent_id: String,
        data: serde_json::Value,
    ) -> Result<AuditEntry, AuditError> {
        // Redaction happens here, in exactly one place, so the chain commits
        // to the redacted form.
        let redacted = redact::redact(&data);

        let now = Utc::now();
        let timestamp = if now < self.last_timestamp {
            self.last_timestamp
        } else {
            now
        };

        let mut entry = AuditEntry {
            id: crypto::random_id(),
            timestamp,
            kind,
            session_id,
            agent_id,
            data: redacted,
            previous_hash: self.last_hash.clone(),
            hash: String::new(),
        };
        entry.hash = hash_for_entry(&entry)?;

        self.write_wal(&WalRecord::Pending {
            entry: entry.clone(),
        })
        .await?;

        // One retry on transient segment I/O; the journal line makes a crash
        // in between recoverable either way.
        let line = crypto::canonical_json(&entry)?;
        if let Err(first) = self.write_segment_line(&line).await {
            tracing::warn!(error = %first, "audit segment write failed; reopening and retrying");
            self.active = open_append(&self.active_path).await?;
            self.write_segment_line(&line).await?;
        }

        self.write_wal(&WalRecord::Committed {
            id: entry.id.clone(),
        })
        .await?;

        self.entry_count += 1;
        self.last_hash = entry.hash.clone();
        self.last_timestamp = timestamp;
        Ok(entry)
    }

    async fn rotate(&mut self) -> Result<PathBuf, AuditError> {
        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ");
        let archive_path = self.dir.join(ARCHIVE_DIR).join(format!("{stamp}.jsonl"));

        self.active.sync_all().await?;
        tokio::fs::rename(&self.active_path, &archive_path).await?;

        let anchor_path = self.dir.join(INTEGRITY_DIR).join(LAST_HASH_FILE);
        let mut anchor = open_truncated(&anchor_path).await?;
        anchor.write_all(self.last_hash.as_bytes()).await?;
        anchor.write_all(b"\n").await?;
        anchor.sync_all().await?;

        self.active = open_append(&self.active_path).await?;
        self.wal = open_truncated(&self.wal_path).await?;
        self.entry_count = 0;

        tracing::info!(archive = %archive_path.display(), "rotated audit segment");
        Ok(archive_path)
    }
}

async fn writer_loop(mut state: WriterState, mut rx: mpsc::Receiver<WriterJob>) {
    while let Some(job) = rx.recv().await {
        match job {
            WriterJob::Append {
                kind,
                session_id,
                agent_id,
                data,
                reply,
            } => {
                let result = state.append_entry(kind, session_id, agent_id, data).await;
                match (reply, result) {
                    (Some(tx), result) => {
                        let _ = tx.send(result);
                    }
                    (None, Err(err)) => {
                        tracing::error!(error = %err, "best-effort audit append failed");
                    }
                    (None, Ok(_)) => {}
                }
            }
            WriterJob::Rotate { reply } => {
                let _ = reply.send(state.rotate().await);
            }
            WriterJob::Stats { reply } => {
                let _ = reply.send(AuditStats {
                    entry_count: state.entry_count,
                    last_hash: state.last_hash.clone(),
                });
            }
            WriterJob::Shutdown { reply } => {
                let _ = state.active.sync_all().await;
                let _ = state.wal.sync_all().await;
                let _ = reply.send(());
                break;
            }
        }
    }
}

fn segment_paths(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut segments = Vec::new();
    let archive = dir.join(ARCHIVE_DIR);
    if archive.is_dir() {
        let mut archived: Vec<PathBuf> = std::fs::read_dir(&archive)?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "jsonl"))
            .collect();
        archived.sort();
        segments.extend(archived);
    }
    let active = dir.join(ACTIVE_FILE);
    if active.is_file() {
        segments.push(active);
    }
    Ok(segments)
}

/// Walk all segments of an audit directory, recomputing every hash.
///
/// Chain breaks and corrupt lines are collected, not fatal; after each entry
/// the walk resyncs on the stored hash so one tampered record yields a
/// bounded number of errors rather than cascading to the end of the log.
pub fn verify_directory(dir: &Path) -> Result<VerifyReport, AuditError> {
    let mut errors = Vec::new();
    let mut expected_prev = GENESIS_HASH.to_owned();
    let mut entry_count = 0u64;

    for segment in segment_paths(dir)? {
        let name = segment
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let content = std::fs::read_to_string(&segment)?;

        for (index, line) in content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .enumerate()
        {
            let value: serde_json::Value = match serde_json::from_str(line) {
                Ok(value) => value,
                Err(err) => {
                    errors.push(IntegrityError {
                        segment: name.clone(),
                        index,
                        detail: format!("corrupt JSON: {err}"),
                    });
                    continue;
                }
            };
            entry_count += 1;

            let stored_prev = value
                .get("previousHash")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_owned();
            let stored_hash = value
                .get("hash")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_owned();

            if stored_prev != expected_prev {
                errors.push(IntegrityError {
                    segment: name.clone(),
                    index,
                    detail: format!(
                        "chain break: expected previousHash {expected_prev}, found {stored_prev}"
                    ),
                });
            }

            let mut body = value.clone();
            if let Some(obj) = body.as_object_mut() {
                obj.remove("hash");
            }
            match crypto::canonical_json(&body) {
                Ok(bytes) => {
                    let recomputed = crypto::chained_hash(&bytes, &stored_prev);
                    if recomputed != stored_hash {
                        errors.push(IntegrityError {
                            segment: name.clone(),
                            index,
                            detail: format!(
                                "hash mismatch: recomputed {recomputed}, stored {stored_hash}"
                            ),
                        });
                    }
                }
                Err(err) => {
                    errors.push(IntegrityError {
                        segment: name.clone(),
                        index,
                        detail: format!("canonicalization failed: {err}"),
                    });
                }
            }

            expected_prev = stored_hash;
        }
    }

    Ok(VerifyReport {
        valid: errors.is_empty(),
        errors,
        entry_count,
        final_hash: expected_prev,
    })
}

fn load_entries(dir: &Path) -> Result<Vec<AuditEntry>, AuditError> {
    let mut entries = Vec::new();
    for segment in segment_paths(dir)? {
        let content = std::fs::read_to_string(&segment)?;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<AuditEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    tracing::warn!(error = %err, "skipping corrupt audit line");
                }
            }
        }
    }
    Ok(entries)
}

//! Append-only, hash-chained audit log.
//!
//! Every lifecycle event lands here. Each row commits to the previous one:
//!
//! ```text
//! chain[n] = sha256(chain[n-1] || seq || timestamp || kind || payload_sha256)
//! ```
//!
//! with a fixed genesis value before row 0, so any mutation, deletion, or
//! reordering of a row breaks every later hash. [`AuditLog`] is the only
//! insert path into `audit_events`; `verify` walks the chain and reports
//! the first break.
//!
//! A JSONL mirror (`{data-dir}/audit.log`) carries the same rows plus the
//! raw payload for offline tooling.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

use crate::store::{AuditRow, Store, StoreError};

/// prev hash of the very first row.
pub const GENESIS: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Error)]
pub enum AuditError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to write audit mirror: {0}")]
    Mirror(#[from] std::io::Error),
}

/// Every event kind the chain records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    DaemonStarted,
    DaemonStopped,
    SessionStarted,
    SessionEnded,
    SessionCrashed,
    PromptDetected,
    PromptDeduped,
    PolicyEvaluated,
    ChannelSent,
    ReplyReceived,
    ReplyInjected,
    PromptExpired,
    PromptCanceled,
    PromptFailed,
    ChannelMessageAccepted,
    ChannelMessageRejected,
    CircuitOpened,
    CircuitClosed,
    RecoveryRenotified,
    PauseChanged,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::DaemonStarted => "daemon_started",
            AuditKind::DaemonStopped => "daemon_stopped",
            AuditKind::SessionStarted => "session_started",
            AuditKind::SessionEnded => "session_ended",
            AuditKind::SessionCrashed => "session_crashed",
            AuditKind::PromptDetected => "prompt_detected",
            AuditKind::PromptDeduped => "prompt_deduped",
            AuditKind::PolicyEvaluated => "policy_evaluated",
            AuditKind::ChannelSent => "channel_sent",
            AuditKind::ReplyReceived => "reply_received",
            AuditKind::ReplyInjected => "reply_injected",
            AuditKind::PromptExpired => "prompt_expired",
            AuditKind::PromptCanceled => "prompt_canceled",
            AuditKind::PromptFailed => "prompt_failed",
            AuditKind::ChannelMessageAccepted => "channel_message_accepted",
            AuditKind::ChannelMessageRejected => "channel_message_rejected",
            AuditKind::CircuitOpened => "circuit_opened",
            AuditKind::CircuitClosed => "circuit_closed",
            AuditKind::RecoveryRenotified => "recovery_renotified",
            AuditKind::PauseChanged => "pause_changed",
        }
    }
}

impl std::fmt::Display for AuditKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mirror line — the store row plus the raw payload.
#[derive(Debug, Serialize)]
struct MirrorLine<'a> {
    seq: i64,
    timestamp: String,
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt_id: Option<&'a str>,
    payload: &'a serde_json::Value,
    payload_sha256: &'a str,
    prev_sha256: &'a str,
    chain_sha256: &'a str,
}

struct ChainState {
    next_seq: i64,
    prev_chain: String,
}

/// The single writer for the audit chain.
pub struct AuditLog {
    store: Arc<Store>,
    chain: Mutex<ChainState>,
    mirror: Option<Mutex<BufWriter<std::fs::File>>>,
}

impl AuditLog {
    /// Attach to a store, resuming the chain from its last row.
    pub fn new(store: Arc<Store>, mirror_path: Option<&Path>) -> Result<Self, AuditError> {
        let chain = match store.last_audit_row()? {
            Some(row) => ChainState {
                next_seq: row.seq + 1,
                prev_chain: row.chain_sha256,
            },
            None => ChainState {
                next_seq: 0,
                prev_chain: GENESIS.to_string(),
            },
        };
        let mirror = match mirror_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Some(Mutex::new(BufWriter::new(file)))
            }
            None => None,
        };
        Ok(Self {
            store,
            chain: Mutex::new(chain),
            mirror,
        })
    }

    /// Append one event; returns its `seq`.
    pub fn append(
        &self,
        kind: AuditKind,
        session_id: Option<&str>,
        prompt_id: Option<&str>,
        payload: serde_json::Value,
    ) -> Result<i64, AuditError> {
        self.append_at(Utc::now().timestamp_millis(), kind, session_id, prompt_id, payload)
    }

    pub(crate) fn append_at(
        &self,
        timestamp: i64,
        kind: AuditKind,
        session_id: Option<&str>,
        prompt_id: Option<&str>,
        payload: serde_json::Value,
    ) -> Result<i64, AuditError> {
        let payload_text = payload.to_string();
        let payload_sha256 = hex_sha256(payload_text.as_bytes());

        let mut chain = self.chain.lock().unwrap();
        let seq = chain.next_seq;
        let chain_sha256 = chain_hash(&chain.prev_chain, seq, timestamp, kind.as_str(), &payload_sha256);

        let row = AuditRow {
            seq,
            timestamp,
            kind: kind.as_str().to_string(),
            session_id: session_id.map(str::to_string),
            prompt_id: prompt_id.map(str::to_string),
            payload_sha256: payload_sha256.clone(),
            prev_sha256: chain.prev_chain.clone(),
            chain_sha256: chain_sha256.clone(),
        };
        self.store.append_audit_row(&row)?;
        chain.next_seq = seq + 1;
        chain.prev_chain = chain_sha256.clone();
        drop(chain);

        if let Some(mirror) = &self.mirror {
            let line = MirrorLine {
                seq,
                timestamp: chrono::DateTime::from_timestamp_millis(timestamp)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default(),
                kind: kind.as_str(),
                session_id,
                prompt_id,
                payload: &payload,
                payload_sha256: &payload_sha256,
                prev_sha256: &row.prev_sha256,
                chain_sha256: &chain_sha256,
            };
            // Mirror failures never block the chain; the store row is the
            // source of truth.
            if let Err(e) = write_mirror_line(mirror, &line) {
                warn!(error = %e, "audit mirror write failed");
            }
        }
        Ok(seq)
    }
}

fn write_mirror_line(
    mirror: &Mutex<BufWriter<std::fs::File>>,
    line: &MirrorLine<'_>,
) -> std::io::Result<()> {
    let json = serde_json::to_string(line)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut writer = mirror.lock().unwrap();
    writeln!(writer, "{json}")?;
    writer.flush()
}

/// Result of a chain walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub checked: i64,
    /// `seq` of the first broken row, if any.
    pub first_break: Option<i64>,
}

impl Verification {
    pub fn is_intact(&self) -> bool {
        self.first_break.is_none()
    }
}

/// Store meta key holding the chain hash of the last archived row.
pub const META_ARCHIVE_ANCHOR: &str = "audit_archive_anchor";

/// Walk the whole chain, recomputing every link.
///
/// The walk seeds from genesis, or — when `db archive` has pruned the
/// head — from the anchor hash recorded at archive time.
pub fn verify(store: &Store) -> Result<Verification, StoreError> {
    let rows = store.audit_rows_from(0)?;
    let Some(first) = rows.first() else {
        return Ok(Verification {
            checked: 0,
            first_break: None,
        });
    };
    let mut prev = if first.seq == 0 {
        GENESIS.to_string()
    } else {
        match store.meta_get(META_ARCHIVE_ANCHOR)? {
            Some(anchor) => anchor,
            // Head rows are missing without an archive record.
            None => {
                return Ok(Verification {
                    checked: 0,
                    first_break: Some(first.seq),
                });
            }
        }
    };
    let mut expected_seq = first.seq;
    let mut checked = 0i64;
    for row in &rows {
        let recomputed = chain_hash(&prev, row.seq, row.timestamp, &row.kind, &row.payload_sha256);
        if row.seq != expected_seq || row.prev_sha256 != prev || row.chain_sha256 != recomputed {
            return Ok(Verification {
                checked,
                first_break: Some(row.seq),
            });
        }
        prev = row.chain_sha256.clone();
        expected_seq += 1;
        checked += 1;
    }
    Ok(Verification {
        checked,
        first_break: None,
    })
}

/// Move audit rows beyond `max_rows` (oldest first) into a JSONL archive,
/// recording the anchor hash so the remaining tail still verifies.
/// Returns how many rows were archived.
pub fn archive(store: &Store, archive_path: &Path, max_rows: u64) -> Result<usize, AuditError> {
    let total = store.audit_row_count()?;
    let excess = total - max_rows as i64;
    if excess <= 0 {
        return Ok(0);
    }
    let rows = store.audit_rows_from(0)?;
    let (to_archive, _kept) = rows.split_at(excess as usize);
    let last = to_archive.last().map(|r| (r.seq, r.chain_sha256.clone()));

    if let Some(parent) = archive_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(archive_path)?;
    let mut writer = BufWriter::new(file);
    for row in to_archive {
        let line = serde_json::json!({
            "seq": row.seq,
            "timestamp": row.timestamp,
            "kind": row.kind,
            "session_id": row.session_id,
            "prompt_id": row.prompt_id,
            "payload_sha256": row.payload_sha256,
            "prev_sha256": row.prev_sha256,
            "chain_sha256": row.chain_sha256,
        });
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;

    if let Some((seq, chain)) = last {
        store.meta_set(META_ARCHIVE_ANCHOR, &chain)?;
        store.delete_audit_rows_through(seq)?;
    }
    store.vacuum()?;
    Ok(excess as usize)
}

/// chain[n] = sha256(chain[n-1] || seq || timestamp || kind || payload_sha256)
///
/// seq and timestamp are zero-padded to fixed width so field boundaries are
/// unambiguous.
fn chain_hash(prev: &str, seq: i64, timestamp: i64, kind: &str, payload_sha256: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev.as_bytes());
    hasher.update(format!("{seq:020}").as_bytes());
    hasher.update(format!("{timestamp:020}").as_bytes());
    hasher.update(kind.as_bytes());
    hasher.update(payload_sha256.as_bytes());
    hex::encode(hasher.finalize())
}

fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Minimal lowercase hex encoding, avoiding an extra dependency.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes
            .as_ref()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fresh() -> (Arc<Store>, AuditLog) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let log = AuditLog::new(Arc::clone(&store), None).unwrap();
        (store, log)
    }

    #[test]
    fn first_row_seeds_from_genesis() {
        let (store, log) = fresh();
        log.append_at(1_000, AuditKind::DaemonStarted, None, None, json!({}))
            .unwrap();
        let rows = store.audit_rows_from(0).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].seq, 0);
        assert_eq!(rows[0].prev_sha256, GENESIS);
    }

    #[test]
    fn chain_links_and_verifies() {
        let (store, log) = fresh();
        for i in 0..5 {
            log.append_at(
                1_000 + i,
                AuditKind::PromptDetected,
                Some("s1"),
                Some("p1"),
                json!({ "i": i }),
            )
            .unwrap();
        }
        let rows = store.audit_rows_from(0).unwrap();
        for pair in rows.windows(2) {
            assert_eq!(pair[1].prev_sha256, pair[0].chain_sha256);
        }
        let v = verify(&store).unwrap();
        assert!(v.is_intact());
        assert_eq!(v.checked, 5);
    }

    #[test]
    fn mutated_payload_detected() {
        let (store, log) = fresh();
        for i in 0..4 {
            log.append_at(i, AuditKind::ChannelSent, Some("s1"), None, json!({ "i": i }))
                .unwrap();
        }
        // Tamper with row 2 behind the writer's back.
        store
            .append_audit_row(&AuditRow {
                seq: 99,
                timestamp: 0,
                kind: "channel_sent".to_string(),
                session_id: None,
                prompt_id: None,
                payload_sha256: "bogus".to_string(),
                prev_sha256: "bogus".to_string(),
                chain_sha256: "bogus".to_string(),
            })
            .unwrap();
        let v = verify(&store).unwrap();
        assert_eq!(v.first_break, Some(99));
    }

    #[test]
    fn writer_resumes_chain_across_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("store.db");
        let store = Arc::new(Store::open(&path).unwrap());
        {
            let log = AuditLog::new(Arc::clone(&store), None).unwrap();
            log.append_at(1, AuditKind::SessionStarted, Some("s1"), None, json!({}))
                .unwrap();
        }
        // New writer, same store — chain must continue, not restart.
        let log = AuditLog::new(Arc::clone(&store), None).unwrap();
        log.append_at(2, AuditKind::SessionEnded, Some("s1"), None, json!({}))
            .unwrap();
        let v = verify(&store).unwrap();
        assert!(v.is_intact());
        assert_eq!(v.checked, 2);
    }

    #[test]
    fn mirror_file_carries_payload() {
        let tmp = tempfile::tempdir().unwrap();
        let mirror_path = tmp.path().join("audit.log");
        let store = Arc::new(Store::open_in_memory().unwrap());
        let log = AuditLog::new(Arc::clone(&store), Some(&mirror_path)).unwrap();
        log.append_at(
            1_700_000_000_000,
            AuditKind::ReplyInjected,
            Some("s1"),
            Some("p1"),
            json!({ "latency_ms": 420 }),
        )
        .unwrap();
        let content = std::fs::read_to_string(&mirror_path).unwrap();
        let line: serde_json::Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(line["kind"], "reply_injected");
        assert_eq!(line["payload"]["latency_ms"], 420);
        assert_eq!(line["seq"], 0);
    }

    #[test]
    fn archive_prunes_head_and_tail_still_verifies() {
        let tmp = tempfile::tempdir().unwrap();
        let archive_path = tmp.path().join("audit-archive.jsonl");
        let (store, log) = fresh();
        for i in 0..10 {
            log.append_at(i, AuditKind::PromptDetected, Some("s1"), None, json!({ "i": i }))
                .unwrap();
        }
        let archived = archive(&store, &archive_path, 4).unwrap();
        assert_eq!(archived, 6);
        assert_eq!(store.audit_row_count().unwrap(), 4);

        // Archive file holds the pruned rows.
        let content = std::fs::read_to_string(&archive_path).unwrap();
        assert_eq!(content.lines().count(), 6);

        // Remaining tail verifies against the recorded anchor.
        let v = verify(&store).unwrap();
        assert!(v.is_intact(), "tail broke after archive: {v:?}");
        assert_eq!(v.checked, 4);

        // The chain keeps extending after an archive.
        log.append_at(99, AuditKind::DaemonStopped, None, None, json!({}))
            .unwrap();
        assert!(verify(&store).unwrap().is_intact());
    }

    #[test]
    fn archive_under_limit_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, log) = fresh();
        log.append_at(0, AuditKind::DaemonStarted, None, None, json!({}))
            .unwrap();
        let archived = archive(&store, &tmp.path().join("a.jsonl"), 100).unwrap();
        assert_eq!(archived, 0);
        assert_eq!(store.audit_row_count().unwrap(), 1);
    }

    #[test]
    fn missing_head_without_anchor_is_a_break() {
        let (store, log) = fresh();
        for i in 0..3 {
            log.append_at(i, AuditKind::ChannelSent, None, None, json!({ "i": i }))
                .unwrap();
        }
        store.delete_audit_rows_through(0).unwrap();
        let v = verify(&store).unwrap();
        assert_eq!(v.first_break, Some(1));
    }

    #[test]
    fn identical_inputs_hash_identically() {
        let a = chain_hash(GENESIS, 0, 1_000, "prompt_detected", "abc");
        let b = chain_hash(GENESIS, 0, 1_000, "prompt_detected", "abc");
        assert_eq!(a, b);
        let c = chain_hash(GENESIS, 1, 1_000, "prompt_detected", "abc");
        assert_ne!(a, c);
    }
}

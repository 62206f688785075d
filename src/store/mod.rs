//! Durable store — sessions, prompts, replies, audit chain, meta flags.
//!
//! A single embedded SQLite database in WAL mode. All daemon writers share
//! one connection behind a mutex; read-only consumers (status, sessions,
//! dashboards) open their own read-only handles and never take write locks.
//!
//! The one primitive everything leans on is [`Store::decide_prompt`]: a
//! single UPDATE that claims a prompt for injection iff the nonce matches,
//! the session is still active, the TTL has not elapsed, and the prompt is
//! in `awaiting_reply`. Exactly one concurrent caller observes a changed
//! row; everyone else loses the race.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::AutonomyMode;
use crate::lifecycle::{self, PromptStatus};
use crate::prompt::{Confidence, PromptKind};

/// Schema version this build writes.
pub const SCHEMA_VERSION: i64 = 3;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(
        "migration to schema v{version} failed for {path}; \
         restore from backup or run `warden db migrate` against a fresh copy: {source}"
    )]
    Migration {
        path: PathBuf,
        version: i64,
        source: rusqlite::Error,
    },
    #[error("field '{0}' is not updatable")]
    FieldNotAllowed(String),
    #[error("invalid prompt transition: {0}")]
    Transition(#[from] lifecycle::TransitionError),
    #[error("row not found: {0}")]
    NotFound(String),
    #[error("stored value for {column} is malformed: {value}")]
    Malformed { column: String, value: String },
}

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Ended,
    Crashed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
            SessionStatus::Crashed => "crashed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "ended" => Some(SessionStatus::Ended),
            "crashed" => Some(SessionStatus::Crashed),
            _ => None,
        }
    }
}

/// Coarse conversation state surfaced in `status` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConversationState {
    #[default]
    Idle,
    Running,
    Streaming,
    AwaitingInput,
    Stopped,
}

impl ConversationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationState::Idle => "idle",
            ConversationState::Running => "running",
            ConversationState::Streaming => "streaming",
            ConversationState::AwaitingInput => "awaiting_input",
            ConversationState::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(ConversationState::Idle),
            "running" => Some(ConversationState::Running),
            "streaming" => Some(ConversationState::Streaming),
            "awaiting_input" => Some(ConversationState::AwaitingInput),
            "stopped" => Some(ConversationState::Stopped),
            _ => None,
        }
    }
}

/// One supervised child run.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub tool: String,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub status: SessionStatus,
    pub autonomy_mode: AutonomyMode,
    pub conversation_state: ConversationState,
    pub bound_thread: Option<String>,
}

/// One detected input-required event.
#[derive(Debug, Clone)]
pub struct PromptRecord {
    pub id: String,
    pub session_id: String,
    pub created_at: i64,
    pub ttl_seconds: i64,
    pub kind: PromptKind,
    pub confidence: Confidence,
    pub excerpt: String,
    pub nonce: String,
    pub status: PromptStatus,
    pub resolved_at: Option<i64>,
    pub latency_ms: Option<i64>,
}

impl PromptRecord {
    /// Wall-clock deadline in unix milliseconds.
    pub fn deadline_ms(&self) -> i64 {
        self.created_at + self.ttl_seconds * 1000
    }

    pub fn expired(&self, now_ms: i64) -> bool {
        now_ms >= self.deadline_ms()
    }
}

/// Origin of an accepted reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplySource {
    Human,
    Policy,
    Default,
}

impl ReplySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplySource::Human => "human",
            ReplySource::Policy => "policy",
            ReplySource::Default => "default",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "human" => Some(ReplySource::Human),
            "policy" => Some(ReplySource::Policy),
            "default" => Some(ReplySource::Default),
            _ => None,
        }
    }
}

/// The accepted reply for a prompt. Only the byte length is persisted.
#[derive(Debug, Clone)]
pub struct ReplyRecord {
    pub id: String,
    pub prompt_id: String,
    pub value_length: i64,
    pub source: ReplySource,
    pub identity: Option<String>,
    pub received_at: i64,
}

/// A persisted audit row (written only through `audit::AuditLog`).
#[derive(Debug, Clone)]
pub struct AuditRow {
    pub seq: i64,
    pub timestamp: i64,
    pub kind: String,
    pub session_id: Option<String>,
    pub prompt_id: Option<String>,
    pub payload_sha256: String,
    pub prev_sha256: String,
    pub chain_sha256: String,
}

/// Session columns `update_session` may touch. Anything else is rejected.
const SESSION_UPDATE_ALLOWLIST: &[&str] = &[
    "status",
    "ended_at",
    "autonomy_mode",
    "conversation_state",
    "bound_thread",
];

pub struct Store {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Store {
    /// Open (creating if needed), switch to WAL, run migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Open a throwaway in-memory store (tests).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Open read-only for dashboards/status; never competes for write locks.
    pub fn open_read_only(path: &Path) -> Result<Self, StoreError> {
        use rusqlite::OpenFlags;
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ── Migrations ──

    pub fn user_version(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("PRAGMA user_version", [], |r| r.get(0))?)
    }

    /// Idempotent, crash-safe migrations keyed by `user_version`.
    pub fn migrate(&self) -> Result<Vec<i64>, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let mut applied = Vec::new();
        loop {
            let version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
            if version >= SCHEMA_VERSION {
                break;
            }
            let target = version + 1;
            let tx = conn.transaction().map_err(|source| StoreError::Migration {
                path: self.path.clone(),
                version: target,
                source,
            })?;
            let step = match target {
                1 => migrate_v1(&tx),
                2 => migrate_v2(&tx),
                3 => migrate_v3(&tx),
                other => {
                    return Err(StoreError::Migration {
                        path: self.path.clone(),
                        version: other,
                        source: rusqlite::Error::InvalidQuery,
                    });
                }
            };
            step.and_then(|()| tx.pragma_update(None, "user_version", target))
                .map_err(|source| StoreError::Migration {
                    path: self.path.clone(),
                    version: target,
                    source,
                })?;
            tx.commit().map_err(|source| StoreError::Migration {
                path: self.path.clone(),
                version: target,
                source,
            })?;
            info!(version = target, "applied store migration");
            applied.push(target);
        }
        Ok(applied)
    }

    /// Versions that `db migrate --dry-run` would apply.
    pub fn pending_migrations(&self) -> Result<Vec<i64>, StoreError> {
        let current = self.user_version()?;
        Ok(((current + 1)..=SCHEMA_VERSION).collect())
    }

    pub fn integrity_check(&self) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let verdict: String = conn.query_row("PRAGMA integrity_check", [], |r| r.get(0))?;
        Ok(verdict == "ok")
    }

    // ── Sessions ──

    pub fn create_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sessions
             (id, tool, started_at, ended_at, status, autonomy_mode, conversation_state, bound_thread)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                session.id,
                session.tool,
                session.started_at,
                session.ended_at,
                session.status.as_str(),
                session.autonomy_mode.as_str(),
                session.conversation_state.as_str(),
                session.bound_thread,
            ],
        )?;
        Ok(())
    }

    /// Update named session columns. Field names outside the allowlist are
    /// rejected before any SQL is composed.
    pub fn update_session(
        &self,
        id: &str,
        fields: &[(&str, rusqlite::types::Value)],
    ) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        for (name, _) in fields {
            if !SESSION_UPDATE_ALLOWLIST.contains(name) {
                return Err(StoreError::FieldNotAllowed((*name).to_string()));
            }
        }
        let assignments: Vec<String> = fields
            .iter()
            .enumerate()
            .map(|(i, (name, _))| format!("{} = ?{}", name, i + 2))
            .collect();
        let sql = format!(
            "UPDATE sessions SET {} WHERE id = ?1",
            assignments.join(", ")
        );
        let conn = self.conn.lock().unwrap();
        let mut values: Vec<&dyn rusqlite::ToSql> = vec![&id];
        for (_, value) in fields {
            values.push(value);
        }
        let changed = conn.execute(&sql, values.as_slice())?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("session {id}")));
        }
        Ok(())
    }

    pub fn session(&self, id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, tool, started_at, ended_at, status, autonomy_mode,
                    conversation_state, bound_thread
             FROM sessions WHERE id = ?1",
            params![id],
            row_to_session,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tool, started_at, ended_at, status, autonomy_mode,
                    conversation_state, bound_thread
             FROM sessions ORDER BY started_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_session)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn active_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tool, started_at, ended_at, status, autonomy_mode,
                    conversation_state, bound_thread
             FROM sessions WHERE status = 'active' ORDER BY started_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_session)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ── Prompts ──

    pub fn insert_prompt(&self, prompt: &PromptRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO prompts
             (id, session_id, created_at, ttl_seconds, kind, confidence, excerpt,
              nonce, status, resolved_at, latency_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                prompt.id,
                prompt.session_id,
                prompt.created_at,
                prompt.ttl_seconds,
                prompt.kind.as_str(),
                prompt.confidence.as_str(),
                prompt.excerpt,
                prompt.nonce,
                prompt.status.as_str(),
                prompt.resolved_at,
                prompt.latency_ms,
            ],
        )?;
        Ok(())
    }

    pub fn prompt(&self, id: &str) -> Result<Option<PromptRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, session_id, created_at, ttl_seconds, kind, confidence,
                    excerpt, nonce, status, resolved_at, latency_ms
             FROM prompts WHERE id = ?1",
            params![id],
            row_to_prompt,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Validated status transition. On entry to RESOLVED, stamps
    /// `resolved_at` and computes `latency_ms`.
    pub fn transition_prompt(
        &self,
        id: &str,
        to: PromptStatus,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let (current, created_at): (String, i64) = tx
            .query_row(
                "SELECT status, created_at FROM prompts WHERE id = ?1",
                params![id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("prompt {id}")))?;
        let from = PromptStatus::parse(&current).ok_or_else(|| StoreError::Malformed {
            column: "prompts.status".to_string(),
            value: current.clone(),
        })?;
        lifecycle::check_transition(from, to)?;
        if to == PromptStatus::Resolved {
            tx.execute(
                "UPDATE prompts SET status = ?2, resolved_at = ?3, latency_ms = ?4
                 WHERE id = ?1",
                params![
                    id,
                    to.as_str(),
                    now_ms,
                    lifecycle::latency_ms(created_at, now_ms)
                ],
            )?;
        } else if to.is_terminal() {
            tx.execute(
                "UPDATE prompts SET status = ?2, resolved_at = ?3 WHERE id = ?1",
                params![id, to.as_str(), now_ms],
            )?;
        } else {
            tx.execute(
                "UPDATE prompts SET status = ?2 WHERE id = ?1",
                params![id, to.as_str()],
            )?;
        }
        tx.commit()?;
        debug!(prompt = id, from = %from, to = %to, "prompt transition");
        Ok(())
    }

    /// Atomic decision guard. Claims `awaiting_reply -> reply_received` in
    /// one statement iff the nonce matches, the session is active, and the
    /// TTL has not elapsed. Returns whether this caller won.
    pub fn decide_prompt(
        &self,
        prompt_id: &str,
        nonce: &str,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE prompts SET status = 'reply_received'
             WHERE id = ?1
               AND nonce = ?2
               AND status = 'awaiting_reply'
               AND created_at + ttl_seconds * 1000 > ?3
               AND session_id IN (SELECT id FROM sessions WHERE status = 'active')",
            params![prompt_id, nonce, now_ms],
        )?;
        Ok(changed == 1)
    }

    /// Prompts still awaiting a reply with TTL remaining (restart recovery).
    pub fn pending_prompts(&self, now_ms: i64) -> Result<Vec<PromptRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, created_at, ttl_seconds, kind, confidence,
                    excerpt, nonce, status, resolved_at, latency_ms
             FROM prompts
             WHERE status = 'awaiting_reply'
               AND created_at + ttl_seconds * 1000 > ?1
             ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![now_ms], row_to_prompt)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Prompts of a session still moving through the lifecycle.
    pub fn live_prompts_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<PromptRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, created_at, ttl_seconds, kind, confidence,
                    excerpt, nonce, status, resolved_at, latency_ms
             FROM prompts
             WHERE session_id = ?1
               AND status NOT IN ('resolved', 'expired', 'canceled', 'failed')
             ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![session_id], row_to_prompt)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Prompts whose TTL has elapsed while awaiting a reply (sweeper scan).
    pub fn expired_prompts(&self, now_ms: i64) -> Result<Vec<PromptRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, created_at, ttl_seconds, kind, confidence,
                    excerpt, nonce, status, resolved_at, latency_ms
             FROM prompts
             WHERE status = 'awaiting_reply'
               AND created_at + ttl_seconds * 1000 <= ?1
             ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![now_ms], row_to_prompt)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Cancel every live prompt of a dead session. Prompts already claimed
    /// (`reply_received`/`injected`) fail instead, per the lifecycle graph.
    pub fn cancel_prompts_for_session(
        &self,
        session_id: &str,
        now_ms: i64,
    ) -> Result<Vec<String>, StoreError> {
        let ids: Vec<(String, PromptStatus)> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT id, status FROM prompts
                 WHERE session_id = ?1
                   AND status NOT IN ('resolved', 'expired', 'canceled', 'failed')",
            )?;
            let rows = stmt.query_map(params![session_id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .filter_map(|(id, status)| PromptStatus::parse(&status).map(|s| (id, s)))
                .collect()
        };
        let mut canceled = Vec::new();
        for (id, status) in ids {
            let target = if lifecycle::can_transition(status, PromptStatus::Canceled) {
                PromptStatus::Canceled
            } else {
                PromptStatus::Failed
            };
            self.transition_prompt(&id, target, now_ms)?;
            canceled.push(id);
        }
        Ok(canceled)
    }

    // ── Replies ──

    /// At most one accepted reply per prompt (UNIQUE on prompt_id).
    pub fn insert_reply(&self, reply: &ReplyRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO replies (id, prompt_id, value_length, source, identity, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                reply.id,
                reply.prompt_id,
                reply.value_length,
                reply.source.as_str(),
                reply.identity,
                reply.received_at,
            ],
        )?;
        Ok(())
    }

    pub fn reply_for_prompt(&self, prompt_id: &str) -> Result<Option<ReplyRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, prompt_id, value_length, source, identity, received_at
             FROM replies WHERE prompt_id = ?1",
            params![prompt_id],
            |r| {
                Ok(ReplyRecord {
                    id: r.get(0)?,
                    prompt_id: r.get(1)?,
                    value_length: r.get(2)?,
                    source: ReplySource::parse(&r.get::<_, String>(3)?)
                        .unwrap_or(ReplySource::Human),
                    identity: r.get(4)?,
                    received_at: r.get(5)?,
                })
            },
        )
        .optional()
        .map_err(StoreError::from)
    }

    // ── Audit rows (insert path reserved for audit::AuditLog) ──

    pub(crate) fn append_audit_row(&self, row: &AuditRow) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO audit_events
             (seq, timestamp, kind, session_id, prompt_id, payload_sha256, prev_sha256, chain_sha256)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.seq,
                row.timestamp,
                row.kind,
                row.session_id,
                row.prompt_id,
                row.payload_sha256,
                row.prev_sha256,
                row.chain_sha256,
            ],
        )?;
        Ok(row.seq)
    }

    pub(crate) fn last_audit_row(&self) -> Result<Option<AuditRow>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT seq, timestamp, kind, session_id, prompt_id,
                    payload_sha256, prev_sha256, chain_sha256
             FROM audit_events ORDER BY seq DESC LIMIT 1",
            [],
            row_to_audit,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn audit_rows_from(&self, from_seq: i64) -> Result<Vec<AuditRow>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT seq, timestamp, kind, session_id, prompt_id,
                    payload_sha256, prev_sha256, chain_sha256
             FROM audit_events WHERE seq >= ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![from_seq], row_to_audit)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn audit_row_count(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(*) FROM audit_events", [], |r| r.get(0))?)
    }

    /// Delete audit rows with `seq <= through_seq` (db archive).
    pub fn delete_audit_rows_through(&self, through_seq: i64) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM audit_events WHERE seq <= ?1",
            params![through_seq],
        )?;
        Ok(deleted)
    }

    pub fn vacuum(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("VACUUM")?;
        Ok(())
    }

    // ── Meta flags ──

    pub fn meta_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![key],
            |r| r.get(0),
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn meta_set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn meta_delete(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM meta WHERE key = ?1", params![key])?;
        Ok(())
    }
}

fn row_to_session(r: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let status: String = r.get(4)?;
    let mode: String = r.get(5)?;
    let state: String = r.get(6)?;
    Ok(SessionRecord {
        id: r.get(0)?,
        tool: r.get(1)?,
        started_at: r.get(2)?,
        ended_at: r.get(3)?,
        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Ended),
        autonomy_mode: AutonomyMode::parse(&mode).unwrap_or_default(),
        conversation_state: ConversationState::parse(&state).unwrap_or_default(),
        bound_thread: r.get(7)?,
    })
}

fn row_to_prompt(r: &rusqlite::Row<'_>) -> rusqlite::Result<PromptRecord> {
    let kind: String = r.get(4)?;
    let confidence: String = r.get(5)?;
    let status: String = r.get(8)?;
    Ok(PromptRecord {
        id: r.get(0)?,
        session_id: r.get(1)?,
        created_at: r.get(2)?,
        ttl_seconds: r.get(3)?,
        kind: PromptKind::parse(&kind).unwrap_or(PromptKind::FreeText),
        confidence: Confidence::parse(&confidence).unwrap_or(Confidence::Low),
        excerpt: r.get(6)?,
        nonce: r.get(7)?,
        status: PromptStatus::parse(&status).unwrap_or(PromptStatus::Failed),
        resolved_at: r.get(9)?,
        latency_ms: r.get(10)?,
    })
}

fn row_to_audit(r: &rusqlite::Row<'_>) -> rusqlite::Result<AuditRow> {
    Ok(AuditRow {
        seq: r.get(0)?,
        timestamp: r.get(1)?,
        kind: r.get(2)?,
        session_id: r.get(3)?,
        prompt_id: r.get(4)?,
        payload_sha256: r.get(5)?,
        prev_sha256: r.get(6)?,
        chain_sha256: r.get(7)?,
    })
}

fn migrate_v1(tx: &rusqlite::Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
             id            TEXT PRIMARY KEY,
             tool          TEXT NOT NULL,
             started_at    INTEGER NOT NULL,
             ended_at      INTEGER,
             status        TEXT NOT NULL,
             autonomy_mode TEXT NOT NULL DEFAULT 'assist'
         );
         CREATE TABLE IF NOT EXISTS prompts (
             id           TEXT PRIMARY KEY,
             session_id   TEXT NOT NULL REFERENCES sessions(id),
             created_at   INTEGER NOT NULL,
             ttl_seconds  INTEGER NOT NULL,
             kind         TEXT NOT NULL,
             confidence   TEXT NOT NULL,
             excerpt      TEXT NOT NULL,
             nonce        TEXT NOT NULL,
             status       TEXT NOT NULL,
             resolved_at  INTEGER
         );
         CREATE INDEX IF NOT EXISTS idx_prompts_status ON prompts(status);
         CREATE TABLE IF NOT EXISTS replies (
             id           TEXT PRIMARY KEY,
             prompt_id    TEXT NOT NULL UNIQUE REFERENCES prompts(id),
             value_length INTEGER NOT NULL,
             source       TEXT NOT NULL,
             identity     TEXT,
             received_at  INTEGER NOT NULL
         );
         CREATE TABLE IF NOT EXISTS audit_events (
             seq            INTEGER PRIMARY KEY,
             timestamp      INTEGER NOT NULL,
             kind           TEXT NOT NULL,
             session_id     TEXT,
             prompt_id      TEXT,
             payload_sha256 TEXT NOT NULL,
             prev_sha256    TEXT NOT NULL,
             chain_sha256   TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS meta (
             key   TEXT PRIMARY KEY,
             value TEXT NOT NULL
         );",
    )
}

fn migrate_v2(tx: &rusqlite::Transaction<'_>) -> rusqlite::Result<()> {
    add_column_if_missing(
        tx,
        "sessions",
        "conversation_state",
        "TEXT NOT NULL DEFAULT 'idle'",
    )?;
    add_column_if_missing(tx, "sessions", "bound_thread", "TEXT")
}

fn migrate_v3(tx: &rusqlite::Transaction<'_>) -> rusqlite::Result<()> {
    add_column_if_missing(tx, "prompts", "latency_ms", "INTEGER")
}

/// Column adds are probed first so re-running a migration is harmless.
fn add_column_if_missing(
    tx: &rusqlite::Transaction<'_>,
    table: &str,
    column: &str,
    definition: &str,
) -> rusqlite::Result<()> {
    let mut stmt = tx.prepare(&format!("PRAGMA table_info({table})"))?;
    let existing: Vec<String> = stmt
        .query_map([], |r| r.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    if !existing.iter().any(|c| c == column) {
        tx.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session(id: &str) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            tool: "claude".to_string(),
            started_at: 1_000,
            ended_at: None,
            status: SessionStatus::Active,
            autonomy_mode: AutonomyMode::Assist,
            conversation_state: ConversationState::Running,
            bound_thread: None,
        }
    }

    fn test_prompt(id: &str, session: &str, status: PromptStatus) -> PromptRecord {
        PromptRecord {
            id: id.to_string(),
            session_id: session.to_string(),
            created_at: 10_000,
            ttl_seconds: 600,
            kind: PromptKind::YesNo,
            confidence: Confidence::High,
            excerpt: "Overwrite file? (y/n)".to_string(),
            nonce: format!("nonce-{id}"),
            status,
            resolved_at: None,
            latency_ms: None,
        }
    }

    fn store_with_prompt(status: PromptStatus) -> Store {
        let store = Store::open_in_memory().unwrap();
        store.create_session(&test_session("s1")).unwrap();
        store
            .insert_prompt(&test_prompt("p1", "s1", status))
            .unwrap();
        store
    }

    #[test]
    fn migrations_reach_current_version() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.user_version().unwrap(), SCHEMA_VERSION);
        assert!(store.pending_migrations().unwrap().is_empty());
    }

    #[test]
    fn migrations_are_idempotent() {
        let store = Store::open_in_memory().unwrap();
        // A second run applies nothing and must not error.
        assert!(store.migrate().unwrap().is_empty());
    }

    #[test]
    fn session_round_trip() {
        let store = Store::open_in_memory().unwrap();
        store.create_session(&test_session("s1")).unwrap();
        let loaded = store.session("s1").unwrap().unwrap();
        assert_eq!(loaded.tool, "claude");
        assert_eq!(loaded.status, SessionStatus::Active);
        assert_eq!(loaded.conversation_state, ConversationState::Running);
    }

    #[test]
    fn update_session_allowlist_rejects_unknown_field() {
        let store = Store::open_in_memory().unwrap();
        store.create_session(&test_session("s1")).unwrap();
        let err = store
            .update_session(
                "s1",
                &[("tool; DROP TABLE sessions", "evil".to_string().into())],
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::FieldNotAllowed(_)));
        // Table still intact.
        assert!(store.session("s1").unwrap().is_some());
    }

    #[test]
    fn update_session_applies_allowed_fields() {
        let store = Store::open_in_memory().unwrap();
        store.create_session(&test_session("s1")).unwrap();
        store
            .update_session(
                "s1",
                &[
                    ("status", "crashed".to_string().into()),
                    ("ended_at", 99_000_i64.into()),
                ],
            )
            .unwrap();
        let loaded = store.session("s1").unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Crashed);
        assert_eq!(loaded.ended_at, Some(99_000));
    }

    #[test]
    fn decide_prompt_claims_exactly_once() {
        let store = store_with_prompt(PromptStatus::AwaitingReply);
        let now = 20_000;
        assert!(store.decide_prompt("p1", "nonce-p1", now).unwrap());
        // Second identical claim loses: status is no longer awaiting_reply.
        assert!(!store.decide_prompt("p1", "nonce-p1", now).unwrap());
        let p = store.prompt("p1").unwrap().unwrap();
        assert_eq!(p.status, PromptStatus::ReplyReceived);
    }

    #[test]
    fn decide_prompt_rejects_wrong_nonce() {
        let store = store_with_prompt(PromptStatus::AwaitingReply);
        assert!(!store.decide_prompt("p1", "stale-nonce", 20_000).unwrap());
        let p = store.prompt("p1").unwrap().unwrap();
        assert_eq!(p.status, PromptStatus::AwaitingReply);
    }

    #[test]
    fn decide_prompt_rejects_elapsed_ttl() {
        let store = store_with_prompt(PromptStatus::AwaitingReply);
        // created_at 10_000 + 600s TTL = 610_000 deadline.
        assert!(!store.decide_prompt("p1", "nonce-p1", 610_000).unwrap());
    }

    #[test]
    fn decide_prompt_rejects_inactive_session() {
        let store = store_with_prompt(PromptStatus::AwaitingReply);
        store
            .update_session("s1", &[("status", "ended".to_string().into())])
            .unwrap();
        assert!(!store.decide_prompt("p1", "nonce-p1", 20_000).unwrap());
    }

    #[test]
    fn decide_prompt_rejects_wrong_status() {
        let store = store_with_prompt(PromptStatus::Created);
        assert!(!store.decide_prompt("p1", "nonce-p1", 20_000).unwrap());
    }

    #[test]
    fn transition_rejects_invalid_edge() {
        let store = store_with_prompt(PromptStatus::Created);
        let err = store
            .transition_prompt("p1", PromptStatus::Injected, 20_000)
            .unwrap_err();
        assert!(matches!(err, StoreError::Transition(_)));
    }

    #[test]
    fn resolved_prompt_gets_latency() {
        let store = store_with_prompt(PromptStatus::AwaitingReply);
        store.decide_prompt("p1", "nonce-p1", 15_000).unwrap();
        store
            .transition_prompt("p1", PromptStatus::Injected, 15_500)
            .unwrap();
        store
            .transition_prompt("p1", PromptStatus::Resolved, 16_000)
            .unwrap();
        let p = store.prompt("p1").unwrap().unwrap();
        assert_eq!(p.resolved_at, Some(16_000));
        assert_eq!(p.latency_ms, Some(6_000)); // 16_000 - 10_000 created_at
    }

    #[test]
    fn pending_and_expired_partition_on_ttl() {
        let store = Store::open_in_memory().unwrap();
        store.create_session(&test_session("s1")).unwrap();
        let mut live = test_prompt("live", "s1", PromptStatus::AwaitingReply);
        live.created_at = 100_000;
        live.ttl_seconds = 300;
        let mut dead = test_prompt("dead", "s1", PromptStatus::AwaitingReply);
        dead.created_at = 100_000;
        dead.ttl_seconds = 2;
        store.insert_prompt(&live).unwrap();
        store.insert_prompt(&dead).unwrap();

        let now = 103_000; // 3s after creation
        let pending = store.pending_prompts(now).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "live");
        let expired = store.expired_prompts(now).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "dead");
    }

    #[test]
    fn second_reply_for_prompt_is_rejected() {
        let store = store_with_prompt(PromptStatus::AwaitingReply);
        let reply = ReplyRecord {
            id: "r1".to_string(),
            prompt_id: "p1".to_string(),
            value_length: 1,
            source: ReplySource::Human,
            identity: Some("user42".to_string()),
            received_at: 20_000,
        };
        store.insert_reply(&reply).unwrap();
        let dup = ReplyRecord {
            id: "r2".to_string(),
            ..reply
        };
        assert!(store.insert_reply(&dup).is_err());
    }

    #[test]
    fn cancel_prompts_for_session_respects_graph() {
        let store = Store::open_in_memory().unwrap();
        store.create_session(&test_session("s1")).unwrap();
        store
            .insert_prompt(&test_prompt("a", "s1", PromptStatus::AwaitingReply))
            .unwrap();
        store
            .insert_prompt(&test_prompt("b", "s1", PromptStatus::ReplyReceived))
            .unwrap();
        store
            .insert_prompt(&test_prompt("c", "s1", PromptStatus::Resolved))
            .unwrap();

        let touched = store.cancel_prompts_for_session("s1", 30_000).unwrap();
        assert_eq!(touched.len(), 2);
        assert_eq!(
            store.prompt("a").unwrap().unwrap().status,
            PromptStatus::Canceled
        );
        // A claimed reply fails rather than cancels.
        assert_eq!(
            store.prompt("b").unwrap().unwrap().status,
            PromptStatus::Failed
        );
        assert_eq!(
            store.prompt("c").unwrap().unwrap().status,
            PromptStatus::Resolved
        );
    }

    #[test]
    fn meta_flags_round_trip() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.meta_get("paused").unwrap().is_none());
        store.meta_set("paused", "1").unwrap();
        assert_eq!(store.meta_get("paused").unwrap().as_deref(), Some("1"));
        store.meta_set("paused", "0").unwrap();
        assert_eq!(store.meta_get("paused").unwrap().as_deref(), Some("0"));
        store.meta_delete("paused").unwrap();
        assert!(store.meta_get("paused").unwrap().is_none());
    }

    #[test]
    fn on_disk_store_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("store.db");
        {
            let store = Store::open(&path).unwrap();
            store.create_session(&test_session("s1")).unwrap();
            store
                .insert_prompt(&test_prompt("p1", "s1", PromptStatus::AwaitingReply))
                .unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.user_version().unwrap(), SCHEMA_VERSION);
        assert!(store.prompt("p1").unwrap().is_some());
        assert!(store.integrity_check().unwrap());
    }
}

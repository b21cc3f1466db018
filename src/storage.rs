//! Audit log persistence: credentials, access events and evidence records.
//!
//! Access events and evidence rows are append-only and hash-chained (see
//! [`crate::chain`]). Timestamps are assigned by the store at write time from
//! its [`Clock`].

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::chain::{hash_entry, hash_from_blob, verify_links, ChainLink, GENESIS_HASH};
use crate::error::GuardError;
use crate::{open_db_connection, Clock, SystemClock};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credential {
    pub id: i64,
    pub username: String,
    pub salted_hash: String,
    pub created_at: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    AuthSuccess,
    AuthFailure,
    Logout,
    DeviceEnabled,
    DeviceDisabled,
    DeviceEnableFailed,
    DeviceDisableFailed,
    SuspiciousActivity(String),
}

impl AuditAction {
    pub fn outcome(&self) -> Outcome {
        match self {
            AuditAction::AuthSuccess
            | AuditAction::Logout
            | AuditAction::DeviceEnabled
            | AuditAction::DeviceDisabled => Outcome::Success,
            AuditAction::AuthFailure
            | AuditAction::DeviceEnableFailed
            | AuditAction::DeviceDisableFailed
            | AuditAction::SuspiciousActivity(_) => Outcome::Failure,
        }
    }

    pub fn code(&self) -> String {
        match self {
            AuditAction::AuthSuccess => "AUTH_SUCCESS".to_string(),
            AuditAction::AuthFailure => "AUTH_FAILED".to_string(),
            AuditAction::Logout => "LOGOUT".to_string(),
            AuditAction::DeviceEnabled => "CAMERA_ENABLED".to_string(),
            AuditAction::DeviceDisabled => "CAMERA_DISABLED".to_string(),
            AuditAction::DeviceEnableFailed => "CAMERA_ENABLE_FAILED".to_string(),
            AuditAction::DeviceDisableFailed => "CAMERA_DISABLE_FAILED".to_string(),
            AuditAction::SuspiciousActivity(kind) => format!("SUSPICIOUS_ACTIVITY:{}", kind),
        }
    }

    pub fn from_code(code: &str) -> Result<Self> {
        if let Some(kind) = code.strip_prefix("SUSPICIOUS_ACTIVITY:") {
            return Ok(AuditAction::SuspiciousActivity(kind.to_string()));
        }
        match code {
            "AUTH_SUCCESS" => Ok(AuditAction::AuthSuccess),
            "AUTH_FAILED" => Ok(AuditAction::AuthFailure),
            "LOGOUT" => Ok(AuditAction::Logout),
            "CAMERA_ENABLED" => Ok(AuditAction::DeviceEnabled),
            "CAMERA_DISABLED" => Ok(AuditAction::DeviceDisabled),
            "CAMERA_ENABLE_FAILED" => Ok(AuditAction::DeviceEnableFailed),
            "CAMERA_DISABLE_FAILED" => Ok(AuditAction::DeviceDisableFailed),
            other => Err(anyhow!("unknown audit action code: {}", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub id: i64,
    pub timestamp: u64,
    pub identity: String,
    pub action: AuditAction,
}

impl AttemptRecord {
    pub fn outcome(&self) -> Outcome {
        self.action.outcome()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EvidenceRecord {
    pub id: i64,
    pub timestamp: u64,
    pub media_ref: String,
    pub origin: Option<String>,
}

#[derive(Serialize)]
struct AttemptPayload<'a> {
    timestamp: u64,
    identity: &'a str,
    action: &'a str,
}

#[derive(Serialize)]
struct EvidencePayload<'a> {
    timestamp: u64,
    media_ref: &'a str,
    origin: Option<&'a str>,
}

/// Persistence collaborator. Implementations are internally synchronized so a
/// single store can be shared between the gate, the pipeline and workers.
pub trait AuditLog: Send + Sync {
    /// Fails with a `Validation` error if the username already exists.
    fn create_credential(&self, username: &str, salted_hash: &str) -> Result<i64>;

    fn get_credential(&self, username: &str) -> Result<Option<Credential>>;

    fn count_credentials(&self) -> Result<u64>;

    fn append_attempt(&self, identity: &str, action: &AuditAction) -> Result<i64>;

    fn append_evidence(&self, media_ref: &str, origin: Option<&str>) -> Result<i64>;

    /// Newest first.
    fn query_attempts(&self, identity: Option<&str>, limit: usize) -> Result<Vec<AttemptRecord>>;

    /// All records for `identity` stamped at or after `since_s`, newest first.
    fn attempts_since(&self, identity: &str, since_s: u64) -> Result<Vec<AttemptRecord>>;

    /// Newest first.
    fn query_evidence(&self, limit: usize) -> Result<Vec<EvidenceRecord>>;

    /// Checks both hash chains end to end.
    fn verify_chain(&self) -> Result<()>;
}

fn persistence(err: rusqlite::Error) -> anyhow::Error {
    GuardError::persistence(err.to_string()).into()
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("timestamp exceeds i64 range"))
}

fn attempt_payload(timestamp: u64, identity: &str, action: &AuditAction) -> Result<String> {
    let code = action.code();
    Ok(serde_json::to_string(&AttemptPayload {
        timestamp,
        identity,
        action: &code,
    })?)
}

fn evidence_payload(timestamp: u64, media_ref: &str, origin: Option<&str>) -> Result<String> {
    Ok(serde_json::to_string(&EvidencePayload {
        timestamp,
        media_ref,
        origin,
    })?)
}

// -------------------- SQLite --------------------

pub struct SqliteAuditLog {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl SqliteAuditLog {
    pub fn open(db_path: &str) -> Result<Self> {
        Self::open_with_clock(db_path, Arc::new(SystemClock))
    }

    pub fn open_with_clock(db_path: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
            clock,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| GuardError::persistence("audit log connection poisoned").into())
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS credentials (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              username TEXT UNIQUE NOT NULL,
              salted_hash TEXT NOT NULL,
              created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS access_events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              created_at INTEGER NOT NULL,
              identity TEXT NOT NULL,
              action TEXT NOT NULL,
              payload_json TEXT NOT NULL,
              prev_hash BLOB NOT NULL,
              entry_hash BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS evidence (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              created_at INTEGER NOT NULL,
              media_ref TEXT NOT NULL,
              origin TEXT,
              payload_json TEXT NOT NULL,
              prev_hash BLOB NOT NULL,
              entry_hash BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_access_identity ON access_events(identity, created_at);
            CREATE INDEX IF NOT EXISTS idx_evidence_created ON evidence(created_at);
            "#,
        )?;
        Ok(())
    }

    fn last_entry_hash(conn: &Connection, table: &str) -> Result<[u8; 32]> {
        let sql = format!("SELECT entry_hash FROM {} ORDER BY id DESC LIMIT 1", table);
        let bytes: Option<Vec<u8>> = conn
            .query_row(&sql, [], |row| row.get(0))
            .optional()
            .map_err(persistence)?;
        match bytes {
            Some(bytes) => hash_from_blob(table, bytes),
            None => Ok(GENESIS_HASH),
        }
    }

    /// Reads a table's chain in insertion order. `rebuild` re-derives the
    /// payload from the queryable columns starting at index 4; a row whose
    /// columns no longer match its chained payload is rejected.
    fn read_links<F>(
        conn: &Connection,
        table: &str,
        columns: &str,
        rebuild: F,
    ) -> Result<Vec<ChainLink>>
    where
        F: Fn(&rusqlite::Row<'_>) -> Result<String>,
    {
        let sql = format!(
            "SELECT id, payload_json, prev_hash, entry_hash, {} FROM {} ORDER BY id ASC",
            columns, table
        );
        let mut stmt = conn.prepare(&sql).map_err(persistence)?;
        let mut rows = stmt.query([]).map_err(persistence)?;
        let mut links = Vec::new();
        while let Some(row) = rows.next().map_err(persistence)? {
            let id: i64 = row.get(0)?;
            let payload: String = row.get(1)?;
            let prev: Vec<u8> = row.get(2)?;
            let entry: Vec<u8> = row.get(3)?;
            let rebuilt = rebuild(row)
                .with_context(|| format!("{} row {} has unreadable columns", table, id))?;
            if rebuilt != payload {
                return Err(anyhow!(
                    "{} row {} columns do not match its chained payload",
                    table,
                    id
                ));
            }
            links.push(ChainLink {
                id,
                payload,
                prev_hash: hash_from_blob(table, prev)?,
                entry_hash: hash_from_blob(table, entry)?,
            });
        }
        Ok(links)
    }

    fn attempt_links(conn: &Connection) -> Result<Vec<ChainLink>> {
        Self::read_links(conn, "access_events", "created_at, identity, action", |row| {
            let created_at: i64 = row.get(4)?;
            let identity: String = row.get(5)?;
            let action: String = row.get(6)?;
            attempt_payload(
                u64::try_from(created_at)?,
                &identity,
                &AuditAction::from_code(&action)?,
            )
        })
    }

    fn evidence_links(conn: &Connection) -> Result<Vec<ChainLink>> {
        Self::read_links(conn, "evidence", "created_at, media_ref, origin", |row| {
            let created_at: i64 = row.get(4)?;
            let media_ref: String = row.get(5)?;
            let origin: Option<String> = row.get(6)?;
            evidence_payload(u64::try_from(created_at)?, &media_ref, origin.as_deref())
        })
    }

    fn collect_attempts(rows: &mut rusqlite::Rows<'_>) -> Result<Vec<AttemptRecord>> {
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(persistence)? {
            let created_at: i64 = row.get(1)?;
            let action: String = row.get(3)?;
            out.push(AttemptRecord {
                id: row.get(0)?,
                timestamp: created_at.max(0) as u64,
                identity: row.get(2)?,
                action: AuditAction::from_code(&action)?,
            });
        }
        Ok(out)
    }
}

impl AuditLog for SqliteAuditLog {
    fn create_credential(&self, username: &str, salted_hash: &str) -> Result<i64> {
        let created_at = to_i64(self.clock.now_s()?)?;
        let conn = self.lock()?;
        match conn.execute(
            "INSERT INTO credentials(username, salted_hash, created_at) VALUES (?1, ?2, ?3)",
            params![username, salted_hash, created_at],
        ) {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(err) if is_unique_violation(&err) => Err(GuardError::validation(format!(
                "user {} already exists",
                username
            ))
            .into()),
            Err(err) => Err(persistence(err)),
        }
    }

    fn get_credential(&self, username: &str) -> Result<Option<Credential>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, username, salted_hash, created_at FROM credentials WHERE username = ?1",
                params![username],
                |row| {
                    let created_at: i64 = row.get(3)?;
                    Ok(Credential {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        salted_hash: row.get(2)?,
                        created_at: created_at.max(0) as u64,
                    })
                },
            )
            .optional()
            .map_err(persistence)?;
        Ok(row)
    }

    fn count_credentials(&self) -> Result<u64> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM credentials", [], |row| row.get(0))
            .map_err(persistence)?;
        Ok(count.max(0) as u64)
    }

    fn append_attempt(&self, identity: &str, action: &AuditAction) -> Result<i64> {
        let timestamp = self.clock.now_s()?;
        let payload = attempt_payload(timestamp, identity, action)?;
        let conn = self.lock()?;
        let prev_hash = Self::last_entry_hash(&conn, "access_events")?;
        let entry_hash = hash_entry(&prev_hash, payload.as_bytes());
        conn.execute(
            r#"
            INSERT INTO access_events(created_at, identity, action, payload_json, prev_hash, entry_hash)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                to_i64(timestamp)?,
                identity,
                action.code(),
                payload,
                prev_hash.to_vec(),
                entry_hash.to_vec()
            ],
        )
        .map_err(persistence)?;
        Ok(conn.last_insert_rowid())
    }

    fn append_evidence(&self, media_ref: &str, origin: Option<&str>) -> Result<i64> {
        let timestamp = self.clock.now_s()?;
        let payload = evidence_payload(timestamp, media_ref, origin)?;
        let conn = self.lock()?;
        let prev_hash = Self::last_entry_hash(&conn, "evidence")?;
        let entry_hash = hash_entry(&prev_hash, payload.as_bytes());
        conn.execute(
            r#"
            INSERT INTO evidence(created_at, media_ref, origin, payload_json, prev_hash, entry_hash)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                to_i64(timestamp)?,
                media_ref,
                origin,
                payload,
                prev_hash.to_vec(),
                entry_hash.to_vec()
            ],
        )
        .map_err(persistence)?;
        Ok(conn.last_insert_rowid())
    }

    fn query_attempts(&self, identity: Option<&str>, limit: usize) -> Result<Vec<AttemptRecord>> {
        let conn = self.lock()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        match identity {
            Some(identity) => {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, created_at, identity, action FROM access_events \
                         WHERE identity = ?1 ORDER BY id DESC LIMIT ?2",
                    )
                    .map_err(persistence)?;
                let mut rows = stmt.query(params![identity, limit]).map_err(persistence)?;
                Self::collect_attempts(&mut rows)
            }
            None => {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, created_at, identity, action FROM access_events \
                         ORDER BY id DESC LIMIT ?1",
                    )
                    .map_err(persistence)?;
                let mut rows = stmt.query(params![limit]).map_err(persistence)?;
                Self::collect_attempts(&mut rows)
            }
        }
    }

    fn attempts_since(&self, identity: &str, since_s: u64) -> Result<Vec<AttemptRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, created_at, identity, action FROM access_events \
                 WHERE identity = ?1 AND created_at >= ?2 ORDER BY id DESC",
            )
            .map_err(persistence)?;
        let mut rows = stmt
            .query(params![identity, to_i64(since_s)?])
            .map_err(persistence)?;
        Self::collect_attempts(&mut rows)
    }

    fn query_evidence(&self, limit: usize) -> Result<Vec<EvidenceRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, created_at, media_ref, origin FROM evidence ORDER BY id DESC LIMIT ?1",
            )
            .map_err(persistence)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = stmt.query(params![limit]).map_err(persistence)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(persistence)? {
            let created_at: i64 = row.get(1)?;
            out.push(EvidenceRecord {
                id: row.get(0)?,
                timestamp: created_at.max(0) as u64,
                media_ref: row.get(2)?,
                origin: row.get(3)?,
            });
        }
        Ok(out)
    }

    fn verify_chain(&self) -> Result<()> {
        let conn = self.lock()?;
        verify_links("access_events", &Self::attempt_links(&conn)?)?;
        verify_links("evidence", &Self::evidence_links(&conn)?)?;
        Ok(())
    }
}

// -------------------- In-memory --------------------

#[derive(Clone, Debug)]
struct InMemoryEntry<T> {
    record: T,
    link: ChainLink,
}

#[derive(Debug, Default)]
struct InMemoryState {
    credentials: Vec<Credential>,
    attempts: Vec<InMemoryEntry<AttemptRecord>>,
    evidence: Vec<InMemoryEntry<EvidenceRecord>>,
}

fn next_link<T>(entries: &[InMemoryEntry<T>], payload: String) -> ChainLink {
    let prev_hash = entries
        .last()
        .map(|entry| entry.link.entry_hash)
        .unwrap_or(GENESIS_HASH);
    ChainLink {
        id: entries.len() as i64 + 1,
        entry_hash: hash_entry(&prev_hash, payload.as_bytes()),
        payload,
        prev_hash,
    }
}

pub struct InMemoryAuditLog {
    state: Mutex<InMemoryState>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryAuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(InMemoryState::default()),
            clock,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, InMemoryState>> {
        self.state
            .lock()
            .map_err(|_| GuardError::persistence("in-memory audit log poisoned").into())
    }
}

impl AuditLog for InMemoryAuditLog {
    fn create_credential(&self, username: &str, salted_hash: &str) -> Result<i64> {
        let created_at = self.clock.now_s()?;
        let mut state = self.lock()?;
        if state.credentials.iter().any(|c| c.username == username) {
            return Err(GuardError::validation(format!("user {} already exists", username)).into());
        }
        let id = state.credentials.len() as i64 + 1;
        state.credentials.push(Credential {
            id,
            username: username.to_string(),
            salted_hash: salted_hash.to_string(),
            created_at,
        });
        Ok(id)
    }

    fn get_credential(&self, username: &str) -> Result<Option<Credential>> {
        let state = self.lock()?;
        Ok(state
            .credentials
            .iter()
            .find(|c| c.username == username)
            .cloned())
    }

    fn count_credentials(&self) -> Result<u64> {
        Ok(self.lock()?.credentials.len() as u64)
    }

    fn append_attempt(&self, identity: &str, action: &AuditAction) -> Result<i64> {
        let timestamp = self.clock.now_s()?;
        let payload = attempt_payload(timestamp, identity, action)?;
        let mut state = self.lock()?;
        let link = next_link(&state.attempts, payload);
        let id = link.id;
        state.attempts.push(InMemoryEntry {
            record: AttemptRecord {
                id,
                timestamp,
                identity: identity.to_string(),
                action: action.clone(),
            },
            link,
        });
        Ok(id)
    }

    fn append_evidence(&self, media_ref: &str, origin: Option<&str>) -> Result<i64> {
        let timestamp = self.clock.now_s()?;
        let payload = evidence_payload(timestamp, media_ref, origin)?;
        let mut state = self.lock()?;
        let link = next_link(&state.evidence, payload);
        let id = link.id;
        state.evidence.push(InMemoryEntry {
            record: EvidenceRecord {
                id,
                timestamp,
                media_ref: media_ref.to_string(),
                origin: origin.map(str::to_string),
            },
            link,
        });
        Ok(id)
    }

    fn query_attempts(&self, identity: Option<&str>, limit: usize) -> Result<Vec<AttemptRecord>> {
        let state = self.lock()?;
        Ok(state
            .attempts
            .iter()
            .rev()
            .map(|entry| &entry.record)
            .filter(|record| identity.map_or(true, |id| record.identity == id))
            .take(limit)
            .cloned()
            .collect())
    }

    fn attempts_since(&self, identity: &str, since_s: u64) -> Result<Vec<AttemptRecord>> {
        let state = self.lock()?;
        Ok(state
            .attempts
            .iter()
            .rev()
            .map(|entry| &entry.record)
            .filter(|record| record.identity == identity && record.timestamp >= since_s)
            .cloned()
            .collect())
    }

    fn query_evidence(&self, limit: usize) -> Result<Vec<EvidenceRecord>> {
        let state = self.lock()?;
        Ok(state
            .evidence
            .iter()
            .rev()
            .take(limit)
            .map(|entry| entry.record.clone())
            .collect())
    }

    fn verify_chain(&self) -> Result<()> {
        let state = self.lock()?;
        let attempts: Vec<ChainLink> = state.attempts.iter().map(|e| e.link.clone()).collect();
        let evidence: Vec<ChainLink> = state.evidence.iter().map(|e| e.link.clone()).collect();
        verify_links("access_events", &attempts)?;
        verify_links("evidence", &evidence)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::ManualClock;

    fn sqlite_store(clock: Arc<ManualClock>) -> SqliteAuditLog {
        SqliteAuditLog::open_with_clock(":memory:", clock).expect("open sqlite store")
    }

    fn stores() -> Vec<Box<dyn AuditLog>> {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        vec![
            Box::new(sqlite_store(clock.clone())),
            Box::new(InMemoryAuditLog::with_clock(clock)),
        ]
    }

    #[test]
    fn duplicate_credentials_are_validation_errors() {
        for store in stores() {
            store.create_credential("admin", "aa").expect("first insert");
            let err = store.create_credential("admin", "bb").unwrap_err();
            assert_eq!(GuardError::kind_of(&err), Some(ErrorKind::Validation));
            assert_eq!(store.count_credentials().unwrap(), 1);
            let stored = store.get_credential("admin").unwrap().expect("credential");
            assert_eq!(stored.salted_hash, "aa");
        }
    }

    #[test]
    fn usernames_are_case_sensitive() {
        for store in stores() {
            store.create_credential("Admin", "aa").unwrap();
            store.create_credential("admin", "bb").unwrap();
            assert_eq!(store.count_credentials().unwrap(), 2);
            assert!(store.get_credential("ADMIN").unwrap().is_none());
        }
    }

    #[test]
    fn attempts_are_returned_newest_first_and_filtered() {
        for store in stores() {
            store.append_attempt("alice", &AuditAction::AuthFailure).unwrap();
            store.append_attempt("bob", &AuditAction::AuthSuccess).unwrap();
            store.append_attempt("alice", &AuditAction::AuthSuccess).unwrap();

            let all = store.query_attempts(None, 10).unwrap();
            assert_eq!(all.len(), 3);
            assert_eq!(all[0].identity, "alice");
            assert_eq!(all[0].action, AuditAction::AuthSuccess);

            let alice = store.query_attempts(Some("alice"), 10).unwrap();
            assert_eq!(alice.len(), 2);
            assert_eq!(alice[1].outcome(), Outcome::Failure);

            assert_eq!(store.query_attempts(None, 1).unwrap().len(), 1);
        }
    }

    #[test]
    fn attempts_since_respects_store_timestamps() {
        let clock = Arc::new(ManualClock::new(10_000));
        let store = sqlite_store(clock.clone());
        store.append_attempt("alice", &AuditAction::AuthFailure).unwrap();
        clock.advance(600);
        store.append_attempt("alice", &AuditAction::AuthFailure).unwrap();

        assert_eq!(store.attempts_since("alice", 10_000).unwrap().len(), 2);
        assert_eq!(store.attempts_since("alice", 10_001).unwrap().len(), 1);
        assert!(store.attempts_since("bob", 0).unwrap().is_empty());
    }

    #[test]
    fn evidence_round_trips_with_optional_origin() {
        for store in stores() {
            store.append_evidence("media/a.jpg", Some("10.0.0.4")).unwrap();
            store.append_evidence("media/b.jpg", None).unwrap();
            let records = store.query_evidence(10).unwrap();
            assert_eq!(records.len(), 2);
            assert_eq!(records[0].media_ref, "media/b.jpg");
            assert_eq!(records[0].origin, None);
            assert_eq!(records[1].origin.as_deref(), Some("10.0.0.4"));
            assert_eq!(records[1].timestamp, 1_700_000_000);
        }
    }

    #[test]
    fn action_codes_parse_back() {
        for action in [
            AuditAction::AuthSuccess,
            AuditAction::AuthFailure,
            AuditAction::Logout,
            AuditAction::DeviceDisableFailed,
            AuditAction::SuspiciousActivity("SYSTEM_TAMPERING".to_string()),
        ] {
            assert_eq!(AuditAction::from_code(&action.code()).unwrap(), action);
        }
        assert!(AuditAction::from_code("NOPE").is_err());
    }

    #[test]
    fn sqlite_chain_detects_tampering() {
        let store = sqlite_store(Arc::new(ManualClock::new(1)));
        store.append_attempt("alice", &AuditAction::AuthFailure).unwrap();
        store.append_attempt("alice", &AuditAction::AuthFailure).unwrap();
        store.append_evidence("media/a.jpg", None).unwrap();
        store.verify_chain().expect("untouched chain verifies");

        store
            .lock()
            .unwrap()
            .execute(
                "UPDATE access_events SET payload_json = '{}' WHERE id = 1",
                [],
            )
            .unwrap();
        assert!(store.verify_chain().is_err());
    }

    #[test]
    fn sqlite_chain_covers_query_columns() {
        let tamper = |sql: &str| {
            let store = sqlite_store(Arc::new(ManualClock::new(1)));
            store.append_attempt("alice", &AuditAction::AuthFailure).unwrap();
            store.append_attempt("alice", &AuditAction::AuthFailure).unwrap();
            store.append_evidence("media/a.jpg", Some("video")).unwrap();
            store.verify_chain().expect("untouched chain verifies");
            store.lock().unwrap().execute(sql, []).unwrap();
            store.verify_chain()
        };

        assert!(tamper(
            "UPDATE access_events SET action = 'AUTH_SUCCESS', identity = 'admin' WHERE id = 2"
        )
        .is_err());
        assert!(tamper("UPDATE access_events SET created_at = 99 WHERE id = 1").is_err());
        assert!(tamper("UPDATE evidence SET media_ref = 'media/other.jpg' WHERE id = 1").is_err());
        assert!(tamper("UPDATE evidence SET origin = NULL WHERE id = 1").is_err());
    }
}

//! camguard: webcam access control and intrusion response.
//!
//! # Architecture
//!
//! Three core components, each composed from collaborator traits:
//!
//! - `auth`: salted credential hashing, verification and the session slot.
//! - `device`: redundant blocking methods applied and reverted by quorum, with
//!   a TTL-cached aggregate status.
//! - `intrusion`: single-flight evidence capture on authentication failure,
//!   written through the audit log and announced through a notifier.
//!
//! Collaborators:
//!
//! - `storage`: append-only audit log (SQLite or in-memory).
//! - `capture`: capture device abstraction and artifact writer.
//! - `notify`: alert delivery (MQTT or in-memory).
//!
//! `service` wires the pieces together the way an interactive front end
//! drives them, and `dispatch` keeps blocking I/O off the interactive thread.
//!
//! None of the core operations let a collaborator fault escape: they log it
//! and report a negative result.

use anyhow::Result;
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod auth;
pub mod capture;
pub mod chain;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod intrusion;
pub mod notify;
pub mod service;
pub mod storage;

pub use auth::{AuthenticationGate, Session};
pub use capture::{
    CaptureDevice, CaptureMode, CaptureSession, Frame, SyntheticCamera, SyntheticCameraConfig,
};
pub use config::GuardConfig;
pub use device::{
    AggregateBlockStatus, BlockingMethod, BlockingMethodKind, DeviceAccessController,
    DeviceState, FilePolicyStore, MemoryPolicyStore, PrivilegeCheck, ProcessPrivilege,
    StaticPrivilege, SystemPolicyStore, ToggleOutcome,
};
pub use dispatch::{Dispatcher, Mailbox};
pub use error::{ErrorKind, GuardError};
pub use intrusion::{
    EvidenceReference, IntrusionResponsePipeline, IntrusionStatistics, SuspiciousActivity,
};
pub use notify::{AlertKind, MemoryNotifier, MqttNotifier, Notifier, NotifierSettings};
pub use service::{FailurePolicy, GuardService, LoginOutcome};
pub use storage::{
    AttemptRecord, AuditAction, AuditLog, Credential, EvidenceRecord, InMemoryAuditLog,
    Outcome, SqliteAuditLog,
};

// -------------------- Time --------------------

/// Source of wall-clock seconds. Stores stamp records from it and the
/// intrusion pipeline measures its failure window against it.
pub trait Clock: Send + Sync {
    fn now_s(&self) -> Result<u64>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_s(&self) -> Result<u64> {
        now_s()
    }
}

/// Manually driven clock for tests and replay.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_s: u64) -> Self {
        Self {
            now: AtomicU64::new(start_s),
        }
    }

    pub fn set(&self, now_s: u64) {
        self.now.store(now_s, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_s(&self) -> Result<u64> {
        Ok(self.now.load(Ordering::SeqCst))
    }
}

pub fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

// -------------------- SQLite helpers --------------------

/// Unique shared-cache in-memory database URI, so several connections can
/// see the same scratch database.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:camguard_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

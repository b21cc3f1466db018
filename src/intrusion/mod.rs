//! Intrusion response: evidence capture, audit records and alerts.
//!
//! Capture is single-flight. While one capture holds the [`CaptureGuard`],
//! further requests skip capture entirely instead of queueing.

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::net::UdpSocket;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::capture::{capture_to_artifact, CaptureDevice, CaptureMode, PARTIAL_EXTENSION};
use crate::device::methods::LOCK_FILE_NAME;
use crate::notify::{AlertKind, Notifier};
use crate::storage::{AuditAction, AuditLog};
use crate::{Clock, SystemClock};

pub const DEFAULT_VIDEO_DURATION: Duration = Duration::from_secs(10);
pub const SYSTEM_IDENTITY: &str = "system";
const FALLBACK_ORIGIN: &str = "127.0.0.1";
const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Process-wide "capture in progress" flag.
#[derive(Debug, Default)]
pub struct CaptureGuard {
    in_progress: AtomicBool,
}

impl CaptureGuard {
    pub fn try_acquire(&self) -> Option<CapturePermit<'_>> {
        self.in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CapturePermit { guard: self })
    }

    pub fn is_held(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }
}

/// Releases the guard on drop.
#[derive(Debug)]
pub struct CapturePermit<'a> {
    guard: &'a CaptureGuard,
}

impl Drop for CapturePermit<'_> {
    fn drop(&mut self) {
        self.guard.in_progress.store(false, Ordering::Release);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SuspiciousActivity {
    UnauthorizedCameraAccess,
    SystemTampering,
    Other(String),
}

impl SuspiciousActivity {
    pub fn code(&self) -> String {
        match self {
            SuspiciousActivity::UnauthorizedCameraAccess => "UNAUTHORIZED_CAMERA_ACCESS".to_string(),
            SuspiciousActivity::SystemTampering => "SYSTEM_TAMPERING".to_string(),
            SuspiciousActivity::Other(kind) => kind.to_uppercase(),
        }
    }

    fn captures_evidence(&self) -> bool {
        matches!(
            self,
            SuspiciousActivity::UnauthorizedCameraAccess | SuspiciousActivity::SystemTampering
        )
    }
}

/// A captured artifact. `record_id` is absent when the evidence row could
/// not be written; the artifact itself still exists.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EvidenceReference {
    pub record_id: Option<i64>,
    pub media_path: PathBuf,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IntrusionStatistics {
    /// Evidence records, i.e. intrusions that produced a capture.
    pub total_intrusions: usize,
    /// Intrusions per local date.
    pub by_date: BTreeMap<String, usize>,
    pub failed_logins: usize,
    pub evidence_file_count: usize,
    pub total_bytes: u64,
    pub most_recent: Option<u64>,
    pub media_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct IntrusionResponsePipeline {
    store: Arc<dyn AuditLog>,
    device: Arc<dyn CaptureDevice>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    media_dir: PathBuf,
    video_duration: Duration,
    guard: CaptureGuard,
}

impl IntrusionResponsePipeline {
    pub fn new(
        store: Arc<dyn AuditLog>,
        device: Arc<dyn CaptureDevice>,
        notifier: Arc<dyn Notifier>,
        media_dir: impl Into<PathBuf>,
        video_duration: Duration,
    ) -> Self {
        Self {
            store,
            device,
            notifier,
            clock: Arc::new(SystemClock),
            media_dir: media_dir.into(),
            video_duration,
            guard: CaptureGuard::default(),
        }
    }

    /// Replaces the clock used for failure windows and alert timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn media_dir(&self) -> &Path {
        &self.media_dir
    }

    pub fn is_capture_in_progress(&self) -> bool {
        self.guard.is_held()
    }

    /// Records the failed attempt and, unless a capture is already running,
    /// captures evidence, stores an evidence record and sends an alert.
    pub fn handle_authentication_failure(&self, identity: &str) -> Option<EvidenceReference> {
        let media = {
            let Some(_permit) = self.guard.try_acquire() else {
                log::warn!(
                    "intrusion capture already in progress; recording attempt by {} without evidence",
                    identity
                );
                self.record_attempt(identity, &AuditAction::AuthFailure);
                return None;
            };
            log::warn!("handling failed authentication for {}", identity);
            self.capture_evidence()
        };

        self.record_attempt(identity, &AuditAction::AuthFailure);
        let media = media?;
        let detail = format!("Username involved: {}", identity);
        Some(self.store_and_announce(media, AlertKind::Intrusion, &detail))
    }

    /// Captures evidence without recording anything. Returns `None` when a
    /// capture is already in progress or nothing usable was captured.
    pub fn capture_and_store_evidence(&self) -> Option<PathBuf> {
        let Some(_permit) = self.guard.try_acquire() else {
            log::warn!("intrusion capture already in progress");
            return None;
        };
        self.capture_evidence()
    }

    fn capture_evidence(&self) -> Option<PathBuf> {
        if !self.video_duration.is_zero() {
            let mode = CaptureMode::Video {
                duration: self.video_duration,
            };
            match self.try_capture(mode) {
                Ok(path) => return Some(path),
                Err(e) => log::warn!("video capture failed, falling back to photo: {:#}", e),
            }
        }
        match self.try_capture(CaptureMode::Photo) {
            Ok(path) => Some(path),
            Err(e) => {
                log::error!("failed to capture intrusion evidence: {:#}", e);
                None
            }
        }
    }

    fn try_capture(&self, mode: CaptureMode) -> Result<PathBuf> {
        let path = capture_to_artifact(self.device.as_ref(), mode, &self.media_dir)?;
        let len = fs::metadata(&path)?.len();
        if len == 0 {
            if let Err(e) = fs::remove_file(&path) {
                log::warn!("failed to remove empty artifact {}: {}", path.display(), e);
            }
            return Err(anyhow::anyhow!("captured artifact {} is empty", path.display()));
        }
        log::info!("intrusion evidence captured: {}", path.display());
        Ok(path)
    }

    fn store_and_announce(&self, media: PathBuf, kind: AlertKind, detail: &str) -> EvidenceReference {
        let origin = local_origin();
        let media_ref = media.display().to_string();
        let record_id = match self.store.append_evidence(&media_ref, Some(&origin)) {
            Ok(id) => Some(id),
            Err(e) => {
                log::error!("failed to record evidence {}: {:#}", media_ref, e);
                None
            }
        };

        let timestamp = self.clock.now_s().unwrap_or_default();
        if !self
            .notifier
            .send_alert(kind, timestamp, Some(&media), Some(detail))
        {
            log::warn!("{} alert for {} was not delivered", kind, media_ref);
        }

        EvidenceReference {
            record_id,
            media_path: media,
        }
    }

    fn record_attempt(&self, identity: &str, action: &AuditAction) -> bool {
        match self.store.append_attempt(identity, action) {
            Ok(_) => true,
            Err(e) => {
                log::error!("failed to record {} for {}: {:#}", action.code(), identity, e);
                false
            }
        }
    }

    /// True iff `identity` has at least `max_attempts` failed attempts within
    /// the last `window_minutes`.
    pub fn detect_repeated_failures(
        &self,
        identity: &str,
        window_minutes: u64,
        max_attempts: usize,
    ) -> bool {
        let now = match self.clock.now_s() {
            Ok(now) => now,
            Err(e) => {
                log::error!("error detecting repeated failures: {:#}", e);
                return false;
            }
        };
        let since = now.saturating_sub(window_minutes.saturating_mul(60));
        let records = match self.store.attempts_since(identity, since) {
            Ok(records) => records,
            Err(e) => {
                log::error!("error detecting repeated failures: {:#}", e);
                return false;
            }
        };
        let failures = records
            .iter()
            .filter(|r| r.action == AuditAction::AuthFailure && r.timestamp <= now)
            .count();
        if failures >= max_attempts {
            log::warn!(
                "{} failed attempts by {} within {} minutes",
                failures,
                identity,
                window_minutes
            );
            return true;
        }
        false
    }

    /// Deletes evidence files whose modification time is older than `days`.
    /// The audit log is not touched.
    pub fn cleanup_evidence_older_than(&self, days: u64) -> usize {
        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(days.saturating_mul(SECS_PER_DAY)))
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let entries = match fs::read_dir(&self.media_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(e) => {
                log::error!("error during evidence cleanup: {}", e);
                return 0;
            }
        };

        let mut removed = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            if !is_evidence_file(&entry.file_name()) {
                continue;
            }
            let modified = match entry.metadata() {
                Ok(meta) if meta.is_file() => meta.modified(),
                _ => continue,
            };
            let Ok(modified) = modified else {
                continue;
            };
            if modified < cutoff {
                match fs::remove_file(&path) {
                    Ok(()) => {
                        removed += 1;
                        log::info!("cleaned up old evidence file {}", path.display());
                    }
                    Err(e) => log::error!("failed to delete {}: {}", path.display(), e),
                }
            }
        }
        if removed > 0 {
            log::info!("cleaned up {} old evidence files", removed);
        }
        removed
    }

    pub fn statistics(&self) -> IntrusionStatistics {
        let mut stats = IntrusionStatistics {
            media_dir: self.media_dir.clone(),
            ..IntrusionStatistics::default()
        };
        match self.store.query_evidence(usize::MAX) {
            Ok(records) => {
                for record in &records {
                    stats.total_intrusions += 1;
                    *stats.by_date.entry(local_date(record.timestamp)).or_default() += 1;
                    stats.most_recent = stats.most_recent.max(Some(record.timestamp));
                }
            }
            Err(e) => {
                log::error!("failed to generate intrusion statistics: {:#}", e);
                stats.error = Some(format!("{:#}", e));
            }
        }
        match self.store.query_attempts(None, usize::MAX) {
            Ok(records) => {
                stats.failed_logins = records
                    .iter()
                    .filter(|r| r.action == AuditAction::AuthFailure)
                    .count();
            }
            Err(e) => {
                log::error!("failed to count failed logins: {:#}", e);
                stats.error.get_or_insert_with(|| format!("{:#}", e));
            }
        }

        if let Ok(entries) = fs::read_dir(&self.media_dir) {
            for entry in entries.flatten() {
                if !is_evidence_file(&entry.file_name()) {
                    continue;
                }
                if let Ok(meta) = entry.metadata() {
                    if meta.is_file() {
                        stats.evidence_file_count += 1;
                        stats.total_bytes += meta.len();
                    }
                }
            }
        }
        stats
    }

    /// Records a suspicious event. Unauthorized camera access and tampering
    /// also capture evidence and alert, subject to the capture guard.
    pub fn handle_suspicious_activity(
        &self,
        activity: &SuspiciousActivity,
        detail: Option<&str>,
    ) -> bool {
        log::warn!(
            "suspicious activity detected: {}{}",
            activity.code(),
            detail.map(|d| format!(" ({})", d)).unwrap_or_default()
        );
        let recorded = self.record_attempt(
            SYSTEM_IDENTITY,
            &AuditAction::SuspiciousActivity(activity.code()),
        );
        if !activity.captures_evidence() {
            return recorded;
        }

        if let Some(media) = self.capture_and_store_evidence() {
            let detail = match detail {
                Some(d) => format!("{}: {}", activity.code(), d),
                None => activity.code(),
            };
            self.store_and_announce(media, AlertKind::SuspiciousActivity, &detail);
        }
        recorded
    }
}

/// Finished artifacts only. The lock file and in-progress `.partial` writes
/// live in the same directory.
fn is_evidence_file(name: &OsStr) -> bool {
    name != LOCK_FILE_NAME && Path::new(name).extension() != Some(OsStr::new(PARTIAL_EXTENSION))
}

fn local_date(timestamp: u64) -> String {
    i64::try_from(timestamp)
        .ok()
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .map(|utc| utc.with_timezone(&chrono::Local).format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Best-effort local IPv4 address: the source address the OS would route an
/// outbound datagram from. Nothing is sent.
pub fn local_origin() -> String {
    let probe = || -> std::io::Result<String> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    match probe() {
        Ok(ip) if ip != "0.0.0.0" => ip,
        _ => FALLBACK_ORIGIN.to_string(),
    }
}

//! Alert delivery.
//!
//! The intrusion pipeline and the service announce incidents through the
//! [`Notifier`] trait. `send_alert` never fails loudly: an unconfigured or
//! unreachable notifier reports `false` and the caller carries on.

use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

mod mqtt;

pub use mqtt::{MqttCredentials, MqttNotifier, NotifierSettings, NotifierStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Intrusion,
    RepeatedFailures,
    SuspiciousActivity,
    Test,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::Intrusion => "intrusion",
            AlertKind::RepeatedFailures => "repeated_failures",
            AlertKind::SuspiciousActivity => "suspicious_activity",
            AlertKind::Test => "test",
        }
    }

    fn title(self) -> &'static str {
        match self {
            AlertKind::Intrusion => "Unauthorized access attempt detected",
            AlertKind::RepeatedFailures => "Repeated authentication failures",
            AlertKind::SuspiciousActivity => "Suspicious activity detected",
            AlertKind::Test => "Test alert",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON body published for every alert.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AlertPayload {
    pub kind: AlertKind,
    pub title: String,
    pub timestamp: u64,
    pub occurred_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AlertPayload {
    pub fn new(
        kind: AlertKind,
        timestamp: u64,
        evidence_ref: Option<&Path>,
        detail: Option<&str>,
    ) -> Self {
        let occurred_at = i64::try_from(timestamp)
            .ok()
            .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
            .map(|utc| {
                utc.with_timezone(&chrono::Local)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string()
            })
            .unwrap_or_default();
        Self {
            kind,
            title: kind.title().to_string(),
            timestamp,
            occurred_at,
            evidence_ref: evidence_ref.map(|path| path.display().to_string()),
            evidence_file: evidence_ref
                .and_then(|path| path.file_name())
                .map(|name| name.to_string_lossy().into_owned()),
            detail: detail.map(str::to_string),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn is_configured(&self) -> bool;

    /// Returns false when unconfigured or when delivery fails.
    fn send_alert(
        &self,
        kind: AlertKind,
        timestamp: u64,
        evidence_ref: Option<&Path>,
        detail: Option<&str>,
    ) -> bool;
}

/// Records alerts in memory. Used by tests and by dry runs.
pub struct MemoryNotifier {
    configured: AtomicBool,
    failing: AtomicBool,
    sent: Mutex<Vec<AlertPayload>>,
}

impl Default for MemoryNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self {
            configured: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn unconfigured() -> Self {
        let notifier = Self::new();
        notifier.configured.store(false, Ordering::SeqCst);
        notifier
    }

    /// Every send fails while set.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<AlertPayload> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }
}

impl Notifier for MemoryNotifier {
    fn is_configured(&self) -> bool {
        self.configured.load(Ordering::SeqCst)
    }

    fn send_alert(
        &self,
        kind: AlertKind,
        timestamp: u64,
        evidence_ref: Option<&Path>,
        detail: Option<&str>,
    ) -> bool {
        if !self.is_configured() {
            log::warn!("notifier not configured; skipping {} alert", kind);
            return false;
        }
        if self.failing.load(Ordering::SeqCst) {
            log::error!("failed to deliver {} alert", kind);
            return false;
        }
        match self.sent.lock() {
            Ok(mut sent) => {
                sent.push(AlertPayload::new(kind, timestamp, evidence_ref, detail));
                true
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_names_the_evidence_file() {
        let payload = AlertPayload::new(
            AlertKind::Intrusion,
            1_700_000_000,
            Some(Path::new("/var/media/intrusion_photo_20231114_221320_0.jpg")),
            Some("username involved: mallory"),
        );
        assert_eq!(
            payload.evidence_file.as_deref(),
            Some("intrusion_photo_20231114_221320_0.jpg")
        );
        assert!(!payload.occurred_at.is_empty());
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "intrusion");
        assert_eq!(json["detail"], "username involved: mallory");
    }

    #[test]
    fn payload_omits_absent_fields() {
        let payload = AlertPayload::new(AlertKind::Test, 0, None, None);
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("evidence_ref").is_none());
        assert!(json.get("detail").is_none());
    }

    #[test]
    fn unconfigured_memory_notifier_sends_nothing() {
        let notifier = MemoryNotifier::unconfigured();
        assert!(!notifier.send_alert(AlertKind::Intrusion, 1, None, None));
        assert!(notifier.sent().is_empty());
    }

    #[test]
    fn failing_memory_notifier_reports_false() {
        let notifier = MemoryNotifier::new();
        notifier.set_failing(true);
        assert!(!notifier.send_alert(AlertKind::Intrusion, 1, None, None));
        notifier.set_failing(false);
        assert!(notifier.send_alert(AlertKind::Intrusion, 1, None, None));
        assert_eq!(notifier.sent().len(), 1);
    }
}

//! Front-end facing composition of the gate, the blocking engine and the
//! intrusion pipeline.
//!
//! The core components do not record their own outcomes for device toggles;
//! this is where those outcomes are written to the audit log.

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::auth::{AuthenticationGate, Session};
use crate::capture::{CaptureDevice, SyntheticCamera, SyntheticCameraConfig};
use crate::config::{CaptureSettings, GuardConfig, IntrusionSettings};
use crate::device::{
    default_methods, AggregateBlockStatus, DeviceAccessController, DeviceState, FilePolicyStore,
    ProcessPrivilege, ToggleOutcome,
};
use crate::error::GuardError;
use crate::intrusion::{EvidenceReference, IntrusionResponsePipeline, SYSTEM_IDENTITY};
use crate::notify::{AlertKind, MqttNotifier, Notifier};
use crate::storage::{AuditAction, AuditLog, SqliteAuditLog};

/// When a rejected login counts as an attack in progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FailurePolicy {
    pub window_minutes: u64,
    pub max_attempts: usize,
    pub escalate: bool,
}

impl From<&IntrusionSettings> for FailurePolicy {
    fn from(settings: &IntrusionSettings) -> Self {
        Self {
            window_minutes: settings.failure_window_minutes,
            max_attempts: settings.max_failed_attempts,
            escalate: settings.escalate_on_repeated_failures,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoginOutcome {
    Authenticated(Session),
    Rejected {
        evidence: Option<EvidenceReference>,
        repeated_failures: bool,
        escalated: bool,
    },
}

impl LoginOutcome {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, LoginOutcome::Authenticated(_))
    }
}

pub struct GuardService {
    store: Arc<dyn AuditLog>,
    gate: AuthenticationGate,
    controller: DeviceAccessController,
    pipeline: IntrusionResponsePipeline,
    notifier: Arc<dyn Notifier>,
    policy: FailurePolicy,
}

impl GuardService {
    pub fn new(
        store: Arc<dyn AuditLog>,
        controller: DeviceAccessController,
        pipeline: IntrusionResponsePipeline,
        notifier: Arc<dyn Notifier>,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            gate: AuthenticationGate::new(store.clone()),
            store,
            controller,
            pipeline,
            notifier,
            policy,
        }
    }

    /// Builds the production wiring: SQLite audit log, file-backed policy
    /// store, process privilege check and an MQTT notifier (configured only
    /// when settings are present and the broker is reachable).
    pub fn open(config: &GuardConfig) -> Result<Self> {
        let store: Arc<dyn AuditLog> = Arc::new(
            SqliteAuditLog::open(&config.db_path)
                .with_context(|| format!("open audit log {}", config.db_path))?,
        );
        let device = capture_device(&config.capture)?;
        let policy_store = Arc::new(FilePolicyStore::open(&config.policy_path)?);
        let methods = default_methods(
            policy_store,
            config.lock_file_path(),
            &config.blocking.consent_apps,
        );
        let controller = DeviceAccessController::new(
            methods,
            device.clone(),
            Arc::new(ProcessPrivilege),
            config.blocking.quorum,
            config.blocking.status_ttl,
        )?;
        if controller.restore_intent() == DeviceState::Disabled {
            log::info!("camera block found in force");
        }

        let mqtt = MqttNotifier::new();
        if let Some(settings) = &config.notifier {
            if !mqtt.configure(settings.clone()) {
                log::warn!("alerts disabled: notifier could not be configured");
            }
        }
        let notifier: Arc<dyn Notifier> = Arc::new(mqtt);

        let pipeline = IntrusionResponsePipeline::new(
            store.clone(),
            device,
            notifier.clone(),
            config.media_dir.clone(),
            config.capture.video_duration,
        );
        Ok(Self::new(
            store,
            controller,
            pipeline,
            notifier,
            FailurePolicy::from(&config.intrusion),
        ))
    }

    pub fn gate(&self) -> &AuthenticationGate {
        &self.gate
    }

    pub fn controller(&self) -> &DeviceAccessController {
        &self.controller
    }

    pub fn pipeline(&self) -> &IntrusionResponsePipeline {
        &self.pipeline
    }

    pub fn store(&self) -> &Arc<dyn AuditLog> {
        &self.store
    }

    /// First-run setup with password strength enforced.
    pub fn setup(&self, username: &str, password: &str) -> Result<()> {
        if username.trim().is_empty() {
            return Err(GuardError::validation("username must not be empty").into());
        }
        let (strong, reason) = AuthenticationGate::validate_password_strength(password);
        if !strong {
            return Err(GuardError::validation(reason).into());
        }
        if !self.gate.setup_initial_credential(username, password) {
            return Err(GuardError::validation(format!(
                "could not create credential for {}",
                username
            ))
            .into());
        }
        Ok(())
    }

    pub fn login(&self, username: &str, password: &str) -> LoginOutcome {
        if self.gate.authenticate(username, password) {
            self.record(username, &AuditAction::AuthSuccess);
            if let Some(session) = self.gate.current_session() {
                return LoginOutcome::Authenticated(session);
            }
        }

        let evidence = self.pipeline.handle_authentication_failure(username);
        let repeated_failures = self.pipeline.detect_repeated_failures(
            username,
            self.policy.window_minutes,
            self.policy.max_attempts,
        );
        let escalated = repeated_failures && self.policy.escalate && self.escalate(username);
        LoginOutcome::Rejected {
            evidence,
            repeated_failures,
            escalated,
        }
    }

    fn escalate(&self, username: &str) -> bool {
        log::warn!("repeated failures for {}; disabling camera", username);
        let outcome = self.controller.disable();
        self.record_toggle(SYSTEM_IDENTITY, false, &outcome);
        let detail = format!(
            "{} failed attempts by {} within {} minutes; camera disable {}",
            self.policy.max_attempts, username, self.policy.window_minutes, outcome
        );
        let timestamp = crate::now_s().unwrap_or_default();
        self.notifier
            .send_alert(AlertKind::RepeatedFailures, timestamp, None, Some(&detail));
        outcome.is_success()
    }

    pub fn logout(&self) {
        if let Some(session) = self.gate.current_session() {
            self.gate.logout();
            self.record(&session.username, &AuditAction::Logout);
        }
    }

    /// Requires an authenticated session; without one nothing is touched.
    pub fn set_camera_enabled(&self, enabled: bool) -> ToggleOutcome {
        let Some(session) = self.gate.current_session() else {
            log::warn!("camera toggle refused: no authenticated session");
            return ToggleOutcome::PrivilegeRequired;
        };
        let outcome = if enabled {
            self.controller.enable()
        } else {
            self.controller.disable()
        };
        self.record_toggle(&session.username, enabled, &outcome);
        outcome
    }

    pub fn blocking_status(&self) -> AggregateBlockStatus {
        self.controller.get_blocking_status()
    }

    pub fn device_state(&self) -> DeviceState {
        self.controller.state()
    }

    fn record_toggle(&self, identity: &str, enabled: bool, outcome: &ToggleOutcome) {
        let action = match (enabled, outcome.is_success()) {
            (true, true) => AuditAction::DeviceEnabled,
            (true, false) => AuditAction::DeviceEnableFailed,
            (false, true) => AuditAction::DeviceDisabled,
            (false, false) => AuditAction::DeviceDisableFailed,
        };
        self.record(identity, &action);
    }

    fn record(&self, identity: &str, action: &AuditAction) {
        if let Err(e) = self.store.append_attempt(identity, action) {
            log::error!("failed to record {} for {}: {:#}", action.code(), identity, e);
        }
    }
}

/// `stub://` ids select the synthetic camera; anything else is a V4L2 device
/// path when built with `capture-v4l2`.
pub fn capture_device(settings: &CaptureSettings) -> Result<Arc<dyn CaptureDevice>> {
    if settings.device.starts_with("stub://") {
        return Ok(Arc::new(SyntheticCamera::new(SyntheticCameraConfig {
            device: settings.device.clone(),
            width: settings.width,
            height: settings.height,
            fps: settings.fps,
            ..SyntheticCameraConfig::default()
        })));
    }
    open_hardware_device(settings)
}

#[cfg(feature = "capture-v4l2")]
fn open_hardware_device(settings: &CaptureSettings) -> Result<Arc<dyn CaptureDevice>> {
    use crate::capture::{V4l2Camera, V4l2Config};
    Ok(Arc::new(V4l2Camera::new(V4l2Config {
        device: settings.device.clone(),
        fps: settings.fps,
        width: settings.width,
        height: settings.height,
    })))
}

#[cfg(not(feature = "capture-v4l2"))]
fn open_hardware_device(settings: &CaptureSettings) -> Result<Arc<dyn CaptureDevice>> {
    Err(GuardError::configuration(format!(
        "device {} requires the capture-v4l2 feature",
        settings.device
    ))
    .into())
}

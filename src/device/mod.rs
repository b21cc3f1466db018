//! Device blocking engine.
//!
//! Access to the capture device is restricted through several independent
//! [`BlockingMethod`]s. `disable` applies all of them and `enable` reverts all
//! of them; either succeeds when at least `quorum` methods succeed. Both are
//! refused without elevated privilege, before anything is touched.
//!
//! The aggregate status is probed on demand and cached for a short TTL.

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::capture::CaptureDevice;
use crate::error::GuardError;

pub mod methods;
pub mod policy;

pub use methods::{default_methods, AppConsent, GroupPolicy, LockFile, PrivacyConsent};
pub use policy::{FilePolicyStore, MemoryPolicyStore, PolicyValue, SystemPolicyStore};

pub const DEFAULT_QUORUM: usize = 2;
pub const DEFAULT_STATUS_TTL: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum BlockingMethodKind {
    PrivacyConsent,
    GroupPolicy,
    AppConsent,
    LockFile,
}

impl BlockingMethodKind {
    pub fn name(self) -> &'static str {
        match self {
            BlockingMethodKind::PrivacyConsent => "privacy_consent",
            BlockingMethodKind::GroupPolicy => "group_policy",
            BlockingMethodKind::AppConsent => "app_consent",
            BlockingMethodKind::LockFile => "lock_file",
        }
    }
}

impl fmt::Display for BlockingMethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One enforcement mechanism. Implementations are idempotent and independent
/// of each other.
pub trait BlockingMethod: Send + Sync {
    fn kind(&self) -> BlockingMethodKind;
    fn apply(&self) -> Result<()>;
    fn revert(&self) -> Result<()>;
    fn is_applied(&self) -> Result<bool>;
}

pub trait PrivilegeCheck: Send + Sync {
    fn is_elevated(&self) -> bool;
}

/// Elevation of the running process: effective uid 0 on Unix.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessPrivilege;

impl PrivilegeCheck for ProcessPrivilege {
    #[cfg(unix)]
    fn is_elevated(&self) -> bool {
        // SAFETY: geteuid has no preconditions and cannot fail.
        unsafe { libc::geteuid() == 0 }
    }

    #[cfg(not(unix))]
    fn is_elevated(&self) -> bool {
        false
    }
}

#[derive(Clone, Copy, Debug)]
pub struct StaticPrivilege(pub bool);

impl PrivilegeCheck for StaticPrivilege {
    fn is_elevated(&self) -> bool {
        self.0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AggregateBlockStatus {
    pub per_method: BTreeMap<BlockingMethodKind, bool>,
    pub device_reachable: bool,
    pub probed_at: u64,
}

impl AggregateBlockStatus {
    pub fn applied_count(&self) -> usize {
        self.per_method.values().filter(|applied| **applied).count()
    }
}

/// Single cached status entry.
#[derive(Clone, Debug, Default)]
pub struct StatusCache {
    pub value: Option<AggregateBlockStatus>,
    pub expires_at: Option<Instant>,
}

impl StatusCache {
    pub fn is_stale(&self, now: Instant) -> bool {
        match (&self.value, self.expires_at) {
            (Some(_), Some(expires_at)) => now >= expires_at,
            _ => true,
        }
    }

    pub fn store(&mut self, value: AggregateBlockStatus, now: Instant, ttl: Duration) {
        self.value = Some(value);
        self.expires_at = Some(now + ttl);
    }

    pub fn clear(&mut self) {
        self.value = None;
        self.expires_at = None;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum DeviceState {
    Enabled,
    Disabled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToggleOutcome {
    Applied {
        succeeded: usize,
        total: usize,
    },
    QuorumNotMet {
        succeeded: usize,
        total: usize,
        required: usize,
    },
    PrivilegeRequired,
}

impl ToggleOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ToggleOutcome::Applied { .. })
    }
}

impl fmt::Display for ToggleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToggleOutcome::Applied { succeeded, total } => {
                write!(f, "applied ({}/{} methods)", succeeded, total)
            }
            ToggleOutcome::QuorumNotMet {
                succeeded,
                total,
                required,
            } => write!(
                f,
                "quorum not met ({}/{} methods, {} required)",
                succeeded, total, required
            ),
            ToggleOutcome::PrivilegeRequired => f.write_str("elevated privilege required"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Apply,
    Revert,
}

pub struct DeviceAccessController {
    methods: Vec<Box<dyn BlockingMethod>>,
    device: Arc<dyn CaptureDevice>,
    privilege: Arc<dyn PrivilegeCheck>,
    quorum: usize,
    ttl: Duration,
    cache: Mutex<StatusCache>,
    intended_disabled: AtomicBool,
    toggle: Mutex<()>,
}

impl DeviceAccessController {
    pub fn new(
        methods: Vec<Box<dyn BlockingMethod>>,
        device: Arc<dyn CaptureDevice>,
        privilege: Arc<dyn PrivilegeCheck>,
        quorum: usize,
        ttl: Duration,
    ) -> Result<Self> {
        if methods.is_empty() {
            return Err(GuardError::validation("at least one blocking method is required").into());
        }
        if quorum == 0 || quorum > methods.len() {
            return Err(GuardError::validation(format!(
                "quorum must be between 1 and {}, got {}",
                methods.len(),
                quorum
            ))
            .into());
        }
        Ok(Self {
            methods,
            device,
            privilege,
            quorum,
            ttl,
            cache: Mutex::new(StatusCache::default()),
            intended_disabled: AtomicBool::new(false),
            toggle: Mutex::new(()),
        })
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    /// Reverts every method. On failure the device may still be restricted
    /// and the intended-disabled flag is kept.
    pub fn enable(&self) -> ToggleOutcome {
        let outcome = self.toggle(Direction::Revert);
        match outcome {
            ToggleOutcome::Applied { succeeded, total } => {
                self.intended_disabled.store(false, Ordering::SeqCst);
                log::info!("camera enabled ({}/{} methods)", succeeded, total);
            }
            ToggleOutcome::QuorumNotMet { .. } => {
                log::error!("camera enable failed: {}; device may still be restricted", outcome);
            }
            ToggleOutcome::PrivilegeRequired => {
                log::error!("administrator privileges required to enable camera");
            }
        }
        outcome
    }

    /// Applies every method. The intended-disabled flag is set before the
    /// first method is attempted and stays set on failure.
    pub fn disable(&self) -> ToggleOutcome {
        let outcome = self.toggle(Direction::Apply);
        match outcome {
            ToggleOutcome::Applied { succeeded, total } => {
                log::info!("camera disabled ({}/{} methods)", succeeded, total);
            }
            ToggleOutcome::QuorumNotMet { .. } => {
                log::error!("camera disable failed: {}", outcome);
            }
            ToggleOutcome::PrivilegeRequired => {
                log::error!("administrator privileges required to disable camera");
            }
        }
        outcome
    }

    fn toggle(&self, direction: Direction) -> ToggleOutcome {
        let _serial = match self.toggle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !self.privilege.is_elevated() {
            return ToggleOutcome::PrivilegeRequired;
        }

        self.clear_status_cache();
        if direction == Direction::Apply {
            self.intended_disabled.store(true, Ordering::SeqCst);
        }

        let total = self.methods.len();
        let mut succeeded = 0usize;
        for method in &self.methods {
            let result = match direction {
                Direction::Apply => method.apply(),
                Direction::Revert => method.revert(),
            };
            match result {
                Ok(()) => {
                    succeeded += 1;
                    log::debug!("{:?} via {} succeeded", direction, method.kind());
                }
                Err(e) => log::warn!("{:?} via {} failed: {:#}", direction, method.kind(), e),
            }
        }

        if succeeded >= self.quorum {
            ToggleOutcome::Applied { succeeded, total }
        } else {
            ToggleOutcome::QuorumNotMet {
                succeeded,
                total,
                required: self.quorum,
            }
        }
    }

    /// Cached aggregate status, re-probed once older than the TTL. A method
    /// whose probe fails is reported as not applied.
    pub fn get_blocking_status(&self) -> AggregateBlockStatus {
        let now = Instant::now();
        if let Ok(cache) = self.cache.lock() {
            if !cache.is_stale(now) {
                if let Some(value) = &cache.value {
                    return value.clone();
                }
            }
        }

        let status = self.probe();
        match self.cache.lock() {
            Ok(mut cache) => cache.store(status.clone(), Instant::now(), self.ttl),
            Err(_) => log::warn!("status cache lock poisoned; returning uncached status"),
        }
        status
    }

    fn probe(&self) -> AggregateBlockStatus {
        let mut per_method = BTreeMap::new();
        for method in &self.methods {
            let applied = match method.is_applied() {
                Ok(applied) => applied,
                Err(e) => {
                    log::warn!("status probe of {} failed: {:#}", method.kind(), e);
                    false
                }
            };
            per_method.insert(method.kind(), applied);
        }
        AggregateBlockStatus {
            per_method,
            device_reachable: self.device.probe_reachable(),
            probed_at: crate::now_s().unwrap_or_default(),
        }
    }

    pub fn clear_status_cache(&self) {
        match self.cache.lock() {
            Ok(mut cache) => cache.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }

    /// Marks the camera as intended-disabled when a fresh probe finds the
    /// block in force (quorum of methods applied). Used at startup, since the
    /// flag itself is not persisted.
    pub fn restore_intent(&self) -> DeviceState {
        self.clear_status_cache();
        let status = self.get_blocking_status();
        if status.applied_count() >= self.quorum {
            self.intended_disabled.store(true, Ordering::SeqCst);
        }
        self.state()
    }

    pub fn intended_disabled(&self) -> bool {
        self.intended_disabled.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> DeviceState {
        if self.intended_disabled() {
            DeviceState::Disabled
        } else {
            DeviceState::Enabled
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{SyntheticCamera, SyntheticCameraConfig};
    use anyhow::anyhow;
    use std::sync::atomic::AtomicUsize;

    struct FakeMethod {
        kind: BlockingMethodKind,
        applied: AtomicBool,
        failing: AtomicBool,
        calls: AtomicUsize,
        probes: AtomicUsize,
    }

    impl FakeMethod {
        fn new(kind: BlockingMethodKind, failing: bool) -> Arc<Self> {
            Arc::new(Self {
                kind,
                applied: AtomicBool::new(false),
                failing: AtomicBool::new(failing),
                calls: AtomicUsize::new(0),
                probes: AtomicUsize::new(0),
            })
        }

        fn set(&self, applied: bool) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(anyhow!("{} unavailable", self.kind));
            }
            self.applied.store(applied, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Shared(Arc<FakeMethod>);

    impl BlockingMethod for Shared {
        fn kind(&self) -> BlockingMethodKind {
            self.0.kind
        }
        fn apply(&self) -> Result<()> {
            self.0.set(true)
        }
        fn revert(&self) -> Result<()> {
            self.0.set(false)
        }
        fn is_applied(&self) -> Result<bool> {
            self.0.probes.fetch_add(1, Ordering::SeqCst);
            Ok(self.0.applied.load(Ordering::SeqCst))
        }
    }

    const KINDS: [BlockingMethodKind; 4] = [
        BlockingMethodKind::PrivacyConsent,
        BlockingMethodKind::GroupPolicy,
        BlockingMethodKind::AppConsent,
        BlockingMethodKind::LockFile,
    ];

    fn controller(
        failing: usize,
        elevated: bool,
        ttl: Duration,
    ) -> (DeviceAccessController, Vec<Arc<FakeMethod>>) {
        let fakes: Vec<_> = KINDS
            .iter()
            .enumerate()
            .map(|(i, kind)| FakeMethod::new(*kind, i < failing))
            .collect();
        let methods: Vec<Box<dyn BlockingMethod>> = fakes
            .iter()
            .map(|fake| Box::new(Shared(fake.clone())) as Box<dyn BlockingMethod>)
            .collect();
        let camera = Arc::new(SyntheticCamera::new(SyntheticCameraConfig::default()));
        let controller = DeviceAccessController::new(
            methods,
            camera,
            Arc::new(StaticPrivilege(elevated)),
            DEFAULT_QUORUM,
            ttl,
        )
        .expect("controller");
        (controller, fakes)
    }

    #[test]
    fn two_of_four_meets_quorum() {
        let (controller, _) = controller(2, true, DEFAULT_STATUS_TTL);
        let outcome = controller.disable();
        assert_eq!(
            outcome,
            ToggleOutcome::Applied {
                succeeded: 2,
                total: 4
            }
        );
        assert!(controller.intended_disabled());
        assert_eq!(controller.state(), DeviceState::Disabled);
    }

    #[test]
    fn one_of_four_misses_quorum_but_keeps_intent() {
        let (controller, fakes) = controller(3, true, DEFAULT_STATUS_TTL);
        let outcome = controller.disable();
        assert_eq!(
            outcome,
            ToggleOutcome::QuorumNotMet {
                succeeded: 1,
                total: 4,
                required: 2
            }
        );
        assert!(!outcome.is_success());
        assert!(controller.intended_disabled());
        // every method is attempted even after failures
        assert!(fakes.iter().all(|f| f.calls.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn enable_is_symmetric() {
        let (controller, fakes) = controller(0, true, DEFAULT_STATUS_TTL);
        assert!(controller.disable().is_success());

        fakes[0].failing.store(true, Ordering::SeqCst);
        fakes[1].failing.store(true, Ordering::SeqCst);
        fakes[2].failing.store(true, Ordering::SeqCst);
        assert!(!controller.enable().is_success());
        assert!(controller.intended_disabled());

        fakes[2].failing.store(false, Ordering::SeqCst);
        assert!(controller.enable().is_success());
        assert!(!controller.intended_disabled());
        assert_eq!(controller.state(), DeviceState::Enabled);
    }

    #[test]
    fn disable_twice_is_idempotent() {
        let (controller, _) = controller(0, true, DEFAULT_STATUS_TTL);
        assert!(controller.disable().is_success());
        let first = controller.get_blocking_status();
        assert!(controller.disable().is_success());
        let second = controller.get_blocking_status();
        assert_eq!(first.per_method, second.per_method);
        assert_eq!(first.applied_count(), 4);
    }

    #[test]
    fn missing_privilege_has_no_side_effects() {
        let (controller, fakes) = controller(0, false, DEFAULT_STATUS_TTL);
        let before = controller.get_blocking_status();
        assert_eq!(controller.disable(), ToggleOutcome::PrivilegeRequired);
        assert_eq!(controller.enable(), ToggleOutcome::PrivilegeRequired);
        assert!(!controller.intended_disabled());
        assert!(fakes.iter().all(|f| f.calls.load(Ordering::SeqCst) == 0));
        // cache untouched: served without another probe
        let probes: usize = fakes.iter().map(|f| f.probes.load(Ordering::SeqCst)).sum();
        assert_eq!(controller.get_blocking_status(), before);
        let after: usize = fakes.iter().map(|f| f.probes.load(Ordering::SeqCst)).sum();
        assert_eq!(probes, after);
    }

    #[test]
    fn status_is_cached_until_invalidated() {
        let (controller, fakes) = controller(0, true, Duration::from_secs(60));
        controller.get_blocking_status();
        controller.get_blocking_status();
        assert_eq!(fakes[0].probes.load(Ordering::SeqCst), 1);

        controller.clear_status_cache();
        controller.get_blocking_status();
        assert_eq!(fakes[0].probes.load(Ordering::SeqCst), 2);

        assert!(controller.disable().is_success());
        let status = controller.get_blocking_status();
        assert_eq!(fakes[0].probes.load(Ordering::SeqCst), 3);
        assert_eq!(status.applied_count(), 4);
    }

    #[test]
    fn zero_ttl_always_probes() {
        let (controller, fakes) = controller(0, true, Duration::ZERO);
        controller.get_blocking_status();
        controller.get_blocking_status();
        assert_eq!(fakes[0].probes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cache_staleness_is_pure() {
        let now = Instant::now();
        let mut cache = StatusCache::default();
        assert!(cache.is_stale(now));
        let status = AggregateBlockStatus {
            per_method: BTreeMap::new(),
            device_reachable: true,
            probed_at: 0,
        };
        cache.store(status, now, Duration::from_secs(5));
        assert!(!cache.is_stale(now + Duration::from_secs(4)));
        assert!(cache.is_stale(now + Duration::from_secs(5)));
        cache.clear();
        assert!(cache.is_stale(now));
    }

    #[test]
    fn status_reports_device_reachability() {
        let camera = Arc::new(SyntheticCamera::new(SyntheticCameraConfig::default()));
        camera.set_reachable(false);
        let methods: Vec<Box<dyn BlockingMethod>> = KINDS
            .iter()
            .map(|kind| Box::new(Shared(FakeMethod::new(*kind, false))) as Box<dyn BlockingMethod>)
            .collect();
        let controller = DeviceAccessController::new(
            methods,
            camera,
            Arc::new(StaticPrivilege(true)),
            DEFAULT_QUORUM,
            DEFAULT_STATUS_TTL,
        )
        .expect("controller");
        assert!(!controller.get_blocking_status().device_reachable);
    }

    #[test]
    fn intent_is_restored_from_applied_methods() {
        let (controller, fakes) = controller(0, true, DEFAULT_STATUS_TTL);
        assert_eq!(controller.restore_intent(), DeviceState::Enabled);

        fakes[0].applied.store(true, Ordering::SeqCst);
        fakes[3].applied.store(true, Ordering::SeqCst);
        assert_eq!(controller.restore_intent(), DeviceState::Disabled);
        assert!(controller.intended_disabled());
    }

    #[test]
    fn quorum_is_validated() {
        let camera: Arc<dyn CaptureDevice> =
            Arc::new(SyntheticCamera::new(SyntheticCameraConfig::default()));
        let one: Vec<Box<dyn BlockingMethod>> = vec![Box::new(Shared(FakeMethod::new(
            BlockingMethodKind::LockFile,
            false,
        )))];
        assert!(DeviceAccessController::new(
            one,
            camera,
            Arc::new(StaticPrivilege(true)),
            2,
            DEFAULT_STATUS_TTL
        )
        .is_err());
    }
}

//! The four independent blocking methods.

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use super::policy::{PolicyValue, SystemPolicyStore};
use super::{BlockingMethod, BlockingMethodKind};

pub const MACHINE_CONSENT_SCOPE: &str =
    "HKLM/SOFTWARE/Microsoft/Windows/CurrentVersion/CapabilityAccessManager/ConsentStore/webcam";
pub const USER_CONSENT_SCOPE: &str =
    "HKCU/SOFTWARE/Microsoft/Windows/CurrentVersion/CapabilityAccessManager/ConsentStore/webcam";
pub const CAMERA_POLICY_SCOPE: &str = "HKLM/SOFTWARE/Policies/Microsoft/Camera";
pub const CONSENT_VALUE: &str = "Value";
pub const ALLOW_CAMERA_VALUE: &str = "AllowCamera";
pub const LOCK_FILE_NAME: &str = "camera_blocked.lock";

pub const DEFAULT_CONSENT_APPS: &[&str] = &["Microsoft.WindowsCamera_8wekyb3d8bbwe", "NonPackaged"];

const DENY: &str = "Deny";
const ALLOW: &str = "Allow";

/// Builds the standard method set over `store`, with the lock file at
/// `lock_path`.
pub fn default_methods(
    store: Arc<dyn SystemPolicyStore>,
    lock_path: PathBuf,
    consent_apps: &[String],
) -> Vec<Box<dyn BlockingMethod>> {
    vec![
        Box::new(PrivacyConsent::new(store.clone())),
        Box::new(GroupPolicy::new(store.clone())),
        Box::new(AppConsent::new(store, consent_apps.to_vec())),
        Box::new(LockFile::new(lock_path)),
    ]
}

/// Machine-wide consent value, mirrored into the user scope when possible.
pub struct PrivacyConsent {
    store: Arc<dyn SystemPolicyStore>,
}

impl PrivacyConsent {
    pub fn new(store: Arc<dyn SystemPolicyStore>) -> Self {
        Self { store }
    }

    fn write(&self, value: &str) -> Result<()> {
        self.store
            .set(MACHINE_CONSENT_SCOPE, CONSENT_VALUE, PolicyValue::text(value))
            .context("machine consent write failed")?;
        if let Err(e) = self
            .store
            .set(USER_CONSENT_SCOPE, CONSENT_VALUE, PolicyValue::text(value))
        {
            log::debug!("user consent write skipped: {}", e);
        }
        Ok(())
    }
}

impl BlockingMethod for PrivacyConsent {
    fn kind(&self) -> BlockingMethodKind {
        BlockingMethodKind::PrivacyConsent
    }

    fn apply(&self) -> Result<()> {
        self.write(DENY)
    }

    fn revert(&self) -> Result<()> {
        self.write(ALLOW)
    }

    fn is_applied(&self) -> Result<bool> {
        Ok(self.store.get(MACHINE_CONSENT_SCOPE, CONSENT_VALUE)? == Some(PolicyValue::text(DENY)))
    }
}

/// `AllowCamera` policy value: 0 blocks, 1 allows, absent means allowed.
pub struct GroupPolicy {
    store: Arc<dyn SystemPolicyStore>,
}

impl GroupPolicy {
    pub fn new(store: Arc<dyn SystemPolicyStore>) -> Self {
        Self { store }
    }
}

impl BlockingMethod for GroupPolicy {
    fn kind(&self) -> BlockingMethodKind {
        BlockingMethodKind::GroupPolicy
    }

    fn apply(&self) -> Result<()> {
        self.store
            .set(CAMERA_POLICY_SCOPE, ALLOW_CAMERA_VALUE, PolicyValue::Number(0))
    }

    fn revert(&self) -> Result<()> {
        if self.store.get(CAMERA_POLICY_SCOPE, ALLOW_CAMERA_VALUE)?.is_none() {
            return Ok(());
        }
        self.store
            .set(CAMERA_POLICY_SCOPE, ALLOW_CAMERA_VALUE, PolicyValue::Number(1))
    }

    fn is_applied(&self) -> Result<bool> {
        Ok(self.store.get(CAMERA_POLICY_SCOPE, ALLOW_CAMERA_VALUE)? == Some(PolicyValue::Number(0)))
    }
}

/// Per-application consent entries below the machine consent scope.
pub struct AppConsent {
    store: Arc<dyn SystemPolicyStore>,
    apps: Vec<String>,
}

impl AppConsent {
    pub fn new(store: Arc<dyn SystemPolicyStore>, apps: Vec<String>) -> Self {
        Self { store, apps }
    }

    fn scope(app: &str) -> String {
        format!("{}/{}", MACHINE_CONSENT_SCOPE, app)
    }

    fn write_all(&self, value: &str, create_missing: bool) -> Result<()> {
        let mut attempted = 0usize;
        let mut failed = 0usize;
        for app in &self.apps {
            let scope = Self::scope(app);
            if !create_missing {
                match self.store.get(&scope, CONSENT_VALUE) {
                    Ok(None) => continue,
                    Ok(Some(_)) => {}
                    Err(e) => {
                        log::warn!("app consent lookup for {} failed: {}", app, e);
                        attempted += 1;
                        failed += 1;
                        continue;
                    }
                }
            }
            attempted += 1;
            if let Err(e) = self.store.set(&scope, CONSENT_VALUE, PolicyValue::text(value)) {
                log::warn!("app consent write for {} failed: {}", app, e);
                failed += 1;
            }
        }
        if attempted > 0 && failed == attempted {
            return Err(anyhow!("no app consent entry could be written"));
        }
        Ok(())
    }
}

impl BlockingMethod for AppConsent {
    fn kind(&self) -> BlockingMethodKind {
        BlockingMethodKind::AppConsent
    }

    fn apply(&self) -> Result<()> {
        if self.apps.is_empty() {
            return Err(anyhow!("no applications configured for app consent"));
        }
        self.write_all(DENY, true)
    }

    fn revert(&self) -> Result<()> {
        self.write_all(ALLOW, false)
    }

    fn is_applied(&self) -> Result<bool> {
        if self.apps.is_empty() {
            return Ok(false);
        }
        for app in &self.apps {
            if self.store.get(&Self::scope(app), CONSENT_VALUE)? != Some(PolicyValue::text(DENY)) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Marker file whose presence means the device is intentionally blocked.
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl BlockingMethod for LockFile {
    fn kind(&self) -> BlockingMethodKind {
        BlockingMethodKind::LockFile
    }

    fn apply(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let body = format!(
            "Camera blocked at {}\nThis file indicates the camera is intentionally blocked.\n",
            chrono::Local::now().to_rfc3339()
        );
        fs::write(&self.path, body)
            .with_context(|| format!("write lock file {}", self.path.display()))
    }

    fn revert(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow!("remove lock file {}: {}", self.path.display(), e)),
        }
    }

    fn is_applied(&self) -> Result<bool> {
        Ok(self.path.exists())
    }
}

//! System policy values the blocking methods operate on.
//!
//! Values are addressed by a scope path (for example
//! `HKLM/SOFTWARE/Policies/Microsoft/Camera`) and a value name. Hosts without a
//! native policy database keep them in a JSON document via [`FilePolicyStore`].

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PolicyValue {
    Number(u32),
    Text(String),
}

impl PolicyValue {
    pub fn text(value: &str) -> Self {
        PolicyValue::Text(value.to_string())
    }
}

pub trait SystemPolicyStore: Send + Sync {
    fn get(&self, scope: &str, name: &str) -> Result<Option<PolicyValue>>;

    /// Creates the scope if needed.
    fn set(&self, scope: &str, name: &str, value: PolicyValue) -> Result<()>;

    /// Returns whether a value was present.
    fn remove(&self, scope: &str, name: &str) -> Result<bool>;
}

type PolicyDocument = BTreeMap<String, BTreeMap<String, PolicyValue>>;

/// Policy values persisted as one JSON document, rewritten atomically on
/// every change.
pub struct FilePolicyStore {
    path: PathBuf,
    doc: Mutex<PolicyDocument>,
}

impl FilePolicyStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let doc = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("read policy file {}", path.display()))?;
            if raw.trim().is_empty() {
                PolicyDocument::new()
            } else {
                serde_json::from_str(&raw)
                    .with_context(|| format!("parse policy file {}", path.display()))?
            }
        } else {
            PolicyDocument::new()
        };
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, PolicyDocument>> {
        self.doc
            .lock()
            .map_err(|_| anyhow!("policy store lock poisoned"))
    }

    fn persist(&self, doc: &PolicyDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = serde_json::to_vec_pretty(doc)?;
        write_atomic(&self.path, &data)
            .with_context(|| format!("write policy file {}", self.path.display()))
    }
}

impl SystemPolicyStore for FilePolicyStore {
    fn get(&self, scope: &str, name: &str) -> Result<Option<PolicyValue>> {
        let doc = self.lock()?;
        Ok(doc.get(scope).and_then(|values| values.get(name)).cloned())
    }

    fn set(&self, scope: &str, name: &str, value: PolicyValue) -> Result<()> {
        let mut doc = self.lock()?;
        let mut next = doc.clone();
        next.entry(scope.to_string())
            .or_default()
            .insert(name.to_string(), value);
        self.persist(&next)?;
        *doc = next;
        Ok(())
    }

    fn remove(&self, scope: &str, name: &str) -> Result<bool> {
        let mut doc = self.lock()?;
        let present = doc
            .get(scope)
            .map(|values| values.contains_key(name))
            .unwrap_or(false);
        if !present {
            return Ok(false);
        }
        let mut next = doc.clone();
        if let Some(values) = next.get_mut(scope) {
            values.remove(name);
            if values.is_empty() {
                next.remove(scope);
            }
        }
        self.persist(&next)?;
        *doc = next;
        Ok(true)
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}

#[derive(Default)]
struct MemoryPolicyState {
    values: PolicyDocument,
    read_only_scopes: HashSet<String>,
    unavailable: bool,
}

/// In-memory policy values with fault injection.
#[derive(Default)]
pub struct MemoryPolicyStore {
    state: Mutex<MemoryPolicyState>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes and removals under `scope` (or any scope below it) fail.
    pub fn deny_writes(&self, scope: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.read_only_scopes.insert(scope.to_string());
        }
    }

    pub fn allow_writes(&self, scope: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.read_only_scopes.remove(scope);
        }
    }

    /// Every call fails while unavailable.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.unavailable = unavailable;
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryPolicyState>> {
        let state = self
            .state
            .lock()
            .map_err(|_| anyhow!("policy store lock poisoned"))?;
        if state.unavailable {
            return Err(anyhow!("policy store unavailable"));
        }
        Ok(state)
    }
}

impl MemoryPolicyState {
    fn check_writable(&self, scope: &str) -> Result<()> {
        let denied = self
            .read_only_scopes
            .iter()
            .any(|denied| scope == denied || scope.starts_with(&format!("{}/", denied)));
        if denied {
            return Err(anyhow!("access denied to policy scope {}", scope));
        }
        Ok(())
    }
}

impl SystemPolicyStore for MemoryPolicyStore {
    fn get(&self, scope: &str, name: &str) -> Result<Option<PolicyValue>> {
        let state = self.lock()?;
        Ok(state
            .values
            .get(scope)
            .and_then(|values| values.get(name))
            .cloned())
    }

    fn set(&self, scope: &str, name: &str, value: PolicyValue) -> Result<()> {
        let mut state = self.lock()?;
        state.check_writable(scope)?;
        state
            .values
            .entry(scope.to_string())
            .or_default()
            .insert(name.to_string(), value);
        Ok(())
    }

    fn remove(&self, scope: &str, name: &str) -> Result<bool> {
        let mut state = self.lock()?;
        state.check_writable(scope)?;
        Ok(state
            .values
            .get_mut(scope)
            .map(|values| values.remove(name).is_some())
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_survives_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("policy.json");
        {
            let store = FilePolicyStore::open(&path)?;
            store.set("HKLM/Camera", "AllowCamera", PolicyValue::Number(0))?;
            store.set("HKCU/webcam", "Value", PolicyValue::text("Deny"))?;
        }
        let store = FilePolicyStore::open(&path)?;
        assert_eq!(
            store.get("HKLM/Camera", "AllowCamera")?,
            Some(PolicyValue::Number(0))
        );
        assert_eq!(
            store.get("HKCU/webcam", "Value")?,
            Some(PolicyValue::text("Deny"))
        );
        assert!(!path.with_extension("tmp").exists());
        Ok(())
    }

    #[test]
    fn file_store_remove_reports_presence() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FilePolicyStore::open(dir.path().join("policy.json"))?;
        assert!(!store.remove("HKLM/Camera", "AllowCamera")?);
        store.set("HKLM/Camera", "AllowCamera", PolicyValue::Number(1))?;
        assert!(store.remove("HKLM/Camera", "AllowCamera")?);
        assert_eq!(store.get("HKLM/Camera", "AllowCamera")?, None);
        Ok(())
    }

    #[test]
    fn corrupt_policy_file_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("policy.json");
        fs::write(&path, "{not json")?;
        assert!(FilePolicyStore::open(&path).is_err());
        Ok(())
    }

    #[test]
    fn memory_store_denies_writes_below_scope() -> Result<()> {
        let store = MemoryPolicyStore::new();
        store.deny_writes("HKLM");
        assert!(store
            .set("HKLM/Camera", "AllowCamera", PolicyValue::Number(0))
            .is_err());
        assert!(store.set("HKCU/webcam", "Value", PolicyValue::text("Deny")).is_ok());
        store.allow_writes("HKLM");
        assert!(store
            .set("HKLM/Camera", "AllowCamera", PolicyValue::Number(0))
            .is_ok());
        Ok(())
    }

    #[test]
    fn unavailable_memory_store_fails_reads() {
        let store = MemoryPolicyStore::new();
        store.set_unavailable(true);
        assert!(store.get("HKLM/Camera", "AllowCamera").is_err());
    }
}

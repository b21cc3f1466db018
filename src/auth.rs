//! Credential hashing, verification and the process session slot.
//!
//! Encoded credentials are `hex(salt) || hex(sha256(salt || utf8(password)))`
//! with a 32-byte random salt.

use anyhow::{anyhow, Result};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::storage::AuditLog;

pub const SALT_LEN: usize = 32;
pub const DIGEST_LEN: usize = 32;
pub const ENCODED_LEN: usize = (SALT_LEN + DIGEST_LEN) * 2;
pub const MIN_PASSWORD_LEN: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub username: String,
    pub credential_id: i64,
    pub started_at: u64,
}

pub struct AuthenticationGate {
    store: Arc<dyn AuditLog>,
    session: Mutex<Option<Session>>,
    /// Verified against when the username is unknown so both failure paths
    /// do the same work.
    decoy_hash: String,
}

impl AuthenticationGate {
    pub fn new(store: Arc<dyn AuditLog>) -> Self {
        Self {
            store,
            session: Mutex::new(None),
            decoy_hash: Self::hash_credential("camguard-decoy", None),
        }
    }

    pub fn hash_credential(password: &str, salt: Option<&[u8; SALT_LEN]>) -> String {
        let salt = match salt {
            Some(salt) => *salt,
            None => {
                let mut fresh = [0u8; SALT_LEN];
                rand::thread_rng().fill_bytes(&mut fresh);
                fresh
            }
        };
        let digest = salted_digest(&salt, password);
        let mut encoded = hex::encode(salt);
        encoded.push_str(&hex::encode(digest));
        encoded
    }

    /// Fails closed on any malformed encoding.
    pub fn verify(password: &str, encoded: &str) -> bool {
        match decode_credential(encoded) {
            Ok((salt, stored)) => {
                let computed = salted_digest(&salt, password);
                computed[..].ct_eq(&stored[..]).into()
            }
            Err(e) => {
                log::error!("password verification failed: {}", e);
                false
            }
        }
    }

    /// First-run setup. Returns false if the user exists or the store fails;
    /// there is no update path for an existing credential.
    pub fn setup_initial_credential(&self, username: &str, password: &str) -> bool {
        match self.store.get_credential(username) {
            Ok(Some(_)) => {
                log::warn!("user {} already exists", username);
                return false;
            }
            Ok(None) => {}
            Err(e) => {
                log::error!("failed to set up initial credential: {}", e);
                return false;
            }
        }

        let encoded = Self::hash_credential(password, None);
        match self.store.create_credential(username, &encoded) {
            Ok(_) => {
                log::info!("initial credential created for user {}", username);
                true
            }
            Err(e) => {
                log::error!("failed to set up initial credential: {}", e);
                false
            }
        }
    }

    /// On success the session is replaced by `username`. On any failure the
    /// session is left as it was. Unknown users and wrong passwords take the
    /// same path and log the same line.
    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        let credential = match self.store.get_credential(username) {
            Ok(credential) => credential,
            Err(e) => {
                log::error!("credential lookup failed: {}", e);
                None
            }
        };

        let (encoded, known) = match &credential {
            Some(credential) => (credential.salted_hash.as_str(), true),
            None => (self.decoy_hash.as_str(), false),
        };
        let matches = Self::verify(password, encoded) & known;

        let Some(credential) = credential.filter(|_| matches) else {
            log::warn!("authentication failed for user {}", username);
            return false;
        };

        let session = Session {
            username: credential.username,
            credential_id: credential.id,
            started_at: crate::now_s().unwrap_or_default(),
        };
        match self.session.lock() {
            Ok(mut slot) => {
                *slot = Some(session);
                log::info!("user {} authenticated", username);
                true
            }
            Err(_) => {
                log::error!("session slot poisoned; refusing login");
                false
            }
        }
    }

    pub fn logout(&self) {
        let previous = match self.session.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(session) = previous {
            log::info!("user {} logged out", session.username);
        }
    }

    pub fn current_session(&self) -> Option<Session> {
        self.session.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.current_session().is_some()
    }

    pub fn has_credentials(&self) -> bool {
        match self.store.count_credentials() {
            Ok(count) => count > 0,
            Err(e) => {
                log::error!("error checking credential count: {}", e);
                false
            }
        }
    }

    pub fn validate_password_strength(password: &str) -> (bool, &'static str) {
        if password.chars().count() < MIN_PASSWORD_LEN {
            return (false, "Password must be at least 8 characters long");
        }
        if !password.chars().any(char::is_uppercase) {
            return (false, "Password must contain at least one uppercase letter");
        }
        if !password.chars().any(char::is_lowercase) {
            return (false, "Password must contain at least one lowercase letter");
        }
        if !password.chars().any(|c| c.is_ascii_digit()) {
            return (false, "Password must contain at least one digit");
        }
        (true, "Password is strong")
    }
}

fn salted_digest(salt: &[u8; SALT_LEN], password: &str) -> [u8; DIGEST_LEN] {
    let mut input = Zeroizing::new(Vec::with_capacity(SALT_LEN + password.len()));
    input.extend_from_slice(salt);
    input.extend_from_slice(password.as_bytes());
    Sha256::digest(input.as_slice()).into()
}

fn decode_credential(encoded: &str) -> Result<([u8; SALT_LEN], [u8; DIGEST_LEN])> {
    if encoded.len() != ENCODED_LEN {
        return Err(anyhow!(
            "malformed credential encoding: expected {} hex chars, got {}",
            ENCODED_LEN,
            encoded.len()
        ));
    }
    if !encoded.is_ascii() {
        return Err(anyhow!("malformed credential encoding: non-ascii"));
    }
    let (salt_hex, digest_hex) = encoded.split_at(SALT_LEN * 2);
    let mut salt = [0u8; SALT_LEN];
    let mut digest = [0u8; DIGEST_LEN];
    hex::decode_to_slice(salt_hex, &mut salt)
        .map_err(|e| anyhow!("malformed credential salt: {}", e))?;
    hex::decode_to_slice(digest_hex, &mut digest)
        .map_err(|e| anyhow!("malformed credential digest: {}", e))?;
    Ok((salt, digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryAuditLog;

    fn gate() -> (AuthenticationGate, Arc<InMemoryAuditLog>) {
        let store = Arc::new(InMemoryAuditLog::new());
        (AuthenticationGate::new(store.clone()), store)
    }

    #[test]
    fn hashed_password_verifies() {
        for password in ["Secret123", "", "ünïcødé Pässwörd 9", "a"] {
            let encoded = AuthenticationGate::hash_credential(password, None);
            assert_eq!(encoded.len(), ENCODED_LEN);
            assert!(AuthenticationGate::verify(password, &encoded));
        }
    }

    #[test]
    fn other_password_does_not_verify() {
        let encoded = AuthenticationGate::hash_credential("Secret123", None);
        assert!(!AuthenticationGate::verify("Secret124", &encoded));
        assert!(!AuthenticationGate::verify("secret123", &encoded));
    }

    #[test]
    fn random_salts_give_distinct_encodings() {
        let a = AuthenticationGate::hash_credential("Secret123", None);
        let b = AuthenticationGate::hash_credential("Secret123", None);
        assert_ne!(a, b);
        assert!(AuthenticationGate::verify("Secret123", &a));
        assert!(AuthenticationGate::verify("Secret123", &b));
    }

    #[test]
    fn fixed_salt_is_deterministic() {
        let salt = [7u8; SALT_LEN];
        let a = AuthenticationGate::hash_credential("Secret123", Some(&salt));
        let b = AuthenticationGate::hash_credential("Secret123", Some(&salt));
        assert_eq!(a, b);
        assert!(a.starts_with(&hex::encode(salt)));
    }

    #[test]
    fn malformed_encodings_fail_closed() {
        let good = AuthenticationGate::hash_credential("Secret123", None);
        assert!(!AuthenticationGate::verify("Secret123", ""));
        assert!(!AuthenticationGate::verify("Secret123", &good[..ENCODED_LEN - 2]));
        let mut bad_hex = good.clone();
        bad_hex.replace_range(0..2, "zz");
        assert!(!AuthenticationGate::verify("Secret123", &bad_hex));
        let mut too_long = good;
        too_long.push('0');
        assert!(!AuthenticationGate::verify("Secret123", &too_long));
    }

    #[test]
    fn setup_refuses_existing_user() {
        let (gate, store) = gate();
        assert!(gate.setup_initial_credential("admin", "Secret123"));
        let original = store.get_credential("admin").unwrap().unwrap();
        assert!(!gate.setup_initial_credential("admin", "Other456"));
        let after = store.get_credential("admin").unwrap().unwrap();
        assert_eq!(original, after);
        assert!(gate.has_credentials());
    }

    #[test]
    fn authenticate_sets_session_only_on_success() {
        let (gate, store) = gate();
        assert!(!gate.has_credentials());
        assert!(gate.setup_initial_credential("admin", "Secret123"));
        let stored = store.get_credential("admin").unwrap().unwrap();

        assert!(!gate.authenticate("admin", "wrong"));
        assert!(gate.current_session().is_none());
        assert!(!gate.authenticate("nobody", "Secret123"));
        assert!(!gate.is_authenticated());
        assert_eq!(store.get_credential("admin").unwrap().unwrap(), stored);

        assert!(gate.authenticate("admin", "Secret123"));
        let session = gate.current_session().expect("session");
        assert_eq!(session.username, "admin");
        assert_eq!(session.credential_id, stored.id);
    }

    #[test]
    fn failed_login_keeps_existing_session() {
        let (gate, _) = gate();
        assert!(gate.setup_initial_credential("admin", "Secret123"));
        assert!(gate.authenticate("admin", "Secret123"));
        assert!(!gate.authenticate("admin", "nope"));
        assert_eq!(gate.current_session().unwrap().username, "admin");
    }

    #[test]
    fn logout_is_idempotent() {
        let (gate, _) = gate();
        assert!(gate.setup_initial_credential("admin", "Secret123"));
        assert!(gate.authenticate("admin", "Secret123"));
        gate.logout();
        assert!(!gate.is_authenticated());
        gate.logout();
        assert!(!gate.is_authenticated());
    }

    #[test]
    fn password_strength_rules() {
        let check = AuthenticationGate::validate_password_strength;
        assert!(!check("Ab1").0);
        assert!(check("Ab1").1.contains("8 characters"));
        assert!(check("abcdefg1").1.contains("uppercase"));
        assert!(check("ABCDEFG1").1.contains("lowercase"));
        assert!(check("Abcdefgh").1.contains("digit"));
        assert_eq!(check("Secret123"), (true, "Password is strong"));
    }

    #[test]
    fn non_ascii_numerals_are_not_digits() {
        let check = AuthenticationGate::validate_password_strength;
        assert!(check("Abcdefg½").1.contains("digit"));
        assert!(check("Abcdefg٣").1.contains("digit"));
        assert!(check("AbcdefgⅦ").1.contains("digit"));
        assert!(check("Abcdefg½7").0);
    }
}

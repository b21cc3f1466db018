use std::sync::Arc;

use camguard::device::methods::{
    CAMERA_POLICY_SCOPE, LOCK_FILE_NAME, MACHINE_CONSENT_SCOPE, USER_CONSENT_SCOPE,
};
use camguard::device::{default_methods, DEFAULT_QUORUM, DEFAULT_STATUS_TTL};
use camguard::{
    BlockingMethodKind, CaptureDevice, DeviceAccessController, DeviceState, FilePolicyStore,
    MemoryPolicyStore, StaticPrivilege, SyntheticCamera, SyntheticCameraConfig, ToggleOutcome,
};

fn controller_over(
    store: Arc<MemoryPolicyStore>,
    dir: &tempfile::TempDir,
) -> DeviceAccessController {
    let camera: Arc<dyn CaptureDevice> =
        Arc::new(SyntheticCamera::new(SyntheticCameraConfig::default()));
    DeviceAccessController::new(
        default_methods(
            store,
            dir.path().join(LOCK_FILE_NAME),
            &["NonPackaged".to_string()],
        ),
        camera,
        Arc::new(StaticPrivilege(true)),
        DEFAULT_QUORUM,
        DEFAULT_STATUS_TTL,
    )
    .expect("controller")
}

#[test]
fn two_methods_suffice_for_disable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryPolicyStore::new());
    // machine consent scope covers both privacy consent and app consent
    store.deny_writes(MACHINE_CONSENT_SCOPE);
    let controller = controller_over(store, &dir);

    assert_eq!(
        controller.disable(),
        ToggleOutcome::Applied {
            succeeded: 2,
            total: 4
        }
    );
    let status = controller.get_blocking_status();
    assert_eq!(status.per_method[&BlockingMethodKind::GroupPolicy], true);
    assert_eq!(status.per_method[&BlockingMethodKind::LockFile], true);
    assert_eq!(status.per_method[&BlockingMethodKind::PrivacyConsent], false);
    assert_eq!(status.per_method[&BlockingMethodKind::AppConsent], false);
}

#[test]
fn one_method_is_not_enough() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryPolicyStore::new());
    store.deny_writes(MACHINE_CONSENT_SCOPE);
    store.deny_writes(CAMERA_POLICY_SCOPE);
    let controller = controller_over(store, &dir);

    assert_eq!(
        controller.disable(),
        ToggleOutcome::QuorumNotMet {
            succeeded: 1,
            total: 4,
            required: 2
        }
    );
    assert_eq!(controller.state(), DeviceState::Disabled);
}

#[test]
fn user_scope_failure_does_not_fail_privacy_consent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryPolicyStore::new());
    store.deny_writes(USER_CONSENT_SCOPE);
    let controller = controller_over(store, &dir);

    assert_eq!(
        controller.disable(),
        ToggleOutcome::Applied {
            succeeded: 4,
            total: 4
        }
    );
}

#[test]
fn enable_reverts_what_disable_applied() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryPolicyStore::new());
    let controller = controller_over(store.clone(), &dir);

    assert!(controller.disable().is_success());
    assert!(controller.disable().is_success());
    assert_eq!(controller.get_blocking_status().applied_count(), 4);

    store.deny_writes(MACHINE_CONSENT_SCOPE);
    store.deny_writes(CAMERA_POLICY_SCOPE);
    assert!(!controller.enable().is_success());
    assert!(controller.intended_disabled());

    store.allow_writes(CAMERA_POLICY_SCOPE);
    assert!(controller.enable().is_success());
    assert_eq!(controller.state(), DeviceState::Enabled);
    assert!(!dir.path().join(LOCK_FILE_NAME).exists());
}

#[test]
fn unavailable_policy_store_leaves_lock_file_only() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryPolicyStore::new());
    store.set_unavailable(true);
    let controller = controller_over(store, &dir);

    assert!(!controller.disable().is_success());
    let status = controller.get_blocking_status();
    assert_eq!(status.applied_count(), 1);
    assert!(status.per_method[&BlockingMethodKind::LockFile]);
}

#[test]
fn file_policy_store_persists_block_across_instances() {
    let dir = tempfile::tempdir().expect("tempdir");
    let policy_path = dir.path().join("camera_policy.json");
    let build = || {
        let store = Arc::new(FilePolicyStore::open(&policy_path).expect("policy store"));
        let camera: Arc<dyn CaptureDevice> =
            Arc::new(SyntheticCamera::new(SyntheticCameraConfig::default()));
        DeviceAccessController::new(
            default_methods(
                store,
                dir.path().join(LOCK_FILE_NAME),
                &["NonPackaged".to_string()],
            ),
            camera,
            Arc::new(StaticPrivilege(true)),
            DEFAULT_QUORUM,
            DEFAULT_STATUS_TTL,
        )
        .expect("controller")
    };

    assert!(build().disable().is_success());

    let restarted = build();
    assert!(!restarted.intended_disabled());
    assert_eq!(restarted.restore_intent(), DeviceState::Disabled);
    assert_eq!(restarted.get_blocking_status().applied_count(), 4);
    assert!(restarted.enable().is_success());
    assert_eq!(build().restore_intent(), DeviceState::Enabled);
}

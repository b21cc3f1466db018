use std::sync::Mutex;

use tempfile::NamedTempFile;

use camguard::config::GuardConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CAMGUARD_CONFIG",
        "CAMGUARD_DB_PATH",
        "CAMGUARD_MEDIA_DIR",
        "CAMGUARD_POLICY_PATH",
        "CAMGUARD_DEVICE",
        "CAMGUARD_VIDEO_SECS",
        "CAMGUARD_STATUS_TTL_SECS",
        "CAMGUARD_QUORUM",
        "CAMGUARD_FAILURE_WINDOW_MINUTES",
        "CAMGUARD_MAX_FAILED_ATTEMPTS",
        "CAMGUARD_RETENTION_DAYS",
        "CAMGUARD_ESCALATE",
        "CAMGUARD_MQTT_ENDPOINT",
        "CAMGUARD_ALERT_TOPICS",
        "CAMGUARD_MQTT_USERNAME",
        "CAMGUARD_MQTT_PASSWORD",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "db_path": "guard_prod.db",
            "media_dir": "/var/lib/camguard/media",
            "workers": 4,
            "capture": {
                "device": "stub://desk",
                "fps": 12,
                "width": 800,
                "height": 600,
                "video_seconds": 4
            },
            "blocking": {
                "quorum": 3,
                "status_ttl_seconds": 2,
                "consent_apps": ["NonPackaged"]
            },
            "intrusion": {
                "failure_window_minutes": 10,
                "max_failed_attempts": 5
            },
            "notifier": {
                "endpoint": "mqtt://127.0.0.1:1883",
                "recipients": ["camguard/alerts"]
            }
        }"#,
    );

    std::env::set_var("CAMGUARD_CONFIG", file.path());
    std::env::set_var("CAMGUARD_MAX_FAILED_ATTEMPTS", "2");
    std::env::set_var("CAMGUARD_ESCALATE", "yes");
    std::env::set_var("CAMGUARD_ALERT_TOPICS", "ops/camera, ,security/camera");

    let cfg = GuardConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "guard_prod.db");
    assert_eq!(cfg.media_dir, std::path::PathBuf::from("/var/lib/camguard/media"));
    assert_eq!(cfg.workers, 4);
    assert_eq!(cfg.capture.device, "stub://desk");
    assert_eq!(cfg.capture.fps, 12);
    assert_eq!(cfg.capture.width, 800);
    assert_eq!(cfg.capture.height, 600);
    assert_eq!(cfg.capture.video_duration.as_secs(), 4);
    assert_eq!(cfg.blocking.quorum, 3);
    assert_eq!(cfg.blocking.status_ttl.as_secs(), 2);
    assert_eq!(cfg.blocking.consent_apps, vec!["NonPackaged"]);
    assert_eq!(cfg.intrusion.failure_window_minutes, 10);
    assert_eq!(cfg.intrusion.max_failed_attempts, 2);
    assert!(cfg.intrusion.escalate_on_repeated_failures);
    assert_eq!(cfg.intrusion.retention_days, 30);
    let notifier = cfg.notifier.as_ref().expect("notifier settings");
    assert_eq!(notifier.endpoint, "mqtt://127.0.0.1:1883");
    assert_eq!(notifier.recipients, vec!["ops/camera", "security/camera"]);
    assert_eq!(
        cfg.lock_file_path(),
        std::path::PathBuf::from("/var/lib/camguard/media/camera_blocked.lock")
    );

    clear_env();
}

#[test]
fn defaults_apply_without_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = GuardConfig::load().expect("load defaults");
    assert_eq!(cfg.db_path, "camera_privacy.db");
    assert_eq!(cfg.media_dir, std::path::PathBuf::from("intrusion_media"));
    assert_eq!(cfg.capture.device, "stub://camera0");
    assert_eq!(cfg.capture.video_duration.as_secs(), 10);
    assert_eq!(cfg.blocking.quorum, 2);
    assert_eq!(cfg.blocking.status_ttl.as_secs(), 5);
    assert_eq!(cfg.intrusion.failure_window_minutes, 15);
    assert_eq!(cfg.intrusion.max_failed_attempts, 3);
    assert!(!cfg.intrusion.escalate_on_repeated_failures);
    assert!(cfg.notifier.is_none());
}

#[test]
fn mqtt_endpoint_from_env_creates_notifier_settings() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CAMGUARD_MQTT_ENDPOINT", "broker.local:8883");
    std::env::set_var("CAMGUARD_ALERT_TOPICS", "home/camera");
    std::env::set_var("CAMGUARD_MQTT_USERNAME", "guard");
    std::env::set_var("CAMGUARD_MQTT_PASSWORD", "hunter22");

    let cfg = GuardConfig::load().expect("load config");
    let notifier = cfg.notifier.expect("notifier settings");
    assert_eq!(notifier.endpoint, "broker.local:8883");
    assert_eq!(notifier.recipients, vec!["home/camera"]);
    let credentials = notifier.credentials.expect("credentials");
    assert_eq!(credentials.username, "guard");
    assert_eq!(credentials.password, "hunter22");
    assert!(!format!("{:?}", credentials).contains("hunter22"));

    clear_env();
}

#[test]
fn rejects_malformed_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CAMGUARD_VIDEO_SECS", "ten");
    assert!(GuardConfig::load().is_err());
    clear_env();

    std::env::set_var("CAMGUARD_ESCALATE", "maybe");
    assert!(GuardConfig::load().is_err());
    clear_env();

    std::env::set_var("CAMGUARD_QUORUM", "5");
    assert!(GuardConfig::load().is_err());
    clear_env();

    let file = write_config(r#"{ "capture": { "fps": 0 } }"#);
    std::env::set_var("CAMGUARD_CONFIG", file.path());
    assert!(GuardConfig::load().is_err());
    clear_env();
}

#[test]
fn unreadable_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config("{ not json");
    std::env::set_var("CAMGUARD_CONFIG", file.path());
    let err = GuardConfig::load().unwrap_err();
    assert!(err.to_string().contains("invalid config file"));

    std::env::set_var("CAMGUARD_CONFIG", "/nonexistent/camguard.json");
    assert!(GuardConfig::load().is_err());

    clear_env();
}

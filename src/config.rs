use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::device::methods::DEFAULT_CONSENT_APPS;
use crate::device::{DEFAULT_QUORUM, DEFAULT_STATUS_TTL};
use crate::intrusion::DEFAULT_VIDEO_DURATION;
use crate::notify::{MqttCredentials, NotifierSettings};

const DEFAULT_DB_PATH: &str = "camera_privacy.db";
const DEFAULT_MEDIA_DIR: &str = "intrusion_media";
const DEFAULT_POLICY_PATH: &str = "camera_policy.json";
const DEFAULT_DEVICE: &str = "stub://camera0";
const DEFAULT_CAPTURE_FPS: u32 = 20;
const DEFAULT_CAPTURE_WIDTH: u32 = 640;
const DEFAULT_CAPTURE_HEIGHT: u32 = 480;
const DEFAULT_FAILURE_WINDOW_MINUTES: u64 = 15;
const DEFAULT_MAX_FAILED_ATTEMPTS: usize = 3;
const DEFAULT_RETENTION_DAYS: u64 = 30;
const DEFAULT_WORKERS: usize = 2;

#[derive(Debug, Deserialize, Default)]
struct GuardConfigFile {
    db_path: Option<String>,
    media_dir: Option<PathBuf>,
    policy_path: Option<PathBuf>,
    workers: Option<usize>,
    capture: Option<CaptureConfigFile>,
    blocking: Option<BlockingConfigFile>,
    intrusion: Option<IntrusionConfigFile>,
    notifier: Option<NotifierSettings>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    device: Option<String>,
    fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    video_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct BlockingConfigFile {
    quorum: Option<usize>,
    status_ttl_seconds: Option<u64>,
    consent_apps: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct IntrusionConfigFile {
    failure_window_minutes: Option<u64>,
    max_failed_attempts: Option<usize>,
    escalate_on_repeated_failures: Option<bool>,
    retention_days: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub db_path: String,
    pub media_dir: PathBuf,
    pub policy_path: PathBuf,
    pub workers: usize,
    pub capture: CaptureSettings,
    pub blocking: BlockingSettings,
    pub intrusion: IntrusionSettings,
    pub notifier: Option<NotifierSettings>,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub device: String,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub video_duration: Duration,
}

#[derive(Debug, Clone)]
pub struct BlockingSettings {
    pub quorum: usize,
    pub status_ttl: Duration,
    pub consent_apps: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct IntrusionSettings {
    pub failure_window_minutes: u64,
    pub max_failed_attempts: usize,
    pub escalate_on_repeated_failures: bool,
    pub retention_days: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self::from_file(GuardConfigFile::default())
    }
}

impl GuardConfig {
    /// Reads the JSON file named by `CAMGUARD_CONFIG` (if set), applies
    /// `CAMGUARD_*` overrides and validates the result.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAMGUARD_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: GuardConfigFile) -> Self {
        let capture = file.capture.unwrap_or_default();
        let blocking = file.blocking.unwrap_or_default();
        let intrusion = file.intrusion.unwrap_or_default();
        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            media_dir: file
                .media_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MEDIA_DIR)),
            policy_path: file
                .policy_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_POLICY_PATH)),
            workers: file.workers.unwrap_or(DEFAULT_WORKERS),
            capture: CaptureSettings {
                device: capture.device.unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
                fps: capture.fps.unwrap_or(DEFAULT_CAPTURE_FPS),
                width: capture.width.unwrap_or(DEFAULT_CAPTURE_WIDTH),
                height: capture.height.unwrap_or(DEFAULT_CAPTURE_HEIGHT),
                video_duration: capture
                    .video_seconds
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_VIDEO_DURATION),
            },
            blocking: BlockingSettings {
                quorum: blocking.quorum.unwrap_or(DEFAULT_QUORUM),
                status_ttl: blocking
                    .status_ttl_seconds
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_STATUS_TTL),
                consent_apps: blocking.consent_apps.unwrap_or_else(|| {
                    DEFAULT_CONSENT_APPS.iter().map(|a| a.to_string()).collect()
                }),
            },
            intrusion: IntrusionSettings {
                failure_window_minutes: intrusion
                    .failure_window_minutes
                    .unwrap_or(DEFAULT_FAILURE_WINDOW_MINUTES),
                max_failed_attempts: intrusion
                    .max_failed_attempts
                    .unwrap_or(DEFAULT_MAX_FAILED_ATTEMPTS),
                escalate_on_repeated_failures: intrusion
                    .escalate_on_repeated_failures
                    .unwrap_or(false),
                retention_days: intrusion.retention_days.unwrap_or(DEFAULT_RETENTION_DAYS),
            },
            notifier: file.notifier,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_string("CAMGUARD_DB_PATH") {
            self.db_path = path;
        }
        if let Some(dir) = env_string("CAMGUARD_MEDIA_DIR") {
            self.media_dir = PathBuf::from(dir);
        }
        if let Some(path) = env_string("CAMGUARD_POLICY_PATH") {
            self.policy_path = PathBuf::from(path);
        }
        if let Some(device) = env_string("CAMGUARD_DEVICE") {
            self.capture.device = device;
        }
        if let Some(secs) = env_parse::<u64>("CAMGUARD_VIDEO_SECS", "seconds")? {
            self.capture.video_duration = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("CAMGUARD_STATUS_TTL_SECS", "seconds")? {
            self.blocking.status_ttl = Duration::from_secs(secs);
        }
        if let Some(quorum) = env_parse::<usize>("CAMGUARD_QUORUM", "methods")? {
            self.blocking.quorum = quorum;
        }
        if let Some(minutes) = env_parse::<u64>("CAMGUARD_FAILURE_WINDOW_MINUTES", "minutes")? {
            self.intrusion.failure_window_minutes = minutes;
        }
        if let Some(max) = env_parse::<usize>("CAMGUARD_MAX_FAILED_ATTEMPTS", "attempts")? {
            self.intrusion.max_failed_attempts = max;
        }
        if let Some(days) = env_parse::<u64>("CAMGUARD_RETENTION_DAYS", "days")? {
            self.intrusion.retention_days = days;
        }
        if let Some(flag) = env_string("CAMGUARD_ESCALATE") {
            self.intrusion.escalate_on_repeated_failures = parse_bool(&flag)
                .ok_or_else(|| anyhow!("CAMGUARD_ESCALATE must be true or false"))?;
        }
        if let Some(endpoint) = env_string("CAMGUARD_MQTT_ENDPOINT") {
            let notifier = self.notifier.get_or_insert_with(|| NotifierSettings {
                endpoint: String::new(),
                credentials: None,
                recipients: Vec::new(),
                use_tls: false,
            });
            notifier.endpoint = endpoint;
        }
        if let Some(topics) = env_string("CAMGUARD_ALERT_TOPICS") {
            let parsed = split_csv(&topics);
            if let Some(notifier) = self.notifier.as_mut() {
                if !parsed.is_empty() {
                    notifier.recipients = parsed;
                }
            }
        }
        if let (Some(username), Some(notifier)) =
            (env_string("CAMGUARD_MQTT_USERNAME"), self.notifier.as_mut())
        {
            notifier.credentials = Some(MqttCredentials {
                username,
                password: std::env::var("CAMGUARD_MQTT_PASSWORD").unwrap_or_default(),
            });
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        if self.media_dir.as_os_str().is_empty() {
            return Err(anyhow!("media_dir must not be empty"));
        }
        if self.capture.device.trim().is_empty() {
            return Err(anyhow!("capture device must not be empty"));
        }
        if self.capture.fps == 0 || self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("capture fps, width and height must be greater than zero"));
        }
        if self.blocking.quorum == 0 || self.blocking.quorum > 4 {
            return Err(anyhow!(
                "quorum must be between 1 and 4, got {}",
                self.blocking.quorum
            ));
        }
        if self.intrusion.failure_window_minutes == 0 {
            return Err(anyhow!("failure window must be greater than zero"));
        }
        if self.intrusion.max_failed_attempts == 0 {
            return Err(anyhow!("max failed attempts must be greater than zero"));
        }
        if self.intrusion.retention_days == 0 {
            return Err(anyhow!("retention must be greater than zero"));
        }
        if self.workers == 0 {
            return Err(anyhow!("workers must be greater than zero"));
        }
        if let Some(notifier) = &self.notifier {
            if notifier.endpoint.trim().is_empty() {
                return Err(anyhow!("notifier endpoint must not be empty"));
            }
        }
        Ok(())
    }

    pub fn lock_file_path(&self) -> PathBuf {
        self.media_dir.join(crate::device::methods::LOCK_FILE_NAME)
    }
}

fn read_config_file(path: &Path) -> Result<GuardConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, unit: &str) -> Result<Option<T>> {
    match env_string(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be an integer number of {}", key, unit)),
        None => Ok(None),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

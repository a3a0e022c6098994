use crate::error::{ArchiverError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "atarchiver.yaml";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// BrokerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Published messages the in-process broker keeps for inspection.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_history_limit() -> usize {
    10_000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
        }
    }
}

// ---------------------------------------------------------------------------
// QueueConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Requests to the archive controller.
    #[serde(default = "default_archive_consume")]
    pub archive_consume: String,
    /// Unsolicited messages from the archive controller.
    #[serde(default = "default_archive_publish")]
    pub archive_publish: String,
    /// Where peers send acks for director requests.
    #[serde(default = "default_reply")]
    pub reply: String,
    #[serde(default = "default_telemetry")]
    pub telemetry: String,
}

fn default_archive_consume() -> String {
    "archive_ctrl_consume".to_string()
}

fn default_archive_publish() -> String {
    "archive_ctrl_publish".to_string()
}

fn default_reply() -> String {
    "at_foreman_ack_publish".to_string()
}

fn default_telemetry() -> String {
    "telemetry_queue".to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            archive_consume: default_archive_consume(),
            archive_publish: default_archive_publish(),
            reply: default_reply(),
            telemetry: default_telemetry(),
        }
    }
}

impl QueueConfig {
    /// Queues the director consumes while connected.
    pub fn inbound(&self) -> [&str; 3] {
        [&self.reply, &self.archive_publish, &self.telemetry]
    }
}

// ---------------------------------------------------------------------------
// ArchiveConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumType {
    #[serde(rename = "MD5")]
    Md5,
    #[serde(rename = "CRC32")]
    Crc32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default = "default_login")]
    pub login: String,
    #[serde(default = "default_host")]
    pub host: String,
    /// Where forwarders drop files; target directories are dated under it.
    #[serde(default = "default_forwarder_staging")]
    pub forwarder_staging: PathBuf,
    #[serde(default)]
    pub oods_staging: Option<PathBuf>,
    #[serde(default)]
    pub dbb_staging: Option<PathBuf>,
    /// Raw value from the file; anything but MD5/CRC32 disables checksums.
    #[serde(default)]
    pub checksum_type: Option<String>,
}

fn default_login() -> String {
    "ARCHIVE".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_forwarder_staging() -> PathBuf {
    PathBuf::from("/data/staging/atforwarder")
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            login: default_login(),
            host: default_host(),
            forwarder_staging: default_forwarder_staging(),
            oods_staging: None,
            dbb_staging: None,
            checksum_type: None,
        }
    }
}

impl ArchiveConfig {
    pub fn checksum(&self) -> Option<ChecksumType> {
        match self.checksum_type.as_deref() {
            Some("MD5") => Some(ChecksumType::Md5),
            Some("CRC32") => Some(ChecksumType::Crc32),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// CameraConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_wfs_raft")]
    pub wfs_raft: String,
    #[serde(default = "default_wfs_ccd")]
    pub wfs_ccd: String,
}

fn default_wfs_raft() -> String {
    "00".to_string()
}

fn default_wfs_ccd() -> String {
    "00".to_string()
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            wfs_raft: default_wfs_raft(),
            wfs_ccd: default_wfs_ccd(),
        }
    }
}

// ---------------------------------------------------------------------------
// TimingConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_lease_wait_ms")]
    pub lease_wait_ms: u64,
}

fn default_heartbeat_ms() -> u64 {
    5_000
}

fn default_ack_timeout_ms() -> u64 {
    5_000
}

fn default_lease_wait_ms() -> u64 {
    1_000
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            lease_wait_ms: default_lease_wait_ms(),
        }
    }
}

impl TimingConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn lease_wait(&self) -> Duration {
        Duration::from_millis(self.lease_wait_ms)
    }
}

// ---------------------------------------------------------------------------
// ArchiverConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiverConfig {
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub queues: QueueConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

fn default_device() -> String {
    "AT".to_string()
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            broker: BrokerConfig::default(),
            queues: QueueConfig::default(),
            archive: ArchiveConfig::default(),
            camera: CameraConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl ArchiverConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ArchiverError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml(&data)
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        let config: ArchiverConfig = serde_yaml::from_str(data)?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// `<login>@<host>:<target_dir>`, the scp-style destination handed to the
    /// forwarder.
    pub fn target_location(&self, target_dir: &str) -> String {
        format!(
            "{}@{}:{}",
            self.archive.login, self.archive.host, target_dir
        )
    }

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut error = |message: String| {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message,
            })
        };

        for (name, ms) in [
            ("timing.heartbeat_interval_ms", self.timing.heartbeat_interval_ms),
            ("timing.ack_timeout_ms", self.timing.ack_timeout_ms),
        ] {
            if ms == 0 {
                error(format!("{name} must be greater than zero"));
            }
        }

        let queues = [
            ("queues.archive_consume", &self.queues.archive_consume),
            ("queues.archive_publish", &self.queues.archive_publish),
            ("queues.reply", &self.queues.reply),
            ("queues.telemetry", &self.queues.telemetry),
        ];
        for (name, queue) in queues {
            if queue.trim().is_empty() {
                error(format!("{name} must not be empty"));
            }
        }
        if self.queues.reply == self.queues.archive_consume {
            error("queues.reply and queues.archive_consume must differ".to_string());
        }

        if let Some(raw) = &self.archive.checksum_type {
            if self.archive.checksum().is_none() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!(
                        "CHECKSUM_TYPE set to {raw}, which is not supported; defaulting to no checksum"
                    ),
                });
            }
        }
        if self.archive.oods_staging.is_none() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "archive.oods_staging not set; will not link for OODS".to_string(),
            });
        }
        if self.archive.dbb_staging.is_none() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "archive.dbb_staging not set; will not link for DBB".to_string(),
            });
        }
        if self.timing.heartbeat_interval_ms > 0
            && self.timing.heartbeat_interval_ms < 100
        {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "timing.heartbeat_interval_ms below 100ms will flood the broker"
                    .to_string(),
            });
        }

        warnings
    }
}

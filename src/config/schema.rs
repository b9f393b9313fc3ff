use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::Limits;

/// Runtime configuration for the remote-object plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cutoff for inline vs remote-buffer descriptors, in bytes.
    pub eager_threshold: usize,
    /// Size of each transient staging buffer, in bytes.
    pub transient_pool_size: usize,
    /// Number of transient staging buffers.
    pub transient_pool_count: usize,
    /// Backpressure bound on reference-count traffic.
    pub decrement_channel_capacity: usize,
    /// Active-message id the manager uses for decrements. Must match
    /// across peers.
    pub active_message_id: u32,
    pub limits: Limits,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            eager_threshold: 1024,
            transient_pool_size: 32 * 1024 * 1024,
            transient_pool_count: 4,
            decrement_channel_capacity: 128,
            active_message_id: 0x4454,
            limits: Limits::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn encoding_options(&self) -> crate::codec::EncodingOptions {
        crate::codec::EncodingOptions {
            eager_threshold: self.eager_threshold,
            force_register: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Tree,
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Daily,
    Hourly,
    Minutely,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    pub filter: Option<String>,
    pub file: FileLoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::Compact,
            filter: None,
            file: FileLoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    pub dir: Option<PathBuf>,
    pub format: LogFormat,
    pub rotation: LogRotation,
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            format: LogFormat::Json,
            rotation: LogRotation::Daily,
        }
    }
}

/// Partial configuration layered on top of defaults or a base file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConfigLayer {
    pub eager_threshold: Option<usize>,
    pub transient_pool_size: Option<usize>,
    pub transient_pool_count: Option<usize>,
    pub decrement_channel_capacity: Option<usize>,
    pub active_message_id: Option<u32>,
    pub limits: Option<Limits>,
    pub logging: Option<LoggingLayer>,
}

impl ConfigLayer {
    pub fn apply_to(&self, target: &mut Config) {
        if let Some(value) = self.eager_threshold {
            target.eager_threshold = value;
        }
        if let Some(value) = self.transient_pool_size {
            target.transient_pool_size = value;
        }
        if let Some(value) = self.transient_pool_count {
            target.transient_pool_count = value;
        }
        if let Some(value) = self.decrement_channel_capacity {
            target.decrement_channel_capacity = value;
        }
        if let Some(value) = self.active_message_id {
            target.active_message_id = value;
        }
        if let Some(limits) = &self.limits {
            target.limits = limits.clone();
        }
        if let Some(logging) = &self.logging {
            logging.apply_to(&mut target.logging);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingLayer {
    pub stdout: Option<bool>,
    pub stdout_format: Option<LogFormat>,
    pub filter: Option<String>,
    pub file_enabled: Option<bool>,
    pub file_dir: Option<PathBuf>,
}

impl LoggingLayer {
    pub fn apply_to(&self, target: &mut LoggingConfig) {
        if let Some(stdout) = self.stdout {
            target.stdout = stdout;
        }
        if let Some(format) = self.stdout_format {
            target.stdout_format = format;
        }
        if let Some(filter) = &self.filter {
            target.filter = Some(filter.clone());
        }
        if let Some(enabled) = self.file_enabled {
            target.file.enabled = enabled;
        }
        if let Some(dir) = &self.file_dir {
            target.file.dir = Some(dir.clone());
        }
    }
}

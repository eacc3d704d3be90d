//! Application configuration.
//!
//! Built once, either from defaults or a TOML file, and handed to the
//! components that need it. There is no global instance.

use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::channel::{ChannelPaths, ChannelSettings, Visibility};
use crate::core::{DispositionPolicy, Result, UploadError};
use crate::utils::progress::mb_to_bytes;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub upload: UploadConfig,
    pub file_management: FileManagementConfig,
    pub completion: CompletionConfig,
    pub api: ApiConfig,
    pub paths: PathsConfig,
    pub logging: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub privacy_status: String,
    pub category_id: String,
    pub description_template: String,
    pub tags: Vec<String>,
    pub chunk_size_mb: u64,
    pub max_concurrent: usize,
    /// Eligible file extension, without the dot
    pub video_extension: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            privacy_status: "unlisted".to_string(),
            category_id: "20".to_string(),
            description_template: "Auto-uploaded ShadowPlay clip".to_string(),
            tags: Vec::new(),
            chunk_size_mb: 1,
            max_concurrent: 1,
            video_extension: "mp4".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileManagementConfig {
    pub move_instead_of_delete: bool,
    pub auto_delete: bool,
    /// Archive folder; relative paths are resolved against the batch folder
    pub uploaded_folder: PathBuf,
    /// 0 = unbounded
    pub min_file_size_mb: u64,
    /// 0 = unbounded
    pub max_file_size_mb: u64,
}

impl Default for FileManagementConfig {
    fn default() -> Self {
        Self {
            move_instead_of_delete: false,
            auto_delete: true,
            uploaded_folder: PathBuf::from("uploaded"),
            min_file_size_mb: 0,
            max_file_size_mb: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    pub rounds: u32,
    pub interval_ms: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            rounds: 3,
            interval_ms: 1000,
        }
    }
}

impl CompletionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub endpoint: String,
    pub scopes: Vec<String>,
    /// Pre-provisioned token for headless runs
    pub access_token: Option<String>,
    /// Upper bound for one request, a chunk upload included
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://www.googleapis.com/youtube/v3".to_string(),
            scopes: vec![
                "https://www.googleapis.com/auth/youtube.upload".to_string(),
                "https://www.googleapis.com/auth/youtube.readonly".to_string(),
            ],
            access_token: None,
            request_timeout_secs: 300,
            connect_timeout_secs: 30,
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    pub hash_log: PathBuf,
    pub tokens_dir: PathBuf,
    pub channels_file: PathBuf,
    pub settings_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            hash_log: PathBuf::from("uploaded_hashes.txt"),
            tokens_dir: PathBuf::from("tokens"),
            channels_file: PathBuf::from("channels.json"),
            settings_file: PathBuf::from("channel_settings.json"),
        }
    }
}

impl PathsConfig {
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }

    pub fn hash_log_path(&self) -> PathBuf {
        self.resolve(&self.hash_log)
    }

    pub fn channel_paths(&self) -> ChannelPaths {
        ChannelPaths {
            tokens_dir: self.resolve(&self.tokens_dir),
            channels_file: self.resolve(&self.channels_file),
            settings_file: self.resolve(&self.settings_file),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing` filter directive, e.g. "info" or "clipdrop=debug"
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Reads and validates a TOML file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| UploadError::file_op(path, "read_config", e))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(contents).map_err(|e| UploadError::validation("config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fm = &self.file_management;
        if fm.min_file_size_mb > 0 && fm.max_file_size_mb > 0 && fm.min_file_size_mb > fm.max_file_size_mb {
            return Err(UploadError::validation(
                "file_management.min_file_size_mb",
                format!(
                    "minimum size {} MB exceeds maximum size {} MB",
                    fm.min_file_size_mb, fm.max_file_size_mb
                ),
            ));
        }
        if self.upload.chunk_size_mb == 0 {
            return Err(UploadError::validation("upload.chunk_size_mb", "chunk size must be positive"));
        }
        if self.upload.max_concurrent == 0 {
            return Err(UploadError::validation("upload.max_concurrent", "at least one worker is required"));
        }
        if let Err(message) = self.upload.privacy_status.parse::<Visibility>() {
            return Err(UploadError::validation("upload.privacy_status", message));
        }
        if self.upload.video_extension.trim_start_matches('.').is_empty() {
            return Err(UploadError::validation("upload.video_extension", "extension must not be empty"));
        }
        if self.api.request_timeout_secs == 0 || self.api.connect_timeout_secs == 0 {
            return Err(UploadError::validation("api", "request and connect timeouts must be positive"));
        }
        if self.completion.rounds == 0 {
            return Err(UploadError::validation("completion.rounds", "at least one polling round is required"));
        }
        Ok(())
    }

    /// What happens to a source file after a confirmed upload.
    pub fn disposition_policy(&self) -> DispositionPolicy {
        let fm = &self.file_management;
        if fm.move_instead_of_delete {
            DispositionPolicy::MoveTo(fm.uploaded_folder.clone())
        } else if fm.auto_delete {
            DispositionPolicy::Delete
        } else {
            DispositionPolicy::Keep
        }
    }

    pub fn chunk_size_bytes(&self) -> usize {
        mb_to_bytes(self.upload.chunk_size_mb) as usize
    }

    pub fn min_file_size_bytes(&self) -> u64 {
        mb_to_bytes(self.file_management.min_file_size_mb)
    }

    /// `None` when unbounded.
    pub fn max_file_size_bytes(&self) -> Option<u64> {
        match self.file_management.max_file_size_mb {
            0 => None,
            mb => Some(mb_to_bytes(mb)),
        }
    }

    /// Settings given to newly discovered channels.
    pub fn default_channel_settings(&self) -> ChannelSettings {
        let mut settings = ChannelSettings::new("");
        settings.visibility = self.upload.privacy_status.parse().unwrap_or_default();
        settings.category_id = self.upload.category_id.clone();
        settings.description_template = self.upload.description_template.clone();
        settings.tags = self.upload.tags.clone();
        settings
    }
}

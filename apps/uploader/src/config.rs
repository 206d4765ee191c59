//! Uploader configuration management.
//!
//! Configuration is stored as JSON, by default at
//! `data/config/wedrive_uploader.json` relative to the working directory.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use wedrive_upload::{Backoff, DEFAULT_BLOCK_SIZE, RetryPolicy, UploadConfig, UploadTarget};

pub const DEFAULT_CONFIG_PATH: &str = "data/config/wedrive_uploader.json";

/// Uploader configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// WeCom corp id.
    #[serde(default)]
    pub corpid: String,

    /// Secret of the app that owns the drive space.
    #[serde(default)]
    pub secret: String,

    /// Target space.
    #[serde(default)]
    pub space_id: String,

    /// Target folder; empty means the space root.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent_id: String,

    /// Last known access token, rewritten after every refresh.
    #[serde(default)]
    pub debug_token: String,

    /// Upload block size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,

    /// Attempts per block.
    #[serde(default = "default_part_attempts")]
    pub part_attempts: u32,

    /// Attempts for initiate and finish.
    #[serde(default = "default_control_attempts")]
    pub control_attempts: u32,

    #[serde(default)]
    pub backoff: Backoff,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub skip_push_card: bool,

    /// Overrides the WeCom API root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,
}

fn default_chunk_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

fn default_max_concurrent_uploads() -> usize {
    3
}

fn default_part_attempts() -> u32 {
    5
}

fn default_control_attempts() -> u32 {
    3
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for Config {
    fn default() -> Self {
        Self {
            corpid: String::new(),
            secret: String::new(),
            space_id: String::new(),
            parent_id: String::new(),
            debug_token: String::new(),
            chunk_size: default_chunk_size(),
            max_concurrent_uploads: default_max_concurrent_uploads(),
            part_attempts: default_part_attempts(),
            control_attempts: default_control_attempts(),
            backoff: Backoff::default(),
            request_timeout_secs: default_request_timeout_secs(),
            skip_push_card: false,
            api_base_url: None,
        }
    }
}

impl Config {
    /// Loads and validates the configuration at `path`.
    ///
    /// A missing file is created with defaults, and loading fails so the
    /// operator can fill in the credentials first.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            Config::default().save(path)?;
            bail!(
                "created configuration template at {}; fill in corpid, secret and space_id",
                path.display()
            );
        }

        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn read(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Saves the configuration to `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // The file holds the app secret.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Rejects a configuration without credentials or target.
    pub fn validate(&self) -> anyhow::Result<()> {
        let missing: Vec<&str> = [
            ("corpid", &self.corpid),
            ("secret", &self.secret),
            ("space_id", &self.space_id),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect();

        if !missing.is_empty() {
            bail!("incomplete configuration, missing: {}", missing.join(", "));
        }
        Ok(())
    }

    pub fn target(&self) -> UploadTarget {
        let target = UploadTarget::space_root(&self.space_id);
        if self.parent_id.is_empty() {
            target
        } else {
            target.with_parent(&self.parent_id)
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Upload engine settings derived from this file.
    pub fn upload_config(&self) -> UploadConfig {
        let mut config = UploadConfig::new(self.target());
        config.block_size = self.chunk_size;
        config.max_concurrent_parts = self.max_concurrent_uploads.max(1);
        config.part_retry = RetryPolicy::with_attempts(self.part_attempts).with_backoff(self.backoff);
        config.control_retry =
            RetryPolicy::control_with_attempts(self.control_attempts).with_backoff(self.backoff);
        config.skip_push_card = self.skip_push_card;
        config
    }
}

/// Writes `token` into the `debug_token` field of the file at `path`,
/// leaving every other field as it is on disk.
pub fn store_token(path: &Path, token: &str) -> anyhow::Result<()> {
    let mut config = Config::read(path)?;
    config.debug_token = token.to_string();
    config.save(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> Config {
        Config {
            corpid: "ww0001".into(),
            secret: "s3cret".into(),
            space_id: "SPACE".into(),
            ..Config::default()
        }
    }

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.chunk_size, 2 * 1024 * 1024);
        assert_eq!(config.max_concurrent_uploads, 3);
        assert_eq!(config.part_attempts, 5);
        assert_eq!(config.control_attempts, 3);
        assert_eq!(config.request_timeout(), Duration::from_secs(120));
        assert_eq!(config.backoff, Backoff::Fixed { delay_ms: 1000 });
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_creates_template_and_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("config").join("wedrive_uploader.json");

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("fill in"));
        assert!(path.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        // The template itself is rejected until filled in.
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("corpid, secret, space_id"));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        let mut config = complete();
        config.parent_id = "FOLDER".into();
        config.backoff = Backoff::Exponential {
            initial_ms: 500,
            max_ms: 8000,
            factor: 2.0,
        };

        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn minimal_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        std::fs::write(&path, r#"{"corpid":"c","secret":"s","space_id":"sp"}"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.chunk_size, 2 * 1024 * 1024);
        assert!(config.debug_token.is_empty());
        assert_eq!(config.target(), UploadTarget::space_root("sp"));
    }

    #[test]
    fn incomplete_file_names_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        std::fs::write(&path, r#"{"corpid":"c","secret":" "}"#).unwrap();

        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("secret, space_id"), "{err}");
        assert!(!err.contains("corpid"), "{err}");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("parsing"));
    }

    #[test]
    fn store_token_keeps_other_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        let config = complete();
        config.save(&path).unwrap();

        store_token(&path, "fresh-token").unwrap();
        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.debug_token, "fresh-token");
        assert_eq!(reloaded.corpid, config.corpid);
        assert_eq!(reloaded.space_id, config.space_id);
    }

    #[test]
    fn upload_config_mapping() {
        let mut config = complete();
        config.parent_id = "FOLDER".into();
        config.chunk_size = 1024 * 1024;
        config.max_concurrent_uploads = 0;
        config.part_attempts = 7;
        config.control_attempts = 2;
        config.skip_push_card = true;

        let upload = config.upload_config();
        assert_eq!(upload.target.space_id, "SPACE");
        assert_eq!(upload.target.parent_id, "FOLDER");
        assert_eq!(upload.block_size, 1024 * 1024);
        assert_eq!(upload.max_concurrent_parts, 1);
        assert_eq!(upload.part_retry.max_attempts, 7);
        assert_eq!(upload.control_retry.max_attempts, 2);
        assert_eq!(upload.control_retry.max_auth_refreshes, 1);
        assert!(!upload.control_retry.retry_transient);
        assert!(upload.part_retry.retry_transient);
        assert!(upload.skip_push_card);
    }
}

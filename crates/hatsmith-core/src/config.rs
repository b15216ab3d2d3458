use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{HatsmithError, HatsmithResult};

/// Top-level configuration (loaded from hatsmith.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HatsmithConfig {
    pub daemon: DaemonConfig,
    pub crypto: CryptoConfig,
    pub transfer: TransferConfig,
    pub download: DownloadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// HTTP listen address for the download bridge (default: 127.0.0.1:8787)
    pub listen: String,
    /// Serve Prometheus metrics on /metrics
    pub metrics: bool,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

/// Password hardening parameters and password policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (passes, default: 2)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 1)
    pub argon2_parallelism: u32,
    /// Minimum password length accepted for encryption
    pub min_password_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Plaintext bytes per chunk; must match between encryption and decryption
    pub chunk_size: usize,
    /// Output stream buffer, in chunks
    pub pipe_capacity: usize,
    /// Coordinator inbox capacity, in messages
    pub inbox_capacity: usize,
    /// Attempts before giving up on a provider that is not ready
    pub provider_retry_attempts: u32,
    /// Delay between provider readiness attempts
    pub provider_retry_delay_ms: u64,
    /// Trial-decrypt the first chunk before streaming a whole file
    pub verify_before_decrypt: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Path intercepted by the download bridge
    pub path: String,
    /// File name used when a consumer attaches before any job is prepared
    pub default_file_name: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8787".into(),
            metrics: true,
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 2,
            argon2_parallelism: 1,
            min_password_len: 12,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            pipe_capacity: 8,
            inbox_capacity: 16,
            provider_retry_attempts: 50,
            provider_retry_delay_ms: 100,
            verify_before_decrypt: true,
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            path: "/api/download-file".into(),
            default_file_name: "encrypted_file.enc".into(),
        }
    }
}

impl HatsmithConfig {
    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> HatsmithResult<()> {
        if self.transfer.chunk_size == 0 {
            return Err(HatsmithError::Config("transfer.chunk_size must be > 0".into()));
        }
        if self.transfer.pipe_capacity == 0 {
            return Err(HatsmithError::Config("transfer.pipe_capacity must be > 0".into()));
        }
        if self.transfer.inbox_capacity == 0 {
            return Err(HatsmithError::Config("transfer.inbox_capacity must be > 0".into()));
        }
        // Argon2 requires at least 8 KiB per lane
        if self.crypto.argon2_mem_cost_kib < 8 * self.crypto.argon2_parallelism.max(1) {
            return Err(HatsmithError::Config(format!(
                "crypto.argon2_mem_cost_kib must be at least {} for parallelism {}",
                8 * self.crypto.argon2_parallelism.max(1),
                self.crypto.argon2_parallelism
            )));
        }
        if self.crypto.argon2_time_cost == 0 || self.crypto.argon2_parallelism == 0 {
            return Err(HatsmithError::Config(
                "crypto.argon2_time_cost and crypto.argon2_parallelism must be > 0".into(),
            ));
        }
        if !self.download.path.starts_with('/') {
            return Err(HatsmithError::Config(format!(
                "download.path must start with '/': {}",
                self.download.path
            )));
        }
        Ok(())
    }
}

/// Load and validate a config file; a missing file yields the defaults.
pub fn load(path: &Path) -> HatsmithResult<HatsmithConfig> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)?
    } else {
        tracing::warn!("config file not found: {}  (using defaults)", path.display());
        HatsmithConfig::default()
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[daemon]
listen = "0.0.0.0:9000"
metrics = false
log_level = "debug"
log_format = "json"

[crypto]
argon2_mem_cost_kib = 1048576
argon2_time_cost = 4
argon2_parallelism = 1
min_password_len = 16

[transfer]
chunk_size = 1048576
pipe_capacity = 4
inbox_capacity = 32
provider_retry_attempts = 10
provider_retry_delay_ms = 250
verify_before_decrypt = false

[download]
path = "/download"
default_file_name = "out.bin"
"#;
        let config: HatsmithConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.daemon.listen, "0.0.0.0:9000");
        assert!(!config.daemon.metrics);
        assert_eq!(config.daemon.log_format, "json");
        assert_eq!(config.crypto.argon2_mem_cost_kib, 1048576);
        assert_eq!(config.crypto.min_password_len, 16);
        assert_eq!(config.transfer.chunk_size, 1048576);
        assert_eq!(config.transfer.provider_retry_delay_ms, 250);
        assert!(!config.transfer.verify_before_decrypt);
        assert_eq!(config.download.path, "/download");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_defaults() {
        let config: HatsmithConfig = toml::from_str("").unwrap();

        assert_eq!(config.daemon.listen, "127.0.0.1:8787");
        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.crypto.argon2_mem_cost_kib, 65536);
        assert_eq!(config.crypto.argon2_time_cost, 2);
        assert_eq!(config.crypto.min_password_len, 12);
        assert_eq!(config.transfer.chunk_size, 65536);
        assert_eq!(config.transfer.pipe_capacity, 8);
        assert!(config.transfer.verify_before_decrypt);
        assert_eq!(config.download.path, "/api/download-file");
        assert_eq!(config.download.default_file_name, "encrypted_file.enc");
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[transfer]
chunk_size = 4096
"#;
        let config: HatsmithConfig = toml::from_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.transfer.chunk_size, 4096);
        // Defaults
        assert_eq!(config.transfer.pipe_capacity, 8);
        assert_eq!(config.daemon.log_level, "info");
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = HatsmithConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: HatsmithConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.daemon.listen, parsed.daemon.listen);
        assert_eq!(config.transfer.chunk_size, parsed.transfer.chunk_size);
        assert_eq!(config.download.path, parsed.download.path);
    }

    #[test]
    fn test_validate_rejects_zero_chunk_size() {
        let mut config = HatsmithConfig::default();
        config.transfer.chunk_size = 0;
        assert!(matches!(config.validate(), Err(HatsmithError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_relative_download_path() {
        let mut config = HatsmithConfig::default();
        config.download.path = "api/download-file".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.transfer.chunk_size, 65536);
    }

    #[test]
    fn test_load_invalid_toml() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("bad.toml");
        std::fs::write(&path, "[transfer\nchunk_size = ").unwrap();
        assert!(matches!(load(&path), Err(HatsmithError::ConfigParse(_))));
    }
}

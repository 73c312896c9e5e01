//! Configuration for voxrelay.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (VOXRELAY_HOME, VOXRELAY_BUCKET, VOXRELAY_DB,
//!    VOXRELAY_SIGNING_SECRET, FFMPEG_PATH)
//! 2. Config file (.voxrelay/config.yaml)
//! 3. Defaults (~/.voxrelay)
//!
//! Config file discovery:
//! - Searches current directory and parents for .voxrelay/config.yaml
//! - Paths in the config file are relative to the .voxrelay/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::delivery::adapter::DEFAULT_CHANNEL_PREFIX;
use crate::delivery::gateway::DEFAULT_API_BASE;
use crate::reconcile::{ReconcileSettings, ScanMode};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const DEFAULT_BUCKET_NAME: &str = "voice-media";
const DEFAULT_MEDIA_BASE_URL: &str = "http://localhost:8080/media";
const SIGNING_KEY_FILE: &str = "signing.key";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub transcode: TranscodeConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub signing: SigningConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (lock file, signing key)
    pub home: Option<String>,
    /// Local bucket root
    pub bucket: Option<String>,
    pub bucket_name: Option<String>,
    /// SQLite database file
    pub database: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TranscodeConfig {
    pub ffmpeg_path: Option<String>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReconcileConfig {
    pub interval_seconds: Option<u64>,
    pub scan_mode: Option<ScanMode>,
    pub max_attempts: Option<u32>,
    pub max_age_seconds: Option<i64>,
    pub url_ttl_seconds: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    pub api_base: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub channel_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SigningConfig {
    /// Public base URL the artifact paths are appended to
    pub base_url: Option<String>,
    pub secret: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub home: PathBuf,
    pub bucket_root: PathBuf,
    pub bucket_name: String,
    pub database: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub transcode: TranscodeSettings,
    pub reconcile: ReconcileTiming,
    pub gateway: GatewaySettings,
    pub signing: SigningSettings,
}

#[derive(Debug, Clone)]
pub struct TranscodeSettings {
    pub ffmpeg_path: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct ReconcileTiming {
    pub interval_seconds: u64,
    pub scan_mode: ScanMode,
    pub max_attempts: u32,
    pub max_age_seconds: i64,
    pub url_ttl_seconds: i64,
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub api_base: String,
    pub timeout_seconds: u64,
    pub channel_prefix: String,
}

#[derive(Clone)]
pub struct SigningSettings {
    pub base_url: String,
    pub secret: Option<String>,
}

impl std::fmt::Debug for SigningSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningSettings")
            .field("base_url", &self.base_url)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ResolvedConfig {
    pub fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            scan_mode: self.reconcile.scan_mode,
            max_attempts: self.reconcile.max_attempts,
            max_age: chrono::Duration::seconds(self.reconcile.max_age_seconds),
            url_ttl: chrono::Duration::seconds(self.reconcile.url_ttl_seconds),
        }
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile.interval_seconds)
    }

    pub fn transcode_timeout(&self) -> Duration {
        Duration::from_secs(self.transcode.timeout_seconds)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway.timeout_seconds)
    }

    /// Scratch space for transcoding ($VOXRELAY_HOME/scratch)
    pub fn scratch_dir(&self) -> PathBuf {
        self.home.join("scratch")
    }

    /// URL signing secret: configured value, else a key generated once under home
    pub fn signing_secret(&self) -> Result<String> {
        if let Some(secret) = &self.signing.secret {
            return Ok(secret.clone());
        }

        let key_path = self.home.join(SIGNING_KEY_FILE);
        if key_path.exists() {
            let key = std::fs::read_to_string(&key_path)
                .with_context(|| format!("Failed to read signing key: {}", key_path.display()))?;
            return Ok(key.trim().to_string());
        }

        std::fs::create_dir_all(&self.home)
            .with_context(|| format!("Failed to create home: {}", self.home.display()))?;
        let key = uuid::Uuid::new_v4().simple().to_string();
        std::fs::write(&key_path, &key)
            .with_context(|| format!("Failed to write signing key: {}", key_path.display()))?;
        Ok(key)
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".voxrelay").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge file values, environment and defaults
fn resolve(
    file: Option<(&Path, ConfigFile)>,
    env: impl Fn(&str) -> Option<String>,
    default_home: PathBuf,
) -> ResolvedConfig {
    let (config_file, config) = match file {
        Some((path, config)) => (Some(path.to_path_buf()), config),
        None => (None, ConfigFile::default()),
    };

    // Relative paths in the file are relative to .voxrelay/
    let base = config_file
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let from_file = |value: &Option<String>| value.as_deref().map(|p| resolve_path(&base, p));

    let home = env("VOXRELAY_HOME")
        .map(PathBuf::from)
        .or_else(|| from_file(&config.paths.home))
        .unwrap_or(default_home);

    let bucket_root = env("VOXRELAY_BUCKET")
        .map(PathBuf::from)
        .or_else(|| from_file(&config.paths.bucket))
        .unwrap_or_else(|| home.join("bucket"));

    let database = env("VOXRELAY_DB")
        .map(PathBuf::from)
        .or_else(|| from_file(&config.paths.database))
        .unwrap_or_else(|| home.join("voxrelay.db"));

    let defaults = ReconcileSettings::default();

    ResolvedConfig {
        bucket_name: config
            .paths
            .bucket_name
            .unwrap_or_else(|| DEFAULT_BUCKET_NAME.to_string()),
        transcode: TranscodeSettings {
            ffmpeg_path: env("FFMPEG_PATH")
                .or(config.transcode.ffmpeg_path)
                .unwrap_or_else(|| "ffmpeg".to_string()),
            timeout_seconds: config.transcode.timeout_seconds.unwrap_or(120),
        },
        reconcile: ReconcileTiming {
            interval_seconds: config.reconcile.interval_seconds.unwrap_or(120),
            scan_mode: config.reconcile.scan_mode.unwrap_or_default(),
            max_attempts: config.reconcile.max_attempts.unwrap_or(defaults.max_attempts),
            max_age_seconds: config
                .reconcile
                .max_age_seconds
                .unwrap_or(defaults.max_age.num_seconds()),
            url_ttl_seconds: config
                .reconcile
                .url_ttl_seconds
                .unwrap_or(defaults.url_ttl.num_seconds()),
        },
        gateway: GatewaySettings {
            api_base: config
                .gateway
                .api_base
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            timeout_seconds: config.gateway.timeout_seconds.unwrap_or(30),
            channel_prefix: config
                .gateway
                .channel_prefix
                .unwrap_or_else(|| DEFAULT_CHANNEL_PREFIX.to_string()),
        },
        signing: SigningSettings {
            base_url: config
                .signing
                .base_url
                .unwrap_or_else(|| DEFAULT_MEDIA_BASE_URL.to_string()),
            secret: env("VOXRELAY_SIGNING_SECRET").or(config.signing.secret),
        },
        home,
        bucket_root,
        database,
        config_file,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".voxrelay");

    let config_path = find_config_file();
    let file = match &config_path {
        Some(path) => Some((path.as_path(), load_config_file(path)?)),
        None => None,
    };

    Ok(resolve(
        file,
        |key| std::env::var(key).ok().filter(|v| !v.is_empty()),
        default_home,
    ))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

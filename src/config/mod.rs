//! Configuration for the gateway.
//!
//! Loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (`~/.config/sora-broker/config.toml`)
//! 3. Built-in defaults (lowest priority)

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ─────────────────────────────────────────────────────────────────────────────
// Application configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the caller-facing and admin HTTP surfaces bind to.
    pub bind_addr: SocketAddr,
    /// SQLite database path (tokens, tasks, request logs, admin config).
    pub db_path: PathBuf,
    /// Directory for the rotating log file.
    pub log_dir: PathBuf,
    /// `RUST_LOG`-style default directive when `RUST_LOG` itself is unset.
    pub log_level: String,
    /// Base URL of the upstream generation service.
    pub sora_base_url: String,
    /// Bearer key callers must present to the streaming endpoint.
    pub api_key: Option<String>,
    /// Operator credentials for the admin surface.
    pub admin_username: String,
    pub admin_password: String,
    /// Global outbound proxy (token-specific proxies override this).
    pub proxy_url: Option<String>,
    /// Proxy used for sentinel/PoW traffic when `pow_proxy_enabled`.
    pub pow_proxy_url: Option<String>,
    pub pow_proxy_enabled: bool,
    pub admin: AdminConfig,
    pub cache: CacheConfig,
}

/// Process-wide single-row operator settings (spec §3 `AdminConfig` plus the
/// grouped `*_config` tables folded in per §6's normalization note).
#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub error_ban_threshold: u32,
    pub task_retry_enabled: bool,
    pub task_max_retries: u32,
    pub auto_disable_on_401: bool,
    pub image_timeout_secs: u64,
    pub video_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub at_auto_refresh_enabled: bool,
    pub watermark_free_enabled: bool,
    pub watermark_free_host: String,
    pub watermark_free_parser_url: Option<String>,
    pub watermark_free_fallback_enabled: bool,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            error_ban_threshold: 5,
            task_retry_enabled: true,
            task_max_retries: 1,
            auto_disable_on_401: true,
            image_timeout_secs: 120,
            video_timeout_secs: 600,
            poll_interval_ms: 2_000,
            at_auto_refresh_enabled: true,
            watermark_free_enabled: false,
            watermark_free_host: "wmfree.example-cdn.invalid".to_string(),
            watermark_free_parser_url: None,
            watermark_free_fallback_enabled: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Seconds a cached file stays around; -1 disables sweeping entirely.
    pub timeout_secs: i64,
    pub base_url: String,
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: 3600,
            base_url: "http://127.0.0.1:8080".to_string(),
            dir: std::env::temp_dir().join("sora-broker-cache"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".parse().unwrap(),
            db_path: Self::default_db_path(),
            log_dir: PathBuf::from("./logs"),
            log_level: "info".to_string(),
            sora_base_url: "https://sora.chatgpt.com/backend".to_string(),
            api_key: None,
            admin_username: "admin".to_string(),
            admin_password: "change-me".to_string(),
            proxy_url: None,
            pow_proxy_url: None,
            pow_proxy_enabled: false,
            admin: AdminConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub bind_addr: Option<String>,
    pub db_path: Option<String>,
    pub log_dir: Option<String>,
    pub log_level: Option<String>,
    pub sora_base_url: Option<String>,
    pub api_key: Option<String>,
    pub admin_username: Option<String>,
    pub admin_password: Option<String>,
    pub proxy_url: Option<String>,
    pub pow_proxy_url: Option<String>,
    pub pow_proxy_enabled: Option<bool>,
    pub admin: Option<FileAdminConfig>,
    pub cache: Option<FileCacheConfig>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileAdminConfig {
    pub error_ban_threshold: Option<u32>,
    pub task_retry_enabled: Option<bool>,
    pub task_max_retries: Option<u32>,
    pub auto_disable_on_401: Option<bool>,
    pub image_timeout_secs: Option<u64>,
    pub video_timeout_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub at_auto_refresh_enabled: Option<bool>,
    pub watermark_free_enabled: Option<bool>,
    pub watermark_free_host: Option<String>,
    pub watermark_free_parser_url: Option<String>,
    pub watermark_free_fallback_enabled: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileCacheConfig {
    pub enabled: Option<bool>,
    pub timeout_secs: Option<i64>,
    pub base_url: Option<String>,
    pub dir: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────────────────

impl Config {
    fn default_db_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("sora-broker")
            .join("gateway.sqlite3")
    }

    /// `~/.config/sora-broker/config.toml`
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("sora-broker").join("config.toml"))
    }

    /// Write the template config if none exists yet. Silently no-ops otherwise
    /// (config is optional — env vars alone are enough to run).
    pub fn ensure_config_exists() {
        let Some(path) = Self::config_path() else {
            return;
        };
        if path.exists() {
            return;
        }
        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        let _ = std::fs::write(&path, Self::default().to_toml());
    }

    fn load_file_config() -> FileConfig {
        let Some(path) = Self::config_path() else {
            return FileConfig::default();
        };
        match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                eprintln!("config error: failed to parse {}: {}", path.display(), e);
                std::process::exit(1);
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileConfig::default(),
            Err(e) => {
                eprintln!("config error: cannot read {}: {}", path.display(), e);
                std::process::exit(1);
            }
        }
    }

    /// Load configuration: env vars > file > defaults.
    pub fn from_env() -> Self {
        let file = Self::load_file_config();
        let default = Self::default();

        let bind_addr = std::env::var("SORA_BROKER_BIND_ADDR")
            .ok()
            .or(file.bind_addr)
            .map(|s| s.parse().expect("invalid SORA_BROKER_BIND_ADDR"))
            .unwrap_or(default.bind_addr);

        let db_path = std::env::var("SORA_BROKER_DB_PATH")
            .ok()
            .or(file.db_path)
            .map(PathBuf::from)
            .unwrap_or(default.db_path);

        let log_dir = std::env::var("SORA_BROKER_LOG_DIR")
            .ok()
            .or(file.log_dir)
            .map(PathBuf::from)
            .unwrap_or(default.log_dir);

        let log_level = std::env::var("SORA_BROKER_LOG_LEVEL")
            .ok()
            .or(file.log_level)
            .unwrap_or(default.log_level);

        let sora_base_url = std::env::var("SORA_BROKER_SORA_BASE_URL")
            .ok()
            .or(file.sora_base_url)
            .unwrap_or(default.sora_base_url);

        let api_key = std::env::var("SORA_BROKER_API_KEY").ok().or(file.api_key);

        let admin_username = std::env::var("SORA_BROKER_ADMIN_USERNAME")
            .ok()
            .or(file.admin_username)
            .unwrap_or(default.admin_username);

        let admin_password = std::env::var("SORA_BROKER_ADMIN_PASSWORD")
            .ok()
            .or(file.admin_password)
            .unwrap_or(default.admin_password);

        let proxy_url = std::env::var("SORA_BROKER_PROXY_URL").ok().or(file.proxy_url);
        let pow_proxy_url = std::env::var("SORA_BROKER_POW_PROXY_URL")
            .ok()
            .or(file.pow_proxy_url);
        let pow_proxy_enabled = file.pow_proxy_enabled.unwrap_or(pow_proxy_url.is_some());

        let admin = {
            let f = file.admin.unwrap_or_default();
            let d = AdminConfig::default();
            AdminConfig {
                error_ban_threshold: f.error_ban_threshold.unwrap_or(d.error_ban_threshold),
                task_retry_enabled: f.task_retry_enabled.unwrap_or(d.task_retry_enabled),
                task_max_retries: f.task_max_retries.unwrap_or(d.task_max_retries),
                auto_disable_on_401: f.auto_disable_on_401.unwrap_or(d.auto_disable_on_401),
                image_timeout_secs: f.image_timeout_secs.unwrap_or(d.image_timeout_secs),
                video_timeout_secs: f.video_timeout_secs.unwrap_or(d.video_timeout_secs),
                poll_interval_ms: f.poll_interval_ms.unwrap_or(d.poll_interval_ms),
                at_auto_refresh_enabled: f
                    .at_auto_refresh_enabled
                    .unwrap_or(d.at_auto_refresh_enabled),
                watermark_free_enabled: f.watermark_free_enabled.unwrap_or(d.watermark_free_enabled),
                watermark_free_host: f.watermark_free_host.unwrap_or(d.watermark_free_host),
                watermark_free_parser_url: f
                    .watermark_free_parser_url
                    .or(d.watermark_free_parser_url),
                watermark_free_fallback_enabled: f
                    .watermark_free_fallback_enabled
                    .unwrap_or(d.watermark_free_fallback_enabled),
            }
        };

        let cache = {
            let f = file.cache.unwrap_or_default();
            let d = CacheConfig::default();
            CacheConfig {
                enabled: f.enabled.unwrap_or(d.enabled),
                timeout_secs: f.timeout_secs.unwrap_or(d.timeout_secs),
                base_url: f.base_url.unwrap_or(d.base_url),
                dir: f.dir.map(PathBuf::from).unwrap_or(d.dir),
            }
        };

        Self {
            bind_addr,
            db_path,
            log_dir,
            log_level,
            sora_base_url,
            api_key,
            admin_username,
            admin_password,
            proxy_url,
            pow_proxy_url,
            pow_proxy_enabled,
            admin,
            cache,
        }
    }

    /// Hand-authored TOML template: the single source of truth for the file we
    /// write on first run, so the shipped config carries comments `toml::to_string`
    /// would drop.
    pub fn to_toml(&self) -> String {
        format!(
            r#"# sora-broker configuration
# Every value here may also be set via a SORA_BROKER_* environment variable,
# which always takes precedence over this file.

bind_addr = "{bind_addr}"
db_path = "{db_path}"
log_dir = "{log_dir}"
log_level = "{log_level}"
sora_base_url = "{sora_base_url}"
# api_key = "set-a-bearer-key-for-the-streaming-endpoint"
admin_username = "{admin_username}"
admin_password = "{admin_password}"
# proxy_url = "socks5://127.0.0.1:1080"
# pow_proxy_url = "socks5://127.0.0.1:1081"
pow_proxy_enabled = {pow_proxy_enabled}

[admin]
error_ban_threshold = {error_ban_threshold}
task_retry_enabled = {task_retry_enabled}
task_max_retries = {task_max_retries}
auto_disable_on_401 = {auto_disable_on_401}
image_timeout_secs = {image_timeout_secs}
video_timeout_secs = {video_timeout_secs}
poll_interval_ms = {poll_interval_ms}
at_auto_refresh_enabled = {at_auto_refresh_enabled}
watermark_free_enabled = {watermark_free_enabled}
watermark_free_host = "{watermark_free_host}"
watermark_free_fallback_enabled = {watermark_free_fallback_enabled}

[cache]
enabled = {cache_enabled}
timeout_secs = {cache_timeout_secs}
base_url = "{cache_base_url}"
dir = "{cache_dir}"
"#,
            bind_addr = self.bind_addr,
            db_path = self.db_path.display(),
            log_dir = self.log_dir.display(),
            log_level = self.log_level,
            sora_base_url = self.sora_base_url,
            admin_username = self.admin_username,
            admin_password = self.admin_password,
            pow_proxy_enabled = self.pow_proxy_enabled,
            error_ban_threshold = self.admin.error_ban_threshold,
            task_retry_enabled = self.admin.task_retry_enabled,
            task_max_retries = self.admin.task_max_retries,
            auto_disable_on_401 = self.admin.auto_disable_on_401,
            image_timeout_secs = self.admin.image_timeout_secs,
            video_timeout_secs = self.admin.video_timeout_secs,
            poll_interval_ms = self.admin.poll_interval_ms,
            at_auto_refresh_enabled = self.admin.at_auto_refresh_enabled,
            watermark_free_enabled = self.admin.watermark_free_enabled,
            watermark_free_host = self.admin.watermark_free_host,
            watermark_free_fallback_enabled = self.admin.watermark_free_fallback_enabled,
            cache_enabled = self.cache.enabled,
            cache_timeout_secs = self.cache.timeout_secs,
            cache_base_url = self.cache.base_url,
            cache_dir = self.cache.dir.display(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = Config::default();
        let rendered = config.to_toml();
        let parsed: FileConfig = toml::from_str(&rendered).expect("template must parse as TOML");
        assert_eq!(parsed.bind_addr.as_deref(), Some("127.0.0.1:8080"));
        assert_eq!(parsed.admin.unwrap().error_ban_threshold, Some(5));
    }
}

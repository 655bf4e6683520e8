//! Configuration file management for `orchid`.
//!
//! Provides a TOML-based config file at `~/.config/orchid/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default. There is
//! no per-operator auth token to manage here; the engine's own auth flows
//! live in the `auth_flows` table.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use orchid_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub redis: RedisSection,
    #[serde(default)]
    pub kafka: KafkaSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RedisSection {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisSection {
    fn default() -> Self {
        Self { url: default_redis_url() }
    }
}

fn default_redis_url() -> String {
    orchid_core::config::EngineConfig::DEFAULT_REDIS_URL.to_owned()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KafkaSection {
    #[serde(default = "default_kafka_bootstrap")]
    pub bootstrap_servers: String,
}

impl Default for KafkaSection {
    fn default() -> Self {
        Self { bootstrap_servers: default_kafka_bootstrap() }
    }
}

fn default_kafka_bootstrap() -> String {
    orchid_core::config::EngineConfig::DEFAULT_KAFKA_BOOTSTRAP.to_owned()
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the orchid config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/orchid` or `~/.config/orchid`.
/// We intentionally ignore the platform-specific `dirs::config_dir()`
/// (which returns `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("orchid");
    }
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".config").join("orchid")
}

/// Return the path to the orchid config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix, since this file may later carry
/// credentials.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents).with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use by any subcommand.
#[derive(Debug)]
pub struct OrchidConfig {
    pub db_config: DbConfig,
    pub redis_url: String,
    pub kafka_bootstrap_servers: String,
}

impl OrchidConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    ///
    /// - DB URL: `cli_db_url` > `ORCHID_DATABASE_URL` env > config file >
    ///   `DbConfig::DEFAULT_URL`.
    /// - Redis/Kafka: env var (read by `EngineConfig::from_env` further
    ///   downstream) > config file > default. The config file values are
    ///   only used to seed process env so both this CLI layer and the
    ///   engine's own `EngineConfig::from_env` agree.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = if let Some(url) = cli_db_url {
            url.to_owned()
        } else if let Ok(url) = std::env::var("ORCHID_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_owned()
        };
        let db_config = DbConfig::new(db_url);

        let redis_url = std::env::var("ORCHID_REDIS_URL")
            .ok()
            .or_else(|| file_config.as_ref().map(|c| c.redis.url.clone()))
            .unwrap_or_else(default_redis_url);

        let kafka_bootstrap_servers = std::env::var("KAFKA_BOOTSTRAP_SERVERS")
            .ok()
            .or_else(|| file_config.as_ref().map(|c| c.kafka.bootstrap_servers.clone()))
            .unwrap_or_else(default_kafka_bootstrap);

        Ok(Self { db_config, redis_url, kafka_bootstrap_servers })
    }
}

/// Build a fresh `redis::aio::ConnectionManager` against `url`, bailing
/// with a descriptive error rather than panicking -- every caller here is
/// a CLI entry point, not a library function.
pub async fn connect_redis(url: &str) -> Result<redis::aio::ConnectionManager> {
    let client = redis::Client::open(url).with_context(|| format!("invalid redis URL: {url}"))?;
    client
        .get_connection_manager()
        .await
        .with_context(|| format!("failed to connect to redis at {url}"))
}

/// Validate `toml`/`json` plan source bytes, never touching the network or
/// a database -- used by `orchid plan validate`.
pub fn parse_plan_definition(contents: &str, path: &std::path::Path) -> Result<orchid_core::execution::types::PlanDefinition> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(contents).context("failed to parse plan as TOML"),
        Some("json") => serde_json::from_str(contents).context("failed to parse plan as JSON"),
        _ => bail!("unrecognized plan file extension (expected .toml or .json): {}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
        LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let _lock = lock_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("orchid");
        let path = dir.join("config.toml");

        let original = ConfigFile {
            database: DatabaseSection { url: "postgresql://testhost:5432/testdb".to_owned() },
            redis: RedisSection { url: "redis://testhost:6379".to_owned() },
            kafka: KafkaSection { bootstrap_servers: "testhost:9092".to_owned() },
        };

        std::fs::create_dir_all(&dir).unwrap();
        let contents = toml::to_string_pretty(&original).unwrap();
        std::fs::write(&path, &contents).unwrap();

        let loaded_contents = std::fs::read_to_string(&path).unwrap();
        let loaded: ConfigFile = toml::from_str(&loaded_contents).unwrap();

        assert_eq!(loaded.database.url, original.database.url);
        assert_eq!(loaded.redis.url, original.redis.url);
    }

    #[cfg(unix)]
    #[test]
    fn save_config_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let _lock = lock_env();

        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("test.toml");
        std::fs::write(&file, "test").unwrap();

        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&file, perms).unwrap();

        let meta = std::fs::metadata(&file).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn resolve_with_cli_flag_overrides_all() {
        let _lock = lock_env();
        unsafe { std::env::set_var("ORCHID_DATABASE_URL", "postgresql://env:5432/envdb") };

        let config = OrchidConfig::resolve(Some("postgresql://cli:5432/clidb")).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://cli:5432/clidb");

        unsafe { std::env::remove_var("ORCHID_DATABASE_URL") };
    }

    #[test]
    fn resolve_with_env_var_overrides_default() {
        let _lock = lock_env();
        unsafe { std::env::set_var("ORCHID_DATABASE_URL", "postgresql://env:5432/envdb") };

        let config = OrchidConfig::resolve(None).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://env:5432/envdb");

        unsafe { std::env::remove_var("ORCHID_DATABASE_URL") };
    }

    #[test]
    fn resolve_defaults_db_url_when_nothing_set() {
        let _lock = lock_env();
        unsafe { std::env::remove_var("ORCHID_DATABASE_URL") };

        // Point HOME/XDG_CONFIG_HOME somewhere with no config file so the
        // default truly applies.
        let tmp = tempfile::TempDir::new().unwrap();
        let orig_xdg = std::env::var("XDG_CONFIG_HOME").ok();
        unsafe { std::env::set_var("XDG_CONFIG_HOME", tmp.path()) };

        let config = OrchidConfig::resolve(None).unwrap();
        assert_eq!(config.db_config.database_url, DbConfig::DEFAULT_URL);

        match orig_xdg {
            Some(x) => unsafe { std::env::set_var("XDG_CONFIG_HOME", x) },
            None => unsafe { std::env::remove_var("XDG_CONFIG_HOME") },
        }
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(path.ends_with("orchid/config.toml"), "unexpected config path: {}", path.display());
    }

    #[test]
    fn parse_plan_definition_rejects_unknown_extension() {
        let result = parse_plan_definition("{}", std::path::Path::new("plan.yaml"));
        assert!(result.is_err());
    }

    #[test]
    fn parse_plan_definition_parses_minimal_json() {
        let json = r#"{"root_step": {"url": "https://api.example/x"}}"#;
        let plan = parse_plan_definition(json, std::path::Path::new("plan.json")).unwrap();
        assert_eq!(plan.root_step.url, "https://api.example/x");
    }
}

//! Configuration file management for corral.
//!
//! Provides a TOML-based config file at `~/.config/corral/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use corral_core::CoordinatorConfig;
use corral_core::token::TokenConfig;
use corral_db::config::DbConfig;

/// API port used when neither the environment nor the config file sets one.
pub const DEFAULT_API_PORT: u16 = 8080;

/// The control channel listens this far above the API port unless
/// `cc_port` is given.
pub const CC_PORT_OFFSET: u16 = 10;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    pub auth: AuthSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<CoordinatorSection>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthSection {
    /// Hex-encoded token secret (64 hex chars = 32 bytes).
    pub token_secret: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ServerSection {
    pub bind: Option<String>,
    pub api_port: Option<u16>,
    pub cc_port: Option<u16>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CoordinatorSection {
    pub retry_limit: Option<i32>,
    pub plan_limit: Option<u32>,
    pub lease_name: Option<String>,
    pub holder_identity: Option<String>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the corral config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/corral` or `~/.config/corral`,
/// on every platform.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("corral");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("corral")
}

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
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// The file is owner read/write only on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

/// 32 random bytes, hex-encoded (64 chars).
pub fn generate_token_secret() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Where `corral serve` listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub bind: String,
    pub api_port: u16,
    pub cc_port: u16,
}

impl ServerSettings {
    /// Control port for an API port when no explicit one is configured.
    pub fn default_cc_port(api_port: u16) -> Result<u16> {
        match api_port.checked_add(CC_PORT_OFFSET) {
            Some(port) => Ok(port),
            None => bail!("api port {api_port} leaves no room for the control port; set cc_port"),
        }
    }
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct CorralConfig {
    pub db_config: DbConfig,
    pub token_config: TokenConfig,
    pub server: ServerSettings,
    pub coordinator: CoordinatorConfig,
    /// Explicit leader holder identity; `None` derives one from the host.
    pub holder_identity: Option<String>,
}

impl CorralConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - DB URL: `cli_db_url` > `CORRAL_DATABASE_URL` > `[database] url` > `DbConfig::DEFAULT_URL`
    /// - Token secret: `CORRAL_TOKEN_SECRET` > `[auth] token_secret` > error
    /// - API port: `CORRAL_API_PORT` > `[server] api_port` > 8080
    /// - Control port: `CORRAL_CC_PORT` > `[server] cc_port` > api port + 10
    /// - Retry limit and lease name: `CORRAL_RETRY_LIMIT` / `CORRAL_LEASE_NAME` > `[coordinator]`
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        // A missing file is fine; a broken one is reported.
        let file_config = if config_path().exists() {
            Some(load_config()?)
        } else {
            None
        };

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("CORRAL_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };
        let db_config = DbConfig::new(db_url);

        let token_config = if let Ok(secret_hex) = std::env::var("CORRAL_TOKEN_SECRET") {
            TokenConfig::from_hex(&secret_hex).context("CORRAL_TOKEN_SECRET env var is not valid")?
        } else if let Some(ref cfg) = file_config {
            TokenConfig::from_hex(&cfg.auth.token_secret)
                .context("invalid token_secret in config file")?
        } else {
            bail!(
                "token secret not found; set CORRAL_TOKEN_SECRET or run `corral init` to create a config file"
            );
        };

        let server_file = file_config.as_ref().and_then(|c| c.server.as_ref());
        let api_port = match env_port("CORRAL_API_PORT")? {
            Some(port) => port,
            None => server_file.and_then(|s| s.api_port).unwrap_or(DEFAULT_API_PORT),
        };
        let cc_port = match env_port("CORRAL_CC_PORT")? {
            Some(port) => port,
            None => match server_file.and_then(|s| s.cc_port) {
                Some(port) => port,
                None => ServerSettings::default_cc_port(api_port)?,
            },
        };
        let server = ServerSettings {
            bind: server_file
                .and_then(|s| s.bind.clone())
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            api_port,
            cc_port,
        };

        let mut coordinator = CoordinatorConfig::default();
        let mut holder_identity = None;
        if let Some(section) = file_config.as_ref().and_then(|c| c.coordinator.as_ref()) {
            if let Some(limit) = section.retry_limit {
                coordinator.retry_limit = limit;
            }
            if let Some(limit) = section.plan_limit {
                coordinator.default_plan_limit = limit;
            }
            coordinator.lease_name = section.lease_name.clone();
            holder_identity = section.holder_identity.clone();
        }
        let coordinator = coordinator.with_env_overrides();

        Ok(Self {
            db_config,
            token_config,
            server,
            coordinator,
            holder_identity,
        })
    }
}

fn env_port(var: &str) -> Result<Option<u16>> {
    match std::env::var(var) {
        Ok(raw) => {
            let port = raw
                .trim()
                .parse::<u16>()
                .with_context(|| format!("{var} is not a valid port: {raw:?}"))?;
            Ok(Some(port))
        }
        Err(_) => Ok(None),
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "aa55aa55aa55aa55aa55aa55aa55aa55aa55aa55aa55aa55aa55aa55aa55aa55";

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        crate::test_util::lock_env()
    }

    /// Point the config lookup at an empty temp dir and clear every corral
    /// variable. The returned dir must outlive the test body.
    fn isolated_env() -> tempfile::TempDir {
        let tmp = tempfile::TempDir::new().unwrap();
        unsafe { std::env::set_var("XDG_CONFIG_HOME", tmp.path()) };
        for var in [
            "CORRAL_DATABASE_URL",
            "CORRAL_TOKEN_SECRET",
            "CORRAL_API_PORT",
            "CORRAL_CC_PORT",
            "CORRAL_RETRY_LIMIT",
            "CORRAL_LEASE_NAME",
        ] {
            unsafe { std::env::remove_var(var) };
        }
        tmp
    }

    fn sample_file() -> ConfigFile {
        ConfigFile {
            database: DatabaseSection {
                url: "postgresql://filehost:5432/filedb".to_string(),
            },
            auth: AuthSection {
                token_secret: "bb".repeat(32),
            },
            server: Some(ServerSection {
                bind: Some("127.0.0.1".to_string()),
                api_port: Some(9000),
                cc_port: None,
            }),
            coordinator: Some(CoordinatorSection {
                retry_limit: Some(5),
                plan_limit: Some(2),
                lease_name: Some("corral-test".to_string()),
                holder_identity: Some("node-a".to_string()),
            }),
        }
    }

    #[test]
    fn generate_token_secret_is_64_hex_chars() {
        let secret = generate_token_secret();
        assert_eq!(secret.len(), 64);
        assert!(
            secret.chars().all(|c| c.is_ascii_hexdigit()),
            "expected all hex digits, got: {secret}"
        );
        assert_ne!(secret, generate_token_secret());
    }

    #[cfg(unix)]
    #[test]
    fn save_config_writes_owner_only_file() {
        use std::os::unix::fs::PermissionsExt;

        let _lock = lock_env();
        let _tmp = isolated_env();

        save_config(&sample_file()).unwrap();
        let meta = std::fs::metadata(config_path()).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);

        let loaded = load_config().unwrap();
        assert_eq!(loaded.database.url, "postgresql://filehost:5432/filedb");
        assert_eq!(loaded.server.unwrap().api_port, Some(9000));
    }

    #[test]
    fn minimal_file_without_optional_sections_parses() {
        let parsed: ConfigFile = toml::from_str(
            "[database]\nurl = \"postgresql://h/db\"\n\n[auth]\ntoken_secret = \"00ff\"\n",
        )
        .unwrap();
        assert!(parsed.server.is_none());
        assert!(parsed.coordinator.is_none());
    }

    #[test]
    fn cli_flag_overrides_env() {
        let _lock = lock_env();
        let _tmp = isolated_env();
        unsafe { std::env::set_var("CORRAL_DATABASE_URL", "postgresql://env:5432/envdb") };
        unsafe { std::env::set_var("CORRAL_TOKEN_SECRET", SECRET) };

        let config = CorralConfig::resolve(Some("postgresql://cli:5432/clidb")).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://cli:5432/clidb");

        unsafe { std::env::remove_var("CORRAL_DATABASE_URL") };
        unsafe { std::env::remove_var("CORRAL_TOKEN_SECRET") };
    }

    #[test]
    fn defaults_when_only_secret_is_set() {
        let _lock = lock_env();
        let _tmp = isolated_env();
        unsafe { std::env::set_var("CORRAL_TOKEN_SECRET", SECRET) };

        let config = CorralConfig::resolve(None).unwrap();
        assert_eq!(config.db_config.database_url, DbConfig::DEFAULT_URL);
        assert_eq!(
            config.server,
            ServerSettings {
                bind: "0.0.0.0".to_string(),
                api_port: 8080,
                cc_port: 8090,
            }
        );
        assert_eq!(config.coordinator.retry_limit, 3);
        assert!(config.coordinator.lease_name.is_none());
        assert!(config.holder_identity.is_none());

        unsafe { std::env::remove_var("CORRAL_TOKEN_SECRET") };
    }

    #[test]
    fn file_values_apply_and_env_wins_over_them() {
        let _lock = lock_env();
        let _tmp = isolated_env();
        save_config(&sample_file()).unwrap();

        let config = CorralConfig::resolve(None).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://filehost:5432/filedb");
        assert_eq!(config.token_config.secret, vec![0xbb; 32]);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.api_port, 9000);
        assert_eq!(config.server.cc_port, 9010, "control port follows the api port");
        assert_eq!(config.coordinator.retry_limit, 5);
        assert_eq!(config.coordinator.default_plan_limit, 2);
        assert_eq!(config.coordinator.lease_name.as_deref(), Some("corral-test"));
        assert_eq!(config.holder_identity.as_deref(), Some("node-a"));

        unsafe { std::env::set_var("CORRAL_API_PORT", "7000") };
        unsafe { std::env::set_var("CORRAL_CC_PORT", "7777") };
        unsafe { std::env::set_var("CORRAL_RETRY_LIMIT", "1") };
        let config = CorralConfig::resolve(None).unwrap();
        assert_eq!(config.server.api_port, 7000);
        assert_eq!(config.server.cc_port, 7777);
        assert_eq!(config.coordinator.retry_limit, 1);

        unsafe { std::env::remove_var("CORRAL_API_PORT") };
        unsafe { std::env::remove_var("CORRAL_CC_PORT") };
        unsafe { std::env::remove_var("CORRAL_RETRY_LIMIT") };
    }

    #[test]
    fn invalid_port_env_is_an_error() {
        let _lock = lock_env();
        let _tmp = isolated_env();
        unsafe { std::env::set_var("CORRAL_TOKEN_SECRET", SECRET) };
        unsafe { std::env::set_var("CORRAL_API_PORT", "eighty") };

        let result = CorralConfig::resolve(None);
        unsafe { std::env::remove_var("CORRAL_API_PORT") };
        unsafe { std::env::remove_var("CORRAL_TOKEN_SECRET") };

        let msg = format!("{:#}", result.unwrap_err());
        assert!(msg.contains("CORRAL_API_PORT"), "unexpected error: {msg}");
    }

    #[test]
    fn errors_when_no_token_secret() {
        let _lock = lock_env();
        let _tmp = isolated_env();

        let result = CorralConfig::resolve(Some("postgresql://localhost:5432/corral"));
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("token secret not found"), "unexpected error: {msg}");
    }

    #[test]
    fn malformed_file_is_reported() {
        let _lock = lock_env();
        let _tmp = isolated_env();
        std::fs::create_dir_all(config_dir()).unwrap();
        std::fs::write(config_path(), "[database\nurl = 1\n").unwrap();
        unsafe { std::env::set_var("CORRAL_TOKEN_SECRET", SECRET) };

        let result = CorralConfig::resolve(None);
        unsafe { std::env::remove_var("CORRAL_TOKEN_SECRET") };

        let msg = format!("{:#}", result.unwrap_err());
        assert!(msg.contains("failed to parse config file"), "unexpected error: {msg}");
    }

    #[test]
    fn cc_port_offset_overflow_is_reported() {
        assert_eq!(ServerSettings::default_cc_port(8080).unwrap(), 8090);
        assert!(ServerSettings::default_cc_port(u16::MAX - 5).is_err());
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("corral/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}

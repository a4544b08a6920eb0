//! Configuration and credential storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::models::{Participant, Role};
use crate::transport::session::{RetryPolicy, SessionConfig};

const DEFAULT_API_URL: &str = "http://localhost:3000/api";
const DEFAULT_SOCKET_URL: &str = "ws://localhost:3000/socket.io/1/websocket/";

/// Local user identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserConfig {
    pub id: String,
    pub display_name: String,
    pub role: Role,
}

/// Reconnection policy of the push channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 64_000,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Base URL of the request/response API
    pub api_url: String,
    /// Push channel endpoint
    pub socket_url: String,
    /// Session token (from `login`)
    pub session_token: Option<String>,
    /// How long a sent message may stay pending
    pub send_timeout_secs: u64,
    /// 0 treats authentication as immediate
    pub auth_ack_timeout_ms: u64,
    pub heartbeat_secs: u64,
    /// Who we are (from `login`)
    pub user: Option<UserConfig>,
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            socket_url: DEFAULT_SOCKET_URL.to_string(),
            session_token: None,
            send_timeout_secs: 15,
            auth_ack_timeout_ms: 5000,
            heartbeat_secs: 25,
            user: None,
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "chat-sync", "chat-sync")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        // Restrictive from creation on: the file holds the session token
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path).context("Failed to open config file")?;

        // An existing file keeps its old mode; tighten it before writing
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            file.set_permissions(perms)
                .context("Failed to set config permissions")?;
        }

        file.write_all(content.as_bytes())
            .context("Failed to write config file")?;
        Ok(())
    }

    pub fn clear_credentials(&mut self) {
        self.session_token = None;
    }

    /// Session token, or a hint to log in.
    pub fn token(&self) -> Result<&str> {
        self.session_token
            .as_deref()
            .context("No session token. Run 'chat-sync login' first.")
    }

    pub fn identity(&self) -> Result<Participant> {
        let user = self
            .user
            .as_ref()
            .context("No user identity. Run 'chat-sync login' first.")?;
        Ok(Participant::new(
            user.id.clone(),
            user.display_name.clone(),
            user.role,
        ))
    }

    pub fn api_url(&self) -> Result<Url> {
        Url::parse(&self.api_url).with_context(|| format!("Invalid api_url {}", self.api_url))
    }

    pub fn socket_url(&self) -> Result<Url> {
        Url::parse(&self.socket_url)
            .with_context(|| format!("Invalid socket_url {}", self.socket_url))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn session_config(&self) -> Result<SessionConfig> {
        let user = self.identity()?;
        let auth_ack_timeout = match self.auth_ack_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        Ok(SessionConfig {
            user_id: user.id,
            token: self.token()?.to_string(),
            retry: self.retry_policy(),
            auth_ack_timeout,
            heartbeat: Duration::from_secs(self.heartbeat_secs.max(1)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("chat-sync-test-{}", uuid::Uuid::new_v4()))
            .join("config.toml")
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = tokio_test::assert_ok!(Config::load_from(&temp_path()));
        assert_eq!(config, Config::default());
        assert!(config.token().is_err());
        assert!(config.session_config().is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let path = temp_path();
        let mut config = Config::default();
        config.session_token = Some("secret".into());
        config.user = Some(UserConfig {
            id: "p1".into(),
            display_name: "Pat".into(),
            role: Role::Patient,
        });
        config.auth_ack_timeout_ms = 0;
        config.save_to(&path).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        let session = loaded.session_config().unwrap();
        assert_eq!(session.user_id, "p1");
        assert_eq!(session.token, "secret");
        assert_eq!(session.auth_ack_timeout, None);

        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_save_tightens_existing_file() {
        use std::os::unix::fs::PermissionsExt;
        let path = temp_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "api_url = \"http://old\"\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let mut config = Config::default();
        config.session_token = Some("secret".into());
        tokio_test::assert_ok!(config.save_to(&path));

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(Config::load_from(&path).unwrap(), config);

        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let path = temp_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "send_timeout_secs = 3\n[retry]\nmax_attempts = 0\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.send_timeout(), Duration::from_secs(3));
        assert_eq!(config.retry_policy().max_attempts, 1);
        assert_eq!(config.retry.initial_delay_ms, 1000);
        assert_eq!(config.api_url, DEFAULT_API_URL);

        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }
}

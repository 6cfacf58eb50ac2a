use crate::session::{DisconnectPolicy, MachineConfig};
use crate::steam::Credentials;
use clap::Parser;
use directories::ProjectDirs;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("no data directory given and the platform data directory can't be determined")]
    NoDataDir,
}

/// Proxy a steam account over http, relaying steam guard codes through telegram
#[derive(Parser)]
#[command(version, about)]
pub struct Config {
    /// Steam account name
    #[arg(long, env = "ACCOUNT_NAME")]
    pub account_name: String,

    /// Steam account password
    #[arg(long, env = "ACCOUNT_PASS", hide_env_values = true)]
    pub account_pass: String,

    /// Base64 totp secret, steam guard codes are generated locally when set
    #[arg(long, env = "STEAM_SHARED_SECRET", hide_env_values = true)]
    pub shared_secret: Option<String>,

    /// Telegram bot token, without it 2FA codes can only be passed to `/login?code=`
    #[arg(long, env = "TELEGRAM_API_KEY", hide_env_values = true)]
    pub telegram_api_key: Option<String>,

    #[arg(long, env = "HTTP_HOST", default_value = "0.0.0.0")]
    pub http_host: IpAddr,

    #[arg(long, env = "HTTP_PORT", default_value_t = 7777)]
    pub http_port: u16,

    /// Json array of accepted api tokens
    #[arg(long, env = "TOKENS_PATH", default_value = "tokens.json")]
    pub tokens_path: PathBuf,

    /// Directory for the registered chats and the saved session
    #[arg(long, env = "DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// What to do when the connection to steam is lost
    #[arg(long, env = "DISCONNECT_POLICY", value_enum, default_value_t)]
    pub disconnect_policy: DisconnectPolicy,
}

impl Config {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.http_host, self.http_port)
    }

    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => ProjectDirs::from("com", "steam-account-api", "steam-account-api")
                .map(|dirs| dirs.data_dir().to_path_buf())
                .ok_or(ConfigError::NoDataDir),
        }
    }

    pub fn chats_path(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.data_dir()?.join("chats.json"))
    }

    pub fn session_path(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.data_dir()?.join("session.json"))
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            account: self.account_name.clone(),
            password: self.account_pass.clone(),
            shared_secret: self.shared_secret.clone().filter(|secret| !secret.is_empty()),
        }
    }

    pub fn machine_config(&self) -> MachineConfig {
        MachineConfig {
            disconnect_policy: self.disconnect_policy,
            ..MachineConfig::default()
        }
    }
}

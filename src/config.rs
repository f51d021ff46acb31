//! Configuration loader and validator for the GitHub→Telegram bot.
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;
use url::Url;

use crate::schedule;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub telegram: Telegram,
    pub github: Github,
    pub http: Http,
    pub schedule: Schedules,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Upper bound on concurrent units of work within one cycle.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    pub bot_token: String,
    /// Route Bot API traffic through this proxy when set.
    #[serde(default)]
    pub proxy: Option<TelegramProxy>,
}

/// `http://`, `https://` or `socks5://` proxy with optional credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TelegramProxy {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// OAuth application credentials and API endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Github {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_oauth_base")]
    pub oauth_base: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
}

/// OAuth redirect listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Http {
    pub bind: String,
}

/// Cron expressions for the two reconciliation cycles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Schedules {
    /// Repository discovery per user.
    pub discover: String,
    /// Commit check per watch link.
    pub commits: String,
}

fn default_max_concurrency() -> usize {
    16
}

fn default_api_base() -> String {
    "https://api.github.com/".into()
}

fn default_oauth_base() -> String {
    "https://github.com/".into()
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_scopes() -> Vec<String> {
    vec!["repo".into()]
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// SQLite URL under `app.data_dir`; `DATABASE_URL` takes precedence at startup.
    pub fn database_url(&self) -> String {
        format!(
            "sqlite://{}/ghwatch.db",
            self.app.data_dir.trim_end_matches('/')
        )
    }

    /// Overlay secrets and deployment-specific values from the environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("GH_WATCHBOT_TELEGRAM_TOKEN") {
            self.telegram.bot_token = v;
        }
        if let Some(url) = lookup("GH_WATCHBOT_TELEGRAM_PROXY_URL") {
            match self.telegram.proxy.as_mut() {
                Some(proxy) => proxy.url = url,
                None => {
                    self.telegram.proxy = Some(TelegramProxy {
                        url,
                        username: None,
                        password: None,
                    })
                }
            }
        }
        if let Some(proxy) = self.telegram.proxy.as_mut() {
            if let Some(v) = lookup("GH_WATCHBOT_TELEGRAM_PROXY_USER") {
                proxy.username = Some(v);
            }
            if let Some(v) = lookup("GH_WATCHBOT_TELEGRAM_PROXY_PASSWORD") {
                proxy.password = Some(v);
            }
        }
        if let Some(v) = lookup("GH_WATCHBOT_GITHUB_CLIENT_ID") {
            self.github.client_id = v;
        }
        if let Some(v) = lookup("GH_WATCHBOT_GITHUB_CLIENT_SECRET") {
            self.github.client_secret = v;
        }
        if let Some(v) = lookup("GH_WATCHBOT_REDIRECT_URI") {
            self.github.redirect_uri = v;
        }
    }
}

/// Load configuration from a YAML file, apply environment overrides and validate.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    cfg.apply_env_overrides(|key| std::env::var(key).ok());
    validate(&cfg)?;
    Ok(cfg)
}

const PROXY_SCHEMES: [&str; 4] = ["http", "https", "socks5", "socks5h"];

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.max_concurrency == 0 {
        return Err(ConfigError::Invalid("app.max_concurrency must be > 0"));
    }

    if cfg.telegram.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.bot_token must be non-empty"));
    }
    if let Some(proxy) = &cfg.telegram.proxy {
        match Url::parse(&proxy.url) {
            Ok(url) if PROXY_SCHEMES.contains(&url.scheme()) && url.host().is_some() => {}
            _ => {
                return Err(ConfigError::Invalid(
                    "telegram.proxy.url must be an http, https or socks5 URL",
                ))
            }
        }
        if proxy.password.is_some() && proxy.username.is_none() {
            return Err(ConfigError::Invalid(
                "telegram.proxy.password requires telegram.proxy.username",
            ));
        }
    }

    let gh = &cfg.github;
    if gh.client_id.trim().is_empty() {
        return Err(ConfigError::Invalid("github.client_id must be non-empty"));
    }
    if gh.client_secret.trim().is_empty() {
        return Err(ConfigError::Invalid("github.client_secret must be non-empty"));
    }
    if Url::parse(&gh.redirect_uri).is_err() {
        return Err(ConfigError::Invalid("github.redirect_uri must be an absolute URL"));
    }
    if Url::parse(&gh.api_base).is_err() {
        return Err(ConfigError::Invalid("github.api_base must be an absolute URL"));
    }
    if Url::parse(&gh.oauth_base).is_err() {
        return Err(ConfigError::Invalid("github.oauth_base must be an absolute URL"));
    }
    if gh.timeout_secs == 0 {
        return Err(ConfigError::Invalid("github.timeout_secs must be > 0"));
    }

    if cfg.http.bind.parse::<SocketAddr>().is_err() {
        return Err(ConfigError::Invalid("http.bind must be a host:port socket address"));
    }

    if schedule::parse(&cfg.schedule.discover).is_err() {
        return Err(ConfigError::Invalid("schedule.discover must be a cron expression"));
    }
    if schedule::parse(&cfg.schedule.commits).is_err() {
        return Err(ConfigError::Invalid("schedule.commits must be a cron expression"));
    }

    Ok(())
}

/// Example configuration shipped with the bot.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  max_concurrency: 16

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"
  # proxy:
  #   url: "socks5://127.0.0.1:1080"
  #   username: "user"
  #   password: "secret"

github:
  client_id: "YOUR_GITHUB_OAUTH_CLIENT_ID"
  client_secret: "YOUR_GITHUB_OAUTH_CLIENT_SECRET"
  redirect_uri: "http://localhost:8080/oauth/redirect"
  timeout_secs: 5

http:
  bind: "0.0.0.0:8080"

schedule:
  discover: "*/15 * * * *"
  commits: "* * * * *"
"#
}

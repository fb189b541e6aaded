//! Configuration loader and validator for the posting bot.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub retry: Retry,
    pub telegram: Telegram,
    pub publisher: PublisherCfg,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Randomized delay window between successive publishes, milliseconds.
    pub pacing_min_ms: u64,
    pub pacing_max_ms: u64,
    /// Upper bound on one publish attempt; exceeding it counts as a
    /// transient failure.
    pub publish_timeout_ms: u64,
    /// Offset applied when parsing and rendering user-facing times.
    /// Default 330 (IST, UTC+5:30).
    pub utc_offset_minutes: i32,
    /// Post bodies are truncated to this many characters at publish time.
    pub max_post_length: usize,
}

/// Retry behavior for transient publish failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Retry {
    pub max_attempts: u32,
    /// Backoff window between attempts, milliseconds. The upper bound
    /// grows with the attempt number.
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    /// When true (the default), an item whose retries were exhausted stays
    /// eligible for a future run; when false it is permanently skipped.
    pub requeue_failed: bool,
}

/// Telegram bot settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    pub bot_token: String,
    /// Code a user must present via /auth before any other command.
    pub access_code: String,
}

/// Publish endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublisherCfg {
    pub endpoint: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.pacing_max_ms < cfg.app.pacing_min_ms {
        return Err(ConfigError::Invalid(
            "app.pacing_max_ms must be >= app.pacing_min_ms",
        ));
    }
    if cfg.app.publish_timeout_ms == 0 {
        return Err(ConfigError::Invalid("app.publish_timeout_ms must be > 0"));
    }
    if cfg.app.utc_offset_minutes.abs() > 14 * 60 {
        return Err(ConfigError::Invalid(
            "app.utc_offset_minutes must be within +/- 14 hours",
        ));
    }
    if cfg.app.max_post_length == 0 {
        return Err(ConfigError::Invalid("app.max_post_length must be > 0"));
    }

    if cfg.retry.max_attempts == 0 {
        return Err(ConfigError::Invalid("retry.max_attempts must be >= 1"));
    }
    if cfg.retry.backoff_max_ms < cfg.retry.backoff_min_ms {
        return Err(ConfigError::Invalid(
            "retry.backoff_max_ms must be >= retry.backoff_min_ms",
        ));
    }

    if cfg.telegram.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.bot_token must be non-empty"));
    }
    if cfg.telegram.access_code.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "telegram.access_code must be non-empty",
        ));
    }

    if cfg.publisher.endpoint.trim().is_empty() {
        return Err(ConfigError::Invalid("publisher.endpoint must be non-empty"));
    }

    Ok(())
}

/// Example configuration document shipped with the bot.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  pacing_min_ms: 5000
  pacing_max_ms: 15000
  publish_timeout_ms: 30000
  utc_offset_minutes: 330
  max_post_length: 280

retry:
  max_attempts: 3
  backoff_min_ms: 3000
  backoff_max_ms: 10000
  requeue_failed: true

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"
  access_code: "CHANGE_ME"

publisher:
  endpoint: "https://publish.example.com/v1/posts"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.retry.max_attempts, 3);
        assert!(cfg.retry.requeue_failed);
    }

    #[test]
    fn invalid_bot_token() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.telegram.bot_token = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("telegram.bot_token")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_access_code() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.telegram.access_code = "  ".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_pacing_window() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.pacing_min_ms = 20_000;
        cfg.app.pacing_max_ms = 10_000;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("pacing_max_ms")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_retry_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.retry.max_attempts = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.retry.backoff_min_ms = 5000;
        cfg.retry.backoff_max_ms = 1000;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_offset() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.utc_offset_minutes = 15 * 60;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_endpoint() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.publisher.endpoint = "".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.app.utc_offset_minutes, 330);
    }
}

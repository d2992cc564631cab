use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::artifacts::ARTIFACTS_DIR;
use crate::execution::retry::RetryPolicy;

pub const CONFIG_FILE: &str = "flowcast.toml";

/// State directory for the database, artifacts and the local bucket
pub const STATE_DIR: &str = ".flowcast";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub project: Project,
    pub provider: ProviderConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub output: OutputConfig,
    pub alert: AlertConfig,
    pub locations: BTreeMap<String, Location>,
    pub notifications: NotificationsConfig,
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project: Project::default(),
            provider: ProviderConfig::default(),
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
            output: OutputConfig::default(),
            alert: AlertConfig::default(),
            locations: default_locations(),
            notifications: NotificationsConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Project {
    pub name: String,
}

impl Default for Project {
    fn default() -> Self {
        Self {
            name: "flowcast".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub timeout_seconds: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.open-meteo.com/v1/forecast/".to_string(),
            timeout_seconds: 30,
        }
    }
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// SQLite file holding cached results and run history
    pub path: PathBuf,
    /// How long a saved forecast csv is reused
    pub forecast_ttl_hours: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: Path::new(STATE_DIR).join("flowcast.db"),
            forecast_ttl_hours: 24,
        }
    }
}

impl CacheConfig {
    pub fn forecast_ttl(&self) -> Duration {
        Duration::from_secs(self.forecast_ttl_hours.saturating_mul(3600))
    }
}

/// Retry settings for provider fetches
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub attempts: u32,
    pub delay_ms: u64,
    pub exponential_backoff: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 4,
            delay_ms: 1000,
            exponential_backoff: false,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        let delay = Duration::from_millis(self.delay_ms);
        if self.exponential_backoff {
            RetryPolicy::exponential(self.attempts, delay)
        } else {
            RetryPolicy::constant(self.attempts, delay)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Where weather.csv, most_recent_results.md and alert.csv are written
    pub dir: PathBuf,
    pub artifacts_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            artifacts_dir: Path::new(STATE_DIR).join(ARTIFACTS_DIR),
        }
    }
}

/// Bad-weather thresholds: rain in mm, cloud cover in percent
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub rain: f64,
    pub cloud: f64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            rain: 1.0,
            cloud: 90.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

fn default_locations() -> BTreeMap<String, Location> {
    [
        ("sheffield", 53.4, -1.47),
        ("paris", 48.9, 2.35),
        ("london", 51.5, -0.12),
    ]
    .into_iter()
    .map(|(name, lat, lon)| (name.to_string(), Location { lat, lon }))
    .collect()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub enabled: bool,
    /// Only send run summaries for runs that did not succeed
    pub on_failure: bool,
    pub slack: Option<SlackConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackConfig {
    pub webhook_url: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_seconds: u64,
}

fn default_webhook_timeout() -> u64 {
    10
}

impl SlackConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Local directory standing in for the upload bucket
    pub dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: Path::new(STATE_DIR).join("bucket"),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Load `path` if given, otherwise `flowcast.toml` when present, otherwise defaults
    pub fn discover(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None if Path::new(CONFIG_FILE).exists() => Self::load(Path::new(CONFIG_FILE)),
            None => Ok(Self::default()),
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content).context("Failed to parse flowcast.toml")?;
        config.expand_env()?;
        config.validate()?;
        Ok(config)
    }

    fn expand_env(&mut self) -> Result<()> {
        if let Some(slack) = self.notifications.slack.as_mut() {
            slack.webhook_url = shellexpand::env(&slack.webhook_url)
                .context("Failed to expand notifications.slack.webhook_url")?
                .into_owned();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.attempts < 1 {
            anyhow::bail!("retry.attempts must be at least 1");
        }

        if self.provider.timeout_seconds == 0 {
            anyhow::bail!("provider.timeout_seconds must be greater than 0");
        }

        for (name, location) in &self.locations {
            if !(-90.0..=90.0).contains(&location.lat) {
                anyhow::bail!("Location '{}' has latitude {} outside [-90, 90]", name, location.lat);
            }
            if !(-180.0..=180.0).contains(&location.lon) {
                anyhow::bail!("Location '{}' has longitude {} outside [-180, 180]", name, location.lon);
            }
        }

        if !self.alert.rain.is_finite() || !self.alert.cloud.is_finite() {
            anyhow::bail!("alert thresholds must be finite numbers");
        }

        if let Some(slack) = &self.notifications.slack {
            if self.notifications.enabled && slack.webhook_url.trim().is_empty() {
                anyhow::bail!("notifications.slack.webhook_url is empty");
            }
            if slack.timeout_seconds == 0 {
                anyhow::bail!("notifications.slack.timeout_seconds must be greater than 0");
            }
        }

        Ok(())
    }

    pub fn location(&self, name: &str) -> Option<Location> {
        self.locations.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[project]
name = "weather"

[provider]
base_url = "http://localhost:8080/v1/forecast"
timeout_seconds = 5

[cache]
enabled = false
forecast_ttl_hours = 12

[retry]
attempts = 2
delay_ms = 250
exponential_backoff = true

[alert]
rain = 2.5

[locations.san_diego]
lat = 32.72
lon = -117.16
"#;

        let config = Config::parse(toml_content).unwrap();
        assert_eq!(config.project.name, "weather");
        assert_eq!(config.provider.timeout(), Duration::from_secs(5));
        assert!(!config.cache.enabled);
        assert_eq!(config.cache.forecast_ttl(), Duration::from_secs(12 * 3600));
        assert_eq!(config.alert.rain, 2.5);
        assert_eq!(config.alert.cloud, 90.0);
        assert_eq!(config.locations.len(), 1);
        assert_eq!(
            config.location("san_diego"),
            Some(Location { lat: 32.72, lon: -117.16 })
        );

        let policy = config.retry.policy();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(500));
    }

    #[test]
    fn test_defaults_when_empty() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.project.name, "flowcast");
        assert!(config.cache.enabled);
        assert_eq!(config.retry.policy(), RetryPolicy::retries(3, Duration::from_secs(1)));
        assert_eq!(config.alert, AlertConfig { rain: 1.0, cloud: 90.0 });
        let names: Vec<_> = config.locations.keys().cloned().collect();
        assert_eq!(names, vec!["london", "paris", "sheffield"]);
        assert!(!config.notifications.enabled);
    }

    #[test]
    fn test_validation_errors() {
        let bad_retry = Config::parse("[retry]\nattempts = 0\n");
        assert!(bad_retry.is_err());

        let bad_lat = Config::parse("[locations.nowhere]\nlat = 91.0\nlon = 0.0\n");
        let message = format!("{:#}", bad_lat.unwrap_err());
        assert!(message.contains("nowhere"));

        let bad_threshold = Config::parse("[alert]\nrain = nan\n");
        assert!(bad_threshold.is_err());
    }

    #[test]
    fn test_webhook_url_expands_env() {
        std::env::set_var("FLOWCAST_TEST_SLACK_HOOK", "https://hooks.slack.com/services/T/B/X");
        let config = Config::parse(
            r##"
[notifications]
enabled = true

[notifications.slack]
webhook_url = "${FLOWCAST_TEST_SLACK_HOOK}"
channel = "#weather"
"##,
        )
        .unwrap();

        let slack = config.notifications.slack.unwrap();
        assert_eq!(slack.webhook_url, "https://hooks.slack.com/services/T/B/X");
        assert_eq!(slack.channel.as_deref(), Some("#weather"));
        assert_eq!(slack.timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_huge_forecast_ttl_saturates() {
        let config = Config::parse(&format!("[cache]\nforecast_ttl_hours = {}\n", i64::MAX)).unwrap();
        assert_eq!(config.cache.forecast_ttl(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_unset_env_var_is_an_error() {
        let result = Config::parse(
            r#"
[notifications.slack]
webhook_url = "${FLOWCAST_TEST_UNSET_VARIABLE}"
"#,
        );
        assert!(result.is_err());
    }
}

//! Pool configuration parser.
//!
//! A pool is configured from a TOML file:
//!
//! ```toml
//! name = "web"
//! snapshot_path = "/var/lib/cloudpool/web.json"
//!
//! [fetch]
//! refresh_interval = "30s"
//! reachability_timeout = "5m"
//!
//! [fetch.retries]
//! max_retries = 3
//! initial_delay = "5s"
//!
//! [scale_in]
//! victim_selection_policy = "CLOSEST_TO_INSTANCE_HOUR"
//! instance_hour_margin = "5m"
//!
//! [update]
//! update_interval = "60s"
//! ```
//!
//! Every section is optional and falls back to the defaults of
//! [`PoolConfig::new`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

const ONE_HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    /// Where the caching fetcher mirrors its last observation.
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub scale_in: ScaleInConfig,
    #[serde(default)]
    pub update: UpdateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default)]
    pub retries: RetriesConfig,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: String,
    #[serde(default = "default_reachability_timeout")]
    pub reachability_timeout: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetriesConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay")]
    pub initial_delay: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleInConfig {
    #[serde(default)]
    pub victim_selection_policy: VictimSelectionPolicy,
    #[serde(default = "default_instance_hour_margin")]
    pub instance_hour_margin: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    #[serde(default = "default_update_interval")]
    pub update_interval: String,
}

/// Rule for choosing which machines to terminate when the pool shrinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VictimSelectionPolicy {
    /// Machines closest to their next billing-hour boundary go first, and
    /// are terminated just before that boundary.
    #[default]
    ClosestToInstanceHour,
    OldestInstance,
    NewestInstance,
}

impl std::fmt::Display for VictimSelectionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VictimSelectionPolicy::ClosestToInstanceHour => "CLOSEST_TO_INSTANCE_HOUR",
            VictimSelectionPolicy::OldestInstance => "OLDEST_INSTANCE",
            VictimSelectionPolicy::NewestInstance => "NEWEST_INSTANCE",
        };
        f.write_str(s)
    }
}

/// Fixed-delay retry policy for pool fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one. Zero means a single attempt.
    pub max_retries: u32,
    /// Delay between consecutive attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// Total attempts, the initial call included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

fn default_refresh_interval() -> String {
    "30s".to_string()
}
fn default_reachability_timeout() -> String {
    "5m".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_initial_delay() -> String {
    "5s".to_string()
}
fn default_instance_hour_margin() -> String {
    "5m".to_string()
}
fn default_update_interval() -> String {
    "60s".to_string()
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            retries: RetriesConfig::default(),
            refresh_interval: default_refresh_interval(),
            reachability_timeout: default_reachability_timeout(),
        }
    }
}

impl Default for RetriesConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
        }
    }
}

impl Default for ScaleInConfig {
    fn default() -> Self {
        Self {
            victim_selection_policy: VictimSelectionPolicy::default(),
            instance_hour_margin: default_instance_hour_margin(),
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            update_interval: default_update_interval(),
        }
    }
}

impl PoolConfig {
    /// A config with default settings for every section.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            snapshot_path: None,
            fetch: FetchConfig::default(),
            scale_in: ScaleInConfig::default(),
            update: UpdateConfig::default(),
        }
    }

    /// Read and parse a config file. The result is not validated.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: PoolConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check that every setting parses and that the settings are coherent.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("name cannot be empty".into()));
        }

        self.fetch.retries.retry_policy()?;
        let refresh = self.fetch.refresh_interval()?;
        let timeout = self.fetch.reachability_timeout()?;
        if refresh.is_zero() {
            return Err(ConfigError::Invalid(
                "fetch.refresh_interval must be positive".into(),
            ));
        }
        if timeout < refresh {
            return Err(ConfigError::Invalid(format!(
                "fetch.reachability_timeout ({timeout:?}) must be at least fetch.refresh_interval ({refresh:?})"
            )));
        }

        if self.scale_in.instance_hour_margin()? >= ONE_HOUR {
            return Err(ConfigError::Invalid(
                "scale_in.instance_hour_margin must be less than one hour".into(),
            ));
        }

        if self.update.update_interval()?.is_zero() {
            return Err(ConfigError::Invalid(
                "update.update_interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl FetchConfig {
    pub fn refresh_interval(&self) -> ConfigResult<Duration> {
        parse_duration("fetch.refresh_interval", &self.refresh_interval)
    }

    pub fn reachability_timeout(&self) -> ConfigResult<Duration> {
        parse_duration("fetch.reachability_timeout", &self.reachability_timeout)
    }
}

impl RetriesConfig {
    pub fn retry_policy(&self) -> ConfigResult<RetryPolicy> {
        let delay = parse_duration("fetch.retries.initial_delay", &self.initial_delay)?;
        Ok(RetryPolicy::new(self.max_retries, delay))
    }
}

impl ScaleInConfig {
    pub fn instance_hour_margin(&self) -> ConfigResult<Duration> {
        parse_duration("scale_in.instance_hour_margin", &self.instance_hour_margin)
    }
}

impl UpdateConfig {
    pub fn update_interval(&self) -> ConfigResult<Duration> {
        parse_duration("update.update_interval", &self.update_interval)
    }
}

/// Parse a duration string like "250ms", "30s", "5m" or "1h".
/// Bare integers are seconds.
pub fn parse_duration(field: &'static str, value: &str) -> ConfigResult<Duration> {
    let s = value.trim();
    let invalid = || ConfigError::Duration {
        field,
        value: value.to_string(),
    };

    let (digits, unit_secs, millis) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, 0, true)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1, false)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60, false)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3600, false)
    } else {
        (s, 1, false)
    };

    let n: u64 = digits.trim().parse().map_err(|_| invalid())?;
    if millis {
        Ok(Duration::from_millis(n))
    } else {
        n.checked_mul(unit_secs)
            .map(Duration::from_secs)
            .ok_or_else(invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_is_an_io_error() {
        let err = PoolConfig::from_file(Path::new("/nonexistent/cloudpool/pool.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
        assert!(err.to_string().starts_with("failed to read config file"));
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
name = "web"
snapshot_path = "/tmp/web.json"

[fetch]
refresh_interval = "10s"
reachability_timeout = "2m"

[fetch.retries]
max_retries = 5
initial_delay = "500ms"

[scale_in]
victim_selection_policy = "OLDEST_INSTANCE"
instance_hour_margin = "3m"

[update]
update_interval = "15s"
"#;
        let config = PoolConfig::from_toml_str(toml_str).unwrap();
        config.validate().unwrap();

        assert_eq!(config.name, "web");
        assert_eq!(config.snapshot_path, Some(PathBuf::from("/tmp/web.json")));
        assert_eq!(
            config.fetch.retries.retry_policy().unwrap(),
            RetryPolicy::new(5, Duration::from_millis(500))
        );
        assert_eq!(config.fetch.refresh_interval().unwrap(), Duration::from_secs(10));
        assert_eq!(
            config.fetch.reachability_timeout().unwrap(),
            Duration::from_secs(120)
        );
        assert_eq!(
            config.scale_in.victim_selection_policy,
            VictimSelectionPolicy::OldestInstance
        );
        assert_eq!(
            config.scale_in.instance_hour_margin().unwrap(),
            Duration::from_secs(180)
        );
        assert_eq!(config.update.update_interval().unwrap(), Duration::from_secs(15));
    }

    #[test]
    fn parse_minimal_uses_defaults() {
        let config = PoolConfig::from_toml_str("name = \"batch\"").unwrap();
        config.validate().unwrap();
        assert_eq!(config.fetch.retries.max_retries, 3);
        assert_eq!(
            config.scale_in.victim_selection_policy,
            VictimSelectionPolicy::ClosestToInstanceHour
        );
        assert_eq!(config.update.update_interval().unwrap(), Duration::from_secs(60));
        assert!(config.snapshot_path.is_none());
    }

    #[test]
    fn validate_rejects_incoherent_settings() {
        let mut config = PoolConfig::new("");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.name = "web".into();
        config.fetch.reachability_timeout = "10s".into();
        config.fetch.refresh_interval = "30s".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = PoolConfig::new("web");
        config.scale_in.instance_hour_margin = "1h".into();
        assert!(config.validate().is_err());

        let mut config = PoolConfig::new("web");
        config.update.update_interval = "soon".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Duration { field: "update.update_interval", .. })
        ));
    }

    #[test]
    fn unknown_policy_fails_to_parse() {
        let toml_str = r#"
name = "web"
[scale_in]
victim_selection_policy = "RANDOM"
"#;
        assert!(matches!(
            PoolConfig::from_toml_str(toml_str),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn parse_duration_values() {
        assert_eq!(parse_duration("f", "30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("f", "5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("f", "2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("f", "250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("f", "45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("f", "").is_err());
        assert!(parse_duration("f", "-3s").is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let config = PoolConfig::new("web");
        let text = config.to_toml_string().unwrap();
        let parsed = PoolConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.name, "web");
        assert_eq!(parsed.fetch.refresh_interval, "30s");
    }
}

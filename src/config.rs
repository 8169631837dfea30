use crate::error::{ImporterError, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub importer: ImporterConfig,
    #[serde(default)]
    pub influxdb: InfluxConfig,
    pub clusters: Vec<ClusterConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImporterConfig {
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// A batch is flushed once it holds more points than this.
    #[serde(default = "default_threshold")]
    pub threshold: usize,
    /// A batch is flushed once this long has passed since the last flush.
    #[serde(with = "humantime_serde", default = "default_max_time_gap")]
    pub max_time_gap: Duration,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Write out the partially filled batch when the importer stops.
    #[serde(default = "default_true")]
    pub flush_on_close: bool,
    #[serde(default = "default_http_host")]
    pub http_host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(with = "humantime_serde", default = "default_kafka_timeout")]
    pub kafka_timeout: Duration,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InfluxConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default = "default_influx_url")]
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_measurement")]
    pub measurement: String,
    #[serde(default)]
    pub extra_tags: HashMap<String, String>,
    #[serde(with = "humantime_serde", default = "default_influx_timeout")]
    pub timeout: Duration,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusterConfig {
    pub name: String,
    pub bootstrap_servers: String,
    #[serde(default = "default_whitelist")]
    pub group_whitelist: Vec<String>,
    #[serde(default)]
    pub group_blacklist: Vec<String>,
    #[serde(default = "default_whitelist")]
    pub topic_whitelist: Vec<String>,
    #[serde(default = "default_topic_blacklist")]
    pub topic_blacklist: Vec<String>,
    #[serde(default)]
    pub consumer_properties: HashMap<String, String>,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_threshold() -> usize {
    10
}

fn default_max_time_gap() -> Duration {
    Duration::from_secs(10)
}

fn default_channel_capacity() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8000
}

fn default_kafka_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_influx_url() -> String {
    "http://localhost:8086".to_string()
}

fn default_database() -> String {
    "burrowx".to_string()
}

fn default_measurement() -> String {
    "consumer_metrics".to_string()
}

fn default_influx_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_whitelist() -> Vec<String> {
    vec![".*".to_string()]
}

fn default_topic_blacklist() -> Vec<String> {
    vec!["^__.*".to_string()]
}

impl Default for ImporterConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            threshold: default_threshold(),
            max_time_gap: default_max_time_gap(),
            channel_capacity: default_channel_capacity(),
            flush_on_close: true,
            http_host: default_http_host(),
            http_port: default_http_port(),
            kafka_timeout: default_kafka_timeout(),
        }
    }
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            enable: true,
            url: default_influx_url(),
            username: String::new(),
            password: String::new(),
            database: default_database(),
            measurement: default_measurement(),
            extra_tags: HashMap::new(),
            timeout: default_influx_timeout(),
        }
    }
}

impl Config {
    pub fn load(path: Option<&str>) -> Result<Config> {
        let config_path = path.unwrap_or("config.toml");

        if !Path::new(config_path).exists() {
            return Err(ImporterError::Config(format!(
                "Configuration file not found: {config_path}"
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        let content = Self::substitute_env_vars(&content)?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ImporterError::Config(format!("TOML parse error: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    fn substitute_env_vars(content: &str) -> Result<String> {
        // ${VAR}, ${?VAR} -> value or empty; ${VAR:-default} -> value or default
        let re = Regex::new(r"\$\{\??([^}:-]+)(?::-([^}]*))?\}")?;
        Ok(re
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
                std::env::var(var_name).unwrap_or_else(|_| default_value.to_string())
            })
            .to_string())
    }

    pub fn validate(&self) -> Result<()> {
        if self.clusters.is_empty() {
            return Err(ImporterError::Config(
                "At least one cluster must be configured".to_string(),
            ));
        }

        self.importer.validate()?;
        if self.influxdb.enable {
            self.influxdb.validate()?;
        }

        for cluster in &self.clusters {
            cluster.validate()?;
        }

        Ok(())
    }
}

impl ImporterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(ImporterError::Config(
                "importer.channel_capacity must be greater than zero".to_string(),
            ));
        }
        if self.max_time_gap.is_zero() {
            return Err(ImporterError::Config(
                "importer.max_time_gap must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ImporterError::Config(
                "importer.poll_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl InfluxConfig {
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(ImporterError::Config(
                "influxdb.url cannot be empty".to_string(),
            ));
        }
        if self.database.is_empty() {
            return Err(ImporterError::Config(
                "influxdb.database cannot be empty".to_string(),
            ));
        }
        if self.measurement.is_empty() {
            return Err(ImporterError::Config(
                "influxdb.measurement cannot be empty".to_string(),
            ));
        }
        if self.extra_tags.keys().any(String::is_empty) {
            return Err(ImporterError::Config(
                "influxdb.extra_tags keys cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ImporterError::Config(
                "Cluster name cannot be empty".to_string(),
            ));
        }

        if self.bootstrap_servers.is_empty() {
            return Err(ImporterError::Config(format!(
                "Cluster '{}': bootstrap_servers cannot be empty",
                self.name
            )));
        }

        self.compile_filters()?;
        Ok(())
    }

    pub fn compile_filters(&self) -> Result<CompiledFilters> {
        Ok(CompiledFilters {
            group_whitelist: compile_all(&self.group_whitelist)?,
            group_blacklist: compile_all(&self.group_blacklist)?,
            topic_whitelist: compile_all(&self.topic_whitelist)?,
            topic_blacklist: compile_all(&self.topic_blacklist)?,
        })
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).map_err(ImporterError::from))
        .collect()
}

#[derive(Debug, Clone)]
pub struct CompiledFilters {
    pub group_whitelist: Vec<Regex>,
    pub group_blacklist: Vec<Regex>,
    pub topic_whitelist: Vec<Regex>,
    pub topic_blacklist: Vec<Regex>,
}

impl CompiledFilters {
    pub fn matches_group(&self, group: &str) -> bool {
        let matches_whitelist = self.group_whitelist.iter().any(|r| r.is_match(group));
        let matches_blacklist = self.group_blacklist.iter().any(|r| r.is_match(group));
        matches_whitelist && !matches_blacklist
    }

    pub fn matches_topic(&self, topic: &str) -> bool {
        let matches_whitelist = self.topic_whitelist.iter().any(|r| r.is_match(topic));
        let matches_blacklist = self.topic_blacklist.iter().any(|r| r.is_match(topic));
        matches_whitelist && !matches_blacklist
    }
}

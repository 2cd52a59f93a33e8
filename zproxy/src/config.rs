//! YAML configuration file model and its conversion into runtime types.

use crate::units::{parse_duration, parse_size};
use aggregator::breaker::BreakerConfig;
use aggregator::codec::MAX_BACKENDS;
use aggregator::config::{Backend, OutboundLimits, Settings, backend_name_from_url};
use idcache::CacheConfig;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    Load(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub global: GlobalSection,
    #[serde(default)]
    pub zabbix: ZabbixSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub circuit_breaker: BreakerSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub metrics: Option<MetricsSection>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GlobalSection {
    #[serde(default)]
    pub listen_addr: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub read_timeout: Option<String>,
    #[serde(default)]
    pub write_timeout: Option<String>,
    #[serde(default)]
    pub idle_timeout: Option<String>,
    #[serde(default)]
    pub max_timeout: Option<String>,
    #[serde(default)]
    pub max_req_body_size: Option<String>,
    #[serde(default)]
    pub max_requests: Option<usize>,
    #[serde(default)]
    pub metric_path: Option<String>,
    #[serde(default)]
    pub monitoring_in_log: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ZabbixSection {
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub limits: LimitsSection,
}

#[derive(Debug, Deserialize)]
pub struct ServerEntry {
    pub id: u8,
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub ignore_ssl: bool,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitsSection {
    #[serde(default)]
    pub max_timeout_by_zbx: Option<String>,
    #[serde(default)]
    pub max_resp_body_size_by_zbx: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CacheSection {
    #[serde(default)]
    pub ttl: Option<String>,
    #[serde(default)]
    pub cleanup_interval: Option<String>,
    #[serde(default)]
    pub auto_save: Option<String>,
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default)]
    pub cached_fields: Option<HashMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BreakerSection {
    #[serde(default)]
    pub failure_threshold: Option<u32>,
    #[serde(default)]
    pub open_timeout: Option<String>,
    #[serde(default)]
    pub max_open_timeout: Option<String>,
    #[serde(default)]
    pub backoff_multiplier: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoggingSection {
    /// Methods whose bodies stay out of debug logs.
    #[serde(default)]
    pub exclude_requests: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct MetricsSection {
    pub statsd_host: String,
    pub statsd_port: u16,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_deref().filter(|s| !s.is_empty()).map(str::to_string)
}

fn duration_or(
    value: &Option<String>,
    key: &str,
    default: std::time::Duration,
) -> Result<std::time::Duration, ConfigError> {
    match value.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => parse_duration(raw).map_err(|e| ConfigError::Invalid(format!("{key}: {e}"))),
        None => Ok(default),
    }
}

impl FileConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config: FileConfig = serde_yaml::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for server in &self.zabbix.servers {
            if server.id == 0 || server.id > MAX_BACKENDS {
                return Err(ConfigError::Invalid(format!(
                    "backend id {} out of range [1,{MAX_BACKENDS}]",
                    server.id
                )));
            }
            if !seen.insert(server.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate backend id {}",
                    server.id
                )));
            }
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        non_empty(&self.global.listen_addr).unwrap_or_else(|| ":8080".to_string())
    }

    pub fn settings(&self) -> Result<Settings, ConfigError> {
        let defaults = Settings::default();

        let max_body_bytes = match self.global.max_req_body_size.as_deref().filter(|s| !s.is_empty())
        {
            Some(raw) => parse_size(raw)
                .map_err(|e| ConfigError::Invalid(format!("max_req_body_size: {e}")))?
                as usize,
            None => defaults.max_body_bytes,
        };

        Ok(Settings {
            token: non_empty(&self.global.token),
            login: non_empty(&self.global.login),
            password: non_empty(&self.global.password),
            max_body_bytes,
            max_timeout: duration_or(&self.global.max_timeout, "max_timeout", defaults.max_timeout)?,
            read_timeout: duration_or(
                &self.global.read_timeout,
                "read_timeout",
                defaults.read_timeout,
            )?,
            write_timeout: duration_or(
                &self.global.write_timeout,
                "write_timeout",
                defaults.write_timeout,
            )?,
            idle_timeout: duration_or(
                &self.global.idle_timeout,
                "idle_timeout",
                defaults.idle_timeout,
            )?,
            max_requests: self.global.max_requests.unwrap_or(defaults.max_requests),
            metric_path: non_empty(&self.global.metric_path),
            api_version: non_empty(&self.zabbix.api_version).unwrap_or(defaults.api_version),
            exclude_methods: self.logging.exclude_requests.clone(),
            dedup_types: defaults.dedup_types,
        })
    }

    pub fn backends(&self) -> Vec<Backend> {
        self.zabbix
            .servers
            .iter()
            .map(|server| Backend {
                id: server.id,
                name: server
                    .name
                    .clone()
                    .filter(|n| !n.is_empty())
                    .or_else(|| backend_name_from_url(&server.url))
                    .unwrap_or_else(|| server.url.clone()),
                url: server.url.clone(),
                token: server.token.clone(),
                ignore_tls: server.ignore_ssl,
            })
            .collect()
    }

    pub fn cache_config(&self) -> Result<CacheConfig, ConfigError> {
        let db_path = self
            .cache
            .db_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("./cache.redb"));
        let defaults = CacheConfig::with_defaults(db_path.clone());

        Ok(CacheConfig {
            ttl: duration_or(&self.cache.ttl, "cache.ttl", defaults.ttl)?,
            cleanup_interval: duration_or(
                &self.cache.cleanup_interval,
                "cache.cleanup_interval",
                defaults.cleanup_interval,
            )?,
            auto_save: duration_or(&self.cache.auto_save, "cache.auto_save", defaults.auto_save)?,
            db_path,
            cached_fields: self
                .cache
                .cached_fields
                .clone()
                .unwrap_or(defaults.cached_fields),
        })
    }

    pub fn breaker_config(&self) -> Result<BreakerConfig, ConfigError> {
        let defaults = BreakerConfig::default();
        Ok(BreakerConfig {
            failure_threshold: self
                .circuit_breaker
                .failure_threshold
                .unwrap_or(defaults.failure_threshold),
            open_timeout: duration_or(
                &self.circuit_breaker.open_timeout,
                "circuit_breaker.open_timeout",
                defaults.open_timeout,
            )?,
            max_open_timeout: duration_or(
                &self.circuit_breaker.max_open_timeout,
                "circuit_breaker.max_open_timeout",
                defaults.max_open_timeout,
            )?,
            backoff_multiplier: self
                .circuit_breaker
                .backoff_multiplier
                .unwrap_or(defaults.backoff_multiplier),
        })
    }

    pub fn outbound_limits(&self) -> Result<OutboundLimits, ConfigError> {
        let defaults = OutboundLimits::default();

        let max_response_bytes = match self
            .zabbix
            .limits
            .max_resp_body_size_by_zbx
            .as_deref()
            .filter(|s| !s.is_empty())
        {
            Some(raw) => parse_size(raw)
                .map_err(|e| ConfigError::Invalid(format!("max_resp_body_size_by_zbx: {e}")))?
                as usize,
            None => defaults.max_response_bytes,
        };

        Ok(OutboundLimits {
            request_timeout: duration_or(
                &self.zabbix.limits.max_timeout_by_zbx,
                "max_timeout_by_zbx",
                defaults.request_timeout,
            )?,
            max_response_bytes,
        })
    }
}

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;

use log::{debug, trace};
use pingora::server::configuration::{Opt, ServerConf};
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Name of the fallback entry in the rate limit table.
pub const DEFAULT_SOURCE: &str = "default";

#[derive(Default, Debug, Serialize, Deserialize, Validate)]
pub struct Config {
    #[serde(default)]
    pub pingora: ServerConf,

    #[validate(nested)]
    pub scout: Scout,
}

// Config file load and validation
impl Config {
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    // config file load entry point
    pub fn load_yaml_with_opt_override(opt: &Opt) -> Result<Self> {
        if let Some(path) = &opt.conf {
            let mut conf = Self::load_from_yaml(path)?;
            conf.merge_with_opt(opt);
            Ok(conf)
        } else {
            Error::e_explain(ReadError, "No path specified")
        }
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str).or_err_with(ReadError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;

        trace!("Loaded conf: {conf:?}");

        conf.validate()
            .or_err_with(FileReadError, || "Conf file valid failed")?;

        Ok(conf)
    }

    #[allow(dead_code)]
    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_default()
    }

    pub fn merge_with_opt(&mut self, opt: &Opt) {
        if opt.daemon {
            self.pingora.daemon = true;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Scout {
    #[validate(nested)]
    pub gateway: Gateway,

    #[serde(default = "Scout::default_rate_limits")]
    #[validate(custom(function = "validate_rate_limits"))]
    pub rate_limits: HashMap<String, RateLimit>,
    #[serde(default)]
    pub rate_limits_reconfigure: ReconfigurePolicy,

    #[serde(default)]
    #[validate(nested)]
    pub cache: Cache,
    #[serde(default)]
    #[validate(nested)]
    pub sessions: Sessions,

    pub log: Option<Log>,
    #[validate(nested)]
    pub admin: Option<Admin>,
    pub status: Option<Status>,
    pub prometheus: Option<Prometheus>,
}

impl Default for Scout {
    fn default() -> Self {
        Self {
            gateway: Gateway::default(),
            rate_limits: Self::default_rate_limits(),
            rate_limits_reconfigure: ReconfigurePolicy::default(),
            cache: Cache::default(),
            sessions: Sessions::default(),
            log: None,
            admin: None,
            status: None,
            prometheus: None,
        }
    }
}

impl Scout {
    /// Built-in per-source budgets for the external APIs the scrapers hit.
    pub fn default_rate_limits() -> HashMap<String, RateLimit> {
        [
            ("github", 10.0, 0.5),
            ("reddit", 5.0, 0.1),
            ("similarweb", 3.0, 0.05),
            ("wayback", 5.0, 0.2),
            ("linkedin", 5.0, 0.1),
            (DEFAULT_SOURCE, 10.0, 1.0),
        ]
        .into_iter()
        .map(|(source, max_tokens, refill_rate)| {
            (
                source.to_string(),
                RateLimit {
                    max_tokens,
                    refill_rate,
                },
            )
        })
        .collect()
    }
}

fn validate_rate_limits(limits: &HashMap<String, RateLimit>) -> Result<(), ValidationError> {
    if !limits.contains_key(DEFAULT_SOURCE) {
        return Err(ValidationError::new("default_rate_limit_required"));
    }

    for (source, limit) in limits {
        if source.is_empty() {
            return Err(ValidationError::new("empty_source_name"));
        }
        if !(limit.max_tokens.is_finite() && limit.max_tokens > 0.0) {
            let mut err = ValidationError::new("max_tokens_must_be_positive");
            err.add_param("source".into(), source);
            return Err(err);
        }
        if !(limit.refill_rate.is_finite() && limit.refill_rate >= 0.0) {
            let mut err = ValidationError::new("refill_rate_must_not_be_negative");
            err.add_param("source".into(), source);
            return Err(err);
        }
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_tokens: f64,
    /// Tokens per second. Zero means the bucket never refills.
    pub refill_rate: f64,
}

/// What to do when a bucket already exists and a different limit is configured for it.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconfigurePolicy {
    /// First configuration wins; later limits are ignored for the live bucket.
    #[default]
    Keep,
    /// Apply the new limit to the live bucket, clamping tokens to the new maximum.
    Update,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Gateway {
    pub address: SocketAddr,
    #[serde(default = "Gateway::default_push_idle_interval_ms")]
    #[validate(range(min = 10))]
    pub push_idle_interval_ms: u64,
    #[serde(default = "Gateway::default_pull_timeout_ms")]
    #[validate(range(min = 10))]
    pub pull_timeout_ms: u64,
    #[serde(default)]
    pub allow_origins: Vec<String>,
}

impl Default for Gateway {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], 8000)),
            push_idle_interval_ms: Self::default_push_idle_interval_ms(),
            pull_timeout_ms: Self::default_pull_timeout_ms(),
            allow_origins: Vec::new(),
        }
    }
}

impl Gateway {
    fn default_push_idle_interval_ms() -> u64 {
        500
    }

    fn default_pull_timeout_ms() -> u64 {
        1000
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Cache {
    /// Seconds a cached result stays servable when the caller gives no ttl.
    #[serde(default = "Cache::default_ttl")]
    #[validate(range(min = 1))]
    pub default_ttl: u64,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            default_ttl: Self::default_ttl(),
        }
    }
}

impl Cache {
    fn default_ttl() -> u64 {
        3600
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Sessions {
    #[serde(default = "Sessions::default_history_limit")]
    #[validate(range(min = 1))]
    pub history_limit: usize,
    /// Seconds a finished session without observers is kept for late joiners.
    #[serde(default = "Sessions::default_finished_linger")]
    pub finished_linger: u64,
    #[serde(default = "Sessions::default_reap_interval")]
    #[validate(range(min = 1))]
    pub reap_interval: u64,
}

impl Default for Sessions {
    fn default() -> Self {
        Self {
            history_limit: Self::default_history_limit(),
            finished_linger: Self::default_finished_linger(),
            reap_interval: Self::default_reap_interval(),
        }
    }
}

impl Sessions {
    fn default_history_limit() -> usize {
        1024
    }

    fn default_finished_linger() -> u64 {
        300
    }

    fn default_reap_interval() -> u64 {
        30
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Log {
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Admin {
    pub address: SocketAddr,
    #[validate(length(min = 1))]
    pub api_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Status {
    pub address: SocketAddr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Prometheus {
    pub address: SocketAddr,
}

use crate::error::{HarnessError, Result};
use crate::operator::Operator;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 5001;
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 5_000;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_DRAIN_MS: u64 = 2_000;
pub const DEFAULT_BOOTSTRAP_ADDRESS: &str = "host.docker.internal:6060";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AdaptationLimits {
    /// Minutes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_limit: Option<u64>,
}

impl AdaptationLimits {
    pub fn is_empty(&self) -> bool {
        self.time_limit.is_none() && self.attempt_limit.is_none()
    }

    pub fn require_any(&self) -> Result<()> {
        if self.is_empty() {
            return Err(HarnessError::Configuration(
                "at least one of time-limit or attempt-limit must be given".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct HarnessConfig {
    pub port: u16,
    pub url_ta: Option<String>,
    pub log_file: Option<PathBuf>,
    pub operator: Option<Operator>,
    pub filename: Option<String>,
    /// Minutes.
    pub time_limit: Option<u64>,
    pub attempt_limit: Option<u64>,
    pub settle_delay_ms: u64,
    pub drain_ms: u64,
    pub seed: Option<u64>,
    pub bootstrap_addresses: Vec<String>,
    pub request_timeout_secs: u64,
    pub report_path: Option<PathBuf>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            url_ta: None,
            log_file: None,
            operator: None,
            filename: None,
            time_limit: None,
            attempt_limit: None,
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            drain_ms: DEFAULT_DRAIN_MS,
            seed: None,
            bootstrap_addresses: vec![DEFAULT_BOOTSTRAP_ADDRESS.to_string()],
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            report_path: None,
        }
    }
}

impl HarnessConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            HarnessError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
            .map_err(|e| HarnessError::Configuration(format!("{}: {}", path.display(), e)))
    }

    pub fn from_yaml(raw: &str) -> std::result::Result<Self, serde_yaml::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
    }

    pub fn validate(&self) -> Result<()> {
        let url = self
            .url_ta
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| HarnessError::Configuration("TA URL is required".to_string()))?;
        reqwest::Url::parse(url)
            .map_err(|e| HarnessError::Configuration(format!("invalid TA URL '{}': {}", url, e)))?;
        if let Some(name) = &self.filename {
            if name.trim().is_empty() {
                return Err(HarnessError::Configuration(
                    "filename cannot be empty".to_string(),
                ));
            }
        }
        if self.bootstrap_addresses.is_empty() {
            return Err(HarnessError::Configuration(
                "at least one bootstrap address is required".to_string(),
            ));
        }
        self.limits().require_any()
    }

    pub fn limits(&self) -> AdaptationLimits {
        AdaptationLimits {
            time_limit: self.time_limit,
            attempt_limit: self.attempt_limit,
        }
    }

    pub fn run_config(&self) -> Result<RunConfig> {
        self.validate()?;
        Ok(RunConfig {
            url_ta: self.url_ta.clone().unwrap_or_default(),
            operator: self.operator,
            filename: self.filename.clone(),
            limits: self.limits(),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            seed: self.seed,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn drain(&self) -> Duration {
        Duration::from_millis(self.drain_ms)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub url_ta: String,
    pub operator: Option<Operator>,
    pub filename: Option<String>,
    pub limits: AdaptationLimits,
    pub settle_delay: Duration,
    pub seed: Option<u64>,
}

use crate::config::AdaptationLimits;
use crate::error::{HarnessError, Result};
use crate::operator::Operator;
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// A perturbation exactly as the TA described it. The harness never looks
/// inside; it is shuffled and posted back verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Perturbation(Value);

impl Perturbation {
    pub fn new(raw: Value) -> Self {
        Self(raw)
    }

    pub fn as_json(&self) -> &Value {
        &self.0
    }
}

pub trait TaClient: Send + Sync {
    fn list_mutable_files(&self) -> Result<Vec<String>>;

    fn list_perturbations(&self, file: &str, operator: Operator) -> Result<Vec<Perturbation>>;

    /// `Ok(false)` is a rejection of this one candidate, not a failure.
    fn apply_perturbation(&self, candidate: &Perturbation) -> Result<bool>;

    fn trigger_adaptation(&self, limits: AdaptationLimits) -> Result<()>;
}

pub struct HttpTaClient {
    base: Url,
    http: Client,
}

impl HttpTaClient {
    pub fn new(url_ta: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(url_ta).map_err(|e| {
            HarnessError::Configuration(format!("invalid TA URL '{}': {}", url_ta, e))
        })?;
        let http = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| HarnessError::transport(url_ta, e))?;
        Ok(Self { base, http })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| HarnessError::Configuration(format!("cannot join '{}': {}", path, e)))
    }
}

impl TaClient for HttpTaClient {
    fn list_mutable_files(&self) -> Result<Vec<String>> {
        let url = self.url("files")?;
        let resp = self
            .http
            .get(url.clone())
            .send()
            .map_err(|e| HarnessError::transport(url.as_str(), e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(HarnessError::transport(
                url.as_str(),
                format!("unexpected status {}", status),
            ));
        }
        let body: Value = resp
            .json()
            .map_err(|e| HarnessError::protocol(url.as_str(), format!("invalid JSON: {}", e)))?;
        let files = parse_file_list(&body)
            .ok_or_else(|| HarnessError::protocol(url.as_str(), "expected a list of strings"))?;
        debug!(count = files.len(), "listed mutable files");
        Ok(files)
    }

    fn list_perturbations(&self, file: &str, operator: Operator) -> Result<Vec<Perturbation>> {
        let url = self.url("perturbations")?;
        let resp = self
            .http
            .get(url.clone())
            .json(&json!({ "file": file, "shape": operator.as_str() }))
            .send()
            .map_err(|e| HarnessError::transport(url.as_str(), e))?;
        let status = resp.status();
        if !status.is_success() {
            warn!(%status, file, %operator, "TA refused to list perturbations");
            return Ok(Vec::new());
        }
        let body: Value = resp
            .json()
            .map_err(|e| HarnessError::protocol(url.as_str(), format!("invalid JSON: {}", e)))?;
        let candidates = body
            .get("perturbations")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                HarnessError::protocol(url.as_str(), "missing list-valued 'perturbations' field")
            })?;
        debug!(count = candidates.len(), file, %operator, "listed perturbations");
        Ok(candidates.iter().cloned().map(Perturbation::new).collect())
    }

    fn apply_perturbation(&self, candidate: &Perturbation) -> Result<bool> {
        let url = self.url("perturb")?;
        let resp = self
            .http
            .post(url.clone())
            .json(candidate.as_json())
            .send()
            .map_err(|e| HarnessError::transport(url.as_str(), e))?;
        let status = resp.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(true);
        }
        debug!(%status, "TA rejected perturbation");
        Ok(false)
    }

    fn trigger_adaptation(&self, limits: AdaptationLimits) -> Result<()> {
        limits.require_any()?;
        let url = self.url("adapt")?;
        info!(
            time_limit = ?limits.time_limit,
            attempt_limit = ?limits.attempt_limit,
            "triggering adaptation"
        );
        let resp = self
            .http
            .post(url.clone())
            .json(&limits)
            .send()
            .map_err(|e| HarnessError::transport(url.as_str(), e))?;
        let status = resp.status();
        if status != StatusCode::ACCEPTED {
            return Err(HarnessError::protocol(
                url.as_str(),
                format!("adaptation not accepted: status {}", status),
            ));
        }
        Ok(())
    }
}

fn parse_file_list(body: &Value) -> Option<Vec<String>> {
    body.as_array()?
        .iter()
        .map(|v| v.as_str().map(|s| s.to_string()))
        .collect()
}

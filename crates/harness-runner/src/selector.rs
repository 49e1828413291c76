use crate::client::{Perturbation, TaClient};
use crate::error::{HarnessError, Result};
use crate::operator::Operator;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Selection {
    pub file: String,
    pub operator: Operator,
    pub perturbation: Perturbation,
    pub attempts: usize,
    pub candidates: usize,
}

/// Discovery errors are returned as-is and never retried. Running out of
/// candidates yields `HarnessError::NoCandidates`.
pub fn select_and_apply<R: Rng + ?Sized>(
    client: &dyn TaClient,
    operator: Operator,
    fixed_file: Option<&str>,
    rng: &mut R,
) -> Result<Selection> {
    let files = client.list_mutable_files()?;
    let file = choose_file(&files, fixed_file, rng)?;
    info!(file = %file, %operator, available = files.len(), "selected target file");

    let mut candidates = client.list_perturbations(&file, operator)?;
    let total = candidates.len();
    if candidates.is_empty() {
        warn!(file = %file, %operator, "TA offered no perturbations");
    }
    candidates.shuffle(rng);

    let mut attempts = 0;
    while let Some(candidate) = candidates.pop() {
        attempts += 1;
        if client.apply_perturbation(&candidate)? {
            info!(file = %file, %operator, attempts, "perturbation applied");
            return Ok(Selection {
                file,
                operator,
                perturbation: candidate,
                attempts,
                candidates: total,
            });
        }
        debug!(attempt = attempts, remaining = candidates.len(), "candidate rejected");
    }

    Err(HarnessError::NoCandidates(format!(
        "none of {} perturbation(s) of '{}' with {} could be applied",
        total, file, operator
    )))
}

fn choose_file<R: Rng + ?Sized>(
    files: &[String],
    fixed_file: Option<&str>,
    rng: &mut R,
) -> Result<String> {
    if let Some(name) = fixed_file {
        if !files.iter().any(|f| f == name) {
            debug!(file = name, "fixed file not among files reported by TA");
        }
        return Ok(name.to_string());
    }
    files
        .choose(rng)
        .cloned()
        .ok_or_else(|| HarnessError::NoCandidates("TA reported no mutable files".to_string()))
}

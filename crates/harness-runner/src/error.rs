#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("transport error talking to TA at `{url}`: {message}")]
    Transport { url: String, message: String },
    #[error("protocol error from TA at `{url}`: {message}")]
    Protocol { url: String, message: String },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("no candidates: {0}")]
    NoCandidates(String),
    #[error("conflict: run `{run_id}` already exists")]
    Conflict { run_id: String },
}

impl HarnessError {
    pub fn transport(url: &str, err: impl std::fmt::Display) -> Self {
        Self::Transport {
            url: url.to_string(),
            message: err.to_string(),
        }
    }

    pub fn protocol(url: &str, message: impl Into<String>) -> Self {
        Self::Protocol {
            url: url.to_string(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport_error",
            Self::Protocol { .. } => "protocol_error",
            Self::Configuration(_) => "configuration_error",
            Self::NoCandidates(_) => "no_candidates",
            Self::Conflict { .. } => "conflict",
        }
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;

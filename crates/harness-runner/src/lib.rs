mod client;
mod config;
mod error;
mod gateway;
mod operator;
mod report;
mod run;
mod selector;

pub use client::{HttpTaClient, Perturbation, TaClient};
pub use config::{
    AdaptationLimits, HarnessConfig, RunConfig, DEFAULT_BOOTSTRAP_ADDRESS, DEFAULT_DRAIN_MS,
    DEFAULT_PORT, DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_SETTLE_DELAY_MS,
};
pub use error::{HarnessError, Result};
pub use gateway::{Ack, Notification, SignalGateway};
pub use operator::Operator;
pub use report::{summary_to_json, write_summary};
pub use run::{Completion, CompletionSignal, OutcomeReport, Phase, Run, RunSummary};
pub use selector::{select_and_apply, Selection};

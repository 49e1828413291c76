use crate::client::TaClient;
use crate::config::RunConfig;
use crate::error::{HarnessError, Result};
use crate::operator::Operator;
use crate::selector::{select_and_apply, Selection};
use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Starting,
    Selecting,
    Adapting,
    AwaitingCompletion,
    Done,
    Errored,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Starting => "starting",
            Phase::Selecting => "selecting",
            Phase::Adapting => "adapting",
            Phase::AwaitingCompletion => "awaiting_completion",
            Phase::Done => "done",
            Phase::Errored => "errored",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Errored)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutcomeReport {
    pub num_attempts: u64,
    /// Seconds.
    pub running_time: f64,
    pub outcome: String,
}

impl OutcomeReport {
    pub fn from_json(payload: &Value) -> Result<Self> {
        let report: OutcomeReport = serde_json::from_value(payload.clone())
            .map_err(|e| HarnessError::protocol("done", format!("malformed report: {}", e)))?;
        if !report.running_time.is_finite() || report.running_time < 0.0 {
            return Err(HarnessError::protocol(
                "done",
                format!("running-time must be non-negative, got {}", report.running_time),
            ));
        }
        Ok(report)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Done(OutcomeReport),
    Errored(Value),
    Failed { code: String, message: String },
}

/// Set-once slot shared between the gateway and the Run's thread. The first
/// `set` wins; later calls leave the stored value untouched.
#[derive(Debug, Default)]
pub struct CompletionSignal {
    slot: Mutex<Option<Completion>>,
    cond: Condvar,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, completion: Completion) -> bool {
        let mut slot = lock(&self.slot);
        if slot.is_some() {
            return false;
        }
        *slot = Some(completion);
        self.cond.notify_all();
        true
    }

    pub fn get(&self) -> Option<Completion> {
        lock(&self.slot).clone()
    }

    /// Blocks until the signal is set. No timeout.
    pub fn wait(&self) -> Completion {
        let mut slot = lock(&self.slot);
        loop {
            if let Some(completion) = slot.as_ref() {
                return completion.clone();
            }
            slot = self.cond.wait(slot).unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Completion> {
        let guard = lock(&self.slot);
        let (slot, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |slot| slot.is_none())
            .unwrap_or_else(|e| e.into_inner());
        slot.clone()
    }
}

#[derive(Debug)]
struct RunState {
    phase: Phase,
    history: Vec<Phase>,
    selection: Option<Selection>,
    status_count: usize,
    last_status: Option<Value>,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub phase: Phase,
    pub phases: Vec<Phase>,
    pub operator: Operator,
    pub selection: Option<Selection>,
    pub outcome: Option<OutcomeReport>,
    pub error: Option<Value>,
    pub status_count: usize,
    pub last_status: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub struct Run {
    id: String,
    config: RunConfig,
    operator: Operator,
    started_at: DateTime<Utc>,
    rng: Mutex<ChaCha8Rng>,
    signal: CompletionSignal,
    state: Mutex<RunState>,
}

impl Run {
    /// Resolves the operator once; it stays fixed for the Run's lifetime.
    pub fn new(config: RunConfig) -> Result<Self> {
        config.limits.require_any()?;
        let mut rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        let operator = Operator::resolve(config.operator, &mut rng);
        let started_at = Utc::now();
        let id = format!("run_{}", started_at.format("%Y%m%d_%H%M%S_%6f"));
        info!(
            run_id = %id,
            %operator,
            operator_configured = config.operator.is_some(),
            filename = ?config.filename,
            "run created"
        );
        Ok(Self {
            id,
            config,
            operator,
            started_at,
            rng: Mutex::new(rng),
            signal: CompletionSignal::new(),
            state: Mutex::new(RunState {
                phase: Phase::Idle,
                history: vec![Phase::Idle],
                selection: None,
                status_count: 0,
                last_status: None,
                finished_at: None,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub fn phase(&self) -> Phase {
        lock(&self.state).phase
    }

    pub fn is_terminal(&self) -> bool {
        self.phase().is_terminal()
    }

    pub fn signal(&self) -> &CompletionSignal {
        &self.signal
    }

    pub fn report(&self) -> Option<OutcomeReport> {
        match self.signal.get() {
            Some(Completion::Done(report)) => Some(report),
            _ => None,
        }
    }

    pub fn status_count(&self) -> usize {
        lock(&self.state).status_count
    }

    pub fn last_status(&self) -> Option<Value> {
        lock(&self.state).last_status.clone()
    }

    /// `on_terminal` runs on the Run's thread right after the phase becomes
    /// terminal, before the summary is handed to whoever joins.
    pub fn start<F>(
        self: &Arc<Self>,
        client: Arc<dyn TaClient>,
        on_terminal: F,
    ) -> std::io::Result<thread::JoinHandle<RunSummary>>
    where
        F: FnOnce() + Send + 'static,
    {
        self.advance(Phase::Starting);
        let run = Arc::clone(self);
        thread::Builder::new()
            .name(format!("harness-{}", self.id))
            .spawn(move || {
                let summary = run.execute(client.as_ref());
                on_terminal();
                summary
            })
    }

    pub fn execute(&self, client: &dyn TaClient) -> RunSummary {
        if self.phase() == Phase::Idle {
            self.advance(Phase::Starting);
        }
        let completion = match self.drive(client) {
            Ok(completion) => completion,
            Err(err) => {
                error!(run_id = %self.id, code = err.code(), error = %err, "run aborted");
                self.signal.set(Completion::Failed {
                    code: err.code().to_string(),
                    message: err.to_string(),
                });
                // Another writer may have been first; the stored value decides.
                self.signal.wait()
            }
        };
        self.finish(&completion)
    }

    fn drive(&self, client: &dyn TaClient) -> Result<Completion> {
        if let Some(early) = self.signal.wait_timeout(self.config.settle_delay) {
            warn!(run_id = %self.id, "run released before selection");
            return Ok(early);
        }

        self.advance(Phase::Selecting);
        let selection = {
            let mut rng = lock(&self.rng);
            select_and_apply(
                client,
                self.operator,
                self.config.filename.as_deref(),
                &mut *rng,
            )?
        };
        info!(
            run_id = %self.id,
            file = %selection.file,
            attempts = selection.attempts,
            perturbation = %selection.perturbation.as_json(),
            "target perturbed"
        );
        lock(&self.state).selection = Some(selection);
        if let Some(early) = self.signal.get() {
            warn!(run_id = %self.id, "run released before adaptation");
            return Ok(early);
        }

        self.advance(Phase::Adapting);
        match client.trigger_adaptation(self.config.limits) {
            Ok(()) => info!(run_id = %self.id, "adaptation accepted"),
            Err(err @ HarnessError::Configuration(_)) => return Err(err),
            Err(err) => {
                error!(run_id = %self.id, code = err.code(), error = %err, "adaptation trigger not acknowledged")
            }
        }

        self.advance(Phase::AwaitingCompletion);
        Ok(self.signal.wait())
    }

    fn finish(&self, completion: &Completion) -> RunSummary {
        let terminal = match completion {
            Completion::Done(report) => {
                info!(
                    run_id = %self.id,
                    num_attempts = report.num_attempts,
                    running_time = report.running_time,
                    outcome = %report.outcome,
                    "run done"
                );
                Phase::Done
            }
            Completion::Errored(payload) => {
                error!(run_id = %self.id, payload = %payload, "run errored by TA");
                Phase::Errored
            }
            Completion::Failed { code, message } => {
                error!(run_id = %self.id, code = %code, message = %message, "run failed");
                Phase::Errored
            }
        };
        self.advance(terminal);
        lock(&self.state).finished_at = Some(Utc::now());
        self.summary()
    }

    fn advance(&self, to: Phase) {
        let mut state = lock(&self.state);
        let from = state.phase;
        if from == to || from.is_terminal() {
            return;
        }
        state.phase = to;
        state.history.push(to);
        drop(state);
        info!(run_id = %self.id, from = %from, to = %to, "phase transition");
    }

    pub fn notify_done(&self, report: OutcomeReport) -> bool {
        let first = self.signal.set(Completion::Done(report));
        if !first {
            warn!(run_id = %self.id, "ignoring done: run already released");
        }
        first
    }

    pub fn notify_error(&self, payload: Value) -> bool {
        let first = self.signal.set(Completion::Errored(payload));
        if !first {
            warn!(run_id = %self.id, "ignoring error: run already released");
        }
        first
    }

    pub fn record_status(&self, payload: Value) {
        info!(run_id = %self.id, phase = %self.phase(), status = %payload, "TA status");
        let mut state = lock(&self.state);
        state.status_count += 1;
        state.last_status = Some(payload);
    }

    pub fn summary(&self) -> RunSummary {
        let completion = self.signal.get();
        let state = lock(&self.state);
        let (outcome, error) = match completion {
            Some(Completion::Done(report)) => (Some(report), None),
            Some(Completion::Errored(payload)) => (None, Some(json!({ "ta": payload }))),
            Some(Completion::Failed { code, message }) => {
                (None, Some(json!({ "code": code, "message": message })))
            }
            None => (None, None),
        };
        RunSummary {
            run_id: self.id.clone(),
            phase: state.phase,
            phases: state.history.clone(),
            operator: self.operator,
            selection: state.selection.clone(),
            outcome,
            error,
            status_count: state.status_count,
            last_status: state.last_status.clone(),
            started_at: self.started_at,
            finished_at: state.finished_at,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

use crate::client::TaClient;
use crate::config::{RunConfig, DEFAULT_DRAIN_MS};
use crate::error::{HarnessError, Result};
use crate::run::{Completion, OutcomeReport, Run, RunSummary};
use serde_json::{json, Value};
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    Ready,
    Error,
    Status,
    Done,
}

impl Notification {
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.split('?').next().unwrap_or(path);
        match path.trim_end_matches('/') {
            "/ready" => Some(Notification::Ready),
            "/error" => Some(Notification::Error),
            "/status" => Some(Notification::Status),
            "/done" => Some(Notification::Done),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Notification::Ready => "ready",
            Notification::Error => "error",
            Notification::Status => "status",
            Notification::Done => "done",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub status: u16,
    pub body: Option<Value>,
}

impl Ack {
    fn no_content() -> Self {
        Self {
            status: 204,
            body: None,
        }
    }

    fn status(status: u16) -> Self {
        Self { status, body: None }
    }
}

// Lets the Run's thread kick the serve loop out of a blocking `recv`.
#[derive(Default)]
struct Wakeup {
    server: Mutex<Option<Arc<Server>>>,
}

impl Wakeup {
    fn attach(&self, server: &Arc<Server>) {
        *self.slot() = Some(Arc::clone(server));
    }

    fn detach(&self) {
        self.slot().take();
    }

    fn wake(&self) {
        if let Some(server) = self.slot().as_ref() {
            server.unblock();
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<Server>>> {
        self.server.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct ActiveRun {
    run: Arc<Run>,
    worker: Option<JoinHandle<RunSummary>>,
}

pub struct SignalGateway {
    config: RunConfig,
    client: Arc<dyn TaClient>,
    bootstrap_addresses: Vec<String>,
    active: Mutex<Option<ActiveRun>>,
    wakeup: Arc<Wakeup>,
    drain: Duration,
}

impl SignalGateway {
    pub fn new(
        config: RunConfig,
        client: Arc<dyn TaClient>,
        bootstrap_addresses: Vec<String>,
    ) -> Self {
        Self {
            config,
            client,
            bootstrap_addresses,
            active: Mutex::new(None),
            wakeup: Arc::new(Wakeup::default()),
            drain: Duration::from_millis(DEFAULT_DRAIN_MS),
        }
    }

    pub fn with_drain(mut self, drain: Duration) -> Self {
        self.drain = drain;
        self
    }

    pub fn run(&self) -> Option<Arc<Run>> {
        self.active().as_ref().map(|a| Arc::clone(&a.run))
    }

    pub fn finished(&self) -> bool {
        self.run().map(|r| r.is_terminal()).unwrap_or(false)
    }

    pub fn join(&self) -> Option<RunSummary> {
        let worker = self.active().as_mut().and_then(|a| a.worker.take())?;
        match worker.join() {
            Ok(summary) => Some(summary),
            Err(_) => {
                error!("run thread panicked");
                self.run().map(|r| r.summary())
            }
        }
    }

    pub fn handle(&self, kind: Notification, body: &[u8]) -> Ack {
        let payload = parse_payload(body);
        debug!(notification = kind.as_str(), payload = %payload, "notification received");
        match kind {
            Notification::Ready => match self.on_ready() {
                Ok(ack) => ack,
                Err(err @ HarnessError::Conflict { .. }) => {
                    warn!(error = %err, "rejecting ready");
                    Ack::status(409)
                }
                Err(err) => {
                    error!(code = err.code(), error = %err, "cannot start run");
                    Ack::status(500)
                }
            },
            Notification::Error => {
                match self.run() {
                    Some(run) => {
                        error!(run_id = run.id(), payload = %payload, "TA reported error");
                        run.notify_error(payload);
                    }
                    None => warn!(payload = %payload, "error received before ready"),
                }
                Ack::no_content()
            }
            Notification::Status => {
                match self.run() {
                    Some(run) => run.record_status(payload),
                    None => info!(status = %payload, "status received before ready"),
                }
                Ack::no_content()
            }
            Notification::Done => {
                match self.run() {
                    Some(run) => self.on_done(&run, &payload),
                    None => warn!(payload = %payload, "done received before ready"),
                }
                Ack::no_content()
            }
        }
    }

    fn on_ready(&self) -> Result<Ack> {
        let mut active = self.active();
        if let Some(existing) = active.as_ref() {
            return Err(HarnessError::Conflict {
                run_id: existing.run.id().to_string(),
            });
        }
        let run = Arc::new(Run::new(self.config.clone())?);
        let wakeup = Arc::clone(&self.wakeup);
        let worker = match run.start(Arc::clone(&self.client), move || wakeup.wake()) {
            Ok(worker) => Some(worker),
            Err(e) => {
                error!(run_id = run.id(), error = %e, "failed to spawn run thread");
                run.signal().set(Completion::Failed {
                    code: "spawn_failed".to_string(),
                    message: e.to_string(),
                });
                // Drive to a terminal phase here so the server loop can exit.
                run.execute(self.client.as_ref());
                self.wakeup.wake();
                None
            }
        };
        info!(run_id = run.id(), addresses = ?self.bootstrap_addresses, "ready: run started");
        *active = Some(ActiveRun { run, worker });
        Ok(Ack {
            status: 200,
            body: Some(json!({ "bugzoo-server-urls": self.bootstrap_addresses })),
        })
    }

    fn on_done(&self, run: &Run, payload: &Value) {
        match OutcomeReport::from_json(payload) {
            Ok(report) => {
                info!(
                    run_id = run.id(),
                    num_attempts = report.num_attempts,
                    running_time = report.running_time,
                    outcome = %report.outcome,
                    "TA reported done"
                );
                run.notify_done(report);
            }
            Err(err) => {
                error!(run_id = run.id(), error = %err, "unusable done payload");
                run.signal().set(Completion::Failed {
                    code: err.code().to_string(),
                    message: err.to_string(),
                });
            }
        }
    }

    /// Answers requests until the Run is terminal, then keeps answering for
    /// the drain window so late `done`/`error`/`status` calls still get 204.
    pub fn serve(&self, server: Arc<Server>) -> std::io::Result<()> {
        self.wakeup.attach(&server);
        let result = self
            .serve_until_finished(&server)
            .and_then(|_| self.drain(&server));
        self.wakeup.detach();
        result
    }

    fn serve_until_finished(&self, server: &Server) -> std::io::Result<()> {
        while !self.finished() {
            match server.recv() {
                Ok(request) => self.respond(request),
                Err(_) if self.finished() => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn drain(&self, server: &Server) -> std::io::Result<()> {
        debug!(drain_ms = self.drain.as_millis() as u64, "run finished, draining");
        let deadline = Instant::now() + self.drain;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            if let Some(request) = server.recv_timeout(remaining)? {
                self.respond(request);
            }
        }
    }

    fn respond(&self, mut request: Request) {
        let path = request.url().to_string();
        let ack = match Notification::from_path(&path) {
            None => Ack::status(404),
            Some(_) if *request.method() != Method::Post => Ack::status(405),
            Some(kind) => {
                let mut body = Vec::new();
                match request.as_reader().read_to_end(&mut body) {
                    Ok(_) => self.handle(kind, &body),
                    Err(e) => {
                        warn!(path = %path, error = %e, "failed to read request body");
                        Ack::status(400)
                    }
                }
            }
        };
        debug!(path = %path, status = ack.status, "responding");
        let result = match ack.body {
            Some(body) => {
                let mut response =
                    Response::from_string(body.to_string()).with_status_code(StatusCode(ack.status));
                if let Ok(header) =
                    Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                {
                    response = response.with_header(header);
                }
                request.respond(response)
            }
            None => request.respond(Response::empty(StatusCode(ack.status))),
        };
        if let Err(e) = result {
            warn!(path = %path, error = %e, "failed to send response");
        }
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn parse_payload(body: &[u8]) -> Value {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

use harness_runner::{
    AdaptationLimits, HttpTaClient, Operator, Phase, RunConfig, SignalGateway, TaClient,
};
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tiny_http::{Response, Server, StatusCode};

#[derive(Debug, Clone)]
struct Recorded {
    method: String,
    path: String,
    body: Value,
}

#[derive(Clone)]
struct FakeTaScript {
    files: Value,
    files_status: u16,
    perturbations: Value,
    perturbations_status: u16,
    perturb_status: u16,
    adapt_status: u16,
    break_perturb_connection: bool,
}

impl Default for FakeTaScript {
    fn default() -> Self {
        Self {
            files: json!(["a.cpp", "b.cpp"]),
            files_status: 200,
            perturbations: json!({"perturbations": [{"kind": "flip", "at": 12}]}),
            perturbations_status: 200,
            perturb_status: 204,
            adapt_status: 202,
            break_perturb_connection: false,
        }
    }
}

/// A TA stand-in that answers from a fixed script and records every call.
struct FakeTa {
    url: String,
    requests: Arc<Mutex<Vec<Recorded>>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl FakeTa {
    fn start(script: FakeTaScript) -> Self {
        let server = Server::http("127.0.0.1:0").expect("bind fake TA");
        let addr = server.server_addr().to_ip().expect("ip listener");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let requests = Arc::clone(&requests);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    let Ok(Some(mut request)) = server.recv_timeout(Duration::from_millis(20))
                    else {
                        continue;
                    };
                    let mut raw = String::new();
                    let _ = request.as_reader().read_to_string(&mut raw);
                    let body = serde_json::from_str(&raw).unwrap_or(Value::Null);
                    let path = request.url().to_string();
                    requests.lock().expect("requests").push(Recorded {
                        method: request.method().to_string(),
                        path: path.clone(),
                        body,
                    });
                    if path == "/perturb" && script.break_perturb_connection {
                        let mut writer = request.into_writer();
                        let _ = writer.write_all(b"garbage\r\n\r\n");
                        let _ = writer.flush();
                        continue;
                    }
                    let (status, payload) = match path.as_str() {
                        "/files" => (script.files_status, Some(script.files.clone())),
                        "/perturbations" => (
                            script.perturbations_status,
                            Some(script.perturbations.clone()),
                        ),
                        "/perturb" => (script.perturb_status, None),
                        "/adapt" => (script.adapt_status, None),
                        _ => (404, None),
                    };
                    let _ = match payload {
                        Some(p) => request.respond(
                            Response::from_string(p.to_string())
                                .with_status_code(StatusCode(status)),
                        ),
                        None => request.respond(Response::empty(StatusCode(status))),
                    };
                }
            })
        };
        Self {
            url: format!("http://{}", addr),
            requests,
            stop,
            worker: Some(worker),
        }
    }

    fn paths(&self) -> Vec<String> {
        self.requests
            .lock()
            .expect("requests")
            .iter()
            .map(|r| r.path.clone())
            .collect()
    }

    fn requests_to(&self, path: &str) -> Vec<Recorded> {
        self.requests
            .lock()
            .expect("requests")
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }
}

impl Drop for FakeTa {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

struct Harness {
    url: String,
    gateway: Arc<SignalGateway>,
    server: Option<JoinHandle<()>>,
    http: reqwest::blocking::Client,
}

impl Harness {
    fn start(ta: &FakeTa, limits: AdaptationLimits) -> Self {
        Self::start_with_drain(ta, limits, Duration::from_millis(300))
    }

    fn start_with_drain(ta: &FakeTa, limits: AdaptationLimits, drain: Duration) -> Self {
        let config = RunConfig {
            url_ta: ta.url.clone(),
            operator: Some(Operator::FlipBooleanOperator),
            filename: None,
            limits,
            settle_delay: Duration::ZERO,
            seed: Some(2024),
        };
        let client: Arc<dyn TaClient> = Arc::new(
            HttpTaClient::new(&ta.url, Duration::from_secs(5)).expect("TA client"),
        );
        let gateway = Arc::new(
            SignalGateway::new(
                config,
                client,
                vec!["host.docker.internal:6060".to_string()],
            )
            .with_drain(drain),
        );
        let listener = Arc::new(Server::http("127.0.0.1:0").expect("bind gateway"));
        let addr = listener.server_addr().to_ip().expect("ip listener");
        let server = {
            let gateway = Arc::clone(&gateway);
            thread::spawn(move || gateway.serve(listener).expect("serve"))
        };
        Self {
            url: format!("http://{}", addr),
            gateway,
            server: Some(server),
            http: reqwest::blocking::Client::new(),
        }
    }

    fn post(&self, kind: &str, body: Value) -> reqwest::blocking::Response {
        self.http
            .post(format!("{}/{}", self.url, kind))
            .json(&body)
            .send()
            .expect("notification delivered")
    }

    fn wait_for_phase(&self, phase: Phase) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if self.gateway.run().map(|r| r.phase()) == Some(phase) {
                return;
            }
            assert!(Instant::now() < deadline, "timed out waiting for {}", phase);
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn wait_for_exit(&mut self) {
        if let Some(server) = self.server.take() {
            server.join().expect("gateway thread");
        }
    }
}

fn limits() -> AdaptationLimits {
    AdaptationLimits {
        time_limit: Some(2),
        attempt_limit: Some(50),
    }
}

#[test]
fn scenario_a_done_notification_records_report() {
    let ta = FakeTa::start(FakeTaScript::default());
    let mut harness = Harness::start(&ta, limits());

    let resp = harness.post("ready", json!({}));
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().expect("ready body");
    assert_eq!(body, json!({"bugzoo-server-urls": ["host.docker.internal:6060"]}));

    harness.wait_for_phase(Phase::AwaitingCompletion);
    assert_eq!(ta.paths(), vec!["/files", "/perturbations", "/perturb", "/adapt"]);

    let listing = ta.requests_to("/perturbations");
    assert_eq!(listing[0].method, "GET");
    assert_eq!(listing[0].body["shape"], json!("flip-boolean-operator"));
    let file = listing[0].body["file"].as_str().expect("file").to_string();
    assert!(file == "a.cpp" || file == "b.cpp");
    assert_eq!(
        ta.requests_to("/perturb")[0].body,
        json!({"kind": "flip", "at": 12})
    );
    assert_eq!(
        ta.requests_to("/adapt")[0].body,
        json!({"time-limit": 2, "attempt-limit": 50})
    );

    let status = harness.post("status", json!({"progress": 0.5}));
    assert_eq!(status.status().as_u16(), 204);

    let done = harness.post(
        "done",
        json!({"num-attempts": 3, "running-time": 1.5, "outcome": "repaired"}),
    );
    assert_eq!(done.status().as_u16(), 204);
    harness.wait_for_exit();

    let summary = harness.gateway.join().expect("summary");
    assert_eq!(summary.phase, Phase::Done);
    let report = summary.outcome.expect("report");
    assert_eq!(report.num_attempts, 3);
    assert_eq!(report.running_time, 1.5);
    assert_eq!(report.outcome, "repaired");
    assert_eq!(summary.status_count, 1);
    assert_eq!(summary.selection.expect("selection").file, file);
}

#[test]
fn scenario_b_no_files_errors_without_adaptation() {
    let ta = FakeTa::start(FakeTaScript {
        files: json!([]),
        ..FakeTaScript::default()
    });
    let mut harness = Harness::start(&ta, limits());
    assert_eq!(harness.post("ready", json!({})).status().as_u16(), 200);
    harness.wait_for_exit();

    let summary = harness.gateway.join().expect("summary");
    assert_eq!(summary.phase, Phase::Errored);
    assert_eq!(summary.error.expect("error")["code"], json!("no_candidates"));
    assert_eq!(ta.paths(), vec!["/files"]);
}

#[test]
fn scenario_c_all_rejections_error_without_adaptation() {
    let ta = FakeTa::start(FakeTaScript {
        perturbations: json!({"perturbations": [{"id": 1}, {"id": 2}, {"id": 3}]}),
        perturb_status: 409,
        ..FakeTaScript::default()
    });
    let mut harness = Harness::start(&ta, limits());
    assert_eq!(harness.post("ready", json!({})).status().as_u16(), 200);
    harness.wait_for_exit();

    let summary = harness.gateway.join().expect("summary");
    assert_eq!(summary.phase, Phase::Errored);
    let applied: Vec<Value> = ta
        .requests_to("/perturb")
        .into_iter()
        .map(|r| r.body)
        .collect();
    assert_eq!(applied.len(), 3);
    for id in 1..=3 {
        assert!(applied.contains(&json!({"id": id})), "candidate {} not tried", id);
    }
    assert!(ta.requests_to("/adapt").is_empty());
}

#[test]
fn refused_perturbation_listing_is_not_a_transport_error() {
    let ta = FakeTa::start(FakeTaScript {
        perturbations_status: 500,
        ..FakeTaScript::default()
    });
    let mut harness = Harness::start(&ta, limits());
    harness.post("ready", json!({}));
    harness.wait_for_exit();
    let summary = harness.gateway.join().expect("summary");
    assert_eq!(summary.error.expect("error")["code"], json!("no_candidates"));
    assert!(ta.requests_to("/perturb").is_empty());
}

#[test]
fn malformed_file_listing_is_a_protocol_error() {
    let ta = FakeTa::start(FakeTaScript {
        files: json!({"files": "a.cpp"}),
        ..FakeTaScript::default()
    });
    let mut harness = Harness::start(&ta, limits());
    harness.post("ready", json!({}));
    harness.wait_for_exit();
    let summary = harness.gateway.join().expect("summary");
    assert_eq!(summary.phase, Phase::Errored);
    assert_eq!(summary.error.expect("error")["code"], json!("protocol_error"));
}

#[test]
fn rejected_adaptation_trigger_still_waits_for_done() {
    let ta = FakeTa::start(FakeTaScript {
        adapt_status: 500,
        ..FakeTaScript::default()
    });
    let mut harness = Harness::start(&ta, AdaptationLimits {
        time_limit: None,
        attempt_limit: Some(7),
    });
    harness.post("ready", json!({}));
    harness.wait_for_phase(Phase::AwaitingCompletion);
    assert_eq!(
        ta.requests_to("/adapt")[0].body,
        json!({"attempt-limit": 7})
    );
    assert_eq!(harness.post("error", json!({"why": "gave up"})).status().as_u16(), 204);
    harness.wait_for_exit();
    let summary = harness.gateway.join().expect("summary");
    assert_eq!(summary.phase, Phase::Errored);
    assert_eq!(summary.error.expect("error"), json!({"ta": {"why": "gave up"}}));
}

#[test]
fn second_ready_is_rejected_with_conflict() {
    let ta = FakeTa::start(FakeTaScript::default());
    let mut harness = Harness::start(&ta, limits());
    assert_eq!(harness.post("ready", json!({})).status().as_u16(), 200);
    harness.wait_for_phase(Phase::AwaitingCompletion);

    let second = harness.post("ready", json!({}));
    assert_eq!(second.status().as_u16(), 409);
    assert_eq!(ta.requests_to("/files").len(), 1);

    let unknown = harness.post("stop", json!({}));
    assert_eq!(unknown.status().as_u16(), 404);
    let wrong_method = harness
        .http
        .get(format!("{}/done", harness.url))
        .send()
        .expect("request");
    assert_eq!(wrong_method.status().as_u16(), 405);

    harness.post(
        "done",
        json!({"num-attempts": 1, "running-time": 0.25, "outcome": "repaired"}),
    );
    harness.wait_for_exit();
    assert_eq!(
        harness.gateway.join().expect("summary").phase,
        Phase::Done
    );
}

#[test]
fn late_notifications_after_done_are_acknowledged() {
    let ta = FakeTa::start(FakeTaScript::default());
    let mut harness = Harness::start_with_drain(&ta, limits(), Duration::from_secs(3));
    assert_eq!(harness.post("ready", json!({})).status().as_u16(), 200);
    harness.wait_for_phase(Phase::AwaitingCompletion);

    let done = json!({"num-attempts": 2, "running-time": 0.5, "outcome": "repaired"});
    assert_eq!(harness.post("done", done.clone()).status().as_u16(), 204);
    harness.wait_for_phase(Phase::Done);
    assert!(harness.gateway.finished());

    assert_eq!(harness.post("error", json!({"late": true})).status().as_u16(), 204);
    assert_eq!(harness.post("status", json!({"progress": 1.0})).status().as_u16(), 204);
    assert_eq!(harness.post("done", done).status().as_u16(), 204);
    harness.wait_for_exit();

    let summary = harness.gateway.join().expect("summary");
    assert_eq!(summary.phase, Phase::Done);
    assert_eq!(summary.error, None);
    assert_eq!(summary.outcome.expect("report").num_attempts, 2);
    assert_eq!(summary.status_count, 1);
    assert_eq!(summary.last_status, Some(json!({"progress": 1.0})));
}

#[test]
fn perturbation_listing_without_list_is_a_protocol_error() {
    let ta = FakeTa::start(FakeTaScript {
        perturbations: json!({"candidates": [{"id": 1}]}),
        ..FakeTaScript::default()
    });
    let mut harness = Harness::start(&ta, limits());
    assert_eq!(harness.post("ready", json!({})).status().as_u16(), 200);
    harness.wait_for_exit();

    let summary = harness.gateway.join().expect("summary");
    assert_eq!(summary.phase, Phase::Errored);
    assert_eq!(summary.error.expect("error")["code"], json!("protocol_error"));
    assert_eq!(ta.paths(), vec!["/files", "/perturbations"]);
    assert!(ta.requests_to("/adapt").is_empty());
}

#[test]
fn failed_file_listing_is_a_transport_error() {
    let ta = FakeTa::start(FakeTaScript {
        files_status: 503,
        ..FakeTaScript::default()
    });
    let mut harness = Harness::start(&ta, limits());
    assert_eq!(harness.post("ready", json!({})).status().as_u16(), 200);
    harness.wait_for_exit();

    let summary = harness.gateway.join().expect("summary");
    assert_eq!(summary.phase, Phase::Errored);
    assert_eq!(summary.error.expect("error")["code"], json!("transport_error"));
    assert_eq!(ta.paths(), vec!["/files"]);
    assert!(ta.requests_to("/adapt").is_empty());
}

#[test]
fn broken_connection_while_applying_is_fatal() {
    let ta = FakeTa::start(FakeTaScript {
        perturbations: json!({"perturbations": [{"id": 1}, {"id": 2}, {"id": 3}]}),
        break_perturb_connection: true,
        ..FakeTaScript::default()
    });
    let mut harness = Harness::start(&ta, limits());
    assert_eq!(harness.post("ready", json!({})).status().as_u16(), 200);
    harness.wait_for_exit();

    let summary = harness.gateway.join().expect("summary");
    assert_eq!(summary.phase, Phase::Errored);
    assert_eq!(summary.error.expect("error")["code"], json!("transport_error"));
    assert_eq!(ta.requests_to("/perturb").len(), 1);
    assert!(ta.requests_to("/adapt").is_empty());
}

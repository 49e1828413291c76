use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use harness_runner::{HarnessConfig, HttpTaClient, Operator, Phase, SignalGateway, TaClient};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "mock-harness",
    version = "0.3.0",
    about = "Mock test harness driving a TA through one perturb-and-adapt run"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OperatorArg {
    #[value(name = "delete-void-function-call")]
    DeleteVoidFunctionCall,
    #[value(name = "flip-arithmetic-operator")]
    FlipArithmeticOperator,
    #[value(name = "flip-boolean-operator")]
    FlipBooleanOperator,
    #[value(name = "flip-relational-operator")]
    FlipRelationalOperator,
    #[value(name = "undo-transformation")]
    UndoTransformation,
    #[value(name = "delete-conditional-control-flow")]
    DeleteConditionalControlFlow,
    #[value(name = "flip-signedness")]
    FlipSignedness,
}

impl From<OperatorArg> for Operator {
    fn from(value: OperatorArg) -> Self {
        match value {
            OperatorArg::DeleteVoidFunctionCall => Operator::DeleteVoidFunctionCall,
            OperatorArg::FlipArithmeticOperator => Operator::FlipArithmeticOperator,
            OperatorArg::FlipBooleanOperator => Operator::FlipBooleanOperator,
            OperatorArg::FlipRelationalOperator => Operator::FlipRelationalOperator,
            OperatorArg::UndoTransformation => Operator::UndoTransformation,
            OperatorArg::DeleteConditionalControlFlow => Operator::DeleteConditionalControlFlow,
            OperatorArg::FlipSignedness => Operator::FlipSignedness,
        }
    }
}

#[derive(Args, Debug, Default)]
struct ConfigArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(short, long)]
    port: Option<u16>,
    #[arg(long)]
    url_ta: Option<String>,
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Perturbation operator; chosen at random when omitted.
    #[arg(long, value_enum)]
    operator: Option<OperatorArg>,
    #[arg(long)]
    filename: Option<String>,
    /// Adaptation time limit, in minutes.
    #[arg(long)]
    time_limit: Option<u64>,
    #[arg(long)]
    attempt_limit: Option<u64>,
    #[arg(long)]
    settle_delay_ms: Option<u64>,
    #[arg(long)]
    drain_ms: Option<u64>,
    #[arg(long)]
    seed: Option<u64>,
    /// Address handed back in the `ready` response. Repeatable.
    #[arg(long = "bootstrap-address")]
    bootstrap_addresses: Vec<String>,
    #[arg(long)]
    request_timeout_secs: Option<u64>,
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    Serve {
        #[command(flatten)]
        args: ConfigArgs,
        #[arg(long)]
        json: bool,
    },
    Describe {
        #[command(flatten)]
        args: ConfigArgs,
        #[arg(long)]
        json: bool,
    },
    Operators {
        #[arg(long)]
        json: bool,
    },
}

impl Commands {
    fn json(&self) -> bool {
        match self {
            Commands::Serve { json, .. } | Commands::Describe { json, .. } => *json,
            Commands::Operators { json } => *json,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let json = cli.command.json();
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            println!("{}", payload);
            if payload["ok"] == json!(false) {
                std::process::exit(1);
            }
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) if json => {
            println!("{}", failure_envelope(&err));
            std::process::exit(1);
        }
        Err(err) => Err(err),
    }
}

fn failure_envelope(err: &anyhow::Error) -> Value {
    json!({ "ok": false, "error": format!("{:#}", err) })
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Serve { args, json } => {
            let config = resolve_config(&args)?;
            init_tracing(config.log_file.as_deref())?;
            let summary = serve(&config)?;
            let done = summary.phase == Phase::Done;
            if json {
                return Ok(Some(json!({
                    "ok": done,
                    "command": "serve",
                    "run": harness_runner::summary_to_json(&summary),
                })));
            }
            print_run(&summary);
            if !done {
                return Err(anyhow!(
                    "run {} ended in phase {}",
                    summary.run_id,
                    summary.phase
                ));
            }
        }
        Commands::Describe { args, json } => {
            let config = resolve_config(&args)?;
            let validation = config.validate();
            if json {
                return Ok(Some(json!({
                    "ok": validation.is_ok(),
                    "command": "describe",
                    "config": serde_json::to_value(&config)?,
                    "error": validation.as_ref().err().map(|e| e.to_string()),
                })));
            }
            print_config(&config);
            validation?;
        }
        Commands::Operators { json } => {
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "operators",
                    "operators": Operator::ALL.iter().map(|op| op.as_str()).collect::<Vec<_>>(),
                })));
            }
            for op in Operator::ALL {
                println!("{}", op);
            }
        }
    }
    Ok(None)
}

fn resolve_config(args: &ConfigArgs) -> Result<HarnessConfig> {
    let mut config = match &args.config {
        Some(path) => HarnessConfig::load(path)?,
        None => HarnessConfig::default(),
    };
    apply_overrides(&mut config, args);
    Ok(config)
}

fn apply_overrides(config: &mut HarnessConfig, args: &ConfigArgs) {
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(url) = &args.url_ta {
        config.url_ta = Some(url.clone());
    }
    if let Some(path) = &args.log_file {
        config.log_file = Some(path.clone());
    }
    if let Some(op) = args.operator {
        config.operator = Some(op.into());
    }
    if let Some(name) = &args.filename {
        config.filename = Some(name.clone());
    }
    if let Some(minutes) = args.time_limit {
        config.time_limit = Some(minutes);
    }
    if let Some(attempts) = args.attempt_limit {
        config.attempt_limit = Some(attempts);
    }
    if let Some(ms) = args.settle_delay_ms {
        config.settle_delay_ms = ms;
    }
    if let Some(ms) = args.drain_ms {
        config.drain_ms = ms;
    }
    if let Some(seed) = args.seed {
        config.seed = Some(seed);
    }
    if !args.bootstrap_addresses.is_empty() {
        config.bootstrap_addresses = args.bootstrap_addresses.clone();
    }
    if let Some(secs) = args.request_timeout_secs {
        config.request_timeout_secs = secs;
    }
    if let Some(path) = &args.report {
        config.report_path = Some(path.clone());
    }
}

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if let Some(path) = log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

fn serve(config: &HarnessConfig) -> Result<harness_runner::RunSummary> {
    let run_config = config.run_config()?;
    let client: Arc<dyn TaClient> = Arc::new(HttpTaClient::new(
        &run_config.url_ta,
        config.request_timeout(),
    )?);
    let gateway = SignalGateway::new(run_config, client, config.bootstrap_addresses.clone())
        .with_drain(config.drain());

    let bind = format!("0.0.0.0:{}", config.port);
    let server = tiny_http::Server::http(&bind)
        .map(Arc::new)
        .map_err(|e| anyhow!("failed to listen on {}: {}", bind, e))?;
    info!(
        address = %bind,
        url_ta = ?config.url_ta,
        operator = ?config.operator,
        "mock harness listening"
    );

    gateway.serve(server).context("gateway stopped")?;
    let summary = gateway
        .join()
        .ok_or_else(|| anyhow!("gateway stopped without a run"))?;

    if let Some(path) = &config.report_path {
        if let Err(err) = harness_runner::write_summary(path, &summary) {
            error!(error = %err, "failed to export run summary");
        } else {
            info!(path = %path.display(), "run summary exported");
        }
    }
    Ok(summary)
}

fn print_config(config: &HarnessConfig) {
    println!("port: {}", config.port);
    println!("url-ta: {}", config.url_ta.as_deref().unwrap_or("<unset>"));
    println!(
        "operator: {}",
        config.operator.map(|op| op.as_str()).unwrap_or("random")
    );
    if let Some(name) = &config.filename {
        println!("filename: {}", name);
    }
    if let Some(minutes) = config.time_limit {
        println!("time-limit: {} min", minutes);
    }
    if let Some(attempts) = config.attempt_limit {
        println!("attempt-limit: {}", attempts);
    }
    println!("settle-delay-ms: {}", config.settle_delay_ms);
    println!("drain-ms: {}", config.drain_ms);
    if let Some(seed) = config.seed {
        println!("seed: {}", seed);
    }
    println!("bootstrap-addresses: {:?}", config.bootstrap_addresses);
    if let Some(path) = &config.log_file {
        println!("log-file: {}", path.display());
    }
    if let Some(path) = &config.report_path {
        println!("report-path: {}", path.display());
    }
}

fn print_run(summary: &harness_runner::RunSummary) {
    println!("run: {}", summary.run_id);
    println!("phase: {}", summary.phase);
    println!("operator: {}", summary.operator);
    if let Some(selection) = &summary.selection {
        println!("file: {}", selection.file);
        println!(
            "perturbation_attempts: {}/{}",
            selection.attempts, selection.candidates
        );
    }
    if let Some(report) = &summary.outcome {
        println!("num_attempts: {}", report.num_attempts);
        println!("running_time: {}", report.running_time);
        println!("outcome: {}", report.outcome);
    }
    println!("status_updates: {}", summary.status_count);
}

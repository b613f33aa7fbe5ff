//! # Surge CLI
//!
//! ```bash
//! # Run a built-in workflow locally
//! surge run get --target http://127.0.0.1:8080/ --set vus=50 --set duration=30s
//!
//! # Start a cluster node and replicate a run to every member
//! surge node --id 1 --listen 0.0.0.0:7946 --seed 10.0.0.1:7946 --start mixed
//!
//! # Show what the settings file and SURGE_* variables resolve to
//! surge settings
//! ```
//!
//! Exit codes: 0 clean completion, 1 workflow or settings load error,
//! 2 runtime error, 130 interrupted (partial results are still delivered).

mod demo;
mod settings;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use surge_cluster::{ClusterNode, Command as ClusterCommand};
use surge_core::{NodeId, SurgeError, WorkflowOptions};
use surge_engine::{Engine, Registry, RunReport, SinkConfig, SinkDispatcher, Workflow};

use crate::settings::{parse_override, Settings};

const EXIT_OK: u8 = 0;
const EXIT_LOAD: u8 = 1;
const EXIT_RUNTIME: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

const STATUS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "surge")]
#[command(version)]
#[command(about = "Surge - distributed load generation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (TOML); missing files are ignored
    #[arg(short, long, global = true, default_value = "surge.toml", env = "SURGE_CONFIG")]
    config: PathBuf,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow on this machine
    Run {
        /// Registered workflow name
        workflow: String,

        /// Option override, e.g. `--set vus=50`
        #[arg(short, long = "set", value_parser = parse_override)]
        overrides: Vec<(String, String)>,

        /// Base URL for the built-in workflows
        #[arg(short, long)]
        target: Option<String>,
    },

    /// Join a cluster and run the workflows it agrees on
    Node {
        #[arg(long)]
        id: Option<u64>,

        #[arg(long)]
        listen: Option<String>,

        /// Existing member to join through; repeatable
        #[arg(long = "seed")]
        seeds: Vec<String>,

        /// Replicate a start of this workflow once joined
        #[arg(long)]
        start: Option<String>,

        /// Option override sent along with `--start`
        #[arg(short, long = "set", value_parser = parse_override)]
        overrides: Vec<(String, String)>,

        #[arg(short, long)]
        target: Option<String>,
    },

    /// List workflows, personas and sinks
    List,

    /// Print the effective settings as TOML
    Settings,
}

fn init_logging(verbose: bool, format: LogFormat) {
    let env_filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(false))
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let mut settings = match Settings::load(&cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "cannot load settings");
            return ExitCode::from(EXIT_LOAD);
        }
    };

    let code = match cli.command {
        Commands::Run {
            workflow,
            overrides,
            target,
        } => {
            if let Some(target) = target {
                settings.target = target;
            }
            run_local(settings, &workflow, &overrides).await
        }
        Commands::Node {
            id,
            listen,
            seeds,
            start,
            overrides,
            target,
        } => {
            if let Some(target) = target {
                settings.target = target;
            }
            if let Some(id) = id {
                settings.cluster.node_id = NodeId(id);
            }
            if let Some(listen) = listen {
                settings.cluster.listen = listen;
            }
            settings.cluster.seeds.extend(seeds);
            run_node(settings, start, overrides).await
        }
        Commands::List => list(&settings),
        Commands::Settings => show(&settings),
    };
    ExitCode::from(code)
}

fn list(settings: &Settings) -> u8 {
    let registry = match demo::registry(&settings.target) {
        Ok(registry) => registry,
        Err(e) => {
            tracing::error!(error = %e, "cannot build registry");
            return EXIT_LOAD;
        }
    };
    println!("Workflows: {}", registry.workflow_names().join(", "));
    println!("Personas:  {}", registry.persona_names().join(", "));
    println!("Sinks:     {}", registry.sink_kinds().join(", "));
    EXIT_OK
}

fn show(settings: &Settings) -> u8 {
    match toml::to_string_pretty(settings) {
        Ok(text) => {
            print!("{text}");
            EXIT_OK
        }
        Err(e) => {
            tracing::error!(error = %e, "cannot render settings");
            EXIT_LOAD
        }
    }
}

fn load_workflow(
    registry: &Registry,
    name: &str,
    options: Option<WorkflowOptions>,
    overrides: &[(String, String)],
) -> Result<Workflow, SurgeError> {
    let mut workflow = registry.workflow(name)?;
    if let Some(options) = options {
        workflow = workflow.with_options(options)?;
    }
    workflow.with_overrides(overrides.iter().map(|(k, v)| (k.as_str(), v.as_str())))
}

/// Push a report through freshly built sinks; returns how many sink calls failed
async fn deliver(registry: &Registry, configs: &[SinkConfig], report: &RunReport) -> usize {
    let sinks = match registry.sinks(configs) {
        Ok(sinks) => sinks,
        Err(e) => {
            tracing::error!(sink = e.sink(), error = %e, "cannot build sink");
            return 1;
        }
    };
    let mut dispatcher = SinkDispatcher::new(sinks);
    dispatcher.connect().await;
    let mut errors = dispatcher.deliver(report).await;
    errors.extend(dispatcher.close().await);
    for e in &errors {
        tracing::warn!(sink = e.sink(), error = %e, "sink delivery failed");
    }
    errors.len()
}

async fn run_local(settings: Settings, name: &str, overrides: &[(String, String)]) -> u8 {
    let registry = match demo::registry(&settings.target) {
        Ok(registry) => registry,
        Err(e) => {
            tracing::error!(error = %e, "cannot build registry");
            return EXIT_LOAD;
        }
    };
    let workflow = match load_workflow(&registry, name, settings.options.clone(), overrides) {
        Ok(workflow) => Arc::new(workflow),
        Err(e) => {
            tracing::error!(workflow = name, error = %e, "cannot load workflow");
            return EXIT_LOAD;
        }
    };
    if let Err(e) = registry.sinks(&settings.sinks) {
        tracing::error!(sink = e.sink(), error = %e, "invalid sink settings");
        return EXIT_LOAD;
    }

    let engine = Engine::new(settings.engine.clone(), Arc::new(registry));
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, draining");
            interrupt.cancel();
        }
    });

    let report = match engine.run(workflow, cancel).await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(workflow = name, error = %e, "run did not start");
            return EXIT_LOAD;
        }
    };
    tracing::info!(
        workflow = name,
        dispatched = report.dispatched,
        total = report.total(),
        failed = report.failed(),
        elapsed = ?report.elapsed,
        "run finished"
    );

    let failures = deliver(engine.registry(), &settings.sinks, &report).await;
    if report.cancelled {
        EXIT_INTERRUPTED
    } else if failures > 0 {
        EXIT_RUNTIME
    } else {
        EXIT_OK
    }
}

async fn run_node(
    settings: Settings,
    start: Option<String>,
    overrides: Vec<(String, String)>,
) -> u8 {
    let registry = match demo::registry(&settings.target) {
        Ok(registry) => registry,
        Err(e) => {
            tracing::error!(error = %e, "cannot build registry");
            return EXIT_LOAD;
        }
    };
    if let Some(name) = &start {
        if let Err(e) = load_workflow(&registry, name, None, &overrides) {
            tracing::error!(workflow = %name, error = %e, "cannot load workflow");
            return EXIT_LOAD;
        }
    }

    let engine = Arc::new(Engine::new(settings.engine.clone(), Arc::new(registry)));
    let node = match ClusterNode::bind(settings.cluster.clone(), engine.clone()).await {
        Ok(node) => node,
        Err(e) => {
            tracing::error!(error = %e, "cannot start cluster node");
            return EXIT_RUNTIME;
        }
    };
    let Some(mut reports) = node.take_reports() else {
        tracing::error!("report channel unavailable");
        return EXIT_RUNTIME;
    };

    if let Some(name) = start {
        let commands = [
            ClusterCommand::Workflow {
                name: name.clone(),
                overrides,
            },
            ClusterCommand::Start { workflow: name },
        ];
        for command in commands {
            if let Err(e) = node.submit(command).await {
                tracing::error!(kind = %e.kind(), error = %e, "cannot replicate command");
                let _ = node.shutdown().await;
                return EXIT_RUNTIME;
            }
        }
    }

    let mut status = tokio::time::interval(STATUS_INTERVAL);
    let mut failures = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received, leaving cluster");
                break;
            }
            _ = status.tick() => {
                let s = node.status();
                tracing::info!(
                    node = %s.id,
                    role = %s.role,
                    term = s.term,
                    leader = ?s.leader,
                    commit = s.commit_index,
                    live = node.membership().live_count(),
                    running = ?node.running(),
                    "node status"
                );
            }
            Some(report) = reports.recv() => match report.outcome {
                Ok(run) => failures += deliver(engine.registry(), &settings.sinks, &run).await,
                Err(e) => {
                    tracing::warn!(workflow = %report.workflow, entry = %report.entry, error = %e,
                        "replicated run failed to start");
                    failures += 1;
                }
            },
        }
    }

    if let Err(e) = node.shutdown().await {
        tracing::error!(error = %e, "unclean shutdown");
        return EXIT_RUNTIME;
    }
    if failures > 0 {
        tracing::warn!(failures, "node saw failures");
    }
    EXIT_INTERRUPTED
}

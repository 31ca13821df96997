//! Encore CLI - Inspect event logs and drive the bundled demo replayable

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use encore_core::prelude::*;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "encore")]
#[command(about = "Encore durable execution CLI", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to encore.toml and ENCORE_ variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Event log file, overrides `log.path` from the configuration
    #[arg(short, long, global = true, env = "ENCORE_EVENT_LOG")]
    log: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every run in the log
    Runs,
    /// Show the state of one run
    Run {
        /// Run ID
        id: String,
    },
    /// Show the steps of a run
    Steps {
        /// Run ID
        id: String,
    },
    /// Show bindings and triggers of a hook
    Hooks {
        /// Hook ID, hashed into its token
        id: Option<String>,
        /// Hook token, used as is
        #[arg(short, long, conflicts_with = "id")]
        token: Option<String>,
    },
    /// List runs and steps that have not settled
    Pending,
    /// Print raw events as JSON lines
    Events {
        /// Only events of this run
        #[arg(short, long)]
        run: Option<String>,
    },
    /// Bundled checkout replayable
    Demo {
        #[command(subcommand)]
        command: DemoCommands,
    },
    /// Version information
    Version,
}

#[derive(Subcommand)]
enum DemoCommands {
    /// Start a checkout and wait until it pauses for approval
    Start {
        /// Item to buy
        #[arg(short, long, default_value = "book")]
        item: String,
        /// Amount to charge
        #[arg(short, long, default_value_t = 5)]
        amount: u32,
    },
    /// Approve (or reject) a paused checkout and wait for its outcome
    Approve {
        /// Run ID
        id: String,
        /// Reject instead of approving
        #[arg(long)]
        reject: bool,
    },
    /// Pick up checkouts left unfinished by a previous process
    Recover,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("encore {}", env!("CARGO_PKG_VERSION"));
        println!("encore-core {}", encore_core::VERSION);
        return Ok(());
    }

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Version => {}
        Commands::Runs => {
            let log = open_log(&config)?;
            for state in all_runs(&log).await? {
                println!(
                    "{}  {:<12} {:<12} {}",
                    state.run_id,
                    state.replayable_id,
                    status_name(&state.status)?,
                    state.started.to_rfc3339()
                );
            }
        }
        Commands::Run { id } => {
            let log = open_log(&config)?;
            let state = log
                .run_state(&id)
                .await?
                .with_context(|| format!("Run not found: {}", id))?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Commands::Steps { id } => {
            let log = open_log(&config)?;
            for state in run_steps(&log, &id).await? {
                println!(
                    "step {:<4} {:<12} attempts={}",
                    state.step,
                    status_name(&state.status)?,
                    state.attempts.len()
                );
                if let Some(result) = &state.result {
                    println!("    result: {}", result);
                }
                if let Some(error) = &state.error {
                    println!("    error: {} ({:?})", error.message, error.kind);
                }
            }
        }
        Commands::Hooks { id, token } => {
            let log = open_log(&config)?;
            let token = match (id, token) {
                (Some(id), _) => hook_token(&id),
                (None, Some(token)) => token,
                (None, None) => bail!("Either a hook ID or --token is required"),
            };
            println!("token {}", token);
            for binding in log.hook_bindings(&token).await? {
                println!(
                    "  bound    {} as {} at {}",
                    binding.run_id,
                    binding.hook_id,
                    binding.on.to_rfc3339()
                );
            }
            for trigger in log.hook_triggers(&token).await? {
                println!("  trigger  {} at {}", trigger.value, trigger.on.to_rfc3339());
            }
        }
        Commands::Pending => {
            let log = open_log(&config)?;
            for run in log.pending_runs().await? {
                println!(
                    "{}  {:<12} {}",
                    run.run_id,
                    run.replayable_id,
                    status_name(&run.status)?
                );
                for step in log.pending_steps(&run.run_id).await? {
                    println!("    step {:<4} {}", step.step, status_name(&step.status)?);
                }
            }
        }
        Commands::Events { run } => {
            let log = open_log(&config)?;
            for event in log.events().await? {
                if run.is_none() || event.run_id() == run.as_deref() {
                    println!("{}", serde_json::to_string(&event)?);
                }
            }
        }
        Commands::Demo { command } => run_demo(&config, command).await?,
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<EncoreConfig> {
    let mut config = match &cli.config {
        Some(path) => EncoreConfig::from_file(path)?,
        None => EncoreConfig::load()?,
    };
    if let Some(path) = &cli.log {
        config.log.path = Some(path.clone());
    }
    Ok(config)
}

fn log_path(config: &EncoreConfig) -> Result<&PathBuf> {
    config
        .log
        .path
        .as_ref()
        .context("No event log configured; pass --log or set log.path")
}

fn open_log(config: &EncoreConfig) -> Result<FileLog> {
    let path = log_path(config)?;
    FileLog::open(path).with_context(|| format!("Failed to open event log {}", path.display()))
}

fn status_name<S: serde::Serialize>(status: &S) -> Result<String> {
    Ok(serde_json::to_value(status)?
        .as_str()
        .unwrap_or_default()
        .to_string())
}

async fn all_runs(log: &FileLog) -> Result<Vec<RunState>> {
    let mut runs = Vec::new();
    for event in log.events().await? {
        if let ReplayEvent::RunStarted { run_id, .. } = event {
            if let Some(state) = log.run_state(&run_id).await? {
                runs.push(state);
            }
        }
    }
    Ok(runs)
}

async fn run_steps(log: &FileLog, run_id: &str) -> Result<Vec<StepState>> {
    let mut steps: Vec<u32> = log
        .events()
        .await?
        .iter()
        .filter(|event| event.run_id() == Some(run_id))
        .filter_map(ReplayEvent::step)
        .collect();
    steps.sort_unstable();
    steps.dedup();

    let mut states = Vec::new();
    for step in steps {
        if let Some(state) = log.step_state(run_id, step).await? {
            states.push(state);
        }
    }
    Ok(states)
}

/// Engine over the configured file log with the checkout replayable registered
fn demo_engine(config: &EncoreConfig) -> Result<(Engine, Replayable<(String, u32), String>)> {
    log_path(config)?;
    let engine = Engine::from_config(config)?;

    let checkout = engine.replayable(
        "checkout",
        |ctx: RunContext, (item, amount): (String, u32)| async move {
            let reservation: String = ctx
                .once({
                    let item = item.clone();
                    move || async move { Ok(format!("reserved {}", item)) }
                })
                .await?;

            let charge: String = ctx
                .step(move || {
                    let item = item.clone();
                    async move {
                        let step = StepContext::current()?;
                        tracing::info!(attempt = step.attempt, "Charging card");
                        Ok(format!("charged {} for {}", amount, item))
                    }
                })
                .await?;

            let approval = format!("approve:{}", ctx.run_id());
            let approved: bool = ctx.hook::<bool>(Some(approval.as_str())).once().await?;
            if !approved {
                return Err(Failure::new(format!("{} rejected after {}", reservation, charge)).into());
            }
            Ok(format!("{}, {}", reservation, charge))
        },
    );

    Ok((engine, checkout))
}

/// Wait until nothing in this process is playing `run_id` or running its steps
async fn wait_idle(engine: &Engine, run_id: &str) -> Result<RunState> {
    loop {
        let state = engine
            .run_state(run_id)
            .await?
            .with_context(|| format!("Run not found: {}", run_id))?;
        let stepping = engine
            .log()
            .pending_steps(run_id)
            .await?
            .iter()
            .any(|step| step.status == StepStatus::Running);
        if !engine.is_active(run_id) && !stepping && state.status != RunStatus::Running {
            return Ok(state);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn run_demo(config: &EncoreConfig, command: DemoCommands) -> Result<()> {
    let (engine, checkout) = demo_engine(config)?;

    match command {
        DemoCommands::Start { item, amount } => {
            let handle = checkout.start((item, amount))?;
            let run_id = handle.run_id().to_string();
            let state = wait_idle(&engine, &run_id).await?;
            println!("{} {}", run_id, status_name(&state.status)?);
            if state.status == RunStatus::Paused {
                println!("approve with: encore demo approve {}", run_id);
            }
        }
        DemoCommands::Approve { id, reject } => {
            let hook = HookIdentifier::id(format!("approve:{}", id));
            engine.trigger(hook, !reject).await?;
            match checkout.resume(&id).await?.await {
                Ok(receipt) => println!("{} completed: {}", id, receipt),
                Err(failure) => println!("{} failed: {}", id, failure),
            }
        }
        DemoCommands::Recover => {
            let recovered = engine.recover().await?;
            if recovered.is_empty() {
                println!("Nothing to recover");
            }
            for run_id in recovered {
                let state = wait_idle(&engine, &run_id).await?;
                println!(
                    "{} {}",
                    run_id,
                    json!({ "status": state.status, "result": state.result })
                );
            }
        }
    }

    Ok(())
}

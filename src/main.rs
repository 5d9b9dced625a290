//! Arbitrage agent CLI
//!
//! Runs the agent loop and exposes the operator actions: kill switch,
//! mutation approval, snapshot restore and the control API.

use arb_agent::audit::AuditLog;
use arb_agent::config::{
    secret, CONTROL_API_TOKEN_ENV, PRIVATE_KEY_ENV, SUGGESTION_TOKEN_ENV, SUGGESTION_URL_ENV,
};
use arb_agent::control::{self, ControlState};
use arb_agent::mutation::{ApprovalQueue, HttpSuggestionSource, MutationSandbox, SuggestionSource};
use arb_agent::nonce::RpcNonceSource;
use arb_agent::strategy::{Adapters, IdleStrategy};
use arb_agent::tx::TransactionManager;
use arb_agent::wallet::{RpcBroadcaster, SecureWallet};
use arb_agent::{
    AgentRunner, Config, HaltReason, KillSwitch, NonceManager, Result, RpcConfig, SessionState,
    SnapshotStore,
};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "arb-agent")]
#[command(about = "Crash-safe arbitrage agent core")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent loop
    Run {
        /// Resume from a DRP snapshot instead of starting a new session
        #[arg(long)]
        restore: Option<String>,
    },

    /// Inspect or flip the kill switch
    Kill {
        #[command(subcommand)]
        action: KillAction,
    },

    /// Approve the pending mutation for a strategy
    Approve { strategy: String },

    /// Make a DRP snapshot the current state of its session
    Restore { snapshot: String },

    /// Serve the control API
    Serve,

    /// Show current configuration
    Config,
}

#[derive(Subcommand)]
enum KillAction {
    Activate {
        #[arg(short, long, default_value = "manual override")]
        reason: String,
    },
    Deactivate,
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (ignore if not found)
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Run { restore } => run_agent(config, restore).await,
        Commands::Kill { action } => run_kill(config, action).await,
        Commands::Approve { strategy } => run_approve(config, &strategy).await,
        Commands::Restore { snapshot } => run_restore(config, &snapshot).await,
        Commands::Serve => run_serve(config).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn kill_switch(config: &Config) -> Result<KillSwitch> {
    Ok(KillSwitch::new(
        config.kill_switch_backend()?,
        config.kill_switch.marker_key.clone(),
    ))
}

fn snapshot_store(config: &Config) -> Result<Arc<SnapshotStore>> {
    Ok(Arc::new(
        SnapshotStore::new(config.snapshot_backend()?, config.drp.prefix.clone())
            .with_ttl(config.drp.ttl()),
    ))
}

async fn run_agent(config: Config, restore: Option<String>) -> Result<()> {
    std::fs::create_dir_all(&config.session_dir)?;
    let kill_switch = kill_switch(&config)?;
    let drp = snapshot_store(&config)?;
    let audit = AuditLog::in_dir(&config.session_dir);

    let wallet = Arc::new(SecureWallet::from_env(PRIVATE_KEY_ENV)?);
    tracing::info!(address = %wallet.address(), "Loaded wallet from {}", PRIVATE_KEY_ENV);
    let rpc = RpcConfig::from_env();
    let source = RpcNonceSource::new(rpc.primary()?, wallet.address(), config.retry)?;
    let nonces = Arc::new(NonceManager::new(config.nonce_path(), Arc::new(source)));
    nonces.initialize().await?;

    let broadcaster = RpcBroadcaster::new(rpc.urls(), wallet)?;
    let tx = TransactionManager::new(
        kill_switch.clone(),
        nonces.clone(),
        Arc::new(broadcaster),
        config.nonce.chain_id,
    );

    let suggestions = match std::env::var(SUGGESTION_URL_ENV) {
        Ok(url) if !url.trim().is_empty() => {
            let source = HttpSuggestionSource::new(&url, secret(SUGGESTION_TOKEN_ENV), config.retry)?;
            Some(Arc::new(source) as Arc<dyn SuggestionSource>)
        }
        _ => None,
    };

    let state = match &restore {
        Some(path) => {
            let state = drp.load_snapshot(path).await?;
            tracing::warn!(session_id = %state.session_id(), snapshot = %path, "Resuming from DRP snapshot");
            state
        }
        None => SessionState::new(config.strategy.capital.clone()),
    };

    let sandbox = MutationSandbox::new(
        drp.clone(),
        kill_switch.clone(),
        ApprovalQueue::new(config.approvals_dir()),
        audit.clone(),
        config.mutation.clone(),
    );
    let adapters = Adapters {
        tx: Arc::new(tx),
        suggestions,
        kill_switch,
    };
    let strategy = IdleStrategy::new(config.strategy.name.clone(), config.strategy.params.clone());
    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after the current cycle");
            let _ = stop.send(true);
        }
    });
    let runner = AgentRunner::new(
        config.agent.clone(),
        Box::new(strategy),
        state,
        adapters,
        drp,
        sandbox,
        audit,
    )
    .with_strategy_config(config.strategy.config.clone())
    .with_shutdown(shutdown);

    let result = runner.run().await;
    nonces.close().await;
    let outcome = result?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "session_id": outcome.state.session_id().to_string(),
            "cycles": outcome.cycles,
            "halt": &outcome.halt,
        }))?
    );
    if matches!(outcome.halt, HaltReason::HaltedByFailureThreshold { .. }) {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_kill(config: Config, action: KillAction) -> Result<()> {
    let kill_switch = kill_switch(&config)?;
    let audit = AuditLog::in_dir(&config.session_dir);
    match action {
        KillAction::Activate { reason } => {
            kill_switch.activate(&reason).await?;
            audit
                .record(
                    "kill_switch_toggled",
                    json!({ "active": true, "reason": reason, "source": "cli" }),
                )
                .await;
        }
        KillAction::Deactivate => {
            kill_switch.deactivate().await?;
            audit
                .record(
                    "kill_switch_toggled",
                    json!({ "active": false, "source": "cli" }),
                )
                .await;
        }
        KillAction::Status => {}
    }
    let status = kill_switch.status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn run_approve(config: Config, strategy: &str) -> Result<()> {
    let queue = ApprovalQueue::new(config.approvals_dir());
    if let Some(request) = queue.pending(strategy).await? {
        println!("Approving mutation for {}:", strategy);
        println!("  rationale: {}", request.proposal.rationale);
        for line in &request.diff {
            println!("  {}", line);
        }
    }
    queue.approve(strategy).await?;
    AuditLog::in_dir(&config.session_dir)
        .record("mutation_approved", json!({ "strategy": strategy, "source": "cli" }))
        .await;
    Ok(())
}

async fn run_restore(config: Config, snapshot: &str) -> Result<()> {
    let drp = snapshot_store(&config)?;
    let state = drp.load_snapshot(snapshot).await?;
    let current = drp.persist_session(&state).await?;
    AuditLog::in_dir(&config.session_dir)
        .record_for(
            "drp_restored",
            state.session_id(),
            state.cycle_counter(),
            json!({ "snapshot": snapshot, "current": current, "source": "cli" }),
        )
        .await;
    println!("{}", state.session_id());
    Ok(())
}

async fn run_serve(config: Config) -> Result<()> {
    let token = secret(CONTROL_API_TOKEN_ENV);
    if token.is_none() {
        tracing::warn!(
            "{} not set; authenticated routes will refuse every request",
            CONTROL_API_TOKEN_ENV
        );
    }
    let state = ControlState {
        kill_switch: kill_switch(&config)?,
        drp: snapshot_store(&config)?,
        audit: AuditLog::in_dir(&config.session_dir),
        token: token.map(Arc::new),
    };
    control::serve(&config.control.bind, state).await
}

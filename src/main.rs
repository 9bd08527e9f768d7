//! Audit Ledger CLI
//!
//! Administrative surface over the ledger: record, batch, anchor, upgrade,
//! verify, purge and export. Every command exits non-zero on failure.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audit_ledger::audit::event::{Actor, Category, EventDraft, Outcome, Severity, Target};
use audit_ledger::config::AppConfig;
use audit_ledger::export::export_chain;
use audit_ledger::ots::ProofStatus;
use audit_ledger::Ledger;

#[derive(Parser)]
#[command(name = "audit-ledger")]
#[command(about = "Tamper-evident audit trail with Merkle batching and timestamp anchoring")]
struct Cli {
    /// Configuration file (TOML); defaults to $AUDIT_LEDGER_CONFIG
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Chain to operate on instead of the configured one
    #[arg(long, global = true)]
    chain: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record one event and print it
    Record {
        #[arg(long)]
        event_type: String,

        /// security, financial, system or data
        #[arg(long)]
        category: String,

        #[arg(long)]
        source: String,

        #[arg(long)]
        action: String,

        /// low, medium, high or critical
        #[arg(long, default_value = "low")]
        severity: String,

        /// success, failure or pending
        #[arg(long, default_value = "success")]
        outcome: String,

        #[arg(long, default_value = "")]
        message: String,

        #[arg(long)]
        actor_id: Option<String>,

        #[arg(long, default_value = "")]
        actor_name: String,

        #[arg(long, default_value = "user")]
        actor_type: String,

        #[arg(long)]
        target_id: Option<String>,

        #[arg(long, default_value = "")]
        target_name: String,

        #[arg(long, default_value = "")]
        target_type: String,

        /// Metadata as key=value, repeatable
        #[arg(long = "meta", value_name = "KEY=VALUE")]
        metadata: Vec<String>,
    },
    /// Build Merkle roots; without a range, batches everything not yet batched
    Aggregate {
        #[arg(long, requires = "to")]
        from: Option<u64>,

        #[arg(long, requires = "from")]
        to: Option<u64>,
    },
    /// Anchor one batch, or every batch without a live proof
    Anchor {
        #[arg(long)]
        batch: Option<String>,
    },
    /// Poll timestamp services for upgraded proofs
    Upgrade,
    /// Verify one event against an anchor proof
    Verify {
        #[arg(long)]
        event: String,

        #[arg(long)]
        proof: String,
    },
    /// Re-walk the whole chain
    VerifyChain,
    /// Purge a reapable, anchor-verified event
    Purge {
        #[arg(long)]
        event: String,
    },
    /// List events that could be purged
    Sweep {
        /// Evaluate retention at this RFC 3339 instant instead of now
        #[arg(long)]
        at: Option<String>,
    },
    /// Export the chain, its batches and proofs as JSON lines
    Export {
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Run aggregation, anchoring and upgrade tasks until Ctrl-C
    Run,
    /// Print the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audit_ledger=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let path = cli
        .config
        .clone()
        .or_else(|| std::env::var_os("AUDIT_LEDGER_CONFIG").map(PathBuf::from));
    let mut config = AppConfig::load(path.as_deref()).context("Failed to load configuration")?;
    if let Some(chain) = &cli.chain {
        config.chain_id = chain.clone();
    }
    Ok(config)
}

fn parse_metadata(pairs: &[String]) -> Result<Vec<(String, String)>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| anyhow!("metadata must be KEY=VALUE, got '{}'", pair))
        })
        .collect()
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;

    if let Commands::ShowConfig = cli.command {
        print!("{}", config.to_toml()?);
        return Ok(ExitCode::SUCCESS);
    }

    let ledger = Ledger::open(config).await.context("Failed to open ledger")?;
    let chain_id = ledger.chain_id().to_string();

    match cli.command {
        Commands::Record {
            event_type,
            category,
            source,
            action,
            severity,
            outcome,
            message,
            actor_id,
            actor_name,
            actor_type,
            target_id,
            target_name,
            target_type,
            metadata,
        } => {
            let mut draft = EventDraft::new(event_type, category.parse::<Category>()?, source, action)
                .severity(severity.parse::<Severity>()?)
                .outcome(outcome.parse::<Outcome>()?)
                .message(message);
            if let Some(id) = actor_id {
                draft = draft.actor(Actor::new(id, actor_name, actor_type));
            }
            if let Some(id) = target_id {
                draft = draft.target(Target::new(id, target_name, target_type));
            }
            for (key, value) in parse_metadata(&metadata)? {
                draft = draft.meta(key, value);
            }

            let event = ledger.recorder().record(draft).await?;
            println!("{}", serde_json::to_string_pretty(&event)?);
        }
        Commands::Aggregate { from, to } => {
            let roots: Vec<_> = match (from, to) {
                (Some(from), Some(to)) => ledger
                    .aggregator()
                    .aggregate(&chain_id, from..=to)
                    .await?
                    .into_iter()
                    .collect(),
                _ => ledger.aggregator().aggregate_pending(&chain_id).await?,
            };
            if roots.is_empty() {
                println!("Nothing to aggregate");
            }
            for root in roots {
                println!("{}", root.summary());
            }
        }
        Commands::Anchor { batch } => {
            let proofs = match batch {
                Some(batch_id) => vec![ledger.anchor().anchor_batch(&batch_id).await?],
                None => ledger.anchor().anchor_pending(&chain_id).await?,
            };
            if proofs.is_empty() {
                println!("No batches awaiting anchoring");
            }
            let mut failed = false;
            for proof in proofs {
                println!("{}", proof.summary());
                failed |= proof.status == ProofStatus::Failed;
            }
            if failed {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Upgrade => {
            let report = ledger.upgrader().upgrade_all().await?;
            println!("{}", report.summary());
            if report.failed > 0 {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Verify { event, proof } => {
            let outcome = ledger.verifier().verify_event(&event, &proof).await?;
            println!("{}", outcome);
            return Ok(ExitCode::from(outcome.exit_code() as u8));
        }
        Commands::VerifyChain => {
            let report = ledger.verifier().verify_chain(&chain_id).await?;
            println!("{}", report.summary());
            if !report.is_valid() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Purge { event } => {
            let tombstone = ledger.retention().purge(&event).await?;
            println!(
                "Purged {} (#{}), retained hash {}",
                tombstone.event_id, tombstone.sequence, tombstone.hash
            );
        }
        Commands::Sweep { at } => {
            let now = match at {
                Some(at) => DateTime::parse_from_rfc3339(&at)
                    .with_context(|| format!("Invalid --at timestamp '{}'", at))?
                    .with_timezone(&Utc),
                None => Utc::now(),
            };
            let candidates = ledger.retention().sweep(&chain_id, now).await?;
            for id in &candidates {
                println!("{}", id);
            }
            info!("{} event(s) reapable on {}", candidates.len(), chain_id);
        }
        Commands::Export { output } => {
            let file = File::create(&output)
                .with_context(|| format!("Failed to create {}", output.display()))?;
            let mut writer = BufWriter::new(file);
            let summary = export_chain(
                ledger.events().as_ref(),
                ledger.batches().as_ref(),
                ledger.proofs().as_ref(),
                &chain_id,
                &mut writer,
            )
            .await?;
            println!(
                "Exported {} events, {} tombstones, {} batches, {} proofs to {}",
                summary.events,
                summary.tombstones,
                summary.batches,
                summary.proofs,
                output.display()
            );
        }
        Commands::Run => {
            let ledger = Arc::new(ledger);
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let handles = ledger.spawn_background(shutdown_rx).await?;
            info!("Audit ledger running on chain {}; press Ctrl-C to stop", chain_id);

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            info!("Shutting down");
            shutdown_tx.send(true).ok();
            for handle in handles {
                if let Err(e) = handle.await {
                    error!("Background task ended abnormally: {}", e);
                }
            }
        }
        // printed before the ledger is opened
        Commands::ShowConfig => {}
    }

    Ok(ExitCode::SUCCESS)
}

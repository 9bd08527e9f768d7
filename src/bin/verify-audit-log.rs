use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction, Command};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::ExitCode;
use tracing::{error, info};

use audit_ledger::audit::verify::find_tampered_events;
use audit_ledger::database::StoredEntry;
use audit_ledger::export::{load_export, LedgerExport};

fn main() -> ExitCode {
    let matches = Command::new("verify-audit-log")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Verify an exported audit ledger offline")
        .arg(
            Arg::new("log-path")
                .short('l')
                .long("log-path")
                .value_name("PATH")
                .help("Path to a ledger export (JSON lines)")
                .required(true),
        )
        .arg(
            Arg::new("merkle-root")
                .short('m')
                .long("merkle-root")
                .value_name("HASH")
                .help("Expected Merkle root hash"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose output"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .help("Suppress output except errors"),
        )
        .get_matches();

    let verbose = matches.get_flag("verbose");
    let quiet = matches.get_flag("quiet");

    let level = if quiet {
        tracing::Level::ERROR
    } else if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let Some(log_path) = matches.get_one::<String>("log-path") else {
        error!("--log-path is required");
        return ExitCode::FAILURE;
    };
    let expected_root = matches.get_one::<String>("merkle-root").map(String::as_str);

    if let Err(e) = verify_export_file(Path::new(log_path), expected_root, verbose) {
        error!("Audit log verification failed: {}", e);
        return ExitCode::FAILURE;
    }

    if !quiet {
        println!("Audit log verification completed successfully");
    }
    ExitCode::SUCCESS
}

fn verify_export_file(path: &Path, expected_root: Option<&str>, verbose: bool) -> Result<()> {
    info!("Verifying audit log: {}", path.display());

    if !path.exists() {
        return Err(anyhow!("Audit log file not found: {}", path.display()));
    }

    let export = load_export(path)?;
    if export.entries.is_empty() {
        return Err(anyhow!("Audit log is empty"));
    }
    if verbose {
        println!(
            "Loaded {} entries, {} batches, {} proofs",
            export.entries.len(),
            export.batches.len(),
            export.proofs.len()
        );
    }

    let report = export.verify(expected_root)?;

    let tampered = find_tampered_events(&export.entries);
    if !tampered.is_empty() {
        for id in &tampered {
            eprintln!("Tampered event: {}", id);
        }
    }

    if let Some(brk) = &report.chain.broken_at {
        return Err(anyhow!(
            "Hash chain broken at event {} (#{}): {}",
            brk.event_id,
            brk.sequence,
            brk.reason
        ));
    }
    if verbose {
        println!("Hash chain integrity verified");
    }

    if !report.bad_batches.is_empty() {
        return Err(anyhow!(
            "Batch roots disagree with exported events: {}",
            report.bad_batches.join(", ")
        ));
    }
    if verbose && !export.batches.is_empty() {
        println!("All {} batch roots recomputed", export.batches.len());
    }

    if let (Some(expected), Some(false)) = (expected_root, report.expected_root_found) {
        return Err(anyhow!(
            "Merkle root mismatch. Expected: {}, Got: {}",
            expected,
            report.merkle_root.as_deref().unwrap_or("<none>")
        ));
    }

    if verbose {
        print_summary(&export, report.merkle_root.as_deref());
    }
    Ok(())
}

fn print_summary(export: &LedgerExport, merkle_root: Option<&str>) {
    let (Some(first), Some(last)) = (export.entries.first(), export.entries.last()) else {
        return;
    };

    println!("\nAudit Log Summary:");
    println!("  Chain: {}", first.chain_id());
    println!("  Total entries: {}", export.entries.len());
    println!(
        "  Purged entries: {}",
        export.entries.iter().filter(|e| e.is_tombstone()).count()
    );
    println!("  First entry: {}", first.timestamp());
    println!("  Last entry: {}", last.timestamp());
    println!("  Merkle root: {}", merkle_root.unwrap_or("<none>"));
    println!("  Head hash: {}", last.hash());

    let mut categories: BTreeMap<&str, usize> = BTreeMap::new();
    for event in export.entries.iter().filter_map(StoredEntry::as_event) {
        *categories.entry(event.category.as_str()).or_insert(0) += 1;
    }
    println!("\nCategory distribution:");
    for (category, count) in categories {
        println!("  {}: {}", category, count);
    }

    let mut statuses: BTreeMap<&str, usize> = BTreeMap::new();
    for proof in &export.proofs {
        *statuses.entry(proof.status.as_str()).or_insert(0) += 1;
    }
    if !statuses.is_empty() {
        println!("\nAnchor proofs:");
        for (status, count) in statuses {
            println!("  {}: {}", status, count);
        }
    }
}

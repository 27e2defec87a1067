use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use atty::Stream;
use clap::{Args, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::json;

use mx_core::{
    AuditLog, CancelToken, CasLifecycle, Config, ContentOrchestrator, EventSink, FileLibrary,
    ManifestPool, ReconciliationService, ReplaceRequest, TracingSink, WorkflowOutcome,
    WorkflowStatus,
};
use mx_domain::{ContentManifest, ManifestId, PriorityTable};

#[derive(Parser)]
#[command(name = "mx", about = "Opinionated game content library manager")]
struct MxCli {
    /// Emit machine-readable JSON instead of human output.
    #[arg(long, global = true)]
    json: bool,
    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: MxCommand,
}

#[derive(Subcommand)]
enum MxCommand {
    /// Replace manifests across all profiles.
    Replace(ReplaceArgs),
    /// Remove manifests from profiles, the pool and the reference ledger.
    Remove(RemoveArgs),
    /// Register a locally updated manifest.
    Update(UpdateArgs),
    /// Run a garbage-collection pass over the content store.
    Gc(GcArgs),
    /// Print the reference ledger: live hashes and per-consumer breakdown.
    Audit,
    /// Plan the workspace delta for a set of manifests.
    Plan(PlanArgs),
    /// Show recent reconciliation history.
    History(HistoryArgs),
}

#[derive(Args)]
struct ReplaceArgs {
    /// Replacement pairs, `OLD=NEW` manifest ids.
    #[arg(long = "map", value_name = "OLD=NEW", required = true)]
    mappings: Vec<String>,
    /// Remove the replaced manifests from the pool.
    #[arg(long)]
    remove_old: bool,
    /// Collect unreferenced content afterwards.
    #[arg(long)]
    gc: bool,
}

#[derive(Args)]
struct RemoveArgs {
    /// Manifest ids to remove.
    #[arg(required = true)]
    ids: Vec<String>,
}

#[derive(Args)]
struct UpdateArgs {
    /// Id the updated manifest replaces in profiles.
    #[arg(long)]
    old: String,
    /// Path to the updated manifest document (JSON).
    #[arg(long)]
    manifest: PathBuf,
}

#[derive(Args)]
struct GcArgs {
    /// Ignore the minimum-age eligibility window.
    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct PlanArgs {
    /// Workspace root to reconcile against.
    #[arg(long)]
    workspace: PathBuf,
    /// Manifest ids to assemble; defaults to every acquired manifest.
    ids: Vec<String>,
}

#[derive(Args)]
struct HistoryArgs {
    /// Most recent entries to show.
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = MxCli::parse();
    init_tracing(cli.verbose);

    let config = Config::from_env().map_err(|err| eyre!("{err:#}"))?;
    let code = run(&cli, &config)?;
    if code == 0 {
        Ok(())
    } else {
        std::process::exit(code);
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = format!("mx={level},mx_core={level},mx_cli={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_ansi(atty::is(Stream::Stderr))
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn run(cli: &MxCli, config: &Config) -> Result<i32> {
    match &cli.command {
        MxCommand::Replace(args) => {
            let orchestrator = build_orchestrator(config)?;
            let mapping = parse_mapping(&args.mappings)?;
            let outcome = orchestrator
                .replace(
                    &ReplaceRequest {
                        mapping,
                        remove_old: args.remove_old,
                        run_gc: args.gc,
                        source: "cli".into(),
                    },
                    &CancelToken::new(),
                )
                .map_err(|err| eyre!("{err:#}"))?;
            emit_outcome(cli, &outcome)
        }
        MxCommand::Remove(args) => {
            let orchestrator = build_orchestrator(config)?;
            let ids = parse_ids(&args.ids)?;
            let outcome = orchestrator
                .remove(&ids, &CancelToken::new())
                .map_err(|err| eyre!("{err:#}"))?;
            emit_outcome(cli, &outcome)
        }
        MxCommand::Update(args) => {
            let orchestrator = build_orchestrator(config)?;
            let old = ManifestId::parse(&args.old).map_err(|err| eyre!("{err:#}"))?;
            let contents = std::fs::read_to_string(&args.manifest)
                .map_err(|err| eyre!("failed to read {}: {err}", args.manifest.display()))?;
            let manifest: ContentManifest = serde_json::from_str(&contents)
                .map_err(|err| eyre!("failed to parse {}: {err}", args.manifest.display()))?;
            let outcome = orchestrator
                .update(&old, manifest, &CancelToken::new())
                .map_err(|err| eyre!("{err:#}"))?;
            emit_outcome(cli, &outcome)
        }
        MxCommand::Gc(args) => {
            let lifecycle = build_lifecycle(config)?;
            let summary = lifecycle
                .run_garbage_collection(args.force)
                .map_err(|err| eyre!("{err:#}"))?;
            match summary {
                Some(summary) if cli.json => println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "scanned": summary.scanned,
                        "reclaimed": summary.reclaimed,
                        "reclaimed_bytes": summary.reclaimed_bytes,
                    }))?
                ),
                Some(summary) => println!(
                    "scanned {} object(s), reclaimed {} ({} bytes)",
                    summary.scanned, summary.reclaimed, summary.reclaimed_bytes
                ),
                None => println!("garbage collection is disabled (MX_GC_DISABLE)"),
            }
            Ok(0)
        }
        MxCommand::Audit => {
            let lifecycle = build_lifecycle(config)?;
            let audit = lifecycle
                .store()
                .ledger_audit()
                .map_err(|err| eyre!("{err:#}"))?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&audit)?);
            } else {
                println!("{} live hash(es)", audit.live.len());
                for refs in &audit.consumers {
                    println!("  {} -> {} hash(es)", refs.consumer, refs.hashes.len());
                }
            }
            Ok(0)
        }
        MxCommand::Plan(args) => {
            let library = Arc::new(FileLibrary::open(&config.library_root).map_err(|err| eyre!("{err:#}"))?);
            let manifests = select_manifests(library.as_ref(), &args.ids)?;
            let deltas = mx_core::plan_workspace_delta(
                &args.workspace,
                &manifests,
                &PriorityTable::default(),
            )
            .map_err(|err| eyre!("{err:#}"))?;
            if cli.json {
                let rows: Vec<_> = deltas
                    .iter()
                    .map(|delta| {
                        json!({
                            "op": delta.kind.as_str(),
                            "file": delta.file,
                            "path": delta.path,
                            "reason": delta.reason,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for delta in &deltas {
                    println!("{:6} {} ({})", delta.kind.as_str(), delta.file, delta.reason);
                }
            }
            Ok(0)
        }
        MxCommand::History(args) => {
            let log = AuditLog::new(config.audit_log.clone());
            let mut entries = log.read_all().map_err(|err| eyre!("{err:#}"))?;
            let keep = entries.len().saturating_sub(args.limit);
            let entries: Vec<_> = entries.drain(keep..).collect();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in &entries {
                    println!(
                        "{} {} {} ({} ms){}",
                        entry.timestamp,
                        entry.operation,
                        if entry.success { "ok" } else { "failed" },
                        entry.duration_ms,
                        entry
                            .error
                            .as_deref()
                            .map(|error| format!(": {error}"))
                            .unwrap_or_default()
                    );
                }
            }
            Ok(0)
        }
    }
}

fn build_lifecycle(config: &Config) -> Result<CasLifecycle> {
    let store = mx_core::ContentAddressableStore::new(Some(config.store_root.clone()))
        .map_err(|err| eyre!("{err:#}"))?;
    Ok(CasLifecycle::new(store, config.gc.clone()))
}

fn build_orchestrator(config: &Config) -> Result<ContentOrchestrator> {
    let lifecycle = build_lifecycle(config)?;
    let library = Arc::new(FileLibrary::open(&config.library_root).map_err(|err| eyre!("{err:#}"))?);
    let service = ReconciliationService::new(
        library.clone() as Arc<dyn ManifestPool>,
        library.clone(),
        lifecycle.clone(),
    );
    Ok(ContentOrchestrator::new(
        service,
        lifecycle,
        library,
        Arc::new(TracingSink) as Arc<dyn EventSink>,
        AuditLog::new(config.audit_log.clone()),
    ))
}

fn parse_mapping(pairs: &[String]) -> Result<BTreeMap<ManifestId, ManifestId>> {
    let mut mapping = BTreeMap::new();
    for pair in pairs {
        let (old, new) = pair
            .split_once('=')
            .ok_or_else(|| eyre!("expected OLD=NEW, got '{pair}'"))?;
        mapping.insert(
            ManifestId::parse(old).map_err(|err| eyre!("{err:#}"))?,
            ManifestId::parse(new).map_err(|err| eyre!("{err:#}"))?,
        );
    }
    Ok(mapping)
}

fn parse_ids(values: &[String]) -> Result<Vec<ManifestId>> {
    values
        .iter()
        .map(|value| ManifestId::parse(value).map_err(|err| eyre!("{err:#}")))
        .collect()
}

fn select_manifests(
    library: &FileLibrary,
    ids: &[String],
) -> Result<Vec<ContentManifest>> {
    if ids.is_empty() {
        return library.get_all_manifests().map_err(|err| eyre!("{err:#}"));
    }
    let mut manifests = Vec::with_capacity(ids.len());
    for raw in ids {
        let id = ManifestId::parse(raw).map_err(|err| eyre!("{err:#}"))?;
        match library.get_manifest(&id).map_err(|err| eyre!("{err:#}"))? {
            Some(manifest) => manifests.push(manifest),
            None => return Err(eyre!("manifest '{id}' is not acquired")),
        }
    }
    Ok(manifests)
}

fn emit_outcome(cli: &MxCli, outcome: &WorkflowOutcome) -> Result<i32> {
    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "operation_id": outcome.operation_id,
                "kind": outcome.kind.as_str(),
                "status": match outcome.status {
                    WorkflowStatus::Completed => "completed",
                    WorkflowStatus::Cancelled => "cancelled",
                },
                "profiles_updated": outcome.profiles_updated,
                "failed_profiles": outcome.failed_profiles,
                "references_untracked": outcome.references_untracked,
                "manifests_removed": outcome.manifests_removed,
                "objects_reclaimed": outcome.objects_reclaimed,
                "bytes_reclaimed": outcome.bytes_reclaimed,
                "warnings": outcome.warnings,
                "duration_ms": outcome.duration_ms,
            }))?
        );
    } else {
        println!(
            "{}: {} profile(s) updated, {} manifest(s) removed, {} object(s) reclaimed ({} bytes) in {} ms",
            outcome.operation_id,
            outcome.profiles_updated,
            outcome.manifests_removed,
            outcome.objects_reclaimed,
            outcome.bytes_reclaimed,
            outcome.duration_ms
        );
        for warning in &outcome.warnings {
            println!("warning: {warning}");
        }
    }
    Ok(match outcome.status {
        WorkflowStatus::Cancelled => 1,
        WorkflowStatus::Completed if outcome.failed_profiles > 0 => 1,
        WorkflowStatus::Completed => 0,
    })
}

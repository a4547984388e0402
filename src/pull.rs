use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use backfill::config::BackfillConfig;
use backfill::engine::{merge_into, Engine, FetchReport};
use backfill::hotzone::HotZoneStore;
use backfill::merge::MergeStats;
use backfill::resume::ResumeFilter;
use backfill::sink::{CommitStats, Committer, JsonlSink};
use backfill::state::{write_json_atomic, ConversationDir, RunManifest, RunStatus};
use backfill::transport::{HttpTransport, Transport};
use clap::Args;
use comfy_table::Cell;
use serde_json::json;
use tracing::{info, warn};

use crate::args::BaseArgs;
use crate::ui::{
    align_right, apply_column_padding, chunk_bar, header, print_command_status, spinner_bar,
    styled_table, CommandStatus,
};
use crate::utils::{format_bytes, format_commas, format_duration, pluralize};

#[derive(Debug, Clone, Args)]
pub struct PullArgs {
    /// Conversation to back up (username, invite link or numeric ID)
    #[arg(value_name = "ENTITY")]
    pub entity: String,

    /// API base URL (or via BACKFILL_API_URL)
    #[arg(long, env = "BACKFILL_API_URL", hide_env_values = true)]
    pub api_url: Option<String>,

    /// API key (or via BACKFILL_API_KEY)
    #[arg(long, env = "BACKFILL_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Number of concurrent sessions
    #[arg(long)]
    pub workers: Option<usize>,

    /// Seconds after which a chunk counts as slow
    #[arg(long, value_name = "SECS")]
    pub slow_threshold: Option<f64>,

    /// Bisection credits per planned chunk
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Forget previously committed records and start over
    #[arg(long)]
    pub fresh: bool,
}

impl PullArgs {
    fn apply_overrides(&self, config: &mut BackfillConfig) {
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(secs) = self.slow_threshold {
            config.slow_chunk_threshold_secs = secs;
        }
        if let Some(credits) = self.max_retries {
            config.max_bisect_retries = credits;
        }
    }
}

pub async fn run(base: BaseArgs, args: PullArgs) -> Result<()> {
    let root = base.root_dir()?;
    let mut config = base.load_config()?;
    args.apply_overrides(&mut config);
    config.validate().context("invalid backfill configuration")?;

    let api_url = args
        .api_url
        .clone()
        .ok_or_else(|| anyhow!("no API URL configured; pass --api-url or set BACKFILL_API_URL"))?;
    let transport = HttpTransport::new(&api_url, args.api_key.clone(), &args.entity);

    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_signal = Arc::clone(&interrupted);
    let ctrlc_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupted_signal.store(true, Ordering::SeqCst);
        }
    });

    let result = execute(
        transport,
        &root,
        config,
        &args.entity,
        PullOptions {
            fresh: args.fresh,
            json: base.json,
            shutdown: interrupted,
        },
    )
    .await;
    ctrlc_task.abort();

    let outcome = result?;
    if base.json {
        println!("{}", serde_json::to_string_pretty(&outcome.to_json())?);
    } else {
        print_summary(&outcome);
    }
    Ok(())
}

pub struct PullOptions {
    pub fresh: bool,
    pub json: bool,
    pub shutdown: Arc<AtomicBool>,
}

pub struct PullOutcome {
    pub entity: String,
    pub state_dir: std::path::PathBuf,
    pub manifest: RunManifest,
    pub report: FetchReport,
    pub recovered: Option<MergeStats>,
    pub merged: Option<MergeStats>,
    pub commit: CommitStats,
}

impl PullOutcome {
    fn to_json(&self) -> serde_json::Value {
        json!({
            "status": self.manifest.status.as_str(),
            "entity": self.entity,
            "state_dir": self.state_dir,
            "span": self.report.span,
            "chunks_planned": self.report.chunks_planned,
            "hot_zone_chunks": self.report.hot_zone_chunks,
            "density_fallback": self.report.density_fallback,
            "records_committed": self.commit.committed,
            "records_skipped": self.commit.skipped,
            "previously_completed": self.report.previously_completed,
            "completed_ranges": self.manifest.completed_ranges,
            "recovered": self.recovered,
            "merge": self.merged,
            "stats": self.report.stats,
        })
    }
}

/// One full pull against `transport`: recover leftover shards, fetch, merge,
/// commit, record the manifest.
pub async fn execute<T: Transport>(
    transport: T,
    root: &Path,
    config: BackfillConfig,
    entity: &str,
    options: PullOptions,
) -> Result<PullOutcome> {
    let conversation = ConversationDir::new(root, entity);
    if options.fresh {
        reset_conversation(&conversation)?;
    }
    conversation.create()?;
    let manifest_path = conversation.manifest_path();
    let mut manifest = RunManifest::resume(&manifest_path, entity);
    write_json_atomic(&manifest_path, &manifest)?;

    let hot_zones = HotZoneStore::load(&conversation.hotzones_path());
    let bar = chunk_bar("Fetching", !options.json);
    let mut engine = Engine::new(transport, config.clone(), hot_zones)
        .with_shutdown(Arc::clone(&options.shutdown))
        .with_progress(bar.clone());

    let resolving = spinner_bar(&format!("Resolving {entity}"), !options.json);
    let span = engine.resolve(entity).await;
    resolving.finish_and_clear();
    let span = match span {
        Ok(span) => span,
        Err(err) => return Err(fail_manifest(&manifest_path, &mut manifest, err)),
    };
    manifest.span = Some(span.clone());

    let filter = ResumeFilter::load_or_new(&conversation.filter_path(), span.estimated_total, &config.filter);
    info!(
        size = filter.size(),
        hash_count = filter.hash_count(),
        items = filter.items_added(),
        "resume filter ready"
    );
    let sink = JsonlSink::open(&conversation.data_dir())?;
    let mut committer = Committer::new(
        sink,
        filter,
        Some(conversation.filter_path()),
        config.filter.persist_every,
    );

    let shards_dir = conversation.shards_dir();
    let recovered = merge_into(&shards_dir, &mut committer)?;
    settle_pending(&mut manifest, recovered.as_ref());
    write_json_atomic(&manifest_path, &manifest)?;
    if let Some(stats) = &recovered {
        manifest.leftover_records_recovered = stats.records_emitted;
        if !options.json {
            print_command_status(
                CommandStatus::Warning,
                &format!(
                    "Recovered {} from {} left by an earlier run",
                    pluralize(stats.records_emitted as u64, "record", None),
                    pluralize(stats.shards as u64, "shard", None)
                ),
            );
        }
    }

    let report = match engine
        .fetch_remaining(span, &manifest.completed_ranges, &shards_dir)
        .await
    {
        Ok(report) => report,
        Err(err) => {
            bar.abandon();
            if let Err(flush_err) = committer.checkpoint() {
                warn!(error = %format!("{flush_err:#}"), "failed to checkpoint resume filter");
            }
            return Err(fail_manifest(&manifest_path, &mut manifest, err));
        }
    };
    bar.finish_and_clear();

    // An interrupted fetch keeps its shards; the next pull recovers them.
    let merged = if report.interrupted() {
        manifest.pending_ranges = report.completed.clone();
        None
    } else {
        let merged = merge_into(&shards_dir, &mut committer)?;
        match &merged {
            Some(stats) if !merge_is_clean(stats) => {
                warn!("merge lost records; their ranges will be fetched again")
            }
            // No shard means every fetched range was empty.
            _ => manifest.completed_ranges.extend(&report.completed),
        }
        merged
    };
    let (_, _, commit) = committer.finish()?;

    manifest.records_committed = commit.committed as usize;
    manifest.records_skipped = commit.skipped as usize;
    manifest.stats = Some(report.stats.clone());
    if !report.stats.failed_ranges.is_empty() {
        manifest.message = Some(format!(
            "{} could not be fetched",
            pluralize(report.stats.failed_ranges.len() as u64, "range", None)
        ));
    }
    manifest.finish(if report.interrupted() {
        RunStatus::Interrupted
    } else {
        RunStatus::Completed
    });
    write_json_atomic(&manifest_path, &manifest)?;

    Ok(PullOutcome {
        entity: entity.to_string(),
        state_dir: conversation.path().to_path_buf(),
        manifest,
        report,
        recovered,
        merged,
        commit,
    })
}

fn merge_is_clean(stats: &MergeStats) -> bool {
    stats.damaged_shards == 0 && stats.out_of_order_dropped == 0
}

/// Ranges left pending by an interrupted run count as completed only when
/// their shards were merged without loss.
fn settle_pending(manifest: &mut RunManifest, recovered: Option<&MergeStats>) {
    let pending = std::mem::take(&mut manifest.pending_ranges);
    if pending.is_empty() {
        return;
    }
    match recovered {
        Some(stats) if merge_is_clean(stats) => manifest.completed_ranges.extend(&pending),
        Some(_) => warn!("leftover shards were damaged; their ranges will be fetched again"),
        None => warn!("shards of the previous run are gone; their ranges will be fetched again"),
    }
}

fn reset_conversation(conversation: &ConversationDir) -> Result<()> {
    if !conversation.exists() {
        return Ok(());
    }
    let dir = conversation.path();
    std::fs::remove_dir_all(dir).with_context(|| format!("failed to remove {}", dir.display()))?;
    info!(dir = %dir.display(), "discarded previous state");
    Ok(())
}

fn fail_manifest(path: &Path, manifest: &mut RunManifest, err: anyhow::Error) -> anyhow::Error {
    manifest.message = Some(format!("{err:#}"));
    manifest.finish(RunStatus::Failed);
    if let Err(write_err) = write_json_atomic(path, manifest) {
        warn!(error = %format!("{write_err:#}"), "failed to record failed run");
    }
    err
}

fn print_summary(outcome: &PullOutcome) {
    let stats = &outcome.report.stats;
    if outcome.report.interrupted() {
        print_command_status(
            CommandStatus::Interrupted,
            &format!(
                "Interrupted {}: {} of {} committed so far",
                outcome.entity,
                format_commas(stats.chunks_committed as u64),
                pluralize(stats.chunks_planned as u64, "chunk", None)
            ),
        );
        println!("  Resume: rerun the same command (use --fresh to restart)");
    } else {
        print_command_status(
            CommandStatus::Success,
            &format!(
                "Backfilled {}: {} committed, {} already present",
                outcome.entity,
                pluralize(outcome.commit.committed, "record", None),
                format_commas(outcome.commit.skipped)
            ),
        );
    }

    let span = &outcome.report.span;
    println!(
        "  Span: {}..={} (datacenter {}), {} planned, {} from hot zones{}",
        span.min_id,
        span.max_id,
        span.datacenter_id,
        pluralize(outcome.report.chunks_planned as u64, "chunk", None),
        format_commas(outcome.report.hot_zone_chunks as u64),
        if outcome.report.density_fallback {
            ", density probe unavailable"
        } else {
            ""
        }
    );
    if outcome.report.previously_completed > 0 {
        println!(
            "  Already complete: {} IDs committed by earlier runs",
            format_commas(outcome.report.previously_completed)
        );
    }
    println!(
        "  Requests: {} ({} retried), slow chunks: {}, bisections: {}",
        format_commas(stats.requests as u64),
        format_commas(stats.retries as u64),
        format_commas(stats.slow_chunks as u64),
        format_commas(stats.bisections as u64)
    );
    if let Some(merged) = &outcome.merged {
        if merged.duplicates_dropped > 0 || merged.damaged_shards > 0 {
            print_command_status(
                CommandStatus::Warning,
                &format!(
                    "Merge dropped {} and found {}",
                    pluralize(merged.duplicates_dropped as u64, "duplicate", None),
                    pluralize(merged.damaged_shards as u64, "damaged shard", None)
                ),
            );
        }
    }
    for range in &stats.failed_ranges {
        print_command_status(CommandStatus::Warning, &format!("Range {range} could not be fetched"));
    }

    if stats.workers.is_empty() {
        return;
    }
    let mut table = styled_table();
    table.set_header(vec![
        header("Worker"),
        header("Chunks"),
        header("Records"),
        header("Requests"),
        header("Slow"),
        header("Written"),
        header("I/O time"),
        header("Rec/s"),
    ]);
    apply_column_padding(&mut table, (0, 2));
    for worker in &stats.workers {
        table.add_row(vec![
            Cell::new(worker.worker_id),
            Cell::new(format_commas(worker.chunks_committed as u64)),
            Cell::new(format_commas(worker.fetched as u64)),
            Cell::new(format_commas(worker.requests as u64)),
            Cell::new(worker.slow_chunks.len()),
            Cell::new(format_bytes(worker.bytes_written as f64)),
            Cell::new(format_duration(worker.io_time)),
            Cell::new(format!("{:.0}", worker.records_per_sec())),
        ]);
    }
    align_right(&mut table, &[1, 2, 3, 4, 5, 6, 7]);
    println!();
    println!("{table}");
}

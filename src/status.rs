use anyhow::{bail, Result};
use backfill::config::FilterConfig;
use backfill::merge::ShardMerger;
use backfill::resume::ResumeFilter;
use backfill::sink::list_part_indices;
use backfill::state::{read_json_file, ConversationDir, RunManifest};
use clap::Args;
use serde::Serialize;

use crate::args::BaseArgs;
use crate::ui::{print_command_status, CommandStatus};
use crate::utils::{format_commas, format_epoch, pluralize};

#[derive(Debug, Clone, Args)]
pub struct StatusArgs {
    /// Conversation to inspect
    #[arg(value_name = "ENTITY")]
    pub entity: String,
}

#[derive(Serialize)]
struct StatusOutput {
    entity: String,
    state_dir: String,
    manifest: RunManifest,
    pending_shards: usize,
    output_parts: usize,
    filter: Option<FilterSummary>,
}

#[derive(Serialize)]
struct FilterSummary {
    size: u64,
    hash_count: u32,
    items_added: u64,
    estimated_fpr: f64,
}

pub async fn run(base: BaseArgs, args: StatusArgs) -> Result<()> {
    let root = base.root_dir()?;
    let conversation = ConversationDir::new(&root, &args.entity);
    let manifest_path = conversation.manifest_path();
    if !manifest_path.exists() {
        bail!(
            "no backfill state for {} under {}",
            args.entity,
            root.display()
        );
    }
    let manifest: RunManifest = read_json_file(&manifest_path)?;
    let pending_shards = ShardMerger::shard_paths(&conversation.shards_dir())?.len();
    let output_parts = list_part_indices(&conversation.data_dir())?.len();

    let filter_path = conversation.filter_path();
    let filter = filter_path.exists().then(|| {
        let filter = ResumeFilter::load_or_new(&filter_path, None, &FilterConfig::default());
        FilterSummary {
            size: filter.size(),
            hash_count: filter.hash_count(),
            items_added: filter.items_added(),
            estimated_fpr: filter.estimated_fpr(),
        }
    });

    let output = StatusOutput {
        entity: args.entity,
        state_dir: conversation.path().display().to_string(),
        manifest,
        pending_shards,
        output_parts,
        filter,
    };

    if base.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let manifest = &output.manifest;
    println!("entity: {}", output.entity);
    println!("status: {}", manifest.status.as_str());
    println!("run: {}", manifest.run_id);
    println!("state dir: {}", output.state_dir);
    match &manifest.span {
        Some(span) => println!(
            "span: {}..={} (datacenter {}, ~{} messages)",
            span.min_id,
            span.max_id,
            span.datacenter_id,
            span.estimated_total
                .map(format_commas)
                .unwrap_or_else(|| "?".to_string())
        ),
        None => println!("span: (not resolved)"),
    }
    println!(
        "records: {} committed, {} skipped, {} recovered",
        format_commas(manifest.records_committed as u64),
        format_commas(manifest.records_skipped as u64),
        format_commas(manifest.leftover_records_recovered as u64)
    );
    println!(
        "coverage: {} IDs in {} committed, {} IDs waiting in shards",
        format_commas(manifest.completed_ranges.covered_len()),
        pluralize(manifest.completed_ranges.ranges().len() as u64, "range", None),
        format_commas(manifest.pending_ranges.covered_len())
    );
    println!("started: {}", format_epoch(Some(manifest.started_at)));
    println!("updated: {}", format_epoch(Some(manifest.updated_at)));
    println!("completed: {}", format_epoch(manifest.completed_at));
    println!("output: {}", pluralize(output.output_parts as u64, "part", None));
    if let Some(filter) = &output.filter {
        println!(
            "resume filter: {} of {} expected, {} hashes, ~{:.3}% false positives",
            format_commas(filter.items_added),
            format_commas(filter.size),
            filter.hash_count,
            filter.estimated_fpr * 100.0
        );
    }
    if let Some(stats) = &manifest.stats {
        println!(
            "last fetch: {} of {} chunks, {} slow, {} bisections",
            format_commas(stats.chunks_committed as u64),
            format_commas(stats.chunks_planned as u64),
            stats.slow_chunks,
            stats.bisections
        );
        for range in &stats.failed_ranges {
            print_command_status(CommandStatus::Warning, &format!("range {range} is missing"));
        }
    }
    if let Some(message) = &manifest.message {
        println!("message: {message}");
    }
    if output.pending_shards > 0 {
        print_command_status(
            CommandStatus::Warning,
            &format!(
                "{} waiting to be merged; rerun `backfill pull {}`",
                pluralize(output.pending_shards as u64, "shard", None),
                output.entity
            ),
        );
    }
    Ok(())
}

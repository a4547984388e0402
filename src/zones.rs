use anyhow::Result;
use backfill::hotzone::HotZoneStore;
use backfill::state::HOTZONES_FILE;
use clap::Args;
use comfy_table::Cell;
use serde_json::json;

use crate::args::BaseArgs;
use crate::ui::{
    align_right, apply_column_padding, header, print_command_status, styled_table, CommandStatus,
};
use crate::utils::{format_commas, pluralize};

#[derive(Debug, Clone, Args)]
pub struct ZonesArgs {
    /// Forget every learned hot zone
    #[arg(long)]
    pub clear: bool,
}

pub async fn run(base: BaseArgs, args: ZonesArgs) -> Result<()> {
    let path = base.root_dir()?.join(HOTZONES_FILE);
    let mut store = HotZoneStore::load(&path);

    if args.clear {
        let removed = store.entries().len();
        store.clear();
        if path.exists() {
            store.save()?;
        }
        if base.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "cleared": removed }))?
            );
        } else {
            print_command_status(
                CommandStatus::Success,
                &format!("Cleared {}", pluralize(removed as u64, "hot zone", None)),
            );
        }
        return Ok(());
    }

    if base.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "entries": store.entries(),
                "observations": store.history().len(),
            }))?
        );
        return Ok(());
    }

    if store.is_empty() {
        println!("No hot zones recorded yet.");
        return Ok(());
    }

    let mut table = styled_table();
    table.set_header(vec![
        header("DC"),
        header("Start"),
        header("End"),
        header("Chunk size"),
        header("Hits"),
    ]);
    apply_column_padding(&mut table, (0, 2));
    for entry in store.entries() {
        table.add_row(vec![
            Cell::new(entry.datacenter),
            Cell::new(format_commas(entry.id_start)),
            Cell::new(format_commas(entry.id_end)),
            Cell::new(format_commas(entry.recommended_size)),
            Cell::new(entry.hit_count),
        ]);
    }
    align_right(&mut table, &[1, 2, 3, 4]);
    println!("{table}");
    println!(
        "\n{} from {}",
        pluralize(store.entries().len() as u64, "zone", None),
        pluralize(store.history().len() as u64, "observation", None)
    );
    Ok(())
}

use anyhow::{anyhow, bail, Result};
use chrono::{TimeZone, Utc};
use clap::{Args, Subcommand};

use crate::args::BaseArgs;
use crate::codec::{self, SnapshotEnvelope};
use crate::context::AppContext;
use crate::reconcile::{mark_local_change, LocalStore};
use crate::rolling::MAX_SLOTS;
use crate::storage::validate_segment;
use crate::ui::{
    apply_column_padding, header, print_command_status, styled_table, with_spinner, CommandStatus,
};

#[derive(Debug, Clone, Args)]
pub struct SnapshotArgs {
    #[command(subcommand)]
    command: SnapshotCommands,
}

#[derive(Debug, Clone, Subcommand)]
enum SnapshotCommands {
    /// List the remote snapshot slots of a pattern
    List { id: String },
    /// Save the local progress into the next slot
    Push { id: String },
    /// Print a decoded snapshot
    Show {
        id: String,
        /// Slot index (defaults to the newest)
        #[arg(long)]
        slot: Option<usize>,
    },
    /// Replace local progress with a snapshot
    Restore {
        id: String,
        /// Slot index (defaults to the newest)
        #[arg(long)]
        slot: Option<usize>,
    },
}

pub async fn run(base: BaseArgs, args: SnapshotArgs) -> Result<()> {
    let ctx = AppContext::from_base(&base)?;
    match args.command {
        SnapshotCommands::List { id } => list(&ctx, &id).await,
        SnapshotCommands::Push { id } => push(&ctx, &id).await,
        SnapshotCommands::Show { id, slot } => show(&ctx, &id, slot).await,
        SnapshotCommands::Restore { id, slot } => restore(&ctx, &id, slot).await,
    }
}

fn format_millis(ms: i64) -> String {
    match Utc.timestamp_millis_opt(ms).single() {
        Some(at) => at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => ms.to_string(),
    }
}

async fn list(ctx: &AppContext, id: &str) -> Result<()> {
    let account = ctx.require_account()?;
    let store = ctx.snapshot_store()?;
    let mut slots = with_spinner("Listing snapshots...", store.list_slots(&account, id)).await?;
    slots.sort_by_key(|s| std::cmp::Reverse((s.updated_at, s.slot_index)));

    if ctx.json {
        println!("{}", serde_json::to_string(&slots)?);
        return Ok(());
    }
    if slots.is_empty() {
        print_command_status(CommandStatus::Info, &format!("No snapshots for '{id}'"));
        return Ok(());
    }

    let mut table = styled_table();
    table.set_header(vec![header("Slot"), header("Updated"), header("Path")]);
    apply_column_padding(&mut table, (0, 3));
    for slot in &slots {
        table.add_row(vec![
            slot.slot_index.to_string(),
            format_millis(slot.updated_at),
            slot.path.clone(),
        ]);
    }
    println!("{} of {MAX_SLOTS} slots used\n", slots.len());
    println!("{table}");
    Ok(())
}

async fn push(ctx: &AppContext, id: &str) -> Result<()> {
    let account = ctx.require_account()?;
    let progress = ctx
        .local
        .load_progress(id)
        .await?
        .ok_or_else(|| anyhow!("no local progress for '{id}'"))?;
    let writer = ctx.snapshot_writer()?;
    let slot = with_spinner("Saving snapshot...", writer.save(&account, &progress)).await?;

    if ctx.json {
        println!("{}", serde_json::to_string(&slot)?);
    } else {
        print_command_status(
            CommandStatus::Success,
            &format!("Saved '{id}' to slot {}", slot.slot_index),
        );
    }
    Ok(())
}

async fn fetch(ctx: &AppContext, id: &str, slot: Option<usize>) -> Result<SnapshotEnvelope> {
    validate_segment(id)?;
    let account = ctx.require_account()?;
    let store = ctx.snapshot_store()?;
    let bytes = match slot {
        Some(index) => {
            if index >= MAX_SLOTS {
                bail!("slot {index} out of range (0..{MAX_SLOTS})");
            }
            with_spinner("Fetching snapshot...", store.read_slot(&account, id, index)).await?
        }
        None => with_spinner("Fetching snapshot...", store.read_latest(&account, id)).await?,
    };
    let Some(bytes) = bytes else {
        match slot {
            Some(index) => bail!("slot {index} of '{id}' is empty"),
            None => bail!("no snapshots for '{id}'"),
        }
    };
    let envelope = codec::decode(&bytes)?;
    if envelope.progress.pattern_id != id {
        bail!(
            "snapshot belongs to '{}', not '{id}'",
            envelope.progress.pattern_id
        );
    }
    Ok(envelope)
}

async fn show(ctx: &AppContext, id: &str, slot: Option<usize>) -> Result<()> {
    let envelope = fetch(ctx, id, slot).await?;
    if ctx.json {
        println!("{}", serde_json::to_string(&envelope)?);
        return Ok(());
    }
    println!("pattern    {}", envelope.progress.pattern_id);
    println!("version    {}", envelope.v);
    println!("saved at   {}", format_millis(envelope.saved_at));
    println!("correct    {}", envelope.progress.correct_cells());
    println!("remaining  {}", envelope.progress.remaining_targets());
    if let Some(index) = envelope.progress.last_selected_palette_index {
        println!("selected   {index}");
    }
    Ok(())
}

async fn restore(ctx: &AppContext, id: &str, slot: Option<usize>) -> Result<()> {
    let envelope = fetch(ctx, id, slot).await?;
    if let Some(pattern) = ctx.local.load_pattern(id).await? {
        if envelope.progress.stitched_state.len() != pattern.cell_count() {
            bail!("snapshot does not match the local grid of '{id}'");
        }
    }
    ctx.local.save_progress(&envelope.progress).await?;
    mark_local_change(ctx.local.as_ref(), id).await?;
    print_command_status(
        CommandStatus::Success,
        &format!("Restored '{id}' from snapshot saved {}", format_millis(envelope.saved_at)),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_render_as_utc() {
        assert_eq!(format_millis(0), "1970-01-01 00:00:00 UTC");
        assert_eq!(format_millis(1_700_000_000_000), "2023-11-14 22:13:20 UTC");
    }
}

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;

use crate::args::BaseArgs;
use crate::context::AppContext;
use crate::model::{PatternDoc, ProgressRecord, CELL_CORRECT, CELL_WRONG};
use crate::reconcile::{mark_local_change, LocalStore};
use crate::ui::{apply_column_padding, header, print_command_status, styled_table, CommandStatus};

#[derive(Debug, Clone, Args)]
pub struct ProgressArgs {
    #[command(subcommand)]
    command: ProgressCommands,
}

#[derive(Debug, Clone, Subcommand)]
enum ProgressCommands {
    /// Show per-color progress for a pattern
    Show { id: String },
    /// Place a stitch
    Stitch {
        id: String,
        /// Cell as `x,y` or a flat index
        cell: String,
        /// Palette index
        color: u16,
    },
    /// Remove the stitch on a cell
    Unstitch { id: String, cell: String },
}

#[derive(Debug, Serialize)]
struct ColorRow<'a> {
    index: usize,
    name: &'a str,
    hex: &'a str,
    remaining: u32,
    correct: u32,
    wrong: u32,
}

pub async fn run(base: BaseArgs, args: ProgressArgs) -> Result<()> {
    let ctx = AppContext::from_base(&base)?;
    match args.command {
        ProgressCommands::Show { id } => show(&ctx, &id).await,
        ProgressCommands::Stitch { id, cell, color } => {
            edit(&ctx, &id, &cell, |progress, pattern, cell| {
                let state = progress.place_stitch(pattern, cell, color)?;
                Ok(match state {
                    CELL_CORRECT => "correct",
                    CELL_WRONG => "wrong",
                    _ => "empty",
                })
            })
            .await
        }
        ProgressCommands::Unstitch { id, cell } => {
            edit(&ctx, &id, &cell, |progress, pattern, cell| {
                Ok(if progress.clear_stitch(pattern, cell)? {
                    "cleared"
                } else {
                    "empty"
                })
            })
            .await
        }
    }
}

/// Accepts `x,y` or a flat `y * width + x` index.
fn parse_cell(pattern: &PatternDoc, raw: &str) -> Result<usize> {
    let index = match raw.split_once(',') {
        Some((x, y)) => {
            let x: u32 = x.trim().parse().with_context(|| format!("invalid column {x:?}"))?;
            let y: u32 = y.trim().parse().with_context(|| format!("invalid row {y:?}"))?;
            if x >= pattern.width || y >= pattern.height {
                bail!(
                    "cell {x},{y} is outside the {}x{} grid",
                    pattern.width,
                    pattern.height
                );
            }
            y as usize * pattern.width as usize + x as usize
        }
        None => raw.trim().parse().with_context(|| format!("invalid cell {raw:?}"))?,
    };
    if index >= pattern.cell_count() {
        bail!("cell {index} is outside the {}x{} grid", pattern.width, pattern.height);
    }
    Ok(index)
}

async fn load_both(ctx: &AppContext, id: &str) -> Result<(PatternDoc, ProgressRecord)> {
    let pattern = ctx
        .local
        .load_pattern(id)
        .await?
        .ok_or_else(|| anyhow!("pattern '{id}' not found"))?;
    let progress = match ctx.local.load_progress(id).await? {
        Some(progress) => progress,
        None => ProgressRecord::fresh(&pattern),
    };
    Ok((pattern, progress))
}

async fn edit<F>(ctx: &AppContext, id: &str, raw_cell: &str, apply: F) -> Result<()>
where
    F: FnOnce(&mut ProgressRecord, &PatternDoc, usize) -> crate::error::Result<&'static str>,
{
    let (pattern, mut progress) = load_both(ctx, id).await?;
    let cell = parse_cell(&pattern, raw_cell)?;
    let outcome = apply(&mut progress, &pattern, cell)?;
    ctx.local.save_progress(&progress).await?;
    mark_local_change(ctx.local.as_ref(), id).await?;

    if ctx.json {
        println!(
            "{}",
            serde_json::json!({
                "id": id,
                "cell": cell,
                "result": outcome,
                "remaining": progress.remaining_targets(),
            })
        );
    } else {
        let status = if outcome == "wrong" {
            CommandStatus::Warning
        } else {
            CommandStatus::Success
        };
        print_command_status(
            status,
            &format!(
                "Cell {cell}: {outcome} ({} stitches remaining)",
                progress.remaining_targets()
            ),
        );
    }
    Ok(())
}

async fn show(ctx: &AppContext, id: &str) -> Result<()> {
    let (pattern, progress) = load_both(ctx, id).await?;
    let rows: Vec<ColorRow> = pattern
        .palette
        .iter()
        .zip(&progress.palette_counts)
        .enumerate()
        .map(|(index, (color, count))| ColorRow {
            index,
            name: &color.name,
            hex: &color.hex,
            remaining: count.remaining_targets,
            correct: count.correct_count,
            wrong: count.wrong_count,
        })
        .collect();

    if ctx.json {
        println!(
            "{}",
            serde_json::json!({
                "id": id,
                "correct_cells": progress.correct_cells(),
                "remaining": progress.remaining_targets(),
                "colors": rows,
            })
        );
        return Ok(());
    }

    let mut table = styled_table();
    table.set_header(vec![
        header("#"),
        header("Color"),
        header("Hex"),
        header("Remaining"),
        header("Correct"),
        header("Wrong"),
    ]);
    apply_column_padding(&mut table, (0, 3));
    for row in &rows {
        table.add_row(vec![
            row.index.to_string(),
            row.name.to_string(),
            row.hex.to_string(),
            row.remaining.to_string(),
            row.correct.to_string(),
            row.wrong.to_string(),
        ]);
    }
    println!(
        "{} of {} cells correct, {} remaining\n",
        progress.correct_cells(),
        pattern.cell_count(),
        progress.remaining_targets()
    );
    println!("{table}");
    Ok(())
}

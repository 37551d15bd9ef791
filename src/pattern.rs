use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use dialoguer::console;
use dialoguer::Confirm;
use serde::{Deserialize, Serialize};

use crate::args::BaseArgs;
use crate::context::AppContext;
use crate::model::{epoch_millis, PaletteColor, PatternDoc, PatternMeta, ProgressRecord};
use crate::reconcile::{forget, mark_local_change, LocalStore};
use crate::storage::validate_segment;
use crate::ui::{
    apply_column_padding, header, is_interactive, print_command_status, styled_table, CommandStatus,
};

#[derive(Debug, Clone, Args)]
pub struct PatternArgs {
    #[command(subcommand)]
    command: PatternCommands,
}

#[derive(Debug, Clone, Subcommand)]
enum PatternCommands {
    /// Import a pattern document produced by the image converter
    Import {
        /// Path to the pattern JSON
        file: PathBuf,
        /// Pattern id (defaults to the file stem)
        #[arg(long)]
        id: Option<String>,
    },
    /// List local patterns
    List,
    /// Remove a pattern and its progress from this device
    Forget {
        id: String,
        /// Skip confirmation
        #[arg(long, short = 'f')]
        force: bool,
    },
}

/// Converter output: the grid without identity or timestamps.
#[derive(Debug, Deserialize)]
struct PatternFile {
    width: u32,
    height: u32,
    palette: Vec<PaletteColor>,
    targets: Vec<u16>,
    #[serde(default)]
    meta: PatternMeta,
}

#[derive(Debug, Serialize)]
struct PatternSummary {
    id: String,
    title: String,
    width: u32,
    height: u32,
    colors: usize,
    remaining: Option<u64>,
    needs_upload: bool,
}

pub async fn run(base: BaseArgs, args: PatternArgs) -> Result<()> {
    let ctx = AppContext::from_base(&base)?;
    match args.command {
        PatternCommands::Import { file, id } => import(&ctx, &file, id).await,
        PatternCommands::List => list(&ctx).await,
        PatternCommands::Forget { id, force } => forget_pattern(&ctx, &id, force).await,
    }
}

fn id_from_path(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_string_lossy();
    Some(stem.strip_suffix(".pattern").unwrap_or(&stem).to_string())
}

pub fn parse_pattern(id: &str, bytes: &[u8]) -> Result<PatternDoc> {
    let file: PatternFile = serde_json::from_slice(bytes).context("not a pattern document")?;
    let pattern = PatternDoc {
        id: id.to_string(),
        width: file.width,
        height: file.height,
        palette: file.palette,
        targets: file.targets,
        meta: file.meta,
        updated_at: epoch_millis(),
    };
    pattern.validate()?;
    Ok(pattern)
}

async fn import(ctx: &AppContext, file: &Path, id: Option<String>) -> Result<()> {
    let Some(id) = id.or_else(|| id_from_path(file)) else {
        bail!("could not derive a pattern id from {}; pass --id", file.display());
    };
    validate_segment(&id)?;

    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let pattern = parse_pattern(&id, &bytes)?;

    let replaced = ctx.local.load_pattern(&id).await?.is_some();
    ctx.local.save_pattern(&pattern).await?;
    // Existing progress only survives when the grid is unchanged.
    let keep_progress = match ctx.local.load_progress(&id).await? {
        Some(progress) => progress.stitched_state.len() == pattern.cell_count()
            && progress.palette_counts.len() == pattern.palette.len(),
        None => false,
    };
    if !keep_progress {
        ctx.local.save_progress(&ProgressRecord::fresh(&pattern)).await?;
    }
    mark_local_change(ctx.local.as_ref(), &id).await?;

    if ctx.json {
        println!(
            "{}",
            serde_json::json!({"id": id, "replaced": replaced, "progress_reset": !keep_progress})
        );
    } else {
        let verb = if replaced { "Updated" } else { "Imported" };
        print_command_status(
            CommandStatus::Success,
            &format!(
                "{verb} pattern '{id}' ({}x{}, {} colors)",
                pattern.width,
                pattern.height,
                pattern.palette.len()
            ),
        );
    }
    Ok(())
}

async fn list(ctx: &AppContext) -> Result<()> {
    let mut summaries = Vec::new();
    for id in ctx.local.list_all_pattern_ids().await? {
        let Some(pattern) = ctx.local.load_pattern(&id).await? else {
            continue;
        };
        let progress = ctx.local.load_progress(&id).await?;
        let meta = ctx.local.load_sync_meta(&id).await?;
        summaries.push(PatternSummary {
            title: pattern.meta.title.clone(),
            width: pattern.width,
            height: pattern.height,
            colors: pattern.palette.len(),
            remaining: progress.map(|p| p.remaining_targets()),
            needs_upload: meta.map(|m| m.needs_upload).unwrap_or(true),
            id,
        });
    }

    if ctx.json {
        println!("{}", serde_json::to_string(&summaries)?);
        return Ok(());
    }
    if summaries.is_empty() {
        print_command_status(
            CommandStatus::Info,
            "No patterns yet. Import one with `stitch pattern import <file>`.",
        );
        return Ok(());
    }

    let mut output = String::new();
    writeln!(output, "{} patterns\n", console::style(summaries.len()))?;
    let mut table = styled_table();
    table.set_header(vec![
        header("Id"),
        header("Title"),
        header("Size"),
        header("Colors"),
        header("Remaining"),
        header("Sync"),
    ]);
    apply_column_padding(&mut table, (0, 4));
    for s in &summaries {
        table.add_row(vec![
            s.id.clone(),
            if s.title.is_empty() { "-".into() } else { s.title.clone() },
            format!("{}x{}", s.width, s.height),
            s.colors.to_string(),
            s.remaining.map(|r| r.to_string()).unwrap_or_else(|| "-".into()),
            if s.needs_upload { "pending".into() } else { "synced".into() },
        ]);
    }
    write!(output, "{table}")?;
    println!("{output}");
    Ok(())
}

async fn forget_pattern(ctx: &AppContext, id: &str, force: bool) -> Result<()> {
    validate_segment(id)?;
    if ctx.local.load_pattern(id).await?.is_none() && ctx.local.load_progress(id).await?.is_none() {
        bail!("pattern '{id}' not found");
    }
    if !force && is_interactive() {
        let confirm = Confirm::new()
            .with_prompt(format!("Forget pattern '{id}' and its local progress?"))
            .default(false)
            .interact()?;
        if !confirm {
            return Ok(());
        }
    }

    forget(ctx.local.as_ref(), id).await?;
    print_command_status(CommandStatus::Success, &format!("Forgot '{id}'"));
    Ok(())
}

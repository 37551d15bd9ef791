use anyhow::Result;
use clap::Args;

use crate::args::BaseArgs;
use crate::context::AppContext;
use crate::reconcile::{Direction, PatternFailure, ReconcileReport};
use crate::storage::validate_segment;
use crate::ui::{
    apply_column_padding, header, print_command_status, styled_table, with_spinner, CommandStatus,
};
use crate::utils::pluralize;

#[derive(Debug, Clone, Args)]
pub struct SyncArgs {
    /// Reconcile just this pattern
    #[arg(long)]
    pattern: Option<String>,
}

fn arrow(direction: Direction) -> &'static str {
    match direction {
        Direction::Upload => "upload",
        Direction::Download => "download",
        Direction::None => "-",
    }
}

pub async fn run(base: BaseArgs, args: SyncArgs) -> Result<()> {
    let ctx = AppContext::from_base(&base)?;
    if ctx.account_id().is_none() {
        print_command_status(
            CommandStatus::Warning,
            "No account configured; nothing to sync",
        );
        return Ok(());
    }
    let reconciler = ctx.reconciler()?;

    let report = match &args.pattern {
        Some(id) => {
            validate_segment(id)?;
            let mut report = ReconcileReport::default();
            match with_spinner("Syncing...", reconciler.reconcile_pattern(id)).await {
                Ok(Some(outcome)) => report.outcomes.push(outcome),
                Ok(None) => {}
                Err(err) => report.failures.push(PatternFailure {
                    pattern_id: id.clone(),
                    error: err.to_string(),
                }),
            }
            report
        }
        None => with_spinner("Syncing...", reconciler.reconcile_all()).await?,
    };

    if ctx.json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        print_report(&report);
    }
    report.into_result()?;
    Ok(())
}

fn print_report(report: &ReconcileReport) {
    if report.total() == 0 {
        print_command_status(CommandStatus::Info, "Nothing to sync");
        return;
    }

    let mut table = styled_table();
    table.set_header(vec![
        header("Pattern"),
        header("Definition"),
        header("Progress"),
        header("Error"),
    ]);
    apply_column_padding(&mut table, (0, 3));
    for outcome in &report.outcomes {
        table.add_row(vec![
            outcome.pattern_id.clone(),
            arrow(outcome.definition).to_string(),
            arrow(outcome.progress).to_string(),
            String::new(),
        ]);
    }
    for failure in &report.failures {
        table.add_row(vec![
            failure.pattern_id.clone(),
            String::new(),
            String::new(),
            failure.error.clone(),
        ]);
    }
    println!("{table}");

    let summary = format!(
        "{} {}, {} {}, {} {}",
        report.uploads(),
        pluralize(report.uploads(), "upload", None),
        report.downloads(),
        pluralize(report.downloads(), "download", None),
        report.failures.len(),
        pluralize(report.failures.len(), "failure", None),
    );
    let status = if report.failures.is_empty() {
        CommandStatus::Success
    } else {
        CommandStatus::Error
    };
    print_command_status(status, &summary);
}

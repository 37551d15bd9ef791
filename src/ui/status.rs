use dialoguer::console::{style, StyledObject};

pub enum CommandStatus {
    Success,
    Error,
    Warning,
    Info,
}

fn indicator(status: &CommandStatus) -> StyledObject<&'static str> {
    match status {
        CommandStatus::Success => style("✓").green(),
        CommandStatus::Error => style("✗").red(),
        CommandStatus::Warning => style("!").yellow(),
        CommandStatus::Info => style("·").dim(),
    }
}

/// One status line on stderr, keeping stdout free for data and `--json`.
pub fn print_command_status(status: CommandStatus, message: &str) {
    eprintln!("{} {message}", indicator(&status));
}

use dialoguer::console::style;

pub enum CommandStatus {
    Success,
    Warning,
    Interrupted,
}

/// One-line outcome on stderr, prefixed with a colored indicator.
pub fn print_command_status(status: CommandStatus, message: &str) {
    let indicator = match status {
        CommandStatus::Success => style("✓").green(),
        CommandStatus::Warning => style("!").yellow(),
        CommandStatus::Interrupted => style("⏸").dim(),
    };
    eprintln!("{indicator} {message}");
}

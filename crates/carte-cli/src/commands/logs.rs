//! `carte logs`: Print a container's output.

use clap::Args;

use super::GlobalArgs;

/// Arguments for the `logs` command.
#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Container name.
    pub container: String,
}

/// Executes the `logs` command.
///
/// # Errors
///
/// Returns an error if the container is not found or the log is unreadable.
pub fn execute(global: &GlobalArgs, args: &LogsArgs) -> anyhow::Result<()> {
    let logs = global.runtime()?.container_logs(&args.container)?;
    print!("{logs}");
    Ok(())
}

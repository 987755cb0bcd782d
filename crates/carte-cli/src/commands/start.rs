//! `carte start`: Start a stopped container.

use clap::Args;

use super::GlobalArgs;
use super::run::{report_started, supervise};

/// Arguments for the `start` command.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Container name.
    pub container: String,

    /// Return once the container is running instead of waiting for it.
    #[arg(short, long)]
    pub detach: bool,
}

/// Executes the `start` command.
///
/// # Errors
///
/// Returns an error if the container is unknown, already running, or
/// cannot be started.
pub fn execute(global: &GlobalArgs, args: StartArgs) -> anyhow::Result<()> {
    let runtime = global.runtime()?;
    let running = runtime.start_container(&args.container)?;
    report_started(&running);
    supervise(runtime, running, args.detach)
}

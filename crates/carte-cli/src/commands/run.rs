//! `carte run`: Create and start a container.

use std::sync::Arc;

use clap::Args;

use carte_common::types::ImageRef;
use carte_runtime::{RunningContainer, Runtime};

use super::GlobalArgs;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Container name, unique on this host.
    #[arg(long)]
    pub name: String,

    /// CPU limit as a percentage of one core (`50%`).
    #[arg(long, default_value = "100%")]
    pub cpu: String,

    /// Memory limit in bytes or with a K/M/G suffix.
    #[arg(long, default_value = "256M")]
    pub memory: String,

    /// Return once the container is running instead of waiting for it.
    #[arg(short, long)]
    pub detach: bool,

    /// Image reference (`name[:tag]`).
    pub image: String,
}

/// Executes the `run` command.
///
/// # Errors
///
/// Returns an error if the container cannot be created or started.
pub fn execute(global: &GlobalArgs, args: RunArgs) -> anyhow::Result<()> {
    let image = ImageRef::parse(&args.image)?;
    let runtime = global.runtime()?;
    let running = runtime.run_container(&args.name, &image, &args.cpu, &args.memory)?;
    report_started(&running);
    supervise(runtime, running, args.detach)
}

pub(crate) fn report_started(running: &RunningContainer) {
    let record = &running.record;
    match record.ip_address() {
        Some(ip) => println!("{} running (pid {}, ip {ip})", record.name, running.watch.pid()),
        None => println!("{} running (pid {})", record.name, running.watch.pid()),
    }
}

/// Blocks until the container exits unless `detach` is set. Ctrl-C stops it.
pub(crate) fn supervise(runtime: Runtime, running: RunningContainer, detach: bool) -> anyhow::Result<()> {
    let name = running.record.name.clone();
    if detach {
        println!("Use `carte stop {name}` to stop it.");
        return Ok(());
    }

    let runtime = Arc::new(runtime);
    let handler_runtime = Arc::clone(&runtime);
    let handler_name = name.clone();
    ctrlc::set_handler(move || {
        eprintln!("stopping {handler_name}...");
        if let Err(e) = handler_runtime.stop_container(&handler_name) {
            tracing::warn!(container = %handler_name, error = %e, "stop on interrupt failed");
        }
    })?;

    let outcome = running.watch.wait()?;
    println!("{name} exited with code {}", outcome.code());
    Ok(())
}

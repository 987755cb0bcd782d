//! `carte ps`: List containers.

use clap::Args;

use carte_common::types::ContainerStatus;

use super::GlobalArgs;
use crate::output;

/// Arguments for the `ps` command.
#[derive(Args, Debug)]
pub struct PsArgs {
    /// Only show running containers.
    #[arg(short, long)]
    pub running: bool,

    /// Print JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}

/// Executes the `ps` command.
///
/// # Errors
///
/// Returns an error if the state directory cannot be read.
pub fn execute(global: &GlobalArgs, args: &PsArgs) -> anyhow::Result<()> {
    let mut containers = global.runtime()?.list_containers()?;
    if args.running {
        containers.retain(|c| c.status == ContainerStatus::Running);
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&containers)?);
    } else if containers.is_empty() {
        println!("no containers");
    } else {
        print!("{}", output::container_table(&containers));
    }
    Ok(())
}

//! `carte rm`: Remove stopped containers.

use clap::Args;

use super::GlobalArgs;

/// Arguments for the `rm` command.
#[derive(Args, Debug)]
pub struct RmArgs {
    /// Container names.
    #[arg(required = true)]
    pub containers: Vec<String>,
}

/// Executes the `rm` command.
///
/// # Errors
///
/// Returns the first removal failure after attempting every name.
pub fn execute(global: &GlobalArgs, args: &RmArgs) -> anyhow::Result<()> {
    let runtime = global.runtime()?;
    let mut first_error = None;
    for name in &args.containers {
        match runtime.remove_container(name) {
            Ok(()) => println!("{name}"),
            Err(e) => {
                eprintln!("{name}: {e}");
                let _ = first_error.get_or_insert(e);
            }
        }
    }
    first_error.map_or(Ok(()), |e| Err(e.into()))
}

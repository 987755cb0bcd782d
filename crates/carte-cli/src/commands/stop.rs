//! `carte stop`: Stop running containers.

use clap::Args;

use super::GlobalArgs;

/// Arguments for the `stop` command.
#[derive(Args, Debug)]
pub struct StopArgs {
    /// Container names.
    #[arg(required = true)]
    pub containers: Vec<String>,
}

/// Executes the `stop` command.
///
/// Every name is attempted; the first failure is returned at the end.
///
/// # Errors
///
/// Returns an error if any container could not be stopped.
pub fn execute(global: &GlobalArgs, args: &StopArgs) -> anyhow::Result<()> {
    let runtime = global.runtime()?;
    let mut first_error = None;
    for name in &args.containers {
        match runtime.stop_container(name) {
            Ok(record) => match record.exit_code {
                Some(code) => println!("{name} stopped (exit code {code})"),
                None => println!("{name} stopped"),
            },
            Err(e) => {
                eprintln!("{name}: {e}");
                let _ = first_error.get_or_insert(e);
            }
        }
    }
    first_error.map_or(Ok(()), |e| Err(e.into()))
}

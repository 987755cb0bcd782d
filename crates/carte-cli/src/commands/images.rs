//! `carte images`: List the local image catalog.

use clap::Args;

use super::GlobalArgs;
use crate::output;

/// Arguments for the `images` command.
#[derive(Args, Debug)]
pub struct ImagesArgs {
    /// Print JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}

/// Executes the `images` command.
///
/// # Errors
///
/// Returns an error if the catalog cannot be read.
pub fn execute(global: &GlobalArgs, args: &ImagesArgs) -> anyhow::Result<()> {
    let images = global.runtime()?.list_images()?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&images)?);
    } else if images.is_empty() {
        println!("no images");
    } else {
        print!("{}", output::image_table(&images));
    }
    Ok(())
}

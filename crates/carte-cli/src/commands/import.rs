//! `carte import`: Register a base image.

use clap::Args;

use carte_common::types::ImageRef;

use super::GlobalArgs;
use crate::output::format_bytes;

/// Arguments for the `import` command.
#[derive(Args, Debug)]
pub struct ImportArgs {
    /// Image reference to register (`name[:tag]`).
    pub image: String,

    /// Source: `file:///path/to/rootfs` or `tar:///path/to/rootfs.tar[.gz]`.
    pub source: String,
}

/// Executes the `import` command.
///
/// # Errors
///
/// Returns an error if the source cannot be read.
pub fn execute(global: &GlobalArgs, args: &ImportArgs) -> anyhow::Result<()> {
    let image = ImageRef::parse(&args.image)?;
    let entry = global.runtime()?.import_image(&image, &args.source)?;
    println!("Imported {image} [{}] ({})", entry.id.short(), format_bytes(entry.size_bytes));
    Ok(())
}

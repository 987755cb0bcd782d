//! `carte build`: Build an image from a Cartefile.

use std::path::PathBuf;
use std::time::Instant;

use clap::Args;

use carte_common::constants::MANIFEST_FILE;
use carte_common::types::ImageRef;
use carte_image::builder::StepOutcome;

use super::GlobalArgs;

/// Arguments for the `build` command.
#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Name and optional tag of the resulting image (`name[:tag]`).
    #[arg(short, long)]
    pub tag: String,

    /// Manifest path; defaults to `<context>/Cartefile`.
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Build context directory.
    #[arg(default_value = ".")]
    pub context: PathBuf,
}

/// Executes the `build` command.
///
/// # Errors
///
/// Returns an error if the manifest is invalid or a step fails.
pub fn execute(global: &GlobalArgs, args: BuildArgs) -> anyhow::Result<()> {
    let image = ImageRef::parse(&args.tag)?;
    let manifest = args.file.unwrap_or_else(|| args.context.join(MANIFEST_FILE));
    let runtime = global.runtime()?;

    let started = Instant::now();
    let report = runtime.build_image(&manifest, &args.context, &image)?;
    for step in &report.steps {
        let marker = match step.outcome {
            StepOutcome::Cached => " (cached)",
            StepOutcome::Executed => "",
        };
        println!("  line {:>3}  {}{marker}", step.line, step.instruction);
    }
    println!(
        "Built {} [{}] in {:.1}s: {} executed, {} cached",
        report.image,
        report.id.short(),
        started.elapsed().as_secs_f64(),
        report.executed(),
        report.cached()
    );
    Ok(())
}

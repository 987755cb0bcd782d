//! CLI command definitions and dispatch.

pub mod build;
pub mod images;
pub mod import;
pub mod logs;
pub mod ps;
pub mod rm;
pub mod run;
pub mod start;
pub mod stop;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use carte_common::config::CarteConfig;
use carte_common::constants::{CONFIG_ENV, DATA_DIR_ENV};
use carte_runtime::Runtime;

/// carte: a minimal, daemon-less container engine.
#[derive(Parser, Debug)]
#[command(name = "carte", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Engine-wide options.
    #[command(flatten)]
    pub global: GlobalArgs,
}

/// Options shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// JSON configuration file.
    #[arg(long, global = true, env = CONFIG_ENV)]
    pub config: Option<PathBuf>,

    /// Data directory holding images, containers, and state.
    #[arg(long, global = true, env = DATA_DIR_ENV)]
    pub data_dir: Option<PathBuf>,
}

impl GlobalArgs {
    /// Loads the configuration and opens the runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the data
    /// directory cannot be prepared.
    pub fn runtime(&self) -> anyhow::Result<Runtime> {
        let mut config = CarteConfig::load(self.config.as_deref()).context("failed to load configuration")?;
        if let Some(dir) = &self.data_dir {
            config.data_dir.clone_from(dir);
        }
        tracing::debug!(data_dir = %config.data_dir.display(), "configuration resolved");
        Ok(Runtime::new(config)?)
    }
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build an image from a Cartefile.
    Build(build::BuildArgs),
    /// Register a base image from a local directory or archive.
    Import(import::ImportArgs),
    /// List images in the local catalog.
    Images(images::ImagesArgs),
    /// Create and start a container.
    Run(run::RunArgs),
    /// Start a stopped container.
    Start(start::StartArgs),
    /// Stop running containers.
    Stop(stop::StopArgs),
    /// Remove stopped containers.
    Rm(rm::RmArgs),
    /// List containers.
    Ps(ps::PsArgs),
    /// Print a container's output.
    Logs(logs::LogsArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    let global = cli.global;
    match cli.command {
        Command::Build(args) => build::execute(&global, args),
        Command::Import(args) => import::execute(&global, &args),
        Command::Images(args) => images::execute(&global, &args),
        Command::Run(args) => run::execute(&global, args),
        Command::Start(args) => start::execute(&global, args),
        Command::Stop(args) => stop::execute(&global, &args),
        Command::Rm(args) => rm::execute(&global, &args),
        Command::Ps(args) => ps::execute(&global, &args),
        Command::Logs(args) => logs::execute(&global, &args),
    }
}

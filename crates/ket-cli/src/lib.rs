//! ket CLI library

pub mod commands;
pub mod config;
pub mod error;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use ket_common::telemetry::init_logging;

/// ket - run test suites in ephemeral Kubernetes namespaces
#[derive(Parser, Debug)]
#[command(name = "ket")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Command to run
    #[command(subcommand)]
    pub command: Commands,
}

/// ket subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the tests in a fresh namespace and clean up afterwards
    Run(commands::run::RunArgs),
    /// Print the manifests a run would create
    Manifest(commands::manifest::ManifestArgs),
}

impl Commands {
    fn config_args(&self) -> &config::ConfigArgs {
        match self {
            Commands::Run(args) => &args.config,
            Commands::Manifest(args) => &args.config,
        }
    }
}

impl Cli {
    /// Resolve configuration, set up logging and run the command.
    ///
    /// `cancel` interrupts a run; cleanup still happens before this returns.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let config = self.command.config_args().resolve()?;
        init_logging(&config.logging, config.debug)?;

        match self.command {
            Commands::Run(args) => commands::run::run(args, config, cancel).await,
            Commands::Manifest(args) => commands::manifest::run(args, config),
        }
    }
}

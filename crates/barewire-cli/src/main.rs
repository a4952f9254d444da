#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

mod commands;
mod logging;

use barewire_core::DEFAULT_CDN;
use clap::Parser;
use miette::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "barewire")]
#[command(author, version, about = "Rewrite bare module specifiers for the browser", long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit JSON formatted logs (machine-readable)
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Rewrite bare imports in a directory of build artifacts and vendor the
    /// dependency closure under node_modules/
    Rewrite {
        /// Directory of input files
        dir: PathBuf,

        /// Output directory
        #[arg(short, long, value_name = "PATH")]
        out: PathBuf,

        /// CDN base URL
        #[arg(long, default_value = DEFAULT_CDN, value_name = "URL")]
        cdn: String,
    },

    /// Assemble the TypeScript declaration tree for a source file's imports
    Types {
        /// Entry source file (.ts or .d.ts)
        entry: PathBuf,

        /// Output directory
        #[arg(short, long, value_name = "PATH")]
        out: PathBuf,

        /// CDN base URL
        #[arg(long, default_value = DEFAULT_CDN, value_name = "URL")]
        cdn: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.json);

    match cli.command {
        Commands::Rewrite { dir, out, cdn } => commands::rewrite::run(&dir, &out, &cdn).await,
        Commands::Types { entry, out, cdn } => commands::types::run(&entry, &out, &cdn).await,
    }
}

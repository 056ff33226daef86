#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_precision_loss)]

mod commands;
mod logging;

use clap::Parser;
use miette::Result;
use nexus_core::config::DEFAULT_CONFIG_FILE;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "nexus")]
#[command(author, version, about = "Native build core: dev server and production bundler", long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit JSON output (logs on stderr, results on stdout)
    #[arg(long, global = true)]
    json: bool,

    /// Override the working directory
    #[arg(long, global = true, value_name = "PATH")]
    cwd: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the dev server
    Dev {
        /// Port to listen on (0 picks a free port)
        #[arg(long, env = "NEXUS_PORT")]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Config file, relative to the working directory
        #[arg(long, env = "NEXUS_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },

    /// Build for production
    Build {
        /// Config file, relative to the working directory
        #[arg(long, env = "NEXUS_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,

        /// Output directory, relative to the project root
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },

    /// Print the host platform and the native binding it uses
    Platform,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let cwd = cli
        .cwd
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    logging::init(cli.verbose, cli.json);

    match cli.command {
        Commands::Dev { port, host, config } => commands::dev::run(commands::dev::DevAction {
            cwd,
            config,
            port,
            host,
        }),
        Commands::Build { config, out_dir } => commands::build::run(
            commands::build::BuildAction {
                cwd,
                config,
                out_dir,
            },
            cli.json,
        ),
        Commands::Platform => commands::platform::run(cli.json),
    }
}

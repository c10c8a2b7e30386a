mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    config::ConfigSubcommand, containers::ContainersSubcommand, task::TaskSubcommand,
    token::TokenSubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "preview",
    about = "Mobile preview lifecycle: bundler containers, QR codes and the API server",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .preview/ or .git/)
    #[arg(long, global = true, env = "PREVIEW_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API and the lifecycle loop
    Serve {
        /// Port to listen on (default: server.port from config)
        #[arg(long)]
        port: Option<u16>,

        /// Address to bind (default: server.bind from config)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Manage tasks
    Task {
        #[command(subcommand)]
        subcommand: TaskSubcommand,
    },

    /// Inspect and stop bundler containers
    Containers {
        #[command(subcommand)]
        subcommand: ContainersSubcommand,
    },

    /// Reconcile stored containers against the provider once
    Reconcile,

    /// Mint API session tokens
    Token {
        #[command(subcommand)]
        subcommand: TokenSubcommand,
    },

    /// Show or validate the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Serve { port, bind } => cmd::serve::run(&root, port, bind),
        Commands::Task { subcommand } => cmd::task::run(&root, subcommand, cli.json),
        Commands::Containers { subcommand } => cmd::containers::run(&root, subcommand, cli.json),
        Commands::Reconcile => cmd::reconcile::run(&root, cli.json),
        Commands::Token { subcommand } => cmd::token::run(&root, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};

mod commands;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "berth", version, about = "Per-worktree development container control plane")]
struct Cli {
    /// Config file (defaults to ~/.berth/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the container up, then monitor it until ctrl-c.
    Up {
        /// Image to run instead of the configured one.
        #[arg(long)]
        image: Option<String>,
        /// Container name.
        #[arg(long)]
        name: Option<String>,
        /// Build and run the development image from the current checkout.
        #[arg(long)]
        dev: bool,
        /// Pull or rebuild even when the image is present.
        #[arg(long)]
        refresh: bool,
        /// Remove the container once it stops.
        #[arg(long)]
        rm: bool,
        /// Port mapping (`host:container`), repeatable. Replaces the configured list.
        #[arg(long = "port")]
        ports: Vec<String>,
    },
    /// Serve the live event stream until ctrl-c.
    Serve,
    /// Print the detected runtime configuration as JSON.
    Runtime,
    /// Subscribe to an event stream and print what arrives.
    Watch {
        /// Events endpoint (defaults to the configured one).
        url: Option<String>,
        /// Print raw JSON frames.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;
    berth_telemetry::logging::init_from_config("berth", &config.general);

    match cli.command {
        Some(Commands::Up {
            image,
            name,
            dev,
            refresh,
            rm,
            ports,
        }) => {
            let overrides = commands::up::UpOverrides {
                image,
                name,
                dev,
                refresh,
                rm,
                ports,
            };
            commands::up::run(config, overrides).await
        }
        Some(Commands::Serve) => commands::serve::run(config).await,
        Some(Commands::Runtime) => commands::runtime::run(),
        Some(Commands::Watch { url, json }) => commands::watch::run(config, url, json).await,
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    }
}

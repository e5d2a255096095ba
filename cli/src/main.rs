//! devforward CLI - Forward component endpoints to localhost
//!
//! A command-line tool for running port forwarding sessions against a
//! cluster or a local container runtime, querying the ports forwarded by
//! running sessions and inspecting container socket tables.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use devforward_core::Platform;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "devforward")]
#[command(author, version, about = "Forward component endpoints to localhost")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file (default: ~/.devforward/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Forward the endpoints of a component until interrupted
    #[command(alias = "pf")]
    Forward {
        /// Component name, used to find its pod
        component: String,

        /// JSON file listing the containers and their endpoints
        #[arg(short, long)]
        file: PathBuf,

        /// Platform running the component
        #[arg(long, default_value = "cluster")]
        platform: Platform,

        /// Forward debug endpoints too
        #[arg(long)]
        debug: bool,

        /// Let the OS pick local ports
        #[arg(long)]
        random_ports: bool,

        /// Fixed forwarding, as localPort:[containerName:]containerPort
        #[arg(long = "port-forward", value_name = "SPEC")]
        port_forward: Vec<String>,
    },

    /// List ports forwarded by running sessions
    #[command(alias = "ls")]
    Ports {
        /// Only sessions of this platform
        #[arg(long)]
        platform: Option<Platform>,
    },

    /// Show the connections of a container
    Scan {
        /// Pod name
        pod: String,

        /// Container name
        #[arg(short, long)]
        container: String,

        /// Only listening sockets
        #[arg(long)]
        listening: bool,

        /// Report which of these container ports listen on loopback only
        #[arg(long, value_name = "PORT", num_args = 1..)]
        loopback: Vec<u16>,
    },

    /// Wait until container ports are listening
    Check {
        /// Pod name
        pod: String,

        /// Port to wait for, as containerName:port
        #[arg(short, long = "port", value_name = "CONTAINER:PORT", required = true)]
        ports: Vec<String>,

        /// Seconds to wait before giving up
        #[arg(long, default_value = "60")]
        timeout: u64,
    },

    /// Show current configuration
    Config {
        /// Write the effective configuration to the configuration file
        #[arg(long)]
        init: bool,
    },
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = commands::load_config(cli.config.as_deref()).await?;
    tracing::debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Forward {
            component,
            file,
            platform,
            debug,
            random_ports,
            port_forward,
        } => {
            let args = commands::forward::ForwardArgs {
                component,
                file,
                platform,
                debug,
                random_ports,
                port_forward,
            };
            commands::forward::run(&config, args).await?;
        }
        Commands::Ports { platform } => {
            commands::ports::run(&config, platform, cli.json).await?;
        }
        Commands::Scan {
            pod,
            container,
            listening,
            loopback,
        } => {
            commands::scan::run(&config, &pod, &container, listening, &loopback, cli.json).await?;
        }
        Commands::Check {
            pod,
            ports,
            timeout,
        } => {
            commands::check::run(&config, &pod, &ports, timeout).await?;
        }
        Commands::Config { init } => {
            if init {
                commands::config::init(&config, cli.config.as_deref()).await?;
            } else {
                commands::config::show(&config, cli.config.as_deref(), cli.json)?;
            }
        }
    }

    Ok(())
}

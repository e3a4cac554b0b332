//! quarantinefs - Quarantine new files behind an inspection hook
//!
//! Usage:
//!   quarantinefs mount <target>     - Mount the overlay over a directory
//!   quarantinefs init               - Write a default configuration
//!   quarantinefs unmount <target>   - Unmount a leftover mount

use clap::{Parser, Subcommand};
use quarantinefs::{
    config::Config,
    inspect::{ApproveAll, CommandInspector},
    Engine, Error, Inspector, Result,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quarantinefs")]
#[command(author = "quarantinefs Contributors")]
#[command(version = "0.1.0")]
#[command(about = "FUSE overlay that holds new files until an inspector approves them")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/quarantinefs/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log every filesystem request
    #[arg(long)]
    debug_requests: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount the overlay over an existing directory
    Mount {
        /// Directory to cover
        target: PathBuf,

        /// Inspection program; overrides the configured one
        #[arg(long)]
        inspector: Option<PathBuf>,

        /// Arguments passed to the inspection program
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Unmount a mount left behind by a crashed process
    Unmount {
        /// Mount point to unmount
        target: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    // Setup logging
    let mut directives = if cli.verbose { "debug" } else { "info" }.to_string();
    if !cli.debug_requests {
        directives.push_str(",quarantinefs::request=off");
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.debug_requests)
        .init();

    // Expand ~ in config path
    let config_path = expand_tilde(&cli.config);

    // Run the command
    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> Result<()> {
    match command {
        Commands::Mount {
            target,
            inspector,
            args,
        } => cmd_mount(config_path, &target, inspector, args),

        Commands::Init { force } => cmd_init(config_path, force),

        Commands::Unmount { target } => cmd_unmount(&target),
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        )));
    }

    // Ensure config directory exists
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    Config::default().save(config_path)?;
    info!("Configuration saved to {:?}", config_path);
    Ok(())
}

fn cmd_mount(
    config_path: &Path,
    target: &Path,
    inspector: Option<PathBuf>,
    args: Vec<String>,
) -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        return Err(Error::Mount(
            "mounting requires root privileges".to_string(),
        ));
    }

    let mut config = Config::load_or_default(config_path)?;
    if let Some(program) = inspector {
        config.inspector.command = Some(program);
        config.inspector.args = args;
    }

    let inspector: Arc<dyn Inspector> = match CommandInspector::from_config(&config.inspector) {
        Some(command) => {
            info!("Inspecting new files with {:?}", config.inspector.command);
            Arc::new(command)
        }
        None => {
            warn!("No inspector configured; every file will be approved");
            Arc::new(ApproveAll)
        }
    };

    let runtime = tokio::runtime::Runtime::new().map_err(|e| Error::Internal(e.to_string()))?;
    let mut engine = Engine::init(config, inspector, runtime.handle().clone())?;

    engine.mount(target)?;
    let (result_tx, result_rx) = oneshot::channel();
    if let Err(e) = engine.serve(result_tx) {
        if let Err(close) = engine.close() {
            error!("Failed to close after serve error: {}", close);
        }
        return Err(e);
    }

    info!("Mounted at {:?}; press Ctrl-C to unmount", target);

    let served = runtime.block_on(async {
        tokio::select! {
            result = result_rx => match result {
                Ok(result) => result,
                Err(_) => Err(Error::Internal("serve thread exited without a result".to_string())),
            },
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Interrupted, unmounting");
                Ok::<(), Error>(())
            }
        }
    });

    let closed = engine.close();
    served?;
    closed
}

fn cmd_unmount(target: &Path) -> Result<()> {
    info!("Unmounting {:?}...", target);

    // Use fusermount/umount
    let output = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(target)
        .output()?;

    if output.status.success() {
        info!("Unmounted successfully");
        Ok(())
    } else {
        Err(Error::Unmount(format!(
            "{}: {}",
            target.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

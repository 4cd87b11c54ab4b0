//! Acqsync agent binary
//!
//! - `run`: watch every configured source until SIGINT/SIGTERM
//! - `scan`: one-shot listing of what a watcher would release
//! - `classify`: show which acquisition context files belong to
//! - `init-config`: write an example configuration

use acqsync::{Agent, AgentConfig};
use acqsync_channel::{PersistentChannel, SharedState};
use acqsync_context::{classify, TiltFormat};
use acqsync_logging::{init_logging, LogConfig};
use acqsync_protocol::paths::default_config_path;
use acqsync_scout::{FileWatcher, WatchConfig};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// How often the main thread checks for shutdown
const SUPERVISE_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "acqsync", about = "Acquisition data transfer agent")]
struct Cli {
    /// Enable verbose logging (debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch configured sources, transfer new files and report to the coordinator
    Run {
        /// Config file (default: ~/.acqsync/config.toml)
        #[arg(short, long, env = "ACQSYNC_CONFIG")]
        config: Option<PathBuf>,
    },

    /// List files a watcher would release from a directory right now
    Scan {
        /// Directory to scan
        path: PathBuf,

        /// Include dot-files and dot-directories
        #[arg(long)]
        hidden: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the acquisition context (and tilt fields) of each path
    Classify {
        paths: Vec<PathBuf>,

        /// Tilt filename convention: tomo or serialem
        #[arg(long, default_value = "tomo")]
        software: String,

        /// Tomo version (5.7, 5.11, 5.12)
        #[arg(long, default_value = "5.7")]
        tomo_version: String,
    },

    /// Write an example configuration file
    InitConfig {
        /// Where to write (default: ~/.acqsync/config.toml)
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _log_guard = match init_logging(LogConfig {
        app_name: "acqsync",
        verbose: cli.verbose,
        log_dir: None,
    }) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: failed to initialize logging: {:?}", e);
            None
        }
    };

    match run_command(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            eprintln!("{:?}", err);
            ExitCode::from(1)
        }
    }
}

fn run_command(command: Commands) -> Result<()> {
    match command {
        Commands::Run { config } => run_agent(config.unwrap_or_else(default_config_path)),
        Commands::Scan { path, hidden, json } => scan(path, hidden, json),
        Commands::Classify {
            paths,
            software,
            tomo_version,
        } => classify_paths(&paths, &software, &tomo_version),
        Commands::InitConfig { path, force } => {
            init_config(path.unwrap_or_else(default_config_path), force)
        }
    }
}

fn install_shutdown_handler() -> Result<Arc<AtomicBool>> {
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = shutdown_flag.clone();

    #[cfg(unix)]
    {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        std::thread::spawn(move || {
            if let Some(sig) = signals.forever().next() {
                info!("Received signal {}, initiating shutdown...", sig);
                shutdown_flag_handler.store(true, Ordering::SeqCst);
            }
        });
    }

    #[cfg(windows)]
    {
        ctrlc::set_handler(move || {
            info!("Received Ctrl+C, initiating shutdown...");
            shutdown_flag_handler.store(true, Ordering::SeqCst);
        })?;
    }

    Ok(shutdown_flag)
}

fn run_agent(config_path: PathBuf) -> Result<()> {
    let config = AgentConfig::load(&config_path)?;
    if config.sources.is_empty() {
        bail!("No sources configured in {}", config_path.display());
    }
    info!(config = %config_path.display(), sources = config.sources.len(), "Starting acqsync agent");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("acqsync-channel")
        .build()
        .context("Failed to start async runtime")?;

    let state = SharedState::new();
    let channel = match &config.coordinator {
        Some(coordinator) => {
            let _guard = runtime.enter();
            let channel = PersistentChannel::open(coordinator.channel_config()?, state.clone())?;
            channel.bind_state(&state);
            Some(channel)
        }
        None => {
            info!("No coordinator configured; running standalone");
            None
        }
    };

    let shutdown_flag = install_shutdown_handler()?;
    let agent = Agent::new(config, state).start()?;

    while !shutdown_flag.load(Ordering::SeqCst) && !agent.all_finished() {
        std::thread::sleep(SUPERVISE_INTERVAL);
    }

    info!("Stopping sources");
    agent.cancel();
    let joined = agent.join();

    if let Some(channel) = channel {
        runtime.block_on(channel.close())?;
    }

    for summary in joined? {
        info!(
            source = %summary.name,
            transferred = summary.transferred,
            unchanged = summary.unchanged,
            failed = summary.failed,
            completed_groups = summary.completions.len(),
            "Source stopped"
        );
    }
    Ok(())
}

fn scan(path: PathBuf, hidden: bool, json: bool) -> Result<()> {
    let mut config = WatchConfig::new(&path);
    config.include_hidden = hidden;
    let mut watcher = FileWatcher::new(config);
    let files = watcher
        .scan()
        .with_context(|| format!("Failed to scan {}", path.display()))?;

    if json {
        let listing: Vec<String> = files.iter().map(|p| p.display().to_string()).collect();
        println!("{}", serde_json::to_string_pretty(&listing)?);
    } else {
        for file in &files {
            println!("{}", file.display());
        }
        eprintln!("{} file(s)", files.len());
    }
    Ok(())
}

fn classify_paths(paths: &[PathBuf], software: &str, tomo_version: &str) -> Result<()> {
    let format = TiltFormat::for_software(software, tomo_version)?;
    for path in paths {
        let kind = classify(path)
            .map(|k| k.to_string())
            .unwrap_or_else(|| "-".to_string());
        match format.parse(path) {
            Some(tilt) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                println!(
                    "{}\t{}\tgroup={} angle={}",
                    path.display(),
                    kind,
                    tilt.group_id(&name),
                    tilt.angle
                );
            }
            None => println!("{}\t{}", path.display(), kind),
        }
    }
    Ok(())
}

fn init_config(path: PathBuf, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    AgentConfig::example().save(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

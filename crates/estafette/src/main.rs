//! Estafette agent launcher.
//!
//! Wires configuration, logging, the durable queue, the uploader and the
//! update checker together, and tears everything down on SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

use estafette::agent::Agent;
use estafette::cancel::CancellationToken;
use estafette::config::EstafetteConfig;
use estafette::update::UpdateChecker;
use estafette::uploader::{NoopUploader, SftpUploader, Uploader};
use estafette_queue::FileQueue;

#[derive(Parser, Debug)]
#[command(name = "estafette", version, about = "Journal collection and delivery agent")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, env = "ESTAFETTE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Mirror the log-file filter on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the agent loop (the default)
    Run,
    /// Write a configuration file with default values and exit
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print queue status and exit
    Status,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config_path = cli
        .config
        .unwrap_or_else(|| estafette_logging::estafette_home().join("config.toml"));

    if let Some(Command::InitConfig { force }) = &cli.command {
        return init_config(&config_path, *force);
    }

    let _log_guard = estafette_logging::init_logging(estafette_logging::LogConfig {
        app_name: "estafette",
        verbose: cli.verbose,
    })?;

    let config = if config_path.exists() {
        EstafetteConfig::load(&config_path)?
    } else {
        info!(path = %config_path.display(), "no config file, using defaults");
        EstafetteConfig::default()
    };

    match cli.command {
        Some(Command::Status) => status(&config),
        Some(Command::Run) | None => serve(config),
        Some(Command::InitConfig { .. }) => unreachable!("handled above"),
    }
}

fn init_config(path: &PathBuf, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "config file {} already exists (use --force to overwrite)",
            path.display()
        );
    }
    EstafetteConfig::default().save(path)?;
    println!("wrote {}", path.display());
    Ok(())
}

fn status(config: &EstafetteConfig) -> Result<()> {
    let queue = FileQueue::open(&config.agent.queue_path)?;
    let pending = queue.count_pending();
    println!("queue:   {}", queue.root().display());
    println!("pending: {pending}");
    if let Some(head) = queue.peek() {
        let meta = queue.meta(&head);
        let bank = meta.get("bank").map(String::as_str).unwrap_or("-");
        let gab = meta.get("gab").map(String::as_str).unwrap_or("-");
        println!("head:    {head} (bank={bank}, gab={gab})");
    }
    Ok(())
}

fn serve(config: EstafetteConfig) -> Result<()> {
    let queue = Arc::new(
        FileQueue::open(&config.agent.queue_path)
            .with_context(|| format!("failed to open queue at {}", config.agent.queue_path.display()))?,
    );

    let uploader: Box<dyn Uploader> = if config.sftp.host.is_empty() {
        warn!("sftp host not configured, uploads will be simulated");
        Box::new(NoopUploader)
    } else {
        Box::new(SftpUploader::new(config.sftp.clone()))
    };

    let cancel = CancellationToken::new();
    let (stop_tx, stop_rx) = mpsc::channel();
    let (update_stop_tx, update_stop_rx) = mpsc::channel();
    install_signal_handler(cancel.clone(), vec![stop_tx, update_stop_tx])?;

    let checker = UpdateChecker::new(config.update.clone())?;
    let update_thread = thread::Builder::new()
        .name("update-checker".to_string())
        .spawn(move || checker.run(&update_stop_rx))
        .context("failed to spawn update checker thread")?;

    let agent = Agent::new(config, Arc::clone(&queue), uploader, cancel);
    let result = agent.run(stop_rx);

    info!("waiting for update checker to stop");
    let _ = update_thread.join();
    result
}

#[cfg(unix)]
fn install_signal_handler(
    cancel: CancellationToken,
    stop_channels: Vec<mpsc::Sender<()>>,
) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("failed to install signal handler")?;
    thread::Builder::new()
        .name("signal-handler".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!(signal, "shutdown requested");
                cancel.cancel();
                for tx in &stop_channels {
                    let _ = tx.send(());
                }
            }
        })
        .context("failed to spawn signal thread")?;
    Ok(())
}

#[cfg(windows)]
fn install_signal_handler(
    cancel: CancellationToken,
    stop_channels: Vec<mpsc::Sender<()>>,
) -> Result<()> {
    ctrlc::set_handler(move || {
        info!("shutdown requested");
        cancel.cancel();
        for tx in &stop_channels {
            let _ = tx.send(());
        }
    })
    .context("failed to install ctrl-c handler")
}

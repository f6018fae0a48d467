//! `relayd` - receive loops for every account plus the local broadcast socket.
//!
//! ```bash
//! relayd start                          # foreground, logs to stderr
//! relayd --config ~/relayd.toml start -d
//! relayd status
//! relayd stop
//! ```
//!
//! The PID file and the detached log live under `<state_dir>/relay`
//! (`dirs::state_dir`), independent of the account state directory.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{self, ExitCode};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use relayd::broadcast::Broadcaster;
use relayd::config::Config;
use relayd::receiver::{LoopContext, DEFAULT_LINK_CHECK_INTERVAL};
use relayd::registry::SessionRegistry;
use relayd::server::DaemonServer;
use relayd::spool::SpoolSessionFactory;
use relayd::supervisor::Supervisor;

/// How long `stop` waits for the daemon to exit after SIGTERM.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "relayd", version, about = "Fans inbound account messages out to local clients")]
struct Args {
    /// Config file (default: <config_dir>/relayd/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon
    Start {
        /// Detach from the terminal and log to a file
        #[arg(short = 'd', long)]
        daemon: bool,
    },
    /// Send SIGTERM to the running daemon and wait for it to exit
    Stop,
    /// Report whether the daemon is running
    Status,
}

// ============================================================================
// Runtime Files
// ============================================================================

/// PID and log file locations for one daemon instance.
struct RuntimeFiles {
    dir: PathBuf,
}

impl RuntimeFiles {
    fn locate() -> Self {
        let base = dirs::state_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            dir: base.join("relay"),
        }
    }

    fn pid_path(&self) -> PathBuf {
        self.dir.join("relayd.pid")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("relayd.log")
    }

    /// PID of a live daemon. A PID file left behind by a dead process is
    /// removed.
    fn live_pid(&self) -> Option<u32> {
        let pid = fs::read_to_string(self.pid_path())
            .ok()?
            .trim()
            .parse::<u32>()
            .ok()?;
        if process_alive(pid) {
            Some(pid)
        } else {
            self.clear_pid();
            None
        }
    }

    fn record_pid(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        fs::write(self.pid_path(), process::id().to_string()).context("Failed to write PID file")
    }

    fn clear_pid(&self) {
        let _ = fs::remove_file(self.pid_path());
    }
}

fn to_pid_t(pid: u32) -> Result<libc::pid_t> {
    libc::pid_t::try_from(pid).map_err(|_| anyhow!("PID {pid} out of range"))
}

fn process_alive(pid: u32) -> bool {
    let Ok(pid) = to_pid_t(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check.
    unsafe { libc::kill(pid, 0) == 0 }
}

fn send_sigterm(pid: u32) -> Result<()> {
    let raw = to_pid_t(pid)?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(raw, libc::SIGTERM) } != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("Failed to signal process {pid}"));
    }
    Ok(())
}

/// Polls until `pid` is gone or `timeout` elapses. Returns whether it exited.
fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !process_alive(pid) {
            return true;
        }
        thread::sleep(Duration::from_millis(100));
    }
    !process_alive(pid)
}

// ============================================================================
// Commands
// ============================================================================

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    let files = RuntimeFiles::locate();

    match args.command.unwrap_or(Command::Start { daemon: false }) {
        Command::Start { daemon } => start(&files, config, daemon),
        Command::Stop => stop(&files),
        Command::Status => Ok(status(&files, &config)),
    }
}

fn start(files: &RuntimeFiles, config: Config, daemon: bool) -> Result<ExitCode> {
    if let Some(pid) = files.live_pid() {
        eprintln!("relayd is already running (PID {pid}); run 'relayd stop' first.");
        return Ok(ExitCode::FAILURE);
    }

    if daemon {
        detach(&files.log_path())?;
    }
    files.record_pid()?;
    let outcome = serve(config);
    files.clear_pid();

    outcome.map(|()| ExitCode::SUCCESS)
}

fn stop(files: &RuntimeFiles) -> Result<ExitCode> {
    let Some(pid) = files.live_pid() else {
        println!("relayd is not running.");
        return Ok(ExitCode::SUCCESS);
    };

    println!("Stopping relayd (PID {pid})...");
    send_sigterm(pid)?;
    if wait_for_exit(pid, STOP_TIMEOUT) {
        println!("relayd stopped.");
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("relayd still running after {}s.", STOP_TIMEOUT.as_secs());
        Ok(ExitCode::FAILURE)
    }
}

fn status(files: &RuntimeFiles, config: &Config) -> ExitCode {
    let Some(pid) = files.live_pid() else {
        println!("relayd is not running.");
        return ExitCode::FAILURE;
    };

    println!("relayd is running (PID {pid})");
    let socket_state = if config.socket_path.exists() {
        "listening"
    } else {
        "missing"
    };
    println!("  socket:    {} ({socket_state})", config.socket_path.display());
    println!("  state dir: {}", config.state_dir.display());
    ExitCode::SUCCESS
}

/// Forks into the background with stdout and stderr redirected to `log_path`.
fn detach(log_path: &Path) -> Result<()> {
    if let Some(dir) = log_path.parent() {
        fs::create_dir_all(dir).context("Failed to create log directory")?;
    }
    let log = File::create(log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;
    let log_err = log.try_clone().context("Failed to duplicate log file handle")?;

    daemonize::Daemonize::new()
        .working_directory("/")
        .stdout(log)
        .stderr(log_err)
        .start()
        .context("Failed to daemonize")
}

// ============================================================================
// Daemon
// ============================================================================

fn init_logging() -> Result<()> {
    let mut filter = EnvFilter::from_default_env();
    for directive in ["relayd=info", "relay_core=info", "relay_protocol=info"] {
        filter = filter.add_directive(directive.parse()?);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

/// Supervisor over spool-backed sessions in the configured state directory.
fn build_supervisor(config: &Config) -> Arc<Supervisor> {
    Arc::new(Supervisor::new(LoopContext {
        state_dir: config.state_dir.clone(),
        factory: Arc::new(SpoolSessionFactory::new()),
        registry: SessionRegistry::shared(),
        broadcaster: Arc::new(Broadcaster::new()),
        retry: config.retry.policy(),
        link_check_interval: DEFAULT_LINK_CHECK_INTERVAL,
    }))
}

/// Cancels `token` on SIGTERM or SIGINT.
fn cancel_on_signal(token: CancellationToken) -> Result<()> {
    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut interrupt = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::spawn(async move {
        let name = tokio::select! {
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "SIGINT",
        };
        info!(signal = name, "Shutting down");
        token.cancel();
    });
    Ok(())
}

#[tokio::main]
async fn serve(config: Config) -> Result<()> {
    init_logging()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        state_dir = %config.state_dir.display(),
        "relayd starting"
    );

    fs::create_dir_all(&config.state_dir).with_context(|| {
        format!("Failed to create state directory {}", config.state_dir.display())
    })?;

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone())?;

    let supervisor = build_supervisor(&config);
    let accounts = config.all_accounts();
    if accounts.is_empty() {
        warn!("No accounts found; waiting for add_account requests");
    }
    let started = supervisor.spawn_all(accounts);
    info!(started, "Receive loops started");
    let _reaper = supervisor.spawn_reaper(cancel.clone());

    let server = DaemonServer::new(&config.socket_path, Arc::clone(&supervisor), cancel);
    server.run().await.inspect_err(|e| error!(error = %e, "Server failed"))?;

    // Loop threads are not joined; they end with the process.
    info!(
        running = supervisor.running_accounts().len(),
        "relayd stopped"
    );
    Ok(())
}

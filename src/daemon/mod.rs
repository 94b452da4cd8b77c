//! Daemon supervisor: process lifecycle, the liveness marker, and graceful
//! shutdown of the scheduler loop, gateway listener, and in-flight
//! executions.

pub(crate) mod scheduler;

use crate::config::{Config, PathsConfig};
use crate::executor::Executor;
use crate::gateway::GatewayListener;
use crate::jobs::JobStore;
use crate::output::Router;
use crate::util::process_alive;
use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// How long `stop` lets in-flight executions finish before their
/// subprocesses are killed and reported as cancelled.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(20);

// ─── Liveness marker ─────────────────────────────────────────────────────────

/// What the liveness marker says about the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running(u32),
    /// Marker exists but the recorded process is dead. Treated as
    /// not-running; callers may clear it.
    Stale(u32),
    Stopped,
}

pub fn probe(paths: &PathsConfig) -> Result<Liveness> {
    let pid_path = paths.pid_file();
    if !pid_path.exists() {
        return Ok(Liveness::Stopped);
    }

    let content = fs::read_to_string(&pid_path)
        .with_context(|| format!("failed reading pid file: {}", pid_path.display()))?;
    let pid: u32 = content
        .trim()
        .parse()
        .with_context(|| format!("invalid pid in {}", pid_path.display()))?;

    if process_alive(pid) {
        Ok(Liveness::Running(pid))
    } else {
        Ok(Liveness::Stale(pid))
    }
}

pub fn write_marker(paths: &PathsConfig) -> Result<()> {
    let pid_path = paths.pid_file();
    if let Some(parent) = pid_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&pid_path, std::process::id().to_string())
        .with_context(|| format!("failed writing pid file: {}", pid_path.display()))
}

pub fn remove_marker(paths: &PathsConfig) -> Result<()> {
    let pid_path = paths.pid_file();
    if pid_path.exists() {
        fs::remove_file(&pid_path)
            .with_context(|| format!("failed removing pid file: {}", pid_path.display()))?;
    }
    Ok(())
}

// ─── External stop ───────────────────────────────────────────────────────────

/// Ask a running daemon to shut down and wait for it to exit. The wait
/// budget exceeds the daemon's own grace period so a busy shutdown is not
/// misreported as a hang.
pub fn stop_daemon(paths: &PathsConfig, pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;
        let pid = i32::try_from(pid).context("pid out of range")?;
        signal::kill(Pid::from_raw(pid), Signal::SIGTERM)
            .context("failed to send SIGTERM to daemon")?;
    }
    #[cfg(not(unix))]
    {
        anyhow::bail!("stopping the daemon is only supported on unix; kill process {pid} manually");
    }

    let deadline = std::time::Instant::now() + SHUTDOWN_GRACE + Duration::from_secs(10);
    while std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(100));
        if !matches!(probe(paths)?, Liveness::Running(_)) {
            remove_marker(paths)?;
            return Ok(());
        }
    }

    anyhow::bail!("daemon (pid {pid}) did not stop within the shutdown budget")
}

// ─── Background start ────────────────────────────────────────────────────────

/// Re-exec this binary detached with `start --foreground`, stdout/stderr
/// redirected into the logs directory.
pub fn spawn_background(paths: &PathsConfig, with_gateway: bool) -> Result<u32> {
    let logs_dir = paths.logs_dir();
    fs::create_dir_all(&logs_dir)?;
    let stdout = fs::File::create(logs_dir.join("nocturne.out"))?;
    let stderr = fs::File::create(logs_dir.join("nocturne.err"))?;

    let exe = std::env::current_exe().context("failed to locate own executable")?;
    let mut command = std::process::Command::new(exe);
    command.arg("start").arg("--foreground");
    if with_gateway {
        command.arg("--with-gateway");
    }
    command
        .stdin(std::process::Stdio::null())
        .stdout(stdout)
        .stderr(stderr);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let child = command.spawn().context("failed to spawn daemon process")?;
    Ok(child.id())
}

// ─── Foreground run ──────────────────────────────────────────────────────────

/// Run the daemon in this process until a shutdown signal arrives.
/// Fatal paths: a live marker already exists, or the store fails to load.
pub async fn run(config: Config, with_gateway: bool) -> Result<()> {
    let paths = config.paths.clone();

    match probe(&paths)? {
        Liveness::Running(pid) => {
            anyhow::bail!("daemon is already running (pid {pid})");
        }
        Liveness::Stale(pid) => {
            tracing::warn!(pid, "clearing stale liveness marker");
            remove_marker(&paths)?;
        }
        Liveness::Stopped => {}
    }

    // Startup persistence failures are loud and fatal.
    let store = Arc::new(JobStore::open(&paths)?);
    fs::create_dir_all(paths.output_dir())?;
    write_marker(&paths)?;

    let executor = Arc::new(Executor::new(&config.defaults));
    let router = Arc::new(Router::new(&config));

    let cancel = CancellationToken::new();
    let kill = CancellationToken::new();
    let tracker = TaskTracker::new();

    let ctx = Arc::new(scheduler::SchedulerCtx {
        store,
        executor: Arc::clone(&executor),
        router: Arc::clone(&router),
        defaults: config.defaults.clone(),
        started_at: Utc::now(),
    });
    let scheduler_handle = tokio::spawn(scheduler::run(
        ctx,
        cancel.clone(),
        kill.clone(),
        tracker.clone(),
    ));

    let gateway_handle = if with_gateway {
        match GatewayListener::new(config.gateway.clone(), executor, router) {
            Ok(listener) => {
                let cancel = cancel.clone();
                let kill = kill.clone();
                let tracker = tracker.clone();
                Some(tokio::spawn(async move {
                    if let Err(error) = listener.run(cancel, kill, tracker).await {
                        tracing::error!(%error, "gateway listener failed");
                    }
                }))
            }
            Err(error) => {
                tracing::warn!(%error, "gateway not started");
                None
            }
        }
    } else {
        None
    };

    tracing::info!(pid = std::process::id(), "daemon started");
    wait_for_shutdown_signal().await;
    tracing::info!("shutdown requested");

    cancel.cancel();
    let _ = scheduler_handle.await;
    if let Some(handle) = gateway_handle {
        let _ = handle.await;
    }

    shutdown_executions(&tracker, &kill, SHUTDOWN_GRACE).await;
    remove_marker(&paths)?;
    tracing::info!("daemon stopped");
    Ok(())
}

/// Wait for in-flight executions: bounded grace first, then force-cancel
/// whatever is left. Only after this returns may the liveness marker be
/// removed.
async fn shutdown_executions(tracker: &TaskTracker, kill: &CancellationToken, grace: Duration) {
    tracker.close();
    if tracker.is_empty() {
        return;
    }

    tracing::info!(in_flight = tracker.len(), "waiting for in-flight executions");
    if tokio::time::timeout(grace, tracker.wait()).await.is_err() {
        tracing::warn!(
            remaining = tracker.len(),
            "grace period elapsed, cancelling remaining executions"
        );
        kill.cancel();
        tracker.wait().await;
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(error) => {
                tracing::error!(%error, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

//! Per-command logic behind the CLI surface.
//!
//! Mutating job commands write `jobs.toml` atomically from this process; a
//! running daemon picks the change up on its next tick.

use crate::config::Config;
use crate::daemon::{self, Liveness};
use crate::executor::{Executor, Invocation};
use crate::gateway::api::TelegramApi;
use crate::gateway::GatewayListener;
use crate::jobs::{Job, JobStore, ScheduleKind};
use crate::output::Router;
use crate::schedule;
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

// ─── Daemon lifecycle ────────────────────────────────────────────────────────

pub async fn start(config: Config, with_gateway: bool, foreground: bool) -> Result<()> {
    if foreground {
        return daemon::run(config, with_gateway).await;
    }

    match daemon::probe(&config.paths)? {
        Liveness::Running(pid) => {
            anyhow::bail!("daemon is already running (pid {pid})");
        }
        Liveness::Stale(pid) => {
            println!("clearing stale pid file (pid {pid})");
            daemon::remove_marker(&config.paths)?;
        }
        Liveness::Stopped => {}
    }

    let pid = daemon::spawn_background(&config.paths, with_gateway)?;
    println!("daemon started (pid {pid})");
    if with_gateway {
        println!("gateway listener enabled");
    }
    Ok(())
}

pub fn stop(config: &Config) -> Result<()> {
    match daemon::probe(&config.paths)? {
        Liveness::Running(pid) => {
            println!("stopping daemon (pid {pid})...");
            daemon::stop_daemon(&config.paths, pid)?;
            println!("daemon stopped");
            Ok(())
        }
        Liveness::Stale(pid) => {
            daemon::remove_marker(&config.paths)?;
            println!("daemon was not running; removed stale pid file (pid {pid})");
            Ok(())
        }
        Liveness::Stopped => {
            println!("daemon is not running");
            Ok(())
        }
    }
}

pub async fn status(config: &Config) -> Result<()> {
    match daemon::probe(&config.paths)? {
        Liveness::Running(pid) => println!("daemon:  running (pid {pid})"),
        Liveness::Stale(pid) => println!("daemon:  stopped (stale pid file, pid {pid})"),
        Liveness::Stopped => println!("daemon:  stopped"),
    }

    if config.gateway.is_available() {
        println!(
            "gateway: enabled ({} whitelisted chat{})",
            config.gateway.allowed_chat_ids.len(),
            if config.gateway.allowed_chat_ids.len() == 1 { "" } else { "s" },
        );
    } else {
        println!("gateway: disabled");
    }

    let store = JobStore::open(&config.paths)?;
    let views = store.list().await;
    if views.is_empty() {
        println!("\nno jobs defined");
        return Ok(());
    }

    println!(
        "\n{:<20} {:<8} {:<20} {:<20} {:<14} {}",
        "ID", "ENABLED", "SCHEDULE", "LAST RUN", "LAST STATUS", "NEXT DUE"
    );
    let now = Utc::now();
    for view in views {
        let last_run = view
            .state
            .last_run_at
            .map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string());
        let last_status = if view.running {
            "running".to_string()
        } else {
            view.state.last_status.clone().unwrap_or_else(|| "-".into())
        };
        println!(
            "{:<20} {:<8} {:<20} {:<20} {:<14} {}",
            view.job.id,
            if view.job.enabled { "yes" } else { "no" },
            view.job.schedule_display(),
            last_run,
            last_status,
            next_due_display(&view.job, view.state.consumed, now),
        );
    }
    Ok(())
}

fn next_due_display(job: &Job, consumed: bool, now: chrono::DateTime<Utc>) -> String {
    if !job.enabled {
        return "-".into();
    }
    match job.schedule_kind {
        ScheduleKind::Recurring => job
            .schedule
            .as_deref()
            .and_then(|expr| schedule::next_due_recurring(expr, now).ok().flatten())
            .map_or_else(|| "-".into(), |t| t.format("%Y-%m-%d %H:%M").to_string()),
        ScheduleKind::Once => {
            if consumed {
                "done".into()
            } else {
                job.run_at.clone().unwrap_or_else(|| "-".into())
            }
        }
    }
}

pub fn init(config: &Config) -> Result<()> {
    let paths = &config.paths;
    std::fs::create_dir_all(paths.base_dir())?;
    std::fs::create_dir_all(paths.output_dir())?;
    std::fs::create_dir_all(paths.logs_dir())?;

    let config_file = paths.config_file();
    if config_file.exists() {
        println!("configuration already exists: {}", config_file.display());
    } else {
        config.save()?;
        println!("wrote default configuration: {}", config_file.display());
    }
    println!("state directory ready: {}", paths.base_dir().display());
    Ok(())
}

// ─── Job management ──────────────────────────────────────────────────────────

pub async fn job_add(config: &Config, job: Job) -> Result<()> {
    let store = JobStore::open(&config.paths)?;
    let id = job.id.clone();
    let schedule = job.schedule_display();
    store.add(job).await?;
    println!("added job '{id}' ({schedule})");
    Ok(())
}

/// Read one job definition as a bare TOML document from stdin.
pub async fn job_add_stdin(config: &Config) -> Result<()> {
    let input =
        std::io::read_to_string(std::io::stdin()).context("failed reading job TOML from stdin")?;
    let job: Job = toml::from_str(&input).context("stdin was not a valid job definition")?;
    job_add(config, job).await
}

pub async fn job_list(config: &Config) -> Result<()> {
    status(config).await
}

pub async fn job_remove(config: &Config, id: &str) -> Result<()> {
    let store = JobStore::open(&config.paths)?;
    store.remove(id).await?;
    println!("removed job '{id}'");
    Ok(())
}

pub async fn job_set_enabled(config: &Config, id: &str, enabled: bool) -> Result<()> {
    let store = JobStore::open(&config.paths)?;
    store.set_enabled(id, enabled).await?;
    println!("job '{id}' {}", if enabled { "enabled" } else { "disabled" });
    Ok(())
}

/// Execute one job right now, in this process, with full result recording
/// and routing. Once jobs are consumed by a manual run like any other.
pub async fn job_run(config: &Config, id: &str) -> Result<()> {
    let store = JobStore::open(&config.paths)?;
    let job = store
        .get(id)
        .await
        .with_context(|| format!("job '{id}' not found"))?;

    store.mark_running(id).await?;
    let executor = Executor::new(&config.defaults);
    let router = Router::new(config);
    let invocation = Invocation::for_job(&job, &config.defaults);

    println!("running job '{id}' (model {})...", invocation.model);
    let result = executor.execute(&invocation, &CancellationToken::new()).await;
    store.mark_finished(id, &result).await?;

    for outcome in router.route(&result, &job.output_destinations).await {
        match outcome.delivery {
            Ok(delivered) => println!("delivered to {delivered:?}"),
            Err(error) => println!("delivery to {} failed: {error}", outcome.destination),
        }
    }

    println!("status: {}", result.status.label());
    if let Some(cost) = result.cost_usd {
        println!("cost:   ${cost:.4}");
    }
    if !result.status.is_success() {
        anyhow::bail!("job '{id}' finished with status {}", result.status.label());
    }
    Ok(())
}

// ─── Gateway ─────────────────────────────────────────────────────────────────

/// Run only the gateway listener, in the foreground, until interrupted.
pub async fn gateway_start(config: Config) -> Result<()> {
    let executor = Arc::new(Executor::new(&config.defaults));
    let router = Arc::new(Router::new(&config));
    let listener = GatewayListener::new(config.gateway, executor, router)?;

    let cancel = CancellationToken::new();
    let kill = CancellationToken::new();
    let tracker = TaskTracker::new();

    println!("gateway listening (ctrl-c to stop)");
    tokio::select! {
        result = listener.run(cancel.clone(), kill.clone(), tracker.clone()) => result?,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
        }
    }

    tracker.close();
    tracker.wait().await;
    println!("gateway stopped");
    Ok(())
}

pub async fn gateway_status(config: &Config) -> Result<()> {
    let gateway = &config.gateway;
    if !gateway.is_available() {
        println!("gateway: disabled (set gateway.enabled and gateway.bot_token)");
        return Ok(());
    }

    println!("gateway: enabled");
    println!("whitelisted chats: {:?}", gateway.allowed_chat_ids);
    println!("model: {}", gateway.default_model);
    println!(
        "limits: {} turns, ${:.2}",
        gateway.max_turns, gateway.max_budget_usd
    );

    let api = TelegramApi::new(&gateway.bot_token);
    if api.health_check().await {
        println!("bot API: reachable");
    } else {
        println!("bot API: unreachable (check the token and network)");
    }
    Ok(())
}

//! The time-driven controller: a fixed-interval tick that asks the store
//! for due jobs and dispatches each one on its own task. The loop itself
//! never awaits an execution; completion is handled by a continuation
//! that records the outcome and routes it.

use crate::config::Defaults;
use crate::error::StoreError;
use crate::executor::{Executor, Invocation};
use crate::jobs::JobStore;
use crate::output::Router;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const TICK_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) struct SchedulerCtx {
    pub store: Arc<JobStore>,
    pub executor: Arc<Executor>,
    pub router: Arc<Router>,
    pub defaults: Defaults,
    pub started_at: DateTime<Utc>,
}

pub(crate) async fn run(
    ctx: Arc<SchedulerCtx>,
    cancel: CancellationToken,
    kill: CancellationToken,
    tracker: TaskTracker,
) {
    tracing::info!("scheduler started, ticking every {}s", TICK_INTERVAL.as_secs());
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::info!("scheduler stopping, no new dispatches");
                return;
            }
            _ = interval.tick() => {}
        }
        tick(&ctx, &kill, &tracker).await;
    }
}

/// One scheduling pass: pick up external mutations, claim due jobs, and
/// dispatch them. Factored out of the loop so tests can drive single
/// passes deterministically.
pub(crate) async fn tick(ctx: &SchedulerCtx, kill: &CancellationToken, tracker: &TaskTracker) {
    if let Err(error) = ctx.store.reload_if_changed().await {
        // Runtime persistence trouble is logged, never fatal.
        tracing::warn!(%error, "failed to reload job definitions");
        return;
    }

    let now = Utc::now();
    for job in ctx.store.due_candidates(now, ctx.started_at).await {
        match ctx.store.mark_running(&job.id).await {
            Ok(()) => {}
            Err(StoreError::AlreadyRunning(_)) => {
                // Expected collision; the previous run is still in flight.
                tracing::debug!(job = %job.id, "skipping, already running");
                continue;
            }
            Err(error) => {
                tracing::warn!(job = %job.id, %error, "failed to claim job");
                continue;
            }
        }

        tracing::info!(job = %job.id, name = %job.name, "executing job");
        let invocation = Invocation::for_job(&job, &ctx.defaults);
        let store = Arc::clone(&ctx.store);
        let executor = Arc::clone(&ctx.executor);
        let router = Arc::clone(&ctx.router);
        let kill = kill.clone();

        tracker.spawn(async move {
            let result = executor.execute(&invocation, &kill).await;

            if let Err(error) = store.mark_finished(&job.id, &result).await {
                tracing::warn!(job = %job.id, %error, "failed to record run outcome");
            }

            let outcomes = router.route(&result, &job.output_destinations).await;
            let failed = outcomes.iter().filter(|o| o.delivery.is_err()).count();
            if failed > 0 {
                tracing::warn!(
                    job = %job.id,
                    failed,
                    total = outcomes.len(),
                    "some deliveries failed"
                );
            }
        });
    }
}

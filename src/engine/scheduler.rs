//! Background flush scheduler
//!
//! Optional helper for callers that want the engine to decide its own flush
//! cadence: flushes when the pending-event threshold is reached, or when the
//! flush interval has elapsed with deltas still waiting. Flush cycles block,
//! so they run on tokio's blocking pool.

use super::config::EngineConfig;
use super::flush::FlushError;
use super::session::ProfileSession;
use super::store::ProfileStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

/// Counters reported when the scheduler stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub flushes: u64,
    pub failures: u64,
    pub coalesced: u64,
    pub queries: u64,
}

/// Flush scheduler task - runs until `shutdown` turns true or its sender is
/// dropped, then performs a final flush of whatever is pending.
///
/// Failed flushes are logged and retried on a later tick; the buffer keeps the
/// deltas of a rolled-back cycle.
pub async fn flush_scheduler_task<S>(
    session: Arc<ProfileSession<S>>,
    config: EngineConfig,
    mut shutdown: watch::Receiver<bool>,
) -> SchedulerStats
where
    S: ProfileStore + 'static,
{
    log::info!(
        "⏰ Starting flush scheduler (interval: {}ms, threshold: {} events)",
        config.flush_interval_ms,
        config.flush_threshold
    );

    let mut timer = interval(config.poll_interval());
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut stats = SchedulerStats::default();
    let mut last_flush = Instant::now();

    loop {
        tokio::select! {
            _ = timer.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let pending = session.pending_events();
        if pending == 0 {
            continue;
        }

        let due = session.should_flush(config.flush_threshold)
            || last_flush.elapsed() >= config.flush_interval();
        if !due {
            continue;
        }

        if run_flush(&session, &mut stats).await {
            last_flush = Instant::now();
        }
    }

    if session.pending_events() > 0 {
        log::info!("🔄 Performing final flush...");
        run_flush(&session, &mut stats).await;
    }

    log::info!(
        "✅ Flush scheduler stopped: {} flushes, {} failures, {} coalesced",
        stats.flushes,
        stats.failures,
        stats.coalesced
    );

    stats
}

/// Returns true when a cycle committed.
async fn run_flush<S>(session: &Arc<ProfileSession<S>>, stats: &mut SchedulerStats) -> bool
where
    S: ProfileStore + 'static,
{
    let session = Arc::clone(session);

    match tokio::task::spawn_blocking(move || session.flush()).await {
        Ok(Ok(report)) => {
            stats.flushes += 1;
            stats.queries += report.queries as u64;
            log::debug!(
                "✅ Scheduled flush: {} queries in {}ms",
                report.queries,
                report.elapsed.as_millis()
            );
            true
        }
        Ok(Err(FlushError::InProgress)) => {
            stats.coalesced += 1;
            false
        }
        Ok(Err(e)) => {
            stats.failures += 1;
            log::error!("❌ Scheduled flush failed, retrying next tick: {}", e);
            false
        }
        Err(e) => {
            stats.failures += 1;
            log::error!("❌ Flush task did not complete: {}", e);
            false
        }
    }
}

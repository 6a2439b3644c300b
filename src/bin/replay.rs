//! Replay - feed recorded profiling events into a session
//!
//! Reads newline-delimited JSON events from a file (or stdin), records them
//! into a session configured from the environment while the flush scheduler
//! runs, performs a final flush and prints the live-session totals as JSON.
//!
//! Usage:
//!   proftally-replay [EVENTS.jsonl]
//!
//! Environment variables:
//!   PROFTALLY_DB_PATH - SQLite database path (default: in-memory)
//!   PROFTALLY_CREATE_NEW - Replace an existing database (default: true)
//!   PROFTALLY_FLUSH_INTERVAL_MS - Flush interval (default: 1000)
//!   PROFTALLY_FLUSH_THRESHOLD - Pending events forcing a flush (default: 10000)
//!   PROFTALLY_POLL_INTERVAL_MS - Scheduler tick (default: 100)

use dotenv::dotenv;
use log::{error, info, warn};
use proftally::engine::{
    flush_scheduler_task, AllocationRow, CallRow, EngineConfig, ProfileEvent, SampleRow,
    SchedulerStats, LIVE_SNAPSHOT,
};
use serde::Serialize;
use std::env;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::watch;

#[derive(Debug, Default, Serialize)]
struct ReplaySummary {
    events: u64,
    rejected: u64,
    malformed: u64,
    scheduler: SchedulerStats,
    calls: Vec<CallRow>,
    samples: Vec<SampleRow>,
    allocations: Vec<AllocationRow>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let config = EngineConfig::from_env();

    info!("🚀 Starting proftally replay");
    info!(
        "   ├─ Database: {}",
        config.db_path.as_deref().unwrap_or("memory")
    );
    info!("   ├─ Flush interval: {}ms", config.flush_interval_ms);
    info!("   └─ Flush threshold: {} events", config.flush_threshold);

    let session = Arc::new(config.open_session()?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = tokio::spawn(flush_scheduler_task(
        Arc::clone(&session),
        config.clone(),
        shutdown_rx,
    ));

    let mut summary = ReplaySummary::default();
    match env::args().nth(1) {
        Some(path) => {
            info!("📖 Reading events from {}", path);
            let file = tokio::fs::File::open(&path).await?;
            replay_lines(BufReader::new(file), &session, &mut summary).await?;
        }
        None => {
            info!("📖 Reading events from stdin");
            replay_lines(BufReader::new(tokio::io::stdin()), &session, &mut summary).await?;
        }
    }

    shutdown_tx.send(true)?;
    summary.scheduler = scheduler.await?;

    let session = Arc::try_unwrap(session)
        .map_err(|_| "session still shared after scheduler shutdown")?;
    let store = match session.close() {
        Ok(store) => store,
        Err((e, _session)) => {
            error!("❌ Final flush failed: {}", e);
            return Err(e.into());
        }
    };

    summary.calls = store.call_rows(LIVE_SNAPSHOT)?;
    summary.samples = store.sample_rows(LIVE_SNAPSHOT)?;
    summary.allocations = store.allocation_rows()?;

    info!(
        "✅ Replayed {} events ({} rejected, {} malformed)",
        summary.events, summary.rejected, summary.malformed
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}

async fn replay_lines<R, S>(
    reader: R,
    session: &proftally::ProfileSession<S>,
    summary: &mut ReplaySummary,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    S: proftally::ProfileStore,
{
    let mut lines = reader.lines();
    let mut line_no = 0u64;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let event: ProfileEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                warn!("⚠️  Skipping malformed event on line {}: {}", line_no, e);
                summary.malformed += 1;
                continue;
            }
        };

        match session.record(&event) {
            Ok(()) => summary.events += 1,
            Err(e) => {
                warn!("⚠️  Rejected event on line {}: {}", line_no, e);
                summary.rejected += 1;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proftally::engine::SqliteStore;
    use proftally::ProfileSession;

    #[tokio::test]
    async fn test_replay_lines_counts_outcomes() {
        let input = concat!(
            "{\"type\":\"sample\",\"thread_id\":1,\"function_id\":42,\"time\":100}\n",
            "\n",
            "{\"type\":\"sample\",\"thread_id\":1,\"function_id\":42,\"time\":50}\n",
            "not json\n",
            "{\"type\":\"call\",\"thread_id\":1,\"parent_id\":0,\"child_id\":42,\"time\":-5}\n",
        );
        let session = ProfileSession::new(SqliteStore::open_in_memory().unwrap());
        let mut summary = ReplaySummary::default();

        replay_lines(input.as_bytes(), &session, &mut summary)
            .await
            .unwrap();

        assert_eq!(summary.events, 2);
        assert_eq!(summary.malformed, 1);
        assert_eq!(summary.rejected, 1);

        let store = session.close().map_err(|(e, _)| e).unwrap();
        assert_eq!(store.sample_rows(LIVE_SNAPSHOT).unwrap()[0].time, 150);
    }
}

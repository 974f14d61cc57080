use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::engine::{Engine, EngineError};

const CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Compact when at least `threshold` events were appended since the last
/// compaction. Returns whether it compacted.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appended = engine.wal_appends_since_compact().await;
    if appended < threshold {
        return Ok(false);
    }
    debug!("{appended} WAL appends since last compaction, compacting");
    engine.compact_wal().await?;
    Ok(true)
}

/// Background task: one per venue, runs for the life of the process.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&engine, threshold).await {
            error!("WAL compaction failed: {e}");
        }
    }
}

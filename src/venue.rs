use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;

/// Per-venue engines, keyed by the database name a client connects with.
/// Each venue has its own WAL file and compactor task.
pub struct VenueManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

/// Keep only characters that are safe in a file name.
fn wal_file_stem(venue: &str) -> String {
    venue
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

impl VenueManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Get the venue's engine, loading it from its WAL on first use.
    pub fn get_or_create(&self, venue: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(venue) {
            return Ok(engine.value().clone());
        }
        if venue.len() > MAX_VENUE_NAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "venue name too long"));
        }
        let stem = wal_file_stem(venue);
        if stem.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty venue name"));
        }

        if self.engines.len() >= MAX_VENUES {
            return Err(io::Error::other("too many venues"));
        }

        // Entry lock: two first connections to one venue must share an engine.
        let entry = self.engines.entry(venue.to_string());
        if let Entry::Occupied(e) = &entry {
            return Ok(e.get().clone());
        }

        let engine = Arc::new(Engine::new(self.data_dir.join(format!("{stem}.wal")))?);
        tokio::spawn(compactor::run_compactor(engine.clone(), self.compact_threshold));
        entry.or_insert(engine.clone());

        metrics::gauge!(crate::observability::VENUES_ACTIVE).set(self.engines.len() as f64);
        info!("venue {venue} loaded");
        Ok(engine)
    }
}

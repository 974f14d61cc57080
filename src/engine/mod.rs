mod availability;
mod conflict;
mod error;
mod guard;
mod mutations;
mod queries;

pub use availability::{find_available, sort_best_fit};
pub use conflict::{any_overlap, fits, overlaps};
pub use error::{EngineError, ErrorKind};
pub use guard::{validate_create, validate_update};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedTableState = Arc<RwLock<TableState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// One venue's tables and reservations.
///
/// Each table lives behind its own `RwLock`; every reservation write holds the
/// write lock of the table(s) it touches from validation through WAL commit,
/// so two bookings for the same table are always checked one after the other.
pub struct Engine {
    pub(super) tables: DashMap<Ulid, SharedTableState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: reservation id → table id.
    pub(super) reservation_to_table: DashMap<Ulid, Ulid>,
    /// Table number → table id.
    pub(super) numbers: DashMap<u32, Ulid>,
    /// Serializes table creation against WAL compaction.
    pub(super) catalog: Mutex<()>,
}

/// Apply an event to one table (no locking; caller holds the lock).
/// A reservation moved between tables is removed from the old table and
/// inserted into the new one; call this once for each side.
fn apply_to_table(ts: &mut TableState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ReservationCreated { reservation } => {
            if reservation.table_id == ts.id() {
                ts.insert_reservation(reservation.clone());
                index.insert(reservation.id, reservation.table_id);
            }
        }
        Event::ReservationUpdated {
            previous_table_id,
            reservation,
        } => {
            if *previous_table_id == ts.id() {
                ts.remove_reservation(reservation.id);
            }
            if reservation.table_id == ts.id() {
                ts.remove_reservation(reservation.id);
                ts.insert_reservation(reservation.clone());
            }
            index.insert(reservation.id, reservation.table_id);
        }
        Event::ReservationDeleted { id, table_id } => {
            if *table_id == ts.id() {
                ts.remove_reservation(*id);
                index.remove(id);
            }
        }
        // TableCreated is handled at the DashMap level, not here
        Event::TableCreated { .. } => {}
    }
}

/// Tables an event touches (one, or two for a move).
fn event_table_ids(event: &Event) -> Vec<Ulid> {
    match event {
        Event::TableCreated { .. } => Vec::new(),
        Event::ReservationCreated { reservation } => vec![reservation.table_id],
        Event::ReservationUpdated {
            previous_table_id,
            reservation,
        } => {
            if *previous_table_id == reservation.table_id {
                vec![reservation.table_id]
            } else {
                vec![*previous_table_id, reservation.table_id]
            }
        }
        Event::ReservationDeleted { table_id, .. } => vec![*table_id],
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            tables: DashMap::new(),
            wal_tx,
            reservation_to_table: DashMap::new(),
            numbers: DashMap::new(),
            catalog: Mutex::new(()),
        };

        // We're the sole owner of these Arcs during replay, so try_write always
        // succeeds. Never use blocking_write here: this may run inside an async
        // context (lazy venue creation).
        for event in &events {
            if let Event::TableCreated { table } = event {
                engine.numbers.insert(table.number, table.id);
                engine
                    .tables
                    .insert(table.id, Arc::new(RwLock::new(TableState::new(table.clone()))));
                continue;
            }
            for table_id in event_table_ids(event) {
                let Some(state) = engine.get_table_state(&table_id) else {
                    tracing::warn!("replay: event for unknown table {table_id} skipped");
                    continue;
                };
                let Ok(mut guard) = state.try_write() else {
                    return Err(io::Error::other("replay: table state unexpectedly locked"));
                };
                apply_to_table(&mut guard, event, &engine.reservation_to_table);
            }
        }

        tracing::debug!(
            "replayed {} events: {} tables, {} reservations",
            events.len(),
            engine.tables.len(),
            engine.reservation_to_table.len()
        );
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_table_state(&self, id: &Ulid) -> Option<SharedTableState> {
        self.tables.get(id).map(|e| e.value().clone())
    }

    pub fn get_table_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_table.get(reservation_id).map(|e| *e.value())
    }

    /// Snapshot of the table cells; never hold DashMap refs across an await.
    pub(super) fn table_states(&self) -> Vec<SharedTableState> {
        self.tables.iter().map(|e| e.value().clone()).collect()
    }

    /// WAL-append, then apply to every table guard the event touches.
    pub(super) async fn persist_and_apply(
        &self,
        guards: &mut [&mut TableState],
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        for ts in guards.iter_mut() {
            apply_to_table(ts, event, &self.reservation_to_table);
        }
        Ok(())
    }

    /// Lookup reservation → table and acquire that table's write lock.
    /// Retries if the reservation moved to another table while we waited.
    pub(super) async fn lock_reservation_table(
        &self,
        reservation_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<TableState>, EngineError> {
        loop {
            let table_id = self
                .get_table_for_reservation(reservation_id)
                .ok_or(EngineError::ReservationNotFound(*reservation_id))?;
            let state = self
                .get_table_state(&table_id)
                .ok_or(EngineError::TableNotFound(table_id))?;
            let guard = state.write_owned().await;
            if guard.get(reservation_id).is_some() {
                return Ok(guard);
            }
        }
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

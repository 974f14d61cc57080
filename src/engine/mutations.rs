use std::collections::HashSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{now_ms, validate_guests, validate_window};
use super::guard::{validate_create, validate_update};
use super::{Engine, EngineError, SharedTableState, WalCommand};

fn validate_contact_field(field: &'static str, value: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::Invalid(format!("{field} is required")));
    }
    if value.len() > MAX_FIELD_LEN {
        return Err(EngineError::LimitExceeded("contact field too long"));
    }
    Ok(())
}

fn validate_notes(notes: Option<&str>) -> Result<(), EngineError> {
    if notes.is_some_and(|n| n.len() > MAX_NOTES_LEN) {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    Ok(())
}

/// Blank notes are stored as no notes.
fn normalize_notes(notes: Option<String>) -> Option<String> {
    notes.filter(|n| !n.trim().is_empty())
}

fn record_rejection(e: &EngineError) {
    metrics::counter!(crate::observability::RESERVATIONS_REJECTED_TOTAL, "kind" => e.kind().as_str())
        .increment(1);
    debug!("reservation rejected: {e}");
}

impl Engine {
    pub async fn create_table(&self, id: Ulid, number: u32, capacity: u32) -> Result<(), EngineError> {
        self.create_tables(vec![Table { id, number, capacity }]).await
    }

    /// Seed several tables at once. The whole batch is validated before the
    /// first WAL append, so a bad row leaves no table behind.
    pub async fn create_tables(&self, tables: Vec<Table>) -> Result<(), EngineError> {
        for table in &tables {
            if table.capacity == 0 {
                return Err(EngineError::Invalid("capacity must be at least 1".into()));
            }
            if table.capacity > MAX_TABLE_CAPACITY {
                return Err(EngineError::LimitExceeded("table capacity too large"));
            }
        }

        let _catalog = self.catalog.lock().await;
        if self.tables.len() + tables.len() > MAX_TABLES_PER_VENUE {
            return Err(EngineError::LimitExceeded("too many tables"));
        }
        let mut ids = HashSet::with_capacity(tables.len());
        let mut numbers = HashSet::with_capacity(tables.len());
        for table in &tables {
            if self.tables.contains_key(&table.id) || !ids.insert(table.id) {
                return Err(EngineError::AlreadyExists(table.id));
            }
            if self.numbers.contains_key(&table.number) || !numbers.insert(table.number) {
                return Err(EngineError::DuplicateTableNumber(table.number));
            }
        }

        for table in tables {
            self.wal_append(&Event::TableCreated { table: table.clone() }).await?;
            let (number, capacity) = (table.number, table.capacity);
            self.numbers.insert(number, table.id);
            self.tables.insert(table.id, Arc::new(RwLock::new(TableState::new(table))));
            info!("table {number} created ({capacity} seats)");
        }
        Ok(())
    }

    pub async fn create_reservation(&self, draft: ReservationDraft) -> Result<ReservationInfo, EngineError> {
        let result = self.try_create_reservation(draft).await;
        if let Err(e) = &result {
            record_rejection(e);
        }
        result
    }

    async fn try_create_reservation(&self, draft: ReservationDraft) -> Result<ReservationInfo, EngineError> {
        validate_contact_field("name", &draft.name)?;
        validate_contact_field("email", &draft.email)?;
        validate_contact_field("phone", &draft.phone)?;
        validate_notes(draft.notes.as_deref())?;
        validate_guests(draft.guests)?;
        let window = validate_window(draft.start, draft.duration_minutes)?;

        let id = draft.id.unwrap_or_else(Ulid::new);
        let state = self
            .get_table_state(&draft.table_id)
            .ok_or(EngineError::TableNotFound(draft.table_id))?;
        let mut guard = state.write_owned().await;

        // Claim the id while holding the table lock. Anyone who finds the
        // claim waits on this table and sees either the committed record or
        // no claim at all.
        match self.reservation_to_table.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(draft.table_id);
            }
        }
        let result = self.insert_claimed(&mut guard, id, draft, window).await;
        if result.is_err() {
            self.reservation_to_table.remove(&id);
        }
        result
    }

    async fn insert_claimed(
        &self,
        guard: &mut OwnedRwLockWriteGuard<TableState>,
        id: Ulid,
        draft: ReservationDraft,
        window: Window,
    ) -> Result<ReservationInfo, EngineError> {
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_TABLE {
            return Err(EngineError::LimitExceeded("too many reservations on table"));
        }

        validate_create(
            draft.table_id,
            Some(&guard.table),
            draft.guests,
            &window,
            guard.overlapping(&window),
        )?;

        let reservation = Reservation {
            id,
            table_id: draft.table_id,
            name: draft.name,
            email: draft.email,
            phone: draft.phone,
            start: window.start,
            guests: draft.guests,
            duration_minutes: window.duration_minutes,
            status: ReservationStatus::Pending,
            notes: normalize_notes(draft.notes),
            created_at: now_ms(),
        };
        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(&mut [&mut **guard], &event).await?;
        info!(
            "reservation {id} created on table {} for {} guests",
            guard.table.number, reservation.guests
        );
        Ok(guard.info(reservation))
    }

    /// Merge `patch` onto the current record, re-validate, and commit.
    pub async fn update_reservation(
        &self,
        id: Ulid,
        patch: ReservationPatch,
    ) -> Result<ReservationInfo, EngineError> {
        let result = self.try_update_reservation(id, patch).await;
        if let Err(e) = &result {
            record_rejection(e);
        }
        result
    }

    async fn try_update_reservation(
        &self,
        id: Ulid,
        patch: ReservationPatch,
    ) -> Result<ReservationInfo, EngineError> {
        for (field, value) in [("name", &patch.name), ("email", &patch.email), ("phone", &patch.phone)] {
            if let Some(v) = value {
                validate_contact_field(field, v)?;
            }
        }
        if let Some(notes) = &patch.notes {
            validate_notes(notes.as_deref())?;
        }
        if let Some(g) = patch.guests {
            validate_guests(g)?;
        }

        loop {
            let current = self
                .get_table_for_reservation(&id)
                .ok_or(EngineError::ReservationNotFound(id))?;
            let dest = patch.table_id.unwrap_or(current);
            let src_state = self
                .get_table_state(&current)
                .ok_or(EngineError::TableNotFound(current))?;

            // Lock in ascending id order to prevent deadlocks between movers.
            let (mut src, mut dst) = if dest == current {
                (src_state.write_owned().await, None)
            } else {
                let dst_state = self
                    .get_table_state(&dest)
                    .ok_or(EngineError::TableNotFound(dest))?;
                if current < dest {
                    let s = src_state.write_owned().await;
                    let d = dst_state.write_owned().await;
                    (s, Some(d))
                } else {
                    let d = dst_state.write_owned().await;
                    let s = src_state.write_owned().await;
                    (s, Some(d))
                }
            };

            let Some(prior) = src.get(&id).cloned() else {
                // Moved or deleted while we waited for the locks.
                continue;
            };
            if patch.is_empty() {
                return Ok(src.info(prior));
            }
            let merged = patch.merge(&prior)?;
            let window = validate_window(merged.start, merged.duration_minutes)?;

            let target: &TableState = dst.as_deref().unwrap_or(&*src);
            if target.reservations.len() >= MAX_RESERVATIONS_PER_TABLE && dest != current {
                return Err(EngineError::LimitExceeded("too many reservations on table"));
            }
            if merged.is_active() {
                validate_update(
                    id,
                    dest,
                    Some(&target.table),
                    merged.guests,
                    &window,
                    target.overlapping(&window),
                )?;
            } else {
                // A cancelled reservation occupies nothing; only seating applies.
                validate_update(
                    id,
                    dest,
                    Some(&target.table),
                    merged.guests,
                    &window,
                    std::iter::empty::<&Reservation>(),
                )?;
            }

            let event = Event::ReservationUpdated {
                previous_table_id: current,
                reservation: merged.clone(),
            };
            match dst.as_mut() {
                Some(d) => self.persist_and_apply(&mut [&mut *src, &mut **d], &event).await?,
                None => self.persist_and_apply(&mut [&mut *src], &event).await?,
            }

            let table = dst.as_deref().unwrap_or(&*src).table.clone();
            if prior.status != merged.status {
                info!("reservation {id} {} -> {}", prior.status, merged.status);
            } else {
                info!("reservation {id} updated (table {})", table.number);
            }
            return Ok(ReservationInfo {
                reservation: merged,
                table,
            });
        }
    }

    pub async fn delete_reservation(&self, id: Ulid) -> Result<ReservationInfo, EngineError> {
        let mut guard = self.lock_reservation_table(&id).await?;
        let reservation = guard
            .get(&id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))?;
        let event = Event::ReservationDeleted {
            id,
            table_id: guard.id(),
        };
        self.persist_and_apply(&mut [&mut *guard], &event).await?;
        info!("reservation {id} deleted from table {}", guard.table.number);
        Ok(guard.info(reservation))
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    ///
    /// Holds the catalog lock and a read lock on every table until the writer
    /// has swapped the file, so no committed write can fall between the snapshot
    /// and the swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;

        // Ascending id order, same as movers take write locks.
        let mut states: Vec<(Ulid, SharedTableState)> = self
            .tables
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        states.sort_by_key(|(id, _)| *id);
        let mut guards = Vec::with_capacity(states.len());
        for (_, state) in states {
            guards.push(state.read_owned().await);
        }

        let mut events = Vec::with_capacity(guards.len());
        for guard in &guards {
            events.push(Event::TableCreated {
                table: guard.table.clone(),
            });
        }
        for guard in &guards {
            for reservation in &guard.reservations {
                events.push(Event::ReservationCreated {
                    reservation: reservation.clone(),
                });
            }
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);
        info!("WAL compacted to {count} events");
        Ok(())
    }
}

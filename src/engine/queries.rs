use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

use super::availability::{find_available, sort_best_fit};
use super::conflict::{validate_guests, validate_window};
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_table(&self, id: Ulid) -> Option<Table> {
        let state = self.get_table_state(&id)?;
        let guard = state.read().await;
        Some(guard.table.clone())
    }

    /// All tables seating at least `min_capacity`, best fit first.
    pub async fn list_tables(&self, min_capacity: Option<u32>) -> Vec<Table> {
        let mut tables = Vec::with_capacity(self.tables.len());
        for state in self.table_states() {
            let guard = state.read().await;
            if min_capacity.is_none_or(|n| guard.table.capacity >= n) {
                tables.push(guard.table.clone());
            }
        }
        sort_best_fit(&mut tables);
        tables
    }

    /// Windows occupied by non-cancelled reservations on one table.
    pub async fn list_active_windows(
        &self,
        table_id: Ulid,
        exclude: Option<Ulid>,
    ) -> Result<Vec<Window>, EngineError> {
        let state = self
            .get_table_state(&table_id)
            .ok_or(EngineError::TableNotFound(table_id))?;
        let guard = state.read().await;
        Ok(guard.active_windows(exclude))
    }

    /// Tables free for `[start, start + duration)` that seat `guests`.
    ///
    /// Each table is read under its own lock; the answer is a snapshot and a
    /// later booking still goes through the mutation guard.
    pub async fn search_availability(
        &self,
        start: Ms,
        guests: u32,
        duration_minutes: u32,
    ) -> Result<Vec<Table>, EngineError> {
        validate_guests(guests)?;
        let target = validate_window(start, duration_minutes)?;

        let states = self.table_states();
        let mut tables = Vec::with_capacity(states.len());
        let mut busy: HashMap<Ulid, Vec<Window>> = HashMap::with_capacity(states.len());
        for state in states {
            let guard = state.read().await;
            let windows: Vec<Window> = guard
                .overlapping(&target)
                .filter(|r| r.is_active())
                .map(Reservation::window)
                .collect();
            if !windows.is_empty() {
                busy.insert(guard.id(), windows);
            }
            tables.push(guard.table.clone());
        }

        Ok(find_available(&target, guests, &tables, &busy))
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<ReservationInfo, EngineError> {
        loop {
            let table_id = self
                .get_table_for_reservation(&id)
                .ok_or(EngineError::ReservationNotFound(id))?;
            let state = self
                .get_table_state(&table_id)
                .ok_or(EngineError::TableNotFound(table_id))?;
            let guard = state.read().await;
            // Moved between the index lookup and the lock; look again.
            if let Some(r) = guard.get(&id) {
                return Ok(guard.info(r.clone()));
            }
        }
    }

    /// Matching reservations, most recent start first.
    pub async fn list_reservations(&self, filter: &ReservationFilter) -> Vec<ReservationInfo> {
        if let Some(id) = filter.id {
            return match self.get_reservation(id).await {
                Ok(info) if filter.matches(&info.reservation) => vec![info],
                _ => Vec::new(),
            };
        }

        let states = match filter.table_id {
            Some(table_id) => self.get_table_state(&table_id).into_iter().collect(),
            None => self.table_states(),
        };
        let mut out = Vec::new();
        for state in states {
            let guard = state.read().await;
            for r in guard.reservations.iter().filter(|r| filter.matches(r)) {
                out.push(guard.info(r.clone()));
            }
        }
        out.sort_by(|a, b| {
            b.reservation
                .start
                .cmp(&a.reservation.start)
                .then(b.reservation.id.cmp(&a.reservation.id))
        });
        out
    }

    /// Dashboard counters; `day_start` is midnight UTC of the day to report on.
    pub async fn reservation_stats(&self, day_start: Ms) -> ReservationStats {
        let mut stats = ReservationStats::default();
        for state in self.table_states() {
            let guard = state.read().await;
            for r in &guard.reservations {
                stats.total += 1;
                match r.status {
                    ReservationStatus::Pending => stats.pending += 1,
                    ReservationStatus::Confirmed => stats.confirmed += 1,
                    _ => {}
                }
                if r.is_active() && day_start <= r.start && r.start < day_start + DAY_MS {
                    stats.day_active += 1;
                }
            }
        }
        stats
    }
}

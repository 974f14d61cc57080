use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 86_400_000;

/// Occupied interval `[start, start + duration)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: Ms,
    pub duration_minutes: u32,
}

impl Window {
    /// `None` for a zero duration or an end past `Ms::MAX`.
    pub fn new(start: Ms, duration_minutes: u32) -> Option<Self> {
        if duration_minutes == 0 {
            return None;
        }
        start.checked_add(Ms::from(duration_minutes) * MINUTE_MS)?;
        Some(Self { start, duration_minutes })
    }

    pub fn end(&self) -> Ms {
        self.start + self.duration_ms()
    }

    pub fn duration_ms(&self) -> Ms {
        Ms::from(self.duration_minutes) * MINUTE_MS
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub id: Ulid,
    /// Display label, unique per venue.
    pub number: u32,
    /// Seats.
    pub capacity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "PENDING",
            ReservationStatus::Confirmed => "CONFIRMED",
            ReservationStatus::Cancelled => "CANCELLED",
            ReservationStatus::Completed => "COMPLETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(ReservationStatus::Pending),
            "CONFIRMED" => Some(ReservationStatus::Confirmed),
            "CANCELLED" => Some(ReservationStatus::Cancelled),
            "COMPLETED" => Some(ReservationStatus::Completed),
            _ => None,
        }
    }

    /// Everything but CANCELLED occupies its table.
    pub fn is_active(&self) -> bool {
        !matches!(self, ReservationStatus::Cancelled)
    }

    pub fn can_transition_to(&self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Completed) | (Confirmed, Cancelled)
        )
    }

    /// Re-writing the current status is a no-op, not a transition.
    pub fn transition(self, next: ReservationStatus) -> Result<ReservationStatus, EngineError> {
        if self == next || self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(EngineError::InvalidTransition { from: self, to: next })
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub table_id: Ulid,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub start: Ms,
    pub guests: u32,
    pub duration_minutes: u32,
    pub status: ReservationStatus,
    pub notes: Option<String>,
    pub created_at: Ms,
}

impl Reservation {
    pub fn window(&self) -> Window {
        Window {
            start: self.start,
            duration_minutes: self.duration_minutes,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// A reservation together with the table it is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationInfo {
    pub reservation: Reservation,
    pub table: Table,
}

/// One table and every reservation ever bound to it, cancelled included.
#[derive(Debug, Clone)]
pub struct TableState {
    pub table: Table,
    /// Sorted by `start`.
    pub reservations: Vec<Reservation>,
}

impl TableState {
    pub fn new(table: Table) -> Self {
        Self {
            table,
            reservations: Vec::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.table.id
    }

    /// Insert maintaining sort order by start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.start <= reservation.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn get(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    /// Reservations whose window overlaps `query`, any status.
    /// Everything at index >= right_bound starts at or after `query.end()`.
    pub fn overlapping(&self, query: &Window) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.start < query.end());
        let query_start = query.start;
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.window().end() > query_start)
    }

    pub fn active_windows(&self, exclude: Option<Ulid>) -> Vec<Window> {
        self.reservations
            .iter()
            .filter(|r| r.is_active() && Some(r.id) != exclude)
            .map(Reservation::window)
            .collect()
    }

    pub fn info(&self, reservation: Reservation) -> ReservationInfo {
        ReservationInfo {
            reservation,
            table: self.table.clone(),
        }
    }
}

/// Fields supplied when booking. Status always starts at PENDING.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationDraft {
    /// Generated when absent.
    pub id: Option<Ulid>,
    pub table_id: Ulid,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub start: Ms,
    pub guests: u32,
    pub duration_minutes: u32,
    pub notes: Option<String>,
}

/// Partial update. `None` keeps the prior value; `notes: Some(None)` clears notes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationPatch {
    pub table_id: Option<Ulid>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub start: Option<Ms>,
    pub guests: Option<u32>,
    pub duration_minutes: Option<u32>,
    pub status: Option<ReservationStatus>,
    pub notes: Option<Option<String>>,
}

impl ReservationPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merge onto a snapshot of the prior record. The snapshot is left untouched;
    /// a rejected status edge yields an error and no merged record.
    pub fn merge(&self, prior: &Reservation) -> Result<Reservation, EngineError> {
        let status = match self.status {
            Some(next) => prior.status.transition(next)?,
            None => prior.status,
        };
        Ok(Reservation {
            id: prior.id,
            table_id: self.table_id.unwrap_or(prior.table_id),
            name: self.name.clone().unwrap_or_else(|| prior.name.clone()),
            email: self.email.clone().unwrap_or_else(|| prior.email.clone()),
            phone: self.phone.clone().unwrap_or_else(|| prior.phone.clone()),
            start: self.start.unwrap_or(prior.start),
            guests: self.guests.unwrap_or(prior.guests),
            duration_minutes: self.duration_minutes.unwrap_or(prior.duration_minutes),
            status,
            notes: match &self.notes {
                Some(n) => n.clone(),
                None => prior.notes.clone(),
            },
            created_at: prior.created_at,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub id: Option<Ulid>,
    pub table_id: Option<Ulid>,
    pub status: Option<ReservationStatus>,
    /// Start of a UTC day; matches reservations starting within that day.
    pub day: Option<Ms>,
}

impl ReservationFilter {
    pub fn matches(&self, r: &Reservation) -> bool {
        self.id.is_none_or(|id| r.id == id)
            && self.table_id.is_none_or(|t| r.table_id == t)
            && self.status.is_none_or(|s| r.status == s)
            && self.day.is_none_or(|d| d <= r.start && r.start < d + DAY_MS)
    }
}

/// Dashboard counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReservationStats {
    pub total: u64,
    pub pending: u64,
    pub confirmed: u64,
    /// Non-cancelled reservations starting on the requested day.
    pub day_active: u64,
}

/// Flat WAL record format. Reservation events carry the full record so replay
/// never depends on merge logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    TableCreated {
        table: Table,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationUpdated {
        previous_table_id: Ulid,
        reservation: Reservation,
    },
    ReservationDeleted {
        id: Ulid,
        table_id: Ulid,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(status: ReservationStatus) -> Reservation {
        Reservation {
            id: Ulid::new(),
            table_id: Ulid::new(),
            name: "Ana".into(),
            email: "ana@example.com".into(),
            phone: "555-0100".into(),
            start: 1_750_000_000_000,
            guests: 2,
            duration_minutes: 120,
            status,
            notes: Some("window seat".into()),
            created_at: 1_749_000_000_000,
        }
    }

    #[test]
    fn window_basics() {
        let w = Window::new(1_000, 90).unwrap();
        assert_eq!(w.end(), 1_000 + 90 * MINUTE_MS);
        assert_eq!(w.duration_ms(), 90 * MINUTE_MS);
    }

    #[test]
    fn window_rejects_zero_duration() {
        assert!(Window::new(1_000, 0).is_none());
    }

    #[test]
    fn window_rejects_overflow() {
        assert!(Window::new(Ms::MAX - 10, 1).is_none());
    }

    #[test]
    fn status_parse_is_case_insensitive() {
        assert_eq!(ReservationStatus::parse("confirmed"), Some(ReservationStatus::Confirmed));
        assert_eq!(ReservationStatus::parse(" CANCELLED "), Some(ReservationStatus::Cancelled));
        assert_eq!(ReservationStatus::parse("seated"), None);
    }

    #[test]
    fn lifecycle_edges() {
        use ReservationStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Confirmed.can_transition_to(Completed));
        assert!(Confirmed.can_transition_to(Cancelled));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Confirmed.can_transition_to(Pending));
        for next in [Pending, Confirmed, Completed] {
            assert!(!Cancelled.can_transition_to(next));
        }
        for next in [Pending, Confirmed, Cancelled] {
            assert!(!Completed.can_transition_to(next));
        }
    }

    #[test]
    fn same_status_is_noop() {
        use ReservationStatus::*;
        assert_eq!(Cancelled.transition(Cancelled).unwrap(), Cancelled);
        assert!(matches!(
            Cancelled.transition(Pending),
            Err(EngineError::InvalidTransition { from: Cancelled, to: Pending })
        ));
    }

    #[test]
    fn only_cancelled_is_inactive() {
        assert!(ReservationStatus::Pending.is_active());
        assert!(ReservationStatus::Completed.is_active());
        assert!(!ReservationStatus::Cancelled.is_active());
    }

    #[test]
    fn empty_patch_keeps_everything() {
        let prior = reservation(ReservationStatus::Pending);
        let merged = ReservationPatch::default().merge(&prior).unwrap();
        assert_eq!(merged, prior);
        assert!(ReservationPatch::default().is_empty());
    }

    #[test]
    fn patch_overrides_only_supplied_fields() {
        let prior = reservation(ReservationStatus::Pending);
        let patch = ReservationPatch {
            guests: Some(4),
            status: Some(ReservationStatus::Confirmed),
            notes: Some(None),
            ..Default::default()
        };
        let merged = patch.merge(&prior).unwrap();
        assert_eq!(merged.guests, 4);
        assert_eq!(merged.status, ReservationStatus::Confirmed);
        assert_eq!(merged.notes, None);
        assert_eq!(merged.name, prior.name);
        assert_eq!(merged.start, prior.start);
        assert_eq!(merged.created_at, prior.created_at);
        // prior snapshot untouched
        assert_eq!(prior.guests, 2);
    }

    #[test]
    fn patch_rejects_resurrection() {
        let prior = reservation(ReservationStatus::Cancelled);
        let patch = ReservationPatch {
            status: Some(ReservationStatus::Confirmed),
            ..Default::default()
        };
        assert!(patch.merge(&prior).is_err());
    }

    #[test]
    fn filter_by_day_is_half_open() {
        let mut r = reservation(ReservationStatus::Pending);
        let day = 1_750_032_000_000 - (1_750_032_000_000 % DAY_MS);
        r.start = day;
        let f = ReservationFilter { day: Some(day), ..Default::default() };
        assert!(f.matches(&r));
        r.start = day + DAY_MS;
        assert!(!f.matches(&r));
    }

    #[test]
    fn filter_combines_fields() {
        let r = reservation(ReservationStatus::Confirmed);
        let f = ReservationFilter {
            table_id: Some(r.table_id),
            status: Some(ReservationStatus::Confirmed),
            ..Default::default()
        };
        assert!(f.matches(&r));
        let f = ReservationFilter {
            table_id: Some(r.table_id),
            status: Some(ReservationStatus::Pending),
            ..Default::default()
        };
        assert!(!f.matches(&r));
    }

    fn at(start: Ms, minutes: u32, status: ReservationStatus) -> Reservation {
        Reservation {
            start,
            duration_minutes: minutes,
            ..reservation(status)
        }
    }

    #[test]
    fn reservations_kept_sorted() {
        let mut ts = TableState::new(Table { id: Ulid::new(), number: 1, capacity: 4 });
        ts.insert_reservation(at(3_000 * MINUTE_MS, 60, ReservationStatus::Pending));
        ts.insert_reservation(at(1_000 * MINUTE_MS, 60, ReservationStatus::Pending));
        ts.insert_reservation(at(2_000 * MINUTE_MS, 60, ReservationStatus::Pending));
        let starts: Vec<Ms> = ts.reservations.iter().map(|r| r.start / MINUTE_MS).collect();
        assert_eq!(starts, vec![1_000, 2_000, 3_000]);
    }

    #[test]
    fn remove_unknown_returns_none() {
        let mut ts = TableState::new(Table { id: Ulid::new(), number: 1, capacity: 4 });
        ts.insert_reservation(at(0, 60, ReservationStatus::Pending));
        assert!(ts.remove_reservation(Ulid::new()).is_none());
        assert_eq!(ts.reservations.len(), 1);
    }

    #[test]
    fn overlapping_skips_adjacent_and_far() {
        let mut ts = TableState::new(Table { id: Ulid::new(), number: 1, capacity: 4 });
        let m = MINUTE_MS;
        ts.insert_reservation(at(0, 60, ReservationStatus::Pending)); // ends at query start
        ts.insert_reservation(at(90 * m, 60, ReservationStatus::Cancelled)); // overlaps
        ts.insert_reservation(at(180 * m, 60, ReservationStatus::Pending)); // starts at query end
        ts.insert_reservation(at(10_000 * m, 60, ReservationStatus::Pending));
        let query = Window::new(60 * m, 120).unwrap();
        let hits: Vec<Ms> = ts.overlapping(&query).map(|r| r.start / m).collect();
        assert_eq!(hits, vec![90]);
    }

    #[test]
    fn overlapping_sees_long_earlier_reservation() {
        let mut ts = TableState::new(Table { id: Ulid::new(), number: 1, capacity: 4 });
        ts.insert_reservation(at(0, 600, ReservationStatus::Confirmed));
        let query = Window::new(300 * MINUTE_MS, 30).unwrap();
        assert_eq!(ts.overlapping(&query).count(), 1);
    }

    #[test]
    fn active_windows_skip_cancelled_and_excluded() {
        let mut ts = TableState::new(Table { id: Ulid::new(), number: 1, capacity: 4 });
        let keep = at(0, 60, ReservationStatus::Confirmed);
        let excluded = at(120 * MINUTE_MS, 60, ReservationStatus::Pending);
        ts.insert_reservation(keep.clone());
        ts.insert_reservation(excluded.clone());
        ts.insert_reservation(at(240 * MINUTE_MS, 60, ReservationStatus::Cancelled));
        assert_eq!(ts.active_windows(Some(excluded.id)), vec![keep.window()]);
        assert_eq!(ts.active_windows(None).len(), 2);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ReservationCreated {
            reservation: reservation(ReservationStatus::Pending),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}

//! Validation applied before every reservation write.
//!
//! Checks run in a fixed order and stop at the first failure: the table must
//! exist, it must seat the party, and the window must not overlap another
//! active reservation on it. Nothing here writes; the caller persists only
//! after `Ok(())`, while still holding the table's lock.

use ulid::Ulid;

use crate::model::*;

use super::conflict::{fits, overlaps};
use super::EngineError;

pub fn validate_create<'a>(
    table_id: Ulid,
    table: Option<&Table>,
    guests: u32,
    window: &Window,
    existing: impl IntoIterator<Item = &'a Reservation>,
) -> Result<(), EngineError> {
    check(table_id, table, guests, window, existing, None)
}

/// Same as [`validate_create`], except the reservation being updated never
/// conflicts with itself.
pub fn validate_update<'a>(
    reservation_id: Ulid,
    table_id: Ulid,
    table: Option<&Table>,
    guests: u32,
    window: &Window,
    existing: impl IntoIterator<Item = &'a Reservation>,
) -> Result<(), EngineError> {
    check(table_id, table, guests, window, existing, Some(reservation_id))
}

fn check<'a>(
    table_id: Ulid,
    table: Option<&Table>,
    guests: u32,
    window: &Window,
    existing: impl IntoIterator<Item = &'a Reservation>,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let table = table.ok_or(EngineError::TableNotFound(table_id))?;

    if !fits(table, guests) {
        return Err(EngineError::CapacityExceeded {
            table_number: table.number,
            capacity: table.capacity,
            guests,
        });
    }

    let clash = existing
        .into_iter()
        .filter(|r| r.is_active() && Some(r.id) != exclude)
        .find(|r| overlaps(window, &r.window()));
    if let Some(r) = clash {
        return Err(EngineError::Conflict {
            table_number: table.number,
            with: r.id,
        });
    }
    Ok(())
}

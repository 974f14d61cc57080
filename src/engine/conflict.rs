use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Half-open test: windows that only touch at an endpoint do not overlap.
pub fn overlaps(candidate: &Window, existing: &Window) -> bool {
    candidate.start < existing.end() && existing.start < candidate.end()
}

/// True iff any element overlaps `candidate`. Stops at the first hit.
pub fn any_overlap<'a>(candidate: &Window, existing: impl IntoIterator<Item = &'a Window>) -> bool {
    existing.into_iter().any(|w| overlaps(candidate, w))
}

pub fn fits(table: &Table, guests: u32) -> bool {
    table.capacity >= guests
}

/// Build a window from caller input, rejecting what the model cannot hold.
pub(crate) fn validate_window(start: Ms, duration_minutes: u32) -> Result<Window, EngineError> {
    if duration_minutes == 0 {
        return Err(EngineError::Invalid("duration must be at least 1 minute".into()));
    }
    if duration_minutes > MAX_DURATION_MINUTES {
        return Err(EngineError::LimitExceeded("duration too long"));
    }
    let window = Window::new(start, duration_minutes)
        .ok_or_else(|| EngineError::Invalid("duration overflows timestamp".into()))?;
    if window.start < MIN_VALID_TIMESTAMP_MS || window.end() > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(window)
}

pub(crate) fn validate_guests(guests: u32) -> Result<(), EngineError> {
    if guests == 0 {
        return Err(EngineError::Invalid("guests must be at least 1".into()));
    }
    if guests > MAX_GUESTS {
        return Err(EngineError::LimitExceeded("too many guests"));
    }
    Ok(())
}

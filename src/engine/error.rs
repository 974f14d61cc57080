use ulid::Ulid;

use crate::model::ReservationStatus;

/// Coarse classification surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Input,
    NotFound,
    Capacity,
    Conflict,
    Persistence,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Input => "input",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Capacity => "capacity",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Persistence => "persistence",
        }
    }

    /// Only storage failures are worth retrying unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Persistence)
    }
}

#[derive(Debug)]
pub enum EngineError {
    Invalid(String),
    TableNotFound(Ulid),
    ReservationNotFound(Ulid),
    AlreadyExists(Ulid),
    DuplicateTableNumber(u32),
    CapacityExceeded {
        table_number: u32,
        capacity: u32,
        guests: u32,
    },
    Conflict {
        table_number: u32,
        with: Ulid,
    },
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Invalid(_)
            | EngineError::InvalidTransition { .. }
            | EngineError::LimitExceeded(_) => ErrorKind::Input,
            EngineError::TableNotFound(_) | EngineError::ReservationNotFound(_) => {
                ErrorKind::NotFound
            }
            EngineError::CapacityExceeded { .. } => ErrorKind::Capacity,
            EngineError::Conflict { .. }
            | EngineError::AlreadyExists(_)
            | EngineError::DuplicateTableNumber(_) => ErrorKind::Conflict,
            EngineError::WalError(_) => ErrorKind::Persistence,
        }
    }

    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::Invalid(_) => "22023",
            EngineError::InvalidTransition { .. } => "55000",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::TableNotFound(_) | EngineError::ReservationNotFound(_) => "P0002",
            EngineError::CapacityExceeded { .. } => "23514",
            EngineError::Conflict { .. } => "23P01",
            EngineError::AlreadyExists(_) | EngineError::DuplicateTableNumber(_) => "23505",
            EngineError::WalError(_) => "58030",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Invalid(msg) => write!(f, "invalid input: {msg}"),
            EngineError::TableNotFound(id) => write!(f, "table not found: {id}"),
            EngineError::ReservationNotFound(id) => write!(f, "reservation not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::DuplicateTableNumber(n) => write!(f, "table number {n} already in use"),
            EngineError::CapacityExceeded {
                table_number,
                capacity,
                guests,
            } => write!(
                f,
                "table {table_number} seats {capacity} guests; requested {guests}"
            ),
            EngineError::Conflict { table_number, with } => write!(
                f,
                "table {table_number} is not available at that time (conflicts with reservation {with})"
            ),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "cannot change status from {from} to {to}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

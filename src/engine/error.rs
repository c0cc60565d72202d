use thiserror::Error;

use crate::model::{ReservationId, ReservationStatus, ResourceId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("slot unavailable: overlaps reservation {0}")]
    SlotUnavailable(ReservationId),
    #[error("invalid interval: {0}")]
    InvalidInterval(&'static str),
    #[error("resource not found: {0}")]
    ResourceNotFound(ResourceId),
    #[error("reservation not found: {0}")]
    NotFound(ReservationId),
    #[error("reservation {0} belongs to another user")]
    Forbidden(ReservationId),
    #[error("reservation {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: ReservationId,
        from: ReservationStatus,
        to: ReservationStatus,
    },
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
}

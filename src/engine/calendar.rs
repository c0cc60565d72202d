use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Reject spans the controller must never hand to the calendar.
pub fn validate_span(span: &Span, now: Ms) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::InvalidInterval("start must be before end"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::InvalidInterval("timestamp out of range"));
    }
    if span.start <= now {
        return Err(EngineError::InvalidInterval("start must be in the future"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// True iff no confirmed reservation on the resource overlaps `span`.
pub fn is_free(rs: &ResourceState, span: &Span) -> bool {
    !rs.overlapping(span).any(Reservation::is_confirmed)
}

/// Conflict check for a new hold: confirmed reservations and live holds both block.
/// Holds past their TTL do not, even before the reaper has swept them.
pub fn check_request(rs: &ResourceState, span: &Span, now: Ms, hold_ttl: Ms) -> Result<(), EngineError> {
    match rs
        .overlapping(span)
        .find(|r| r.is_confirmed() || r.is_live_hold(now, hold_ttl))
    {
        Some(blocking) => Err(EngineError::SlotUnavailable(blocking.id)),
        None => Ok(()),
    }
}

/// Commit-time re-check for confirming `id`: no other confirmed reservation may overlap.
pub fn check_confirm(rs: &ResourceState, id: ReservationId, span: &Span) -> Result<(), EngineError> {
    match rs
        .overlapping(span)
        .find(|r| r.id != id && r.is_confirmed())
    {
        Some(winner) => Err(EngineError::SlotUnavailable(winner.id)),
        None => Ok(()),
    }
}

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Unix milliseconds. Every instant the engine stores is UTC in this form.
pub type Ms = i64;

pub type ReservationId = u64;
pub type ResourceId = u64;
pub type UserId = u64;

pub const HOUR_MS: Ms = 3_600_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Rejected,
}

impl ReservationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ReservationStatus::Pending)
    }

    /// The whole state machine: only a pending hold may move, and never back to pending.
    pub fn can_transition_to(self, next: ReservationStatus) -> bool {
        self == ReservationStatus::Pending && next != ReservationStatus::Pending
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(ReservationStatus::Pending),
            "confirmed" => Ok(ReservationStatus::Confirmed),
            "cancelled" | "canceled" => Ok(ReservationStatus::Cancelled),
            "rejected" => Ok(ReservationStatus::Rejected),
            other => Err(format!("unknown reservation status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub user_id: UserId,
    pub resource_id: ResourceId,
    pub span: Span,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_price: Decimal,
    pub status: ReservationStatus,
    pub created_at: Ms,
}

impl Reservation {
    pub fn is_confirmed(&self) -> bool {
        self.status == ReservationStatus::Confirmed
    }

    /// A pending hold that has not outlived its TTL.
    pub fn is_live_hold(&self, now: Ms, hold_ttl: Ms) -> bool {
        self.status == ReservationStatus::Pending && self.created_at.saturating_add(hold_ttl) > now
    }
}

/// Every reservation ever made on one resource, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: ResourceId,
    pub reservations: Vec<Reservation>,
}

impl ResourceState {
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            reservations: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn get(&self, id: ReservationId) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: ReservationId) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Reservations (any status) whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    pub fn confirmed(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.iter().filter(|r| r.is_confirmed())
    }
}

/// The WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationCreated(Reservation),
    StatusChanged {
        id: ReservationId,
        resource_id: ResourceId,
        status: ReservationStatus,
        at: Ms,
    },
}

impl Event {
    pub fn resource_id(&self) -> ResourceId {
        match self {
            Event::ReservationCreated(r) => r.resource_id,
            Event::StatusChanged { resource_id, .. } => *resource_id,
        }
    }
}

// ── Directory mirror ─────────────────────────────────────────────

/// What the venue directory tells us about a bookable resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceListing {
    pub id: ResourceId,
    pub owner_id: UserId,
    pub name: String,
    pub category: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub rate_per_hour: Decimal,
    pub approved: bool,
}

// ── Query result types ───────────────────────────────────────────

/// A reservation joined with its resource's listing and its requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationView {
    pub id: ReservationId,
    pub user_id: UserId,
    pub resource_id: ResourceId,
    pub resource_name: Option<String>,
    pub category: Option<String>,
    pub start: Ms,
    pub end: Ms,
    pub total_price: Decimal,
    pub status: ReservationStatus,
    pub created_at: Ms,
}

impl ReservationView {
    pub fn new(r: &Reservation, listing: Option<&ResourceListing>) -> Self {
        Self {
            id: r.id,
            user_id: r.user_id,
            resource_id: r.resource_id,
            resource_name: listing.map(|l| l.name.clone()),
            category: listing.map(|l| l.category.clone()),
            start: r.span.start,
            end: r.span.end,
            total_price: r.total_price,
            status: r.status,
            created_at: r.created_at,
        }
    }
}

/// Confirmed totals for one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceStats {
    pub resource_id: ResourceId,
    pub name: String,
    pub category: String,
    pub count: u64,
    pub revenue: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(id: ReservationId, start: Ms, end: Ms, status: ReservationStatus) -> Reservation {
        Reservation {
            id,
            user_id: 1,
            resource_id: 1,
            span: Span::new(start, end),
            total_price: Decimal::ZERO,
            status,
            created_at: 0,
        }
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        assert!(a.overlaps(&Span::new(150, 250)));
        assert!(a.overlaps(&Span::new(0, 101)));
        assert!(!a.overlaps(&Span::new(200, 300))); // adjacent
        assert!(!a.overlaps(&Span::new(0, 100)));
    }

    #[test]
    fn state_machine_only_leaves_pending() {
        use ReservationStatus::*;
        for next in [Confirmed, Cancelled, Rejected] {
            assert!(Pending.can_transition_to(next));
        }
        assert!(!Pending.can_transition_to(Pending));
        for terminal in [Confirmed, Cancelled, Rejected] {
            assert!(terminal.is_terminal());
            for next in [Pending, Confirmed, Cancelled, Rejected] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("CONFIRMED".parse::<ReservationStatus>(), Ok(ReservationStatus::Confirmed));
        assert_eq!("canceled".parse::<ReservationStatus>(), Ok(ReservationStatus::Cancelled));
        assert!("paid".parse::<ReservationStatus>().is_err());
    }

    #[test]
    fn insert_keeps_start_order() {
        let mut rs = ResourceState::new(1);
        rs.insert(reservation(1, 300, 400, ReservationStatus::Pending));
        rs.insert(reservation(2, 100, 200, ReservationStatus::Confirmed));
        rs.insert(reservation(3, 200, 300, ReservationStatus::Pending));
        let starts: Vec<_> = rs.reservations.iter().map(|r| r.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut rs = ResourceState::new(1);
        rs.insert(reservation(1, 100, 200, ReservationStatus::Confirmed));
        rs.insert(reservation(2, 450, 600, ReservationStatus::Confirmed));
        rs.insert(reservation(3, 1000, 1100, ReservationStatus::Confirmed));

        let hits: Vec<_> = rs.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 2);
    }

    #[test]
    fn overlapping_long_reservation_spanning_query() {
        let mut rs = ResourceState::new(1);
        rs.insert(reservation(1, 0, 10_000, ReservationStatus::Pending));
        assert_eq!(rs.overlapping(&Span::new(500, 600)).count(), 1);
    }

    #[test]
    fn live_hold_respects_ttl() {
        let mut r = reservation(1, 0, 100, ReservationStatus::Pending);
        r.created_at = 1_000;
        assert!(r.is_live_hold(1_500, 1_000));
        assert!(!r.is_live_hold(2_000, 1_000));
        assert!(r.is_live_hold(i64::MAX, i64::MAX));
        r.status = ReservationStatus::Confirmed;
        assert!(!r.is_live_hold(1_500, 1_000));
    }

    #[test]
    fn event_bincode_roundtrip_keeps_price() {
        let mut r = reservation(7, 0, HOUR_MS, ReservationStatus::Pending);
        r.total_price = Decimal::new(12_550, 2);
        let event = Event::ReservationCreated(r);
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}

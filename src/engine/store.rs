use std::collections::HashMap;

use chrono::{NaiveDate, TimeZone};

use crate::model::*;

use super::{Engine, EngineError, ResourceLock};

impl Engine {
    /// Persist a new pending reservation. Only the lifecycle controller calls
    /// this, holding the resource lock it ran the conflict check under.
    pub(super) async fn create(
        &self,
        lock: &mut ResourceLock,
        user_id: UserId,
        span: Span,
        total_price: rust_decimal::Decimal,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        let reservation = Reservation {
            id: self.allocate_id(),
            user_id,
            resource_id: lock.id,
            span,
            total_price,
            status: ReservationStatus::Pending,
            created_at: now,
        };
        let event = Event::ReservationCreated(reservation.clone());
        self.persist_and_apply(lock, &event).await?;
        Ok(reservation)
    }

    /// Compare-and-swap on status; the only way a reservation's status changes.
    ///
    /// Fails with `NotFound` if the id is unknown, `Forbidden` if `actor` is set
    /// and is not the reservation's owner, and `InvalidTransition` if the current
    /// status is not in `expected` or the state machine forbids the move.
    pub(super) async fn transition_locked(
        &self,
        lock: &mut ResourceLock,
        id: ReservationId,
        expected: &[ReservationStatus],
        next: ReservationStatus,
        actor: Option<UserId>,
    ) -> Result<Reservation, EngineError> {
        let current = lock.get(id).ok_or(EngineError::NotFound(id))?;
        if actor.is_some_and(|user| user != current.user_id) {
            return Err(EngineError::Forbidden(id));
        }
        if !expected.contains(&current.status) || !current.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                id,
                from: current.status,
                to: next,
            });
        }

        let event = Event::StatusChanged {
            id,
            resource_id: lock.id,
            status: next,
            at: super::now_ms(),
        };
        self.persist_and_apply(lock, &event).await?;
        lock.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Locking wrapper around the status compare-and-swap.
    pub async fn transition_status(
        &self,
        id: ReservationId,
        expected: &[ReservationStatus],
        next: ReservationStatus,
        actor: Option<UserId>,
    ) -> Result<Reservation, EngineError> {
        let (_, mut lock) = self.lock_for_reservation(id).await?;
        self.transition_locked(&mut lock, id, expected, next, actor).await
    }

    pub async fn get_by_id(&self, id: ReservationId) -> Result<Reservation, EngineError> {
        let resource_id = self
            .resource_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        guard.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn get_view(&self, id: ReservationId) -> Result<ReservationView, EngineError> {
        let r = self.get_by_id(id).await?;
        let listing = self.directory.listing(r.resource_id);
        Ok(ReservationView::new(&r, listing.as_ref()))
    }

    pub async fn list_by_user(&self, user_id: UserId) -> Vec<ReservationView> {
        self.collect_views(self.resource_ids(), |r| r.user_id == user_id)
            .await
    }

    pub async fn list_by_resource(&self, resource_id: ResourceId) -> Vec<ReservationView> {
        self.collect_views(vec![resource_id], |_| true).await
    }

    /// Reservations on every resource the owner lists.
    pub async fn list_by_owner(&self, owner_id: UserId) -> Vec<ReservationView> {
        let owned = self
            .directory
            .listings_for_owner(owner_id)
            .into_iter()
            .map(|l| l.id)
            .collect();
        self.collect_views(owned, |_| true).await
    }

    pub async fn list_all(&self) -> Vec<ReservationView> {
        self.collect_views(self.resource_ids(), |_| true).await
    }

    /// Confirmed intervals starting on `date` in the reporting time zone, earliest first.
    pub async fn list_confirmed_slots(&self, resource_id: ResourceId, date: NaiveDate) -> Vec<Span> {
        let offset = self.config.report_offset;
        let Some(day_start) = date
            .and_hms_opt(0, 0, 0)
            .and_then(|midnight| offset.from_local_datetime(&midnight).single())
        else {
            return Vec::new();
        };
        let from = day_start.timestamp_millis();
        let to = from + 24 * HOUR_MS;

        let Some(rs) = self.get_resource(&resource_id) else {
            return Vec::new();
        };
        let guard = rs.read().await;
        // Sorted by start, so the day's reservations are one contiguous run.
        let first = guard.reservations.partition_point(|r| r.span.start < from);
        guard.reservations[first..]
            .iter()
            .take_while(|r| r.span.start < to)
            .filter(|r| r.is_confirmed())
            .map(|r| r.span)
            .collect()
    }

    pub(super) fn resource_ids(&self) -> Vec<ResourceId> {
        self.state.iter().map(|e| *e.key()).collect()
    }

    /// Snapshot matching reservations resource by resource, join the directory,
    /// order newest start first.
    async fn collect_views(
        &self,
        resource_ids: Vec<ResourceId>,
        keep: impl Fn(&Reservation) -> bool,
    ) -> Vec<ReservationView> {
        let mut listings = HashMap::new();
        let mut views = Vec::new();
        for rid in resource_ids {
            let Some(rs) = self.get_resource(&rid) else {
                continue;
            };
            let matching: Vec<Reservation> = {
                let guard = rs.read().await;
                guard.reservations.iter().filter(|r| keep(r)).cloned().collect()
            };
            if matching.is_empty() {
                continue;
            }
            let listing = listings
                .entry(rid)
                .or_insert_with(|| self.directory.listing(rid));
            views.extend(matching.iter().map(|r| ReservationView::new(r, listing.as_ref())));
        }
        views.sort_by(|a, b| b.start.cmp(&a.start).then(b.id.cmp(&a.id)));
        views
    }
}

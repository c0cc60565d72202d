use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::limits::*;
use crate::model::*;
use crate::notify::Severity;
use crate::observability::RESERVATIONS_TOTAL;

use super::calendar::{check_confirm, check_request, validate_span};
use super::{now_ms, Engine, EngineError};

use ReservationStatus::{Cancelled, Confirmed, Pending, Rejected};

/// `rate × hours`, rounded to the price scale.
pub(crate) fn price_for(rate_per_hour: Decimal, span: &Span) -> Result<Decimal, EngineError> {
    rate_per_hour
        .checked_mul(Decimal::from(span.duration_ms()))
        .and_then(|total| total.checked_div(Decimal::from(HOUR_MS)))
        .map(|price| price.round_dp(PRICE_SCALE))
        .ok_or(EngineError::LimitExceeded("price out of range"))
}

fn count(outcome: &'static str) {
    metrics::counter!(RESERVATIONS_TOTAL, "outcome" => outcome).increment(1);
}

impl Engine {
    /// Place a pending hold on `[span.start, span.end)` for `user_id`.
    pub async fn request_booking(
        &self,
        user_id: UserId,
        resource_id: ResourceId,
        span: Span,
    ) -> Result<Reservation, EngineError> {
        let now = now_ms();
        validate_span(&span, now)?;

        let listing = self
            .directory
            .listing(resource_id)
            .filter(|l| l.approved)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        let price = price_for(listing.rate_per_hour, &span)?;

        let mut lock = self.lock_resource(resource_id).await?;
        if lock.reservations.len() >= MAX_RESERVATIONS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many reservations on resource"));
        }
        if let Err(e) = check_request(&lock, &span, now, self.config.hold_ttl_ms) {
            count("unavailable");
            debug!(resource_id, user_id, "booking request rejected: {e}");
            return Err(e);
        }
        let reservation = self.create(&mut lock, user_id, span, price, now).await?;
        drop(lock);

        count("held");
        info!(
            id = reservation.id,
            resource_id, user_id, "hold placed, price {}", reservation.total_price
        );
        self.notify(
            user_id,
            &format!(
                "Booking #{} for {} is on hold. Complete payment of {} to confirm.",
                reservation.id, listing.name, reservation.total_price
            ),
            Severity::Info,
        );
        Ok(reservation)
    }

    /// Payment succeeded: `pending → confirmed`, unless a confirmed reservation
    /// already overlaps, in which case this hold is cancelled and the slot is lost.
    pub async fn confirm_payment(&self, id: ReservationId) -> Result<Reservation, EngineError> {
        let (resource_id, mut lock) = self.lock_for_reservation(id).await?;
        let current = lock.get(id).cloned().ok_or(EngineError::NotFound(id))?;
        if current.status != Pending {
            return Err(EngineError::InvalidTransition {
                id,
                from: current.status,
                to: Confirmed,
            });
        }

        if let Err(conflict) = check_confirm(&lock, id, &current.span) {
            self.transition_locked(&mut lock, id, &[Pending], Cancelled, None)
                .await?;
            drop(lock);
            count("lost_race");
            info!(id, resource_id, "confirmation lost to an overlapping booking: {conflict}");
            self.notify(
                current.user_id,
                &format!("Booking #{id} could not be confirmed: the slot was taken. Your hold has been cancelled."),
                Severity::Warning,
            );
            return Err(conflict);
        }

        let confirmed = self
            .transition_locked(&mut lock, id, &[Pending], Confirmed, None)
            .await?;
        drop(lock);

        count("confirmed");
        info!(id, resource_id, "booking confirmed");
        let listing = self.directory.listing(resource_id);
        let venue = listing.as_ref().map_or("your venue", |l| l.name.as_str());
        self.notify(
            confirmed.user_id,
            &format!("Booking #{id} at {venue} is confirmed."),
            Severity::Success,
        );
        if let Some(l) = &listing {
            self.notify(
                l.owner_id,
                &format!("New confirmed booking #{id} on {}.", l.name),
                Severity::Info,
            );
        }
        Ok(confirmed)
    }

    /// Payment failed: `pending → rejected`.
    pub async fn reject_payment(&self, id: ReservationId) -> Result<Reservation, EngineError> {
        let rejected = self.transition_status(id, &[Pending], Rejected, None).await?;
        count("rejected");
        info!(id, "payment failed, hold rejected");
        self.notify(
            rejected.user_id,
            &format!("Payment for booking #{id} failed. The hold has been released."),
            Severity::Error,
        );
        Ok(rejected)
    }

    /// The owning user withdraws a pending hold.
    pub async fn cancel_by_user(
        &self,
        id: ReservationId,
        user_id: UserId,
    ) -> Result<Reservation, EngineError> {
        let cancelled = self
            .transition_status(id, &[Pending], Cancelled, Some(user_id))
            .await?;
        count("cancelled");
        info!(id, user_id, "hold cancelled by user");
        self.notify(user_id, &format!("Booking #{id} was cancelled."), Severity::Info);
        Ok(cancelled)
    }

    /// Pending holds created at or before `now - hold_ttl`.
    pub async fn collect_stale_holds(&self, now: Ms) -> Vec<ReservationId> {
        let cutoff = self.config.hold_ttl_ms;
        let mut stale = Vec::new();
        for rid in self.resource_ids() {
            let Some(rs) = self.get_resource(&rid) else {
                continue;
            };
            let guard = rs.read().await;
            stale.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| r.status == Pending && !r.is_live_hold(now, cutoff))
                    .map(|r| r.id),
            );
        }
        stale
    }

    /// Cancel every stale hold. Returns how many were cancelled.
    pub async fn expire_stale_holds(&self, now: Ms) -> Result<usize, EngineError> {
        let mut expired = 0;
        for id in self.collect_stale_holds(now).await {
            let (_, mut lock) = self.lock_for_reservation(id).await?;
            // Re-check under the lock: payment may have landed since the scan.
            let still_stale = lock
                .get(id)
                .is_some_and(|r| r.status == Pending && !r.is_live_hold(now, self.config.hold_ttl_ms));
            if !still_stale {
                continue;
            }
            let r = self
                .transition_locked(&mut lock, id, &[Pending], Cancelled, None)
                .await?;
            drop(lock);

            expired += 1;
            debug!(id, resource_id = r.resource_id, "expired stale hold");
            self.notify(
                r.user_id,
                &format!("Booking #{id} expired before payment and was released."),
                Severity::Warning,
            );
        }
        if expired > 0 {
            count_expired(expired);
        }
        Ok(expired)
    }
}

fn count_expired(n: usize) {
    metrics::counter!(RESERVATIONS_TOTAL, "outcome" => "expired").increment(n as u64);
}

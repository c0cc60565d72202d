use std::fmt;

use chrono::{DateTime, FixedOffset, Timelike};
use rust_decimal::Decimal;

use crate::model::*;

use super::{Engine, EngineError};

/// Local hour of day with the most confirmed starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeakHour {
    Hour(u32),
    NoData,
}

impl fmt::Display for PeakHour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            PeakHour::Hour(h) => {
                let clock = if h % 12 == 0 { 12 } else { h % 12 };
                let meridiem = if h < 12 { "AM" } else { "PM" };
                write!(f, "{clock:02}:00 {meridiem}")
            }
            PeakHour::NoData => f.write_str("no data"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateStat {
    pub count: u64,
    pub revenue: Decimal,
    pub peak_hour: PeakHour,
}

/// Count, revenue and peak hour over the confirmed reservations in `reservations`.
/// Everything else is ignored. Peak-hour ties go to the earliest hour.
/// Fails with `LimitExceeded` if the revenue does not fit a `Decimal`.
pub fn aggregate<'a>(
    reservations: impl IntoIterator<Item = &'a Reservation>,
    offset: FixedOffset,
) -> Result<AggregateStat, EngineError> {
    let mut count = 0;
    let mut revenue = Decimal::ZERO;
    let mut by_hour = [0u64; 24];
    for r in reservations.into_iter().filter(|r| r.is_confirmed()) {
        count += 1;
        revenue = revenue
            .checked_add(r.total_price)
            .ok_or(EngineError::LimitExceeded("revenue out of range"))?;
        if let Some(start) = DateTime::from_timestamp_millis(r.span.start) {
            by_hour[start.with_timezone(&offset).hour() as usize] += 1;
        }
    }

    let mut peak_hour = PeakHour::NoData;
    let mut best = 0;
    for (hour, &n) in by_hour.iter().enumerate() {
        if n > best {
            best = n;
            peak_hour = PeakHour::Hour(hour as u32);
        }
    }
    Ok(AggregateStat {
        count,
        revenue,
        peak_hour,
    })
}

impl Engine {
    pub async fn platform_stats(&self) -> Result<AggregateStat, EngineError> {
        let confirmed = self.confirmed_snapshot(self.resource_ids()).await?;
        aggregate(&confirmed, self.config.report_offset)
    }

    /// Statistics over every resource the owner lists in the directory.
    pub async fn owner_stats(&self, owner_id: UserId) -> Result<AggregateStat, EngineError> {
        let owned = self
            .directory
            .listings_for_owner(owner_id)
            .into_iter()
            .map(|l| l.id)
            .collect();
        let confirmed = self.confirmed_snapshot(owned).await?;
        aggregate(&confirmed, self.config.report_offset)
    }

    pub async fn resource_stats(&self, resource_id: ResourceId) -> Result<AggregateStat, EngineError> {
        let confirmed = self.confirmed_snapshot(vec![resource_id]).await?;
        aggregate(&confirmed, self.config.report_offset)
    }

    /// Per-resource totals. With an owner: every resource they list, booked or not.
    /// Without: every approved resource. Ordered by category, then revenue
    /// descending, then id.
    pub async fn resource_breakdown(
        &self,
        owner_id: Option<UserId>,
    ) -> Result<Vec<ResourceStats>, EngineError> {
        let listings = match owner_id {
            Some(owner) => self.directory.listings_for_owner(owner),
            None => self
                .directory
                .listings()
                .into_iter()
                .filter(|l| l.approved)
                .collect(),
        };

        let mut rows = Vec::with_capacity(listings.len());
        for listing in listings {
            let confirmed = self.confirmed_snapshot(vec![listing.id]).await?;
            let stat = aggregate(&confirmed, self.config.report_offset)?;
            rows.push(ResourceStats {
                resource_id: listing.id,
                name: listing.name,
                category: listing.category,
                count: stat.count,
                revenue: stat.revenue,
            });
        }
        rows.sort_by(|a, b| {
            a.category
                .cmp(&b.category)
                .then(b.revenue.cmp(&a.revenue))
                .then(a.resource_id.cmp(&b.resource_id))
        });
        Ok(rows)
    }

    /// Clone the confirmed reservations of each resource, one read lock at a time.
    async fn confirmed_snapshot(
        &self,
        resource_ids: Vec<ResourceId>,
    ) -> Result<Vec<Reservation>, EngineError> {
        let mut out = Vec::new();
        for rid in resource_ids {
            let Some(rs) = self.get_resource(&rid) else {
                continue;
            };
            let guard = tokio::time::timeout(self.config.write_timeout, rs.read())
                .await
                .map_err(|_| {
                    EngineError::Persistence(format!("read of resource {rid} timed out"))
                })?;
            out.extend(guard.confirmed().cloned());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn at_hour(id: ReservationId, hour: u32, price: i64, status: ReservationStatus) -> Reservation {
        let start = utc()
            .with_ymd_and_hms(2030, 3, 1, hour, 0, 0)
            .unwrap()
            .timestamp_millis();
        Reservation {
            id,
            user_id: 1,
            resource_id: 1,
            span: Span::new(start, start + HOUR_MS),
            total_price: Decimal::new(price, 0),
            status,
            created_at: 0,
        }
    }

    #[test]
    fn empty_set_has_no_data() {
        let stat = aggregate(&Vec::<Reservation>::new(), utc()).unwrap();
        assert_eq!(stat.count, 0);
        assert_eq!(stat.revenue, Decimal::ZERO);
        assert_eq!(stat.peak_hour, PeakHour::NoData);
        assert_eq!(stat.peak_hour.to_string(), "no data");
    }

    #[test]
    fn only_confirmed_count() {
        use ReservationStatus::*;
        let rs = vec![
            at_hour(1, 10, 100, Confirmed),
            at_hour(2, 10, 100, Pending),
            at_hour(3, 11, 50, Cancelled),
            at_hour(4, 12, 70, Confirmed),
            at_hour(5, 12, 70, Rejected),
        ];
        let stat = aggregate(&rs, utc()).unwrap();
        assert_eq!(stat.count, 2);
        assert_eq!(stat.revenue, Decimal::new(170, 0));
    }

    #[test]
    fn peak_hour_tie_goes_to_earliest() {
        use ReservationStatus::Confirmed;
        let rs = vec![at_hour(1, 14, 10, Confirmed), at_hour(2, 9, 10, Confirmed)];
        let stat = aggregate(&rs, utc()).unwrap();
        assert_eq!(stat.peak_hour, PeakHour::Hour(9));
        assert_eq!(stat.peak_hour.to_string(), "09:00 AM");

        let rs = vec![
            at_hour(1, 9, 10, Confirmed),
            at_hour(2, 14, 10, Confirmed),
            at_hour(3, 14, 10, Confirmed),
        ];
        assert_eq!(aggregate(&rs, utc()).unwrap().peak_hour.to_string(), "02:00 PM");
    }

    #[test]
    fn peak_hour_uses_reporting_offset() {
        let ist = FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap();
        // 04:30 UTC is 10:00 in +05:30.
        let mut r = at_hour(1, 4, 10, ReservationStatus::Confirmed);
        r.span = Span::new(r.span.start + 30 * 60_000, r.span.end + 30 * 60_000);
        assert_eq!(aggregate([&r], ist).unwrap().peak_hour, PeakHour::Hour(10));
    }

    #[test]
    fn revenue_overflow_is_an_error() {
        use ReservationStatus::Confirmed;
        let mut a = at_hour(1, 9, 0, Confirmed);
        a.total_price = Decimal::MAX;
        let mut b = at_hour(2, 10, 0, Confirmed);
        b.total_price = Decimal::MAX;
        assert_eq!(
            aggregate(&vec![a.clone()], utc()).unwrap().revenue,
            Decimal::MAX
        );
        assert_eq!(
            aggregate(&vec![a, b], utc()),
            Err(EngineError::LimitExceeded("revenue out of range"))
        );
    }

    #[test]
    fn clock_rendering() {
        assert_eq!(PeakHour::Hour(0).to_string(), "12:00 AM");
        assert_eq!(PeakHour::Hour(12).to_string(), "12:00 PM");
        assert_eq!(PeakHour::Hour(23).to_string(), "11:00 PM");
    }
}

// Copyright FlexPrice, Inc. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Billing-period arithmetic: the grid of `[start, end)` intervals a
//! subscription advances through, and the day-count proration factor
//! derived from it.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::{Date, Duration, Month, OffsetDateTime, PrimitiveDateTime, Time};
use time_tz::{timezones, OffsetDateTimeExt, PrimitiveDateTimeExt, Tz};

use crate::error::{Error, Result};

/// The cadence at which a subscription's periods repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriod {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    SemiAnnual,
    Annual,
}

/// Whether a subscription's periods are pinned to its own start timestamp
/// (`Anniversary`) or to the civil calendar (`Calendar`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Anniversary,
    Calendar,
}

/// Looks up an IANA timezone by name.
pub fn lookup_tz(name: &str) -> Result<&'static Tz> {
    timezones::get_by_name(name)
        .ok_or_else(|| Error::validation(format!("unknown IANA timezone {name}")))
}

/// A deterministic, monotone sequence of `[start, end)` billing intervals.
#[derive(Debug, Clone, Copy)]
pub struct PeriodGrid {
    anchor: OffsetDateTime,
    period: BillingPeriod,
    period_count: u32,
    cycle: BillingCycle,
    tz: &'static Tz,
}

impl PeriodGrid {
    /// Builds a grid. `period_count` must be at least 1.
    pub fn new(
        anchor: OffsetDateTime,
        period: BillingPeriod,
        period_count: u32,
        cycle: BillingCycle,
        tz: &'static Tz,
    ) -> Result<PeriodGrid> {
        if period_count == 0 {
            return Err(Error::validation("billing_period_count must be >= 1"));
        }
        Ok(PeriodGrid {
            anchor,
            period,
            period_count,
            cycle,
            tz,
        })
    }

    /// The grid's base boundary: for `Anniversary`, the anchor itself; for
    /// `Calendar`, the most recent civil-unit boundary at or before the
    /// anchor, so that the first period always starts on a calendar
    /// boundary rather than on the exact anchor instant.
    fn base(&self) -> OffsetDateTime {
        match self.cycle {
            BillingCycle::Anniversary => self.anchor,
            BillingCycle::Calendar => self.calendar_floor(self.anchor),
        }
    }

    /// Returns the civil-calendar boundary at or before `instant`, in this
    /// grid's timezone: day 1 00:00 of the month for month-based periods,
    /// the Monday 00:00 of the week for `Weekly`, and local midnight for
    /// `Daily`.
    fn calendar_floor(&self, instant: OffsetDateTime) -> OffsetDateTime {
        let local = instant.to_timezone(self.tz);
        let date = local.date();
        let floored_date = match self.period {
            BillingPeriod::Daily => date,
            BillingPeriod::Weekly => {
                let iso_weekday = date.weekday().number_days_from_monday();
                date - Duration::days(iso_weekday as i64)
            }
            BillingPeriod::Monthly | BillingPeriod::Quarterly | BillingPeriod::SemiAnnual => {
                Date::from_calendar_date(date.year(), date.month(), 1)
                    .expect("day 1 is always valid")
            }
            BillingPeriod::Annual => {
                Date::from_calendar_date(date.year(), Month::January, 1)
                    .expect("Jan 1 is always valid")
            }
        };
        resolve_local(PrimitiveDateTime::new(floored_date, Time::MIDNIGHT), self.tz)
    }

    /// Steps `from` forward by exactly `periods` periods' worth of calendar
    /// units, performed as wall-clock arithmetic in the grid's timezone so
    /// that DST transitions shift the UTC instant rather than shortening
    /// the period.
    fn step(&self, from: OffsetDateTime, periods: i64) -> OffsetDateTime {
        let local = from.to_timezone(self.tz);
        let naive = PrimitiveDateTime::new(local.date(), local.time());
        let units = periods * self.period_count as i64;
        let stepped = match self.period {
            BillingPeriod::Daily => naive + Duration::days(units),
            BillingPeriod::Weekly => naive + Duration::weeks(units),
            BillingPeriod::Monthly => add_months(naive, units),
            BillingPeriod::Quarterly => add_months(naive, units * 3),
            BillingPeriod::SemiAnnual => add_months(naive, units * 6),
            BillingPeriod::Annual => add_months(naive, units * 12),
        };
        resolve_local(stepped, self.tz)
    }

    /// The `[start, end)` interval that contains `instant`.
    pub fn interval_containing(&self, instant: OffsetDateTime) -> (OffsetDateTime, OffsetDateTime) {
        let base = self.base();
        let elapsed_periods = self.periods_between(base, instant);
        let start = self.step(base, elapsed_periods);
        let end = self.step(base, elapsed_periods + 1);
        (start, end)
    }

    /// The grid boundary immediately after `boundary`.
    pub fn next(&self, boundary: OffsetDateTime) -> OffsetDateTime {
        let base = self.base();
        let elapsed = self.periods_between(base, boundary);
        let candidate = self.step(base, elapsed);
        let n = if candidate <= boundary {
            elapsed + 1
        } else {
            elapsed
        };
        self.step(base, n)
    }

    /// Counts whole periods elapsed from `base` to `instant`, rounding
    /// down; negative if `instant` precedes `base`. Implemented by
    /// exponential then binary search over `step`, since `step` is
    /// monotone in its integer argument but not affine (months vary in
    /// length).
    fn periods_between(&self, base: OffsetDateTime, instant: OffsetDateTime) -> i64 {
        if instant >= base {
            let mut lo = 0i64;
            let mut hi = 1i64;
            while self.step(base, hi) <= instant && hi < 1 << 30 {
                lo = hi;
                hi *= 2;
            }
            while lo + 1 < hi {
                let mid = lo + (hi - lo) / 2;
                if self.step(base, mid) <= instant {
                    lo = mid;
                } else {
                    hi = mid;
                }
            }
            lo
        } else {
            let mut hi = 0i64;
            let mut lo = -1i64;
            while self.step(base, lo) > instant && lo > -(1 << 30) {
                hi = lo;
                lo *= 2;
            }
            while lo + 1 < hi {
                let mid = lo + (hi - lo) / 2;
                if self.step(base, mid) <= instant {
                    lo = mid;
                } else {
                    hi = mid;
                }
            }
            lo
        }
    }
}

/// Resolves a local (timezone-naive) datetime to an instant, handling the
/// two DST edge cases: an ambiguous fall-back time resolves to its first
/// occurrence (the pre-transition offset), and a nonexistent spring-forward
/// time is pushed forward minute by minute until it resolves, so boundaries
/// never collapse to zero length or overlap their neighbour.
fn resolve_local(naive: PrimitiveDateTime, tz: &'static Tz) -> OffsetDateTime {
    match naive.assume_timezone(tz).take_first() {
        Some(odt) => odt,
        None => {
            let mut probe = naive;
            for _ in 0..180 {
                probe += Duration::minutes(1);
                if let Some(odt) = probe.assume_timezone(tz).take_first() {
                    return odt;
                }
            }
            naive.assume_timezone_utc(tz)
        }
    }
}

/// Adds `months` calendar months to `dt`, clamping the day-of-month to the
/// last valid day of the resulting month (e.g. Jan 31 + 1 month = Feb 28).
fn add_months(dt: PrimitiveDateTime, months: i64) -> PrimitiveDateTime {
    let total_months = dt.year() as i64 * 12 + (dt.month() as i64 - 1) + months;
    let year = total_months.div_euclid(12) as i32;
    let month_index = total_months.rem_euclid(12) as u8;
    let month = Month::try_from(month_index + 1).expect("month index in 1..=12");
    let last_day = days_in_month(year, month);
    let day = dt.day().min(last_day);
    let date = Date::from_calendar_date(year, month, day).expect("clamped day is valid");
    PrimitiveDateTime::new(date, dt.time())
}

fn days_in_month(year: i32, month: Month) -> u8 {
    let next_month_first = if month == Month::December {
        Date::from_calendar_date(year + 1, Month::January, 1)
    } else {
        Date::from_calendar_date(year, month.next(), 1)
    }
    .expect("valid first-of-month");
    let this_month_first = Date::from_calendar_date(year, month, 1).expect("valid first-of-month");
    (next_month_first - this_month_first).whole_days() as u8
}

/// `day_count(subinterval) / day_count(interval)`, using the calendar
/// implied by the grid's timezone. A cancellation on the exact period
/// boundary yields `0`; a zero-length residual (the subinterval equals the
/// whole interval) yields `1`.
pub fn proration_factor(
    interval: (OffsetDateTime, OffsetDateTime),
    subinterval: (OffsetDateTime, OffsetDateTime),
) -> Decimal {
    let (period_start, period_end) = interval;
    let (sub_start, sub_end) = subinterval;
    let total = (period_end - period_start).whole_seconds();
    if total <= 0 {
        return Decimal::ZERO;
    }
    if sub_start == period_start && sub_end == period_start {
        return Decimal::ZERO;
    }
    if sub_start == period_start && sub_end == period_end {
        return Decimal::ONE;
    }
    let consumed = (sub_end - sub_start).whole_seconds().max(0);
    Decimal::from(consumed) / Decimal::from(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn utc_tz() -> &'static Tz {
        lookup_tz("UTC").unwrap()
    }

    #[test]
    fn monthly_anniversary_grid_advances_one_month() {
        let anchor = datetime!(2025-03-15 0:00 UTC);
        let grid = PeriodGrid::new(
            anchor,
            BillingPeriod::Monthly,
            1,
            BillingCycle::Anniversary,
            utc_tz(),
        )
        .unwrap();
        let (start, end) = grid.interval_containing(datetime!(2025-03-25 12:00 UTC));
        assert_eq!(start, anchor);
        assert_eq!(end, datetime!(2025-04-15 0:00 UTC));
        assert_eq!(grid.next(end), datetime!(2025-05-15 0:00 UTC));
    }

    #[test]
    fn monthly_anniversary_clamps_month_end() {
        let anchor = datetime!(2025-01-31 0:00 UTC);
        let grid = PeriodGrid::new(
            anchor,
            BillingPeriod::Monthly,
            1,
            BillingCycle::Anniversary,
            utc_tz(),
        )
        .unwrap();
        assert_eq!(grid.next(anchor), datetime!(2025-02-28 0:00 UTC));
    }

    #[test]
    fn calendar_monthly_floors_to_day_one() {
        let anchor = datetime!(2025-03-15 0:00 UTC);
        let grid = PeriodGrid::new(
            anchor,
            BillingPeriod::Monthly,
            1,
            BillingCycle::Calendar,
            utc_tz(),
        )
        .unwrap();
        let (start, end) = grid.interval_containing(anchor);
        assert_eq!(start, datetime!(2025-03-01 0:00 UTC));
        assert_eq!(end, datetime!(2025-04-01 0:00 UTC));
    }

    #[test]
    fn proration_factor_matches_day_fraction() {
        let period = (datetime!(2025-03-01 0:00 UTC), datetime!(2025-04-01 0:00 UTC));
        let sub = (datetime!(2025-03-01 0:00 UTC), datetime!(2025-03-16 0:00 UTC));
        let f = proration_factor(period, sub);
        assert_eq!(f, Decimal::from(15) / Decimal::from(31));
    }

    #[test]
    fn proration_factor_is_zero_on_exact_boundary() {
        let period = (datetime!(2025-03-01 0:00 UTC), datetime!(2025-04-01 0:00 UTC));
        assert_eq!(
            proration_factor(period, (period.0, period.0)),
            Decimal::ZERO
        );
    }

    #[test]
    fn dst_spring_forward_does_not_shrink_period() {
        // America/New_York springs forward on 2025-03-09 at 02:00 local.
        let ny = lookup_tz("America/New_York").unwrap();
        let anchor = datetime!(2025-02-09 2:30 UTC).to_offset(time::UtcOffset::UTC);
        let anchor = anchor.to_timezone(ny);
        let grid =
            PeriodGrid::new(anchor, BillingPeriod::Monthly, 1, BillingCycle::Anniversary, ny)
                .unwrap();
        let next = grid.next(anchor);
        assert!(next > anchor + Duration::days(27));
    }
}

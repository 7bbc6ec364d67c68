//! Prorated plan-change math
//!
//! Remaining-value method: when a subscription moves between plans mid-period,
//! the subscriber is credited the unused value of the plan being left and
//! charged the value of the new plan over the same remaining span. All money
//! arithmetic is integer minor units with floor rounding; the fraction is
//! computed in `i128` so no amount ever touches floating point.
//!
//! `now` is always an explicit parameter so tests can pin timestamps.

use serde::Serialize;
use time::{Date, Month, OffsetDateTime};

use crate::catalog::Plan;

/// Result of a proration computation.
///
/// `period_start`/`period_end` are the bounds the resulting transaction
/// covers: the remainder of the current period for an in-period change, or a
/// fresh full period when the old one has already lapsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Proration {
    pub proration_charge: i64,
    pub proration_credit: i64,
    pub amount_due: i64,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
}

/// Compute charge/credit for moving `old_plan` -> `new_plan`.
///
/// `bounds` is the subscription's current billing period when one is set.
/// With no period (trial signup, `billing_period = none`) or a period that
/// has already ended, the change starts a fresh month at the full new-plan
/// price with zero credit.
pub fn prorate(
    old_plan: &Plan,
    new_plan: &Plan,
    bounds: Option<(OffsetDateTime, OffsetDateTime)>,
    now: OffsetDateTime,
) -> Proration {
    match bounds {
        Some((period_start, period_end)) if period_end > now && period_end > period_start => {
            let charge = remaining_value(new_plan.price_cents, period_start, period_end, now);
            let credit = remaining_value(old_plan.price_cents, period_start, period_end, now);
            Proration {
                proration_charge: charge,
                proration_credit: credit,
                amount_due: (charge - credit).max(0),
                period_start: now.max(period_start),
                period_end,
            }
        }
        // Lapsed or absent period: nothing left to credit, the new plan is
        // charged in full for a fresh period.
        _ => Proration {
            proration_charge: new_plan.price_cents,
            proration_credit: 0,
            amount_due: new_plan.price_cents,
            period_start: now,
            period_end: add_months(now, 1),
        },
    }
}

/// Value of `price_cents` over the remaining span of the period, floored.
///
/// `remaining / total` is clamped to [0, 1]; a non-positive total yields 0.
fn remaining_value(
    price_cents: i64,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    now: OffsetDateTime,
) -> i64 {
    let total_ms = (period_end - period_start).whole_milliseconds();
    if total_ms <= 0 {
        return 0;
    }
    let remaining_ms = (period_end - now).whole_milliseconds().clamp(0, total_ms);

    // i128 keeps price * remaining from overflowing for any realistic price.
    ((i128::from(price_cents) * remaining_ms) / total_ms) as i64
}

/// Advance a timestamp by calendar months, clamping the day to the target
/// month's length (Jan 31 + 1 month = Feb 28/29).
pub fn add_months(ts: OffsetDateTime, months: i32) -> OffsetDateTime {
    let date = ts.date();
    let zero_based = i32::from(u8::from(date.month())) - 1 + months;
    let year = date.year() + zero_based.div_euclid(12);
    let month_index = zero_based.rem_euclid(12) as u8 + 1;

    let month = Month::try_from(month_index).unwrap_or(date.month());
    let day = date.day().min(time::util::days_in_year_month(year, month));
    let new_date = Date::from_calendar_date(year, month, day).unwrap_or(date);

    ts.replace_date(new_date)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_plan as plan;
    use time::macros::datetime;

    #[test]
    fn half_period_remaining_prorates_both_sides() {
        let old = plan("home_basic", 100_000);
        let new = plan("home_plus", 200_000);
        let start = datetime!(2024-03-01 00:00 UTC);
        let end = datetime!(2024-03-03 00:00 UTC);
        let now = datetime!(2024-03-02 00:00 UTC);

        let p = prorate(&old, &new, Some((start, end)), now);
        assert_eq!(p.proration_charge, 100_000);
        assert_eq!(p.proration_credit, 50_000);
        assert_eq!(p.amount_due, 50_000);
        assert_eq!(p.period_start, now);
        assert_eq!(p.period_end, end);
    }

    #[test]
    fn lapsed_period_charges_full_price_with_zero_credit() {
        let old = plan("home_basic", 100_000);
        let new = plan("home_plus", 200_000);
        let start = datetime!(2024-01-01 00:00 UTC);
        let end = datetime!(2024-02-01 00:00 UTC);
        let now = datetime!(2024-02-15 12:00 UTC);

        let p = prorate(&old, &new, Some((start, end)), now);
        assert_eq!(p.proration_charge, 200_000);
        assert_eq!(p.proration_credit, 0);
        assert_eq!(p.amount_due, 200_000);
        assert_eq!(p.period_start, now);
        assert_eq!(p.period_end, datetime!(2024-03-15 12:00 UTC));
    }

    #[test]
    fn missing_bounds_start_a_fresh_period() {
        let old = plan("home_basic", 100_000);
        let new = plan("home_plus", 200_000);
        let now = datetime!(2024-05-10 08:30 UTC);

        let p = prorate(&old, &new, None, now);
        assert_eq!(p.amount_due, 200_000);
        assert_eq!(p.period_end, datetime!(2024-06-10 08:30 UTC));
    }

    #[test]
    fn now_before_period_start_clamps_to_full_value() {
        let old = plan("home_basic", 100_000);
        let new = plan("home_plus", 200_000);
        let start = datetime!(2024-03-10 00:00 UTC);
        let end = datetime!(2024-04-10 00:00 UTC);
        let now = datetime!(2024-03-01 00:00 UTC);

        let p = prorate(&old, &new, Some((start, end)), now);
        assert_eq!(p.proration_charge, 200_000);
        assert_eq!(p.proration_credit, 100_000);
        assert_eq!(p.amount_due, 100_000);
        // The covered span never starts before the period does.
        assert_eq!(p.period_start, start);
    }

    #[test]
    fn rounding_is_floor_never_negative() {
        // 1/3 of the period remaining: 99_999 / 3 = 33_333 exactly floored.
        let start = datetime!(2024-03-01 00:00 UTC);
        let end = datetime!(2024-03-04 00:00 UTC);
        let now = datetime!(2024-03-03 00:00 UTC);

        assert_eq!(remaining_value(99_999, start, end, now), 33_333);
        assert_eq!(remaining_value(100_000, start, end, now), 33_333);
        assert_eq!(remaining_value(0, start, end, now), 0);
    }

    #[test]
    fn zero_length_period_yields_zero_remaining_value() {
        let at = datetime!(2024-03-01 00:00 UTC);
        assert_eq!(remaining_value(100_000, at, at, at), 0);
    }

    #[test]
    fn large_prices_do_not_overflow() {
        let start = datetime!(2024-01-01 00:00 UTC);
        let end = datetime!(2024-12-31 00:00 UTC);
        let now = datetime!(2024-06-01 00:00 UTC);

        let value = remaining_value(i64::MAX / 2, start, end, now);
        assert!(value > 0);
        assert!(value < i64::MAX / 2);
    }

    #[test]
    fn add_months_clamps_end_of_month() {
        let jan31 = datetime!(2023-01-31 10:00 UTC);
        assert_eq!(add_months(jan31, 1), datetime!(2023-02-28 10:00 UTC));
        assert_eq!(add_months(jan31, 13), datetime!(2024-02-29 10:00 UTC));

        let dec15 = datetime!(2023-12-15 00:00 UTC);
        assert_eq!(add_months(dec15, 1), datetime!(2024-01-15 00:00 UTC));
    }

}

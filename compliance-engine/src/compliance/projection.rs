//! Recurring payment schedule projection.

use chrono::{Days, Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::models::Frequency;
use crate::money::Cents;

/// Hard bound on how many payments one projection schedules.
pub const MAX_PROJECTED_PAYMENTS: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringProjection {
    pub payment_count: u32,
    pub total_projected_amount: Cents,
    /// The next payment after the last scheduled one would cross the ceiling
    pub will_exceed_limit: bool,
    /// Date of the last payment that fits; no payments are issued after it
    pub auto_cancel_date: Option<NaiveDate>,
    pub last_payment_date: Option<NaiveDate>,
}

/// Date of payment `index` (zero-based) in a schedule.
///
/// Month-based frequencies clamp to the last day of shorter months.
pub fn payment_date(start: NaiveDate, frequency: Frequency, index: u32) -> Option<NaiveDate> {
    match frequency {
        Frequency::Weekly => start.checked_add_days(Days::new(7 * index as u64)),
        Frequency::Biweekly => start.checked_add_days(Days::new(14 * index as u64)),
        Frequency::Monthly => start.checked_add_months(Months::new(index)),
        Frequency::Quarterly => start.checked_add_months(Months::new(index.checked_mul(3)?)),
        Frequency::Annually => start.checked_add_months(Months::new(index.checked_mul(12)?)),
    }
}

/// Accumulate payments until the end date, the payment bound, or the first
/// payment that would push the total past `capacity`.
pub fn project_recurring(
    amount: Cents,
    frequency: Frequency,
    start: NaiveDate,
    end: Option<NaiveDate>,
    capacity: Cents,
) -> RecurringProjection {
    let mut total = Cents::ZERO;
    let mut count = 0u32;
    let mut last = None;
    let mut will_exceed = false;

    while count < MAX_PROJECTED_PAYMENTS {
        let Some(date) = payment_date(start, frequency, count) else {
            break;
        };
        if end.is_some_and(|end| date > end) {
            break;
        }
        match total.checked_add(amount) {
            Some(next) if next <= capacity => {
                total = next;
                count += 1;
                last = Some(date);
            }
            _ => {
                will_exceed = true;
                break;
            }
        }
    }

    RecurringProjection {
        payment_count: count,
        total_projected_amount: total,
        will_exceed_limit: will_exceed,
        auto_cancel_date: if will_exceed { last } else { None },
        last_payment_date: last,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_monthly_hundred_dollars_hits_ceiling_on_payment_33() {
        let p = project_recurring(
            Cents::from_dollars(100),
            Frequency::Monthly,
            date(2024, 1, 1),
            None,
            Cents::from_dollars(3300),
        );
        assert_eq!(p.payment_count, 33);
        assert_eq!(p.total_projected_amount, Cents::from_dollars(3300));
        assert!(p.will_exceed_limit);
        assert_eq!(p.auto_cancel_date, Some(date(2026, 9, 1)));
    }

    #[test]
    fn test_end_date_stops_before_ceiling() {
        let p = project_recurring(
            Cents::from_dollars(100),
            Frequency::Monthly,
            date(2024, 1, 1),
            Some(date(2024, 6, 30)),
            Cents::from_dollars(3300),
        );
        assert_eq!(p.payment_count, 6);
        assert!(!p.will_exceed_limit);
        assert_eq!(p.auto_cancel_date, None);
        assert_eq!(p.last_payment_date, Some(date(2024, 6, 1)));
    }

    #[test]
    fn test_payment_bound() {
        let p = project_recurring(
            Cents::new(1),
            Frequency::Weekly,
            date(2024, 1, 1),
            None,
            Cents::from_dollars(3300),
        );
        assert_eq!(p.payment_count, MAX_PROJECTED_PAYMENTS);
        assert!(!p.will_exceed_limit);
    }

    #[test]
    fn test_first_payment_over_capacity() {
        let p = project_recurring(
            Cents::from_dollars(500),
            Frequency::Quarterly,
            date(2024, 1, 1),
            None,
            Cents::from_dollars(400),
        );
        assert_eq!(p.payment_count, 0);
        assert!(p.will_exceed_limit);
        assert_eq!(p.auto_cancel_date, None);
    }

    #[test]
    fn test_month_end_clamps() {
        assert_eq!(
            payment_date(date(2024, 1, 31), Frequency::Monthly, 1),
            Some(date(2024, 2, 29))
        );
        assert_eq!(
            payment_date(date(2024, 1, 1), Frequency::Biweekly, 2),
            Some(date(2024, 1, 29))
        );
        assert_eq!(
            payment_date(date(2024, 2, 29), Frequency::Annually, 1),
            Some(date(2025, 2, 28))
        );
    }
}

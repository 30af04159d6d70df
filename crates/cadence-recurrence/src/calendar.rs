//! Calendar helpers shared by the pattern stepping functions.

use chrono::{Datelike, Days, NaiveDate, Weekday};

use crate::types::Nth;

pub fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if is_leap_year(year) => 29,
        _ => 28,
    }
}

/// Months since year 0, so month arithmetic is plain integer arithmetic.
pub fn month_index(date: NaiveDate) -> i64 {
    i64::from(date.year()) * 12 + i64::from(date.month0())
}

/// Inverse of [`month_index`]: `(year, month 1-12)`.
pub fn from_month_index(index: i64) -> Option<(i32, u32)> {
    let year = i32::try_from(index.div_euclid(12)).ok()?;
    let month = u32::try_from(index.rem_euclid(12)).ok()? + 1;
    Some((year, month))
}

/// The Sunday that opens the week containing `date`.
pub fn week_start(date: NaiveDate) -> Option<NaiveDate> {
    date.checked_sub_days(Days::new(u64::from(date.weekday().num_days_from_sunday())))
}

/// Date of the `nth` `weekday` in the given month.
///
/// `Nth::Last` walks backward from the final day of the month, so it is
/// correct whether the month holds four or five of that weekday.
pub fn nth_weekday_of_month(year: i32, month: u32, weekday: Weekday, nth: Nth) -> Option<NaiveDate> {
    let ordinal = match nth {
        Nth::First => 0,
        Nth::Second => 1,
        Nth::Third => 2,
        Nth::Fourth => 3,
        Nth::Last => {
            let mut day = NaiveDate::from_ymd_opt(year, month, days_in_month(year, month))?;
            while day.weekday() != weekday {
                day = day.pred_opt()?;
            }
            return Some(day);
        }
    };

    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let offset = (weekday.num_days_from_sunday() + 7 - first.weekday().num_days_from_sunday()) % 7;
    NaiveDate::from_ymd_opt(year, month, 1 + offset + 7 * ordinal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn days_in_month_handles_leap_years() {
        assert_eq!(days_in_month(2024, 2), 29);
        assert_eq!(days_in_month(2023, 2), 28);
        assert_eq!(days_in_month(1900, 2), 28);
        assert_eq!(days_in_month(2000, 2), 29);
        assert_eq!(days_in_month(2011, 4), 30);
    }

    #[test]
    fn month_index_roundtrips_across_year_boundary() {
        let idx = month_index(ymd(2011, 12, 5));
        assert_eq!(from_month_index(idx + 1), Some((2012, 1)));
        assert_eq!(from_month_index(idx), Some((2011, 12)));
    }

    #[test]
    fn week_start_is_sunday() {
        // 2011-01-05 was a Wednesday
        assert_eq!(week_start(ymd(2011, 1, 5)), Some(ymd(2011, 1, 2)));
        assert_eq!(week_start(ymd(2011, 1, 2)), Some(ymd(2011, 1, 2)));
    }

    #[test]
    fn nth_weekday_first_and_fourth() {
        assert_eq!(nth_weekday_of_month(2011, 1, Weekday::Sun, Nth::First), Some(ymd(2011, 1, 2)));
        assert_eq!(nth_weekday_of_month(2011, 1, Weekday::Sun, Nth::Fourth), Some(ymd(2011, 1, 23)));
        assert_eq!(nth_weekday_of_month(2011, 2, Weekday::Sun, Nth::Fourth), Some(ymd(2011, 2, 27)));
    }

    #[test]
    fn nth_weekday_last_with_four_and_five_occurrences() {
        // January 2011 has five Sundays, February 2011 has four
        assert_eq!(nth_weekday_of_month(2011, 1, Weekday::Sun, Nth::Last), Some(ymd(2011, 1, 30)));
        assert_eq!(nth_weekday_of_month(2011, 2, Weekday::Sun, Nth::Last), Some(ymd(2011, 2, 27)));
    }
}

use std::iter::FusedIterator;

use chrono::{Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use crate::calendar::{days_in_month, from_month_index, month_index, nth_weekday_of_month, week_start};
use crate::error::{RecurrenceError, Result};
use crate::types::{DayOfWeekMask, Nth, RecurType};

/// Upper bound on interval-sized steps taken while looking for a valid date.
/// Reached only by patterns that can never match (e.g. Feb 30).
const MAX_PERIOD_STEPS: u32 = 400;

/// Day-by-day steps in a weekly scan: the rest of the current week, one jump
/// to the next eligible week, then that whole week.
const WEEKLY_SCAN_STEPS: u32 = 21;

/// Declarative description of a recurring series.
///
/// The pattern itself holds no iteration state. Stepping happens through
/// [`RecurrencePattern::next_occurrence`], which takes and returns an explicit
/// [`SeriesCursor`], or through the [`Occurrences`] iterator that owns one.
///
/// Every occurrence carries the time of day of `date_start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrencePattern {
    /// Storage id, if the pattern has been persisted by a caller.
    #[serde(default)]
    pub id: Option<i64>,
    pub recur_type: RecurType,
    /// Step size in days/weeks/months/years depending on `recur_type`.
    #[serde(default = "default_interval")]
    pub interval: u32,
    pub date_start: NaiveDateTime,
    /// Inclusive end of the series. `None` means open-ended.
    #[serde(default)]
    pub date_end: Option<NaiveDateTime>,
    #[serde(default)]
    pub day_of_week_mask: DayOfWeekMask,
    /// 1-31, used by monthly and yearly.
    #[serde(default)]
    pub day_of_month: Option<u32>,
    /// 1-12, used by yearly and year-nth.
    #[serde(default)]
    pub month_of_year: Option<u32>,
    /// Used by month-nth and year-nth.
    #[serde(default)]
    pub instance: Option<Nth>,
}

fn default_interval() -> u32 {
    1
}

/// Position of a consumer within a series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesCursor {
    /// Last occurrence handed out, `None` before the first call.
    pub last_returned: Option<NaiveDateTime>,
    /// Set once the series has run past `date_end`. Terminal.
    #[serde(default)]
    pub exhausted: bool,
}

impl SeriesCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume a series after an occurrence that was already processed.
    pub fn after(last_returned: NaiveDateTime) -> Self {
        Self {
            last_returned: Some(last_returned),
            exhausted: false,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

impl RecurrencePattern {
    pub fn new(recur_type: RecurType, date_start: NaiveDateTime) -> Self {
        Self {
            id: None,
            recur_type,
            interval: 1,
            date_start,
            date_end: None,
            day_of_week_mask: DayOfWeekMask::empty(),
            day_of_month: None,
            month_of_year: None,
            instance: None,
        }
    }

    pub fn daily(date_start: NaiveDateTime) -> Self {
        Self::new(RecurType::Daily, date_start)
    }

    pub fn weekly(date_start: NaiveDateTime, days: &[Weekday]) -> Self {
        let mut pattern = Self::new(RecurType::Weekly, date_start);
        pattern.day_of_week_mask = days.iter().copied().collect();
        pattern
    }

    pub fn monthly(date_start: NaiveDateTime, day_of_month: u32) -> Self {
        Self::new(RecurType::Monthly, date_start).with_day_of_month(day_of_month)
    }

    pub fn month_nth(date_start: NaiveDateTime, weekday: Weekday, instance: Nth) -> Self {
        let mut pattern = Self::new(RecurType::MonthNth, date_start).with_instance(instance);
        pattern.set_day_of_week(weekday, true);
        pattern
    }

    pub fn yearly(date_start: NaiveDateTime, month_of_year: u32, day_of_month: u32) -> Self {
        Self::new(RecurType::Yearly, date_start)
            .with_month_of_year(month_of_year)
            .with_day_of_month(day_of_month)
    }

    pub fn year_nth(date_start: NaiveDateTime, month_of_year: u32, weekday: Weekday, instance: Nth) -> Self {
        let mut pattern = Self::new(RecurType::YearNth, date_start)
            .with_month_of_year(month_of_year)
            .with_instance(instance);
        pattern.set_day_of_week(weekday, true);
        pattern
    }

    pub fn with_interval(mut self, interval: u32) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_end(mut self, date_end: NaiveDateTime) -> Self {
        self.date_end = Some(date_end);
        self
    }

    pub fn with_day_of_month(mut self, day_of_month: u32) -> Self {
        self.day_of_month = Some(day_of_month);
        self
    }

    pub fn with_month_of_year(mut self, month_of_year: u32) -> Self {
        self.month_of_year = Some(month_of_year);
        self
    }

    pub fn with_instance(mut self, instance: Nth) -> Self {
        self.instance = Some(instance);
        self
    }

    /// Turn a weekday on or off in the mask. Several may be enabled at once.
    pub fn set_day_of_week(&mut self, weekday: Weekday, enabled: bool) {
        self.day_of_week_mask.set(weekday, enabled);
    }

    pub fn day_of_week_mask(&self) -> DayOfWeekMask {
        self.day_of_week_mask
    }

    /// Check that every field `recur_type` depends on is present and in range.
    pub fn validate(&self) -> Result<()> {
        if self.interval == 0 {
            return Err(RecurrenceError::InvalidField {
                field: "interval",
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(end) = self.date_end {
            if end < self.date_start {
                return Err(RecurrenceError::InvalidField {
                    field: "date_end",
                    reason: format!("{end} is before date_start {}", self.date_start),
                });
            }
        }
        if self.day_of_week_mask.bits() & !DayOfWeekMask::ALL != 0 {
            return Err(RecurrenceError::InvalidField {
                field: "day_of_week_mask",
                reason: format!("unknown bits in {:#04x}", self.day_of_week_mask.bits()),
            });
        }

        match self.recur_type {
            RecurType::Daily => {}
            RecurType::Weekly => {
                self.require_mask()?;
            }
            RecurType::Monthly => {
                let dom = self.require_day_of_month()?;
                check_range("day_of_month", dom, 1, 31)?;
            }
            RecurType::MonthNth => {
                self.require_mask()?;
                self.require_instance()?;
            }
            RecurType::Yearly => {
                let moy = self.require_month_of_year()?;
                check_range("month_of_year", moy, 1, 12)?;
                let dom = self.require_day_of_month()?;
                // Leap year so Feb 29 is accepted; non-leap years are skipped when stepping.
                check_range("day_of_month", dom, 1, days_in_month(2000, moy))?;
            }
            RecurType::YearNth => {
                let moy = self.require_month_of_year()?;
                check_range("month_of_year", moy, 1, 12)?;
                self.require_mask()?;
                self.require_instance()?;
            }
        }
        Ok(())
    }

    /// Compute the occurrence following `cursor`.
    ///
    /// Returns `(None, exhausted_cursor)` once the next date would fall after
    /// `date_end`; an exhausted cursor keeps returning `None`. The first call
    /// (fresh cursor) yields `date_start` itself when it matches the pattern,
    /// otherwise the first qualifying date after it.
    pub fn next_occurrence(&self, cursor: &SeriesCursor) -> Result<(Option<NaiveDateTime>, SeriesCursor)> {
        if cursor.exhausted {
            return Ok((None, *cursor));
        }
        self.validate()?;

        let last = cursor.last_returned.map(|dt| dt.date());
        let date = match self.recur_type {
            RecurType::Daily => self.next_daily(last)?,
            RecurType::Weekly => self.next_weekly(last)?,
            RecurType::Monthly => self.next_monthly(last)?,
            RecurType::MonthNth => self.next_month_nth(last)?,
            RecurType::Yearly => self.next_yearly(last)?,
            RecurType::YearNth => self.next_year_nth(last)?,
        };
        let next = date.and_time(self.time_of_day());

        match self.date_end {
            Some(end) if next > end => Ok((
                None,
                SeriesCursor {
                    last_returned: cursor.last_returned,
                    exhausted: true,
                },
            )),
            _ => Ok((Some(next), SeriesCursor::after(next))),
        }
    }

    /// Iterate the series from the beginning.
    pub fn occurrences(&self) -> Occurrences<'_> {
        self.occurrences_from(SeriesCursor::new())
    }

    /// Iterate the series starting after `cursor`.
    pub fn occurrences_from(&self, cursor: SeriesCursor) -> Occurrences<'_> {
        Occurrences {
            pattern: self,
            cursor,
            failed: false,
        }
    }

    /// Collect every occurrence after `cursor` up to and including `to_date`.
    ///
    /// The returned cursor points at the last collected occurrence, so the
    /// first date beyond `to_date` is produced again by the next call.
    pub fn occurrences_until(
        &self,
        cursor: SeriesCursor,
        to_date: NaiveDateTime,
    ) -> Result<(Vec<NaiveDateTime>, SeriesCursor)> {
        let mut dates = Vec::new();
        let mut cursor = cursor;
        loop {
            let (next, advanced) = self.next_occurrence(&cursor)?;
            match next {
                Some(date) if date <= to_date => {
                    dates.push(date);
                    cursor = advanced;
                }
                Some(_) => break,
                None => {
                    cursor = advanced;
                    break;
                }
            }
        }
        Ok((dates, cursor))
    }

    // --- stepping -----------------------------------------------------------

    fn time_of_day(&self) -> NaiveTime {
        self.date_start.time()
    }

    fn next_daily(&self, last: Option<NaiveDate>) -> Result<NaiveDate> {
        match last {
            None => Ok(self.date_start.date()),
            Some(last) => add_days(last, u64::from(self.interval)),
        }
    }

    /// Weeks are Sunday-first and counted from the week holding `date_start`;
    /// only every `interval`-th week is eligible.
    fn next_weekly(&self, last: Option<NaiveDate>) -> Result<NaiveDate> {
        let start_week = week_start(self.date_start.date()).ok_or(RecurrenceError::OutOfRange)?;
        let interval = i64::from(self.interval);
        let mut day = match last {
            None => self.date_start.date(),
            Some(last) => add_days(last, 1)?,
        };

        for _ in 0..WEEKLY_SCAN_STEPS {
            let week = week_start(day).ok_or(RecurrenceError::OutOfRange)?;
            let behind = ((week - start_week).num_days() / 7).rem_euclid(interval);
            if behind != 0 {
                day = add_days(week, 7 * (interval - behind) as u64)?;
                continue;
            }
            if self.day_of_week_mask.contains(day.weekday()) {
                return Ok(day);
            }
            day = add_days(day, 1)?;
        }

        Err(RecurrenceError::SearchExhausted {
            recur_type: self.recur_type,
            limit: WEEKLY_SCAN_STEPS,
        })
    }

    /// Months lacking `day_of_month` are skipped, never clamped.
    fn next_monthly(&self, last: Option<NaiveDate>) -> Result<NaiveDate> {
        let dom = self.require_day_of_month()?;

        let (mut index, step, floor) = match last {
            None => (month_index(self.date_start.date()), 1, Some(self.date_start.date())),
            Some(last) => (month_index(last) + i64::from(self.interval), i64::from(self.interval), None),
        };

        for _ in 0..MAX_PERIOD_STEPS {
            let (year, month) = from_month_index(index).ok_or(RecurrenceError::OutOfRange)?;
            if dom <= days_in_month(year, month) {
                let date = NaiveDate::from_ymd_opt(year, month, dom).ok_or(RecurrenceError::OutOfRange)?;
                if floor.map_or(true, |floor| date >= floor) {
                    return Ok(date);
                }
            }
            index += step;
        }

        Err(self.exhausted_search())
    }

    fn next_month_nth(&self, last: Option<NaiveDate>) -> Result<NaiveDate> {
        let instance = self.require_instance()?;

        let (mut index, step, floor) = match last {
            None => (month_index(self.date_start.date()), 1, self.date_start.date()),
            Some(last) => {
                let floor = add_days(last, 1)?;
                // Another flagged weekday may still fall later in the same month.
                if let Some(date) = self.nth_in_month(last.year(), last.month(), instance, floor) {
                    return Ok(date);
                }
                (month_index(last) + i64::from(self.interval), i64::from(self.interval), floor)
            }
        };

        for _ in 0..MAX_PERIOD_STEPS {
            let (year, month) = from_month_index(index).ok_or(RecurrenceError::OutOfRange)?;
            check_year(year)?;
            if let Some(date) = self.nth_in_month(year, month, instance, floor) {
                return Ok(date);
            }
            index += step;
        }

        Err(self.exhausted_search())
    }

    /// Feb 29 patterns only fire in leap years that sit on the interval grid.
    fn next_yearly(&self, last: Option<NaiveDate>) -> Result<NaiveDate> {
        let moy = self.require_month_of_year()?;
        let dom = self.require_day_of_month()?;

        let (mut year, step, floor) = match last {
            None => (self.date_start.year(), 1, Some(self.date_start.date())),
            Some(last) => (self.years_after(last)?, self.interval_i32()?, None),
        };

        for _ in 0..MAX_PERIOD_STEPS {
            check_year(year)?;
            if let Some(date) = NaiveDate::from_ymd_opt(year, moy, dom) {
                if floor.map_or(true, |floor| date >= floor) {
                    return Ok(date);
                }
            }
            year = year.checked_add(step).ok_or(RecurrenceError::OutOfRange)?;
        }

        Err(self.exhausted_search())
    }

    fn next_year_nth(&self, last: Option<NaiveDate>) -> Result<NaiveDate> {
        let moy = self.require_month_of_year()?;
        let instance = self.require_instance()?;

        let (mut year, step, floor) = match last {
            None => (self.date_start.year(), 1, self.date_start.date()),
            Some(last) => {
                let floor = add_days(last, 1)?;
                if let Some(date) = self.nth_in_month(last.year(), moy, instance, floor) {
                    return Ok(date);
                }
                (self.years_after(last)?, self.interval_i32()?, floor)
            }
        };

        for _ in 0..MAX_PERIOD_STEPS {
            check_year(year)?;
            if let Some(date) = self.nth_in_month(year, moy, instance, floor) {
                return Ok(date);
            }
            year = year.checked_add(step).ok_or(RecurrenceError::OutOfRange)?;
        }

        Err(self.exhausted_search())
    }

    /// Earliest `instance` occurrence of any flagged weekday in the month, on or after `floor`.
    fn nth_in_month(&self, year: i32, month: u32, instance: Nth, floor: NaiveDate) -> Option<NaiveDate> {
        self.day_of_week_mask
            .weekdays()
            .filter_map(|wd| nth_weekday_of_month(year, month, wd, instance))
            .filter(|date| *date >= floor)
            .min()
    }

    fn interval_i32(&self) -> Result<i32> {
        i32::try_from(self.interval).map_err(|_| RecurrenceError::OutOfRange)
    }

    fn years_after(&self, last: NaiveDate) -> Result<i32> {
        last.year()
            .checked_add(self.interval_i32()?)
            .ok_or(RecurrenceError::OutOfRange)
    }

    fn exhausted_search(&self) -> RecurrenceError {
        RecurrenceError::SearchExhausted {
            recur_type: self.recur_type,
            limit: MAX_PERIOD_STEPS,
        }
    }

    // --- required fields ----------------------------------------------------

    fn require_mask(&self) -> Result<DayOfWeekMask> {
        if self.day_of_week_mask.is_empty() {
            return Err(RecurrenceError::MissingField {
                recur_type: self.recur_type,
                field: "day_of_week_mask",
            });
        }
        Ok(self.day_of_week_mask)
    }

    fn require_day_of_month(&self) -> Result<u32> {
        self.day_of_month.ok_or(RecurrenceError::MissingField {
            recur_type: self.recur_type,
            field: "day_of_month",
        })
    }

    fn require_month_of_year(&self) -> Result<u32> {
        self.month_of_year.ok_or(RecurrenceError::MissingField {
            recur_type: self.recur_type,
            field: "month_of_year",
        })
    }

    fn require_instance(&self) -> Result<Nth> {
        self.instance.ok_or(RecurrenceError::MissingField {
            recur_type: self.recur_type,
            field: "instance",
        })
    }
}

fn add_days(date: NaiveDate, days: u64) -> Result<NaiveDate> {
    date.checked_add_days(Days::new(days))
        .ok_or(RecurrenceError::OutOfRange)
}

/// Fail once a search walks past the last year chrono can represent.
fn check_year(year: i32) -> Result<()> {
    if year > NaiveDate::MAX.year() {
        return Err(RecurrenceError::OutOfRange);
    }
    Ok(())
}

fn check_range(field: &'static str, value: u32, min: u32, max: u32) -> Result<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(RecurrenceError::InvalidField {
            field,
            reason: format!("expected {min}-{max}, got {value}"),
        })
    }
}

/// Forward iterator over a series. Ends at `date_end` or after the first error.
#[derive(Debug, Clone)]
pub struct Occurrences<'a> {
    pattern: &'a RecurrencePattern,
    cursor: SeriesCursor,
    failed: bool,
}

impl Occurrences<'_> {
    /// Cursor after the most recently yielded occurrence; persist it to resume later.
    pub fn cursor(&self) -> SeriesCursor {
        self.cursor
    }
}

impl Iterator for Occurrences<'_> {
    type Item = Result<NaiveDateTime>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.cursor.exhausted {
            return None;
        }
        match self.pattern.next_occurrence(&self.cursor) {
            Ok((next, cursor)) => {
                self.cursor = cursor;
                next.map(Ok)
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

impl FusedIterator for Occurrences<'_> {}

use chrono::Weekday;
use serde::{Deserialize, Serialize};

use crate::error::RecurrenceError;

/// How a pattern advances from one occurrence to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurType {
    /// Every `interval` days.
    Daily,
    /// Flagged weekdays of every `interval`-th week.
    Weekly,
    /// `day_of_month` of every `interval`-th month.
    Monthly,
    /// Nth (or last) flagged weekday of every `interval`-th month.
    MonthNth,
    /// `month_of_year`/`day_of_month` every `interval` years.
    Yearly,
    /// Nth (or last) flagged weekday of `month_of_year` every `interval` years.
    YearNth,
}

impl RecurType {
    /// Stable numeric code for integer storage columns.
    pub fn code(self) -> u8 {
        match self {
            RecurType::Daily => 1,
            RecurType::Weekly => 2,
            RecurType::Monthly => 3,
            RecurType::MonthNth => 4,
            RecurType::Yearly => 5,
            RecurType::YearNth => 6,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, RecurrenceError> {
        match code {
            1 => Ok(RecurType::Daily),
            2 => Ok(RecurType::Weekly),
            3 => Ok(RecurType::Monthly),
            4 => Ok(RecurType::MonthNth),
            5 => Ok(RecurType::Yearly),
            6 => Ok(RecurType::YearNth),
            other => Err(RecurrenceError::UnsupportedRecurrence(format!("code {other}"))),
        }
    }
}

impl std::fmt::Display for RecurType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecurType::Daily => "daily",
            RecurType::Weekly => "weekly",
            RecurType::Monthly => "monthly",
            RecurType::MonthNth => "month_nth",
            RecurType::Yearly => "yearly",
            RecurType::YearNth => "year_nth",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RecurType {
    type Err = RecurrenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(RecurType::Daily),
            "weekly" => Ok(RecurType::Weekly),
            "monthly" => Ok(RecurType::Monthly),
            "month_nth" => Ok(RecurType::MonthNth),
            "yearly" => Ok(RecurType::Yearly),
            "year_nth" => Ok(RecurType::YearNth),
            other => Err(RecurrenceError::UnsupportedRecurrence(other.to_string())),
        }
    }
}

/// Which occurrence of a weekday inside a month: 1st–4th or the last one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Nth {
    First,
    Second,
    Third,
    Fourth,
    Last,
}

impl TryFrom<u8> for Nth {
    type Error = RecurrenceError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Nth::First),
            2 => Ok(Nth::Second),
            3 => Ok(Nth::Third),
            4 => Ok(Nth::Fourth),
            5 => Ok(Nth::Last),
            other => Err(RecurrenceError::InvalidField {
                field: "instance",
                reason: format!("expected 1-5, got {other}"),
            }),
        }
    }
}

impl From<Nth> for u8 {
    fn from(nth: Nth) -> u8 {
        match nth {
            Nth::First => 1,
            Nth::Second => 2,
            Nth::Third => 3,
            Nth::Fourth => 4,
            Nth::Last => 5,
        }
    }
}

/// Bitmask of weekdays, Sunday = bit 0 through Saturday = bit 6.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DayOfWeekMask(u8);

impl DayOfWeekMask {
    pub const SUNDAY: u8 = 1;
    pub const MONDAY: u8 = 2;
    pub const TUESDAY: u8 = 4;
    pub const WEDNESDAY: u8 = 8;
    pub const THURSDAY: u8 = 16;
    pub const FRIDAY: u8 = 32;
    pub const SATURDAY: u8 = 64;
    pub const ALL: u8 = 0x7f;

    pub fn empty() -> Self {
        Self(0)
    }

    /// Build a mask from raw bits. Bits above Saturday are kept so that
    /// `RecurrencePattern::validate` can report them.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 & Self::ALL == 0
    }

    pub fn bit(weekday: Weekday) -> u8 {
        1 << weekday.num_days_from_sunday()
    }

    pub fn contains(self, weekday: Weekday) -> bool {
        self.0 & Self::bit(weekday) != 0
    }

    pub fn set(&mut self, weekday: Weekday, enabled: bool) {
        if enabled {
            self.0 |= Self::bit(weekday);
        } else {
            self.0 &= !Self::bit(weekday);
        }
    }

    /// Flagged weekdays in Sunday-first order.
    pub fn weekdays(self) -> impl Iterator<Item = Weekday> {
        [
            Weekday::Sun,
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
        ]
        .into_iter()
        .filter(move |wd| self.contains(*wd))
    }
}

impl FromIterator<Weekday> for DayOfWeekMask {
    fn from_iter<I: IntoIterator<Item = Weekday>>(iter: I) -> Self {
        let mut mask = DayOfWeekMask::empty();
        for wd in iter {
            mask.set(wd, true);
        }
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_bits_match_named_constants() {
        assert_eq!(DayOfWeekMask::bit(Weekday::Sun), DayOfWeekMask::SUNDAY);
        assert_eq!(DayOfWeekMask::bit(Weekday::Wed), DayOfWeekMask::WEDNESDAY);
        assert_eq!(DayOfWeekMask::bit(Weekday::Sat), DayOfWeekMask::SATURDAY);
    }

    #[test]
    fn weekdays_iterates_sunday_first() {
        let mask: DayOfWeekMask = [Weekday::Fri, Weekday::Sun, Weekday::Tue].into_iter().collect();
        let days: Vec<_> = mask.weekdays().collect();
        assert_eq!(days, vec![Weekday::Sun, Weekday::Tue, Weekday::Fri]);
    }

    #[test]
    fn recur_type_codes_and_names() {
        for rt in [
            RecurType::Daily,
            RecurType::Weekly,
            RecurType::Monthly,
            RecurType::MonthNth,
            RecurType::Yearly,
            RecurType::YearNth,
        ] {
            assert_eq!(RecurType::from_code(rt.code()).unwrap(), rt);
            assert_eq!(rt.to_string().parse::<RecurType>().unwrap(), rt);
        }
        assert!(RecurType::from_code(7).is_err());
        assert!("hourly".parse::<RecurType>().is_err());
    }

    #[test]
    fn nth_rejects_out_of_range() {
        assert_eq!(Nth::try_from(5).unwrap(), Nth::Last);
        assert!(Nth::try_from(0).is_err());
        assert!(Nth::try_from(6).is_err());
    }
}

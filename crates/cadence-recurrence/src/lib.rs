//! Calendar recurrence patterns.
//!
//! A [`RecurrencePattern`] describes a series (daily, weekly, monthly, nth
//! weekday of a month, yearly, nth weekday of a given month each year) and
//! computes its occurrences one at a time through an explicit
//! [`SeriesCursor`]. Patterns never mutate while stepping, so the same
//! pattern can be shared by several consumers at different positions.

pub mod calendar;
pub mod error;
pub mod pattern;
pub mod types;

pub use error::{RecurrenceError, Result};
pub use pattern::{Occurrences, RecurrencePattern, SeriesCursor};
pub use types::{DayOfWeekMask, Nth, RecurType};

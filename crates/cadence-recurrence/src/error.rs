use thiserror::Error;

use crate::types::RecurType;

/// Errors raised while validating or stepping a recurrence pattern.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecurrenceError {
    /// A field the chosen recurrence type depends on was never set.
    #[error("{recur_type} recurrence requires {field}")]
    MissingField {
        recur_type: RecurType,
        field: &'static str,
    },

    /// A field is set but holds a value outside its domain.
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// The recurrence type (or its stored code) is not one the engine implements.
    #[error("unsupported recurrence type: {0}")]
    UnsupportedRecurrence(String),

    /// Stepping gave up before finding a qualifying date.
    #[error("no {recur_type} occurrence found within {limit} steps")]
    SearchExhausted { recur_type: RecurType, limit: u32 },

    /// Date arithmetic left the range chrono can represent.
    #[error("date arithmetic overflowed the supported calendar range")]
    OutOfRange,
}

pub type Result<T> = std::result::Result<T, RecurrenceError>;

//! `cadence-core` — configuration and shared error type for the cadence
//! scheduler workspace.

pub mod config;
pub mod error;

pub use config::CadenceConfig;
pub use error::{CoreError, Result};

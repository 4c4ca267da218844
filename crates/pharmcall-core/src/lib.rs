//! Shared configuration, error and identifier types for the pharmacy-call workspace.

pub mod config;
pub mod error;
pub mod types;

pub use config::PharmcallConfig;
pub use error::{PharmcallError, Result};
pub use types::{JobId, PharmacyId, SearchId, UserId};

//! `hearth-core`: configuration and shared error types for the hearth
//! household backend.

pub mod config;
pub mod error;

pub use config::HearthConfig;
pub use error::{HearthError, Result};

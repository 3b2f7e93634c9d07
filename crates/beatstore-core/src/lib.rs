//! `beatstore-core` - configuration and shared error types.

pub mod config;
pub mod error;

pub use config::BeatstoreConfig;
pub use error::{CoreError, Result};

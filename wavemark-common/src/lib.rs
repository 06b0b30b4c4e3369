//! # Wavemark Common Library
//!
//! Shared code for the Wavemark analysis worker:
//! - Error type used across crates
//! - Worker event definitions and EventBus
//! - Configuration loading and resolution

pub mod config;
pub mod error;
pub mod events;

pub use error::{Error, Result};

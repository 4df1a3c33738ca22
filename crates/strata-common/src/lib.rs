//! Strata common types, errors, and utilities.
//!
//! This crate provides shared definitions used across all Strata components.

pub mod address;
pub mod config;
pub mod error;
pub mod field;

pub use address::Address;
pub use config::{CacheConfig, StrataConfig};
pub use error::{Result, StrataError};
pub use field::{FieldValue, FieldVector};

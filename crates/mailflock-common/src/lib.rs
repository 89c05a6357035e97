//! Mailflock Common - Shared types and utilities
//!
//! This crate provides the configuration, error type and identifier
//! aliases shared by the storage, core and server crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, FieldErrors, Result};

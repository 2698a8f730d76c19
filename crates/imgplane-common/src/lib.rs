//! imgplane common - shared types and utilities
//!
//! This crate provides the error taxonomy, domain types and configuration
//! used by the image control plane and its store client.

pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, LockPolicy};
pub use error::{Error, Result};
pub use types::*;

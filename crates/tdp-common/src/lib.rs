//! TDP Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the TDP project.
//!
//! # Overview
//!
//! This crate provides common functionality used across all TDP workspace members:
//!
//! - **Logging**: Centralized tracing bootstrap
//! - **Hashing**: Content hashing for derived business keys
//! - **Types**: The tabular row model every extractor emits
//!
//! # Example
//!
//! ```
//! use tdp_common::types::{Row, Value};
//!
//! let mut row = Row::new();
//! row.push("vehicle_id", Value::Int(42));
//! row.push("route_id", Value::Int(7));
//! assert_eq!(row.columns(), &["vehicle_id", "route_id"]);
//! ```

pub mod hash;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use types::{Row, Value};

//! Filings Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, error handling, and logging setup for the filings workspace.
//!
//! # Overview
//!
//! - **Error Handling**: the workspace-level [`FilingsError`] type
//! - **Logging**: `tracing` initialization shared by every binary
//! - **Types**: the domain types that cross module and crate boundaries
//!   (work items, queue messages, structured statement records)

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{FilingsError, Result};

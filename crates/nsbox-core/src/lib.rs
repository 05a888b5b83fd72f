//! nsbox-core: shared types and errors for the nsbox workspace
//!
//! This crate provides the foundational pieces used by all nsbox crates:
//! - Error types and Result alias
//! - Utility functions (memory parsing, UID/GID queries)

pub mod error;
pub mod utils;

pub use error::{Result, SandboxError};

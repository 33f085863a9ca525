//! Configuration
//!
//! Shared types, the error taxonomy, and option loading.

pub mod loader;
pub mod types;

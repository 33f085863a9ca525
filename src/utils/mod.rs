//! Utility functions and helpers

pub mod fd_closure;

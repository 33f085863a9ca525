//! Thin wrappers around Unix process and signal primitives.
//!
//! All `unsafe` code is concentrated here with explicit SAFETY comments.
//! Dependency direction: signal -> poll -> process

pub mod poll;
pub mod process;
pub mod signal;

//! Fault-isolation core.
//!
//! The supervisor owns context lifecycle and result decoding, the entry runs
//! inside the forked context, and the monitor classifies terminations that
//! produced no envelope.

pub mod entry;
pub mod monitor;
pub mod supervisor;

//! faultbox: run an operation in a forked context so that a fatal signal
//! (invalid memory access, illegal instruction, bus error, abort) becomes an
//! ordinary error value instead of killing the caller.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::process`]: fork, wait with deadline (pidfd or polling fallback), terminate, reap
//! - [`kernel::signal`]: signal names, descriptions, and process-group delivery
//! - [`kernel::poll`]: readiness waiting over raw descriptors
//!
//! ## Transport ([`transport`])
//! - [`transport::frame`]: length-prefixed framing and reassembly
//! - [`transport::channel`]: `Streamed` (pipe) and `Socket` (Unix stream pair) endpoints
//!
//! ## Envelope Codec ([`codec`])
//! - [`codec::envelope`]: success values and raised-error descriptors as JSON
//!
//! ## Isolation Core ([`crate::core`])
//! - [`crate::core::supervisor`]: caller-facing orchestration and result decoding
//! - [`crate::core::entry`]: what runs inside the isolated context
//! - [`crate::core::monitor`]: classification of contexts that produced no envelope
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: options, termination types, and the error taxonomy
//! - [`config::loader`]: JSON and environment loading
//!
//! ## Utilities ([`utils`])
//! - [`utils::fd_closure`]: descriptor closure inside the context
//!
//! # Detection model
//!
//! A fault is never intercepted inside the faulting process. The context
//! writes an envelope only when the operation finishes normally; a context
//! that dies without one is classified from its wait status. Partial state
//! of a faulted context is lost.
//!
//! ```rust,ignore
//! use faultbox::{run_isolated, IsolateError, FaultKind, TransportKind};
//!
//! let outcome = run_isolated(
//!     || Ok::<i32, String>(unsafe { std::ptr::read_volatile(0x8 as *const i32) }),
//!     TransportKind::Streamed,
//! );
//! assert_eq!(outcome.unwrap_err().fault_kind(), Some(FaultKind::Segmentation));
//! ```

// Kernel Primitives
pub mod kernel;

// Transport
pub mod transport;

// Envelope Codec
pub mod codec;

// Isolation Core
pub mod core;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// Wrapper sugar kept outside the core
pub mod wrap;

pub use crate::config::types::{
    ContextState, FaultKind, FaultRecord, IsolateError, IsolateOptions, Result,
    TerminationStatus, TransportKind,
};
pub use crate::core::supervisor::{run_isolated, Invocation, Supervisor};

//! Envelope codec: serialization of an isolated context's outcome.

pub mod envelope;
pub mod finite;

pub use envelope::{decode, encode, value_into, Envelope, ExceptionDescriptor};

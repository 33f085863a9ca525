//! Code that runs inside the isolated context.
//!
//! The entry runs the operation, writes exactly one envelope, closes the
//! transport and returns the exit status for `_exit`. A genuine fault kills
//! the process before the write completes; nothing here tries to catch it.

use crate::codec::envelope::{encode, Envelope};
use crate::kernel::process::EXIT_ENTRY_PANIC;
use crate::transport::Endpoint;
use serde::Serialize;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Exit status after an envelope has been written.
pub const EXIT_ENVELOPE_WRITTEN: i32 = 0;

/// Exit status when the envelope could not be written to the transport.
pub const EXIT_TRANSPORT_FAILURE: i32 = 70;

pub fn run_entry<T, E, F>(op: F, mut endpoint: Endpoint) -> i32
where
    F: FnOnce() -> Result<T, E>,
    T: Serialize,
    E: Serialize,
{
    let envelope = match catch_unwind(AssertUnwindSafe(op)) {
        Ok(Ok(value)) => Envelope::success(&value),
        Ok(Err(error)) => Envelope::raised(&error),
        Err(payload) => Envelope::Panicked {
            message: panic_message(payload.as_ref()),
        },
    };

    let written = encode(&envelope).and_then(|bytes| endpoint.send_frame(&bytes));
    endpoint.close();

    match written {
        Ok(()) => EXIT_ENVELOPE_WRITTEN,
        Err(_) => EXIT_TRANSPORT_FAILURE,
    }
}

/// Entry for operations whose result is thrown away.
pub fn run_discarding_entry<F: FnOnce()>(op: F) -> i32 {
    match catch_unwind(AssertUnwindSafe(op)) {
        Ok(()) => EXIT_ENVELOPE_WRITTEN,
        Err(_) => EXIT_ENTRY_PANIC,
    }
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

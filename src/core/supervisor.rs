use crate::codec::envelope::{decode, value_into, Envelope};
use crate::config::types::{IsolateError, IsolateOptions, Result, TerminationStatus, TransportKind};
use crate::core::entry::{run_discarding_entry, run_entry, EXIT_TRANSPORT_FAILURE};
use crate::core::monitor::{classify, classify_discarded};
use crate::kernel::process::{detect_pidfd_mode, spawn, IsolatedProcess};
use crate::transport::{self, Received};
use crate::utils::fd_closure::close_fds_except;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::os::unix::io::AsRawFd;
use std::thread;
use std::time::Instant;
use uuid::Uuid;

/// An operation with its captured arguments, tagged for logs.
pub struct Invocation<F> {
    id: Uuid,
    label: String,
    op: F,
}

impl<F> Invocation<F> {
    pub fn new(op: F) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: std::any::type_name::<F>().to_string(),
            op,
        }
    }

    pub fn labelled(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Uninhabited error type for infallible operations.
#[derive(Debug, Serialize, Deserialize)]
enum Never {}

/// Caller-facing entry point: runs operations in forked contexts.
///
/// Each call gets its own transport and its own context; the calling thread
/// blocks until the context is gone. Contexts are reaped and transports
/// closed on every path, including errors and timeouts.
#[derive(Clone, Debug, Default)]
pub struct Supervisor {
    options: IsolateOptions,
}

impl Supervisor {
    pub fn new(options: IsolateOptions) -> Result<Self> {
        options.validate()?;
        log::debug!(
            "Supervisor ready: transport={} timeout={:?} pidfd={:?}",
            options.transport,
            options.timeout(),
            detect_pidfd_mode()
        );
        Ok(Self { options })
    }

    pub fn options(&self) -> &IsolateOptions {
        &self.options
    }

    /// Run a fallible operation in isolation.
    ///
    /// The outer `Result` carries isolation failures (faults, timeouts, codec
    /// errors). The inner `Result` is exactly what the operation returned.
    /// A panic inside the operation is resumed in the caller with the same
    /// message.
    pub fn run<T, E, F>(&self, op: F) -> Result<std::result::Result<T, E>>
    where
        F: FnOnce() -> std::result::Result<T, E>,
        T: Serialize + DeserializeOwned,
        E: Serialize + DeserializeOwned,
    {
        self.run_invocation(Invocation::new(op))
    }

    /// Run an infallible operation in isolation.
    pub fn run_value<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> T,
        T: Serialize + DeserializeOwned,
    {
        match self.run(move || Ok::<T, Never>(op()))? {
            Ok(value) => Ok(value),
            Err(never) => match never {},
        }
    }

    pub fn run_invocation<T, E, F>(
        &self,
        invocation: Invocation<F>,
    ) -> Result<std::result::Result<T, E>>
    where
        F: FnOnce() -> std::result::Result<T, E>,
        T: Serialize + DeserializeOwned,
        E: Serialize + DeserializeOwned,
    {
        let Invocation { id, label, op } = invocation;
        let started = Instant::now();

        let (parent, child) =
            transport::open(self.options.transport, self.options.max_envelope_bytes)?;
        let child_fd = child.as_raw_fd();
        let close_fds = self.options.close_inherited_fds;

        let mut process = spawn(move || {
            if close_fds && close_fds_except(&[child_fd]).is_err() {
                return EXIT_TRANSPORT_FAILURE;
            }
            run_entry(op, child)
        })?;
        log::debug!(
            "[{}] '{}' running as pid {} over {} transport",
            id,
            label,
            process.pid(),
            self.options.transport
        );

        let (mut waker, watch) = transport::wake_pair()?;
        let reader = thread::Builder::new()
            .name(format!("faultbox-reader-{}", process.pid()))
            .spawn(move || parent.collect(&watch))
            .map_err(|e| IsolateError::Process(format!("spawn(reader): {e}")))?;

        let termination = self.await_termination(&mut process, id, started);
        waker.wake();
        let received = reader
            .join()
            .map_err(|_| IsolateError::Process("transport reader panicked".to_string()))?;

        let termination = termination?;
        let received = received?;
        log::debug!(
            "[{}] pid {} {} after {:?}",
            id,
            process.pid(),
            termination,
            started.elapsed()
        );

        self.settle(id, process.pid(), &termination, received)
    }

    /// Run an operation whose result is thrown away; only the way the
    /// context ended matters. A clean exit is success.
    pub fn run_discarding<F: FnOnce()>(&self, op: F) -> Result<()> {
        let id = Uuid::new_v4();
        let started = Instant::now();
        let close_fds = self.options.close_inherited_fds;

        let mut process = spawn(move || {
            if close_fds && close_fds_except(&[]).is_err() {
                return EXIT_TRANSPORT_FAILURE;
            }
            run_discarding_entry(op)
        })?;
        log::debug!("[{}] discarding run as pid {}", id, process.pid());

        let termination = self.await_termination(&mut process, id, started)?;
        match classify_discarded(&termination) {
            None => Ok(()),
            Some(verdict) => {
                let err = verdict.into_error();
                log::info!("[{}] pid {} failed: {}", id, process.pid(), err);
                Err(err)
            }
        }
    }

    /// Block until the context terminates, enforcing the deadline if set.
    fn await_termination(
        &self,
        process: &mut IsolatedProcess,
        id: Uuid,
        started: Instant,
    ) -> Result<TerminationStatus> {
        let limit = match self.options.timeout() {
            None => return process.wait(),
            Some(limit) => limit,
        };
        if let Some(status) = process.wait_timeout(limit)? {
            return Ok(status);
        }

        let (report, status) = process.terminate(self.options.kill_grace())?;
        let elapsed = started.elapsed();
        log::warn!(
            "[{}] pid {} exceeded {:?} deadline; term_sent={} kill_sent={} waited_ms={} ({})",
            id,
            process.pid(),
            limit,
            report.term_sent,
            report.kill_sent,
            report.waited_ms,
            status
        );
        for note in &report.notes {
            log::debug!("[{}] {}", id, note);
        }

        Err(IsolateError::Timeout {
            limit,
            elapsed,
            pid: process.pid(),
        })
    }

    fn settle<T, E>(
        &self,
        id: Uuid,
        pid: i32,
        termination: &TerminationStatus,
        received: Received,
    ) -> Result<std::result::Result<T, E>>
    where
        T: DeserializeOwned,
        E: DeserializeOwned,
    {
        match received {
            Received::Frame(bytes) => {
                let envelope = decode(&bytes)?;
                log::debug!(
                    "[{}] pid {} delivered a {} envelope ({} bytes)",
                    id,
                    pid,
                    envelope.variant_name(),
                    bytes.len()
                );
                match envelope {
                    Envelope::Success(value) => Ok(Ok(value_into::<T>(value)?)),
                    Envelope::Raised(descriptor) => Ok(Err(descriptor.rebuild::<E>()?)),
                    Envelope::Panicked { message } => std::panic::resume_unwind(Box::new(message)),
                    Envelope::Unencodable { reason } => Err(IsolateError::Serialization(reason)),
                }
            }
            Received::Closed => Err(self.no_envelope(id, pid, termination)),
            Received::Truncated { expected, received } => {
                if termination.signal().is_some() {
                    return Err(self.no_envelope(id, pid, termination));
                }
                Err(IsolateError::Serialization(format!(
                    "envelope truncated after {} of {} bytes; context {}",
                    received, expected, termination
                )))
            }
        }
    }

    fn no_envelope(
        &self,
        id: Uuid,
        pid: i32,
        termination: &TerminationStatus,
    ) -> IsolateError {
        let err = classify(termination).into_error();
        log::info!("[{}] pid {} produced no envelope: {}", id, pid, err);
        err
    }
}

/// Run `op` in a fresh isolated context over the given transport.
pub fn run_isolated<T, E, F>(op: F, transport: TransportKind) -> Result<std::result::Result<T, E>>
where
    F: FnOnce() -> std::result::Result<T, E>,
    T: Serialize + DeserializeOwned,
    E: Serialize + DeserializeOwned,
{
    Supervisor::new(IsolateOptions::default().with_transport(transport))?.run(op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::FaultKind;
    use std::time::Duration;

    #[test]
    fn invocation_labels() {
        let invocation = Invocation::new(|| 1).labelled("answer");
        assert_eq!(invocation.label(), "answer");
        assert_ne!(invocation.id(), Uuid::nil());
    }

    #[test]
    fn new_rejects_invalid_options() {
        let options = IsolateOptions::default().with_max_envelope_bytes(0);
        assert!(matches!(
            Supervisor::new(options),
            Err(IsolateError::Config(_))
        ));
    }

    #[test]
    fn value_round_trips_through_both_transports() {
        for kind in [TransportKind::Streamed, TransportKind::Socket] {
            let supervisor =
                Supervisor::new(IsolateOptions::default().with_transport(kind)).unwrap();
            let value: Vec<String> = supervisor
                .run_value(|| vec!["a".to_string(), "b".to_string()])
                .unwrap();
            assert_eq!(value, vec!["a", "b"]);
        }
    }

    #[test]
    fn oversized_envelope_is_a_serialization_error() {
        let supervisor =
            Supervisor::new(IsolateOptions::default().with_max_envelope_bytes(64)).unwrap();
        let result = supervisor.run_value(|| "x".repeat(4096));
        assert!(matches!(result, Err(IsolateError::Serialization(_))));
    }

    fn settle_with<T, E>(
        termination: TerminationStatus,
        received: Received,
    ) -> Result<std::result::Result<T, E>>
    where
        T: DeserializeOwned,
        E: DeserializeOwned,
    {
        Supervisor::default().settle(Uuid::new_v4(), 0, &termination, received)
    }

    fn segfault() -> TerminationStatus {
        TerminationStatus::Signaled {
            signal: libc::SIGSEGV,
            core_dumped: false,
        }
    }

    fn framed(envelope: &Envelope) -> Received {
        Received::Frame(crate::codec::envelope::encode(envelope).unwrap())
    }

    #[test]
    fn undecodable_frame_is_a_serialization_error() {
        let result = settle_with::<u8, String>(
            TerminationStatus::Exited(0),
            Received::Frame(b"garbage".to_vec()),
        );
        assert!(matches!(result, Err(IsolateError::Serialization(_))));
    }

    #[test]
    fn truncated_frame_after_a_signal_is_a_fault() {
        let result = settle_with::<u8, String>(
            segfault(),
            Received::Truncated {
                expected: 128,
                received: 17,
            },
        );
        let err = result.unwrap_err();
        assert_eq!(err.fault_kind(), Some(FaultKind::Segmentation));
    }

    #[test]
    fn truncated_frame_after_a_clean_exit_is_a_serialization_error() {
        let result = settle_with::<u8, String>(
            TerminationStatus::Exited(0),
            Received::Truncated {
                expected: 128,
                received: 17,
            },
        );
        match result {
            Err(IsolateError::Serialization(message)) => {
                assert!(message.contains("17 of 128"), "{}", message)
            }
            other => panic!("unexpected settle result {:?}", other),
        }
    }

    #[test]
    fn closed_transport_defers_to_the_termination_status() {
        let fault = settle_with::<u8, String>(segfault(), Received::Closed).unwrap_err();
        assert!(fault.is_fault());

        let violation =
            settle_with::<u8, String>(TerminationStatus::Exited(0), Received::Closed).unwrap_err();
        assert!(matches!(violation, IsolateError::ProtocolViolation));

        let unknown =
            settle_with::<u8, String>(TerminationStatus::Exited(9), Received::Closed).unwrap_err();
        assert!(matches!(unknown, IsolateError::UnknownFailure { exit_code: 9 }));
    }

    #[test]
    fn complete_envelope_wins_over_a_later_signal() {
        let result =
            settle_with::<u8, String>(segfault(), framed(&Envelope::success(&7u8))).unwrap();
        assert_eq!(result, Ok(7));
    }

    #[test]
    fn raised_error_of_another_type_is_a_serialization_error() {
        #[derive(Serialize)]
        struct Elsewhere(String);

        let result = settle_with::<u8, String>(
            TerminationStatus::Exited(0),
            framed(&Envelope::raised(&Elsewhere("nope".to_string()))),
        );
        match result {
            Err(IsolateError::Serialization(message)) => {
                assert!(message.contains("cannot be rebuilt"), "{}", message)
            }
            other => panic!("unexpected settle result {:?}", other),
        }
    }

    #[test]
    fn unencodable_envelope_surfaces_its_reason() {
        let result = settle_with::<f64, String>(
            TerminationStatus::Exited(0),
            framed(&Envelope::success(&f64::NAN)),
        );
        match result {
            Err(IsolateError::Serialization(reason)) => assert!(reason.contains("non-finite")),
            other => panic!("unexpected settle result {:?}", other),
        }
    }

    #[test]
    fn deadline_is_not_applied_to_fast_contexts() {
        let supervisor = Supervisor::new(
            IsolateOptions::default().with_timeout(Duration::from_secs(10)),
        )
        .unwrap();
        assert_eq!(supervisor.run_value(|| 5u8).unwrap(), 5);
    }
}

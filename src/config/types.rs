use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default upper bound for one envelope frame (64 MiB).
pub const DEFAULT_MAX_ENVELOPE_BYTES: usize = 64 * 1024 * 1024;

/// Byte channel used to carry the envelope back from the isolated context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// One-shot unidirectional pipe scoped to a single invocation.
    #[default]
    Streamed,
    /// Duplex stream-oriented Unix socket pair.
    Socket,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Streamed => "streamed",
            Self::Socket => "socket",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = IsolateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "streamed" | "stream" | "pipe" => Ok(Self::Streamed),
            "socket" => Ok(Self::Socket),
            other => Err(IsolateError::Config(format!(
                "unknown transport '{}': expected 'streamed' or 'socket'",
                other
            ))),
        }
    }
}

/// Whole milliseconds covering `d`, so a deadline never fires before it.
fn millis_rounded_up(d: Duration) -> u64 {
    let millis = (d.as_nanos() + 999_999) / 1_000_000;
    millis.min(u128::from(u64::MAX)) as u64
}

/// Per-supervisor execution options.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolateOptions {
    /// Transport used for the result envelope
    pub transport: TransportKind,
    /// Deadline for the isolated context, in milliseconds (none = wait forever)
    pub timeout_ms: Option<u64>,
    /// Grace period between SIGTERM and SIGKILL when a deadline expires
    pub kill_grace_ms: u64,
    /// Largest envelope frame the supervisor accepts
    pub max_envelope_bytes: usize,
    /// Close every inherited descriptor in the context except stdio and the transport
    pub close_inherited_fds: bool,
}

impl Default for IsolateOptions {
    fn default() -> Self {
        Self {
            transport: TransportKind::Streamed,
            timeout_ms: None,
            kill_grace_ms: 0,
            max_envelope_bytes: DEFAULT_MAX_ENVELOPE_BYTES,
            close_inherited_fds: false,
        }
    }
}

impl IsolateOptions {
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(millis_rounded_up(timeout));
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace_ms = millis_rounded_up(grace);
        self
    }

    pub fn with_max_envelope_bytes(mut self, limit: usize) -> Self {
        self.max_envelope_bytes = limit;
        self
    }

    pub fn with_close_inherited_fds(mut self, enabled: bool) -> Self {
        self.close_inherited_fds = enabled;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Reject option combinations that can never produce a result.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == Some(0) {
            return Err(IsolateError::Config(
                "timeout_ms must be greater than zero when set".to_string(),
            ));
        }
        if self.max_envelope_bytes == 0 {
            return Err(IsolateError::Config(
                "max_envelope_bytes must be greater than zero".to_string(),
            ));
        }
        if self.max_envelope_bytes > u32::MAX as usize {
            return Err(IsolateError::Config(format!(
                "max_envelope_bytes {} exceeds the frame header range ({})",
                self.max_envelope_bytes,
                u32::MAX
            )));
        }
        Ok(())
    }
}

/// How an isolated context ended, as reported by `waitpid`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationStatus {
    Exited(i32),
    Signaled { signal: i32, core_dumped: bool },
}

impl TerminationStatus {
    pub fn signal(&self) -> Option<i32> {
        match self {
            Self::Signaled { signal, .. } => Some(*signal),
            Self::Exited(_) => None,
        }
    }
}

impl fmt::Display for TerminationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with status {}", code),
            Self::Signaled {
                signal,
                core_dumped,
            } => {
                write!(
                    f,
                    "killed by {}",
                    crate::kernel::signal::signal_name(*signal)
                )?;
                if *core_dumped {
                    f.write_str(" (core dumped)")?;
                }
                Ok(())
            }
        }
    }
}

/// Liveness of an isolated context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextState {
    Running,
    Exited(i32),
    Killed(i32),
}

/// Fatal signal families surfaced as faults.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    Segmentation,
    BusError,
    IllegalInstruction,
    FloatingPointException,
    Abort,
    Other(i32),
}

impl FaultKind {
    pub fn from_signal(signal: i32) -> Self {
        match signal {
            libc::SIGSEGV => Self::Segmentation,
            libc::SIGBUS => Self::BusError,
            libc::SIGILL => Self::IllegalInstruction,
            libc::SIGFPE => Self::FloatingPointException,
            libc::SIGABRT => Self::Abort,
            other => Self::Other(other),
        }
    }
}

/// Synthesized when a context dies from a signal without writing an envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRecord {
    pub kind: FaultKind,
    pub signal: i32,
    pub core_dumped: bool,
}

impl FaultRecord {
    pub fn from_signal(signal: i32, core_dumped: bool) -> Self {
        Self {
            kind: FaultKind::from_signal(signal),
            signal,
            core_dumped,
        }
    }
}

impl fmt::Display for FaultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} caught: {}",
            crate::kernel::signal::signal_name(self.signal),
            crate::kernel::signal::signal_description(self.signal)
        )?;
        if self.core_dumped {
            f.write_str(" (core dumped)")?;
        }
        Ok(())
    }
}

/// Custom error types for faultbox
#[derive(Error, Debug)]
pub enum IsolateError {
    /// The isolated context was killed by a fatal signal.
    #[error("{0}")]
    Fault(FaultRecord),

    /// The context exited with a nonzero status and produced no envelope.
    #[error("isolated context exited with status {exit_code} without a result")]
    UnknownFailure { exit_code: i32 },

    /// The context exited cleanly but produced no envelope.
    #[error("isolated context reported success but produced no result envelope")]
    ProtocolViolation,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("isolated context (pid {pid}) exceeded its {limit:?} deadline after {elapsed:?}")]
    Timeout {
        limit: Duration,
        elapsed: Duration,
        pid: i32,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl IsolateError {
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Fault(_))
    }

    pub fn fault_kind(&self) -> Option<FaultKind> {
        match self {
            Self::Fault(record) => Some(record.kind),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, IsolateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_kind_maps_fatal_signals() {
        assert_eq!(FaultKind::from_signal(libc::SIGSEGV), FaultKind::Segmentation);
        assert_eq!(FaultKind::from_signal(libc::SIGBUS), FaultKind::BusError);
        assert_eq!(FaultKind::from_signal(libc::SIGILL), FaultKind::IllegalInstruction);
        assert_eq!(
            FaultKind::from_signal(libc::SIGFPE),
            FaultKind::FloatingPointException
        );
        assert_eq!(FaultKind::from_signal(libc::SIGABRT), FaultKind::Abort);
        assert_eq!(
            FaultKind::from_signal(libc::SIGKILL),
            FaultKind::Other(libc::SIGKILL)
        );
    }

    #[test]
    fn fault_record_display_names_signal() {
        let record = FaultRecord::from_signal(libc::SIGSEGV, true);
        let text = record.to_string();
        assert!(text.starts_with("SIGSEGV caught: "), "{}", text);
        assert!(text.ends_with(" (core dumped)"), "{}", text);

        let plain = FaultRecord::from_signal(libc::SIGABRT, false).to_string();
        assert!(plain.starts_with("SIGABRT caught: "), "{}", plain);
        assert!(!plain.contains("core dumped"));
    }

    #[test]
    fn transport_kind_parses_and_serializes() {
        assert_eq!("socket".parse::<TransportKind>().unwrap(), TransportKind::Socket);
        assert_eq!(" Streamed ".parse::<TransportKind>().unwrap(), TransportKind::Streamed);
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());

        let json = serde_json::to_string(&TransportKind::Socket).unwrap();
        assert_eq!(json, "\"socket\"");
    }

    #[test]
    fn options_validation() {
        assert!(IsolateOptions::default().validate().is_ok());

        let zero_timeout = IsolateOptions {
            timeout_ms: Some(0),
            ..IsolateOptions::default()
        };
        assert!(matches!(
            zero_timeout.validate(),
            Err(IsolateError::Config(_))
        ));

        let zero_envelope = IsolateOptions::default().with_max_envelope_bytes(0);
        assert!(zero_envelope.validate().is_err());
    }

    #[test]
    fn sub_millisecond_durations_round_up() {
        let short = IsolateOptions::default().with_timeout(Duration::from_micros(500));
        assert_eq!(short.timeout_ms, Some(1));
        assert!(short.validate().is_ok());

        let uneven = IsolateOptions::default()
            .with_timeout(Duration::from_micros(1999))
            .with_kill_grace(Duration::from_nanos(1));
        assert_eq!(uneven.timeout(), Some(Duration::from_millis(2)));
        assert!(uneven.timeout().unwrap() >= Duration::from_micros(1999));
        assert_eq!(uneven.kill_grace_ms, 1);

        let exact = IsolateOptions::default().with_timeout(Duration::from_secs(1));
        assert_eq!(exact.timeout_ms, Some(1000));
        assert_eq!(IsolateOptions::default().with_kill_grace(Duration::ZERO).kill_grace_ms, 0);
    }

    #[test]
    fn error_accessors() {
        let fault = IsolateError::Fault(FaultRecord::from_signal(libc::SIGILL, false));
        assert!(fault.is_fault());
        assert_eq!(fault.fault_kind(), Some(FaultKind::IllegalInstruction));

        let timeout = IsolateError::Timeout {
            limit: Duration::from_secs(1),
            elapsed: Duration::from_secs(1),
            pid: 42,
        };
        assert!(timeout.is_timeout());
        assert!(!timeout.is_fault());
        assert_eq!(IsolateError::ProtocolViolation.fault_kind(), None);
    }
}

//! Concurrent invocations from several caller threads.
//!
//! Each invocation owns its transport and its context, so outcomes must not
//! leak between threads even when faults and successes interleave.

use faultbox::{FaultKind, IsolateError, IsolateOptions, Supervisor, TransportKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;

const THREADS: usize = 8;
const ROUNDS: usize = 6;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Rejected {
    worker: usize,
    round: usize,
}

#[derive(Debug)]
enum Outcome {
    Value(usize),
    Raised(Rejected),
    Fault(Option<FaultKind>),
    Other(String),
}

fn invoke(supervisor: &Supervisor, worker: usize, round: usize) -> Outcome {
    let result = supervisor.run(move || match (worker + round) % 3 {
        0 => Ok(worker * 1000 + round),
        1 => Err(Rejected { worker, round }),
        _ => Ok(unsafe { std::ptr::read_volatile(0x8 as *const usize) }),
    });
    match result {
        Ok(Ok(value)) => Outcome::Value(value),
        Ok(Err(rejected)) => Outcome::Raised(rejected),
        Err(e @ IsolateError::Fault(_)) => Outcome::Fault(e.fault_kind()),
        Err(other) => Outcome::Other(other.to_string()),
    }
}

fn run_mixed(kind: TransportKind) {
    let _ = env_logger::builder().is_test(true).try_init();
    let supervisor = Arc::new(
        Supervisor::new(IsolateOptions::default().with_transport(kind)).unwrap(),
    );

    let handles: Vec<_> = (0..THREADS)
        .map(|worker| {
            let supervisor = Arc::clone(&supervisor);
            thread::spawn(move || {
                (0..ROUNDS)
                    .map(|round| (round, invoke(&supervisor, worker, round)))
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    for (worker, handle) in handles.into_iter().enumerate() {
        for (round, outcome) in handle.join().unwrap() {
            match ((worker + round) % 3, outcome) {
                (0, Outcome::Value(value)) => assert_eq!(value, worker * 1000 + round),
                (1, Outcome::Raised(rejected)) => {
                    assert_eq!(rejected, Rejected { worker, round })
                }
                (2, Outcome::Fault(kind)) => assert_eq!(kind, Some(FaultKind::Segmentation)),
                (expected, outcome) => panic!(
                    "worker {} round {}: expected class {}, got {:?}",
                    worker, round, expected, outcome
                ),
            }
        }
    }
}

#[test]
fn mixed_outcomes_over_streamed_transport() {
    run_mixed(TransportKind::Streamed);
}

#[test]
fn mixed_outcomes_over_socket_transport() {
    run_mixed(TransportKind::Socket);
}

#[test]
fn shared_supervisor_survives_a_burst_of_faults() {
    let supervisor = Arc::new(Supervisor::default());
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let supervisor = Arc::clone(&supervisor);
            thread::spawn(move || {
                supervisor
                    .run_value(|| -> u8 { std::process::abort() })
                    .map_err(|e| e.fault_kind())
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), Err(Some(FaultKind::Abort)));
    }
    assert_eq!(supervisor.run_value(|| 1u8).unwrap(), 1);
}

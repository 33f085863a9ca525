//! Wrapper sugar: turn a function into one that always runs isolated.
//!
//! ```rust,ignore
//! use faultbox::wrap::isolate;
//!
//! let parse = isolate(|input: String| input.parse::<i64>().map_err(|e| e.to_string()));
//! assert_eq!(parse("42".to_string())?, Ok(42));
//! ```

use crate::config::types::{IsolateOptions, Result};
use crate::core::supervisor::Supervisor;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Wrap `op` with default options.
pub fn isolate<A, T, E, F>(op: F) -> impl Fn(A) -> Result<std::result::Result<T, E>>
where
    F: Fn(A) -> std::result::Result<T, E>,
    T: Serialize + DeserializeOwned,
    E: Serialize + DeserializeOwned,
{
    let supervisor = Supervisor::default();
    move |args| supervisor.run(|| op(args))
}

/// Wrap `op` with explicit options. Options are validated once, up front.
pub fn isolate_with<A, T, E, F>(
    options: IsolateOptions,
    op: F,
) -> Result<impl Fn(A) -> Result<std::result::Result<T, E>>>
where
    F: Fn(A) -> std::result::Result<T, E>,
    T: Serialize + DeserializeOwned,
    E: Serialize + DeserializeOwned,
{
    let supervisor = Supervisor::new(options)?;
    Ok(move |args| supervisor.run(|| op(args)))
}

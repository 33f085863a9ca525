/// Option loading from JSON files and FAULTBOX_* environment variables
use crate::config::types::{IsolateError, IsolateOptions, Result, TransportKind};
use std::path::Path;

pub const ENV_TRANSPORT: &str = "FAULTBOX_TRANSPORT";
pub const ENV_TIMEOUT_MS: &str = "FAULTBOX_TIMEOUT_MS";
pub const ENV_KILL_GRACE_MS: &str = "FAULTBOX_KILL_GRACE_MS";
pub const ENV_MAX_ENVELOPE_BYTES: &str = "FAULTBOX_MAX_ENVELOPE_BYTES";
pub const ENV_CLOSE_INHERITED_FDS: &str = "FAULTBOX_CLOSE_INHERITED_FDS";

/// Load options from a JSON file. Missing keys keep their defaults.
pub fn load_options<P: AsRef<Path>>(path: P) -> Result<IsolateOptions> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        IsolateError::Config(format!(
            "Failed to read options file {}: {}",
            path.display(),
            e
        ))
    })?;

    let options: IsolateOptions = serde_json::from_str(&content)
        .map_err(|e| IsolateError::Config(format!("Failed to parse options JSON: {}", e)))?;
    options.validate()?;

    log::debug!("Loaded isolate options from {}", path.display());
    Ok(options)
}

impl IsolateOptions {
    /// Defaults overridden by any FAULTBOX_* variables present in the environment.
    pub fn from_env() -> Result<Self> {
        apply_overrides(Self::default(), |key| std::env::var(key).ok())
    }
}

/// Apply overrides from `lookup` on top of `base`, then validate the result.
pub fn apply_overrides<F>(mut options: IsolateOptions, lookup: F) -> Result<IsolateOptions>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(ENV_TRANSPORT) {
        options.transport = value.parse::<TransportKind>()?;
    }
    if let Some(value) = lookup(ENV_TIMEOUT_MS) {
        options.timeout_ms = if value.trim().is_empty() {
            None
        } else {
            Some(parse_number(ENV_TIMEOUT_MS, &value)?)
        };
    }
    if let Some(value) = lookup(ENV_KILL_GRACE_MS) {
        options.kill_grace_ms = parse_number(ENV_KILL_GRACE_MS, &value)?;
    }
    if let Some(value) = lookup(ENV_MAX_ENVELOPE_BYTES) {
        options.max_envelope_bytes = parse_number(ENV_MAX_ENVELOPE_BYTES, &value)?;
    }
    if let Some(value) = lookup(ENV_CLOSE_INHERITED_FDS) {
        options.close_inherited_fds = parse_flag(ENV_CLOSE_INHERITED_FDS, &value)?;
    }

    options.validate()?;
    Ok(options)
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| IsolateError::Config(format!("{}='{}' is not a valid number: {}", key, value, e)))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(IsolateError::Config(format!(
            "{}='{}' is not a boolean",
            key, other
        ))),
    }
}

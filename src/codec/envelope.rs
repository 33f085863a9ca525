//! Result envelope written by an isolated context before it exits.
//!
//! The wire form is JSON (serde_json). A success carries the returned value;
//! a raised error carries an [`ExceptionDescriptor`]: a type identifier plus
//! the ordered constructor arguments needed to rebuild it on the other side.

use crate::codec::finite::ensure_finite;
use crate::config::types::{IsolateError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Envelope {
    /// The operation returned normally.
    Success(Value),
    /// The operation returned an error through ordinary control flow.
    Raised(ExceptionDescriptor),
    /// The operation panicked; the panic message is carried over.
    Panicked { message: String },
    /// The outcome existed but could not be represented by the codec.
    Unencodable { reason: String },
}

impl Envelope {
    /// Wrap a returned value, or describe why it cannot be encoded.
    pub fn success<T: Serialize>(value: &T) -> Self {
        let encoded = ensure_finite(value)
            .map_err(|e| e.to_string())
            .and_then(|()| serde_json::to_value(value).map_err(|e| e.to_string()));
        match encoded {
            Ok(value) => Self::Success(value),
            Err(e) => Self::Unencodable {
                reason: format!(
                    "return value of type {} is not representable: {}",
                    std::any::type_name::<T>(),
                    e
                ),
            },
        }
    }

    /// Describe a raised error, or why it cannot be encoded.
    pub fn raised<E: Serialize>(error: &E) -> Self {
        match ExceptionDescriptor::capture(error) {
            Ok(descriptor) => Self::Raised(descriptor),
            Err(e) => Self::Unencodable {
                reason: format!(
                    "raised error of type {} is not representable: {}",
                    std::any::type_name::<E>(),
                    e
                ),
            },
        }
    }

    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Raised(_) => "raised",
            Self::Panicked { .. } => "panicked",
            Self::Unencodable { .. } => "unencodable",
        }
    }
}

/// Type identity plus ordered constructor arguments of a raised error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExceptionDescriptor {
    pub type_name: String,
    pub args: Vec<Value>,
    /// Whether `args` is the unpacked form of a sequence (tuple variants,
    /// tuple structs) rather than a single argument.
    #[serde(default)]
    pub packed: bool,
}

impl ExceptionDescriptor {
    pub fn capture<E: Serialize>(error: &E) -> serde_json::Result<Self> {
        ensure_finite(error).map_err(<serde_json::Error as serde::ser::Error>::custom)?;
        let (args, packed) = match serde_json::to_value(error)? {
            Value::Array(items) => (items, true),
            single => (vec![single], false),
        };
        Ok(Self {
            type_name: std::any::type_name::<E>().to_string(),
            args,
            packed,
        })
    }

    /// Rebuild the original error. The stored type identifier must match `E`.
    pub fn rebuild<E: DeserializeOwned>(self) -> Result<E> {
        let expected = std::any::type_name::<E>();
        if self.type_name != expected {
            return Err(IsolateError::Serialization(format!(
                "raised error of type {} cannot be rebuilt as {}",
                self.type_name, expected
            )));
        }

        let value = if self.packed {
            Value::Array(self.args)
        } else {
            let mut args = self.args;
            if args.len() != 1 {
                return Err(IsolateError::Serialization(format!(
                    "raised error of type {} carries {} arguments, expected 1",
                    expected,
                    args.len()
                )));
            }
            args.remove(0)
        };

        serde_json::from_value(value).map_err(|e| {
            IsolateError::Serialization(format!("failed to rebuild {}: {}", expected, e))
        })
    }
}

pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    serde_json::to_vec(envelope)
        .map_err(|e| IsolateError::Serialization(format!("failed to encode envelope: {}", e)))
}

pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    serde_json::from_slice(bytes)
        .map_err(|e| IsolateError::Serialization(format!("failed to decode envelope: {}", e)))
}

/// Convert a success payload into the caller's value type.
pub fn value_into<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| {
        IsolateError::Serialization(format!(
            "failed to decode return value as {}: {}",
            std::any::type_name::<T>(),
            e
        ))
    })
}

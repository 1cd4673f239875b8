//! Device identifiers.
//!
//! A [`Device`] names where a model's weights currently live ("cuda", "cuda:1",
//! "cpu", "mps"). The cache never interprets the name beyond equality: a model
//! is execution-resident when its device equals the configured execution
//! device, and "loaded" whenever it is anywhere other than the storage device.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque device identifier, compared by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Device(String);

impl Device {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Default CUDA device.
    pub fn cuda() -> Self {
        Self::new("cuda")
    }

    /// Host memory.
    pub fn cpu() -> Self {
        Self::new("cpu")
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Device {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

//! Benchmark envelope and random filler generation.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::time::Duration;

use crate::error::{BenchError, Result};

/// Default filler length in bytes (hex output is twice as long)
pub const DEFAULT_FILLER_SIZE: usize = 500;

/// Generate `size` random bytes encoded as a lowercase hex string.
///
/// Not cryptographically secure; the output only pads the payload to a
/// realistic size.
pub fn generate_filler(size: usize) -> Result<String> {
    if size == 0 {
        return Err(BenchError::InvalidArgument(
            "Number of bytes must be a positive integer".to_string(),
        ));
    }

    let mut rng = rand::thread_rng();
    let mut out = String::with_capacity(size * 2);
    for _ in 0..size {
        let byte: u8 = rng.gen();
        // Writing to a String cannot fail
        let _ = write!(out, "{:02x}", byte);
    }

    Ok(out)
}

/// A validated, strictly positive filler size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillerSize(usize);

impl FillerSize {
    pub fn get(self) -> usize {
        self.0
    }
}

impl Default for FillerSize {
    fn default() -> Self {
        Self(DEFAULT_FILLER_SIZE)
    }
}

impl TryFrom<usize> for FillerSize {
    type Error = BenchError;

    fn try_from(value: usize) -> Result<Self> {
        if value == 0 {
            return Err(BenchError::InvalidArgument(
                "filler size must be a positive integer, got 0".to_string(),
            ));
        }
        Ok(Self(value))
    }
}

impl TryFrom<i64> for FillerSize {
    type Error = BenchError;

    fn try_from(value: i64) -> Result<Self> {
        let size = usize::try_from(value).map_err(|_| {
            BenchError::InvalidArgument(format!(
                "filler size must be a positive integer, got {}",
                value
            ))
        })?;
        Self::try_from(size)
    }
}

impl TryFrom<f64> for FillerSize {
    type Error = BenchError;

    fn try_from(value: f64) -> Result<Self> {
        if !value.is_finite() || value.fract() != 0.0 || value < 1.0 || value > usize::MAX as f64
        {
            return Err(BenchError::InvalidArgument(format!(
                "filler size must be a positive integer, got {}",
                value
            )));
        }
        Ok(Self(value as usize))
    }
}

impl std::str::FromStr for FillerSize {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if let Ok(value) = trimmed.parse::<i64>() {
            return Self::try_from(value);
        }
        match trimmed.parse::<f64>() {
            Ok(value) => Self::try_from(value),
            Err(_) => Err(BenchError::InvalidArgument(format!(
                "filler size must be a positive integer, got {:?}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for FillerSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The message every broadcaster publishes.
///
/// Field names on the wire (`count`, `timestamp`, `value`) match what the
/// cable and Centrifugo benchmark clients already expect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkEnvelope {
    #[serde(rename = "count")]
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "value")]
    pub filler: String,
}

impl BenchmarkEnvelope {
    /// Build an envelope stamped with the current time
    pub fn new(sequence: u64, filler_size: FillerSize) -> Result<Self> {
        Ok(Self {
            sequence,
            timestamp: Utc::now(),
            filler: generate_filler(filler_size.get())?,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse an inbound payload. Anything that is not an envelope is a
    /// protocol error.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| BenchError::Protocol(format!("not a benchmark envelope: {}", e)))
    }

    /// Publish-to-`now` delay, zero if the clocks disagree
    pub fn latency_since_publish(&self, now: DateTime<Utc>) -> Duration {
        (now - self.timestamp).to_std().unwrap_or(Duration::ZERO)
    }
}

//! Mining jobs decoded from `mining.notify`.
//!
//! A job arrives as a hex blob (the header template) plus a hex target. The
//! decoder copies the blob into a fixed 96-byte buffer and derives the 64-bit
//! target and the floating-point difficulty the miner compares hashes
//! against.
//!
//! # Target arithmetic
//!
//! Pools usually send a compact 8-hex-digit target: 4 little-endian bytes
//! holding a 32-bit threshold `t`. It is rescaled to 64 bits relative to
//! difficulty 1:
//!
//! ```text
//! target64   = (2^64 - 1) / ((2^32 - 1) / t)      (u64 arithmetic)
//! difficulty = (2^64 - 1) / target64              (f64 arithmetic)
//! ```
//!
//! So `ffffffff` is difficulty 1 and `ffff0000`-style targets grow the
//! difficulty accordingly. A 16-hex-digit target is taken as the full 64-bit
//! little-endian threshold.

use std::fmt;

use serde_json::{Map, Value};

use super::messages::{Method, Response};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// Size of the header template buffer.
pub const WORK_DATA_LEN: usize = 96;

/// Byte offset of the 32-bit nonce within the buffer.
pub const NONCE_OFFSET: usize = 39;

/// Width of the nonce field in bytes.
pub const NONCE_LEN: usize = 4;

/// Shortest blob a pool may send, in bytes.
pub const MIN_BLOB_LEN: usize = 40;

/// Longest blob a pool may send, in bytes.
pub const MAX_BLOB_LEN: usize = 128;

/// One unit of hashing work issued by the pool.
///
/// Never mutated once built. Sessions share jobs as `Arc<Work>`; a change of
/// target produces a new `Work`.
#[derive(Clone, PartialEq)]
pub struct Work {
    data: [u8; WORK_DATA_LEN],
    size: usize,
    job_id: String,
    target: u64,
    difficulty: f64,
    extranonce2: String,
}

impl Work {
    /// Decode the params object of a `mining.notify`.
    ///
    /// Requires `job_id` and `blob`. The params' own `target` wins; otherwise
    /// `fallback_target` (the pool's last set_difficulty) is used. Nothing
    /// outside the returned value is touched on failure.
    pub fn from_notify(params: &Map<String, Value>, fallback_target: Option<u64>) -> Result<Self> {
        let job_id = string_field(params, "job_id")?;
        let hex_blob = string_field(params, "blob")?;

        trace!(job_id, blob = hex_blob, "Decoding job");

        let blob = blob_from_hex(hex_blob)?;

        let target = match params.get("target") {
            Some(Value::String(hex_target)) => target_from_hex(hex_target)?,
            Some(other) => {
                return Err(Error::Validation(format!("target not a string: {}", other)));
            }
            None => fallback_target
                .ok_or_else(|| Error::Validation("job has no target".to_string()))?,
        };

        let work = Self::new(job_id, &blob, target)?;
        debug!(
            job_id = %work.job_id,
            target = %format_args!("{:#018x}", work.target),
            difficulty = %format_args!("{:.2}", work.difficulty),
            "Decoded job"
        );
        Ok(work)
    }

    /// Decode a job a pool echoes inside a response, which carries
    /// `"method": "mining.notify"` and the notify params object.
    pub fn from_response(response: &Response, fallback_target: Option<u64>) -> Result<Self> {
        if response.method.as_deref() != Some(Method::Notify.as_ref()) {
            return Err(Error::Protocol("no job in response".to_string()));
        }
        let params = response
            .params
            .as_ref()
            .and_then(Value::as_object)
            .ok_or_else(|| Error::Protocol("job params not an object".to_string()))?;
        Self::from_notify(params, fallback_target)
    }

    /// Build a job from raw blob bytes and a 64-bit target.
    ///
    /// Blobs longer than the buffer are truncated; `size` reports the bytes
    /// actually held.
    pub fn new(job_id: impl Into<String>, blob: &[u8], target: u64) -> Result<Self> {
        let difficulty = difficulty_for_target(target)?;
        let job_id = job_id.into();

        let size = blob.len().min(WORK_DATA_LEN);
        if size < blob.len() {
            warn!(
                job_id = %job_id,
                blob_len = %blob.len(),
                "Blob longer than work buffer, truncating"
            );
        }

        let mut data = [0u8; WORK_DATA_LEN];
        data[..size].copy_from_slice(&blob[..size]);

        Ok(Self {
            data,
            size,
            job_id,
            target,
            difficulty,
            extranonce2: String::new(),
        })
    }

    /// Same job, rescaled to a new target.
    pub fn with_target(&self, target: u64) -> Result<Self> {
        Ok(Self {
            target,
            difficulty: difficulty_for_target(target)?,
            ..self.clone()
        })
    }

    /// Same job, tagged with the extranonce2 the miner is rolling.
    pub fn with_extranonce2(&self, extranonce2: impl Into<String>) -> Self {
        Self {
            extranonce2: extranonce2.into(),
            ..self.clone()
        }
    }

    /// The full 96-byte buffer, zero-filled past `size`.
    pub fn data(&self) -> &[u8; WORK_DATA_LEN] {
        &self.data
    }

    /// Count of meaningful bytes in the buffer.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    pub fn difficulty(&self) -> f64 {
        self.difficulty
    }

    pub fn extranonce2(&self) -> &str {
        &self.extranonce2
    }

    /// The nonce field as it sits in the buffer.
    pub fn nonce_bytes(&self) -> &[u8] {
        &self.data[NONCE_OFFSET..NONCE_OFFSET + NONCE_LEN]
    }

    /// The nonce field read as a little-endian integer.
    pub fn nonce(&self) -> u32 {
        let mut bytes = [0u8; NONCE_LEN];
        bytes.copy_from_slice(self.nonce_bytes());
        u32::from_le_bytes(bytes)
    }

    /// Copy of this job with the nonce field replaced.
    ///
    /// Miners use this to produce the solved job they hand to
    /// [`Session::submit_work`](super::Session::submit_work).
    pub fn with_nonce(&self, nonce: u32) -> Self {
        let mut solved = self.clone();
        solved.data[NONCE_OFFSET..NONCE_OFFSET + NONCE_LEN].copy_from_slice(&nonce.to_le_bytes());
        solved
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Work")
            .field("job_id", &self.job_id)
            .field("size", &self.size)
            .field("target", &format_args!("{:#018x}", self.target))
            .field("difficulty", &self.difficulty)
            .field("extranonce2", &self.extranonce2)
            .field("data", &bin_to_hex(&self.data[..self.size]))
            .finish()
    }
}

fn string_field<'a>(params: &'a Map<String, Value>, name: &str) -> Result<&'a str> {
    params
        .get(name)
        .ok_or_else(|| Error::Protocol(format!("missing {}", name)))?
        .as_str()
        .ok_or_else(|| Error::Protocol(format!("{} not a string", name)))
}

/// Validate and decode a job blob.
///
/// The hex length must be even and non-zero, and the decoded length must lie
/// within [`MIN_BLOB_LEN`]..=[`MAX_BLOB_LEN`] bytes.
pub fn blob_from_hex(hex_blob: &str) -> Result<Vec<u8>> {
    let hex_len = hex_blob.len();
    if hex_len == 0 {
        return Err(Error::Validation("blob is empty".to_string()));
    }
    if hex_len % 2 != 0 || !(MIN_BLOB_LEN..=MAX_BLOB_LEN).contains(&(hex_len / 2)) {
        return Err(Error::Validation(format!(
            "invalid blob length: {} hex digits",
            hex_len
        )));
    }
    hex_to_bin(hex_blob)
}

/// Decode a pool target into the 64-bit threshold.
pub fn target_from_hex(hex_target: &str) -> Result<u64> {
    let bytes = hex_to_bin(hex_target)?;
    let target = match bytes.len() {
        4 => {
            let t = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            if t == 0 {
                return Err(Error::Validation("target is zero".to_string()));
            }
            u64::MAX / (u64::from(u32::MAX) / u64::from(t))
        }
        8 => {
            let mut le = [0u8; 8];
            le.copy_from_slice(&bytes);
            u64::from_le_bytes(le)
        }
        n => {
            return Err(Error::Validation(format!(
                "invalid target length: {} hex digits",
                n * 2
            )));
        }
    };
    if target == 0 {
        return Err(Error::Validation("target is zero".to_string()));
    }
    Ok(target)
}

/// Difficulty matching a 64-bit target.
pub fn difficulty_for_target(target: u64) -> Result<f64> {
    if target == 0 {
        return Err(Error::Validation("target is zero".to_string()));
    }
    Ok(u64::MAX as f64 / target as f64)
}

/// 64-bit target matching a pool difficulty.
pub fn target_for_difficulty(difficulty: f64) -> Result<u64> {
    if !difficulty.is_finite() || difficulty <= 0.0 {
        return Err(Error::Validation(format!(
            "invalid difficulty: {}",
            difficulty
        )));
    }
    // Float-to-int casts saturate, so difficulties below 1 pin to u64::MAX.
    let target = (u64::MAX as f64 / difficulty) as u64;
    if target == 0 {
        return Err(Error::Validation(format!(
            "difficulty {} leaves no target",
            difficulty
        )));
    }
    Ok(target)
}

/// Decode hex into bytes.
pub fn hex_to_bin(hex_str: &str) -> Result<Vec<u8>> {
    hex::decode(hex_str).map_err(|e| Error::Validation(format!("invalid hex: {}", e)))
}

/// Encode bytes as lowercase hex.
pub fn bin_to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

//! Dual-path payload codec: structured-text JSON and binary MessagePack.
//!
//! Result producers emit either encoding depending on payload size and type.
//! Outbound messages from this client always carry an explicit encoding tag;
//! inbound messages are decoded by their declared tag when present, and by
//! trial (JSON first, then MessagePack) for untagged peers. Decoding is best
//! effort and never fatal: both paths failing yields a [`DecodeFailure`] the
//! caller logs and drops.

use serde_json::Value;
use std::error::Error;
use std::fmt;
use std::fmt::{Display, Formatter};

/// Wire encodings a measurement-plane peer may emit.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PayloadEncoding {
    Json,
    MessagePack,
}

impl Display for PayloadEncoding {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PayloadEncoding::Json => write!(f, "json"),
            PayloadEncoding::MessagePack => write!(f, "messagepack"),
        }
    }
}

/// A value that could not be rendered in the requested encoding.
#[derive(Clone, Debug)]
pub struct EncodeError {
    pub encoding: PayloadEncoding,
    pub detail: String,
}

impl Display for EncodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "unable to encode payload as {}: {}", self.encoding, self.detail)
    }
}

impl Error for EncodeError {}

/// One failed decode attempt, kept for the caller's log line.
#[derive(Clone, Debug)]
pub struct DecodeAttempt {
    pub encoding: PayloadEncoding,
    pub detail: String,
}

/// Every attempted encoding failed. The payload must be dropped; this is
/// never propagated as a fatal error.
#[derive(Clone, Debug)]
pub struct DecodeFailure {
    pub attempts: Vec<DecodeAttempt>,
}

impl Display for DecodeFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "payload not decodable")?;
        for attempt in &self.attempts {
            write!(f, "; {}: {}", attempt.encoding, attempt.detail)?;
        }
        Ok(())
    }
}

impl Error for DecodeFailure {}

/// Renders `value` in the requested encoding.
pub fn encode(value: &Value, encoding: PayloadEncoding) -> Result<Vec<u8>, EncodeError> {
    match encoding {
        PayloadEncoding::Json => serde_json::to_vec(value).map_err(|error| EncodeError {
            encoding,
            detail: error.to_string(),
        }),
        PayloadEncoding::MessagePack => {
            rmp_serde::to_vec_named(value).map_err(|error| EncodeError {
                encoding,
                detail: error.to_string(),
            })
        }
    }
}

fn try_decode(payload: &[u8], encoding: PayloadEncoding) -> Result<Value, DecodeAttempt> {
    match encoding {
        PayloadEncoding::Json => serde_json::from_slice(payload).map_err(|error| DecodeAttempt {
            encoding,
            detail: error.to_string(),
        }),
        PayloadEncoding::MessagePack => {
            rmp_serde::from_slice(payload).map_err(|error| DecodeAttempt {
                encoding,
                detail: error.to_string(),
            })
        }
    }
}

/// Decodes an inbound payload, honoring a declared encoding tag when present
/// and falling back to decode-by-trial for untagged peers.
pub fn decode(
    payload: &[u8],
    declared: Option<PayloadEncoding>,
) -> Result<Value, DecodeFailure> {
    let order: &[PayloadEncoding] = match declared {
        Some(PayloadEncoding::Json) => &[PayloadEncoding::Json],
        Some(PayloadEncoding::MessagePack) => &[PayloadEncoding::MessagePack],
        None => &[PayloadEncoding::Json, PayloadEncoding::MessagePack],
    };

    let mut attempts = Vec::with_capacity(order.len());
    for encoding in order {
        match try_decode(payload, *encoding) {
            Ok(value) => return Ok(value),
            Err(attempt) => attempts.push(attempt),
        }
    }
    Err(DecodeFailure { attempts })
}

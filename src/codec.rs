use std::borrow::Cow;
use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::model::ProgressRecord;

pub const SNAPSHOT_VERSION: u64 = 1;

/// Upper bound on an inflated envelope. Guards against decompression bombs.
const MAX_INFLATED_SIZE: u64 = 64 * 1024 * 1024;

/// Compression capability, resolved once from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Gzip,
}

impl Compression {
    /// Parse from config string like "gzip" or "none".
    pub fn from_config(value: &str) -> Result<Self> {
        match value {
            "gzip" => Ok(Compression::Gzip),
            "none" => Ok(Compression::None),
            other => Err(SyncError::Other(format!(
                "unknown compression setting: {other}"
            ))),
        }
    }
}

/// Decoded snapshot. The progress fields sit at the top level of the JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEnvelope {
    pub v: u64,
    pub saved_at: i64,
    #[serde(flatten)]
    pub progress: ProgressRecord,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeRef<'a> {
    v: u64,
    saved_at: i64,
    #[serde(flatten)]
    progress: &'a ProgressRecord,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotCodec {
    compression: Compression,
}

impl SnapshotCodec {
    pub fn new(compression: Compression) -> Self {
        Self { compression }
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn encode(&self, progress: &ProgressRecord, saved_at: i64) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(&EnvelopeRef {
            v: SNAPSHOT_VERSION,
            saved_at,
            progress,
        })?;
        match self.compression {
            Compression::None => Ok(json),
            Compression::Gzip => {
                let mut encoder =
                    GzEncoder::new(Vec::with_capacity(json.len() / 4), flate2::Compression::default());
                encoder.write_all(&json)?;
                Ok(encoder.finish()?)
            }
        }
    }
}

/// Accepts both compressed and uncompressed envelopes regardless of the
/// configured capability.
pub fn decode(bytes: &[u8]) -> Result<SnapshotEnvelope> {
    let plain: Cow<'_, [u8]> = match inflate(bytes)? {
        Some(inflated) => Cow::Owned(inflated),
        None => Cow::Borrowed(bytes),
    };

    let value: Value = serde_json::from_slice(&plain)
        .map_err(|e| SyncError::Format(format!("not a snapshot envelope: {e}")))?;
    match value.get("v") {
        None | Some(Value::Null) => {
            return Err(SyncError::Format("missing snapshot version".into()))
        }
        Some(v) if v.as_u64() == Some(SNAPSHOT_VERSION) => {}
        Some(other) => {
            return Err(SyncError::Format(format!(
                "unsupported snapshot version {other}"
            )))
        }
    }
    serde_json::from_value(value)
        .map_err(|e| SyncError::Format(format!("malformed snapshot envelope: {e}")))
}

/// Gunzip `bytes`. `Ok(None)` means the input is not gzip data.
fn inflate(bytes: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut output = Vec::new();
    let read = GzDecoder::new(bytes)
        .take(MAX_INFLATED_SIZE + 1)
        .read_to_end(&mut output);
    if read.is_err() {
        return Ok(None);
    }
    if output.len() as u64 > MAX_INFLATED_SIZE {
        return Err(SyncError::Format(format!(
            "snapshot inflates beyond {MAX_INFLATED_SIZE} bytes"
        )));
    }
    Ok(Some(output))
}

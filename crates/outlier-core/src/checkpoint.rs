//! Checkpoint framing for detector persistence
//!
//! Detectors persist "raw data sufficient to reconstruct the model", never
//! the model itself. Each detector serializes a state struct whose field order
//! is fixed (shared config, scalar parameters, point buffer, per-point
//! auxiliary state); this module wraps that payload in a versioned envelope
//! with an xxh3 checksum.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::detector::{Detector, DetectorKind};

/// Version for checkpoint format migrations
pub const CHECKPOINT_VERSION: u32 = 1;

/// Envelope written in front of every detector payload
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointEnvelope {
    /// Format version
    version: u32,
    /// Which detector produced the payload
    kind: DetectorKind,
    /// xxh3 of `payload`
    checksum: u64,
    /// bincode-encoded detector state
    payload: Vec<u8>,
}

/// Errors that can occur during checkpoint operations
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Unsupported checkpoint version: {found} (max supported: {max_supported})")]
    UnsupportedVersion { found: u32, max_supported: u32 },

    #[error("Checkpoint belongs to {found:?}, expected {expected:?}")]
    DetectorMismatch {
        expected: DetectorKind,
        found: DetectorKind,
    },

    #[error("Checksum mismatch: expected {expected:#018x}, computed {actual:#018x}")]
    ChecksumMismatch { expected: u64, actual: u64 },
}

/// Types whose state can be written to and restored from a checkpoint payload
pub trait Checkpointable {
    /// Serializable state, fields in persistence order
    type State: Serialize + DeserializeOwned;

    /// Detector tag stored in the envelope
    const KIND: DetectorKind;

    /// Capture the persisted state
    fn to_state(&self) -> Self::State;

    /// Replace the current state with a restored one
    fn restore_state(&mut self, state: Self::State) -> crate::Result<()>;
}

/// Serialize `state` and write it, framed, to `writer`
pub fn write_checkpoint<S, W>(kind: DetectorKind, state: &S, mut writer: W) -> Result<(), CheckpointError>
where
    S: Serialize,
    W: Write,
{
    let payload =
        bincode::serialize(state).map_err(|e| CheckpointError::SerializationFailed(e.to_string()))?;

    let envelope = CheckpointEnvelope {
        version: CHECKPOINT_VERSION,
        kind,
        checksum: xxhash_rust::xxh3::xxh3_64(&payload),
        payload,
    };

    bincode::serialize_into(&mut writer, &envelope)
        .map_err(|e| CheckpointError::SerializationFailed(e.to_string()))?;
    writer.flush()?;
    Ok(())
}

/// Read a framed checkpoint from `reader` and decode the payload
pub fn read_checkpoint<S, R>(expected: DetectorKind, reader: R) -> Result<S, CheckpointError>
where
    S: DeserializeOwned,
    R: Read,
{
    let envelope: CheckpointEnvelope = bincode::deserialize_from(reader)
        .map_err(|e| CheckpointError::DeserializationFailed(e.to_string()))?;

    if envelope.version > CHECKPOINT_VERSION {
        return Err(CheckpointError::UnsupportedVersion {
            found: envelope.version,
            max_supported: CHECKPOINT_VERSION,
        });
    }

    if envelope.kind != expected {
        return Err(CheckpointError::DetectorMismatch {
            expected,
            found: envelope.kind,
        });
    }

    let actual = xxhash_rust::xxh3::xxh3_64(&envelope.payload);
    if actual != envelope.checksum {
        return Err(CheckpointError::ChecksumMismatch {
            expected: envelope.checksum,
            actual,
        });
    }

    bincode::deserialize(&envelope.payload)
        .map_err(|e| CheckpointError::DeserializationFailed(e.to_string()))
}

/// Save a checkpointable value to a writer
pub fn save<C, W>(value: &C, writer: W) -> crate::Result<()>
where
    C: Checkpointable,
    W: Write,
{
    write_checkpoint(C::KIND, &value.to_state(), writer)?;
    Ok(())
}

/// Restore a checkpointable value from a reader
pub fn load<C, R>(value: &mut C, reader: R) -> crate::Result<()>
where
    C: Checkpointable,
    R: Read,
{
    let state = read_checkpoint::<C::State, _>(C::KIND, reader)?;
    value.restore_state(state)
}

/// Save any detector to a file
pub fn save_to_path<D>(detector: &D, path: impl AsRef<Path>) -> crate::Result<()>
where
    D: Detector + ?Sized,
{
    let file = File::create(path.as_ref()).map_err(CheckpointError::from)?;
    let mut writer = BufWriter::new(file);
    detector.save(&mut writer)
}

/// Load a detector's state from a file
pub fn load_from_path<D>(detector: &mut D, path: impl AsRef<Path>) -> crate::Result<()>
where
    D: Detector + ?Sized,
{
    let file = File::open(path.as_ref()).map_err(CheckpointError::from)?;
    let mut reader = BufReader::new(file);
    detector.load(&mut reader)
}

//! Byte encodings for persisted records

use crate::error::Result;
use serde::{de::DeserializeOwned, Serialize};

/// Encoding used by [`FileJobStore`](crate::file::FileJobStore) for checkpoints
///
/// Job and lease files stay JSON so an operator can read them; the checkpoint,
/// rewritten on every commit boundary, uses whichever encoding is plugged in.
pub trait SerializerProtocol: Send + Sync {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    fn loads<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T>;

    /// File extension for records in this encoding
    fn extension(&self) -> &'static str;
}

/// Human-readable JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl SerializerProtocol for JsonSerializer {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(value)?)
    }

    fn loads<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(data)?)
    }

    fn extension(&self) -> &'static str {
        "json"
    }
}

/// Compact bincode (default)
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeSerializer;

impl SerializerProtocol for BincodeSerializer {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn loads<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        Ok(bincode::deserialize(data)?)
    }

    fn extension(&self) -> &'static str {
        "bin"
    }
}

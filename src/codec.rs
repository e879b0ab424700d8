//! Conversion between application payloads and the text stored in the `data` column.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Error raised by a [`Codec`].
#[derive(Debug, Error)]
#[error(transparent)]
pub struct CodecError(Box<dyn std::error::Error + Send + Sync + 'static>);

impl CodecError {
    pub fn new<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        Self(error.into())
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(error: serde_json::Error) -> Self {
        Self::new(error)
    }
}

/// Encodes payloads for storage and decodes them back when jobs are reserved.
///
/// A codec is injected once when the [`Queue`](crate::Queue) is built and used for every
/// insert and every reserved job.
pub trait Codec: Send + Sync + 'static {
    fn encode<T>(&self, payload: &T) -> Result<String, CodecError>
    where
        T: Serialize + ?Sized;

    fn decode<T>(&self, data: &str) -> Result<T, CodecError>
    where
        T: DeserializeOwned;
}

/// Default codec, stores payloads as JSON text.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T>(&self, payload: &T) -> Result<String, CodecError>
    where
        T: Serialize + ?Sized,
    {
        Ok(serde_json::to_string(payload)?)
    }

    fn decode<T>(&self, data: &str) -> Result<T, CodecError>
    where
        T: DeserializeOwned,
    {
        Ok(serde_json::from_str(data)?)
    }
}

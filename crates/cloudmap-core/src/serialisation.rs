//! Value serialisation strategies.
//!
//! A mapping stores bytes; a [`Serialisation`] turns values into bytes and
//! back. Strategies compose: a [`Pipeline`] runs a value strategy followed
//! by an ordered list of [`ByteTransform`]s, and decodes by running the
//! transforms in reverse before the value strategy.

use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CloudMapError;
use crate::Result;

/// Converts values of type `T` to and from raw bytes.
pub trait Serialisation<T>: Send + Sync {
    /// Encode a value for upload.
    fn dumps(&self, value: &T) -> Result<Bytes>;

    /// Decode downloaded bytes into a value.
    fn loads(&self, data: Bytes) -> Result<T>;
}

/// A reversible bytes-to-bytes step, such as compression.
pub trait ByteTransform: Send + Sync {
    fn encode(&self, data: Bytes) -> Result<Bytes>;
    fn decode(&self, data: Bytes) -> Result<Bytes>;
}

/// Passes bytes through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawBytes;

impl Serialisation<Bytes> for RawBytes {
    fn dumps(&self, value: &Bytes) -> Result<Bytes> {
        Ok(value.clone())
    }

    fn loads(&self, data: Bytes) -> Result<Bytes> {
        Ok(data)
    }
}

/// Stores strings as UTF-8.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawString;

impl Serialisation<String> for RawString {
    fn dumps(&self, value: &String) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(value.as_bytes()))
    }

    fn loads(&self, data: Bytes) -> Result<String> {
        String::from_utf8(data.to_vec())
            .map_err(|e| CloudMapError::serialisation("Value is not valid UTF-8", e))
    }
}

/// JSON via `serde_json`, with object keys sorted so equal values always
/// produce identical bytes.
pub struct Json<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Json<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for Json<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Serialisation<T> for Json<T>
where
    T: Serialize + DeserializeOwned,
{
    fn dumps(&self, value: &T) -> Result<Bytes> {
        // serde_json::Value keeps objects in a BTreeMap, which sorts keys.
        let value = serde_json::to_value(value)
            .map_err(|e| CloudMapError::serialisation("Failed to encode JSON value", e))?;
        let data = serde_json::to_vec(&value)
            .map_err(|e| CloudMapError::serialisation("Failed to encode JSON value", e))?;
        Ok(Bytes::from(data))
    }

    fn loads(&self, data: Bytes) -> Result<T> {
        serde_json::from_slice(&data)
            .map_err(|e| CloudMapError::serialisation("Failed to decode JSON value", e))
    }
}

/// Compact binary encoding via `bincode`.
pub struct Binary<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Binary<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for Binary<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Serialisation<T> for Binary<T>
where
    T: Serialize + DeserializeOwned,
{
    fn dumps(&self, value: &T) -> Result<Bytes> {
        bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map(Bytes::from)
            .map_err(|e| CloudMapError::serialisation("Failed to encode binary value", e))
    }

    fn loads(&self, data: Bytes) -> Result<T> {
        let (value, _) = bincode::serde::decode_from_slice(&data, bincode::config::standard())
            .map_err(|e| CloudMapError::serialisation("Failed to decode binary value", e))?;
        Ok(value)
    }
}

/// LZ4 block compression with the uncompressed size prepended.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4;

impl ByteTransform for Lz4 {
    fn encode(&self, data: Bytes) -> Result<Bytes> {
        Ok(Bytes::from(lz4_flex::compress_prepend_size(&data)))
    }

    fn decode(&self, data: Bytes) -> Result<Bytes> {
        lz4_flex::decompress_size_prepended(&data)
            .map(Bytes::from)
            .map_err(|e| CloudMapError::serialisation("Failed to decompress value", e))
    }
}

/// A value strategy chained with byte transforms.
pub struct Pipeline<T> {
    value: Arc<dyn Serialisation<T>>,
    transforms: Vec<Arc<dyn ByteTransform>>,
}

impl<T> Pipeline<T> {
    /// Start a pipeline from a value strategy.
    pub fn new(value: impl Serialisation<T> + 'static) -> Self {
        Self {
            value: Arc::new(value),
            transforms: Vec::new(),
        }
    }

    /// Append a transform, applied after every earlier one on `dumps`.
    pub fn then(mut self, transform: impl ByteTransform + 'static) -> Self {
        self.transforms.push(Arc::new(transform));
        self
    }
}

impl<T> Serialisation<T> for Pipeline<T> {
    fn dumps(&self, value: &T) -> Result<Bytes> {
        let data = self.value.dumps(value)?;
        self.transforms
            .iter()
            .try_fold(data, |data, transform| transform.encode(data))
    }

    fn loads(&self, data: Bytes) -> Result<T> {
        let data = self
            .transforms
            .iter()
            .rev()
            .try_fold(data, |data, transform| transform.decode(data))?;
        self.value.loads(data)
    }
}

/// Sorted-key JSON.
pub fn json<T>() -> Pipeline<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    Pipeline::new(Json::new())
}

/// Sorted-key JSON, LZ4-compressed.
pub fn json_lz4<T>() -> Pipeline<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    Pipeline::new(Json::new()).then(Lz4)
}

/// bincode.
pub fn binary<T>() -> Pipeline<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    Pipeline::new(Binary::new())
}

pub fn raw_string() -> Pipeline<String> {
    Pipeline::new(RawString)
}

pub fn raw_bytes() -> Pipeline<Bytes> {
    Pipeline::new(RawBytes)
}

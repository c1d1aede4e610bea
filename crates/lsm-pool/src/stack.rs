//! Stack buffers handed out by the recycler.
//!
//! A [`StackBuffer`] is the unit of image data a camera fills during playback.
//! Buffers are keyed by their [`StackRequest`] descriptor: the recycler only
//! reuses a buffer for a request with the exact same dimensions and pixel type.
//!
//! # Design
//!
//! `StackBuffer` is designed for reuse:
//! - **Fixed-size payload**: allocated once, never resized while pooled
//! - **Inline metadata**: acquisition context travels with the pixels
//! - **O(1) reset**: clears metadata and identity, keeps the payload

use std::collections::BTreeMap;
use std::fmt;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};

use crate::limits::{validate_stack_size, StackSize};
use crate::RecyclerError;

/// Voxel representation of a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelType {
    /// Unsigned 8-bit.
    U8,
    /// Unsigned 16-bit, the native camera format.
    U16,
    /// 32-bit float.
    F32,
}

impl PixelType {
    /// Size of one voxel in bytes.
    #[must_use]
    pub const fn bytes_per_voxel(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::F32 => 4,
        }
    }
}

impl fmt::Display for PixelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::U8 => write!(f, "u8"),
            Self::U16 => write!(f, "u16"),
            Self::F32 => write!(f, "f32"),
        }
    }
}

/// Descriptor used to request a stack from a recycler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackRequest {
    /// Plane width in pixels.
    pub width: u32,
    /// Plane height in pixels.
    pub height: u32,
    /// Number of planes.
    pub depth: u32,
    /// Voxel type.
    pub pixel_type: PixelType,
}

impl StackRequest {
    /// Create a descriptor for a stack of `depth` planes.
    #[must_use]
    pub const fn new(width: u32, height: u32, depth: u32, pixel_type: PixelType) -> Self {
        Self {
            width,
            height,
            depth,
            pixel_type,
        }
    }

    /// Create a descriptor for a single 16-bit plane.
    #[must_use]
    pub const fn plane(width: u32, height: u32) -> Self {
        Self::new(width, height, 1, PixelType::U16)
    }

    /// Validate the descriptor against the hard limits.
    pub fn validate(&self) -> Result<StackSize, RecyclerError> {
        validate_stack_size(
            self.width,
            self.height,
            self.depth,
            self.pixel_type.bytes_per_voxel(),
        )
    }
}

impl fmt::Display for StackRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{} {}",
            self.width, self.height, self.depth, self.pixel_type
        )
    }
}

/// Key/value bundle describing the acquisition context of a stack.
///
/// Values are JSON so that collaborators (storage sinks, viewers) can attach
/// whatever they need without this crate knowing their types.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackMetadata {
    entries: BTreeMap<String, serde_json::Value>,
}

impl StackMetadata {
    /// Create an empty bundle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry.
    pub fn add_entry(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Look up an entry.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.entries.get(key)
    }

    /// Look up a numeric entry.
    #[must_use]
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.entries.get(key).and_then(serde_json::Value::as_f64)
    }

    /// Look up a boolean entry.
    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.entries.get(key).and_then(serde_json::Value::as_bool)
    }

    /// Copy all entries of `other` into this bundle, replacing duplicates.
    pub fn merge(&mut self, other: &StackMetadata) {
        for (key, value) in &other.entries {
            self.entries.insert(key.clone(), value.clone());
        }
    }

    /// Iterate over the entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &serde_json::Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the bundle holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Image stack stored in recycler slots.
#[derive(Debug)]
pub struct StackBuffer {
    request: StackRequest,
    /// Voxel payload, `request.validate()?.bytes` long.
    data: BytesMut,
    /// Acquisition context attached by the producer.
    pub metadata: StackMetadata,
    /// Producer-assigned sequence number within one playback.
    pub index: u64,
    /// Capture timestamp (nanoseconds since epoch).
    pub timestamp_ns: u64,
}

impl StackBuffer {
    /// Allocate a zeroed buffer for `request`.
    pub fn allocate(request: StackRequest) -> Result<Self, RecyclerError> {
        let size = request.validate()?;
        Ok(Self {
            request,
            data: BytesMut::zeroed(size.bytes),
            metadata: StackMetadata::new(),
            index: 0,
            timestamp_ns: 0,
        })
    }

    /// Payload-less stand-in swapped into a lease while its buffer goes
    /// back to the pool.
    pub(crate) fn detached(request: StackRequest) -> Self {
        Self {
            request,
            data: BytesMut::new(),
            metadata: StackMetadata::new(),
            index: 0,
            timestamp_ns: 0,
        }
    }

    /// Descriptor this buffer was allocated for.
    #[inline]
    #[must_use]
    pub fn request(&self) -> &StackRequest {
        &self.request
    }

    /// Whether the buffer can serve `request` without reallocation.
    #[inline]
    #[must_use]
    pub fn matches(&self, request: &StackRequest) -> bool {
        self.request == *request
    }

    /// Voxel payload.
    #[inline]
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable voxel payload.
    #[inline]
    #[must_use]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Payload size in bytes.
    #[inline]
    #[must_use]
    pub fn size_in_bytes(&self) -> usize {
        self.data.len()
    }

    /// Reset identity and metadata for reuse.
    ///
    /// Does not zero the payload; the next producer overwrites it.
    pub fn reset(&mut self) {
        self.metadata.clear();
        self.index = 0;
        self.timestamp_ns = 0;
    }
}

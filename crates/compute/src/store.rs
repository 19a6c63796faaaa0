//! CPU-resident buffers loaded from assets.

use std::io::Read;

use crate::assets::AssetSource;
use crate::backend::ShaderSource;
use crate::ComputeError;

/// A contiguous run of 32-bit words, viewable as `f32` or `i32`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawBuffer {
    name: String,
    data: Vec<f32>,
}

impl RawBuffer {
    pub fn from_f32(name: impl Into<String>, data: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    pub fn from_i32(name: impl Into<String>, data: &[i32]) -> Self {
        Self::from_f32(name, bytemuck::cast_slice::<i32, f32>(data).to_vec())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn byte_len(&self) -> usize {
        std::mem::size_of_val(self.data.as_slice())
    }

    #[must_use]
    pub fn as_f32(&self) -> &[f32] {
        &self.data
    }

    #[must_use]
    pub fn as_i32(&self) -> &[i32] {
        bytemuck::cast_slice(&self.data)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }

    /// Overwrites `values.len()` words starting at element `offset`.
    pub fn overwrite(&mut self, offset: usize, values: &[f32]) -> Result<(), ComputeError> {
        let end = offset
            .checked_add(values.len())
            .filter(|&end| end <= self.data.len())
            .ok_or(ComputeError::ShapeMismatch("overwrite past the end of the buffer"))?;
        self.data[offset..end].copy_from_slice(values);
        Ok(())
    }

    /// Repeats the whole buffer `channels` times back to back.
    ///
    /// The result has `len() * channels` elements and every block of
    /// `len()` elements is bit-identical to `self`.
    pub fn replicate_channels(&self, channels: usize) -> Result<RawBuffer, ComputeError> {
        if channels == 0 {
            return Err(ComputeError::ShapeMismatch(
                "channel count must be at least 1",
            ));
        }
        Ok(RawBuffer {
            name: format!("{}x{channels}", self.name),
            data: self.data.repeat(channels),
        })
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }
}

/// Loads raw buffers and shader sources from an [`AssetSource`].
pub struct BufferStore<S> {
    source: S,
}

impl<S: AssetSource> BufferStore<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    #[must_use]
    pub fn source(&self) -> &S {
        &self.source
    }

    fn read_all(&self, name: &str) -> Result<Vec<u8>, ComputeError> {
        let mut asset = self
            .source
            .open(name)
            .ok_or_else(|| ComputeError::ResourceNotFound(name.to_string()))?;
        let expected = asset.length();
        let mut bytes = Vec::with_capacity(usize::try_from(expected).unwrap_or(0));
        // A read error part-way through is reported as truncation with what we got.
        if let Err(e) = asset.read_to_end(&mut bytes) {
            tracing::warn!("read of asset {name} failed: {e}");
        }
        let actual = bytes.len() as u64;
        if actual < expected {
            return Err(ComputeError::ResourceTruncated {
                name: name.to_string(),
                expected,
                actual,
            });
        }
        bytes.truncate(usize::try_from(expected).unwrap_or(bytes.len()));
        Ok(bytes)
    }

    /// Loads `name` as native-endian 32-bit words.
    pub fn load(&self, name: &str) -> Result<RawBuffer, ComputeError> {
        let bytes = self.read_all(name)?;
        if bytes.len() % 4 != 0 {
            return Err(ComputeError::ResourceMisaligned {
                name: name.to_string(),
                len: bytes.len() as u64,
            });
        }
        let data: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes);
        tracing::debug!("loaded {name}: {} words", data.len());
        Ok(RawBuffer::from_f32(name, data))
    }

    /// Loads `name` as shader text.
    pub fn load_shader(&self, name: &str) -> Result<ShaderSource, ComputeError> {
        let bytes = self.read_all(name)?;
        let text =
            String::from_utf8(bytes).map_err(|_| ComputeError::ResourceNotUtf8(name.to_string()))?;
        Ok(ShaderSource::new(name, text))
    }

    /// Frees a buffer's CPU memory.
    pub fn release(&self, buffer: RawBuffer) {
        tracing::trace!("releasing {} ({} bytes)", buffer.name, buffer.byte_len());
        drop(buffer);
    }
}

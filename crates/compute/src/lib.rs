//! # ssbo-compute
//!
//! A small abstraction over GPU compute dispatches that read and write
//! shader-storage buffers. The crate is organised around one protocol:
//!
//! 1. allocate storage buffers and upload their contents,
//! 2. bind them to numbered binding slots of a compute program,
//! 3. dispatch a 3D grid of work groups,
//! 4. fence the writes with a memory barrier,
//! 5. map the results for read-back (or draw from them), then unbind.
//!
//! [`ComputeContext`] enforces that protocol on top of any
//! [`ComputeBackend`]. Two backends ship with the crate: the always-available
//! [`CpuBackend`], which executes kernels by walking the invocation grid in
//! software, and `WgpuBackend` behind the `gpu` feature.
//!
//! Supporting pieces live alongside: [`store`] loads raw float assets,
//! [`inspect`] formats read-back windows for logging, and [`oracle`] holds the
//! reference CPU convolution used to cross-check the GPU path.

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

use thiserror::Error;

pub mod assets;
pub mod backend;
pub mod context;
pub mod cpu_backend;
pub mod inspect;
pub mod kernels;
pub mod layout;
pub mod oracle;
pub mod store;

#[cfg(feature = "gpu")]
pub mod wgpu_backend;

pub use assets::{Asset, AssetSource, DirAssets, MemoryAssets};
pub use backend::{
    BufferHandle, BufferUsage, ComputeBackend, ContextId, DeviceLimits, DispatchCall, ProgramDesc,
    ProgramHandle, ShaderLanguage, ShaderSource, UniformValue,
};
pub use context::{ComputeContext, DispatchDescriptor, Mapping, UniformPolicy};
pub use cpu_backend::CpuBackend;
pub use kernels::{InvocationRecord, PointVertex};
pub use store::{BufferStore, RawBuffer};

#[cfg(feature = "gpu")]
pub use wgpu_backend::WgpuBackend;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ComputeError {
    #[error("resource not found: {0}")]
    ResourceNotFound(String),
    #[error("resource {name} truncated: expected {expected} bytes, read {actual}")]
    ResourceTruncated {
        name: String,
        expected: u64,
        actual: u64,
    },
    #[error("resource {name} is {len} bytes, not a whole number of 32-bit words")]
    ResourceMisaligned { name: String, len: u64 },
    #[error("resource {0} is not valid UTF-8")]
    ResourceNotUtf8(String),
    #[error("program {program} failed to build: {log}")]
    ProgramCompileFailed { program: String, log: String },
    #[error("upload of {actual} bytes into a buffer of {expected} bytes")]
    UploadSizeMismatch { expected: usize, actual: usize },
    #[error("invalid storage buffer capacity {0}")]
    InvalidCapacity(usize),
    #[error("invalid dispatch size {0:?}")]
    InvalidDispatchSize([u32; 3]),
    #[error("map of {len} bytes at offset {offset} exceeds capacity {capacity}")]
    MapOutOfRange {
        offset: usize,
        len: usize,
        capacity: usize,
    },
    #[error("mapping of {0:?} used after unmap")]
    UseAfterUnmap(BufferHandle),
    #[error("buffer {0:?} is already mapped")]
    AlreadyMapped(BufferHandle),
    #[error("buffer {0:?} is mapped")]
    BufferMapped(BufferHandle),
    #[error("uniform {0} not declared by the active program")]
    UniformNotFound(String),
    #[error("uniform {0} set with a value of the wrong type")]
    UniformTypeMismatch(String),
    #[error("binding slot {0} out of range")]
    InvalidSlot(u32),
    #[error("binding slot {0} is declared by the program but empty")]
    UnboundSlot(u32),
    #[error("buffer {0:?} bound before its first upload")]
    BufferNotUploaded(BufferHandle),
    #[error("buffer {0:?} read before a barrier fenced the last dispatch writing it")]
    MissingBarrier(BufferHandle),
    #[error("draw of {count} vertices exceeds buffer capacity {capacity}")]
    DrawOutOfRange { count: u32, capacity: usize },
    #[error("no compute program in use")]
    NoActiveProgram,
    #[error("program {0:?} cannot be used this way")]
    InvalidProgram(ProgramHandle),
    #[error("unknown buffer {0:?}")]
    UnknownBuffer(BufferHandle),
    #[error("unknown program {0:?}")]
    UnknownProgram(ProgramHandle),
    #[error("buffer shape mismatch: {0}")]
    ShapeMismatch(&'static str),
    #[error("no graphics context is current")]
    ContextNotCurrent,
    #[error("backend not available")]
    BackendUnavailable,
}

/// The compute programs this crate knows how to run.
///
/// Each kernel's bindings, uniforms and local size are described in
/// [`layout`]; the source text itself is loaded from an asset at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Kernel {
    /// Writes one position/colour record per invocation on a circle.
    PointCircle,
    /// Writes the invocation's IDs as eight `i32` values.
    InvocationProbe,
    /// Per-channel 3x3 convolution with bias and `tanh`.
    GroupConv3x3,
}

impl Kernel {
    #[must_use]
    pub const fn binding_count(&self) -> u32 {
        layout::binding_count(self)
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Kernel::PointCircle => "point_circle",
            Kernel::InvocationProbe => "invocation_probe",
            Kernel::GroupConv3x3 => "group_conv3x3",
        }
    }
}

/// Returns a compute backend, preferring the GPU when it is available.
///
/// With the `gpu` feature enabled this attempts to create a
/// [`WgpuBackend`]. If that fails, or the feature is off, a [`CpuBackend`]
/// is returned.
#[must_use]
pub fn default_backend() -> Box<dyn ComputeBackend> {
    #[cfg(feature = "gpu")]
    {
        match WgpuBackend::try_new() {
            Ok(gpu) => {
                tracing::info!("Using wgpu backend.");
                return Box::new(gpu);
            }
            Err(e) => tracing::warn!("wgpu backend initialization failed ({e}), falling back..."),
        }
    }

    tracing::info!("Using CPU backend.");
    Box::new(CpuBackend::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_binding_counts() {
        assert_eq!(Kernel::PointCircle.binding_count(), 1);
        assert_eq!(Kernel::InvocationProbe.binding_count(), 1);
        assert_eq!(Kernel::GroupConv3x3.binding_count(), 3);
    }

    #[test]
    fn default_backend_has_a_current_context() {
        let backend = default_backend();
        assert!(backend.current_context().is_some());
    }

    #[test]
    fn errors_render_their_details() {
        let err = ComputeError::MapOutOfRange {
            offset: 8,
            len: 16,
            capacity: 20,
        };
        assert_eq!(
            err.to_string(),
            "map of 16 bytes at offset 8 exceeds capacity 20"
        );
    }
}

//! Demo renderers built on the storage-buffer protocol.
//!
//! Each renderer owns a [`ComputeContext`](ssbo_compute::ComputeContext) and
//! follows the host lifecycle: `init` builds every program and buffer (and
//! releases all of them again if any step fails), `render` runs one frame,
//! and dropping the renderer tears everything down.

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod config;
pub mod conv;
pub mod point_circle;
pub mod probe;

pub use config::{AssetNames, CircleConfig, ConvConfig, DemoConfig, ProbeConfig};
pub use conv::ConvRenderer;
pub use point_circle::{DrawState, PointCircleRenderer};
pub use probe::InvocationProbe;

use ssbo_compute::ComputeError;

/// What happened to one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Completed,
    /// The frame failed part-way; nothing was drawn or read back.
    Skipped { error: ComputeError },
}

impl FrameOutcome {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, FrameOutcome::Completed)
    }

    /// Logs a failed frame and turns the result into an outcome.
    pub(crate) fn from_result(demo: &str, result: Result<(), ComputeError>) -> Self {
        match result {
            Ok(()) => FrameOutcome::Completed,
            Err(error) => {
                tracing::warn!("{demo}: skipping frame: {error}");
                FrameOutcome::Skipped { error }
            }
        }
    }
}

/// A demo driven one frame at a time by the host.
pub trait Renderer {
    fn name(&self) -> &'static str;

    fn resize(&mut self, width: u32, height: u32);

    /// Runs one frame. Failures are logged and reported, never fatal.
    fn render(&mut self) -> FrameOutcome;
}

impl<R: Renderer + ?Sized> Renderer for Box<R> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn resize(&mut self, width: u32, height: u32) {
        (**self).resize(width, height);
    }

    fn render(&mut self) -> FrameOutcome {
        (**self).render()
    }
}

//! Software implementation of [`ComputeBackend`].
//!
//! Buffers live in host memory as 32-bit words, compute programs run the
//! handlers in [`crate::kernels`] over the full invocation grid, and point
//! draws are rasterised into an RGBA float framebuffer the size of the
//! viewport. Clones share one device, so a test can keep a handle to inspect
//! state after a renderer has taken ownership of another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{
    BufferHandle, BufferUsage, ComputeBackend, ContextId, DeviceLimits, DispatchCall, ProgramDesc,
    ProgramHandle, ShaderLanguage, ShaderSource,
};
use crate::kernels::{self, PointVertex};
use crate::layout::{STORAGE_IN, STORAGE_OUT, STORAGE_WEIGHTS};
use crate::{ComputeError, Kernel};

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy)]
enum CpuProgram {
    Compute(Kernel),
    Points,
}

#[derive(Debug)]
struct CpuBuffer {
    words: Vec<u32>,
}

/// Counters for what the device has executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuStats {
    pub dispatches: u64,
    pub barriers: u64,
    pub draws: u64,
    pub points_drawn: u64,
}

#[derive(Debug)]
struct CpuState {
    current: Option<ContextId>,
    limits: DeviceLimits,
    viewport: (u32, u32),
    framebuffer: Vec<[f32; 4]>,
    buffers: HashMap<BufferHandle, CpuBuffer>,
    programs: HashMap<ProgramHandle, CpuProgram>,
    next_handle: u64,
    stats: CpuStats,
}

impl CpuState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn words(&self, buffer: BufferHandle) -> Result<&Vec<u32>, ComputeError> {
        self.buffers
            .get(&buffer)
            .map(|b| &b.words)
            .ok_or(ComputeError::UnknownBuffer(buffer))
    }

    fn words_mut(&mut self, buffer: BufferHandle) -> Result<&mut Vec<u32>, ComputeError> {
        self.buffers
            .get_mut(&buffer)
            .map(|b| &mut b.words)
            .ok_or(ComputeError::UnknownBuffer(buffer))
    }
}

/// Host-memory device executing kernels in software.
#[derive(Clone)]
pub struct CpuBackend {
    id: ContextId,
    state: Arc<Mutex<CpuState>>,
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuBackend {
    /// Creates a device whose context is immediately current.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(DeviceLimits::default())
    }

    #[must_use]
    pub fn with_limits(limits: DeviceLimits) -> Self {
        let id = ContextId(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed));
        Self {
            id,
            state: Arc::new(Mutex::new(CpuState {
                current: Some(id),
                limits,
                viewport: (0, 0),
                framebuffer: Vec::new(),
                buffers: HashMap::new(),
                programs: HashMap::new(),
                next_handle: 0,
                stats: CpuStats::default(),
            })),
        }
    }

    #[must_use]
    pub fn context_id(&self) -> ContextId {
        self.id
    }

    /// Simulates the host tearing the context down: nothing is current any
    /// more and every handle is implicitly gone.
    pub fn lose_context(&self) {
        let mut state = self.state.lock();
        state.current = None;
        state.buffers.clear();
        state.programs.clear();
    }

    /// Makes this device's context current again.
    pub fn make_current(&self) {
        self.state.lock().current = Some(self.id);
    }

    #[must_use]
    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    #[must_use]
    pub fn live_programs(&self) -> usize {
        self.state.lock().programs.len()
    }

    #[must_use]
    pub fn stats(&self) -> CpuStats {
        self.state.lock().stats
    }

    #[must_use]
    pub fn viewport(&self) -> (u32, u32) {
        self.state.lock().viewport
    }

    /// Snapshot of the framebuffer, rows top to bottom.
    #[must_use]
    pub fn framebuffer(&self) -> Vec<[f32; 4]> {
        self.state.lock().framebuffer.clone()
    }
}

fn check_source(source: &ShaderSource, entry: &str) -> Result<(), String> {
    let text = source.text.trim_start();
    if text.is_empty() {
        return Err("empty source".into());
    }
    if source.language == ShaderLanguage::GlslEs && !text.starts_with("#version") {
        return Err("missing #version directive".into());
    }
    if !text.contains(entry) {
        return Err(format!("no entry point `{entry}`"));
    }
    Ok(())
}

fn entry_point(source: &ShaderSource, wgsl_entry: &'static str) -> &'static str {
    match source.language {
        ShaderLanguage::GlslEs => "main",
        ShaderLanguage::Wgsl => wgsl_entry,
    }
}

/// Maps a clip-space position to a framebuffer index.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn pixel_index(position: [f32; 4], width: u32, height: u32) -> Option<usize> {
    let w = position[3];
    if w <= 0.0 || width == 0 || height == 0 {
        return None;
    }
    let (x, y) = (position[0] / w, position[1] / w);
    if !(-1.0..=1.0).contains(&x) || !(-1.0..=1.0).contains(&y) {
        return None;
    }
    let px = (((x + 1.0) * 0.5 * width as f32) as u32).min(width - 1);
    let py = (((1.0 - y) * 0.5 * height as f32) as u32).min(height - 1);
    Some(py as usize * width as usize + px as usize)
}

impl ComputeBackend for CpuBackend {
    fn current_context(&self) -> Option<ContextId> {
        self.state.lock().current
    }

    fn set_viewport(&mut self, width: u32, height: u32) {
        let mut state = self.state.lock();
        state.viewport = (width, height);
        state.framebuffer = vec![[0.0; 4]; width as usize * height as usize];
    }

    fn limits(&self) -> DeviceLimits {
        self.state.lock().limits
    }

    fn preferred_language(&self) -> ShaderLanguage {
        ShaderLanguage::GlslEs
    }

    fn create_program(&mut self, desc: &ProgramDesc<'_>) -> Result<ProgramHandle, ComputeError> {
        let failed = |log: String| ComputeError::ProgramCompileFailed {
            program: desc.name(),
            log,
        };
        let program = match desc {
            ProgramDesc::Compute { kernel, source } => {
                check_source(source, "main").map_err(failed)?;
                CpuProgram::Compute(*kernel)
            }
            ProgramDesc::Points { vertex, fragment } => {
                check_source(vertex, entry_point(vertex, "vs_main")).map_err(failed)?;
                check_source(fragment, entry_point(fragment, "fs_main")).map_err(failed)?;
                CpuProgram::Points
            }
        };
        let mut state = self.state.lock();
        let handle = ProgramHandle(state.handle());
        state.programs.insert(handle, program);
        tracing::debug!("cpu: built program {} as {handle:?}", desc.name());
        Ok(handle)
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        self.state.lock().programs.remove(&program);
    }

    fn create_buffer(
        &mut self,
        capacity: usize,
        usage: BufferUsage,
    ) -> Result<BufferHandle, ComputeError> {
        let mut state = self.state.lock();
        if capacity as u64 > state.limits.max_storage_block_size {
            return Err(ComputeError::InvalidCapacity(capacity));
        }
        let handle = BufferHandle(state.handle());
        state.buffers.insert(
            handle,
            CpuBuffer {
                words: vec![0; capacity / 4],
            },
        );
        tracing::trace!("cpu: {handle:?} holds {capacity} bytes ({usage:?})");
        Ok(handle)
    }

    fn delete_buffer(&mut self, buffer: BufferHandle) {
        self.state.lock().buffers.remove(&buffer);
    }

    fn write_buffer(&mut self, buffer: BufferHandle, bytes: &[u8]) -> Result<(), ComputeError> {
        let mut state = self.state.lock();
        let words = state.words_mut(buffer)?;
        if bytes.len() != words.len() * 4 {
            return Err(ComputeError::UploadSizeMismatch {
                expected: words.len() * 4,
                actual: bytes.len(),
            });
        }
        *words = bytemuck::pod_collect_to_vec(bytes);
        Ok(())
    }

    fn dispatch(&mut self, call: &DispatchCall<'_>) -> Result<(), ComputeError> {
        let mut state = self.state.lock();
        match state.programs.get(&call.program) {
            Some(CpuProgram::Compute(kernel)) if *kernel == call.kernel => {}
            Some(_) => return Err(ComputeError::InvalidProgram(call.program)),
            None => return Err(ComputeError::UnknownProgram(call.program)),
        }
        let slot = |s: u32| {
            call.bindings
                .iter()
                .find(|(slot, _)| *slot == s)
                .map(|(_, buffer)| *buffer)
                .ok_or(ComputeError::UnboundSlot(s))
        };

        match call.kernel {
            Kernel::PointCircle => {
                let out = state.words_mut(slot(crate::layout::POINT_OUT)?)?;
                kernels::handle_point_circle(call.groups, call.uniforms, out)?;
            }
            Kernel::InvocationProbe => {
                let out = state.words_mut(slot(crate::layout::POINT_OUT)?)?;
                kernels::handle_invocation_probe(call.groups, out)?;
            }
            Kernel::GroupConv3x3 => {
                let input = state.words(slot(STORAGE_IN)?)?.clone();
                let weights = state.words(slot(STORAGE_WEIGHTS)?)?.clone();
                let out = state.words_mut(slot(STORAGE_OUT)?)?;
                kernels::handle_group_conv3x3(call.groups, call.uniforms, &input, &weights, out)?;
            }
        }
        state.stats.dispatches += 1;
        Ok(())
    }

    fn memory_barrier(&mut self) {
        // Host execution is already complete when dispatch returns.
        self.state.lock().stats.barriers += 1;
    }

    fn read_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: usize,
        len: usize,
    ) -> Result<Vec<u8>, ComputeError> {
        let state = self.state.lock();
        let bytes: &[u8] = bytemuck::cast_slice(state.words(buffer)?);
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= bytes.len())
            .ok_or(ComputeError::MapOutOfRange {
                offset,
                len,
                capacity: bytes.len(),
            })?;
        Ok(bytes[offset..end].to_vec())
    }

    fn draw_points(
        &mut self,
        program: ProgramHandle,
        vertices: BufferHandle,
        count: u32,
    ) -> Result<(), ComputeError> {
        let mut state = self.state.lock();
        match state.programs.get(&program) {
            Some(CpuProgram::Points) => {}
            Some(_) => return Err(ComputeError::InvalidProgram(program)),
            None => return Err(ComputeError::UnknownProgram(program)),
        }
        let words = state.words(vertices)?;
        let whole = words.len() / 8 * 8;
        let points: &[PointVertex] = bytemuck::cast_slice(&words[..whole]);
        if count as usize > points.len() {
            return Err(ComputeError::DrawOutOfRange {
                count,
                capacity: words.len() * 4,
            });
        }
        let points = points[..count as usize].to_vec();

        let (width, height) = state.viewport;
        state.framebuffer.fill([0.0; 4]);
        for p in &points {
            if let Some(i) = pixel_index(p.position, width, height) {
                state.framebuffer[i] = p.color;
            }
        }
        state.stats.draws += 1;
        state.stats.points_drawn += u64::from(count);
        Ok(())
    }
}

//! The compute dispatch controller.
//!
//! [`ComputeContext`] owns every program and storage buffer created through
//! it, tracks the four binding slots, the active program and its uniforms,
//! and which buffers hold writes not yet fenced by a barrier. Commands that
//! break the protocol are rejected before they reach the backend.
//!
//! Dropping the context releases everything it owns, but only while the
//! owning graphics context is still current; after the host has torn the
//! context down the handles are already gone and releasing is skipped.

use std::collections::HashMap;

use crate::backend::{
    BufferHandle, BufferUsage, ComputeBackend, ContextId, DeviceLimits, DispatchCall, ProgramDesc,
    ProgramHandle, ShaderSource, UniformValue,
};
use crate::inspect;
use crate::layout::{self, Access, MAX_BINDING_SLOTS};
use crate::{ComputeError, Kernel};

/// What `set_uniform` does with a name the active program does not declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum UniformPolicy {
    /// Fail with `UniformNotFound`.
    #[default]
    Strict,
    /// Log a warning and carry on.
    Lenient,
}

#[derive(Debug, Clone, Copy)]
enum ProgramKind {
    Compute(Kernel),
    Points,
}

#[derive(Debug)]
struct ProgramRecord {
    name: String,
    kind: ProgramKind,
}

#[derive(Debug)]
struct BufferRecord {
    capacity: usize,
    usage: BufferUsage,
    uploaded: bool,
    /// Written by a dispatch that no barrier has fenced yet.
    pending_write: bool,
}

#[derive(Debug)]
struct ActiveMapping {
    generation: u64,
    bytes: Vec<u8>,
}

/// A read mapping of part of a storage buffer.
///
/// The bytes are reached through [`ComputeContext::mapped_bytes`] and stay
/// valid until the mapping is passed to [`ComputeContext::unmap`]. Clones
/// of a mapping that has been unmapped fail with `UseAfterUnmap`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    buffer: BufferHandle,
    offset: usize,
    len: usize,
    generation: u64,
}

impl Mapping {
    #[must_use]
    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Everything that determines one compute invocation.
#[derive(Debug, Clone)]
pub struct DispatchDescriptor<'a> {
    pub program: ProgramHandle,
    pub groups: [u32; 3],
    pub uniforms: &'a [(&'a str, UniformValue)],
    pub bindings: &'a [(u32, BufferHandle)],
}

pub struct ComputeContext<B: ComputeBackend> {
    backend: B,
    owner: ContextId,
    uniform_policy: UniformPolicy,
    programs: HashMap<ProgramHandle, ProgramRecord>,
    buffers: HashMap<BufferHandle, BufferRecord>,
    slots: [Option<BufferHandle>; MAX_BINDING_SLOTS as usize],
    active: Option<ProgramHandle>,
    uniforms: Vec<UniformValue>,
    mappings: HashMap<BufferHandle, ActiveMapping>,
    next_generation: u64,
}

impl<B: ComputeBackend> ComputeContext<B> {
    /// Wraps `backend`, taking ownership of whatever context is current.
    pub fn new(backend: B, uniform_policy: UniformPolicy) -> Result<Self, ComputeError> {
        let owner = backend
            .current_context()
            .ok_or(ComputeError::ContextNotCurrent)?;
        Ok(Self {
            backend,
            owner,
            uniform_policy,
            programs: HashMap::new(),
            buffers: HashMap::new(),
            slots: [None; MAX_BINDING_SLOTS as usize],
            active: None,
            uniforms: Vec::new(),
            mappings: HashMap::new(),
            next_generation: 0,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn owner(&self) -> ContextId {
        self.owner
    }

    pub fn uniform_policy(&self) -> UniformPolicy {
        self.uniform_policy
    }

    /// Whether the context these handles belong to is current.
    pub fn is_current(&self) -> bool {
        self.backend.current_context() == Some(self.owner)
    }

    pub fn limits(&self) -> DeviceLimits {
        self.backend.limits()
    }

    pub fn set_viewport(&mut self, width: u32, height: u32) {
        self.backend.set_viewport(width, height);
    }

    fn ensure_current(&self) -> Result<(), ComputeError> {
        if self.is_current() {
            Ok(())
        } else {
            Err(ComputeError::ContextNotCurrent)
        }
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&BufferRecord, ComputeError> {
        self.buffers
            .get(&handle)
            .ok_or(ComputeError::UnknownBuffer(handle))
    }

    fn ensure_unmapped(&self, handle: BufferHandle) -> Result<(), ComputeError> {
        if self.mappings.contains_key(&handle) {
            Err(ComputeError::BufferMapped(handle))
        } else {
            Ok(())
        }
    }

    // ---- programs ----

    pub fn compile_compute(
        &mut self,
        kernel: Kernel,
        source: &ShaderSource,
    ) -> Result<ProgramHandle, ComputeError> {
        self.ensure_current()?;
        let handle = self
            .backend
            .create_program(&ProgramDesc::Compute { kernel, source })?;
        tracing::debug!("compiled {} for {}", source.name, kernel.name());
        self.programs.insert(
            handle,
            ProgramRecord {
                name: source.name.clone(),
                kind: ProgramKind::Compute(kernel),
            },
        );
        Ok(handle)
    }

    pub fn compile_points(
        &mut self,
        vertex: &ShaderSource,
        fragment: &ShaderSource,
    ) -> Result<ProgramHandle, ComputeError> {
        self.ensure_current()?;
        let desc = ProgramDesc::Points { vertex, fragment };
        let handle = self.backend.create_program(&desc)?;
        self.programs.insert(
            handle,
            ProgramRecord {
                name: desc.name(),
                kind: ProgramKind::Points,
            },
        );
        Ok(handle)
    }

    pub fn delete_program(&mut self, program: ProgramHandle) -> Result<(), ComputeError> {
        self.programs
            .remove(&program)
            .ok_or(ComputeError::UnknownProgram(program))?;
        if self.active == Some(program) {
            self.active = None;
            self.uniforms.clear();
        }
        self.backend.delete_program(program);
        Ok(())
    }

    /// Makes `program` the target of `set_uniform` and `dispatch`.
    ///
    /// Uniform values reset to zero on every switch.
    pub fn use_program(&mut self, program: ProgramHandle) -> Result<(), ComputeError> {
        let record = self
            .programs
            .get(&program)
            .ok_or(ComputeError::UnknownProgram(program))?;
        let ProgramKind::Compute(kernel) = record.kind else {
            return Err(ComputeError::InvalidProgram(program));
        };
        self.active = Some(program);
        self.uniforms = layout::uniforms(&kernel)
            .iter()
            .map(|decl| UniformValue::zero(decl.kind))
            .collect();
        Ok(())
    }

    fn active_kernel(&self) -> Result<(ProgramHandle, Kernel), ComputeError> {
        let program = self.active.ok_or(ComputeError::NoActiveProgram)?;
        match self.programs.get(&program).map(|r| r.kind) {
            Some(ProgramKind::Compute(kernel)) => Ok((program, kernel)),
            _ => Err(ComputeError::NoActiveProgram),
        }
    }

    pub fn set_uniform(&mut self, name: &str, value: UniformValue) -> Result<(), ComputeError> {
        let (_, kernel) = self.active_kernel()?;
        let Some(index) = layout::uniform_index(&kernel, name) else {
            return match self.uniform_policy {
                UniformPolicy::Strict => Err(ComputeError::UniformNotFound(name.to_string())),
                UniformPolicy::Lenient => {
                    tracing::warn!("{} has no uniform {name}; ignoring", kernel.name());
                    Ok(())
                }
            };
        };
        if layout::uniforms(&kernel)[index].kind != value.kind() {
            return Err(ComputeError::UniformTypeMismatch(name.to_string()));
        }
        self.uniforms[index] = value;
        Ok(())
    }

    // ---- buffers ----

    pub fn create_storage_buffer(
        &mut self,
        capacity: usize,
        usage: BufferUsage,
    ) -> Result<BufferHandle, ComputeError> {
        self.ensure_current()?;
        let limit = self.backend.limits().max_storage_block_size;
        if capacity == 0 || capacity % 4 != 0 || capacity as u64 > limit {
            return Err(ComputeError::InvalidCapacity(capacity));
        }
        let handle = self.backend.create_buffer(capacity, usage)?;
        self.buffers.insert(
            handle,
            BufferRecord {
                capacity,
                usage,
                uploaded: false,
                pending_write: false,
            },
        );
        Ok(handle)
    }

    /// Allocates a buffer sized to `bytes` and uploads them.
    pub fn create_storage_buffer_with(
        &mut self,
        bytes: &[u8],
        usage: BufferUsage,
    ) -> Result<BufferHandle, ComputeError> {
        let handle = self.create_storage_buffer(bytes.len(), usage)?;
        self.upload(handle, bytes)?;
        Ok(handle)
    }

    pub fn capacity(&self, handle: BufferHandle) -> Result<usize, ComputeError> {
        self.buffer(handle).map(|b| b.capacity)
    }

    /// Replaces the whole contents of `handle`. A dispatch's write to the
    /// buffer must be fenced first.
    pub fn upload(&mut self, handle: BufferHandle, bytes: &[u8]) -> Result<(), ComputeError> {
        let record = self.buffer(handle)?;
        if record.pending_write {
            return Err(ComputeError::MissingBarrier(handle));
        }
        let capacity = record.capacity;
        if bytes.len() != capacity {
            return Err(ComputeError::UploadSizeMismatch {
                expected: capacity,
                actual: bytes.len(),
            });
        }
        self.ensure_unmapped(handle)?;
        self.backend.write_buffer(handle, bytes)?;
        if let Some(record) = self.buffers.get_mut(&handle) {
            record.uploaded = true;
        }
        Ok(())
    }

    pub fn delete_buffer(&mut self, handle: BufferHandle) -> Result<(), ComputeError> {
        self.buffers
            .remove(&handle)
            .ok_or(ComputeError::UnknownBuffer(handle))?;
        self.mappings.remove(&handle);
        for slot in &mut self.slots {
            if *slot == Some(handle) {
                *slot = None;
            }
        }
        self.backend.delete_buffer(handle);
        Ok(())
    }

    // ---- binding slots ----

    /// Binds `handle` to `slot`, replacing whatever was bound there.
    pub fn bind(&mut self, slot: u32, handle: BufferHandle) -> Result<(), ComputeError> {
        if slot >= MAX_BINDING_SLOTS {
            return Err(ComputeError::InvalidSlot(slot));
        }
        if !self.buffer(handle)?.uploaded {
            return Err(ComputeError::BufferNotUploaded(handle));
        }
        self.ensure_unmapped(handle)?;
        if let Some(previous) = self.slots[slot as usize].replace(handle) {
            if previous != handle {
                tracing::trace!("slot {slot}: {previous:?} replaced by {handle:?}");
            }
        }
        Ok(())
    }

    pub fn unbind(&mut self, slot: u32) -> Result<(), ComputeError> {
        if slot >= MAX_BINDING_SLOTS {
            return Err(ComputeError::InvalidSlot(slot));
        }
        self.slots[slot as usize] = None;
        Ok(())
    }

    pub fn unbind_all(&mut self) {
        self.slots = [None; MAX_BINDING_SLOTS as usize];
    }

    #[must_use]
    pub fn binding(&self, slot: u32) -> Option<BufferHandle> {
        self.slots.get(slot as usize).copied().flatten()
    }

    // ---- dispatch ----

    /// Dispatches the active program over a `x * y * z` grid of work groups.
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<(), ComputeError> {
        let groups = [x, y, z];
        let max = self.backend.limits().max_work_group_count;
        if groups.iter().zip(max).any(|(&g, m)| g == 0 || g > m) {
            return Err(ComputeError::InvalidDispatchSize(groups));
        }
        self.ensure_current()?;
        let (program, kernel) = self.active_kernel()?;

        let mut bindings = Vec::with_capacity(layout::bindings(&kernel).len());
        for decl in layout::bindings(&kernel) {
            let handle = self
                .binding(decl.slot)
                .ok_or(ComputeError::UnboundSlot(decl.slot))?;
            let record = self.buffer(handle)?;
            if record.pending_write {
                return Err(ComputeError::MissingBarrier(handle));
            }
            self.ensure_unmapped(handle)?;
            bindings.push((decl.slot, handle));
        }

        self.backend.dispatch(&DispatchCall {
            program,
            kernel,
            groups,
            bindings: &bindings,
            uniforms: &self.uniforms,
        })?;

        for decl in layout::bindings(&kernel) {
            if decl.access == Access::ReadWrite {
                if let Some(record) = self
                    .binding(decl.slot)
                    .and_then(|h| self.buffers.get_mut(&h))
                {
                    record.pending_write = true;
                }
            }
        }
        tracing::trace!("dispatched {} over {groups:?}", kernel.name());
        Ok(())
    }

    /// Fences every dispatch issued so far.
    pub fn barrier(&mut self) {
        self.backend.memory_barrier();
        for record in self.buffers.values_mut() {
            record.pending_write = false;
        }
    }

    /// Whether `handle` holds writes no barrier has fenced yet.
    pub fn has_pending_write(&self, handle: BufferHandle) -> Result<bool, ComputeError> {
        self.buffer(handle).map(|b| b.pending_write)
    }

    /// Runs one complete dispatch: program, uniforms, bindings, dispatch,
    /// then unbinds every slot and issues a barrier.
    ///
    /// Slots are cleared even when a step fails.
    pub fn run(&mut self, desc: &DispatchDescriptor<'_>) -> Result<(), ComputeError> {
        let result = self.run_bound(desc);
        self.unbind_all();
        result?;
        self.barrier();
        Ok(())
    }

    fn run_bound(&mut self, desc: &DispatchDescriptor<'_>) -> Result<(), ComputeError> {
        self.use_program(desc.program)?;
        for (name, value) in desc.uniforms {
            self.set_uniform(name, *value)?;
        }
        for (slot, handle) in desc.bindings {
            self.bind(*slot, *handle)?;
        }
        let [x, y, z] = desc.groups;
        self.dispatch(x, y, z)
    }

    // ---- read-back ----

    /// Maps `len` bytes of `handle` starting at `offset` for reading.
    pub fn map_for_read(
        &mut self,
        handle: BufferHandle,
        offset: usize,
        len: usize,
    ) -> Result<Mapping, ComputeError> {
        let record = self.buffer(handle)?;
        let capacity = record.capacity;
        if offset.checked_add(len).map_or(true, |end| end > capacity) {
            return Err(ComputeError::MapOutOfRange {
                offset,
                len,
                capacity,
            });
        }
        if record.pending_write {
            return Err(ComputeError::MissingBarrier(handle));
        }
        if self.mappings.contains_key(&handle) {
            return Err(ComputeError::AlreadyMapped(handle));
        }
        self.ensure_current()?;
        let bytes = self.backend.read_buffer(handle, offset, len)?;
        self.next_generation += 1;
        let generation = self.next_generation;
        self.mappings
            .insert(handle, ActiveMapping { generation, bytes });
        Ok(Mapping {
            buffer: handle,
            offset,
            len,
            generation,
        })
    }

    /// The bytes behind a live mapping.
    pub fn mapped_bytes(&self, mapping: &Mapping) -> Result<&[u8], ComputeError> {
        match self.mappings.get(&mapping.buffer) {
            Some(active) if active.generation == mapping.generation => Ok(&active.bytes),
            _ => Err(ComputeError::UseAfterUnmap(mapping.buffer)),
        }
    }

    pub fn unmap(&mut self, mapping: Mapping) -> Result<(), ComputeError> {
        match self.mappings.get(&mapping.buffer) {
            Some(active) if active.generation == mapping.generation => {
                self.mappings.remove(&mapping.buffer);
                Ok(())
            }
            _ => Err(ComputeError::UseAfterUnmap(mapping.buffer)),
        }
    }

    /// Copies a whole buffer out through a short-lived mapping.
    pub fn read_back(&mut self, handle: BufferHandle) -> Result<Vec<u8>, ComputeError> {
        let capacity = self.capacity(handle)?;
        let mapping = self.map_for_read(handle, 0, capacity)?;
        let bytes = self.mapped_bytes(&mapping)?.to_vec();
        self.unmap(mapping)?;
        Ok(bytes)
    }

    /// Maps `handle`, formats a `width` x `height` window of `T` values
    /// starting `row_offset` elements in, and unmaps.
    pub fn read_grid<T>(
        &mut self,
        handle: BufferHandle,
        width: usize,
        height: usize,
        row_offset: usize,
    ) -> Result<Vec<String>, ComputeError>
    where
        T: bytemuck::Pod + std::fmt::Display,
    {
        let capacity = self.capacity(handle)?;
        let mapping = self.map_for_read(handle, 0, capacity)?;
        let rows = inspect::format_grid::<T>(self.mapped_bytes(&mapping)?, width, height, row_offset);
        self.unmap(mapping)?;
        Ok(rows)
    }

    // ---- draw ----

    /// Draws `count` points whose vertices are read from `vertices`.
    pub fn draw_points(
        &mut self,
        program: ProgramHandle,
        vertices: BufferHandle,
        count: u32,
    ) -> Result<(), ComputeError> {
        match self.programs.get(&program).map(|r| r.kind) {
            Some(ProgramKind::Points) => {}
            Some(ProgramKind::Compute(_)) => return Err(ComputeError::InvalidProgram(program)),
            None => return Err(ComputeError::UnknownProgram(program)),
        }
        let record = self.buffer(vertices)?;
        if !record.uploaded {
            return Err(ComputeError::BufferNotUploaded(vertices));
        }
        if record.pending_write {
            return Err(ComputeError::MissingBarrier(vertices));
        }
        let needed = count as usize * std::mem::size_of::<crate::PointVertex>();
        if needed > record.capacity {
            return Err(ComputeError::DrawOutOfRange {
                count,
                capacity: record.capacity,
            });
        }
        self.ensure_unmapped(vertices)?;
        self.ensure_current()?;
        self.backend.draw_points(program, vertices, count)
    }

    // ---- teardown ----

    /// Number of buffers and programs this context still owns.
    #[must_use]
    pub fn live_resources(&self) -> (usize, usize) {
        (self.buffers.len(), self.programs.len())
    }

    /// Releases every buffer and program. If the owning context is no longer
    /// current the handles are already invalid and are only forgotten.
    pub fn release_all(&mut self) {
        self.unbind_all();
        self.mappings.clear();
        self.active = None;
        let buffers: Vec<_> = self.buffers.drain().collect();
        let programs: Vec<_> = self.programs.drain().collect();
        if !self.is_current() {
            if !buffers.is_empty() || !programs.is_empty() {
                tracing::debug!(
                    "context {:?} is gone; dropping {} buffer and {} program handles",
                    self.owner,
                    buffers.len(),
                    programs.len()
                );
            }
            return;
        }
        for (handle, record) in buffers {
            tracing::trace!(
                "releasing {handle:?} ({} bytes, {:?})",
                record.capacity,
                record.usage
            );
            self.backend.delete_buffer(handle);
        }
        for (handle, record) in programs {
            tracing::trace!("releasing program {}", record.name);
            self.backend.delete_program(handle);
        }
    }
}

impl<B: ComputeBackend> Drop for ComputeContext<B> {
    fn drop(&mut self) {
        self.release_all();
    }
}

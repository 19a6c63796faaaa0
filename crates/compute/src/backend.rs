use crate::{ComputeError, Kernel};

/// Identity of a graphics context; handles are only valid while it is current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramHandle(pub u64);

/// Update-frequency hint for a storage buffer. Does not affect correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    Static,
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    F32(f32),
    U32(u32),
    I32(i32),
}

impl UniformValue {
    #[must_use]
    pub const fn kind(&self) -> crate::layout::UniformKind {
        use crate::layout::UniformKind;
        match self {
            UniformValue::F32(_) => UniformKind::F32,
            UniformValue::U32(_) => UniformKind::U32,
            UniformValue::I32(_) => UniformKind::I32,
        }
    }

    #[must_use]
    pub const fn zero(kind: crate::layout::UniformKind) -> Self {
        use crate::layout::UniformKind;
        match kind {
            UniformKind::F32 => UniformValue::F32(0.0),
            UniformKind::U32 => UniformValue::U32(0),
            UniformKind::I32 => UniformValue::I32(0),
        }
    }

    /// Native-endian bytes of the scalar, as a shader sees it.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 4] {
        match *self {
            UniformValue::F32(v) => v.to_ne_bytes(),
            UniformValue::U32(v) => v.to_ne_bytes(),
            UniformValue::I32(v) => v.to_ne_bytes(),
        }
    }

    #[must_use]
    pub fn as_f32(&self) -> f32 {
        match *self {
            UniformValue::F32(v) => v,
            #[allow(clippy::cast_precision_loss)]
            UniformValue::U32(v) => v as f32,
            #[allow(clippy::cast_precision_loss)]
            UniformValue::I32(v) => v as f32,
        }
    }

    #[must_use]
    pub fn as_u32(&self) -> u32 {
        match *self {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            UniformValue::F32(v) => v as u32,
            UniformValue::U32(v) => v,
            UniformValue::I32(v) => u32::try_from(v).unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderLanguage {
    GlslEs,
    Wgsl,
}

impl ShaderLanguage {
    /// Infers the language from an asset name; `.wgsl` is WGSL, anything
    /// else is treated as GLSL ES.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        if name.ends_with(".wgsl") {
            ShaderLanguage::Wgsl
        } else {
            ShaderLanguage::GlslEs
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSource {
    pub name: String,
    pub language: ShaderLanguage,
    pub text: String,
}

impl ShaderSource {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            language: ShaderLanguage::from_name(&name),
            name,
            text: text.into(),
        }
    }
}

/// What to build when creating a program.
#[derive(Debug, Clone, Copy)]
pub enum ProgramDesc<'a> {
    Compute {
        kernel: Kernel,
        source: &'a ShaderSource,
    },
    /// Vertex + fragment pair drawing points from 32-byte
    /// [`PointVertex`](crate::PointVertex) records.
    Points {
        vertex: &'a ShaderSource,
        fragment: &'a ShaderSource,
    },
}

impl ProgramDesc<'_> {
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            ProgramDesc::Compute { source, .. } => source.name.clone(),
            ProgramDesc::Points { vertex, fragment } => {
                format!("{}+{}", vertex.name, fragment.name)
            }
        }
    }
}

/// Compute capabilities of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_work_group_count: [u32; 3],
    pub max_work_group_size: [u32; 3],
    pub max_work_group_invocations: u32,
    pub max_storage_block_size: u64,
}

impl Default for DeviceLimits {
    /// Minimum values an OpenGL ES 3.1 implementation must support.
    fn default() -> Self {
        Self {
            max_work_group_count: [65_535; 3],
            max_work_group_size: [128, 128, 64],
            max_work_group_invocations: 128,
            max_storage_block_size: 1 << 27,
        }
    }
}

/// A validated dispatch, handed from [`ComputeContext`](crate::ComputeContext)
/// to the backend.
#[derive(Debug, Clone, Copy)]
pub struct DispatchCall<'a> {
    pub program: ProgramHandle,
    pub kernel: Kernel,
    pub groups: [u32; 3],
    /// Slot and buffer for every binding the kernel declares.
    pub bindings: &'a [(u32, BufferHandle)],
    /// One value per declared uniform, in declaration order.
    pub uniforms: &'a [UniformValue],
}

/// A device able to run the storage-buffer protocol.
///
/// Backends execute commands; they do not police ordering. State rules
/// (upload before bind, barrier before read) are enforced by
/// [`ComputeContext`](crate::ComputeContext), so a backend may assume every
/// call it receives is well-formed with respect to them.
pub trait ComputeBackend: Send {
    /// The context commands are currently issued against, if any.
    fn current_context(&self) -> Option<ContextId>;

    fn set_viewport(&mut self, width: u32, height: u32);

    fn limits(&self) -> DeviceLimits;

    /// Language this backend compiles natively.
    fn preferred_language(&self) -> ShaderLanguage;

    /// Builds a program.
    ///
    /// Returns `ComputeError::ProgramCompileFailed` with the backend's log
    /// when the source does not build.
    fn create_program(&mut self, desc: &ProgramDesc<'_>) -> Result<ProgramHandle, ComputeError>;

    fn delete_program(&mut self, program: ProgramHandle);

    /// Allocates `capacity` bytes of storage. Contents are undefined until
    /// the first write.
    fn create_buffer(
        &mut self,
        capacity: usize,
        usage: BufferUsage,
    ) -> Result<BufferHandle, ComputeError>;

    fn delete_buffer(&mut self, buffer: BufferHandle);

    /// Replaces the whole contents of `buffer`.
    fn write_buffer(&mut self, buffer: BufferHandle, bytes: &[u8]) -> Result<(), ComputeError>;

    fn dispatch(&mut self, call: &DispatchCall<'_>) -> Result<(), ComputeError>;

    /// Makes every write issued so far visible to every later read.
    fn memory_barrier(&mut self);

    /// Copies `len` bytes starting at `offset` out of `buffer`.
    fn read_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: usize,
        len: usize,
    ) -> Result<Vec<u8>, ComputeError>;

    /// Draws `count` points sourcing vertices from `vertices`.
    fn draw_points(
        &mut self,
        program: ProgramHandle,
        vertices: BufferHandle,
        count: u32,
    ) -> Result<(), ComputeError>;
}

impl<B: ComputeBackend + ?Sized> ComputeBackend for Box<B> {
    fn current_context(&self) -> Option<ContextId> {
        (**self).current_context()
    }

    fn set_viewport(&mut self, width: u32, height: u32) {
        (**self).set_viewport(width, height);
    }

    fn limits(&self) -> DeviceLimits {
        (**self).limits()
    }

    fn preferred_language(&self) -> ShaderLanguage {
        (**self).preferred_language()
    }

    fn create_program(&mut self, desc: &ProgramDesc<'_>) -> Result<ProgramHandle, ComputeError> {
        (**self).create_program(desc)
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        (**self).delete_program(program);
    }

    fn create_buffer(
        &mut self,
        capacity: usize,
        usage: BufferUsage,
    ) -> Result<BufferHandle, ComputeError> {
        (**self).create_buffer(capacity, usage)
    }

    fn delete_buffer(&mut self, buffer: BufferHandle) {
        (**self).delete_buffer(buffer);
    }

    fn write_buffer(&mut self, buffer: BufferHandle, bytes: &[u8]) -> Result<(), ComputeError> {
        (**self).write_buffer(buffer, bytes)
    }

    fn dispatch(&mut self, call: &DispatchCall<'_>) -> Result<(), ComputeError> {
        (**self).dispatch(call)
    }

    fn memory_barrier(&mut self) {
        (**self).memory_barrier();
    }

    fn read_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: usize,
        len: usize,
    ) -> Result<Vec<u8>, ComputeError> {
        (**self).read_buffer(buffer, offset, len)
    }

    fn draw_points(
        &mut self,
        program: ProgramHandle,
        vertices: BufferHandle,
        count: u32,
    ) -> Result<(), ComputeError> {
        (**self).draw_points(program, vertices, count)
    }
}

//! Binding and uniform tables for every [`Kernel`].
//!
//! Slot numbers here must agree with the `binding = N` declarations in the
//! shader assets.

use crate::Kernel;

/// Number of shader-storage binding points the protocol uses.
pub const MAX_BINDING_SLOTS: u32 = 4;

pub const STORAGE_IN: u32 = 0;
pub const STORAGE_WEIGHTS: u32 = 1;
pub const STORAGE_OUT: u32 = 2;
pub const POINT_OUT: u32 = 0;

const _: () = assert!(STORAGE_OUT < MAX_BINDING_SLOTS);

/// Work-group size shared by every kernel.
pub const LOCAL_SIZE: [u32; 3] = [8, 8, 1];

/// Floats per convolution channel: nine taps then the bias.
pub const CONV_WEIGHTS_PER_CHANNEL: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingDecl {
    pub slot: u32,
    pub access: Access,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniformKind {
    F32,
    U32,
    I32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformDecl {
    pub name: &'static str,
    pub kind: UniformKind,
}

const POINT_BINDINGS: &[BindingDecl] = &[BindingDecl {
    slot: POINT_OUT,
    access: Access::ReadWrite,
}];

const CONV_BINDINGS: &[BindingDecl] = &[
    BindingDecl {
        slot: STORAGE_IN,
        access: Access::ReadOnly,
    },
    BindingDecl {
        slot: STORAGE_WEIGHTS,
        access: Access::ReadOnly,
    },
    BindingDecl {
        slot: STORAGE_OUT,
        access: Access::ReadWrite,
    },
];

const POINT_UNIFORMS: &[UniformDecl] = &[UniformDecl {
    name: "radius",
    kind: UniformKind::F32,
}];

const CONV_UNIFORMS: &[UniformDecl] = &[
    UniformDecl {
        name: "width",
        kind: UniformKind::U32,
    },
    UniformDecl {
        name: "height",
        kind: UniformKind::U32,
    },
    UniformDecl {
        name: "channels",
        kind: UniformKind::U32,
    },
];

/// Storage bindings declared by the kernel.
#[must_use]
pub const fn bindings(kernel: &Kernel) -> &'static [BindingDecl] {
    match kernel {
        Kernel::PointCircle | Kernel::InvocationProbe => POINT_BINDINGS,
        Kernel::GroupConv3x3 => CONV_BINDINGS,
    }
}

/// Uniforms declared by the kernel, in the order they are packed.
#[must_use]
pub const fn uniforms(kernel: &Kernel) -> &'static [UniformDecl] {
    match kernel {
        Kernel::PointCircle => POINT_UNIFORMS,
        Kernel::InvocationProbe => &[],
        Kernel::GroupConv3x3 => CONV_UNIFORMS,
    }
}

/// Return expected number of bindings for each kernel.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn binding_count(kernel: &Kernel) -> u32 {
    bindings(kernel).len() as u32
}

/// Index of `name` in the kernel's uniform block.
#[must_use]
pub fn uniform_index(kernel: &Kernel, name: &str) -> Option<usize> {
    uniforms(kernel).iter().position(|u| u.name == name)
}

/// Access mode of `slot`, or `None` when the kernel does not declare it.
#[must_use]
pub fn access(kernel: &Kernel, slot: u32) -> Option<Access> {
    bindings(kernel)
        .iter()
        .find(|b| b.slot == slot)
        .map(|b| b.access)
}

/// Total invocations in one work group.
#[must_use]
pub const fn invocations_per_group() -> u32 {
    LOCAL_SIZE[0] * LOCAL_SIZE[1] * LOCAL_SIZE[2]
}

/// Number of work groups needed to cover `extent` along one axis.
#[must_use]
pub const fn groups_for(extent: u32, local: u32) -> u32 {
    extent.div_ceil(local)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv_declares_inputs_read_only() {
        assert_eq!(access(&Kernel::GroupConv3x3, STORAGE_IN), Some(Access::ReadOnly));
        assert_eq!(
            access(&Kernel::GroupConv3x3, STORAGE_WEIGHTS),
            Some(Access::ReadOnly)
        );
        assert_eq!(access(&Kernel::GroupConv3x3, STORAGE_OUT), Some(Access::ReadWrite));
        assert_eq!(access(&Kernel::GroupConv3x3, 3), None);
    }

    #[test]
    fn uniform_lookup() {
        assert_eq!(uniform_index(&Kernel::PointCircle, "radius"), Some(0));
        assert_eq!(uniform_index(&Kernel::GroupConv3x3, "channels"), Some(2));
        assert_eq!(uniform_index(&Kernel::InvocationProbe, "radius"), None);
    }

    #[test]
    fn group_coverage_rounds_up() {
        assert_eq!(groups_for(160, LOCAL_SIZE[0]), 20);
        assert_eq!(groups_for(161, LOCAL_SIZE[0]), 21);
        assert_eq!(invocations_per_group(), 64);
    }
}

//! External-interface value types (§6) that are not full resources in their own
//! right: usage intents, bitsets, and small descriptor structs passed into the
//! `create*` family on [`crate::device::Device`].

use bitflags::bitflags;

/// Coarse placement intent for a memory allocation (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryUsage {
    /// Prefer `DEVICE_LOCAL`; no host-visibility requirement.
    PreferDevice,
    /// Require `HOST_VISIBLE | HOST_COHERENT`; prefer `HOST_CACHED` only when
    /// `MappeableForRandomAccess` is also set.
    PreferHost,
}

bitflags! {
    /// Flags recognized by the memory manager (§4.1).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryFlags: u32 {
        /// Bypass the suballocator and allocate a single dedicated chunk.
        const DEDICATED = 1 << 0;
        /// The allocation must be persistently mapped for its whole life.
        const MAPPED = 1 << 1;
        /// Host access pattern is sequential writes (e.g. an upload ring buffer).
        const MAPPEABLE_FOR_SEQUENTIAL_WRITE = 1 << 2;
        /// Host access pattern is random access reads/writes (prefers `HOST_CACHED`).
        const MAPPEABLE_FOR_RANDOM_ACCESS = 1 << 3;
        /// The resource requires transfer usage (affects nothing in selection
        /// directly, but documents caller intent used by other layers).
        const REQUIRED_TRANSFER = 1 << 4;
        /// The resource may additionally be used as a transfer source/destination.
        const ALLOW_TRANSFER = 1 << 5;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STRUCTURED_RO = 1 << 3;
        const STRUCTURED_RW = 1 << 4;
        const INDIRECT = 1 << 5;
        const STAGING = 1 << 6;
        const DYNAMIC = 1 << 7;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TextureUsage: u32 {
        const SAMPLED = 1 << 0;
        const STORAGE = 1 << 1;
        const RENDER_TARGET = 1 << 2;
        const DEPTH_STENCIL = 1 << 3;
        const CUBEMAP = 1 << 4;
        const STAGING = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureKind {
    D1,
    D2,
    D3,
}

/// Seven descriptor kinds tracked by the pool manager (§3, §4.2), in a fixed,
/// stable order used everywhere a `DescriptorCounts` tuple is indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescriptorCounts {
    pub uniform_buffers: u32,
    pub dynamic_uniform_buffers: u32,
    pub sampled_images: u32,
    pub samplers: u32,
    pub storage_buffers: u32,
    pub dynamic_storage_buffers: u32,
    pub storage_images: u32,
}

impl DescriptorCounts {
    pub const KIND_COUNT: usize = 7;

    pub fn as_array(&self) -> [u32; Self::KIND_COUNT] {
        [
            self.uniform_buffers,
            self.dynamic_uniform_buffers,
            self.sampled_images,
            self.samplers,
            self.storage_buffers,
            self.dynamic_storage_buffers,
            self.storage_images,
        ]
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn saturating_sub(&self, other: &Self) -> Self {
        let a = self.as_array();
        let b = other.as_array();
        let mut out = [0u32; Self::KIND_COUNT];
        for i in 0..Self::KIND_COUNT {
            out[i] = a[i].saturating_sub(b[i]);
        }
        Self::from_array(out)
    }

    pub fn add(&self, other: &Self) -> Self {
        let a = self.as_array();
        let b = other.as_array();
        let mut out = [0u32; Self::KIND_COUNT];
        for i in 0..Self::KIND_COUNT {
            out[i] = a[i] + b[i];
        }
        Self::from_array(out)
    }

    /// True if every kind in `self` is `>= other`'s corresponding kind.
    pub fn covers(&self, other: &Self) -> bool {
        let a = self.as_array();
        let b = other.as_array();
        (0..Self::KIND_COUNT).all(|i| a[i] >= b[i])
    }

    fn from_array(arr: [u32; Self::KIND_COUNT]) -> Self {
        Self {
            uniform_buffers: arr[0],
            dynamic_uniform_buffers: arr[1],
            sampled_images: arr[2],
            samplers: arr[3],
            storage_buffers: arr[4],
            dynamic_storage_buffers: arr[5],
            storage_images: arr[6],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceLayoutElementKind {
    UniformBuffer,
    StructuredRO,
    StructuredRW,
    TextureRO,
    TextureRW,
    Sampler,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResourceLayoutElementOptions: u32 {
        const DYNAMIC_BINDING = 1 << 0;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
        const GEOMETRY = 1 << 3;
        const TESS_CONTROL = 1 << 4;
        const TESS_EVALUATION = 1 << 5;
    }
}

#[derive(Debug, Clone)]
pub struct ResourceLayoutElement {
    pub kind: ResourceLayoutElementKind,
    pub stages: ShaderStages,
    pub options: ResourceLayoutElementOptions,
}

/// Device-creation configuration (§6a). The only configuration surface this
/// crate owns; everything else is a caller-provided parameter to a `create*`
/// call, never an environment variable or file this crate reads itself.
#[derive(Debug, Clone, Default)]
pub struct DeviceOptions {
    /// Force driver-result verification even in a release profile.
    pub validation: bool,
    pub label: Option<String>,
}

/// One bound resource within a `createResourceSet({layout, boundResources})`
/// call (§6). The resource set keeps its own strong ref-count on whatever is
/// bound here so the resource outlives the set (§3 "Ownership").
pub enum BoundResource<'a> {
    Buffer {
        buffer: &'a crate::resource::Buffer,
        offset: u64,
        range: u64,
    },
    Texture {
        view: &'a crate::resource::TextureView,
        sampler: Option<&'a crate::resource::Sampler>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_saturating_sub_is_identity() {
        let a = DescriptorCounts {
            uniform_buffers: 3,
            sampled_images: 1,
            ..DescriptorCounts::zero()
        };
        let b = DescriptorCounts {
            uniform_buffers: 2,
            storage_images: 5,
            ..DescriptorCounts::zero()
        };
        let sum = a.add(&b);
        assert_eq!(sum.uniform_buffers, 5);
        assert_eq!(sum.storage_images, 5);
        assert_eq!(sum.saturating_sub(&b).as_array(), a.as_array());
    }

    #[test]
    fn covers_is_per_kind() {
        let capacity = DescriptorCounts {
            uniform_buffers: 4,
            samplers: 4,
            ..DescriptorCounts::zero()
        };
        let fits = DescriptorCounts {
            uniform_buffers: 4,
            ..DescriptorCounts::zero()
        };
        let overflows = DescriptorCounts {
            samplers: 5,
            ..DescriptorCounts::zero()
        };
        assert!(capacity.covers(&fits));
        assert!(!capacity.covers(&overflows));
    }

    #[test]
    fn saturating_sub_never_underflows() {
        let small = DescriptorCounts {
            uniform_buffers: 1,
            ..DescriptorCounts::zero()
        };
        let big = DescriptorCounts {
            uniform_buffers: 5,
            ..DescriptorCounts::zero()
        };
        assert_eq!(small.saturating_sub(&big).uniform_buffers, 0);
    }
}

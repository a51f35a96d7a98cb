//! The public handle callers receive from [`super::MemoryManager::allocate`]
//! (§3 `MemoryAllocation`).

use std::sync::Arc;

use crate::error::Result;

use super::chunk::{ChunkAllocation, MemoryChunk};

/// A caller-owned slice of a [`MemoryChunk`]. Must be returned to the
/// [`super::MemoryManager`] that produced it via `free` exactly once; dropping
/// one without freeing it leaks the backing suballocation.
pub struct MemoryAllocation {
    pub(super) chunk: Arc<MemoryChunk>,
    pub(super) chunk_alloc: Option<ChunkAllocation>,
    pub(super) offset: u64,
    pub(super) size: u64,
    pub(super) alignment: u64,
    pub(super) is_dedicated: bool,
}

impl MemoryAllocation {
    pub fn device_memory(&self) -> ash::vk::DeviceMemory {
        self.chunk.raw()
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn is_dedicated(&self) -> bool {
        self.is_dedicated
    }

    pub fn memory_type_index(&self) -> u32 {
        self.chunk.memory_type_index()
    }

    /// Pointer to this allocation's region if its chunk is currently mapped
    /// (persistently, via `MemoryFlags::MAPPED`, or via an outstanding
    /// explicit [`Self::map`]).
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.chunk.mapped_ptr(self.offset)
    }

    /// Ref-counted explicit map, independent of any persistent mapping the
    /// chunk may already hold. Must be paired with [`Self::unmap`].
    pub fn map(&self, device: &ash::Device) -> Result<*mut u8> {
        self.chunk.map(device, self.offset)
    }

    pub fn unmap(&self, device: &ash::Device) {
        self.chunk.unmap(device)
    }

    pub(super) fn take_chunk_alloc(&mut self) -> ChunkAllocation {
        self.chunk_alloc
            .take()
            .expect("MemoryAllocation freed twice")
    }

    pub(super) fn chunk(&self) -> &Arc<MemoryChunk> {
        &self.chunk
    }
}

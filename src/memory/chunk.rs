//! A single `VkDeviceMemory` allocation subdivided by one [`super::tlsf::Tlsf`]
//! instance (§3 `MemoryChunk`).

use ash::vk;
use parking_lot::Mutex;

use crate::error::{Error, Result};

use super::tlsf::{Tlsf, TlsfAllocation};

/// One raw device-memory allocation. Owns its own suballocator; freed only
/// when the owning [`super::MemoryTypeBucket`] drops the last reference.
pub struct MemoryChunk {
    raw: vk::DeviceMemory,
    memory_type_index: u32,
    size: u64,
    is_linear: bool,
    host_visible: bool,
    tlsf: Mutex<Tlsf>,
    /// Protects `map_refcount`/`mapped_ptr`/`persistent` independently of the
    /// suballocator lock (`chunkMapLock`, §5) — mapping and suballocation are
    /// logically unrelated operations that can race on the same chunk.
    map_state: Mutex<MapState>,
}

struct MapState {
    mapped_ptr: *mut u8,
    map_refcount: i32,
    persistent: bool,
}

// SAFETY: `mapped_ptr` is only ever dereferenced while `map_refcount > 0`,
// which this type enforces through `map`/`unmap`; the pointer itself is not
// thread-affine.
unsafe impl Send for MapState {}

pub struct ChunkAllocation {
    pub tlsf: TlsfAllocation,
}

impl MemoryChunk {
    /// # Safety
    /// `raw` must be a valid `VkDeviceMemory` of `size` bytes, not owned
    /// elsewhere, allocated from `memory_type_index`.
    pub unsafe fn new(
        raw: vk::DeviceMemory,
        memory_type_index: u32,
        size: u64,
        is_linear: bool,
        host_visible: bool,
    ) -> Self {
        Self {
            raw,
            memory_type_index,
            size,
            is_linear,
            host_visible,
            tlsf: Mutex::new(Tlsf::new(size)),
            map_state: Mutex::new(MapState {
                mapped_ptr: std::ptr::null_mut(),
                map_refcount: 0,
                persistent: false,
            }),
        }
    }

    pub fn raw(&self) -> vk::DeviceMemory {
        self.raw
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_linear(&self) -> bool {
        self.is_linear
    }

    pub fn host_visible(&self) -> bool {
        self.host_visible
    }

    pub fn is_empty(&self) -> bool {
        self.tlsf.lock().is_empty()
    }

    pub fn suballoc(&self, size: u64, alignment: u64) -> Option<ChunkAllocation> {
        self.tlsf
            .lock()
            .alloc(size, alignment)
            .map(|tlsf| ChunkAllocation { tlsf })
    }

    pub fn subfree(&self, alloc: ChunkAllocation) {
        self.tlsf.lock().free(alloc.tlsf);
    }

    /// Map (ref-counted) the entire chunk and return a pointer offset by
    /// `offset`. Requires `host_visible`.
    pub fn map(&self, device: &ash::Device, offset: u64) -> Result<*mut u8> {
        debug_assert!(self.host_visible);
        let mut state = self.map_state.lock();
        if state.map_refcount == 0 {
            let ptr = unsafe {
                device.map_memory(self.raw, 0, self.size, vk::MemoryMapFlags::empty())?
            };
            state.mapped_ptr = ptr as *mut u8;
        }
        state.map_refcount += 1;
        Ok(unsafe { state.mapped_ptr.add(offset as usize) })
    }

    pub fn unmap(&self, device: &ash::Device) {
        let mut state = self.map_state.lock();
        debug_assert!(state.map_refcount > 0, "unmap without a matching map");
        state.map_refcount -= 1;
        if state.map_refcount == 0 && !state.persistent {
            unsafe { device.unmap_memory(self.raw) };
            state.mapped_ptr = std::ptr::null_mut();
        }
    }

    /// Mark this chunk as persistently mapped and perform the initial map.
    /// Invariant (§3): once set, `map_refcount >= 1` for the chunk's life,
    /// since the baseline reference taken here is never released by `unmap`.
    pub fn make_persistent_mapped(&self, device: &ash::Device) -> Result<()> {
        debug_assert!(self.host_visible);
        if self.map_state.lock().persistent {
            return Ok(());
        }
        let ptr = self.map(device, 0)?;
        debug_assert!(!ptr.is_null());
        self.map_state.lock().persistent = true;
        Ok(())
    }

    pub fn is_persistent_mapped(&self) -> bool {
        self.map_state.lock().persistent
    }

    /// Pointer to `offset` within this chunk, if it is currently mapped
    /// (persistently or via an outstanding explicit [`Self::map`]).
    pub fn mapped_ptr(&self, offset: u64) -> Option<*mut u8> {
        let state = self.map_state.lock();
        if state.mapped_ptr.is_null() {
            None
        } else {
            Some(unsafe { state.mapped_ptr.add(offset as usize) })
        }
    }

    /// # Safety
    /// Caller must have already freed every suballocation on this chunk.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        debug_assert!(self.is_empty(), "destroying a chunk with live allocations");
        let state = self.map_state.lock();
        if state.map_refcount > 0 {
            device.unmap_memory(self.raw);
        }
        device.free_memory(self.raw, None);
    }
}

pub(super) fn alloc_device_memory(
    device: &ash::Device,
    memory_type_index: u32,
    size: u64,
) -> Result<vk::DeviceMemory> {
    let info = vk::MemoryAllocateInfo::builder()
        .allocation_size(size)
        .memory_type_index(memory_type_index);
    unsafe { device.allocate_memory(&info, None) }.map_err(|e| match e {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Error::OutOfMemoryDevice,
        vk::Result::ERROR_OUT_OF_HOST_MEMORY => Error::OutOfMemoryHost,
        other => other.into(),
    })
}

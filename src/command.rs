//! Command buffer pooling and staging-buffer lending (§4.3).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::memory::{MemoryAllocation, MemoryManager};
use crate::types::MemoryFlags;
use crate::types::MemoryUsage;

/// States a pool-owned command buffer moves through (§3, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Ready,
    Recording,
    Submitted,
    Completed,
}

/// Aggregate pool state, derived from the counters rather than stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Ready,
    InUse,
    Completed,
    Disposed,
}

struct Slot {
    raw: vk::CommandBuffer,
    state: CommandBufferState,
}

struct Inner {
    buffers: Vec<Slot>,
    created_count: u32,
    in_use_count: u32,
    completed_count: u32,
    /// Set for the duration of a pool-wide `reset`, so per-buffer transitions
    /// the reset itself performs don't each re-derive pool state (§4.3).
    suppress_notifications: bool,
}

impl Inner {
    fn new() -> Self {
        Self {
            buffers: Vec::new(),
            created_count: 0,
            in_use_count: 0,
            completed_count: 0,
            suppress_notifications: false,
        }
    }

    /// Allocates (or reuses) the next slot's logical identity; the caller is
    /// responsible for allocating the raw `VkCommandBuffer` the first time.
    fn reserve_slot(&mut self, raw: vk::CommandBuffer) -> CommandBufferHandle {
        let index = self.created_count as usize;
        if index >= self.buffers.len() {
            self.buffers.push(Slot {
                raw,
                state: CommandBufferState::Ready,
            });
        } else {
            self.buffers[index].state = CommandBufferState::Ready;
        }
        self.created_count += 1;
        CommandBufferHandle(index)
    }

    fn begin_recording(&mut self, handle: CommandBufferHandle) {
        let slot = &mut self.buffers[handle.0];
        debug_assert_eq!(slot.state, CommandBufferState::Ready);
        slot.state = CommandBufferState::Recording;
        self.in_use_count += 1;
    }

    fn mark_submitted(&mut self, handle: CommandBufferHandle) {
        let slot = &mut self.buffers[handle.0];
        debug_assert_eq!(slot.state, CommandBufferState::Recording);
        slot.state = CommandBufferState::Submitted;
    }

    fn mark_completed(&mut self, handle: CommandBufferHandle) {
        if self.suppress_notifications {
            return;
        }
        let slot = &mut self.buffers[handle.0];
        debug_assert_eq!(slot.state, CommandBufferState::Submitted);
        slot.state = CommandBufferState::Completed;
        self.in_use_count -= 1;
        self.completed_count += 1;
    }

    /// Pure bookkeeping half of `reset`: returns `Err` without mutating
    /// anything if buffers are still in-flight (§9 open-question resolution).
    fn reset_counters(&mut self) -> Result<()> {
        if self.in_use_count > 0 {
            return Err(Error::ObjectInUse);
        }
        self.suppress_notifications = true;
        for slot in &mut self.buffers {
            slot.state = CommandBufferState::Ready;
        }
        self.created_count = 0;
        self.completed_count = 0;
        self.suppress_notifications = false;
        Ok(())
    }

    fn pool_state(&self) -> PoolState {
        if self.in_use_count > 0 {
            PoolState::InUse
        } else if self.completed_count > 0 {
            PoolState::Completed
        } else {
            PoolState::Ready
        }
    }
}

/// A handle to one command buffer owned by a [`CommandBufferPool`]. Opaque
/// outside this module; the pool is the sole authority on its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBufferHandle(usize);

struct StagingBuffer {
    buffer: vk::Buffer,
    allocation: MemoryAllocation,
    size: u64,
}

/// A staging buffer lent out by [`CommandBufferPool::get_staging_buffer`].
/// Must be returned via [`CommandBufferPool::return_staging_buffer`].
pub struct StagingHandle {
    buffer: vk::Buffer,
    allocation: MemoryAllocation,
    size: u64,
}

impl StagingHandle {
    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation.mapped_ptr()
    }
}

/// Recyclable pool of primary command buffers plus the staging-buffer
/// free-list recording commands borrow from (§3 `CommandBuffer`, §4.3).
/// Serialized by a single per-pool mutex (`commandBufferPoolLock`, §5).
pub struct CommandBufferPool {
    device: ash::Device,
    raw: vk::CommandPool,
    memory: Arc<MemoryManager>,
    disposed: AtomicBool,
    inner: Mutex<Inner>,
    staging: Mutex<Vec<StagingBuffer>>,
}

impl CommandBufferPool {
    pub fn create(
        device: ash::Device,
        memory: Arc<MemoryManager>,
        queue_family_index: u32,
        transient: bool,
        can_reset: bool,
    ) -> Result<Self> {
        let mut flags = vk::CommandPoolCreateFlags::empty();
        if transient {
            flags |= vk::CommandPoolCreateFlags::TRANSIENT;
        }
        if can_reset {
            flags |= vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER;
        }
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(flags)
            .queue_family_index(queue_family_index);
        let raw = unsafe { device.create_command_pool(&info, None) }?;

        Ok(Self {
            device,
            raw,
            memory,
            disposed: AtomicBool::new(false),
            inner: Mutex::new(Inner::new()),
            staging: Mutex::new(Vec::new()),
        })
    }

    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(Error::ObjectDisposed)
        } else {
            Ok(())
        }
    }

    /// Returns a preallocated buffer when `createdCount < buffers.len()`,
    /// otherwise allocates a fresh `VkCommandBuffer` (§4.3 Reuse).
    pub fn create_command_buffer(&self) -> Result<CommandBufferHandle> {
        self.check_disposed()?;
        let mut inner = self.inner.lock();
        let index = inner.created_count as usize;

        let raw = if index >= inner.buffers.len() {
            let info = vk::CommandBufferAllocateInfo::builder()
                .command_pool(self.raw)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            unsafe { self.device.allocate_command_buffers(&info) }?[0]
        } else {
            inner.buffers[index].raw
        };

        Ok(inner.reserve_slot(raw))
    }

    pub fn raw_command_buffer(&self, handle: CommandBufferHandle) -> vk::CommandBuffer {
        self.inner.lock().buffers[handle.0].raw
    }

    pub fn state_of(&self, handle: CommandBufferHandle) -> CommandBufferState {
        self.inner.lock().buffers[handle.0].state
    }

    pub fn begin_recording(&self, handle: CommandBufferHandle) -> Result<()> {
        self.check_disposed()?;
        self.inner.lock().begin_recording(handle);
        Ok(())
    }

    pub fn mark_submitted(&self, handle: CommandBufferHandle) {
        self.inner.lock().mark_submitted(handle);
    }

    /// Notified by the device's fence-based completion tracker (§4.5).
    pub fn mark_completed(&self, handle: CommandBufferHandle) {
        self.inner.lock().mark_completed(handle);
    }

    pub fn created_count(&self) -> u32 {
        self.inner.lock().created_count
    }

    pub fn in_use_count(&self) -> u32 {
        self.inner.lock().in_use_count
    }

    pub fn completed_count(&self) -> u32 {
        self.inner.lock().completed_count
    }

    pub fn state(&self) -> PoolState {
        if self.disposed.load(Ordering::Acquire) {
            return PoolState::Disposed;
        }
        self.inner.lock().pool_state()
    }

    /// Resets every command buffer to `Ready` and zeroes the counters.
    /// Rejects with [`Error::ObjectInUse`] while any buffer is Recording or
    /// Submitted (§9 open-question resolution; see DESIGN.md).
    pub fn reset(&self, release_system_memory: bool) -> Result<()> {
        self.check_disposed()?;
        self.inner.lock().reset_counters()?;

        let flags = if release_system_memory {
            vk::CommandPoolResetFlags::RELEASE_RESOURCES
        } else {
            vk::CommandPoolResetFlags::empty()
        };
        unsafe { self.device.reset_command_pool(self.raw, flags) }?;
        Ok(())
    }

    /// Returns the smallest free staging buffer `>= size`, or allocates a
    /// fresh one via the memory manager (§4.3 Staging buffers).
    pub fn get_staging_buffer(&self, size: u64) -> Result<StagingHandle> {
        self.check_disposed()?;
        let mut free = self.staging.lock();
        let best = smallest_fit_index(&free, size, |b| b.size);

        if let Some(index) = best {
            let staging = free.remove(index);
            return Ok(StagingHandle {
                buffer: staging.buffer,
                allocation: staging.allocation,
                size: staging.size,
            });
        }
        drop(free);

        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&info, None) }?;
        let allocation = match self.memory.allocate_for_buffer(
            buffer,
            MemoryUsage::PreferHost,
            MemoryFlags::MAPPED | MemoryFlags::MAPPEABLE_FOR_RANDOM_ACCESS,
        ) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.device_memory(), allocation.offset())
        }?;

        Ok(StagingHandle {
            buffer,
            allocation,
            size,
        })
    }

    pub fn return_staging_buffer(&self, handle: StagingHandle) {
        self.staging.lock().push(StagingBuffer {
            buffer: handle.buffer,
            allocation: handle.allocation,
            size: handle.size,
        });
    }

    /// # Safety
    /// No command buffer allocated from this pool may still be in-flight.
    pub unsafe fn destroy(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        for staging in self.staging.lock().drain(..) {
            self.device.destroy_buffer(staging.buffer, None);
            self.memory.free(staging.allocation);
        }
        self.device.destroy_command_pool(self.raw, None);
    }
}

/// Index of the smallest `item` with `size_of(item) >= size`, or `None`.
fn smallest_fit_index<T>(items: &[T], size: u64, size_of: impl Fn(&T) -> u64) -> Option<usize> {
    items
        .iter()
        .enumerate()
        .filter(|(_, item)| size_of(item) >= size)
        .min_by_key(|(_, item)| size_of(item))
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn fake_handle(raw: u64) -> vk::CommandBuffer {
        vk::CommandBuffer::from_raw(raw)
    }

    #[test]
    fn full_cycle_updates_counters_and_state() {
        let mut inner = Inner::new();
        let a = inner.reserve_slot(fake_handle(1));
        let b = inner.reserve_slot(fake_handle(2));
        assert_eq!(inner.created_count, 2);
        assert!(matches!(inner.pool_state(), PoolState::Ready));

        inner.begin_recording(a);
        assert_eq!(inner.in_use_count, 1);
        assert!(matches!(inner.pool_state(), PoolState::InUse));

        inner.mark_submitted(a);
        assert_eq!(inner.buffers[0].state, CommandBufferState::Submitted);
        assert_eq!(inner.in_use_count, 1, "submitted is still in-use");

        inner.mark_completed(a);
        assert_eq!(inner.in_use_count, 0);
        assert_eq!(inner.completed_count, 1);
        assert!(matches!(inner.pool_state(), PoolState::Completed));

        inner.begin_recording(b);
        assert_eq!(inner.in_use_count, 1);
    }

    #[test]
    fn reset_rejects_while_in_flight() {
        let mut inner = Inner::new();
        let a = inner.reserve_slot(fake_handle(1));
        inner.begin_recording(a);
        assert!(matches!(inner.reset_counters(), Err(Error::ObjectInUse)));
        // State is untouched by the rejected reset.
        assert_eq!(inner.buffers[0].state, CommandBufferState::Recording);
    }

    #[test]
    fn reset_restores_ready_and_zeroes_counters() {
        let mut inner = Inner::new();
        let a = inner.reserve_slot(fake_handle(1));
        let b = inner.reserve_slot(fake_handle(2));
        inner.begin_recording(a);
        inner.mark_submitted(a);
        inner.mark_completed(a);
        inner.begin_recording(b);
        inner.mark_submitted(b);
        inner.mark_completed(b);

        assert!(inner.reset_counters().is_ok());
        assert_eq!(inner.created_count, 0);
        assert_eq!(inner.in_use_count, 0);
        assert_eq!(inner.completed_count, 0);
        assert!(inner.buffers.iter().all(|s| s.state == CommandBufferState::Ready));
    }

    #[test]
    fn reuses_existing_slot_before_growing_vector() {
        let mut inner = Inner::new();
        let a = inner.reserve_slot(fake_handle(1));
        inner.begin_recording(a);
        inner.mark_submitted(a);
        inner.mark_completed(a);
        inner.reset_counters().unwrap();

        // Vector already has one slot; reserving again must reuse index 0,
        // not allocate a fresh raw command buffer.
        assert_eq!(inner.buffers.len(), 1);
        let reused = inner.reserve_slot(fake_handle(999));
        assert_eq!(reused, CommandBufferHandle(0));
        assert_eq!(inner.buffers.len(), 1);
        assert_eq!(inner.buffers[0].raw, fake_handle(1));
    }

    #[test]
    fn staging_free_list_returns_smallest_fit() {
        let sizes = [4096u64, 16384, 8192];
        let index = smallest_fit_index(&sizes, 5000, |s| *s).unwrap();
        assert_eq!(sizes[index], 8192);
    }

    #[test]
    fn staging_free_list_is_empty_when_nothing_fits() {
        let sizes = [1024u64, 2048];
        assert!(smallest_fit_index(&sizes, 4096, |s| *s).is_none());
    }
}

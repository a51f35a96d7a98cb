//! Device memory management (§4.1): suballocation of `VkDeviceMemory` blocks
//! into caller-sized [`MemoryAllocation`]s, grouped into chunks per
//! `(memory type, linearity)` bucket.

mod allocation;
mod chunk;
mod tlsf;

pub use allocation::MemoryAllocation;
pub use chunk::MemoryChunk;

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::types::{MemoryFlags, MemoryUsage};

const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024 * 1024;
const MAX_CHUNK_SIZE: u64 = 256 * 1024 * 1024;
/// Allocations at or above this size bypass the suballocator entirely and get
/// their own dedicated chunk (§4.1a), regardless of a bucket's current,
/// possibly-grown chunk size — oversizedness is judged against the baseline,
/// not a moving target.
const DEDICATED_THRESHOLD: u64 = DEFAULT_CHUNK_SIZE / 2;

#[derive(Hash, PartialEq, Eq, Clone, Copy)]
struct BucketKey {
    memory_type_index: u32,
    is_linear: bool,
}

struct MemoryTypeBucket {
    chunks: Vec<Arc<MemoryChunk>>,
    next_chunk_size: u64,
}

impl MemoryTypeBucket {
    fn new() -> Self {
        Self {
            chunks: Vec::new(),
            next_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Owns every chunk the device has allocated, keyed by `(memory type,
/// linearity)` (§3 `MemoryManager`). One instance per `Device`, behind
/// `memoryManagerLock` (§5).
pub struct MemoryManager {
    device: ash::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    buckets: Mutex<FxHashMap<BucketKey, MemoryTypeBucket>>,
}

impl MemoryManager {
    pub fn new(device: ash::Device, memory_properties: vk::PhysicalDeviceMemoryProperties) -> Self {
        Self {
            device,
            memory_properties,
            buckets: Mutex::new(FxHashMap::default()),
        }
    }

    /// Suballocate (or dedicate-allocate) memory satisfying `requirements`.
    pub fn allocate(
        &self,
        requirements: vk::MemoryRequirements,
        is_linear: bool,
        usage: MemoryUsage,
        flags: MemoryFlags,
    ) -> Result<MemoryAllocation> {
        profiling::scope!("MemoryManager::allocate");

        let memory_type_index = self.select_memory_type(requirements.memory_type_bits, usage, flags)?;
        let host_visible = self.is_host_visible(memory_type_index);

        if flags.contains(MemoryFlags::DEDICATED) || requirements.size >= DEDICATED_THRESHOLD {
            return self.allocate_dedicated(
                memory_type_index,
                is_linear,
                host_visible,
                requirements,
                flags,
            );
        }

        let key = BucketKey {
            memory_type_index,
            is_linear,
        };
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key).or_insert_with(MemoryTypeBucket::new);

        for chunk in &bucket.chunks {
            if flags.contains(MemoryFlags::MAPPED) && host_visible {
                chunk.make_persistent_mapped(&self.device)?;
            }
            if let Some(chunk_alloc) =
                chunk.suballoc(requirements.size, requirements.alignment)
            {
                return Ok(Self::finish(chunk.clone(), chunk_alloc, requirements, false));
            }
        }

        let chunk_size = bucket
            .next_chunk_size
            .max(requirements.size.next_power_of_two())
            .min(MAX_CHUNK_SIZE);
        let raw = chunk::alloc_device_memory(&self.device, memory_type_index, chunk_size)?;
        let chunk = unsafe {
            MemoryChunk::new(raw, memory_type_index, chunk_size, is_linear, host_visible)
        };
        if flags.contains(MemoryFlags::MAPPED) && host_visible {
            chunk.make_persistent_mapped(&self.device)?;
        }
        let chunk = Arc::new(chunk);

        let chunk_alloc = chunk
            .suballoc(requirements.size, requirements.alignment)
            .ok_or(Error::AllocationTooLargeForAnyChunk {
                requested: requirements.size,
                max_chunk: chunk_size,
            })?;

        bucket.chunks.push(chunk.clone());
        bucket.next_chunk_size = (bucket.next_chunk_size * 2).min(MAX_CHUNK_SIZE);

        Ok(Self::finish(chunk, chunk_alloc, requirements, false))
    }

    pub fn allocate_for_buffer(
        &self,
        buffer: vk::Buffer,
        usage: MemoryUsage,
        flags: MemoryFlags,
    ) -> Result<MemoryAllocation> {
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        self.allocate(requirements, true, usage, flags)
    }

    pub fn allocate_for_image(
        &self,
        image: vk::Image,
        is_linear: bool,
        usage: MemoryUsage,
        flags: MemoryFlags,
    ) -> Result<MemoryAllocation> {
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        self.allocate(requirements, is_linear, usage, flags)
    }

    pub fn free(&self, mut allocation: MemoryAllocation) {
        profiling::scope!("MemoryManager::free");

        if allocation.is_dedicated() {
            let chunk = allocation.chunk().clone();
            chunk.subfree(allocation.take_chunk_alloc());
            unsafe { chunk.destroy(&self.device) };
            return;
        }

        let key = BucketKey {
            memory_type_index: allocation.memory_type_index(),
            is_linear: allocation.chunk().is_linear(),
        };
        let chunk = allocation.chunk().clone();
        chunk.subfree(allocation.take_chunk_alloc());

        if !chunk.is_empty() {
            return;
        }

        let mut buckets = self.buckets.lock();
        if let Some(bucket) = buckets.get_mut(&key) {
            if bucket.chunks.len() > 1 {
                if let Some(pos) = bucket.chunks.iter().position(|c| Arc::ptr_eq(c, &chunk)) {
                    let removed = bucket.chunks.remove(pos);
                    drop(buckets);
                    unsafe { removed.destroy(&self.device) };
                }
            }
        }
    }

    fn allocate_dedicated(
        &self,
        memory_type_index: u32,
        is_linear: bool,
        host_visible: bool,
        requirements: vk::MemoryRequirements,
        flags: MemoryFlags,
    ) -> Result<MemoryAllocation> {
        let raw = chunk::alloc_device_memory(&self.device, memory_type_index, requirements.size)?;
        let chunk = unsafe {
            MemoryChunk::new(
                raw,
                memory_type_index,
                requirements.size,
                is_linear,
                host_visible,
            )
        };
        if flags.contains(MemoryFlags::MAPPED) && host_visible {
            chunk.make_persistent_mapped(&self.device)?;
        }
        let chunk = Arc::new(chunk);
        let chunk_alloc = chunk
            .suballoc(requirements.size, requirements.alignment)
            .expect("a fresh chunk sized exactly to the request must satisfy it");
        Ok(Self::finish(chunk, chunk_alloc, requirements, true))
    }

    fn finish(
        chunk: Arc<MemoryChunk>,
        chunk_alloc: chunk::ChunkAllocation,
        requirements: vk::MemoryRequirements,
        is_dedicated: bool,
    ) -> MemoryAllocation {
        MemoryAllocation {
            offset: chunk_alloc.tlsf.offset,
            size: chunk_alloc.tlsf.size,
            alignment: requirements.alignment,
            chunk,
            chunk_alloc: Some(chunk_alloc),
            is_dedicated,
        }
    }

    fn is_host_visible(&self, memory_type_index: u32) -> bool {
        self.memory_properties.memory_types[memory_type_index as usize]
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    /// Score every memory type whose bit is set in `type_bits` against
    /// `usage`'s required/preferred `VkMemoryPropertyFlags` split (§4.1) and
    /// return the index of the best match.
    fn select_memory_type(
        &self,
        type_bits: u32,
        usage: MemoryUsage,
        flags: MemoryFlags,
    ) -> Result<u32> {
        let (required, preferred) = required_and_preferred_flags(usage, flags);
        let candidates = (0..self.memory_properties.memory_type_count)
            .filter(|i| type_bits & (1 << i) != 0)
            .map(|i| (i, self.memory_properties.memory_types[i as usize].property_flags));
        best_memory_type(candidates, required, preferred).ok_or(Error::OutOfMemoryTypes)
    }
}

/// The required/preferred `VkMemoryPropertyFlags` split for a (usage, flags)
/// pair (§4.1), pulled out of `select_memory_type` so the rule is testable
/// without a real `VkPhysicalDeviceMemoryProperties`.
fn required_and_preferred_flags(
    usage: MemoryUsage,
    flags: MemoryFlags,
) -> (vk::MemoryPropertyFlags, vk::MemoryPropertyFlags) {
    let (mut required, preferred) = match usage {
        MemoryUsage::PreferDevice => (
            vk::MemoryPropertyFlags::empty(),
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ),
        MemoryUsage::PreferHost => {
            let mut preferred = vk::MemoryPropertyFlags::empty();
            if flags.contains(MemoryFlags::MAPPEABLE_FOR_RANDOM_ACCESS) {
                preferred |= vk::MemoryPropertyFlags::HOST_CACHED;
            }
            (
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                preferred,
            )
        }
    };
    // `Mapped` or any `Mappeable*` flag requires a host-visible type even when
    // the caller asked for `PreferDevice` (§4.1); otherwise a later
    // `make_persistent_mapped` on a non-host-visible chunk is silently
    // skipped and the allocation ends up with no mapped pointer.
    if flags.intersects(
        MemoryFlags::MAPPED
            | MemoryFlags::MAPPEABLE_FOR_SEQUENTIAL_WRITE
            | MemoryFlags::MAPPEABLE_FOR_RANDOM_ACCESS,
    ) {
        required |= vk::MemoryPropertyFlags::HOST_VISIBLE;
    }
    (required, preferred)
}

/// Picks the best-scoring memory type index among `candidates` given a
/// `(required, preferred)` flag split: `+preferred` bits matched, `-`
/// non-preferred-and-non-required bits present (§4.1).
fn best_memory_type(
    candidates: impl Iterator<Item = (u32, vk::MemoryPropertyFlags)>,
    required: vk::MemoryPropertyFlags,
    preferred: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let mut best: Option<(u32, i32)> = None;
    for (index, type_flags) in candidates {
        if !type_flags.contains(required) {
            continue;
        }
        let matched = (type_flags & preferred).as_raw().count_ones() as i32;
        let extra = (type_flags & !preferred & !required).as_raw().count_ones() as i32;
        let score = matched - extra;
        if best.map_or(true, |(_, best_score)| score > best_score) {
            best = Some((index, score));
        }
    }
    best.map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefer_device_with_mapped_still_requires_host_visible() {
        let (required, _) = required_and_preferred_flags(MemoryUsage::PreferDevice, MemoryFlags::MAPPED);
        assert!(required.contains(vk::MemoryPropertyFlags::HOST_VISIBLE));
    }

    #[test]
    fn prefer_device_without_mapping_has_no_required_bits() {
        let (required, preferred) =
            required_and_preferred_flags(MemoryUsage::PreferDevice, MemoryFlags::empty());
        assert!(required.is_empty());
        assert_eq!(preferred, vk::MemoryPropertyFlags::DEVICE_LOCAL);
    }

    #[test]
    fn sequential_write_host_allocation_avoids_host_cached() {
        let (required, preferred) = required_and_preferred_flags(
            MemoryUsage::PreferHost,
            MemoryFlags::MAPPEABLE_FOR_SEQUENTIAL_WRITE,
        );
        assert!(preferred.is_empty());

        let host_coherent = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let host_cached = host_coherent | vk::MemoryPropertyFlags::HOST_CACHED;
        let candidates = vec![(0u32, host_cached), (1u32, host_coherent)];

        let chosen = best_memory_type(candidates.into_iter(), required, preferred).unwrap();
        assert_eq!(chosen, 1, "non-cached type should win when random access isn't requested");
    }

    #[test]
    fn random_access_host_allocation_prefers_host_cached() {
        let (required, preferred) = required_and_preferred_flags(
            MemoryUsage::PreferHost,
            MemoryFlags::MAPPEABLE_FOR_RANDOM_ACCESS,
        );
        assert_eq!(preferred, vk::MemoryPropertyFlags::HOST_CACHED);

        let host_coherent = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let host_cached = host_coherent | vk::MemoryPropertyFlags::HOST_CACHED;
        let candidates = vec![(0u32, host_coherent), (1u32, host_cached)];

        let chosen = best_memory_type(candidates.into_iter(), required, preferred).unwrap();
        assert_eq!(chosen, 1, "cached type should win when random access is requested");
    }

    #[test]
    fn non_host_visible_type_rejected_when_mapped_is_requested() {
        let (required, preferred) =
            required_and_preferred_flags(MemoryUsage::PreferDevice, MemoryFlags::MAPPED);
        let device_local_only = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        let device_local_and_visible =
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE;
        let candidates = vec![(0u32, device_local_only), (1u32, device_local_and_visible)];

        let chosen = best_memory_type(candidates.into_iter(), required, preferred).unwrap();
        assert_eq!(chosen, 1);
    }
}

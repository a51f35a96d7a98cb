//! Descriptor pool management (§4.2): a list of fixed-capacity pools grown
//! transparently as demand exceeds the most recent pool's remaining space.

use ash::vk;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::types::DescriptorCounts;

/// Per-pool capacity for each of the seven descriptor kinds (§4.2 "e.g. 1000
/// of each").
const POOL_CAPACITY_PER_KIND: u32 = 1000;
const POOL_CAPACITY_SETS: u32 = 1000;

struct DescriptorPool {
    raw: vk::DescriptorPool,
    remaining: DescriptorCounts,
    remaining_sets: u32,
}

/// A live descriptor-set allocation. Must be returned to the
/// [`DescriptorPoolManager`] that produced it via `free` exactly once.
pub struct DescriptorAllocationToken {
    pool_index: usize,
    pub set: vk::DescriptorSet,
    counts: DescriptorCounts,
}

/// Maintains the list of descriptor pools for a device (§3, §4.2). One
/// instance per `Device`, serialized by a single mutex (`descriptorPoolLock`,
/// §5).
pub struct DescriptorPoolManager {
    device: ash::Device,
    pool_capacity: DescriptorCounts,
    pools: Mutex<Vec<DescriptorPool>>,
}

fn pool_capacity() -> DescriptorCounts {
    DescriptorCounts {
        uniform_buffers: POOL_CAPACITY_PER_KIND,
        dynamic_uniform_buffers: POOL_CAPACITY_PER_KIND,
        sampled_images: POOL_CAPACITY_PER_KIND,
        samplers: POOL_CAPACITY_PER_KIND,
        storage_buffers: POOL_CAPACITY_PER_KIND,
        dynamic_storage_buffers: POOL_CAPACITY_PER_KIND,
        storage_images: POOL_CAPACITY_PER_KIND,
    }
}

fn pool_sizes(capacity: &DescriptorCounts) -> arrayvec::ArrayVec<vk::DescriptorPoolSize, { DescriptorCounts::KIND_COUNT }> {
    let mut sizes = arrayvec::ArrayVec::new();
    let kinds = [
        (vk::DescriptorType::UNIFORM_BUFFER, capacity.uniform_buffers),
        (
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            capacity.dynamic_uniform_buffers,
        ),
        (
            vk::DescriptorType::SAMPLED_IMAGE,
            capacity.sampled_images,
        ),
        (vk::DescriptorType::SAMPLER, capacity.samplers),
        (
            vk::DescriptorType::STORAGE_BUFFER,
            capacity.storage_buffers,
        ),
        (
            vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
            capacity.dynamic_storage_buffers,
        ),
        (
            vk::DescriptorType::STORAGE_IMAGE,
            capacity.storage_images,
        ),
    ];
    for (ty, count) in kinds {
        if count > 0 {
            sizes.push(vk::DescriptorPoolSize {
                ty,
                descriptor_count: count,
            });
        }
    }
    sizes
}

impl DescriptorPoolManager {
    pub fn new(device: ash::Device) -> Self {
        Self {
            device,
            pool_capacity: pool_capacity(),
            pools: Mutex::new(Vec::new()),
        }
    }

    pub fn allocate(
        &self,
        counts: DescriptorCounts,
        set_layout: vk::DescriptorSetLayout,
    ) -> Result<DescriptorAllocationToken> {
        profiling::scope!("DescriptorPoolManager::allocate");
        let mut pools = self.pools.lock();

        if pools.is_empty() {
            let raw = self.create_pool()?;
            pools.push(DescriptorPool {
                raw,
                remaining: self.pool_capacity,
                remaining_sets: POOL_CAPACITY_SETS,
            });
        }

        let last = pools.len() - 1;
        if pools[last].remaining.covers(&counts) && pools[last].remaining_sets >= 1 {
            match self.try_allocate_from(pools[last].raw, set_layout) {
                Ok(set) => {
                    pools[last].remaining = pools[last].remaining.saturating_sub(&counts);
                    pools[last].remaining_sets -= 1;
                    return Ok(DescriptorAllocationToken {
                        pool_index: last,
                        set,
                        counts,
                    });
                }
                Err(Error::GraphicsError { code, .. })
                    if code == vk::Result::ERROR_FRAGMENTED_POOL
                        || code == vk::Result::ERROR_OUT_OF_POOL_MEMORY =>
                {
                    log::debug!("descriptor pool fragmented, growing pool list");
                }
                Err(other) => return Err(other),
            }
        }

        let raw = self.create_pool()?;
        let index = pools.len();
        pools.push(DescriptorPool {
            raw,
            remaining: self.pool_capacity,
            remaining_sets: POOL_CAPACITY_SETS,
        });
        let set = self.try_allocate_from(pools[index].raw, set_layout)?;
        pools[index].remaining = pools[index].remaining.saturating_sub(&counts);
        pools[index].remaining_sets -= 1;
        Ok(DescriptorAllocationToken {
            pool_index: index,
            set,
            counts,
        })
    }

    pub fn free(&self, token: DescriptorAllocationToken) -> Result<()> {
        let mut pools = self.pools.lock();
        let pool = &mut pools[token.pool_index];
        unsafe { self.device.free_descriptor_sets(pool.raw, &[token.set]) }?;
        pool.remaining = pool.remaining.add(&token.counts);
        pool.remaining_sets += 1;
        Ok(())
    }

    fn try_allocate_from(
        &self,
        pool: vk::DescriptorPool,
        set_layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        let layouts = [set_layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&info) }.map_err(Error::from)?;
        Ok(sets[0])
    }

    fn create_pool(&self) -> Result<vk::DescriptorPool> {
        let sizes = pool_sizes(&self.pool_capacity);
        let info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(POOL_CAPACITY_SETS)
            .pool_sizes(&sizes);
        unsafe { self.device.create_descriptor_pool(&info, None) }.map_err(Error::from)
    }

    /// # Safety
    /// Caller must have already freed every outstanding descriptor set.
    pub unsafe fn destroy(&self) {
        let mut pools = self.pools.lock();
        for pool in pools.drain(..) {
            self.device.destroy_descriptor_pool(pool.raw, None);
        }
    }
}

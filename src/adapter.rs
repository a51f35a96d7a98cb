//! Physical-device enumeration is out of scope (§1); this is the minimal
//! handle [`crate::device::Device::create`] needs from whatever instance
//! layer an embedder supplies.

use ash::vk;

/// Everything about a chosen physical device that `Device::create` needs.
/// Instance/adapter enumeration itself lives in an external collaborator.
pub struct Adapter {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// The chosen main (graphics + compute + transfer) queue family.
    pub queue_family_index: u32,
    pub queue_family_count: u32,
}

//! Swapchain lifecycle (§4.4): creation, recreation, image acquisition and
//! presentation under the lock discipline shared with the main queue (§5).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ash::extensions::khr;
use ash::vk;
use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::surface_source::SurfaceSource;

// ---- pure selection logic (§4.4), independent of any live device ----------

/// Surface format selection (§4.4 "Surface format").
pub fn select_surface_format(
    available: &[vk::SurfaceFormatKHR],
    color_srgb: bool,
) -> Result<vk::SurfaceFormatKHR> {
    if available.len() == 1 && available[0].format == vk::Format::UNDEFINED {
        let format = if color_srgb {
            vk::Format::B8G8R8A8_SRGB
        } else {
            vk::Format::B8G8R8A8_UNORM
        };
        return Ok(vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        });
    }

    let desired = if color_srgb {
        vk::Format::B8G8R8A8_SRGB
    } else {
        vk::Format::B8G8R8A8_UNORM
    };
    if let Some(found) = available.iter().find(|f| {
        f.format == desired && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
    }) {
        return Ok(*found);
    }

    if color_srgb {
        return Err(Error::SwapchainFormatUnsupported);
    }
    available
        .first()
        .copied()
        .ok_or(Error::SwapchainFormatUnsupported)
}

/// Present-mode selection (§4.4 "Present mode").
pub fn select_present_mode(
    available: &[vk::PresentModeKHR],
    sync_to_vblank: bool,
) -> vk::PresentModeKHR {
    let has = |mode| available.contains(&mode);
    if sync_to_vblank {
        if has(vk::PresentModeKHR::FIFO_RELAXED) {
            vk::PresentModeKHR::FIFO_RELAXED
        } else {
            vk::PresentModeKHR::FIFO
        }
    } else if has(vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else if has(vk::PresentModeKHR::IMMEDIATE) {
        vk::PresentModeKHR::IMMEDIATE
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Image-count formula (§4.4 "Image count").
pub fn select_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let desired = capabilities.min_image_count + 1;
    if capabilities.max_image_count == 0 {
        desired
    } else {
        desired.min(capabilities.max_image_count)
    }
}

/// Clamp a requested extent to the surface's allowed range (§4.4
/// "Recreation"). Returns `None` if the surface is minimized (both the min
/// and max extents are zero).
pub fn clamp_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    requested: vk::Extent2D,
) -> Option<vk::Extent2D> {
    if capabilities.min_image_extent.width == 0
        && capabilities.min_image_extent.height == 0
        && capabilities.max_image_extent.width == 0
        && capabilities.max_image_extent.height == 0
    {
        return None;
    }
    if capabilities.current_extent.width != u32::MAX {
        return Some(capabilities.current_extent);
    }
    let clamp = |v: u32, lo: u32, hi: u32| v.clamp(lo, hi);
    Some(vk::Extent2D {
        width: clamp(
            requested.width,
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: clamp(
            requested.height,
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    })
}

/// Sharing mode between the main queue and the present queue (§4.4
/// "Sharing").
pub fn select_sharing(main_queue_family: u32, present_queue_family: u32) -> SharingPlan {
    if main_queue_family == present_queue_family {
        SharingPlan::Exclusive
    } else {
        SharingPlan::Concurrent([main_queue_family, present_queue_family])
    }
}

pub enum SharingPlan {
    Exclusive,
    Concurrent([u32; 2]),
}

/// Present-queue selection (§4.4 "Present-queue selection"). `supports_present`
/// is injected so this stays a pure function testable without a live surface.
pub fn select_present_queue_family(
    main_queue_family: u32,
    queue_family_count: u32,
    supports_present: impl Fn(u32) -> bool,
) -> Result<u32> {
    if supports_present(main_queue_family) {
        return Ok(main_queue_family);
    }
    (0..queue_family_count)
        .find(|&family| supports_present(family))
        .ok_or(Error::NoPresentQueue)
}

// ---- configuration and live state ------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct SwapchainDescriptor {
    pub width: u32,
    pub height: u32,
    pub depth_format: Option<vk::Format>,
    pub sync_to_vblank: bool,
    pub color_srgb: bool,
}

/// Per-image state rebuilt on every (re)creation (§3 `SwapchainFramebuffer`).
/// Render-pass/framebuffer construction is left to the caller (out of scope
/// per §1's "pipeline creation info translation... format enumeration
/// tables"); this crate hands back the raw color image and view per index.
pub struct SwapchainImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
}

struct State {
    raw: vk::SwapchainKHR,
    extent: vk::Extent2D,
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    images: Vec<SwapchainImage>,
    /// Signaled once acquisition completes and waited on immediately so the
    /// next frame's image index is always ready (§4.4 "Present").
    acquire_fence: vk::Fence,
    current_image_index: u32,
    minimized: bool,
}

/// Creates, recreates, acquires from, and presents to one `VkSwapchainKHR`
/// (§3, §4.4). Presentation serializes on `graphicsQueueLock` when the
/// present queue shares the main queue family, else on a local lock (§5).
pub struct Swapchain {
    device: ash::Device,
    swapchain_fn: khr::Swapchain,
    surface_fn: khr::Surface,
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    main_queue_family: u32,
    present_queue_family: u32,
    present_queue: vk::Queue,
    /// Shared with the device's main-queue submission lock when
    /// `present_queue_family == main_queue_family`.
    present_lock: Arc<Mutex<()>>,
    desc: RwLock<SwapchainDescriptor>,
    state: RwLock<State>,
    pending_vsync_change: AtomicBool,
}

impl Swapchain {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        device: ash::Device,
        swapchain_fn: khr::Swapchain,
        surface_fn: khr::Surface,
        physical_device: vk::PhysicalDevice,
        surface_source: &SurfaceSource,
        entry: &ash::Entry,
        instance: &ash::Instance,
        main_queue_family: u32,
        main_queue: vk::Queue,
        present_queue_lock: Arc<Mutex<()>>,
        queue_family_count: u32,
        descriptor: SwapchainDescriptor,
    ) -> Result<Self> {
        let surface = unsafe { surface_source.create_surface(entry, instance) }?;

        let present_queue_family = select_present_queue_family(
            main_queue_family,
            queue_family_count,
            |family| unsafe {
                surface_fn
                    .get_physical_device_surface_support(physical_device, family, surface)
                    .unwrap_or(false)
            },
        )?;

        let present_queue = if present_queue_family == main_queue_family {
            main_queue
        } else {
            unsafe { device.get_device_queue(present_queue_family, 0) }
        };

        let present_lock = if present_queue_family == main_queue_family {
            present_queue_lock
        } else {
            Arc::new(Mutex::new(()))
        };

        let mut swapchain = Self {
            device,
            swapchain_fn,
            surface_fn,
            physical_device,
            surface,
            main_queue_family,
            present_queue_family,
            present_queue,
            present_lock,
            desc: RwLock::new(descriptor),
            state: RwLock::new(State {
                raw: vk::SwapchainKHR::null(),
                extent: vk::Extent2D {
                    width: 0,
                    height: 0,
                },
                format: vk::SurfaceFormatKHR::default(),
                present_mode: vk::PresentModeKHR::FIFO,
                images: Vec::new(),
                acquire_fence: vk::Fence::null(),
                current_image_index: 0,
                minimized: false,
            }),
            pending_vsync_change: AtomicBool::new(false),
        };

        swapchain.recreate()?;
        Ok(swapchain)
    }

    pub fn resize(&self, width: u32, height: u32) -> Result<()> {
        {
            let mut desc = self.desc.write();
            desc.width = width;
            desc.height = height;
        }
        self.recreate()
    }

    pub fn set_sync_to_vblank(&self, sync_to_vblank: bool) {
        let changed = {
            let mut desc = self.desc.write();
            let changed = desc.sync_to_vblank != sync_to_vblank;
            desc.sync_to_vblank = sync_to_vblank;
            changed
        };
        if changed {
            self.pending_vsync_change.store(true, Ordering::Release);
        }
    }

    /// (Re)creates the swapchain against the current descriptor (§4.4
    /// "Recreation"). Waits for the device to go idle, queries capabilities,
    /// and returns early (leaving no swapchain) if the surface is minimized.
    fn recreate(&self) -> Result<()> {
        profiling::scope!("Swapchain::recreate");
        unsafe {
            profiling::scope!("vkDeviceWaitIdle");
            let _ = self.device.device_wait_idle();
        }

        let capabilities = unsafe {
            self.surface_fn
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
        }?;
        let formats = unsafe {
            self.surface_fn
                .get_physical_device_surface_formats(self.physical_device, self.surface)
        }?;
        let present_modes = unsafe {
            self.surface_fn
                .get_physical_device_surface_present_modes(self.physical_device, self.surface)
        }?;

        let desc = *self.desc.read();
        let requested_extent = vk::Extent2D {
            width: desc.width,
            height: desc.height,
        };

        let mut state = self.state.write();
        self.destroy_images(&mut state);

        let extent = match clamp_extent(&capabilities, requested_extent) {
            Some(extent) => extent,
            None => {
                state.minimized = true;
                self.destroy_swapchain_raw(&mut state);
                return Ok(());
            }
        };

        let format = select_surface_format(&formats, desc.color_srgb)?;
        let present_mode = select_present_mode(&present_modes, desc.sync_to_vblank);
        let image_count = select_image_count(&capabilities);
        let sharing = select_sharing(self.main_queue_family, self.present_queue_family);

        let mut info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(state.raw);

        let family_indices;
        info = match sharing {
            SharingPlan::Exclusive => info.image_sharing_mode(vk::SharingMode::EXCLUSIVE),
            SharingPlan::Concurrent(families) => {
                family_indices = families;
                info.image_sharing_mode(vk::SharingMode::CONCURRENT)
                    .queue_family_indices(&family_indices)
            }
        };

        let old_raw = state.raw;
        let raw = unsafe { self.swapchain_fn.create_swapchain(&info, None) }?;
        if old_raw != vk::SwapchainKHR::null() {
            unsafe { self.swapchain_fn.destroy_swapchain(old_raw, None) };
        }

        let raw_images = unsafe { self.swapchain_fn.get_swapchain_images(raw) }?;
        let images = raw_images
            .into_iter()
            .map(|image| {
                let view_info = vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(format.format)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });
                let view = unsafe { self.device.create_image_view(&view_info, None) }?;
                Ok(SwapchainImage { image, view })
            })
            .collect::<Result<Vec<_>>>()?;

        let acquire_fence = if state.acquire_fence == vk::Fence::null() {
            let fence_info = vk::FenceCreateInfo::builder();
            unsafe { self.device.create_fence(&fence_info, None) }?
        } else {
            state.acquire_fence
        };

        state.raw = raw;
        state.extent = extent;
        state.format = format;
        state.present_mode = present_mode;
        state.images = images;
        state.acquire_fence = acquire_fence;
        state.current_image_index = 0;
        state.minimized = false;

        Ok(())
    }

    fn destroy_images(&self, state: &mut State) {
        for image in state.images.drain(..) {
            unsafe { self.device.destroy_image_view(image.view, None) };
        }
    }

    fn destroy_swapchain_raw(&self, state: &mut State) {
        if state.raw != vk::SwapchainKHR::null() {
            unsafe { self.swapchain_fn.destroy_swapchain(state.raw, None) };
            state.raw = vk::SwapchainKHR::null();
        }
    }

    /// Acquires the next image (§4.4 "Acquire"). Returns `false` when
    /// recreation was triggered (minimized, out-of-date, or a pending vsync
    /// change) and no image is ready this call.
    pub fn acquire_next_image(
        &self,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<bool> {
        if self.pending_vsync_change.swap(false, Ordering::AcqRel) {
            self.recreate()?;
            return Ok(false);
        }

        let raw = {
            let state = self.state.read();
            if state.minimized {
                return Ok(false);
            }
            state.raw
        };

        let result = unsafe {
            self.swapchain_fn
                .acquire_next_image(raw, u64::MAX, semaphore, fence)
        };

        match result {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    self.recreate()?;
                    return Ok(false);
                }
                self.state.write().current_image_index = index;
                Ok(true)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.recreate()?;
                Ok(false)
            }
            Err(vk::Result::ERROR_SURFACE_LOST_KHR) => Err(Error::SurfaceLost),
            Err(_) => Err(Error::SwapchainAcquireFailed),
        }
    }

    /// Presents the current image and immediately re-primes the next one
    /// via the internal acquire fence (§4.4 "Present").
    pub fn swap_buffers(&self) -> Result<()> {
        profiling::scope!("Swapchain::swap_buffers");
        let (raw, index) = {
            let state = self.state.read();
            if state.minimized {
                return Ok(());
            }
            (state.raw, state.current_image_index)
        };

        {
            let _guard = self.present_lock.lock();
            let swapchains = [raw];
            let indices = [index];
            let info = vk::PresentInfoKHR::builder()
                .swapchains(&swapchains)
                .image_indices(&indices);
            let result = unsafe { self.swapchain_fn.queue_present(self.present_queue, &info) };
            match result {
                Ok(suboptimal) => {
                    if suboptimal {
                        self.recreate()?;
                        return Ok(());
                    }
                }
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    self.recreate()?;
                    return Ok(());
                }
                Err(vk::Result::ERROR_SURFACE_LOST_KHR) => return Err(Error::SurfaceLost),
                Err(_) => return Err(Error::SwapchainAcquireFailed),
            }
        }

        let fence = self.state.read().acquire_fence;
        if self.acquire_next_image(vk::Semaphore::null(), fence)? {
            unsafe {
                profiling::scope!("vkWaitForFences");
                self.device.wait_for_fences(&[fence], true, u64::MAX)?;
                self.device.reset_fences(&[fence])?;
            }
        }
        Ok(())
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.state.read().extent
    }

    pub fn format(&self) -> vk::Format {
        self.state.read().format.format
    }

    pub fn image_count(&self) -> usize {
        self.state.read().images.len()
    }

    /// # Safety
    /// The device must already be idle; no presentation work may be in
    /// flight against this swapchain.
    pub unsafe fn destroy(self) {
        let _ = self.device.device_wait_idle();
        let mut state = self.state.write();
        self.destroy_images(&mut state);
        self.destroy_swapchain_raw(&mut state);
        if state.acquire_fence != vk::Fence::null() {
            self.device.destroy_fence(state.acquire_fence, None);
        }
        drop(state);
        self.surface_fn.destroy_surface(self.surface, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            ..Default::default()
        }
    }

    #[test]
    fn undefined_format_falls_back_to_bgra8() {
        let available = [vk::SurfaceFormatKHR {
            format: vk::Format::UNDEFINED,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];
        let srgb = select_surface_format(&available, true).unwrap();
        assert_eq!(srgb.format, vk::Format::B8G8R8A8_SRGB);
        let unorm = select_surface_format(&available, false).unwrap();
        assert_eq!(unorm.format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn srgb_requested_but_unavailable_fails() {
        let available = [vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];
        assert!(matches!(
            select_surface_format(&available, true),
            Err(Error::SwapchainFormatUnsupported)
        ));
    }

    #[test]
    fn present_mode_prefers_fifo_relaxed_when_syncing() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::FIFO_RELAXED];
        assert_eq!(select_present_mode(&modes, true), vk::PresentModeKHR::FIFO_RELAXED);
    }

    #[test]
    fn present_mode_falls_back_to_fifo_when_syncing_and_no_relaxed() {
        let modes = [vk::PresentModeKHR::FIFO];
        assert_eq!(select_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn present_mode_prefers_mailbox_then_immediate_when_not_syncing() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(select_present_mode(&modes, false), vk::PresentModeKHR::MAILBOX);

        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(select_present_mode(&modes, false), vk::PresentModeKHR::IMMEDIATE);

        let modes = [vk::PresentModeKHR::FIFO];
        assert_eq!(select_present_mode(&modes, false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn image_count_respects_max() {
        assert_eq!(select_image_count(&caps(2, 3)), 3);
        assert_eq!(select_image_count(&caps(2, 0)), 3);
        assert_eq!(select_image_count(&caps(1, 2)), 2);
    }

    #[test]
    fn minimized_surface_clamp_returns_none() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_extent: vk::Extent2D { width: 0, height: 0 },
            max_image_extent: vk::Extent2D { width: 0, height: 0 },
            current_extent: vk::Extent2D { width: 0, height: 0 },
            ..Default::default()
        };
        assert!(clamp_extent(&capabilities, vk::Extent2D { width: 800, height: 600 }).is_none());
    }

    #[test]
    fn extent_clamps_to_surface_bounds() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 100,
                height: 100,
            },
            max_image_extent: vk::Extent2D {
                width: 1000,
                height: 1000,
            },
            ..Default::default()
        };
        let clamped = clamp_extent(&capabilities, vk::Extent2D { width: 50, height: 2000 }).unwrap();
        assert_eq!(clamped.width, 100);
        assert_eq!(clamped.height, 1000);
    }

    #[test]
    fn present_queue_prefers_main_family() {
        let family = select_present_queue_family(0, 3, |_| true).unwrap();
        assert_eq!(family, 0);
    }

    #[test]
    fn present_queue_scans_when_main_unsupported() {
        let family = select_present_queue_family(0, 3, |f| f == 2).unwrap();
        assert_eq!(family, 2);
    }

    #[test]
    fn present_queue_fails_when_none_supports() {
        assert!(matches!(
            select_present_queue_family(0, 3, |_| false),
            Err(Error::NoPresentQueue)
        ));
    }

    #[test]
    fn sharing_is_exclusive_when_families_match() {
        assert!(matches!(select_sharing(0, 0), SharingPlan::Exclusive));
    }

    #[test]
    fn sharing_is_concurrent_when_families_differ() {
        assert!(matches!(select_sharing(0, 1), SharingPlan::Concurrent([0, 1])));
    }
}

//! Opaque platform surface sources (§6): window-system integration details
//! end at this boundary, selecting the right `VK_KHR_*_surface` extension.

use ash::extensions::khr;
use ash::vk;

use crate::error::{Error, Result};

/// A tagged union of the platform handles needed to create a `VkSurfaceKHR`.
/// Window creation itself is out of scope (§1); callers provide the raw
/// handles from whatever windowing toolkit they used.
pub enum SurfaceSource {
    Win32 {
        hinstance: *mut std::ffi::c_void,
        hwnd: *mut std::ffi::c_void,
    },
    Xlib {
        display: *mut std::ffi::c_void,
        window: u64,
    },
    Wayland {
        display: *mut std::ffi::c_void,
        surface: *mut std::ffi::c_void,
    },
}

// SAFETY: these raw pointers are only ever read once, synchronously, while
// creating a `VkSurfaceKHR`; they are never dereferenced by this crate.
unsafe impl Send for SurfaceSource {}
unsafe impl Sync for SurfaceSource {}

impl SurfaceSource {
    /// # Safety
    /// The handles carried by `self` must remain valid for the duration of
    /// this call and must genuinely belong to the platform they're tagged as.
    pub unsafe fn create_surface(
        &self,
        entry: &ash::Entry,
        instance: &ash::Instance,
    ) -> Result<vk::SurfaceKHR> {
        match self {
            SurfaceSource::Win32 { hinstance, hwnd } => {
                let loader = khr::Win32Surface::new(entry, instance);
                let info = vk::Win32SurfaceCreateInfoKHR::builder()
                    .hinstance(*hinstance)
                    .hwnd(*hwnd);
                unsafe { loader.create_win32_surface(&info, None) }.map_err(Error::from)
            }
            SurfaceSource::Xlib { display, window } => {
                let loader = khr::XlibSurface::new(entry, instance);
                let info = vk::XlibSurfaceCreateInfoKHR::builder()
                    .dpy(*display as *mut _)
                    .window(*window);
                unsafe { loader.create_xlib_surface(&info, None) }.map_err(Error::from)
            }
            SurfaceSource::Wayland { display, surface } => {
                let loader = khr::WaylandSurface::new(entry, instance);
                let info = vk::WaylandSurfaceCreateInfoKHR::builder()
                    .display(*display)
                    .surface(*surface);
                unsafe { loader.create_wayland_surface(&info, None) }.map_err(Error::from)
            }
        }
    }
}

/// Returns the instance extension name required for a given [`SurfaceSource`]
/// variant, for callers building their instance extension list up front.
pub fn required_instance_extension(source: &SurfaceSource) -> &'static std::ffi::CStr {
    match source {
        SurfaceSource::Win32 { .. } => khr::Win32Surface::name(),
        SurfaceSource::Xlib { .. } => khr::XlibSurface::name(),
        SurfaceSource::Wayland { .. } => khr::WaylandSurface::name(),
    }
}

pub fn check_instance_extension_supported(
    source: &SurfaceSource,
    supported: &[vk::ExtensionProperties],
) -> Result<()> {
    let required = required_instance_extension(source);
    let found = supported.iter().any(|ext| {
        // SAFETY: `extension_name` is a NUL-terminated C string written by the driver.
        let name = unsafe { std::ffi::CStr::from_ptr(ext.extension_name.as_ptr()) };
        name == required
    });
    if found {
        Ok(())
    } else {
        Err(Error::InstanceExtensionMissing(
            required.to_str().unwrap_or("<invalid>"),
        ))
    }
}

//! Error taxonomy for the core (§7). Driver error codes never cross the public
//! API boundary; every fallible `ash` call is funneled through [`Error::from`].

use ash::vk;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("graphics driver error {code:?}: {message}")]
    GraphicsError { code: vk::Result, message: String },

    #[error("out of host memory")]
    OutOfMemoryHost,

    #[error("out of device memory")]
    OutOfMemoryDevice,

    #[error("no memory type satisfies the requested requirements")]
    OutOfMemoryTypes,

    #[error("allocation of {requested} bytes is too large for any chunk (max {max_chunk})")]
    AllocationTooLargeForAnyChunk { requested: u64, max_chunk: u64 },

    #[error("surface lost")]
    SurfaceLost,

    #[error("failed to acquire a swapchain image")]
    SwapchainAcquireFailed,

    #[error("surface has no format compatible with the requested configuration")]
    SwapchainFormatUnsupported,

    #[error("no queue family supports presenting to this surface")]
    NoPresentQueue,

    #[error("required instance extension missing: {0}")]
    InstanceExtensionMissing(&'static str),

    #[error("required device extension missing: {0}")]
    DeviceExtensionMissing(&'static str),

    #[error("object already disposed")]
    ObjectDisposed,

    #[error("object still in use")]
    ObjectInUse,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<vk::Result> for Error {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Error::OutOfMemoryHost,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Error::OutOfMemoryDevice,
            vk::Result::ERROR_SURFACE_LOST_KHR => Error::SurfaceLost,
            other => {
                log::warn!("unrecognized driver result treated as a graphics error: {other:?}");
                Error::GraphicsError {
                    code: other,
                    message: other.to_string(),
                }
            }
        }
    }
}

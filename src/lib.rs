//! A thin, stateless Vulkan resource-management core: device memory
//! suballocation, descriptor pool growth, command-buffer pooling with
//! staging, swapchain lifecycle, and the ref-counted GPU resource object
//! model that ties them together.
//!
//! Graphics-API wrapper boilerplate (pipeline creation-info translation,
//! format enumeration tables, image layout transition tables), platform
//! window-surface creation, command-buffer recording, shader bytecode
//! loading, and instance/adapter enumeration are deliberately out of scope —
//! callers own those and consume only what's exposed here.

pub mod adapter;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod memory;
pub mod registry;
pub mod resource;
pub mod surface_source;
pub mod swapchain;
pub mod types;

pub use adapter::Adapter;
pub use device::Device;
pub use error::{Error, Result};

//! The shared GPU resource object model (§3, §4.5, §9): a tagged-variant
//! [`Resource`] enum owning the native payload for each kind, wrapped in
//! ref-counted, per-kind typed handles the API surface hands out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ash::vk;
use parking_lot::Mutex;

use crate::descriptor::DescriptorAllocationToken;
use crate::memory::MemoryAllocation;
use crate::registry::DeferredDestroyQueue;
use crate::types::DescriptorCounts;

/// The native payload owned by one GPU resource, tagged by kind (§9:
/// "Replace the source's class hierarchy with a tagged-variant `Resource`").
/// Per-kind destroy is a single `match` in [`Resource::destroy`].
pub enum Resource {
    Buffer {
        handle: vk::Buffer,
        allocation: Option<MemoryAllocation>,
    },
    Texture {
        handle: vk::Image,
        allocation: Option<MemoryAllocation>,
        /// `false` for swapchain-owned images, which the swapchain (not this
        /// resource) destroys.
        owns_image: bool,
    },
    TextureView(vk::ImageView),
    Sampler(vk::Sampler),
    Shader(vk::ShaderModule),
    ResourceLayout {
        handle: vk::DescriptorSetLayout,
        /// Per-kind descriptor demand of one set bound to this layout, used
        /// to size the [`DescriptorAllocationToken`] request at
        /// `createResourceSet` time (§4.2, §6).
        counts: DescriptorCounts,
        /// Per-binding descriptor type, in element/binding order, so
        /// `createResourceSet` can write each `VkWriteDescriptorSet` with the
        /// same type this layout's binding was created with (§6).
        descriptor_types: Arc<[vk::DescriptorType]>,
    },
    ResourceSet {
        token: DescriptorAllocationToken,
        /// Strong references to every bound resource, so a resource set
        /// keeps its bound buffers/views/samplers alive for as long as the
        /// set references their handles (§3 Ownership, §9).
        bound: Vec<GpuResource>,
    },
    Pipeline {
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
        render_pass: Option<vk::RenderPass>,
    },
    Framebuffer(vk::Framebuffer),
    Fence(vk::Fence),
    Swapchain(vk::SwapchainKHR),
}

/// Everything a [`Resource`] needs to tear itself down. Borrowed by
/// [`DeferredDestroyQueue::drain`], never stored.
pub struct DestroyContext<'a> {
    pub device: &'a ash::Device,
    pub memory: &'a crate::memory::MemoryManager,
    pub descriptors: &'a crate::descriptor::DescriptorPoolManager,
}

impl Resource {
    pub(crate) fn destroy(self, ctx: &DestroyContext<'_>) {
        match self {
            Resource::Buffer { handle, allocation } => unsafe {
                ctx.device.destroy_buffer(handle, None);
                if let Some(allocation) = allocation {
                    ctx.memory.free(allocation);
                }
            },
            Resource::Texture {
                handle,
                allocation,
                owns_image,
            } => unsafe {
                if owns_image {
                    ctx.device.destroy_image(handle, None);
                }
                if let Some(allocation) = allocation {
                    ctx.memory.free(allocation);
                }
            },
            Resource::TextureView(view) => unsafe { ctx.device.destroy_image_view(view, None) },
            Resource::Sampler(sampler) => unsafe { ctx.device.destroy_sampler(sampler, None) },
            Resource::Shader(module) => unsafe { ctx.device.destroy_shader_module(module, None) },
            Resource::ResourceLayout { handle, .. } => unsafe {
                ctx.device.destroy_descriptor_set_layout(handle, None)
            },
            Resource::ResourceSet { token, bound } => {
                if let Err(e) = ctx.descriptors.free(token) {
                    log::warn!("failed to free descriptor set during deferred destroy: {e}");
                }
                drop(bound);
            }
            Resource::Pipeline {
                pipeline,
                layout,
                render_pass,
            } => unsafe {
                ctx.device.destroy_pipeline(pipeline, None);
                ctx.device.destroy_pipeline_layout(layout, None);
                if let Some(render_pass) = render_pass {
                    ctx.device.destroy_render_pass(render_pass, None);
                }
            },
            Resource::Framebuffer(fb) => unsafe { ctx.device.destroy_framebuffer(fb, None) },
            Resource::Fence(fence) => unsafe { ctx.device.destroy_fence(fence, None) },
            Resource::Swapchain(_) => {
                // The swapchain extension handle is destroyed by `Swapchain`
                // itself (it needs the `khr::Swapchain` loader, which this
                // module has no access to); reaching this arm is a bookkeeping
                // bug, not a resource this queue should ever own.
                log::error!("Swapchain resources must be destroyed by Swapchain, not the registry");
            }
        }
    }
}

struct Inner {
    queue: Weak<DeferredDestroyQueue>,
    last_submission: AtomicU64,
    /// `None` once this resource has been handed to the deferred-destroy
    /// queue; guards against double-enqueue if `dispose` races `Drop`.
    resource: Mutex<Option<Resource>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let resource = self.resource.lock().take();
        if let Some(resource) = resource {
            if let Some(queue) = self.queue.upgrade() {
                queue.enqueue(self.last_submission.load(Ordering::Acquire), resource);
            }
        }
    }
}

/// A ref-counted GPU resource (§3 "GPU Resource"). Cloning shares the
/// intrusive atomic reference count that `Arc` itself provides; when the
/// last clone drops, the resource's destruction is handed to the owning
/// device's [`DeferredDestroyQueue`] rather than happening inline, so it
/// never races an in-flight command buffer (§4.5, §9).
#[derive(Clone)]
pub struct GpuResource(Arc<Inner>);

impl GpuResource {
    pub(crate) fn new(queue: &Arc<DeferredDestroyQueue>, resource: Resource) -> Self {
        Self(Arc::new(Inner {
            queue: Arc::downgrade(queue),
            last_submission: AtomicU64::new(0),
            resource: Mutex::new(Some(resource)),
        }))
    }

    /// Record that this resource may be referenced by the given submission
    /// index, so its eventual destruction waits for that submission to
    /// complete (§9).
    pub fn mark_used(&self, submission_index: u64) {
        self.0
            .last_submission
            .fetch_max(submission_index, Ordering::AcqRel);
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn with_resource<R>(&self, f: impl FnOnce(&Resource) -> R) -> R {
        let guard = self.0.resource.lock();
        let resource = guard.as_ref().expect("resource used after disposal");
        f(resource)
    }
}

/// Declares a per-kind typed handle wrapping [`GpuResource`], with a
/// `from_resource` constructor and an accessor for its native handle(s)
/// (§9: "Pipeline/ResourceLayout/ResourceSet keep per-kind strong typing at
/// the API surface").
macro_rules! resource_handle {
    ($name:ident) => {
        #[derive(Clone)]
        pub struct $name(pub(crate) GpuResource);

        impl $name {
            pub(crate) fn from_resource(inner: GpuResource) -> Self {
                Self(inner)
            }

            pub fn mark_used(&self, submission_index: u64) {
                self.0.mark_used(submission_index)
            }

            pub fn ref_count(&self) -> usize {
                self.0.ref_count()
            }
        }
    };
}

resource_handle!(Buffer);
resource_handle!(Texture);
resource_handle!(TextureView);
resource_handle!(Sampler);
resource_handle!(Shader);
resource_handle!(ResourceLayout);
resource_handle!(ResourceSet);
resource_handle!(Pipeline);
resource_handle!(Framebuffer);
resource_handle!(Fence);

impl Buffer {
    pub fn raw(&self) -> vk::Buffer {
        self.0.with_resource(|r| match r {
            Resource::Buffer { handle, .. } => *handle,
            _ => unreachable!("Buffer handle wraps a non-Buffer resource"),
        })
    }

    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.0.with_resource(|r| match r {
            Resource::Buffer { allocation, .. } => allocation.as_ref().and_then(|a| a.mapped_ptr()),
            _ => unreachable!(),
        })
    }
}

impl Texture {
    pub fn raw(&self) -> vk::Image {
        self.0.with_resource(|r| match r {
            Resource::Texture { handle, .. } => *handle,
            _ => unreachable!("Texture handle wraps a non-Texture resource"),
        })
    }
}

impl TextureView {
    pub fn raw(&self) -> vk::ImageView {
        self.0.with_resource(|r| match r {
            Resource::TextureView(v) => *v,
            _ => unreachable!(),
        })
    }
}

impl Sampler {
    pub fn raw(&self) -> vk::Sampler {
        self.0.with_resource(|r| match r {
            Resource::Sampler(s) => *s,
            _ => unreachable!(),
        })
    }
}

impl Shader {
    pub fn raw(&self) -> vk::ShaderModule {
        self.0.with_resource(|r| match r {
            Resource::Shader(s) => *s,
            _ => unreachable!(),
        })
    }
}

impl ResourceLayout {
    pub fn raw(&self) -> vk::DescriptorSetLayout {
        self.0.with_resource(|r| match r {
            Resource::ResourceLayout { handle, .. } => *handle,
            _ => unreachable!(),
        })
    }

    pub fn counts(&self) -> DescriptorCounts {
        self.0.with_resource(|r| match r {
            Resource::ResourceLayout { counts, .. } => *counts,
            _ => unreachable!(),
        })
    }

    pub fn descriptor_types(&self) -> Arc<[vk::DescriptorType]> {
        self.0.with_resource(|r| match r {
            Resource::ResourceLayout {
                descriptor_types, ..
            } => descriptor_types.clone(),
            _ => unreachable!(),
        })
    }
}

impl ResourceSet {
    pub fn raw_set(&self) -> vk::DescriptorSet {
        self.0.with_resource(|r| match r {
            Resource::ResourceSet { token, .. } => token.set,
            _ => unreachable!(),
        })
    }
}

impl Pipeline {
    pub fn raw(&self) -> vk::Pipeline {
        self.0.with_resource(|r| match r {
            Resource::Pipeline { pipeline, .. } => *pipeline,
            _ => unreachable!(),
        })
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.0.with_resource(|r| match r {
            Resource::Pipeline { layout, .. } => *layout,
            _ => unreachable!(),
        })
    }
}

impl Framebuffer {
    pub fn raw(&self) -> vk::Framebuffer {
        self.0.with_resource(|r| match r {
            Resource::Framebuffer(fb) => *fb,
            _ => unreachable!(),
        })
    }
}

impl Fence {
    pub fn raw(&self) -> vk::Fence {
        self.0.with_resource(|r| match r {
            Resource::Fence(f) => *f,
            _ => unreachable!(),
        })
    }
}

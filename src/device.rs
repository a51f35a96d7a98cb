//! The device: the entry point that owns every long-lived subsystem and
//! exposes the `create*` surface (§6).

use std::sync::Arc;

use ash::extensions::khr;
use ash::vk;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::adapter::Adapter;
use crate::command::CommandBufferPool;
use crate::descriptor::DescriptorPoolManager;
use crate::error::{Error, Result};
use crate::memory::MemoryManager;
use crate::registry::DeferredDestroyQueue;
use crate::resource::{
    Buffer, DestroyContext, Fence, Framebuffer, GpuResource, Pipeline, Resource, ResourceLayout,
    ResourceSet, Sampler, Shader, Texture, TextureView,
};
use crate::surface_source::SurfaceSource;
use crate::swapchain::{Swapchain, SwapchainDescriptor};
use crate::types::{
    BoundResource, BufferUsage, DescriptorCounts, DeviceOptions, ResourceLayoutElement,
    ResourceLayoutElementKind, ResourceLayoutElementOptions, ShaderStages, TextureKind,
    TextureUsage,
};

fn descriptor_type_of(
    kind: ResourceLayoutElementKind,
    options: ResourceLayoutElementOptions,
) -> vk::DescriptorType {
    let dynamic = options.contains(ResourceLayoutElementOptions::DYNAMIC_BINDING);
    match kind {
        ResourceLayoutElementKind::UniformBuffer => {
            if dynamic {
                vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
            } else {
                vk::DescriptorType::UNIFORM_BUFFER
            }
        }
        ResourceLayoutElementKind::StructuredRO | ResourceLayoutElementKind::StructuredRW => {
            if dynamic {
                vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
            } else {
                vk::DescriptorType::STORAGE_BUFFER
            }
        }
        ResourceLayoutElementKind::TextureRO => vk::DescriptorType::SAMPLED_IMAGE,
        ResourceLayoutElementKind::TextureRW => vk::DescriptorType::STORAGE_IMAGE,
        ResourceLayoutElementKind::Sampler => vk::DescriptorType::SAMPLER,
    }
}

fn stage_flags_of(stages: ShaderStages) -> vk::ShaderStageFlags {
    let mut flags = vk::ShaderStageFlags::empty();
    if stages.contains(ShaderStages::VERTEX) {
        flags |= vk::ShaderStageFlags::VERTEX;
    }
    if stages.contains(ShaderStages::FRAGMENT) {
        flags |= vk::ShaderStageFlags::FRAGMENT;
    }
    if stages.contains(ShaderStages::COMPUTE) {
        flags |= vk::ShaderStageFlags::COMPUTE;
    }
    if stages.contains(ShaderStages::GEOMETRY) {
        flags |= vk::ShaderStageFlags::GEOMETRY;
    }
    if stages.contains(ShaderStages::TESS_CONTROL) {
        flags |= vk::ShaderStageFlags::TESSELLATION_CONTROL;
    }
    if stages.contains(ShaderStages::TESS_EVALUATION) {
        flags |= vk::ShaderStageFlags::TESSELLATION_EVALUATION;
    }
    flags
}

fn counts_for(kind: ResourceLayoutElementKind, options: ResourceLayoutElementOptions) -> DescriptorCounts {
    let dynamic = options.contains(ResourceLayoutElementOptions::DYNAMIC_BINDING);
    let mut counts = DescriptorCounts::zero();
    match kind {
        ResourceLayoutElementKind::UniformBuffer => {
            if dynamic {
                counts.dynamic_uniform_buffers = 1;
            } else {
                counts.uniform_buffers = 1;
            }
        }
        ResourceLayoutElementKind::StructuredRO | ResourceLayoutElementKind::StructuredRW => {
            if dynamic {
                counts.dynamic_storage_buffers = 1;
            } else {
                counts.storage_buffers = 1;
            }
        }
        ResourceLayoutElementKind::TextureRO => counts.sampled_images = 1,
        ResourceLayoutElementKind::TextureRW => counts.storage_images = 1,
        ResourceLayoutElementKind::Sampler => counts.samplers = 1,
    }
    counts
}

fn buffer_usage_flags(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    if usage.contains(BufferUsage::VERTEX) {
        flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX) {
        flags |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsage::STRUCTURED_RO) || usage.contains(BufferUsage::STRUCTURED_RW) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::INDIRECT) {
        flags |= vk::BufferUsageFlags::INDIRECT_BUFFER;
    }
    if usage.contains(BufferUsage::STAGING) {
        flags |= vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
    }
    flags
}

fn image_usage_flags(usage: TextureUsage) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    if usage.contains(TextureUsage::SAMPLED) {
        flags |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(TextureUsage::STORAGE) {
        flags |= vk::ImageUsageFlags::STORAGE;
    }
    if usage.contains(TextureUsage::RENDER_TARGET) {
        flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if usage.contains(TextureUsage::DEPTH_STENCIL) {
        flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    if usage.contains(TextureUsage::STAGING) {
        flags |= vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
    }
    flags
}

fn image_type_of(kind: TextureKind) -> vk::ImageType {
    match kind {
        TextureKind::D1 => vk::ImageType::TYPE_1D,
        TextureKind::D2 => vk::ImageType::TYPE_2D,
        TextureKind::D3 => vk::ImageType::TYPE_3D,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BufferDescriptor {
    pub size: u64,
    pub usage: BufferUsage,
}

#[derive(Debug, Clone, Copy)]
pub struct TextureDescriptor {
    pub kind: TextureKind,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: vk::Format,
    pub usage: TextureUsage,
    pub sample_count: vk::SampleCountFlags,
}

#[derive(Debug, Clone, Copy)]
pub struct TextureViewDescriptor {
    pub base_mip_level: u32,
    pub mip_levels: u32,
    pub base_array_layer: u32,
    pub array_layers: u32,
    pub format: Option<vk::Format>,
    pub view_type: vk::ImageViewType,
    pub aspect_mask: vk::ImageAspectFlags,
}

#[derive(Debug, Clone, Copy)]
pub struct ShaderDescriptor<'a> {
    pub bytecode: &'a [u32],
}

/// A command-submission helper bundling the driver call and
/// `graphicsQueueLock` discipline (§5) it must be made under.
pub struct SubmitInfo<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait: &'a [(vk::Semaphore, vk::PipelineStageFlags)],
    pub signal: &'a [vk::Semaphore],
}

/// Everything the device owns for its life (§9 "there is one `Device` per
/// logical GPU instance").
struct DeviceShared {
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    raw: ash::Device,
    queue_family_index: u32,
    queue_family_count: u32,
    queue: vk::Queue,
    /// `graphicsQueueLock` (§5): held across `vkQueueSubmit` on `queue` and
    /// across `vkQueuePresentKHR` when the swapchain shares this family.
    queue_lock: Arc<Mutex<()>>,
    memory: Arc<MemoryManager>,
    descriptors: Arc<DescriptorPoolManager>,
    destroy_queue: Arc<DeferredDestroyQueue>,
    options: DeviceOptions,
}

impl DeviceShared {
    fn destroy_context(&self) -> DestroyContext<'_> {
        DestroyContext {
            device: &self.raw,
            memory: &self.memory,
            descriptors: &self.descriptors,
        }
    }

    fn register(&self, resource: Resource) -> GpuResource {
        GpuResource::new(&self.destroy_queue, resource)
    }
}

/// Owns the logical device and every long-lived subsystem (§3, §9).
/// Cloning is cheap (`Arc`) and shares all state; the last clone's drop does
/// not implicitly destroy the device — call [`Device::destroy`] explicitly.
#[derive(Clone)]
pub struct Device(Arc<DeviceShared>);

impl Device {
    pub fn create(adapter: &Adapter, options: DeviceOptions) -> Result<Self> {
        let queue_priorities = [1.0f32];
        let queue_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(adapter.queue_family_index)
            .queue_priorities(&queue_priorities);
        let queue_infos = [queue_info.build()];

        let device_extensions = [khr::Swapchain::name().as_ptr()];
        let info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&device_extensions);

        let raw = unsafe {
            adapter
                .instance
                .create_device(adapter.physical_device, &info, None)
        }?;
        let queue = unsafe { raw.get_device_queue(adapter.queue_family_index, 0) };

        let memory = Arc::new(MemoryManager::new(raw.clone(), adapter.memory_properties));
        let descriptors = Arc::new(DescriptorPoolManager::new(raw.clone()));

        Ok(Self(Arc::new(DeviceShared {
            entry: adapter.entry.clone(),
            instance: adapter.instance.clone(),
            physical_device: adapter.physical_device,
            raw,
            queue_family_index: adapter.queue_family_index,
            queue_family_count: adapter.queue_family_count,
            queue,
            queue_lock: Arc::new(Mutex::new(())),
            memory,
            descriptors,
            destroy_queue: Arc::new(DeferredDestroyQueue::new()),
            options,
        })))
    }

    pub fn options(&self) -> &DeviceOptions {
        &self.0.options
    }

    pub fn raw(&self) -> &ash::Device {
        &self.0.raw
    }

    pub fn create_buffer(&self, desc: &BufferDescriptor) -> Result<Buffer> {
        let info = vk::BufferCreateInfo::builder()
            .size(desc.size)
            .usage(buffer_usage_flags(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let handle = unsafe { self.0.raw.create_buffer(&info, None) }?;

        let usage = if desc.usage.contains(BufferUsage::DYNAMIC) {
            crate::types::MemoryUsage::PreferHost
        } else {
            crate::types::MemoryUsage::PreferDevice
        };
        let allocation = match self.0.memory.allocate_for_buffer(
            handle,
            usage,
            crate::types::MemoryFlags::empty(),
        ) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.0.raw.destroy_buffer(handle, None) };
                return Err(e);
            }
        };
        unsafe {
            self.0
                .raw
                .bind_buffer_memory(handle, allocation.device_memory(), allocation.offset())
        }?;

        Ok(Buffer::from_resource(self.0.register(Resource::Buffer {
            handle,
            allocation: Some(allocation),
        })))
    }

    pub fn create_texture(&self, desc: &TextureDescriptor) -> Result<Texture> {
        let info = vk::ImageCreateInfo::builder()
            .image_type(image_type_of(desc.kind))
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: desc.depth,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(desc.sample_count)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(image_usage_flags(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let handle = unsafe { self.0.raw.create_image(&info, None) }?;

        let allocation = match self.0.memory.allocate_for_image(
            handle,
            false,
            crate::types::MemoryUsage::PreferDevice,
            crate::types::MemoryFlags::empty(),
        ) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.0.raw.destroy_image(handle, None) };
                return Err(e);
            }
        };
        unsafe {
            self.0
                .raw
                .bind_image_memory(handle, allocation.device_memory(), allocation.offset())
        }?;

        Ok(Texture::from_resource(self.0.register(Resource::Texture {
            handle,
            allocation: Some(allocation),
            owns_image: true,
        })))
    }

    pub fn create_texture_view(
        &self,
        target: &Texture,
        desc: &TextureViewDescriptor,
    ) -> Result<TextureView> {
        let mut info = vk::ImageViewCreateInfo::builder()
            .image(target.raw())
            .view_type(desc.view_type)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: desc.aspect_mask,
                base_mip_level: desc.base_mip_level,
                level_count: desc.mip_levels,
                base_array_layer: desc.base_array_layer,
                layer_count: desc.array_layers,
            });
        if let Some(format) = desc.format {
            info = info.format(format);
        }
        let handle = unsafe { self.0.raw.create_image_view(&info, None) }?;
        Ok(TextureView::from_resource(
            self.0.register(Resource::TextureView(handle)),
        ))
    }

    pub fn create_sampler(&self, info: &vk::SamplerCreateInfo) -> Result<Sampler> {
        let handle = unsafe { self.0.raw.create_sampler(info, None) }?;
        Ok(Sampler::from_resource(self.0.register(Resource::Sampler(handle))))
    }

    pub fn create_shader(&self, desc: &ShaderDescriptor<'_>) -> Result<Shader> {
        let info = vk::ShaderModuleCreateInfo::builder().code(desc.bytecode);
        let handle = unsafe { self.0.raw.create_shader_module(&info, None) }?;
        Ok(Shader::from_resource(self.0.register(Resource::Shader(handle))))
    }

    pub fn create_resource_layout(&self, elements: &[ResourceLayoutElement]) -> Result<ResourceLayout> {
        let descriptor_types: Arc<[vk::DescriptorType]> = elements
            .iter()
            .map(|element| descriptor_type_of(element.kind, element.options))
            .collect();

        let bindings: Vec<vk::DescriptorSetLayoutBinding> = elements
            .iter()
            .enumerate()
            .map(|(i, _)| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(i as u32)
                    .descriptor_type(descriptor_types[i])
                    .descriptor_count(1)
                    .stage_flags(stage_flags_of(elements[i].stages))
                    .build()
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let handle = unsafe { self.0.raw.create_descriptor_set_layout(&info, None) }?;

        let counts = elements
            .iter()
            .fold(DescriptorCounts::zero(), |acc, element| {
                acc.add(&counts_for(element.kind, element.options))
            });

        Ok(ResourceLayout::from_resource(self.0.register(
            Resource::ResourceLayout {
                handle,
                counts,
                descriptor_types,
            },
        )))
    }

    pub fn create_resource_set(
        &self,
        layout: &ResourceLayout,
        bound_resources: &[BoundResource<'_>],
    ) -> Result<ResourceSet> {
        let token = self
            .0
            .descriptors
            .allocate(layout.counts(), layout.raw())?;
        let descriptor_types = layout.descriptor_types();

        let mut buffer_infos = Vec::new();
        let mut image_infos = Vec::new();
        let mut bound = Vec::with_capacity(bound_resources.len());
        for resource in bound_resources {
            match resource {
                BoundResource::Buffer { buffer, offset, range } => {
                    buffer_infos.push(vk::DescriptorBufferInfo {
                        buffer: buffer.raw(),
                        offset: *offset,
                        range: *range,
                    });
                    bound.push(buffer.0.clone());
                }
                BoundResource::Texture { view, sampler } => {
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: sampler.map(|s| s.raw()).unwrap_or_default(),
                        image_view: view.raw(),
                        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    });
                    bound.push(view.0.clone());
                    if let Some(sampler) = sampler {
                        bound.push(sampler.0.clone());
                    }
                }
            }
        }

        let mut writes = Vec::new();
        let mut buffer_iter = buffer_infos.iter();
        let mut image_iter = image_infos.iter();
        for (i, resource) in bound_resources.iter().enumerate() {
            let write = vk::WriteDescriptorSet::builder()
                .dst_set(token.set)
                .dst_binding(i as u32)
                .dst_array_element(0)
                .descriptor_type(descriptor_types[i]);
            let write = match resource {
                BoundResource::Buffer { .. } => {
                    write.buffer_info(std::slice::from_ref(buffer_iter.next().unwrap()))
                }
                BoundResource::Texture { .. } => {
                    write.image_info(std::slice::from_ref(image_iter.next().unwrap()))
                }
            };
            writes.push(write.build());
        }
        unsafe { self.0.raw.update_descriptor_sets(&writes, &[]) };

        Ok(ResourceSet::from_resource(
            self.0.register(Resource::ResourceSet { token, bound }),
        ))
    }

    pub fn create_pipeline_layout(
        &self,
        set_layouts: &[&ResourceLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout> {
        let raw_layouts: Vec<vk::DescriptorSetLayout> =
            set_layouts.iter().map(|l| l.raw()).collect();
        let info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&raw_layouts)
            .push_constant_ranges(push_constant_ranges);
        unsafe { self.0.raw.create_pipeline_layout(&info, None) }.map_err(Error::from)
    }

    /// Wraps an already-translated `VkGraphicsPipelineCreateInfo` (§1: pipeline
    /// creation-info translation is an external collaborator's job). Injects
    /// `layout` and takes ownership of `render_pass` for lifetime tracking.
    pub fn create_graphics_pipeline(
        &self,
        mut info: vk::GraphicsPipelineCreateInfo,
        layout: vk::PipelineLayout,
        render_pass: Option<vk::RenderPass>,
    ) -> Result<Pipeline> {
        info.layout = layout;
        if let Some(render_pass) = render_pass {
            info.render_pass = render_pass;
        }
        let pipelines = unsafe {
            self.0
                .raw
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        }
        .map_err(|(_, e)| Error::from(e))?;

        Ok(Pipeline::from_resource(self.0.register(Resource::Pipeline {
            pipeline: pipelines[0],
            layout,
            render_pass,
        })))
    }

    pub fn create_compute_pipeline(
        &self,
        mut info: vk::ComputePipelineCreateInfo,
        layout: vk::PipelineLayout,
    ) -> Result<Pipeline> {
        info.layout = layout;
        let pipelines = unsafe {
            self.0
                .raw
                .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
        }
        .map_err(|(_, e)| Error::from(e))?;

        Ok(Pipeline::from_resource(self.0.register(Resource::Pipeline {
            pipeline: pipelines[0],
            layout,
            render_pass: None,
        })))
    }

    pub fn create_framebuffer(&self, info: &vk::FramebufferCreateInfo) -> Result<Framebuffer> {
        let handle = unsafe { self.0.raw.create_framebuffer(info, None) }?;
        Ok(Framebuffer::from_resource(
            self.0.register(Resource::Framebuffer(handle)),
        ))
    }

    pub fn create_command_buffer_pool(
        &self,
        transient: bool,
        can_reset: bool,
    ) -> Result<CommandBufferPool> {
        CommandBufferPool::create(
            self.0.raw.clone(),
            self.0.memory.clone(),
            self.0.queue_family_index,
            transient,
            can_reset,
        )
    }

    pub fn create_fence(&self, signaled: bool) -> Result<Fence> {
        let mut flags = vk::FenceCreateFlags::empty();
        if signaled {
            flags |= vk::FenceCreateFlags::SIGNALED;
        }
        let info = vk::FenceCreateInfo::builder().flags(flags);
        let handle = unsafe { self.0.raw.create_fence(&info, None) }?;
        Ok(Fence::from_resource(self.0.register(Resource::Fence(handle))))
    }

    pub fn reset_fence(&self, fence: &Fence) -> Result<()> {
        unsafe { self.0.raw.reset_fences(&[fence.raw()]) }.map_err(Error::from)
    }

    pub fn wait_for_fence(&self, fence: &Fence) -> Result<()> {
        unsafe {
            self.0
                .raw
                .wait_for_fences(&[fence.raw()], true, u64::MAX)
        }
        .map_err(Error::from)
    }

    /// Notify the registry that `submission_index` has completed, draining
    /// any deferred destructions it was waiting on (§4.5).
    pub fn notify_submission_completed(&self, submission_index: u64) {
        self.0
            .destroy_queue
            .notify_submission_completed(submission_index, &self.0.destroy_context());
    }

    /// Submits to the main queue under `graphicsQueueLock` (§5).
    pub fn submit(&self, info: &SubmitInfo<'_>, fence: Option<&Fence>) -> Result<()> {
        profiling::scope!("Device::submit");
        // Most submissions wait on a handful of semaphores at most; avoid a
        // heap allocation on this hot path for the common case (§2a).
        let wait_semaphores: SmallVec<[vk::Semaphore; 4]> =
            info.wait.iter().map(|(s, _)| *s).collect();
        let wait_stages: SmallVec<[vk::PipelineStageFlags; 4]> =
            info.wait.iter().map(|(_, s)| *s).collect();

        let vk_info = vk::SubmitInfo::builder()
            .command_buffers(info.command_buffers)
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .signal_semaphores(info.signal);

        let fence_raw = fence.map(|f| f.raw()).unwrap_or_default();
        let _guard = self.0.queue_lock.lock();
        unsafe {
            self.0
                .raw
                .queue_submit(self.0.queue, &[vk_info.build()], fence_raw)
        }
        .map_err(Error::from)
    }

    pub fn create_swapchain(
        &self,
        surface_source: &SurfaceSource,
        width: u32,
        height: u32,
        sync_to_vblank: bool,
        color_srgb: bool,
        depth_format: Option<vk::Format>,
    ) -> Result<Swapchain> {
        let surface_fn = khr::Surface::new(&self.0.entry, &self.0.instance);
        let swapchain_fn = khr::Swapchain::new(&self.0.instance, &self.0.raw);

        Swapchain::create(
            self.0.raw.clone(),
            swapchain_fn,
            surface_fn,
            self.0.physical_device,
            surface_source,
            &self.0.entry,
            &self.0.instance,
            self.0.queue_family_index,
            self.0.queue,
            self.0.queue_lock.clone(),
            self.0.queue_family_count,
            SwapchainDescriptor {
                width,
                height,
                depth_format,
                sync_to_vblank,
                color_srgb,
            },
        )
    }

    /// Waits for the device to go idle, drains every pending deferred
    /// destruction unconditionally, then destroys the device itself (§4.5
    /// "At device shutdown...", §6 "destroy(Device) (waits device idle
    /// first)").
    ///
    /// # Safety
    /// No swapchain, command buffer pool, or resource handle created from
    /// this device may be used afterwards.
    pub unsafe fn destroy(self) {
        unsafe {
            let _ = self.0.raw.device_wait_idle();
        }
        self.0.destroy_queue.drain_all(&self.0.destroy_context());
        unsafe {
            self.0.descriptors.destroy();
        }
        unsafe {
            self.0.raw.destroy_device(None);
        }
    }
}

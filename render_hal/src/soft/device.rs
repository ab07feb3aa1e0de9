//! The software device.
//!
//! The device owns the native queue and every pool shared by its command
//! lists. Submissions are recorded in a FIFO of in-flight work, each entry
//! guarded by a pooled native fence. Completed entries release the references
//! captured by their recording, return their staging resources and recycle
//! their command buffer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::Mutex;
use render_tracing::trace_span;

use crate::config::{CompletionMode, DeviceConfig};
use crate::error::{DeviceError, Error, Result, UsageError};
use crate::hal::{
    self, BindableResource, CommandList as _, ComputePipelineDescription, FramebufferAttachment,
    FramebufferDescription, GraphicsPipelineDescription, ResourceSetDescription,
};
use crate::tracking::descriptors::{DescriptorAllocator, DescriptorBlockProvider, DescriptorCounts};
use crate::tracking::ref_count::{ObjectKind, RefCountRegistry, RefId};
use crate::tracking::staging::StagingPool;
use crate::tracking::subresource::{SubresourceTracker, TextureState};
use crate::types::{
    BufferDescription, BufferUsage, MapMode, PipelineKind, ResourceKind, ResourceLayoutDescription,
    ResourceLayoutElement, SamplerDescription, ShaderDescription, ShaderStages,
    TextureDescription, TextureFormat, TextureRegion, TextureUsage,
};

use super::command_list::{CommandList, CommandListPool, RecordingState, Submission};
use super::native::{
    NativeAttachment, NativeDevice, NativeFramebuffer, NativeId, NativeObject, NativePipeline,
    NativeSetBindings, NativeShared,
};
use super::queue::{CompletionContext, NativeCallback, NativeFence, NativeSubmission};
use super::resources::{
    Attachment, Buffer, BufferInner, Fence, Framebuffer, FramebufferInner, MappedResource,
    Pipeline, PipelineInner, ResourceCore, ResourceLayout, ResourceLayoutInner, ResourceSet,
    ResourceSetInner, Sampler, SamplerInner, Shader, ShaderInner, StagingBuffer, StagingTexture,
    Texture, TextureInner,
};
use super::Soft;

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(0);

/// Creates native descriptor pools for the [`DescriptorAllocator`].
#[derive(Debug)]
pub(crate) struct NativeDescriptorPools {
    native: Arc<NativeShared>,
}

impl DescriptorBlockProvider for NativeDescriptorPools {
    type Block = NativeId;

    fn create_block(
        &self,
        max_sets: u32,
        capacity: &DescriptorCounts,
    ) -> Result<NativeId, DeviceError> {
        self.native.create_descriptor_pool(max_sets, capacity)
    }

    fn destroy_block(&self, block: NativeId) {
        self.native.destroy(block);
    }
}

/// A submission that has not been observed complete.
struct SubmittedWork {
    id: u64,
    fence: NativeFence,
    submission: Submission,
}

pub(crate) struct DeviceShared {
    pub id: u64,
    pub config: DeviceConfig,
    pub native: NativeDevice,
    pub registry: Arc<RefCountRegistry>,
    pub staging_buffers: StagingPool<StagingBuffer>,
    pub staging_textures: StagingPool<StagingTexture>,
    descriptors: Arc<DescriptorAllocator<NativeDescriptorPools>>,
    /// Command buffers of device-internal uploads.
    internal: Arc<CommandListPool>,
    /// Serializes access to the native queue.
    queue_lock: Mutex<()>,
    submissions: Mutex<VecDeque<SubmittedWork>>,
    fences: Mutex<Vec<NativeFence>>,
    next_submission: AtomicU64,
    this: Weak<DeviceShared>,
}

impl DeviceShared {
    fn new(config: DeviceConfig) -> Arc<Self> {
        let id = NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed);
        let native = NativeDevice::new(config.encoder_model, config.memory_budget);

        let descriptors = DescriptorAllocator::new(
            NativeDescriptorPools {
                native: native.shared().clone(),
            },
            config.descriptors.max_sets,
            DescriptorCounts::splat(config.descriptors.per_kind),
        );

        let min_dimension = u64::from(config.staging.min_texture_dimension);

        tracing::debug!("creating device {} with {:?}", id, config);

        Arc::new_cyclic(|this| Self {
            id,
            staging_buffers: StagingPool::new(config.staging.min_buffer_size),
            staging_textures: StagingPool::new(min_dimension * min_dimension),
            config,
            native,
            registry: Arc::new(RefCountRegistry::new()),
            descriptors: Arc::new(descriptors),
            internal: Arc::new(CommandListPool::default()),
            queue_lock: Mutex::new(()),
            submissions: Mutex::new(VecDeque::new()),
            fences: Mutex::new(Vec::new()),
            next_submission: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    /// Registers a native object with the ref-count registry.
    ///
    /// `members` are referenced for the lifetime of the object and released
    /// after `on_destroy` ran and the native object was destroyed.
    fn register<F>(
        &self,
        kind: ObjectKind,
        native: NativeId,
        members: Vec<RefId>,
        on_destroy: F,
    ) -> Result<ResourceCore>
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = self.native.shared().clone();
        let hook_members = members.clone();

        let hook = move |registry: &RefCountRegistry| {
            on_destroy();
            shared.destroy(native);
            tracing::debug!("destroyed native {:?} {:?}", kind, native);

            for member in hook_members {
                registry.decrement(member);
            }
        };

        let id = match self.registry.register(kind, hook) {
            Ok(id) => id,
            Err(err) => {
                tracing::error!("failed to register {:?}: {}", kind, err);
                self.native.shared().destroy(native);
                return Err(err.into());
            }
        };

        for member in &members {
            self.registry.increment(*member);
        }

        Ok(ResourceCore::new(id, native, self.id, self.registry.clone()))
    }

    fn check(&self, core: &ResourceCore) -> Result<(), UsageError> {
        core.check(self.id)
    }

    fn check_fence(&self, fence: &Fence) -> Result<(), UsageError> {
        if fence.device != self.id {
            return Err(UsageError::ForeignResource);
        }

        Ok(())
    }

    fn new_buffer(&self, desc: &BufferDescription) -> Result<Buffer> {
        if desc.size == 0 {
            return Err(UsageError::InvalidDescription("buffer of zero size").into());
        }

        let native = self.native.shared().create_buffer(desc.size)?;
        let core = self.register(ObjectKind::Buffer, native, Vec::new(), || ())?;

        Ok(Buffer(Arc::new(BufferInner {
            core,
            desc: *desc,
            mapped: Mutex::new(None),
        })))
    }

    fn new_texture(&self, desc: &TextureDescription) -> Result<Texture> {
        if desc.width == 0 || desc.height == 0 || desc.mip_levels == 0 || desc.array_layers == 0 {
            return Err(UsageError::InvalidDescription("texture without subresources").into());
        }

        if desc.mip_levels > TextureDescription::max_mip_levels(desc.width, desc.height) {
            return Err(UsageError::InvalidDescription("too many mip levels").into());
        }

        if desc.usage.contains(TextureUsage::DEPTH_STENCIL) != desc.format.is_depth() {
            return Err(UsageError::InvalidDescription(
                "depth-stencil usage requires a depth format",
            )
            .into());
        }

        let initial = TextureState::initial(desc.usage);
        let native = self.native.shared().create_texture(*desc, initial)?;
        let core = self.register(ObjectKind::Texture, native, Vec::new(), || ())?;

        Ok(Texture(Arc::new(TextureInner {
            core,
            desc: Mutex::new(*desc),
            states: Mutex::new(SubresourceTracker::new(
                desc.mip_levels,
                desc.array_layers,
                initial,
            )),
            mapped: Mutex::new(HashMap::new()),
        })))
    }

    /// Returns a host-visible buffer of at least `size` bytes.
    pub fn acquire_staging_buffer(&self, size: u64) -> Result<StagingBuffer> {
        self.staging_buffers.acquire(size, |capacity| {
            self.new_buffer(&BufferDescription {
                size: capacity,
                usage: BufferUsage::STAGING,
            })
            .map(StagingBuffer)
        })
    }

    /// Returns a staging texture shaped to `region` in `format`, with every
    /// subresource in the general layout.
    fn acquire_staging_texture(
        &self,
        format: TextureFormat,
        region: &TextureRegion,
    ) -> Result<StagingTexture> {
        let min = self.config.staging.min_texture_dimension;

        let staging = self
            .staging_textures
            .acquire(region.byte_size(format), |_| {
                let desc = TextureDescription {
                    width: region.width.max(min),
                    height: region.height.max(min),
                    mip_levels: 1,
                    array_layers: region.layer_count,
                    format,
                    usage: TextureUsage::STAGING,
                };

                let texture = self.new_texture(&desc)?;
                Ok::<_, Error>(StagingTexture {
                    texture,
                    capacity: desc.total_size(),
                })
            })?;

        let desc = TextureDescription {
            width: region.width,
            height: region.height,
            mip_levels: 1,
            array_layers: region.layer_count,
            format,
            usage: TextureUsage::STAGING,
        };

        self.native
            .shared()
            .reshape_texture(staging.texture.native_id(), desc, TextureState::General)?;
        *staging.texture.0.desc.lock() = desc;
        staging
            .texture
            .states()
            .lock()
            .reset(1, region.layer_count, TextureState::General);

        Ok(staging)
    }

    fn submit(&self, submission: Submission, fence: Option<&NativeFence>) -> Result<()> {
        let _span = trace_span!(
            "Device::submit",
            command_buffer = submission.command_buffer.id()
        )
        .entered();

        let _queue = self.queue_lock.lock();

        if self.config.completion == CompletionMode::Polling {
            self.check_submitted_fences();
        }

        let id = self.next_submission.fetch_add(1, Ordering::Relaxed);
        let submission_fence = self.fences.lock().pop().unwrap_or_default();

        let callback = match self.config.completion {
            CompletionMode::Polling => None,
            CompletionMode::Callback => {
                let context: Weak<dyn CompletionContext> = self.this.clone();
                Some(NativeCallback {
                    context,
                    user_data: id,
                })
            }
        };

        let command_buffer = submission.command_buffer.clone();

        // The entry must exist before the queue can complete it.
        self.submissions.lock().push_back(SubmittedWork {
            id,
            fence: submission_fence.clone(),
            submission,
        });

        self.native.shared().count_submission();
        let res = self.native.queue().submit(NativeSubmission {
            command_buffers: vec![command_buffer],
            fence: Some(submission_fence),
            callback,
        });

        if let Err(err) = res {
            tracing::error!("failed to submit {}: {}", id, err);
            if let Some(work) = self.take_submitted(id) {
                self.complete(work);
            }
            return Err(err.into());
        }

        if let Some(fence) = fence {
            // Signaled once everything submitted before has completed.
            self.native.queue().submit(NativeSubmission {
                command_buffers: Vec::new(),
                fence: Some(fence.clone()),
                callback: None,
            })?;
        }

        Ok(())
    }

    fn take_submitted(&self, id: u64) -> Option<SubmittedWork> {
        let mut submissions = self.submissions.lock();
        let index = submissions.iter().position(|work| work.id == id)?;
        submissions.remove(index)
    }

    /// Releases everything a completed submission held.
    fn complete(&self, work: SubmittedWork) {
        let SubmittedWork {
            id,
            fence,
            submission:
                Submission {
                    command_buffer,
                    mut info,
                    pool,
                },
        } = work;
        let _span = trace_span!("Device::complete", submission = id).entered();

        info.release(
            &self.registry,
            &self.staging_buffers,
            &self.staging_textures,
        );
        pool.recycle(command_buffer, info);

        fence.reset();
        self.fences.lock().push(fence);

        tracing::debug!("submission {} completed", id);
    }

    /// Completes every submission from the front of the queue whose fence
    /// is signaled, stopping at the first one that is not.
    pub fn check_submitted_fences(&self) {
        let _span = trace_span!("Device::check_submitted_fences").entered();

        let completed: Vec<SubmittedWork> = {
            let mut submissions = self.submissions.lock();

            let mut completed = Vec::new();
            while submissions
                .front()
                .is_some_and(|work| work.fence.is_signaled())
            {
                completed.extend(submissions.pop_front());
            }
            completed
        };

        for work in completed {
            self.complete(work);
        }
    }

    fn pending_submissions(&self) -> usize {
        self.submissions.lock().len()
    }
}

impl CompletionContext for DeviceShared {
    fn on_native_completion(&self, user_data: u64) {
        let _span = trace_span!("Device::on_native_completion").entered();

        // A missing entry was already observed through a fence check.
        if let Some(work) = self.take_submitted(user_data) {
            self.complete(work);
        }
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        // The last reference may be released by a completion callback.
        if !self.native.queue().is_worker_thread() {
            self.native.queue().wait_idle();
        }

        let pending: Vec<SubmittedWork> = self.submissions.get_mut().drain(..).collect();
        for work in pending {
            if !work.fence.is_signaled() {
                tracing::warn!("releasing submission {} before completion", work.id);
            }
            self.complete(work);
        }

        drop(self.staging_buffers.drain());
        drop(self.staging_textures.drain());

        tracing::debug!(
            "device {} destroyed with {} live objects",
            self.id,
            self.registry.live()
        );
    }
}

/// The software graphics device.
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl Device {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            shared: DeviceShared::new(config),
        }
    }

    /// Returns the native device for inspection.
    pub fn native(&self) -> &NativeDevice {
        &self.shared.native
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.shared.config
    }

    /// Returns the number of objects that have not been destroyed.
    pub fn live_objects(&self) -> usize {
        self.shared.registry.live()
    }

    /// Returns the current reference count of an object, or `None` if it was
    /// destroyed.
    pub fn ref_count(&self, id: RefId) -> Option<usize> {
        self.shared.registry.count(id)
    }

    /// Returns the number of submissions not yet observed complete.
    pub fn pending_submissions(&self) -> usize {
        self.shared.pending_submissions()
    }

    /// Returns the number of staging buffers created so far.
    pub fn staging_buffers_created(&self) -> usize {
        self.shared.staging_buffers.created()
    }

    pub fn staging_buffers_available(&self) -> usize {
        self.shared.staging_buffers.available()
    }

    pub fn staging_textures_created(&self) -> usize {
        self.shared.staging_textures.created()
    }

    pub fn descriptor_blocks(&self) -> usize {
        self.shared.descriptors.block_count()
    }

    fn internal_list(&self) -> CommandList {
        CommandList::with_pool(self.shared.clone(), self.shared.internal.clone())
    }

    fn check_buffer_range(buffer: &Buffer, offset: u64, len: u64) -> Result<(), UsageError> {
        let end = offset.saturating_add(len);
        if end > buffer.size() {
            return Err(UsageError::OutOfBounds {
                start: offset,
                end,
                size: buffer.size(),
            });
        }

        Ok(())
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new(DeviceConfig::default())
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.shared.id)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

/// Collects the native bindings and members of a resource set.
#[derive(Default)]
struct SetBuilder {
    members: Vec<RefId>,
    bindings: NativeSetBindings,
    sampled_textures: Vec<Texture>,
    storage_textures: Vec<Texture>,
}

impl SetBuilder {
    fn bind(
        &mut self,
        device: &DeviceShared,
        element: &ResourceLayoutElement,
        resource: &BindableResource<'_, Soft>,
    ) -> Result<(), UsageError> {
        const MISMATCH: UsageError =
            UsageError::InvalidDescription("resource does not match layout element");

        match (element.kind, resource) {
            (kind, BindableResource::Buffer(buffer)) if kind.is_buffer() => {
                self.bind_buffer(device, kind, buffer)
            }
            (
                kind,
                BindableResource::BufferRange {
                    buffer,
                    offset,
                    size,
                },
            ) if kind.is_buffer() => {
                Device::check_buffer_range(buffer, *offset, *size)?;
                self.bind_buffer(device, kind, buffer)
            }
            (ResourceKind::TextureReadOnly, BindableResource::Texture(texture)) => {
                device.check(texture.core())?;
                if !texture.desc().usage.contains(TextureUsage::SAMPLED) {
                    return Err(UsageError::MissingUsage {
                        required: "SAMPLED",
                    });
                }

                self.bindings
                    .sampled_textures
                    .extend(subresources(texture));
                self.members.push(texture.ref_id());
                self.sampled_textures.push((*texture).clone());
                Ok(())
            }
            (ResourceKind::TextureReadWrite, BindableResource::Texture(texture)) => {
                device.check(texture.core())?;
                if !texture.desc().usage.contains(TextureUsage::STORAGE) {
                    return Err(UsageError::MissingUsage {
                        required: "STORAGE",
                    });
                }

                self.bindings
                    .storage_textures
                    .extend(subresources(texture));
                self.members.push(texture.ref_id());
                self.storage_textures.push((*texture).clone());
                Ok(())
            }
            (ResourceKind::Sampler, BindableResource::Sampler(sampler)) => {
                device.check(sampler.core())?;
                self.bindings.samplers.push(sampler.native_id());
                self.members.push(sampler.ref_id());
                Ok(())
            }
            _ => Err(MISMATCH),
        }
    }

    fn bind_buffer(
        &mut self,
        device: &DeviceShared,
        kind: ResourceKind,
        buffer: &Buffer,
    ) -> Result<(), UsageError> {
        device.check(buffer.core())?;

        let usage = buffer.desc().usage;
        let (allowed, required) = match kind {
            ResourceKind::UniformBuffer => (BufferUsage::UNIFORM, "UNIFORM"),
            ResourceKind::StructuredBufferReadOnly => (
                BufferUsage::STRUCTURED_READ_ONLY | BufferUsage::STRUCTURED_READ_WRITE,
                "STRUCTURED_READ_ONLY",
            ),
            _ => (BufferUsage::STRUCTURED_READ_WRITE, "STRUCTURED_READ_WRITE"),
        };

        if !usage.intersects(allowed) {
            return Err(UsageError::MissingUsage { required });
        }

        self.bindings.buffers.push(buffer.native_id());
        self.members.push(buffer.ref_id());
        Ok(())
    }
}

fn subresources(texture: &Texture) -> impl Iterator<Item = NativeAttachment> {
    let desc = texture.desc();
    let id = texture.native_id();

    (0..desc.mip_levels).flat_map(move |mip_level| {
        (0..desc.array_layers).map(move |array_layer| NativeAttachment {
            texture: id,
            mip_level,
            array_layer,
        })
    })
}

fn attachment(
    device: &DeviceShared,
    desc: &FramebufferAttachment<'_, Soft>,
    depth: bool,
) -> Result<Attachment, UsageError> {
    let texture = desc.texture;
    device.check(texture.core())?;

    let texture_desc = texture.desc();
    let (usage, required) = if depth {
        (TextureUsage::DEPTH_STENCIL, "DEPTH_STENCIL")
    } else {
        (TextureUsage::RENDER_TARGET, "RENDER_TARGET")
    };

    if !texture_desc.usage.contains(usage) {
        return Err(UsageError::MissingUsage { required });
    }

    if texture_desc.format.is_depth() != depth {
        return Err(UsageError::InvalidDescription(
            "attachment format does not match its slot",
        ));
    }

    if desc.mip_level >= texture_desc.mip_levels || desc.array_layer >= texture_desc.array_layers
    {
        return Err(UsageError::InvalidDescription(
            "attachment subresource out of range",
        ));
    }

    Ok(Attachment {
        texture: texture.clone(),
        mip_level: desc.mip_level,
        array_layer: desc.array_layer,
    })
}

impl hal::GraphicsDevice<Soft> for Device {
    fn create_buffer(&self, desc: &BufferDescription) -> Result<Buffer> {
        let _span = trace_span!("Device::create_buffer").entered();
        self.shared.new_buffer(desc)
    }

    fn create_texture(&self, desc: &TextureDescription) -> Result<Texture> {
        let _span = trace_span!("Device::create_texture").entered();
        self.shared.new_texture(desc)
    }

    fn create_sampler(&self, _desc: &SamplerDescription) -> Result<Sampler> {
        let native = self.shared.native.shared().create_object(NativeObject::Sampler)?;
        let core = self
            .shared
            .register(ObjectKind::Sampler, native, Vec::new(), || ())?;

        Ok(Sampler(Arc::new(SamplerInner { core })))
    }

    fn create_shader(&self, desc: &ShaderDescription) -> Result<Shader> {
        if desc.stage.bits().count_ones() != 1 {
            return Err(
                UsageError::InvalidDescription("shader must have exactly one stage").into(),
            );
        }

        if desc.entry_point.is_empty() {
            return Err(UsageError::InvalidDescription("shader without entry point").into());
        }

        let native = self
            .shared
            .native
            .shared()
            .create_object(NativeObject::Shader { stage: desc.stage })?;
        let core = self
            .shared
            .register(ObjectKind::Shader, native, Vec::new(), || ())?;

        Ok(Shader(Arc::new(ShaderInner {
            core,
            stage: desc.stage,
            entry_point: desc.entry_point.clone(),
        })))
    }

    fn create_resource_layout(&self, desc: &ResourceLayoutDescription) -> Result<ResourceLayout> {
        let mut counts = DescriptorCounts::default();
        let mut dynamic_buffers = 0;

        for element in &desc.elements {
            if element.dynamic && !element.kind.is_buffer() {
                return Err(UsageError::InvalidDescription(
                    "only buffers can take dynamic offsets",
                )
                .into());
            }

            counts.add(element.kind, element.dynamic);
            dynamic_buffers += u32::from(element.dynamic);
        }

        let native = self
            .shared
            .native
            .shared()
            .create_object(NativeObject::ResourceLayout { counts })?;
        let core = self
            .shared
            .register(ObjectKind::ResourceLayout, native, Vec::new(), || ())?;

        Ok(ResourceLayout(Arc::new(ResourceLayoutInner {
            core,
            desc: desc.clone(),
            counts,
            dynamic_buffers,
        })))
    }

    fn create_resource_set(&self, desc: &ResourceSetDescription<'_, Soft>) -> Result<ResourceSet> {
        let _span = trace_span!("Device::create_resource_set").entered();

        let shared = &self.shared;
        let layout = desc.layout;
        shared.check(layout.core())?;

        let elements = &layout.desc().elements;
        if desc.resources.len() != elements.len() {
            return Err(UsageError::InvalidDescription(
                "resource count does not match layout",
            )
            .into());
        }

        let mut builder = SetBuilder::default();
        for (element, resource) in elements.iter().zip(desc.resources) {
            builder.bind(shared, element, resource)?;
        }
        builder.members.push(layout.ref_id());

        let (allocation, pool) = shared.descriptors.allocate(&layout.0.counts)?;
        let native = match shared.native.shared().allocate_descriptor_set(
            pool,
            layout.native_id(),
            builder.bindings,
        ) {
            Ok(native) => native,
            Err(err) => {
                tracing::error!("failed to allocate descriptor set: {}", err);
                shared.descriptors.free(allocation);
                return Err(err.into());
            }
        };

        let descriptors = shared.descriptors.clone();
        let core = shared.register(
            ObjectKind::ResourceSet,
            native,
            builder.members.clone(),
            move || descriptors.free(allocation),
        )?;

        Ok(ResourceSet(Arc::new(ResourceSetInner {
            core,
            layout: layout.clone(),
            members: builder.members,
            sampled_textures: builder.sampled_textures,
            storage_textures: builder.storage_textures,
        })))
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDescription<'_, Soft>,
    ) -> Result<Pipeline> {
        let shared = &self.shared;

        if desc.shaders.is_empty() {
            return Err(UsageError::InvalidDescription("graphics pipeline without shaders").into());
        }

        let mut members = Vec::with_capacity(desc.shaders.len() + desc.resource_layouts.len());
        for shader in desc.shaders {
            shared.check(shader.core())?;
            if shader.stage().contains(ShaderStages::COMPUTE) {
                return Err(UsageError::InvalidDescription(
                    "compute shader in graphics pipeline",
                )
                .into());
            }
            members.push(shader.ref_id());
        }

        for layout in desc.resource_layouts {
            shared.check(layout.core())?;
            members.push(layout.ref_id());
        }

        let native = shared
            .native
            .shared()
            .create_object(NativeObject::Pipeline(NativePipeline {
                kind: PipelineKind::Graphics,
                set_layouts: desc.resource_layouts.iter().map(|l| l.native_id()).collect(),
            }))?;
        let core = shared.register(ObjectKind::Pipeline, native, members, || ())?;

        Ok(Pipeline(Arc::new(PipelineInner {
            core,
            kind: PipelineKind::Graphics,
            layouts: desc.resource_layouts.iter().map(|l| (*l).clone()).collect(),
            vertex_buffers: desc.vertex_layouts.len() as u32,
            color_targets: desc.color_targets,
            depth_target: desc.depth_target,
        })))
    }

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDescription<'_, Soft>,
    ) -> Result<Pipeline> {
        let shared = &self.shared;

        shared.check(desc.shader.core())?;
        if desc.shader.stage() != ShaderStages::COMPUTE {
            return Err(UsageError::InvalidDescription("compute pipeline needs a compute shader").into());
        }

        let mut members = vec![desc.shader.ref_id()];
        for layout in desc.resource_layouts {
            shared.check(layout.core())?;
            members.push(layout.ref_id());
        }

        let native = shared
            .native
            .shared()
            .create_object(NativeObject::Pipeline(NativePipeline {
                kind: PipelineKind::Compute,
                set_layouts: desc.resource_layouts.iter().map(|l| l.native_id()).collect(),
            }))?;
        let core = shared.register(ObjectKind::Pipeline, native, members, || ())?;

        Ok(Pipeline(Arc::new(PipelineInner {
            core,
            kind: PipelineKind::Compute,
            layouts: desc.resource_layouts.iter().map(|l| (*l).clone()).collect(),
            vertex_buffers: 0,
            color_targets: 0,
            depth_target: false,
        })))
    }

    fn create_framebuffer(&self, desc: &FramebufferDescription<'_, Soft>) -> Result<Framebuffer> {
        let shared = &self.shared;

        if desc.color_targets.is_empty() && desc.depth_target.is_none() {
            return Err(UsageError::InvalidDescription("framebuffer without attachments").into());
        }

        let colors = desc
            .color_targets
            .iter()
            .map(|target| attachment(shared, target, false))
            .collect::<Result<Vec<_>, _>>()?;
        let depth = desc
            .depth_target
            .as_ref()
            .map(|target| attachment(shared, target, true))
            .transpose()?;

        let mut extents = colors
            .iter()
            .chain(&depth)
            .map(|a| a.texture.desc().mip_extent(a.mip_level));
        if let Some(first) = extents.next() {
            if extents.any(|extent| extent != first) {
                return Err(UsageError::InvalidDescription("attachments differ in extent").into());
            }
        }

        let native_attachment = |a: &Attachment| NativeAttachment {
            texture: a.texture.native_id(),
            mip_level: a.mip_level,
            array_layer: a.array_layer,
        };

        let native = shared
            .native
            .shared()
            .create_object(NativeObject::Framebuffer(NativeFramebuffer {
                colors: colors.iter().map(native_attachment).collect(),
                depth: depth.as_ref().map(native_attachment),
            }))?;

        let members = colors
            .iter()
            .chain(&depth)
            .map(|a| a.texture.ref_id())
            .collect();
        let core = shared.register(ObjectKind::Framebuffer, native, members, || ())?;

        Ok(Framebuffer(Arc::new(FramebufferInner {
            core,
            colors,
            depth,
        })))
    }

    fn create_fence(&self, signaled: bool) -> Result<Fence> {
        Ok(Fence {
            native: NativeFence::new(signaled),
            device: self.shared.id,
        })
    }

    fn create_command_list(&self) -> Result<CommandList> {
        self.shared.native.shared().check_lost()?;
        Ok(CommandList::new(self.shared.clone()))
    }

    fn submit_commands(&self, list: &mut CommandList, fence: Option<&Fence>) -> Result<()> {
        let _span = trace_span!("Device::submit_commands").entered();

        if !list.belongs_to(&self.shared) {
            return Err(UsageError::ForeignResource.into());
        }

        if let Some(fence) = fence {
            self.shared.check_fence(fence)?;
        }

        if list.state() != RecordingState::Ended {
            return Err(UsageError::NotEnded.into());
        }

        self.shared.native.shared().check_lost()?;

        let submission = list.take_submission()?;
        self.shared.submit(submission, fence.map(|fence| &fence.native))
    }

    fn wait_for_idle(&self) -> Result<()> {
        let _span = trace_span!("Device::wait_for_idle").entered();

        if self.shared.native.queue().is_worker_thread() {
            return Err(DeviceError::Native("wait for idle on the queue thread".to_owned()).into());
        }

        self.shared.native.queue().wait_idle();
        self.shared.check_submitted_fences();
        Ok(())
    }

    fn wait_for_fence(&self, fence: &Fence, timeout: Option<Duration>) -> Result<bool> {
        self.wait_for_fences(&[fence], true, timeout)
    }

    fn wait_for_fences(
        &self,
        fences: &[&Fence],
        wait_all: bool,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let _span = trace_span!("Device::wait_for_fences").entered();

        for fence in fences {
            self.shared.check_fence(fence)?;
        }

        let native: Vec<&NativeFence> = fences.iter().map(|fence| &fence.native).collect();

        let worker = self.shared.native.queue().is_worker_thread();
        let signaled = if worker {
            // The queue cannot make progress while we block it.
            if wait_all {
                native.iter().all(|fence| fence.is_signaled())
            } else {
                native.iter().any(|fence| fence.is_signaled())
            }
        } else {
            self.shared
                .native
                .queue()
                .wait_fences(&native, wait_all, timeout)
        };

        self.shared.check_submitted_fences();
        Ok(signaled)
    }

    fn reset_fence(&self, fence: &Fence) -> Result<()> {
        self.shared.check_fence(fence)?;
        fence.native.reset();
        Ok(())
    }

    fn check_submitted_fences(&self) {
        self.shared.check_submitted_fences();
    }

    fn update_buffer(&self, buffer: &Buffer, offset: u64, data: &[u8]) -> Result<()> {
        let _span = trace_span!("Device::update_buffer").entered();

        self.shared.check(buffer.core())?;
        Self::check_buffer_range(buffer, offset, data.len() as u64)?;

        if data.is_empty() {
            return Ok(());
        }

        if buffer.desc().usage.is_host_visible() {
            self.shared
                .native
                .shared()
                .write_buffer(buffer.native_id(), offset, data)?;
            return Ok(());
        }

        let mut list = self.internal_list();
        list.begin()?;
        list.update_buffer(buffer, offset, data)?;
        list.end()?;
        self.submit_commands(&mut list, None)
    }

    fn update_texture(&self, texture: &Texture, region: &TextureRegion, data: &[u8]) -> Result<()> {
        let _span = trace_span!("Device::update_texture").entered();

        self.shared.check(texture.core())?;

        let desc = texture.desc();
        if !region.is_within(&desc) {
            return Err(UsageError::InvalidDescription("texture region out of bounds").into());
        }

        let size = region.byte_size(desc.format);
        if data.len() as u64 != size {
            return Err(UsageError::OutOfBounds {
                start: 0,
                end: data.len() as u64,
                size,
            }
            .into());
        }

        if size == 0 {
            return Ok(());
        }

        let native = self.shared.native.shared();
        if desc.usage.contains(TextureUsage::STAGING) {
            native.write_texture(texture.native_id(), region, data)?;
            return Ok(());
        }

        let staging = self.shared.acquire_staging_texture(desc.format, region)?;
        let src_region = TextureRegion {
            x: 0,
            y: 0,
            width: region.width,
            height: region.height,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: region.layer_count,
        };

        let src = staging.texture.clone();
        let mut list = self.internal_list();
        list.begin()?;
        list.add_staging_texture(staging);

        native.write_texture(src.native_id(), &src_region, data)?;
        list.copy_texture(&src, &src_region, texture, region)?;
        list.end()?;
        self.submit_commands(&mut list, None)
    }

    fn map_buffer(&self, buffer: &Buffer, mode: MapMode) -> Result<MappedResource> {
        self.shared.check(buffer.core())?;

        let usage = buffer.desc().usage;
        if !usage.is_host_visible() || (mode.can_read() && !usage.contains(BufferUsage::STAGING)) {
            return Err(UsageError::MapModeIncompatible { mode }.into());
        }

        {
            let mut mapped = buffer.0.mapped.lock();
            if mapped.is_some() {
                return Err(UsageError::AlreadyMapped.into());
            }
            *mapped = Some(mode);
        }

        Ok(MappedResource::buffer(
            self.shared.native.shared().clone(),
            buffer.clone(),
            mode,
        ))
    }

    fn map_texture(
        &self,
        texture: &Texture,
        mip_level: u32,
        array_layer: u32,
        mode: MapMode,
    ) -> Result<MappedResource> {
        self.shared.check(texture.core())?;

        if !texture.desc().usage.contains(TextureUsage::STAGING) {
            return Err(UsageError::MapModeIncompatible { mode }.into());
        }

        if texture.state(mip_level, array_layer).is_none() {
            return Err(UsageError::InvalidDescription("subresource out of range").into());
        }

        {
            let mut mapped = texture.0.mapped.lock();
            if mapped.contains_key(&(mip_level, array_layer)) {
                return Err(UsageError::AlreadyMapped.into());
            }
            mapped.insert((mip_level, array_layer), mode);
        }

        Ok(MappedResource::texture(
            self.shared.native.shared().clone(),
            texture.clone(),
            mip_level,
            array_layer,
            mode,
        ))
    }

    fn unmap_buffer(&self, buffer: &Buffer) -> Result<()> {
        self.shared.check(buffer.core())?;

        match buffer.0.mapped.lock().take() {
            Some(_) => Ok(()),
            None => Err(UsageError::NotMapped.into()),
        }
    }

    fn unmap_texture(&self, texture: &Texture, mip_level: u32, array_layer: u32) -> Result<()> {
        self.shared.check(texture.core())?;

        match texture.0.mapped.lock().remove(&(mip_level, array_layer)) {
            Some(_) => Ok(()),
            None => Err(UsageError::NotMapped.into()),
        }
    }
}

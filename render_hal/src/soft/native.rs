//! The native interface of the software device.
//!
//! This plays the role a native graphics API plays for a hardware backend:
//! objects are created and destroyed through explicit calls, commands are
//! recorded into command buffers and executed on a queue in submission order.
//! Every recorded call is counted in [`NativeStats`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use slotmap::SlotMap;
use smallvec::SmallVec;

use crate::config::EncoderModel;
use crate::error::DeviceError;
use crate::tracking::descriptors::DescriptorCounts;
use crate::tracking::pass::{LoadOp, PassBegin};
use crate::tracking::subresource::{SubresourceRange, TextureState};
use crate::types::{
    IndexFormat, PipelineKind, ShaderStages, TextureDescription, TextureRegion, Viewport,
};

use super::queue::NativeQueue;

slotmap::new_key_type! {
    /// The handle of a native object.
    pub struct NativeId;
}

const MAX_VALIDATION_MESSAGES: usize = 64;

#[derive(Debug)]
pub(crate) struct NativeBuffer {
    pub size: u64,
    pub memory: Mutex<Vec<u8>>,
}

#[derive(Debug)]
pub(crate) struct NativeTextureData {
    pub desc: TextureDescription,
    /// Hardware layout of every subresource, indexed by `mip * layers + layer`.
    pub layouts: Vec<TextureState>,
    pub subresources: Vec<Vec<u8>>,
}

impl NativeTextureData {
    fn new(desc: TextureDescription, initial: TextureState) -> Self {
        let mut subresources = Vec::with_capacity(desc.subresource_count() as usize);
        for mip in 0..desc.mip_levels {
            for _ in 0..desc.array_layers {
                subresources.push(vec![0; desc.subresource_size(mip) as usize]);
            }
        }

        Self {
            desc,
            layouts: vec![initial; desc.subresource_count() as usize],
            subresources,
        }
    }

    #[inline]
    pub fn index(&self, mip: u32, layer: u32) -> usize {
        (mip * self.desc.array_layers + layer) as usize
    }

    /// Reads the rows of `region` at `layer` into a tightly packed vector.
    pub fn read_region(&self, region: &TextureRegion, layer: u32) -> Vec<u8> {
        let texel = self.desc.format.bytes_per_texel() as usize;
        let pitch = self.desc.row_pitch(region.mip_level) as usize;
        let row = region.width as usize * texel;
        let memory = &self.subresources[self.index(region.mip_level, layer)];

        let mut out = Vec::with_capacity(row * region.height as usize);
        for y in region.y..region.y + region.height {
            let start = y as usize * pitch + region.x as usize * texel;
            out.extend_from_slice(&memory[start..start + row]);
        }
        out
    }

    /// Writes tightly packed rows into `region` at `layer`.
    pub fn write_region(&mut self, region: &TextureRegion, layer: u32, data: &[u8]) {
        let texel = self.desc.format.bytes_per_texel() as usize;
        let pitch = self.desc.row_pitch(region.mip_level) as usize;
        let row = region.width as usize * texel;
        if row == 0 {
            return;
        }

        let index = self.index(region.mip_level, layer);
        let memory = &mut self.subresources[index];

        for (i, src) in data.chunks_exact(row).take(region.height as usize).enumerate() {
            let y = region.y as usize + i;
            let start = y * pitch + region.x as usize * texel;
            memory[start..start + row].copy_from_slice(src);
        }
    }

    /// Fills a whole subresource with a repeated texel value.
    pub fn fill(&mut self, mip: u32, layer: u32, texel: &[u8]) {
        let index = self.index(mip, layer);
        for chunk in self.subresources[index].chunks_exact_mut(texel.len()) {
            chunk.copy_from_slice(texel);
        }
    }
}

#[derive(Debug)]
pub(crate) struct NativeTexture {
    /// Bytes reserved at creation. Staging textures can be reshaped within it.
    pub allocation: u64,
    pub data: Mutex<NativeTextureData>,
}

#[derive(Debug)]
pub(crate) struct NativePipeline {
    pub kind: PipelineKind,
    pub set_layouts: Vec<NativeId>,
}

#[derive(Debug)]
pub(crate) struct NativeDescriptorPool {
    pub remaining: DescriptorCounts,
    pub remaining_sets: u32,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct NativeSetBindings {
    pub buffers: Vec<NativeId>,
    pub sampled_textures: Vec<NativeAttachment>,
    pub storage_textures: Vec<NativeAttachment>,
    pub samplers: Vec<NativeId>,
}

#[derive(Debug)]
pub(crate) struct NativeDescriptorSet {
    pub pool: NativeId,
    pub layout: NativeId,
    pub counts: DescriptorCounts,
    pub bindings: NativeSetBindings,
}

/// A single subresource used as an attachment or shader resource.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct NativeAttachment {
    pub texture: NativeId,
    pub mip_level: u32,
    pub array_layer: u32,
}

#[derive(Debug)]
pub(crate) struct NativeFramebuffer {
    pub colors: Vec<NativeAttachment>,
    pub depth: Option<NativeAttachment>,
}

#[derive(Debug)]
pub(crate) enum NativeObject {
    Buffer(NativeBuffer),
    Texture(NativeTexture),
    Sampler,
    Shader { stage: ShaderStages },
    ResourceLayout { counts: DescriptorCounts },
    Pipeline(NativePipeline),
    DescriptorPool(Mutex<NativeDescriptorPool>),
    DescriptorSet(NativeDescriptorSet),
    Framebuffer(NativeFramebuffer),
}

impl NativeObject {
    fn memory_size(&self) -> u64 {
        match self {
            Self::Buffer(buffer) => buffer.size,
            Self::Texture(texture) => texture.allocation,
            _ => 0,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum NativeClear {
    Color { index: u32, color: [f32; 4] },
    DepthStencil { depth: f32, stencil: u8 },
}

/// A command recorded into a [`NativeCommandBuffer`].
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum NativeCommand {
    PipelineBarrier {
        texture: NativeId,
        range: SubresourceRange,
        old: TextureState,
        new: TextureState,
    },
    BeginRenderPass {
        framebuffer: NativeId,
        color: SmallVec<[LoadOp<[f32; 4]>; 4]>,
        depth: Option<LoadOp<(f32, u8)>>,
    },
    EndRenderPass,
    BeginBlitEncoder,
    BeginComputeEncoder,
    EndEncoder,
    ClearAttachment(NativeClear),
    BindPipeline {
        kind: PipelineKind,
        pipeline: NativeId,
    },
    BindResourceSets {
        kind: PipelineKind,
        first_slot: u32,
        sets: SmallVec<[NativeId; 4]>,
        dynamic_offsets: SmallVec<[u32; 4]>,
    },
    BindVertexBuffers {
        first_slot: u32,
        buffers: SmallVec<[(NativeId, u64); 4]>,
    },
    BindIndexBuffer {
        buffer: NativeId,
        format: IndexFormat,
        offset: u64,
    },
    SetViewport {
        index: u32,
        viewport: Viewport,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    DrawIndirect {
        buffer: NativeId,
        offset: u64,
        draw_count: u32,
        stride: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    DispatchIndirect {
        buffer: NativeId,
        offset: u64,
    },
    CopyBuffer {
        src: NativeId,
        src_offset: u64,
        dst: NativeId,
        dst_offset: u64,
        size: u64,
    },
    CopyTexture {
        src: NativeId,
        src_region: TextureRegion,
        dst: NativeId,
        dst_region: TextureRegion,
    },
    PushDebugGroup(String),
    PopDebugGroup,
    InsertDebugMarker(String),
}

impl NativeCommand {
    pub(crate) fn begin_render_pass(framebuffer: NativeId, begin: &PassBegin) -> Self {
        Self::BeginRenderPass {
            framebuffer,
            color: begin.color.clone(),
            depth: begin.depth,
        }
    }
}

#[derive(Debug)]
pub(crate) struct CommandBufferData {
    pub id: u64,
    pub commands: Vec<NativeCommand>,
    pub recording: bool,
}

/// A native command buffer.
///
/// Clones refer to the same buffer. The queue holds a clone while the buffer
/// executes.
#[derive(Clone, Debug)]
pub(crate) struct NativeCommandBuffer {
    data: Arc<Mutex<CommandBufferData>>,
    shared: Arc<NativeShared>,
}

impl NativeCommandBuffer {
    /// Resets the buffer and starts recording.
    pub fn begin(&self) {
        let mut data = self.data.lock();
        data.commands.clear();
        data.recording = true;
    }

    pub fn end(&self) {
        self.data.lock().recording = false;
    }

    pub fn record(&self, command: NativeCommand) {
        self.shared.stats.record(&command);

        let mut data = self.data.lock();
        debug_assert!(data.recording, "command buffer is not recording");
        data.commands.push(command);
    }

    pub fn id(&self) -> u64 {
        self.data.lock().id
    }

    pub fn len(&self) -> usize {
        self.data.lock().commands.len()
    }

    pub fn data(&self) -> &Mutex<CommandBufferData> {
        &self.data
    }
}

/// Counters of native calls and objects.
#[derive(Debug, Default)]
pub(crate) struct NativeStats {
    pipeline_binds: AtomicU64,
    resource_set_bind_calls: AtomicU64,
    resource_sets_bound: AtomicU64,
    vertex_buffer_bind_calls: AtomicU64,
    index_buffer_binds: AtomicU64,
    render_passes: AtomicU64,
    encoders: AtomicU64,
    in_pass_clears: AtomicU64,
    barriers: AtomicU64,
    draws: AtomicU64,
    dispatches: AtomicU64,
    copies: AtomicU64,
    viewports: AtomicU64,
    debug_markers: AtomicU64,
    command_buffers_allocated: AtomicU64,
    submissions: AtomicU64,
    objects_created: AtomicU64,
    objects_destroyed: AtomicU64,
    passes_per_framebuffer: Mutex<HashMap<NativeId, u64>>,
    binds_per_slot: Mutex<HashMap<(PipelineKind, u32), u64>>,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl NativeStats {
    fn record(&self, command: &NativeCommand) {
        match command {
            NativeCommand::PipelineBarrier { .. } => bump(&self.barriers),
            NativeCommand::BeginRenderPass { framebuffer, .. } => {
                bump(&self.render_passes);
                *self
                    .passes_per_framebuffer
                    .lock()
                    .entry(*framebuffer)
                    .or_default() += 1;
            }
            NativeCommand::BeginBlitEncoder | NativeCommand::BeginComputeEncoder => {
                bump(&self.encoders)
            }
            NativeCommand::EndRenderPass | NativeCommand::EndEncoder => (),
            NativeCommand::ClearAttachment(_) => bump(&self.in_pass_clears),
            NativeCommand::BindPipeline { .. } => bump(&self.pipeline_binds),
            NativeCommand::BindResourceSets {
                kind,
                first_slot,
                sets,
                ..
            } => {
                bump(&self.resource_set_bind_calls);
                self.resource_sets_bound
                    .fetch_add(sets.len() as u64, Ordering::Relaxed);

                let mut per_slot = self.binds_per_slot.lock();
                for slot in *first_slot..*first_slot + sets.len() as u32 {
                    *per_slot.entry((*kind, slot)).or_default() += 1;
                }
            }
            NativeCommand::BindVertexBuffers { .. } => bump(&self.vertex_buffer_bind_calls),
            NativeCommand::BindIndexBuffer { .. } => bump(&self.index_buffer_binds),
            NativeCommand::SetViewport { .. } => bump(&self.viewports),
            NativeCommand::Draw { .. }
            | NativeCommand::DrawIndexed { .. }
            | NativeCommand::DrawIndirect { .. } => bump(&self.draws),
            NativeCommand::Dispatch { .. } | NativeCommand::DispatchIndirect { .. } => {
                bump(&self.dispatches)
            }
            NativeCommand::CopyBuffer { .. } | NativeCommand::CopyTexture { .. } => {
                bump(&self.copies)
            }
            NativeCommand::PushDebugGroup(_)
            | NativeCommand::PopDebugGroup
            | NativeCommand::InsertDebugMarker(_) => bump(&self.debug_markers),
        }
    }

    fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        StatsSnapshot {
            pipeline_binds: load(&self.pipeline_binds),
            resource_set_bind_calls: load(&self.resource_set_bind_calls),
            resource_sets_bound: load(&self.resource_sets_bound),
            vertex_buffer_bind_calls: load(&self.vertex_buffer_bind_calls),
            index_buffer_binds: load(&self.index_buffer_binds),
            render_passes: load(&self.render_passes),
            encoders: load(&self.encoders),
            in_pass_clears: load(&self.in_pass_clears),
            barriers: load(&self.barriers),
            draws: load(&self.draws),
            dispatches: load(&self.dispatches),
            copies: load(&self.copies),
            viewports: load(&self.viewports),
            debug_markers: load(&self.debug_markers),
            command_buffers_allocated: load(&self.command_buffers_allocated),
            submissions: load(&self.submissions),
            objects_created: load(&self.objects_created),
            objects_destroyed: load(&self.objects_destroyed),
        }
    }
}

/// A copy of the native call counters at one point in time.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub pipeline_binds: u64,
    pub resource_set_bind_calls: u64,
    pub resource_sets_bound: u64,
    pub vertex_buffer_bind_calls: u64,
    pub index_buffer_binds: u64,
    pub render_passes: u64,
    pub encoders: u64,
    pub in_pass_clears: u64,
    pub barriers: u64,
    pub draws: u64,
    pub dispatches: u64,
    pub copies: u64,
    pub viewports: u64,
    pub debug_markers: u64,
    pub command_buffers_allocated: u64,
    pub submissions: u64,
    pub objects_created: u64,
    pub objects_destroyed: u64,
}

/// Native state shared between the device and the queue worker.
#[derive(Debug)]
pub(crate) struct NativeShared {
    objects: RwLock<SlotMap<NativeId, Arc<NativeObject>>>,
    pub stats: NativeStats,
    pub model: EncoderModel,
    memory_budget: Option<u64>,
    memory_used: AtomicU64,
    lost: AtomicBool,
    validation_errors: AtomicU64,
    messages: Mutex<Vec<String>>,
    next_command_buffer: AtomicU64,
}

impl NativeShared {
    pub fn get(&self, id: NativeId) -> Option<Arc<NativeObject>> {
        self.objects.read().get(id).cloned()
    }

    pub fn is_alive(&self, id: NativeId) -> bool {
        self.objects.read().contains_key(id)
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Reports a violation of the native API rules.
    pub fn report(&self, message: String) {
        tracing::error!("native validation: {}", message);
        self.validation_errors.fetch_add(1, Ordering::Relaxed);

        let mut messages = self.messages.lock();
        if messages.len() < MAX_VALIDATION_MESSAGES {
            messages.push(message);
        }
    }

    pub(crate) fn check_lost(&self) -> Result<(), DeviceError> {
        if self.is_lost() {
            tracing::error!("native call on lost device");
            return Err(DeviceError::Lost);
        }

        Ok(())
    }

    fn allocate_memory(&self, size: u64) -> Result<(), DeviceError> {
        let Some(budget) = self.memory_budget else {
            self.memory_used.fetch_add(size, Ordering::Relaxed);
            return Ok(());
        };

        self.memory_used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|total| *total <= budget)
            })
            .map(|_| ())
            .map_err(|used| {
                let available = budget.saturating_sub(used);
                tracing::error!(
                    "native allocation of {} bytes exceeds budget ({} bytes available)",
                    size,
                    available
                );
                DeviceError::OutOfMemory {
                    requested: size,
                    available,
                }
            })
    }

    fn insert(&self, object: NativeObject) -> Result<NativeId, DeviceError> {
        self.check_lost()?;
        self.allocate_memory(object.memory_size())?;

        bump(&self.stats.objects_created);
        Ok(self.objects.write().insert(Arc::new(object)))
    }

    pub(crate) fn destroy(&self, id: NativeId) -> bool {
        let Some(object) = self.objects.write().remove(id) else {
            self.report(format!("destroy of unknown object {:?}", id));
            return false;
        };

        if let NativeObject::DescriptorSet(set) = &*object {
            if let Some(pool) = self.get(set.pool) {
                if let NativeObject::DescriptorPool(pool) = &*pool {
                    let mut pool = pool.lock();
                    pool.remaining.credit(&set.counts);
                    pool.remaining_sets += 1;
                }
            }
        }

        self.memory_used
            .fetch_sub(object.memory_size(), Ordering::Relaxed);
        bump(&self.stats.objects_destroyed);
        true
    }

    pub(crate) fn create_buffer(&self, size: u64) -> Result<NativeId, DeviceError> {
        self.insert(NativeObject::Buffer(NativeBuffer {
            size,
            memory: Mutex::new(vec![0; size as usize]),
        }))
    }

    pub(crate) fn create_texture(
        &self,
        desc: TextureDescription,
        initial: TextureState,
    ) -> Result<NativeId, DeviceError> {
        self.insert(NativeObject::Texture(NativeTexture {
            allocation: desc.total_size(),
            data: Mutex::new(NativeTextureData::new(desc, initial)),
        }))
    }

    pub(crate) fn create_object(&self, object: NativeObject) -> Result<NativeId, DeviceError> {
        debug_assert_eq!(object.memory_size(), 0);
        self.insert(object)
    }

    pub(crate) fn create_descriptor_pool(
        &self,
        max_sets: u32,
        capacity: &DescriptorCounts,
    ) -> Result<NativeId, DeviceError> {
        self.create_object(NativeObject::DescriptorPool(Mutex::new(
            NativeDescriptorPool {
                remaining: *capacity,
                remaining_sets: max_sets,
            },
        )))
    }

    /// Allocates a descriptor set from `pool`.
    pub(crate) fn allocate_descriptor_set(
        &self,
        pool: NativeId,
        layout: NativeId,
        bindings: NativeSetBindings,
    ) -> Result<NativeId, DeviceError> {
        self.check_lost()?;

        let Some(layout_object) = self.get(layout) else {
            return Err(DeviceError::Native(format!("unknown layout {:?}", layout)));
        };
        let NativeObject::ResourceLayout { counts } = &*layout_object else {
            return Err(DeviceError::Native(format!("{:?} is not a layout", layout)));
        };
        let counts = *counts;

        let Some(pool_object) = self.get(pool) else {
            return Err(DeviceError::Native(format!("unknown pool {:?}", pool)));
        };
        let NativeObject::DescriptorPool(pool_state) = &*pool_object else {
            return Err(DeviceError::Native(format!("{:?} is not a pool", pool)));
        };

        {
            let mut pool_state = pool_state.lock();
            if pool_state.remaining_sets == 0 || !counts.fits_in(&pool_state.remaining) {
                return Err(DeviceError::Native("out of pool memory".to_owned()));
            }

            pool_state.remaining.debit(&counts);
            pool_state.remaining_sets -= 1;
        }

        self.insert(NativeObject::DescriptorSet(NativeDescriptorSet {
            pool,
            layout,
            counts,
            bindings,
        }))
    }

    pub(crate) fn allocate_command_buffer(
        self: &Arc<Self>,
    ) -> Result<NativeCommandBuffer, DeviceError> {
        self.check_lost()?;

        let id = self.next_command_buffer.fetch_add(1, Ordering::Relaxed);
        bump(&self.stats.command_buffers_allocated);
        tracing::debug!("allocated native command buffer {}", id);

        Ok(NativeCommandBuffer {
            data: Arc::new(Mutex::new(CommandBufferData {
                id,
                commands: Vec::new(),
                recording: false,
            })),
            shared: Arc::clone(self),
        })
    }

    pub(crate) fn count_submission(&self) {
        bump(&self.stats.submissions);
    }

    /// Copies `data` into host-visible buffer memory.
    pub(crate) fn write_buffer(
        &self,
        id: NativeId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        self.with_buffer(id, |memory| {
            let start = offset as usize;
            memory[start..start + data.len()].copy_from_slice(data);
        })
    }

    pub(crate) fn read_buffer(
        &self,
        id: NativeId,
        offset: u64,
        out: &mut [u8],
    ) -> Result<(), DeviceError> {
        self.with_buffer(id, |memory| {
            let start = offset as usize;
            out.copy_from_slice(&memory[start..start + out.len()]);
        })
    }

    pub(crate) fn with_buffer<F>(&self, id: NativeId, f: F) -> Result<(), DeviceError>
    where
        F: FnOnce(&mut Vec<u8>),
    {
        self.check_lost()?;

        let object = self
            .get(id)
            .ok_or_else(|| DeviceError::Native(format!("unknown buffer {:?}", id)))?;
        let NativeObject::Buffer(buffer) = &*object else {
            return Err(DeviceError::Native(format!("{:?} is not a buffer", id)));
        };

        f(&mut buffer.memory.lock());
        Ok(())
    }

    /// Calls `f` with the host memory of one subresource.
    pub(crate) fn with_subresource<F, T>(
        &self,
        id: NativeId,
        mip_level: u32,
        array_layer: u32,
        f: F,
    ) -> Result<T, DeviceError>
    where
        F: FnOnce(&mut Vec<u8>, &TextureDescription) -> T,
    {
        self.check_lost()?;

        let object = self
            .get(id)
            .ok_or_else(|| DeviceError::Native(format!("unknown texture {:?}", id)))?;
        let NativeObject::Texture(texture) = &*object else {
            return Err(DeviceError::Native(format!("{:?} is not a texture", id)));
        };

        let mut data = texture.data.lock();
        let desc = data.desc;
        let index = data.index(mip_level, array_layer);
        Ok(f(&mut data.subresources[index], &desc))
    }

    /// Writes tightly packed rows into `region`, one layer after another.
    pub(crate) fn write_texture(
        &self,
        id: NativeId,
        region: &TextureRegion,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        self.check_lost()?;

        let object = self
            .get(id)
            .ok_or_else(|| DeviceError::Native(format!("unknown texture {:?}", id)))?;
        let NativeObject::Texture(texture) = &*object else {
            return Err(DeviceError::Native(format!("{:?} is not a texture", id)));
        };

        let mut texels = texture.data.lock();
        let layer_size = region.byte_size(texels.desc.format) / u64::from(region.layer_count.max(1));
        if layer_size == 0 {
            return Ok(());
        }

        for (index, layer) in data
            .chunks(layer_size as usize)
            .take(region.layer_count as usize)
            .enumerate()
        {
            texels.write_region(region, region.base_array_layer + index as u32, layer);
        }

        Ok(())
    }

    /// Replaces the shape of a staging texture, keeping its memory allocation.
    pub(crate) fn reshape_texture(
        &self,
        id: NativeId,
        desc: TextureDescription,
        layout: TextureState,
    ) -> Result<(), DeviceError> {
        let object = self
            .get(id)
            .ok_or_else(|| DeviceError::Native(format!("unknown texture {:?}", id)))?;
        let NativeObject::Texture(texture) = &*object else {
            return Err(DeviceError::Native(format!("{:?} is not a texture", id)));
        };

        if desc.total_size() > texture.allocation {
            return Err(DeviceError::Native(
                "staging texture reshaped beyond its allocation".to_owned(),
            ));
        }

        *texture.data.lock() = NativeTextureData::new(desc, layout);
        Ok(())
    }
}

/// The software device.
#[derive(Debug)]
pub struct NativeDevice {
    shared: Arc<NativeShared>,
    queue: NativeQueue,
}

impl NativeDevice {
    pub(crate) fn new(model: EncoderModel, memory_budget: Option<u64>) -> Self {
        let shared = Arc::new(NativeShared {
            objects: RwLock::new(SlotMap::with_key()),
            stats: NativeStats::default(),
            model,
            memory_budget,
            memory_used: AtomicU64::new(0),
            lost: AtomicBool::new(false),
            validation_errors: AtomicU64::new(0),
            messages: Mutex::new(Vec::new()),
            next_command_buffer: AtomicU64::new(0),
        });

        let queue = NativeQueue::new(shared.clone());

        Self { shared, queue }
    }

    pub(crate) fn shared(&self) -> &Arc<NativeShared> {
        &self.shared
    }

    pub(crate) fn queue(&self) -> &NativeQueue {
        &self.queue
    }

    /// Returns the native call counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Returns how many render passes were recorded targeting `framebuffer`.
    pub fn render_passes_for(&self, framebuffer: NativeId) -> u64 {
        self.shared
            .stats
            .passes_per_framebuffer
            .lock()
            .get(&framebuffer)
            .copied()
            .unwrap_or(0)
    }

    /// Returns how many times a resource set was bound to `slot`.
    pub fn resource_set_binds_for(&self, kind: PipelineKind, slot: u32) -> u64 {
        self.shared
            .stats
            .binds_per_slot
            .lock()
            .get(&(kind, slot))
            .copied()
            .unwrap_or(0)
    }

    pub fn is_alive(&self, id: NativeId) -> bool {
        self.shared.is_alive(id)
    }

    pub fn live_objects(&self) -> usize {
        self.shared.objects.read().len()
    }

    /// Returns the hardware layout of a subresource as seen by executed work.
    pub fn texture_layout(
        &self,
        id: NativeId,
        mip_level: u32,
        array_layer: u32,
    ) -> Option<TextureState> {
        let object = self.shared.get(id)?;
        let NativeObject::Texture(texture) = &*object else {
            return None;
        };

        let data = texture.data.lock();
        data.layouts.get(data.index(mip_level, array_layer)).copied()
    }

    pub fn memory_used(&self) -> u64 {
        self.shared.memory_used.load(Ordering::Relaxed)
    }

    /// Returns the number of native rule violations observed by the executor.
    pub fn validation_errors(&self) -> u64 {
        self.shared.validation_errors.load(Ordering::Relaxed)
    }

    pub fn validation_messages(&self) -> Vec<String> {
        self.shared.messages.lock().clone()
    }

    /// Marks the device as lost. Every following native call fails.
    pub fn inject_device_loss(&self) {
        tracing::error!("device lost");
        self.shared.lost.store(true, Ordering::Release);
    }

    pub fn is_lost(&self) -> bool {
        self.shared.is_lost()
    }

    /// Stops the queue before its next submission. Waits for idle block
    /// until [`release_queue`] is called.
    ///
    /// [`release_queue`]: Self::release_queue
    pub fn hold_queue(&self) {
        self.queue.hold();
    }

    /// Lets a held queue run `submissions` more native submissions. A
    /// submission with a caller fence takes two.
    pub fn step_queue(&self, submissions: usize) {
        self.queue.step(submissions);
    }

    pub fn release_queue(&self) {
        self.queue.release();
    }

    pub fn encoder_model(&self) -> EncoderModel {
        self.shared.model
    }
}

use std::fmt::{self, Debug, Formatter};
use std::ops::Range;
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use hashbrown::HashMap;
use render_tracing::trace_span;
use smallvec::SmallVec;

use crate::config::EncoderModel;
use crate::error::{Result, UsageError};
use crate::hal;
use crate::tracking::bindings::{BindingSlot, SlotCache};
use crate::tracking::pass::{EncoderState, InPassClear, PassState};
use crate::tracking::ref_count::RefId;
use crate::tracking::submission::SubmissionInfo;
use crate::tracking::subresource::{SubresourceRange, SubresourceTracker, TextureState};
use crate::types::{BufferUsage, IndexFormat, PipelineKind, TextureRegion, Viewport};

use super::device::DeviceShared;
use super::native::{NativeClear, NativeCommand, NativeCommandBuffer};
use super::resources::{
    Buffer, Framebuffer, Pipeline, ResourceCore, ResourceSet, StagingBuffer, StagingTexture,
    Texture,
};
use super::Soft;

pub(crate) type Info = SubmissionInfo<StagingBuffer, StagingTexture>;

/// A texture touched by the current recording, with its states from before
/// the recording started.
struct Touched {
    texture: Texture,
    before: SubresourceTracker<TextureState>,
}

/// Native command buffers and submission bags waiting for reuse.
///
/// Filled from the completion path, drained by [`CommandList::begin`].
#[derive(Default)]
pub(crate) struct CommandListPool {
    free: SegQueue<NativeCommandBuffer>,
    infos: SegQueue<Info>,
}

impl CommandListPool {
    pub fn recycle(&self, command_buffer: NativeCommandBuffer, info: Info) {
        debug_assert!(info.is_empty());
        self.free.push(command_buffer);
        self.infos.push(info);
    }

    pub fn pop(&self) -> Option<NativeCommandBuffer> {
        self.free.pop()
    }

    pub fn pop_info(&self) -> Info {
        self.infos.pop().unwrap_or_default()
    }

    /// Returns the number of command buffers waiting for reuse.
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

/// The state a command list is in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RecordingState {
    /// Not recording. `begin` must be called.
    Initial,
    Recording,
    /// Ended and waiting for submission.
    Ended,
}

/// A resource set bound to a slot, with the dynamic offsets it was bound with.
#[derive(Clone, Debug, PartialEq)]
struct BoundSet {
    set: ResourceSet,
    offsets: SmallVec<[u32; 4]>,
}

/// A ready submission detached from its command list.
pub(crate) struct Submission {
    pub command_buffer: NativeCommandBuffer,
    pub info: Info,
    pub pool: Arc<CommandListPool>,
}

/// Records commands for submission with
/// [`GraphicsDevice::submit_commands`](hal::GraphicsDevice::submit_commands).
pub struct CommandList {
    device: Arc<DeviceShared>,
    pool: Arc<CommandListPool>,
    state: RecordingState,
    command_buffer: Option<NativeCommandBuffer>,
    info: Info,
    pass: PassState,
    framebuffer: Option<Framebuffer>,
    graphics_pipeline: BindingSlot<Pipeline>,
    compute_pipeline: BindingSlot<Pipeline>,
    graphics_sets: SlotCache<BoundSet>,
    compute_sets: SlotCache<BoundSet>,
    vertex_buffers: SlotCache<(Buffer, u64)>,
    index_buffer: BindingSlot<(Buffer, IndexFormat, u64)>,
    viewports: SlotCache<Viewport>,
    /// Textures whose state may have left the rest state during this recording.
    touched: HashMap<RefId, Touched>,
    debug_depth: u32,
}

impl CommandList {
    pub(crate) fn new(device: Arc<DeviceShared>) -> Self {
        Self::with_pool(device, Arc::default())
    }

    /// Creates a list that recycles its command buffers through `pool`.
    pub(crate) fn with_pool(device: Arc<DeviceShared>, pool: Arc<CommandListPool>) -> Self {
        Self {
            device,
            pool,
            state: RecordingState::Initial,
            command_buffer: None,
            info: Info::new(),
            pass: PassState::new(),
            framebuffer: None,
            graphics_pipeline: BindingSlot::new(),
            compute_pipeline: BindingSlot::new(),
            graphics_sets: SlotCache::new(),
            compute_sets: SlotCache::new(),
            vertex_buffers: SlotCache::new(),
            index_buffer: BindingSlot::new(),
            viewports: SlotCache::new(),
            touched: HashMap::new(),
            debug_depth: 0,
        }
    }

    #[inline]
    pub fn state(&self) -> RecordingState {
        self.state
    }

    #[inline]
    pub fn encoder_state(&self) -> EncoderState {
        self.pass.state()
    }

    /// Returns the number of objects the current recording holds references to.
    pub fn captured(&self) -> usize {
        self.info.len()
    }

    /// Returns the number of native command buffers waiting for reuse.
    pub fn free_command_buffers(&self) -> usize {
        self.pool.available()
    }

    fn is_split(&self) -> bool {
        self.device.config.encoder_model == EncoderModel::Split
    }

    fn validation(&self) -> bool {
        self.device.config.validation
    }

    fn check_recording(&self) -> Result<(), UsageError> {
        match self.state {
            RecordingState::Recording => Ok(()),
            _ => Err(UsageError::NotRecording),
        }
    }

    fn check(&self, core: &ResourceCore) -> Result<(), UsageError> {
        core.check(self.device.id)
    }

    /// Captures a reference for the lifetime of the submission.
    fn capture(&mut self, core: &ResourceCore) {
        self.info.add_ref(&self.device.registry, core.ref_id());
    }

    fn record(&self, command: NativeCommand) {
        match &self.command_buffer {
            Some(command_buffer) => command_buffer.record(command),
            None => tracing::error!("recording without command buffer"),
        }
    }

    fn reset_bindings(&mut self) {
        self.pass.reset();
        self.framebuffer = None;
        self.graphics_pipeline.clear();
        self.compute_pipeline.clear();
        self.graphics_sets.clear();
        self.compute_sets.clear();
        self.vertex_buffers.clear();
        self.index_buffer.clear();
        self.viewports.clear();
        self.touched.clear();
        self.debug_depth = 0;
    }

    /// Forgets every native binding. Used when the split model opens a new
    /// encoder, which starts without bindings.
    fn invalidate_bindings(&mut self) {
        self.graphics_pipeline.invalidate();
        self.compute_pipeline.invalidate();
        self.graphics_sets.invalidate();
        self.compute_sets.invalidate();
        self.vertex_buffers.invalidate();
        self.index_buffer.invalidate();
        self.viewports.invalidate();
    }

    /// Transitions `range` of `texture` to `new`. The subresources must share
    /// one state.
    fn transition(
        &mut self,
        texture: &Texture,
        range: &SubresourceRange,
        new: TextureState,
    ) -> Result<(), UsageError> {
        let _span = trace_span!("CommandList::transition").entered();

        self.touch(texture);

        let transition = texture
            .states()
            .lock()
            .transition_to(range, new, self.validation())
            .map_err(|_| UsageError::MixedSubresourceStates)?;

        if let Some(transition) = transition {
            self.record(NativeCommand::PipelineBarrier {
                texture: texture.native_id(),
                range: transition.range,
                old: transition.old,
                new: transition.new,
            });
        }

        Ok(())
    }

    /// Forces every subresource in `range` to `new`, whatever state they are in.
    fn force_state(&mut self, texture: &Texture, range: &SubresourceRange, new: TextureState) {
        self.touch(texture);

        let transitions = texture.states().lock().transition_each(range, new);

        for transition in transitions {
            self.record(NativeCommand::PipelineBarrier {
                texture: texture.native_id(),
                range: transition.range,
                old: transition.old,
                new: transition.new,
            });
        }
    }

    /// Must run before the first transition of `texture` in this recording.
    fn touch(&mut self, texture: &Texture) {
        if !self.touched.contains_key(&texture.ref_id()) {
            self.capture(texture.core());

            let before = texture.states().lock().clone();
            self.touched.insert(
                texture.ref_id(),
                Touched {
                    texture: texture.clone(),
                    before,
                },
            );
        }
    }

    /// Rolls the trackers of every touched texture back to their states from
    /// before the recording. No barrier of an unsubmitted recording ever
    /// reaches the device.
    fn restore_touched(&mut self) {
        for (_, touched) in self.touched.drain() {
            *touched.texture.states().lock() = touched.before;
        }
    }

    /// Closes any open pass or encoder.
    fn close_encoder(&mut self) {
        match self.pass.state() {
            EncoderState::Idle => (),
            EncoderState::Active => {
                self.pass.end_render();
                self.record(NativeCommand::EndRenderPass);
            }
            EncoderState::TransferActive | EncoderState::ComputeActive => {
                self.pass.end_encoder();
                self.record(NativeCommand::EndEncoder);
            }
        }
    }

    /// Opens a render pass on the bound framebuffer.
    fn begin_render_pass(&mut self) -> Result<(), UsageError> {
        let _span = trace_span!("CommandList::begin_render_pass").entered();

        let Some(framebuffer) = self.framebuffer.clone() else {
            return Err(UsageError::NoFramebuffer);
        };

        self.close_encoder();

        for attachment in framebuffer.attachments() {
            let state = if attachment.texture.desc().format.is_depth() {
                TextureState::DepthStencilAttachment
            } else {
                TextureState::ColorAttachment
            };

            self.transition(
                &attachment.texture,
                &SubresourceRange::single(attachment.mip_level, attachment.array_layer),
                state,
            )?;
        }

        let begin = self.pass.begin_render();
        self.record(NativeCommand::begin_render_pass(
            framebuffer.native_id(),
            &begin,
        ));

        for clear in begin.clears {
            self.record(NativeCommand::ClearAttachment(in_pass_clear(clear)));
        }

        if self.is_split() {
            self.invalidate_bindings();
        }

        Ok(())
    }

    /// Opens and closes a pass on a framebuffer that needs one, so that its
    /// queued clears are executed.
    fn flush_framebuffer(&mut self) -> Result<(), UsageError> {
        if !self.pass.needs_flush() {
            return Ok(());
        }

        let _span = trace_span!("CommandList::flush_framebuffer").entered();
        self.begin_render_pass()?;
        self.close_encoder();
        Ok(())
    }

    /// Prepares for transfer commands.
    fn begin_transfer(&mut self) {
        match self.pass.state() {
            EncoderState::TransferActive => (),
            EncoderState::Idle if !self.is_split() => (),
            _ => {
                self.close_encoder();

                if self.is_split() {
                    self.pass.begin_transfer();
                    self.record(NativeCommand::BeginBlitEncoder);
                    self.invalidate_bindings();
                }
            }
        }
    }

    fn bound_pipeline(&self, kind: PipelineKind) -> Result<Pipeline, UsageError> {
        let slot = match kind {
            PipelineKind::Graphics => &self.graphics_pipeline,
            PipelineKind::Compute => &self.compute_pipeline,
        };

        slot.get().cloned().ok_or(UsageError::NoPipeline { kind })
    }

    fn sets(&self, kind: PipelineKind) -> &SlotCache<BoundSet> {
        match kind {
            PipelineKind::Graphics => &self.graphics_sets,
            PipelineKind::Compute => &self.compute_sets,
        }
    }

    /// Checks that every slot of the pipeline has a compatible set bound.
    fn check_sets(&self, kind: PipelineKind, pipeline: &Pipeline) -> Result<(), UsageError> {
        let sets = self.sets(kind);

        for (slot, layout) in pipeline.resource_layouts().iter().enumerate() {
            let Some(bound) = sets.get(slot) else {
                return Err(UsageError::ResourceSetNotBound { slot: slot as u32 });
            };

            if self.validation() && bound.set.layout() != layout {
                return Err(UsageError::LayoutMismatch { slot: slot as u32 });
            }
        }

        Ok(())
    }

    /// Computes the shader resource transitions a draw or dispatch needs.
    fn resource_transitions(&self, kind: PipelineKind, pipeline: &Pipeline) -> Vec<(Texture, TextureState)> {
        let sets = self.sets(kind);

        let mut transitions = Vec::new();
        for slot in 0..pipeline.resource_layouts().len() {
            let Some(bound) = sets.get(slot) else {
                continue;
            };

            for texture in &bound.set.0.sampled_textures {
                transitions.push((texture.clone(), TextureState::ShaderReadOnly));
            }

            for texture in &bound.set.0.storage_textures {
                transitions.push((texture.clone(), TextureState::General));
            }
        }

        transitions
    }

    fn apply_resource_transitions(&mut self, transitions: Vec<(Texture, TextureState)>) {
        for (texture, state) in transitions {
            let range = SubresourceRange::full(&texture.desc());
            self.force_state(&texture, &range, state);
        }
    }

    fn flush_pipeline(&mut self, kind: PipelineKind) {
        let dirty = match kind {
            PipelineKind::Graphics => self.graphics_pipeline.take_dirty(),
            PipelineKind::Compute => self.compute_pipeline.take_dirty(),
        };

        if let Some(pipeline) = dirty {
            self.record(NativeCommand::BindPipeline {
                kind,
                pipeline: pipeline.native_id(),
            });
        }
    }

    /// Emits one bind call per contiguous range of changed resource sets.
    fn flush_sets(&mut self, kind: PipelineKind, slots: usize) {
        let sets = match kind {
            PipelineKind::Graphics => &mut self.graphics_sets,
            PipelineKind::Compute => &mut self.compute_sets,
        };

        let mut commands: SmallVec<[NativeCommand; 2]> = SmallVec::new();
        for range in sets.dirty_ranges() {
            let range = range.start..range.end.min(slots);
            if range.is_empty() {
                continue;
            }

            let mut native = SmallVec::new();
            let mut dynamic_offsets = SmallVec::new();
            for slot in range.clone() {
                if let Some(bound) = sets.get(slot) {
                    native.push(bound.set.native_id());
                    dynamic_offsets.extend_from_slice(&bound.offsets);
                }
            }

            sets.mark_bound(range.clone());
            commands.push(NativeCommand::BindResourceSets {
                kind,
                first_slot: range.start as u32,
                sets: native,
                dynamic_offsets,
            });
        }

        for command in commands {
            self.record(command);
        }
    }

    fn flush_vertex_state(&mut self) {
        let mut commands: SmallVec<[NativeCommand; 2]> = SmallVec::new();

        for range in self.vertex_buffers.dirty_ranges() {
            let buffers = range
                .clone()
                .filter_map(|slot| self.vertex_buffers.get(slot))
                .map(|(buffer, offset)| (buffer.native_id(), *offset))
                .collect();

            self.vertex_buffers.mark_bound(range.clone());
            commands.push(NativeCommand::BindVertexBuffers {
                first_slot: range.start as u32,
                buffers,
            });
        }

        if let Some((buffer, format, offset)) = self.index_buffer.take_dirty() {
            commands.push(NativeCommand::BindIndexBuffer {
                buffer: buffer.native_id(),
                format,
                offset,
            });
        }

        for range in self.viewports.dirty_ranges() {
            for index in range.clone() {
                if let Some(viewport) = self.viewports.get(index) {
                    commands.push(NativeCommand::SetViewport {
                        index: index as u32,
                        viewport: *viewport,
                    });
                }
            }
            self.viewports.mark_bound(range);
        }

        for command in commands {
            self.record(command);
        }
    }

    /// Validates and flushes all state a draw needs.
    fn prepare_draw(&mut self, indexed: bool) -> Result<(), UsageError> {
        self.check_recording()?;

        if self.framebuffer.is_none() {
            return Err(UsageError::NoFramebuffer);
        }

        let pipeline = self.bound_pipeline(PipelineKind::Graphics)?;
        self.check_sets(PipelineKind::Graphics, &pipeline)?;

        if indexed && self.index_buffer.get().is_none() {
            return Err(UsageError::NoIndexBuffer);
        }

        let _span = trace_span!("CommandList::prepare_draw").entered();

        // Barriers are illegal inside a render pass.
        let transitions = self.resource_transitions(PipelineKind::Graphics, &pipeline);
        let needs_barrier = transitions.iter().any(|(texture, state)| {
            let range = SubresourceRange::full(&texture.desc());
            texture.states().lock().needs_transition(&range, *state)
        });

        if needs_barrier && self.pass.is_render_active() {
            self.close_encoder();
        }
        self.apply_resource_transitions(transitions);

        if !self.pass.is_render_active() {
            self.begin_render_pass()?;
        }

        self.flush_pipeline(PipelineKind::Graphics);
        self.flush_sets(PipelineKind::Graphics, pipeline.resource_layouts().len());
        self.flush_vertex_state();

        Ok(())
    }

    /// Validates and flushes all state a dispatch needs.
    fn prepare_dispatch(&mut self) -> Result<(), UsageError> {
        self.check_recording()?;

        let pipeline = self.bound_pipeline(PipelineKind::Compute)?;
        self.check_sets(PipelineKind::Compute, &pipeline)?;

        let _span = trace_span!("CommandList::prepare_dispatch").entered();

        if self.pass.is_render_active()
            || self.pass.state() == EncoderState::TransferActive
        {
            self.close_encoder();
        }

        let transitions = self.resource_transitions(PipelineKind::Compute, &pipeline);
        self.apply_resource_transitions(transitions);

        if self.is_split() && self.pass.state() != EncoderState::ComputeActive {
            self.pass.begin_compute();
            self.record(NativeCommand::BeginComputeEncoder);
            self.invalidate_bindings();
        }

        self.flush_pipeline(PipelineKind::Compute);
        self.flush_sets(PipelineKind::Compute, pipeline.resource_layouts().len());

        Ok(())
    }

    fn set_resource_set(
        &mut self,
        kind: PipelineKind,
        slot: u32,
        set: &ResourceSet,
        dynamic_offsets: &[u32],
    ) -> Result<(), UsageError> {
        self.check_recording()?;
        self.check(set.core())?;

        let expected = set.layout().dynamic_buffers();
        if dynamic_offsets.len() as u32 != expected {
            return Err(UsageError::DynamicOffsetCount {
                slot,
                expected,
                actual: dynamic_offsets.len() as u32,
            });
        }

        if self.validation() {
            if let Ok(pipeline) = self.bound_pipeline(kind) {
                let layouts = pipeline.resource_layouts();
                let count = layouts.len() as u32;
                let Some(layout) = layouts.get(slot as usize) else {
                    return Err(UsageError::SlotOutOfRange { slot, count });
                };

                if layout != set.layout() {
                    return Err(UsageError::LayoutMismatch { slot });
                }
            }
        }

        self.capture(set.core());
        for texture in set.0.sampled_textures.iter().chain(&set.0.storage_textures) {
            self.touch(texture);
        }

        let bound = BoundSet {
            set: set.clone(),
            offsets: SmallVec::from_slice(dynamic_offsets),
        };

        match kind {
            PipelineKind::Graphics => self.graphics_sets.set(slot as usize, bound),
            PipelineKind::Compute => self.compute_sets.set(slot as usize, bound),
        };

        Ok(())
    }

    fn check_buffer_range(buffer: &Buffer, offset: u64, size: u64) -> Result<(), UsageError> {
        let end = offset.saturating_add(size);
        if end > buffer.size() {
            return Err(UsageError::OutOfBounds {
                start: offset,
                end,
                size: buffer.size(),
            });
        }

        Ok(())
    }

    fn check_indirect(&self, buffer: &Buffer, offset: u64, size: u64) -> Result<(), UsageError> {
        self.check(buffer.core())?;

        if !buffer.desc().usage.contains(BufferUsage::INDIRECT) {
            return Err(UsageError::MissingUsage {
                required: "INDIRECT",
            });
        }

        Self::check_buffer_range(buffer, offset, size)
    }

    fn release_recording(&mut self) {
        self.restore_touched();

        self.info.release(
            &self.device.registry,
            &self.device.staging_buffers,
            &self.device.staging_textures,
        );

        if let Some(command_buffer) = self.command_buffer.take() {
            command_buffer.end();
            self.pool.recycle(command_buffer, std::mem::take(&mut self.info));
        }

        self.reset_bindings();
        self.state = RecordingState::Initial;
    }

    /// Hands a staging texture to the recording. It is returned to its pool
    /// once the submission completes.
    pub(crate) fn add_staging_texture(&mut self, staging: StagingTexture) {
        self.info.add_staging_texture(staging);
    }

    /// Detaches the ended recording for submission.
    pub(crate) fn take_submission(&mut self) -> Result<Submission, UsageError> {
        if self.state != RecordingState::Ended {
            return Err(UsageError::NotEnded);
        }

        let Some(command_buffer) = self.command_buffer.take() else {
            return Err(UsageError::NotEnded);
        };

        let info = std::mem::replace(&mut self.info, self.pool.pop_info());
        self.reset_bindings();
        self.state = RecordingState::Initial;

        Ok(Submission {
            command_buffer,
            info,
            pool: self.pool.clone(),
        })
    }

    pub(crate) fn belongs_to(&self, device: &Arc<DeviceShared>) -> bool {
        Arc::ptr_eq(&self.device, device)
    }
}

fn in_pass_clear(clear: InPassClear) -> NativeClear {
    match clear {
        InPassClear::Color { index, color } => NativeClear::Color { index, color },
        InPassClear::DepthStencil { depth, stencil } => {
            NativeClear::DepthStencil { depth, stencil }
        }
    }
}

fn region_range(region: &TextureRegion) -> SubresourceRange {
    SubresourceRange::new(
        region.mip_level..region.mip_level + 1,
        region.base_array_layer..region.base_array_layer + region.layer_count,
    )
}

fn ranges_overlap(a: &Range<u32>, b: &Range<u32>) -> bool {
    a.start < b.end && b.start < a.end
}

impl hal::CommandList<Soft> for CommandList {
    fn begin(&mut self) -> Result<()> {
        let _span = trace_span!("CommandList::begin").entered();

        match self.state {
            RecordingState::Recording => return Err(UsageError::AlreadyRecording.into()),
            RecordingState::Ended => {
                tracing::warn!("discarding ended command list that was never submitted");
                self.release_recording();
            }
            RecordingState::Initial => (),
        }

        let command_buffer = match self.pool.pop() {
            Some(command_buffer) => command_buffer,
            None => self.device.native.shared().allocate_command_buffer()?,
        };
        command_buffer.begin();

        self.command_buffer = Some(command_buffer);
        self.reset_bindings();
        self.state = RecordingState::Recording;
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        let _span = trace_span!("CommandList::end").entered();
        self.check_recording()?;

        if matches!(
            self.pass.state(),
            EncoderState::TransferActive | EncoderState::ComputeActive
        ) {
            self.close_encoder();
        }

        self.flush_framebuffer()?;
        self.close_encoder();

        if self.debug_depth != 0 {
            tracing::warn!("closing {} unterminated debug groups", self.debug_depth);
            for _ in 0..self.debug_depth {
                self.record(NativeCommand::PopDebugGroup);
            }
            self.debug_depth = 0;
        }

        let touched: Vec<Texture> = self
            .touched
            .values()
            .map(|touched| touched.texture.clone())
            .collect();
        for texture in touched {
            let desc = texture.desc();
            self.force_state(
                &texture,
                &SubresourceRange::full(&desc),
                TextureState::rest(desc.usage),
            );
        }

        if let Some(command_buffer) = &self.command_buffer {
            command_buffer.end();
        }

        self.state = RecordingState::Ended;
        Ok(())
    }

    fn discard(&mut self) {
        if self.state == RecordingState::Initial {
            return;
        }

        tracing::debug!("discarding recording with {} captured objects", self.info.len());
        self.release_recording();
    }

    fn set_framebuffer(&mut self, framebuffer: &Framebuffer) -> Result<()> {
        let _span = trace_span!("CommandList::set_framebuffer").entered();
        self.check_recording()?;
        self.check(framebuffer.core())?;

        if self.framebuffer.as_ref() == Some(framebuffer) {
            return Ok(());
        }

        if self.pass.is_render_active() {
            self.close_encoder();
        } else {
            // A framebuffer that was replaced before any pass opened on it
            // still executes its clears.
            self.flush_framebuffer()?;
        }

        self.capture(framebuffer.core());
        for attachment in framebuffer.attachments() {
            self.touch(&attachment.texture);
        }

        self.pass
            .bind_framebuffer(framebuffer.color_targets(), framebuffer.has_depth_target());
        self.framebuffer = Some(framebuffer.clone());
        self.viewports.clear();
        Ok(())
    }

    fn set_pipeline(&mut self, pipeline: &Pipeline) -> Result<()> {
        self.check_recording()?;
        self.check(pipeline.core())?;

        let layouts = pipeline.resource_layouts().len();
        let (slot, sets) = match pipeline.kind() {
            PipelineKind::Graphics => (&mut self.graphics_pipeline, &mut self.graphics_sets),
            PipelineKind::Compute => (&mut self.compute_pipeline, &mut self.compute_sets),
        };

        if slot.set(pipeline.clone()) {
            // Native set bindings do not survive a layout change.
            if sets.len() < layouts {
                sets.resize(layouts);
            }
            sets.invalidate();
            self.capture(pipeline.core());
        }

        Ok(())
    }

    fn set_vertex_buffer(&mut self, index: u32, buffer: &Buffer, offset: u64) -> Result<()> {
        self.check_recording()?;
        self.check(buffer.core())?;

        if !buffer.desc().usage.contains(BufferUsage::VERTEX) {
            return Err(UsageError::MissingUsage { required: "VERTEX" }.into());
        }

        if self.validation() {
            if let Some(pipeline) = self.graphics_pipeline.get() {
                let count = pipeline.0.vertex_buffers;
                if index >= count {
                    return Err(UsageError::VertexBufferOutOfRange { slot: index, count }.into());
                }
            }
        }

        if self.vertex_buffers.set(index as usize, (buffer.clone(), offset)) {
            self.capture(buffer.core());
        }

        Ok(())
    }

    fn set_index_buffer(
        &mut self,
        buffer: &Buffer,
        format: IndexFormat,
        offset: u64,
    ) -> Result<()> {
        self.check_recording()?;
        self.check(buffer.core())?;

        if !buffer.desc().usage.contains(BufferUsage::INDEX) {
            return Err(UsageError::MissingUsage { required: "INDEX" }.into());
        }

        if self.index_buffer.set((buffer.clone(), format, offset)) {
            self.capture(buffer.core());
        }

        Ok(())
    }

    fn set_graphics_resource_set(
        &mut self,
        slot: u32,
        set: &ResourceSet,
        dynamic_offsets: &[u32],
    ) -> Result<()> {
        self.set_resource_set(PipelineKind::Graphics, slot, set, dynamic_offsets)?;
        Ok(())
    }

    fn set_compute_resource_set(
        &mut self,
        slot: u32,
        set: &ResourceSet,
        dynamic_offsets: &[u32],
    ) -> Result<()> {
        self.set_resource_set(PipelineKind::Compute, slot, set, dynamic_offsets)?;
        Ok(())
    }

    fn set_viewport(&mut self, index: u32, viewport: Viewport) -> Result<()> {
        self.check_recording()?;

        let Some(framebuffer) = &self.framebuffer else {
            return Err(UsageError::NoFramebuffer.into());
        };

        let count = framebuffer.color_targets().max(1);
        if index >= count {
            return Err(UsageError::ColorTargetOutOfRange { index, count }.into());
        }

        self.viewports.set(index as usize, viewport);
        Ok(())
    }

    fn clear_color_target(&mut self, index: u32, color: [f32; 4]) -> Result<()> {
        self.check_recording()?;

        let Some(framebuffer) = &self.framebuffer else {
            return Err(UsageError::NoFramebuffer.into());
        };

        let count = framebuffer.color_targets();
        if index >= count {
            return Err(UsageError::ColorTargetOutOfRange { index, count }.into());
        }

        if self.pass.is_render_active() {
            self.record(NativeCommand::ClearAttachment(NativeClear::Color {
                index,
                color,
            }));
        } else {
            self.pass.queue_clear_color(index, color);
        }

        Ok(())
    }

    fn clear_depth_stencil(&mut self, depth: f32, stencil: u8) -> Result<()> {
        self.check_recording()?;

        let Some(framebuffer) = &self.framebuffer else {
            return Err(UsageError::NoFramebuffer.into());
        };

        if !framebuffer.has_depth_target() {
            return Err(UsageError::NoDepthTarget.into());
        }

        if self.pass.is_render_active() {
            self.record(NativeCommand::ClearAttachment(NativeClear::DepthStencil {
                depth,
                stencil,
            }));
        } else {
            self.pass.queue_clear_depth_stencil(depth, stencil);
        }

        Ok(())
    }

    fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<()> {
        self.prepare_draw(false)?;
        self.record(NativeCommand::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
        Ok(())
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<()> {
        self.prepare_draw(true)?;
        self.record(NativeCommand::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        });
        Ok(())
    }

    fn draw_indirect(
        &mut self,
        buffer: &Buffer,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) -> Result<()> {
        self.check_recording()?;
        self.check_indirect(buffer, offset, u64::from(draw_count) * u64::from(stride))?;

        self.prepare_draw(false)?;
        self.capture(buffer.core());
        self.record(NativeCommand::DrawIndirect {
            buffer: buffer.native_id(),
            offset,
            draw_count,
            stride,
        });
        Ok(())
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        self.prepare_dispatch()?;
        self.record(NativeCommand::Dispatch { x, y, z });
        Ok(())
    }

    fn dispatch_indirect(&mut self, buffer: &Buffer, offset: u64) -> Result<()> {
        self.check_recording()?;
        self.check_indirect(buffer, offset, 12)?;

        self.prepare_dispatch()?;
        self.capture(buffer.core());
        self.record(NativeCommand::DispatchIndirect {
            buffer: buffer.native_id(),
            offset,
        });
        Ok(())
    }

    fn copy_buffer(
        &mut self,
        src: &Buffer,
        src_offset: u64,
        dst: &Buffer,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        let _span = trace_span!("CommandList::copy_buffer").entered();
        self.check_recording()?;
        self.check(src.core())?;
        self.check(dst.core())?;
        Self::check_buffer_range(src, src_offset, size)?;
        Self::check_buffer_range(dst, dst_offset, size)?;

        if size == 0 {
            return Ok(());
        }

        self.capture(src.core());
        self.capture(dst.core());

        self.begin_transfer();
        self.record(NativeCommand::CopyBuffer {
            src: src.native_id(),
            src_offset,
            dst: dst.native_id(),
            dst_offset,
            size,
        });
        Ok(())
    }

    fn copy_texture(
        &mut self,
        src: &Texture,
        src_region: &TextureRegion,
        dst: &Texture,
        dst_region: &TextureRegion,
    ) -> Result<()> {
        let _span = trace_span!("CommandList::copy_texture").entered();
        self.check_recording()?;
        self.check(src.core())?;
        self.check(dst.core())?;

        let (src_desc, dst_desc) = (src.desc(), dst.desc());
        if !src_region.is_within(&src_desc) || !dst_region.is_within(&dst_desc) {
            return Err(UsageError::InvalidDescription("texture region out of bounds").into());
        }

        if src_region.width != dst_region.width
            || src_region.height != dst_region.height
            || src_region.layer_count != dst_region.layer_count
        {
            return Err(UsageError::InvalidDescription("texture regions differ in extent").into());
        }

        if src_desc.format.bytes_per_texel() != dst_desc.format.bytes_per_texel() {
            return Err(UsageError::InvalidDescription("incompatible texture formats").into());
        }

        let (src_range, dst_range) = (region_range(src_region), region_range(dst_region));
        if src == dst
            && ranges_overlap(&src_range.mips, &dst_range.mips)
            && ranges_overlap(&src_range.layers, &dst_range.layers)
        {
            return Err(
                UsageError::InvalidDescription("copy source and destination overlap").into(),
            );
        }

        if self.validation()
            && (src.states().lock().uniform_state(&src_range).is_none()
                || dst.states().lock().uniform_state(&dst_range).is_none())
        {
            return Err(UsageError::MixedSubresourceStates.into());
        }

        self.begin_transfer();

        self.transition(src, &src_range, TextureState::TransferSrc)?;
        self.transition(dst, &dst_range, TextureState::TransferDst)?;

        self.record(NativeCommand::CopyTexture {
            src: src.native_id(),
            src_region: *src_region,
            dst: dst.native_id(),
            dst_region: *dst_region,
        });

        self.transition(src, &src_range, TextureState::rest(src_desc.usage))?;
        self.transition(dst, &dst_range, TextureState::rest(dst_desc.usage))?;
        Ok(())
    }

    fn update_buffer(&mut self, buffer: &Buffer, offset: u64, data: &[u8]) -> Result<()> {
        let _span = trace_span!("CommandList::update_buffer").entered();
        self.check_recording()?;
        self.check(buffer.core())?;
        Self::check_buffer_range(buffer, offset, data.len() as u64)?;

        if data.is_empty() {
            return Ok(());
        }

        let staging = self.device.acquire_staging_buffer(data.len() as u64)?;
        if let Err(err) = self
            .device
            .native
            .shared()
            .write_buffer(staging.0.native_id(), 0, data)
        {
            self.device.staging_buffers.release(staging);
            return Err(err.into());
        }

        self.capture(buffer.core());
        self.begin_transfer();
        self.record(NativeCommand::CopyBuffer {
            src: staging.0.native_id(),
            src_offset: 0,
            dst: buffer.native_id(),
            dst_offset: offset,
            size: data.len() as u64,
        });

        self.info.add_staging_buffer(staging);
        Ok(())
    }

    fn push_debug_group(&mut self, name: &str) -> Result<()> {
        self.check_recording()?;
        self.record(NativeCommand::PushDebugGroup(name.to_owned()));
        self.debug_depth += 1;
        Ok(())
    }

    fn pop_debug_group(&mut self) -> Result<()> {
        self.check_recording()?;

        if self.debug_depth == 0 {
            return Err(UsageError::DebugGroupUnderflow.into());
        }

        self.record(NativeCommand::PopDebugGroup);
        self.debug_depth -= 1;
        Ok(())
    }

    fn insert_debug_marker(&mut self, name: &str) -> Result<()> {
        self.check_recording()?;
        self.record(NativeCommand::InsertDebugMarker(name.to_owned()));
        Ok(())
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        if self.state != RecordingState::Initial {
            self.release_recording();
        }
    }
}

impl Debug for CommandList {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandList")
            .field("state", &self.state)
            .field("encoder", &self.pass.state())
            .field("captured", &self.info.len())
            .finish_non_exhaustive()
    }
}

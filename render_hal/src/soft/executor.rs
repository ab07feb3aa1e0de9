//! Executes native command buffers on the queue worker.
//!
//! The executor enforces the rules a native driver would: barriers outside
//! of render passes with correct old layouts, attachments and shader
//! resources in the right layouts, work in the right encoder and no access
//! to destroyed objects. Every violation is reported through
//! [`NativeShared::report`] and the offending command is skipped.

use std::sync::Arc;

use render_tracing::trace_span;

use crate::config::EncoderModel;
use crate::tracking::pass::LoadOp;
use crate::tracking::subresource::{SubresourceRange, TextureState};
use crate::types::{PipelineKind, TextureRegion};

use super::native::{
    CommandBufferData, NativeAttachment, NativeClear, NativeCommand, NativeFramebuffer, NativeId,
    NativeObject, NativePipeline, NativeShared,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Encoder {
    None,
    Render,
    Blit,
    Compute,
}

#[derive(Default)]
struct Bindings {
    pipeline: Option<Arc<NativeObject>>,
    sets: Vec<Option<NativeId>>,
}

impl Bindings {
    fn pipeline(&self) -> Option<&NativePipeline> {
        match self.pipeline.as_deref() {
            Some(NativeObject::Pipeline(pipeline)) => Some(pipeline),
            _ => None,
        }
    }
}

struct Executor<'a> {
    shared: &'a NativeShared,
    command_buffer: u64,
    encoder: Encoder,
    framebuffer: Option<Arc<NativeObject>>,
    graphics: Bindings,
    compute: Bindings,
    vertex_buffers: Vec<Option<NativeId>>,
    index_buffer: Option<NativeId>,
    debug_depth: u32,
}

pub(crate) fn execute(shared: &NativeShared, data: &CommandBufferData) {
    let _span = trace_span!("NativeQueue::execute", command_buffer = data.id).entered();

    if data.recording {
        shared.report(format!(
            "command buffer {} submitted while recording",
            data.id
        ));
        return;
    }

    let mut executor = Executor {
        shared,
        command_buffer: data.id,
        encoder: Encoder::None,
        framebuffer: None,
        graphics: Bindings::default(),
        compute: Bindings::default(),
        vertex_buffers: Vec::new(),
        index_buffer: None,
        debug_depth: 0,
    };

    for command in &data.commands {
        executor.execute(command);
    }

    if executor.encoder != Encoder::None {
        executor.report(format!(
            "command buffer ended with open {:?} encoder",
            executor.encoder
        ));
    }

    if executor.debug_depth != 0 {
        executor.report(format!(
            "command buffer ended with {} open debug groups",
            executor.debug_depth
        ));
    }
}

impl<'a> Executor<'a> {
    fn report(&self, message: String) {
        self.shared
            .report(format!("cb {}: {}", self.command_buffer, message));
    }

    fn object(&self, id: NativeId) -> Option<Arc<NativeObject>> {
        let object = self.shared.get(id);
        if object.is_none() {
            self.report(format!("use of destroyed object {:?}", id));
        }
        object
    }

    fn is_split(&self) -> bool {
        self.shared.model == EncoderModel::Split
    }

    fn bindings(&mut self, kind: PipelineKind) -> &mut Bindings {
        match kind {
            PipelineKind::Graphics => &mut self.graphics,
            PipelineKind::Compute => &mut self.compute,
        }
    }

    /// Opening an encoder in the split model starts from empty bindings.
    fn open_encoder(&mut self, encoder: Encoder) {
        if self.encoder != Encoder::None {
            self.report(format!(
                "{:?} encoder opened while {:?} is open",
                encoder, self.encoder
            ));
        }

        self.encoder = encoder;

        if self.is_split() {
            self.graphics = Bindings::default();
            self.compute = Bindings::default();
            self.vertex_buffers.clear();
            self.index_buffer = None;
        }
    }

    /// Returns `true` if transfer work may be recorded in the current encoder.
    fn check_transfer_encoder(&self, what: &str) -> bool {
        let expected = if self.is_split() {
            Encoder::Blit
        } else {
            Encoder::None
        };

        if self.encoder != expected {
            self.report(format!("{} inside {:?} encoder", what, self.encoder));
            return false;
        }

        true
    }

    fn execute(&mut self, command: &NativeCommand) {
        match command {
            NativeCommand::PipelineBarrier {
                texture,
                range,
                old,
                new,
            } => self.barrier(*texture, range, *old, *new),
            NativeCommand::BeginRenderPass {
                framebuffer,
                color,
                depth,
            } => self.begin_render_pass(*framebuffer, color, *depth),
            NativeCommand::EndRenderPass => {
                if self.encoder != Encoder::Render {
                    self.report("end of render pass without open pass".to_owned());
                }
                self.encoder = Encoder::None;
                self.framebuffer = None;
            }
            NativeCommand::BeginBlitEncoder | NativeCommand::BeginComputeEncoder => {
                if !self.is_split() {
                    self.report("blit or compute encoder in unified model".to_owned());
                    return;
                }

                let encoder = match command {
                    NativeCommand::BeginBlitEncoder => Encoder::Blit,
                    _ => Encoder::Compute,
                };
                self.open_encoder(encoder);
            }
            NativeCommand::EndEncoder => {
                if !matches!(self.encoder, Encoder::Blit | Encoder::Compute) {
                    self.report("end of encoder without open encoder".to_owned());
                }
                self.encoder = Encoder::None;
            }
            NativeCommand::ClearAttachment(clear) => self.clear_attachment(*clear),
            NativeCommand::BindPipeline { kind, pipeline } => self.bind_pipeline(*kind, *pipeline),
            NativeCommand::BindResourceSets {
                kind,
                first_slot,
                sets,
                ..
            } => {
                for (index, set) in sets.iter().enumerate() {
                    let Some(object) = self.object(*set) else {
                        return;
                    };
                    if !matches!(*object, NativeObject::DescriptorSet(_)) {
                        self.report(format!("{:?} is not a descriptor set", set));
                        return;
                    }

                    let slot = *first_slot as usize + index;
                    let bindings = self.bindings(*kind);
                    if bindings.sets.len() <= slot {
                        bindings.sets.resize(slot + 1, None);
                    }
                    bindings.sets[slot] = Some(*set);
                }
            }
            NativeCommand::BindVertexBuffers {
                first_slot,
                buffers,
            } => {
                for (index, (buffer, _)) in buffers.iter().enumerate() {
                    if self.buffer_size(*buffer).is_none() {
                        return;
                    }

                    let slot = *first_slot as usize + index;
                    if self.vertex_buffers.len() <= slot {
                        self.vertex_buffers.resize(slot + 1, None);
                    }
                    self.vertex_buffers[slot] = Some(*buffer);
                }
            }
            NativeCommand::BindIndexBuffer { buffer, .. } => {
                if self.buffer_size(*buffer).is_some() {
                    self.index_buffer = Some(*buffer);
                }
            }
            NativeCommand::SetViewport { .. } => {
                if self.encoder != Encoder::Render {
                    self.report("viewport outside of render pass".to_owned());
                }
            }
            NativeCommand::Draw { .. } => self.check_draw(),
            NativeCommand::DrawIndexed { .. } => {
                if self.index_buffer.is_none() {
                    self.report("indexed draw without index buffer".to_owned());
                }
                self.check_draw();
            }
            NativeCommand::DrawIndirect {
                buffer,
                offset,
                draw_count,
                stride,
            } => {
                match u64::from(*draw_count).checked_mul(u64::from(*stride)) {
                    Some(len) => {
                        self.check_buffer_range(*buffer, *offset, len);
                    }
                    None => self.report(format!(
                        "indirect draw of {} x {} bytes overflows",
                        draw_count, stride
                    )),
                }
                self.check_draw();
            }
            NativeCommand::Dispatch { .. } => self.check_dispatch(),
            NativeCommand::DispatchIndirect { buffer, offset } => {
                self.check_buffer_range(*buffer, *offset, 12);
                self.check_dispatch();
            }
            NativeCommand::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => self.copy_buffer(*src, *src_offset, *dst, *dst_offset, *size),
            NativeCommand::CopyTexture {
                src,
                src_region,
                dst,
                dst_region,
            } => self.copy_texture(*src, src_region, *dst, dst_region),
            NativeCommand::PushDebugGroup(_) => self.debug_depth += 1,
            NativeCommand::PopDebugGroup => {
                if self.debug_depth == 0 {
                    self.report("debug group underflow".to_owned());
                } else {
                    self.debug_depth -= 1;
                }
            }
            NativeCommand::InsertDebugMarker(_) => (),
        }
    }

    fn barrier(
        &self,
        texture: NativeId,
        range: &SubresourceRange,
        old: TextureState,
        new: TextureState,
    ) {
        if self.encoder == Encoder::Render {
            self.report(format!("barrier on {:?} inside render pass", texture));
            return;
        }

        let Some(object) = self.object(texture) else {
            return;
        };
        let NativeObject::Texture(texture_object) = &*object else {
            self.report(format!("barrier on non-texture {:?}", texture));
            return;
        };

        let mut data = texture_object.data.lock();
        if range.mips.end > data.desc.mip_levels || range.layers.end > data.desc.array_layers {
            self.report(format!("barrier range {:?} out of bounds", range));
            return;
        }

        for mip in range.mips.clone() {
            for layer in range.layers.clone() {
                let index = data.index(mip, layer);
                let current = data.layouts[index];
                if old != TextureState::Undefined && current != old {
                    self.report(format!(
                        "barrier on {:?} ({}, {}) expects {:?} but layout is {:?}",
                        texture, mip, layer, old, current
                    ));
                }
                data.layouts[index] = new;
            }
        }
    }

    fn attachment_layout(&self, attachment: &NativeAttachment) -> Option<TextureState> {
        let object = self.object(attachment.texture)?;
        let NativeObject::Texture(texture) = &*object else {
            return None;
        };

        let data = texture.data.lock();
        let index = data.index(attachment.mip_level, attachment.array_layer);
        data.layouts.get(index).copied()
    }

    fn fill_attachment(&self, attachment: &NativeAttachment, clear: NativeClear) {
        let Some(object) = self.object(attachment.texture) else {
            return;
        };
        let NativeObject::Texture(texture) = &*object else {
            return;
        };

        let mut data = texture.data.lock();
        let texel = match clear {
            NativeClear::Color { color, .. } => data.desc.format.encode_color(color),
            NativeClear::DepthStencil { depth, stencil } => {
                data.desc.format.encode_depth_stencil(depth, stencil)
            }
        };
        data.fill(attachment.mip_level, attachment.array_layer, &texel);
    }

    fn framebuffer(&self) -> Option<&NativeFramebuffer> {
        match self.framebuffer.as_deref() {
            Some(NativeObject::Framebuffer(framebuffer)) => Some(framebuffer),
            _ => None,
        }
    }

    fn begin_render_pass(
        &mut self,
        framebuffer: NativeId,
        color: &[LoadOp<[f32; 4]>],
        depth: Option<LoadOp<(f32, u8)>>,
    ) {
        let Some(object) = self.object(framebuffer) else {
            return;
        };
        let NativeObject::Framebuffer(fb) = &*object else {
            self.report(format!("{:?} is not a framebuffer", framebuffer));
            return;
        };

        if color.len() != fb.colors.len() || depth.is_some() != fb.depth.is_some() {
            self.report(format!(
                "render pass load ops do not match framebuffer {:?}",
                framebuffer
            ));
        }

        for attachment in &fb.colors {
            let layout = self.attachment_layout(attachment);
            if layout != Some(TextureState::ColorAttachment) {
                self.report(format!(
                    "color attachment {:?} in layout {:?}",
                    attachment.texture, layout
                ));
            }
        }

        if let Some(attachment) = &fb.depth {
            let layout = self.attachment_layout(attachment);
            if layout != Some(TextureState::DepthStencilAttachment) {
                self.report(format!(
                    "depth attachment {:?} in layout {:?}",
                    attachment.texture, layout
                ));
            }
        }

        for (index, (attachment, op)) in fb.colors.iter().zip(color).enumerate() {
            if let LoadOp::Clear(color) = op {
                self.fill_attachment(
                    attachment,
                    NativeClear::Color {
                        index: index as u32,
                        color: *color,
                    },
                );
            }
        }

        if let (Some(attachment), Some(LoadOp::Clear((depth, stencil)))) = (&fb.depth, depth) {
            self.fill_attachment(attachment, NativeClear::DepthStencil { depth, stencil });
        }

        self.open_encoder(Encoder::Render);
        self.framebuffer = Some(object.clone());
    }

    fn clear_attachment(&self, clear: NativeClear) {
        if self.encoder != Encoder::Render {
            self.report("attachment clear outside of render pass".to_owned());
            return;
        }

        let Some(fb) = self.framebuffer() else {
            return;
        };

        let attachment = match clear {
            NativeClear::Color { index, .. } => fb.colors.get(index as usize),
            NativeClear::DepthStencil { .. } => fb.depth.as_ref(),
        };

        match attachment {
            Some(attachment) => self.fill_attachment(attachment, clear),
            None => self.report(format!("clear of missing attachment {:?}", clear)),
        }
    }

    fn bind_pipeline(&mut self, kind: PipelineKind, pipeline: NativeId) {
        let Some(object) = self.object(pipeline) else {
            return;
        };

        match &*object {
            NativeObject::Pipeline(p) if p.kind == kind => (),
            _ => {
                self.report(format!("{:?} is not a {:?} pipeline", pipeline, kind));
                return;
            }
        }

        if self.is_split() {
            let expected = match kind {
                PipelineKind::Graphics => Encoder::Render,
                PipelineKind::Compute => Encoder::Compute,
            };

            if self.encoder != expected {
                self.report(format!(
                    "{:?} pipeline bound in {:?} encoder",
                    kind, self.encoder
                ));
            }
        }

        self.bindings(kind).pipeline = Some(object);
    }

    /// Checks that the bound pipeline and resource sets can be used.
    fn check_resources(&self, kind: PipelineKind) {
        let bindings = match kind {
            PipelineKind::Graphics => &self.graphics,
            PipelineKind::Compute => &self.compute,
        };

        let Some(pipeline) = bindings.pipeline() else {
            self.report(format!("{:?} work without pipeline", kind));
            return;
        };

        for (slot, layout) in pipeline.set_layouts.iter().enumerate() {
            let Some(set) = bindings.sets.get(slot).copied().flatten() else {
                self.report(format!("{:?} work without set at slot {}", kind, slot));
                continue;
            };

            let Some(object) = self.object(set) else {
                continue;
            };
            let NativeObject::DescriptorSet(set) = &*object else {
                continue;
            };

            if set.layout != *layout {
                self.report(format!("set layout mismatch at slot {}", slot));
            }

            for id in set.bindings.buffers.iter().chain(&set.bindings.samplers) {
                self.object(*id);
            }

            for texture in &set.bindings.sampled_textures {
                let layout = self.attachment_layout(texture);
                if layout != Some(TextureState::ShaderReadOnly) {
                    self.report(format!(
                        "sampled texture {:?} in layout {:?}",
                        texture.texture, layout
                    ));
                }
            }

            for texture in &set.bindings.storage_textures {
                let layout = self.attachment_layout(texture);
                if layout != Some(TextureState::General) {
                    self.report(format!(
                        "storage texture {:?} in layout {:?}",
                        texture.texture, layout
                    ));
                }
            }
        }
    }

    fn check_draw(&self) {
        if self.encoder != Encoder::Render {
            self.report("draw outside of render pass".to_owned());
            return;
        }

        for buffer in self.vertex_buffers.iter().flatten() {
            self.object(*buffer);
        }

        self.check_resources(PipelineKind::Graphics);
    }

    fn check_dispatch(&self) {
        let expected = if self.is_split() {
            Encoder::Compute
        } else {
            Encoder::None
        };

        if self.encoder != expected {
            self.report(format!("dispatch inside {:?} encoder", self.encoder));
            return;
        }

        self.check_resources(PipelineKind::Compute);
    }

    fn buffer_size(&self, id: NativeId) -> Option<u64> {
        match self.object(id).as_deref() {
            Some(NativeObject::Buffer(buffer)) => Some(buffer.size),
            Some(_) => {
                self.report(format!("{:?} is not a buffer", id));
                None
            }
            None => None,
        }
    }

    /// Checks that `len` bytes starting at `start` lie within the buffer.
    fn check_buffer_range(&self, id: NativeId, start: u64, len: u64) -> bool {
        let Some(size) = self.buffer_size(id) else {
            return false;
        };

        let Some(end) = start.checked_add(len) else {
            self.report(format!("range {}+{} overflows for {:?}", start, len, id));
            return false;
        };

        if end > size {
            self.report(format!(
                "range {}..{} out of bounds for {:?} of size {}",
                start, end, id, size
            ));
            return false;
        }

        true
    }

    fn copy_buffer(&self, src: NativeId, src_offset: u64, dst: NativeId, dst_offset: u64, size: u64) {
        if !self.check_transfer_encoder("buffer copy") {
            return;
        }

        if !self.check_buffer_range(src, src_offset, size)
            || !self.check_buffer_range(dst, dst_offset, size)
        {
            return;
        }

        let (Some(src_object), Some(dst_object)) = (self.shared.get(src), self.shared.get(dst))
        else {
            return;
        };
        let (NativeObject::Buffer(src_buffer), NativeObject::Buffer(dst_buffer)) =
            (&*src_object, &*dst_object)
        else {
            return;
        };

        let (src_offset, dst_offset, size) = (src_offset as usize, dst_offset as usize, size as usize);

        // Copy through a temporary so that `src` and `dst` may alias.
        let bytes = src_buffer.memory.lock()[src_offset..src_offset + size].to_vec();
        dst_buffer.memory.lock()[dst_offset..dst_offset + size].copy_from_slice(&bytes);
    }

    fn copy_texture(
        &self,
        src: NativeId,
        src_region: &TextureRegion,
        dst: NativeId,
        dst_region: &TextureRegion,
    ) {
        if !self.check_transfer_encoder("texture copy") {
            return;
        }

        if src_region.width != dst_region.width
            || src_region.height != dst_region.height
            || src_region.layer_count != dst_region.layer_count
        {
            self.report("texture copy regions differ in extent".to_owned());
            return;
        }

        let (Some(src_object), Some(dst_object)) = (self.object(src), self.object(dst)) else {
            return;
        };
        let (NativeObject::Texture(src_texture), NativeObject::Texture(dst_texture)) =
            (&*src_object, &*dst_object)
        else {
            self.report("texture copy between non-textures".to_owned());
            return;
        };

        let mut layers = Vec::with_capacity(src_region.layer_count as usize);
        let src_texel = {
            let data = src_texture.data.lock();
            if !src_region.is_within(&data.desc) {
                self.report(format!("source region {:?} out of bounds", src_region));
                return;
            }

            for layer in 0..src_region.layer_count {
                let layer = src_region.base_array_layer + layer;
                let layout = data.layouts[data.index(src_region.mip_level, layer)];
                if !matches!(layout, TextureState::TransferSrc | TextureState::General) {
                    self.report(format!("copy source {:?} in layout {:?}", src, layout));
                }
                layers.push(data.read_region(src_region, layer));
            }

            data.desc.format.bytes_per_texel()
        };

        let mut data = dst_texture.data.lock();
        if !dst_region.is_within(&data.desc) {
            self.report(format!("destination region {:?} out of bounds", dst_region));
            return;
        }

        if data.desc.format.bytes_per_texel() != src_texel {
            self.report("texture copy between incompatible formats".to_owned());
            return;
        }

        for (index, bytes) in layers.iter().enumerate() {
            let layer = dst_region.base_array_layer + index as u32;
            let layout = data.layouts[data.index(dst_region.mip_level, layer)];
            if !matches!(layout, TextureState::TransferDst | TextureState::General) {
                self.report(format!("copy destination {:?} in layout {:?}", dst, layout));
            }
            data.write_region(dst_region, layer, bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::EncoderModel;

    use super::super::native::{CommandBufferData, NativeCommand, NativeDevice};
    use super::execute;

    fn run(device: &NativeDevice, commands: Vec<NativeCommand>) {
        execute(
            device.shared(),
            &CommandBufferData {
                id: 0,
                commands,
                recording: false,
            },
        );
    }

    #[test]
    fn indirect_range_overflow_is_reported() {
        let device = NativeDevice::new(EncoderModel::Unified, None);
        let buffer = device.shared().create_buffer(64).unwrap();

        run(
            &device,
            vec![
                NativeCommand::DrawIndirect {
                    buffer,
                    offset: u64::MAX - 8,
                    draw_count: 2,
                    stride: 16,
                },
                NativeCommand::DispatchIndirect {
                    buffer,
                    offset: u64::MAX,
                },
            ],
        );

        let messages = device.validation_messages();
        assert_eq!(
            messages.iter().filter(|m| m.contains("overflows")).count(),
            2,
            "{:#?}",
            messages
        );
    }

    #[test]
    fn copy_within_bounds_is_accepted() {
        let device = NativeDevice::new(EncoderModel::Unified, None);
        let src = device.shared().create_buffer(64).unwrap();
        let dst = device.shared().create_buffer(64).unwrap();
        device.shared().write_buffer(src, 0, &[9; 64]).unwrap();

        run(
            &device,
            vec![NativeCommand::CopyBuffer {
                src,
                src_offset: 32,
                dst,
                dst_offset: 0,
                size: 32,
            }],
        );

        assert_eq!(device.validation_errors(), 0);

        let mut out = [0; 32];
        device.shared().read_buffer(dst, 0, &mut out).unwrap();
        assert_eq!(out, [9; 32]);
    }
}

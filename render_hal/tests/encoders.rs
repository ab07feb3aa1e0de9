mod common;

use render_hal::prelude::*;
use render_hal::soft::{Buffer, Device, EncoderState, Pipeline, ResourceSet};
use render_hal::tracking::subresource::TextureState;

struct ComputeFixture {
    pipeline: Pipeline,
    set: ResourceSet,
    storage: Buffer,
}

fn compute_fixture(device: &Device) -> ComputeFixture {
    let layout = common::storage_layout(device);
    let storage = common::buffer(device, 256, BufferUsage::STRUCTURED_READ_WRITE);
    let pipeline = common::compute_pipeline(device, &[&layout]);
    let set = device
        .create_resource_set(&ResourceSetDescription {
            layout: &layout,
            resources: &[BindableResource::Buffer(&storage)],
        })
        .unwrap();

    ComputeFixture {
        pipeline,
        set,
        storage,
    }
}

/// Dispatch, upload, dispatch.
fn record_interleaved(device: &Device, fixture: &ComputeFixture) {
    let mut list = device.create_command_list().unwrap();
    list.begin().unwrap();
    list.set_pipeline(&fixture.pipeline).unwrap();
    list.set_compute_resource_set(0, &fixture.set, &[]).unwrap();
    list.dispatch(1, 1, 1).unwrap();
    list.update_buffer(&fixture.storage, 0, &[0; 64]).unwrap();
    list.dispatch(1, 1, 1).unwrap();
    list.end().unwrap();
    device.submit_commands(&mut list, None).unwrap();
    device.wait_for_idle().unwrap();
}

#[test]
fn unified_model_keeps_bindings_across_transfers() {
    let device = common::device();
    let fixture = compute_fixture(&device);

    record_interleaved(&device, &fixture);

    let stats = device.native().stats();
    assert_eq!(stats.encoders, 0);
    assert_eq!(stats.pipeline_binds, 1);
    assert_eq!(stats.resource_set_bind_calls, 1);
    assert_eq!(stats.dispatches, 2);
    common::assert_no_validation_errors(&device);
}

#[test]
fn split_model_rebinds_after_encoder_switch() {
    let device = common::device_with(|config| config.encoder_model = EncoderModel::Split);
    let fixture = compute_fixture(&device);

    record_interleaved(&device, &fixture);

    let stats = device.native().stats();
    // Compute, blit, compute.
    assert_eq!(stats.encoders, 3);
    assert_eq!(stats.pipeline_binds, 2);
    assert_eq!(stats.resource_set_bind_calls, 2);
    common::assert_no_validation_errors(&device);
}

#[test]
fn split_model_switches_between_render_and_compute() {
    let device = common::device_with(|config| config.encoder_model = EncoderModel::Split);
    let fixture = compute_fixture(&device);

    let graphics = common::graphics_pipeline(&device, &[]);
    let target = common::texture(&device, 4, 4, TextureUsage::RENDER_TARGET);
    let framebuffer = common::framebuffer(&device, &target);

    let mut list = device.create_command_list().unwrap();
    list.begin().unwrap();
    list.set_framebuffer(&framebuffer).unwrap();
    list.set_pipeline(&graphics).unwrap();
    list.draw(3, 1, 0, 0).unwrap();
    assert_eq!(list.encoder_state(), EncoderState::Active);

    list.set_pipeline(&fixture.pipeline).unwrap();
    list.set_compute_resource_set(0, &fixture.set, &[]).unwrap();
    list.dispatch(1, 1, 1).unwrap();
    assert_eq!(list.encoder_state(), EncoderState::ComputeActive);

    list.draw(3, 1, 0, 0).unwrap();
    assert_eq!(list.encoder_state(), EncoderState::Active);
    list.end().unwrap();
    assert_eq!(list.encoder_state(), EncoderState::Idle);

    device.submit_commands(&mut list, None).unwrap();
    device.wait_for_idle().unwrap();

    let stats = device.native().stats();
    assert_eq!(device.native().render_passes_for(framebuffer.native_id()), 2);
    assert_eq!(stats.encoders, 1);
    assert_eq!(stats.pipeline_binds, 3);
    common::assert_no_validation_errors(&device);
}

#[test]
fn sampled_texture_transition_closes_open_pass() {
    let device = common::device();

    let source = common::texture(
        &device,
        4,
        4,
        TextureUsage::RENDER_TARGET | TextureUsage::SAMPLED,
    );
    let target = common::texture(&device, 4, 4, TextureUsage::RENDER_TARGET);
    let source_fb = common::framebuffer(&device, &source);
    let target_fb = common::framebuffer(&device, &target);

    let layout = common::layout(
        &device,
        &[
            (ResourceKind::TextureReadOnly, false),
            (ResourceKind::Sampler, false),
        ],
    );
    let sampler = common::sampler(&device);
    let set = device
        .create_resource_set(&ResourceSetDescription {
            layout: &layout,
            resources: &[
                BindableResource::Texture(&source),
                BindableResource::Sampler(&sampler),
            ],
        })
        .unwrap();

    let plain = common::graphics_pipeline(&device, &[]);
    let sampling = common::graphics_pipeline(&device, &[&layout]);

    let mut list = device.create_command_list().unwrap();
    list.begin().unwrap();

    list.set_framebuffer(&source_fb).unwrap();
    list.clear_color_target(0, [1.0, 0.0, 0.0, 1.0]).unwrap();
    list.set_pipeline(&plain).unwrap();
    list.draw(3, 1, 0, 0).unwrap();

    list.set_framebuffer(&target_fb).unwrap();
    list.draw(3, 1, 0, 0).unwrap();
    assert_eq!(source.state(0, 0), Some(TextureState::ColorAttachment));

    list.set_pipeline(&sampling).unwrap();
    list.set_graphics_resource_set(0, &set, &[]).unwrap();
    list.draw(3, 1, 0, 0).unwrap();
    assert_eq!(source.state(0, 0), Some(TextureState::ShaderReadOnly));

    list.end().unwrap();
    device.submit_commands(&mut list, None).unwrap();
    device.wait_for_idle().unwrap();

    assert_eq!(device.native().render_passes_for(source_fb.native_id()), 1);
    assert_eq!(device.native().render_passes_for(target_fb.native_id()), 2);
    assert_eq!(
        device.native().texture_layout(source.native_id(), 0, 0),
        Some(TextureState::ShaderReadOnly)
    );
    common::assert_no_validation_errors(&device);
}

#[test]
fn textures_return_to_rest_state_at_end() {
    let device = common::device();

    let target = common::texture(
        &device,
        4,
        4,
        TextureUsage::RENDER_TARGET | TextureUsage::SAMPLED,
    );
    let framebuffer = common::framebuffer(&device, &target);
    assert_eq!(target.state(0, 0), Some(TextureState::Undefined));

    let mut list = device.create_command_list().unwrap();
    list.begin().unwrap();
    list.set_framebuffer(&framebuffer).unwrap();
    list.clear_color_target(0, [0.0; 4]).unwrap();
    list.end().unwrap();

    assert_eq!(target.state(0, 0), Some(TextureState::ShaderReadOnly));

    device.submit_commands(&mut list, None).unwrap();
    device.wait_for_idle().unwrap();
    common::assert_no_validation_errors(&device);
}

#[test]
fn discarded_recording_restores_texture_states() {
    let device = common::device();

    let target = common::texture(&device, 4, 4, TextureUsage::RENDER_TARGET);
    let framebuffer = common::framebuffer(&device, &target);
    let pipeline = common::graphics_pipeline(&device, &[]);

    let mut list = device.create_command_list().unwrap();
    list.begin().unwrap();
    list.set_framebuffer(&framebuffer).unwrap();
    list.clear_color_target(0, [1.0; 4]).unwrap();
    list.end().unwrap();
    assert_eq!(target.state(0, 0), Some(TextureState::ColorAttachment));

    list.discard();
    assert_eq!(target.state(0, 0), Some(TextureState::Undefined));

    // Restarting an ended list drops its recording the same way.
    list.begin().unwrap();
    list.set_framebuffer(&framebuffer).unwrap();
    list.clear_color_target(0, [1.0; 4]).unwrap();
    list.end().unwrap();
    list.begin().unwrap();
    assert_eq!(target.state(0, 0), Some(TextureState::Undefined));

    list.set_framebuffer(&framebuffer).unwrap();
    list.set_pipeline(&pipeline).unwrap();
    list.draw(3, 1, 0, 0).unwrap();
    list.end().unwrap();
    device.submit_commands(&mut list, None).unwrap();
    device.wait_for_idle().unwrap();

    assert_eq!(target.state(0, 0), Some(TextureState::ColorAttachment));
    common::assert_no_validation_errors(&device);
}

#[test]
fn dropped_recording_restores_texture_states() {
    let device = common::device();

    let texture = common::texture(&device, 4, 4, TextureUsage::SAMPLED);
    let staging = common::texture(&device, 4, 4, TextureUsage::STAGING);
    let region = TextureRegion::full(&texture.desc(), 0);

    let mut list = device.create_command_list().unwrap();
    list.begin().unwrap();
    list.copy_texture(&staging, &region, &texture, &region).unwrap();
    assert_eq!(texture.state(0, 0), Some(TextureState::ShaderReadOnly));
    drop(list);

    assert_eq!(texture.state(0, 0), Some(TextureState::Undefined));
    assert_eq!(staging.state(0, 0), Some(TextureState::Preinitialized));
}

#[test]
fn in_pass_clear_after_draw() {
    let device = common::device();

    let target = common::texture(&device, 2, 2, TextureUsage::RENDER_TARGET);
    let framebuffer = common::framebuffer(&device, &target);
    let pipeline = common::graphics_pipeline(&device, &[]);

    let mut list = device.create_command_list().unwrap();
    list.begin().unwrap();
    list.set_framebuffer(&framebuffer).unwrap();
    list.set_pipeline(&pipeline).unwrap();
    list.draw(3, 1, 0, 0).unwrap();
    list.clear_color_target(0, [0.0, 0.0, 1.0, 1.0]).unwrap();
    list.end().unwrap();
    device.submit_commands(&mut list, None).unwrap();
    device.wait_for_idle().unwrap();

    assert_eq!(device.native().stats().in_pass_clears, 1);
    assert_eq!(device.native().render_passes_for(framebuffer.native_id()), 1);
    common::assert_no_validation_errors(&device);
}

#[test]
fn draw_requires_bound_state() {
    let device = common::device();

    let layout = common::layout(&device, &[(ResourceKind::UniformBuffer, false)]);
    let pipeline = common::graphics_pipeline(&device, &[&layout]);
    let target = common::texture(&device, 4, 4, TextureUsage::RENDER_TARGET);
    let framebuffer = common::framebuffer(&device, &target);
    let index = common::buffer(&device, 64, BufferUsage::INDEX);

    let mut list = device.create_command_list().unwrap();
    list.begin().unwrap();

    assert_eq!(
        list.draw(3, 1, 0, 0),
        Err(Error::Usage(UsageError::NoFramebuffer))
    );

    list.set_framebuffer(&framebuffer).unwrap();
    assert_eq!(
        list.draw(3, 1, 0, 0),
        Err(Error::Usage(UsageError::NoPipeline {
            kind: PipelineKind::Graphics
        }))
    );

    list.set_pipeline(&pipeline).unwrap();
    assert_eq!(
        list.draw(3, 1, 0, 0),
        Err(Error::Usage(UsageError::ResourceSetNotBound { slot: 0 }))
    );

    let uniforms = common::buffer(&device, 64, BufferUsage::UNIFORM);
    let set = device
        .create_resource_set(&ResourceSetDescription {
            layout: &layout,
            resources: &[BindableResource::Buffer(&uniforms)],
        })
        .unwrap();
    list.set_graphics_resource_set(0, &set, &[]).unwrap();

    assert_eq!(
        list.draw_indexed(3, 1, 0, 0, 0),
        Err(Error::Usage(UsageError::NoIndexBuffer))
    );

    list.set_index_buffer(&index, IndexFormat::U16, 0).unwrap();
    list.draw_indexed(3, 1, 0, 0, 0).unwrap();
    list.end().unwrap();
    device.submit_commands(&mut list, None).unwrap();
    device.wait_for_idle().unwrap();

    common::assert_no_validation_errors(&device);
}

#[test]
fn recording_state_is_enforced() {
    let device = common::device();
    let mut list = device.create_command_list().unwrap();

    assert_eq!(list.end(), Err(Error::Usage(UsageError::NotRecording)));
    assert_eq!(
        list.push_debug_group("frame"),
        Err(Error::Usage(UsageError::NotRecording))
    );

    list.begin().unwrap();
    assert_eq!(list.begin(), Err(Error::Usage(UsageError::AlreadyRecording)));
    assert_eq!(
        device.submit_commands(&mut list, None),
        Err(Error::Usage(UsageError::NotEnded))
    );

    list.end().unwrap();
    device.submit_commands(&mut list, None).unwrap();
    assert_eq!(
        device.submit_commands(&mut list, None),
        Err(Error::Usage(UsageError::NotEnded))
    );
}

#[test]
fn resource_set_slots_are_validated() {
    let device = common::device();

    let uniform_layout = common::layout(&device, &[(ResourceKind::UniformBuffer, false)]);
    let storage_layout = common::storage_layout(&device);
    let pipeline = common::graphics_pipeline(&device, &[&uniform_layout]);

    let storage = common::buffer(&device, 64, BufferUsage::STRUCTURED_READ_WRITE);
    let set = device
        .create_resource_set(&ResourceSetDescription {
            layout: &storage_layout,
            resources: &[BindableResource::Buffer(&storage)],
        })
        .unwrap();

    let mut list = device.create_command_list().unwrap();
    list.begin().unwrap();
    list.set_pipeline(&pipeline).unwrap();

    assert_eq!(
        list.set_graphics_resource_set(0, &set, &[]),
        Err(Error::Usage(UsageError::LayoutMismatch { slot: 0 }))
    );
    assert_eq!(
        list.set_graphics_resource_set(1, &set, &[]),
        Err(Error::Usage(UsageError::SlotOutOfRange { slot: 1, count: 1 }))
    );
}

#[test]
fn dynamic_offsets_are_part_of_the_binding() {
    let device = common::device();

    let layout = common::layout(&device, &[(ResourceKind::UniformBuffer, true)]);
    let uniforms = common::buffer(&device, 512, BufferUsage::UNIFORM);
    let set = device
        .create_resource_set(&ResourceSetDescription {
            layout: &layout,
            resources: &[BindableResource::BufferRange {
                buffer: &uniforms,
                offset: 0,
                size: 256,
            }],
        })
        .unwrap();

    let pipeline = common::graphics_pipeline(&device, &[&layout]);
    let target = common::texture(&device, 4, 4, TextureUsage::RENDER_TARGET);
    let framebuffer = common::framebuffer(&device, &target);

    let mut list = device.create_command_list().unwrap();
    list.begin().unwrap();
    list.set_framebuffer(&framebuffer).unwrap();
    list.set_pipeline(&pipeline).unwrap();

    assert_eq!(
        list.set_graphics_resource_set(0, &set, &[]),
        Err(Error::Usage(UsageError::DynamicOffsetCount {
            slot: 0,
            expected: 1,
            actual: 0
        }))
    );

    list.set_graphics_resource_set(0, &set, &[0]).unwrap();
    list.draw(3, 1, 0, 0).unwrap();
    list.set_graphics_resource_set(0, &set, &[0]).unwrap();
    list.draw(3, 1, 0, 0).unwrap();
    list.set_graphics_resource_set(0, &set, &[256]).unwrap();
    list.draw(3, 1, 0, 0).unwrap();
    list.end().unwrap();
    device.submit_commands(&mut list, None).unwrap();
    device.wait_for_idle().unwrap();

    assert_eq!(
        device
            .native()
            .resource_set_binds_for(PipelineKind::Graphics, 0),
        2
    );
    common::assert_no_validation_errors(&device);
}

#[test]
fn vertex_buffers_are_flushed_once() {
    let device = common::device();

    let pipeline = common::graphics_pipeline(&device, &[]);
    let target = common::texture(&device, 4, 4, TextureUsage::RENDER_TARGET);
    let framebuffer = common::framebuffer(&device, &target);
    let vertices = common::buffer(&device, 256, BufferUsage::VERTEX);
    let uniforms = common::buffer(&device, 256, BufferUsage::UNIFORM);

    let mut list = device.create_command_list().unwrap();
    list.begin().unwrap();

    assert_eq!(
        list.set_vertex_buffer(0, &uniforms, 0),
        Err(Error::Usage(UsageError::MissingUsage { required: "VERTEX" }))
    );

    list.set_framebuffer(&framebuffer).unwrap();
    list.set_pipeline(&pipeline).unwrap();
    assert_eq!(
        list.set_vertex_buffer(1, &vertices, 0),
        Err(Error::Usage(UsageError::VertexBufferOutOfRange { slot: 1, count: 1 }))
    );

    list.set_vertex_buffer(0, &vertices, 0).unwrap();
    list.draw(3, 1, 0, 0).unwrap();
    list.set_vertex_buffer(0, &vertices, 0).unwrap();
    list.draw(3, 1, 0, 0).unwrap();
    list.set_vertex_buffer(0, &vertices, 64).unwrap();
    list.draw(3, 1, 0, 0).unwrap();
    list.end().unwrap();
    device.submit_commands(&mut list, None).unwrap();
    device.wait_for_idle().unwrap();

    assert_eq!(device.native().stats().vertex_buffer_bind_calls, 2);
    common::assert_no_validation_errors(&device);
}

#[test]
fn indirect_commands_check_their_buffer() {
    let device = common::device();
    let fixture = compute_fixture(&device);

    let args = common::buffer(&device, 64, BufferUsage::INDIRECT);
    let plain = common::buffer(&device, 64, BufferUsage::UNIFORM);

    let mut list = device.create_command_list().unwrap();
    list.begin().unwrap();
    list.set_pipeline(&fixture.pipeline).unwrap();
    list.set_compute_resource_set(0, &fixture.set, &[]).unwrap();

    assert_eq!(
        list.dispatch_indirect(&plain, 0),
        Err(Error::Usage(UsageError::MissingUsage {
            required: "INDIRECT"
        }))
    );
    assert_eq!(
        list.dispatch_indirect(&args, 60),
        Err(Error::Usage(UsageError::OutOfBounds {
            start: 60,
            end: 72,
            size: 64
        }))
    );

    list.dispatch_indirect(&args, 52).unwrap();
    list.end().unwrap();
    device.submit_commands(&mut list, None).unwrap();
    device.wait_for_idle().unwrap();

    common::assert_no_validation_errors(&device);
}

#[test]
fn debug_groups_are_closed_at_end() {
    let device = common::device();

    let mut list = device.create_command_list().unwrap();
    list.begin().unwrap();
    assert_eq!(
        list.pop_debug_group(),
        Err(Error::Usage(UsageError::DebugGroupUnderflow))
    );

    list.push_debug_group("frame").unwrap();
    list.insert_debug_marker("marker").unwrap();
    list.push_debug_group("pass").unwrap();
    list.pop_debug_group().unwrap();
    list.end().unwrap();
    device.submit_commands(&mut list, None).unwrap();
    device.wait_for_idle().unwrap();

    // Two pushes, one marker, one pop and one recorded at end.
    assert_eq!(device.native().stats().debug_markers, 5);
    common::assert_no_validation_errors(&device);
}

#[test]
fn overlapping_texture_copy_is_rejected() {
    let device = common::device();

    let texture = device
        .create_texture(&TextureDescription {
            width: 4,
            height: 4,
            mip_levels: 1,
            array_layers: 2,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::SAMPLED,
        })
        .unwrap();

    let layer = |base_array_layer| TextureRegion {
        x: 0,
        y: 0,
        width: 4,
        height: 4,
        mip_level: 0,
        base_array_layer,
        layer_count: 1,
    };

    let mut list = device.create_command_list().unwrap();
    list.begin().unwrap();

    assert!(list
        .copy_texture(&texture, &layer(0), &texture, &layer(0))
        .unwrap_err()
        .is_usage());

    list.copy_texture(&texture, &layer(0), &texture, &layer(1))
        .unwrap();
    list.end().unwrap();
    device.submit_commands(&mut list, None).unwrap();
    device.wait_for_idle().unwrap();

    assert_eq!(texture.state(0, 1), Some(TextureState::ShaderReadOnly));
    common::assert_no_validation_errors(&device);
}

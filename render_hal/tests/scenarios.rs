mod common;

use std::thread;

use render_hal::prelude::*;
use render_hal::soft::Fence;

#[test]
fn buffer_upload_and_readback() {
    let device = common::device();

    let buffer = common::buffer(&device, 1024, BufferUsage::STRUCTURED_READ_ONLY);
    let readback = common::buffer(&device, 1024, BufferUsage::STAGING);

    let data: Vec<u8> = (0..=255).collect();
    device.update_buffer(&buffer, 0, &data).unwrap();

    let mut list = device.create_command_list().unwrap();
    list.begin().unwrap();
    list.copy_buffer(&buffer, 0, &readback, 0, 256).unwrap();
    list.end().unwrap();
    device.submit_commands(&mut list, None).unwrap();
    device.wait_for_idle().unwrap();

    let mapped = device.map_buffer(&readback, MapMode::Read).unwrap();
    let mut out = vec![0; 256];
    mapped.read(0, &mut out).unwrap();
    assert_eq!(out, data);
    device.unmap_buffer(&readback).unwrap();

    assert_eq!(device.staging_buffers_created(), 1);
    assert_eq!(device.staging_buffers_available(), 1);
    assert_eq!(device.pending_submissions(), 0);
    common::assert_no_validation_errors(&device);
}

#[test]
fn shared_set_survives_disposal_until_completion() {
    let device = common::device();

    let layout = common::storage_layout(&device);
    let storage = common::buffer(&device, 256, BufferUsage::STRUCTURED_READ_WRITE);
    let pipeline = common::compute_pipeline(&device, &[&layout]);
    let set = device
        .create_resource_set(&ResourceSetDescription {
            layout: &layout,
            resources: &[BindableResource::Buffer(&storage)],
        })
        .unwrap();

    // Nothing executes until the queue is stepped.
    device.native().hold_queue();

    let fences: Vec<Fence> = thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                s.spawn(|| {
                    let fence = device.create_fence(false).unwrap();

                    let mut list = device.create_command_list().unwrap();
                    list.begin().unwrap();
                    list.set_pipeline(&pipeline).unwrap();
                    list.set_compute_resource_set(0, &set, &[]).unwrap();
                    list.dispatch(4, 1, 1).unwrap();
                    list.end().unwrap();
                    device.submit_commands(&mut list, Some(&fence)).unwrap();

                    fence
                })
            })
            .collect();

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let native = set.native_id();
    set.dispose();

    assert!(device.native().is_alive(native));
    assert!(device.ref_count(set.ref_id()).is_some());

    // Run the first list and the submission signaling its fence.
    device.native().step_queue(2);
    assert!(device
        .wait_for_fences(&[&fences[0], &fences[1]], false, None)
        .unwrap());
    assert_eq!(device.pending_submissions(), 1);
    assert!(device.native().is_alive(native));
    assert_eq!(device.ref_count(set.ref_id()), Some(1));

    device.native().release_queue();
    assert!(device
        .wait_for_fences(&[&fences[0], &fences[1]], true, None)
        .unwrap());

    assert!(!device.native().is_alive(native));
    assert_eq!(device.ref_count(set.ref_id()), None);
    assert!(device.native().is_alive(storage.native_id()));
    assert_eq!(device.native().stats().dispatches, 2);
    common::assert_no_validation_errors(&device);
}

#[test]
fn rebinding_the_same_set_is_elided() {
    let device = common::device();

    let layout = common::layout(&device, &[(ResourceKind::UniformBuffer, false)]);
    let uniforms = common::buffer(&device, 256, BufferUsage::UNIFORM);
    let set = device
        .create_resource_set(&ResourceSetDescription {
            layout: &layout,
            resources: &[BindableResource::Buffer(&uniforms)],
        })
        .unwrap();

    let pipeline = common::graphics_pipeline(&device, &[&layout]);
    let target = common::texture(&device, 8, 8, TextureUsage::RENDER_TARGET);
    let framebuffer = common::framebuffer(&device, &target);

    let mut list = device.create_command_list().unwrap();
    list.begin().unwrap();
    list.set_framebuffer(&framebuffer).unwrap();
    list.set_pipeline(&pipeline).unwrap();
    list.set_graphics_resource_set(0, &set, &[]).unwrap();
    list.draw(3, 1, 0, 0).unwrap();
    list.set_graphics_resource_set(0, &set, &[]).unwrap();
    list.draw(3, 1, 0, 0).unwrap();
    list.end().unwrap();
    device.submit_commands(&mut list, None).unwrap();
    device.wait_for_idle().unwrap();

    let stats = device.native().stats();
    assert_eq!(
        device
            .native()
            .resource_set_binds_for(PipelineKind::Graphics, 0),
        1
    );
    assert_eq!(stats.pipeline_binds, 1);
    assert_eq!(stats.draws, 2);
    assert_eq!(device.native().render_passes_for(framebuffer.native_id()), 1);
    common::assert_no_validation_errors(&device);
}

#[test]
fn clear_on_replaced_framebuffer_is_executed() {
    let device = common::device();

    let first = common::texture(
        &device,
        4,
        4,
        TextureUsage::RENDER_TARGET | TextureUsage::SAMPLED,
    );
    let second = common::texture(&device, 4, 4, TextureUsage::RENDER_TARGET);
    let fb1 = common::framebuffer(&device, &first);
    let fb2 = common::framebuffer(&device, &second);

    let mut list = device.create_command_list().unwrap();
    list.begin().unwrap();
    list.set_framebuffer(&fb1).unwrap();
    list.clear_color_target(0, [1.0, 0.0, 0.0, 1.0]).unwrap();
    list.clear_color_target(0, [0.0, 1.0, 0.0, 1.0]).unwrap();
    list.set_framebuffer(&fb2).unwrap();
    list.end().unwrap();
    device.submit_commands(&mut list, None).unwrap();
    device.wait_for_idle().unwrap();

    assert_eq!(device.native().render_passes_for(fb1.native_id()), 1);
    assert_eq!(device.native().stats().render_passes, 2);

    let texels = common::read_texture(&device, &first);
    assert_eq!(texels.len(), 4 * 4 * 4);
    for texel in texels.chunks_exact(4) {
        assert_eq!(texel, [0, 255, 0, 255]);
    }

    common::assert_no_validation_errors(&device);
}

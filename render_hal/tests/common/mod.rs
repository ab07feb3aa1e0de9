#![allow(dead_code)]

use render_hal::prelude::*;
use render_hal::soft::{
    Buffer, Device, Framebuffer, Pipeline, ResourceLayout, Sampler, Shader, Texture,
};

pub fn device() -> Device {
    device_with(|_| ())
}

pub fn device_with<F>(f: F) -> Device
where
    F: FnOnce(&mut DeviceConfig),
{
    let mut config = DeviceConfig {
        validation: true,
        ..Default::default()
    };
    f(&mut config);
    Device::new(config)
}

pub fn buffer(device: &Device, size: u64, usage: BufferUsage) -> Buffer {
    device
        .create_buffer(&BufferDescription { size, usage })
        .unwrap()
}

pub fn texture(device: &Device, width: u32, height: u32, usage: TextureUsage) -> Texture {
    device
        .create_texture(&TextureDescription {
            width,
            height,
            mip_levels: 1,
            array_layers: 1,
            format: TextureFormat::Rgba8Unorm,
            usage,
        })
        .unwrap()
}

pub fn sampler(device: &Device) -> Sampler {
    device
        .create_sampler(&SamplerDescription::default())
        .unwrap()
}

pub fn shader(device: &Device, stage: ShaderStages) -> Shader {
    device
        .create_shader(&ShaderDescription {
            stage,
            code: vec![0; 16],
            entry_point: "main".to_owned(),
        })
        .unwrap()
}

pub fn layout(device: &Device, elements: &[(ResourceKind, bool)]) -> ResourceLayout {
    let elements = elements
        .iter()
        .enumerate()
        .map(|(index, (kind, dynamic))| ResourceLayoutElement {
            name: format!("binding_{}", index),
            kind: *kind,
            stages: ShaderStages::VERTEX | ShaderStages::FRAGMENT | ShaderStages::COMPUTE,
            dynamic: *dynamic,
        })
        .collect();

    device
        .create_resource_layout(&ResourceLayoutDescription { elements })
        .unwrap()
}

/// A layout with a single read-write structured buffer.
pub fn storage_layout(device: &Device) -> ResourceLayout {
    layout(device, &[(ResourceKind::StructuredBufferReadWrite, false)])
}

pub fn compute_pipeline(device: &Device, layouts: &[&ResourceLayout]) -> Pipeline {
    let shader = shader(device, ShaderStages::COMPUTE);

    device
        .create_compute_pipeline(&ComputePipelineDescription {
            shader: &shader,
            resource_layouts: layouts,
        })
        .unwrap()
}

pub fn graphics_pipeline(device: &Device, layouts: &[&ResourceLayout]) -> Pipeline {
    let vertex = shader(device, ShaderStages::VERTEX);
    let fragment = shader(device, ShaderStages::FRAGMENT);

    device
        .create_graphics_pipeline(&GraphicsPipelineDescription {
            shaders: &[&vertex, &fragment],
            resource_layouts: layouts,
            vertex_layouts: &[VertexLayout {
                stride: 16,
                instance_step_rate: 0,
            }],
            color_targets: 1,
            depth_target: false,
        })
        .unwrap()
}

pub fn framebuffer(device: &Device, target: &Texture) -> Framebuffer {
    device
        .create_framebuffer(&FramebufferDescription {
            color_targets: &[FramebufferAttachment {
                texture: target,
                mip_level: 0,
                array_layer: 0,
            }],
            depth_target: None,
        })
        .unwrap()
}

/// Copies mip 0, layer 0 of `texture` into a staging texture and reads it back.
pub fn read_texture(device: &Device, texture: &Texture) -> Vec<u8> {
    let desc = texture.desc();
    let readback = device
        .create_texture(&TextureDescription {
            mip_levels: 1,
            array_layers: 1,
            usage: TextureUsage::STAGING,
            ..desc
        })
        .unwrap();

    let src = TextureRegion {
        layer_count: 1,
        ..TextureRegion::full(&desc, 0)
    };
    let dst = TextureRegion::full(&readback.desc(), 0);

    let mut list = device.create_command_list().unwrap();
    list.begin().unwrap();
    list.copy_texture(texture, &src, &readback, &dst).unwrap();
    list.end().unwrap();
    device.submit_commands(&mut list, None).unwrap();
    device.wait_for_idle().unwrap();

    let mapped = device.map_texture(&readback, 0, 0, MapMode::Read).unwrap();
    let bytes = mapped.to_vec().unwrap();
    device.unmap_texture(&readback, 0, 0).unwrap();

    bytes
}

#[track_caller]
pub fn assert_no_validation_errors(device: &Device) {
    assert_eq!(
        device.native().validation_errors(),
        0,
        "{:#?}",
        device.native().validation_messages()
    );
}

//! Capability interfaces implemented by every backend.
//!
//! A backend is a set of associated types tied together by [`Backend`]. The
//! shared dirty tracking, lifetime and pooling logic lives in
//! [`tracking`](crate::tracking) and is composed into each backend.

use std::fmt::Debug;
use std::time::Duration;

use crate::error::Result;
use crate::types::{
    BufferDescription, IndexFormat, MapMode, ResourceLayoutDescription, SamplerDescription,
    ShaderDescription, TextureDescription, TextureRegion, VertexLayout, Viewport,
};

pub trait Backend: Sized + Send + Sync + 'static {
    type Device: GraphicsDevice<Self>;
    type CommandList: CommandList<Self>;

    type Buffer: Clone + Debug + Send + Sync;
    type Texture: Clone + Debug + Send + Sync;
    type Sampler: Clone + Debug + Send + Sync;
    type Shader: Clone + Debug + Send + Sync;
    type ResourceLayout: Clone + Debug + Send + Sync;
    type ResourceSet: Clone + Debug + Send + Sync;
    type Pipeline: Clone + Debug + Send + Sync;
    type Framebuffer: Clone + Debug + Send + Sync;
    type Fence: Clone + Debug + Send + Sync;

    /// Host access to mapped memory.
    type Mapped: Debug;
}

/// A resource referenced by a resource set.
#[derive(Debug)]
pub enum BindableResource<'a, B: Backend> {
    Buffer(&'a B::Buffer),
    BufferRange {
        buffer: &'a B::Buffer,
        offset: u64,
        size: u64,
    },
    Texture(&'a B::Texture),
    Sampler(&'a B::Sampler),
}

impl<'a, B: Backend> Clone for BindableResource<'a, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, B: Backend> Copy for BindableResource<'a, B> {}

#[derive(Debug)]
pub struct ResourceSetDescription<'a, B: Backend> {
    pub layout: &'a B::ResourceLayout,
    /// One resource per element of the layout, in element order.
    pub resources: &'a [BindableResource<'a, B>],
}

#[derive(Debug)]
pub struct FramebufferAttachment<'a, B: Backend> {
    pub texture: &'a B::Texture,
    pub mip_level: u32,
    pub array_layer: u32,
}

#[derive(Debug)]
pub struct FramebufferDescription<'a, B: Backend> {
    pub color_targets: &'a [FramebufferAttachment<'a, B>],
    pub depth_target: Option<FramebufferAttachment<'a, B>>,
}

#[derive(Debug)]
pub struct GraphicsPipelineDescription<'a, B: Backend> {
    pub shaders: &'a [&'a B::Shader],
    pub resource_layouts: &'a [&'a B::ResourceLayout],
    pub vertex_layouts: &'a [VertexLayout],
    pub color_targets: u32,
    pub depth_target: bool,
}

#[derive(Debug)]
pub struct ComputePipelineDescription<'a, B: Backend> {
    pub shader: &'a B::Shader,
    pub resource_layouts: &'a [&'a B::ResourceLayout],
}

/// The device: factory, submission and completion bookkeeping.
pub trait GraphicsDevice<B: Backend>: Send + Sync {
    fn create_buffer(&self, desc: &BufferDescription) -> Result<B::Buffer>;

    fn create_texture(&self, desc: &TextureDescription) -> Result<B::Texture>;

    fn create_sampler(&self, desc: &SamplerDescription) -> Result<B::Sampler>;

    fn create_shader(&self, desc: &ShaderDescription) -> Result<B::Shader>;

    fn create_resource_layout(&self, desc: &ResourceLayoutDescription)
        -> Result<B::ResourceLayout>;

    fn create_resource_set(&self, desc: &ResourceSetDescription<'_, B>) -> Result<B::ResourceSet>;

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDescription<'_, B>,
    ) -> Result<B::Pipeline>;

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDescription<'_, B>,
    ) -> Result<B::Pipeline>;

    fn create_framebuffer(&self, desc: &FramebufferDescription<'_, B>) -> Result<B::Framebuffer>;

    fn create_fence(&self, signaled: bool) -> Result<B::Fence>;

    fn create_command_list(&self) -> Result<B::CommandList>;

    /// Submits an ended command list. If `fence` is given it is signaled
    /// once the work completes.
    ///
    /// The list can begin a new recording as soon as this returns.
    fn submit_commands(&self, list: &mut B::CommandList, fence: Option<&B::Fence>) -> Result<()>;

    /// Blocks until all submitted work has completed.
    fn wait_for_idle(&self) -> Result<()>;

    /// Blocks until `fence` is signaled or the timeout expires.
    ///
    /// Returns `false` on timeout.
    fn wait_for_fence(&self, fence: &B::Fence, timeout: Option<Duration>) -> Result<bool>;

    fn wait_for_fences(
        &self,
        fences: &[&B::Fence],
        wait_all: bool,
        timeout: Option<Duration>,
    ) -> Result<bool>;

    fn reset_fence(&self, fence: &B::Fence) -> Result<()>;

    /// Observes completed submissions and releases their resources.
    fn check_submitted_fences(&self);

    fn update_buffer(&self, buffer: &B::Buffer, offset: u64, data: &[u8]) -> Result<()>;

    fn update_texture(&self, texture: &B::Texture, region: &TextureRegion, data: &[u8])
        -> Result<()>;

    fn map_buffer(&self, buffer: &B::Buffer, mode: MapMode) -> Result<B::Mapped>;

    fn map_texture(
        &self,
        texture: &B::Texture,
        mip_level: u32,
        array_layer: u32,
        mode: MapMode,
    ) -> Result<B::Mapped>;

    fn unmap_buffer(&self, buffer: &B::Buffer) -> Result<()>;

    fn unmap_texture(&self, texture: &B::Texture, mip_level: u32, array_layer: u32)
        -> Result<()>;
}

/// Records application calls into native command buffers.
///
/// Every recording method fails with
/// [`UsageError::NotRecording`](crate::error::UsageError::NotRecording)
/// outside of `begin`/`end`.
pub trait CommandList<B: Backend>: Send {
    fn begin(&mut self) -> Result<()>;

    fn end(&mut self) -> Result<()>;

    /// Drops the current recording without submitting it.
    fn discard(&mut self);

    fn set_framebuffer(&mut self, framebuffer: &B::Framebuffer) -> Result<()>;

    fn set_pipeline(&mut self, pipeline: &B::Pipeline) -> Result<()>;

    fn set_vertex_buffer(&mut self, index: u32, buffer: &B::Buffer, offset: u64) -> Result<()>;

    fn set_index_buffer(
        &mut self,
        buffer: &B::Buffer,
        format: IndexFormat,
        offset: u64,
    ) -> Result<()>;

    fn set_graphics_resource_set(
        &mut self,
        slot: u32,
        set: &B::ResourceSet,
        dynamic_offsets: &[u32],
    ) -> Result<()>;

    fn set_compute_resource_set(
        &mut self,
        slot: u32,
        set: &B::ResourceSet,
        dynamic_offsets: &[u32],
    ) -> Result<()>;

    fn set_viewport(&mut self, index: u32, viewport: Viewport) -> Result<()>;

    fn clear_color_target(&mut self, index: u32, color: [f32; 4]) -> Result<()>;

    fn clear_depth_stencil(&mut self, depth: f32, stencil: u8) -> Result<()>;

    fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<()>;

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<()>;

    fn draw_indirect(
        &mut self,
        buffer: &B::Buffer,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) -> Result<()>;

    fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()>;

    fn dispatch_indirect(&mut self, buffer: &B::Buffer, offset: u64) -> Result<()>;

    fn copy_buffer(
        &mut self,
        src: &B::Buffer,
        src_offset: u64,
        dst: &B::Buffer,
        dst_offset: u64,
        size: u64,
    ) -> Result<()>;

    fn copy_texture(
        &mut self,
        src: &B::Texture,
        src_region: &TextureRegion,
        dst: &B::Texture,
        dst_region: &TextureRegion,
    ) -> Result<()>;

    fn update_buffer(&mut self, buffer: &B::Buffer, offset: u64, data: &[u8]) -> Result<()>;

    fn push_debug_group(&mut self, name: &str) -> Result<()>;

    fn pop_debug_group(&mut self) -> Result<()>;

    fn insert_debug_marker(&mut self, name: &str) -> Result<()>;
}

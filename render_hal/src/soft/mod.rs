//! The software reference backend.
//!
//! Native command buffers are executed on a worker thread against host
//! memory. The executor enforces the rules of the selected
//! [`EncoderModel`](crate::config::EncoderModel) and reports violations
//! through [`NativeDevice::validation_errors`].

mod command_list;
mod device;
mod executor;
mod native;
mod queue;
mod resources;

pub use command_list::{CommandList, RecordingState};
pub use device::Device;
pub use native::{NativeDevice, NativeId, StatsSnapshot};
pub use resources::{
    Buffer, Fence, Framebuffer, MappedResource, Pipeline, ResourceLayout, ResourceSet, Sampler,
    Shader, Texture,
};
pub use crate::tracking::pass::EncoderState;

use crate::hal::Backend;

/// The software backend.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Soft;

impl Backend for Soft {
    type Device = Device;
    type CommandList = CommandList;

    type Buffer = Buffer;
    type Texture = Texture;
    type Sampler = Sampler;
    type Shader = Shader;
    type ResourceLayout = ResourceLayout;
    type ResourceSet = ResourceSet;
    type Pipeline = Pipeline;
    type Framebuffer = Framebuffer;
    type Fence = Fence;

    type Mapped = MappedResource;
}

//! Command recording and resource synchronization for GPU backends.
//!
//! Applications record into a [`CommandList`](hal::CommandList) and submit it
//! to a [`GraphicsDevice`](hal::GraphicsDevice). The device keeps every object
//! touched by a submission alive until the submission has completed, pools
//! staging memory for uploads and inserts layout transitions for textures.

pub mod config;
pub mod error;
pub mod hal;
pub mod soft;
pub mod tracking;
pub mod types;

pub use config::DeviceConfig;
pub use error::{DeviceError, Error, Result, UsageError};

pub mod prelude {
    pub use crate::config::{CompletionMode, DeviceConfig, EncoderModel};
    pub use crate::error::{DeviceError, Error, Result, UsageError};
    pub use crate::hal::{
        BindableResource, CommandList as _, ComputePipelineDescription, FramebufferAttachment,
        FramebufferDescription, GraphicsDevice as _, GraphicsPipelineDescription,
        ResourceSetDescription,
    };
    pub use crate::types::*;
}

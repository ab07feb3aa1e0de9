use thiserror::Error;

use crate::types::{MapMode, PipelineKind};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    Usage(#[from] UsageError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl Error {
    /// Returns `true` if the error is a caller bug.
    #[inline]
    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_))
    }

    /// Returns `true` if the error is a fatal device failure.
    #[inline]
    pub fn is_device(&self) -> bool {
        matches!(self, Self::Device(_))
    }
}

/// A fatal failure of the native device.
///
/// Device errors are never retried internally.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("out of device memory: requested {requested} bytes with {available} bytes available")]
    OutOfMemory { requested: u64, available: u64 },
    #[error("device lost")]
    Lost,
    #[error("native failure: {0}")]
    Native(String),
}

/// A synchronous, non-retryable failure caused by invalid use of the API.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("command list is not recording: begin() was not called")]
    NotRecording,
    #[error("command list is already recording")]
    AlreadyRecording,
    #[error("command list must be ended before it is submitted")]
    NotEnded,
    #[error("no framebuffer is bound")]
    NoFramebuffer,
    #[error("no {kind:?} pipeline is bound")]
    NoPipeline { kind: PipelineKind },
    #[error("no index buffer is bound")]
    NoIndexBuffer,
    #[error("resource set slot {slot} is out of range for a pipeline with {count} slots")]
    SlotOutOfRange { slot: u32, count: u32 },
    #[error("vertex buffer slot {slot} is out of range for a pipeline with {count} slots")]
    VertexBufferOutOfRange { slot: u32, count: u32 },
    #[error("resource set layout does not match the pipeline layout at slot {slot}")]
    LayoutMismatch { slot: u32 },
    #[error("resource set at slot {slot} expects {expected} dynamic offsets, got {actual}")]
    DynamicOffsetCount {
        slot: u32,
        expected: u32,
        actual: u32,
    },
    #[error("no resource set is bound at slot {slot}")]
    ResourceSetNotBound { slot: u32 },
    #[error("color target {index} is out of range for a framebuffer with {count} targets")]
    ColorTargetOutOfRange { index: u32, count: u32 },
    #[error("framebuffer has no depth target")]
    NoDepthTarget,
    #[error("resource is missing the required usage {required}")]
    MissingUsage { required: &'static str },
    #[error("range {start}..{end} is out of bounds for a resource of size {size}")]
    OutOfBounds { start: u64, end: u64, size: u64 },
    #[error("map mode {mode:?} is incompatible with the resource usage")]
    MapModeIncompatible { mode: MapMode },
    #[error("resource is already mapped")]
    AlreadyMapped,
    #[error("resource is not mapped")]
    NotMapped,
    #[error("subresources in the range do not share one state")]
    MixedSubresourceStates,
    #[error("resource has been disposed")]
    Disposed,
    #[error("resource was created by a different device")]
    ForeignResource,
    #[error("debug group stack is empty")]
    DebugGroupUnderflow,
    #[error("invalid description: {0}")]
    InvalidDescription(&'static str),
}

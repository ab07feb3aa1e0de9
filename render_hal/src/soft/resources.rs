//! Resource handles of the software backend.
//!
//! Handles are cheap to clone; all clones alias the same object. Every object
//! is registered with the device's [`RefCountRegistry`] and owns one reference
//! on behalf of the application. That reference is released on
//! [`dispose`](Buffer::dispose) or when the last handle is dropped, whichever
//! happens first. The native object is destroyed once every in-flight
//! submission that touched it has completed as well.

use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytemuck::Pod;
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::error::{Result, UsageError};
use crate::tracking::descriptors::DescriptorCounts;
use crate::tracking::ref_count::{RefCountRegistry, RefId};
use crate::tracking::staging::StagingResource;
use crate::tracking::subresource::{SubresourceTracker, TextureState};
use crate::types::{
    BufferDescription, MapMode, PipelineKind, ResourceLayoutDescription, ShaderStages,
    TextureDescription,
};

use super::native::{NativeId, NativeShared};
use super::queue::NativeFence;

/// The application's reference to a registered object.
pub(crate) struct ResourceCore {
    id: RefId,
    native: NativeId,
    device: u64,
    disposed: AtomicBool,
    registry: Arc<RefCountRegistry>,
}

impl ResourceCore {
    pub fn new(id: RefId, native: NativeId, device: u64, registry: Arc<RefCountRegistry>) -> Self {
        Self {
            id,
            native,
            device,
            disposed: AtomicBool::new(false),
            registry,
        }
    }

    /// Releases the application reference. Only the first call has an effect.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.registry.decrement(self.id);
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn ref_id(&self) -> RefId {
        self.id
    }

    /// Fails if the object was disposed or belongs to another device.
    pub fn check(&self, device: u64) -> Result<(), UsageError> {
        if self.device != device {
            return Err(UsageError::ForeignResource);
        }

        if self.is_disposed() {
            return Err(UsageError::Disposed);
        }

        Ok(())
    }
}

impl Drop for ResourceCore {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Debug for ResourceCore {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceCore")
            .field("id", &self.id)
            .field("native", &self.native)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

macro_rules! handle {
    ($name:ident) => {
        impl $name {
            #[inline]
            pub(crate) fn core(&self) -> &ResourceCore {
                &self.0.core
            }

            /// Requests destruction of this object.
            ///
            /// The native object is destroyed once no in-flight submission
            /// references it anymore. Other clones of this handle must not be
            /// used afterwards.
            pub fn dispose(&self) {
                self.0.core.dispose();
            }

            pub fn is_disposed(&self) -> bool {
                self.0.core.is_disposed()
            }

            #[inline]
            pub fn ref_id(&self) -> RefId {
                self.0.core.id
            }

            /// Returns the handle of the backing native object.
            #[inline]
            pub fn native_id(&self) -> NativeId {
                self.0.core.native
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                Arc::ptr_eq(&self.0, &other.0)
            }
        }

        impl Eq for $name {}

        impl Debug for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.0.core).finish()
            }
        }
    };
}

#[derive(Clone)]
pub struct Buffer(pub(crate) Arc<BufferInner>);

pub(crate) struct BufferInner {
    pub core: ResourceCore,
    pub desc: BufferDescription,
    pub mapped: Mutex<Option<MapMode>>,
}

handle!(Buffer);

impl Buffer {
    #[inline]
    pub fn size(&self) -> u64 {
        self.0.desc.size
    }

    #[inline]
    pub fn desc(&self) -> &BufferDescription {
        &self.0.desc
    }

    pub fn is_mapped(&self) -> bool {
        self.0.mapped.lock().is_some()
    }
}

#[derive(Clone)]
pub struct Texture(pub(crate) Arc<TextureInner>);

pub(crate) struct TextureInner {
    pub core: ResourceCore,
    /// Staging textures are reshaped on reuse.
    pub desc: Mutex<TextureDescription>,
    pub states: Mutex<SubresourceTracker<TextureState>>,
    pub mapped: Mutex<HashMap<(u32, u32), MapMode>>,
}

handle!(Texture);

impl Texture {
    pub fn desc(&self) -> TextureDescription {
        *self.0.desc.lock()
    }

    /// Returns the last recorded state of one subresource.
    pub fn state(&self, mip_level: u32, array_layer: u32) -> Option<TextureState> {
        self.0.states.lock().state(mip_level, array_layer)
    }

    pub(crate) fn states(&self) -> &Mutex<SubresourceTracker<TextureState>> {
        &self.0.states
    }
}

#[derive(Clone)]
pub struct Sampler(pub(crate) Arc<SamplerInner>);

pub(crate) struct SamplerInner {
    pub core: ResourceCore,
}

handle!(Sampler);

#[derive(Clone)]
pub struct Shader(pub(crate) Arc<ShaderInner>);

pub(crate) struct ShaderInner {
    pub core: ResourceCore,
    pub stage: ShaderStages,
    pub entry_point: String,
}

handle!(Shader);

impl Shader {
    pub fn stage(&self) -> ShaderStages {
        self.0.stage
    }

    pub fn entry_point(&self) -> &str {
        &self.0.entry_point
    }
}

#[derive(Clone)]
pub struct ResourceLayout(pub(crate) Arc<ResourceLayoutInner>);

pub(crate) struct ResourceLayoutInner {
    pub core: ResourceCore,
    pub desc: ResourceLayoutDescription,
    pub counts: DescriptorCounts,
    pub dynamic_buffers: u32,
}

handle!(ResourceLayout);

impl ResourceLayout {
    pub fn desc(&self) -> &ResourceLayoutDescription {
        &self.0.desc
    }

    /// Returns the number of dynamic offsets a set of this layout is bound with.
    pub fn dynamic_buffers(&self) -> u32 {
        self.0.dynamic_buffers
    }
}

#[derive(Clone)]
pub struct ResourceSet(pub(crate) Arc<ResourceSetInner>);

pub(crate) struct ResourceSetInner {
    pub core: ResourceCore,
    pub layout: ResourceLayout,
    /// Every object referenced by the set. They are captured along with it.
    pub members: Vec<RefId>,
    pub sampled_textures: Vec<Texture>,
    pub storage_textures: Vec<Texture>,
}

handle!(ResourceSet);

impl ResourceSet {
    pub fn layout(&self) -> &ResourceLayout {
        &self.0.layout
    }
}

#[derive(Clone)]
pub struct Pipeline(pub(crate) Arc<PipelineInner>);

pub(crate) struct PipelineInner {
    pub core: ResourceCore,
    pub kind: PipelineKind,
    pub layouts: Vec<ResourceLayout>,
    pub vertex_buffers: u32,
    pub color_targets: u32,
    pub depth_target: bool,
}

handle!(Pipeline);

impl Pipeline {
    pub fn kind(&self) -> PipelineKind {
        self.0.kind
    }

    pub fn resource_layouts(&self) -> &[ResourceLayout] {
        &self.0.layouts
    }
}

/// A texture subresource bound to a framebuffer.
#[derive(Clone, Debug)]
pub(crate) struct Attachment {
    pub texture: Texture,
    pub mip_level: u32,
    pub array_layer: u32,
}

#[derive(Clone)]
pub struct Framebuffer(pub(crate) Arc<FramebufferInner>);

pub(crate) struct FramebufferInner {
    pub core: ResourceCore,
    pub colors: Vec<Attachment>,
    pub depth: Option<Attachment>,
}

handle!(Framebuffer);

impl Framebuffer {
    pub fn color_targets(&self) -> u32 {
        self.0.colors.len() as u32
    }

    pub fn has_depth_target(&self) -> bool {
        self.0.depth.is_some()
    }

    pub(crate) fn attachments(&self) -> impl Iterator<Item = &Attachment> + '_ {
        self.0.colors.iter().chain(&self.0.depth)
    }
}

/// A fence. Fences are not native objects and need no registration.
#[derive(Clone, Debug)]
pub struct Fence {
    pub(crate) native: NativeFence,
    pub(crate) device: u64,
}

impl Fence {
    pub fn is_signaled(&self) -> bool {
        self.native.is_signaled()
    }
}

impl PartialEq for Fence {
    fn eq(&self, other: &Self) -> bool {
        self.native.ptr_eq(&other.native)
    }
}

impl Eq for Fence {}

#[derive(Debug)]
enum MappedTarget {
    Buffer(Buffer),
    Texture {
        texture: Texture,
        mip_level: u32,
        array_layer: u32,
    },
}

/// Host access to a mapped buffer or texture subresource.
///
/// Every access fails with [`UsageError::NotMapped`] once the resource was
/// unmapped.
pub struct MappedResource {
    native: Arc<NativeShared>,
    target: MappedTarget,
    mode: MapMode,
    size: u64,
    row_pitch: u32,
}

impl MappedResource {
    pub(crate) fn buffer(native: Arc<NativeShared>, buffer: Buffer, mode: MapMode) -> Self {
        Self {
            native,
            size: buffer.size(),
            row_pitch: 0,
            target: MappedTarget::Buffer(buffer),
            mode,
        }
    }

    pub(crate) fn texture(
        native: Arc<NativeShared>,
        texture: Texture,
        mip_level: u32,
        array_layer: u32,
        mode: MapMode,
    ) -> Self {
        let desc = texture.desc();

        Self {
            native,
            size: desc.subresource_size(mip_level),
            row_pitch: desc.row_pitch(mip_level),
            target: MappedTarget::Texture {
                texture,
                mip_level,
                array_layer,
            },
            mode,
        }
    }

    #[inline]
    pub fn mode(&self) -> MapMode {
        self.mode
    }

    /// Returns the size of the mapped range in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the distance in bytes between rows. Zero for buffers.
    #[inline]
    pub fn row_pitch(&self) -> u32 {
        self.row_pitch
    }

    fn check(&self, offset: u64, len: usize) -> Result<()> {
        let mapped = match &self.target {
            MappedTarget::Buffer(buffer) => buffer.is_mapped(),
            MappedTarget::Texture {
                texture,
                mip_level,
                array_layer,
            } => texture
                .0
                .mapped
                .lock()
                .contains_key(&(*mip_level, *array_layer)),
        };

        if !mapped {
            return Err(UsageError::NotMapped.into());
        }

        let end = offset.saturating_add(len as u64);
        if end > self.size {
            return Err(UsageError::OutOfBounds {
                start: offset,
                end,
                size: self.size,
            }
            .into());
        }

        Ok(())
    }

    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        if !self.mode.can_read() {
            return Err(UsageError::MapModeIncompatible { mode: self.mode }.into());
        }
        self.check(offset, out.len())?;

        let start = offset as usize;
        match &self.target {
            MappedTarget::Buffer(buffer) => {
                self.native.read_buffer(buffer.native_id(), offset, out)?
            }
            MappedTarget::Texture {
                texture,
                mip_level,
                array_layer,
            } => self.native.with_subresource(
                texture.native_id(),
                *mip_level,
                *array_layer,
                |memory, _| out.copy_from_slice(&memory[start..start + out.len()]),
            )?,
        }

        Ok(())
    }

    /// Reads the whole mapped range.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut out = vec![0; self.size as usize];
        self.read(0, &mut out)?;
        Ok(out)
    }

    /// Reads the mapped range as a slice of `T`. Trailing bytes are ignored.
    pub fn read_as<T>(&self) -> Result<Vec<T>>
    where
        T: Pod,
    {
        let len = self.size as usize / size_of::<T>() * size_of::<T>();
        let mut bytes = vec![0; len];
        self.read(0, &mut bytes)?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        if !self.mode.can_write() {
            return Err(UsageError::MapModeIncompatible { mode: self.mode }.into());
        }
        self.check(offset, data.len())?;

        let start = offset as usize;
        match &self.target {
            MappedTarget::Buffer(buffer) => {
                self.native.write_buffer(buffer.native_id(), offset, data)?
            }
            MappedTarget::Texture {
                texture,
                mip_level,
                array_layer,
            } => self.native.with_subresource(
                texture.native_id(),
                *mip_level,
                *array_layer,
                |memory, _| memory[start..start + data.len()].copy_from_slice(data),
            )?,
        }

        Ok(())
    }
}

impl Debug for MappedResource {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedResource")
            .field("target", &self.target)
            .field("mode", &self.mode)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// A pooled host-visible buffer.
#[derive(Debug)]
pub(crate) struct StagingBuffer(pub Buffer);

impl StagingResource for StagingBuffer {
    fn capacity(&self) -> u64 {
        self.0.size()
    }
}

/// A pooled staging texture. It is reshaped to the extent of every upload.
#[derive(Debug)]
pub(crate) struct StagingTexture {
    pub texture: Texture,
    pub capacity: u64,
}

impl StagingResource for StagingTexture {
    fn capacity(&self) -> u64 {
        self.capacity
    }
}

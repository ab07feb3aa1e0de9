//! Immutable descriptions consumed by the factory calls.

use bitflags::bitflags;
use smallvec::SmallVec;

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STRUCTURED_READ_ONLY = 1 << 3;
        const STRUCTURED_READ_WRITE = 1 << 4;
        const INDIRECT = 1 << 5;
        /// The buffer is persistently mapped and updated from the host.
        const DYNAMIC = 1 << 6;
        /// The buffer is host-visible and can be read back.
        const STAGING = 1 << 7;
    }
}

impl BufferUsage {
    /// Returns `true` if the buffer memory is host-visible for its whole lifetime.
    #[inline]
    pub fn is_host_visible(self) -> bool {
        self.intersects(Self::DYNAMIC | Self::STAGING)
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const SAMPLED = 1 << 0;
        const STORAGE = 1 << 1;
        const RENDER_TARGET = 1 << 2;
        const DEPTH_STENCIL = 1 << 3;
        /// Linear host-visible texture used for uploads and readback.
        const STAGING = 1 << 4;
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    R8Unorm,
    Rgba8Unorm,
    Bgra8Unorm,
    R32Float,
    Rgba32Float,
    D32Float,
    D24UnormS8Uint,
}

impl TextureFormat {
    pub const fn bytes_per_texel(self) -> u32 {
        match self {
            Self::R8Unorm => 1,
            Self::Rgba8Unorm | Self::Bgra8Unorm | Self::R32Float => 4,
            Self::Rgba32Float => 16,
            Self::D32Float | Self::D24UnormS8Uint => 4,
        }
    }

    pub const fn is_depth(self) -> bool {
        matches!(self, Self::D32Float | Self::D24UnormS8Uint)
    }

    pub const fn has_stencil(self) -> bool {
        matches!(self, Self::D24UnormS8Uint)
    }

    /// Encodes a clear color into the texel representation of this format.
    pub fn encode_color(self, color: [f32; 4]) -> SmallVec<[u8; 16]> {
        let unorm = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;

        match self {
            Self::R8Unorm => SmallVec::from_slice(&[unorm(color[0])]),
            Self::Rgba8Unorm => SmallVec::from_slice(&color.map(unorm)),
            Self::Bgra8Unorm => {
                let [r, g, b, a] = color.map(unorm);
                SmallVec::from_slice(&[b, g, r, a])
            }
            Self::R32Float => SmallVec::from_slice(bytemuck::bytes_of(&color[0])),
            Self::Rgba32Float => SmallVec::from_slice(bytemuck::cast_slice(&color)),
            Self::D32Float | Self::D24UnormS8Uint => self.encode_depth_stencil(color[0], 0),
        }
    }

    /// Encodes a depth/stencil clear value into the texel representation of this format.
    pub fn encode_depth_stencil(self, depth: f32, stencil: u8) -> SmallVec<[u8; 16]> {
        match self {
            Self::D24UnormS8Uint => {
                let depth = (depth.clamp(0.0, 1.0) * 0x00FF_FFFF as f32).round() as u32;
                let texel = depth | (u32::from(stencil) << 24);
                SmallVec::from_slice(&texel.to_le_bytes())
            }
            _ => SmallVec::from_slice(&depth.to_le_bytes()),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BufferDescription {
    pub size: u64,
    pub usage: BufferUsage,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TextureDescription {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl TextureDescription {
    /// Returns the extent of the given mip level.
    pub fn mip_extent(&self, mip_level: u32) -> (u32, u32) {
        let width = (self.width >> mip_level).max(1);
        let height = (self.height >> mip_level).max(1);
        (width, height)
    }

    pub fn row_pitch(&self, mip_level: u32) -> u32 {
        self.mip_extent(mip_level).0 * self.format.bytes_per_texel()
    }

    /// Returns the size in bytes of a single subresource at `mip_level`.
    pub fn subresource_size(&self, mip_level: u32) -> u64 {
        let (width, height) = self.mip_extent(mip_level);
        u64::from(width) * u64::from(height) * u64::from(self.format.bytes_per_texel())
    }

    pub fn subresource_count(&self) -> u32 {
        self.mip_levels * self.array_layers
    }

    /// Returns the total size of all subresources.
    pub fn total_size(&self) -> u64 {
        (0..self.mip_levels)
            .map(|mip| self.subresource_size(mip) * u64::from(self.array_layers))
            .sum()
    }

    /// Returns the maximum number of mips for a texture with the given extent.
    pub fn max_mip_levels(width: u32, height: u32) -> u32 {
        32 - width.max(height).max(1).leading_zeros()
    }
}

/// A rectangular region of one mip level over a range of array layers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TextureRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub mip_level: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

impl TextureRegion {
    /// Returns a region covering the full mip level and all layers.
    pub fn full(desc: &TextureDescription, mip_level: u32) -> Self {
        let (width, height) = desc.mip_extent(mip_level);
        Self {
            x: 0,
            y: 0,
            width,
            height,
            mip_level,
            base_array_layer: 0,
            layer_count: desc.array_layers,
        }
    }

    /// Returns `true` if the region lies within the texture described by `desc`.
    pub fn is_within(&self, desc: &TextureDescription) -> bool {
        if self.mip_level >= desc.mip_levels || self.layer_count == 0 {
            return false;
        }

        let (width, height) = desc.mip_extent(self.mip_level);
        u64::from(self.x) + u64::from(self.width) <= u64::from(width)
            && u64::from(self.y) + u64::from(self.height) <= u64::from(height)
            && u64::from(self.base_array_layer) + u64::from(self.layer_count)
                <= u64::from(desc.array_layers)
    }

    pub fn byte_size(&self, format: TextureFormat) -> u64 {
        u64::from(self.width)
            * u64::from(self.height)
            * u64::from(self.layer_count)
            * u64::from(format.bytes_per_texel())
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Nearest,
    #[default]
    Linear,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum AddressMode {
    #[default]
    ClampToEdge,
    Repeat,
    MirrorRepeat,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SamplerDescription {
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
    pub address_mode: AddressMode,
}

/// Opaque backend-native shader code plus its entry point.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShaderDescription {
    pub stage: ShaderStages,
    pub code: Vec<u8>,
    pub entry_point: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    UniformBuffer,
    StructuredBufferReadOnly,
    StructuredBufferReadWrite,
    TextureReadOnly,
    TextureReadWrite,
    Sampler,
}

impl ResourceKind {
    #[inline]
    pub fn is_buffer(self) -> bool {
        matches!(
            self,
            Self::UniformBuffer | Self::StructuredBufferReadOnly | Self::StructuredBufferReadWrite
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceLayoutElement {
    pub name: String,
    pub kind: ResourceKind,
    pub stages: ShaderStages,
    /// The element takes a dynamic offset when the set is bound.
    pub dynamic: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ResourceLayoutDescription {
    pub elements: Vec<ResourceLayoutElement>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U16,
    U32,
}

impl IndexFormat {
    pub const fn size(self) -> u32 {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct VertexLayout {
    pub stride: u32,
    pub instance_step_rate: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    Graphics,
    Compute,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MapMode {
    Read,
    Write,
    ReadWrite,
}

impl MapMode {
    #[inline]
    pub fn can_read(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    #[inline]
    pub fn can_write(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{TextureDescription, TextureFormat, TextureRegion, TextureUsage};

    fn desc(width: u32, height: u32) -> TextureDescription {
        TextureDescription {
            width,
            height,
            mip_levels: TextureDescription::max_mip_levels(width, height),
            array_layers: 2,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::SAMPLED,
        }
    }

    #[test]
    fn mip_chain() {
        let desc = desc(64, 16);
        assert_eq!(desc.mip_levels, 7);
        assert_eq!(desc.mip_extent(0), (64, 16));
        assert_eq!(desc.mip_extent(4), (4, 1));
        assert_eq!(desc.mip_extent(6), (1, 1));
        assert_eq!(desc.subresource_size(1), 32 * 8 * 4);
    }

    #[test]
    fn region_bounds() {
        let desc = desc(16, 16);
        assert!(TextureRegion::full(&desc, 0).is_within(&desc));

        let mut region = TextureRegion::full(&desc, 1);
        region.width = 9;
        assert!(!region.is_within(&desc));

        let mut region = TextureRegion::full(&desc, 0);
        region.base_array_layer = 1;
        assert!(!region.is_within(&desc));
    }

    #[test]
    fn encode_clear_colors() {
        assert_eq!(
            TextureFormat::Rgba8Unorm.encode_color([1.0, 0.0, 0.5, 1.0]).as_slice(),
            &[255, 0, 128, 255]
        );
        assert_eq!(
            TextureFormat::Bgra8Unorm.encode_color([1.0, 0.0, 0.0, 1.0]).as_slice(),
            &[0, 0, 255, 255]
        );
        assert_eq!(
            TextureFormat::D24UnormS8Uint
                .encode_depth_stencil(1.0, 3)
                .as_slice(),
            &[0xFF, 0xFF, 0xFF, 0x03]
        );
    }
}

//! Backend-agnostic value types shared by the recording and execution layers.
//!
//! Everything here is plain data: math aliases, enums that travel through the
//! command parameter stream, and opaque resource descriptors that a backend
//! maps onto its own objects.

mod resources;
mod transform;

pub use resources::{
    Framebuffer, Pipeline, Query, Shader, StreamFormat, SwapChain, Texture, TextureTable,
    VertexAttribute, VertexElement,
};
pub use transform::{MAT4_IDENTITY, Transform, mat4_inverse, mat4_mul};

/// Column-major 4x4 matrix.
pub type Mat4 = [f32; 16];
pub type Vec2 = [f32; 2];
pub type Vec3 = [f32; 3];
pub type Vec4 = [f32; 4];
/// Integer rect: xy = low-left corner, zw = width/height, in pixels.
pub type Vec4i = [i32; 4];

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Points = 0,
    Lines,
    LineStrip,
    Triangles,
    TriangleStrip,
    TriangleFan,
}

impl Primitive {
    pub const fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::Points,
            1 => Self::Lines,
            2 => Self::LineStrip,
            3 => Self::Triangles,
            4 => Self::TriangleStrip,
            5 => Self::TriangleFan,
            _ => return None,
        })
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexType {
    Uint16 = 0,
    Uint32,
}

impl IndexType {
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Uint16),
            1 => Some(Self::Uint32),
            _ => None,
        }
    }

    pub const fn byte_size(self) -> u32 {
        match self {
            Self::Uint16 => 2,
            Self::Uint32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Bgra8Srgb,
    R11G11B10Float,
    Rgba16Float,
    R32Float,
    Rgba32Float,
    Depth32Float,
    Depth24Stencil8,
    Bc1RgbaUnorm,
    Bc3RgbaUnorm,
    Bc7RgbaUnorm,
}

impl TextureFormat {
    pub const fn is_depth(self) -> bool {
        matches!(self, Self::Depth32Float | Self::Depth24Stencil8)
    }

    pub const fn is_compressed(self) -> bool {
        matches!(
            self,
            Self::Bc1RgbaUnorm | Self::Bc3RgbaUnorm | Self::Bc7RgbaUnorm
        )
    }
}

bitflags::bitflags! {
    /// Render buffers addressed by framebuffer clears.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FramebufferMask: u32 {
        const COLOR0 = 1 << 0;
        const COLOR1 = 1 << 1;
        const COLOR2 = 1 << 2;
        const COLOR3 = 1 << 3;
        const COLOR4 = 1 << 4;
        const COLOR5 = 1 << 5;
        const COLOR6 = 1 << 6;
        const COLOR7 = 1 << 7;
        const COLORS = 0x0000_00FF;
        const DEPTH = 0x4000_0000;
        const STENCIL = 0x8000_0000;
        const DEPTH_STENCIL = Self::DEPTH.bits() | Self::STENCIL.bits();
    }
}

/// Per-eye projection and view state for stereo rendering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StereoState {
    pub enable: bool,
    pub context_disable: bool,
    pub skybox: bool,
    pub eye_views: [Mat4; 2],
    pub eye_projections: [Mat4; 2],
}

impl StereoState {
    pub const fn is_stereo(&self) -> bool {
        self.enable && !self.context_disable
    }
}

impl Default for StereoState {
    fn default() -> Self {
        Self {
            enable: false,
            context_disable: false,
            skybox: false,
            eye_views: [MAT4_IDENTITY; 2],
            eye_projections: [MAT4_IDENTITY; 2],
        }
    }
}

//! Opaque resource descriptors referenced by recorded commands.
//!
//! These carry only what a backend needs to create its own objects; the
//! recording layer never looks inside them beyond identity.

use std::sync::Arc;

use crate::{FramebufferMask, TextureFormat};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Texture {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u16,
    pub format: TextureFormat,
}

impl Texture {
    pub fn new_2d(label: impl Into<String>, width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            label: label.into(),
            width,
            height,
            depth: 1,
            mip_levels: 1,
            format,
        }
    }

    /// Number of levels in a full mip chain for this texture.
    pub fn max_mip_levels(&self) -> u16 {
        let largest = self.width.max(self.height).max(self.depth).max(1);
        (u32::BITS - largest.leading_zeros()) as u16
    }
}

/// Bindless-style table of textures bound as one resource.
#[derive(Debug, Clone, Default)]
pub struct TextureTable {
    pub slots: Vec<Option<Arc<Texture>>>,
}

impl TextureTable {
    pub fn with_len(len: usize) -> Self {
        Self {
            slots: vec![None; len],
        }
    }

    pub fn set(&mut self, slot: usize, texture: Arc<Texture>) {
        if slot >= self.slots.len() {
            self.slots.resize(slot + 1, None);
        }
        self.slots[slot] = Some(texture);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexElement {
    Float32x2,
    Float32x3,
    Float32x4,
    Unorm8x4,
    Uint16x4,
    Uint32,
}

impl VertexElement {
    pub const fn byte_size(self) -> u32 {
        match self {
            Self::Float32x2 => 8,
            Self::Float32x3 => 12,
            Self::Float32x4 => 16,
            Self::Unorm8x4 => 4,
            Self::Uint16x4 => 8,
            Self::Uint32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub slot: u32,
    pub channel: u32,
    pub element: VertexElement,
    pub offset: u32,
    pub per_instance: bool,
}

/// Vertex input layout: which attribute slot reads from which buffer channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFormat {
    pub attributes: Vec<VertexAttribute>,
}

impl StreamFormat {
    pub fn with_attribute(mut self, attribute: VertexAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Stride of a channel, derived from the attributes that read it.
    pub fn channel_stride(&self, channel: u32) -> u32 {
        self.attributes
            .iter()
            .filter(|attribute| attribute.channel == channel)
            .map(|attribute| attribute.offset + attribute.element.byte_size())
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shader {
    pub id: u32,
    pub label: String,
}

impl Shader {
    pub fn new(id: u32, label: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    pub label: String,
    pub program: Arc<Shader>,
}

impl Pipeline {
    pub fn new(label: impl Into<String>, program: Arc<Shader>) -> Self {
        Self {
            label: label.into(),
            program,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Framebuffer {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub num_samples: u32,
    pub buffer_mask: FramebufferMask,
}

impl Framebuffer {
    pub fn new(name: impl Into<String>, width: u32, height: u32, buffer_mask: FramebufferMask) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            num_samples: 1,
            buffer_mask,
        }
    }
}

/// Ring of framebuffers advanced once per frame by the backend.
#[derive(Debug, Clone)]
pub struct SwapChain {
    pub framebuffers: Vec<Arc<Framebuffer>>,
}

impl SwapChain {
    pub fn new(framebuffers: Vec<Arc<Framebuffer>>) -> Self {
        assert!(!framebuffers.is_empty(), "swap chain needs at least one framebuffer");
        Self { framebuffers }
    }

    pub fn len(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.framebuffers.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub name: String,
}

impl Query {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

use std::sync::Arc;

use gpu_types::{
    Framebuffer, FramebufferMask, IndexType, Mat4, Pipeline, Primitive, Query, StreamFormat,
    SwapChain, Texture, TextureTable, Transform, Vec2, Vec4, Vec4i,
};
use paging::Buffer;

/// Opcodes recorded by a [`crate::Batch`], one per recording call.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Draw = 0,
    DrawIndexed,
    DrawInstanced,
    DrawIndexedInstanced,
    MultiDrawIndirect,
    MultiDrawIndexedIndirect,

    SetInputFormat,
    SetInputBuffer,
    SetIndexBuffer,
    SetIndirectBuffer,

    SetModelTransform,
    SetViewTransform,
    SetProjectionTransform,
    SetProjectionJitter,
    SetViewportTransform,
    SetDepthRangeTransform,

    SetPipeline,
    SetStateBlendFactor,
    SetStateScissorRect,

    SetUniformBuffer,
    SetResourceBuffer,
    SetResourceTexture,
    SetResourceTextureTable,
    SetResourceFramebufferSwapChainTexture,

    SetFramebuffer,
    SetFramebufferSwapChain,
    ClearFramebuffer,
    Blit,
    GenerateTextureMips,
    GenerateTextureMipsWithPipeline,

    Advance,

    BeginQuery,
    EndQuery,
    GetQuery,

    ResetStages,

    DisableContextViewCorrection,
    RestoreContextViewCorrection,

    DisableContextStereo,
    RestoreContextStereo,

    RunLambda,

    StartNamedCall,
    StopNamedCall,

    PushProfileRange,
    PopProfileRange,
}

impl Command {
    pub const fn is_draw(self) -> bool {
        matches!(
            self,
            Self::Draw
                | Self::DrawIndexed
                | Self::DrawInstanced
                | Self::DrawIndexedInstanced
                | Self::MultiDrawIndirect
                | Self::MultiDrawIndexedIndirect
        )
    }
}

/// One scalar of the flat parameter stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Param {
    Int(i32),
    Uint(u32),
    Float(f32),
    Size(usize),
}

impl Param {
    pub fn as_int(self) -> i32 {
        match self {
            Self::Int(value) => value,
            other => panic!("parameter type mismatch: expected Int, found {other:?}"),
        }
    }

    pub fn as_uint(self) -> u32 {
        match self {
            Self::Uint(value) => value,
            other => panic!("parameter type mismatch: expected Uint, found {other:?}"),
        }
    }

    pub fn as_float(self) -> f32 {
        match self {
            Self::Float(value) => value,
            other => panic!("parameter type mismatch: expected Float, found {other:?}"),
        }
    }

    pub fn as_size(self) -> usize {
        match self {
            Self::Size(value) => value,
            other => panic!("parameter type mismatch: expected Size, found {other:?}"),
        }
    }

    pub fn as_bool(self) -> bool {
        self.as_uint() != 0
    }
}

impl From<i32> for Param {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for Param {
    fn from(value: u32) -> Self {
        Self::Uint(value)
    }
}

impl From<f32> for Param {
    fn from(value: f32) -> Self {
        Self::Float(value)
    }
}

impl From<usize> for Param {
    fn from(value: usize) -> Self {
        Self::Size(value)
    }
}

impl From<bool> for Param {
    fn from(value: bool) -> Self {
        Self::Uint(value as u32)
    }
}

impl From<Primitive> for Param {
    fn from(value: Primitive) -> Self {
        Self::Uint(value as u32)
    }
}

impl From<IndexType> for Param {
    fn from(value: IndexType) -> Self {
        Self::Uint(value as u32)
    }
}

/// A recorded command with its handles resolved against the batch caches.
#[derive(Clone, Copy)]
pub enum BatchCommand<'a> {
    Draw {
        primitive: Primitive,
        num_vertices: u32,
        start_vertex: u32,
    },
    DrawIndexed {
        primitive: Primitive,
        num_indices: u32,
        start_index: u32,
    },
    DrawInstanced {
        num_instances: u32,
        primitive: Primitive,
        num_vertices: u32,
        start_vertex: u32,
        start_instance: u32,
    },
    DrawIndexedInstanced {
        num_instances: u32,
        primitive: Primitive,
        num_indices: u32,
        start_index: u32,
        start_instance: u32,
    },
    MultiDrawIndirect {
        num_commands: u32,
        primitive: Primitive,
    },
    MultiDrawIndexedIndirect {
        num_commands: u32,
        primitive: Primitive,
    },
    SetInputFormat(&'a Arc<StreamFormat>),
    SetInputBuffer {
        channel: u32,
        buffer: &'a Arc<Buffer>,
        offset: usize,
        stride: usize,
    },
    SetIndexBuffer {
        index_type: IndexType,
        buffer: &'a Arc<Buffer>,
        offset: usize,
    },
    SetIndirectBuffer {
        buffer: &'a Arc<Buffer>,
        offset: usize,
        stride: usize,
    },
    SetModelTransform(&'a Transform),
    SetViewTransform {
        view: &'a Transform,
        camera: bool,
    },
    SetProjectionTransform(Mat4),
    SetProjectionJitter(Vec2),
    SetViewportTransform(Vec4i),
    SetDepthRangeTransform {
        near: f32,
        far: f32,
    },
    SetPipeline(&'a Arc<Pipeline>),
    SetStateBlendFactor(Vec4),
    SetStateScissorRect(Vec4i),
    SetUniformBuffer {
        slot: u32,
        buffer: &'a Arc<Buffer>,
        offset: usize,
        size: usize,
    },
    SetResourceBuffer {
        slot: u32,
        buffer: &'a Arc<Buffer>,
    },
    SetResourceTexture {
        slot: u32,
        texture: &'a Arc<Texture>,
    },
    SetResourceTextureTable {
        slot: u32,
        table: &'a Arc<TextureTable>,
    },
    SetResourceFramebufferSwapChainTexture {
        slot: u32,
        swap_chain: &'a Arc<SwapChain>,
        swap_chain_index: u32,
        render_buffer_slot: u32,
    },
    SetFramebuffer(&'a Arc<Framebuffer>),
    SetFramebufferSwapChain {
        swap_chain: &'a Arc<SwapChain>,
        swap_chain_index: u32,
    },
    ClearFramebuffer {
        targets: FramebufferMask,
        color: Vec4,
        depth: f32,
        stencil: i32,
        enable_scissor: bool,
    },
    Blit {
        src: &'a Arc<Framebuffer>,
        src_rect: Vec4i,
        dst: &'a Arc<Framebuffer>,
        dst_rect: Vec4i,
    },
    GenerateTextureMips(&'a Arc<Texture>),
    GenerateTextureMipsWithPipeline {
        texture: &'a Arc<Texture>,
        num_mips: i32,
    },
    Advance(&'a Arc<SwapChain>),
    BeginQuery(&'a Arc<Query>),
    EndQuery(&'a Arc<Query>),
    GetQuery(&'a Arc<Query>),
    ResetStages,
    DisableContextViewCorrection,
    RestoreContextViewCorrection,
    DisableContextStereo,
    RestoreContextStereo,
    RunLambda(&'a (dyn Fn() + Send + Sync)),
    StartNamedCall(&'a str),
    StopNamedCall,
    PushProfileRange(&'a str),
    PopProfileRange,
}

impl BatchCommand<'_> {
    pub fn command(&self) -> Command {
        match self {
            Self::Draw { .. } => Command::Draw,
            Self::DrawIndexed { .. } => Command::DrawIndexed,
            Self::DrawInstanced { .. } => Command::DrawInstanced,
            Self::DrawIndexedInstanced { .. } => Command::DrawIndexedInstanced,
            Self::MultiDrawIndirect { .. } => Command::MultiDrawIndirect,
            Self::MultiDrawIndexedIndirect { .. } => Command::MultiDrawIndexedIndirect,
            Self::SetInputFormat(_) => Command::SetInputFormat,
            Self::SetInputBuffer { .. } => Command::SetInputBuffer,
            Self::SetIndexBuffer { .. } => Command::SetIndexBuffer,
            Self::SetIndirectBuffer { .. } => Command::SetIndirectBuffer,
            Self::SetModelTransform(_) => Command::SetModelTransform,
            Self::SetViewTransform { .. } => Command::SetViewTransform,
            Self::SetProjectionTransform(_) => Command::SetProjectionTransform,
            Self::SetProjectionJitter(_) => Command::SetProjectionJitter,
            Self::SetViewportTransform(_) => Command::SetViewportTransform,
            Self::SetDepthRangeTransform { .. } => Command::SetDepthRangeTransform,
            Self::SetPipeline(_) => Command::SetPipeline,
            Self::SetStateBlendFactor(_) => Command::SetStateBlendFactor,
            Self::SetStateScissorRect(_) => Command::SetStateScissorRect,
            Self::SetUniformBuffer { .. } => Command::SetUniformBuffer,
            Self::SetResourceBuffer { .. } => Command::SetResourceBuffer,
            Self::SetResourceTexture { .. } => Command::SetResourceTexture,
            Self::SetResourceTextureTable { .. } => Command::SetResourceTextureTable,
            Self::SetResourceFramebufferSwapChainTexture { .. } => {
                Command::SetResourceFramebufferSwapChainTexture
            }
            Self::SetFramebuffer(_) => Command::SetFramebuffer,
            Self::SetFramebufferSwapChain { .. } => Command::SetFramebufferSwapChain,
            Self::ClearFramebuffer { .. } => Command::ClearFramebuffer,
            Self::Blit { .. } => Command::Blit,
            Self::GenerateTextureMips(_) => Command::GenerateTextureMips,
            Self::GenerateTextureMipsWithPipeline { .. } => Command::GenerateTextureMipsWithPipeline,
            Self::Advance(_) => Command::Advance,
            Self::BeginQuery(_) => Command::BeginQuery,
            Self::EndQuery(_) => Command::EndQuery,
            Self::GetQuery(_) => Command::GetQuery,
            Self::ResetStages => Command::ResetStages,
            Self::DisableContextViewCorrection => Command::DisableContextViewCorrection,
            Self::RestoreContextViewCorrection => Command::RestoreContextViewCorrection,
            Self::DisableContextStereo => Command::DisableContextStereo,
            Self::RestoreContextStereo => Command::RestoreContextStereo,
            Self::RunLambda(_) => Command::RunLambda,
            Self::StartNamedCall(_) => Command::StartNamedCall,
            Self::StopNamedCall => Command::StopNamedCall,
            Self::PushProfileRange(_) => Command::PushProfileRange,
            Self::PopProfileRange => Command::PopProfileRange,
        }
    }
}

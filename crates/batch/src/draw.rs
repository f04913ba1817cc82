use std::fmt;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use gpu_types::Mat4;
use paging::{Buffer, BufferUsage};
use smallvec::SmallVec;
use static_assertions::const_assert_eq;

use crate::Batch;

/// Per-draw record read by shaders: which transform object, plus a 16-bit
/// user word (skinning/blendshape state).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawCallInfo {
    pub index: u16,
    pub user: u16,
}

const_assert_eq!(std::mem::size_of::<DrawCallInfo>(), 4);

impl DrawCallInfo {
    pub const fn new(index: u16, user: u16) -> Self {
        Self { index, user }
    }
}

/// Storage-buffer layout of one model transform snapshot.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TransformObject {
    pub model: Mat4,
    pub model_inverse: Mat4,
}

const_assert_eq!(std::mem::size_of::<TransformObject>(), 128);

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawIndirectCommand {
    pub count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub base_instance: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawIndexedIndirectCommand {
    pub count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub base_vertex: u32,
    pub base_instance: u32,
}

const_assert_eq!(std::mem::size_of::<DrawIndirectCommand>(), 16);
const_assert_eq!(std::mem::size_of::<DrawIndexedIndirectCommand>(), 20);

pub type NamedCallFunction = Box<dyn FnMut(&mut Batch, &mut NamedBatchData) + Send + Sync>;

/// Instances accumulated under one name during a frame.
///
/// At frame finish `function` runs once with the group, and is expected to
/// emit a single instanced draw of `count()` instances.
#[derive(Default)]
pub struct NamedBatchData {
    pub buffers: SmallVec<[Option<Arc<Buffer>>; 4]>,
    pub function: Option<NamedCallFunction>,
    pub draw_call_infos: Vec<DrawCallInfo>,
}

impl NamedBatchData {
    pub fn count(&self) -> usize {
        self.draw_call_infos.len()
    }

    /// Per-instance buffer `index`, created as a vertex buffer on first use.
    pub fn buffer(&mut self, index: usize) -> Arc<Buffer> {
        if self.buffers.len() <= index {
            self.buffers.resize(index + 1, None);
        }
        Arc::clone(
            self.buffers[index].get_or_insert_with(|| Arc::new(Buffer::new(BufferUsage::VERTEX))),
        )
    }

    pub fn live_buffers(&self) -> impl Iterator<Item = &Arc<Buffer>> {
        self.buffers.iter().flatten()
    }

    pub(crate) fn process(&mut self, batch: &mut Batch) {
        if let Some(mut function) = self.function.take() {
            function(batch, self);
            self.function.get_or_insert(function);
        }
    }
}

impl fmt::Debug for NamedBatchData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedBatchData")
            .field("buffers", &self.buffers.len())
            .field("has_function", &self.function.is_some())
            .field("count", &self.count())
            .finish()
    }
}

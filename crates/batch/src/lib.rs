//! Backend-agnostic command recording.
//!
//! Producers record into a [`Batch`]; a backend walks it with
//! [`Batch::for_each_command`] or [`Batch::decoded_commands`] on the render
//! thread. Buffers referenced by a batch reach the render side as
//! [`paging::Update`]s collected in [`Batch::finish_frame`].

mod batch;
mod cache;
mod command;
mod draw;
mod hints;

#[cfg(test)]
mod tests;

pub use batch::{
    Batch, BufferUpdates, Lambda, MAX_ADDRESSABLE_OBJECTS, MAX_NUM_RESOURCE_BUFFERS,
    MAX_NUM_RESOURCE_TEXTURES, MAX_NUM_UNIFORM_BUFFERS,
};
pub use cache::CacheVector;
pub use command::{BatchCommand, Command, Param};
pub use draw::{
    DrawCallInfo, DrawIndexedIndirectCommand, DrawIndirectCommand, NamedBatchData,
    NamedCallFunction, TransformObject,
};
pub use hints::{BATCH_PREALLOCATE_MIN, BatchAllocHints, BatchCapacities};

//! Paged CPU-side buffer storage with producer/consumer snapshots.
//!
//! A [`Buffer`] owns two byte stores. The primary store is written by the
//! recording thread and tracks which pages changed. [`Buffer::get_update`]
//! packs those pages into an immutable [`Update`], and the render thread
//! replays updates into the shadow store in generation order. Neither side
//! needs to lock the other's store.

mod buffer;
mod page_manager;
mod sysmem;
mod view;


pub use buffer::{
    Buffer, BufferPointer, BufferUsage, Update, buffer_cpu_count, buffer_cpu_mem_size,
};
pub use page_manager::{DEFAULT_PAGE_SIZE, PageManager};
pub use sysmem::Sysmem;
pub use view::{BufferStream, BufferView, StructBuffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("write of {len} bytes at offset {offset} exceeds buffer size {size}")]
    OutOfRange {
        offset: usize,
        len: usize,
        size: usize,
    },
    #[error("element {index} ({element_size} bytes) lies outside a view of {view_size} bytes")]
    ViewOutOfRange {
        index: usize,
        element_size: usize,
        view_size: usize,
    },
}

use std::fmt;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bitflags::bitflags;
use bytemuck::Pod;

use crate::{BufferError, DEFAULT_PAGE_SIZE, PageManager, Sysmem};

bitflags! {
    /// Bit values follow the Vulkan buffer usage flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const UNIFORM = 0x10;
        const RESOURCE = 0x20;
        const INDEX = 0x40;
        const VERTEX = 0x80;
        const INDIRECT = 0x100;
    }
}

impl Default for BufferUsage {
    fn default() -> Self {
        Self::VERTEX
    }
}

pub type BufferPointer = Arc<Buffer>;

static BUFFER_CPU_COUNT: AtomicUsize = AtomicUsize::new(0);
static BUFFER_CPU_MEM_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Number of live [`Buffer`]s in the process.
pub fn buffer_cpu_count() -> usize {
    BUFFER_CPU_COUNT.load(Ordering::Relaxed)
}

/// Bytes allocated by the CPU stores of every live [`Buffer`].
pub fn buffer_cpu_mem_size() -> usize {
    BUFFER_CPU_MEM_SIZE.load(Ordering::Relaxed)
}

fn track_allocation(before: usize, after: usize) {
    if after > before {
        BUFFER_CPU_MEM_SIZE.fetch_add(after - before, Ordering::Relaxed);
    } else if before > after {
        BUFFER_CPU_MEM_SIZE.fetch_sub(before - after, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct Store {
    sysmem: Sysmem,
    pages: PageManager,
    size_dirty: bool,
}

impl Store {
    fn new(page_size: usize) -> Self {
        Self {
            sysmem: Sysmem::new(),
            pages: PageManager::new(page_size),
            size_dirty: false,
        }
    }

    fn resize(&mut self, size: usize) {
        if size != self.sysmem.size() {
            self.size_dirty = true;
        }
        self.pages.accommodate(size);
        self.sysmem.resize(size);
    }

    fn is_dirty(&self) -> bool {
        self.size_dirty || self.pages.is_dirty()
    }
}

/// A GPU-bound byte buffer with a producer-side store and a render-side shadow.
///
/// Writers touch the primary store only. The shadow changes through
/// [`Buffer::apply_update`] or [`Buffer::flush`]. Locks are always taken
/// primary first, then shadow.
pub struct Buffer {
    usage: BufferUsage,
    primary: Mutex<Store>,
    render: Mutex<Store>,
    get_update_count: AtomicU64,
    apply_update_count: AtomicU64,
}

impl Buffer {
    pub fn new(usage: BufferUsage) -> Self {
        Self::with_page_size(usage, DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(usage: BufferUsage, page_size: usize) -> Self {
        BUFFER_CPU_COUNT.fetch_add(1, Ordering::Relaxed);
        Self {
            usage,
            primary: Mutex::new(Store::new(page_size)),
            render: Mutex::new(Store::new(page_size)),
            get_update_count: AtomicU64::new(0),
            apply_update_count: AtomicU64::new(0),
        }
    }

    pub fn from_bytes(usage: BufferUsage, bytes: &[u8]) -> Self {
        let buffer = Self::new(usage);
        buffer.set_data(bytes);
        buffer
    }

    pub fn from_slice<T: Pod>(usage: BufferUsage, values: &[T]) -> Self {
        Self::from_bytes(usage, bytemuck::cast_slice(values))
    }

    fn lock_primary(&self) -> MutexGuard<'_, Store> {
        self.primary
            .lock()
            .expect("buffer primary store lock poisoned")
    }

    fn lock_render(&self) -> MutexGuard<'_, Store> {
        self.render
            .lock()
            .expect("buffer render store lock poisoned")
    }

    fn edit_primary<R>(&self, f: impl FnOnce(&mut Store) -> R) -> R {
        let mut primary = self.lock_primary();
        let before = primary.sysmem.allocated_size();
        let result = f(&mut primary);
        track_allocation(before, primary.sysmem.allocated_size());
        result
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn page_size(&self) -> usize {
        self.lock_primary().pages.page_size()
    }

    pub fn size(&self) -> usize {
        self.lock_primary().sysmem.size()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn is_dirty(&self) -> bool {
        self.lock_primary().is_dirty()
    }

    pub fn dirty_pages(&self) -> Vec<usize> {
        self.lock_primary().pages.marked_pages()
    }

    /// Sets the size and marks the whole new range dirty.
    pub fn resize(&self, size: usize) -> usize {
        self.edit_primary(|store| {
            store.resize(size);
            store.pages.mark_region(0, size);
            size
        })
    }

    pub fn set_data(&self, data: &[u8]) -> usize {
        self.edit_primary(|store| {
            store.resize(data.len());
            store.sysmem.edit_data().copy_from_slice(data);
            store.pages.mark_region(0, data.len());
            data.len()
        })
    }

    /// Overwrites bytes inside the current size. Nothing is written on error.
    pub fn set_sub_data(&self, offset: usize, data: &[u8]) -> Result<usize, BufferError> {
        let mut primary = self.lock_primary();
        let written = primary.sysmem.set_sub_data(offset, data)?;
        primary.pages.mark_region(offset, written);
        Ok(written)
    }

    /// Appends `data` and returns the new size.
    pub fn append(&self, data: &[u8]) -> usize {
        self.edit_primary(|store| {
            let offset = store.sysmem.size();
            let new_size = offset + data.len();
            store.resize(new_size);
            store.sysmem.edit_data()[offset..new_size].copy_from_slice(data);
            store.pages.mark_region(offset, data.len());
            new_size
        })
    }

    pub fn append_slice<T: Pod>(&self, values: &[T]) -> usize {
        self.append(bytemuck::cast_slice(values))
    }

    pub fn set_sub_data_at<T: Pod>(&self, index: usize, value: &T) -> Result<usize, BufferError> {
        self.set_sub_data(index * size_of::<T>(), bytemuck::bytes_of(value))
    }

    /// Mutable access to the whole primary store. Marks every page dirty.
    pub fn edit_data<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut primary = self.lock_primary();
        let size = primary.sysmem.size();
        primary.pages.mark_region(0, size);
        f(primary.sysmem.edit_data())
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(self.lock_primary().sysmem.read_data())
    }

    pub fn get_data(&self) -> Vec<u8> {
        self.with_data(<[u8]>::to_vec)
    }

    pub fn read_at<T: Pod>(&self, byte_offset: usize) -> Result<T, BufferError> {
        let primary = self.lock_primary();
        let bytes = element_range(primary.sysmem.read_data(), byte_offset, size_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    /// Read-modify-write of one `T` at `byte_offset`; marks its pages dirty.
    pub fn edit_at<T: Pod, R>(
        &self,
        byte_offset: usize,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, BufferError> {
        let mut primary = self.lock_primary();
        let len = size_of::<T>();
        let bytes = element_range(primary.sysmem.read_data(), byte_offset, len)?;
        let mut value: T = bytemuck::pod_read_unaligned(bytes);
        let result = f(&mut value);
        primary.sysmem.edit_data()[byte_offset..byte_offset + len]
            .copy_from_slice(bytemuck::bytes_of(&value));
        primary.pages.mark_region(byte_offset, len);
        Ok(result)
    }

    pub fn read_element<T: Pod>(&self, index: usize) -> Result<T, BufferError> {
        self.read_at(index * size_of::<T>())
    }

    pub fn edit_element<T: Pod, R>(
        &self,
        index: usize,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, BufferError> {
        self.edit_at(index * size_of::<T>(), f)
    }

    pub fn num_elements<T: Pod>(&self) -> usize {
        self.size() / size_of::<T>().max(1)
    }

    /// Snapshots the dirty pages of the primary store and clears its marks.
    ///
    /// Returns `None` when nothing changed since the previous snapshot.
    pub fn get_update(self: &Arc<Self>) -> Option<Update> {
        let mut primary = self.lock_primary();
        if !primary.is_dirty() {
            return None;
        }
        let size = primary.sysmem.size();
        let page_size = primary.pages.page_size();
        let dirty_pages: Vec<usize> = primary
            .pages
            .take_marked_pages()
            .into_iter()
            .filter(|page| page * page_size < size)
            .collect();
        primary.size_dirty = false;

        let source = primary.sysmem.read_data();
        let mut dirty_data = vec![0u8; dirty_pages.len() * page_size];
        for (slot, &page) in dirty_pages.iter().enumerate() {
            let start = page * page_size;
            let len = page_size.min(size - start);
            dirty_data[slot * page_size..slot * page_size + len]
                .copy_from_slice(&source[start..start + len]);
        }
        let sequence = self.get_update_count.fetch_add(1, Ordering::AcqRel) + 1;
        drop(primary);

        log::trace!(
            "buffer update #{sequence}: {} dirty pages, size {size}",
            dirty_pages.len()
        );
        Some(Update {
            buffer: Arc::clone(self),
            sequence,
            size,
            page_size,
            dirty_pages,
            dirty_data,
        })
    }

    /// Replays `update` into the shadow store.
    ///
    /// Updates of one buffer must be applied in the order they were taken.
    pub fn apply_update(&self, update: &Update) {
        assert!(
            std::ptr::eq(Arc::as_ptr(&update.buffer), self),
            "buffer update applied to a different buffer"
        );
        let mut render = self.lock_render();
        let expected = self.apply_update_count.load(Ordering::Acquire) + 1;
        assert!(
            update.sequence == expected,
            "buffer updates applied out of order: expected #{expected}, got #{}",
            update.sequence
        );

        let before = render.sysmem.allocated_size();
        render.resize(update.size);
        let page_size = update.page_size;
        let target = render.sysmem.edit_data();
        for (slot, &page) in update.dirty_pages.iter().enumerate() {
            let start = page * page_size;
            if start >= update.size {
                continue;
            }
            let len = page_size.min(update.size - start);
            target[start..start + len]
                .copy_from_slice(&update.dirty_data[slot * page_size..slot * page_size + len]);
        }
        render.pages.mark_pages(&update.dirty_pages);
        track_allocation(before, render.sysmem.allocated_size());
        self.apply_update_count
            .store(update.sequence, Ordering::Release);
    }

    /// Copies the whole primary store into the shadow in one step.
    ///
    /// Single-threaded path: outstanding updates are superseded and must not
    /// be applied afterwards. Their pages are unknown here, so when any are
    /// outstanding every shadow page is marked for upload.
    pub fn flush(&self) {
        let mut primary = self.lock_primary();
        let mut render = self.lock_render();
        let superseded = self.apply_update_count.load(Ordering::Acquire)
            < self.get_update_count.load(Ordering::Acquire);
        if !primary.is_dirty() && !superseded {
            return;
        }
        let before = render.sysmem.allocated_size();
        let size = primary.sysmem.size();
        render.resize(size);
        render.sysmem.set_data(primary.sysmem.read_data());
        let pages = primary.pages.take_marked_pages();
        if superseded {
            render.pages.mark_region(0, size);
        } else {
            render.pages.mark_pages(&pages);
        }
        primary.size_dirty = false;
        track_allocation(before, render.sysmem.allocated_size());
        self.apply_update_count.store(
            self.get_update_count.load(Ordering::Acquire),
            Ordering::Release,
        );
    }

    pub fn get_update_count(&self) -> u64 {
        self.get_update_count.load(Ordering::Acquire)
    }

    pub fn apply_update_count(&self) -> u64 {
        self.apply_update_count.load(Ordering::Acquire)
    }

    pub fn render_size(&self) -> usize {
        self.lock_render().sysmem.size()
    }

    pub fn with_render_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(self.lock_render().sysmem.read_data())
    }

    /// Shadow pages changed since the backend last uploaded; clears them.
    pub fn take_render_dirty_pages(&self) -> Vec<usize> {
        let mut render = self.lock_render();
        render.size_dirty = false;
        render.pages.take_marked_pages()
    }
}

fn element_range(data: &[u8], byte_offset: usize, len: usize) -> Result<&[u8], BufferError> {
    byte_offset
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .map(|end| &data[byte_offset..end])
        .ok_or(BufferError::OutOfRange {
            offset: byte_offset,
            len,
            size: data.len(),
        })
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let allocated = self.primary.get_mut().map_or(0, |s| s.sysmem.allocated_size())
            + self.render.get_mut().map_or(0, |s| s.sysmem.allocated_size());
        track_allocation(allocated, 0);
        BUFFER_CPU_COUNT.fetch_sub(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let primary = self.lock_primary();
        f.debug_struct("Buffer")
            .field("usage", &self.usage)
            .field("size", &primary.sysmem.size())
            .field("dirty_pages", &primary.pages.dirty_page_count())
            .field("get_update_count", &self.get_update_count())
            .field("apply_update_count", &self.apply_update_count())
            .finish()
    }
}

/// Immutable snapshot of a buffer's dirty pages, tagged with its generation.
#[derive(Clone)]
pub struct Update {
    buffer: Arc<Buffer>,
    sequence: u64,
    size: usize,
    page_size: usize,
    dirty_pages: Vec<usize>,
    // dirty_pages.len() * page_size bytes; page n of the list at n * page_size
    dirty_data: Vec<u8>,
}

impl Update {
    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn dirty_pages(&self) -> &[usize] {
        &self.dirty_pages
    }

    pub fn dirty_data(&self) -> &[u8] {
        &self.dirty_data
    }

    pub fn apply(&self) {
        self.buffer.apply_update(self);
    }
}

impl fmt::Debug for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Update")
            .field("buffer", &Arc::as_ptr(&self.buffer))
            .field("sequence", &self.sequence)
            .field("size", &self.size)
            .field("dirty_pages", &self.dirty_pages)
            .finish()
    }
}

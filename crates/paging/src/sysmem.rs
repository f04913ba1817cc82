use crate::BufferError;

const SYSMEM_GRANULE: usize = 8;

/// Growable CPU byte store. Logical size never exceeds the allocation, and the
/// allocation is never released while the store lives.
#[derive(Debug, Clone, Default)]
pub struct Sysmem {
    storage: Vec<u8>,
    size: usize,
}

impl Sysmem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: &[u8]) -> Self {
        let mut sysmem = Self::new();
        sysmem.set_data(data);
        sysmem
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn allocated_size(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Sets the logical size. Bytes exposed by growth read as zero.
    pub fn resize(&mut self, size: usize) -> usize {
        if size > self.storage.len() {
            self.storage.resize(size.next_multiple_of(SYSMEM_GRANULE), 0);
        }
        if size > self.size {
            self.storage[self.size..size].fill(0);
        }
        self.size = size;
        size
    }

    pub fn set_data(&mut self, data: &[u8]) -> usize {
        self.resize(data.len());
        self.storage[..data.len()].copy_from_slice(data);
        data.len()
    }

    pub fn set_sub_data(&mut self, offset: usize, data: &[u8]) -> Result<usize, BufferError> {
        let end = offset.checked_add(data.len());
        match end {
            Some(end) if end <= self.size => {
                self.storage[offset..end].copy_from_slice(data);
                Ok(data.len())
            }
            _ => Err(BufferError::OutOfRange {
                offset,
                len: data.len(),
                size: self.size,
            }),
        }
    }

    /// Appends `data` and returns the new logical size.
    pub fn append(&mut self, data: &[u8]) -> usize {
        let offset = self.size;
        self.resize(offset + data.len());
        self.storage[offset..offset + data.len()].copy_from_slice(data);
        self.size
    }

    pub fn read_data(&self) -> &[u8] {
        &self.storage[..self.size]
    }

    pub fn edit_data(&mut self) -> &mut [u8] {
        &mut self.storage[..self.size]
    }
}

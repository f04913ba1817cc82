use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::Arc;

use bytemuck::Pod;
use gpu_types::IndexType;
use smallvec::SmallVec;

use crate::{Buffer, BufferError, BufferUsage};

/// Strided window into a [`Buffer`].
#[derive(Debug, Clone)]
pub struct BufferView {
    pub buffer: Arc<Buffer>,
    pub offset: usize,
    pub size: usize,
    pub stride: u16,
}

impl BufferView {
    /// View over the buffer's current contents.
    pub fn new(buffer: Arc<Buffer>, stride: u16) -> Self {
        let size = buffer.size();
        Self {
            buffer,
            offset: 0,
            size,
            stride,
        }
    }

    pub fn with_range(buffer: Arc<Buffer>, offset: usize, size: usize, stride: u16) -> Self {
        Self {
            buffer,
            offset,
            size,
            stride,
        }
    }

    pub fn num_elements(&self) -> usize {
        match self.stride {
            0 => 0,
            stride => self.size / stride as usize,
        }
    }

    /// Index width implied by the stride when the view feeds an index buffer.
    pub fn index_type(&self) -> IndexType {
        if self.stride == 2 {
            IndexType::Uint16
        } else {
            IndexType::Uint32
        }
    }

    fn element_offset<T>(&self, index: usize) -> Result<usize, BufferError> {
        let local = index * self.stride as usize;
        let element_size = size_of::<T>();
        if local + element_size > self.size {
            return Err(BufferError::ViewOutOfRange {
                index,
                element_size,
                view_size: self.size,
            });
        }
        Ok(self.offset + local)
    }

    pub fn get<T: Pod>(&self, index: usize) -> Result<T, BufferError> {
        let offset = self.element_offset::<T>(index)?;
        self.buffer.read_at(offset)
    }

    pub fn edit<T: Pod, R>(&self, index: usize, f: impl FnOnce(&mut T) -> R) -> Result<R, BufferError> {
        let offset = self.element_offset::<T>(index)?;
        self.buffer.edit_at(offset, f)
    }

    pub fn set<T: Pod>(&self, index: usize, value: &T) -> Result<(), BufferError> {
        let offset = self.element_offset::<T>(index)?;
        self.buffer
            .set_sub_data(offset, bytemuck::bytes_of(value))
            .map(|_| ())
    }
}

/// Uniform buffer holding exactly one `T`.
#[derive(Debug, Clone)]
pub struct StructBuffer<T> {
    buffer: Arc<Buffer>,
    _marker: PhantomData<T>,
}

impl<T: Pod> StructBuffer<T> {
    pub fn new(value: T) -> Self {
        Self {
            buffer: Arc::new(Buffer::from_bytes(
                BufferUsage::UNIFORM,
                bytemuck::bytes_of(&value),
            )),
            _marker: PhantomData,
        }
    }

    pub fn get(&self) -> T {
        self.buffer
            .read_at(0)
            .unwrap_or_else(|error| panic!("struct buffer lost its value: {error}"))
    }

    pub fn set(&self, value: &T) {
        self.buffer.set_data(bytemuck::bytes_of(value));
    }

    pub fn edit<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.buffer
            .edit_at(0, f)
            .unwrap_or_else(|error| panic!("struct buffer lost its value: {error}"))
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub fn view(&self) -> BufferView {
        BufferView::with_range(
            Arc::clone(&self.buffer),
            0,
            size_of::<T>(),
            size_of::<T>() as u16,
        )
    }
}

impl<T: Pod + Default> Default for StructBuffer<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Buffers bound together as consecutive input channels.
#[derive(Debug, Clone, Default)]
pub struct BufferStream {
    buffers: SmallVec<[Arc<Buffer>; 4]>,
    offsets: SmallVec<[usize; 4]>,
    strides: SmallVec<[u16; 4]>,
}

impl BufferStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_buffer(&mut self, buffer: Arc<Buffer>, offset: usize, stride: u16) {
        self.buffers.push(buffer);
        self.offsets.push(offset);
        self.strides.push(stride);
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn buffers(&self) -> &[Arc<Buffer>] {
        &self.buffers
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn strides(&self) -> &[u16] {
        &self.strides
    }

    /// Channels `range_start..range_start + count` as a new stream.
    pub fn make_range_stream(&self, range_start: usize, count: usize) -> Self {
        let start = range_start.min(self.len());
        let end = (start + count).min(self.len());
        Self {
            buffers: self.buffers[start..end].iter().cloned().collect(),
            offsets: self.offsets[start..end].iter().copied().collect(),
            strides: self.strides[start..end].iter().copied().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Light {
        color: [f32; 3],
        intensity: f32,
    }

    #[test]
    fn strided_view_reads_interleaved_field() {
        // position (u32) followed by an unused u32 per vertex
        let buffer = Arc::new(Buffer::from_slice(BufferUsage::VERTEX, &[10u32, 0, 20, 0, 30, 0]));
        let view = BufferView::new(buffer, 8);
        assert_eq!(view.num_elements(), 3);
        assert_eq!(view.get::<u32>(2), Ok(30));
        assert_eq!(
            view.get::<u32>(3),
            Err(BufferError::ViewOutOfRange {
                index: 3,
                element_size: 4,
                view_size: 24
            })
        );
    }

    #[test]
    fn view_edit_marks_buffer_dirty() {
        let buffer = Arc::new(Buffer::from_slice(BufferUsage::RESOURCE, &[0u16; 8]));
        buffer.get_update();
        let view = BufferView::with_range(Arc::clone(&buffer), 4, 8, 2);
        view.edit::<u16, _>(1, |value| *value = 0xBEEF).expect("in range");
        assert!(buffer.is_dirty());
        assert_eq!(buffer.read_element::<u16>(3), Ok(0xBEEF));
        assert_eq!(view.index_type(), IndexType::Uint16);
    }

    #[test]
    fn struct_buffer_edits_in_place() {
        let light = StructBuffer::new(Light {
            color: [1.0, 1.0, 1.0],
            intensity: 0.5,
        });
        light.edit(|value| value.intensity = 2.0);
        assert_eq!(light.get().intensity, 2.0);
        assert_eq!(light.buffer().size(), 16);
        assert_eq!(light.view().num_elements(), 1);
    }

    #[test]
    fn range_stream_clamps_to_available_channels() {
        let mut stream = BufferStream::new();
        for stride in [12u16, 16, 4] {
            stream.add_buffer(Arc::new(Buffer::new(BufferUsage::VERTEX)), 0, stride);
        }
        let tail = stream.make_range_stream(1, 5);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail.strides(), &[16, 4]);
    }
}

use std::{fmt, sync::Arc};

use ash::vk;

use super::ResourceHeap;
use crate::{
    memory::{MappedPtr, Suballocation},
    MemoryError,
};

/// An owned range of a heap page, ready to be bound to a buffer or image.
///
/// The range goes back to the page when the handle is dropped. Wrap the
/// handle in an `Arc` when more than one resource needs to keep it alive.
pub struct ResourceAllocation {
    heap: Arc<ResourceHeap>,
    page_id: u64,
    memory: vk::DeviceMemory,
    suballocation: Suballocation,
    mapped_ptr: Option<MappedPtr>,
}

impl ResourceAllocation {
    pub(super) fn new(
        heap: Arc<ResourceHeap>,
        page_id: u64,
        memory: vk::DeviceMemory,
        suballocation: Suballocation,
        mapped_ptr: Option<MappedPtr>,
    ) -> Self {
        Self {
            heap,
            page_id,
            memory,
            suballocation,
            mapped_ptr,
        }
    }

    /// The device memory of the page which holds this range.
    pub fn handle(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// The aligned offset of the range within the page.
    pub fn offset(&self) -> vk::DeviceSize {
        self.suballocation.aligned_offset()
    }

    /// The number of bytes which were requested.
    pub fn size(&self) -> vk::DeviceSize {
        self.suballocation.requested_size()
    }

    /// The number of bytes consumed from the page, including padding.
    pub fn allocation_size(&self) -> vk::DeviceSize {
        self.suballocation.allocation_size()
    }

    pub fn allocation_offset(&self) -> vk::DeviceSize {
        self.suballocation.allocation_offset()
    }

    pub fn memory_type_index(&self) -> u32 {
        self.heap.memory_type_index()
    }

    /// A host pointer to the first requested byte, if the page is mapped.
    pub fn mapped_ptr(&self) -> Option<MappedPtr> {
        self.mapped_ptr
    }

    /// Bind this range to a buffer.
    ///
    /// # Safety
    ///
    /// Unsafe because the buffer must be a live buffer created by the same
    /// device which has no memory bound yet, and its memory requirements
    /// must fit inside this range.
    pub unsafe fn bind_buffer(
        &self,
        buffer: vk::Buffer,
    ) -> Result<(), MemoryError> {
        let device = self.heap.memory_manager.device();
        device
            .bind_buffer_memory(buffer, self.memory, self.offset())
            .map_err(|err| {
                log::error!(
                    "Unable to bind buffer {:?} to {:?} at offset {}: {:?}",
                    buffer,
                    self.memory,
                    self.offset(),
                    err
                );
                self.dump_memory();
                MemoryError::UnableToBindBufferMemory(err)
            })
    }

    /// Bind this range to an image.
    ///
    /// # Safety
    ///
    /// Unsafe because the image must be a live image created by the same
    /// device which has no memory bound yet, and its memory requirements
    /// must fit inside this range.
    pub unsafe fn bind_image(&self, image: vk::Image) -> Result<(), MemoryError> {
        let device = self.heap.memory_manager.device();
        device
            .bind_image_memory(image, self.memory, self.offset())
            .map_err(|err| {
                log::error!(
                    "Unable to bind image {:?} to {:?} at offset {}: {:?}",
                    image,
                    self.memory,
                    self.offset(),
                    err
                );
                self.dump_memory();
                MemoryError::UnableToBindImageMemory(err)
            })
    }

    /// Flush host writes to the page which holds this range.
    pub fn flush_mapped_memory(&self) -> Result<(), MemoryError> {
        self.heap
            .with_page_allocation(self.page_id, |page| {
                page.flush_mapped_memory()
            })
            .unwrap_or(Err(MemoryError::DeviceMemoryIsNotMapped))
    }

    /// Make device writes to the page which holds this range visible to the
    /// host.
    pub fn invalidate_mapped_memory(&self) -> Result<(), MemoryError> {
        self.heap
            .with_page_allocation(self.page_id, |page| {
                page.invalidate_mapped_memory()
            })
            .unwrap_or(Err(MemoryError::DeviceMemoryIsNotMapped))
    }

    fn dump_memory(&self) {
        self.heap.memory_manager.dump_memory();
        self.heap.dump_memory();
    }
}

impl Drop for ResourceAllocation {
    fn drop(&mut self) {
        self.heap.release(self.page_id, self.suballocation.id());
    }
}

impl fmt::Debug for ResourceAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceAllocation")
            .field("memory", &self.memory)
            .field("memory_type_index", &self.memory_type_index())
            .field("offset", &self.offset())
            .field("size", &self.size())
            .field("allocation_size", &self.allocation_size())
            .field("mapped_ptr", &self.mapped_ptr)
            .finish()
    }
}

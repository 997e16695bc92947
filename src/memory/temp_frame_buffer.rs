use ash::vk;

use crate::{
    memory::{BufferSuballocation, MappedPtr, ResourceHeapManager},
    MemoryError,
};

/// A range handed out by [TempFrameAllocationBuffer::alloc].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TempAllocInfo {
    pub buffer: vk::Buffer,

    /// The offset of the range within `buffer`, aligned as requested.
    pub offset: vk::DeviceSize,

    pub size: vk::DeviceSize,

    /// A host pointer to the first byte of the range.
    pub data: MappedPtr,
}

struct RingSlot {
    suballocation: BufferSuballocation,
    mapped_ptr: MappedPtr,
    cursor: vk::DeviceSize,
}

/// A ring of linear allocators for data which only lives for one frame,
/// like per-draw vertices and uniforms.
///
/// Each slot is a host-coherent range of a pooled buffer. Allocations bump a
/// cursor through the current slot and [Self::reset] moves on to the next
/// slot, so data written this frame is left alone while earlier frames are
/// still in flight.
pub struct TempFrameAllocationBuffer {
    slots: Vec<RingSlot>,
    slot_size: vk::DeviceSize,
    current: usize,
    peak_used: vk::DeviceSize,
}

impl TempFrameAllocationBuffer {
    /// The usage of the pooled buffer behind every slot.
    pub fn usage() -> vk::BufferUsageFlags {
        vk::BufferUsageFlags::VERTEX_BUFFER
            | vk::BufferUsageFlags::INDEX_BUFFER
            | vk::BufferUsageFlags::UNIFORM_BUFFER
            | vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER
    }

    /// Create one slot of `slot_size` bytes per ring entry configured on the
    /// heap manager.
    pub fn new(
        heap_manager: &ResourceHeapManager,
        slot_size: vk::DeviceSize,
    ) -> Result<Self, MemoryError> {
        let count = heap_manager.config().temp_frame_buffer_count.max(1);
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            let suballocation = heap_manager.allocate_buffer(
                slot_size,
                Self::usage(),
                vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?;
            let mapped_ptr = suballocation
                .mapped_ptr()
                .ok_or(MemoryError::DeviceMemoryIsNotMapped)?;
            slots.push(RingSlot {
                suballocation,
                mapped_ptr,
                cursor: 0,
            });
        }
        Ok(Self {
            slots,
            slot_size,
            current: 0,
            peak_used: 0,
        })
    }

    /// Take `size` bytes from the current slot.
    ///
    /// The offset within the buffer is aligned to `alignment`. Returns None
    /// when the slot does not have room left this frame.
    pub fn alloc(
        &mut self,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
    ) -> Option<TempAllocInfo> {
        let slot = &mut self.slots[self.current];
        let base = slot.suballocation.offset();
        let offset = base
            .checked_add(slot.cursor)?
            .checked_next_multiple_of(alignment.max(1))?;
        let relative = offset.checked_sub(base)?;
        let end = relative.checked_add(size)?;
        if end > self.slot_size {
            return None;
        }
        slot.cursor = end;
        self.peak_used = self.peak_used.max(slot.cursor);
        Some(TempAllocInfo {
            buffer: slot.suballocation.buffer(),
            offset,
            size,
            data: unsafe {
                // Safe because the range was checked against the slot size.
                slot.mapped_ptr.add(relative)
            },
        })
    }

    /// Move to the next slot and rewind it. Call once per frame.
    pub fn reset(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
        self.slots[self.current].cursor = 0;
    }

    pub fn slot_size(&self) -> vk::DeviceSize {
        self.slot_size
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn current_slot(&self) -> usize {
        self.current
    }

    /// The most bytes any slot has used in a single frame.
    pub fn peak_used(&self) -> vk::DeviceSize {
        self.peak_used
    }
}

impl std::fmt::Debug for TempFrameAllocationBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempFrameAllocationBuffer")
            .field("slot_size", &self.slot_size)
            .field("num_slots", &self.slots.len())
            .field("current", &self.current)
            .field("peak_used", &self.peak_used)
            .finish()
    }
}

//! Device memory allocation, suballocation, and reclamation.
//!
//! The tiers, from the device up:
//!
//! - [DeviceMemoryManager] owns every raw `vkAllocateMemory` call.
//! - [SubresourceAllocator] carves one allocation into aligned ranges.
//! - [ResourceHeap] groups pages per memory type and hands out
//!   [ResourceAllocation]s, while [BufferPool] hands out
//!   [BufferSuballocation]s of shared `vk::Buffer` chunks.
//! - [ResourceHeapManager] routes requests to the right heap and runs the
//!   once-per-frame release pass.
//! - [StagingManager] and [TempFrameAllocationBuffer] recycle transfer memory.

mod config;
mod device;
mod device_memory;
mod heap;
mod staging;
mod suballocator;
mod temp_frame_buffer;

pub use self::{
    config::{
        MemoryConfig, DEFAULT_BUFFER_ALLOCATION_SIZE,
        DEFAULT_GPU_ONLY_HEAP_PAGE_SIZE, DEFAULT_STAGING_HEAP_PAGE_SIZE,
        DEFAULT_TEMP_FRAME_BUFFER_COUNT,
        NUM_FRAMES_TO_WAIT_BEFORE_RELEASING_TO_OS,
    },
    device::{AshDevice, DeferredResource, MemoryDevice},
    device_memory::{DeviceMemoryAllocation, DeviceMemoryManager, MappedPtr},
    heap::{
        BufferPool, BufferSuballocation, FrameCounter, HeapStats,
        ResourceAllocation, ResourceHeap, ResourceHeapManager, ResourceKind,
    },
    staging::{StagingBuffer, StagingManager},
    suballocator::{FreeBlock, Suballocation, SubresourceAllocator},
    temp_frame_buffer::{TempAllocInfo, TempFrameAllocationBuffer},
};

#[cfg(test)]
pub(crate) use self::device::fake_device::FakeDevice;

/// Round `value` up to the next multiple of `alignment`.
///
/// An alignment of zero is treated as one.
pub(crate) fn align_up(
    value: ash::vk::DeviceSize,
    alignment: ash::vk::DeviceSize,
) -> ash::vk::DeviceSize {
    let alignment = alignment.max(1);
    value.div_ceil(alignment) * alignment
}

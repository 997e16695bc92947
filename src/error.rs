use ash::vk;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Device memory allocations must request at least one byte")]
    ZeroSizedAllocation,

    #[error("Memory type index {} is not reported by the device", .0)]
    InvalidMemoryTypeIndex(u32),

    #[error(
        "No memory type could be found for flags {:?} and type bits {:#b}",
        .0,
        .1
    )]
    MemoryTypeNotFound(vk::MemoryPropertyFlags, u32),

    #[error("No resource heap exists for memory type index {}", .0)]
    NoHeapForMemoryType(u32),

    #[error(
        "Unable to allocate {} bytes of device memory with type index {}",
        .size,
        .memory_type_index
    )]
    UnableToAllocateDeviceMemory {
        size: vk::DeviceSize,
        memory_type_index: u32,
        source: vk::Result,
    },

    #[error("Device memory is not host visible and cannot be mapped")]
    MemoryIsNotHostVisible,

    #[error("Device memory is already mapped, did you forget to unmap it?")]
    MemoryIsAlreadyMapped,

    #[error("Device memory is not mapped, did you try calling .map()?")]
    DeviceMemoryIsNotMapped,

    #[error(
        "Unable to map {} bytes at offset {} of a {} byte allocation",
        .size,
        .offset,
        .allocation_size
    )]
    MapRangeOutOfBounds {
        size: vk::DeviceSize,
        offset: vk::DeviceSize,
        allocation_size: vk::DeviceSize,
    },

    #[error("Unable to map device memory")]
    UnableToMapDeviceMemory(#[source] vk::Result),

    #[error("Unable to flush mapped device memory")]
    UnableToFlushMappedMemory(#[source] vk::Result),

    #[error("Unable to invalidate mapped device memory")]
    UnableToInvalidateMappedMemory(#[source] vk::Result),

    #[error("Unable to bind device memory to buffer")]
    UnableToBindBufferMemory(#[source] vk::Result),

    #[error("Unable to bind device memory to image")]
    UnableToBindImageMemory(#[source] vk::Result),

    #[error(
        "Unable to create a new device buffer for {} bytes with flags {:?}",
        .size,
        .usage
    )]
    UnableToCreateBuffer {
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        source: vk::Result,
    },

    #[error("Unable to create a new fence")]
    UnableToCreateFence(#[source] vk::Result),

    #[error("Error while checking fence status")]
    UnexpectedFenceStatusError(#[source] vk::Result),

    #[error("Error while waiting for fence")]
    UnexpectedFenceWaitError(#[source] vk::Result),

    #[error("Error while resetting fence")]
    UnexpectedFenceResetError(#[source] vk::Result),

    #[error("Fence {:?} was not allocated by this fence manager", .0)]
    FenceNotOwnedByManager(vk::Fence),
}

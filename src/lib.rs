//! A Vulkan device memory manager.
//!
//! Raw device allocations are carved into pages and buffer chunks, handed out
//! as move-only suballocation handles, and reclaimed a few frames after they
//! empty. Staging buffers and generic device objects are recycled or destroyed
//! only once the fences guarding their last use have signaled.

mod error;

pub mod deferred_deletion;
pub mod logging;
pub mod memory;
pub mod sync;

pub use self::{
    deferred_deletion::DeferredDeletionQueue,
    error::MemoryError,
    memory::{
        AshDevice, BufferPool, BufferSuballocation, DeferredResource,
        DeviceMemoryAllocation, DeviceMemoryManager, HeapStats, MemoryConfig,
        MemoryDevice, ResourceAllocation, ResourceHeap, ResourceHeapManager,
        ResourceKind, StagingBuffer, StagingManager, SubresourceAllocator,
        Suballocation, TempAllocInfo, TempFrameAllocationBuffer,
    },
    sync::{
        Fence, FenceManager, FenceState, SubmissionTracker,
        TrackedCommandBuffer,
    },
};

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn managers_can_be_shared_between_threads() {
        assert_send_sync::<DeviceMemoryManager>();
        assert_send_sync::<ResourceHeapManager>();
        assert_send_sync::<ResourceHeap>();
        assert_send_sync::<BufferPool>();
        assert_send_sync::<StagingManager>();
        assert_send_sync::<FenceManager>();
        assert_send_sync::<TrackedCommandBuffer>();
        assert_send_sync::<DeferredDeletionQueue>();
        assert_send_sync::<AshDevice>();
    }

    #[test]
    fn handles_can_move_between_threads() {
        fn assert_send<T: Send>() {}

        assert_send::<ResourceAllocation>();
        assert_send::<BufferSuballocation>();
        assert_send::<StagingBuffer>();
        assert_send::<DeviceMemoryAllocation>();
        assert_send::<Fence>();
        assert_send::<TempFrameAllocationBuffer>();
    }
}

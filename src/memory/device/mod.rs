mod ash_device;

#[cfg(test)]
pub(crate) mod fake_device;

use std::ffi::c_void;

use ash::{prelude::VkResult, vk};

pub use self::ash_device::AshDevice;

/// A device object whose destruction has to wait until the GPU is finished
/// with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeferredResource {
    RenderPass(vk::RenderPass),
    Buffer(vk::Buffer),
    BufferView(vk::BufferView),
    Image(vk::Image),
    ImageView(vk::ImageView),
    Pipeline(vk::Pipeline),
    PipelineLayout(vk::PipelineLayout),
    Framebuffer(vk::Framebuffer),
    DescriptorSetLayout(vk::DescriptorSetLayout),
    Sampler(vk::Sampler),
    Semaphore(vk::Semaphore),
    ShaderModule(vk::ShaderModule),
}

/// The slice of the Vulkan device API used by the memory manager.
///
/// Nothing above this trait talks to the graphics API directly, so the whole
/// allocator stack can run against an in-memory device in tests.
pub trait MemoryDevice: Send + Sync {
    /// The memory heaps and memory types reported by the physical device.
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties;

    /// The physical device limits.
    fn limits(&self) -> vk::PhysicalDeviceLimits;

    /// Allocate a block of device memory.
    ///
    /// # Safety
    ///
    /// Unsafe because the caller is responsible for calling free_memory when
    /// the memory is no longer needed.
    unsafe fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> VkResult<vk::DeviceMemory>;

    /// Free a block of device memory.
    ///
    /// # Safety
    ///
    /// Unsafe because the caller must ensure that no GPU operations refer to
    /// the memory.
    unsafe fn free_memory(&self, memory: vk::DeviceMemory);

    /// Map a range of host-visible device memory.
    ///
    /// # Safety
    ///
    /// Unsafe because the memory must be host visible and not already mapped.
    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<*mut c_void>;

    /// # Safety
    ///
    /// Unsafe because any pointer returned by map_memory is invalidated.
    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory);

    /// # Safety
    ///
    /// Unsafe because the memory must currently be mapped.
    unsafe fn flush_mapped_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()>;

    /// # Safety
    ///
    /// Unsafe because the memory must currently be mapped.
    unsafe fn invalidate_mapped_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()>;

    /// # Safety
    ///
    /// Unsafe because the buffer must not already be bound and the offset
    /// must satisfy the buffer's memory requirements.
    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()>;

    /// # Safety
    ///
    /// Unsafe because the image must not already be bound and the offset
    /// must satisfy the image's memory requirements.
    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()>;

    /// Create an exclusive-access buffer with no memory bound.
    ///
    /// # Safety
    ///
    /// Unsafe because the caller must destroy the buffer.
    unsafe fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> VkResult<vk::Buffer>;

    /// # Safety
    ///
    /// Unsafe because the buffer must be a live buffer from this device.
    unsafe fn get_buffer_memory_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> vk::MemoryRequirements;

    /// # Safety
    ///
    /// Unsafe because the GPU must be finished with the buffer.
    unsafe fn destroy_buffer(&self, buffer: vk::Buffer);

    /// Create an unsignaled fence.
    ///
    /// # Safety
    ///
    /// Unsafe because the caller must destroy the fence.
    unsafe fn create_fence(&self) -> VkResult<vk::Fence>;

    /// Poll the fence once. Ok(false) means the fence is not ready.
    fn get_fence_status(&self, fence: vk::Fence) -> VkResult<bool>;

    /// Block until the fence signals or the timeout elapses. Ok(false) means
    /// the wait timed out.
    fn wait_for_fence(
        &self,
        fence: vk::Fence,
        timeout_in_nanoseconds: u64,
    ) -> VkResult<bool>;

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;

    /// # Safety
    ///
    /// Unsafe because no pending queue submission may reference the fence.
    unsafe fn destroy_fence(&self, fence: vk::Fence);

    /// Destroy any object that the deferred deletion queue can hold.
    ///
    /// # Safety
    ///
    /// Unsafe because the GPU must be finished with the object.
    unsafe fn destroy_object(&self, resource: DeferredResource);
}

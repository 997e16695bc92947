use std::ffi::c_void;

use ash::{prelude::VkResult, vk};

use super::{DeferredResource, MemoryDevice};

/// The memory device backed by a real Vulkan logical device.
///
/// # Safety
///
/// This struct retains a clone of the Vulkan logical device. It is the
/// responsibility of the application to drop every memory manager built on
/// top of it before the device is destroyed.
pub struct AshDevice {
    logical_device: ash::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    limits: vk::PhysicalDeviceLimits,
}

impl AshDevice {
    /// Capture the physical device's memory properties and limits alongside
    /// the logical device.
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        logical_device: ash::Device,
    ) -> Self {
        let (memory_properties, limits) = unsafe {
            (
                instance.get_physical_device_memory_properties(physical_device),
                instance.get_physical_device_properties(physical_device).limits,
            )
        };
        Self {
            logical_device,
            memory_properties,
            limits,
        }
    }

    /// The raw ash device.
    pub fn logical_device(&self) -> &ash::Device {
        &self.logical_device
    }
}

impl MemoryDevice for AshDevice {
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        self.memory_properties
    }

    fn limits(&self) -> vk::PhysicalDeviceLimits {
        self.limits
    }

    unsafe fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> VkResult<vk::DeviceMemory> {
        // Memory returned by the device always meets the system alignment
        // requirements so no alignment is requested here.
        let allocate_info = vk::MemoryAllocateInfo {
            allocation_size: size,
            memory_type_index,
            ..Default::default()
        };
        self.logical_device.allocate_memory(&allocate_info, None)
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        self.logical_device.free_memory(memory, None)
    }

    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<*mut c_void> {
        self.logical_device.map_memory(
            memory,
            offset,
            size,
            vk::MemoryMapFlags::empty(),
        )
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        self.logical_device.unmap_memory(memory)
    }

    unsafe fn flush_mapped_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()> {
        self.logical_device
            .flush_mapped_memory_ranges(&[vk::MappedMemoryRange {
                memory,
                offset,
                size,
                ..Default::default()
            }])
    }

    unsafe fn invalidate_mapped_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()> {
        self.logical_device
            .invalidate_mapped_memory_ranges(&[vk::MappedMemoryRange {
                memory,
                offset,
                size,
                ..Default::default()
            }])
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        self.logical_device.bind_buffer_memory(buffer, memory, offset)
    }

    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        self.logical_device.bind_image_memory(image, memory, offset)
    }

    unsafe fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> VkResult<vk::Buffer> {
        let create_info = vk::BufferCreateInfo {
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        self.logical_device.create_buffer(&create_info, None)
    }

    unsafe fn get_buffer_memory_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> vk::MemoryRequirements {
        self.logical_device.get_buffer_memory_requirements(buffer)
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.logical_device.destroy_buffer(buffer, None)
    }

    unsafe fn create_fence(&self) -> VkResult<vk::Fence> {
        let create_info = vk::FenceCreateInfo::default();
        self.logical_device.create_fence(&create_info, None)
    }

    fn get_fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        unsafe { self.logical_device.get_fence_status(fence) }
    }

    fn wait_for_fence(
        &self,
        fence: vk::Fence,
        timeout_in_nanoseconds: u64,
    ) -> VkResult<bool> {
        let result = unsafe {
            self.logical_device.wait_for_fences(
                &[fence],
                true,
                timeout_in_nanoseconds,
            )
        };
        match result {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.logical_device.reset_fences(&[fence]) }
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        self.logical_device.destroy_fence(fence, None)
    }

    unsafe fn destroy_object(&self, resource: DeferredResource) {
        let device = &self.logical_device;
        match resource {
            DeferredResource::RenderPass(raw) => {
                device.destroy_render_pass(raw, None)
            }
            DeferredResource::Buffer(raw) => device.destroy_buffer(raw, None),
            DeferredResource::BufferView(raw) => {
                device.destroy_buffer_view(raw, None)
            }
            DeferredResource::Image(raw) => device.destroy_image(raw, None),
            DeferredResource::ImageView(raw) => {
                device.destroy_image_view(raw, None)
            }
            DeferredResource::Pipeline(raw) => {
                device.destroy_pipeline(raw, None)
            }
            DeferredResource::PipelineLayout(raw) => {
                device.destroy_pipeline_layout(raw, None)
            }
            DeferredResource::Framebuffer(raw) => {
                device.destroy_framebuffer(raw, None)
            }
            DeferredResource::DescriptorSetLayout(raw) => {
                device.destroy_descriptor_set_layout(raw, None)
            }
            DeferredResource::Sampler(raw) => device.destroy_sampler(raw, None),
            DeferredResource::Semaphore(raw) => {
                device.destroy_semaphore(raw, None)
            }
            DeferredResource::ShaderModule(raw) => {
                device.destroy_shader_module(raw, None)
            }
        }
    }
}

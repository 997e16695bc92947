use std::{collections::HashMap, ffi::c_void, sync::Mutex};

use ash::{
    prelude::VkResult,
    vk::{self, Handle},
};

use super::{DeferredResource, MemoryDevice};

pub(crate) const DEVICE_LOCAL_TYPE: u32 = 0;
pub(crate) const UPLOAD_TYPE: u32 = 1;
pub(crate) const DOWNLOAD_TYPE: u32 = 2;

pub(crate) const BUFFER_ALIGNMENT: vk::DeviceSize = 16;

struct FakeMemory {
    size: vk::DeviceSize,
    host_bytes: Vec<u8>,
    mapped: bool,
}

struct FakeBuffer {
    size: vk::DeviceSize,
    bound: Option<(vk::DeviceMemory, vk::DeviceSize)>,
}

#[derive(Default)]
struct FakeState {
    next_handle: u64,
    memory: HashMap<vk::DeviceMemory, FakeMemory>,
    allocate_calls: usize,
    fail_allocations: bool,
    fail_binds: bool,
    fail_fence_resets: bool,
    buffers: HashMap<vk::Buffer, FakeBuffer>,
    created_buffers: usize,
    destroyed_buffers: Vec<vk::Buffer>,
    bound_images: HashMap<vk::Image, (vk::DeviceMemory, vk::DeviceSize)>,
    fences: HashMap<vk::Fence, bool>,
    fence_polls: usize,
    destroyed_fences: usize,
    destroyed_objects: Vec<DeferredResource>,
}

impl FakeState {
    fn next_raw(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

/// An in-memory device used to exercise the allocator stack in tests.
///
/// Type 0 is device local, type 1 is host visible and coherent, and type 2 is
/// host visible and cached. Host-visible allocations are backed by real host
/// bytes so mapped pointers can be written.
pub(crate) struct FakeDevice {
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    limits: vk::PhysicalDeviceLimits,
    state: Mutex<FakeState>,
}

impl FakeDevice {
    pub(crate) fn new() -> Self {
        let mut memory_properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 3,
            memory_heap_count: 2,
            ..Default::default()
        };
        memory_properties.memory_heaps[0] = vk::MemoryHeap {
            size: 1024 * 1024 * 1024,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        memory_properties.memory_heaps[1] = vk::MemoryHeap {
            size: 256 * 1024 * 1024,
            flags: vk::MemoryHeapFlags::empty(),
        };
        memory_properties.memory_types[DEVICE_LOCAL_TYPE as usize] =
            vk::MemoryType {
                property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                heap_index: 0,
            };
        memory_properties.memory_types[UPLOAD_TYPE as usize] =
            vk::MemoryType {
                property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
                heap_index: 1,
            };
        memory_properties.memory_types[DOWNLOAD_TYPE as usize] =
            vk::MemoryType {
                property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_CACHED,
                heap_index: 1,
            };
        Self::with_memory_properties(memory_properties)
    }

    pub(crate) fn with_memory_properties(
        memory_properties: vk::PhysicalDeviceMemoryProperties,
    ) -> Self {
        let limits = vk::PhysicalDeviceLimits {
            max_memory_allocation_count: 4096,
            min_uniform_buffer_offset_alignment: 256,
            min_texel_buffer_offset_alignment: 32,
            min_storage_buffer_offset_alignment: 64,
            non_coherent_atom_size: 64,
            ..Default::default()
        };
        Self {
            memory_properties,
            limits,
            state: Mutex::new(FakeState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake device lock poisoned")
    }

    pub(crate) fn fail_allocations(&self, fail: bool) {
        self.state().fail_allocations = fail;
    }

    pub(crate) fn fail_binds(&self, fail: bool) {
        self.state().fail_binds = fail;
    }

    pub(crate) fn fail_fence_resets(&self, fail: bool) {
        self.state().fail_fence_resets = fail;
    }

    pub(crate) fn live_allocation_count(&self) -> usize {
        self.state().memory.len()
    }

    pub(crate) fn allocate_calls(&self) -> usize {
        self.state().allocate_calls
    }

    pub(crate) fn is_mapped(&self, memory: vk::DeviceMemory) -> bool {
        self.state()
            .memory
            .get(&memory)
            .map(|memory| memory.mapped)
            .unwrap_or(false)
    }

    pub(crate) fn memory_size(&self, memory: vk::DeviceMemory) -> Option<u64> {
        self.state().memory.get(&memory).map(|memory| memory.size)
    }

    pub(crate) fn buffer_binding(
        &self,
        buffer: vk::Buffer,
    ) -> Option<(vk::DeviceMemory, vk::DeviceSize)> {
        self.state().buffers.get(&buffer).and_then(|buffer| buffer.bound)
    }

    pub(crate) fn image_binding(
        &self,
        image: vk::Image,
    ) -> Option<(vk::DeviceMemory, vk::DeviceSize)> {
        self.state().bound_images.get(&image).copied()
    }

    pub(crate) fn created_buffers(&self) -> usize {
        self.state().created_buffers
    }

    pub(crate) fn live_buffer_count(&self) -> usize {
        self.state().buffers.len()
    }

    pub(crate) fn destroyed_buffers(&self) -> Vec<vk::Buffer> {
        self.state().destroyed_buffers.clone()
    }

    pub(crate) fn signal_fence(&self, fence: vk::Fence) {
        if let Some(signaled) = self.state().fences.get_mut(&fence) {
            *signaled = true;
        }
    }

    pub(crate) fn fence_is_signaled(&self, fence: vk::Fence) -> bool {
        self.state().fences.get(&fence).copied().unwrap_or(false)
    }

    pub(crate) fn fence_polls(&self) -> usize {
        self.state().fence_polls
    }

    pub(crate) fn live_fence_count(&self) -> usize {
        self.state().fences.len()
    }

    pub(crate) fn destroyed_fences(&self) -> usize {
        self.state().destroyed_fences
    }

    pub(crate) fn destroyed_objects(&self) -> Vec<DeferredResource> {
        self.state().destroyed_objects.clone()
    }

    /// Create a standalone image handle for bind tests.
    pub(crate) fn new_image(&self) -> vk::Image {
        vk::Image::from_raw(self.state().next_raw())
    }
}

impl MemoryDevice for FakeDevice {
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
        let mut state = self.state();
        state.allocate_calls += 1;
        if state.fail_allocations {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let host_visible = self.memory_properties.memory_types
            [memory_type_index as usize]
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
        let host_bytes = if host_visible {
            vec![0; size as usize]
        } else {
            vec![]
        };
        let memory = vk::DeviceMemory::from_raw(state.next_raw());
        state.memory.insert(
            memory,
            FakeMemory {
                size,
                host_bytes,
                mapped: false,
            },
        );
        Ok(memory)
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        let removed = self.state().memory.remove(&memory);
        assert!(removed.is_some(), "freed unknown memory {:?}", memory);
    }

    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        _size: vk::DeviceSize,
    ) -> VkResult<*mut c_void> {
        let mut state = self.state();
        let memory = state
            .memory
            .get_mut(&memory)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        if memory.mapped || memory.host_bytes.is_empty() {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        memory.mapped = true;
        Ok(memory.host_bytes.as_mut_ptr().add(offset as usize) as *mut c_void)
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        if let Some(memory) = self.state().memory.get_mut(&memory) {
            memory.mapped = false;
        }
    }

    unsafe fn flush_mapped_memory(
        &self,
        memory: vk::DeviceMemory,
        _offset: vk::DeviceSize,
        _size: vk::DeviceSize,
    ) -> VkResult<()> {
        match self.state().memory.get(&memory) {
            Some(memory) if memory.mapped => Ok(()),
            _ => Err(vk::Result::ERROR_MEMORY_MAP_FAILED),
        }
    }

    unsafe fn invalidate_mapped_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()> {
        self.flush_mapped_memory(memory, offset, size)
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        let mut state = self.state();
        if state.fail_binds {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let memory_size = state
            .memory
            .get(&memory)
            .map(|memory| memory.size)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        let buffer = state
            .buffers
            .get_mut(&buffer)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if buffer.bound.is_some()
            || offset % BUFFER_ALIGNMENT != 0
            || offset + buffer.size > memory_size
        {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        buffer.bound = Some((memory, offset));
        Ok(())
    }

    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        let mut state = self.state();
        if state.fail_binds || !state.memory.contains_key(&memory) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        state.bound_images.insert(image, (memory, offset));
        Ok(())
    }

    unsafe fn create_buffer(
        &self,
        size: vk::DeviceSize,
        _usage: vk::BufferUsageFlags,
    ) -> VkResult<vk::Buffer> {
        let mut state = self.state();
        let buffer = vk::Buffer::from_raw(state.next_raw());
        state.created_buffers += 1;
        state.buffers.insert(buffer, FakeBuffer { size, bound: None });
        Ok(buffer)
    }

    unsafe fn get_buffer_memory_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> vk::MemoryRequirements {
        let size = self
            .state()
            .buffers
            .get(&buffer)
            .map(|buffer| buffer.size)
            .unwrap_or(0);
        vk::MemoryRequirements {
            size: crate::memory::align_up(size, BUFFER_ALIGNMENT),
            alignment: BUFFER_ALIGNMENT,
            memory_type_bits: 0b111,
        }
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state();
        let removed = state.buffers.remove(&buffer);
        assert!(removed.is_some(), "destroyed unknown buffer {:?}", buffer);
        state.destroyed_buffers.push(buffer);
    }

    unsafe fn create_fence(&self) -> VkResult<vk::Fence> {
        let mut state = self.state();
        let fence = vk::Fence::from_raw(state.next_raw());
        state.fences.insert(fence, false);
        Ok(fence)
    }

    fn get_fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        let mut state = self.state();
        state.fence_polls += 1;
        state
            .fences
            .get(&fence)
            .copied()
            .ok_or(vk::Result::ERROR_DEVICE_LOST)
    }

    fn wait_for_fence(
        &self,
        fence: vk::Fence,
        _timeout_in_nanoseconds: u64,
    ) -> VkResult<bool> {
        self.state()
            .fences
            .get(&fence)
            .copied()
            .ok_or(vk::Result::ERROR_DEVICE_LOST)
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state();
        if state.fail_fence_resets {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        let signaled = state
            .fences
            .get_mut(&fence)
            .ok_or(vk::Result::ERROR_DEVICE_LOST)?;
        *signaled = false;
        Ok(())
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state();
        state.fences.remove(&fence);
        state.destroyed_fences += 1;
    }

    unsafe fn destroy_object(&self, resource: DeferredResource) {
        self.state().destroyed_objects.push(resource);
    }
}

use ash::vk;

/// Pages, buffer chunks, and staging buffers which have been empty for more
/// than this many frames are returned to the device.
pub const NUM_FRAMES_TO_WAIT_BEFORE_RELEASING_TO_OS: u64 = 3;

/// Page size for the device-local heap.
pub const DEFAULT_GPU_ONLY_HEAP_PAGE_SIZE: vk::DeviceSize = 256 * 1024 * 1024;

/// Page size for the host-visible upload and download heaps.
pub const DEFAULT_STAGING_HEAP_PAGE_SIZE: vk::DeviceSize = 32 * 1024 * 1024;

/// Size of each pooled `vk::Buffer` chunk used for buffer suballocation.
pub const DEFAULT_BUFFER_ALLOCATION_SIZE: vk::DeviceSize = 1024 * 1024;

/// Number of ring slots in a temp frame allocation buffer.
pub const DEFAULT_TEMP_FRAME_BUFFER_COUNT: usize = 3;

/// Tunables for the memory manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryConfig {
    pub frames_to_wait_before_releasing_to_os: u64,
    pub gpu_only_heap_page_size: vk::DeviceSize,
    pub staging_heap_page_size: vk::DeviceSize,
    pub buffer_allocation_size: vk::DeviceSize,

    /// When false, released fences are destroyed instead of pooled.
    pub reuse_fences: bool,

    pub temp_frame_buffer_count: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            frames_to_wait_before_releasing_to_os:
                NUM_FRAMES_TO_WAIT_BEFORE_RELEASING_TO_OS,
            gpu_only_heap_page_size: DEFAULT_GPU_ONLY_HEAP_PAGE_SIZE,
            staging_heap_page_size: DEFAULT_STAGING_HEAP_PAGE_SIZE,
            buffer_allocation_size: DEFAULT_BUFFER_ALLOCATION_SIZE,
            reuse_fences: true,
            temp_frame_buffer_count: DEFAULT_TEMP_FRAME_BUFFER_COUNT,
        }
    }
}

mod buffer_pool;
mod resource_allocation;
mod resource_heap;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use ash::vk;

use crate::{
    memory::{DeviceMemoryManager, MemoryConfig},
    MemoryError,
};

pub use self::{
    buffer_pool::{BufferPool, BufferSuballocation},
    resource_allocation::ResourceAllocation,
    resource_heap::ResourceHeap,
};

/// The frame number used to age empty pages, buffer chunks, and staging
/// buffers.
#[derive(Debug, Default)]
pub struct FrameCounter(AtomicU64);

impl FrameCounter {
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Move to the next frame and return its number.
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn set(&self, frame: u64) {
        self.0.store(frame, Ordering::Release);
    }
}

/// Pages hold either buffers or images, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Buffer,
    Image,
}

/// A snapshot of a heap's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub memory_type_index: u32,
    pub default_page_size: vk::DeviceSize,
    pub peak_page_size: vk::DeviceSize,

    /// Bytes of device memory held by pages, used or free.
    pub used_memory: vk::DeviceSize,

    /// Bytes handed out to resources, including alignment padding.
    pub suballocated_bytes: vk::DeviceSize,

    pub num_suballocations: usize,
    pub num_used_buffer_pages: usize,
    pub num_used_image_pages: usize,
    pub num_free_pages: usize,
}

impl HeapStats {
    pub fn num_pages(&self) -> usize {
        self.num_used_buffer_pages
            + self.num_used_image_pages
            + self.num_free_pages
    }
}

/// Routes allocation requests to the heap for their memory type and runs the
/// once-per-frame release pass.
///
/// Three heaps are created up front: device-local memory for GPU resources,
/// host-coherent memory for uploads, and host-cached memory for reading
/// results back on the CPU.
pub struct ResourceHeapManager {
    memory_manager: Arc<DeviceMemoryManager>,
    config: MemoryConfig,
    frame_counter: Arc<FrameCounter>,
    heaps: Vec<Option<Arc<ResourceHeap>>>,
    gpu_heap_type: u32,
    upload_heap_type: u32,
    download_heap_type: Option<u32>,
    buffer_pool: Arc<BufferPool>,
}

impl ResourceHeapManager {
    pub fn new(
        memory_manager: Arc<DeviceMemoryManager>,
        config: MemoryConfig,
    ) -> Result<Self, MemoryError> {
        let frame_counter = Arc::new(FrameCounter::default());
        let num_types = memory_manager.num_memory_types();
        let type_bits = if num_types >= 32 {
            u32::MAX
        } else {
            (1 << num_types) - 1
        };
        let mut heaps: Vec<Option<Arc<ResourceHeap>>> =
            vec![None; num_types as usize];

        let mut create_heap = |memory_type_index: u32, page_size: vk::DeviceSize| {
            let slot = &mut heaps[memory_type_index as usize];
            if slot.is_none() {
                *slot = Some(Arc::new(ResourceHeap::new(
                    memory_manager.clone(),
                    memory_type_index,
                    page_size,
                    frame_counter.clone(),
                    config.frames_to_wait_before_releasing_to_os,
                )));
            }
            let heap_index = memory_manager
                .heap_index_for_type(memory_type_index)
                .unwrap_or(0);
            memory_manager.heap_total_size(heap_index) / page_size.max(1)
        };

        let gpu_heap_type = memory_manager.memory_type_from_properties(
            type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        let num_gpu_pages =
            create_heap(gpu_heap_type, config.gpu_only_heap_page_size);

        let upload_heap_type = memory_manager.memory_type_from_properties(
            type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let num_upload_pages =
            create_heap(upload_heap_type, config.staging_heap_page_size);

        let download_heap_type = memory_manager
            .memory_type_from_properties(
                type_bits,
                vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_CACHED,
            )
            .ok();
        let num_download_pages = match download_heap_type {
            Some(memory_type_index) => {
                create_heap(memory_type_index, config.staging_heap_page_size)
            }
            None => {
                log::warn!(
                    "No HOST_CACHED memory type found, CPU readback will use \
                     the upload heap"
                );
                0
            }
        };

        let max_allocations = memory_manager.max_allocation_count() as u64;
        let worst_case =
            num_gpu_pages + num_upload_pages + num_download_pages;
        if worst_case > max_allocations {
            log::warn!(
                "Too many allocations ({}) per heap size (GPU {}, Upload {}, \
                 Download {}), might run into slow path in the driver",
                worst_case,
                num_gpu_pages,
                num_upload_pages,
                num_download_pages
            );
        }

        let buffer_pool = Arc::new(BufferPool::new(
            memory_manager.clone(),
            frame_counter.clone(),
            config.frames_to_wait_before_releasing_to_os,
            config.buffer_allocation_size,
        ));

        Ok(Self {
            memory_manager,
            config,
            frame_counter,
            heaps,
            gpu_heap_type,
            upload_heap_type,
            download_heap_type,
            buffer_pool,
        })
    }

    pub fn memory_manager(&self) -> &Arc<DeviceMemoryManager> {
        &self.memory_manager
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn frame_counter(&self) -> &Arc<FrameCounter> {
        &self.frame_counter
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_counter.current()
    }

    /// Move to the next frame and return its number.
    pub fn advance_frame(&self) -> u64 {
        self.frame_counter.advance()
    }

    pub fn set_frame_number(&self, frame: u64) {
        self.frame_counter.set(frame);
    }

    /// The heap for a memory type, if one was created.
    pub fn heap(&self, memory_type_index: u32) -> Option<&Arc<ResourceHeap>> {
        self.heaps
            .get(memory_type_index as usize)
            .and_then(Option::as_ref)
    }

    pub fn gpu_heap(&self) -> &Arc<ResourceHeap> {
        self.heaps[self.gpu_heap_type as usize]
            .as_ref()
            .expect("the gpu heap is created with the manager")
    }

    pub fn upload_heap(&self) -> &Arc<ResourceHeap> {
        self.heaps[self.upload_heap_type as usize]
            .as_ref()
            .expect("the upload heap is created with the manager")
    }

    pub fn download_heap(&self) -> Option<&Arc<ResourceHeap>> {
        self.download_heap_type
            .and_then(|memory_type_index| self.heap(memory_type_index))
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    /// Allocate memory for a buffer with the given requirements.
    ///
    /// The page is mapped when `memory_property_flags` asks for host visible
    /// memory.
    pub fn allocate_buffer_memory(
        &self,
        requirements: &vk::MemoryRequirements,
        memory_property_flags: vk::MemoryPropertyFlags,
    ) -> Result<ResourceAllocation, MemoryError> {
        self.allocate_memory(
            requirements,
            memory_property_flags,
            ResourceKind::Buffer,
        )
    }

    /// Allocate memory for an image with the given requirements.
    pub fn allocate_image_memory(
        &self,
        requirements: &vk::MemoryRequirements,
        memory_property_flags: vk::MemoryPropertyFlags,
    ) -> Result<ResourceAllocation, MemoryError> {
        self.allocate_memory(
            requirements,
            memory_property_flags,
            ResourceKind::Image,
        )
    }

    fn allocate_memory(
        &self,
        requirements: &vk::MemoryRequirements,
        memory_property_flags: vk::MemoryPropertyFlags,
        kind: ResourceKind,
    ) -> Result<ResourceAllocation, MemoryError> {
        let memory_type_index = self.memory_manager.memory_type_from_properties(
            requirements.memory_type_bits,
            memory_property_flags,
        )?;
        let heap = self.heap(memory_type_index).ok_or_else(|| {
            log::error!(
                "Missing memory type index {}, MemSize {}, MemPropTypeBits \
                 {:#b}, MemPropertyFlags {:?}",
                memory_type_index,
                requirements.size,
                requirements.memory_type_bits,
                memory_property_flags
            );
            MemoryError::NoHeapForMemoryType(memory_type_index)
        })?;
        let map = memory_property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
        heap.allocate_resource(
            requirements.size,
            requirements.alignment,
            kind,
            map,
        )
    }

    /// Suballocate a range of a pooled buffer.
    pub fn allocate_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_property_flags: vk::MemoryPropertyFlags,
    ) -> Result<BufferSuballocation, MemoryError> {
        self.buffer_pool.allocate(size, usage, memory_property_flags)
    }

    /// Return pages and buffer chunks which have been empty for long enough
    /// to the device. With `immediate` everything empty is released.
    ///
    /// Call once per frame after submitting the frame's work.
    pub fn release_freed_pages(&self, immediate: bool) -> usize {
        let pages: usize = self
            .heaps
            .iter()
            .flatten()
            .map(|heap| heap.release_freed_pages(immediate))
            .sum();
        pages + self.buffer_pool.release_freed_resources(immediate)
    }

    pub fn dump_memory(&self) {
        self.memory_manager.dump_memory();
        for heap in self.heaps.iter().flatten() {
            heap.dump_memory();
        }
        self.buffer_pool.dump_memory();
    }
}

impl Drop for ResourceHeapManager {
    fn drop(&mut self) {
        self.release_freed_pages(true);
        for heap in self.heaps.iter().flatten() {
            let stats = heap.stats();
            if stats.num_suballocations > 0 {
                log::warn!(
                    "Memory type {} still has {} live suballocations at \
                     shutdown",
                    stats.memory_type_index,
                    stats.num_suballocations
                );
            }
        }
        let live_chunks = self.buffer_pool.num_used_chunks();
        if live_chunks > 0 {
            log::warn!(
                "{} buffer chunks are still in use at shutdown",
                live_chunks
            );
        }
    }
}

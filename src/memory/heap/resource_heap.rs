use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use ash::vk;
use indoc::formatdoc;

use super::{FrameCounter, HeapStats, ResourceAllocation, ResourceKind};
use crate::{
    logging::PrettyList,
    memory::{DeviceMemoryAllocation, DeviceMemoryManager, SubresourceAllocator},
    MemoryError,
};

/// One device allocation plus the free list used to carve it up.
struct HeapPage {
    allocation: DeviceMemoryAllocation,
    allocator: SubresourceAllocator,
    frame_freed: u64,
}

impl HeapPage {
    fn summary(&self, id: u64) -> String {
        format!(
            "page {}: {} suballocs, {} free blocks ({} used/{} free/{} max) \
             DeviceMemory {:?}",
            id,
            self.allocator.num_suballocations(),
            self.allocator.free_blocks().len(),
            self.allocator.used_size(),
            self.allocator.free_size(),
            self.allocator.max_size(),
            self.allocation.handle()
        )
    }
}

#[derive(Default)]
struct HeapState {
    pages: HashMap<u64, HeapPage>,
    used_buffer_pages: Vec<u64>,
    used_image_pages: Vec<u64>,
    free_pages: Vec<u64>,
    next_page_id: u64,
    peak_page_size: vk::DeviceSize,
    used_memory: vk::DeviceSize,
}

impl HeapState {
    fn used_pages_mut(&mut self, kind: ResourceKind) -> &mut Vec<u64> {
        match kind {
            ResourceKind::Buffer => &mut self.used_buffer_pages,
            ResourceKind::Image => &mut self.used_image_pages,
        }
    }

    /// Try to suballocate from the page without moving it between lists.
    fn try_allocate_from(
        &mut self,
        page_id: u64,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
        map: bool,
    ) -> Option<(vk::DeviceMemory, crate::memory::Suballocation)> {
        let page = self.pages.get_mut(&page_id)?;
        if page.allocation.is_mapped() != map {
            return None;
        }
        page.allocator
            .try_allocate(size, alignment)
            .map(|suballocation| (page.allocation.handle(), suballocation))
    }
}

/// All pages for a single memory type.
///
/// Pages which hold buffers and pages which hold images are kept apart so
/// the two never share a device allocation. Pages which empty out wait on the
/// free list for a few frames before going back to the device, which avoids
/// churn when transient resources come and go every frame.
pub struct ResourceHeap {
    memory_type_index: u32,
    default_page_size: vk::DeviceSize,
    frames_to_wait: u64,
    frame_counter: Arc<FrameCounter>,
    pub(super) memory_manager: Arc<DeviceMemoryManager>,
    state: Mutex<HeapState>,
}

impl ResourceHeap {
    pub fn new(
        memory_manager: Arc<DeviceMemoryManager>,
        memory_type_index: u32,
        default_page_size: vk::DeviceSize,
        frame_counter: Arc<FrameCounter>,
        frames_to_wait: u64,
    ) -> Self {
        Self {
            memory_type_index,
            default_page_size,
            frames_to_wait,
            frame_counter,
            memory_manager,
            state: Mutex::new(HeapState::default()),
        }
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn default_page_size(&self) -> vk::DeviceSize {
        self.default_page_size
    }

    /// Suballocate `size` bytes for a resource of the given kind.
    ///
    /// Existing pages of the same kind are tried first, then pages on the
    /// free list, and only then is a new page of at least
    /// `default_page_size` bytes requested from the device. Only pages whose
    /// mapped state matches `map` are considered.
    pub fn allocate_resource(
        self: &Arc<Self>,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
        kind: ResourceKind,
        map: bool,
    ) -> Result<ResourceAllocation, MemoryError> {
        if size == 0 {
            return Err(MemoryError::ZeroSizedAllocation);
        }
        let mut state = self.lock_state();

        if size < self.default_page_size {
            let used_pages = state.used_pages_mut(kind).clone();
            for page_id in used_pages {
                if let Some((memory, suballocation)) =
                    state.try_allocate_from(page_id, size, alignment, map)
                {
                    return Ok(self.resource_allocation(
                        &state,
                        page_id,
                        memory,
                        suballocation,
                    ));
                }
            }
        }

        for index in 0..state.free_pages.len() {
            let page_id = state.free_pages[index];
            if let Some((memory, suballocation)) =
                state.try_allocate_from(page_id, size, alignment, map)
            {
                state.free_pages.swap_remove(index);
                state.used_pages_mut(kind).push(page_id);
                return Ok(self.resource_allocation(
                    &state,
                    page_id,
                    memory,
                    suballocation,
                ));
            }
        }

        let page_size = size.max(self.default_page_size);
        let page_id = self.create_page(&mut state, page_size, map)?;
        state.used_pages_mut(kind).push(page_id);

        // A fresh page is at least `size` bytes and offset zero satisfies
        // every alignment.
        let (memory, suballocation) = state
            .try_allocate_from(page_id, size, alignment, map)
            .expect("a new page always fits the request which created it");
        Ok(self.resource_allocation(&state, page_id, memory, suballocation))
    }

    fn create_page(
        &self,
        state: &mut HeapState,
        page_size: vk::DeviceSize,
        map: bool,
    ) -> Result<u64, MemoryError> {
        let mut allocation = scopeguard::guard(
            self.memory_manager.alloc(page_size, self.memory_type_index)?,
            |allocation| self.memory_manager.free(allocation),
        );
        if map {
            allocation.map(page_size, 0)?;
        }
        let allocation = scopeguard::ScopeGuard::into_inner(allocation);

        let page_id = state.next_page_id;
        state.next_page_id += 1;
        state.used_memory += page_size;
        state.peak_page_size = state.peak_page_size.max(page_size);
        state.pages.insert(
            page_id,
            HeapPage {
                allocation,
                allocator: SubresourceAllocator::new(page_size, 1),
                frame_freed: 0,
            },
        );

        log::debug!(
            "Created page {} of {} bytes for memory type {}",
            page_id,
            page_size,
            self.memory_type_index
        );
        Ok(page_id)
    }

    fn resource_allocation(
        self: &Arc<Self>,
        state: &HeapState,
        page_id: u64,
        memory: vk::DeviceMemory,
        suballocation: crate::memory::Suballocation,
    ) -> ResourceAllocation {
        let mapped_ptr = state.pages[&page_id]
            .allocation
            .mapped_ptr()
            .map(|base| unsafe {
                // Safe because the suballocation lies inside the page.
                base.add(suballocation.aligned_offset())
            });
        ResourceAllocation::new(
            self.clone(),
            page_id,
            memory,
            suballocation,
            mapped_ptr,
        )
    }

    /// Return a suballocation to its page. Pages which become empty move to
    /// the free list tagged with the current frame.
    pub(super) fn release(&self, page_id: u64, suballocation_id: u64) {
        let mut state = self.lock_state();
        let Some(page) = state.pages.get_mut(&page_id) else {
            log::error!(
                "Released suballocation {} from unknown page {}",
                suballocation_id,
                page_id
            );
            return;
        };
        if !page.allocator.release(suballocation_id) {
            return;
        }

        page.frame_freed = self.frame_counter.current();
        state.used_buffer_pages.retain(|&id| id != page_id);
        state.used_image_pages.retain(|&id| id != page_id);
        state.free_pages.push(page_id);
        log::trace!(
            "Page {} of memory type {} is empty",
            page_id,
            self.memory_type_index
        );
    }

    /// Run `f` with the device allocation backing a page.
    pub(super) fn with_page_allocation<R>(
        &self,
        page_id: u64,
        f: impl FnOnce(&DeviceMemoryAllocation) -> R,
    ) -> Option<R> {
        let state = self.lock_state();
        state.pages.get(&page_id).map(|page| f(&page.allocation))
    }

    /// Return pages that have sat on the free list for long enough to the
    /// device. With `immediate` every free page is released.
    ///
    /// Returns the number of pages released.
    pub fn release_freed_pages(&self, immediate: bool) -> usize {
        let current_frame = self.frame_counter.current();
        let released: Vec<HeapPage> = {
            let mut state = self.lock_state();
            let frames_to_wait = self.frames_to_wait;
            let (expired, waiting): (Vec<u64>, Vec<u64>) =
                state.free_pages.iter().partition(|id| {
                    let page = &state.pages[*id];
                    immediate
                        || page.frame_freed + frames_to_wait < current_frame
                });
            state.free_pages = waiting;

            let mut released = Vec::with_capacity(expired.len());
            for page_id in expired {
                if let Some(page) = state.pages.remove(&page_id) {
                    state.used_memory -= page.allocator.max_size();
                    released.push(page);
                }
            }
            released
        };

        let count = released.len();
        for page in released {
            log::debug!(
                "Releasing page of {} bytes from memory type {} to the device",
                page.allocator.max_size(),
                self.memory_type_index
            );
            self.memory_manager.free(page.allocation);
        }
        count
    }

    pub fn stats(&self) -> HeapStats {
        let state = self.lock_state();
        HeapStats {
            memory_type_index: self.memory_type_index,
            default_page_size: self.default_page_size,
            peak_page_size: state.peak_page_size,
            used_memory: state.used_memory,
            suballocated_bytes: state
                .pages
                .values()
                .map(|page| page.allocator.used_size())
                .sum(),
            num_suballocations: state
                .pages
                .values()
                .map(|page| page.allocator.num_suballocations())
                .sum(),
            num_used_buffer_pages: state.used_buffer_pages.len(),
            num_used_image_pages: state.used_image_pages.len(),
            num_free_pages: state.free_pages.len(),
        }
    }

    /// Page sizes, largest first. Mostly useful for tests and dumps.
    pub fn page_sizes(&self) -> Vec<vk::DeviceSize> {
        let state = self.lock_state();
        let mut sizes: Vec<vk::DeviceSize> = state
            .pages
            .values()
            .map(|page| page.allocator.max_size())
            .collect();
        sizes.sort_unstable_by(|a, b| b.cmp(a));
        sizes
    }

    pub fn dump_memory(&self) {
        let stats = self.stats();
        let state = self.lock_state();
        let describe = |ids: &[u64]| -> Vec<String> {
            ids.iter()
                .map(|id| state.pages[id].summary(*id))
                .collect()
        };
        log::info!(
            "{}",
            formatdoc!(
                "
                Heap for memory type {}
                  {} free pages, peak page size {}
                  {} bytes in {} suballocations out of {} bytes in pages
                Buffer pages:{}
                Image pages:{}",
                stats.memory_type_index,
                stats.num_free_pages,
                stats.peak_page_size,
                stats.suballocated_bytes,
                stats.num_suballocations,
                stats.used_memory,
                PrettyList(&describe(&state.used_buffer_pages)),
                PrettyList(&describe(&state.used_image_pages)),
            )
        );
    }

    fn lock_state(&self) -> MutexGuard<'_, HeapState> {
        self.state
            .lock()
            .expect("unable to acquire the resource heap lock")
    }
}

impl Drop for ResourceHeap {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (id, page) in state.pages.drain() {
            if !page.allocator.is_empty() {
                log::error!(
                    "Memory type {} page {} still has {} suballocations!",
                    self.memory_type_index,
                    id,
                    page.allocator.num_suballocations()
                );
            }
            self.memory_manager.free(page.allocation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{
        device::fake_device::{DEVICE_LOCAL_TYPE, UPLOAD_TYPE},
        FakeDevice,
    };

    fn heap(
        memory_type_index: u32,
        default_page_size: vk::DeviceSize,
    ) -> (Arc<FakeDevice>, Arc<FrameCounter>, Arc<ResourceHeap>) {
        let device = Arc::new(FakeDevice::new());
        let memory_manager = Arc::new(DeviceMemoryManager::new(device.clone()));
        let frame_counter = Arc::new(FrameCounter::default());
        let heap = Arc::new(ResourceHeap::new(
            memory_manager,
            memory_type_index,
            default_page_size,
            frame_counter.clone(),
            3,
        ));
        (device, frame_counter, heap)
    }

    #[test]
    fn released_ranges_are_reused_within_the_same_page() {
        let (device, _frames, heap) = heap(DEVICE_LOCAL_TYPE, 1024);

        let a = heap
            .allocate_resource(300, 16, ResourceKind::Buffer, false)
            .unwrap();
        let b = heap
            .allocate_resource(300, 16, ResourceKind::Buffer, false)
            .unwrap();
        assert_eq!(a.offset() % 16, 0);
        assert_eq!(b.offset() % 16, 0);
        assert!(a.offset() + 300 <= b.offset());

        drop(a);
        let c = heap
            .allocate_resource(300, 16, ResourceKind::Buffer, false)
            .unwrap();

        assert_eq!(c.offset(), 0);
        assert_eq!(heap.page_sizes(), vec![1024]);
        assert_eq!(device.live_allocation_count(), 1);
        drop((b, c));
    }

    #[test]
    fn oversized_requests_grow_the_page() {
        let (_device, _frames, heap) = heap(DEVICE_LOCAL_TYPE, 1024);

        let big = heap
            .allocate_resource(5000, 256, ResourceKind::Image, false)
            .unwrap();

        assert_eq!(big.offset(), 0);
        assert!(heap.page_sizes()[0] >= 5000);
        assert_eq!(heap.stats().peak_page_size, 5000);
    }

    #[test]
    fn buffers_and_images_never_share_a_page() {
        let (_device, _frames, heap) = heap(DEVICE_LOCAL_TYPE, 1024);

        let buffer = heap
            .allocate_resource(64, 16, ResourceKind::Buffer, false)
            .unwrap();
        let image = heap
            .allocate_resource(64, 16, ResourceKind::Image, false)
            .unwrap();

        assert_ne!(buffer.handle(), image.handle());
        let stats = heap.stats();
        assert_eq!(stats.num_used_buffer_pages, 1);
        assert_eq!(stats.num_used_image_pages, 1);
    }

    #[test]
    fn mapped_and_unmapped_requests_use_different_pages() {
        let (_device, _frames, heap) = heap(UPLOAD_TYPE, 1024);

        let unmapped = heap
            .allocate_resource(64, 16, ResourceKind::Buffer, false)
            .unwrap();
        let mapped = heap
            .allocate_resource(64, 16, ResourceKind::Buffer, true)
            .unwrap();

        assert_ne!(unmapped.handle(), mapped.handle());
        assert!(unmapped.mapped_ptr().is_none());
        assert!(mapped.mapped_ptr().is_some());
    }

    #[test]
    fn mapped_pointers_point_at_the_aligned_offset() {
        let (_device, _frames, heap) = heap(UPLOAD_TYPE, 1024);

        let a = heap
            .allocate_resource(10, 1, ResourceKind::Buffer, true)
            .unwrap();
        let b = heap
            .allocate_resource(10, 64, ResourceKind::Buffer, true)
            .unwrap();

        let base = a.mapped_ptr().unwrap().as_ptr() as usize;
        let second = b.mapped_ptr().unwrap().as_ptr() as usize;
        assert_eq!(second - base, b.offset() as usize);
        assert_eq!(b.offset(), 64);
    }

    #[test]
    fn page_release_waits_for_the_frame_threshold() {
        let (device, frames, heap) = heap(DEVICE_LOCAL_TYPE, 1024);
        frames.set(10);

        let a = heap
            .allocate_resource(100, 16, ResourceKind::Buffer, false)
            .unwrap();
        let kept = heap
            .allocate_resource(100, 16, ResourceKind::Image, false)
            .unwrap();
        drop(a);
        assert_eq!(heap.stats().num_free_pages, 1);

        for frame in 10..=13 {
            frames.set(frame);
            assert_eq!(heap.release_freed_pages(false), 0);
            assert_eq!(heap.stats().used_memory, 2048);
            assert_eq!(device.live_allocation_count(), 2);
        }

        frames.set(14);
        assert_eq!(heap.release_freed_pages(false), 1);
        assert_eq!(heap.stats().used_memory, 1024);
        assert_eq!(heap.stats().num_used_image_pages, 1);
        assert_eq!(device.live_allocation_count(), 1);
        assert_eq!(heap.release_freed_pages(false), 0);
        drop(kept);
    }

    #[test]
    fn immediate_release_frees_every_empty_page() {
        let (device, _frames, heap) = heap(DEVICE_LOCAL_TYPE, 1024);

        let a = heap
            .allocate_resource(100, 16, ResourceKind::Buffer, false)
            .unwrap();
        let b = heap
            .allocate_resource(100, 16, ResourceKind::Image, false)
            .unwrap();
        drop((a, b));

        assert_eq!(heap.release_freed_pages(true), 2);
        assert_eq!(device.live_allocation_count(), 0);
        assert_eq!(heap.stats().used_memory, 0);
    }

    #[test]
    fn free_pages_are_reused_before_allocating() {
        let (device, _frames, heap) = heap(DEVICE_LOCAL_TYPE, 1024);

        let a = heap
            .allocate_resource(100, 16, ResourceKind::Buffer, false)
            .unwrap();
        drop(a);
        let b = heap
            .allocate_resource(100, 16, ResourceKind::Image, false)
            .unwrap();

        assert_eq!(device.allocate_calls(), 1);
        assert_eq!(heap.stats().num_used_image_pages, 1);
        assert_eq!(heap.stats().num_free_pages, 0);
        drop(b);
    }

    #[test]
    fn allocation_failures_propagate() {
        let (device, _frames, heap) = heap(DEVICE_LOCAL_TYPE, 1024);
        device.fail_allocations(true);

        let result = heap.allocate_resource(100, 16, ResourceKind::Buffer, false);

        assert!(matches!(
            result,
            Err(MemoryError::UnableToAllocateDeviceMemory { .. })
        ));
        assert_eq!(heap.stats().used_memory, 0);
    }

    #[test]
    fn failing_to_map_a_new_page_frees_it() {
        let (device, _frames, heap) = heap(DEVICE_LOCAL_TYPE, 1024);

        let result = heap.allocate_resource(100, 16, ResourceKind::Buffer, true);

        assert!(matches!(result, Err(MemoryError::MemoryIsNotHostVisible)));
        assert_eq!(device.live_allocation_count(), 0);
        assert_eq!(heap.stats().num_used_buffer_pages, 0);
    }

    #[test]
    fn concurrent_allocations_and_releases_leave_nothing_behind() {
        let (device, _frames, heap) = heap(DEVICE_LOCAL_TYPE, 4096);

        let workers: Vec<_> = (0..8u64)
            .map(|worker| {
                let heap = heap.clone();
                std::thread::spawn(move || {
                    let mut seed = 0x9e37_79b9 ^ worker;
                    let mut live = vec![];
                    for _ in 0..300 {
                        seed = seed
                            .wrapping_mul(6364136223846793005)
                            .wrapping_add(1442695040888963407);
                        let size = 1 + (seed >> 33) % 700;
                        let alignment = 1 << ((seed >> 24) % 9);
                        let kind = if seed & (1 << 40) == 0 {
                            ResourceKind::Buffer
                        } else {
                            ResourceKind::Image
                        };
                        let allocation = heap
                            .allocate_resource(size, alignment, kind, false)
                            .unwrap();
                        assert_eq!(allocation.offset() % alignment, 0);
                        assert!(allocation.size() >= size);
                        live.push(allocation);
                        if live.len() > 6 {
                            live.swap_remove((seed >> 12) as usize % live.len());
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let stats = heap.stats();
        assert_eq!(stats.num_suballocations, 0);
        assert_eq!(stats.suballocated_bytes, 0);
        assert_eq!(stats.num_used_buffer_pages + stats.num_used_image_pages, 0);
        assert_eq!(heap.release_freed_pages(true), stats.num_pages());
        assert_eq!(device.live_allocation_count(), 0);
        assert_eq!(heap.stats().used_memory, 0);
    }

    #[test]
    fn dropping_the_heap_frees_remaining_pages() {
        let (device, _frames, heap) = heap(DEVICE_LOCAL_TYPE, 1024);
        let a = heap
            .allocate_resource(100, 16, ResourceKind::Buffer, false)
            .unwrap();
        drop(a);

        drop(heap);

        assert_eq!(device.live_allocation_count(), 0);
    }
}

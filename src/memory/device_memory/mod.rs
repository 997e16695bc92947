mod allocation;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use ash::vk;

use crate::{logging::PrettyList, memory::MemoryDevice, MemoryError};

pub use self::allocation::{DeviceMemoryAllocation, MappedPtr};

/// Bookkeeping for one device memory heap.
#[derive(Debug, Default)]
struct HeapInfo {
    total_size: vk::DeviceSize,
    used_size: vk::DeviceSize,
    allocations: HashMap<vk::DeviceMemory, vk::DeviceSize>,
}

#[derive(Debug, Default)]
struct ManagerState {
    heaps: Vec<HeapInfo>,
    num_allocations: u32,
    peak_num_allocations: u32,
}

/// The only component which calls the device's raw allocate and free entry
/// points.
///
/// Tracks used bytes per device heap and the number of live allocations, which
/// is the number that runs into the device's maxMemoryAllocationCount limit.
pub struct DeviceMemoryManager {
    device: Arc<dyn MemoryDevice>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    max_allocation_count: u32,
    has_unified_memory: bool,
    state: Mutex<ManagerState>,
}

impl DeviceMemoryManager {
    pub fn new(device: Arc<dyn MemoryDevice>) -> Self {
        let memory_properties = device.memory_properties();
        let max_allocation_count = device.limits().max_memory_allocation_count;

        let heaps = memory_properties.memory_heaps
            [..memory_properties.memory_heap_count as usize]
            .iter()
            .map(|heap| HeapInfo {
                total_size: heap.size,
                ..Default::default()
            })
            .collect();

        let manager = Self {
            device,
            memory_properties,
            max_allocation_count,
            has_unified_memory: memory_properties.memory_heap_count == 1,
            state: Mutex::new(ManagerState {
                heaps,
                ..Default::default()
            }),
        };
        manager.print_memory_info();
        manager
    }

    /// The device used for every allocation.
    pub fn device(&self) -> &Arc<dyn MemoryDevice> {
        &self.device
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn num_memory_types(&self) -> u32 {
        self.memory_properties.memory_type_count
    }

    /// True when the device reports a single heap shared by host and device.
    pub fn has_unified_memory(&self) -> bool {
        self.has_unified_memory
    }

    pub fn max_allocation_count(&self) -> u32 {
        self.max_allocation_count
    }

    /// The device heap which backs a memory type.
    pub fn heap_index_for_type(&self, memory_type_index: u32) -> Option<u32> {
        if memory_type_index < self.memory_properties.memory_type_count {
            Some(
                self.memory_properties.memory_types
                    [memory_type_index as usize]
                    .heap_index,
            )
        } else {
            None
        }
    }

    /// Find the first memory type which is allowed by `memory_type_bits` and
    /// has every flag in `property_flags`.
    pub fn memory_type_from_properties(
        &self,
        memory_type_bits: u32,
        property_flags: vk::MemoryPropertyFlags,
    ) -> Result<u32, MemoryError> {
        self.memory_properties.memory_types
            [..self.memory_properties.memory_type_count as usize]
            .iter()
            .enumerate()
            .find(|(i, memory_type)| {
                let type_supported = memory_type_bits & (1 << i) != 0;
                let properties_supported =
                    memory_type.property_flags.contains(property_flags);
                type_supported && properties_supported
            })
            .map(|(i, _memory_type)| i as u32)
            .ok_or(MemoryError::MemoryTypeNotFound(
                property_flags,
                memory_type_bits,
            ))
    }

    /// Allocate `size` bytes of device memory with the given type.
    pub fn alloc(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> Result<DeviceMemoryAllocation, MemoryError> {
        if size == 0 {
            return Err(MemoryError::ZeroSizedAllocation);
        }
        let heap_index = self
            .heap_index_for_type(memory_type_index)
            .ok_or(MemoryError::InvalidMemoryTypeIndex(memory_type_index))?;
        let property_flags = self.memory_properties.memory_types
            [memory_type_index as usize]
            .property_flags;

        let mut state = self.lock_state();
        let memory = unsafe {
            // Safe because the allocation is returned to the caller who must
            // hand it back to free().
            self.device
                .allocate_memory(size, memory_type_index)
                .map_err(|source| {
                    MemoryError::UnableToAllocateDeviceMemory {
                        size,
                        memory_type_index,
                        source,
                    }
                })?
        };

        state.num_allocations += 1;
        state.peak_num_allocations =
            state.peak_num_allocations.max(state.num_allocations);
        if state.num_allocations == self.max_allocation_count {
            log::warn!(
                "Hit maximum # of allocations ({}) reported by device!",
                state.num_allocations
            );
        }

        let heap = &mut state.heaps[heap_index as usize];
        heap.allocations.insert(memory, size);
        heap.used_size += size;

        log::trace!(
            "Allocated {} bytes of type {} as {:?}",
            size,
            memory_type_index,
            memory
        );

        Ok(DeviceMemoryAllocation::new(
            self.device.clone(),
            memory,
            size,
            memory_type_index,
            property_flags,
        ))
    }

    /// Resolve a memory type from a resource's type bits and the desired
    /// properties, then allocate.
    pub fn alloc_with_properties(
        &self,
        size: vk::DeviceSize,
        memory_type_bits: u32,
        property_flags: vk::MemoryPropertyFlags,
    ) -> Result<DeviceMemoryAllocation, MemoryError> {
        let memory_type_index =
            self.memory_type_from_properties(memory_type_bits, property_flags)?;
        self.alloc(size, memory_type_index)
    }

    /// Return an allocation to the device.
    ///
    /// The allocation is unmapped first if needed.
    ///
    /// # Panics
    ///
    /// Panics if the allocation is not live in this manager. That only
    /// happens when an allocation is freed twice or handed to the wrong
    /// manager, which is a bug in the caller.
    pub fn free(&self, mut allocation: DeviceMemoryAllocation) {
        if allocation.is_mapped() {
            // Can't fail, the allocation is mapped.
            let _ = allocation.unmap();
        }

        let memory = allocation.memory;
        let removed = {
            let mut state = self.lock_state();
            let heap_index = self
                .heap_index_for_type(allocation.memory_type_index())
                .expect("live allocations always have a valid type index");
            let heap = &mut state.heaps[heap_index as usize];
            let removed = heap.allocations.remove(&memory);
            if removed.is_some() {
                heap.used_size -= allocation.size();
                state.num_allocations -= 1;
            }
            removed
        };
        assert!(
            removed.is_some(),
            "Device memory {:?} is not live, was it freed twice?",
            memory
        );

        unsafe {
            // Safe because the manager no longer tracks the memory and the
            // caller has given up ownership.
            self.device.free_memory(memory);
        }
        allocation.memory = vk::DeviceMemory::null();

        log::trace!("Freed device memory {:?}", memory);
    }

    pub fn num_allocations(&self) -> u32 {
        self.lock_state().num_allocations
    }

    pub fn peak_num_allocations(&self) -> u32 {
        self.lock_state().peak_num_allocations
    }

    /// Bytes currently allocated from a device heap.
    pub fn heap_used_size(&self, heap_index: u32) -> vk::DeviceSize {
        self.lock_state()
            .heaps
            .get(heap_index as usize)
            .map_or(0, |heap| heap.used_size)
    }

    /// The size of a device heap as reported by the device.
    pub fn heap_total_size(&self, heap_index: u32) -> vk::DeviceSize {
        self.lock_state()
            .heaps
            .get(heap_index as usize)
            .map_or(0, |heap| heap.total_size)
    }

    /// Log every live allocation, grouped by heap.
    pub fn dump_memory(&self) {
        self.print_memory_info();
        let state = self.lock_state();
        log::info!(
            "Device Memory: {} allocations on {} heaps",
            state.num_allocations,
            state.heaps.len()
        );
        for (index, heap) in state.heaps.iter().enumerate() {
            let allocations: Vec<String> = heap
                .allocations
                .iter()
                .map(|(memory, size)| format!("{:?} Size {}", memory, size))
                .collect();
            log::info!(
                "Heap {}, {} allocations, total allocated {:.2} MB{}",
                index,
                heap.allocations.len(),
                heap.used_size as f64 / 1024.0 / 1024.0,
                PrettyList(&allocations)
            );
        }
    }

    fn print_memory_info(&self) {
        let properties = &self.memory_properties;
        let heaps: Vec<String> = properties.memory_heaps
            [..properties.memory_heap_count as usize]
            .iter()
            .map(|heap| {
                let is_gpu_heap =
                    heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL);
                format!(
                    "Flags {:?} Size {} ({:.2} MB) {}",
                    heap.flags,
                    heap.size,
                    heap.size as f64 / 1024.0 / 1024.0,
                    if is_gpu_heap { "GPU" } else { "" }
                )
            })
            .collect();
        log::info!(
            "{} Device Memory Heaps; Max memory allocations {}{}",
            heaps.len(),
            self.max_allocation_count,
            PrettyList(&heaps)
        );

        let types: Vec<String> = properties.memory_types
            [..properties.memory_type_count as usize]
            .iter()
            .map(|memory_type| {
                format!(
                    "Heap {} {:?}",
                    memory_type.heap_index, memory_type.property_flags
                )
            })
            .collect();
        log::info!("{} Device Memory Types{}", types.len(), PrettyList(&types));
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state
            .lock()
            .expect("unable to acquire the device memory manager lock")
    }
}

impl Drop for DeviceMemoryManager {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (index, heap) in state.heaps.iter().enumerate() {
            if !heap.allocations.is_empty() {
                log::error!(
                    "Found {} unfreed allocations on heap {}!",
                    heap.allocations.len(),
                    index
                );
            }
        }
    }
}

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use ash::vk;
use scopeguard::ScopeGuard;

use super::FrameCounter;
use crate::{
    logging::PrettyList,
    memory::{
        DeviceMemoryAllocation, DeviceMemoryManager, MappedPtr, Suballocation,
        SubresourceAllocator,
    },
    MemoryError,
};

/// One `vk::Buffer` bound at offset zero to its own device allocation.
struct BufferChunk {
    buffer: vk::Buffer,
    allocation: DeviceMemoryAllocation,
    allocator: SubresourceAllocator,
    usage: vk::BufferUsageFlags,
    memory_property_flags: vk::MemoryPropertyFlags,
    frame_freed: u64,
}

impl BufferChunk {
    fn supports(
        &self,
        usage: vk::BufferUsageFlags,
        memory_property_flags: vk::MemoryPropertyFlags,
    ) -> bool {
        self.usage.contains(usage)
            && self.memory_property_flags.contains(memory_property_flags)
    }

    fn summary(&self, id: u64) -> String {
        format!(
            "chunk {}: {:?} {} suballocs, {} used/{} max, usage {:?}",
            id,
            self.buffer,
            self.allocator.num_suballocations(),
            self.allocator.used_size(),
            self.allocator.max_size(),
            self.usage
        )
    }
}

#[derive(Default)]
struct PoolState {
    chunks: HashMap<u64, BufferChunk>,
    used_chunks: Vec<u64>,
    free_chunks: Vec<u64>,
    next_chunk_id: u64,
}

/// Pools whole buffers and hands out ranges of them.
///
/// Many small buffers (uniforms, per-draw vertex data) share one
/// `vk::Buffer` and one device allocation, so they cost neither a buffer
/// object nor a device allocation each.
pub struct BufferPool {
    memory_manager: Arc<DeviceMemoryManager>,
    frame_counter: Arc<FrameCounter>,
    frames_to_wait: u64,
    buffer_allocation_size: vk::DeviceSize,
    limits: vk::PhysicalDeviceLimits,
    state: Mutex<PoolState>,
}

impl BufferPool {
    pub fn new(
        memory_manager: Arc<DeviceMemoryManager>,
        frame_counter: Arc<FrameCounter>,
        frames_to_wait: u64,
        buffer_allocation_size: vk::DeviceSize,
    ) -> Self {
        let limits = memory_manager.device().limits();
        Self {
            memory_manager,
            frame_counter,
            frames_to_wait,
            buffer_allocation_size,
            limits,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// The offset alignment the device requires for the given usage.
    pub fn alignment_for_usage(&self, usage: vk::BufferUsageFlags) -> vk::DeviceSize {
        let mut alignment = 1;
        if usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER) {
            alignment =
                alignment.max(self.limits.min_uniform_buffer_offset_alignment);
        }
        if usage.intersects(
            vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER
                | vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER,
        ) {
            alignment =
                alignment.max(self.limits.min_texel_buffer_offset_alignment);
        }
        if usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER) {
            alignment =
                alignment.max(self.limits.min_storage_buffer_offset_alignment);
        }
        alignment
    }

    /// Suballocate `size` bytes from a buffer which supports `usage` and
    /// lives in memory with at least `memory_property_flags`.
    pub fn allocate(
        self: &Arc<Self>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_property_flags: vk::MemoryPropertyFlags,
    ) -> Result<BufferSuballocation, MemoryError> {
        if size == 0 {
            return Err(MemoryError::ZeroSizedAllocation);
        }
        let alignment = self.alignment_for_usage(usage);
        let mut state = self.lock_state();

        let used = state.used_chunks.clone();
        for chunk_id in used {
            if let Some(suballocation) = self.try_allocate_from(
                &mut state,
                chunk_id,
                size,
                alignment,
                usage,
                memory_property_flags,
            ) {
                return Ok(suballocation);
            }
        }

        for index in 0..state.free_chunks.len() {
            let chunk_id = state.free_chunks[index];
            if let Some(suballocation) = self.try_allocate_from(
                &mut state,
                chunk_id,
                size,
                alignment,
                usage,
                memory_property_flags,
            ) {
                state.free_chunks.swap_remove(index);
                state.used_chunks.push(chunk_id);
                return Ok(suballocation);
            }
        }

        let buffer_size = size.max(self.buffer_allocation_size);
        let chunk = self.create_chunk(
            buffer_size,
            alignment,
            usage,
            memory_property_flags,
        )?;
        let chunk_id = state.next_chunk_id;
        state.next_chunk_id += 1;
        state.chunks.insert(chunk_id, chunk);
        state.used_chunks.push(chunk_id);

        Ok(self
            .try_allocate_from(
                &mut state,
                chunk_id,
                size,
                alignment,
                usage,
                memory_property_flags,
            )
            .expect("a new chunk always fits the request which created it"))
    }

    fn try_allocate_from(
        self: &Arc<Self>,
        state: &mut PoolState,
        chunk_id: u64,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_property_flags: vk::MemoryPropertyFlags,
    ) -> Option<BufferSuballocation> {
        let chunk = state.chunks.get_mut(&chunk_id)?;
        if !chunk.supports(usage, memory_property_flags) {
            return None;
        }
        let suballocation = chunk.allocator.try_allocate(size, alignment)?;
        let mapped_ptr = chunk.allocation.mapped_ptr().map(|base| unsafe {
            // Safe because the suballocation lies inside the chunk.
            base.add(suballocation.aligned_offset())
        });
        Some(BufferSuballocation {
            pool: self.clone(),
            chunk_id,
            buffer: chunk.buffer,
            memory: chunk.allocation.handle(),
            usage: chunk.usage,
            memory_property_flags: chunk.memory_property_flags,
            suballocation,
            mapped_ptr,
        })
    }

    fn create_chunk(
        &self,
        buffer_size: vk::DeviceSize,
        alignment: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_property_flags: vk::MemoryPropertyFlags,
    ) -> Result<BufferChunk, MemoryError> {
        let device = self.memory_manager.device();
        let buffer = unsafe {
            device.create_buffer(buffer_size, usage).map_err(|source| {
                MemoryError::UnableToCreateBuffer {
                    size: buffer_size,
                    usage,
                    source,
                }
            })?
        };
        let buffer = scopeguard::guard(buffer, |buffer| unsafe {
            device.destroy_buffer(buffer)
        });

        let requirements =
            unsafe { device.get_buffer_memory_requirements(*buffer) };
        let mut allocation = scopeguard::guard(
            self.memory_manager.alloc_with_properties(
                requirements.size,
                requirements.memory_type_bits,
                memory_property_flags,
            )?,
            |allocation| self.memory_manager.free(allocation),
        );

        unsafe {
            device
                .bind_buffer_memory(*buffer, allocation.handle(), 0)
                .map_err(MemoryError::UnableToBindBufferMemory)?;
        }
        if allocation.can_be_mapped() {
            let allocation_size = allocation.size();
            allocation.map(allocation_size, 0)?;
        }

        let type_flags = self.memory_manager.memory_properties().memory_types
            [allocation.memory_type_index() as usize]
            .property_flags;

        log::debug!(
            "Created buffer chunk {:?} of {} bytes with usage {:?} and memory \
             {:?}",
            *buffer,
            buffer_size,
            usage,
            type_flags
        );

        Ok(BufferChunk {
            buffer: ScopeGuard::into_inner(buffer),
            allocation: ScopeGuard::into_inner(allocation),
            allocator: SubresourceAllocator::new(buffer_size, alignment),
            usage,
            memory_property_flags: type_flags,
            frame_freed: 0,
        })
    }

    /// Return a range to its chunk. Chunks which become empty move to the
    /// free list tagged with the current frame.
    fn release(&self, chunk_id: u64, suballocation_id: u64) {
        let mut state = self.lock_state();
        let Some(chunk) = state.chunks.get_mut(&chunk_id) else {
            log::error!(
                "Released suballocation {} from unknown buffer chunk {}",
                suballocation_id,
                chunk_id
            );
            return;
        };
        if !chunk.allocator.release(suballocation_id) {
            return;
        }
        chunk.frame_freed = self.frame_counter.current();
        state.used_chunks.retain(|&id| id != chunk_id);
        state.free_chunks.push(chunk_id);
    }

    /// Destroy chunks which have been empty for long enough, or every empty
    /// chunk with `immediate`.
    ///
    /// Returns the number of chunks destroyed.
    pub fn release_freed_resources(&self, immediate: bool) -> usize {
        let current_frame = self.frame_counter.current();
        let released: Vec<BufferChunk> = {
            let mut state = self.lock_state();
            let frames_to_wait = self.frames_to_wait;
            let (expired, waiting): (Vec<u64>, Vec<u64>) =
                state.free_chunks.iter().partition(|id| {
                    immediate
                        || state.chunks[*id].frame_freed + frames_to_wait
                            < current_frame
                });
            state.free_chunks = waiting;
            expired
                .iter()
                .filter_map(|id| state.chunks.remove(id))
                .collect()
        };

        let count = released.len();
        for chunk in released {
            log::debug!(
                "Releasing buffer chunk {:?} of {} bytes",
                chunk.buffer,
                chunk.allocator.max_size()
            );
            self.destroy_chunk(chunk);
        }
        count
    }

    fn destroy_chunk(&self, chunk: BufferChunk) {
        unsafe {
            // Safe because no suballocations remain.
            self.memory_manager.device().destroy_buffer(chunk.buffer);
        }
        self.memory_manager.free(chunk.allocation);
    }

    pub fn num_used_chunks(&self) -> usize {
        self.lock_state().used_chunks.len()
    }

    pub fn num_free_chunks(&self) -> usize {
        self.lock_state().free_chunks.len()
    }

    pub fn dump_memory(&self) {
        let state = self.lock_state();
        let describe = |ids: &[u64]| -> Vec<String> {
            ids.iter()
                .map(|id| state.chunks[id].summary(*id))
                .collect()
        };
        log::info!(
            "Buffer pool: {} used chunks{}\n{} free chunks{}",
            state.used_chunks.len(),
            PrettyList(&describe(&state.used_chunks)),
            state.free_chunks.len(),
            PrettyList(&describe(&state.free_chunks)),
        );
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().expect("unable to acquire the buffer pool lock")
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let chunks: Vec<BufferChunk> = {
            let state = self
                .state
                .get_mut()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state.chunks.drain().map(|(_id, chunk)| chunk).collect()
        };
        for chunk in chunks {
            if !chunk.allocator.is_empty() {
                log::error!(
                    "Buffer chunk {:?} still has {} suballocations!",
                    chunk.buffer,
                    chunk.allocator.num_suballocations()
                );
            }
            self.destroy_chunk(chunk);
        }
    }
}

/// An owned range of a pooled buffer.
///
/// The range goes back to the pool when the handle is dropped.
pub struct BufferSuballocation {
    pool: Arc<BufferPool>,
    chunk_id: u64,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    usage: vk::BufferUsageFlags,
    memory_property_flags: vk::MemoryPropertyFlags,
    suballocation: Suballocation,
    mapped_ptr: Option<MappedPtr>,
}

impl BufferSuballocation {
    /// The pooled buffer which contains this range.
    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    /// The aligned offset of this range within the buffer.
    pub fn offset(&self) -> vk::DeviceSize {
        self.suballocation.aligned_offset()
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.suballocation.requested_size()
    }

    pub fn allocation_size(&self) -> vk::DeviceSize {
        self.suballocation.allocation_size()
    }

    /// The device memory bound to the pooled buffer.
    pub fn memory_handle(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn memory_property_flags(&self) -> vk::MemoryPropertyFlags {
        self.memory_property_flags
    }

    /// A host pointer to the start of this range, if the memory is mapped.
    pub fn mapped_ptr(&self) -> Option<MappedPtr> {
        self.mapped_ptr
    }
}

impl Drop for BufferSuballocation {
    fn drop(&mut self) {
        self.pool.release(self.chunk_id, self.suballocation.id());
    }
}

impl fmt::Debug for BufferSuballocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferSuballocation")
            .field("buffer", &self.buffer)
            .field("offset", &self.offset())
            .field("size", &self.size())
            .field("mapped_ptr", &self.mapped_ptr)
            .finish()
    }
}

use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use ash::vk;
use scopeguard::ScopeGuard;

use crate::{
    logging::PrettyList,
    memory::{MappedPtr, ResourceAllocation, ResourceHeapManager},
    sync::SubmissionTracker,
    MemoryError,
};

/// A host-visible buffer used as the source or target of a transfer.
///
/// Buffers are handed out by [StagingManager::acquire_buffer] and must be
/// given back with [StagingManager::release_buffer] once the transfer has
/// been recorded.
pub struct StagingBuffer {
    buffer: vk::Buffer,
    allocation: ResourceAllocation,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    cpu_read: bool,
}

impl StagingBuffer {
    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn allocation(&self) -> &ResourceAllocation {
        &self.allocation
    }

    /// The size the buffer was created with. Reused buffers can be larger
    /// than the size which was requested.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// True for read-back buffers, which live in host-cached memory.
    pub fn cpu_read(&self) -> bool {
        self.cpu_read
    }

    pub fn mapped_ptr(&self) -> Option<MappedPtr> {
        self.allocation.mapped_ptr()
    }

    pub fn flush_mapped_memory(&self) -> Result<(), MemoryError> {
        self.allocation.flush_mapped_memory()
    }

    pub fn invalidate_mapped_memory(&self) -> Result<(), MemoryError> {
        self.allocation.invalidate_mapped_memory()
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        if self.buffer != vk::Buffer::null() {
            log::error!(
                "Staging buffer {:?} was dropped without being released to \
                 the staging manager!",
                self.buffer
            );
        }
    }
}

impl fmt::Debug for StagingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagingBuffer")
            .field("buffer", &self.buffer)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .field("cpu_read", &self.cpu_read)
            .field("allocation", &self.allocation)
            .finish()
    }
}

/// A released buffer plus the submission counter it waits on.
struct PendingItem {
    command_buffer: Option<Arc<dyn SubmissionTracker>>,
    fence_counter: u64,
    buffer: StagingBuffer,
}

impl PendingItem {
    fn signaled_counter(&self) -> u64 {
        self.command_buffer
            .as_ref()
            .map_or(0, |command_buffer| command_buffer.fence_signaled_counter())
    }

    fn summary(&self) -> String {
        format!(
            "{:?} {} bytes, fence counter {}",
            self.buffer.buffer, self.buffer.size, self.fence_counter
        )
    }
}

#[derive(Default)]
struct StagingState {
    used: HashSet<vk::Buffer>,
    pending_free: Vec<PendingItem>,
    free: Vec<PendingItem>,
}

/// Recycles staging buffers across frames.
///
/// A released buffer may still be in use by the GPU, so it waits on the
/// pending list until the command buffer which used it has retired a
/// submission. After that it can be handed out again, and once it has gone
/// unused for long enough it is destroyed.
pub struct StagingManager {
    heap_manager: Arc<ResourceHeapManager>,
    frames_to_wait: u64,
    state: Mutex<StagingState>,
}

impl StagingManager {
    pub fn new(heap_manager: Arc<ResourceHeapManager>) -> Self {
        let frames_to_wait =
            heap_manager.config().frames_to_wait_before_releasing_to_os;
        Self {
            heap_manager,
            frames_to_wait,
            state: Mutex::new(StagingState::default()),
        }
    }

    /// Get a buffer with at least `size` bytes and every usage flag in
    /// `usage`.
    ///
    /// A free buffer is reused when one fits, otherwise a new buffer is
    /// created. Read-back buffers (`cpu_read`) use host-cached memory, upload
    /// buffers use host-coherent memory.
    pub fn acquire_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        cpu_read: bool,
    ) -> Result<StagingBuffer, MemoryError> {
        {
            let mut state = self.lock_state();
            let reusable = state.free.iter().position(|item| {
                item.buffer.size >= size
                    && item.buffer.usage.contains(usage)
                    && item.buffer.cpu_read == cpu_read
            });
            if let Some(index) = reusable {
                let item = state.free.swap_remove(index);
                state.used.insert(item.buffer.buffer);
                return Ok(item.buffer);
            }
        }

        let buffer = self.create_buffer(size, usage, cpu_read)?;
        self.lock_state().used.insert(buffer.buffer);
        Ok(buffer)
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        cpu_read: bool,
    ) -> Result<StagingBuffer, MemoryError> {
        let device = self.heap_manager.memory_manager().device();
        let raw = unsafe {
            device.create_buffer(size, usage).map_err(|source| {
                MemoryError::UnableToCreateBuffer {
                    size,
                    usage,
                    source,
                }
            })?
        };
        let raw = scopeguard::guard(raw, |raw| unsafe {
            device.destroy_buffer(raw)
        });

        let requirements = unsafe { device.get_buffer_memory_requirements(*raw) };
        let host_flags =
            if cpu_read && self.heap_manager.download_heap().is_some() {
                vk::MemoryPropertyFlags::HOST_CACHED
            } else {
                vk::MemoryPropertyFlags::HOST_COHERENT
            };
        let allocation = self.heap_manager.allocate_buffer_memory(
            &requirements,
            vk::MemoryPropertyFlags::HOST_VISIBLE | host_flags,
        )?;
        unsafe {
            // Safe because the buffer was just created and has no memory.
            allocation.bind_buffer(*raw)?;
        }

        log::trace!(
            "Created staging buffer {:?} of {} bytes (cpu read: {})",
            *raw,
            size,
            cpu_read
        );

        Ok(StagingBuffer {
            buffer: ScopeGuard::into_inner(raw),
            allocation,
            size,
            usage,
            cpu_read,
        })
    }

    /// Give a buffer back once its transfer has been recorded into
    /// `command_buffer`.
    ///
    /// The buffer isn't reused until the command buffer has retired a
    /// submission. Without a command buffer it is free on the next call to
    /// [Self::process_pending_free].
    ///
    /// # Panics
    ///
    /// Panics if the buffer was not acquired from this manager.
    pub fn release_buffer(
        &self,
        command_buffer: Option<Arc<dyn SubmissionTracker>>,
        buffer: StagingBuffer,
    ) {
        let mut state = self.lock_state();
        let was_used = state.used.remove(&buffer.buffer);
        if !was_used {
            drop(state);
            panic!(
                "Staging buffer {:?} was not acquired from this manager",
                buffer.buffer
            );
        }
        let fence_counter = command_buffer
            .as_ref()
            .map_or(0, |command_buffer| command_buffer.fence_signaled_counter());
        state.pending_free.push(PendingItem {
            command_buffer,
            fence_counter,
            buffer,
        });
    }

    /// Move buffers whose command buffer has moved on to the free list, then
    /// destroy free buffers which have gone unused for long enough.
    ///
    /// Call once per frame. With `immediate` every pending and free buffer is
    /// destroyed. Returns the number of buffers destroyed.
    pub fn process_pending_free(&self, immediate: bool) -> usize {
        let expired: Vec<StagingBuffer> = {
            let mut state = self.lock_state();
            let num_original_free = state.free.len();

            for mut item in std::mem::take(&mut state.pending_free) {
                let ready = immediate
                    || item.command_buffer.is_none()
                    || item.fence_counter < item.signaled_counter();
                if ready {
                    item.fence_counter = item.signaled_counter();
                    state.free.push(item);
                } else {
                    state.pending_free.push(item);
                }
            }

            let num_candidates = if immediate {
                state.free.len()
            } else {
                num_original_free
            };
            let newly_free = state.free.split_off(num_candidates);
            let frames_to_wait = self.frames_to_wait;
            let (expired, kept): (Vec<PendingItem>, Vec<PendingItem>) =
                std::mem::take(&mut state.free).into_iter().partition(|item| {
                    immediate
                        || item.command_buffer.is_none()
                        || item.fence_counter + frames_to_wait
                            < item.signaled_counter()
                });
            state.free = kept;
            state.free.extend(newly_free);
            expired.into_iter().map(|item| item.buffer).collect()
        };

        let count = expired.len();
        for buffer in expired {
            self.destroy(buffer);
        }
        count
    }

    fn destroy(&self, mut buffer: StagingBuffer) {
        log::trace!("Destroying staging buffer {:?}", buffer.buffer);
        unsafe {
            // Safe because the buffer's command buffer has retired.
            self.heap_manager
                .memory_manager()
                .device()
                .destroy_buffer(buffer.buffer);
        }
        buffer.buffer = vk::Buffer::null();
    }

    pub fn num_used(&self) -> usize {
        self.lock_state().used.len()
    }

    pub fn num_pending(&self) -> usize {
        self.lock_state().pending_free.len()
    }

    pub fn num_free(&self) -> usize {
        self.lock_state().free.len()
    }

    pub fn dump_memory(&self) {
        let state = self.lock_state();
        let used: Vec<String> =
            state.used.iter().map(|buffer| format!("{:?}", buffer)).collect();
        let pending: Vec<String> =
            state.pending_free.iter().map(PendingItem::summary).collect();
        let free: Vec<String> =
            state.free.iter().map(PendingItem::summary).collect();
        log::info!(
            "StagingManager {} Used {} Pending Free {} Free\nUsed:{}\nPending:{}\nFree:{}",
            used.len(),
            pending.len(),
            free.len(),
            PrettyList(&used),
            PrettyList(&pending),
            PrettyList(&free)
        );
    }

    fn lock_state(&self) -> MutexGuard<'_, StagingState> {
        self.state
            .lock()
            .expect("unable to acquire the staging manager lock")
    }
}

impl Drop for StagingManager {
    fn drop(&mut self) {
        self.process_pending_free(true);
        let num_used = self.num_used();
        if num_used > 0 {
            log::error!(
                "{} staging buffers were never released to the staging \
                 manager!",
                num_used
            );
        }
    }
}

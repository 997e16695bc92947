use std::{ffi::c_void, fmt, ptr::NonNull, sync::Arc};

use ash::vk;

use crate::{memory::MemoryDevice, MemoryError};

/// A host pointer into mapped device memory.
///
/// The pointer is only dereferenced by callers which hold the owning
/// allocation, so it is safe to move between threads along with it.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MappedPtr(NonNull<c_void>);

unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }

    /// The pointer `bytes` past this one.
    ///
    /// # Safety
    ///
    /// Unsafe because the result must stay inside the same mapping.
    pub(crate) unsafe fn add(self, bytes: vk::DeviceSize) -> Self {
        let ptr = (self.0.as_ptr() as *mut u8).add(bytes as usize);
        Self(NonNull::new_unchecked(ptr as *mut c_void))
    }
}

impl fmt::Debug for MappedPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.0)
    }
}

/// One discrete block of device memory obtained from the device.
///
/// Allocations are created and destroyed only by the
/// [DeviceMemoryManager](super::DeviceMemoryManager). They are move-only, so
/// once an allocation is handed back to the manager it can't be used again.
pub struct DeviceMemoryAllocation {
    pub(super) memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    memory_type_index: u32,
    can_be_mapped: bool,
    is_coherent: bool,
    is_cached: bool,
    mapped_ptr: Option<MappedPtr>,
    pub(super) device: Arc<dyn MemoryDevice>,
}

impl DeviceMemoryAllocation {
    pub(super) fn new(
        device: Arc<dyn MemoryDevice>,
        memory: vk::DeviceMemory,
        size: vk::DeviceSize,
        memory_type_index: u32,
        property_flags: vk::MemoryPropertyFlags,
    ) -> Self {
        Self {
            memory,
            size,
            memory_type_index,
            can_be_mapped: property_flags
                .contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
            is_coherent: property_flags
                .contains(vk::MemoryPropertyFlags::HOST_COHERENT),
            is_cached: property_flags
                .contains(vk::MemoryPropertyFlags::HOST_CACHED),
            mapped_ptr: None,
            device,
        }
    }

    /// The raw device memory handle.
    pub fn handle(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn can_be_mapped(&self) -> bool {
        self.can_be_mapped
    }

    pub fn is_coherent(&self) -> bool {
        self.is_coherent
    }

    pub fn is_cached(&self) -> bool {
        self.is_cached
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped_ptr.is_some()
    }

    /// The start of the currently mapped range, if any.
    pub fn mapped_ptr(&self) -> Option<MappedPtr> {
        self.mapped_ptr
    }

    /// Map `size` bytes starting at `offset` into host memory.
    ///
    /// # Errors
    ///
    /// * the memory type is not HOST_VISIBLE
    /// * the memory is already mapped, only one mapping can exist at a time
    /// * the requested range extends past the end of the allocation
    pub fn map(
        &mut self,
        size: vk::DeviceSize,
        offset: vk::DeviceSize,
    ) -> Result<MappedPtr, MemoryError> {
        if !self.can_be_mapped {
            return Err(MemoryError::MemoryIsNotHostVisible);
        }
        if self.mapped_ptr.is_some() {
            return Err(MemoryError::MemoryIsAlreadyMapped);
        }
        if offset.checked_add(size).map_or(true, |end| end > self.size) {
            return Err(MemoryError::MapRangeOutOfBounds {
                size,
                offset,
                allocation_size: self.size,
            });
        }

        let raw = unsafe {
            // Safe because the memory is host visible and not yet mapped.
            self.device
                .map_memory(self.memory, offset, size)
                .map_err(MemoryError::UnableToMapDeviceMemory)?
        };
        let ptr = NonNull::new(raw)
            .map(MappedPtr)
            .ok_or(MemoryError::UnableToMapDeviceMemory(
                vk::Result::ERROR_MEMORY_MAP_FAILED,
            ))?;
        self.mapped_ptr = Some(ptr);
        Ok(ptr)
    }

    /// Unmap the memory. Any pointers previously returned by map() are
    /// invalid after this call.
    pub fn unmap(&mut self) -> Result<(), MemoryError> {
        if self.mapped_ptr.take().is_none() {
            return Err(MemoryError::DeviceMemoryIsNotMapped);
        }
        unsafe { self.device.unmap_memory(self.memory) };
        Ok(())
    }

    /// Flush host writes so they are visible on the device. No-op for
    /// HOST_COHERENT memory.
    pub fn flush_mapped_memory(&self) -> Result<(), MemoryError> {
        if self.mapped_ptr.is_none() {
            return Err(MemoryError::DeviceMemoryIsNotMapped);
        }
        if self.is_coherent {
            return Ok(());
        }
        unsafe {
            self.device
                .flush_mapped_memory(self.memory, 0, vk::WHOLE_SIZE)
                .map_err(MemoryError::UnableToFlushMappedMemory)
        }
    }

    /// Make device writes visible to the host. No-op for HOST_COHERENT
    /// memory.
    pub fn invalidate_mapped_memory(&self) -> Result<(), MemoryError> {
        if self.mapped_ptr.is_none() {
            return Err(MemoryError::DeviceMemoryIsNotMapped);
        }
        if self.is_coherent {
            return Ok(());
        }
        unsafe {
            self.device
                .invalidate_mapped_memory(self.memory, 0, vk::WHOLE_SIZE)
                .map_err(MemoryError::UnableToInvalidateMappedMemory)
        }
    }
}

impl Drop for DeviceMemoryAllocation {
    fn drop(&mut self) {
        if self.memory != vk::DeviceMemory::null() {
            log::error!(
                "Device memory {:?} ({} bytes) was dropped without being \
                 freed by the DeviceMemoryManager!",
                self.memory,
                self.size
            );
        }
    }
}

impl fmt::Debug for DeviceMemoryAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceMemoryAllocation")
            .field("memory", &self.memory)
            .field("size", &self.size)
            .field("memory_type_index", &self.memory_type_index)
            .field("mapped_ptr", &self.mapped_ptr)
            .finish()
    }
}

use std::collections::HashMap;

use ash::vk;

use crate::memory::align_up;

/// A contiguous range of unused bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

impl FreeBlock {
    fn end(&self) -> vk::DeviceSize {
        self.offset + self.size
    }
}

/// A range carved out of a [SubresourceAllocator].
///
/// `allocation_offset..allocation_offset + allocation_size` is the range
/// consumed from the free list, which includes padding in front of
/// `aligned_offset` so the requested bytes start on the requested alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Suballocation {
    id: u64,
    requested_size: vk::DeviceSize,
    aligned_offset: vk::DeviceSize,
    allocation_size: vk::DeviceSize,
    allocation_offset: vk::DeviceSize,
}

impl Suballocation {
    /// Identifies the suballocation within its allocator.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn requested_size(&self) -> vk::DeviceSize {
        self.requested_size
    }

    pub fn aligned_offset(&self) -> vk::DeviceSize {
        self.aligned_offset
    }

    pub fn allocation_size(&self) -> vk::DeviceSize {
        self.allocation_size
    }

    pub fn allocation_offset(&self) -> vk::DeviceSize {
        self.allocation_offset
    }
}

/// A first-fit free-list allocator over the byte range `[0, max_size)`.
///
/// The allocator only does bookkeeping. It doesn't own any memory, so pages
/// and buffer chunks pair one with the allocation or buffer it describes.
#[derive(Debug)]
pub struct SubresourceAllocator {
    max_size: vk::DeviceSize,
    min_alignment: vk::DeviceSize,
    free_list: Vec<FreeBlock>,
    suballocations: HashMap<u64, Suballocation>,
    next_id: u64,
    used_size: vk::DeviceSize,
    peak_num_allocations: usize,
}

impl SubresourceAllocator {
    pub fn new(max_size: vk::DeviceSize, min_alignment: vk::DeviceSize) -> Self {
        Self {
            max_size,
            min_alignment: min_alignment.max(1),
            free_list: vec![FreeBlock {
                offset: 0,
                size: max_size,
            }],
            suballocations: HashMap::new(),
            next_id: 0,
            used_size: 0,
            peak_num_allocations: 0,
        }
    }

    /// Carve `size` bytes aligned to `alignment` out of the first free block
    /// which can hold them.
    ///
    /// Returns None when no block fits. That isn't an error, the caller is
    /// expected to try somewhere else.
    pub fn try_allocate(
        &mut self,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
    ) -> Option<Suballocation> {
        if size == 0 {
            return None;
        }
        let alignment = alignment.max(self.min_alignment);

        let (index, aligned_offset, allocation_size) = self
            .free_list
            .iter()
            .enumerate()
            .find_map(|(index, entry)| {
                let aligned_offset = align_up(entry.offset, alignment);
                let allocation_size =
                    (aligned_offset - entry.offset).checked_add(size)?;
                if allocation_size <= entry.size {
                    Some((index, aligned_offset, allocation_size))
                } else {
                    None
                }
            })?;

        let entry = &mut self.free_list[index];
        let allocation_offset = entry.offset;
        if allocation_size == entry.size {
            self.free_list.remove(index);
        } else {
            entry.offset += allocation_size;
            entry.size -= allocation_size;
        }

        let suballocation = Suballocation {
            id: self.next_id,
            requested_size: size,
            aligned_offset,
            allocation_size,
            allocation_offset,
        };
        self.next_id += 1;
        self.used_size += allocation_size;
        self.suballocations.insert(suballocation.id, suballocation);
        self.peak_num_allocations =
            self.peak_num_allocations.max(self.suballocations.len());

        Some(suballocation)
    }

    /// Return a suballocation's range to the free list.
    ///
    /// Returns true when no suballocations remain.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not live in this allocator.
    pub fn release(&mut self, id: u64) -> bool {
        let suballocation =
            self.suballocations.remove(&id).unwrap_or_else(|| {
                panic!("Suballocation {} is not live, was it released twice?", id)
            });
        self.used_size -= suballocation.allocation_size;

        let block = FreeBlock {
            offset: suballocation.allocation_offset,
            size: suballocation.allocation_size,
        };
        let index = self
            .free_list
            .partition_point(|entry| entry.offset < block.offset);
        self.free_list.insert(index, block);
        self.merge_with_neighbors(index);

        let is_empty = self.suballocations.is_empty();
        if is_empty {
            assert_eq!(
                self.free_list,
                [FreeBlock {
                    offset: 0,
                    size: self.max_size
                }],
                "an empty allocator must have exactly one free block"
            );
        }
        is_empty
    }

    /// Sort the free list and merge every pair of contiguous blocks.
    ///
    /// Returns true when the allocator is completely free.
    pub fn join_free_blocks(&mut self) -> bool {
        self.free_list.sort_by_key(|entry| entry.offset);
        let mut merged: Vec<FreeBlock> = Vec::with_capacity(self.free_list.len());
        for entry in self.free_list.drain(..) {
            match merged.last_mut() {
                Some(last) if last.end() == entry.offset => {
                    last.size += entry.size;
                }
                _ => merged.push(entry),
            }
        }
        self.free_list = merged;

        self.free_list.len() == 1
            && self.free_list[0].offset == 0
            && self.free_list[0].size == self.max_size
    }

    fn merge_with_neighbors(&mut self, index: usize) {
        let mut index = index;
        if index > 0 && self.free_list[index - 1].end() == self.free_list[index].offset
        {
            self.free_list[index - 1].size += self.free_list[index].size;
            self.free_list.remove(index);
            index -= 1;
        }
        if index + 1 < self.free_list.len()
            && self.free_list[index].end() == self.free_list[index + 1].offset
        {
            self.free_list[index].size += self.free_list[index + 1].size;
            self.free_list.remove(index + 1);
        }
    }

    pub fn max_size(&self) -> vk::DeviceSize {
        self.max_size
    }

    pub fn min_alignment(&self) -> vk::DeviceSize {
        self.min_alignment
    }

    /// Bytes consumed by live suballocations, including alignment padding.
    pub fn used_size(&self) -> vk::DeviceSize {
        self.used_size
    }

    pub fn free_size(&self) -> vk::DeviceSize {
        self.max_size - self.used_size
    }

    pub fn num_suballocations(&self) -> usize {
        self.suballocations.len()
    }

    pub fn peak_num_allocations(&self) -> usize {
        self.peak_num_allocations
    }

    pub fn is_empty(&self) -> bool {
        self.suballocations.is_empty()
    }

    /// The free list, sorted by offset.
    pub fn free_blocks(&self) -> &[FreeBlock] {
        &self.free_list
    }

    /// Every live suballocation, sorted by offset.
    pub fn suballocations(&self) -> Vec<Suballocation> {
        let mut live: Vec<Suballocation> =
            self.suballocations.values().copied().collect();
        live.sort_by_key(|suballocation| suballocation.allocation_offset);
        live
    }
}

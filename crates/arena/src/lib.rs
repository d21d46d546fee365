//! A rolling arena allocator for the per-frame decode pipeline.
//!
//! Frame-scoped allocations have strongly correlated lifetimes: they are
//! freed roughly in the order they were made. The arena exploits this with a
//! FIFO slot ring over one growing backing buffer, giving O(1) allocate and
//! free in the common case. When the active buffer fills, a double-size
//! buffer is appended; drained older buffers are released as soon as their
//! last allocation goes away.
//!
//! Allocations are addressed by opaque [`ArenaAllocation`] handles; data is
//! reached through [`RollingArena::with_slice`]. A single mutex serialises
//! all operations, so handles can be used freely across threads.
#![cfg_attr(all(coverage_nightly, test), feature(coverage_attribute))]
#![deny(unsafe_code)]

use std::sync::Mutex;

use tracing::error;

/// Minimum alignment of allocations in bytes.
const MIN_ALIGNMENT: usize = 64;

/// Upper bound on simultaneously retained backing buffers.
const MAX_BUFFERS: usize = 16;

/// Opaque handle to a live arena allocation. Reallocation may move the data;
/// the handle stays valid until [`RollingArena::free`].
#[derive(Debug)]
pub struct ArenaAllocation {
    /// Monotonic allocation index; never reused.
    index: u32,
    /// Backing buffer and aligned byte offset of the data.
    buffer_index: u32,
    offset: u32,
    size: usize,
    alignment: usize,
}

impl ArenaAllocation {
    pub fn size(&self) -> usize {
        self.size
    }

    /// Identity of the data placement, for replay comparisons.
    pub fn location(&self) -> (u32, u32) {
        (self.buffer_index, self.offset)
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    /// Byte range this allocation occupies within its buffer, including
    /// alignment padding. `begin == end` marks an empty slot; `begin > end`
    /// marks an allocation that wrapped to the start of the buffer.
    begin_offset: u32,
    end_offset: u32,
    buffer_index: u32,
}

struct BackingBuffer {
    /// None once released back to the parent allocator.
    memory: Option<Vec<u8>>,
    allocation_count: u32,
}

struct ArenaState {
    buffers: Vec<BackingBuffer>,

    buffer_size: u32,
    buffer_mask: u32,
    buffer_front: u32,
    buffer_back: u32,

    slots: Vec<Slot>,
    slots_mask: u32,
    slot_front: u32,
    slot_back: u32,

    allocation_index_next: u32,
    allocation_index_oldest: u32,
}

/// The rolling arena. See the crate docs for the allocation discipline it is
/// tuned for.
pub struct RollingArena {
    state: Mutex<ArenaState>,
}

impl RollingArena {
    /// Creates an arena with `initial_slot_count` slots and an
    /// `initial_buffer_size`-byte backing buffer. Both must be powers of two.
    pub fn new(initial_slot_count: u32, initial_buffer_size: u32) -> Self {
        assert!(initial_slot_count.is_power_of_two());
        assert!(initial_buffer_size.is_power_of_two());

        let mut state = ArenaState {
            buffers: Vec::new(),
            buffer_size: 0,
            buffer_mask: 0,
            buffer_front: 0,
            buffer_back: 0,
            slots: vec![
                Slot {
                    begin_offset: 0,
                    end_offset: 0,
                    buffer_index: 0,
                };
                initial_slot_count as usize
            ],
            slots_mask: initial_slot_count - 1,
            slot_front: 0,
            slot_back: 0,
            allocation_index_next: 0,
            allocation_index_oldest: 0,
        };
        state.add_buffer(initial_buffer_size);

        Self {
            state: Mutex::new(state),
        }
    }

    /// Allocates `size` bytes aligned to `alignment` (relative to the backing
    /// buffer start, minimum 64). Returns `None` when the backing-buffer
    /// table is exhausted.
    pub fn allocate(&self, size: usize, alignment: usize) -> Option<ArenaAllocation> {
        let mut state = self.state.lock().expect("arena mutex poisoned");
        state.allocate(size, alignment)
    }

    /// Frees an allocation, retiring its slot and possibly releasing a
    /// drained backing buffer.
    pub fn free(&self, allocation: ArenaAllocation) {
        let mut state = self.state.lock().expect("arena mutex poisoned");
        state.free(&allocation);
    }

    /// Grows or shrinks an allocation. Grows in place when the slot region
    /// allows, otherwise moves the data to a fresh allocation (the handle is
    /// updated; re-read its location). Returns false when a required new
    /// allocation failed.
    pub fn reallocate(&self, allocation: &mut ArenaAllocation, size: usize) -> bool {
        let mut state = self.state.lock().expect("arena mutex poisoned");
        state.reallocate(allocation, size)
    }

    /// Runs `f` over the allocation's bytes. The arena lock is held for the
    /// duration; do not call back into the arena from `f`.
    pub fn with_slice<R>(&self, allocation: &ArenaAllocation, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut state = self.state.lock().expect("arena mutex poisoned");
        let buffer = state.buffers[allocation.buffer_index as usize]
            .memory
            .as_mut()
            .expect("allocation in released buffer");
        let start = allocation.offset as usize;
        f(&mut buffer[start..start + allocation.size])
    }

    /// Discards all allocations and retained buffers except the active one,
    /// rewinding the arena to its initial state. Outstanding handles become
    /// invalid.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("arena mutex poisoned");
        state.reset();
    }

    /// Number of live allocations.
    pub fn live_allocations(&self) -> usize {
        let state = self.state.lock().expect("arena mutex poisoned");
        state
            .buffers
            .iter()
            .map(|buffer| buffer.allocation_count as usize)
            .sum()
    }

    /// Number of retained backing buffers.
    pub fn buffer_count(&self) -> usize {
        let state = self.state.lock().expect("arena mutex poisoned");
        state
            .buffers
            .iter()
            .filter(|buffer| buffer.memory.is_some())
            .count()
    }

    /// True when no allocation is live and both rings have drained.
    pub fn is_empty(&self) -> bool {
        let state = self.state.lock().expect("arena mutex poisoned");
        state.slot_front == state.slot_back && state.buffer_front == state.buffer_back
    }
}

impl ArenaState {
    fn active_buffer_index(&self) -> u32 {
        self.buffers.len() as u32 - 1
    }

    fn add_buffer(&mut self, buffer_size: u32) -> bool {
        debug_assert!(buffer_size.is_power_of_two());

        if self.buffers.len() >= MAX_BUFFERS {
            error!(buffers = self.buffers.len(), "rolling arena buffer table exhausted");
            return false;
        }

        self.buffers.push(BackingBuffer {
            memory: Some(vec![0u8; buffer_size as usize]),
            allocation_count: 0,
        });

        self.buffer_size = buffer_size;
        self.buffer_mask = buffer_size - 1;
        self.buffer_front = 0;
        self.buffer_back = 0;

        true
    }

    fn double_slots(&mut self) {
        let old_count = self.slots.len() as u32;
        let new_count = old_count * 2;
        debug_assert!(new_count.is_power_of_two());

        self.slots.resize(
            new_count as usize,
            Slot {
                begin_offset: 0,
                end_offset: 0,
                buffer_index: 0,
            },
        );

        if self.slot_front < self.slot_back {
            // Move the wrapped front portion up into the new space.
            for i in 0..self.slot_front {
                self.slots[(old_count + i) as usize] = self.slots[i as usize];
            }
            self.slot_front += old_count;
        }

        self.slots_mask = new_count - 1;
    }

    fn allocate(&mut self, size: usize, alignment: usize) -> Option<ArenaAllocation> {
        debug_assert!(size > 0);

        let align = alignment.max(MIN_ALIGNMENT);
        // Extra size so an aligned range always exists inside the region.
        let aligned_size = (size + align - 1) as u32;

        let mut old_buffer_front = 0;
        let mut offset = u32::MAX;

        while offset == u32::MAX {
            old_buffer_front = self.buffer_front;

            let occupied =
                (self.buffer_front + self.buffer_size - self.buffer_back) & self.buffer_mask;
            let free_size = self.buffer_size - occupied - 1;

            if free_size >= aligned_size && self.buffer_size - self.buffer_front >= aligned_size {
                // Fits in the remaining part of the buffer.
                offset = self.buffer_front;
                self.buffer_front = (self.buffer_front + aligned_size) & self.buffer_mask;
            } else if free_size >= aligned_size && self.buffer_back >= aligned_size {
                // Fits at the start of the buffer.
                offset = 0;
                self.buffer_front = aligned_size;
            } else {
                // Add a buffer big enough for the request and try again.
                let mut next_size = self.buffer_size * 2;
                while next_size < free_size + aligned_size {
                    next_size *= 2;
                }
                if !self.add_buffer(next_size) {
                    return None;
                }
            }
        }

        if (self.slot_front + 1) & self.slots_mask == self.slot_back {
            self.double_slots();
        }

        let allocation_index = self.allocation_index_next;
        let slot = self.slot_front as usize;
        self.allocation_index_next += 1;
        self.slot_front = (self.slot_front + 1) & self.slots_mask;

        // The slot records the reserved range; the handed-out offset differs
        // by alignment padding and wrapping.
        let buffer_index = self.active_buffer_index();
        self.slots[slot] = Slot {
            begin_offset: old_buffer_front,
            end_offset: self.buffer_front,
            buffer_index,
        };
        self.buffers[buffer_index as usize].allocation_count += 1;

        let data_offset = (offset as usize + align - 1) & !(align - 1);

        Some(ArenaAllocation {
            index: allocation_index,
            buffer_index,
            offset: data_offset as u32,
            size,
            alignment: align,
        })
    }

    /// Maps an allocation index back into the slot ring.
    fn slot_of(&self, allocation: &ArenaAllocation) -> usize {
        debug_assert!(allocation.index >= self.allocation_index_oldest);
        debug_assert!(allocation.index < self.allocation_index_next);
        ((allocation.index - self.allocation_index_oldest + self.slot_back) & self.slots_mask)
            as usize
    }

    fn free(&mut self, allocation: &ArenaAllocation) {
        let slot = self.slot_of(allocation);
        let begin_offset = self.slots[slot].begin_offset;
        let buffer = self.slots[slot].buffer_index;

        // Mark the slot empty.
        self.slots[slot].begin_offset = self.slots[slot].end_offset;

        if buffer == self.active_buffer_index() && begin_offset == self.buffer_back {
            // Oldest slot in the active buffer: bump the back over any run of
            // contiguous empty slots.
            let mut s = slot as u32;
            while s != self.slot_front
                && self.slots[s as usize].begin_offset == self.slots[s as usize].end_offset
            {
                self.buffer_back = self.slots[s as usize].end_offset;
                s = (s + 1) & self.slots_mask;
            }
        }

        if slot as u32 == self.slot_back {
            // Oldest slot overall: bump the back pointer over empty slots.
            while self.slot_back != self.slot_front
                && self.slots[self.slot_back as usize].begin_offset
                    == self.slots[self.slot_back as usize].end_offset
            {
                self.slot_back = (self.slot_back + 1) & self.slots_mask;
                self.allocation_index_oldest += 1;
            }
        }

        let active = self.active_buffer_index();
        let entry = &mut self.buffers[buffer as usize];
        debug_assert!(entry.allocation_count > 0);
        entry.allocation_count -= 1;

        if entry.allocation_count == 0 && buffer != active {
            // A drained non-active buffer can be released.
            entry.memory = None;
        }
    }

    fn reallocate(&mut self, allocation: &mut ArenaAllocation, size: usize) -> bool {
        let slot = self.slot_of(allocation);
        let Slot {
            begin_offset,
            end_offset,
            buffer_index,
        } = self.slots[slot];

        // Space available without moving: to the slot end, or to the end of
        // the buffer when the slot wraps.
        let buffer_len = self.buffers[buffer_index as usize]
            .memory
            .as_ref()
            .expect("reallocate in released buffer")
            .len();
        let current_size = if end_offset > begin_offset {
            end_offset as usize - allocation.offset as usize
        } else {
            buffer_len - allocation.offset as usize
        };

        if size <= current_size {
            allocation.size = size;
            return true;
        }

        let Some(mut new_allocation) = self.allocate(size, allocation.alignment) else {
            return false;
        };

        // Copy over the preserved prefix.
        let preserved = size.min(allocation.size);
        for i in 0..preserved {
            let byte = self.buffers[allocation.buffer_index as usize]
                .memory
                .as_ref()
                .expect("source buffer released")[allocation.offset as usize + i];
            self.buffers[new_allocation.buffer_index as usize]
                .memory
                .as_mut()
                .expect("new buffer released")[new_allocation.offset as usize + i] = byte;
        }

        self.free(allocation);
        *allocation = new_allocation;
        true
    }

    fn reset(&mut self) {
        let active = self.buffers.pop().expect("arena has an active buffer");
        self.buffers.clear();
        self.buffers.push(BackingBuffer {
            memory: active.memory,
            allocation_count: 0,
        });

        self.buffer_front = 0;
        self.buffer_back = 0;
        self.slot_front = 0;
        self.slot_back = 0;
        self.allocation_index_next = 0;
        self.allocation_index_oldest = 0;
    }
}

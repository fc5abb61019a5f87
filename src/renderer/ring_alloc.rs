//! A circular bump allocator for transient host visible memory.
//!
//! Memory is handed out per submission epoch and only becomes reusable once that epoch has
//! retired. The allocator itself never blocks. If an allocation would overwrite bytes belonging
//! to an epoch that has not retired yet [`RingFull`] is returned and the caller must submit and
//! wait before retrying. Sizing is expected to be generous enough that this does not happen in
//! practice.

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;

use crate::device::backend::RingBufferBacking;
use crate::prelude::*;
use crate::util::alloc::next_aligned;

/// A transient allocation valid until its epoch retires.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Allocation {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
    pub mapped: NonNull<u8>,
    pub epoch: u64,
}

/// The allocation would overlap memory of an epoch that has not retired.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct RingFull {
    pub requested: u64,
}

struct SyncPoint {
    epoch: u64,
    offset: u64,
}

pub struct RingAllocator {
    device: Arc<DeviceContext>,
    backing: RingBufferBacking,
    write_index: u64,
    sync_points: VecDeque<SyncPoint>,
    last_sync_epoch: u64,
}

impl RingAllocator {
    pub fn new(device: Arc<DeviceContext>, backing: RingBufferBacking) -> Self {
        Self {
            device,
            backing,
            write_index: 0,
            sync_points: VecDeque::new(),
            last_sync_epoch: 0,
        }
    }

    pub fn get_capacity(&self) -> u64 {
        self.backing.size
    }

    pub fn has_live_data(&self) -> bool {
        !self.sync_points.is_empty()
    }

    /// Bump allocates `size` bytes tagged with submission epoch `epoch`.
    ///
    /// Epochs must be passed in non decreasing order. The returned memory must not be written
    /// after the epoch has been submitted.
    pub fn allocate(&mut self, size: u64, alignment: u64, epoch: u64) -> Result<Allocation, RingFull> {
        if size > self.backing.size {
            return Err(RingFull { requested: size });
        }

        let mut base = next_aligned(self.write_index, alignment);
        if base + size > self.backing.size {
            // wrap around, restart allocation at offset 0
            if !self.fits_before_barrier(0, size) {
                return Err(RingFull { requested: size });
            }
            self.write_index = 0;
            base = 0;
        } else if !self.fits_before_barrier(self.write_index, base + size - self.write_index) {
            return Err(RingFull { requested: size });
        }

        self.add_sync_point(epoch);
        self.write_index = base + size;

        let mapped = unsafe {
            // In bounds because base + size <= backing.size
            NonNull::new_unchecked(self.backing.mapped.as_ptr().add(base as usize))
        };

        Ok(Allocation {
            buffer: self.backing.buffer,
            offset: base,
            size,
            mapped,
            epoch,
        })
    }

    /// Releases all memory tagged with `retired_id` or older.
    ///
    /// May only be called after retirement of `retired_id` has been confirmed by a fence.
    pub fn reclaim(&mut self, retired_id: u64) {
        while let Some(front) = self.sync_points.front() {
            if front.epoch <= retired_id {
                self.sync_points.pop_front();
            } else {
                break;
            }
        }
    }

    /// Checks that `[from, from + space)` does not cross the start of the oldest live epoch.
    fn fits_before_barrier(&self, from: u64, space: u64) -> bool {
        match self.sync_points.front() {
            Some(front) => {
                if front.offset < from {
                    // Live data is behind the write position, everything up to the buffer end
                    // is free.
                    from + space <= self.backing.size
                } else if front.offset == from && front.epoch == self.last_sync_epoch && self.write_index == from {
                    // Only the current epoch's own sync point sits at the write position.
                    from + space <= self.backing.size
                } else {
                    from + space <= front.offset
                }
            }
            None => from + space <= self.backing.size,
        }
    }

    fn add_sync_point(&mut self, epoch: u64) {
        if epoch == self.last_sync_epoch && !self.sync_points.is_empty() {
            return;
        }
        self.last_sync_epoch = epoch;
        self.sync_points.push_back(SyncPoint {
            epoch,
            offset: self.write_index,
        });
    }
}

impl Drop for RingAllocator {
    fn drop(&mut self) {
        if self.has_live_data() {
            log::warn!("RingAllocator dropped while epochs are still live");
        }
        self.device.get_backend().destroy_ring_buffer(&self.backing);
    }
}

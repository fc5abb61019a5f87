//! Deferred destruction of GPU objects.
//!
//! Two paths feed into this module. Transient resources whose last use is known up front are
//! queued into the bucket of the submission that uses them and destroyed in bulk when that
//! submission retires. Shared [`Destructible`] objects are released through
//! [`DestructionQueue::release_object`]. If they cannot be destroyed at release time they land on
//! a pending list which is rescanned after every retirement.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::objects::{Destructible, ObjectKind};
use crate::prelude::*;

pub struct DestructionQueue {
    slot_count: u64,
    slots: Box<[Mutex<Vec<ObjectKind>>]>,
    pending: Mutex<Vec<Arc<Destructible>>>,
}

impl DestructionQueue {
    pub fn new(slot_count: usize) -> Self {
        let slots = (0..slot_count).map(|_| Mutex::new(Vec::new())).collect();
        Self {
            slot_count: slot_count as u64,
            slots,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Queues a raw resource for destruction once submission `submission_id` has retired.
    ///
    /// The caller guarantees that no submission after `submission_id` uses the resource. The
    /// bucket of a slot is always flushed before the slot is reused, so `submission_id` must not
    /// lag the retired counter by more than the slot count.
    pub fn queue_for_submission(&self, submission_id: u64, kind: ObjectKind) {
        let slot = (submission_id % self.slot_count) as usize;
        self.slots[slot].lock().push(kind);
    }

    /// Destroys everything queued onto the slot of retired submission `submission_id`.
    pub(crate) fn flush_retired(&self, submission_id: u64, backend: &dyn GpuBackend) {
        let slot = (submission_id % self.slot_count) as usize;
        let drained = std::mem::take(&mut *self.slots[slot].lock());
        for kind in drained {
            kind.destroy(backend);
        }
    }

    /// Drops one reference to `object` and destroys it if it became destroyable.
    ///
    /// Objects which are still referenced or still in flight are parked on the pending list and
    /// picked up by [`Self::process_pending`] on a later retirement.
    pub fn release_object(&self, object: Arc<Destructible>, retired_id: u64, backend: &dyn GpuBackend) {
        if object.release_ref() > 0 {
            return;
        }
        self.dispose_object(object, retired_id, backend);
    }

    /// Destroys `object` once it becomes destroyable, without touching its reference count.
    ///
    /// Used for objects whose owner is done with them but which may still be referenced by cache
    /// entries or in flight submissions.
    pub fn dispose_object(&self, object: Arc<Destructible>, retired_id: u64, backend: &dyn GpuBackend) {
        if object.is_destroyed() {
            return;
        }
        if object.can_destroy(retired_id) {
            object.destroy(backend);
        } else {
            self.pending.lock().push(object);
        }
    }

    /// Rescans the pending list against the current retired counter.
    ///
    /// An object may have gained references again while parked, in which case it simply stays
    /// pending until its count drops back to zero. Destruction runs after the list lock is
    /// released, native destroy calls must not serialize against new releases.
    pub(crate) fn process_pending(&self, retired_id: u64, backend: &dyn GpuBackend) {
        let mut destroyable = Vec::new();
        {
            let mut pending = self.pending.lock();
            pending.retain(|object| {
                // The same object may have been parked through multiple paths.
                if object.is_destroyed() {
                    return false;
                }
                if object.can_destroy(retired_id) {
                    destroyable.push(object.clone());
                    false
                } else {
                    true
                }
            });
        }
        for object in destroyable {
            if !object.is_destroyed() {
                object.destroy(backend);
            }
        }
    }

    pub fn get_pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Unconditionally destroys everything still queued or pending.
    ///
    /// Only legal once the device is idle and all submissions have retired.
    pub(crate) fn drain_all(&self, backend: &dyn GpuBackend) {
        for slot in self.slots.iter() {
            let drained = std::mem::take(&mut *slot.lock());
            for kind in drained {
                kind.destroy(backend);
            }
        }
        let pending = std::mem::take(&mut *self.pending.lock());
        for object in pending {
            if !object.is_destroyed() {
                object.destroy(backend);
            }
        }
    }
}

assert_impl_all!(DestructionQueue: Send, Sync);

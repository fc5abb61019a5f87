//! Command buffer recording, submission and retirement.
//!
//! Recording happens into a fixed ring of command buffer slots. Every slot carries a fence used
//! to detect retirement and a semaphore which the next submission waits on, so submissions
//! execute on the GPU in the order they were issued. Submission ids are assigned from a
//! monotonically increasing counter, the id currently being recorded is always `issued + 1`.
//!
//! Retirement is strictly FIFO. A slot only retires once its fence is signaled and all older
//! slots have retired, regardless of the order in which fences signal.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;

use crate::device::backend::QueueSubmission;
use crate::prelude::*;
use crate::renderer::destruction::DestructionQueue;
use crate::renderer::ring_alloc::{Allocation, RingAllocator};
use crate::renderer::EngineError;

/// Draw count at which the current command buffer is submitted even without an explicit request.
pub const DEFAULT_SUBMIT_THRESHOLD: u32 = 300;

/// Shared view of the submission counters.
///
/// Readable without taking the sequencer lock. `issued` is the id of the last submission handed
/// to the queue, `retired` the id of the last submission whose completion has been observed.
pub struct Timeline {
    issued: AtomicU64,
    retired: AtomicU64,
}

impl Timeline {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            issued: AtomicU64::new(0),
            retired: AtomicU64::new(0),
        })
    }

    pub fn get_issued(&self) -> u64 {
        self.issued.load(Ordering::Acquire)
    }

    pub fn get_retired(&self) -> u64 {
        self.retired.load(Ordering::Acquire)
    }

    /// The id of the submission currently being recorded.
    pub fn get_current(&self) -> u64 {
        self.get_issued() + 1
    }
}

struct Slot {
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
    semaphore: vk::Semaphore,
    submission_id: u64,
}

pub struct SubmissionSequencer {
    device: Arc<DeviceContext>,
    timeline: Arc<Timeline>,
    destruction: Arc<DestructionQueue>,
    staging: RingAllocator,

    slots: Box<[Slot]>,
    /// Index of the slot currently being recorded.
    current_index: usize,
    /// Index of the oldest slot that has been submitted but not yet retired. Coincides with
    /// `current_index` both when the ring is empty and when it is full, so in flight checks go
    /// through [`Self::slot_in_flight`] instead of comparing indices.
    sync_index: usize,

    recorded_draws: u32,
    submit_threshold: u32,
    submit_on_idle: bool,
}

impl SubmissionSequencer {
    pub fn new(
        device: Arc<DeviceContext>,
        timeline: Arc<Timeline>,
        destruction: Arc<DestructionQueue>,
        slot_count: usize,
        staging_size: u64,
    ) -> Result<Self, vk::Result> {
        let backend = device.get_backend().clone();

        let mut slots = Vec::with_capacity(slot_count);
        for _ in 0..slot_count {
            slots.push(Slot {
                command_buffer: backend.allocate_command_buffer()?,
                fence: backend.create_fence()?,
                semaphore: backend.create_semaphore()?,
                submission_id: 0,
            });
        }

        let backing = backend.create_ring_buffer(staging_size)?;
        let staging = RingAllocator::new(device.clone(), backing);

        let mut sequencer = Self {
            device,
            timeline,
            destruction,
            staging,
            slots: slots.into_boxed_slice(),
            current_index: 0,
            sync_index: 0,
            recorded_draws: 0,
            submit_threshold: DEFAULT_SUBMIT_THRESHOLD,
            submit_on_idle: false,
        };
        sequencer.begin_current_slot()?;
        Ok(sequencer)
    }

    pub fn get_timeline(&self) -> &Arc<Timeline> {
        &self.timeline
    }

    /// The command buffer currently being recorded.
    pub fn current_command_buffer(&self) -> vk::CommandBuffer {
        self.slots[self.current_index].command_buffer
    }

    pub fn current_submission_id(&self) -> u64 {
        self.timeline.get_current()
    }

    /// Number of submissions issued but not yet retired.
    pub fn in_flight_count(&self) -> usize {
        (self.timeline.get_issued() - self.timeline.get_retired()) as usize
    }

    /// Allocates transient staging memory valid until the current submission retires.
    ///
    /// If the ring is full the current command buffer is submitted and the call blocks until
    /// enough older submissions have retired.
    pub fn allocate_staging(&mut self, size: u64, alignment: u64) -> Result<Allocation, EngineError> {
        if size > self.staging.get_capacity() {
            return Err(EngineError::StagingExhausted { requested: size });
        }
        loop {
            let epoch = self.current_submission_id();
            match self.staging.allocate(size, alignment, epoch) {
                Ok(allocation) => return Ok(allocation),
                Err(_) => {
                    log::debug!("Staging ring full, forcing a submit");
                    self.submit(None, None)?;
                    self.wait_for_next_finished()?;
                }
            }
        }
    }

    /// Counts a draw into the current command buffer. Submits when the threshold is reached and
    /// returns whether a submit happened.
    pub fn record_draw(&mut self) -> Result<bool, EngineError> {
        self.recorded_draws += 1;
        if self.recorded_draws >= self.submit_threshold {
            self.submit(None, None)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Lowers the submit threshold so the current command buffer goes out within a few draws.
    pub fn request_submit_soon(&mut self) {
        self.submit_threshold = self.submit_threshold.min(self.recorded_draws + 10);
    }

    /// Requests a submit on the next idle notification.
    pub fn request_submit_on_idle(&mut self) {
        self.submit_on_idle = true;
    }

    /// Called when the frontend goes idle. Submits if a submit on idle was requested.
    pub fn notify_idle(&mut self) -> Result<(), EngineError> {
        if self.submit_on_idle {
            self.submit(None, None)?;
        }
        Ok(())
    }

    /// Submits the current command buffer and starts recording the next one. Returns the id of
    /// the submitted submission.
    ///
    /// The submission signals its own ordering semaphore plus `signal_extra` and waits on the
    /// previous submission's semaphore plus `wait_extra`. Blocks only if every slot of the ring
    /// is in flight afterwards.
    pub fn submit(
        &mut self,
        signal_extra: Option<vk::Semaphore>,
        wait_extra: Option<vk::Semaphore>,
    ) -> Result<u64, EngineError> {
        let backend = self.device.get_backend().clone();

        let id = self.timeline.get_current();
        let slot = &mut self.slots[self.current_index];
        slot.submission_id = id;
        backend.end_command_buffer(slot.command_buffer)?;

        let mut signal_semaphores = Vec::with_capacity(2);
        signal_semaphores.push(slot.semaphore);
        if let Some(semaphore) = signal_extra {
            signal_semaphores.push(semaphore);
        }

        let mut wait_semaphores = Vec::with_capacity(2);
        if self.timeline.get_issued() > 0 {
            let previous = (self.current_index + self.slots.len() - 1) % self.slots.len();
            wait_semaphores.push(self.slots[previous].semaphore);
        }
        if let Some(semaphore) = wait_extra {
            wait_semaphores.push(semaphore);
        }

        let slot = &self.slots[self.current_index];
        backend.submit(&QueueSubmission {
            command_buffer: slot.command_buffer,
            wait_semaphores: &wait_semaphores,
            signal_semaphores: &signal_semaphores,
            fence: slot.fence,
        })?;
        self.timeline.issued.fetch_add(1, Ordering::AcqRel);

        self.recorded_draws = 0;
        self.submit_threshold = DEFAULT_SUBMIT_THRESHOLD;
        self.submit_on_idle = false;

        // Opportunistically retire whatever has finished by now.
        self.process_finished()?;

        let next = (self.current_index + 1) % self.slots.len();
        self.current_index = next;
        if self.current_index == self.sync_index {
            // Every slot is in flight, the oldest one must retire before we can reuse it.
            self.wait_for_next_finished()?;
        }
        self.begin_current_slot()?;
        Ok(id)
    }

    /// Polls in flight slots oldest first and retires every one whose fence has signaled.
    ///
    /// Stops at the first unsignaled fence so retirement stays FIFO even when fences signal out
    /// of order.
    pub fn process_finished(&mut self) -> Result<(), EngineError> {
        let backend = self.device.get_backend().clone();

        while self.slot_in_flight(self.sync_index) {
            let slot = &self.slots[self.sync_index];
            if !backend.fence_status(slot.fence)? {
                break;
            }
            self.retire_slot(backend.as_ref());
        }

        self.destruction.process_pending(self.timeline.get_retired(), backend.as_ref());
        Ok(())
    }

    /// Blocks until the oldest in flight submission retires. No-op if nothing is in flight.
    pub fn wait_for_next_finished(&mut self) -> Result<(), EngineError> {
        if !self.slot_in_flight(self.sync_index) {
            return Ok(());
        }
        let backend = self.device.get_backend().clone();
        backend.wait_fence(self.slots[self.sync_index].fence)?;
        self.retire_slot(backend.as_ref());

        // The wait may have given more fences time to signal.
        self.process_finished()
    }

    /// Whether the slot's submission has been issued but not yet retired.
    ///
    /// `sync_index == current_index` holds both for an empty ring and for a fully saturated one,
    /// so index comparisons cannot tell the two apart. The recording slot always carries the
    /// next, not yet issued, submission id and is therefore never reported as in flight.
    fn slot_in_flight(&self, index: usize) -> bool {
        let id = self.slots[index].submission_id;
        id <= self.timeline.get_issued() && id > self.timeline.get_retired()
    }

    pub fn has_submission_finished(&self, id: u64) -> bool {
        self.timeline.get_retired() >= id
    }

    /// Blocks until submission `id` has retired.
    ///
    /// If `id` is the submission currently being recorded it is submitted first, otherwise the
    /// wait could never complete.
    pub fn wait_submission_finished(&mut self, id: u64) -> Result<(), EngineError> {
        if id == self.current_submission_id() {
            self.submit(None, None)?;
        } else if id > self.timeline.get_issued() {
            log::error!("Waiting for submission {} which has not been recorded yet", id);
            panic!()
        }
        while self.timeline.get_retired() < id {
            self.wait_for_next_finished()?;
        }
        Ok(())
    }

    /// Submits outstanding work and blocks until the device is idle and everything has retired.
    pub fn flush(&mut self) -> Result<(), EngineError> {
        self.submit(None, None)?;
        let backend = self.device.get_backend().clone();
        backend.wait_idle()?;
        while self.slot_in_flight(self.sync_index) {
            self.wait_for_next_finished()?;
        }
        Ok(())
    }

    fn retire_slot(&mut self, backend: &dyn GpuBackend) {
        let id = self.slots[self.sync_index].submission_id;
        self.destruction.flush_retired(id, backend);
        self.staging.reclaim(id);
        self.timeline.retired.store(id, Ordering::Release);
        self.sync_index = (self.sync_index + 1) % self.slots.len();
    }

    fn begin_current_slot(&mut self) -> Result<(), vk::Result> {
        let backend = self.device.get_backend();
        let slot = &mut self.slots[self.current_index];
        backend.reset_fence(slot.fence)?;
        backend.reset_command_buffer(slot.command_buffer)?;
        backend.begin_command_buffer(slot.command_buffer)?;
        slot.submission_id = self.timeline.get_current();
        Ok(())
    }
}

impl Drop for SubmissionSequencer {
    fn drop(&mut self) {
        if self.in_flight_count() > 0 {
            log::warn!("SubmissionSequencer dropped with submissions still in flight");
        }
        let backend = self.device.get_backend();
        for slot in self.slots.iter() {
            backend.destroy_fence(slot.fence);
            backend.destroy_semaphore(slot.semaphore);
            backend.free_command_buffer(slot.command_buffer);
        }
    }
}

assert_impl_all!(SubmissionSequencer: Send);

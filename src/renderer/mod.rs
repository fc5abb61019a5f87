//! The submission engine.
//!
//! [`SubmissionEngine`] ties the pieces of the renderer together: the command buffer ring and
//! submission ordering in [`sequencer`], deferred destruction in [`destruction`], transient
//! staging memory in [`ring_alloc`], derived object caches in [`cache`] and background pipeline
//! cache saving in [`persist`].

pub mod cache;
pub mod destruction;
pub mod persist;
pub mod ring_alloc;
pub mod sequencer;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use ash::vk;
use parking_lot::RwLockReadGuard;

use crate::objects::{Destructible, ObjectId, ObjectKind};
use crate::prelude::*;

use cache::{ContentCache, Removed};
use destruction::DestructionQueue;
use persist::{PersistConfig, PipelineCachePersistence};
use ring_alloc::Allocation;
use sequencer::{SubmissionSequencer, Timeline};

/// Runtime error of the submission engine.
///
/// Device loss and surface errors surface as their native result codes. Outdated or suboptimal
/// surfaces are split out because they are recoverable by recreating the swapchain.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum EngineError {
    Vulkan(vk::Result),
    SurfaceOutdated,
    /// A staging allocation exceeded the ring capacity and can never succeed.
    StagingExhausted {
        requested: u64,
    },
}

impl From<vk::Result> for EngineError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::SUBOPTIMAL_KHR => EngineError::SurfaceOutdated,
            result => EngineError::Vulkan(result),
        }
    }
}

/// Failure to set up the engine. Always fatal, the caller must not retry.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum EngineCreateError {
    Vulkan(vk::Result),
}

impl From<vk::Result> for EngineCreateError {
    fn from(result: vk::Result) -> Self {
        EngineCreateError::Vulkan(result)
    }
}

pub struct EngineConfig {
    /// Number of command buffer slots in the submission ring.
    pub slot_count: usize,
    /// Size of the transient staging ring in bytes.
    pub staging_size: u64,
    /// Pipeline cache persistence. [`None`] disables saving entirely.
    pub persistence: Option<PersistConfig>,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self {
            slot_count: 128,
            staging_size: 32 * 1024 * 1024,
            persistence: None,
        }
    }

    pub fn with_persistence(mut self, directory: PathBuf, title_id: u64) -> Self {
        self.persistence = Some(PersistConfig::new(directory, title_id));
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Central synchronization context of the renderer.
///
/// All command buffer recording goes through the engine's sequencer lock. The caches, the
/// destruction queue and the timeline are internally synchronized and may be used from any
/// thread.
pub struct SubmissionEngine {
    device: Arc<DeviceContext>,
    timeline: Arc<Timeline>,
    destruction: Arc<DestructionQueue>,
    sequencer: Mutex<SubmissionSequencer>,

    render_pass_cache: ContentCache<Arc<Destructible>>,
    framebuffer_cache: ContentCache<Arc<Destructible>>,
    pipeline_cache: ContentCache<Arc<Destructible>>,
    descriptor_set_cache: ContentCache<Arc<Destructible>>,

    persistence: Option<PipelineCachePersistence>,
}

impl SubmissionEngine {
    pub fn new(device: Arc<DeviceContext>, config: EngineConfig) -> Result<Self, EngineCreateError> {
        let timeline = Timeline::new();
        let destruction = Arc::new(DestructionQueue::new(config.slot_count));
        let sequencer = SubmissionSequencer::new(
            device.clone(),
            timeline.clone(),
            destruction.clone(),
            config.slot_count,
            config.staging_size,
        )?;
        let persistence = config.persistence
            .map(|persist_config| PipelineCachePersistence::new(device.clone(), persist_config));

        Ok(Self {
            device,
            timeline,
            destruction,
            sequencer: Mutex::new(sequencer),
            render_pass_cache: ContentCache::new(),
            framebuffer_cache: ContentCache::new(),
            pipeline_cache: ContentCache::new(),
            descriptor_set_cache: ContentCache::new(),
            persistence,
        })
    }

    pub fn get_device(&self) -> &Arc<DeviceContext> {
        &self.device
    }

    pub fn get_timeline(&self) -> &Arc<Timeline> {
        &self.timeline
    }

    /// The id of the submission currently being recorded.
    pub fn current_submission_id(&self) -> u64 {
        self.timeline.get_current()
    }

    pub fn retired_submission_id(&self) -> u64 {
        self.timeline.get_retired()
    }

    pub fn get_render_pass_cache(&self) -> &ContentCache<Arc<Destructible>> {
        &self.render_pass_cache
    }

    pub fn get_framebuffer_cache(&self) -> &ContentCache<Arc<Destructible>> {
        &self.framebuffer_cache
    }

    pub fn get_pipeline_cache(&self) -> &ContentCache<Arc<Destructible>> {
        &self.pipeline_cache
    }

    pub fn get_descriptor_set_cache(&self) -> &ContentCache<Arc<Destructible>> {
        &self.descriptor_set_cache
    }

    pub fn current_command_buffer(&self) -> vk::CommandBuffer {
        self.lock_sequencer().current_command_buffer()
    }

    pub fn allocate_staging(&self, size: u64, alignment: u64) -> Result<Allocation, EngineError> {
        self.lock_sequencer().allocate_staging(size, alignment)
    }

    /// Counts a recorded draw, submitting once the draw threshold is hit. Returns whether a
    /// submit happened.
    pub fn record_draw(&self) -> Result<bool, EngineError> {
        self.lock_sequencer().record_draw()
    }

    pub fn request_submit_soon(&self) {
        self.lock_sequencer().request_submit_soon()
    }

    pub fn request_submit_on_idle(&self) {
        self.lock_sequencer().request_submit_on_idle()
    }

    pub fn notify_idle(&self) -> Result<(), EngineError> {
        self.lock_sequencer().notify_idle()
    }

    /// Submits the current command buffer, returning the submitted submission's id.
    pub fn submit(
        &self,
        signal_extra: Option<vk::Semaphore>,
        wait_extra: Option<vk::Semaphore>,
    ) -> Result<u64, EngineError> {
        self.lock_sequencer().submit(signal_extra, wait_extra)
    }

    pub fn process_finished(&self) -> Result<(), EngineError> {
        self.lock_sequencer().process_finished()
    }

    pub fn has_submission_finished(&self, id: u64) -> bool {
        self.timeline.get_retired() >= id
    }

    pub fn wait_submission_finished(&self, id: u64) -> Result<(), EngineError> {
        self.lock_sequencer().wait_submission_finished(id)
    }

    /// Submits outstanding work. With `wait_idle` also blocks until the device is idle and every
    /// submission has retired.
    pub fn flush(&self, wait_idle: bool) -> Result<(), EngineError> {
        let mut sequencer = self.lock_sequencer();
        if wait_idle {
            sequencer.flush()
        } else {
            sequencer.submit(None, None).map(|_| ())
        }
    }

    /// Queues a raw resource for destruction once the submission currently being recorded has
    /// retired. Conservative but always safe for resources used by the current command buffer.
    pub fn queue_destruction(&self, kind: ObjectKind) {
        self.destruction.queue_for_submission(self.timeline.get_current(), kind);
    }

    pub fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.queue_destruction(ObjectKind::Buffer(buffer));
    }

    pub fn destroy_memory(&self, memory: vk::DeviceMemory) {
        self.queue_destruction(ObjectKind::Memory(memory));
    }

    pub fn destroy_image_view(&self, view: vk::ImageView) {
        self.queue_destruction(ObjectKind::ImageView(view));
    }

    pub fn destroy_host_object(&self, object: Box<dyn std::any::Any + Send>) {
        self.queue_destruction(ObjectKind::Host(object));
    }

    /// Hands `object` over for destruction and evicts every cache entry built from it.
    ///
    /// Destruction happens once all remaining references are gone and the last submission using
    /// the object has retired.
    pub fn destroy_object(&self, object: Arc<Destructible>) {
        self.detach_object(object.get_id());
        let backend = self.device.get_backend();
        self.destruction.dispose_object(object, self.timeline.get_retired(), backend.as_ref());
    }

    /// Drops one counted reference to `object`, destroying it if it became destroyable.
    pub fn release_object(&self, object: Arc<Destructible>) {
        let backend = self.device.get_backend();
        self.destruction.release_object(object, self.timeline.get_retired(), backend.as_ref());
    }

    /// Evicts all cache entries depending on `object` from every cache.
    pub fn detach_object(&self, object: ObjectId) {
        for cache in self.all_caches() {
            let removed = cache.detach_object(object);
            self.dispose_removed(removed);
        }
    }

    /// Must be held while creating pipelines against the native pipeline cache.
    pub fn pipeline_creation_guard(&self) -> Option<RwLockReadGuard<()>> {
        self.persistence.as_ref().map(|persistence| persistence.creation_guard())
    }

    /// Called after a pipeline has been compiled so the save thread persists the updated cache.
    pub fn notify_pipeline_compiled(&self) {
        if let Some(persistence) = &self.persistence {
            persistence.notify_pipeline_compiled();
        }
    }

    /// Orderly teardown. Submits and waits out all pending work, then destroys every cached and
    /// queued object. The engine must not be used afterwards.
    pub fn shutdown(&mut self) -> Result<(), EngineError> {
        // Stop the save thread first, it performs a final save of pending data.
        self.persistence = None;

        self.lock_sequencer().flush()?;

        for cache in self.all_caches() {
            let removed = cache.clear();
            self.dispose_removed(removed);
        }

        let backend = self.device.get_backend();
        self.destruction.process_pending(self.timeline.get_retired(), backend.as_ref());
        self.destruction.drain_all(backend.as_ref());
        Ok(())
    }

    fn all_caches(&self) -> [&ContentCache<Arc<Destructible>>; 4] {
        [
            &self.render_pass_cache,
            &self.framebuffer_cache,
            &self.pipeline_cache,
            &self.descriptor_set_cache,
        ]
    }

    fn dispose_removed(&self, removed: Vec<Removed<Arc<Destructible>>>) {
        let backend = self.device.get_backend();
        let retired = self.timeline.get_retired();
        for entry in removed {
            for dep in entry.deps {
                self.destruction.release_object(dep, retired, backend.as_ref());
            }
            self.destruction.dispose_object(entry.value, retired, backend.as_ref());
        }
    }

    fn lock_sequencer(&self) -> MutexGuard<SubmissionSequencer> {
        match self.sequencer.lock() {
            Ok(guard) => guard,
            Err(_) => {
                log::error!("Poisoned sequencer mutex");
                panic!()
            }
        }
    }
}

assert_impl_all!(SubmissionEngine: Send, Sync);

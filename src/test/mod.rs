//! Shared test utilities.
//!
//! [`MockBackend`] implements [`GpuBackend`] without a native device. Handles are fabricated
//! from a counter, submissions are logged instead of executed and fence completion is under test
//! control. [`GpuBackend::wait_fence`] signals the fence it waits on, modelling a GPU that
//! finishes work whenever the host blocks on it.

use std::collections::HashSet;
use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;

use crate::device::backend::{GpuBackend, QueueSubmission, RingBufferBacking};
use crate::prelude::*;
use crate::renderer::{EngineConfig, SubmissionEngine};

/// A logged queue submission.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MockSubmission {
    pub command_buffer: vk::CommandBuffer,
    pub waits: Vec<vk::Semaphore>,
    pub signals: Vec<vk::Semaphore>,
    pub fence: vk::Fence,
}

struct RingMemory {
    // Keeps the mapped allocation alive. The box never moves its heap data.
    #[allow(unused)]
    data: Box<[u8]>,
    buffer: vk::Buffer,
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    signaled_fences: HashSet<u64>,
    submissions: Vec<MockSubmission>,
    waited_fences: Vec<vk::Fence>,
    wait_idle_count: usize,

    destroyed_buffers: Vec<vk::Buffer>,
    destroyed_memory: Vec<vk::DeviceMemory>,
    destroyed_images: Vec<vk::Image>,
    destroyed_image_views: Vec<vk::ImageView>,
    destroyed_pipelines: Vec<vk::Pipeline>,
    freed_descriptor_sets: Vec<vk::DescriptorSet>,
    destroyed_framebuffers: Vec<vk::Framebuffer>,
    destroyed_render_passes: Vec<vk::RenderPass>,

    ring_memory: Vec<RingMemory>,
    pipeline_cache_data: Vec<u8>,
}

pub struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                next_handle: 1,
                ..Default::default()
            }),
        })
    }

    fn next_handle(&self) -> u64 {
        let mut state = self.state.lock();
        let handle = state.next_handle;
        state.next_handle += 1;
        handle
    }

    pub fn submissions(&self) -> Vec<MockSubmission> {
        self.state.lock().submissions.clone()
    }

    /// Signals the fence of the `index`th logged submission.
    pub fn complete_submission(&self, index: usize) {
        let mut state = self.state.lock();
        let fence = state.submissions[index].fence;
        state.signaled_fences.insert(fence.as_raw());
    }

    pub fn waited_fences(&self) -> Vec<vk::Fence> {
        self.state.lock().waited_fences.clone()
    }

    pub fn wait_idle_count(&self) -> usize {
        self.state.lock().wait_idle_count
    }

    pub fn destroyed_buffers(&self) -> Vec<vk::Buffer> {
        self.state.lock().destroyed_buffers.clone()
    }

    pub fn destroyed_memory(&self) -> Vec<vk::DeviceMemory> {
        self.state.lock().destroyed_memory.clone()
    }

    pub fn destroyed_images(&self) -> Vec<vk::Image> {
        self.state.lock().destroyed_images.clone()
    }

    pub fn destroyed_image_views(&self) -> Vec<vk::ImageView> {
        self.state.lock().destroyed_image_views.clone()
    }

    pub fn destroyed_pipelines(&self) -> Vec<vk::Pipeline> {
        self.state.lock().destroyed_pipelines.clone()
    }

    pub fn freed_descriptor_sets(&self) -> Vec<vk::DescriptorSet> {
        self.state.lock().freed_descriptor_sets.clone()
    }

    pub fn destroyed_framebuffers(&self) -> Vec<vk::Framebuffer> {
        self.state.lock().destroyed_framebuffers.clone()
    }

    pub fn destroyed_render_passes(&self) -> Vec<vk::RenderPass> {
        self.state.lock().destroyed_render_passes.clone()
    }

    pub fn set_pipeline_cache_data(&self, data: Vec<u8>) {
        self.state.lock().pipeline_cache_data = data;
    }
}

impl GpuBackend for MockBackend {
    fn create_fence(&self) -> Result<vk::Fence, vk::Result> {
        Ok(vk::Fence::from_raw(self.next_handle()))
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore, vk::Result> {
        Ok(vk::Semaphore::from_raw(self.next_handle()))
    }

    fn allocate_command_buffer(&self) -> Result<vk::CommandBuffer, vk::Result> {
        Ok(vk::CommandBuffer::from_raw(self.next_handle()))
    }

    fn begin_command_buffer(&self, _cmd: vk::CommandBuffer) -> Result<(), vk::Result> {
        Ok(())
    }

    fn end_command_buffer(&self, _cmd: vk::CommandBuffer) -> Result<(), vk::Result> {
        Ok(())
    }

    fn reset_command_buffer(&self, _cmd: vk::CommandBuffer) -> Result<(), vk::Result> {
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<(), vk::Result> {
        self.state.lock().signaled_fences.remove(&fence.as_raw());
        Ok(())
    }

    fn fence_status(&self, fence: vk::Fence) -> Result<bool, vk::Result> {
        Ok(self.state.lock().signaled_fences.contains(&fence.as_raw()))
    }

    fn wait_fence(&self, fence: vk::Fence) -> Result<(), vk::Result> {
        let mut state = self.state.lock();
        state.waited_fences.push(fence);
        state.signaled_fences.insert(fence.as_raw());
        Ok(())
    }

    fn submit(&self, submission: &QueueSubmission) -> Result<(), vk::Result> {
        self.state.lock().submissions.push(MockSubmission {
            command_buffer: submission.command_buffer,
            waits: submission.wait_semaphores.to_vec(),
            signals: submission.signal_semaphores.to_vec(),
            fence: submission.fence,
        });
        Ok(())
    }

    fn wait_idle(&self) -> Result<(), vk::Result> {
        self.state.lock().wait_idle_count += 1;
        Ok(())
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.state.lock().signaled_fences.remove(&fence.as_raw());
    }

    fn destroy_semaphore(&self, _semaphore: vk::Semaphore) {
    }

    fn free_command_buffer(&self, _cmd: vk::CommandBuffer) {
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.state.lock().destroyed_buffers.push(buffer);
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        self.state.lock().destroyed_memory.push(memory);
    }

    fn destroy_image(&self, image: vk::Image) {
        self.state.lock().destroyed_images.push(image);
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state.lock().destroyed_image_views.push(view);
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.state.lock().destroyed_pipelines.push(pipeline);
    }

    fn free_descriptor_set(&self, set: vk::DescriptorSet) {
        self.state.lock().freed_descriptor_sets.push(set);
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.state.lock().destroyed_framebuffers.push(framebuffer);
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.state.lock().destroyed_render_passes.push(render_pass);
    }

    fn create_ring_buffer(&self, size: u64) -> Result<RingBufferBacking, vk::Result> {
        let buffer = vk::Buffer::from_raw(self.next_handle());
        let memory = vk::DeviceMemory::from_raw(self.next_handle());
        let mut data = vec![0u8; size as usize].into_boxed_slice();
        let mapped = NonNull::new(data.as_mut_ptr()).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        self.state.lock().ring_memory.push(RingMemory {
            data,
            buffer,
        });
        Ok(RingBufferBacking {
            buffer,
            memory,
            mapped,
            size,
        })
    }

    fn destroy_ring_buffer(&self, backing: &RingBufferBacking) {
        self.state.lock().ring_memory.retain(|memory| memory.buffer != backing.buffer);
    }

    fn pipeline_cache_data(&self) -> Result<Vec<u8>, vk::Result> {
        Ok(self.state.lock().pipeline_cache_data.clone())
    }
}

pub fn create_mock_device() -> (Arc<DeviceContext>, Arc<MockBackend>) {
    let backend = MockBackend::new();
    let device = DeviceContext::new(backend.clone());
    (device, backend)
}

pub fn create_test_engine(slot_count: usize, staging_size: u64) -> (SubmissionEngine, Arc<MockBackend>) {
    crate::init_test_env();
    let (device, backend) = create_mock_device();
    let config = EngineConfig {
        slot_count,
        staging_size,
        persistence: None,
    };
    let engine = SubmissionEngine::new(device, config).unwrap();
    (engine, backend)
}

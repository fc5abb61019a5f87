//! The seam between the submission engine and the native device.
//!
//! Everything the engine does to the GPU goes through the [`GpuBackend`] trait. The production
//! implementation is [`crate::device::vulkan::VulkanBackend`]. Tests use a mock implementation
//! which fabricates handles and lets the test control fence completion.

use std::ptr::NonNull;

use ash::vk;

/// A single queue submission as handed to the native queue.
pub struct QueueSubmission<'a> {
    pub command_buffer: vk::CommandBuffer,
    pub wait_semaphores: &'a [vk::Semaphore],
    pub signal_semaphores: &'a [vk::Semaphore],
    pub fence: vk::Fence,
}

/// A fixed size host visible buffer backing a ring allocator.
pub struct RingBufferBacking {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub mapped: NonNull<u8>,
    pub size: u64,
}

// The mapped pointer is a host visible mapping which stays valid for the lifetime of the backing.
unsafe impl Send for RingBufferBacking {
}

unsafe impl Sync for RingBufferBacking {
}

/// Interface to the native device used by the submission engine.
///
/// All handles returned by the creation functions are owned by the implementation and must only
/// be destroyed through the matching destroy functions of the same implementation.
pub trait GpuBackend: Send + Sync {
    fn create_fence(&self) -> Result<vk::Fence, vk::Result>;
    fn create_semaphore(&self) -> Result<vk::Semaphore, vk::Result>;
    fn allocate_command_buffer(&self) -> Result<vk::CommandBuffer, vk::Result>;

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<(), vk::Result>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<(), vk::Result>;
    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<(), vk::Result>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<(), vk::Result>;

    /// Non blocking fence poll. Returns true if the fence is signaled.
    fn fence_status(&self, fence: vk::Fence) -> Result<bool, vk::Result>;

    /// Blocks until the fence signals.
    fn wait_fence(&self, fence: vk::Fence) -> Result<(), vk::Result>;

    fn submit(&self, submission: &QueueSubmission) -> Result<(), vk::Result>;

    fn wait_idle(&self) -> Result<(), vk::Result>;

    fn destroy_fence(&self, fence: vk::Fence);
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn free_command_buffer(&self, cmd: vk::CommandBuffer);

    fn destroy_buffer(&self, buffer: vk::Buffer);
    fn free_memory(&self, memory: vk::DeviceMemory);
    fn destroy_image(&self, image: vk::Image);
    fn destroy_image_view(&self, view: vk::ImageView);
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);
    fn free_descriptor_set(&self, set: vk::DescriptorSet);
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);

    fn create_ring_buffer(&self, size: u64) -> Result<RingBufferBacking, vk::Result>;
    fn destroy_ring_buffer(&self, backing: &RingBufferBacking);

    /// Returns the serialized pipeline cache blob. The format is opaque, only the byte length is
    /// inspected by the engine.
    fn pipeline_cache_data(&self) -> Result<Vec<u8>, vk::Result>;
}

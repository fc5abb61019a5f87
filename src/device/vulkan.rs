//! Ash based implementation of the [`GpuBackend`] seam.
//!
//! The embedder creates the instance and logical device and hands the relevant function tables to
//! [`VulkanBackend::new`]. The backend owns the command pool and the driver pipeline cache, both
//! of which are destroyed when the backend is dropped.

use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};

use ash::vk;

use crate::device::backend::{GpuBackend, QueueSubmission, RingBufferBacking};

/// Function tables and static device properties supplied by the embedder.
pub struct DeviceFunctions {
    pub vk: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub queue_family: u32,
}

/// Wrapper around a queue handle serializing access.
pub struct Queue {
    functions: Arc<DeviceFunctions>,
    queue: Mutex<vk::Queue>,
    family: u32,
}

impl Queue {
    pub fn new(functions: Arc<DeviceFunctions>, queue: vk::Queue) -> Self {
        let family = functions.queue_family;
        Self {
            functions,
            queue: Mutex::new(queue),
            family,
        }
    }

    pub unsafe fn submit(&self, submits: &[vk::SubmitInfo], fence: Option<vk::Fence>) -> Result<(), vk::Result> {
        let fence = fence.unwrap_or(vk::Fence::null());

        let queue = self.lock_queue();
        self.functions.vk.queue_submit(*queue, submits, fence)
    }

    pub unsafe fn wait_idle(&self) -> Result<(), vk::Result> {
        let queue = self.lock_queue();
        self.functions.vk.queue_wait_idle(*queue)
    }

    pub fn lock_queue(&self) -> MutexGuard<vk::Queue> {
        self.queue.lock().unwrap_or_else(|_| {
            log::error!("Poisoned queue mutex");
            panic!()
        })
    }

    pub fn get_queue_family_index(&self) -> u32 {
        self.family
    }
}

pub struct VulkanBackend {
    functions: Arc<DeviceFunctions>,
    queue: Queue,
    command_pool: Mutex<vk::CommandPool>,
    descriptor_pool: Option<vk::DescriptorPool>,
    pipeline_cache: vk::PipelineCache,
}

impl VulkanBackend {
    /// Creates the backend owning a command pool and the driver pipeline cache.
    ///
    /// `initial_cache_data` is the pipeline cache blob loaded from disk, if any. If the driver
    /// rejects the blob an empty cache is created instead.
    pub fn new(
        functions: Arc<DeviceFunctions>,
        queue: vk::Queue,
        initial_cache_data: &[u8],
        descriptor_pool: Option<vk::DescriptorPool>,
    ) -> Result<Arc<Self>, vk::Result> {
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(functions.queue_family);

        let command_pool = unsafe {
            functions.vk.create_command_pool(&info, None)
        }?;

        let info = vk::PipelineCacheCreateInfo::builder()
            .initial_data(initial_cache_data);

        let pipeline_cache = match unsafe {
            functions.vk.create_pipeline_cache(&info, None)
        } {
            Ok(cache) => cache,
            Err(err) => {
                // The existing blob may be from a different driver version. Retry empty.
                log::warn!("Failed to open pipeline cache with initial data: {:?}", err);
                let info = vk::PipelineCacheCreateInfo::builder();
                match unsafe { functions.vk.create_pipeline_cache(&info, None) } {
                    Ok(cache) => cache,
                    Err(err) => {
                        unsafe { functions.vk.destroy_command_pool(command_pool, None) };
                        return Err(err);
                    }
                }
            }
        };

        let queue = Queue::new(functions.clone(), queue);

        Ok(Arc::new(Self {
            functions,
            queue,
            command_pool: Mutex::new(command_pool),
            descriptor_pool,
            pipeline_cache,
        }))
    }

    pub fn get_functions(&self) -> &Arc<DeviceFunctions> {
        &self.functions
    }

    pub fn get_queue(&self) -> &Queue {
        &self.queue
    }

    fn lock_command_pool(&self) -> MutexGuard<vk::CommandPool> {
        self.command_pool.lock().unwrap_or_else(|_| {
            log::error!("Poisoned command pool mutex");
            panic!()
        })
    }

    fn find_memory_type(&self, type_bits: u32, flags: vk::MemoryPropertyFlags) -> Option<u32> {
        let props = &self.functions.memory_properties;
        (0..props.memory_type_count).find(|i| {
            (type_bits & (1u32 << i)) != 0 && props.memory_types[*i as usize].property_flags.contains(flags)
        })
    }
}

impl GpuBackend for VulkanBackend {
    fn create_fence(&self) -> Result<vk::Fence, vk::Result> {
        let info = vk::FenceCreateInfo::builder();
        unsafe {
            self.functions.vk.create_fence(&info, None)
        }
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore, vk::Result> {
        let info = vk::SemaphoreCreateInfo::builder();
        unsafe {
            self.functions.vk.create_semaphore(&info, None)
        }
    }

    fn allocate_command_buffer(&self) -> Result<vk::CommandBuffer, vk::Result> {
        let pool = self.lock_command_pool();
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let mut buffers = unsafe {
            self.functions.vk.allocate_command_buffers(&info)
        }?;
        Ok(buffers.pop().unwrap())
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<(), vk::Result> {
        let info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.functions.vk.begin_command_buffer(cmd, &info)
        }
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<(), vk::Result> {
        unsafe {
            self.functions.vk.end_command_buffer(cmd)
        }
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<(), vk::Result> {
        unsafe {
            self.functions.vk.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<(), vk::Result> {
        unsafe {
            self.functions.vk.reset_fences(std::slice::from_ref(&fence))
        }
    }

    fn fence_status(&self, fence: vk::Fence) -> Result<bool, vk::Result> {
        unsafe {
            self.functions.vk.get_fence_status(fence)
        }
    }

    fn wait_fence(&self, fence: vk::Fence) -> Result<(), vk::Result> {
        unsafe {
            self.functions.vk.wait_for_fences(std::slice::from_ref(&fence), true, u64::MAX)
        }
    }

    fn submit(&self, submission: &QueueSubmission) -> Result<(), vk::Result> {
        let wait_stages: Box<[_]> = submission.wait_semaphores.iter()
            .map(|_| vk::PipelineStageFlags::ALL_COMMANDS)
            .collect();

        let info = vk::SubmitInfo::builder()
            .wait_semaphores(submission.wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(std::slice::from_ref(&submission.command_buffer))
            .signal_semaphores(submission.signal_semaphores);

        unsafe {
            self.queue.submit(std::slice::from_ref(&info), Some(submission.fence))
        }
    }

    fn wait_idle(&self) -> Result<(), vk::Result> {
        unsafe {
            self.queue.wait_idle()
        }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe {
            self.functions.vk.destroy_fence(fence, None)
        }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe {
            self.functions.vk.destroy_semaphore(semaphore, None)
        }
    }

    fn free_command_buffer(&self, cmd: vk::CommandBuffer) {
        let pool = self.lock_command_pool();
        unsafe {
            self.functions.vk.free_command_buffers(*pool, std::slice::from_ref(&cmd))
        }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe {
            self.functions.vk.destroy_buffer(buffer, None)
        }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe {
            self.functions.vk.free_memory(memory, None)
        }
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe {
            self.functions.vk.destroy_image(image, None)
        }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe {
            self.functions.vk.destroy_image_view(view, None)
        }
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe {
            self.functions.vk.destroy_pipeline(pipeline, None)
        }
    }

    fn free_descriptor_set(&self, set: vk::DescriptorSet) {
        if let Some(pool) = self.descriptor_pool {
            let result = unsafe {
                self.functions.vk.free_descriptor_sets(pool, std::slice::from_ref(&set))
            };
            if let Err(err) = result {
                log::warn!("vkFreeDescriptorSets returned {:?}", err);
            }
        } else {
            log::warn!("Dropping descriptor set without a descriptor pool");
        }
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe {
            self.functions.vk.destroy_framebuffer(framebuffer, None)
        }
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe {
            self.functions.vk.destroy_render_pass(render_pass, None)
        }
    }

    fn create_ring_buffer(&self, size: u64) -> Result<RingBufferBacking, vk::Result> {
        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::UNIFORM_BUFFER
                | vk::BufferUsageFlags::INDEX_BUFFER
                | vk::BufferUsageFlags::VERTEX_BUFFER)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            self.functions.vk.create_buffer(&info, None)
        }?;

        let requirements = unsafe {
            self.functions.vk.get_buffer_memory_requirements(buffer)
        };

        let memory_type = self.find_memory_type(
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ).ok_or(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)?;

        let info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);

        let memory = match unsafe { self.functions.vk.allocate_memory(&info, None) } {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { self.functions.vk.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };

        let mapped = unsafe {
            self.functions.vk.bind_buffer_memory(buffer, memory, 0)
                .and_then(|_| self.functions.vk.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()))
        };

        let err = match mapped {
            Ok(ptr) => {
                match NonNull::new(ptr as *mut u8) {
                    Some(mapped) => {
                        return Ok(RingBufferBacking {
                            buffer,
                            memory,
                            mapped,
                            size,
                        });
                    }
                    None => {
                        log::error!("vkMapMemory returned a null pointer");
                        vk::Result::ERROR_MEMORY_MAP_FAILED
                    }
                }
            }
            Err(err) => err,
        };

        unsafe {
            self.functions.vk.destroy_buffer(buffer, None);
            self.functions.vk.free_memory(memory, None);
        }
        Err(err)
    }

    fn destroy_ring_buffer(&self, backing: &RingBufferBacking) {
        unsafe {
            self.functions.vk.unmap_memory(backing.memory);
            self.functions.vk.destroy_buffer(backing.buffer, None);
            self.functions.vk.free_memory(backing.memory, None);
        }
    }

    fn pipeline_cache_data(&self) -> Result<Vec<u8>, vk::Result> {
        unsafe {
            self.functions.vk.get_pipeline_cache_data(self.pipeline_cache)
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        let pool = *self.lock_command_pool();
        unsafe {
            self.functions.vk.destroy_pipeline_cache(self.pipeline_cache, None);
            self.functions.vk.destroy_command_pool(pool, None);
        }
    }
}

//! Native device calls used by the resource pools.
//!
//! The pools talk to the driver only through [`DeviceApi`], so the same pool
//! logic runs against [`VulkanDevice`] in the engine and against a recording
//! mock in tests.

use crate::error::Result;
use crate::host_alloc::HostCallbacks;
use crate::memory::{GpuAllocator, MappedBuffer};
use ash::prelude::VkResult;
use ash::vk;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::sync::Arc;

/// One queue submission.
#[derive(Clone, Copy, Default)]
pub struct SubmitBatch<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
}

/// Native calls the resource pools depend on.
///
/// Methods mirror the Vulkan entry points one to one and return the native
/// result code untouched.
pub trait DeviceApi: Send + Sync {
    /// Hardware limits of the physical device.
    fn limits(&self) -> &vk::PhysicalDeviceLimits;

    /// # Safety
    /// The family and index must have been requested at device creation.
    unsafe fn get_queue(&self, family: u32, index: u32) -> vk::Queue;

    /// # Safety
    /// The device must be valid.
    unsafe fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;

    /// # Safety
    /// The fence must not be in use.
    unsafe fn destroy_fence(&self, fence: vk::Fence);

    /// `Ok(true)` when signaled, `Ok(false)` when still pending.
    ///
    /// # Safety
    /// The fence must be valid.
    unsafe fn fence_signaled(&self, fence: vk::Fence) -> VkResult<bool>;

    /// # Safety
    /// The fence must be valid.
    unsafe fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()>;

    /// # Safety
    /// The fence must not be referenced by a pending submission.
    unsafe fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;

    /// # Safety
    /// The family must exist.
    unsafe fn create_command_pool(&self, family: u32) -> VkResult<vk::CommandPool>;

    /// # Safety
    /// No command buffer of the pool may be pending.
    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool);

    /// # Safety
    /// No command buffer of the pool may be pending.
    unsafe fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()>;

    /// Allocate one primary command buffer.
    ///
    /// # Safety
    /// The pool must be valid and externally synchronized.
    unsafe fn allocate_command_buffer(&self, pool: vk::CommandPool)
        -> VkResult<vk::CommandBuffer>;

    /// # Safety
    /// The command buffer must be in the initial state.
    unsafe fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()>;

    /// # Safety
    /// The command buffer must be recording.
    unsafe fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;

    /// # Safety
    /// The queue must be externally synchronized and the fence unsignaled.
    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        batch: &SubmitBatch<'_>,
        fence: vk::Fence,
    ) -> VkResult<()>;

    /// # Safety
    /// The pool and layout must be valid.
    unsafe fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet>;

    /// Apply every write in one batched call.
    ///
    /// # Safety
    /// Every referenced set and resource must be valid.
    unsafe fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]);

    /// Create a persistently mapped buffer in host-visible memory.
    fn create_mapped_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        prefer_coherent: bool,
        name: &str,
    ) -> Result<MappedBuffer>;

    /// # Safety
    /// The buffer must not be in use by the GPU.
    unsafe fn destroy_mapped_buffer(&self, buffer: MappedBuffer) -> Result<()>;

    /// Make host writes in `offset..offset + size` visible to the device.
    ///
    /// # Safety
    /// The buffer must have been created by this device.
    unsafe fn flush_mapped_range(&self, buffer: &MappedBuffer, offset: u64, size: u64)
        -> VkResult<()>;

    /// Make device writes in `offset..offset + size` visible to the host.
    ///
    /// # Safety
    /// The buffer must have been created by this device.
    unsafe fn invalidate_mapped_range(
        &self,
        buffer: &MappedBuffer,
        offset: u64,
        size: u64,
    ) -> VkResult<()>;
}

/// [`DeviceApi`] over a real `ash` device and the `gpu-allocator` allocator.
pub struct VulkanDevice {
    device: Arc<ash::Device>,
    limits: vk::PhysicalDeviceLimits,
    allocator: Mutex<GpuAllocator>,
    host_callbacks: Option<Arc<HostCallbacks>>,
}

impl VulkanDevice {
    /// Wrap a created device.
    ///
    /// # Safety
    /// All handles must be valid and outlive the returned value.
    pub unsafe fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: Arc<ash::Device>,
        host_callbacks: Option<Arc<HostCallbacks>>,
    ) -> Result<Self> {
        let limits = instance.get_physical_device_properties(physical_device).limits;
        let allocator = GpuAllocator::new(
            instance,
            device.clone(),
            physical_device,
            host_callbacks.clone(),
        )?;

        Ok(Self {
            device,
            limits,
            allocator: Mutex::new(allocator),
            host_callbacks,
        })
    }

    /// The `ash` device.
    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    /// The memory allocator.
    pub fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    /// Allocation callbacks to pass to every create/destroy call.
    pub fn callbacks(&self) -> Option<&vk::AllocationCallbacks<'static>> {
        self.host_callbacks.as_deref().map(HostCallbacks::callbacks)
    }

    /// Widen `offset..offset + size` to atom boundaries within the allocation.
    fn atom_range(
        &self,
        buffer: &MappedBuffer,
        offset: u64,
        size: u64,
    ) -> Option<vk::MappedMemoryRange<'static>> {
        let (memory, base, allocation_size) = buffer.memory_range()?;
        let atom = self.limits.non_coherent_atom_size.max(1);

        let start = (base + offset) / atom * atom;
        let end = (base + offset + size).div_ceil(atom) * atom;
        let end = end.min(base + allocation_size);

        Some(
            vk::MappedMemoryRange::default()
                .memory(memory)
                .offset(start)
                .size(end - start),
        )
    }

    /// Tear down the allocator before the device goes away.
    pub fn shutdown(&self) {
        self.allocator.lock().shutdown();
    }
}

impl DeviceApi for VulkanDevice {
    fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.limits
    }

    unsafe fn get_queue(&self, family: u32, index: u32) -> vk::Queue {
        self.device.get_device_queue(family, index)
    }

    unsafe fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        self.device.create_fence(&create_info, self.callbacks())
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        self.device.destroy_fence(fence, self.callbacks());
    }

    unsafe fn fence_signaled(&self, fence: vk::Fence) -> VkResult<bool> {
        self.device.get_fence_status(fence)
    }

    unsafe fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        self.device.wait_for_fences(&[fence], true, timeout_ns)
    }

    unsafe fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        self.device.reset_fences(&[fence])
    }

    unsafe fn create_command_pool(&self, family: u32) -> VkResult<vk::CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        self.device.create_command_pool(&create_info, self.callbacks())
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.device.destroy_command_pool(pool, self.callbacks());
    }

    unsafe fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()> {
        self.device
            .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())
    }

    unsafe fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
    ) -> VkResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = self.device.allocate_command_buffers(&alloc_info)?;
        Ok(buffers[0])
    }

    unsafe fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        self.device.begin_command_buffer(command_buffer, &begin_info)
    }

    unsafe fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.device.end_command_buffer(command_buffer)
    }

    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        batch: &SubmitBatch<'_>,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(batch.command_buffers)
            .wait_semaphores(batch.wait_semaphores)
            .wait_dst_stage_mask(batch.wait_stages)
            .signal_semaphores(batch.signal_semaphores);
        self.device.queue_submit(queue, &[submit_info], fence)
    }

    unsafe fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = self.device.allocate_descriptor_sets(&alloc_info)?;
        Ok(sets[0])
    }

    unsafe fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        self.device.update_descriptor_sets(writes, &[]);
    }

    fn create_mapped_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        prefer_coherent: bool,
        name: &str,
    ) -> Result<MappedBuffer> {
        // CpuToGpu prefers coherent memory, GpuToCpu prefers cached memory,
        // which is where non-coherent heaps live.
        let location = if prefer_coherent {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuToCpu
        };
        self.allocator.lock().create_mapped_buffer(
            size,
            usage,
            location,
            self.limits.non_coherent_atom_size,
            name,
        )
    }

    unsafe fn destroy_mapped_buffer(&self, buffer: MappedBuffer) -> Result<()> {
        self.allocator.lock().free_mapped_buffer(buffer)
    }

    unsafe fn flush_mapped_range(
        &self,
        buffer: &MappedBuffer,
        offset: u64,
        size: u64,
    ) -> VkResult<()> {
        match self.atom_range(buffer, offset, size) {
            Some(range) => self.device.flush_mapped_memory_ranges(&[range]),
            None => Ok(()),
        }
    }

    unsafe fn invalidate_mapped_range(
        &self,
        buffer: &MappedBuffer,
        offset: u64,
        size: u64,
    ) -> VkResult<()> {
        match self.atom_range(buffer, offset, size) {
            Some(range) => self.device.invalidate_mapped_memory_ranges(&[range]),
            None => Ok(()),
        }
    }
}

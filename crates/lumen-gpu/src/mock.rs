//! Recording [`DeviceApi`] used by the unit tests.
//!
//! Handles are plain counters, fences are booleans and mapped buffers live in
//! host memory, so pool logic can be exercised without a GPU.

use crate::device::{DeviceApi, SubmitBatch};
use crate::error::{GpuError, Result};
use crate::memory::MappedBuffer;
use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ptr::NonNull;

/// Native call that can be made to fail with [`MockDevice::fail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    CreateFence,
    FenceStatus,
    WaitForFence,
    ResetFence,
    CreateCommandPool,
    ResetCommandPool,
    AllocateCommandBuffer,
    BeginCommandBuffer,
    EndCommandBuffer,
    Submit,
    AllocateDescriptorSet,
    CreateBuffer,
    Flush,
    Invalidate,
}

/// One descriptor write as seen by the device.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedWrite {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub buffer: Option<(vk::Buffer, u64, u64)>,
    pub image: Option<(vk::ImageView, vk::ImageLayout)>,
}

/// Counters and logs of every call made so far.
#[derive(Debug, Clone, Default)]
pub struct MockCalls {
    pub fences_created: usize,
    pub fences_destroyed: usize,
    pub fence_waits: usize,
    pub fence_resets: usize,
    pub command_pools_created: usize,
    pub command_pools_destroyed: usize,
    pub command_pool_resets: usize,
    pub command_buffers_begun: usize,
    pub command_buffers_ended: usize,
    pub begin_flags: Vec<vk::CommandBufferUsageFlags>,
    pub submits: usize,
    pub submitted_wait_semaphores: usize,
    pub submitted_signal_semaphores: usize,
    pub descriptor_allocations: usize,
    pub descriptor_update_calls: usize,
    pub descriptor_writes: Vec<RecordedWrite>,
    pub buffers_created: usize,
    pub buffers_destroyed: usize,
    pub flushes: Vec<(vk::Buffer, u64, u64)>,
    pub invalidations: Vec<(vk::Buffer, u64, u64)>,
}

struct HostMemory {
    ptr: usize,
    len: usize,
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    fences: HashMap<u64, bool>,
    failures: HashMap<MockOp, vk::Result>,
    one_shot: HashMap<MockOp, vk::Result>,
    memory: HashMap<u64, HostMemory>,
    calls: MockCalls,
}

impl MockState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn check(&mut self, op: MockOp) -> VkResult<()> {
        if let Some(e) = self.one_shot.remove(&op) {
            return Err(e);
        }
        self.failures.get(&op).map_or(Ok(()), |&e| Err(e))
    }
}

pub struct MockDevice {
    limits: vk::PhysicalDeviceLimits,
    coherent: bool,
    complete_on_submit: bool,
    descriptor_capacity: usize,
    state: Mutex<MockState>,
}

impl MockDevice {
    pub fn new() -> Self {
        let limits = vk::PhysicalDeviceLimits {
            min_uniform_buffer_offset_alignment: 256,
            max_uniform_buffer_range: 65_536,
            min_storage_buffer_offset_alignment: 64,
            max_storage_buffer_range: 1 << 27,
            min_texel_buffer_offset_alignment: 16,
            max_texel_buffer_elements: 1 << 16,
            optimal_buffer_copy_offset_alignment: 1,
            non_coherent_atom_size: 64,
            ..Default::default()
        };

        Self {
            limits,
            coherent: true,
            complete_on_submit: true,
            descriptor_capacity: usize::MAX,
            state: Mutex::new(MockState {
                next_handle: 0x1000,
                ..Default::default()
            }),
        }
    }

    pub fn with_limits(mut self, limits: vk::PhysicalDeviceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Whether mapped buffers report host-coherent memory.
    pub fn with_coherent_memory(mut self, coherent: bool) -> Self {
        self.coherent = coherent;
        self
    }

    /// Whether submissions signal their fence immediately.
    pub fn with_completion_on_submit(mut self, complete: bool) -> Self {
        self.complete_on_submit = complete;
        self
    }

    /// Maximum number of descriptor sets that can be allocated.
    pub fn with_descriptor_capacity(mut self, capacity: usize) -> Self {
        self.descriptor_capacity = capacity;
        self
    }

    pub fn calls(&self) -> MockCalls {
        self.state.lock().calls.clone()
    }

    /// Make every subsequent `op` fail with `result`.
    pub fn fail(&self, op: MockOp, result: vk::Result) {
        self.state.lock().failures.insert(op, result);
    }

    /// Make only the next `op` fail with `result`.
    pub fn fail_once(&self, op: MockOp, result: vk::Result) {
        self.state.lock().one_shot.insert(op, result);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failures.clear();
        state.one_shot.clear();
    }

    /// Create a fence outside of any pool.
    pub fn make_fence(&self, signaled: bool) -> vk::Fence {
        let mut state = self.state.lock();
        let raw = state.handle();
        state.fences.insert(raw, signaled);
        vk::Fence::from_raw(raw)
    }

    pub fn set_fence_signaled(&self, fence: vk::Fence, signaled: bool) {
        self.state.lock().fences.insert(fence.as_raw(), signaled);
    }

    pub fn is_fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state
            .lock()
            .fences
            .get(&fence.as_raw())
            .copied()
            .unwrap_or(false)
    }

    /// Copy bytes out of a live mapped buffer.
    pub fn read_buffer(&self, buffer: vk::Buffer, offset: u64, len: usize) -> Vec<u8> {
        let state = self.state.lock();
        let memory = &state.memory[&buffer.as_raw()];
        assert!(offset as usize + len <= memory.len, "read past the end of the buffer");
        // SAFETY: the range lies inside a live allocation owned by the mock.
        unsafe {
            std::slice::from_raw_parts((memory.ptr as *const u8).add(offset as usize), len)
                .to_vec()
        }
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().memory.len()
    }

    fn fence_state(state: &MockState, fence: vk::Fence) -> VkResult<bool> {
        state
            .fences
            .get(&fence.as_raw())
            .copied()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        for (_, memory) in self.state.get_mut().memory.drain() {
            // SAFETY: produced by Box::into_raw in create_mapped_buffer.
            unsafe { free_host_memory(&memory) };
        }
    }
}

unsafe fn free_host_memory(memory: &HostMemory) {
    let slice = std::ptr::slice_from_raw_parts_mut(memory.ptr as *mut u8, memory.len);
    drop(Box::from_raw(slice));
}

impl DeviceApi for MockDevice {
    fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.limits
    }

    unsafe fn get_queue(&self, family: u32, index: u32) -> vk::Queue {
        vk::Queue::from_raw(0x10_0000 + u64::from(family) * 0x100 + u64::from(index))
    }

    unsafe fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut state = self.state.lock();
        state.check(MockOp::CreateFence)?;
        let raw = state.handle();
        state.fences.insert(raw, signaled);
        state.calls.fences_created += 1;
        Ok(vk::Fence::from_raw(raw))
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        state.fences.remove(&fence.as_raw());
        state.calls.fences_destroyed += 1;
    }

    unsafe fn fence_signaled(&self, fence: vk::Fence) -> VkResult<bool> {
        let mut state = self.state.lock();
        state.check(MockOp::FenceStatus)?;
        Self::fence_state(&state, fence)
    }

    unsafe fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> VkResult<()> {
        let mut state = self.state.lock();
        state.check(MockOp::WaitForFence)?;
        state.calls.fence_waits += 1;
        // Nothing else can signal a mock fence, so a pending fence times out.
        if Self::fence_state(&state, fence)? {
            Ok(())
        } else {
            Err(vk::Result::TIMEOUT)
        }
    }

    unsafe fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        state.check(MockOp::ResetFence)?;
        Self::fence_state(&state, fence)?;
        state.fences.insert(fence.as_raw(), false);
        state.calls.fence_resets += 1;
        Ok(())
    }

    unsafe fn create_command_pool(&self, _family: u32) -> VkResult<vk::CommandPool> {
        let mut state = self.state.lock();
        state.check(MockOp::CreateCommandPool)?;
        state.calls.command_pools_created += 1;
        Ok(vk::CommandPool::from_raw(state.handle()))
    }

    unsafe fn destroy_command_pool(&self, _pool: vk::CommandPool) {
        self.state.lock().calls.command_pools_destroyed += 1;
    }

    unsafe fn reset_command_pool(&self, _pool: vk::CommandPool) -> VkResult<()> {
        let mut state = self.state.lock();
        state.check(MockOp::ResetCommandPool)?;
        state.calls.command_pool_resets += 1;
        Ok(())
    }

    unsafe fn allocate_command_buffer(
        &self,
        _pool: vk::CommandPool,
    ) -> VkResult<vk::CommandBuffer> {
        let mut state = self.state.lock();
        state.check(MockOp::AllocateCommandBuffer)?;
        Ok(vk::CommandBuffer::from_raw(state.handle()))
    }

    unsafe fn begin_command_buffer(
        &self,
        _command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        state.check(MockOp::BeginCommandBuffer)?;
        state.calls.command_buffers_begun += 1;
        state.calls.begin_flags.push(flags);
        Ok(())
    }

    unsafe fn end_command_buffer(&self, _command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        state.check(MockOp::EndCommandBuffer)?;
        state.calls.command_buffers_ended += 1;
        Ok(())
    }

    unsafe fn queue_submit(
        &self,
        _queue: vk::Queue,
        batch: &SubmitBatch<'_>,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        state.check(MockOp::Submit)?;
        if fence != vk::Fence::null() && Self::fence_state(&state, fence)? {
            // Submitting with a signaled fence is invalid usage.
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }

        state.calls.submits += 1;
        state.calls.submitted_wait_semaphores += batch.wait_semaphores.len();
        state.calls.submitted_signal_semaphores += batch.signal_semaphores.len();
        if fence != vk::Fence::null() {
            state.fences.insert(fence.as_raw(), self.complete_on_submit);
        }
        Ok(())
    }

    unsafe fn allocate_descriptor_set(
        &self,
        _pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let mut state = self.state.lock();
        state.check(MockOp::AllocateDescriptorSet)?;
        if state.calls.descriptor_allocations >= self.descriptor_capacity {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        state.calls.descriptor_allocations += 1;
        Ok(vk::DescriptorSet::from_raw(state.handle()))
    }

    unsafe fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        let mut state = self.state.lock();
        state.calls.descriptor_update_calls += 1;
        for write in writes {
            let buffer = (!write.p_buffer_info.is_null()).then(|| {
                let info = *write.p_buffer_info;
                (info.buffer, info.offset, info.range)
            });
            let image = (!write.p_image_info.is_null()).then(|| {
                let info = *write.p_image_info;
                (info.image_view, info.image_layout)
            });
            state.calls.descriptor_writes.push(RecordedWrite {
                set: write.dst_set,
                binding: write.dst_binding,
                descriptor_type: write.descriptor_type,
                buffer,
                image,
            });
        }
    }

    fn create_mapped_buffer(
        &self,
        size: u64,
        _usage: vk::BufferUsageFlags,
        prefer_coherent: bool,
        _name: &str,
    ) -> Result<MappedBuffer> {
        let mut state = self.state.lock();
        state.check(MockOp::CreateBuffer)?;

        let len = usize::try_from(size)
            .map_err(|_| GpuError::AllocationFailed(format!("{size} bytes")))?;
        let memory = Box::into_raw(vec![0u8; len].into_boxed_slice());
        let ptr = memory.cast::<u8>();
        let raw = state.handle();
        state.memory.insert(raw, HostMemory { ptr: ptr as usize, len });
        state.calls.buffers_created += 1;

        let mapped = NonNull::new(ptr).unwrap_or(NonNull::dangling());
        // SAFETY: the memory stays alive until destroy_mapped_buffer or drop.
        Ok(unsafe {
            MappedBuffer::from_raw_parts(
                vk::Buffer::from_raw(raw),
                size,
                self.coherent && prefer_coherent,
                mapped,
            )
        })
    }

    unsafe fn destroy_mapped_buffer(&self, buffer: MappedBuffer) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(memory) = state.memory.remove(&buffer.buffer.as_raw()) {
            free_host_memory(&memory);
        }
        state.calls.buffers_destroyed += 1;
        Ok(())
    }

    unsafe fn flush_mapped_range(
        &self,
        buffer: &MappedBuffer,
        offset: u64,
        size: u64,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        state.check(MockOp::Flush)?;
        state.calls.flushes.push((buffer.buffer, offset, size));
        Ok(())
    }

    unsafe fn invalidate_mapped_range(
        &self,
        buffer: &MappedBuffer,
        offset: u64,
        size: u64,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        state.check(MockOp::Invalidate)?;
        state.calls.invalidations.push((buffer.buffer, offset, size));
        Ok(())
    }
}

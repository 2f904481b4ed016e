//! Vulkan layer of the Lumen viewer.
//!
//! This crate provides:
//! - Vulkan instance and device management
//! - Pools for hardware queues, command buffers, host-visible buffers and
//!   descriptor sets, all built on the [`DeviceApi`] seam
//! - One-time command submission composed from the queue and command pools
//! - Surface and swapchain lifecycle
//! - Memory allocation via gpu-allocator and host allocation callbacks

pub mod capabilities;
pub mod command;
pub mod command_pool;
pub mod context;
pub mod descriptor_pool;
pub mod device;
pub mod error;
pub mod hash;
pub mod host_alloc;
pub mod host_buffer;
pub mod instance;
pub mod memory;
pub mod queue_pool;
pub mod submit;
pub mod surface;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
mod mock;

pub use capabilities::{GpuCapabilities, GpuVendor};
pub use command_pool::{AcquiredCommandBuffer, CommandBufferPool};
pub use context::{GpuContext, GpuContextBuilder};
pub use descriptor_pool::{
    BufferBinding, DescriptorBinding, DescriptorResource, DescriptorSetLayoutBuilder,
    DescriptorSetPool, ImageBinding,
};
pub use device::{DeviceApi, SubmitBatch, VulkanDevice};
pub use error::{GpuError, Result};
pub use host_alloc::{HostAllocator, HostCallbacks, SystemHostAllocator};
pub use host_buffer::{HostBufferPool, HostBufferPoolConfig, HostBufferUsage, Suballocation};
pub use memory::{GpuAllocator, GpuImage, MappedBuffer};
pub use queue_pool::{AcquiredQueue, QueueFamily, QueuePool, QueueSelector};
pub use submit::{FrameOutcome, OneTimeSubmit, OneTimeSubmitResult, SubmitStage};
pub use surface::{Surface, SurfaceCapabilities};
pub use swapchain::{Swapchain, SwapchainRequest, SwapchainState, MAX_SWAPCHAIN_IMAGES};
pub use sync::{create_fence, create_semaphore, FrameSync};

//! Fences and semaphores that live outside the pools.
//!
//! Creation and destruction go through the device so the host allocation
//! callbacks see both halves of every object.

use crate::device::{DeviceApi, VulkanDevice};
use crate::error::{GpuError, Result};
use ash::vk;
use std::time::Duration;

/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &VulkanDevice) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    let semaphore = unsafe { device.raw().create_semaphore(&create_info, device.callbacks())? };
    Ok(semaphore)
}

/// # Safety
/// No pending submission may reference the semaphore.
pub unsafe fn destroy_semaphore(device: &VulkanDevice, semaphore: vk::Semaphore) {
    unsafe { device.raw().destroy_semaphore(semaphore, device.callbacks()) };
}

/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &dyn DeviceApi, signaled: bool) -> Result<vk::Fence> {
    Ok(unsafe { device.create_fence(signaled)? })
}

/// Block until `fence` signals or `timeout` passes (`None` waits forever).
///
/// An expired timeout is reported as [`GpuError::Timeout`].
///
/// # Safety
/// The fence must belong to `device`.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn wait_for_fence(
    device: &dyn DeviceApi,
    fence: vk::Fence,
    timeout: Option<Duration>,
) -> Result<()> {
    match unsafe { device.wait_for_fence(fence, timeout_ns(timeout)) } {
        Ok(()) => Ok(()),
        Err(vk::Result::TIMEOUT) => Err(GpuError::Timeout),
        Err(e) => Err(GpuError::Vulkan(e)),
    }
}

/// Nanosecond count for a fence wait, saturating at "forever".
pub fn timeout_ns(timeout: Option<Duration>) -> u64 {
    timeout.map_or(u64::MAX, |t| u64::try_from(t.as_nanos()).unwrap_or(u64::MAX))
}

/// Per-frame pair: the acquire semaphore and the fence guarding the slot.
pub struct FrameSync {
    /// Signaled by the presentation engine once the acquired image is usable.
    pub image_available: vk::Semaphore,
    /// Signaled when the slot's last submission retires. Starts signaled.
    pub in_flight: vk::Fence,
}

impl FrameSync {
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &VulkanDevice) -> Result<Self> {
        let image_available = unsafe { create_semaphore(device)? };
        match unsafe { create_fence(device, true) } {
            Ok(in_flight) => Ok(Self {
                image_available,
                in_flight,
            }),
            Err(e) => {
                unsafe { destroy_semaphore(device, image_available) };
                Err(e)
            }
        }
    }

    /// Wait until the GPU is done with the slot's previous submission.
    ///
    /// # Safety
    /// The fence must belong to `device`.
    pub unsafe fn wait(&self, device: &dyn DeviceApi) -> Result<()> {
        unsafe { wait_for_fence(device, self.in_flight, None) }
    }

    /// # Safety
    /// Nothing pending may reference either object.
    pub unsafe fn destroy(&self, device: &VulkanDevice) {
        unsafe {
            destroy_semaphore(device, self.image_available);
            device.destroy_fence(self.in_flight);
        }
    }
}

//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error, carried verbatim from the driver.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// Every slot is busy right now. Callers are expected to retry.
    #[error("No free slot available")]
    Unavailable,

    /// A fence wait or acquisition loop ran out of time.
    #[error("Timed out waiting for the GPU")]
    Timeout,

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Queue family index does not exist on this device.
    #[error("Unknown queue family: {0}")]
    UnknownQueueFamily(u32),

    /// No queue family satisfies the requested capabilities.
    #[error("No queue family matches {0:?}")]
    NoMatchingQueueFamily(vk::QueueFlags),

    /// No queue family can present to the surface.
    #[error("No queue family supports presentation")]
    NoPresentQueue,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Sub-allocation larger than a single page may ever be.
    #[error("Sub-allocation of {requested} bytes exceeds the maximum page range of {max} bytes")]
    AllocationTooLarge { requested: u64, max: u64 },

    /// Push does not fit in the remaining space of the page.
    #[error("Page {page} has {available} units left, {requested} requested")]
    PageFull {
        page: usize,
        requested: u64,
        available: u64,
    },

    /// Descriptor type has no buffer or image info member.
    #[error("Unsupported descriptor type: {0:?}")]
    UnsupportedDescriptorType(vk::DescriptorType),

    /// Descriptor resource kind disagrees with its declared type.
    #[error("Binding {binding} declares {descriptor_type:?} but carries a {resource} resource")]
    DescriptorResourceMismatch {
        binding: u32,
        descriptor_type: vk::DescriptorType,
        resource: &'static str,
    },

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Driver returned more swapchain images than the engine tracks.
    #[error("Swapchain returned {count} images, at most {max} are supported")]
    TooManySwapchainImages { count: usize, max: usize },

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// Whether the failure is expected to clear up on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable | Self::Vulkan(vk::Result::NOT_READY))
    }

    /// Native result code equivalent of this error.
    pub fn as_vk_result(&self) -> vk::Result {
        match self {
            Self::Vulkan(result) => *result,
            Self::Unavailable => vk::Result::NOT_READY,
            Self::Timeout => vk::Result::TIMEOUT,
            Self::AllocationFailed(_) => vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            Self::ExtensionNotSupported(_) => vk::Result::ERROR_EXTENSION_NOT_PRESENT,
            Self::NoSuitableDevice => vk::Result::ERROR_INCOMPATIBLE_DRIVER,
            Self::UnsupportedDescriptorType(_) | Self::DescriptorResourceMismatch { .. } => {
                vk::Result::ERROR_FORMAT_NOT_SUPPORTED
            }
            _ => vk::Result::ERROR_UNKNOWN,
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors() {
        assert!(GpuError::Unavailable.is_transient());
        assert!(GpuError::Vulkan(vk::Result::NOT_READY).is_transient());
        assert!(!GpuError::Timeout.is_transient());
        assert!(!GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST).is_transient());
    }

    #[test]
    fn native_codes_are_preserved() {
        assert_eq!(
            GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST).as_vk_result(),
            vk::Result::ERROR_DEVICE_LOST
        );
        assert_eq!(GpuError::Timeout.as_vk_result(), vk::Result::TIMEOUT);
        assert_eq!(GpuError::Unavailable.as_vk_result(), vk::Result::NOT_READY);
    }
}

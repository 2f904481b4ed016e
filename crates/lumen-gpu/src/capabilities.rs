//! GPU capability detection.

use crate::instance::meets_api_version;
use ash::vk;
use std::collections::HashSet;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    pub vendor: GpuVendor,
    pub device_name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub driver_version: u32,

    /// Hardware limits; the pools take their alignments and ranges from here.
    pub limits: vk::PhysicalDeviceLimits,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    /// Whether some host-visible memory type is not host-coherent, which is
    /// when flush and invalidate actually do work.
    pub has_non_coherent_host_memory: bool,

    /// Queue families as reported by the driver.
    pub queue_families: Vec<vk::QueueFamilyProperties>,

    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let available_extensions: HashSet<String> = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default()
            .iter()
            .filter_map(|ext| {
                ext.extension_name_as_c_str()
                    .ok()
                    .and_then(|name| name.to_str().ok())
                    .map(String::from)
            })
            .collect();

        let device_name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let has_non_coherent_host_memory = memory_properties
            .memory_types
            .iter()
            .take(memory_properties.memory_type_count as usize)
            .any(|ty| {
                ty.property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
                    && !ty
                        .property_flags
                        .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
            });

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            device_type: properties.device_type,
            api_version: properties.api_version,
            driver_version: properties.driver_version,
            limits: properties.limits,
            device_local_memory_mb,
            has_non_coherent_host_memory,
            queue_families: instance
                .get_physical_device_queue_family_properties(physical_device),
            available_extensions,
        }
    }

    /// Whether the device supports a named extension.
    pub fn supports_extension(&self, name: &str) -> bool {
        self.available_extensions.contains(name)
    }

    /// Check if the GPU meets minimum requirements for the engine.
    pub fn meets_requirements(&self, presentation: bool) -> bool {
        meets_api_version(self.api_version)
            && (!presentation || self.supports_extension("VK_KHR_swapchain"))
            && self
                .queue_families
                .iter()
                .any(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, {:?}) - Vulkan {}.{}.{} - {} MB VRAM - {} queue families",
            self.device_name,
            self.vendor,
            self.device_type,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            self.queue_families.len(),
        )
    }
}

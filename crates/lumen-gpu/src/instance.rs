//! Vulkan instance creation.

use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{CStr, CString};

/// Lowest Vulkan version the engine runs on.
pub const MIN_API_VERSION: u32 = vk::API_VERSION_1_2;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Required instance extensions for the engine. Headless contexts skip the
/// surface extensions.
pub fn required_instance_extensions(presentation: bool) -> Vec<&'static CStr> {
    let mut extensions = vec![
        #[cfg(target_os = "macos")]
        ash::khr::portability_enumeration::NAME,
    ];

    if presentation {
        extensions.extend([
            ash::khr::surface::NAME,
            #[cfg(target_os = "windows")]
            ash::khr::win32_surface::NAME,
            #[cfg(target_os = "linux")]
            ash::khr::xlib_surface::NAME,
            #[cfg(target_os = "linux")]
            ash::khr::wayland_surface::NAME,
            #[cfg(target_os = "macos")]
            ash::ext::metal_surface::NAME,
        ]);
    }

    extensions
}

/// Instance plus whether validation output is routed to the log.
pub struct CreatedInstance {
    pub instance: ash::Instance,
    pub validation_enabled: bool,
}

/// Create a Vulkan instance.
///
/// Validation is enabled only when both the Khronos layer and
/// `VK_EXT_debug_utils` are available; otherwise a warning is logged and the
/// instance is created without it.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
    presentation: bool,
    callbacks: Option<&vk::AllocationCallbacks<'_>>,
) -> Result<CreatedInstance> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::Other(format!("Invalid application name: {e}")))?;
    let engine_name = c"Lumen";

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(MIN_API_VERSION);

    let mut extension_names: Vec<*const i8> = required_instance_extensions(presentation)
        .iter()
        .map(|ext| ext.as_ptr())
        .collect();

    let validation_enabled = enable_validation && validation_available(entry)?;
    if enable_validation && !validation_enabled {
        tracing::warn!("Validation requested but the layer or VK_EXT_debug_utils is missing");
    }

    let mut layer_names: Vec<*const i8> = Vec::new();
    if validation_enabled {
        layer_names.push(VALIDATION_LAYER.as_ptr());
        extension_names.push(ash::ext::debug_utils::NAME.as_ptr());
    }

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance = entry.create_instance(&create_info, callbacks)?;

    Ok(CreatedInstance {
        instance,
        validation_enabled,
    })
}

unsafe fn validation_available(entry: &ash::Entry) -> Result<bool> {
    let layers = entry.enumerate_instance_layer_properties()?;
    let has_layer = layers
        .iter()
        .any(|props| props.layer_name_as_c_str() == Ok(VALIDATION_LAYER));

    let extensions = entry.enumerate_instance_extension_properties(None)?;
    let has_debug_utils = extensions
        .iter()
        .any(|ext| ext.extension_name_as_c_str() == Ok(ash::ext::debug_utils::NAME));

    Ok(has_layer && has_debug_utils)
}

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    // SAFETY: the driver passes valid callback data for the duration of the call.
    let message = unsafe { CStr::from_ptr((*p_callback_data).p_message) }.to_string_lossy();

    let kind = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "general",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "validation",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "performance",
        _ => "other",
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => {
            tracing::trace!(target: "vulkan", kind, "{message}");
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            tracing::debug!(target: "vulkan", kind, "{message}");
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            tracing::warn!(target: "vulkan", kind, "{message}");
        }
        _ => {
            tracing::error!(target: "vulkan", kind, "{message}");
        }
    }

    vk::FALSE
}

/// Routes validation messages into `tracing`.
pub struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    /// # Safety
    /// The instance must have been created with `VK_EXT_debug_utils`.
    pub unsafe fn new(
        entry: &ash::Entry,
        instance: &ash::Instance,
        callbacks: Option<&vk::AllocationCallbacks<'_>>,
    ) -> Result<Self> {
        let loader = ash::ext::debug_utils::Instance::new(entry, instance);
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(vulkan_debug_callback));

        let messenger = loader.create_debug_utils_messenger(&create_info, callbacks)?;
        Ok(Self { loader, messenger })
    }

    /// # Safety
    /// Must be called before the instance is destroyed.
    pub unsafe fn destroy(&self, callbacks: Option<&vk::AllocationCallbacks<'_>>) {
        self.loader
            .destroy_debug_utils_messenger(self.messenger, callbacks);
    }
}

/// Select the best physical device. With `presentation` set, devices
/// without `VK_KHR_swapchain` are skipped.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
    presentation: bool,
) -> Result<vk::PhysicalDevice> {
    let devices = instance.enumerate_physical_devices()?;

    let mut best_device = None;
    let mut best_score = 0i32;

    for device in devices {
        let score = score_physical_device(instance, device, presentation);
        if score > best_score {
            best_score = score;
            best_device = Some(device);
        }
    }

    best_device.ok_or(GpuError::NoSuitableDevice)
}

/// Score a physical device for selection. Negative scores are unusable.
unsafe fn score_physical_device(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    presentation: bool,
) -> i32 {
    let properties = instance.get_physical_device_properties(device);

    if !meets_api_version(properties.api_version) {
        return -1;
    }

    let has_swapchain = instance
        .enumerate_device_extension_properties(device)
        .unwrap_or_default()
        .iter()
        .any(|ext| ext.extension_name_as_c_str() == Ok(ash::khr::swapchain::NAME));
    if presentation && !has_swapchain {
        return -1;
    }

    let mut score = 1;

    match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => score += 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => score += 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => score += 50,
        _ => {}
    }

    let memory = instance.get_physical_device_memory_properties(device);
    let vram_mb: u64 = memory
        .memory_heaps
        .iter()
        .take(memory.memory_heap_count as usize)
        .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|h| h.size / (1024 * 1024))
        .sum();
    score += (vram_mb / 1024) as i32; // +1 per GB

    score
}

/// Whether `api_version` is at least [`MIN_API_VERSION`].
pub fn meets_api_version(api_version: u32) -> bool {
    let major = vk::api_version_major(api_version);
    let minor = vk::api_version_minor(api_version);
    major > 1 || (major == 1 && minor >= vk::api_version_minor(MIN_API_VERSION))
}

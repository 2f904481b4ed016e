//! GPU context management.
//!
//! The context owns the instance, the device and the two device-wide pools.
//! Every queue of every family is requested up front (up to a per-family
//! cap) and handed to the [`QueuePool`].

use crate::capabilities::GpuCapabilities;
use crate::command_pool::CommandBufferPool;
use crate::device::{DeviceApi, SubmitBatch, VulkanDevice};
use crate::error::{GpuError, Result};
use crate::host_alloc::{HostAllocator, HostCallbacks};
use crate::instance::{create_instance, select_physical_device, DebugMessenger};
use crate::queue_pool::{QueueFamily, QueuePool, QueueSelector};
use crate::submit::{
    recover_frame, submit_frame, submit_one_time, FrameOutcome, OneTimeSubmit,
    OneTimeSubmitResult,
};
use crate::surface::Surface;
use crate::swapchain::Swapchain;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::CStr;
use std::sync::Arc;

/// Default cap on queues requested per family.
pub const DEFAULT_MAX_QUEUES_PER_FAMILY: u32 = 4;

/// Main GPU context holding Vulkan resources.
pub struct GpuContext {
    entry: ash::Entry,
    instance: ash::Instance,
    debug_messenger: Option<DebugMessenger>,
    physical_device: vk::PhysicalDevice,
    device: Arc<ash::Device>,
    vulkan: Arc<VulkanDevice>,
    capabilities: GpuCapabilities,
    queues: QueuePool,
    commands: CommandBufferPool,
    host_callbacks: Option<Arc<HostCallbacks>>,
}

impl GpuContext {
    /// The loaded Vulkan entry points.
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// The device seam the pools are built on.
    pub fn vulkan_device(&self) -> &Arc<VulkanDevice> {
        &self.vulkan
    }

    /// The device seam as a trait object, for building further pools.
    pub fn device_api(&self) -> Arc<dyn DeviceApi> {
        self.vulkan.clone()
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    pub fn queues(&self) -> &QueuePool {
        &self.queues
    }

    pub fn commands(&self) -> &CommandBufferPool {
        &self.commands
    }

    /// Host allocation callbacks used for every create/destroy, if any.
    pub fn host_callbacks(&self) -> Option<&Arc<HostCallbacks>> {
        self.host_callbacks.as_ref()
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }

    /// Record and submit one-off work on a queue matching `selector`.
    pub fn submit_one_time<F>(
        &self,
        selector: QueueSelector,
        options: &OneTimeSubmit<'_>,
        record: F,
    ) -> OneTimeSubmitResult
    where
        F: FnOnce(vk::CommandBuffer) -> bool,
    {
        submit_one_time(
            &self.queues,
            &self.commands,
            self.vulkan.as_ref(),
            selector,
            options,
            record,
        )
    }

    /// Submit a frame's batch on a queue of `family` and present with `present`
    /// while the queue is held. See [`submit_frame`](crate::submit::submit_frame).
    ///
    /// # Safety
    /// `fence` must not be referenced by pending work.
    pub unsafe fn submit_frame<R, P>(
        &self,
        family: u32,
        batch: &SubmitBatch<'_>,
        fence: vk::Fence,
        present: P,
    ) -> Result<FrameOutcome<R>>
    where
        P: FnOnce(vk::Queue) -> R,
    {
        unsafe { submit_frame(&self.queues, self.vulkan.as_ref(), family, batch, fence, present) }
    }

    /// Consume an acquired image's semaphores for a frame that never submitted.
    ///
    /// # Safety
    /// `fence` must not be referenced by pending work.
    pub unsafe fn recover_frame(
        &self,
        family: u32,
        wait_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> Result<()> {
        unsafe { recover_frame(&self.queues, self.vulkan.as_ref(), family, wait_semaphores, fence) }
    }

    /// Create a surface for a window.
    ///
    /// # Safety
    /// The window must outlive the surface, and the context must have been
    /// built with presentation support.
    pub unsafe fn create_surface<W>(&self, window: &W) -> Result<Surface>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        Surface::new(
            &self.entry,
            &self.instance,
            self.physical_device,
            window,
            self.host_callbacks.clone(),
        )
    }

    /// Create an uninitialized swapchain bound to this device.
    pub fn create_swapchain(&self) -> Swapchain {
        Swapchain::new(&self.instance, &self.device)
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            self.commands.destroy();
            self.queues.destroy();

            // Shutdown allocator BEFORE destroying device
            // This frees all VkDeviceMemory allocations
            self.vulkan.shutdown();

            let callbacks = self.host_callbacks.as_deref().map(HostCallbacks::callbacks);
            self.device.destroy_device(callbacks);
            if let Some(messenger) = self.debug_messenger.take() {
                messenger.destroy(callbacks);
            }
            self.instance.destroy_instance(callbacks);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    presentation: bool,
    max_queues_per_family: u32,
    host_allocator: Option<Arc<dyn HostAllocator>>,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Lumen".to_string(),
            enable_validation: cfg!(debug_assertions),
            presentation: !cfg!(feature = "headless"),
            max_queues_per_family: DEFAULT_MAX_QUEUES_PER_FAMILY,
            host_allocator: None,
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Whether the context must be able to present to a window.
    pub fn presentation(mut self, enable: bool) -> Self {
        self.presentation = enable;
        self
    }

    /// Cap on queues requested per family. Clamped to at least one.
    pub fn max_queues_per_family(mut self, count: u32) -> Self {
        self.max_queues_per_family = count.max(1);
        self
    }

    /// Route Vulkan's host allocations through `allocator`.
    pub fn host_allocator(mut self, allocator: Arc<dyn HostAllocator>) -> Self {
        self.host_allocator = Some(allocator);
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let host_callbacks = self
            .host_allocator
            .map(|allocator| Arc::new(HostCallbacks::new(allocator)));
        let callbacks = host_callbacks.as_deref().map(HostCallbacks::callbacks);

        let created = unsafe {
            create_instance(
                &entry,
                &self.app_name,
                self.enable_validation,
                self.presentation,
                callbacks,
            )
        }?;
        let instance = created.instance;

        // From here on, failures must release what was created so far.
        let mut partial = PartialContext {
            instance: &instance,
            debug_messenger: None,
            device: None,
            callbacks,
            armed: true,
        };

        if created.validation_enabled {
            match unsafe { DebugMessenger::new(&entry, &instance, callbacks) } {
                Ok(messenger) => partial.debug_messenger = Some(messenger),
                Err(e) => tracing::warn!("Failed to create debug messenger: {e}"),
            }
        }

        let physical_device = unsafe { select_physical_device(&instance, self.presentation) }?;
        let capabilities = unsafe { GpuCapabilities::query(&instance, physical_device) };

        if !capabilities.meets_requirements(self.presentation) {
            return Err(GpuError::NoSuitableDevice);
        }

        tracing::info!("Selected GPU: {}", capabilities.summary());

        let families =
            QueueFamily::from_properties(&capabilities.queue_families, self.max_queues_per_family);
        let device =
            unsafe { create_device(&instance, physical_device, &families, self.presentation, callbacks) }?;
        let device = Arc::new(device);
        partial.device = Some(device.clone());

        let vulkan = Arc::new(unsafe {
            VulkanDevice::new(&instance, physical_device, device.clone(), host_callbacks.clone())
        }?);
        let device_api: Arc<dyn DeviceApi> = vulkan.clone();
        let queues = QueuePool::new(device_api.clone(), &families);
        let commands = CommandBufferPool::new(device_api, &families);

        for family in &families {
            tracing::debug!(
                family = family.index(),
                flags = ?family.flags(),
                queues = family.queue_count(),
                "Queue family enabled"
            );
        }

        let debug_messenger = partial.disarm();

        Ok(GpuContext {
            entry,
            instance,
            debug_messenger,
            physical_device,
            device,
            vulkan,
            capabilities,
            queues,
            commands,
            host_callbacks,
        })
    }
}

/// Objects created during [`GpuContextBuilder::build`], destroyed again if
/// the build bails out early.
struct PartialContext<'a> {
    instance: &'a ash::Instance,
    debug_messenger: Option<DebugMessenger>,
    device: Option<Arc<ash::Device>>,
    callbacks: Option<&'a vk::AllocationCallbacks<'static>>,
    armed: bool,
}

impl PartialContext<'_> {
    /// Hand ownership to the finished context.
    fn disarm(mut self) -> Option<DebugMessenger> {
        self.armed = false;
        self.debug_messenger.take()
    }
}

impl Drop for PartialContext<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        unsafe {
            if let Some(device) = self.device.take() {
                device.destroy_device(self.callbacks);
            }
            if let Some(messenger) = self.debug_messenger.take() {
                messenger.destroy(self.callbacks);
            }
            self.instance.destroy_instance(self.callbacks);
        }
    }
}

/// Required device extensions.
fn required_device_extensions(presentation: bool) -> Vec<&'static CStr> {
    if presentation {
        vec![ash::khr::swapchain::NAME]
    } else {
        Vec::new()
    }
}

/// Create the logical device with every queue of `families`.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    families: &[QueueFamily],
    presentation: bool,
    callbacks: Option<&vk::AllocationCallbacks<'_>>,
) -> Result<ash::Device> {
    let priorities: Vec<Vec<f32>> = families
        .iter()
        .map(|family| vec![1.0_f32; family.queue_count() as usize])
        .collect();

    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
        .iter()
        .zip(&priorities)
        .filter(|(family, _)| family.queue_count() > 0)
        .map(|(family, priorities)| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family.index())
                .queue_priorities(priorities)
        })
        .collect();

    let extensions = required_device_extensions(presentation);
    let extension_names: Vec<*const i8> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    let features = vk::PhysicalDeviceFeatures::default();

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .enabled_features(&features);

    instance
        .create_device(physical_device, &device_create_info, callbacks)
        .map_err(GpuError::from)
}

//! Surface management for windowed rendering.
//!
//! Wraps the `VkSurfaceKHR` of a window together with the capabilities the
//! swapchain is built from. Platform handling is left to `ash-window`.

use crate::error::{GpuError, Result};
use crate::host_alloc::HostCallbacks;
use crate::queue_pool::{QueueFamily, QueuePool};
use crate::swapchain::{select_present_mode, select_surface_format};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;

/// Surface capabilities query result.
#[derive(Clone, Default)]
pub struct SurfaceCapabilities {
    /// Raw surface capabilities.
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats.
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes.
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceCapabilities {
    /// Get the recommended surface format.
    pub fn recommended_format(&self) -> vk::SurfaceFormatKHR {
        select_surface_format(&self.formats)
    }

    /// Get the recommended present mode.
    pub fn recommended_present_mode(&self, vsync: bool) -> vk::PresentModeKHR {
        select_present_mode(&self.present_modes, vsync)
    }
}

/// A window surface and its last queried capabilities.
pub struct Surface {
    handle: vk::SurfaceKHR,
    loader: ash::khr::surface::Instance,
    physical_device: vk::PhysicalDevice,
    capabilities: SurfaceCapabilities,
    host_callbacks: Option<Arc<HostCallbacks>>,
}

impl Surface {
    /// Create a surface for `window` and query its capabilities.
    ///
    /// # Safety
    /// The instance must have been created with the platform surface
    /// extensions, and the window must outlive the surface.
    pub unsafe fn new<W>(
        entry: &ash::Entry,
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        window: &W,
        host_callbacks: Option<Arc<HostCallbacks>>,
    ) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let mut surface = Self {
            handle: vk::SurfaceKHR::null(),
            loader: ash::khr::surface::Instance::new(entry, instance),
            physical_device,
            capabilities: SurfaceCapabilities::default(),
            host_callbacks,
        };
        surface.recreate(entry, instance, window)?;
        Ok(surface)
    }

    /// Replace the native surface, e.g. after the window was recreated.
    ///
    /// # Safety
    /// No swapchain may still reference the current surface.
    pub unsafe fn recreate<W>(
        &mut self,
        entry: &ash::Entry,
        instance: &ash::Instance,
        window: &W,
    ) -> Result<()>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        let handle = ash_window::create_surface(
            entry,
            instance,
            display.as_raw(),
            window_handle.as_raw(),
            self.callbacks(),
        )
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        self.destroy();
        self.handle = handle;

        if let Err(e) = self.refresh() {
            self.destroy();
            return Err(e);
        }

        tracing::debug!(
            formats = self.capabilities.formats.len(),
            present_modes = self.capabilities.present_modes.len(),
            "Surface created"
        );
        Ok(())
    }

    /// Query the surface's current capabilities without caching them.
    ///
    /// # Safety
    /// The surface must be valid.
    pub unsafe fn query_capabilities(&self) -> Result<SurfaceCapabilities> {
        let capabilities = self
            .loader
            .get_physical_device_surface_capabilities(self.physical_device, self.handle)?;
        let formats = self
            .loader
            .get_physical_device_surface_formats(self.physical_device, self.handle)?;
        let present_modes = self
            .loader
            .get_physical_device_surface_present_modes(self.physical_device, self.handle)?;

        Ok(SurfaceCapabilities {
            capabilities,
            formats,
            present_modes,
        })
    }

    /// Re-query and cache the capabilities. Extents change with the window.
    ///
    /// # Safety
    /// The surface must be valid.
    pub unsafe fn refresh(&mut self) -> Result<&SurfaceCapabilities> {
        self.capabilities = self.query_capabilities()?;
        Ok(&self.capabilities)
    }

    /// First queue family of the pool that can present to this surface.
    ///
    /// # Safety
    /// The pool's families must belong to this surface's physical device.
    pub unsafe fn find_present_family(&self, queues: &QueuePool) -> Result<u32> {
        pick_present_family(queues.families(), |family| {
            Ok(self.loader.get_physical_device_surface_support(
                self.physical_device,
                family,
                self.handle,
            )?)
        })
    }

    /// Destroy the surface. Safe to call more than once.
    ///
    /// # Safety
    /// No swapchain may still reference the surface.
    pub unsafe fn destroy(&mut self) {
        if self.handle != vk::SurfaceKHR::null() {
            self.loader.destroy_surface(self.handle, self.callbacks());
            self.handle = vk::SurfaceKHR::null();
        }
    }

    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    /// Capabilities cached by the last query.
    pub fn capabilities(&self) -> &SurfaceCapabilities {
        &self.capabilities
    }

    fn callbacks(&self) -> Option<&vk::AllocationCallbacks<'static>> {
        self.host_callbacks.as_deref().map(HostCallbacks::callbacks)
    }
}

/// Pick the first family for which `supports_present` holds, trying
/// graphics-capable families before the rest.
pub fn pick_present_family<I, F>(families: I, mut supports_present: F) -> Result<u32>
where
    I: IntoIterator<Item = QueueFamily>,
    F: FnMut(u32) -> Result<bool>,
{
    let (graphics, other): (Vec<_>, Vec<_>) = families
        .into_iter()
        .partition(|family| family.supports(vk::QueueFlags::GRAPHICS));

    for family in graphics.iter().chain(&other) {
        if supports_present(family.index())? {
            return Ok(family.index());
        }
    }

    Err(GpuError::NoPresentQueue)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn families() -> Vec<QueueFamily> {
        vec![
            QueueFamily::new(0, vk::QueueFlags::TRANSFER, 1),
            QueueFamily::new(1, vk::QueueFlags::COMPUTE, 2),
            QueueFamily::new(2, vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 1),
        ]
    }

    #[test]
    fn graphics_families_are_preferred() {
        let picked = pick_present_family(families(), |_| Ok(true)).unwrap();
        assert_eq!(picked, 2);
    }

    #[test]
    fn falls_back_to_non_graphics_families() {
        let picked = pick_present_family(families(), |index| Ok(index == 1)).unwrap();
        assert_eq!(picked, 1);
    }

    #[test]
    fn no_present_support_is_an_error() {
        let result = pick_present_family(families(), |_| Ok(false));
        assert!(matches!(result, Err(GpuError::NoPresentQueue)));
    }

    #[test]
    fn query_errors_are_propagated() {
        let result = pick_present_family(families(), |_| {
            Err(GpuError::Vulkan(vk::Result::ERROR_SURFACE_LOST_KHR))
        });
        assert!(matches!(
            result,
            Err(GpuError::Vulkan(vk::Result::ERROR_SURFACE_LOST_KHR))
        ));
    }
}

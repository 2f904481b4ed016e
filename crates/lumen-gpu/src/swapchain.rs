//! Swapchain management.

use crate::device::VulkanDevice;
use crate::error::{GpuError, Result};
use crate::surface::Surface;
use ash::vk;

/// Most swapchain images the engine tracks per chain.
pub const MAX_SWAPCHAIN_IMAGES: usize = 4;

/// Lifecycle of a [`Swapchain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainState {
    /// No native chain has been created yet.
    Uninitialized,
    /// Images and views are valid.
    Initialized,
    /// The chain was destroyed and must not be used.
    Destroyed,
}

/// Parameters of a swapchain (re)creation.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainRequest {
    /// Wanted number of images, clamped to what the surface allows.
    pub image_count: u32,
    /// Used when the surface leaves the extent to the swapchain.
    pub extent: vk::Extent2D,
    pub vsync: bool,
}

impl SwapchainRequest {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image_count: 3,
            extent: vk::Extent2D { width, height },
            vsync: true,
        }
    }

    pub fn with_image_count(mut self, count: u32) -> Self {
        self.image_count = count;
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }
}

/// Swapchain wrapper.
///
/// Holds at most [`MAX_SWAPCHAIN_IMAGES`] image/view pairs. Recreation hands
/// the previous handle to the driver and only tears the old chain down once
/// the new one exists.
pub struct Swapchain {
    loader: ash::khr::swapchain::Device,
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    state: SwapchainState,
}

impl Swapchain {
    /// Create an uninitialized swapchain; call [`Swapchain::recreate`] before use.
    pub fn new(instance: &ash::Instance, device: &ash::Device) -> Self {
        Self {
            loader: ash::khr::swapchain::Device::new(instance, device),
            handle: vk::SwapchainKHR::null(),
            images: Vec::new(),
            image_views: Vec::new(),
            format: vk::SurfaceFormatKHR::default(),
            extent: vk::Extent2D::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            state: SwapchainState::Uninitialized,
        }
    }

    /// (Re)create the native chain for `surface`.
    ///
    /// Surface capabilities are re-queried first. The previous chain is
    /// destroyed only after the new one exists; if creation fails the
    /// swapchain is left uninitialized.
    ///
    /// # Safety
    /// No submitted work may still reference the current images; wait for
    /// the device to go idle first.
    pub unsafe fn recreate(
        &mut self,
        device: &VulkanDevice,
        surface: &mut Surface,
        request: &SwapchainRequest,
    ) -> Result<()> {
        if self.state == SwapchainState::Destroyed {
            return Err(GpuError::InvalidState(
                "swapchain was destroyed".to_string(),
            ));
        }

        let caps = surface.refresh()?.clone();
        let format = select_surface_format(&caps.formats);
        let present_mode = select_present_mode(&caps.present_modes, request.vsync);
        let extent = resolve_extent(&caps.capabilities, request.extent);
        let image_count = clamp_image_count(&caps.capabilities, request.image_count);

        if extent.width == 0 || extent.height == 0 {
            return Err(GpuError::SwapchainCreation(
                "surface has a zero-sized extent".to_string(),
            ));
        }

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.handle())
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(self.handle);

        // The old chain is retired by the create call even when it fails.
        let created = self.create_native(device, &create_info, format.format);
        self.release_native(device);
        let (handle, images, image_views) = match created {
            Ok(created) => created,
            Err(e) => {
                self.state = SwapchainState::Uninitialized;
                return Err(e);
            }
        };

        self.handle = handle;
        self.images = images;
        self.image_views = image_views;
        self.format = format;
        self.extent = extent;
        self.present_mode = present_mode;
        self.state = SwapchainState::Initialized;

        tracing::info!(
            width = extent.width,
            height = extent.height,
            images = self.images.len(),
            format = ?format.format,
            present_mode = ?present_mode,
            "Swapchain created"
        );

        Ok(())
    }

    /// Acquire the next image. Returns the image index and whether the
    /// chain is suboptimal.
    ///
    /// # Safety
    /// The swapchain must be initialized and the semaphore unsignaled.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn acquire_next_image(
        &self,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<(u32, bool)> {
        let result =
            self.loader
                .acquire_next_image(self.handle, timeout_ns, semaphore, vk::Fence::null());

        match result {
            Ok((index, suboptimal)) => Ok((index, suboptimal)),
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => Err(GpuError::Timeout),
            // OUT_OF_DATE means no image was acquired; caller must recreate the swapchain.
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Present an image. `Ok(true)` means the chain should be recreated.
    ///
    /// # Safety
    /// The queue must support presentation to this swapchain's surface.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let swapchains = [self.handle];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match self.loader.queue_present(queue, &present_info) {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Destroy the chain. Safe to call more than once.
    ///
    /// # Safety
    /// The swapchain must not be in use.
    pub unsafe fn destroy(&mut self, device: &VulkanDevice) {
        self.release_native(device);
        self.state = SwapchainState::Destroyed;
    }

    unsafe fn create_native(
        &self,
        device: &VulkanDevice,
        create_info: &vk::SwapchainCreateInfoKHR<'_>,
        format: vk::Format,
    ) -> Result<(vk::SwapchainKHR, Vec<vk::Image>, Vec<vk::ImageView>)> {
        let callbacks = device.callbacks();
        let handle = self
            .loader
            .create_swapchain(create_info, callbacks)
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

        let images = match self
            .loader
            .get_swapchain_images(handle)
            .map_err(GpuError::from)
            .and_then(|images| check_image_count(images.len()).map(|()| images))
        {
            Ok(images) => images,
            Err(e) => {
                self.loader.destroy_swapchain(handle, callbacks);
                return Err(e);
            }
        };

        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            match create_image_view(device, image, format) {
                Ok(view) => image_views.push(view),
                Err(e) => {
                    for view in image_views {
                        device.raw().destroy_image_view(view, callbacks);
                    }
                    self.loader.destroy_swapchain(handle, callbacks);
                    return Err(e);
                }
            }
        }

        Ok((handle, images, image_views))
    }

    unsafe fn release_native(&mut self, device: &VulkanDevice) {
        let callbacks = device.callbacks();
        for view in self.image_views.drain(..) {
            device.raw().destroy_image_view(view, callbacks);
        }
        if self.handle != vk::SwapchainKHR::null() {
            self.loader.destroy_swapchain(self.handle, callbacks);
            self.handle = vk::SwapchainKHR::null();
        }
        self.images.clear();
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn state(&self) -> SwapchainState {
        self.state
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }
}

unsafe fn create_image_view(
    device: &VulkanDevice,
    image: vk::Image,
    format: vk::Format,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping::default())
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1),
        );

    Ok(device
        .raw()
        .create_image_view(&view_info, device.callbacks())?)
}

/// Reject chains with more images than the engine tracks.
pub fn check_image_count(count: usize) -> Result<()> {
    if count > MAX_SWAPCHAIN_IMAGES {
        return Err(GpuError::TooManySwapchainImages {
            count,
            max: MAX_SWAPCHAIN_IMAGES,
        });
    }
    Ok(())
}

/// Select the surface format.
///
/// A lone `UNDEFINED` entry means any format is acceptable.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    let fallback = vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_UNORM,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };

    match available {
        [] => fallback,
        [only] if only.format == vk::Format::UNDEFINED => fallback,
        [first, ..] => *first,
    }
}

/// Select the best present mode.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }

    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| available.contains(mode))
        // FIFO is always supported
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Resolve the swapchain extent.
///
/// The surface dictates the extent unless it reports the `u32::MAX`
/// sentinel, in which case `desired` is clamped into the supported range.
pub fn resolve_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX
        || capabilities.current_extent.height != u32::MAX
    {
        return capabilities.current_extent;
    }

    vk::Extent2D {
        width: desired.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: desired.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// Clamp a wanted image count into what the surface supports. A maximum
/// of zero means unbounded. The surface minimum wins over
/// [`MAX_SWAPCHAIN_IMAGES`]; such a chain is then rejected by recreation.
pub fn clamp_image_count(capabilities: &vk::SurfaceCapabilitiesKHR, desired: u32) -> u32 {
    let mut count = desired
        .min(MAX_SWAPCHAIN_IMAGES as u32)
        .max(capabilities.min_image_count);
    if capabilities.max_image_count > 0 {
        count = count.min(capabilities.max_image_count);
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps_with_sentinel() -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        }
    }

    #[test]
    fn extent_is_clamped_when_surface_leaves_it_open() {
        let caps = caps_with_sentinel();

        let large = resolve_extent(
            &caps,
            vk::Extent2D {
                width: 8000,
                height: 8000,
            },
        );
        assert_eq!((large.width, large.height), (4096, 4096));

        let empty = resolve_extent(&caps, vk::Extent2D::default());
        assert_eq!((empty.width, empty.height), (1, 1));
    }

    #[test]
    fn surface_extent_wins_when_defined() {
        let mut caps = caps_with_sentinel();
        caps.current_extent = vk::Extent2D {
            width: 1280,
            height: 720,
        };

        let extent = resolve_extent(
            &caps,
            vk::Extent2D {
                width: 8000,
                height: 8000,
            },
        );
        assert_eq!((extent.width, extent.height), (1280, 720));
    }

    #[test]
    fn present_mode_fallback_order() {
        use vk::PresentModeKHR as Mode;

        assert_eq!(select_present_mode(&[Mode::FIFO], false), Mode::FIFO);
        assert_eq!(
            select_present_mode(&[Mode::FIFO, Mode::MAILBOX], false),
            Mode::MAILBOX
        );
        assert_eq!(
            select_present_mode(&[Mode::FIFO, Mode::IMMEDIATE], false),
            Mode::IMMEDIATE
        );
        assert_eq!(
            select_present_mode(&[Mode::IMMEDIATE, Mode::MAILBOX, Mode::FIFO], false),
            Mode::MAILBOX
        );
        assert_eq!(
            select_present_mode(&[Mode::FIFO, Mode::MAILBOX], true),
            Mode::FIFO
        );
    }

    #[test]
    fn undefined_format_means_any() {
        let undefined = [vk::SurfaceFormatKHR {
            format: vk::Format::UNDEFINED,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];
        assert_eq!(
            select_surface_format(&undefined).format,
            vk::Format::B8G8R8A8_UNORM
        );

        let reported = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(
            select_surface_format(&reported).format,
            vk::Format::R8G8B8A8_SRGB
        );
    }

    #[test]
    fn image_count_respects_surface_bounds() {
        let mut caps = caps_with_sentinel();
        assert_eq!(clamp_image_count(&caps, 1), 2);
        assert_eq!(clamp_image_count(&caps, 3), 3);
        // unbounded maximum still stops at what the engine tracks
        assert_eq!(clamp_image_count(&caps, 16), MAX_SWAPCHAIN_IMAGES as u32);

        caps.max_image_count = 3;
        assert_eq!(clamp_image_count(&caps, 4), 3);
    }

    #[test]
    fn surface_minimum_beats_the_engine_cap() {
        let mut caps = caps_with_sentinel();
        caps.min_image_count = 5;
        let count = clamp_image_count(&caps, 2);
        assert_eq!(count, 5);
        assert!(check_image_count(count as usize).is_err());
    }

    #[test]
    fn too_many_images_is_an_error() {
        assert!(check_image_count(MAX_SWAPCHAIN_IMAGES).is_ok());
        assert!(matches!(
            check_image_count(MAX_SWAPCHAIN_IMAGES + 1),
            Err(GpuError::TooManySwapchainImages { count: 5, max: 4 })
        ));
    }
}

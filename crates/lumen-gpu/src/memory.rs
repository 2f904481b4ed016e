//! GPU memory management.

use crate::error::{GpuError, Result};
use crate::host_alloc::HostCallbacks;
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use std::ptr::NonNull;
use std::sync::Arc;

/// GPU memory allocator wrapper.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
    host_callbacks: Option<Arc<HostCallbacks>>,
}

impl GpuAllocator {
    /// Create a new allocator. Buffers and images it creates go through
    /// `host_callbacks` when given.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
        host_callbacks: Option<Arc<HostCallbacks>>,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
            host_callbacks,
        })
    }

    fn callbacks(&self) -> Option<&vk::AllocationCallbacks<'static>> {
        self.host_callbacks.as_deref().map(HostCallbacks::callbacks)
    }

    fn inner(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))
    }

    /// Allocate a persistently mapped, host-visible buffer.
    ///
    /// The allocation offset and size are rounded to `atom_size` so that
    /// flush and invalidate ranges can be widened to atom boundaries without
    /// leaving the allocation.
    pub fn create_mapped_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        atom_size: u64,
        name: &str,
    ) -> Result<MappedBuffer> {
        let atom_size = atom_size.max(1);
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            self.device
                .create_buffer(&buffer_info, self.callbacks())
                .map_err(GpuError::from)?
        };

        let mut requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        requirements.alignment = requirements.alignment.max(atom_size);
        requirements.size = requirements.size.div_ceil(atom_size) * atom_size;

        let allocation = match self.inner().and_then(|allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name,
                    requirements,
                    location,
                    linear: true,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, self.callbacks()) };
                return Err(e);
            }
        };

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        let mapped = allocation.mapped_ptr().map(NonNull::cast::<u8>);

        let mapped = match (bound, mapped) {
            (Ok(()), Some(mapped)) => mapped,
            (bound, _) => {
                let _ = self.inner().map(|allocator| allocator.free(allocation));
                unsafe { self.device.destroy_buffer(buffer, self.callbacks()) };
                return Err(match bound {
                    Err(e) => GpuError::from(e),
                    Ok(()) => GpuError::AllocationFailed(format!("{name} is not host visible")),
                });
            }
        };

        let coherent = allocation
            .memory_properties()
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT);

        Ok(MappedBuffer {
            buffer,
            size,
            coherent,
            mapped,
            allocation: Some(allocation),
        })
    }

    /// Free a mapped buffer and its allocation.
    pub fn free_mapped_buffer(&mut self, mut buffer: MappedBuffer) -> Result<()> {
        if let Some(allocation) = buffer.allocation.take() {
            self.inner()?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
        }

        unsafe {
            self.device.destroy_buffer(buffer.buffer, self.callbacks());
        }

        Ok(())
    }

    /// Allocate an image.
    pub fn create_image(
        &mut self,
        create_info: &vk::ImageCreateInfo,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuImage> {
        let image = unsafe {
            self.device
                .create_image(create_info, self.callbacks())
                .map_err(GpuError::from)?
        };

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.inner().and_then(|allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name,
                    requirements,
                    location,
                    linear: false,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, self.callbacks()) };
                return Err(e);
            }
        };

        let bound = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            let _ = self.inner().map(|allocator| allocator.free(allocation));
            unsafe { self.device.destroy_image(image, self.callbacks()) };
            return Err(GpuError::from(e));
        }

        Ok(GpuImage {
            image,
            allocation: Some(allocation),
            format: create_info.format,
            extent: create_info.extent,
        })
    }

    /// Free an image allocation.
    pub fn free_image(&mut self, image: &mut GpuImage) -> Result<()> {
        if let Some(allocation) = image.allocation.take() {
            self.inner()?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
        }

        unsafe {
            self.device.destroy_image(image.image, self.callbacks());
        }
        image.image = vk::Image::null();

        Ok(())
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    /// Any remaining allocations will be freed (and logged as leaks).
    pub fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A persistently mapped host-visible buffer.
///
/// This is the backing store of one host buffer pool page.
pub struct MappedBuffer {
    pub buffer: vk::Buffer,
    pub size: u64,
    /// Whether the memory is host-coherent. Non-coherent memory needs
    /// explicit flush and invalidate calls.
    pub coherent: bool,
    mapped: NonNull<u8>,
    pub(crate) allocation: Option<Allocation>,
}

// SAFETY: the mapped pointer refers to memory owned by the allocation (or by
// the creator for allocation-less buffers), which is not tied to a thread.
unsafe impl Send for MappedBuffer {}

impl MappedBuffer {
    /// Assemble a mapped buffer from parts owned elsewhere.
    ///
    /// # Safety
    /// `mapped` must stay valid for writes of `size` bytes until the buffer is
    /// destroyed through the device that created it.
    pub unsafe fn from_raw_parts(
        buffer: vk::Buffer,
        size: u64,
        coherent: bool,
        mapped: NonNull<u8>,
    ) -> Self {
        Self {
            buffer,
            size,
            coherent,
            mapped,
            allocation: None,
        }
    }

    /// Base of the mapped range.
    pub fn mapped_ptr(&self) -> NonNull<u8> {
        self.mapped
    }

    /// Memory handle and offset of the allocation, when there is one.
    pub fn memory_range(&self) -> Option<(vk::DeviceMemory, u64, u64)> {
        self.allocation.as_ref().map(|allocation| {
            // SAFETY: the memory handle is only read, never freed through here.
            let memory = unsafe { allocation.memory() };
            (memory, allocation.offset(), allocation.size())
        })
    }

    /// Copy bytes into the mapped range.
    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > self.size {
            return Err(GpuError::InvalidState(
                "Data range too large for buffer".to_string(),
            ));
        }

        // SAFETY: the range was checked against the mapped size above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.mapped.as_ptr().add(offset as usize),
                data.len(),
            );
        }

        Ok(())
    }
}

/// A GPU image with its allocation.
pub struct GpuImage {
    pub image: vk::Image,
    pub allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
}

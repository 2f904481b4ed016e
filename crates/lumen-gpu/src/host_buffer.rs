//! Linear sub-allocation of host-visible buffers for per-frame data.
//!
//! A [`HostBufferPool`] owns a list of persistently mapped pages. Data is
//! appended at each page's cursor in alignment units; [`HostBufferPool::reset`]
//! rewinds every cursor once the frame that used the data has completed.
//! Pages are only freed by [`HostBufferPool::destroy`].
//!
//! A pool has a single writer. Use one pool per frame in flight.

use crate::device::DeviceApi;
use crate::error::{GpuError, Result};
use crate::memory::MappedBuffer;
use ash::vk;
use bytemuck::Pod;
use std::ops::Range;
use std::sync::Arc;

/// Maximum page size of staging pools, and the cap on every other usage.
/// Some drivers report binding ranges of 4 GiB.
pub const STAGING_PAGE_RANGE: u64 = 64 * 1024 * 1024;

/// Smallest alignment a pool ever uses.
const MIN_POOL_ALIGNMENT: u64 = 4;

/// What the pool's buffers are bound as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostBufferUsage {
    Uniform,
    Storage,
    UniformTexel,
    StorageTexel,
    /// Source of buffer-to-image and buffer-to-buffer copies.
    Staging,
}

impl HostBufferUsage {
    pub fn buffer_usage(self) -> vk::BufferUsageFlags {
        match self {
            Self::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
            Self::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
            Self::UniformTexel => vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER,
            Self::StorageTexel => vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER,
            Self::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
        }
    }

    /// Offset alignment the hardware requires for this usage, at least 4.
    pub fn min_alignment(self, limits: &vk::PhysicalDeviceLimits) -> u64 {
        let alignment = match self {
            Self::Uniform => limits.min_uniform_buffer_offset_alignment,
            Self::Storage => limits.min_storage_buffer_offset_alignment,
            Self::UniformTexel | Self::StorageTexel => limits.min_texel_buffer_offset_alignment,
            Self::Staging => limits.optimal_buffer_copy_offset_alignment,
        };
        alignment.max(MIN_POOL_ALIGNMENT)
    }

    /// Largest range a single binding of this usage may cover.
    pub fn max_page_range(self, limits: &vk::PhysicalDeviceLimits) -> u64 {
        let range = match self {
            Self::Uniform => u64::from(limits.max_uniform_buffer_range),
            Self::Storage => u64::from(limits.max_storage_buffer_range),
            Self::UniformTexel | Self::StorageTexel => {
                u64::from(limits.max_texel_buffer_elements)
            }
            Self::Staging => STAGING_PAGE_RANGE,
        };
        range.min(STAGING_PAGE_RANGE)
    }

    fn name(self) -> &'static str {
        match self {
            Self::Uniform => "uniform page",
            Self::Storage => "storage page",
            Self::UniformTexel => "uniform texel page",
            Self::StorageTexel => "storage texel page",
            Self::Staging => "staging page",
        }
    }
}

/// Settings for [`HostBufferPool::new`] and [`HostBufferPool::recreate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostBufferPoolConfig {
    pub usage: HostBufferUsage,
    /// Ask for host-coherent memory. The pool still handles non-coherent
    /// memory if that is what the allocator returns.
    pub prefer_host_coherent: bool,
    /// Minimum size of new non-uniform pages, so small requests share pages.
    pub page_size_hint: u64,
}

impl HostBufferPoolConfig {
    pub fn new(usage: HostBufferUsage) -> Self {
        Self {
            usage,
            prefer_host_coherent: true,
            page_size_hint: 0,
        }
    }

    pub fn with_host_coherent(mut self, prefer: bool) -> Self {
        self.prefer_host_coherent = prefer;
        self
    }

    pub fn with_page_size_hint(mut self, bytes: u64) -> Self {
        self.page_size_hint = bytes;
        self
    }
}

/// One mapped buffer used as a bump arena.
pub struct BufferPage {
    buffer: MappedBuffer,
    /// Next free unit.
    cursor: u64,
    capacity: u64,
    alignment: u64,
    /// Bytes written since the last flush. Only tracked for non-coherent
    /// memory.
    dirty: Option<Range<u64>>,
}

impl BufferPage {
    pub fn buffer(&self) -> vk::Buffer {
        self.buffer.buffer
    }

    /// Write cursor in alignment units.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Capacity in alignment units.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn remaining(&self) -> u64 {
        self.capacity - self.cursor
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn is_coherent(&self) -> bool {
        self.buffer.coherent
    }

    pub fn dirty_range(&self) -> Option<Range<u64>> {
        self.dirty.clone()
    }

    fn mark_dirty(&mut self, written: Range<u64>) {
        if self.buffer.coherent {
            return;
        }
        self.dirty = Some(match self.dirty.take() {
            Some(dirty) => dirty.start.min(written.start)..dirty.end.max(written.end),
            None => written,
        });
    }
}

/// Location of data written by [`HostBufferPool::suballocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Suballocation {
    pub page: usize,
    pub buffer: vk::Buffer,
    /// Byte offset of the data inside the buffer.
    pub offset: u64,
    /// Bytes requested.
    pub size: u64,
    /// Bytes from `offset` to the end of the page, capped at the pool's
    /// maximum binding range.
    pub page_range: u64,
}

impl Suballocation {
    /// Buffer info for a dynamic binding: offset 0 and the rest of the page as
    /// range, the data is selected by passing [`Self::dynamic_offset`] when
    /// binding the set. Trimming the range to the data is up to the caller.
    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo::default()
            .buffer(self.buffer)
            .offset(0)
            .range(self.page_range)
    }

    /// Buffer info pointing straight at the data, for non-dynamic bindings.
    pub fn static_descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo::default()
            .buffer(self.buffer)
            .offset(self.offset)
            .range(self.size)
    }

    pub fn dynamic_offset(&self) -> u32 {
        u32::try_from(self.offset).unwrap_or(u32::MAX)
    }
}

/// Bump allocator over host-visible pages.
pub struct HostBufferPool {
    device: Arc<dyn DeviceApi>,
    config: HostBufferPoolConfig,
    min_alignment: u64,
    max_page_range: u64,
    pages: Vec<BufferPage>,
}

impl HostBufferPool {
    /// Create an empty pool. Alignment and page range come from the device
    /// limits for the configured usage.
    pub fn new(device: Arc<dyn DeviceApi>, config: HostBufferPoolConfig) -> Self {
        let limits = device.limits();
        let min_alignment = config.usage.min_alignment(limits);
        let max_page_range = config.usage.max_page_range(limits);

        Self {
            device,
            config,
            min_alignment,
            max_page_range,
            pages: Vec::new(),
        }
    }

    /// Free every page and re-derive alignment and range for a new config.
    ///
    /// The GPU must be done with all existing pages.
    pub fn recreate(&mut self, config: HostBufferPoolConfig) -> Result<()> {
        self.destroy()?;
        let limits = self.device.limits();
        self.min_alignment = config.usage.min_alignment(limits);
        self.max_page_range = config.usage.max_page_range(limits);
        self.config = config;
        Ok(())
    }

    pub fn config(&self) -> &HostBufferPoolConfig {
        &self.config
    }

    pub fn min_alignment(&self) -> u64 {
        self.min_alignment
    }

    pub fn max_page_range(&self) -> u64 {
        self.max_page_range
    }

    pub fn pages(&self) -> &[BufferPage] {
        &self.pages
    }

    fn units(&self, size: u64) -> u64 {
        size.div_ceil(self.min_alignment)
    }

    fn page_bytes(&self, size: u64) -> u64 {
        let bytes = match self.config.usage {
            HostBufferUsage::Uniform => self.max_page_range,
            _ => size
                .max(self.config.page_size_hint)
                .min(self.max_page_range),
        };
        bytes.div_ceil(self.min_alignment) * self.min_alignment
    }

    /// Index of the first page with room for `size` bytes, creating a page
    /// when none has.
    pub fn find_page(&mut self, size: u64) -> Result<usize> {
        if size > self.max_page_range {
            return Err(GpuError::AllocationTooLarge {
                requested: size,
                max: self.max_page_range,
            });
        }

        let units = self.units(size);
        if let Some(index) = self.pages.iter().position(|page| page.remaining() >= units) {
            return Ok(index);
        }

        let bytes = self.page_bytes(size);
        let buffer = self.device.create_mapped_buffer(
            bytes,
            self.config.usage.buffer_usage(),
            self.config.prefer_host_coherent,
            self.config.usage.name(),
        )?;
        tracing::debug!(
            usage = ?self.config.usage,
            bytes,
            coherent = buffer.coherent,
            pages = self.pages.len() + 1,
            "host buffer pool added a page"
        );

        self.pages.push(BufferPage {
            buffer,
            cursor: 0,
            capacity: bytes / self.min_alignment,
            alignment: self.min_alignment,
            dirty: None,
        });
        Ok(self.pages.len() - 1)
    }

    /// Append `data` to a page and return its byte offset.
    ///
    /// Fails with [`GpuError::PageFull`] instead of writing past the page.
    /// Empty data does not advance the cursor.
    pub fn push(&mut self, page: usize, data: &[u8]) -> Result<u64> {
        let units = self.units(data.len() as u64);
        let page_ref = self
            .pages
            .get_mut(page)
            .ok_or_else(|| GpuError::InvalidState(format!("Host buffer page {page} does not exist")))?;

        if units > page_ref.remaining() {
            return Err(GpuError::PageFull {
                page,
                requested: units,
                available: page_ref.remaining(),
            });
        }

        let offset = page_ref.cursor * page_ref.alignment;
        page_ref.buffer.write_bytes(offset, data)?;
        page_ref.cursor += units;
        page_ref.mark_dirty(offset..offset + data.len() as u64);

        Ok(offset)
    }

    pub fn push_pod<T: Pod>(&mut self, page: usize, value: &T) -> Result<u64> {
        self.push(page, bytemuck::bytes_of(value))
    }

    /// Find a page for `data` and append it there.
    pub fn suballocate(&mut self, data: &[u8]) -> Result<Suballocation> {
        let size = data.len() as u64;
        let page = self.find_page(size)?;
        let offset = self.push(page, data)?;
        let page_bytes = self.pages[page].capacity * self.pages[page].alignment;

        Ok(Suballocation {
            page,
            buffer: self.pages[page].buffer(),
            offset,
            size,
            page_range: (page_bytes - offset).min(self.max_page_range),
        })
    }

    pub fn suballocate_pod<T: Pod>(&mut self, value: &T) -> Result<Suballocation> {
        self.suballocate(bytemuck::bytes_of(value))
    }

    /// Rewind every page. Non-coherent pages first invalidate what was
    /// written since the previous reset.
    pub fn reset(&mut self) -> Result<()> {
        for page in &mut self.pages {
            if !page.buffer.coherent && page.cursor > 0 {
                let written = (page.cursor * page.alignment).min(page.buffer.size);
                // SAFETY: the page buffer was created by this device.
                unsafe {
                    self.device
                        .invalidate_mapped_range(&page.buffer, 0, written)?;
                }
            }
            page.cursor = 0;
            page.dirty = None;
        }
        Ok(())
    }

    /// Make this frame's writes visible to the GPU. Call after the last push
    /// and before submission. Coherent pages need nothing.
    pub fn flush(&mut self) -> Result<()> {
        for page in &mut self.pages {
            let Some(dirty) = page.dirty.take() else {
                continue;
            };
            // SAFETY: the page buffer was created by this device.
            let flushed = unsafe {
                self.device
                    .flush_mapped_range(&page.buffer, dirty.start, dirty.end - dirty.start)
            };
            if let Err(e) = flushed {
                page.dirty = Some(dirty);
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Free every page. The GPU must be done with them.
    pub fn destroy(&mut self) -> Result<()> {
        let mut result = Ok(());
        for page in self.pages.drain(..) {
            // SAFETY: pages are not in use per the caller contract.
            let freed = unsafe { self.device.destroy_mapped_buffer(page.buffer) };
            if result.is_ok() {
                result = freed;
            }
        }
        result
    }
}

impl Drop for HostBufferPool {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            tracing::warn!("failed to free host buffer pages: {e}");
        }
    }
}

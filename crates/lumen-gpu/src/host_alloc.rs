//! Host allocation callbacks handed to the Vulkan driver.
//!
//! The driver calls back into a [`HostAllocator`] for its CPU-side
//! allocations. [`HostCallbacks`] owns the allocator and the
//! `vk::AllocationCallbacks` pointing at it.

use ash::vk;
use std::alloc::{self, Layout};
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Strategy for CPU memory requested by the Vulkan driver.
pub trait HostAllocator: Send + Sync {
    /// Allocate `size` bytes aligned to `alignment`. Null on failure.
    fn allocate(&self, size: usize, alignment: usize, scope: vk::SystemAllocationScope)
        -> *mut u8;

    /// Resize an allocation made by this allocator. Null on failure, in which
    /// case the original allocation stays valid.
    fn reallocate(
        &self,
        original: *mut u8,
        size: usize,
        alignment: usize,
        scope: vk::SystemAllocationScope,
    ) -> *mut u8;

    /// Release an allocation made by this allocator. Null is ignored.
    fn free(&self, memory: *mut u8);
}

#[derive(Clone, Copy)]
struct Header {
    size: usize,
    alignment: usize,
}

/// [`HostAllocator`] over the global Rust allocator.
///
/// Each block is preceded by a header recording its size and alignment, which
/// `reallocate` and `free` need but the driver does not pass back.
#[derive(Default)]
pub struct SystemHostAllocator {
    live_bytes: AtomicUsize,
}

impl SystemHostAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently handed out to the driver.
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    fn header_size(alignment: usize) -> usize {
        alignment.max(std::mem::size_of::<Header>())
    }

    fn layout(size: usize, alignment: usize) -> Option<Layout> {
        let total = size.checked_add(Self::header_size(alignment))?;
        Layout::from_size_align(total, alignment).ok()
    }

    /// # Safety
    /// `memory` must come from this allocator and not be freed yet.
    unsafe fn header(memory: *mut u8) -> Header {
        let header_ptr = memory.sub(std::mem::size_of::<Header>()).cast::<Header>();
        header_ptr.read_unaligned()
    }
}

impl HostAllocator for SystemHostAllocator {
    fn allocate(
        &self,
        size: usize,
        alignment: usize,
        _scope: vk::SystemAllocationScope,
    ) -> *mut u8 {
        let alignment = alignment.max(std::mem::align_of::<Header>());
        if size == 0 || !alignment.is_power_of_two() {
            return ptr::null_mut();
        }
        let Some(layout) = Self::layout(size, alignment) else {
            return ptr::null_mut();
        };

        // SAFETY: layout has a non-zero size.
        let base = unsafe { alloc::alloc(layout) };
        if base.is_null() {
            return base;
        }

        // SAFETY: the header fits in the padding in front of the user block.
        unsafe {
            let memory = base.add(Self::header_size(alignment));
            memory
                .sub(std::mem::size_of::<Header>())
                .cast::<Header>()
                .write_unaligned(Header { size, alignment });
            self.live_bytes.fetch_add(size, Ordering::Relaxed);
            memory
        }
    }

    fn reallocate(
        &self,
        original: *mut u8,
        size: usize,
        alignment: usize,
        scope: vk::SystemAllocationScope,
    ) -> *mut u8 {
        if original.is_null() {
            return self.allocate(size, alignment, scope);
        }
        if size == 0 {
            self.free(original);
            return ptr::null_mut();
        }

        let memory = self.allocate(size, alignment, scope);
        if memory.is_null() {
            return memory;
        }

        // SAFETY: original came from this allocator; both blocks hold at least
        // the copied length.
        unsafe {
            let old = Self::header(original);
            ptr::copy_nonoverlapping(original, memory, old.size.min(size));
        }
        self.free(original);
        memory
    }

    fn free(&self, memory: *mut u8) {
        if memory.is_null() {
            return;
        }

        // SAFETY: memory came from `allocate`, so the header precedes it and
        // the layout can be rebuilt from it.
        unsafe {
            let header = Self::header(memory);
            let base = memory.sub(Self::header_size(header.alignment));
            if let Some(layout) = Self::layout(header.size, header.alignment) {
                alloc::dealloc(base, layout);
                self.live_bytes.fetch_sub(header.size, Ordering::Relaxed);
            }
        }
    }
}

unsafe extern "system" fn allocation_trampoline(
    user_data: *mut c_void,
    size: usize,
    alignment: usize,
    scope: vk::SystemAllocationScope,
) -> *mut c_void {
    // SAFETY: user_data points at the Arc owned by HostCallbacks.
    let allocator = unsafe { &*user_data.cast::<Arc<dyn HostAllocator>>() };
    allocator.allocate(size, alignment, scope).cast()
}

unsafe extern "system" fn reallocation_trampoline(
    user_data: *mut c_void,
    original: *mut c_void,
    size: usize,
    alignment: usize,
    scope: vk::SystemAllocationScope,
) -> *mut c_void {
    // SAFETY: user_data points at the Arc owned by HostCallbacks.
    let allocator = unsafe { &*user_data.cast::<Arc<dyn HostAllocator>>() };
    allocator
        .reallocate(original.cast(), size, alignment, scope)
        .cast()
}

unsafe extern "system" fn free_trampoline(user_data: *mut c_void, memory: *mut c_void) {
    // SAFETY: user_data points at the Arc owned by HostCallbacks.
    let allocator = unsafe { &*user_data.cast::<Arc<dyn HostAllocator>>() };
    allocator.free(memory.cast());
}

/// Allocation callbacks bound to a [`HostAllocator`].
pub struct HostCallbacks {
    allocator: Box<Arc<dyn HostAllocator>>,
    callbacks: vk::AllocationCallbacks<'static>,
}

// SAFETY: the callbacks only reference the boxed allocator, which is Send + Sync
// and lives exactly as long as this struct.
unsafe impl Send for HostCallbacks {}
unsafe impl Sync for HostCallbacks {}

impl HostCallbacks {
    pub fn new(allocator: Arc<dyn HostAllocator>) -> Self {
        let allocator = Box::new(allocator);
        let user_data = std::ptr::from_ref::<Arc<dyn HostAllocator>>(&allocator)
            .cast_mut()
            .cast::<c_void>();

        let callbacks = vk::AllocationCallbacks::default()
            .user_data(user_data)
            .pfn_allocation(Some(allocation_trampoline))
            .pfn_reallocation(Some(reallocation_trampoline))
            .pfn_free(Some(free_trampoline));

        Self {
            allocator,
            callbacks,
        }
    }

    /// Callbacks to pass to create and destroy calls.
    pub fn callbacks(&self) -> &vk::AllocationCallbacks<'static> {
        &self.callbacks
    }

    /// The allocator the callbacks route to.
    pub fn allocator(&self) -> &Arc<dyn HostAllocator> {
        &self.allocator
    }
}

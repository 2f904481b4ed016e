//! Command buffer pooling.
//!
//! Mirrors [`QueuePool`](crate::queue_pool::QueuePool): each slot pairs a
//! command pool with one primary command buffer and is claimed with a
//! compare-and-swap. Unlike queues, a family's slot list grows whenever every
//! existing slot is busy, since the number of command buffers in flight is
//! not known up front.

use crate::device::DeviceApi;
use crate::error::{GpuError, Result};
use crate::queue_pool::{select_family, QueueFamily, QueueSelector};
use ash::vk::{self, Handle};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

struct CommandSlot {
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
    in_use: AtomicBool,
    /// Fence of the submission that last executed the buffer. Borrowed from
    /// the queue pool, never destroyed here.
    last_fence: AtomicU64,
}

impl CommandSlot {
    fn claimed(pool: vk::CommandPool, buffer: vk::CommandBuffer) -> Self {
        Self {
            pool,
            buffer,
            in_use: AtomicBool::new(true),
            last_fence: AtomicU64::new(0),
        }
    }

    fn try_claim(&self) -> bool {
        self.in_use
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn unclaim(&self) -> bool {
        self.in_use.swap(false, Ordering::Release)
    }

    fn last_fence(&self) -> vk::Fence {
        vk::Fence::from_raw(self.last_fence.load(Ordering::Acquire))
    }
}

struct FamilyCommandBuffers {
    family: QueueFamily,
    /// Scans share the read lock; only growth takes the write lock.
    slots: RwLock<Vec<CommandSlot>>,
}

/// Exclusive use of one command buffer, returned by
/// [`CommandBufferPool::acquire`].
#[must_use = "acquired command buffers must be released"]
#[derive(Debug)]
pub struct AcquiredCommandBuffer {
    pub command_buffer: vk::CommandBuffer,
    /// Pool owning the buffer. Reset it before re-recording.
    pub command_pool: vk::CommandPool,
    family_index: u32,
    slot_index: usize,
}

impl AcquiredCommandBuffer {
    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    pub fn slot_index(&self) -> usize {
        self.slot_index
    }
}

/// Growable pool of command buffers for every queue family of a device.
pub struct CommandBufferPool {
    device: Arc<dyn DeviceApi>,
    families: Vec<FamilyCommandBuffers>,
}

impl CommandBufferPool {
    /// One empty slot list per family.
    pub fn new(device: Arc<dyn DeviceApi>, families: &[QueueFamily]) -> Self {
        let families = families
            .iter()
            .map(|&family| FamilyCommandBuffers {
                family,
                slots: RwLock::new(Vec::new()),
            })
            .collect();

        Self { device, families }
    }

    fn family_list(&self) -> Vec<QueueFamily> {
        self.families.iter().map(|f| f.family).collect()
    }

    fn family_buffers(&self, index: u32) -> Result<&FamilyCommandBuffers> {
        self.families
            .iter()
            .find(|f| f.family.index() == index)
            .ok_or(GpuError::UnknownQueueFamily(index))
    }

    /// Take a command buffer of the selected family.
    ///
    /// Existing slots are scanned with the same protocol as queues; when none
    /// can be taken a new command pool and buffer are created and appended.
    /// Never blocks on the GPU.
    pub fn acquire(
        &self,
        selector: QueueSelector,
        ignore_fence_status: bool,
    ) -> Result<AcquiredCommandBuffer> {
        let family = select_family(&self.family_list(), selector)?;
        let buffers = self.family_buffers(family.index())?;

        {
            let slots = buffers.slots.read();
            for (index, slot) in slots.iter().enumerate() {
                if !slot.try_claim() {
                    continue;
                }

                let fence = slot.last_fence();
                if fence != vk::Fence::null() {
                    // SAFETY: fences handed to release belong to this device.
                    match unsafe { self.device.fence_signaled(fence) } {
                        Ok(signaled) if signaled || ignore_fence_status => {}
                        Ok(_) => {
                            slot.unclaim();
                            continue;
                        }
                        Err(e) => {
                            slot.unclaim();
                            return Err(e.into());
                        }
                    }
                }

                return Ok(AcquiredCommandBuffer {
                    command_buffer: slot.buffer,
                    command_pool: slot.pool,
                    family_index: family.index(),
                    slot_index: index,
                });
            }
        }

        self.grow(family.index(), buffers)
    }

    fn grow(&self, family: u32, buffers: &FamilyCommandBuffers) -> Result<AcquiredCommandBuffer> {
        // SAFETY: the family exists on this device; the new pool is only
        // visible to this call until it is pushed.
        let (pool, buffer) = unsafe {
            let pool = self.device.create_command_pool(family)?;
            match self.device.allocate_command_buffer(pool) {
                Ok(buffer) => (pool, buffer),
                Err(e) => {
                    self.device.destroy_command_pool(pool);
                    return Err(e.into());
                }
            }
        };

        let mut slots = buffers.slots.write();
        slots.push(CommandSlot::claimed(pool, buffer));
        let slot_index = slots.len() - 1;
        tracing::debug!(family, slots = slots.len(), "command buffer pool grew");

        Ok(AcquiredCommandBuffer {
            command_buffer: buffer,
            command_pool: pool,
            family_index: family,
            slot_index,
        })
    }

    /// Return a command buffer, recording the fence of the submission that
    /// executed it (null if it was never submitted).
    pub fn release(&self, ticket: AcquiredCommandBuffer, fence: vk::Fence) {
        let Ok(buffers) = self.family_buffers(ticket.family_index) else {
            debug_assert!(false, "released a command buffer this pool never handed out");
            return;
        };
        let slots = buffers.slots.read();
        let Some(slot) = slots.get(ticket.slot_index) else {
            debug_assert!(false, "released a command buffer this pool never handed out");
            return;
        };

        slot.last_fence.store(fence.as_raw(), Ordering::Release);
        let was_in_use = slot.unclaim();
        debug_assert!(was_in_use, "released a command buffer that was not acquired");
    }

    /// Number of slots created for a family so far.
    pub fn slot_count(&self, family: u32) -> usize {
        self.family_buffers(family)
            .map_or(0, |f| f.slots.read().len())
    }

    /// Number of slots currently held, for diagnostics.
    pub fn in_use_count(&self, family: u32) -> usize {
        self.family_buffers(family).map_or(0, |f| {
            f.slots
                .read()
                .iter()
                .filter(|slot| slot.in_use.load(Ordering::Relaxed))
                .count()
        })
    }

    /// Destroy every command pool. The device must be idle. Safe to call
    /// more than once.
    pub fn destroy(&mut self) {
        for family in &self.families {
            for slot in family.slots.write().drain(..) {
                // SAFETY: the device is idle, so no buffer is pending.
                unsafe { self.device.destroy_command_pool(slot.pool) };
            }
        }
    }
}

impl Drop for CommandBufferPool {
    fn drop(&mut self) {
        self.destroy();
    }
}

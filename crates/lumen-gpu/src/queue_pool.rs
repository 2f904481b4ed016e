//! Hardware queue pooling.
//!
//! Every queue instance of every family gets a slot guarded by an atomic
//! in-use flag. Acquisition is a compare-and-swap per slot followed by a
//! fence check and never blocks; "nothing free right now" is reported as
//! [`GpuError::Unavailable`] so the caller can pick its own retry strategy.

use crate::device::DeviceApi;
use crate::error::{GpuError, Result};
use ash::vk::{self, Handle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// A hardware queue family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamily {
    index: u32,
    flags: vk::QueueFlags,
    queue_count: u32,
}

impl QueueFamily {
    /// Describe a family. `TRANSFER` is added whenever `GRAPHICS` or
    /// `COMPUTE` is present, as the hardware implies it.
    pub fn new(index: u32, flags: vk::QueueFlags, queue_count: u32) -> Self {
        Self {
            index,
            flags: normalize_flags(flags),
            queue_count,
        }
    }

    /// Build the family list from enumerated properties, enabling at most
    /// `max_queues` queues per family.
    pub fn from_properties(properties: &[vk::QueueFamilyProperties], max_queues: u32) -> Vec<Self> {
        properties
            .iter()
            .enumerate()
            .map(|(index, props)| {
                Self::new(
                    index as u32,
                    props.queue_flags,
                    props.queue_count.min(max_queues.max(1)),
                )
            })
            .collect()
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn flags(&self) -> vk::QueueFlags {
        self.flags
    }

    pub fn queue_count(&self) -> u32 {
        self.queue_count
    }

    /// Whether the family offers every requested capability.
    pub fn supports(&self, flags: vk::QueueFlags) -> bool {
        self.flags.contains(normalize_flags(flags))
    }
}

fn normalize_flags(flags: vk::QueueFlags) -> vk::QueueFlags {
    if flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE) {
        flags | vk::QueueFlags::TRANSFER
    } else {
        flags
    }
}

/// How to pick the queue family for an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSelector {
    /// A specific family index.
    Family(u32),
    /// The first family whose flags equal `required`; unless `exact`, fall
    /// back to the first family offering a superset.
    Flags { required: vk::QueueFlags, exact: bool },
}

impl QueueSelector {
    /// Any family that can record graphics work.
    pub fn graphics() -> Self {
        Self::Flags {
            required: vk::QueueFlags::GRAPHICS,
            exact: false,
        }
    }

    /// Prefer a dedicated compute family.
    pub fn compute() -> Self {
        Self::Flags {
            required: vk::QueueFlags::COMPUTE,
            exact: false,
        }
    }

    /// Prefer a dedicated transfer family.
    pub fn transfer() -> Self {
        Self::Flags {
            required: vk::QueueFlags::TRANSFER,
            exact: false,
        }
    }
}

/// Resolve a selector against a family list.
pub fn select_family(families: &[QueueFamily], selector: QueueSelector) -> Result<QueueFamily> {
    match selector {
        QueueSelector::Family(index) => families
            .iter()
            .find(|family| family.index == index)
            .copied()
            .ok_or(GpuError::UnknownQueueFamily(index)),
        QueueSelector::Flags { required, exact } => {
            let required = normalize_flags(required);
            let exact_match = families.iter().find(|family| family.flags == required);
            let fallback = || {
                if exact {
                    None
                } else {
                    families.iter().find(|family| family.flags.contains(required))
                }
            };
            exact_match
                .or_else(fallback)
                .copied()
                .ok_or(GpuError::NoMatchingQueueFamily(required))
        }
    }
}

struct QueueSlot {
    queue: AtomicU64,
    fence: AtomicU64,
    in_use: AtomicBool,
}

impl QueueSlot {
    fn new() -> Self {
        Self {
            queue: AtomicU64::new(0),
            fence: AtomicU64::new(0),
            in_use: AtomicBool::new(false),
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

    /// Create the queue handle and fence on first use.
    ///
    /// # Safety
    /// The caller must hold the claim on this slot.
    unsafe fn prepare(
        &self,
        device: &dyn DeviceApi,
        family: u32,
        index: u32,
    ) -> Result<(vk::Queue, vk::Fence)> {
        let mut queue = vk::Queue::from_raw(self.queue.load(Ordering::Acquire));
        if queue == vk::Queue::null() {
            queue = device.get_queue(family, index);
            self.queue.store(queue.as_raw(), Ordering::Release);
        }

        let mut fence = vk::Fence::from_raw(self.fence.load(Ordering::Acquire));
        if fence == vk::Fence::null() {
            fence = device.create_fence(true)?;
            self.fence.store(fence.as_raw(), Ordering::Release);
            tracing::trace!(family, index, "created queue fence");
        }

        Ok((queue, fence))
    }
}

struct FamilyQueues {
    family: QueueFamily,
    slots: Box<[QueueSlot]>,
}

/// Exclusive use of one queue, returned by [`QueuePool::acquire`].
///
/// Hand it back with [`QueuePool::release`].
#[must_use = "acquired queues must be released"]
#[derive(Debug)]
pub struct AcquiredQueue {
    pub queue: vk::Queue,
    /// Completion fence of this queue slot. Signaled when the last
    /// submission made with it has finished.
    pub fence: vk::Fence,
    family_index: u32,
    queue_index: u32,
}

impl AcquiredQueue {
    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    pub fn queue_index(&self) -> u32 {
        self.queue_index
    }
}

/// Pool of every hardware queue of a device.
pub struct QueuePool {
    device: Arc<dyn DeviceApi>,
    families: Vec<FamilyQueues>,
}

impl QueuePool {
    /// One slot per enabled queue of each family. No native handle is
    /// created until the slot is first acquired.
    pub fn new(device: Arc<dyn DeviceApi>, families: &[QueueFamily]) -> Self {
        let families = families
            .iter()
            .map(|&family| FamilyQueues {
                family,
                slots: (0..family.queue_count).map(|_| QueueSlot::new()).collect(),
            })
            .collect();

        Self { device, families }
    }

    /// Every family, in enumeration order.
    pub fn families(&self) -> impl Iterator<Item = QueueFamily> + '_ {
        self.families.iter().map(|f| f.family)
    }

    /// Look up a family by index.
    pub fn family(&self, index: u32) -> Option<QueueFamily> {
        self.families
            .iter()
            .find(|f| f.family.index == index)
            .map(|f| f.family)
    }

    /// Resolve a selector against this pool's families.
    pub fn find_family(&self, selector: QueueSelector) -> Result<QueueFamily> {
        let families: Vec<QueueFamily> = self.families().collect();
        select_family(&families, selector)
    }

    fn family_queues(&self, index: u32) -> Result<&FamilyQueues> {
        self.families
            .iter()
            .find(|f| f.family.index == index)
            .ok_or(GpuError::UnknownQueueFamily(index))
    }

    /// Try to take a queue of the selected family.
    ///
    /// Slots whose fence is still pending are skipped unless
    /// `ignore_fence_status` is set, in which case the caller takes over
    /// ordering (typically by waiting on [`AcquiredQueue::fence`]).
    /// Returns [`GpuError::Unavailable`] when no slot could be taken.
    pub fn acquire(
        &self,
        selector: QueueSelector,
        ignore_fence_status: bool,
    ) -> Result<AcquiredQueue> {
        let family = self.find_family(selector)?;
        let queues = self.family_queues(family.index)?;

        for (index, slot) in queues.slots.iter().enumerate() {
            if !slot.try_claim() {
                continue;
            }

            let index = index as u32;
            // SAFETY: the slot is claimed by this call.
            let prepared = unsafe { slot.prepare(self.device.as_ref(), family.index, index) };
            let (queue, fence) = match prepared {
                Ok(handles) => handles,
                Err(e) => {
                    slot.unclaim();
                    return Err(e);
                }
            };

            // SAFETY: the fence was created by this device.
            match unsafe { self.device.fence_signaled(fence) } {
                Ok(signaled) if signaled || ignore_fence_status => {
                    return Ok(AcquiredQueue {
                        queue,
                        fence,
                        family_index: family.index,
                        queue_index: index,
                    });
                }
                Ok(_) => {
                    slot.unclaim();
                }
                Err(e) => {
                    slot.unclaim();
                    return Err(e.into());
                }
            }
        }

        Err(GpuError::Unavailable)
    }

    /// Return a queue to the pool.
    pub fn release(&self, ticket: AcquiredQueue) {
        let Some(slot) = self
            .family_queues(ticket.family_index)
            .ok()
            .and_then(|f| f.slots.get(ticket.queue_index as usize))
        else {
            debug_assert!(false, "released a queue this pool never handed out");
            return;
        };

        let was_in_use = slot.unclaim();
        debug_assert!(was_in_use, "released a queue that was not acquired");
    }

    /// Number of slots currently held, for diagnostics.
    pub fn in_use_count(&self, family: u32) -> usize {
        self.family_queues(family).map_or(0, |f| {
            f.slots
                .iter()
                .filter(|slot| slot.in_use.load(Ordering::Relaxed))
                .count()
        })
    }

    /// Wait for and destroy every fence. Safe to call more than once.
    pub fn destroy(&mut self) {
        for family in &self.families {
            for slot in family.slots.iter() {
                let fence = vk::Fence::from_raw(slot.fence.swap(0, Ordering::AcqRel));
                if fence == vk::Fence::null() {
                    continue;
                }
                // SAFETY: the fence belongs to this device and nothing can
                // acquire the pool while it is mutably borrowed.
                unsafe {
                    if let Err(e) = self.device.wait_for_fence(fence, u64::MAX) {
                        tracing::warn!("queue fence wait failed during teardown: {e}");
                    }
                    self.device.destroy_fence(fence);
                }
            }
        }
    }
}

impl Drop for QueuePool {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, MockOp};
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn families() -> Vec<QueueFamily> {
        vec![
            QueueFamily::new(
                0,
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
                2,
            ),
            QueueFamily::new(1, vk::QueueFlags::COMPUTE, 1),
            QueueFamily::new(2, vk::QueueFlags::TRANSFER, 1),
        ]
    }

    fn pool(mock: &Arc<MockDevice>) -> QueuePool {
        QueuePool::new(mock.clone(), &families())
    }

    #[test]
    fn transfer_is_implied_by_graphics_and_compute() {
        let family = QueueFamily::new(0, vk::QueueFlags::GRAPHICS, 1);
        assert!(family.flags().contains(vk::QueueFlags::TRANSFER));
        let family = QueueFamily::new(0, vk::QueueFlags::COMPUTE, 1);
        assert!(family.flags().contains(vk::QueueFlags::TRANSFER));
        let family = QueueFamily::new(0, vk::QueueFlags::SPARSE_BINDING, 1);
        assert!(!family.flags().contains(vk::QueueFlags::TRANSFER));
    }

    #[test]
    fn from_properties_caps_queue_count() {
        let props = [vk::QueueFamilyProperties::default()
            .queue_flags(vk::QueueFlags::GRAPHICS)
            .queue_count(16)];
        let families = QueueFamily::from_properties(&props, 4);
        assert_eq!(families[0].queue_count(), 4);
    }

    #[test]
    fn family_selection_prefers_exact_match() {
        let families = families();
        let compute = select_family(&families, QueueSelector::compute()).unwrap();
        assert_eq!(compute.index(), 1);
        let transfer = select_family(&families, QueueSelector::transfer()).unwrap();
        assert_eq!(transfer.index(), 2);
        let graphics = select_family(&families, QueueSelector::graphics()).unwrap();
        assert_eq!(graphics.index(), 0);
    }

    #[test]
    fn family_selection_falls_back_to_superset() {
        let families = vec![QueueFamily::new(
            0,
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
            1,
        )];
        let selected = select_family(&families, QueueSelector::transfer()).unwrap();
        assert_eq!(selected.index(), 0);

        let exact = QueueSelector::Flags {
            required: vk::QueueFlags::TRANSFER,
            exact: true,
        };
        assert!(matches!(
            select_family(&families, exact),
            Err(GpuError::NoMatchingQueueFamily(_))
        ));
        assert!(matches!(
            select_family(&families, QueueSelector::Family(7)),
            Err(GpuError::UnknownQueueFamily(7))
        ));
    }

    #[test]
    fn queues_and_fences_are_created_lazily() {
        let mock = Arc::new(MockDevice::new());
        let pool = pool(&mock);
        assert_eq!(mock.calls().fences_created, 0);

        let ticket = pool.acquire(QueueSelector::Family(0), false).unwrap();
        assert_ne!(ticket.queue, vk::Queue::null());
        assert_eq!(mock.calls().fences_created, 1);
        pool.release(ticket);

        let ticket = pool.acquire(QueueSelector::Family(0), false).unwrap();
        assert_eq!(ticket.queue_index(), 0);
        assert_eq!(mock.calls().fences_created, 1, "fence is reused");
        pool.release(ticket);
    }

    #[test]
    fn exhausted_family_reports_unavailable() {
        let mock = Arc::new(MockDevice::new());
        let pool = pool(&mock);

        let a = pool.acquire(QueueSelector::Family(0), false).unwrap();
        let b = pool.acquire(QueueSelector::Family(0), false).unwrap();
        assert_ne!(a.queue_index(), b.queue_index());

        let err = pool.acquire(QueueSelector::Family(0), true).unwrap_err();
        assert!(err.is_transient());

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.in_use_count(0), 0);
    }

    #[test]
    fn pending_fence_is_skipped_unless_ignored() {
        let mock = Arc::new(MockDevice::new());
        let pool = pool(&mock);

        let ticket = pool.acquire(QueueSelector::Family(1), false).unwrap();
        mock.set_fence_signaled(ticket.fence, false);
        pool.release(ticket);

        assert!(matches!(
            pool.acquire(QueueSelector::Family(1), false),
            Err(GpuError::Unavailable)
        ));
        assert_eq!(pool.in_use_count(1), 0, "skipped slot is handed back");

        let ticket = pool.acquire(QueueSelector::Family(1), true).unwrap();
        assert_eq!(ticket.queue_index(), 0);
        pool.release(ticket);
    }

    #[test]
    fn hardware_errors_propagate() {
        let mock = Arc::new(MockDevice::new());
        let pool = pool(&mock);

        mock.fail(MockOp::CreateFence, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let err = pool.acquire(QueueSelector::Family(2), false).unwrap_err();
        assert_eq!(err.as_vk_result(), vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert_eq!(pool.in_use_count(2), 0);

        mock.clear_failures();
        let ticket = pool.acquire(QueueSelector::Family(2), false).unwrap();
        mock.fail(MockOp::FenceStatus, vk::Result::ERROR_DEVICE_LOST);
        pool.release(ticket);
        let err = pool.acquire(QueueSelector::Family(2), false).unwrap_err();
        assert_eq!(err.as_vk_result(), vk::Result::ERROR_DEVICE_LOST);
    }

    #[test]
    fn concurrent_acquisitions_never_share_a_slot() {
        let mock = Arc::new(MockDevice::new());
        let pool = Arc::new(pool(&mock));
        let owned = Arc::new(Mutex::new(HashSet::new()));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let owned = owned.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let Ok(ticket) = pool.acquire(QueueSelector::Family(0), true) else {
                            std::thread::yield_now();
                            continue;
                        };
                        let key = (ticket.family_index(), ticket.queue_index());
                        assert!(owned.lock().unwrap().insert(key), "slot handed out twice");
                        std::thread::yield_now();
                        assert!(owned.lock().unwrap().remove(&key));
                        pool.release(ticket);
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(pool.in_use_count(0), 0);
    }

    #[test]
    fn destroy_waits_and_destroys_fences() {
        let mock = Arc::new(MockDevice::new());
        let mut pool = pool(&mock);
        let a = pool.acquire(QueueSelector::Family(0), false).unwrap();
        let b = pool.acquire(QueueSelector::Family(2), false).unwrap();
        pool.release(a);
        pool.release(b);

        pool.destroy();
        pool.destroy();
        assert_eq!(mock.calls().fences_destroyed, 2);
    }
}

//! One-time command submission.
//!
//! Composes the queue and command buffer pools into "record this, submit it,
//! optionally wait". Used for uploads and other work outside the frame loop.

use crate::command_pool::CommandBufferPool;
use crate::device::{DeviceApi, SubmitBatch};
use crate::error::{GpuError, Result};
use crate::queue_pool::{AcquiredQueue, QueuePool, QueueSelector};
use crate::sync::wait_for_fence;
use ash::vk;
use crossbeam::utils::Backoff;
use std::time::{Duration, Instant};

/// Default bound on waiting for a free queue.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(16);
/// Default bound on waiting for the queue's previous submission.
pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_secs(1);

/// Sleep once spinning and yielding have not produced a queue.
const ACQUIRE_SLEEP: Duration = Duration::from_micros(100);

/// Options for [`submit_one_time`].
#[derive(Debug, Clone, Copy)]
pub struct OneTimeSubmit<'a> {
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
    /// Block until the submitted work has finished.
    pub await_completion: bool,
    pub acquire_timeout: Duration,
    /// `None` waits forever.
    pub fence_timeout: Option<Duration>,
    /// `None` waits forever.
    pub completion_timeout: Option<Duration>,
}

impl Default for OneTimeSubmit<'_> {
    fn default() -> Self {
        Self {
            wait_semaphores: &[],
            wait_stages: &[],
            signal_semaphores: &[],
            await_completion: false,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            fence_timeout: Some(DEFAULT_FENCE_TIMEOUT),
            completion_timeout: None,
        }
    }
}

impl<'a> OneTimeSubmit<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait on `semaphores` at the matching `stages` before executing.
    pub fn with_wait_semaphores(
        mut self,
        semaphores: &'a [vk::Semaphore],
        stages: &'a [vk::PipelineStageFlags],
    ) -> Self {
        self.wait_semaphores = semaphores;
        self.wait_stages = stages;
        self
    }

    pub fn with_signal_semaphores(mut self, semaphores: &'a [vk::Semaphore]) -> Self {
        self.signal_semaphores = semaphores;
        self
    }

    pub fn with_await_completion(mut self, await_completion: bool) -> Self {
        self.await_completion = await_completion;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_fence_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.fence_timeout = timeout;
        self
    }

    pub fn with_completion_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.completion_timeout = timeout;
        self
    }
}

/// Steps of a one-time submission, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStage {
    AcquireCommandBuffer,
    ResetCommandPool,
    Begin,
    Record,
    End,
    AcquireQueue,
    FenceWait,
    FenceReset,
    Submit,
    CompletionWait,
}

/// Per-stage outcome of [`submit_one_time`]. `None` means the stage was not
/// reached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OneTimeSubmitResult {
    pub acquire_command_buffer: Option<vk::Result>,
    pub reset_command_pool: Option<vk::Result>,
    pub begin: Option<vk::Result>,
    /// What the recording callback returned.
    pub recorded: bool,
    pub end: Option<vk::Result>,
    pub acquire_queue: Option<vk::Result>,
    pub fence_wait: Option<vk::Result>,
    pub fence_reset: Option<vk::Result>,
    pub submit: Option<vk::Result>,
    pub completion_wait: Option<vk::Result>,
    pub awaited: bool,
    pub family_index: Option<u32>,
    pub queue_index: Option<u32>,
}

impl OneTimeSubmitResult {
    fn stages(&self) -> [(SubmitStage, Option<vk::Result>); 9] {
        [
            (SubmitStage::AcquireCommandBuffer, self.acquire_command_buffer),
            (SubmitStage::ResetCommandPool, self.reset_command_pool),
            (SubmitStage::Begin, self.begin),
            (SubmitStage::End, self.end),
            (SubmitStage::AcquireQueue, self.acquire_queue),
            (SubmitStage::FenceWait, self.fence_wait),
            (SubmitStage::FenceReset, self.fence_reset),
            (SubmitStage::Submit, self.submit),
            (SubmitStage::CompletionWait, self.completion_wait),
        ]
    }

    /// Every stage ran and returned success, the callback recorded, and the
    /// queue identifiers are known.
    pub fn succeeded(&self) -> bool {
        let required_ok = self
            .stages()
            .iter()
            .filter(|(stage, _)| *stage != SubmitStage::CompletionWait || self.awaited)
            .all(|(_, result)| *result == Some(vk::Result::SUCCESS));

        required_ok
            && self.recorded
            && self.family_index.is_some()
            && self.queue_index.is_some()
    }

    /// First stage that returned an error. A declined recording is reported
    /// as [`SubmitStage::Record`] with `INCOMPLETE`.
    pub fn first_failure(&self) -> Option<(SubmitStage, vk::Result)> {
        let failed = self.stages().into_iter().find_map(|(stage, result)| match result {
            Some(code) if code != vk::Result::SUCCESS => Some((stage, code)),
            _ => None,
        });

        failed.or_else(|| {
            (self.end == Some(vk::Result::SUCCESS) && !self.recorded)
                .then_some((SubmitStage::Record, vk::Result::INCOMPLETE))
        })
    }

    /// `Ok(self)` on success, otherwise the first failure as an error.
    pub fn into_result(self) -> Result<Self> {
        if self.succeeded() {
            return Ok(self);
        }

        Err(match self.first_failure() {
            Some((SubmitStage::Record, _)) => {
                GpuError::Other("Recording callback declined the submission".to_string())
            }
            Some((_, vk::Result::TIMEOUT)) => GpuError::Timeout,
            Some((_, vk::Result::NOT_READY)) => GpuError::Unavailable,
            Some((_, code)) => GpuError::Vulkan(code),
            None => GpuError::InvalidState("One-time submission did not complete".to_string()),
        })
    }
}

fn code<T>(result: &Result<T>) -> vk::Result {
    match result {
        Ok(_) => vk::Result::SUCCESS,
        Err(e) => e.as_vk_result(),
    }
}

/// Acquire a queue of `family`, escalating to ignoring the fence status after
/// the first miss and backing off between attempts until `timeout` expires.
/// `None` keeps retrying until a queue is released.
fn acquire_queue(
    queues: &QueuePool,
    family: u32,
    timeout: Option<Duration>,
) -> Result<AcquiredQueue> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let backoff = Backoff::new();
    let mut ignore_fence_status = false;

    loop {
        match queues.acquire(QueueSelector::Family(family), ignore_fence_status) {
            Ok(ticket) => return Ok(ticket),
            Err(e) if e.is_transient() => {}
            Err(e) => return Err(e),
        }

        ignore_fence_status = true;
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(GpuError::Timeout);
        }
        if backoff.is_completed() {
            std::thread::sleep(ACQUIRE_SLEEP);
        } else {
            backoff.snooze();
        }
    }
}

/// Record and submit a command buffer on a queue of the selected family.
///
/// `record` returns whether it populated the buffer; `false` skips the
/// submission but the buffer is still ended and returned. Both tickets are
/// released before returning, the command buffer tagged with the queue's
/// fence when it was submitted.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub fn submit_one_time<F>(
    queues: &QueuePool,
    commands: &CommandBufferPool,
    device: &dyn DeviceApi,
    selector: QueueSelector,
    options: &OneTimeSubmit<'_>,
    record: F,
) -> OneTimeSubmitResult
where
    F: FnOnce(vk::CommandBuffer) -> bool,
{
    let mut result = OneTimeSubmitResult {
        awaited: options.await_completion,
        ..Default::default()
    };

    let acquired = commands.acquire(selector, false);
    result.acquire_command_buffer = Some(code(&acquired));
    let Ok(command) = acquired else {
        return result;
    };
    let family = command.family_index();
    result.family_index = Some(family);

    // SAFETY: the ticket gives exclusive use of the pool and buffer, and the
    // pool only hands out buffers whose last submission has completed.
    let reset = unsafe { device.reset_command_pool(command.command_pool) };
    result.reset_command_pool = Some(code(&reset.map_err(GpuError::from)));
    if reset.is_err() {
        commands.release(command, vk::Fence::null());
        return result;
    }

    // SAFETY: the buffer was just reset to the initial state.
    let begun = unsafe {
        device.begin_command_buffer(
            command.command_buffer,
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        )
    };
    result.begin = Some(code(&begun.map_err(GpuError::from)));
    if begun.is_err() {
        commands.release(command, vk::Fence::null());
        return result;
    }

    result.recorded = record(command.command_buffer);

    // SAFETY: the buffer is recording.
    let ended = unsafe { device.end_command_buffer(command.command_buffer) };
    result.end = Some(code(&ended.map_err(GpuError::from)));
    if ended.is_err() || !result.recorded {
        commands.release(command, vk::Fence::null());
        return result;
    }

    let acquired = acquire_queue(queues, family, Some(options.acquire_timeout));
    result.acquire_queue = Some(code(&acquired));
    let queue = match acquired {
        Ok(queue) => queue,
        Err(e) => {
            tracing::debug!(family, "no queue for one-time submission: {e}");
            commands.release(command, vk::Fence::null());
            return result;
        }
    };
    result.queue_index = Some(queue.queue_index());

    let submitted = submit(device, &queue, command.command_buffer, options, &mut result);
    commands.release(
        command,
        if submitted { queue.fence } else { vk::Fence::null() },
    );
    queues.release(queue);

    result
}

/// Steps that need the queue: wait for its previous work, submit, and
/// optionally wait again. Returns whether the command buffer was submitted.
fn submit(
    device: &dyn DeviceApi,
    queue: &AcquiredQueue,
    command_buffer: vk::CommandBuffer,
    options: &OneTimeSubmit<'_>,
    result: &mut OneTimeSubmitResult,
) -> bool {
    // SAFETY: the fence belongs to the acquired queue slot.
    let waited = unsafe { wait_for_fence(device, queue.fence, options.fence_timeout) };
    result.fence_wait = Some(code(&waited));
    if waited.is_err() {
        return false;
    }

    // SAFETY: the fence is signaled, so no submission references it.
    let reset = unsafe { device.reset_fence(queue.fence) };
    result.fence_reset = Some(code(&reset.map_err(GpuError::from)));
    if reset.is_err() {
        return false;
    }

    let command_buffers = [command_buffer];
    let batch = SubmitBatch {
        command_buffers: &command_buffers,
        wait_semaphores: options.wait_semaphores,
        wait_stages: options.wait_stages,
        signal_semaphores: options.signal_semaphores,
    };
    // SAFETY: the ticket gives exclusive use of the queue and the fence was
    // reset above.
    let submitted = unsafe { device.queue_submit(queue.queue, &batch, queue.fence) };
    result.submit = Some(code(&submitted.map_err(GpuError::from)));
    if let Err(e) = submitted {
        // An empty submission signals the fence again so the slot does not
        // stay pending forever.
        // SAFETY: same queue and fence as above; nothing references the fence.
        if let Err(recovery) =
            unsafe { device.queue_submit(queue.queue, &SubmitBatch::default(), queue.fence) }
        {
            tracing::warn!("queue fence left unsignaled after failed submit ({e}): {recovery}");
        }
        return false;
    }

    if options.await_completion {
        // SAFETY: the fence was just submitted with the work.
        let completed =
            unsafe { wait_for_fence(device, queue.fence, options.completion_timeout) };
        result.completion_wait = Some(code(&completed));
    }

    true
}

/// Outcome of [`submit_frame`] for a frame slot that is still usable.
#[derive(Debug)]
pub enum FrameOutcome<R> {
    /// The batch was submitted and `present` ran on its queue.
    Presented(R),
    /// The batch was dropped. An empty batch consumed its wait semaphores and
    /// signaled the fence instead.
    Recovered(GpuError),
}

/// Submit a frame's batch signaling `fence`, then run `present` on the same
/// queue before releasing it.
///
/// Queue acquisition retries until a queue of `family` is free. When the
/// batch is rejected the slot goes through [`recover_frame`]. An `Err` means
/// the recovery failed too: the wait semaphores may still be pending and
/// `fence` may never signal, so the slot must not be reused.
///
/// # Safety
/// `fence` must be signaled or unused by any pending submission, and the
/// batch's objects must belong to `device`.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn submit_frame<R, P>(
    queues: &QueuePool,
    device: &dyn DeviceApi,
    family: u32,
    batch: &SubmitBatch<'_>,
    fence: vk::Fence,
    present: P,
) -> Result<FrameOutcome<R>>
where
    P: FnOnce(vk::Queue) -> R,
{
    let queue = acquire_queue(queues, family, None)?;

    // SAFETY: the ticket gives exclusive use of the queue; the caller
    // guarantees no pending submission references the fence.
    let submitted = unsafe {
        device
            .reset_fence(fence)
            .and_then(|()| device.queue_submit(queue.queue, batch, fence))
    };
    let outcome = match submitted {
        Ok(()) => Ok(FrameOutcome::Presented(present(queue.queue))),
        Err(e) => {
            tracing::warn!(family, "frame submission failed: {e}");
            // SAFETY: the batch never reached the queue, so the fence is free.
            unsafe { resignal(device, queue.queue, batch.wait_semaphores, fence) }
                .map(|()| FrameOutcome::Recovered(GpuError::from(e)))
        }
    };
    queues.release(queue);

    outcome
}

/// Consume `wait_semaphores` with an empty batch that signals `fence`, for a
/// frame whose work never reached a queue. `Err` leaves the slot unusable.
///
/// # Safety
/// Same contract as [`submit_frame`].
pub unsafe fn recover_frame(
    queues: &QueuePool,
    device: &dyn DeviceApi,
    family: u32,
    wait_semaphores: &[vk::Semaphore],
    fence: vk::Fence,
) -> Result<()> {
    let queue = acquire_queue(queues, family, None)?;
    // SAFETY: exclusive queue use through the ticket; fence per the caller.
    let recovered = unsafe { resignal(device, queue.queue, wait_semaphores, fence) };
    queues.release(queue);
    recovered
}

unsafe fn resignal(
    device: &dyn DeviceApi,
    queue: vk::Queue,
    wait_semaphores: &[vk::Semaphore],
    fence: vk::Fence,
) -> Result<()> {
    let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; wait_semaphores.len()];
    let batch = SubmitBatch {
        wait_semaphores,
        wait_stages: &wait_stages,
        ..Default::default()
    };

    // SAFETY: forwarded from the callers' contracts.
    unsafe {
        // A fence left signaled by the previous frame has to be reset first.
        if device.fence_signaled(fence)? {
            device.reset_fence(fence)?;
        }
        device.queue_submit(queue, &batch, fence)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, MockOp};
    use crate::queue_pool::QueueFamily;
    use std::sync::Arc;

    struct Pools {
        mock: Arc<MockDevice>,
        queues: QueuePool,
        commands: CommandBufferPool,
    }

    fn pools(mock: MockDevice) -> Pools {
        let mock = Arc::new(mock);
        let families = [
            QueueFamily::new(0, vk::QueueFlags::GRAPHICS, 1),
            QueueFamily::new(1, vk::QueueFlags::TRANSFER, 1),
        ];
        Pools {
            queues: QueuePool::new(mock.clone(), &families),
            commands: CommandBufferPool::new(mock.clone(), &families),
            mock,
        }
    }

    impl Pools {
        fn submit<F>(&self, options: &OneTimeSubmit<'_>, record: F) -> OneTimeSubmitResult
        where
            F: FnOnce(vk::CommandBuffer) -> bool,
        {
            submit_one_time(
                &self.queues,
                &self.commands,
                self.mock.as_ref(),
                QueueSelector::transfer(),
                options,
                record,
            )
        }
    }

    #[test]
    fn end_to_end_submission_succeeds() {
        let pools = pools(MockDevice::new());
        let options = OneTimeSubmit::new().with_await_completion(true);

        let result = pools.submit(&options, |_| true);
        assert!(result.succeeded(), "{result:?}");
        assert_eq!(result.family_index, Some(1));
        assert_eq!(result.queue_index, Some(0));
        assert_eq!(result.completion_wait, Some(vk::Result::SUCCESS));
        assert_eq!(result.first_failure(), None);

        let calls = pools.mock.calls();
        assert_eq!(calls.submits, 1);
        assert_eq!(calls.command_pool_resets, 1);
        assert_eq!(calls.begin_flags, vec![vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT]);
        assert_eq!(pools.queues.in_use_count(1), 0);
        assert_eq!(pools.commands.in_use_count(1), 0);

        let again = pools.submit(&options, |_| true).into_result().unwrap();
        assert!(again.succeeded());
        assert_eq!(pools.commands.slot_count(1), 1, "command buffer is reused");
    }

    #[test]
    fn semaphores_are_forwarded() {
        use ash::vk::Handle;

        let pools = pools(MockDevice::new());
        let waits = [vk::Semaphore::from_raw(1), vk::Semaphore::from_raw(2)];
        let stages = [vk::PipelineStageFlags::TRANSFER; 2];
        let signals = [vk::Semaphore::from_raw(3)];
        let options = OneTimeSubmit::new()
            .with_wait_semaphores(&waits, &stages)
            .with_signal_semaphores(&signals);

        assert!(!options.await_completion);
        let result = pools.submit(&options, |_| true);
        assert!(result.succeeded());
        assert_eq!(result.completion_wait, None);

        let calls = pools.mock.calls();
        assert_eq!(calls.submitted_wait_semaphores, 2);
        assert_eq!(calls.submitted_signal_semaphores, 1);
    }

    #[test]
    fn declined_recording_skips_submission() {
        let pools = pools(MockDevice::new());

        let result = pools.submit(&OneTimeSubmit::new(), |_| false);
        assert!(!result.recorded);
        assert_eq!(result.end, Some(vk::Result::SUCCESS));
        assert_eq!(result.acquire_queue, None);
        assert!(!result.succeeded());
        assert_eq!(
            result.first_failure(),
            Some((SubmitStage::Record, vk::Result::INCOMPLETE))
        );
        assert!(matches!(result.into_result(), Err(GpuError::Other(_))));

        let calls = pools.mock.calls();
        assert_eq!(calls.command_buffers_ended, 1);
        assert_eq!(calls.submits, 0);
        assert_eq!(pools.commands.in_use_count(1), 0);
    }

    #[test]
    fn failing_stage_is_reported() {
        let pools = pools(MockDevice::new());
        pools
            .mock
            .fail(MockOp::BeginCommandBuffer, vk::Result::ERROR_OUT_OF_HOST_MEMORY);

        let mut called = false;
        let result = pools.submit(&OneTimeSubmit::new(), |_| {
            called = true;
            true
        });
        assert!(!called);
        assert_eq!(
            result.first_failure(),
            Some((SubmitStage::Begin, vk::Result::ERROR_OUT_OF_HOST_MEMORY))
        );
        assert_eq!(result.end, None);
        assert_eq!(pools.commands.in_use_count(1), 0);
    }

    #[test]
    fn command_buffer_failure_aborts_immediately() {
        let pools = pools(MockDevice::new());
        pools
            .mock
            .fail(MockOp::CreateCommandPool, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);

        let result = pools.submit(&OneTimeSubmit::new(), |_| true);
        assert_eq!(
            result.acquire_command_buffer,
            Some(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
        );
        assert_eq!(result.family_index, None);
        assert_eq!(result.reset_command_pool, None);
    }

    #[test]
    fn busy_queue_times_out() {
        let pools = pools(MockDevice::new());
        let held = pools.queues.acquire(QueueSelector::Family(1), false).unwrap();

        let options = OneTimeSubmit::new().with_acquire_timeout(Duration::from_millis(5));
        let result = pools.submit(&options, |_| true);
        assert_eq!(result.acquire_queue, Some(vk::Result::TIMEOUT));
        assert!(matches!(result.into_result(), Err(GpuError::Timeout)));
        assert_eq!(pools.commands.in_use_count(1), 0);

        pools.queues.release(held);
    }

    #[test]
    fn pending_work_surfaces_as_timeouts() {
        let pools = pools(MockDevice::new().with_completion_on_submit(false));
        let options = OneTimeSubmit::new().with_await_completion(true);

        let first = pools.submit(&options, |_| true);
        assert_eq!(first.submit, Some(vk::Result::SUCCESS));
        assert_eq!(first.completion_wait, Some(vk::Result::TIMEOUT));
        assert!(!first.succeeded());

        // The queue's fence is still pending: acquisition escalates to
        // ignoring it, and the explicit wait then times out.
        let second = pools.submit(&options, |_| true);
        assert_eq!(second.acquire_queue, Some(vk::Result::SUCCESS));
        assert_eq!(second.fence_wait, Some(vk::Result::TIMEOUT));
        assert_eq!(second.submit, None);
        assert_eq!(pools.commands.slot_count(1), 2, "pending buffer is not reused");
    }

    #[test]
    fn failed_submit_resignals_the_queue_fence() {
        let pools = pools(MockDevice::new());
        pools.mock.fail_once(MockOp::Submit, vk::Result::ERROR_DEVICE_LOST);

        let result = pools.submit(&OneTimeSubmit::new(), |_| true);
        assert_eq!(
            result.first_failure(),
            Some((SubmitStage::Submit, vk::Result::ERROR_DEVICE_LOST))
        );
        assert_eq!(pools.mock.calls().submits, 1, "only the empty submission went through");

        let retried = pools.submit(&OneTimeSubmit::new(), |_| true);
        assert!(retried.succeeded(), "{retried:?}");
        assert_eq!(pools.commands.slot_count(1), 1);
    }

    fn frame_batch<'a>(
        command_buffers: &'a [vk::CommandBuffer],
        waits: &'a [vk::Semaphore],
        stages: &'a [vk::PipelineStageFlags],
    ) -> SubmitBatch<'a> {
        SubmitBatch {
            command_buffers,
            wait_semaphores: waits,
            wait_stages: stages,
            signal_semaphores: &[],
        }
    }

    #[test]
    fn frame_waits_for_a_busy_present_queue() {
        use ash::vk::Handle;

        let pools = pools(MockDevice::new());
        let fence = pools.mock.make_fence(true);
        let buffers = [vk::CommandBuffer::from_raw(7)];
        let waits = [vk::Semaphore::from_raw(8)];
        let stages = [vk::PipelineStageFlags::TRANSFER];
        let batch = frame_batch(&buffers, &waits, &stages);

        let held = pools.queues.acquire(QueueSelector::Family(0), false).unwrap();
        let outcome = std::thread::scope(|scope| {
            scope.spawn(|| {
                std::thread::sleep(Duration::from_millis(20));
                pools.queues.release(held);
            });
            unsafe {
                submit_frame(&pools.queues, pools.mock.as_ref(), 0, &batch, fence, |queue| queue)
            }
        });

        let presented_on = match outcome {
            Ok(FrameOutcome::Presented(queue)) => queue,
            other => panic!("frame was not presented: {other:?}"),
        };
        assert_eq!(presented_on, unsafe { pools.mock.get_queue(0, 0) });
        assert!(pools.mock.is_fence_signaled(fence));
        let calls = pools.mock.calls();
        assert_eq!(calls.submits, 1);
        assert_eq!(calls.submitted_wait_semaphores, 1);
        assert_eq!(pools.queues.in_use_count(0), 0);
    }

    #[test]
    fn rejected_frame_still_consumes_its_semaphore() {
        use ash::vk::Handle;

        let pools = pools(MockDevice::new());
        pools.mock.fail_once(MockOp::Submit, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let fence = pools.mock.make_fence(true);
        let buffers = [vk::CommandBuffer::from_raw(7)];
        let waits = [vk::Semaphore::from_raw(8)];
        let stages = [vk::PipelineStageFlags::TRANSFER];
        let batch = frame_batch(&buffers, &waits, &stages);

        let mut presented = false;
        let outcome = unsafe {
            submit_frame(&pools.queues, pools.mock.as_ref(), 0, &batch, fence, |_| {
                presented = true;
            })
        };
        assert!(matches!(
            outcome,
            Ok(FrameOutcome::Recovered(GpuError::Vulkan(
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            )))
        ));
        assert!(!presented);
        assert!(pools.mock.is_fence_signaled(fence), "next frame's wait must not hang");
        let calls = pools.mock.calls();
        assert_eq!(calls.submits, 1, "only the empty batch went through");
        assert_eq!(calls.submitted_wait_semaphores, 1);
        assert_eq!(pools.queues.in_use_count(0), 0);
    }

    #[test]
    fn failed_recovery_is_reported() {
        use ash::vk::Handle;

        let pools = pools(MockDevice::new());
        pools.mock.fail(MockOp::Submit, vk::Result::ERROR_DEVICE_LOST);
        let fence = pools.mock.make_fence(true);
        let buffers = [vk::CommandBuffer::from_raw(7)];
        let waits = [vk::Semaphore::from_raw(8)];
        let stages = [vk::PipelineStageFlags::TRANSFER];
        let batch = frame_batch(&buffers, &waits, &stages);

        let outcome =
            unsafe { submit_frame(&pools.queues, pools.mock.as_ref(), 0, &batch, fence, |_| ()) };
        assert!(matches!(
            outcome,
            Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST))
        ));
        assert_eq!(pools.queues.in_use_count(0), 0);
    }

    #[test]
    fn unsubmitted_frame_recovers_from_a_signaled_fence() {
        use ash::vk::Handle;

        let pools = pools(MockDevice::new());
        let fence = pools.mock.make_fence(true);
        let waits = [vk::Semaphore::from_raw(8)];

        unsafe { recover_frame(&pools.queues, pools.mock.as_ref(), 0, &waits, fence) }.unwrap();

        assert!(pools.mock.is_fence_signaled(fence));
        let calls = pools.mock.calls();
        assert_eq!(calls.fence_resets, 1);
        assert_eq!(calls.submits, 1);
        assert_eq!(calls.submitted_wait_semaphores, 1);
    }
}

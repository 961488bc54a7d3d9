// Device - frame pacing and submission core
//
// Responsibilities:
// - Command pool free-lists (graphics, transfer)
// - Fence ring pacing at most N frames in flight
// - Batched per-frame submit + present
// - Synchronous single-time command execution

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use super::command::{CommandBuffer, CommandPoolCache, CommandPurpose, PoolOwner, PoolToken};
use super::driver::{Driver, PoolFamily, PresentRequest, QueueKind, SubmitBatch};
use super::error::{GpuError, GpuResult, PresentStatus};
use super::submit::{PendingSubmission, RecordedCommands, SubmissionQueue};
use super::swapchain::PresentTarget;
use super::sync::FenceRing;

/// Frames the CPU may record ahead of the GPU.
pub const FRAMES_IN_FLIGHT: usize = 2;

/// Stages a presenting submission waits in for its image to be acquired.
const PRESENT_WAIT_STAGES: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT.as_raw() | vk::PipelineStageFlags::TRANSFER.as_raw(),
);

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub frames_in_flight: usize,
    /// Nanoseconds a fence wait may block before it is reported as an error.
    pub fence_timeout: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: FRAMES_IN_FLIGHT,
            fence_timeout: u64::MAX,
        }
    }
}

/// Result of `Device::submit_pending_work`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending; no queue call was made.
    Empty,
    Submitted {
        serial: u64,
        /// Worst status over all presented swap chains, if any presented.
        present: Option<PresentStatus>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStats {
    pub pools_created: usize,
    pub pools_checked_out: usize,
    pub idle_graphics_pools: usize,
    pub idle_transfer_pools: usize,
    pub frames_submitted: u64,
    pub current_slot: usize,
    pub pending_submissions: usize,
}

/// Central arbiter of queue access, frame pacing and pool reuse.
///
/// Created once and shared through `Arc`; every collaborator receives it
/// explicitly.
pub struct Device {
    driver: Arc<dyn Driver>,
    graphics_queue: Arc<Mutex<vk::Queue>>,
    present_queue: Arc<Mutex<vk::Queue>>,
    transfer_queue: Arc<Mutex<vk::Queue>>,
    dedicated_transfer: bool,
    pools: CommandPoolCache,
    pending: SubmissionQueue,
    ring: Mutex<FenceRing>,
    fence_timeout: u64,
    frames_submitted: AtomicU64,
    /// Command buffers created but not yet part of a submitted frame.
    unflushed: AtomicUsize,
}

impl Device {
    pub fn new(driver: Arc<dyn Driver>, config: &DeviceConfig) -> GpuResult<Arc<Self>> {
        if config.frames_in_flight == 0 {
            return Err(GpuError::Config("frames_in_flight must be at least 1".into()));
        }

        let ring = FenceRing::new(driver.as_ref(), config.frames_in_flight)?;

        // One mutex per distinct native queue, shared by the roles that alias it
        let graphics = driver.queue(QueueKind::Graphics);
        let graphics_queue = Arc::new(Mutex::new(graphics));
        let present_queue = match driver.queue(QueueKind::Present) {
            queue if queue == graphics => Arc::clone(&graphics_queue),
            queue => Arc::new(Mutex::new(queue)),
        };
        let dedicated_transfer = driver.has_dedicated_transfer();
        let transfer_queue = if dedicated_transfer {
            Arc::new(Mutex::new(driver.queue(QueueKind::Transfer)))
        } else {
            Arc::clone(&graphics_queue)
        };

        log::info!(
            "Device ready: {} frames in flight, dedicated transfer queue: {}",
            config.frames_in_flight,
            dedicated_transfer
        );

        Ok(Arc::new(Self {
            driver,
            graphics_queue,
            present_queue,
            transfer_queue,
            dedicated_transfer,
            pools: CommandPoolCache::new(),
            pending: SubmissionQueue::new(),
            ring: Mutex::new(ring),
            fence_timeout: config.fence_timeout,
            frames_submitted: AtomicU64::new(0),
            unflushed: AtomicUsize::new(0),
        }))
    }

    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    pub fn frames_in_flight(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn has_dedicated_transfer(&self) -> bool {
        self.dedicated_transfer
    }

    pub fn fence_timeout(&self) -> u64 {
        self.fence_timeout
    }

    pub fn stats(&self) -> DeviceStats {
        let ring = self.ring.lock();
        DeviceStats {
            pools_created: self.pools.created(),
            pools_checked_out: self.pools.checked_out(),
            idle_graphics_pools: self.pools.idle(PoolFamily::Graphics),
            idle_transfer_pools: self.pools.idle(PoolFamily::Transfer),
            frames_submitted: self.frames_submitted.load(Ordering::Relaxed),
            current_slot: ring.current(),
            pending_submissions: self.pending.len(),
        }
    }

    // =========================================================================
    // COMMAND POOLS
    // =========================================================================

    pub fn acquire_graphics_command_pool(&self) -> GpuResult<PoolToken> {
        self.pools.acquire(self.driver(), PoolFamily::Graphics)
    }

    /// Falls back to a graphics pool when there is no dedicated transfer queue.
    pub fn acquire_transfer_command_pool(&self) -> GpuResult<PoolToken> {
        let family = CommandPurpose::Transfer.family(self.dedicated_transfer);
        self.pools.acquire(self.driver(), family)
    }

    pub fn acquire_command_pool(&self, purpose: CommandPurpose) -> GpuResult<PoolToken> {
        match purpose {
            CommandPurpose::Transfer => self.acquire_transfer_command_pool(),
            CommandPurpose::Graphics | CommandPurpose::Compute => self.acquire_graphics_command_pool(),
        }
    }

    /// The pool's command buffers must be freed and their work complete.
    pub fn return_graphics_command_pool(&self, token: PoolToken) {
        debug_assert_eq!(token.family(), PoolFamily::Graphics);
        self.pools.release(token);
    }

    pub fn return_transfer_command_pool(&self, token: PoolToken) {
        debug_assert_eq!(token.family(), CommandPurpose::Transfer.family(self.dedicated_transfer));
        self.pools.release(token);
    }

    pub fn return_command_pool(&self, token: PoolToken) {
        self.pools.release(token);
    }

    /// Free a finished buffer and return its pool. Its work must be complete.
    pub(crate) fn release_commands(&self, commands: RecordedCommands) {
        let (token, buffer) = commands.into_parts();
        self.driver.free_command_buffer(token.pool(), buffer);
        self.pools.release(token);
    }

    pub fn create_command_buffer(self: &Arc<Self>, purpose: CommandPurpose) -> GpuResult<CommandBuffer> {
        CommandBuffer::new(self, purpose)
    }

    pub(crate) fn begin_unflushed(&self) {
        self.unflushed.fetch_add(1, Ordering::AcqRel);
    }

    /// `count` command buffers were submitted or discarded.
    pub(crate) fn end_unflushed(&self, count: usize) {
        if count > 0 {
            self.unflushed.fetch_sub(count, Ordering::AcqRel);
        }
    }

    /// Release finished but never submitted commands.
    pub(crate) fn discard_commands(&self, commands: Vec<RecordedCommands>) {
        let count = commands.len();
        for commands in commands {
            self.release_commands(commands);
        }
        self.end_unflushed(count);
    }

    // =========================================================================
    // FENCE WAITS
    // =========================================================================

    /// Wait for the current in-flight slot's fence. Its resources become free.
    pub fn wait_for_acquire(&self) -> GpuResult<()> {
        self.acquire_slot().map(|_| ())
    }

    /// `wait_for_acquire`, returning the slot the next flush will use.
    pub(crate) fn acquire_slot(&self) -> GpuResult<usize> {
        let mut ring = self.ring.lock();
        let current = ring.current();
        self.wait_slot_locked(&mut ring, current)?;
        Ok(current)
    }

    /// Wait for every in-flight fence: nothing submitted is still running.
    pub fn wait_for_release(&self) -> GpuResult<()> {
        let mut ring = self.ring.lock();
        for index in 0..ring.len() {
            self.wait_slot_locked(&mut ring, index)?;
        }
        let last = ring.last_serial();
        for buffer in ring.take_deferred_buffers(last) {
            self.driver.destroy_buffer(buffer);
        }
        Ok(())
    }

    /// `wait_for_release`, plus any single-time work still on the queues.
    pub fn wait_device_idle(&self) -> GpuResult<()> {
        self.wait_for_release()?;
        self.driver.device_wait_idle()
    }

    /// Wait for the frame with `serial`, unless its slot has been reused
    /// (which implies it already completed).
    pub fn wait_for_serial(&self, serial: u64) -> GpuResult<()> {
        let mut ring = self.ring.lock();
        self.wait_serial_locked(&mut ring, serial)
    }

    fn wait_serial_locked(&self, ring: &mut FenceRing, serial: u64) -> GpuResult<()> {
        match ring.slot_of_serial(serial) {
            Some(index) => self.wait_slot_locked(ring, index),
            None => Ok(()),
        }
    }

    fn wait_slot_locked(&self, ring: &mut FenceRing, index: usize) -> GpuResult<()> {
        let fence = ring.slot(index).fence;
        self.driver.wait_for_fences(&[fence], self.fence_timeout)?;

        let slot = ring.slot_mut(index);
        let completed = slot.serial;
        let retired = std::mem::take(&mut slot.retired);
        if !retired.is_empty() {
            log::trace!("Releasing {} command buffers from frame {}", retired.len(), completed);
        }
        for commands in retired {
            self.release_commands(commands);
        }
        for buffer in ring.take_deferred_buffers(completed) {
            self.driver.destroy_buffer(buffer);
        }
        Ok(())
    }

    // =========================================================================
    // FRAME SUBMISSION
    // =========================================================================

    /// Queue off-screen command buffers for the next flush. The device
    /// takes over their pools.
    pub fn send_command_buffers(&self, buffers: Vec<CommandBuffer>) -> GpuResult<()> {
        debug_assert!(!buffers.is_empty(), "send_command_buffers called with no buffers");
        if buffers.is_empty() {
            return Ok(());
        }

        let mut recorded = Vec::with_capacity(buffers.len());
        for buffer in buffers {
            debug_assert_eq!(
                buffer.family(),
                Some(PoolFamily::Graphics),
                "frame batches go to the graphics queue; use single_time_transfer for transfer work"
            );
            match buffer.finish(PoolOwner::Device) {
                Ok(commands) => recorded.push(commands),
                Err(e) => {
                    // Nothing reached the GPU yet
                    self.discard_commands(recorded);
                    return Err(e);
                }
            }
        }
        self.send_submit_info(PendingSubmission::offscreen(recorded));
        Ok(())
    }

    pub fn send_command_buffer(&self, buffer: CommandBuffer) -> GpuResult<()> {
        self.send_command_buffers(vec![buffer])
    }

    /// Thread-safe append to the pending accumulator.
    pub fn send_submit_info(&self, submission: PendingSubmission) {
        self.pending.push(submission);
    }

    /// Pull every unflushed submission presenting to `target` back out of
    /// the accumulator. The swap chain still holds their pools.
    pub(crate) fn withdraw_submissions(&self, target: &Arc<PresentTarget>) -> usize {
        let withdrawn = self.pending.withdraw(|submission| {
            submission
                .present
                .as_ref()
                .is_some_and(|present| Arc::ptr_eq(&present.target, target))
        });
        let buffers = withdrawn.iter().map(PendingSubmission::command_buffer_count).sum();
        for submission in &withdrawn {
            debug_assert!(submission.owned.is_empty());
        }
        self.end_unflushed(buffers);
        withdrawn.len()
    }

    /// Flush every pending submission as one queue submit and one present.
    ///
    /// 1. Take the pending list; return `Empty` if there is nothing.
    /// 2. Build one submit record per submission, collecting presents and
    ///    noting which frame renders each swap chain image.
    /// 3. Wait for frames still rendering into the same images, then for the
    ///    current slot's fence, and reset it.
    /// 4. Submit all command buffers signaling that fence, then present all
    ///    swap chains in one call.
    /// 5. Advance the in-flight slot.
    pub fn submit_pending_work(&self) -> GpuResult<FlushOutcome> {
        // Taken under the ring lock so a waiter on the ring sees either the
        // whole batch submitted or none of it
        let mut ring = self.ring.lock();
        let batch = self.pending.take();
        if batch.is_empty() {
            return Ok(FlushOutcome::Empty);
        }
        let batch_buffers: usize = batch.iter().map(PendingSubmission::command_buffer_count).sum();

        let slot = ring.current();
        let serial = ring.next_serial();

        let mut submits = Vec::with_capacity(batch.len());
        let mut presents = Vec::new();
        let mut targets = Vec::new();
        let mut owned = Vec::new();
        let mut previous_users = Vec::new();

        for submission in batch {
            let mut info = SubmitBatch {
                command_buffers: submission.command_buffers,
                ..Default::default()
            };
            if let Some(present) = submission.present {
                info.wait_semaphores.push(present.wait);
                info.wait_stages.push(PRESENT_WAIT_STAGES);
                info.signal_semaphores.push(present.signal);

                let claimed = present
                    .target
                    .claim_image(present.image_index, present.semaphore_slot, serial);
                if let Some(previous) = claimed {
                    previous_users.push(previous);
                }
                presents.push(PresentRequest {
                    swapchain: present.swapchain,
                    image_index: present.image_index,
                    wait_semaphore: present.signal,
                });
                targets.push(present.target);
            }
            owned.extend(submission.owned);
            submits.push(info);
        }

        // An image may still be rendered by a frame on another slot
        let fence = ring.slot(slot).fence;
        let ready = previous_users
            .into_iter()
            .try_for_each(|previous| self.wait_serial_locked(&mut ring, previous))
            .and_then(|()| self.wait_slot_locked(&mut ring, slot))
            .and_then(|()| self.driver.reset_fences(&[fence]));
        if let Err(e) = ready {
            // Nothing was submitted; the batch's pools can go straight back
            for commands in owned {
                self.release_commands(commands);
            }
            self.end_unflushed(batch_buffers);
            return Err(e);
        }

        let submitted = {
            let queue = self.graphics_queue.lock();
            self.driver.queue_submit(*queue, &submits, fence)
        };
        if let Err(e) = submitted {
            // Keep the ring waitable: the reset fence would never signal
            match self.driver.create_fence(true) {
                Ok(replacement) => {
                    self.driver.destroy_fence(fence);
                    ring.slot_mut(slot).fence = replacement;
                }
                Err(replace_err) => log::error!("Failed to replace fence: {}", replace_err),
            }
            for commands in owned {
                self.release_commands(commands);
            }
            self.end_unflushed(batch_buffers);
            return Err(e);
        }
        // The submit went through: pace the ring even if presenting fails
        ring.commit(serial, owned);
        ring.advance();
        self.end_unflushed(batch_buffers);
        drop(ring);
        self.frames_submitted.fetch_add(1, Ordering::Relaxed);

        if presents.is_empty() {
            return Ok(FlushOutcome::Submitted { serial, present: None });
        }

        let statuses = {
            let queue = self.present_queue.lock();
            self.driver.queue_present(*queue, &presents)?
        };
        let mut worst = PresentStatus::Optimal;
        for (target, status) in targets.iter().zip(statuses) {
            target.record_status(status);
            worst = worst.worst(status);
        }
        if worst.needs_recreate() {
            log::debug!("Frame {} presented with status {:?}", serial, worst);
        }
        Ok(FlushOutcome::Submitted { serial, present: Some(worst) })
    }

    // =========================================================================
    // SINGLE-TIME COMMANDS
    // =========================================================================

    /// Record and submit a one-off transfer command buffer.
    ///
    /// The returned guard blocks until the GPU has finished when it is
    /// waited on or dropped.
    pub fn single_time_transfer<F>(self: &Arc<Self>, record: F) -> GpuResult<SingleTimeGuard>
    where
        F: FnOnce(&mut CommandBuffer) -> GpuResult<()>,
    {
        self.single_time(CommandPurpose::Transfer, record)
    }

    pub fn single_time_graphics<F>(self: &Arc<Self>, record: F) -> GpuResult<SingleTimeGuard>
    where
        F: FnOnce(&mut CommandBuffer) -> GpuResult<()>,
    {
        self.single_time(CommandPurpose::Graphics, record)
    }

    fn single_time<F>(self: &Arc<Self>, purpose: CommandPurpose, record: F) -> GpuResult<SingleTimeGuard>
    where
        F: FnOnce(&mut CommandBuffer) -> GpuResult<()>,
    {
        let mut cmd = CommandBuffer::new(self, purpose)?;
        record(&mut cmd)?;
        let commands = cmd.finish(PoolOwner::SingleTime)?;

        let fence = match self.driver.create_fence(false) {
            Ok(fence) => fence,
            Err(e) => {
                self.discard_commands(vec![commands]);
                return Err(e);
            }
        };

        let queue = match purpose {
            CommandPurpose::Transfer => &self.transfer_queue,
            CommandPurpose::Graphics | CommandPurpose::Compute => &self.graphics_queue,
        };
        let submit = SubmitBatch {
            command_buffers: vec![commands.buffer()],
            ..Default::default()
        };
        let submitted = {
            let queue = queue.lock();
            self.driver.queue_submit(*queue, &[submit], fence)
        };
        if let Err(e) = submitted {
            self.driver.destroy_fence(fence);
            self.discard_commands(vec![commands]);
            return Err(e);
        }
        self.end_unflushed(1);

        Ok(SingleTimeGuard {
            device: Arc::clone(self),
            fence,
            commands: Some(commands),
        })
    }

    // =========================================================================
    // RESOURCE LIFETIME
    // =========================================================================

    /// Destroy `buffer` once no frame can reference it any more.
    ///
    /// Work still recording or waiting in the accumulator lands in the next
    /// flush, so the buffer then waits for that frame too.
    pub fn retire_buffer(&self, buffer: vk::Buffer) {
        let mut ring = self.ring.lock();
        let serial = if self.unflushed.load(Ordering::Acquire) > 0 {
            ring.next_serial()
        } else {
            ring.last_serial()
        };
        if serial == 0 {
            drop(ring);
            self.driver.destroy_buffer(buffer);
        } else {
            ring.defer_buffer(serial, buffer);
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        log::info!("Destroying device submission state...");

        let leftover = self.pending.take();
        if !leftover.is_empty() {
            log::warn!("{} submissions were never flushed", leftover.len());
            for submission in leftover {
                self.discard_commands(submission.owned);
            }
        }

        if let Err(e) = self.wait_for_release() {
            log::error!("Failed waiting for in-flight frames: {}", e);
        }
        // Nothing is left to flush, so later serials never come
        for buffer in self.ring.get_mut().take_deferred_buffers(u64::MAX) {
            self.driver.destroy_buffer(buffer);
        }

        self.ring.get_mut().destroy(self.driver.as_ref());
        if self.pools.checked_out() > 0 {
            log::warn!("{} command pools still checked out", self.pools.checked_out());
        }
        self.pools.destroy_idle(self.driver.as_ref());
    }
}

/// Deferred completion of a single-time submission.
///
/// `wait` (or drop) blocks until the commands have executed, then frees the
/// command buffer and returns its pool.
#[must_use = "dropping the guard blocks until the GPU work completes"]
pub struct SingleTimeGuard {
    device: Arc<Device>,
    fence: vk::Fence,
    commands: Option<RecordedCommands>,
}

impl SingleTimeGuard {
    pub fn wait(mut self) -> GpuResult<()> {
        self.complete()
    }

    /// Non-blocking completion check.
    pub fn is_complete(&self) -> GpuResult<bool> {
        match self.commands {
            Some(_) => self.device.driver.fence_signaled(self.fence),
            None => Ok(true),
        }
    }

    fn complete(&mut self) -> GpuResult<()> {
        let Some(commands) = self.commands.take() else {
            return Ok(());
        };
        if let Err(e) = self
            .device
            .driver
            .wait_for_fences(&[self.fence], self.device.fence_timeout)
        {
            self.commands = Some(commands);
            return Err(e);
        }
        self.device.driver.destroy_fence(self.fence);
        self.device.release_commands(commands);
        Ok(())
    }
}

impl Drop for SingleTimeGuard {
    fn drop(&mut self) {
        if let Err(e) = self.complete() {
            log::error!("Single-time command never completed: {}", e);
        }
    }
}

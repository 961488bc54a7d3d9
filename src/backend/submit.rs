// Pending submissions
//
// Work handed to the device is accumulated here from any thread and
// flushed as one batched submit + present per frame.

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use super::command::PoolToken;
use super::swapchain::PresentTarget;

/// A finished command buffer together with the pool it came from.
#[derive(Debug)]
pub struct RecordedCommands {
    token: PoolToken,
    buffer: vk::CommandBuffer,
}

impl RecordedCommands {
    pub(crate) fn new(token: PoolToken, buffer: vk::CommandBuffer) -> Self {
        Self { token, buffer }
    }

    pub fn buffer(&self) -> vk::CommandBuffer {
        self.buffer
    }

    pub(crate) fn into_parts(self) -> (PoolToken, vk::CommandBuffer) {
        (self.token, self.buffer)
    }
}

/// Presentation half of a submission.
pub(crate) struct PendingPresent {
    pub target: Arc<PresentTarget>,
    /// Swap chain the image was acquired from.
    pub swapchain: vk::SwapchainKHR,
    pub image_index: u32,
    /// In-flight slot whose semaphore pair this frame uses.
    pub semaphore_slot: usize,
    /// Image-available; the render waits on it.
    pub wait: vk::Semaphore,
    /// Render-finished; the present waits on it.
    pub signal: vk::Semaphore,
}

/// One batch of command buffers waiting for the next flush.
pub struct PendingSubmission {
    pub(crate) command_buffers: Vec<vk::CommandBuffer>,
    /// Pools the device releases once this batch's fence signals.
    pub(crate) owned: Vec<RecordedCommands>,
    pub(crate) present: Option<PendingPresent>,
}

impl PendingSubmission {
    /// Off-screen work whose pools the device takes over.
    pub(crate) fn offscreen(recorded: Vec<RecordedCommands>) -> Self {
        Self {
            command_buffers: recorded.iter().map(RecordedCommands::buffer).collect(),
            owned: recorded,
            present: None,
        }
    }

    /// Work rendering into a swap chain image; the swap chain keeps the pools.
    pub(crate) fn present(command_buffers: Vec<vk::CommandBuffer>, present: PendingPresent) -> Self {
        Self {
            command_buffers,
            owned: Vec::new(),
            present: Some(present),
        }
    }

    pub fn command_buffer_count(&self) -> usize {
        self.command_buffers.len()
    }

    pub fn presents(&self) -> bool {
        self.present.is_some()
    }
}

/// Mutex-guarded accumulator of pending submissions.
#[derive(Default)]
pub struct SubmissionQueue {
    pending: Mutex<Vec<PendingSubmission>>,
}

impl SubmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, submission: PendingSubmission) {
        self.pending.lock().push(submission);
    }

    /// Take everything queued so far, leaving the queue empty.
    pub fn take(&self) -> Vec<PendingSubmission> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Remove the submissions matching `pred`, keeping the rest in order.
    pub fn withdraw<F>(&self, mut pred: F) -> Vec<PendingSubmission>
    where
        F: FnMut(&PendingSubmission) -> bool,
    {
        let mut pending = self.pending.lock();
        let (taken, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut *pending).into_iter().partition(|s| pred(s));
        *pending = kept;
        taken
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

// Command pools and command buffers
//
// Pools are cached per family and handed out one owner at a time.
// A CommandBuffer owns its pool until it is submitted; after that the
// swap chain or the device releases it once the GPU is done.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use super::device::Device;
use super::driver::{Driver, PoolFamily};
use super::error::GpuResult;
use super::resource::{BufferResource, ImageResource, PipelineResource};
use super::submit::RecordedCommands;

/// What a command buffer will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandPurpose {
    Graphics,
    Transfer,
    /// Recorded from graphics pools; the graphics family supports compute.
    Compute,
}

impl CommandPurpose {
    pub fn family(self, dedicated_transfer: bool) -> PoolFamily {
        match self {
            CommandPurpose::Transfer if dedicated_transfer => PoolFamily::Transfer,
            _ => PoolFamily::Graphics,
        }
    }
}

/// Structure currently responsible for a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolOwner {
    /// Checked out, not yet bound to a command buffer.
    Caller,
    CommandBuffer,
    SwapChain,
    /// Off-screen work tracked by the device's fence ring.
    Device,
    SingleTime,
}

/// Ownership token for one command pool.
///
/// Not `Clone`: exactly one structure holds it at a time. The owner tag is
/// checked on every hand-off in debug builds.
#[derive(Debug)]
pub struct PoolToken {
    pool: vk::CommandPool,
    family: PoolFamily,
    owner: PoolOwner,
}

impl PoolToken {
    pub fn pool(&self) -> vk::CommandPool {
        self.pool
    }

    pub fn family(&self) -> PoolFamily {
        self.family
    }

    pub fn owner(&self) -> PoolOwner {
        self.owner
    }

    pub(crate) fn hand_off(&mut self, from: PoolOwner, to: PoolOwner) {
        debug_assert_eq!(
            self.owner, from,
            "command pool {:?} handed off by {:?} but owned by {:?}",
            self.pool, from, self.owner
        );
        self.owner = to;
    }
}

/// Free-lists of idle pools, one mutex per family.
pub struct CommandPoolCache {
    graphics: Mutex<Vec<vk::CommandPool>>,
    transfer: Mutex<Vec<vk::CommandPool>>,
    created: AtomicUsize,
    checked_out: AtomicUsize,
}

impl CommandPoolCache {
    pub fn new() -> Self {
        Self {
            graphics: Mutex::new(Vec::new()),
            transfer: Mutex::new(Vec::new()),
            created: AtomicUsize::new(0),
            checked_out: AtomicUsize::new(0),
        }
    }

    fn list(&self, family: PoolFamily) -> &Mutex<Vec<vk::CommandPool>> {
        match family {
            PoolFamily::Graphics => &self.graphics,
            PoolFamily::Transfer => &self.transfer,
        }
    }

    /// Pop an idle pool or create a new one. Never waits on the GPU.
    pub fn acquire(&self, driver: &dyn Driver, family: PoolFamily) -> GpuResult<PoolToken> {
        let cached = self.list(family).lock().pop();
        let pool = match cached {
            Some(pool) => pool,
            None => {
                let pool = driver.create_command_pool(family)?;
                let total = self.created.fetch_add(1, Ordering::Relaxed) + 1;
                log::debug!("Created {:?} command pool ({} total)", family, total);
                pool
            }
        };
        self.checked_out.fetch_add(1, Ordering::Relaxed);
        Ok(PoolToken { pool, family, owner: PoolOwner::Caller })
    }

    /// Put a pool back. Its command buffers must already be freed and the
    /// GPU work that used them complete.
    pub fn release(&self, token: PoolToken) {
        let previous = self.checked_out.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "command pool returned more often than acquired");
        let mut list = self.list(token.family).lock();
        debug_assert!(!list.contains(&token.pool), "command pool {:?} returned twice", token.pool);
        list.push(token.pool);
    }

    pub fn idle(&self, family: PoolFamily) -> usize {
        self.list(family).lock().len()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    pub fn checked_out(&self) -> usize {
        self.checked_out.load(Ordering::Relaxed)
    }

    /// Destroy every idle pool. Checked-out pools are left to their owners.
    pub fn destroy_idle(&self, driver: &dyn Driver) {
        for family in [PoolFamily::Graphics, PoolFamily::Transfer] {
            let pools = std::mem::take(&mut *self.list(family).lock());
            for pool in pools {
                driver.destroy_command_pool(pool);
            }
        }
    }
}

impl Default for CommandPoolCache {
    fn default() -> Self {
        Self::new()
    }
}

/// A single recorded sequence of GPU commands.
///
/// Recording begins on construction with one-time-submit usage and ends
/// exactly once: on submission, or on drop if the buffer was abandoned.
/// Move-only.
pub struct CommandBuffer {
    device: Arc<Device>,
    token: Option<PoolToken>,
    buffer: vk::CommandBuffer,
    purpose: CommandPurpose,
    recording: bool,
}

impl CommandBuffer {
    pub fn new(device: &Arc<Device>, purpose: CommandPurpose) -> GpuResult<Self> {
        let driver = device.driver();
        let mut token = device.acquire_command_pool(purpose)?;

        let buffer = match driver.allocate_command_buffer(token.pool()) {
            Ok(buffer) => buffer,
            Err(e) => {
                device.return_command_pool(token);
                return Err(e);
            }
        };
        if let Err(e) = driver.begin_command_buffer(buffer) {
            driver.free_command_buffer(token.pool(), buffer);
            device.return_command_pool(token);
            return Err(e);
        }

        token.hand_off(PoolOwner::Caller, PoolOwner::CommandBuffer);
        device.begin_unflushed();
        Ok(Self {
            device: Arc::clone(device),
            token: Some(token),
            buffer,
            purpose,
            recording: true,
        })
    }

    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    pub fn purpose(&self) -> CommandPurpose {
        self.purpose
    }

    pub fn family(&self) -> Option<PoolFamily> {
        self.token.as_ref().map(PoolToken::family)
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn copy_buffer(
        &mut self,
        src: &impl BufferResource,
        dst: &impl BufferResource,
        regions: &[vk::BufferCopy],
    ) {
        debug_assert!(src.usage().contains(vk::BufferUsageFlags::TRANSFER_SRC));
        debug_assert!(dst.usage().contains(vk::BufferUsageFlags::TRANSFER_DST));
        self.device
            .driver()
            .cmd_copy_buffer(self.buffer, src.handle(), dst.handle(), regions);
    }

    /// Copy the whole of `src` into the start of `dst`.
    pub fn copy_buffer_full(&mut self, src: &impl BufferResource, dst: &impl BufferResource) {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: src.size().min(dst.size()),
        };
        self.copy_buffer(src, dst, &[region]);
    }

    pub fn transition_image(
        &mut self,
        image: &impl ImageResource,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        self.device.driver().cmd_transition_image(
            self.buffer,
            image.handle(),
            image.aspect(),
            old_layout,
            new_layout,
        );
    }

    pub fn clear_color_image(
        &mut self,
        image: &impl ImageResource,
        layout: vk::ImageLayout,
        color: [f32; 4],
    ) {
        self.device
            .driver()
            .cmd_clear_color_image(self.buffer, image.handle(), layout, color);
    }

    pub fn bind_pipeline(&mut self, pipeline: &impl PipelineResource) {
        self.device
            .driver()
            .cmd_bind_pipeline(self.buffer, pipeline.bind_point(), pipeline.handle());
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        self.device.driver().cmd_draw(
            self.buffer,
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        );
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.device.driver().cmd_dispatch(self.buffer, x, y, z);
    }

    /// End recording and hand the pool to `to`.
    ///
    /// If ending fails the buffer is freed by `Drop` without a second end.
    /// On success the caller must eventually submit or discard the commands
    /// through the device so its unflushed count stays balanced.
    pub(crate) fn finish(mut self, to: PoolOwner) -> GpuResult<RecordedCommands> {
        self.recording = false;
        self.device.driver().end_command_buffer(self.buffer)?;

        let Some(mut token) = self.token.take() else {
            unreachable!("command buffer finished twice");
        };
        token.hand_off(PoolOwner::CommandBuffer, to);
        Ok(RecordedCommands::new(token, self.buffer))
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        // Handed off: the new owner releases the pool
        let Some(token) = self.token.take() else {
            return;
        };

        log::debug!("Discarding unsubmitted {:?} command buffer", self.purpose);
        let driver = self.device.driver();
        if self.recording {
            if let Err(e) = driver.end_command_buffer(self.buffer) {
                log::warn!("Failed to end abandoned command buffer: {}", e);
            }
        }
        driver.free_command_buffer(token.pool(), self.buffer);
        self.device.return_command_pool(token);
        self.device.end_unflushed(1);
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("buffer", &self.buffer)
            .field("purpose", &self.purpose)
            .field("recording", &self.recording)
            .finish()
    }
}

// Swapchain - Window presentation
//
// Owns the presentable images of one surface, their semaphores, and the
// acquire -> submit -> present cycle. Command pools used to render an image
// stay attached to that image until it is acquired again.

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use super::command::{CommandBuffer, PoolOwner};
use super::device::Device;
use super::driver::{AcquireResult, SwapchainRequest};
use super::error::{GpuResult, PresentStatus};
use super::resource::ImageResource;
use super::submit::{PendingPresent, PendingSubmission, RecordedCommands};
use super::sync::FrameSemaphores;

// =============================================================================
// SURFACE SELECTION
// =============================================================================

/// Prefer 8-bit BGRA sRGB, otherwise whatever the surface lists first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// Requested mode if supported, else MAILBOX, else FIFO (always available).
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    requested: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    [requested, vk::PresentModeKHR::MAILBOX]
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// `preferred`, but at least one more than the minimum and at most the
/// maximum (0 means unbounded).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR, preferred: u32) -> u32 {
    let mut count = preferred.max(caps.min_image_count + 1);
    if caps.max_image_count > 0 && count > caps.max_image_count {
        count = caps.max_image_count;
    }
    count
}

// =============================================================================
// PRESENT TARGET
// =============================================================================

struct PresentState {
    handle: vk::SwapchainKHR,
    /// Serial of the frame that last rendered into each image, 0 if none.
    image_serials: Vec<u64>,
    /// Serial of the frame that last used each in-flight slot's semaphores.
    semaphore_serials: Vec<u64>,
    status: PresentStatus,
}

/// The part of a swap chain the device touches while flushing.
pub struct PresentTarget {
    state: Mutex<PresentState>,
}

impl PresentTarget {
    fn new(frames_in_flight: usize) -> Self {
        Self {
            state: Mutex::new(PresentState {
                handle: vk::SwapchainKHR::null(),
                image_serials: Vec::new(),
                semaphore_serials: vec![0; frames_in_flight],
                status: PresentStatus::Optimal,
            }),
        }
    }

    pub(crate) fn handle(&self) -> vk::SwapchainKHR {
        self.state.lock().handle
    }

    /// Mark `image` and the semaphores of `slot` as used by frame `serial`.
    /// Returns the frame that rendered the image before.
    pub(crate) fn claim_image(&self, image: u32, slot: usize, serial: u64) -> Option<u64> {
        let mut state = self.state.lock();
        state.semaphore_serials[slot] = serial;
        let previous = std::mem::replace(&mut state.image_serials[image as usize], serial);
        (previous != 0).then_some(previous)
    }

    fn image_serial(&self, image: u32) -> Option<u64> {
        let serial = self.state.lock().image_serials[image as usize];
        (serial != 0).then_some(serial)
    }

    fn semaphore_serial(&self, slot: usize) -> Option<u64> {
        let serial = self.state.lock().semaphore_serials[slot];
        (serial != 0).then_some(serial)
    }

    pub(crate) fn record_status(&self, status: PresentStatus) {
        let mut state = self.state.lock();
        state.status = state.status.worst(status);
    }

    fn status(&self) -> PresentStatus {
        self.state.lock().status
    }

    fn reset(&self, handle: vk::SwapchainKHR, image_count: u32) {
        let mut state = self.state.lock();
        state.handle = handle;
        state.image_serials = vec![0; image_count as usize];
        state.status = PresentStatus::Optimal;
    }
}

// =============================================================================
// SWAP CHAIN
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct SwapChainDesc {
    pub surface: vk::SurfaceKHR,
    pub width: u32,
    pub height: u32,
    pub present_mode: vk::PresentModeKHR,
    /// Preferred image count; clamped to what the surface supports.
    pub image_count: u32,
}

/// One presentable image and its view.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainImage {
    image: vk::Image,
    view: vk::ImageView,
    format: vk::Format,
}

impl SwapchainImage {
    pub fn view(&self) -> vk::ImageView {
        self.view
    }
}

impl ImageResource for SwapchainImage {
    fn handle(&self) -> vk::Image {
        self.image
    }

    fn format(&self) -> vk::Format {
        self.format
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(u32),
    /// Usable this frame, but the swap chain should be recreated.
    Suboptimal(u32),
    /// No image; recreate before trying again.
    OutOfDate,
    /// Zero-area surface; nothing is acquired until a non-zero resize.
    Minimized,
}

impl AcquireOutcome {
    pub fn image_index(self) -> Option<u32> {
        match self {
            AcquireOutcome::Acquired(index) | AcquireOutcome::Suboptimal(index) => Some(index),
            AcquireOutcome::OutOfDate | AcquireOutcome::Minimized => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct AcquiredImage {
    index: u32,
    slot: usize,
}

pub struct SwapChain {
    device: Arc<Device>,
    surface: vk::SurfaceKHR,
    target: Arc<PresentTarget>,
    images: Vec<SwapchainImage>,
    format: vk::Format,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    requested_extent: vk::Extent2D,
    requested_present_mode: vk::PresentModeKHR,
    preferred_image_count: u32,
    /// One pair per in-flight slot.
    semaphores: Vec<FrameSemaphores>,
    /// Set when an image-available semaphore was signaled and never waited.
    semaphores_stale: bool,
    /// Command buffers last submitted against each image, freed on reacquire.
    outstanding: Vec<Vec<RecordedCommands>>,
    acquired: Option<AcquiredImage>,
    minimized: bool,
}

impl SwapChain {
    pub fn new(device: Arc<Device>, desc: SwapChainDesc) -> GpuResult<Self> {
        let target = Arc::new(PresentTarget::new(device.frames_in_flight()));
        let mut swapchain = Self {
            device,
            surface: desc.surface,
            target,
            images: Vec::new(),
            format: vk::Format::UNDEFINED,
            extent: vk::Extent2D::default(),
            present_mode: desc.present_mode,
            requested_extent: vk::Extent2D { width: desc.width, height: desc.height },
            requested_present_mode: desc.present_mode,
            preferred_image_count: desc.image_count,
            semaphores: Vec::new(),
            semaphores_stale: false,
            outstanding: Vec::new(),
            acquired: None,
            minimized: true,
        };

        if desc.width == 0 || desc.height == 0 {
            log::info!("Surface is zero-sized, deferring swap chain creation");
        } else {
            swapchain.build()?;
        }
        Ok(swapchain)
    }

    pub fn images(&self) -> &[SwapchainImage] {
        &self.images
    }

    pub fn image(&self, index: u32) -> &SwapchainImage {
        &self.images[index as usize]
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.target.handle()
    }

    pub fn is_minimized(&self) -> bool {
        self.minimized
    }

    pub fn current_image(&self) -> Option<u32> {
        self.acquired.map(|acquired| acquired.index)
    }

    /// Set once acquire, present or a failed rebuild reported that the
    /// surface no longer matches; cleared by a successful `recreate`.
    pub fn needs_recreate(&self) -> bool {
        self.target.status().needs_recreate()
    }

    /// Command buffers still attached to `image`.
    pub fn outstanding(&self, image: u32) -> usize {
        self.outstanding.get(image as usize).map_or(0, Vec::len)
    }

    /// Wait for the in-flight slot, then acquire the next presentable image.
    ///
    /// The image-available semaphore is the current slot's, so the device
    /// should be flushed between `submit_command_buffers` and the next
    /// acquire.
    ///
    /// Pools still attached to the acquired image are released: the frame
    /// that used them is waited on first.
    pub fn acquire_next_image(&mut self) -> GpuResult<AcquireOutcome> {
        if self.minimized {
            return Ok(AcquireOutcome::Minimized);
        }
        debug_assert!(self.acquired.is_none(), "image acquired twice without submitting");

        self.ensure_semaphores()?;
        let slot = self.device.acquire_slot()?;
        // The pair may have been used by a frame flushed on another slot
        if let Some(serial) = self.target.semaphore_serial(slot) {
            self.device.wait_for_serial(serial)?;
        }

        let acquired = self.device.driver().acquire_next_image(
            self.target.handle(),
            self.semaphores[slot].image_available,
            self.device.fence_timeout(),
        )?;

        let (index, suboptimal) = match acquired {
            AcquireResult::Image { index, suboptimal } => (index, suboptimal),
            AcquireResult::OutOfDate => {
                log::debug!("Swap chain out of date on acquire");
                self.target.record_status(PresentStatus::OutOfDate);
                return Ok(AcquireOutcome::OutOfDate);
            }
        };

        self.acquired = Some(AcquiredImage { index, slot });
        if let Some(serial) = self.target.image_serial(index) {
            self.device.wait_for_serial(serial)?;
        }
        for commands in self.outstanding[index as usize].drain(..) {
            self.device.release_commands(commands);
        }

        if suboptimal {
            self.target.record_status(PresentStatus::Suboptimal);
            Ok(AcquireOutcome::Suboptimal(index))
        } else {
            Ok(AcquireOutcome::Acquired(index))
        }
    }

    /// End recording, attach the pools to the acquired image and queue the
    /// work for the device's next flush.
    pub fn submit_command_buffers(&mut self, buffers: Vec<CommandBuffer>) -> GpuResult<()> {
        if buffers.is_empty() {
            log::warn!("submit_command_buffers called with no command buffers");
            return Ok(());
        }
        if self.minimized {
            // Dropping the buffers returns their pools
            log::debug!("Swap chain minimized, discarding {} command buffers", buffers.len());
            return Ok(());
        }
        let Some(acquired) = self.acquired.take() else {
            panic!("submit_command_buffers called without an acquired image");
        };

        let mut recorded = Vec::with_capacity(buffers.len());
        for buffer in buffers {
            match buffer.finish(PoolOwner::SwapChain) {
                Ok(commands) => recorded.push(commands),
                Err(e) => {
                    // The image stays acquired; recreate gives it up
                    self.acquired = Some(acquired);
                    self.device.discard_commands(recorded);
                    return Err(e);
                }
            }
        }

        let handles = recorded.iter().map(RecordedCommands::buffer).collect();
        self.outstanding[acquired.index as usize].extend(recorded);

        let semaphores = self.semaphores[acquired.slot];
        self.device.send_submit_info(PendingSubmission::present(
            handles,
            PendingPresent {
                target: Arc::clone(&self.target),
                swapchain: self.target.handle(),
                image_index: acquired.index,
                semaphore_slot: acquired.slot,
                wait: semaphores.image_available,
                signal: semaphores.render_finished,
            },
        ));
        Ok(())
    }

    pub fn submit_command_buffer(&mut self, buffer: CommandBuffer) -> GpuResult<()> {
        self.submit_command_buffers(vec![buffer])
    }

    /// Rebuild the image set for a new size or present mode.
    ///
    /// Work submitted against this swap chain but not yet flushed is dropped.
    /// A zero-area size only marks the swap chain minimized; nothing is
    /// acquired or presented until a non-zero size arrives.
    pub fn recreate(&mut self, width: u32, height: u32, present_mode: vk::PresentModeKHR) -> GpuResult<()> {
        self.requested_extent = vk::Extent2D { width, height };
        self.requested_present_mode = present_mode;
        self.drain()?;

        if width == 0 || height == 0 {
            log::info!("Swap chain minimized");
            self.minimized = true;
            return Ok(());
        }

        self.build()
    }

    pub fn change_present_mode(&mut self, present_mode: vk::PresentModeKHR) -> GpuResult<()> {
        let extent = self.requested_extent;
        self.recreate(extent.width, extent.height, present_mode)
    }

    /// Block until no submitted work can still reference these images, then
    /// release every pool still attached to them.
    ///
    /// An image acquired but not yet flushed is given up along with the
    /// work submitted against it.
    pub fn wait_idle(&mut self) -> GpuResult<()> {
        self.drain()?;
        if self.semaphores_stale {
            self.ensure_semaphores()?;
        }
        Ok(())
    }

    fn drain(&mut self) -> GpuResult<()> {
        if self.acquired.take().is_some() {
            self.semaphores_stale = true;
        }
        let withdrawn = self.device.withdraw_submissions(&self.target);
        if withdrawn > 0 {
            log::debug!("Dropping {} unflushed swap chain submissions", withdrawn);
            self.semaphores_stale = true;
        }

        self.device.wait_for_release()?;
        self.release_outstanding();
        Ok(())
    }

    /// One semaphore pair per in-flight slot. Rebuilt only when a signaled
    /// image-available semaphore was left behind.
    fn ensure_semaphores(&mut self) -> GpuResult<()> {
        let wanted = self.device.frames_in_flight();
        if !self.semaphores_stale && self.semaphores.len() == wanted {
            return Ok(());
        }

        let device = Arc::clone(&self.device);
        let driver = device.driver();
        let mut fresh = Vec::with_capacity(wanted);
        for _ in 0..wanted {
            match FrameSemaphores::new(driver) {
                Ok(pair) => fresh.push(pair),
                Err(e) => {
                    for pair in &fresh {
                        pair.destroy(driver);
                    }
                    return Err(e);
                }
            }
        }
        for pair in std::mem::replace(&mut self.semaphores, fresh) {
            pair.destroy(driver);
        }
        self.semaphores_stale = false;
        Ok(())
    }

    /// Create the new swap chain and its views, then swap them in. On
    /// failure the old image set stays and the swap chain reports that it
    /// needs recreating.
    fn build(&mut self) -> GpuResult<()> {
        self.ensure_semaphores()?;

        let device = Arc::clone(&self.device);
        let driver = device.driver();
        let old = self.target.handle();

        let request = SwapchainRequest {
            surface: self.surface,
            extent: self.requested_extent,
            present_mode: self.requested_present_mode,
            image_count: self.preferred_image_count,
            old,
        };
        let created = match driver.create_swapchain(&request) {
            Ok(created) => created,
            Err(e) => {
                // An old swap chain handed to the driver is retired either way
                self.target.record_status(PresentStatus::OutOfDate);
                return Err(e);
            }
        };

        let mut images = Vec::with_capacity(created.images.len());
        for &image in &created.images {
            match driver.create_image_view(image, created.format) {
                Ok(view) => images.push(SwapchainImage { image, view, format: created.format }),
                Err(e) => {
                    for image in &images {
                        driver.destroy_image_view(image.view);
                    }
                    driver.destroy_swapchain(created.handle);
                    self.target.record_status(PresentStatus::OutOfDate);
                    return Err(e);
                }
            }
        }

        self.destroy_views();
        if old != vk::SwapchainKHR::null() {
            driver.destroy_swapchain(old);
        }
        let image_count = images.len() as u32;
        self.images = images;
        self.target.reset(created.handle, image_count);
        self.format = created.format;
        self.extent = created.extent;
        self.present_mode = created.present_mode;
        self.outstanding.resize_with(image_count as usize, Vec::new);

        self.minimized = false;
        log::info!(
            "Swap chain ready: {} images, {}x{}, {:?}",
            image_count,
            self.extent.width,
            self.extent.height,
            self.present_mode
        );
        Ok(())
    }

    fn destroy_views(&mut self) {
        let driver = self.device.driver();
        for image in self.images.drain(..) {
            driver.destroy_image_view(image.view);
        }
    }

    fn release_outstanding(&mut self) {
        for list in &mut self.outstanding {
            for commands in list.drain(..) {
                self.device.release_commands(commands);
            }
        }
    }
}

impl Drop for SwapChain {
    fn drop(&mut self) {
        if let Err(e) = self.drain() {
            log::error!("Failed waiting for swap chain work: {}", e);
        }
        self.destroy_views();

        let driver = self.device.driver();
        for semaphores in self.semaphores.drain(..) {
            semaphores.destroy(driver);
        }
        let handle = self.target.handle();
        if handle != vk::SwapchainKHR::null() {
            driver.destroy_swapchain(handle);
        }
    }
}

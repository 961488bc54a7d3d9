// =============================================================================
// VKFRAME DEMO - frame loop on top of the submission core
// =============================================================================
//
// Clears the window to the configured color every frame. Exercises the whole
// frame protocol against a real GPU:
//
// FRAME FLOW:
// 1. Recreate the swap chain if a resize or a bad present status asked for it
// 2. Acquire the next image (waits for the in-flight slot)
// 3. Record: UNDEFINED -> TRANSFER_DST, clear, TRANSFER_DST -> PRESENT
// 4. Hand the command buffer to the swap chain
// 5. Flush the device: one submit, one present, next slot
//
// KEYS: Esc quit, F11 fullscreen, P cycle present mode
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use std::time::Instant;
use vkframe::backend::{
    AcquireOutcome, CommandBuffer, CommandPurpose, Device, FlushOutcome, SwapChain, SwapChainDesc,
    VulkanDriver,
};
use vkframe::config::Config;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

const PRESENT_MODES: [vk::PresentModeKHR; 3] = [
    vk::PresentModeKHR::FIFO,
    vk::PresentModeKHR::MAILBOX,
    vk::PresentModeKHR::IMMEDIATE,
];

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let config = Config::load();
    log::info!("Starting vkframe demo");
    log::info!(
        "Window: {}x{} ({}), {} frames in flight",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" },
        config.graphics.frames_in_flight
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Cleanup order is explicit in `Drop`: swap chain, device, surface, driver.
struct App {
    config: Config,

    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    driver: Option<Arc<VulkanDriver>>,
    surface: Option<vk::SurfaceKHR>,
    device: Option<Arc<Device>>,
    swapchain: Option<SwapChain>,

    present_mode: vk::PresentModeKHR,
    needs_resize: bool,

    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let present_mode = config.present_mode();
        let now = Instant::now();
        Self {
            config,
            window: None,
            is_fullscreen,
            driver: None,
            surface: None,
            device: None,
            swapchain: None,
            present_mode,
            needs_resize: false,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn init_vulkan(&mut self, window: &Window) -> Result<()> {
        log::info!("Initializing Vulkan...");

        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;
        let (driver, surface) = VulkanDriver::new(&self.config.window.title, enable_validation, window)?;
        self.driver = Some(Arc::clone(&driver));
        self.surface = Some(surface);

        let device = Device::new(driver, &self.config.device_config())
            .context("Failed to create device")?;
        self.device = Some(Arc::clone(&device));

        let size = window.inner_size();
        let swapchain = SwapChain::new(
            device,
            SwapChainDesc {
                surface,
                width: size.width,
                height: size.height,
                present_mode: self.present_mode,
                image_count: self.config.graphics.image_count,
            },
        )
        .context("Failed to create swap chain")?;
        self.swapchain = Some(swapchain);

        log::info!("Vulkan initialized successfully!");
        Ok(())
    }

    // =========================================================================
    // RENDERING
    // =========================================================================

    /// Returns true if a frame was submitted.
    fn render_frame(&mut self) -> Result<bool> {
        let (Some(window), Some(device), Some(swapchain)) =
            (self.window.as_ref(), self.device.as_ref(), self.swapchain.as_mut())
        else {
            return Ok(false);
        };

        if self.needs_resize || swapchain.needs_recreate() {
            let size = window.inner_size();
            swapchain.recreate(size.width, size.height, self.present_mode)?;
            self.needs_resize = false;
        }

        let index = match swapchain.acquire_next_image()? {
            AcquireOutcome::Acquired(index) | AcquireOutcome::Suboptimal(index) => index,
            AcquireOutcome::OutOfDate => {
                self.needs_resize = true;
                return Ok(false);
            }
            AcquireOutcome::Minimized => return Ok(false),
        };

        let image = *swapchain.image(index);
        let mut cmd = CommandBuffer::new(device, CommandPurpose::Graphics)?;
        cmd.transition_image(&image, vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        cmd.clear_color_image(&image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, self.config.graphics.clear_color);
        cmd.transition_image(
            &image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
        swapchain.submit_command_buffer(cmd)?;

        if let FlushOutcome::Submitted { present: Some(status), .. } = device.submit_pending_work()? {
            if status.needs_recreate() {
                self.needs_resize = true;
            }
        }
        Ok(true)
    }

    // =========================================================================
    // WINDOW CONTROLS
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            self.needs_resize = true;
        }
    }

    fn cycle_present_mode(&mut self) {
        let next = PRESENT_MODES
            .iter()
            .position(|&mode| mode == self.present_mode)
            .map_or(0, |i| (i + 1) % PRESENT_MODES.len());
        self.present_mode = PRESENT_MODES[next];

        if let Some(swapchain) = self.swapchain.as_mut() {
            match swapchain.change_present_mode(self.present_mode) {
                Ok(()) => log::info!("Present mode: {:?}", swapchain.present_mode()),
                Err(e) => log::error!("Failed to change present mode: {}", e),
            }
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            if let (Some(window), Some(swapchain)) = (&self.window, &self.swapchain) {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{:?}]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    swapchain.present_mode()
                ));
            }
            if let Some(device) = &self.device {
                log::debug!("{:?}", device.stats());
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));
        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_vulkan(&window) {
            log::error!("Failed to initialize Vulkan: {:?}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                if let Some(ref device) = self.device {
                    if let Err(e) = device.wait_device_idle() {
                        log::error!("Failed to idle device: {}", e);
                    }
                }
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.needs_resize = true;
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => log::error!("Render error: {:?}", e),
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() && !event.repeat {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            KeyCode::KeyP => self.cycle_present_mode(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        // Waits for every frame still rendering into its images
        self.swapchain = None;
        self.device = None;

        if let (Some(driver), Some(surface)) = (self.driver.take(), self.surface.take()) {
            driver.destroy_surface(surface);
        }

        log::info!("Cleanup complete");
    }
}

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ash::vk;
use vkframe::backend::{
    AcquireOutcome, Buffer, CommandPurpose, FlushOutcome, HeadlessDriver, PresentStatus, SwapChain,
};

#[test]
fn minimized_swap_chain_skips_acquire_and_present() {
    let driver = Arc::new(HeadlessDriver::immediate());
    let device = common::device(&driver, 2);
    let mut swapchain = common::swapchain(&device, 640, 480, 3);
    common::render_frame(&device, &mut swapchain);

    swapchain
        .recreate(0, 0, vk::PresentModeKHR::FIFO)
        .unwrap();
    assert!(swapchain.is_minimized());
    let before = driver.stats();

    assert_eq!(swapchain.acquire_next_image().unwrap(), AcquireOutcome::Minimized);
    let cmd = device.create_command_buffer(CommandPurpose::Graphics).unwrap();
    swapchain.submit_command_buffer(cmd).unwrap();
    assert_eq!(device.submit_pending_work().unwrap(), FlushOutcome::Empty);

    let after = driver.stats();
    assert_eq!(after.acquire_calls, before.acquire_calls);
    assert_eq!(after.present_calls, before.present_calls);
    assert_eq!(after.swapchains_created, before.swapchains_created);
    assert_eq!(device.stats().pools_checked_out, 0);

    swapchain
        .recreate(800, 600, vk::PresentModeKHR::FIFO)
        .unwrap();
    assert!(!swapchain.is_minimized());
    assert_eq!(swapchain.image_count(), 3);
    assert_eq!(swapchain.extent(), vk::Extent2D { width: 800, height: 600 });
    assert_eq!(driver.stats().live_swapchains, 1);
    assert_eq!(driver.stats().live_image_views, 3);

    common::render_frame(&device, &mut swapchain);
    assert_eq!(driver.stats().present_calls, before.present_calls + 1);
}

#[test]
fn zero_sized_creation_defers_until_resize() {
    let driver = Arc::new(HeadlessDriver::immediate());
    let device = common::device(&driver, 2);
    let mut swapchain = common::swapchain(&device, 0, 0, 3);

    assert!(swapchain.is_minimized());
    assert_eq!(swapchain.image_count(), 0);
    assert_eq!(driver.stats().swapchains_created, 0);

    swapchain.recreate(320, 200, vk::PresentModeKHR::MAILBOX).unwrap();
    assert_eq!(swapchain.image_count(), 3);
    assert_eq!(swapchain.present_mode(), vk::PresentModeKHR::MAILBOX);
}

#[test]
fn out_of_date_is_reported_and_cleared_by_recreate() {
    let driver = Arc::new(HeadlessDriver::immediate());
    let device = common::device(&driver, 2);
    let mut swapchain = common::swapchain(&device, 640, 480, 3);
    common::render_frame(&device, &mut swapchain);

    driver.invalidate_swapchains();
    assert_eq!(swapchain.acquire_next_image().unwrap(), AcquireOutcome::OutOfDate);
    assert!(swapchain.needs_recreate());

    let old = swapchain.handle();
    swapchain.recreate(640, 480, vk::PresentModeKHR::FIFO).unwrap();
    assert_ne!(swapchain.handle(), old);
    assert!(!swapchain.needs_recreate());
    assert_eq!(driver.stats().live_swapchains, 1);

    common::render_frame(&device, &mut swapchain);
}

#[test]
fn present_status_reaches_the_flush_caller() {
    let driver = Arc::new(HeadlessDriver::immediate());
    let device = common::device(&driver, 2);
    let mut swapchain = common::swapchain(&device, 640, 480, 3);

    let index = swapchain.acquire_next_image().unwrap().image_index().unwrap();
    let image = *swapchain.image(index);
    let mut cmd = device.create_command_buffer(CommandPurpose::Graphics).unwrap();
    cmd.clear_color_image(&image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, [0.0; 4]);
    swapchain.submit_command_buffer(cmd).unwrap();

    // Surface changes between acquire and present
    driver.invalidate_swapchains();
    let outcome = device.submit_pending_work().unwrap();
    assert_eq!(
        outcome,
        FlushOutcome::Submitted { serial: 1, present: Some(PresentStatus::OutOfDate) }
    );
    assert!(swapchain.needs_recreate());
}

#[test]
fn change_present_mode_rebuilds_images() {
    let driver = Arc::new(HeadlessDriver::immediate());
    let device = common::device(&driver, 2);
    let mut swapchain = common::swapchain(&device, 640, 480, 3);
    common::render_frame(&device, &mut swapchain);

    swapchain.change_present_mode(vk::PresentModeKHR::IMMEDIATE).unwrap();
    assert_eq!(swapchain.present_mode(), vk::PresentModeKHR::IMMEDIATE);
    assert_eq!(swapchain.extent(), vk::Extent2D { width: 640, height: 480 });
    assert_eq!(driver.stats().swapchains_created, 2);
    assert_eq!(device.stats().pools_checked_out, 0);
}

#[test]
fn acquired_image_releases_its_previous_pools() {
    let driver = Arc::new(HeadlessDriver::immediate());
    let device = common::device(&driver, 2);
    let mut swapchain = common::swapchain(&device, 640, 480, 3);

    let first = common::render_frame(&device, &mut swapchain);
    assert_eq!(swapchain.outstanding(first), 1);
    common::render_frame(&device, &mut swapchain);
    common::render_frame(&device, &mut swapchain);

    // Round-robin hands back the first image
    let index = swapchain.acquire_next_image().unwrap().image_index().unwrap();
    assert_eq!(index, first);
    assert_eq!(swapchain.outstanding(first), 0);

    let image = *swapchain.image(index);
    let mut cmd = device.create_command_buffer(CommandPurpose::Graphics).unwrap();
    cmd.clear_color_image(&image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, [0.0; 4]);
    swapchain.submit_command_buffer(cmd).unwrap();
    device.submit_pending_work().unwrap();
    assert_eq!(swapchain.outstanding(first), 1);
}

#[test]
fn image_slots_recycle_safely_with_gpu_lagging() {
    // The headless driver panics if a pool is freed while its work is
    // still executing; a completer thread retires work at its own pace
    let driver = Arc::new(HeadlessDriver::manual());
    let device = common::device(&driver, 2);
    let stop = Arc::new(AtomicBool::new(false));

    let completer = {
        let driver = Arc::clone(&driver);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut tick = 0u32;
            while !stop.load(Ordering::Relaxed) {
                if driver.wait_for_pending(1, Duration::from_millis(10)) {
                    tick += 1;
                    thread::sleep(Duration::from_micros(200 * (tick % 4) as u64));
                    driver.complete_next();
                }
            }
        })
    };

    {
        let mut swapchain = common::swapchain(&device, 640, 480, 3);
        for _ in 0..60 {
            let cmd = device.create_command_buffer(CommandPurpose::Graphics).unwrap();
            device.send_command_buffer(cmd).unwrap();
            common::render_frame(&device, &mut swapchain);
        }
        swapchain.wait_idle().unwrap();
    }

    stop.store(true, Ordering::Relaxed);
    completer.join().unwrap();
    driver.complete_all();
    device.wait_for_release().unwrap();

    assert_eq!(device.stats().frames_submitted, 60);
    assert_eq!(device.stats().pools_checked_out, 0);
    assert_eq!(driver.stats().live_command_buffers, 0);
}

/// Acquire and submit one clear without flushing.
fn submit_unflushed(device: &Arc<vkframe::backend::Device>, swapchain: &mut SwapChain) {
    let index = swapchain.acquire_next_image().unwrap().image_index().unwrap();
    let image = *swapchain.image(index);
    let mut cmd = device.create_command_buffer(CommandPurpose::Graphics).unwrap();
    cmd.clear_color_image(&image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, [0.0; 4]);
    swapchain.submit_command_buffer(cmd).unwrap();
}

#[test]
fn recreate_drops_work_submitted_but_not_flushed() {
    let driver = Arc::new(HeadlessDriver::immediate());
    let device = common::device(&driver, 2);
    let mut swapchain = common::swapchain(&device, 640, 480, 3);
    let scratch = Buffer::staging(&device, 4).unwrap();

    submit_unflushed(&device, &mut swapchain);
    swapchain.recreate(800, 600, vk::PresentModeKHR::FIFO).unwrap();

    assert_eq!(device.submit_pending_work().unwrap(), FlushOutcome::Empty);
    assert_eq!(device.stats().pools_checked_out, 0);
    assert_eq!(driver.stats().live_command_buffers, 0);
    assert_eq!(driver.stats().submit_calls, 0);

    // Nothing is left unflushed, so no frame can still read it
    drop(scratch);
    assert_eq!(driver.stats().live_buffers, 0);

    common::render_frame(&device, &mut swapchain);
    assert_eq!(driver.stats().images_presented, 1);
}

#[test]
fn wait_idle_drops_work_submitted_but_not_flushed() {
    let driver = Arc::new(HeadlessDriver::manual());
    let device = common::device(&driver, 2);
    let mut swapchain = common::swapchain(&device, 640, 480, 3);

    submit_unflushed(&device, &mut swapchain);
    swapchain.wait_idle().unwrap();
    assert_eq!(device.submit_pending_work().unwrap(), FlushOutcome::Empty);
    assert_eq!(driver.pending_work(), 0);
    assert_eq!(device.stats().pools_checked_out, 0);

    common::render_frame(&device, &mut swapchain);
    driver.complete_all();
    swapchain.wait_idle().unwrap();
}

#[test]
fn more_slots_than_images_keeps_semaphores_per_slot() {
    let driver = Arc::new(HeadlessDriver::manual());
    let device = common::device(&driver, 3);
    let stop = Arc::new(AtomicBool::new(false));

    let completer = {
        let driver = Arc::clone(&driver);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                if driver.wait_for_pending(1, Duration::from_millis(10)) {
                    thread::sleep(Duration::from_micros(300));
                    driver.complete_next();
                }
            }
        })
    };

    {
        let mut swapchain = common::swapchain(&device, 640, 480, 2);
        assert_eq!(swapchain.image_count(), 2);
        assert_eq!(driver.stats().live_semaphores, 6);

        for _ in 0..40 {
            common::render_frame(&device, &mut swapchain);
        }
        swapchain.wait_idle().unwrap();
        assert_eq!(driver.stats().semaphores_created, 6);
    }

    stop.store(true, Ordering::Relaxed);
    completer.join().unwrap();
    assert_eq!(device.stats().frames_submitted, 40);
    assert_eq!(driver.stats().images_presented, 40);
    assert_eq!(driver.stats().live_semaphores, 0);
}

#[test]
fn failed_swap_chain_creation_keeps_the_old_images() {
    let driver = Arc::new(HeadlessDriver::immediate());
    let device = common::device(&driver, 2);
    let mut swapchain = common::swapchain(&device, 640, 480, 3);
    common::render_frame(&device, &mut swapchain);

    // Acquired, then abandoned by the failing rebuild
    swapchain.acquire_next_image().unwrap();
    driver.fail_next_swapchain();
    assert!(swapchain.recreate(800, 600, vk::PresentModeKHR::FIFO).is_err());

    assert!(swapchain.needs_recreate());
    assert_eq!(swapchain.image_count(), 3);
    assert_eq!(swapchain.extent(), vk::Extent2D { width: 640, height: 480 });
    assert_eq!(swapchain.current_image(), None);
    assert_eq!(swapchain.acquire_next_image().unwrap(), AcquireOutcome::OutOfDate);

    swapchain.recreate(800, 600, vk::PresentModeKHR::FIFO).unwrap();
    assert!(!swapchain.needs_recreate());
    assert_eq!(swapchain.extent(), vk::Extent2D { width: 800, height: 600 });
    assert_eq!(driver.stats().live_swapchains, 1);
    assert_eq!(driver.stats().live_image_views, 3);
    common::render_frame(&device, &mut swapchain);
}

#[test]
fn failed_image_view_rolls_back_the_new_swap_chain() {
    let driver = Arc::new(HeadlessDriver::immediate());
    let device = common::device(&driver, 2);
    let mut swapchain = common::swapchain(&device, 640, 480, 3);
    common::render_frame(&device, &mut swapchain);
    let old = swapchain.handle();

    driver.fail_image_view_after(1);
    assert!(swapchain.recreate(800, 600, vk::PresentModeKHR::FIFO).is_err());

    assert_eq!(swapchain.handle(), old);
    assert_eq!(swapchain.image_count(), 3);
    assert!(swapchain.needs_recreate());
    let stats = driver.stats();
    assert_eq!(stats.live_swapchains, 1);
    assert_eq!(stats.live_image_views, 3);
    assert_eq!(stats.swapchains_created, 2);

    swapchain.recreate(800, 600, vk::PresentModeKHR::FIFO).unwrap();
    assert_ne!(swapchain.handle(), old);
    assert_eq!(driver.stats().live_swapchains, 1);
    assert_eq!(driver.stats().live_image_views, 3);
    common::render_frame(&device, &mut swapchain);
}

#[test]
fn semaphores_survive_resize_but_not_abandoned_frames() {
    let driver = Arc::new(HeadlessDriver::immediate());
    let device = common::device(&driver, 2);
    let mut swapchain = common::swapchain(&device, 640, 480, 3);
    assert_eq!(driver.stats().semaphores_created, 4);
    common::render_frame(&device, &mut swapchain);

    swapchain.recreate(800, 600, vk::PresentModeKHR::FIFO).unwrap();
    swapchain.recreate(0, 0, vk::PresentModeKHR::FIFO).unwrap();
    swapchain.recreate(640, 480, vk::PresentModeKHR::FIFO).unwrap();
    assert_eq!(driver.stats().semaphores_created, 4);
    common::render_frame(&device, &mut swapchain);

    // The acquire left an image-available semaphore signaled
    swapchain.acquire_next_image().unwrap();
    swapchain.recreate(640, 480, vk::PresentModeKHR::FIFO).unwrap();
    assert_eq!(driver.stats().semaphores_created, 8);
    assert_eq!(driver.stats().live_semaphores, 4);
    common::render_frame(&device, &mut swapchain);

    // So did the withdrawn submission that would have waited on it
    submit_unflushed(&device, &mut swapchain);
    swapchain.wait_idle().unwrap();
    assert_eq!(driver.stats().semaphores_created, 12);
    assert_eq!(driver.stats().live_semaphores, 4);
    common::render_frame(&device, &mut swapchain);

    drop(swapchain);
    assert_eq!(driver.stats().live_semaphores, 0);
    let mut fresh = common::swapchain(&device, 640, 480, 3);
    assert_eq!(driver.stats().semaphores_created, 16);
    common::render_frame(&device, &mut fresh);
}

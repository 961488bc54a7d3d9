mod common;

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use vkframe::backend::{CommandPurpose, FlushOutcome, HeadlessDriver, PresentStatus};

const BLOCKED: Duration = Duration::from_millis(150);
const PATIENCE: Duration = Duration::from_secs(5);

fn send_offscreen(device: &Arc<vkframe::backend::Device>) {
    let cmd = device.create_command_buffer(CommandPurpose::Graphics).unwrap();
    device.send_command_buffer(cmd).unwrap();
}

#[test]
fn flush_blocks_until_slot_fence_signals() {
    let driver = Arc::new(HeadlessDriver::manual());
    let device = common::device(&driver, 2);

    // Two frames fill both slots without blocking
    send_offscreen(&device);
    device.submit_pending_work().unwrap();
    send_offscreen(&device);
    device.submit_pending_work().unwrap();
    assert_eq!(driver.pending_work(), 2);
    assert_eq!(driver.stats().blocking_fence_waits, 0);

    let (tx, rx) = mpsc::channel();
    let worker = {
        let device = Arc::clone(&device);
        thread::spawn(move || {
            send_offscreen(&device);
            let outcome = device.submit_pending_work().unwrap();
            tx.send(outcome).unwrap();
        })
    };

    // The third flush reuses slot 0, still owned by frame 1
    assert!(rx.recv_timeout(BLOCKED).is_err());
    assert!(driver.complete_next());
    let outcome = rx.recv_timeout(PATIENCE).expect("third flush never unblocked");
    worker.join().unwrap();

    assert_eq!(outcome, FlushOutcome::Submitted { serial: 3, present: None });
    assert_eq!(driver.stats().blocking_fence_waits, 1);

    driver.complete_all();
    device.wait_for_release().unwrap();
    assert_eq!(device.stats().pools_checked_out, 0);
}

#[test]
fn empty_flush_touches_nothing() {
    let driver = Arc::new(HeadlessDriver::immediate());
    let device = common::device(&driver, 2);
    let mut swapchain = common::swapchain(&device, 640, 480, 3);

    common::render_frame(&device, &mut swapchain);
    let before = driver.stats();
    let device_before = device.stats();

    assert_eq!(device.submit_pending_work().unwrap(), FlushOutcome::Empty);
    assert_eq!(device.submit_pending_work().unwrap(), FlushOutcome::Empty);

    let after = driver.stats();
    assert_eq!(after.submit_calls, before.submit_calls);
    assert_eq!(after.present_calls, before.present_calls);
    assert_eq!(device.stats().current_slot, device_before.current_slot);
    assert_eq!(device.stats().frames_submitted, device_before.frames_submitted);
}

#[test]
fn three_images_two_slots_five_frames() {
    let driver = Arc::new(HeadlessDriver::manual());
    let device = common::device(&driver, 2);
    let (tx, rx) = mpsc::channel();

    let worker = {
        let device = Arc::clone(&device);
        thread::spawn(move || {
            let mut swapchain = common::swapchain(&device, 800, 600, 3);
            assert_eq!(swapchain.image_count(), 3);
            for frame in 1..=5u32 {
                let index = swapchain.acquire_next_image().unwrap().image_index().unwrap();
                tx.send(frame).unwrap();

                let image = *swapchain.image(index);
                let mut cmd = device.create_command_buffer(CommandPurpose::Graphics).unwrap();
                cmd.clear_color_image(&image, ash::vk::ImageLayout::TRANSFER_DST_OPTIMAL, [1.0; 4]);
                swapchain.submit_command_buffer(cmd).unwrap();
                device.submit_pending_work().unwrap();
            }
            swapchain.wait_idle().unwrap();
            assert!((0..3).all(|image| swapchain.outstanding(image) == 0));
        })
    };

    assert_eq!(rx.recv_timeout(PATIENCE), Ok(1));
    assert_eq!(rx.recv_timeout(PATIENCE), Ok(2));
    // Frame 3 waits for frame 1's fence
    assert!(rx.recv_timeout(BLOCKED).is_err());
    driver.complete_next();
    assert_eq!(rx.recv_timeout(PATIENCE), Ok(3));
    // Frame 4 waits for frame 2's fence
    assert!(rx.recv_timeout(BLOCKED).is_err());
    driver.complete_next();
    assert_eq!(rx.recv_timeout(PATIENCE), Ok(4));
    driver.complete_next();
    assert_eq!(rx.recv_timeout(PATIENCE), Ok(5));

    while !worker.is_finished() {
        driver.complete_all();
        thread::sleep(Duration::from_millis(5));
    }
    worker.join().unwrap();

    let stats = device.stats();
    assert_eq!(stats.frames_submitted, 5);
    assert_eq!(stats.pools_checked_out, 0);
    assert_eq!(driver.stats().live_command_buffers, 0);
    assert_eq!(driver.stats().submit_calls, 5);
    assert_eq!(driver.stats().present_calls, 5);
}

#[test]
fn one_submit_and_one_present_for_all_windows() {
    let driver = Arc::new(HeadlessDriver::immediate());
    let device = common::device(&driver, 2);
    let mut first = common::swapchain(&device, 640, 480, 3);
    let mut second = common::swapchain(&device, 320, 240, 2);

    for swapchain in [&mut first, &mut second] {
        let index = swapchain.acquire_next_image().unwrap().image_index().unwrap();
        let image = *swapchain.image(index);
        let mut cmd = device.create_command_buffer(CommandPurpose::Graphics).unwrap();
        cmd.clear_color_image(&image, ash::vk::ImageLayout::TRANSFER_DST_OPTIMAL, [0.5; 4]);
        swapchain.submit_command_buffer(cmd).unwrap();
    }
    send_offscreen(&device);

    let outcome = device.submit_pending_work().unwrap();
    assert_eq!(
        outcome,
        FlushOutcome::Submitted { serial: 1, present: Some(PresentStatus::Optimal) }
    );
    let stats = driver.stats();
    assert_eq!(stats.submit_calls, 1);
    assert_eq!(stats.command_buffers_submitted, 3);
    assert_eq!(stats.present_calls, 1);
    assert_eq!(stats.images_presented, 2);
}

#[test]
fn fence_timeout_surfaces_as_driver_error() {
    let driver = Arc::new(HeadlessDriver::manual());
    let device = vkframe::backend::Device::new(
        driver.clone(),
        &vkframe::backend::DeviceConfig {
            frames_in_flight: 1,
            fence_timeout: Duration::from_millis(20).as_nanos() as u64,
        },
    )
    .unwrap();

    send_offscreen(&device);
    device.submit_pending_work().unwrap();
    send_offscreen(&device);
    let err = device.submit_pending_work().unwrap_err();
    assert!(err.to_string().contains("vkWaitForFences"), "{err}");

    driver.complete_all();
    device.wait_for_release().unwrap();
}

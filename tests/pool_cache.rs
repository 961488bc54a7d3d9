mod common;

use std::sync::Arc;
use std::thread;

use vkframe::backend::{CommandPurpose, HeadlessConfig, HeadlessDriver, PoolFamily};

#[test]
fn ten_thousand_acquire_release_cycles_reuse_one_pool() {
    let driver = Arc::new(HeadlessDriver::immediate());
    let device = common::device(&driver, 2);

    for i in 0..10_000 {
        let token = if i % 2 == 0 {
            device.acquire_graphics_command_pool().unwrap()
        } else {
            device.acquire_transfer_command_pool().unwrap()
        };
        device.return_command_pool(token);
    }

    let stats = device.stats();
    assert_eq!(stats.pools_created, 1);
    assert_eq!(stats.pools_checked_out, 0);
    assert_eq!(stats.idle_graphics_pools, 1);
}

#[test]
fn dedicated_transfer_keeps_separate_free_lists() {
    let driver = Arc::new(HeadlessDriver::new(HeadlessConfig {
        dedicated_transfer: true,
        ..Default::default()
    }));
    let device = common::device(&driver, 2);

    let graphics = device.acquire_graphics_command_pool().unwrap();
    let transfer = device.acquire_transfer_command_pool().unwrap();
    assert_eq!(graphics.family(), PoolFamily::Graphics);
    assert_eq!(transfer.family(), PoolFamily::Transfer);
    assert_ne!(graphics.pool(), transfer.pool());

    device.return_graphics_command_pool(graphics);
    device.return_transfer_command_pool(transfer);
    assert_eq!(device.stats().idle_graphics_pools, 1);
    assert_eq!(device.stats().idle_transfer_pools, 1);
}

#[test]
fn concurrent_churn_never_shares_or_leaks_pools() {
    const THREADS: usize = 8;
    const CYCLES: usize = 1_000;

    let driver = Arc::new(HeadlessDriver::immediate());
    let device = common::device(&driver, 2);

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let device = Arc::clone(&device);
            thread::spawn(move || {
                for i in 0..CYCLES {
                    let purpose = if (t + i) % 3 == 0 {
                        CommandPurpose::Transfer
                    } else {
                        CommandPurpose::Graphics
                    };
                    // Abandoned: the drop returns the pool
                    let cmd = device.create_command_buffer(purpose).unwrap();
                    drop(cmd);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let stats = device.stats();
    assert!(stats.pools_created <= THREADS, "created {} pools", stats.pools_created);
    assert_eq!(stats.pools_checked_out, 0);
    assert_eq!(stats.idle_graphics_pools, stats.pools_created);
    assert_eq!(driver.stats().live_command_buffers, 0);
    assert_eq!(driver.stats().live_pools, stats.pools_created);
}

#[test]
fn frame_loop_pool_count_is_bounded() {
    let driver = Arc::new(HeadlessDriver::immediate());
    let device = common::device(&driver, 2);
    let mut swapchain = common::swapchain(&device, 640, 480, 3);

    for _ in 0..200 {
        let cmd = device.create_command_buffer(CommandPurpose::Graphics).unwrap();
        device.send_command_buffer(cmd).unwrap();
        common::render_frame(&device, &mut swapchain);
    }

    // Per image one swap chain pool, per slot one off-screen pool, one recording
    let stats = device.stats();
    assert!(stats.pools_created <= 3 + 2 + 1, "created {} pools", stats.pools_created);

    swapchain.wait_idle().unwrap();
    assert_eq!(device.stats().pools_checked_out, 0);
}

#[test]
fn device_drop_destroys_every_pool_and_fence() {
    let driver = Arc::new(HeadlessDriver::immediate());
    {
        let device = common::device(&driver, 2);
        let mut swapchain = common::swapchain(&device, 640, 480, 3);
        for _ in 0..5 {
            common::render_frame(&device, &mut swapchain);
        }
    }

    let stats = driver.stats();
    assert_eq!(stats.live_pools, 0);
    assert_eq!(stats.live_command_buffers, 0);
    assert_eq!(stats.live_fences, 0);
    assert_eq!(stats.live_semaphores, 0);
    assert_eq!(stats.live_image_views, 0);
    assert_eq!(stats.live_swapchains, 0);
}

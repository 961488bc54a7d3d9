#![allow(dead_code)]

use std::sync::Arc;

use ash::vk;
use vkframe::backend::{
    CommandPurpose, Device, DeviceConfig, HeadlessDriver, SwapChain, SwapChainDesc,
};

pub fn device(driver: &Arc<HeadlessDriver>, frames_in_flight: usize) -> Arc<Device> {
    let config = DeviceConfig {
        frames_in_flight,
        ..Default::default()
    };
    Device::new(driver.clone(), &config).expect("device")
}

pub fn swapchain(device: &Arc<Device>, width: u32, height: u32, image_count: u32) -> SwapChain {
    SwapChain::new(
        Arc::clone(device),
        SwapChainDesc {
            surface: vk::SurfaceKHR::null(),
            width,
            height,
            present_mode: vk::PresentModeKHR::FIFO,
            image_count,
        },
    )
    .expect("swap chain")
}

/// Acquire, record one clear, submit and flush.
pub fn render_frame(device: &Arc<Device>, swapchain: &mut SwapChain) -> u32 {
    let index = swapchain
        .acquire_next_image()
        .expect("acquire")
        .image_index()
        .expect("image");
    let image = *swapchain.image(index);
    let mut cmd = device.create_command_buffer(CommandPurpose::Graphics).expect("command buffer");
    cmd.transition_image(&image, vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    cmd.clear_color_image(&image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, [0.0, 0.0, 0.0, 1.0]);
    cmd.transition_image(&image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::PRESENT_SRC_KHR);
    swapchain.submit_command_buffer(cmd).expect("submit");
    device.submit_pending_work().expect("flush");
    index
}

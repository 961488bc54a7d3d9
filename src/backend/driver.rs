// Driver seam
//
// Everything the submission core needs from the native graphics API goes
// through this trait. `VulkanDriver` talks to a real GPU through ash,
// `HeadlessDriver` simulates one in-process.
//
// Handles are ash's `vk::*` types so both drivers share one vocabulary.

use ash::vk;
use super::error::{GpuResult, PresentStatus};

/// Queue roles the core submits to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Present,
    /// Falls back to the graphics queue when the GPU has no dedicated one.
    Transfer,
}

/// Queue family a command pool allocates for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolFamily {
    Graphics,
    Transfer,
}

/// One native submit record.
#[derive(Debug, Clone, Default)]
pub struct SubmitBatch {
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub wait_stages: Vec<vk::PipelineStageFlags>,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub signal_semaphores: Vec<vk::Semaphore>,
}

/// One entry of a batched present call.
#[derive(Debug, Clone, Copy)]
pub struct PresentRequest {
    pub swapchain: vk::SwapchainKHR,
    pub image_index: u32,
    pub wait_semaphore: vk::Semaphore,
}

/// Result of asking the presentation layer for the next image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireResult {
    Image { index: u32, suboptimal: bool },
    OutOfDate,
}

/// Parameters for (re)building a swap chain.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainRequest {
    pub surface: vk::SurfaceKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    /// Preferred number of images; the driver clamps to surface limits.
    pub image_count: u32,
    /// Previous swap chain handed to the driver for a flicker-free switch.
    pub old: vk::SwapchainKHR,
}

#[derive(Debug, Clone)]
pub struct SwapchainImages {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferDesc {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    /// Host-visible memory can be written and read from the CPU.
    pub host_visible: bool,
}

pub trait Driver: Send + Sync {
    /// Whether transfer pools and submissions use their own queue family.
    fn has_dedicated_transfer(&self) -> bool;
    fn queue(&self, kind: QueueKind) -> vk::Queue;

    // Command pools and buffers
    fn create_command_pool(&self, family: PoolFamily) -> GpuResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> GpuResult<vk::CommandBuffer>;
    fn free_command_buffer(&self, pool: vk::CommandPool, buffer: vk::CommandBuffer);
    /// Begins recording with one-time-submit usage.
    fn begin_command_buffer(&self, buffer: vk::CommandBuffer) -> GpuResult<()>;
    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> GpuResult<()>;

    // Synchronization
    fn create_fence(&self, signaled: bool) -> GpuResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// Blocks until every fence is signaled or `timeout` nanoseconds pass.
    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: u64) -> GpuResult<()>;
    fn reset_fences(&self, fences: &[vk::Fence]) -> GpuResult<()>;
    fn fence_signaled(&self, fence: vk::Fence) -> GpuResult<bool>;
    fn create_semaphore(&self) -> GpuResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // Queues. Callers hold the queue's mutex.
    fn queue_submit(&self, queue: vk::Queue, batches: &[SubmitBatch], fence: vk::Fence) -> GpuResult<()>;
    /// Presents every request in one call; one status per request, in order.
    fn queue_present(&self, queue: vk::Queue, requests: &[PresentRequest]) -> GpuResult<Vec<PresentStatus>>;
    fn device_wait_idle(&self) -> GpuResult<()>;

    // Presentation
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
        timeout: u64,
    ) -> GpuResult<AcquireResult>;
    fn create_swapchain(&self, request: &SwapchainRequest) -> GpuResult<SwapchainImages>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> GpuResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);

    // Buffers
    fn create_buffer(&self, desc: &BufferDesc) -> GpuResult<vk::Buffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    /// Only valid for host-visible buffers.
    fn write_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) -> GpuResult<()>;
    fn read_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, out: &mut [u8]) -> GpuResult<()>;

    // Recording, forwarded onto a buffer in the recording state
    fn cmd_copy_buffer(
        &self,
        buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );
    fn cmd_transition_image(
        &self,
        buffer: vk::CommandBuffer,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    );
    fn cmd_clear_color_image(
        &self,
        buffer: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: [f32; 4],
    );
    fn cmd_bind_pipeline(
        &self,
        buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );
    fn cmd_draw(
        &self,
        buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    fn cmd_dispatch(&self, buffer: vk::CommandBuffer, x: u32, y: u32, z: u32);
}

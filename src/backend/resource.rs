// GPU resources as seen by the submission core
//
// Buffers, images and pipelines are owned by other parts of the engine.
// The core only needs their handles plus usage and layout facts, so each
// kind is reduced to a small trait.

use std::sync::Arc;

use ash::vk;

use super::device::Device;
use super::driver::BufferDesc;
use super::error::{GpuError, GpuResult};

pub trait BufferResource {
    fn handle(&self) -> vk::Buffer;
    fn size(&self) -> vk::DeviceSize;
    fn usage(&self) -> vk::BufferUsageFlags;
}

pub trait ImageResource {
    fn handle(&self) -> vk::Image;
    fn format(&self) -> vk::Format;

    fn aspect(&self) -> vk::ImageAspectFlags {
        vk::ImageAspectFlags::COLOR
    }
}

pub trait PipelineResource {
    fn handle(&self) -> vk::Pipeline;
    fn bind_point(&self) -> vk::PipelineBindPoint;
}

/// Access masks and pipeline stages for an image layout transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Barrier parameters for the layout transitions the engine uses.
/// Unknown pairs get a full (slow but correct) barrier.
pub fn transition_masks(old: vk::ImageLayout, new: vk::ImageLayout) -> TransitionMasks {
    use vk::AccessFlags as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags as S;

    let (src_access, dst_access, src_stage, dst_stage) = match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => {
            (A::empty(), A::TRANSFER_WRITE, S::TOP_OF_PIPE, S::TRANSFER)
        }
        (L::TRANSFER_DST_OPTIMAL, L::PRESENT_SRC_KHR) => {
            (A::TRANSFER_WRITE, A::empty(), S::TRANSFER, S::BOTTOM_OF_PIPE)
        }
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => {
            (A::TRANSFER_WRITE, A::SHADER_READ, S::TRANSFER, S::FRAGMENT_SHADER)
        }
        (L::UNDEFINED, L::COLOR_ATTACHMENT_OPTIMAL) => (
            A::empty(),
            A::COLOR_ATTACHMENT_WRITE,
            S::TOP_OF_PIPE,
            S::COLOR_ATTACHMENT_OUTPUT,
        ),
        (L::COLOR_ATTACHMENT_OPTIMAL, L::PRESENT_SRC_KHR) => (
            A::COLOR_ATTACHMENT_WRITE,
            A::empty(),
            S::COLOR_ATTACHMENT_OUTPUT,
            S::BOTTOM_OF_PIPE,
        ),
        _ => (
            A::MEMORY_WRITE,
            A::MEMORY_READ | A::MEMORY_WRITE,
            S::ALL_COMMANDS,
            S::ALL_COMMANDS,
        ),
    };

    TransitionMasks { src_access, dst_access, src_stage, dst_stage }
}

/// GPU buffer owned by the device's driver.
///
/// Dropping it while frames are in flight is fine: destruction is deferred
/// until every frame that may reference it has completed, including work
/// that is still recording or waiting for the next flush.
pub struct Buffer {
    device: Arc<Device>,
    handle: vk::Buffer,
    desc: BufferDesc,
}

impl Buffer {
    pub fn new(device: &Arc<Device>, desc: BufferDesc) -> GpuResult<Self> {
        let handle = device.driver().create_buffer(&desc)?;
        Ok(Self {
            device: Arc::clone(device),
            handle,
            desc,
        })
    }

    /// Host-visible buffer for uploads.
    pub fn staging(device: &Arc<Device>, size: vk::DeviceSize) -> GpuResult<Self> {
        Self::new(
            device,
            BufferDesc {
                size,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                host_visible: true,
            },
        )
    }

    pub fn is_host_visible(&self) -> bool {
        self.desc.host_visible
    }

    pub fn write(&self, offset: vk::DeviceSize, data: &[u8]) -> GpuResult<()> {
        debug_assert!(self.desc.host_visible, "write to a device-local buffer");
        GpuError::check_range(offset, data.len() as u64, self.desc.size)?;
        self.device.driver().write_buffer(self.handle, offset, data)
    }

    pub fn read(&self, offset: vk::DeviceSize, out: &mut [u8]) -> GpuResult<()> {
        debug_assert!(self.desc.host_visible, "read from a device-local buffer");
        GpuError::check_range(offset, out.len() as u64, self.desc.size)?;
        self.device.driver().read_buffer(self.handle, offset, out)
    }
}

impl BufferResource for Buffer {
    fn handle(&self) -> vk::Buffer {
        self.handle
    }

    fn size(&self) -> vk::DeviceSize {
        self.desc.size
    }

    fn usage(&self) -> vk::BufferUsageFlags {
        self.desc.usage
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.device.retire_buffer(self.handle);
    }
}

// Backend module - command submission and frame synchronization
//
// Design: the device owns queues, pacing and pool reuse; drivers are the
// only code that touches the native API.

pub mod command;
pub mod device;
pub mod driver;
pub mod error;
pub mod headless;
pub mod resource;
pub mod submit;
pub mod swapchain;
pub mod sync;
pub mod vulkan;

pub use command::{CommandBuffer, CommandPoolCache, CommandPurpose, PoolOwner, PoolToken};
pub use device::{Device, DeviceConfig, DeviceStats, FlushOutcome, SingleTimeGuard, FRAMES_IN_FLIGHT};
pub use driver::{BufferDesc, Driver, PoolFamily, QueueKind};
pub use error::{GpuError, GpuResult, PresentStatus};
pub use headless::{Completion, HeadlessConfig, HeadlessDriver, HeadlessStats};
pub use resource::{Buffer, BufferResource, ImageResource, PipelineResource};
pub use submit::{PendingSubmission, RecordedCommands, SubmissionQueue};
pub use swapchain::{AcquireOutcome, SwapChain, SwapChainDesc, SwapchainImage};
pub use vulkan::VulkanDriver;

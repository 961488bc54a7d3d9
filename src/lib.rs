//! GPU command submission and frame synchronization on top of Vulkan.
//!
//! A [`backend::Device`] paces at most N frames in flight with a ring of
//! fences, recycles command pools, and flushes every submission of a frame
//! as one queue submit plus one present. [`backend::SwapChain`] adds image
//! acquisition and recreation on resize.
//!
//! The native API sits behind [`backend::Driver`]: [`backend::VulkanDriver`]
//! drives a real GPU, [`backend::HeadlessDriver`] simulates one for tests.

pub mod backend;
pub mod config;

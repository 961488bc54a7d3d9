// Vulkan driver - real GPU through ash
//
// Responsibilities:
// - Instance creation with validation layers and platform surface extensions
// - Physical device selection (prefer discrete GPU, must present)
// - Logical device with graphics, present and transfer queues
// - Memory allocator for buffers
// - Forwarding every `Driver` call to the native API

use std::collections::{HashMap, HashSet};
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

use anyhow::{Context, Result};
use ash::extensions::{ext, khr};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};

use super::driver::*;
use super::error::{DriverContext, GpuError, GpuResult, PresentStatus};
use super::resource::transition_masks;
use super::swapchain::{choose_extent, choose_image_count, choose_present_mode, choose_surface_format};

#[derive(Debug, Clone, Copy)]
struct QueueFamilies {
    graphics: u32,
    present: u32,
    /// Transfer-only family, if the GPU has one.
    transfer: Option<u32>,
}

impl QueueFamilies {
    fn unique(&self) -> Vec<u32> {
        let mut families = vec![self.graphics, self.present];
        families.extend(self.transfer);
        let mut seen = HashSet::new();
        families.retain(|family| seen.insert(*family));
        families
    }
}

struct Memory {
    allocator: Allocator,
    buffers: HashMap<vk::Buffer, Allocation>,
}

/// Owns the Vulkan instance, device and allocator.
pub struct VulkanDriver {
    // Drop order is handled manually in `Drop`
    memory: ManuallyDrop<Mutex<Memory>>,
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    instance: ash::Instance,
    entry: Entry,

    surface_loader: khr::Surface,
    swapchain_loader: khr::Swapchain,
    debug_utils: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    families: QueueFamilies,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    transfer_queue: vk::Queue,

    properties: vk::PhysicalDeviceProperties,
}

impl VulkanDriver {
    /// Create the driver plus a surface for `window`.
    ///
    /// The surface is needed up front: the GPU is chosen by whether it can
    /// present to it. Destroy it with `destroy_surface` before dropping the
    /// driver.
    pub fn new<W>(app_name: &str, enable_validation: bool, window: &W) -> Result<(Arc<Self>, vk::SurfaceKHR)>
    where
        W: HasWindowHandle + HasDisplayHandle,
    {
        log::info!("Creating Vulkan driver: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;
        let instance = Self::create_instance(&entry, app_name, enable_validation)?;
        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let surface_loader = khr::Surface::new(&entry, &instance);
        let surface = create_surface(&entry, &instance, window)?;

        let (physical_device, families) = Self::pick_physical_device(&instance, &surface_loader, surface)?;
        let device = Self::create_logical_device(&instance, physical_device, &families)?;

        let graphics_queue = unsafe { device.get_device_queue(families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(families.present, 0) };
        let transfer_queue = match families.transfer {
            Some(family) => unsafe { device.get_device_queue(family, 0) },
            None => graphics_queue,
        };

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "Queue families: graphics {}, present {}, transfer {:?}",
            families.graphics,
            families.present,
            families.transfer
        );

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create memory allocator")?;

        let swapchain_loader = khr::Swapchain::new(&instance, &device);

        let driver = Arc::new(Self {
            memory: ManuallyDrop::new(Mutex::new(Memory {
                allocator,
                buffers: HashMap::new(),
            })),
            device,
            physical_device,
            instance,
            entry,
            surface_loader,
            swapchain_loader,
            debug_utils,
            families,
            graphics_queue,
            present_queue,
            transfer_queue,
            properties,
        });
        Ok((driver, surface))
    }

    fn create_instance(entry: &Entry, app_name: &str, enable_validation: bool) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("vkframe")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        let available: HashSet<CString> = entry
            .enumerate_instance_extension_properties(None)?
            .iter()
            .map(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }.to_owned())
            .collect();

        let mut wanted: Vec<&CStr> = vec![khr::Surface::name()];
        #[cfg(target_os = "windows")]
        wanted.push(khr::Win32Surface::name());
        #[cfg(all(unix, not(target_os = "macos")))]
        {
            wanted.push(khr::XlibSurface::name());
            wanted.push(khr::WaylandSurface::name());
        }
        if enable_validation {
            wanted.push(ext::DebugUtils::name());
        }

        let extensions: Vec<_> = wanted
            .into_iter()
            .filter(|name| {
                let supported = available.contains(*name);
                if !supported {
                    log::warn!("Instance extension {:?} not available", name);
                }
                supported
            })
            .map(CStr::as_ptr)
            .collect();

        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;
        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;
        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;
        if devices.is_empty() {
            return Err(GpuError::NoSuitableDevice.into());
        }

        let mut best = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let Some(families) = Self::find_queue_families(instance, surface_loader, surface, device)? else {
                continue;
            };

            let mut score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };
            if families.transfer.is_some() {
                score += 10;
            }

            if score > best_score {
                best_score = score;
                best = Some((device, families));
            }
        }

        best.ok_or_else(|| GpuError::NoSuitableDevice.into())
    }

    fn find_queue_families(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
        device: vk::PhysicalDevice,
    ) -> Result<Option<QueueFamilies>> {
        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };

        let mut graphics = Vec::new();
        let mut present = Vec::new();
        let mut transfer = None;
        for (index, props) in queue_families.iter().enumerate() {
            let index = index as u32;
            if props.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                graphics.push(index);
            } else if props.queue_flags.contains(vk::QueueFlags::TRANSFER)
                && !props.queue_flags.contains(vk::QueueFlags::COMPUTE)
                && transfer.is_none()
            {
                transfer = Some(index);
            }
            if unsafe { surface_loader.get_physical_device_surface_support(device, index, surface) }? {
                present.push(index);
            }
        }

        // One family doing both avoids concurrent sharing of swap chain images
        let shared = graphics.iter().copied().find(|family| present.contains(family));
        Ok(match (shared, graphics.first(), present.first()) {
            (Some(family), _, _) => Some(QueueFamilies { graphics: family, present: family, transfer }),
            (None, Some(&graphics), Some(&present)) => Some(QueueFamilies { graphics, present, transfer }),
            _ => None,
        })
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        families: &QueueFamilies,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions = [khr::Swapchain::name().as_ptr()];
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;
        Ok(device)
    }

    pub fn device_name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    /// Additional surfaces for further windows.
    pub fn create_surface<W>(&self, window: &W) -> Result<vk::SurfaceKHR>
    where
        W: HasWindowHandle + HasDisplayHandle,
    {
        let surface = create_surface(&self.entry, &self.instance, window)?;
        let supported = unsafe {
            self.surface_loader.get_physical_device_surface_support(
                self.physical_device,
                self.families.present,
                surface,
            )
        }?;
        if !supported {
            unsafe { self.surface_loader.destroy_surface(surface, None) };
            anyhow::bail!("GPU doesn't support presenting to this surface");
        }
        Ok(surface)
    }

    /// Every swap chain created on `surface` must be destroyed first.
    pub fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        unsafe { self.surface_loader.destroy_surface(surface, None) };
    }

    fn family_index(&self, family: PoolFamily) -> u32 {
        match (family, self.families.transfer) {
            (PoolFamily::Transfer, Some(transfer)) => transfer,
            _ => self.families.graphics,
        }
    }
}

fn create_surface<W>(entry: &Entry, instance: &ash::Instance, window: &W) -> Result<vk::SurfaceKHR>
where
    W: HasWindowHandle + HasDisplayHandle,
{
    let window_handle = window
        .window_handle()
        .context("Failed to get window handle")?
        .as_raw();
    let display_handle = window
        .display_handle()
        .context("Failed to get display handle")?
        .as_raw();

    let surface = match (display_handle, window_handle) {
        #[cfg(target_os = "windows")]
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
            let hinstance = handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
            let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(hinstance)
                .hwnd(hwnd);
            let loader = khr::Win32Surface::new(entry, instance);
            unsafe { loader.create_win32_surface(&create_info, None) }?
        }
        #[cfg(all(unix, not(target_os = "macos")))]
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
            let dpy = display
                .display
                .context("Xlib display handle is null")?
                .as_ptr() as *mut vk::Display;
            let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy)
                .window(handle.window);
            let loader = khr::XlibSurface::new(entry, instance);
            unsafe { loader.create_xlib_surface(&create_info, None) }?
        }
        #[cfg(all(unix, not(target_os = "macos")))]
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
            let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr())
                .surface(handle.surface.as_ptr());
            let loader = khr::WaylandSurface::new(entry, instance);
            unsafe { loader.create_wayland_surface(&create_info, None) }?
        }
        _ => return Err(GpuError::Surface("unsupported window handle type".into()).into()),
    };
    Ok(surface)
}

impl Driver for VulkanDriver {
    fn has_dedicated_transfer(&self) -> bool {
        self.families.transfer.is_some()
    }

    fn queue(&self, kind: QueueKind) -> vk::Queue {
        match kind {
            QueueKind::Graphics => self.graphics_queue,
            QueueKind::Present => self.present_queue,
            QueueKind::Transfer => self.transfer_queue,
        }
    }

    fn create_command_pool(&self, family: PoolFamily) -> GpuResult<vk::CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(self.family_index(family));
        unsafe { self.device.create_command_pool(&create_info, None) }.op("vkCreateCommandPool")
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> GpuResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .op("vkAllocateCommandBuffers")?;
        Ok(buffers[0])
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, buffer: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(pool, &[buffer]) };
    }

    fn begin_command_buffer(&self, buffer: vk::CommandBuffer) -> GpuResult<()> {
        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(buffer, &begin_info) }.op("vkBeginCommandBuffer")
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> GpuResult<()> {
        unsafe { self.device.end_command_buffer(buffer) }.op("vkEndCommandBuffer")
    }

    fn create_fence(&self, signaled: bool) -> GpuResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe { self.device.create_fence(&create_info, None) }.op("vkCreateFence")
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: u64) -> GpuResult<()> {
        unsafe { self.device.wait_for_fences(fences, true, timeout) }.op("vkWaitForFences")
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> GpuResult<()> {
        unsafe { self.device.reset_fences(fences) }.op("vkResetFences")
    }

    fn fence_signaled(&self, fence: vk::Fence) -> GpuResult<bool> {
        unsafe { self.device.get_fence_status(fence) }.op("vkGetFenceStatus")
    }

    fn create_semaphore(&self) -> GpuResult<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::builder();
        unsafe { self.device.create_semaphore(&create_info, None) }.op("vkCreateSemaphore")
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn queue_submit(&self, queue: vk::Queue, batches: &[SubmitBatch], fence: vk::Fence) -> GpuResult<()> {
        let submits: Vec<vk::SubmitInfo> = batches
            .iter()
            .map(|batch| {
                vk::SubmitInfo::builder()
                    .wait_semaphores(&batch.wait_semaphores)
                    .wait_dst_stage_mask(&batch.wait_stages)
                    .command_buffers(&batch.command_buffers)
                    .signal_semaphores(&batch.signal_semaphores)
                    .build()
            })
            .collect();
        unsafe { self.device.queue_submit(queue, &submits, fence) }.op("vkQueueSubmit")
    }

    fn queue_present(&self, queue: vk::Queue, requests: &[PresentRequest]) -> GpuResult<Vec<PresentStatus>> {
        let wait_semaphores: Vec<_> = requests.iter().map(|r| r.wait_semaphore).collect();
        let swapchains: Vec<_> = requests.iter().map(|r| r.swapchain).collect();
        let image_indices: Vec<_> = requests.iter().map(|r| r.image_index).collect();
        let mut results = vec![vk::Result::SUCCESS; requests.len()];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices)
            .results(&mut results);

        match unsafe { self.swapchain_loader.queue_present(queue, &present_info) } {
            Ok(_) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) | Err(vk::Result::ERROR_SURFACE_LOST_KHR) => {}
            Err(e) => return Err(GpuError::driver("vkQueuePresentKHR", e)),
        }

        results
            .into_iter()
            .map(|result| match result {
                vk::Result::SUCCESS => Ok(PresentStatus::Optimal),
                vk::Result::SUBOPTIMAL_KHR => Ok(PresentStatus::Suboptimal),
                vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::ERROR_SURFACE_LOST_KHR => {
                    Ok(PresentStatus::OutOfDate)
                }
                e => Err(GpuError::driver("vkQueuePresentKHR", e)),
            })
            .collect()
    }

    fn device_wait_idle(&self) -> GpuResult<()> {
        unsafe { self.device.device_wait_idle() }.op("vkDeviceWaitIdle")
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
        timeout: u64,
    ) -> GpuResult<AcquireResult> {
        let result = unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout, semaphore, vk::Fence::null())
        };
        match result {
            Ok((index, suboptimal)) => Ok(AcquireResult::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireResult::OutOfDate),
            Err(e) => Err(GpuError::driver("vkAcquireNextImageKHR", e)),
        }
    }

    fn create_swapchain(&self, request: &SwapchainRequest) -> GpuResult<SwapchainImages> {
        let surface = request.surface;
        let caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, surface)
        }
        .op("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;
        let formats = unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(self.physical_device, surface)
        }
        .op("vkGetPhysicalDeviceSurfaceFormatsKHR")?;
        let present_modes = unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(self.physical_device, surface)
        }
        .op("vkGetPhysicalDeviceSurfacePresentModesKHR")?;

        let surface_format = choose_surface_format(&formats)
            .ok_or_else(|| GpuError::Surface("no supported surface format".into()))?;
        let present_mode = choose_present_mode(&present_modes, request.present_mode);
        let extent = choose_extent(&caps, request.extent.width, request.extent.height);
        if extent.width == 0 || extent.height == 0 {
            return Err(GpuError::Surface("swap chain extent must be non-zero".into()));
        }
        let image_count = choose_image_count(&caps, request.image_count);

        let family_indices = [self.families.graphics, self.families.present];
        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(request.old);
        create_info = if self.families.graphics != self.families.present {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&family_indices)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let handle = unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }
            .op("vkCreateSwapchainKHR")?;
        let images = match unsafe { self.swapchain_loader.get_swapchain_images(handle) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { self.swapchain_loader.destroy_swapchain(handle, None) };
                return Err(GpuError::driver("vkGetSwapchainImagesKHR", e));
            }
        };

        log::info!(
            "Created swapchain {}x{} with {} images ({:?})",
            extent.width,
            extent.height,
            images.len(),
            present_mode
        );

        Ok(SwapchainImages {
            handle,
            images,
            format: surface_format.format,
            extent,
            present_mode,
        })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
    }

    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> GpuResult<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(color_range(vk::ImageAspectFlags::COLOR));
        unsafe { self.device.create_image_view(&create_info, None) }.op("vkCreateImageView")
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn create_buffer(&self, desc: &BufferDesc) -> GpuResult<vk::Buffer> {
        let create_info = vk::BufferCreateInfo::builder()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&create_info, None) }.op("vkCreateBuffer")?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let location = if desc.host_visible {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };

        let mut memory = self.memory.lock();
        let allocation = match memory.allocator.allocate(&AllocationCreateDesc {
            name: "buffer",
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(GpuError::Allocation(e.to_string()));
            }
        };

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            unsafe { self.device.destroy_buffer(buffer, None) };
            if let Err(free_err) = memory.allocator.free(allocation) {
                log::error!("Failed to free buffer memory: {}", free_err);
            }
            return Err(GpuError::driver("vkBindBufferMemory", e));
        }

        memory.buffers.insert(buffer, allocation);
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut memory = self.memory.lock();
        unsafe { self.device.destroy_buffer(buffer, None) };
        if let Some(allocation) = memory.buffers.remove(&buffer) {
            if let Err(e) = memory.allocator.free(allocation) {
                log::error!("Failed to free buffer memory: {}", e);
            }
        }
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) -> GpuResult<()> {
        let mut memory = self.memory.lock();
        let mapped = memory
            .buffers
            .get_mut(&buffer)
            .and_then(Allocation::mapped_slice_mut)
            .ok_or_else(|| GpuError::driver("vkMapMemory", vk::Result::ERROR_MEMORY_MAP_FAILED))?;
        GpuError::check_range(offset, data.len() as u64, mapped.len() as u64)?;
        let offset = offset as usize;
        mapped[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, out: &mut [u8]) -> GpuResult<()> {
        let memory = self.memory.lock();
        let mapped = memory
            .buffers
            .get(&buffer)
            .and_then(Allocation::mapped_slice)
            .ok_or_else(|| GpuError::driver("vkMapMemory", vk::Result::ERROR_MEMORY_MAP_FAILED))?;
        GpuError::check_range(offset, out.len() as u64, mapped.len() as u64)?;
        let offset = offset as usize;
        out.copy_from_slice(&mapped[offset..offset + out.len()]);
        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer(buffer, src, dst, regions) };
    }

    fn cmd_transition_image(
        &self,
        buffer: vk::CommandBuffer,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        let masks = transition_masks(old_layout, new_layout);
        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_access_mask(masks.src_access)
            .dst_access_mask(masks.dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(color_range(aspect))
            .build();
        unsafe {
            self.device.cmd_pipeline_barrier(
                buffer,
                masks.src_stage,
                masks.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            )
        };
    }

    fn cmd_clear_color_image(
        &self,
        buffer: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: [f32; 4],
    ) {
        let clear = vk::ClearColorValue { float32: color };
        let range = color_range(vk::ImageAspectFlags::COLOR);
        unsafe { self.device.cmd_clear_color_image(buffer, image, layout, &clear, &[range]) };
    }

    fn cmd_bind_pipeline(
        &self,
        buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        unsafe { self.device.cmd_bind_pipeline(buffer, bind_point, pipeline) };
    }

    fn cmd_draw(
        &self,
        buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        unsafe {
            self.device
                .cmd_draw(buffer, vertex_count, instance_count, first_vertex, first_instance)
        };
    }

    fn cmd_dispatch(&self, buffer: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        unsafe { self.device.cmd_dispatch(buffer, x, y, z) };
    }
}

fn color_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

impl Drop for VulkanDriver {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan driver...");

        if let Err(e) = unsafe { self.device.device_wait_idle() } {
            log::error!("vkDeviceWaitIdle failed during shutdown: {}", e);
        }

        let memory = self.memory.get_mut();
        if !memory.buffers.is_empty() {
            log::warn!("{} buffers leaked at shutdown", memory.buffers.len());
            for (buffer, allocation) in memory.buffers.drain() {
                unsafe { self.device.destroy_buffer(buffer, None) };
                if let Err(e) = memory.allocator.free(allocation) {
                    log::error!("Failed to free buffer memory: {}", e);
                }
            }
        }

        unsafe {
            // Allocator holds device memory; it goes before the device
            ManuallyDrop::drop(&mut self.memory);

            self.device.destroy_device(None);
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

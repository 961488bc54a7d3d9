// Headless driver - simulated GPU
//
// Runs the submission core without a GPU: handles are minted from a counter,
// submitted work sits in a FIFO queue until it completes (immediately, or
// when the owner calls `complete_next`), and buffer copies are executed on
// completion so results are observable.
//
// Misuse that a validation layer would flag panics: freeing in-flight
// buffers, resetting a pending fence, resubmitting one-time buffers, or
// acquiring with a semaphore that is still signaled or awaited.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use ash::vk::{self, Handle};
use parking_lot::{Condvar, Mutex, MutexGuard};

use super::driver::*;
use super::error::{GpuError, GpuResult, PresentStatus};

/// When submitted work finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Inside the submit call.
    Immediate,
    /// Only when `complete_next` / `complete_all` is called.
    Manual,
}

#[derive(Debug, Clone, Copy)]
pub struct HeadlessConfig {
    pub completion: Completion,
    pub dedicated_transfer: bool,
    pub separate_present_queue: bool,
    pub max_image_count: u32,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            completion: Completion::Immediate,
            dedicated_transfer: false,
            separate_present_queue: false,
            max_image_count: 8,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub submit_calls: usize,
    pub present_calls: usize,
    pub acquire_calls: usize,
    pub command_buffers_submitted: usize,
    pub images_presented: usize,
    pub pools_created: usize,
    pub swapchains_created: usize,
    pub semaphores_created: usize,
    /// Waits that found at least one fence unsignaled.
    pub blocking_fence_waits: usize,
    pub live_pools: usize,
    pub live_command_buffers: usize,
    pub live_fences: usize,
    pub live_semaphores: usize,
    pub live_buffers: usize,
    pub live_image_views: usize,
    pub live_swapchains: usize,
    pub pending_work: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Signaled,
    Unsignaled,
    /// Attached to submitted work that has not completed.
    Pending,
}

#[derive(Debug)]
enum Op {
    Copy {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    Other(&'static str),
}

#[derive(Debug, Default)]
struct SemaphoreState {
    signaled: bool,
    /// Submitted waits that have not executed yet.
    pending_waits: u32,
}

/// One-shot failures armed by tests.
#[derive(Debug, Default)]
struct Failures {
    swapchain: bool,
    /// Image views to create successfully before one fails.
    image_view_after: Option<usize>,
}

#[derive(Debug)]
struct CommandState {
    pool: vk::CommandPool,
    recording: bool,
    executable: bool,
    submitted: bool,
    pending: bool,
    ops: Vec<Op>,
}

struct SimBuffer {
    data: Vec<u8>,
    host_visible: bool,
}

struct SimSwapchain {
    image_count: u32,
    next: u32,
    out_of_date: bool,
}

struct Work {
    fence: vk::Fence,
    buffers: Vec<vk::CommandBuffer>,
    waits: Vec<vk::Semaphore>,
}

struct State {
    next_handle: u64,
    pools: HashMap<vk::CommandPool, PoolFamily>,
    command_buffers: HashMap<vk::CommandBuffer, CommandState>,
    fences: HashMap<vk::Fence, FenceState>,
    semaphores: HashMap<vk::Semaphore, SemaphoreState>,
    buffers: HashMap<vk::Buffer, SimBuffer>,
    image_views: HashSet<vk::ImageView>,
    swapchains: HashMap<vk::SwapchainKHR, SimSwapchain>,
    queue: VecDeque<Work>,
    executed: Vec<&'static str>,
    failures: Failures,
    stats: HeadlessStats,
}

impl State {
    fn mint<H: Handle>(&mut self) -> H {
        self.next_handle += 1;
        H::from_raw(self.next_handle)
    }

    fn complete_front(&mut self) -> bool {
        let Some(work) = self.queue.pop_front() else {
            return false;
        };
        for buffer in &work.buffers {
            let ops = match self.command_buffers.get_mut(buffer) {
                Some(state) => {
                    state.pending = false;
                    std::mem::take(&mut state.ops)
                }
                None => continue,
            };
            for op in ops {
                match op {
                    Op::Copy { src, dst, regions } => {
                        self.execute_copy(src, dst, &regions);
                        self.executed.push("copy");
                    }
                    Op::Other(name) => self.executed.push(name),
                }
            }
        }
        for semaphore in &work.waits {
            if let Some(state) = self.semaphores.get_mut(semaphore) {
                state.pending_waits -= 1;
            }
        }
        if work.fence != vk::Fence::null() {
            self.fences.insert(work.fence, FenceState::Signaled);
        }
        true
    }

    fn execute_copy(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        for region in regions {
            let start = region.src_offset as usize;
            let end = start + region.size as usize;
            let bytes = self.buffers[&src].data[start..end].to_vec();
            let offset = region.dst_offset as usize;
            let target = &mut self.buffers.get_mut(&dst).expect("copy into destroyed buffer").data;
            target[offset..offset + bytes.len()].copy_from_slice(&bytes);
        }
    }

    fn buffer_in_flight(&self, buffer: vk::Buffer) -> bool {
        self.command_buffers.values().any(|cmd| {
            cmd.pending
                && cmd.ops.iter().any(|op| {
                    matches!(op, Op::Copy { src, dst, .. } if *src == buffer || *dst == buffer)
                })
        })
    }

    fn record(&mut self, buffer: vk::CommandBuffer, op: Op) {
        let state = self
            .command_buffers
            .get_mut(&buffer)
            .expect("recording into unknown command buffer");
        assert!(state.recording, "recording into a command buffer that is not recording");
        state.ops.push(op);
    }
}

pub struct HeadlessDriver {
    config: HeadlessConfig,
    state: Mutex<State>,
    changed: Condvar,
}

impl HeadlessDriver {
    pub fn new(config: HeadlessConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                next_handle: 0x1000,
                pools: HashMap::new(),
                command_buffers: HashMap::new(),
                fences: HashMap::new(),
                semaphores: HashMap::new(),
                buffers: HashMap::new(),
                image_views: HashSet::new(),
                swapchains: HashMap::new(),
                queue: VecDeque::new(),
                executed: Vec::new(),
                failures: Failures::default(),
                stats: HeadlessStats::default(),
            }),
            changed: Condvar::new(),
        }
    }

    /// Work completes inside the submit call.
    pub fn immediate() -> Self {
        Self::new(HeadlessConfig::default())
    }

    /// Work completes only when the owner says so.
    pub fn manual() -> Self {
        Self::new(HeadlessConfig {
            completion: Completion::Manual,
            ..Default::default()
        })
    }

    pub fn stats(&self) -> HeadlessStats {
        let state = self.state.lock();
        HeadlessStats {
            live_pools: state.pools.len(),
            live_command_buffers: state.command_buffers.len(),
            live_fences: state.fences.len(),
            live_semaphores: state.semaphores.len(),
            live_buffers: state.buffers.len(),
            live_image_views: state.image_views.len(),
            live_swapchains: state.swapchains.len(),
            pending_work: state.queue.len(),
            ..state.stats.clone()
        }
    }

    /// Finish the oldest submitted work. Returns false if nothing was pending.
    pub fn complete_next(&self) -> bool {
        let done = self.state.lock().complete_front();
        if done {
            self.changed.notify_all();
        }
        done
    }

    pub fn complete_all(&self) -> usize {
        let mut state = self.state.lock();
        let mut count = 0;
        while state.complete_front() {
            count += 1;
        }
        drop(state);
        self.changed.notify_all();
        count
    }

    pub fn pending_work(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Block until at least `count` submissions are pending.
    pub fn wait_for_pending(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.queue.len() < count {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return state.queue.len() >= count;
            }
        }
        true
    }

    /// Names of the commands executed so far, in completion order.
    pub fn executed_commands(&self) -> Vec<&'static str> {
        self.lock().executed.clone()
    }

    /// The next swap chain creation fails.
    pub fn fail_next_swapchain(&self) {
        self.lock().failures.swapchain = true;
    }

    /// After `successes` more image views, one creation fails.
    pub fn fail_image_view_after(&self, successes: usize) {
        self.lock().failures.image_view_after = Some(successes);
    }

    /// Every live swap chain reports out-of-date until it is recreated.
    pub fn invalidate_swapchains(&self) {
        for swapchain in self.state.lock().swapchains.values_mut() {
            swapchain.out_of_date = true;
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock()
    }
}

impl Driver for HeadlessDriver {
    fn has_dedicated_transfer(&self) -> bool {
        self.config.dedicated_transfer
    }

    fn queue(&self, kind: QueueKind) -> vk::Queue {
        let raw = match kind {
            QueueKind::Graphics => 1,
            QueueKind::Present if self.config.separate_present_queue => 2,
            QueueKind::Transfer if self.config.dedicated_transfer => 3,
            _ => 1,
        };
        vk::Queue::from_raw(raw)
    }

    fn create_command_pool(&self, family: PoolFamily) -> GpuResult<vk::CommandPool> {
        let mut state = self.lock();
        let pool = state.mint();
        state.pools.insert(pool, family);
        state.stats.pools_created += 1;
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.lock();
        assert!(
            !state.command_buffers.values().any(|cmd| cmd.pool == pool && cmd.pending),
            "command pool destroyed while its work is in flight"
        );
        state.command_buffers.retain(|_, cmd| cmd.pool != pool);
        state.pools.remove(&pool);
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> GpuResult<vk::CommandBuffer> {
        let mut state = self.lock();
        assert!(state.pools.contains_key(&pool), "allocating from unknown command pool");
        let buffer = state.mint();
        state.command_buffers.insert(
            buffer,
            CommandState {
                pool,
                recording: false,
                executable: false,
                submitted: false,
                pending: false,
                ops: Vec::new(),
            },
        );
        Ok(buffer)
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, buffer: vk::CommandBuffer) {
        let mut state = self.lock();
        let cmd = state
            .command_buffers
            .remove(&buffer)
            .expect("freeing unknown command buffer");
        assert_eq!(cmd.pool, pool, "command buffer freed into the wrong pool");
        assert!(!cmd.pending, "command buffer freed while the GPU is still executing it");
    }

    fn begin_command_buffer(&self, buffer: vk::CommandBuffer) -> GpuResult<()> {
        let mut state = self.lock();
        let cmd = state
            .command_buffers
            .get_mut(&buffer)
            .expect("beginning unknown command buffer");
        assert!(!cmd.recording && !cmd.submitted, "one-time command buffer begun twice");
        cmd.recording = true;
        Ok(())
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> GpuResult<()> {
        let mut state = self.lock();
        let cmd = state
            .command_buffers
            .get_mut(&buffer)
            .expect("ending unknown command buffer");
        assert!(cmd.recording, "command buffer ended while not recording");
        cmd.recording = false;
        cmd.executable = true;
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> GpuResult<vk::Fence> {
        let mut state = self.lock();
        let fence = state.mint();
        let initial = if signaled { FenceState::Signaled } else { FenceState::Unsignaled };
        state.fences.insert(fence, initial);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.lock();
        let previous = state.fences.remove(&fence);
        assert_ne!(previous, Some(FenceState::Pending), "fence destroyed while in use");
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: u64) -> GpuResult<()> {
        let deadline = (timeout != u64::MAX).then(|| Instant::now() + Duration::from_nanos(timeout));
        let mut state = self.lock();
        let mut blocked = false;
        loop {
            let mut all_signaled = true;
            for fence in fences {
                match state.fences.get(fence) {
                    Some(FenceState::Signaled) => {}
                    Some(FenceState::Pending) => all_signaled = false,
                    Some(FenceState::Unsignaled) => panic!("waiting on a fence that was never submitted"),
                    None => panic!("waiting on unknown fence"),
                }
            }
            if all_signaled {
                return Ok(());
            }
            if !blocked {
                blocked = true;
                state.stats.blocking_fence_waits += 1;
            }
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out() {
                        return Err(GpuError::driver("vkWaitForFences", vk::Result::TIMEOUT));
                    }
                }
                None => self.changed.wait(&mut state),
            }
        }
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> GpuResult<()> {
        let mut state = self.lock();
        for fence in fences {
            let current = state.fences.get_mut(fence).expect("resetting unknown fence");
            assert_ne!(*current, FenceState::Pending, "fence reset while in use");
            *current = FenceState::Unsignaled;
        }
        Ok(())
    }

    fn fence_signaled(&self, fence: vk::Fence) -> GpuResult<bool> {
        let state = self.lock();
        Ok(state.fences.get(&fence) == Some(&FenceState::Signaled))
    }

    fn create_semaphore(&self) -> GpuResult<vk::Semaphore> {
        let mut state = self.lock();
        let semaphore = state.mint();
        state.semaphores.insert(semaphore, SemaphoreState::default());
        state.stats.semaphores_created += 1;
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let removed = self.lock().semaphores.remove(&semaphore);
        assert!(
            removed.map_or(true, |state| state.pending_waits == 0),
            "semaphore destroyed while a queue still waits on it"
        );
    }

    fn queue_submit(&self, _queue: vk::Queue, batches: &[SubmitBatch], fence: vk::Fence) -> GpuResult<()> {
        let mut state = self.lock();
        if fence != vk::Fence::null() {
            let current = state.fences.get_mut(&fence).expect("submitting with unknown fence");
            assert_eq!(
                *current,
                FenceState::Unsignaled,
                "submission fence must be unsignaled and not in use"
            );
            *current = FenceState::Pending;
        }

        let mut buffers = Vec::new();
        let mut waits = Vec::new();
        for batch in batches {
            for semaphore in &batch.wait_semaphores {
                let sem = state.semaphores.get_mut(semaphore).expect("waiting on unknown semaphore");
                assert!(sem.signaled, "waiting on a semaphore nothing has signaled");
                sem.signaled = false;
                sem.pending_waits += 1;
                waits.push(*semaphore);
            }
            for semaphore in &batch.signal_semaphores {
                let sem = state.semaphores.get_mut(semaphore).expect("signaling unknown semaphore");
                assert!(!sem.signaled, "signaling a semaphore that is already signaled");
                sem.signaled = true;
            }
            for buffer in &batch.command_buffers {
                let cmd = state
                    .command_buffers
                    .get_mut(buffer)
                    .expect("submitting unknown command buffer");
                assert!(cmd.executable, "submitting a command buffer that was never ended");
                assert!(!cmd.submitted, "one-time command buffer submitted twice");
                cmd.submitted = true;
                cmd.pending = true;
                buffers.push(*buffer);
            }
        }
        state.stats.submit_calls += 1;
        state.stats.command_buffers_submitted += buffers.len();
        state.queue.push_back(Work { fence, buffers, waits });

        if self.config.completion == Completion::Immediate {
            while state.complete_front() {}
        }
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    fn queue_present(&self, _queue: vk::Queue, requests: &[PresentRequest]) -> GpuResult<Vec<PresentStatus>> {
        let mut state = self.lock();
        state.stats.present_calls += 1;
        for request in requests {
            let sem = state
                .semaphores
                .get_mut(&request.wait_semaphore)
                .expect("presenting with unknown semaphore");
            assert!(sem.signaled, "present waits on a semaphore nothing has signaled");
            sem.signaled = false;
        }
        let statuses = requests
            .iter()
            .map(|request| {
                let swapchain = state
                    .swapchains
                    .get(&request.swapchain)
                    .expect("presenting unknown swap chain");
                assert!(request.image_index < swapchain.image_count, "present index out of range");
                if swapchain.out_of_date {
                    PresentStatus::OutOfDate
                } else {
                    PresentStatus::Optimal
                }
            })
            .collect::<Vec<_>>();
        state.stats.images_presented += statuses
            .iter()
            .filter(|status| **status != PresentStatus::OutOfDate)
            .count();
        Ok(statuses)
    }

    fn device_wait_idle(&self) -> GpuResult<()> {
        let mut state = self.lock();
        while !state.queue.is_empty() {
            self.changed.wait(&mut state);
        }
        Ok(())
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
        _timeout: u64,
    ) -> GpuResult<AcquireResult> {
        let mut state = self.lock();
        state.stats.acquire_calls += 1;
        let swapchain = state
            .swapchains
            .get_mut(&swapchain)
            .expect("acquiring from unknown swap chain");
        if swapchain.out_of_date {
            return Ok(AcquireResult::OutOfDate);
        }
        let index = swapchain.next;
        swapchain.next = (swapchain.next + 1) % swapchain.image_count;

        let sem = state
            .semaphores
            .get_mut(&semaphore)
            .expect("acquiring with unknown semaphore");
        assert!(
            !sem.signaled && sem.pending_waits == 0,
            "acquire semaphore is still signaled or awaited by queued work"
        );
        sem.signaled = true;
        Ok(AcquireResult::Image { index, suboptimal: false })
    }

    fn create_swapchain(&self, request: &SwapchainRequest) -> GpuResult<SwapchainImages> {
        if request.extent.width == 0 || request.extent.height == 0 {
            return Err(GpuError::Surface("swap chain extent must be non-zero".into()));
        }
        let mut state = self.lock();
        // The old swap chain is retired even if creation fails
        if let Some(old) = state.swapchains.get_mut(&request.old) {
            old.out_of_date = true;
        }
        if std::mem::take(&mut state.failures.swapchain) {
            return Err(GpuError::driver("vkCreateSwapchainKHR", vk::Result::ERROR_INITIALIZATION_FAILED));
        }
        let image_count = request.image_count.clamp(2, self.config.max_image_count);
        let handle = state.mint();
        let images = (0..image_count).map(|_| state.mint()).collect();
        state.swapchains.insert(
            handle,
            SimSwapchain {
                image_count,
                next: 0,
                out_of_date: false,
            },
        );
        state.stats.swapchains_created += 1;
        Ok(SwapchainImages {
            handle,
            images,
            format: vk::Format::B8G8R8A8_SRGB,
            extent: request.extent,
            present_mode: request.present_mode,
        })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.lock().swapchains.remove(&swapchain);
    }

    fn create_image_view(&self, _image: vk::Image, _format: vk::Format) -> GpuResult<vk::ImageView> {
        let mut state = self.lock();
        match state.failures.image_view_after.take() {
            Some(0) => {
                return Err(GpuError::driver("vkCreateImageView", vk::Result::ERROR_INITIALIZATION_FAILED));
            }
            Some(remaining) => state.failures.image_view_after = Some(remaining - 1),
            None => {}
        }
        let view = state.mint();
        state.image_views.insert(view);
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.lock().image_views.remove(&view);
    }

    fn create_buffer(&self, desc: &BufferDesc) -> GpuResult<vk::Buffer> {
        let mut state = self.lock();
        let buffer = state.mint();
        state.buffers.insert(
            buffer,
            SimBuffer {
                data: vec![0; desc.size as usize],
                host_visible: desc.host_visible,
            },
        );
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.lock();
        assert!(!state.buffer_in_flight(buffer), "buffer destroyed while the GPU still uses it");
        state.buffers.remove(&buffer);
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) -> GpuResult<()> {
        let mut state = self.lock();
        let sim = state.buffers.get_mut(&buffer).expect("writing unknown buffer");
        if !sim.host_visible {
            return Err(GpuError::driver("vkMapMemory", vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        GpuError::check_range(offset, data.len() as u64, sim.data.len() as u64)?;
        let offset = offset as usize;
        sim.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, out: &mut [u8]) -> GpuResult<()> {
        let state = self.lock();
        let sim = state.buffers.get(&buffer).expect("reading unknown buffer");
        if !sim.host_visible {
            return Err(GpuError::driver("vkMapMemory", vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        GpuError::check_range(offset, out.len() as u64, sim.data.len() as u64)?;
        let offset = offset as usize;
        out.copy_from_slice(&sim.data[offset..offset + out.len()]);
        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.lock().record(
            buffer,
            Op::Copy {
                src,
                dst,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_transition_image(
        &self,
        buffer: vk::CommandBuffer,
        _image: vk::Image,
        _aspect: vk::ImageAspectFlags,
        _old_layout: vk::ImageLayout,
        _new_layout: vk::ImageLayout,
    ) {
        self.lock().record(buffer, Op::Other("transition"));
    }

    fn cmd_clear_color_image(
        &self,
        buffer: vk::CommandBuffer,
        _image: vk::Image,
        _layout: vk::ImageLayout,
        _color: [f32; 4],
    ) {
        self.lock().record(buffer, Op::Other("clear"));
    }

    fn cmd_bind_pipeline(
        &self,
        buffer: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        _pipeline: vk::Pipeline,
    ) {
        self.lock().record(buffer, Op::Other("bind_pipeline"));
    }

    fn cmd_draw(
        &self,
        buffer: vk::CommandBuffer,
        _vertex_count: u32,
        _instance_count: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) {
        self.lock().record(buffer, Op::Other("draw"));
    }

    fn cmd_dispatch(&self, buffer: vk::CommandBuffer, _x: u32, _y: u32, _z: u32) {
        self.lock().record(buffer, Op::Other("dispatch"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_work_waits_for_completion() {
        let driver = HeadlessDriver::manual();
        let pool = driver.create_command_pool(PoolFamily::Graphics).unwrap();
        let cmd = driver.allocate_command_buffer(pool).unwrap();
        driver.begin_command_buffer(cmd).unwrap();
        driver.end_command_buffer(cmd).unwrap();

        let fence = driver.create_fence(false).unwrap();
        let batch = SubmitBatch {
            command_buffers: vec![cmd],
            ..Default::default()
        };
        driver.queue_submit(driver.queue(QueueKind::Graphics), &[batch], fence).unwrap();
        assert!(!driver.fence_signaled(fence).unwrap());
        assert_eq!(driver.pending_work(), 1);

        assert!(driver.complete_next());
        assert!(driver.fence_signaled(fence).unwrap());
        assert!(!driver.complete_next());

        driver.free_command_buffer(pool, cmd);
        driver.destroy_fence(fence);
        driver.destroy_command_pool(pool);
        assert_eq!(driver.stats().live_pools, 0);
    }

    #[test]
    fn wait_times_out_on_unfinished_work() {
        let driver = HeadlessDriver::manual();
        let fence = driver.create_fence(false).unwrap();
        driver.queue_submit(driver.queue(QueueKind::Graphics), &[], fence).unwrap();

        let result = driver.wait_for_fences(&[fence], 1_000_000);
        assert!(matches!(result, Err(GpuError::Driver { result: vk::Result::TIMEOUT, .. })));
        driver.complete_all();
        driver.wait_for_fences(&[fence], 1_000_000).unwrap();
    }

    #[test]
    #[should_panic(expected = "still executing")]
    fn freeing_in_flight_buffer_panics() {
        let driver = HeadlessDriver::manual();
        let pool = driver.create_command_pool(PoolFamily::Graphics).unwrap();
        let cmd = driver.allocate_command_buffer(pool).unwrap();
        driver.begin_command_buffer(cmd).unwrap();
        driver.end_command_buffer(cmd).unwrap();
        let batch = SubmitBatch {
            command_buffers: vec![cmd],
            ..Default::default()
        };
        driver.queue_submit(driver.queue(QueueKind::Graphics), &[batch], vk::Fence::null()).unwrap();
        driver.free_command_buffer(pool, cmd);
    }

    #[test]
    fn queues_alias_unless_configured() {
        let shared = HeadlessDriver::immediate();
        assert_eq!(shared.queue(QueueKind::Graphics), shared.queue(QueueKind::Present));
        assert_eq!(shared.queue(QueueKind::Graphics), shared.queue(QueueKind::Transfer));

        let split = HeadlessDriver::new(HeadlessConfig {
            dedicated_transfer: true,
            separate_present_queue: true,
            ..Default::default()
        });
        assert_ne!(split.queue(QueueKind::Graphics), split.queue(QueueKind::Present));
        assert_ne!(split.queue(QueueKind::Graphics), split.queue(QueueKind::Transfer));
        assert!(split.has_dedicated_transfer());
    }

    #[test]
    fn invalidated_swapchain_reports_out_of_date() {
        let driver = HeadlessDriver::immediate();
        let images = driver
            .create_swapchain(&SwapchainRequest {
                surface: vk::SurfaceKHR::null(),
                extent: vk::Extent2D { width: 64, height: 64 },
                present_mode: vk::PresentModeKHR::FIFO,
                image_count: 3,
                old: vk::SwapchainKHR::null(),
            })
            .unwrap();
        assert_eq!(images.images.len(), 3);

        let semaphore = driver.create_semaphore().unwrap();
        assert_eq!(
            driver.acquire_next_image(images.handle, semaphore, u64::MAX).unwrap(),
            AcquireResult::Image { index: 0, suboptimal: false }
        );
        driver.invalidate_swapchains();
        assert_eq!(
            driver.acquire_next_image(images.handle, semaphore, u64::MAX).unwrap(),
            AcquireResult::OutOfDate
        );
    }
}

// Synchronization primitives
//
// Fences pace the CPU against the GPU (one per frame in flight).
// Semaphores order GPU work: acquire -> render -> present.

use ash::vk;
use super::driver::Driver;
use super::error::GpuResult;
use super::submit::RecordedCommands;

/// Image-available / render-finished pair used by one swap chain frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameSemaphores {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
}

impl FrameSemaphores {
    pub fn new(driver: &dyn Driver) -> GpuResult<Self> {
        let image_available = driver.create_semaphore()?;
        let render_finished = match driver.create_semaphore() {
            Ok(semaphore) => semaphore,
            Err(e) => {
                driver.destroy_semaphore(image_available);
                return Err(e);
            }
        };
        Ok(Self { image_available, render_finished })
    }

    pub fn destroy(&self, driver: &dyn Driver) {
        driver.destroy_semaphore(self.image_available);
        driver.destroy_semaphore(self.render_finished);
    }
}

/// One in-flight slot: its fence and everything that must outlive the
/// GPU work the fence guards.
#[derive(Debug)]
pub struct FenceSlot {
    pub fence: vk::Fence,
    /// Serial of the frame last submitted on this slot, 0 if none.
    pub serial: u64,
    pub retired: Vec<RecordedCommands>,
}

/// Fixed ring of N fences ("frames in flight").
///
/// A slot's fence must be signaled before anything in `retired` is released
/// or the slot is submitted on again.
#[derive(Debug)]
pub struct FenceRing {
    slots: Vec<FenceSlot>,
    current: usize,
    last_serial: u64,
    /// Buffers dropped while frames were in flight, keyed by the newest
    /// serial that could still reference them.
    deferred_buffers: Vec<(u64, vk::Buffer)>,
}

impl FenceRing {
    pub fn new(driver: &dyn Driver, count: usize) -> GpuResult<Self> {
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            // Start signaled so the first wait on each slot returns at once
            match driver.create_fence(true) {
                Ok(fence) => slots.push(FenceSlot { fence, serial: 0, retired: Vec::new() }),
                Err(e) => {
                    for slot in &slots {
                        driver.destroy_fence(slot.fence);
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self {
            slots,
            current: 0,
            last_serial: 0,
            deferred_buffers: Vec::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn slot(&self, index: usize) -> &FenceSlot {
        &self.slots[index]
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut FenceSlot {
        &mut self.slots[index]
    }

    pub fn last_serial(&self) -> u64 {
        self.last_serial
    }

    pub fn next_serial(&self) -> u64 {
        self.last_serial + 1
    }

    /// Record that `serial` was submitted on the current slot.
    pub fn commit(&mut self, serial: u64, retired: Vec<RecordedCommands>) {
        debug_assert_eq!(serial, self.last_serial + 1, "frame serials must be consecutive");
        let slot = &mut self.slots[self.current];
        debug_assert!(slot.retired.is_empty(), "slot reused before its resources were released");
        slot.serial = serial;
        slot.retired = retired;
        self.last_serial = serial;
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }

    /// Slot still carrying `serial`, if it has not been reused since.
    pub fn slot_of_serial(&self, serial: u64) -> Option<usize> {
        if serial == 0 {
            return None;
        }
        self.slots.iter().position(|slot| slot.serial == serial)
    }

    /// Hold `buffer` until frame `serial` has completed. `serial` may be the
    /// next, not yet submitted frame.
    pub fn defer_buffer(&mut self, serial: u64, buffer: vk::Buffer) {
        debug_assert!(serial <= self.next_serial());
        self.deferred_buffers.push((serial, buffer));
    }

    /// Buffers whose last possible user is `completed` or older.
    pub fn take_deferred_buffers(&mut self, completed: u64) -> Vec<vk::Buffer> {
        let mut ready = Vec::new();
        self.deferred_buffers.retain(|&(serial, buffer)| {
            if serial <= completed {
                ready.push(buffer);
                false
            } else {
                true
            }
        });
        ready
    }

    pub fn fences(&self) -> impl Iterator<Item = vk::Fence> + '_ {
        self.slots.iter().map(|slot| slot.fence)
    }

    pub fn destroy(&mut self, driver: &dyn Driver) {
        for slot in self.slots.drain(..) {
            driver.destroy_fence(slot.fence);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessDriver;
    use ash::vk::Handle;

    #[test]
    fn ring_wraps_modulo_len() {
        let driver = HeadlessDriver::immediate();
        let mut ring = FenceRing::new(&driver, 2).unwrap();
        assert_eq!(ring.current(), 0);
        ring.advance();
        assert_eq!(ring.current(), 1);
        ring.advance();
        assert_eq!(ring.current(), 0);
        ring.destroy(&driver);
    }

    #[test]
    fn fences_start_signaled() {
        let driver = HeadlessDriver::immediate();
        let mut ring = FenceRing::new(&driver, 3).unwrap();
        for fence in ring.fences() {
            assert!(driver.fence_signaled(fence).unwrap());
        }
        ring.destroy(&driver);
        assert_eq!(driver.stats().live_fences, 0);
    }

    #[test]
    fn serial_lookup_forgets_reused_slots() {
        let driver = HeadlessDriver::immediate();
        let mut ring = FenceRing::new(&driver, 2).unwrap();
        for serial in 1..=3 {
            ring.commit(serial, Vec::new());
            ring.advance();
        }
        // Serial 1 lived on slot 0, which serial 3 has since taken over
        assert_eq!(ring.slot_of_serial(1), None);
        assert_eq!(ring.slot_of_serial(2), Some(1));
        assert_eq!(ring.slot_of_serial(3), Some(0));
        assert_eq!(ring.slot_of_serial(0), None);
        ring.destroy(&driver);
    }

    #[test]
    fn deferred_buffers_wait_for_their_serial() {
        let driver = HeadlessDriver::immediate();
        let mut ring = FenceRing::new(&driver, 2).unwrap();
        ring.commit(1, Vec::new());
        let first = vk::Buffer::from_raw(1);
        let second = vk::Buffer::from_raw(2);
        ring.defer_buffer(1, first);
        ring.defer_buffer(2, second);
        assert!(ring.take_deferred_buffers(0).is_empty());
        assert_eq!(ring.take_deferred_buffers(1), vec![first]);
        assert!(ring.take_deferred_buffers(1).is_empty());
        assert_eq!(ring.take_deferred_buffers(2), vec![second]);
        ring.destroy(&driver);
    }
}

// Error taxonomy for the submission core
//
// Driver failures are wrapped with the operation name and propagated.
// Expected presentation conditions are plain values, never errors.

use ash::vk;
use thiserror::Error;

pub type GpuResult<T> = Result<T, GpuError>;

#[derive(Debug, Error)]
pub enum GpuError {
    /// A native API call failed. `op` names the call for the caller's logs.
    #[error("{op} failed: {result:?}")]
    Driver {
        op: &'static str,
        result: vk::Result,
    },
    #[error("No suitable GPU found")]
    NoSuitableDevice,
    #[error("Surface error: {0}")]
    Surface(String),
    /// GPU or host memory could not be obtained. Never retried here.
    #[error("Allocation failed: {0}")]
    Allocation(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// Host access outside a mapped buffer.
    #[error("Access of {len} bytes at offset {offset} exceeds buffer size {size}")]
    OutOfBounds { offset: u64, len: u64, size: u64 },
}

impl GpuError {
    pub fn driver(op: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                GpuError::Allocation(format!("{op}: {result:?}"))
            }
            _ => GpuError::Driver { op, result },
        }
    }

    /// `Ok` if `len` bytes at `offset` fit in `size`.
    pub fn check_range(offset: u64, len: u64, size: u64) -> GpuResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(()),
            _ => Err(GpuError::OutOfBounds { offset, len, size }),
        }
    }
}

/// Extension to tag a raw `VkResult` with the operation that produced it.
pub trait DriverContext<T> {
    fn op(self, op: &'static str) -> GpuResult<T>;
}

impl<T> DriverContext<T> for Result<T, vk::Result> {
    fn op(self, op: &'static str) -> GpuResult<T> {
        self.map_err(|result| GpuError::driver(op, result))
    }
}

/// Outcome of presenting one swap chain image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Optimal,
    /// Presented, but the surface no longer matches exactly. Recreate soon.
    Suboptimal,
    /// Not presented. The swap chain must be recreated.
    OutOfDate,
}

impl PresentStatus {
    pub fn needs_recreate(self) -> bool {
        !matches!(self, PresentStatus::Optimal)
    }

    /// The more severe of two statuses.
    pub fn worst(self, other: PresentStatus) -> PresentStatus {
        use PresentStatus::*;
        match (self, other) {
            (OutOfDate, _) | (_, OutOfDate) => OutOfDate,
            (Suboptimal, _) | (_, Suboptimal) => Suboptimal,
            _ => Optimal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_error_names_operation() {
        let err = GpuError::driver("vkQueueSubmit", vk::Result::ERROR_DEVICE_LOST);
        assert_eq!(err.to_string(), "vkQueueSubmit failed: ERROR_DEVICE_LOST");
    }

    #[test]
    fn out_of_memory_is_allocation_error() {
        let err: GpuResult<()> = Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).op("vkAllocateMemory");
        assert!(matches!(err, Err(GpuError::Allocation(_))));
    }

    #[test]
    fn range_check_rejects_overflow() {
        assert!(GpuError::check_range(0, 16, 16).is_ok());
        assert!(matches!(
            GpuError::check_range(8, 16, 16),
            Err(GpuError::OutOfBounds { offset: 8, len: 16, size: 16 })
        ));
        assert!(GpuError::check_range(u64::MAX, 1, 16).is_err());
    }

    #[test]
    fn worst_status_wins() {
        use PresentStatus::*;
        assert_eq!(Optimal.worst(Optimal), Optimal);
        assert_eq!(Optimal.worst(Suboptimal), Suboptimal);
        assert_eq!(Suboptimal.worst(OutOfDate), OutOfDate);
        assert!(!Optimal.needs_recreate());
        assert!(OutOfDate.needs_recreate());
    }
}

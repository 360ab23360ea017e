// SPDX-License-Identifier: CEPL-1.0
use std::sync::atomic::{AtomicBool, Ordering};

use ash::vk;
use thiserror::Error;
use tracing::error;
use vkd_display::FrameSizeMismatch;

pub type DisplayResult<T> = Result<T, DisplayError>;

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("failed to allocate {what}: {result}")]
    Allocation {
        what: &'static str,
        result: vk::Result,
    },
    #[error("no host-visible, host-coherent memory type fits the transfer image")]
    NoHostVisibleMemory,
    #[error("swapchain is out of date")]
    SwapchainInvalidated,
    #[error("presentation surface lost")]
    SurfaceLost,
    #[error("graphics device lost")]
    DeviceLost,
    #[error("{context}: {result}")]
    Vulkan {
        context: &'static str,
        result: vk::Result,
    },
    #[error("failed to load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),
    #[error("no GPU can present to this window")]
    NoSuitableGpu,
    #[error("GPU index {index} out of range ({count} suitable)")]
    GpuIndexOutOfRange { index: usize, count: usize },
    #[error("window handle unavailable: {0}")]
    WindowHandle(#[from] raw_window_handle::HandleError),
    #[error("invalid SPIR-V: {0}")]
    Shader(#[from] std::io::Error),
    #[error(transparent)]
    FrameSize(#[from] FrameSizeMismatch),
    #[error("display is unusable after an earlier fatal error")]
    Unusable,
}

impl DisplayError {
    /// Classifies a raw result from the call described by `context`.
    pub fn from_vk(context: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => DisplayError::DeviceLost,
            vk::Result::ERROR_SURFACE_LOST_KHR => DisplayError::SurfaceLost,
            vk::Result::ERROR_OUT_OF_DATE_KHR => DisplayError::SwapchainInvalidated,
            result => DisplayError::Vulkan { context, result },
        }
    }

    /// `map_err` adapter for general calls.
    pub fn vulkan(context: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |result| Self::from_vk(context, result)
    }

    /// `map_err` adapter for resource creation; out-of-memory becomes
    /// [`DisplayError::Allocation`].
    pub fn allocation(what: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |result| match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY
            | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | vk::Result::ERROR_TOO_MANY_OBJECTS => DisplayError::Allocation { what, result },
            result => Self::from_vk(what, result),
        }
    }

    /// Fatal errors leave the display unusable; everything else is local to
    /// the call that produced it.
    pub fn is_fatal(&self) -> bool {
        match self {
            DisplayError::Allocation { .. }
            | DisplayError::NoHostVisibleMemory
            | DisplayError::SwapchainInvalidated
            | DisplayError::FrameSize(_) => false,
            DisplayError::SurfaceLost
            | DisplayError::DeviceLost
            | DisplayError::Vulkan { .. }
            | DisplayError::Loading(_)
            | DisplayError::NoSuitableGpu
            | DisplayError::GpuIndexOutOfRange { .. }
            | DisplayError::WindowHandle(_)
            | DisplayError::Shader(_)
            | DisplayError::Unusable => true,
        }
    }
}

/// Remembers that a fatal error happened so later calls fail fast with
/// [`DisplayError::Unusable`].
#[derive(Debug, Default)]
pub struct FailureLatch {
    failed: AtomicBool,
}

impl FailureLatch {
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn ensure_usable(&self) -> DisplayResult<()> {
        if self.is_failed() {
            return Err(DisplayError::Unusable);
        }
        Ok(())
    }

    /// Passes `result` through, latching on a fatal error.
    pub fn check<T>(&self, result: DisplayResult<T>) -> DisplayResult<T> {
        if let Err(err) = &result {
            if self.latch(err) {
                error!(%err, "display is no longer usable");
            }
        }
        result
    }

    /// True only for the call that moved the latch.
    fn latch(&self, err: &DisplayError) -> bool {
        err.is_fatal() && !self.failed.swap(true, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_results_map_by_kind() {
        assert!(matches!(
            DisplayError::from_vk("present", vk::Result::ERROR_DEVICE_LOST),
            DisplayError::DeviceLost
        ));
        assert!(matches!(
            DisplayError::from_vk("present", vk::Result::ERROR_SURFACE_LOST_KHR),
            DisplayError::SurfaceLost
        ));
        assert!(matches!(
            DisplayError::from_vk("acquire", vk::Result::ERROR_OUT_OF_DATE_KHR),
            DisplayError::SwapchainInvalidated
        ));
        assert!(matches!(
            DisplayError::from_vk("submit", vk::Result::ERROR_INITIALIZATION_FAILED),
            DisplayError::Vulkan {
                context: "submit",
                ..
            }
        ));
    }

    #[test]
    fn test_out_of_memory_is_allocation() {
        let err = DisplayError::allocation("image memory")(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert!(matches!(
            err,
            DisplayError::Allocation {
                what: "image memory",
                ..
            }
        ));
        assert!(!err.is_fatal());

        let err = DisplayError::allocation("image")(vk::Result::ERROR_DEVICE_LOST);
        assert!(matches!(err, DisplayError::DeviceLost));
    }

    #[test]
    fn test_fatality() {
        assert!(!DisplayError::SwapchainInvalidated.is_fatal());
        assert!(!DisplayError::NoHostVisibleMemory.is_fatal());
        assert!(DisplayError::SurfaceLost.is_fatal());
        assert!(DisplayError::DeviceLost.is_fatal());
        assert!(DisplayError::Unusable.is_fatal());
        assert!(DisplayError::from_vk("submit", vk::Result::ERROR_UNKNOWN).is_fatal());
    }

    #[test]
    fn test_messages_name_the_call() {
        let err = DisplayError::vulkan("queue_submit")(vk::Result::ERROR_UNKNOWN);
        assert!(err.to_string().starts_with("queue_submit: "));
    }

    #[test]
    fn test_fatal_error_latches() {
        let latch = FailureLatch::default();
        assert!(latch.ensure_usable().is_ok());

        let result: DisplayResult<()> = latch.check(Err(DisplayError::DeviceLost));
        assert!(matches!(result, Err(DisplayError::DeviceLost)));
        assert!(latch.is_failed());
        assert!(matches!(latch.ensure_usable(), Err(DisplayError::Unusable)));
    }

    #[test]
    fn test_local_errors_do_not_latch() {
        let latch = FailureLatch::default();
        let oom = DisplayError::allocation("transfer image")(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert!(latch.check::<()>(Err(oom)).is_err());
        let short = FrameSizeMismatch {
            expected: 64,
            actual: 10,
            width: 4,
            height: 4,
        };
        assert!(latch.check::<()>(Err(short.into())).is_err());
        assert!(latch.check::<()>(Err(DisplayError::SwapchainInvalidated)).is_err());

        assert!(!latch.is_failed());
        assert!(latch.ensure_usable().is_ok());
        assert_eq!(latch.check(Ok(7)).unwrap(), 7);
    }

    #[test]
    fn test_latch_reports_only_first_fatal_error() {
        let latch = FailureLatch::default();
        assert!(latch.latch(&DisplayError::SurfaceLost));
        assert!(!latch.latch(&DisplayError::DeviceLost));
        assert!(!latch.latch(&DisplayError::Unusable));
        assert!(latch.is_failed());
    }

    #[test]
    fn test_allocation_does_not_move_latch() {
        let latch = FailureLatch::default();
        assert!(!latch.latch(&DisplayError::NoHostVisibleMemory));
        assert!(!latch.is_failed());
    }
}

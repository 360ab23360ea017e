// SPDX-License-Identifier: CEPL-1.0
use crate::description::ImageDescription;
use crate::pool::{ImageHandle, PoolImage};

/// Result of one [`Presenter::display`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisplayOutcome {
    Presented,
    /// The window had no area and one pending frame was dropped.
    Discarded,
    /// The window had no area and no frame was pending.
    Idle,
    Shutdown,
}

impl DisplayOutcome {
    pub fn is_shutdown(self) -> bool {
        self == DisplayOutcome::Shutdown
    }
}

/// Pushes producer frames onto a window.
///
/// Any number of threads may `acquire` and `queue`; `display` must only be
/// driven from one thread.
pub trait Presenter: Send + Sync {
    type Image: PoolImage;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Blocks until an image is free, then readies it for `description`.
    fn acquire(
        &self,
        description: ImageDescription,
    ) -> Result<ImageHandle<Self::Image>, Self::Error>;

    fn queue(&self, handle: ImageHandle<Self::Image>);

    fn copy_and_queue(
        &self,
        pixels: &[u8],
        description: ImageDescription,
    ) -> Result<(), Self::Error>;

    /// Shows the oldest queued frame, waiting for one if none is pending.
    fn display(&self) -> Result<DisplayOutcome, Self::Error>;

    /// The window size or vsync preference may have changed.
    fn notify_resize(&self);

    /// Wakes `display` and makes it return [`DisplayOutcome::Shutdown`].
    fn shutdown(&self);
}

// SPDX-License-Identifier: CEPL-1.0
//! Backend-agnostic frame lifecycle for the display pipeline.
//!
//! Producers `acquire` an image from a fixed pool, write pixels straight into
//! its host-visible memory and `queue` it. A single display thread pulls queued
//! frames in order and hands the image back once GPU work has been scheduled.
//! The GPU side lives in backend crates which implement [`PoolImage`] and
//! [`Presenter`].

mod description;
mod pool;
mod presenter;
mod queue;
mod viewport;

pub use description::{
    copy_rows, FrameSizeMismatch, ImageDescription, PixelFormat, WindowParameters, WindowSource,
};
pub use pool::{Frame, ImageHandle, ImagePool, NextFrame, PoolImage, Transform};
pub use presenter::{DisplayOutcome, Presenter};
pub use queue::ConcurrentQueue;
pub use viewport::{fit, RenderArea};

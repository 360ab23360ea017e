// SPDX-License-Identifier: CEPL-1.0
use thiserror::Error;

/// Pixel layouts a producer can hand to the display.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    #[default]
    Rgba8Srgb,
    Rgba8Unorm,
    Bgra8Srgb,
    Bgra8Unorm,
    Rgba16Sfloat,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8Srgb
            | PixelFormat::Rgba8Unorm
            | PixelFormat::Bgra8Srgb
            | PixelFormat::Bgra8Unorm => 4,
            PixelFormat::Rgba16Sfloat => 8,
        }
    }
}

/// Size and layout of one frame. Two frames with equal descriptions can share
/// a backing allocation; any difference forces a reallocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ImageDescription {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl ImageDescription {
    pub const fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    pub const fn rgba(width: u32, height: u32) -> Self {
        Self::new(width, height, PixelFormat::Rgba8Srgb)
    }

    /// Bytes in one tightly packed row.
    pub const fn packed_row_len(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    pub const fn packed_len(&self) -> usize {
        self.packed_row_len() * self.height as usize
    }
}

/// Drawable size and presentation flags of the target window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WindowParameters {
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
}

impl WindowParameters {
    pub const fn new(width: u32, height: u32, vsync: bool) -> Self {
        Self {
            width,
            height,
            vsync,
        }
    }

    /// A zero-area window (minimized, or not yet mapped). Nothing can be
    /// presented into it, but it is not an error either.
    pub const fn is_degenerate(&self) -> bool {
        self.width as u64 * self.height as u64 == 0
    }
}

/// The windowing collaborator, queried on demand from the display thread and
/// from whoever reports resizes.
pub trait WindowSource: Send + Sync {
    fn window_parameters(&self) -> WindowParameters;
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("frame holds {actual} bytes but {expected} are needed for {width}x{height}")]
pub struct FrameSizeMismatch {
    pub expected: usize,
    pub actual: usize,
    pub width: u32,
    pub height: u32,
}

/// Copies tightly packed rows from `src` into `dst`, whose rows are `dst_pitch`
/// bytes apart.
pub fn copy_rows(
    dst: &mut [u8],
    dst_pitch: usize,
    src: &[u8],
    description: &ImageDescription,
) -> Result<(), FrameSizeMismatch> {
    let row_len = description.packed_row_len();
    let rows = description.height as usize;
    let mismatch = |expected, actual| FrameSizeMismatch {
        expected,
        actual,
        width: description.width,
        height: description.height,
    };

    if src.len() < row_len * rows {
        return Err(mismatch(row_len * rows, src.len()));
    }
    if rows == 0 || row_len == 0 {
        return Ok(());
    }
    let needed = dst_pitch * (rows - 1) + row_len;
    if dst_pitch < row_len || dst.len() < needed {
        return Err(mismatch(needed, dst.len()));
    }

    for (row, chunk) in src.chunks_exact(row_len).take(rows).enumerate() {
        let start = row * dst_pitch;
        dst[start..start + row_len].copy_from_slice(chunk);
    }
    Ok(())
}

// SPDX-License-Identifier: CEPL-1.0
use bytemuck::{Pod, Zeroable};

/// Region of the window the image is drawn into, in pixels.
///
/// Laid out to match the fragment shader's push-constant block.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RenderArea {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Fits an `image` of `(width, height)` into `window` keeping its aspect
/// ratio, centred on the free axis.
pub fn fit(window: (u32, u32), image: (u32, u32)) -> RenderArea {
    let (window_w, window_h) = window;
    let (image_w, image_h) = image;
    if window_w == 0 || window_h == 0 || image_w == 0 || image_h == 0 {
        return RenderArea {
            x: 0,
            y: 0,
            width: window_w,
            height: window_h,
        };
    }

    let window_aspect = window_w as f64 / window_h as f64;
    let image_aspect = image_w as f64 / image_h as f64;

    if window_aspect > image_aspect {
        let width = ((window_h as f64 * image_aspect).round() as u32).min(window_w);
        RenderArea {
            x: (window_w - width) / 2,
            y: 0,
            width,
            height: window_h,
        }
    } else {
        let height = ((window_w as f64 / image_aspect).round() as u32).min(window_h);
        RenderArea {
            x: 0,
            y: (window_h - height) / 2,
            width: window_w,
            height,
        }
    }
}

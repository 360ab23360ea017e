// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
pub use winit;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;
use vkd_display::{WindowParameters, WindowSource};
use winit::dpi::PhysicalSize;
use winit::window::Window;

/// Reports a winit window's drawable size and the current vsync choice to the
/// display thread.
pub struct WinitWindowSource {
    window: Arc<Window>,
    vsync: AtomicBool,
}

impl WinitWindowSource {
    pub fn new(window: Arc<Window>, vsync: bool) -> Self {
        Self {
            window,
            vsync: AtomicBool::new(vsync),
        }
    }

    pub fn vsync(&self) -> bool {
        self.vsync.load(Ordering::Relaxed)
    }

    /// Flips vsync and returns the new value. The presenter only notices
    /// after `notify_resize`.
    pub fn toggle_vsync(&self) -> bool {
        let vsync = !self.vsync.fetch_xor(true, Ordering::Relaxed);
        info!("vsync → {vsync}");
        vsync
    }
}

impl WindowSource for WinitWindowSource {
    fn window_parameters(&self) -> WindowParameters {
        parameters_for(
            self.window.inner_size(),
            self.window.is_minimized(),
            self.vsync(),
        )
    }
}

/// Some platforms keep reporting the last size while minimized; treat that
/// as zero area.
fn parameters_for(
    size: PhysicalSize<u32>,
    minimized: Option<bool>,
    vsync: bool,
) -> WindowParameters {
    if minimized == Some(true) {
        return WindowParameters::new(0, 0, vsync);
    }
    WindowParameters::new(size.width, size.height, vsync)
}

// SPDX-License-Identifier: CEPL-1.0
//! Demo frame source. Alternates between writing RGB rows straight into the
//! acquired image (expanded to RGBA on the display thread) and copying a
//! finished RGBA buffer.
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};
use vkd_display::{ImageDescription, PoolImage, Presenter};

use crate::config::ProducerCfg;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FillMode {
    /// Packed RGB rows plus a deferred RGB→RGBA transform.
    Transform,
    Copy,
}

/// Mode in effect `elapsed` into the run.
pub fn mode_at(elapsed: Duration, switch_secs: u64) -> FillMode {
    if switch_secs == 0 || (elapsed.as_secs() / switch_secs) % 2 == 0 {
        FillMode::Transform
    } else {
        FillMode::Copy
    }
}

/// Expands `width` packed RGB pixels at the start of `row` to opaque RGBA.
pub fn rgb_to_rgba(row: &mut [u8], width: usize) {
    for x in (0..width).rev() {
        let (s, d) = (x * 3, x * 4);
        let px = [row[s], row[s + 1], row[s + 2]];
        row[d..d + 3].copy_from_slice(&px);
        row[d + 3] = 0xFF;
    }
}

fn expand_rows(pixels: &mut [u8], pitch: usize, width: usize, height: usize) {
    if pitch < width * 4 {
        return;
    }
    for row in pixels.chunks_mut(pitch).take(height) {
        if row.len() >= width * 4 {
            rgb_to_rgba(row, width);
        }
    }
}

fn pattern(x: usize, y: usize, frame: u64) -> [u8; 3] {
    let t = frame as usize;
    [(x + t * 2) as u8, (y + t) as u8, ((x ^ y) + t / 2) as u8]
}

fn fill_rgb_row(row: &mut [u8], y: usize, frame: u64) {
    for (x, px) in row.chunks_exact_mut(3).enumerate() {
        px.copy_from_slice(&pattern(x, y, frame));
    }
}

fn fill_rgba(buf: &mut [u8], width: usize, frame: u64) {
    for (y, row) in buf.chunks_exact_mut(width * 4).enumerate() {
        for (x, px) in row.chunks_exact_mut(4).enumerate() {
            px[..3].copy_from_slice(&pattern(x, y, frame));
            px[3] = 0xFF;
        }
    }
}

/// Queues one frame written in place through an acquired handle.
fn produce_in_place<P: Presenter>(
    presenter: &P,
    description: ImageDescription,
    frame: u64,
) -> Result<(), P::Error> {
    let (width, height) = (description.width as usize, description.height as usize);
    let mut handle = presenter.acquire(description)?;
    let pitch = handle.row_pitch().max(1);
    for (y, row) in handle.pixels_mut().chunks_mut(pitch).take(height).enumerate() {
        if let Some(rgb) = row.get_mut(..width * 3) {
            fill_rgb_row(rgb, y, frame);
        }
    }
    handle.set_transform(move |image: &mut P::Image| {
        let pitch = image.row_pitch();
        expand_rows(image.pixels_mut(), pitch, width, height);
    });
    presenter.queue(handle);
    Ok(())
}

/// Produces frames until `stop` is raised. Returns the number queued.
pub fn run<P: Presenter>(
    presenter: &P,
    cfg: &ProducerCfg,
    stop: &AtomicBool,
) -> Result<u64, P::Error> {
    let description = ImageDescription::rgba(cfg.width.max(1), cfg.height.max(1));
    let frame_dt = (cfg.fps > 0).then(|| Duration::from_nanos(1_000_000_000 / cfg.fps as u64));
    let mut staging = vec![0u8; description.packed_len()];

    let start = Instant::now();
    let mut mode = None;
    let mut frames = 0u64;
    let mut next_deadline = start;

    while !stop.load(Ordering::Acquire) {
        let now = Instant::now();
        let current = mode_at(now - start, cfg.switch_secs);
        if mode != Some(current) {
            info!("producer mode → {current:?}");
            mode = Some(current);
        }

        match current {
            FillMode::Transform => produce_in_place(presenter, description, frames)?,
            FillMode::Copy => {
                fill_rgba(&mut staging, description.width as usize, frames);
                presenter.copy_and_queue(&staging, description)?;
            }
        }
        frames += 1;

        if let Some(dt) = frame_dt {
            next_deadline += dt;
            let now = Instant::now();
            if next_deadline > now {
                thread::sleep(next_deadline - now);
            } else {
                // fell behind, don't try to catch up
                next_deadline = now;
            }
        }
    }
    debug!(frames, "producer stopped");
    Ok(frames)
}

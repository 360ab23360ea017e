// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
mod config;
mod producer;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use vkd_core::init_tracing;
use vkd_display::{DisplayOutcome, Presenter, WindowSource};
use vkd_display_vk::{list_gpus, VkDisplay};
use vkd_platform::WinitWindowSource;

use vkd_platform::winit::{
    application::ApplicationHandler,
    event::{ElementState, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop, EventLoopProxy},
    keyboard::{Key, NamedKey},
    window::{Window, WindowId},
};

use config::{load_cfg, AppCfg};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file; missing means defaults
    #[arg(long, default_value = "vkd.toml")]
    config: PathBuf,
    /// Transfer images in flight
    #[arg(long)]
    frames_in_flight: Option<usize>,
    /// GPU to present with, as numbered by --list-gpus
    #[arg(long)]
    gpu: Option<usize>,
    /// Print the available GPUs and exit
    #[arg(long)]
    list_gpus: bool,
    /// Start with vsync off
    #[arg(long)]
    no_vsync: bool,
}

#[derive(Debug)]
enum AppEvent {
    DisplayStopped,
}

const REPORT_PERIOD: Duration = Duration::from_secs(5);
const IDLE_BACKOFF: Duration = Duration::from_millis(5);

/// Display plus its two worker threads. Dropping it runs the shutdown
/// sequence: producer first, then the display thread, then the device.
struct Engine {
    display: Arc<VkDisplay>,
    source: Arc<WinitWindowSource>,
    stop: Arc<AtomicBool>,
    producer: Option<JoinHandle<()>>,
    presenter: Option<JoinHandle<()>>,
}

impl Engine {
    fn start(window: Arc<Window>, cfg: &AppCfg, proxy: EventLoopProxy<AppEvent>) -> Result<Self> {
        let source = Arc::new(WinitWindowSource::new(Arc::clone(&window), cfg.display.vsync));
        let window_source: Arc<dyn WindowSource> = source.clone();
        let display = Arc::new(VkDisplay::new(
            &*window,
            &*window,
            window_source,
            cfg.display.to_display_config(),
        )?);
        let gpu = display.gpu();
        let frames_in_flight = display.frames_in_flight();
        info!("gpu = {}", gpu);
        info!("frames in flight = {}", frames_in_flight);

        let mut engine = Engine {
            display,
            source,
            stop: Arc::new(AtomicBool::new(false)),
            producer: None,
            presenter: None,
        };

        let display = Arc::clone(&engine.display);
        engine.presenter = Some(thread::Builder::new().name("display".into()).spawn(
            move || {
                display_loop(display.as_ref());
                let _ = proxy.send_event(AppEvent::DisplayStopped);
            },
        )?);

        let display = Arc::clone(&engine.display);
        let stop = Arc::clone(&engine.stop);
        let producer_cfg = cfg.producer;
        engine.producer = Some(thread::Builder::new().name("producer".into()).spawn(
            move || match producer::run(display.as_ref(), &producer_cfg, &stop) {
                Ok(frames) => info!("producer queued {frames} frames"),
                Err(e) => error!("producer stopped: {e}"),
            },
        )?);

        Ok(engine)
    }

    fn notify_resize(&self) {
        self.display.notify_resize();
    }

    fn toggle_vsync(&self) {
        self.source.toggle_vsync();
        self.display.notify_resize();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(t) = self.producer.take() {
            if t.join().is_err() {
                error!("producer thread panicked");
            }
        }
        self.display.shutdown();
        if let Some(t) = self.presenter.take() {
            if t.join().is_err() {
                error!("display thread panicked");
            }
        }
        info!("engine stopped");
    }
}

fn display_loop<P: Presenter>(display: &P) {
    let mut presented = 0u64;
    let mut dropped = 0u64;
    let mut since = Instant::now();

    loop {
        match display.display() {
            Ok(outcome) if outcome.is_shutdown() => break,
            Ok(DisplayOutcome::Presented) => presented += 1,
            Ok(DisplayOutcome::Discarded) => {
                dropped += 1;
                thread::sleep(IDLE_BACKOFF);
            }
            Ok(_) => thread::sleep(IDLE_BACKOFF),
            Err(e) => {
                error!("display failed: {e}");
                break;
            }
        }

        let elapsed = since.elapsed();
        if elapsed >= REPORT_PERIOD {
            info!(
                "presented {presented} ({:.1} fps), dropped {dropped}",
                presented as f64 / elapsed.as_secs_f64()
            );
            presented = 0;
            dropped = 0;
            since = Instant::now();
        }
    }
}

struct App {
    cfg: AppCfg,
    proxy: EventLoopProxy<AppEvent>,
    window: Option<Arc<Window>>,
    engine: Option<Engine>,
    exiting: bool,
}

impl App {
    fn exit(&mut self, event_loop: &ActiveEventLoop) {
        self.exiting = true;
        // engine holds the surface, so it goes before the window
        self.engine = None;
        self.window = None;
        event_loop.exit();
    }

    fn on_key(&mut self, event_loop: &ActiveEventLoop, key: &Key) {
        match key {
            Key::Named(NamedKey::Escape) => self.exit(event_loop),
            Key::Character(c) if c.as_str().eq_ignore_ascii_case("q") => self.exit(event_loop),
            Key::Character(c) if c.as_str().eq_ignore_ascii_case("v") => {
                if let Some(engine) = &self.engine {
                    engine.toggle_vsync();
                }
            }
            _ => {}
        }
    }
}

impl ApplicationHandler<AppEvent> for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() || self.exiting {
            return;
        }
        event_loop.set_control_flow(ControlFlow::Wait);

        let window =
            match event_loop.create_window(Window::default_attributes().with_title("vkd")) {
                Ok(w) => Arc::new(w),
                Err(e) => {
                    error!("create_window: {e}");
                    self.exit(event_loop);
                    return;
                }
            };

        match Engine::start(Arc::clone(&window), &self.cfg, self.proxy.clone()) {
            Ok(engine) => {
                self.engine = Some(engine);
                self.window = Some(window);
            }
            Err(e) => {
                error!("display init failed: {e:#}");
                self.exit(event_loop);
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.exit(event_loop);
            }
            WindowEvent::Resized(size) => {
                info!("Resized → {}x{}", size.width, size.height);
                if let Some(engine) = &self.engine {
                    engine.notify_resize();
                }
            }
            // minimizing does not always come with a resize
            WindowEvent::Occluded(_) => {
                if let Some(engine) = &self.engine {
                    engine.notify_resize();
                }
            }
            WindowEvent::KeyboardInput { event, .. }
                if event.state == ElementState::Pressed && !event.repeat =>
            {
                self.on_key(event_loop, &event.logical_key);
            }
            _ => {}
        }
    }

    fn user_event(&mut self, event_loop: &ActiveEventLoop, event: AppEvent) {
        match event {
            AppEvent::DisplayStopped => {
                if !self.exiting && self.engine.is_some() {
                    error!("display thread stopped, exiting");
                    self.exit(event_loop);
                }
            }
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    if args.list_gpus {
        for gpu in list_gpus()? {
            println!("{gpu}");
        }
        return Ok(());
    }

    let mut cfg = load_cfg(&args.config);
    cfg.apply_overrides(args.frames_in_flight, args.gpu, args.no_vsync);
    info!("vsync cfg = {}", cfg.display.vsync);

    let event_loop = EventLoop::<AppEvent>::with_user_event().build()?;
    let mut app = App {
        cfg,
        proxy: event_loop.create_proxy(),
        window: None,
        engine: None,
        exiting: false,
    };

    event_loop.run_app(&mut app)?;
    Ok(())
}

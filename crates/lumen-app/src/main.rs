// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use lumen_core::init_tracing;
use lumen_platform::{AppWindow, WindowDesc};
use lumen_render::mesh::{triangle_mesh, MAX_SIERPINSKI_DEPTH};
use lumen_render::{DriverState, FrameDriver, SurfaceProvider};
use lumen_render_vk::{RendererOptions, VkRenderer};
use tracing::{error, info, warn};

use lumen_platform::winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::WindowId,
};

mod config;

use config::AppConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file; missing means built-in defaults
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

struct App {
    cfg: AppConfig,
    // Dropped before the window so the surface goes first.
    driver: Option<FrameDriver<VkRenderer>>,
    window: Option<AppWindow>,
    failure: Option<anyhow::Error>,
}

impl App {
    fn new(cfg: AppConfig) -> Self {
        Self {
            cfg,
            driver: None,
            window: None,
            failure: None,
        }
    }

    fn start(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let desc = WindowDesc {
            title: self.cfg.window.title.clone(),
            width: self.cfg.window.width,
            height: self.cfg.window.height,
        };
        let window = AppWindow::create(event_loop, &desc)?;

        let depth = self.cfg.mesh.sierpinski_depth;
        if depth > MAX_SIERPINSKI_DEPTH {
            warn!("sierpinski_depth {depth} clamped to {MAX_SIERPINSKI_DEPTH}");
        }
        let render = &self.cfg.render;
        let opts = RendererOptions {
            size: window.extent(),
            clear_color: render.clear_color,
            vsync: render.vsync,
            validation: render.validation,
            vertex_shader: render.vertex_shader_path(),
            fragment_shader: render.fragment_shader_path(),
            vertices: triangle_mesh(depth),
        };

        let renderer = VkRenderer::new(&window, &opts).context("renderer setup failed")?;
        self.driver = Some(FrameDriver::new(renderer));
        self.window = Some(window);
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, e: anyhow::Error) {
        if let Some(driver) = self.driver.as_mut() {
            if let Err(idle) = driver.stop() {
                warn!("{idle:#}");
            }
        }
        self.failure = Some(e);
        event_loop.exit();
    }

    /// Outcome of the run once the event loop has returned.
    fn finish(mut self) -> Result<()> {
        if let Some(driver) = self.driver.take() {
            info!(
                "rendered {} frames ({} degraded)",
                driver.frames(),
                driver.degraded_frames()
            );
        }
        match self.failure.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() || self.failure.is_some() {
            return;
        }
        if let Err(e) = self.start(event_loop) {
            self.fail(event_loop, e);
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, id: WindowId, event: WindowEvent) {
        if let Some(window) = self.window.as_mut() {
            if window.id() == id {
                window.handle_event(&event);
            }
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        let (Some(window), Some(driver)) = (self.window.as_ref(), self.driver.as_mut()) else {
            return;
        };
        match driver.tick(window) {
            Ok(DriverState::Running) => {}
            Ok(DriverState::Stopped) => event_loop.exit(),
            Err(e) => self.fail(event_loop, e),
        }
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(&args.config);

    let event_loop: EventLoop<()> = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(cfg);
    event_loop.run_app(&mut app)?;
    app.finish()
}

fn main() -> ExitCode {
    init_tracing();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

// SPDX-License-Identifier: CEPL-1.0
//! Surface provider backed by a winit window.

use anyhow::{Context, Result};
use lumen_render::{RenderSize, SurfaceProvider};
use raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
};
use tracing::info;
use winit::{
    dpi::LogicalSize,
    event::WindowEvent,
    event_loop::ActiveEventLoop,
    window::{Window, WindowId},
};

pub use winit;

#[derive(Clone, Debug)]
pub struct WindowDesc {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

/// Fixed-size application window. The swapchain is never rebuilt, so the
/// window is created non-resizable.
pub struct AppWindow {
    window: Window,
    close_requested: bool,
}

impl AppWindow {
    pub fn create(event_loop: &ActiveEventLoop, desc: &WindowDesc) -> Result<Self> {
        let attrs = Window::default_attributes()
            .with_title(desc.title.clone())
            .with_inner_size(LogicalSize::new(desc.width.max(1), desc.height.max(1)))
            .with_resizable(false);
        let window = event_loop
            .create_window(attrs)
            .context("create_window")?;

        let size = window.inner_size();
        info!("window \"{}\" {}x{}", desc.title, size.width, size.height);

        Ok(Self {
            window,
            close_requested: false,
        })
    }

    pub fn id(&self) -> WindowId {
        self.window.id()
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn request_close(&mut self) {
        self.close_requested = true;
    }

    /// Folds a window event into the provider state. Returns true when the
    /// event was a close request.
    pub fn handle_event(&mut self, event: &WindowEvent) -> bool {
        match event {
            WindowEvent::CloseRequested | WindowEvent::Destroyed => {
                info!("CloseRequested");
                self.close_requested = true;
                true
            }
            _ => false,
        }
    }
}

impl SurfaceProvider for AppWindow {
    fn should_close(&self) -> bool {
        self.close_requested
    }

    fn extent(&self) -> RenderSize {
        let size = self.window.inner_size();
        RenderSize {
            width: size.width,
            height: size.height,
        }
    }
}

impl HasWindowHandle for AppWindow {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        self.window.window_handle()
    }
}

impl HasDisplayHandle for AppWindow {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        self.window.display_handle()
    }
}

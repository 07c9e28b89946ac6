// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

pub mod driver;
pub mod mesh;
pub mod shader;

pub use driver::{DriverState, FrameDriver};
pub use mesh::Vertex;
pub use shader::{ShaderBlob, ShaderError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

/// Owner of the native window. Reports close requests and the drawable size.
pub trait SurfaceProvider {
    fn should_close(&self) -> bool;
    fn extent(&self) -> RenderSize;
}

/// A surface provider that can also hand out raw handles for surface creation.
pub trait NativeSurface: SurfaceProvider + HasWindowHandle + HasDisplayHandle {}

impl<T> NativeSurface for T where T: SurfaceProvider + HasWindowHandle + HasDisplayHandle {}

/// What the presentation queue reported for a frame. Neither variant other
/// than `Presented` is an error; the caller decides what to do about them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Still presentable, but the surface no longer matches the chain exactly.
    Suboptimal,
    /// The chain must be rebuilt before it can present again.
    OutOfDate,
}

pub trait Renderer {
    /// One acquire → submit → present cycle.
    fn render(&mut self) -> Result<PresentOutcome>;

    /// Blocks until every submitted frame has retired. Must be called before
    /// the renderer is dropped while frames may still be in flight.
    fn wait_idle(&mut self) -> Result<()>;
}

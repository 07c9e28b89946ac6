// SPDX-License-Identifier: CEPL-1.0
//! The per-iteration frame loop: check for close, then run one frame.

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::{PresentOutcome, Renderer, SurfaceProvider};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverState {
    Running,
    Stopped,
}

pub struct FrameDriver<R> {
    renderer: R,
    state: DriverState,
    frames: u64,
    degraded_frames: u64,
}

impl<R: Renderer> FrameDriver<R> {
    pub fn new(renderer: R) -> Self {
        Self {
            renderer,
            state: DriverState::Running,
            frames: 0,
            degraded_frames: 0,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Frames that completed the full acquire → present cycle.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Frames whose present came back suboptimal or out of date.
    pub fn degraded_frames(&self) -> u64 {
        self.degraded_frames
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    /// Runs one loop iteration. The close request is checked before any GPU
    /// work; a renderer error stops the driver and is returned to the caller.
    pub fn tick(&mut self, surface: &dyn SurfaceProvider) -> Result<DriverState> {
        if self.state == DriverState::Stopped {
            return Ok(DriverState::Stopped);
        }

        if surface.should_close() {
            info!("close requested after {} frames", self.frames);
            self.stop()?;
            return Ok(DriverState::Stopped);
        }

        let outcome = match self.renderer.render() {
            Ok(outcome) => outcome,
            Err(e) => {
                self.state = DriverState::Stopped;
                return Err(e).context(format!("frame {} failed", self.frames));
            }
        };

        match outcome {
            PresentOutcome::Presented => {}
            PresentOutcome::Suboptimal | PresentOutcome::OutOfDate => {
                // Swapchain recreation is not implemented; keep presenting.
                if self.degraded_frames == 0 {
                    warn!("present reported {outcome:?}; continuing with the current swapchain");
                } else {
                    debug!("present reported {outcome:?}");
                }
                self.degraded_frames += 1;
            }
        }

        self.frames += 1;
        Ok(DriverState::Running)
    }

    /// Transitions to `Stopped` and drains the GPU. Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        if self.state == DriverState::Stopped {
            return Ok(());
        }
        self.state = DriverState::Stopped;
        self.renderer
            .wait_idle()
            .context("waiting for the device to go idle")
    }

    pub fn into_renderer(self) -> R {
        self.renderer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RenderSize;
    use anyhow::anyhow;
    use std::cell::Cell;
    use std::collections::VecDeque;

    struct FakeSurface {
        close: Cell<bool>,
    }

    impl FakeSurface {
        fn open() -> Self {
            Self {
                close: Cell::new(false),
            }
        }
    }

    impl SurfaceProvider for FakeSurface {
        fn should_close(&self) -> bool {
            self.close.get()
        }

        fn extent(&self) -> RenderSize {
            RenderSize {
                width: 800,
                height: 600,
            }
        }
    }

    #[derive(Default)]
    struct ScriptedRenderer {
        script: VecDeque<Result<PresentOutcome>>,
        renders: usize,
        idle_waits: usize,
    }

    impl ScriptedRenderer {
        fn with(script: Vec<Result<PresentOutcome>>) -> Self {
            Self {
                script: script.into(),
                ..Default::default()
            }
        }
    }

    impl Renderer for ScriptedRenderer {
        fn render(&mut self) -> Result<PresentOutcome> {
            self.renders += 1;
            self.script
                .pop_front()
                .unwrap_or(Ok(PresentOutcome::Presented))
        }

        fn wait_idle(&mut self) -> Result<()> {
            self.idle_waits += 1;
            Ok(())
        }
    }

    #[test]
    fn running_ticks_render_one_frame_each() {
        let surface = FakeSurface::open();
        let mut driver = FrameDriver::new(ScriptedRenderer::default());

        for _ in 0..3 {
            assert_eq!(driver.tick(&surface).unwrap(), DriverState::Running);
        }
        assert_eq!(driver.frames(), 3);
        assert_eq!(driver.renderer().renders, 3);
    }

    #[test]
    fn close_request_stops_before_any_gpu_work() {
        let surface = FakeSurface::open();
        surface.close.set(true);
        let mut driver = FrameDriver::new(ScriptedRenderer::default());

        assert_eq!(driver.tick(&surface).unwrap(), DriverState::Stopped);
        assert_eq!(driver.renderer().renders, 0);
        assert_eq!(driver.renderer().idle_waits, 1);
    }

    #[test]
    fn stopped_driver_stays_stopped() {
        let surface = FakeSurface::open();
        let mut driver = FrameDriver::new(ScriptedRenderer::default());
        driver.tick(&surface).unwrap();
        surface.close.set(true);
        driver.tick(&surface).unwrap();

        surface.close.set(false);
        assert_eq!(driver.tick(&surface).unwrap(), DriverState::Stopped);
        driver.stop().unwrap();
        assert_eq!(driver.renderer().renders, 1);
        assert_eq!(driver.renderer().idle_waits, 1);
    }

    #[test]
    fn render_error_is_fatal() {
        let surface = FakeSurface::open();
        let mut driver = FrameDriver::new(ScriptedRenderer::with(vec![
            Ok(PresentOutcome::Presented),
            Err(anyhow!("device lost")),
        ]));

        driver.tick(&surface).unwrap();
        let err = driver.tick(&surface).unwrap_err();
        assert!(format!("{err:#}").contains("device lost"));
        assert_eq!(driver.state(), DriverState::Stopped);
        assert_eq!(driver.frames(), 1);

        assert_eq!(driver.tick(&surface).unwrap(), DriverState::Stopped);
        assert_eq!(driver.renderer().renders, 2);
    }

    #[test]
    fn degraded_presents_are_counted_not_escalated() {
        let surface = FakeSurface::open();
        let mut driver = FrameDriver::new(ScriptedRenderer::with(vec![
            Ok(PresentOutcome::Suboptimal),
            Ok(PresentOutcome::OutOfDate),
            Ok(PresentOutcome::Presented),
        ]));

        for _ in 0..3 {
            assert_eq!(driver.tick(&surface).unwrap(), DriverState::Running);
        }
        assert_eq!(driver.frames(), 3);
        assert_eq!(driver.degraded_frames(), 2);
    }
}

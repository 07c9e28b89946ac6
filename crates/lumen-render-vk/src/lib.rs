// SPDX-License-Identifier: CEPL-1.0
use std::path::PathBuf;

use anyhow::{Context, Result};
use ash::vk;
use lumen_render::{NativeSurface, PresentOutcome, RenderSize, Renderer, ShaderBlob, Vertex};
use tracing::info;

pub mod context;
pub mod debug;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod selection;
pub mod swapchain;
pub mod sync;

pub use context::DeviceContext;
pub use debug::{Severity, TracingSink, ValidationSink};
pub use error::{RenderError, RenderResult};
pub use model::Model;
pub use pipeline::{GraphicsPipeline, PipelineConfig};
pub use swapchain::PresentationEngine;

use error::SetupContext;

/// Directory holding the build-time compiled shaders, if any.
pub const COMPILED_SHADER_DIR: Option<&str> = option_env!("LUMEN_SHADER_DIR");

#[derive(Clone, Debug)]
pub struct RendererOptions {
    pub size: RenderSize,
    pub clear_color: [f32; 4],
    pub vsync: bool,
    pub validation: bool,
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
    pub vertices: Vec<Vertex>,
}

/// Clear values in attachment order: colour, then depth cleared to the far plane.
fn clear_values(color: [f32; 4]) -> [vk::ClearValue; 2] {
    [
        vk::ClearValue {
            color: vk::ClearColorValue { float32: color },
        },
        vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        },
    ]
}

pub struct VkRenderer {
    // Field order is drop order: per-frame objects first, the device last.
    cmd_bufs: Vec<vk::CommandBuffer>,
    model: Model,
    pipeline: GraphicsPipeline,
    engine: PresentationEngine,
    ctx: DeviceContext,
}

impl Drop for VkRenderer {
    fn drop(&mut self) {
        unsafe {
            let d = self.ctx.device();
            d.device_wait_idle().ok();
            if !self.cmd_bufs.is_empty() {
                d.free_command_buffers(self.ctx.command_pool(), &self.cmd_bufs);
            }
        }
    }
}

impl VkRenderer {
    pub fn new(window: &dyn NativeSurface, opts: &RendererOptions) -> Result<Self> {
        Self::with_sink(window, opts, Box::new(TracingSink))
    }

    /// Like [`VkRenderer::new`], with validation messages sent to `sink`.
    pub fn with_sink(
        window: &dyn NativeSurface,
        opts: &RendererOptions,
        sink: Box<dyn ValidationSink>,
    ) -> Result<Self> {
        let vertex = ShaderBlob::load(&opts.vertex_shader)?;
        let fragment = ShaderBlob::load(&opts.fragment_shader)?;

        let ctx = DeviceContext::new(window, opts.validation, sink)
            .context("creating the Vulkan device")?;
        info!("using {}", ctx.device_name());

        let engine = PresentationEngine::new(&ctx, opts.size, opts.vsync)
            .context("creating the presentation engine")?;

        let mut config = PipelineConfig::new(engine.extent());
        config.render_pass = engine.render_pass();
        let pipeline = GraphicsPipeline::new(ctx.device(), &vertex, &fragment, &config)
            .context("creating the graphics pipeline")?;

        let model = Model::new(&ctx, &opts.vertices).context("uploading the mesh")?;

        let mut renderer = Self {
            cmd_bufs: Vec::new(),
            model,
            pipeline,
            engine,
            ctx,
        };
        unsafe { renderer.record_commands(opts.clear_color) }
            .context("recording command buffers")?;
        Ok(renderer)
    }

    /// One primary buffer per swapchain image, recorded once.
    unsafe fn record_commands(&mut self, clear_color: [f32; 4]) -> RenderResult<()> {
        let d = self.ctx.device();
        let alloc_info = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.ctx.command_pool(),
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: self.engine.image_count() as u32,
            ..Default::default()
        };
        self.cmd_bufs = d
            .allocate_command_buffers(&alloc_info)
            .setup("allocate_command_buffers")?;

        let clears = clear_values(clear_color);
        for (i, &cmd) in self.cmd_bufs.iter().enumerate() {
            let begin = vk::CommandBufferBeginInfo {
                s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
                ..Default::default()
            };
            d.begin_command_buffer(cmd, &begin)
                .setup("begin_command_buffer")?;

            let rp_begin = vk::RenderPassBeginInfo {
                s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
                render_pass: self.engine.render_pass(),
                framebuffer: self.engine.framebuffer(i),
                render_area: vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: self.engine.extent(),
                },
                clear_value_count: clears.len() as u32,
                p_clear_values: clears.as_ptr(),
                ..Default::default()
            };

            d.cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);
            self.pipeline.bind(cmd);
            self.model.bind(cmd);
            self.model.draw(cmd);
            d.cmd_end_render_pass(cmd);

            d.end_command_buffer(cmd).setup("end_command_buffer")?;
        }
        info!(
            "recorded {} command buffers ({} vertices each)",
            self.cmd_bufs.len(),
            self.model.vertex_count()
        );
        Ok(())
    }

    pub fn engine(&self) -> &PresentationEngine {
        &self.engine
    }

    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }
}

impl Renderer for VkRenderer {
    fn render(&mut self) -> Result<PresentOutcome> {
        let image_index = self.engine.acquire_next_image()?;
        let cmd = self.cmd_bufs[image_index as usize];
        Ok(self.engine.submit_command_buffers(cmd, image_index)?)
    }

    fn wait_idle(&mut self) -> Result<()> {
        Ok(self.ctx.wait_idle()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clears_follow_attachment_order() {
        let [color, depth] = clear_values([0.1, 0.2, 0.3, 1.0]);
        unsafe {
            assert_eq!(color.color.float32, [0.1, 0.2, 0.3, 1.0]);
            assert_eq!(depth.depth_stencil.depth, 1.0);
            assert_eq!(depth.depth_stencil.stencil, 0);
        }
    }
}

// SPDX-License-Identifier: CEPL-1.0
use std::io::Cursor;

use ash::vk;
use lumen_render::{ShaderBlob, ShaderError};
use tracing::info;

use crate::error::{RenderError, RenderResult, SetupContext};
use crate::model;

const ENTRY_POINT: &std::ffi::CStr = c"main";

/// Fixed-function state for a graphics pipeline.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub viewport: vk::Viewport,
    pub scissor: vk::Rect2D,
    pub topology: vk::PrimitiveTopology,
    pub primitive_restart: bool,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub line_width: f32,
    pub samples: vk::SampleCountFlags,
    pub blend_enable: bool,
    pub color_write_mask: vk::ColorComponentFlags,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare_op: vk::CompareOp,
    pub bindings: Vec<vk::VertexInputBindingDescription>,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
}

impl PipelineConfig {
    /// Opaque, unculled triangle lists over the whole `extent`, depth-tested
    /// with `LESS`. The render pass still has to be filled in.
    pub fn new(extent: vk::Extent2D) -> Self {
        Self {
            viewport: vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            },
            scissor: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            primitive_restart: false,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::CLOCKWISE,
            line_width: 1.0,
            samples: vk::SampleCountFlags::TYPE_1,
            blend_enable: false,
            color_write_mask: vk::ColorComponentFlags::RGBA,
            depth_test: true,
            depth_write: true,
            depth_compare_op: vk::CompareOp::LESS,
            bindings: model::binding_descriptions(),
            attributes: model::attribute_descriptions(),
            render_pass: vk::RenderPass::null(),
            subpass: 0,
        }
    }
}

fn bool32(b: bool) -> vk::Bool32 {
    if b {
        vk::TRUE
    } else {
        vk::FALSE
    }
}

pub struct GraphicsPipeline {
    device: ash::Device,
    layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

unsafe fn create_shader_module(
    device: &ash::Device,
    blob: &ShaderBlob,
) -> RenderResult<vk::ShaderModule> {
    let code = ash::util::read_spv(&mut Cursor::new(blob.bytes())).map_err(|source| {
        ShaderError::Io {
            path: blob.path().to_path_buf(),
            source,
        }
    })?;
    let info = vk::ShaderModuleCreateInfo {
        s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
        code_size: code.len() * 4,
        p_code: code.as_ptr(),
        ..Default::default()
    };
    device
        .create_shader_module(&info, None)
        .setup("create_shader_module")
}

impl GraphicsPipeline {
    pub fn new(
        device: &ash::Device,
        vertex: &ShaderBlob,
        fragment: &ShaderBlob,
        config: &PipelineConfig,
    ) -> RenderResult<Self> {
        if config.render_pass == vk::RenderPass::null() {
            return Err(RenderError::MissingRenderPass);
        }

        unsafe {
            let layout_info = vk::PipelineLayoutCreateInfo {
                s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
                ..Default::default()
            };
            let layout = device
                .create_pipeline_layout(&layout_info, None)
                .setup("create_pipeline_layout")?;
            // Owns the layout from here on; the pipeline handle is filled last.
            let mut out = Self {
                device: device.clone(),
                layout,
                pipeline: vk::Pipeline::null(),
            };

            let vert = create_shader_module(device, vertex)?;
            let frag = match create_shader_module(device, fragment) {
                Ok(m) => m,
                Err(e) => {
                    device.destroy_shader_module(vert, None);
                    return Err(e);
                }
            };

            let result = out.create_pipeline(vert, frag, config);
            device.destroy_shader_module(frag, None);
            device.destroy_shader_module(vert, None);
            out.pipeline = result?;

            info!(
                "graphics pipeline ready ({} + {})",
                vertex.path().display(),
                fragment.path().display()
            );
            Ok(out)
        }
    }

    unsafe fn create_pipeline(
        &self,
        vert: vk::ShaderModule,
        frag: vk::ShaderModule,
        config: &PipelineConfig,
    ) -> RenderResult<vk::Pipeline> {
        let stages = [
            vk::PipelineShaderStageCreateInfo {
                s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
                stage: vk::ShaderStageFlags::VERTEX,
                module: vert,
                p_name: ENTRY_POINT.as_ptr(),
                ..Default::default()
            },
            vk::PipelineShaderStageCreateInfo {
                s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
                stage: vk::ShaderStageFlags::FRAGMENT,
                module: frag,
                p_name: ENTRY_POINT.as_ptr(),
                ..Default::default()
            },
        ];

        let vertex_input = vk::PipelineVertexInputStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
            vertex_binding_description_count: config.bindings.len() as u32,
            p_vertex_binding_descriptions: config.bindings.as_ptr(),
            vertex_attribute_description_count: config.attributes.len() as u32,
            p_vertex_attribute_descriptions: config.attributes.as_ptr(),
            ..Default::default()
        };
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
            topology: config.topology,
            primitive_restart_enable: bool32(config.primitive_restart),
            ..Default::default()
        };
        let viewport = vk::PipelineViewportStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
            viewport_count: 1,
            p_viewports: &config.viewport,
            scissor_count: 1,
            p_scissors: &config.scissor,
            ..Default::default()
        };
        let rasterization = vk::PipelineRasterizationStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
            depth_clamp_enable: vk::FALSE,
            rasterizer_discard_enable: vk::FALSE,
            polygon_mode: config.polygon_mode,
            cull_mode: config.cull_mode,
            front_face: config.front_face,
            depth_bias_enable: vk::FALSE,
            line_width: config.line_width,
            ..Default::default()
        };
        let multisample = vk::PipelineMultisampleStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
            rasterization_samples: config.samples,
            sample_shading_enable: vk::FALSE,
            min_sample_shading: 1.0,
            ..Default::default()
        };
        let blend_attachment = vk::PipelineColorBlendAttachmentState {
            blend_enable: bool32(config.blend_enable),
            src_color_blend_factor: vk::BlendFactor::ONE,
            dst_color_blend_factor: vk::BlendFactor::ZERO,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: vk::BlendFactor::ZERO,
            alpha_blend_op: vk::BlendOp::ADD,
            color_write_mask: config.color_write_mask,
        };
        let color_blend = vk::PipelineColorBlendStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
            logic_op_enable: vk::FALSE,
            logic_op: vk::LogicOp::COPY,
            attachment_count: 1,
            p_attachments: &blend_attachment,
            ..Default::default()
        };
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_DEPTH_STENCIL_STATE_CREATE_INFO,
            depth_test_enable: bool32(config.depth_test),
            depth_write_enable: bool32(config.depth_write),
            depth_compare_op: config.depth_compare_op,
            depth_bounds_test_enable: vk::FALSE,
            min_depth_bounds: 0.0,
            max_depth_bounds: 1.0,
            stencil_test_enable: vk::FALSE,
            ..Default::default()
        };

        let info = vk::GraphicsPipelineCreateInfo {
            s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
            stage_count: stages.len() as u32,
            p_stages: stages.as_ptr(),
            p_vertex_input_state: &vertex_input,
            p_input_assembly_state: &input_assembly,
            p_viewport_state: &viewport,
            p_rasterization_state: &rasterization,
            p_multisample_state: &multisample,
            p_depth_stencil_state: &depth_stencil,
            p_color_blend_state: &color_blend,
            layout: self.layout,
            render_pass: config.render_pass,
            subpass: config.subpass,
            base_pipeline_index: -1,
            ..Default::default()
        };

        let pipelines = self
            .device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
            .map_err(|(_, result)| RenderError::Setup {
                what: "create_graphics_pipelines",
                result,
            })?;
        pipelines.into_iter().next().ok_or(RenderError::Setup {
            what: "create_graphics_pipelines",
            result: vk::Result::ERROR_UNKNOWN,
        })
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub unsafe fn bind(&self, cmd: vk::CommandBuffer) {
        self.device
            .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline);
    }
}

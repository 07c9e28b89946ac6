// SPDX-License-Identifier: CEPL-1.0
//! The presentation engine: swapchain, per-image colour/depth attachments,
//! render pass, framebuffers and frame sync.

use ash::khr::swapchain;
use ash::vk;
use lumen_render::{PresentOutcome, RenderSize};
use tracing::info;

use crate::context::DeviceContext;
use crate::error::{RenderError, RenderResult, SetupContext};
use crate::selection::{SwapchainPlan, DEPTH_FORMAT_CANDIDATES};
use crate::sync::{FrameSync, VkTimeline, MAX_FRAMES_IN_FLIGHT};

/// Attachment slots shared by the render pass and every framebuffer.
pub const COLOR_ATTACHMENT: u32 = 0;
pub const DEPTH_ATTACHMENT: u32 = 1;

/// Everything owned per swapchain image. The colour image itself belongs
/// to the swapchain.
#[derive(Clone, Copy, Debug, Default)]
pub struct PresentableImage {
    pub image: vk::Image,
    pub color_view: vk::ImageView,
    pub depth_image: vk::Image,
    pub depth_memory: vk::DeviceMemory,
    pub depth_view: vk::ImageView,
    pub framebuffer: vk::Framebuffer,
}

pub struct PresentationEngine {
    device: ash::Device,
    swapchain_loader: swapchain::Device,
    swapchain: vk::SwapchainKHR,
    plan: SwapchainPlan,
    depth_format: vk::Format,
    images: Vec<PresentableImage>,
    render_pass: vk::RenderPass,
    sync: FrameSync,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
}

// Reverse acquisition order. The caller must have waited for the device
// to go idle; null handles are skipped, which also covers partial builds.
impl Drop for PresentationEngine {
    fn drop(&mut self) {
        unsafe {
            let d = &self.device;
            for img in &self.images {
                if img.color_view != vk::ImageView::null() {
                    d.destroy_image_view(img.color_view, None);
                }
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                self.swapchain_loader.destroy_swapchain(self.swapchain, None);
            }
            for img in &self.images {
                if img.depth_view != vk::ImageView::null() {
                    d.destroy_image_view(img.depth_view, None);
                }
                if img.depth_image != vk::Image::null() {
                    d.destroy_image(img.depth_image, None);
                }
                if img.depth_memory != vk::DeviceMemory::null() {
                    d.free_memory(img.depth_memory, None);
                }
            }
            for img in &self.images {
                if img.framebuffer != vk::Framebuffer::null() {
                    d.destroy_framebuffer(img.framebuffer, None);
                }
            }
            if self.render_pass != vk::RenderPass::null() {
                d.destroy_render_pass(self.render_pass, None);
            }
            self.sync.destroy(d);
        }
    }
}

fn subresource(aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Colour (cleared, stored, left presentable) then depth (cleared,
/// discarded), in `COLOR_ATTACHMENT`/`DEPTH_ATTACHMENT` order.
pub fn attachment_descriptions(
    color: vk::Format,
    depth: vk::Format,
) -> [vk::AttachmentDescription; 2] {
    let color_att = vk::AttachmentDescription {
        format: color,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        ..Default::default()
    };
    let depth_att = vk::AttachmentDescription {
        format: depth,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::DONT_CARE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ..Default::default()
    };
    [color_att, depth_att]
}

/// Keeps this frame's attachment writes behind whatever the previous use of
/// the image was doing at colour output and early fragment tests.
pub fn external_dependency() -> vk::SubpassDependency {
    let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
    vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: stages,
        src_access_mask: vk::AccessFlags::empty(),
        dst_stage_mask: stages,
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ..Default::default()
    }
}

impl PresentationEngine {
    /// Builds the chain for `ctx`'s surface. Any failure drops what was
    /// built so far.
    pub fn new(ctx: &DeviceContext, window_extent: RenderSize, vsync: bool) -> RenderResult<Self> {
        let support = ctx.swap_chain_support()?;
        let plan = SwapchainPlan::new(
            &support,
            ctx.find_physical_queue_families(),
            window_extent,
            vsync,
        )
        .ok_or(RenderError::Setup {
            what: "choose_surface_format",
            result: vk::Result::ERROR_FORMAT_NOT_SUPPORTED,
        })?;

        info!(
            "surface format {:?} / {:?}, present mode {:?}, extent {}x{}",
            plan.surface_format.format,
            plan.surface_format.color_space,
            plan.present_mode,
            plan.extent.width,
            plan.extent.height
        );

        let mut engine = Self {
            device: ctx.device().clone(),
            swapchain_loader: swapchain::Device::new(ctx.instance(), ctx.device()),
            swapchain: vk::SwapchainKHR::null(),
            plan,
            depth_format: vk::Format::UNDEFINED,
            images: Vec::new(),
            render_pass: vk::RenderPass::null(),
            sync: FrameSync::new(Vec::new(), 0),
            graphics_queue: ctx.graphics_queue(),
            present_queue: ctx.present_queue(),
        };

        unsafe {
            engine.create_swapchain(ctx.surface())?;
            engine.create_color_views()?;
            engine.create_depth_resources(ctx)?;
            engine.create_render_pass()?;
            engine.create_framebuffers()?;
            engine.sync = FrameSync::create(
                &engine.device,
                MAX_FRAMES_IN_FLIGHT,
                engine.images.len(),
            )?;
        }

        info!(
            "presentation engine ready: {} images, {} frames in flight",
            engine.images.len(),
            MAX_FRAMES_IN_FLIGHT
        );
        Ok(engine)
    }

    unsafe fn create_swapchain(&mut self, surface: vk::SurfaceKHR) -> RenderResult<()> {
        let plan = &self.plan;
        let info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface,
            min_image_count: plan.image_count,
            image_format: plan.surface_format.format,
            image_color_space: plan.surface_format.color_space,
            image_extent: plan.extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: plan.sharing_mode,
            queue_family_index_count: plan.queue_family_indices.len() as u32,
            p_queue_family_indices: plan.queue_family_indices.as_ptr(),
            pre_transform: plan.pre_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode: plan.present_mode,
            clipped: vk::TRUE,
            old_swapchain: vk::SwapchainKHR::null(),
            ..Default::default()
        };
        self.swapchain = self
            .swapchain_loader
            .create_swapchain(&info, None)
            .setup("create_swapchain")?;

        let images = self
            .swapchain_loader
            .get_swapchain_images(self.swapchain)
            .setup("get_swapchain_images")?;
        info!(
            "swapchain images: requested {}, got {}",
            self.plan.image_count,
            images.len()
        );
        self.images = images
            .into_iter()
            .map(|image| PresentableImage {
                image,
                ..Default::default()
            })
            .collect();
        Ok(())
    }

    unsafe fn create_color_views(&mut self) -> RenderResult<()> {
        let format = self.plan.surface_format.format;
        for img in &mut self.images {
            let info = vk::ImageViewCreateInfo {
                s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
                image: img.image,
                view_type: vk::ImageViewType::TYPE_2D,
                format,
                subresource_range: subresource(vk::ImageAspectFlags::COLOR),
                ..Default::default()
            };
            img.color_view = self
                .device
                .create_image_view(&info, None)
                .setup("create_image_view (color)")?;
        }
        Ok(())
    }

    unsafe fn create_depth_resources(&mut self, ctx: &DeviceContext) -> RenderResult<()> {
        self.depth_format = ctx.find_supported_format(
            &DEPTH_FORMAT_CANDIDATES,
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        )?;
        info!("depth format {:?}", self.depth_format);

        let extent = self.plan.extent;
        for img in &mut self.images {
            let info = vk::ImageCreateInfo {
                s_type: vk::StructureType::IMAGE_CREATE_INFO,
                image_type: vk::ImageType::TYPE_2D,
                format: self.depth_format,
                extent: vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                },
                mip_levels: 1,
                array_layers: 1,
                samples: vk::SampleCountFlags::TYPE_1,
                tiling: vk::ImageTiling::OPTIMAL,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                sharing_mode: vk::SharingMode::EXCLUSIVE,
                initial_layout: vk::ImageLayout::UNDEFINED,
                ..Default::default()
            };
            let (image, memory) =
                ctx.create_image_with_info(&info, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;
            img.depth_image = image;
            img.depth_memory = memory;

            let view_info = vk::ImageViewCreateInfo {
                s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
                image,
                view_type: vk::ImageViewType::TYPE_2D,
                format: self.depth_format,
                subresource_range: subresource(vk::ImageAspectFlags::DEPTH),
                ..Default::default()
            };
            img.depth_view = self
                .device
                .create_image_view(&view_info, None)
                .setup("create_image_view (depth)")?;
        }
        Ok(())
    }

    unsafe fn create_render_pass(&mut self) -> RenderResult<()> {
        let attachments =
            attachment_descriptions(self.plan.surface_format.format, self.depth_format);
        let color_ref = vk::AttachmentReference {
            attachment: COLOR_ATTACHMENT,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        };
        let depth_ref = vk::AttachmentReference {
            attachment: DEPTH_ATTACHMENT,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        let subpass = vk::SubpassDescription {
            pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
            color_attachment_count: 1,
            p_color_attachments: &color_ref,
            p_depth_stencil_attachment: &depth_ref,
            ..Default::default()
        };
        let dependency = external_dependency();

        let info = vk::RenderPassCreateInfo {
            s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
            attachment_count: attachments.len() as u32,
            p_attachments: attachments.as_ptr(),
            subpass_count: 1,
            p_subpasses: &subpass,
            dependency_count: 1,
            p_dependencies: &dependency,
            ..Default::default()
        };
        self.render_pass = self
            .device
            .create_render_pass(&info, None)
            .setup("create_render_pass")?;
        Ok(())
    }

    unsafe fn create_framebuffers(&mut self) -> RenderResult<()> {
        let extent = self.plan.extent;
        for img in &mut self.images {
            let attachments = [img.color_view, img.depth_view];
            let info = vk::FramebufferCreateInfo {
                s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
                render_pass: self.render_pass,
                attachment_count: attachments.len() as u32,
                p_attachments: attachments.as_ptr(),
                width: extent.width,
                height: extent.height,
                layers: 1,
                ..Default::default()
            };
            img.framebuffer = self
                .device
                .create_framebuffer(&info, None)
                .setup("create_framebuffer")?;
        }
        Ok(())
    }

    /// Blocks until the current frame slot has retired, then returns the
    /// next image to render into.
    pub fn acquire_next_image(&mut self) -> RenderResult<u32> {
        let gpu = VkTimeline {
            device: &self.device,
            swapchain_loader: &self.swapchain_loader,
            swapchain: self.swapchain,
            graphics_queue: self.graphics_queue,
            present_queue: self.present_queue,
        };
        self.sync.acquire(&gpu)
    }

    /// Submits `cmd` for `image_index` and presents it.
    pub fn submit_command_buffers(
        &mut self,
        cmd: vk::CommandBuffer,
        image_index: u32,
    ) -> RenderResult<PresentOutcome> {
        let gpu = VkTimeline {
            device: &self.device,
            swapchain_loader: &self.swapchain_loader,
            swapchain: self.swapchain,
            graphics_queue: self.graphics_queue,
            present_queue: self.present_queue,
        };
        self.sync.submit(&gpu, cmd, image_index)
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn framebuffer(&self, index: usize) -> vk::Framebuffer {
        self.images[index].framebuffer
    }

    pub fn images(&self) -> &[PresentableImage] {
        &self.images
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.plan.extent
    }

    pub fn width(&self) -> u32 {
        self.plan.extent.width
    }

    pub fn height(&self) -> u32 {
        self.plan.extent.height
    }

    pub fn extent_aspect_ratio(&self) -> f32 {
        self.plan.extent.width as f32 / self.plan.extent.height as f32
    }

    pub fn swapchain_image_format(&self) -> vk::Format {
        self.plan.surface_format.format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.plan.present_mode
    }

    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    pub fn current_frame(&self) -> usize {
        self.sync.current_frame()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachments_match_the_framebuffer_order() {
        let [color, depth] =
            attachment_descriptions(vk::Format::B8G8R8A8_SRGB, vk::Format::D32_SFLOAT);
        assert_eq!(color.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(color.final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(color.store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(depth.format, vk::Format::D32_SFLOAT);
        assert_eq!(
            depth.final_layout,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
        assert_eq!(depth.store_op, vk::AttachmentStoreOp::DONT_CARE);
        assert_eq!((COLOR_ATTACHMENT, DEPTH_ATTACHMENT), (0, 1));
    }

    #[test]
    fn external_dependency_guards_attachment_writes() {
        let dep = external_dependency();
        assert_eq!(dep.src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(dep.dst_subpass, 0);
        assert!(dep
            .dst_stage_mask
            .contains(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT));
        assert!(dep
            .dst_access_mask
            .contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));
        assert!(dep.src_access_mask.is_empty());
    }
}

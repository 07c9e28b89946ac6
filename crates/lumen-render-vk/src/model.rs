// SPDX-License-Identifier: CEPL-1.0
use std::mem::{offset_of, size_of};

use ash::vk;
use lumen_render::Vertex;
use tracing::debug;

use crate::context::DeviceContext;
use crate::error::{RenderError, RenderResult, SetupContext};

pub const VERTEX_BINDING: u32 = 0;

pub fn binding_descriptions() -> Vec<vk::VertexInputBindingDescription> {
    vec![vk::VertexInputBindingDescription {
        binding: VERTEX_BINDING,
        stride: size_of::<Vertex>() as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    }]
}

/// Location 0 is the 2D position, location 1 the RGB colour.
pub fn attribute_descriptions() -> Vec<vk::VertexInputAttributeDescription> {
    vec![
        vk::VertexInputAttributeDescription {
            location: 0,
            binding: VERTEX_BINDING,
            format: vk::Format::R32G32_SFLOAT,
            offset: offset_of!(Vertex, position) as u32,
        },
        vk::VertexInputAttributeDescription {
            location: 1,
            binding: VERTEX_BINDING,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: offset_of!(Vertex, color) as u32,
        },
    ]
}

/// A vertex buffer in host-visible, coherent memory.
pub struct Model {
    device: ash::Device,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    vertex_count: u32,
}

impl Drop for Model {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

impl Model {
    pub fn new(ctx: &DeviceContext, vertices: &[Vertex]) -> RenderResult<Self> {
        if vertices.len() < 3 {
            return Err(RenderError::InvalidMesh(vertices.len()));
        }
        let bytes: &[u8] = bytemuck::cast_slice(vertices);
        let size = bytes.len() as vk::DeviceSize;

        unsafe {
            let (buffer, memory) = ctx.create_buffer(
                size,
                vk::BufferUsageFlags::VERTEX_BUFFER,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?;
            // Owns the handles from here on, so an upload failure cleans up.
            let model = Self {
                device: ctx.device().clone(),
                buffer,
                memory,
                vertex_count: vertices.len() as u32,
            };

            let dst = model
                .device
                .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())
                .setup("map_memory")?;
            std::slice::from_raw_parts_mut(dst.cast::<u8>(), bytes.len()).copy_from_slice(bytes);
            model.device.unmap_memory(memory);

            debug!("vertex buffer: {} vertices, {size} bytes", model.vertex_count);
            Ok(model)
        }
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub unsafe fn bind(&self, cmd: vk::CommandBuffer) {
        self.device
            .cmd_bind_vertex_buffers(cmd, VERTEX_BINDING, &[self.buffer], &[0]);
    }

    pub unsafe fn draw(&self, cmd: vk::CommandBuffer) {
        self.device.cmd_draw(cmd, self.vertex_count, 1, 0, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_cover_the_whole_vertex() {
        let bindings = binding_descriptions();
        let attrs = attribute_descriptions();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].stride, 20);
        assert_eq!(
            attrs.iter().map(|a| (a.location, a.offset)).collect::<Vec<_>>(),
            vec![(0, 0), (1, 8)]
        );
        assert!(attrs.iter().all(|a| a.binding == bindings[0].binding));
    }
}

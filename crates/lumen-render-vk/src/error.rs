// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use lumen_render::ShaderError;
use thiserror::Error;

pub type RenderResult<T> = Result<T, RenderError>;

/// Every variant is fatal for the renderer; there is no retry path.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to load the Vulkan library")]
    Loader(#[from] ash::LoadingError),
    #[error("{what} failed: {result}")]
    Setup {
        what: &'static str,
        result: vk::Result,
    },
    #[error("failed to find a suitable GPU")]
    NoSuitableDevice,
    #[error("no memory type matches filter {type_bits:#b} with {properties:?}")]
    NoMemoryType {
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    },
    #[error("none of the candidate formats {candidates:?} supports {features:?}")]
    NoSupportedFormat {
        candidates: Vec<vk::Format>,
        features: vk::FormatFeatureFlags,
    },
    #[error("window handle unavailable: {0}")]
    WindowHandle(#[from] raw_window_handle::HandleError),
    #[error(transparent)]
    Shader(#[from] ShaderError),
    #[error("cannot create a pipeline without a render pass")]
    MissingRenderPass,
    #[error("mesh needs at least 3 vertices, got {0}")]
    InvalidMesh(usize),
    #[error("failed to acquire swapchain image: {0}")]
    Acquire(vk::Result),
    #[error("failed to submit draw command buffer: {0}")]
    Submit(vk::Result),
    #[error("fence operation failed: {0}")]
    Fence(vk::Result),
    #[error("failed to present swapchain image: {0}")]
    Present(vk::Result),
    #[error("waiting for the device to go idle failed: {0}")]
    WaitIdle(vk::Result),
}

/// Attaches a step name to a raw Vulkan result during construction.
pub(crate) trait SetupContext<T> {
    fn setup(self, what: &'static str) -> RenderResult<T>;
}

impl<T> SetupContext<T> for Result<T, vk::Result> {
    fn setup(self, what: &'static str) -> RenderResult<T> {
        self.map_err(|result| RenderError::Setup { what, result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_context_names_the_step() {
        let r: Result<(), vk::Result> = Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let err = r.setup("create_render_pass").unwrap_err();
        assert!(matches!(
            err,
            RenderError::Setup {
                what: "create_render_pass",
                result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            }
        ));
        assert!(err.to_string().starts_with("create_render_pass failed"));
    }

    #[test]
    fn frame_errors_carry_the_vulkan_code() {
        let err = RenderError::Acquire(vk::Result::ERROR_OUT_OF_DATE_KHR);
        assert!(err.to_string().contains("acquire"));
        let err = RenderError::Submit(vk::Result::ERROR_DEVICE_LOST);
        assert!(err.to_string().contains("submit"));
    }
}

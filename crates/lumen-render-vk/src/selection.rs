// SPDX-License-Identifier: CEPL-1.0
//! Pure selection policy for the swapchain and device. Everything here works
//! on plain `vk` values so it can be exercised without a GPU.

use std::collections::BTreeSet;
use std::ffi::{CStr, CString};

use ash::vk;
use lumen_render::RenderSize;

/// The surface format taken whenever the surface offers it.
pub const PREFERRED_SURFACE_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_SRGB,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// Low-latency modes in priority order; FIFO is the guaranteed fallback.
pub const PRESENT_MODE_PRIORITY: [vk::PresentModeKHR; 2] =
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE];

/// Depth formats probed in order, first supported wins.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// `current_extent.width` equal to this means the window decides the size.
pub const UNDEFINED_EXTENT: u32 = u32::MAX;

/// What the surface supports for one physical device.
#[derive(Clone, Debug, Default)]
pub struct SwapChainSupportDetails {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapChainSupportDetails {
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics_family: Option<u32>,
    pub present_family: Option<u32>,
}

impl QueueFamilyIndices {
    pub fn is_complete(&self) -> bool {
        self.graphics_family.is_some() && self.present_family.is_some()
    }

    /// Both indices, if complete.
    pub fn pair(&self) -> Option<(u32, u32)> {
        Some((self.graphics_family?, self.present_family?))
    }

    /// Deduplicated family indices, graphics first.
    pub fn unique(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(2);
        for family in [self.graphics_family, self.present_family].into_iter().flatten() {
            if !out.contains(&family) {
                out.push(family);
            }
        }
        out
    }
}

/// First family with graphics support, and the first family that can present.
/// Stops scanning as soon as both are found.
pub fn find_queue_families(
    families: &[vk::QueueFamilyProperties],
    mut supports_present: impl FnMut(u32) -> bool,
) -> QueueFamilyIndices {
    let mut indices = QueueFamilyIndices::default();
    for (i, family) in families.iter().enumerate() {
        let i = i as u32;
        if family.queue_count > 0 && family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            indices.graphics_family.get_or_insert(i);
        }
        if family.queue_count > 0 && indices.present_family.is_none() && supports_present(i) {
            indices.present_family = Some(i);
        }
        if indices.is_complete() {
            break;
        }
    }
    indices
}

/// Required extensions the device does not advertise.
///
/// Starts from the required set and erases every available name; the
/// device is fully supported iff nothing is left.
pub fn missing_extensions<'a>(
    required: &[&CStr],
    available: impl IntoIterator<Item = &'a CStr>,
) -> BTreeSet<CString> {
    let mut missing: BTreeSet<CString> = required.iter().map(|&name| name.to_owned()).collect();
    for name in available {
        missing.remove(name);
    }
    missing
}

pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == PREFERRED_SURFACE_FORMAT.format
                && f.color_space == PREFERRED_SURFACE_FORMAT.color_space
        })
        .or_else(|| formats.first().copied())
}

/// With `vsync` the choice is always FIFO; otherwise the first low-latency
/// mode the surface offers, in `PRESENT_MODE_PRIORITY` order.
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    PRESENT_MODE_PRIORITY
        .into_iter()
        .find(|m| modes.contains(m))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub fn extent_from_caps(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != UNDEFINED_EXTENT {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: want
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: want
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One more than the minimum, capped by the maximum (0 == "no max").
pub fn image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = caps.min_image_count + 1;
    if caps.max_image_count > 0 && wanted > caps.max_image_count {
        caps.max_image_count
    } else {
        wanted
    }
}

/// Concurrent sharing across both families when they differ, so no
/// ownership transfer is needed; exclusive otherwise.
pub fn sharing_mode(indices: (u32, u32)) -> (vk::SharingMode, Vec<u32>) {
    let (graphics, present) = indices;
    if graphics != present {
        (vk::SharingMode::CONCURRENT, vec![graphics, present])
    } else {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    }
}

/// First candidate whose tiling features contain `features`.
pub fn pick_supported_format(
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
    mut properties: impl FnMut(vk::Format) -> vk::FormatProperties,
) -> Option<vk::Format> {
    candidates.iter().copied().find(|&format| {
        let props = properties(format);
        match tiling {
            vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
            vk::ImageTiling::OPTIMAL => props.optimal_tiling_features.contains(features),
            _ => false,
        }
    })
}

/// Index of the first memory type allowed by `type_bits` that has `properties`.
pub fn find_memory_type_index(
    memory: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory.memory_type_count).find(|&i| {
        (type_bits & (1 << i)) != 0
            && memory.memory_types[i as usize]
                .property_flags
                .contains(properties)
    })
}

/// Everything the swapchain create info needs, decided up front.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwapchainPlan {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub sharing_mode: vk::SharingMode,
    pub queue_family_indices: Vec<u32>,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

impl SwapchainPlan {
    /// `None` when the surface offers no formats at all.
    pub fn new(
        support: &SwapChainSupportDetails,
        families: (u32, u32),
        window: RenderSize,
        vsync: bool,
    ) -> Option<Self> {
        let caps = &support.capabilities;
        let (sharing_mode, queue_family_indices) = sharing_mode(families);
        Some(Self {
            surface_format: choose_surface_format(&support.formats)?,
            present_mode: choose_present_mode(&support.present_modes, vsync),
            extent: extent_from_caps(caps, window),
            image_count: image_count(caps),
            sharing_mode,
            queue_family_indices,
            pre_transform: caps.current_transform,
        })
    }
}

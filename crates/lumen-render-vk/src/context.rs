// SPDX-License-Identifier: CEPL-1.0
//! Instance, surface, physical/logical device, queues and the command pool.

use std::ffi::{c_char, CStr};

use ash::khr::{get_physical_device_properties2, portability_enumeration, portability_subset};
use ash::khr::{surface, swapchain};
use ash::{vk, Entry, Instance};
use lumen_render::NativeSurface;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use tracing::{debug, info, warn};

use crate::debug::{self, DebugMessenger, ValidationSink};
use crate::error::{RenderError, RenderResult, SetupContext};
use crate::selection::{
    find_memory_type_index, find_queue_families, missing_extensions, pick_supported_format,
    QueueFamilyIndices, SwapChainSupportDetails,
};

const APP_NAME: &CStr = c"Lumen";

/// Device extensions every candidate GPU must advertise.
pub const REQUIRED_DEVICE_EXTENSIONS: [&CStr; 1] = [swapchain::NAME];

/// Instance-level objects, torn down after the logical device.
struct InstanceBundle {
    entry: Entry,
    instance: Instance,
    messenger: Option<DebugMessenger>,
    surface_loader: surface::Instance,
    surface: vk::SurfaceKHR,
}

impl Drop for InstanceBundle {
    fn drop(&mut self) {
        unsafe {
            if self.surface != vk::SurfaceKHR::null() {
                self.surface_loader.destroy_surface(self.surface, None);
            }
            if let Some(messenger) = self.messenger.as_mut() {
                messenger.destroy();
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Owns the GPU connection for one window surface.
pub struct DeviceContext {
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    device_name: String,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    queue_families: (u32, u32),
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    command_pool: vk::CommandPool,
    // Declared last: dropped after `Drop::drop` has destroyed the device.
    instance: InstanceBundle,
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
        }
    }
}

fn extension_names(props: &[vk::ExtensionProperties]) -> impl Iterator<Item = &CStr> {
    props.iter().filter_map(|p| p.extension_name_as_c_str().ok())
}

fn has_extension(props: &[vk::ExtensionProperties], name: &CStr) -> bool {
    extension_names(props).any(|n| n == name)
}

unsafe fn create_instance(
    entry: &Entry,
    display: RawDisplayHandle,
    validation: bool,
) -> RenderResult<Instance> {
    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: APP_NAME.as_ptr(),
        application_version: vk::make_api_version(0, 1, 0, 0),
        p_engine_name: APP_NAME.as_ptr(),
        engine_version: vk::make_api_version(0, 1, 0, 0),
        api_version: vk::API_VERSION_1_0,
        ..Default::default()
    };

    let mut extensions: Vec<*const c_char> = ash_window::enumerate_required_extensions(display)
        .setup("enumerate_required_extensions")?
        .to_vec();

    let available = entry
        .enumerate_instance_extension_properties(None)
        .setup("enumerate_instance_extension_properties")?;
    let mut flags = vk::InstanceCreateFlags::empty();
    if has_extension(&available, portability_enumeration::NAME) {
        extensions.push(portability_enumeration::NAME.as_ptr());
        flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        if has_extension(&available, get_physical_device_properties2::NAME) {
            extensions.push(get_physical_device_properties2::NAME.as_ptr());
        }
    }

    let layers = [debug::VALIDATION_LAYER.as_ptr()];
    if validation {
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
    }

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        flags,
        p_application_info: &app_info,
        enabled_layer_count: if validation { layers.len() as u32 } else { 0 },
        pp_enabled_layer_names: layers.as_ptr(),
        enabled_extension_count: extensions.len() as u32,
        pp_enabled_extension_names: extensions.as_ptr(),
        ..Default::default()
    };

    entry.create_instance(&create_info, None).setup("create_instance")
}

pub(crate) unsafe fn query_swap_chain_support(
    loader: &surface::Instance,
    phys: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
) -> RenderResult<SwapChainSupportDetails> {
    Ok(SwapChainSupportDetails {
        capabilities: loader
            .get_physical_device_surface_capabilities(phys, surface)
            .setup("get_physical_device_surface_capabilities")?,
        formats: loader
            .get_physical_device_surface_formats(phys, surface)
            .setup("get_physical_device_surface_formats")?,
        present_modes: loader
            .get_physical_device_surface_present_modes(phys, surface)
            .setup("get_physical_device_surface_present_modes")?,
    })
}

unsafe fn queue_families_for(
    bundle: &InstanceBundle,
    phys: vk::PhysicalDevice,
) -> QueueFamilyIndices {
    let families = bundle
        .instance
        .get_physical_device_queue_family_properties(phys);
    find_queue_families(&families, |i| {
        bundle
            .surface_loader
            .get_physical_device_surface_support(phys, i, bundle.surface)
            .unwrap_or(false)
    })
}

/// Suitable = complete queue families, every required extension, an adequate
/// swapchain and sampler anisotropy.
unsafe fn is_device_suitable(bundle: &InstanceBundle, phys: vk::PhysicalDevice) -> bool {
    let indices = queue_families_for(bundle, phys);

    let extensions = bundle
        .instance
        .enumerate_device_extension_properties(phys)
        .unwrap_or_default();
    let missing = missing_extensions(&REQUIRED_DEVICE_EXTENSIONS, extension_names(&extensions));
    for name in &missing {
        debug!("device lacks extension {}", name.to_string_lossy());
    }

    let swap_chain_adequate = missing.is_empty()
        && query_swap_chain_support(&bundle.surface_loader, phys, bundle.surface)
            .map(|s| s.is_adequate())
            .unwrap_or(false);

    let features = bundle.instance.get_physical_device_features(phys);

    debug!(
        "queues complete: {}, extensions: {}, swapchain: {}, anisotropy: {}",
        indices.is_complete(),
        missing.is_empty(),
        swap_chain_adequate,
        features.sampler_anisotropy == vk::TRUE
    );
    indices.is_complete()
        && missing.is_empty()
        && swap_chain_adequate
        && features.sampler_anisotropy == vk::TRUE
}

fn device_name(props: &vk::PhysicalDeviceProperties) -> String {
    props
        .device_name_as_c_str()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|_| String::from("<unnamed>"))
}

unsafe fn pick_physical_device(bundle: &InstanceBundle) -> RenderResult<vk::PhysicalDevice> {
    let devices = bundle
        .instance
        .enumerate_physical_devices()
        .setup("enumerate_physical_devices")?;
    info!("device count: {}", devices.len());

    for phys in devices {
        let props = bundle.instance.get_physical_device_properties(phys);
        debug!("checking {}", device_name(&props));
        if is_device_suitable(bundle, phys) {
            return Ok(phys);
        }
    }
    Err(RenderError::NoSuitableDevice)
}

unsafe fn create_logical_device(
    bundle: &InstanceBundle,
    phys: vk::PhysicalDevice,
    indices: QueueFamilyIndices,
) -> RenderResult<ash::Device> {
    let priorities = [1.0_f32];
    let queue_infos: Vec<vk::DeviceQueueCreateInfo> = indices
        .unique()
        .into_iter()
        .map(|family| vk::DeviceQueueCreateInfo {
            s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
            queue_family_index: family,
            queue_count: 1,
            p_queue_priorities: priorities.as_ptr(),
            ..Default::default()
        })
        .collect();

    let features = vk::PhysicalDeviceFeatures {
        sampler_anisotropy: vk::TRUE,
        ..Default::default()
    };

    let mut extensions: Vec<*const c_char> =
        REQUIRED_DEVICE_EXTENSIONS.iter().map(|n| n.as_ptr()).collect();
    let available = bundle
        .instance
        .enumerate_device_extension_properties(phys)
        .setup("enumerate_device_extension_properties")?;
    if has_extension(&available, portability_subset::NAME) {
        debug!("enabling {}", portability_subset::NAME.to_string_lossy());
        extensions.push(portability_subset::NAME.as_ptr());
    }

    let create_info = vk::DeviceCreateInfo {
        s_type: vk::StructureType::DEVICE_CREATE_INFO,
        queue_create_info_count: queue_infos.len() as u32,
        p_queue_create_infos: queue_infos.as_ptr(),
        p_enabled_features: &features,
        enabled_extension_count: extensions.len() as u32,
        pp_enabled_extension_names: extensions.as_ptr(),
        ..Default::default()
    };

    bundle
        .instance
        .create_device(phys, &create_info, None)
        .setup("create_device")
}

impl DeviceContext {
    /// Connects to the GPU and binds `window`'s surface. Validation is only
    /// turned on when requested and the layer is installed; messages go to
    /// `sink`.
    pub fn new(
        window: &dyn NativeSurface,
        validation: bool,
        sink: Box<dyn ValidationSink>,
    ) -> RenderResult<Self> {
        let display: RawDisplayHandle = window.display_handle()?.as_raw();
        let handle: RawWindowHandle = window.window_handle()?.as_raw();

        unsafe {
            let entry = Entry::load()?;

            let validation = validation && {
                let layers = entry
                    .enumerate_instance_layer_properties()
                    .setup("enumerate_instance_layer_properties")?;
                let found = debug::layer_available(&layers, debug::VALIDATION_LAYER);
                if !found {
                    warn!(
                        "validation requested but {} is not installed",
                        debug::VALIDATION_LAYER.to_string_lossy()
                    );
                }
                found
            };

            let instance = create_instance(&entry, display, validation)?;
            info!("instance created (validation: {validation})");

            let surface_loader = surface::Instance::new(&entry, &instance);
            let mut bundle = InstanceBundle {
                entry,
                instance,
                messenger: None,
                surface_loader,
                surface: vk::SurfaceKHR::null(),
            };

            if validation {
                bundle.messenger = Some(DebugMessenger::new(
                    &bundle.entry,
                    &bundle.instance,
                    sink,
                )?);
            }

            bundle.surface = ash_window::create_surface(
                &bundle.entry,
                &bundle.instance,
                display,
                handle,
                None,
            )
            .setup("create_surface")?;

            let physical_device = pick_physical_device(&bundle)?;
            let props = bundle.instance.get_physical_device_properties(physical_device);
            let device_name = device_name(&props);
            info!("physical device: {device_name}");

            let indices = queue_families_for(&bundle, physical_device);
            let queue_families = indices.pair().ok_or(RenderError::NoSuitableDevice)?;
            let memory_properties = bundle
                .instance
                .get_physical_device_memory_properties(physical_device);

            let device = create_logical_device(&bundle, physical_device, indices)?;
            let graphics_queue = device.get_device_queue(queue_families.0, 0);
            let present_queue = device.get_device_queue(queue_families.1, 0);

            let pool_info = vk::CommandPoolCreateInfo {
                s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
                flags: vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                queue_family_index: queue_families.0,
                ..Default::default()
            };
            let command_pool = match device.create_command_pool(&pool_info, None) {
                Ok(pool) => pool,
                Err(result) => {
                    device.destroy_device(None);
                    return Err(RenderError::Setup {
                        what: "create_command_pool",
                        result,
                    });
                }
            };

            info!(
                "logical device ready (graphics family {}, present family {})",
                queue_families.0, queue_families.1
            );

            Ok(Self {
                device,
                physical_device,
                device_name,
                memory_properties,
                queue_families,
                graphics_queue,
                present_queue,
                command_pool,
                instance: bundle,
            })
        }
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn instance(&self) -> &Instance {
        &self.instance.instance
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.instance.surface
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool
    }

    /// `(graphics, present)` family indices of the chosen device.
    pub fn find_physical_queue_families(&self) -> (u32, u32) {
        self.queue_families
    }

    pub fn swap_chain_support(&self) -> RenderResult<SwapChainSupportDetails> {
        unsafe {
            query_swap_chain_support(
                &self.instance.surface_loader,
                self.physical_device,
                self.instance.surface,
            )
        }
    }

    pub fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        tiling: vk::ImageTiling,
        features: vk::FormatFeatureFlags,
    ) -> RenderResult<vk::Format> {
        pick_supported_format(candidates, tiling, features, |format| unsafe {
            self.instance
                .instance
                .get_physical_device_format_properties(self.physical_device, format)
        })
        .ok_or_else(|| RenderError::NoSupportedFormat {
            candidates: candidates.to_vec(),
            features,
        })
    }

    pub fn find_memory_type(
        &self,
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> RenderResult<u32> {
        find_memory_type_index(&self.memory_properties, type_bits, properties)
            .ok_or(RenderError::NoMemoryType {
                type_bits,
                properties,
            })
    }

    /// Allocates bound memory for `desc`. The caller owns both handles.
    pub unsafe fn create_image_with_info(
        &self,
        desc: &vk::ImageCreateInfo<'_>,
        properties: vk::MemoryPropertyFlags,
    ) -> RenderResult<(vk::Image, vk::DeviceMemory)> {
        let image = self.device.create_image(desc, None).setup("create_image")?;
        let requirements = self.device.get_image_memory_requirements(image);
        match self.allocate(requirements, properties) {
            Ok(memory) => match self.device.bind_image_memory(image, memory, 0) {
                Ok(()) => Ok((image, memory)),
                Err(result) => {
                    self.device.free_memory(memory, None);
                    self.device.destroy_image(image, None);
                    Err(RenderError::Setup {
                        what: "bind_image_memory",
                        result,
                    })
                }
            },
            Err(e) => {
                self.device.destroy_image(image, None);
                Err(e)
            }
        }
    }

    /// Exclusive-mode buffer with bound memory. The caller owns both handles.
    pub unsafe fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> RenderResult<(vk::Buffer, vk::DeviceMemory)> {
        let info = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let buffer = self.device.create_buffer(&info, None).setup("create_buffer")?;
        let requirements = self.device.get_buffer_memory_requirements(buffer);
        match self.allocate(requirements, properties) {
            Ok(memory) => match self.device.bind_buffer_memory(buffer, memory, 0) {
                Ok(()) => Ok((buffer, memory)),
                Err(result) => {
                    self.device.free_memory(memory, None);
                    self.device.destroy_buffer(buffer, None);
                    Err(RenderError::Setup {
                        what: "bind_buffer_memory",
                        result,
                    })
                }
            },
            Err(e) => {
                self.device.destroy_buffer(buffer, None);
                Err(e)
            }
        }
    }

    unsafe fn allocate(
        &self,
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
    ) -> RenderResult<vk::DeviceMemory> {
        let alloc_info = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: requirements.size,
            memory_type_index: self.find_memory_type(requirements.memory_type_bits, properties)?,
            ..Default::default()
        };
        self.device
            .allocate_memory(&alloc_info, None)
            .setup("allocate_memory")
    }

    pub fn wait_idle(&self) -> RenderResult<()> {
        unsafe { self.device.device_wait_idle() }.map_err(RenderError::WaitIdle)
    }
}

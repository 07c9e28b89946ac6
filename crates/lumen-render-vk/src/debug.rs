// SPDX-License-Identifier: CEPL-1.0
//! Validation layer plumbing. Messages go to an injected [`ValidationSink`];
//! the sink is owned by the messenger and handed to the driver through
//! `p_user_data`, so there is no global callback state.

use std::borrow::Cow;
use std::ffi::{c_void, CStr};

use ash::ext::debug_utils;
use ash::vk;
use tracing::{debug, error, info, warn};

use crate::error::{RenderResult, SetupContext};

pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Verbose,
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn from_vk(flags: vk::DebugUtilsMessageSeverityFlagsEXT) -> Self {
        if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
            Severity::Error
        } else if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
            Severity::Warning
        } else if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
            Severity::Info
        } else {
            Severity::Verbose
        }
    }
}

/// Receives validation layer messages. Called from whichever thread the
/// driver reports on, hence `Send + Sync`.
pub trait ValidationSink: Send + Sync {
    fn message(&self, severity: Severity, kind: vk::DebugUtilsMessageTypeFlagsEXT, text: &str);
}

/// Forwards validation messages to `tracing` at the matching level.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl ValidationSink for TracingSink {
    fn message(&self, severity: Severity, kind: vk::DebugUtilsMessageTypeFlagsEXT, text: &str) {
        match severity {
            Severity::Error => error!("[vulkan {kind:?}] {text}"),
            Severity::Warning => warn!("[vulkan {kind:?}] {text}"),
            Severity::Info => info!("[vulkan {kind:?}] {text}"),
            Severity::Verbose => debug!("[vulkan {kind:?}] {text}"),
        }
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    kind: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || user.is_null() {
        return vk::FALSE;
    }
    // SAFETY: `user` is the `Box<dyn ValidationSink>` owned by `DebugMessenger`,
    // which outlives the messenger handle.
    let sink = &*(user as *const Box<dyn ValidationSink>);
    let text = if (*data).p_message.is_null() {
        Cow::Borrowed("")
    } else {
        CStr::from_ptr((*data).p_message).to_string_lossy()
    };
    sink.message(Severity::from_vk(severity), kind, &text);
    vk::FALSE
}

pub(crate) struct DebugMessenger {
    loader: debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
    // Boxed twice so the callback gets a thin pointer.
    _sink: Box<Box<dyn ValidationSink>>,
}

impl DebugMessenger {
    pub(crate) unsafe fn new(
        entry: &ash::Entry,
        instance: &ash::Instance,
        sink: Box<dyn ValidationSink>,
    ) -> RenderResult<Self> {
        let loader = debug_utils::Instance::new(entry, instance);
        let sink = Box::new(sink);
        let ci = vk::DebugUtilsMessengerCreateInfoEXT {
            s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
            message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            pfn_user_callback: Some(debug_callback),
            p_user_data: &*sink as *const Box<dyn ValidationSink> as *mut c_void,
            ..Default::default()
        };
        let messenger = loader
            .create_debug_utils_messenger(&ci, None)
            .setup("create_debug_utils_messenger")?;
        Ok(Self {
            loader,
            messenger,
            _sink: sink,
        })
    }

    /// Must run before the instance is destroyed.
    pub(crate) unsafe fn destroy(&mut self) {
        if self.messenger != vk::DebugUtilsMessengerEXT::null() {
            self.loader
                .destroy_debug_utils_messenger(self.messenger, None);
            self.messenger = vk::DebugUtilsMessengerEXT::null();
        }
    }
}

/// True when `name` is among the layers the loader reports.
pub(crate) fn layer_available(layers: &[vk::LayerProperties], name: &CStr) -> bool {
    layers
        .iter()
        .any(|layer| layer.layer_name_as_c_str().is_ok_and(|n| n == name))
}

//! `VK_EXT_debug_utils` messenger plumbing.
//!
//! The messenger is registered by [`crate::instance::InstanceLoader`]
//! when a debug level is configured and the extension was negotiated,
//! and is destroyed together with the instance. The driver invokes
//! [`vulkan_debug_callback`] on its own threads; the callback only
//! formats the message and forwards it to `tracing`.

use std::ffi::CStr;

use ash::vk;

use crate::instance::VulkanLogLevel;

pub const DEBUG_TARGET: &str = "rgpu-debug-messenger";

pub(crate) fn severity_flags(
    level: VulkanLogLevel,
) -> vk::DebugUtilsMessageSeverityFlagsEXT {
    use vk::DebugUtilsMessageSeverityFlagsEXT as S;
    match level {
        VulkanLogLevel::Verbose => S::VERBOSE | S::INFO | S::WARNING | S::ERROR,
        VulkanLogLevel::Info => S::INFO | S::WARNING | S::ERROR,
        VulkanLogLevel::Warning => S::WARNING | S::ERROR,
        VulkanLogLevel::Error => S::ERROR,
    }
}

pub(crate) fn messenger_create_info(
    level: VulkanLogLevel,
) -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(severity_flags(level))
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(vulkan_debug_callback))
}

fn type_label(message_type: vk::DebugUtilsMessageTypeFlagsEXT) -> &'static str {
    match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "GENERAL",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "VALIDATION",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "PERFORMANCE",
        _ => "UNKNOWN",
    }
}

/// Render one messenger callback as a log line.
///
/// Validation messages already carry the message id and are passed
/// through untouched; everything else is prefixed with its type and id.
pub fn format_debug_message(
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    message_id_name: Option<&str>,
    message: &str,
) -> String {
    if message_type.contains(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION) {
        return message.trim_end().to_owned();
    }
    format!(
        "[{}] [{}] {}",
        type_label(message_type),
        message_id_name.unwrap_or("-"),
        message.trim_end()
    )
}

/// # Safety
/// Called by the Vulkan loader with a valid callback data pointer.
pub(crate) unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() {
        return vk::FALSE;
    }
    //SAFETY: Vulkan guarantees p_callback_data is valid for the duration
    //of the callback; we checked it for null above
    let data = unsafe { &*p_callback_data };

    let message = if data.p_message.is_null() {
        std::borrow::Cow::Borrowed("")
    } else {
        //SAFETY: p_message is a null terminated string owned by the driver
        unsafe { CStr::from_ptr(data.p_message) }.to_string_lossy()
    };
    let message_id_name = if data.p_message_id_name.is_null() {
        None
    } else {
        //SAFETY: p_message_id_name is a null terminated string owned by the
        //driver
        let name = unsafe { CStr::from_ptr(data.p_message_id_name) };
        Some(name.to_string_lossy())
    };

    // Unwinding out of an extern "system" fn aborts the process.
    let _ = std::panic::catch_unwind(|| {
        let line = format_debug_message(
            message_type,
            message_id_name.as_deref(),
            &message,
        );
        match message_severity {
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => {
                tracing::trace!(target: DEBUG_TARGET, "{line}");
            }
            vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
                tracing::info!(target: DEBUG_TARGET, "{line}");
            }
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
                tracing::warn!(target: DEBUG_TARGET, "{line}");
            }
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
                tracing::error!(target: DEBUG_TARGET, "{line}");
            }
            _ => {
                tracing::debug!(target: DEBUG_TARGET, "{line}");
            }
        }
    });

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn severity_flags_include_everything_above_level() {
        use vk::DebugUtilsMessageSeverityFlagsEXT as S;
        assert_eq!(severity_flags(VulkanLogLevel::Error), S::ERROR);
        let warn = severity_flags(VulkanLogLevel::Warning);
        assert!(warn.contains(S::WARNING | S::ERROR));
        assert!(!warn.contains(S::INFO));
        assert!(severity_flags(VulkanLogLevel::Verbose).contains(S::VERBOSE));
    }

    #[test]
    fn validation_messages_pass_through() {
        let line = format_debug_message(
            vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
            Some("VUID-vkCreateDevice-ppEnabledExtensionNames-01387"),
            "Validation Error: missing dependency\n",
        );
        assert_eq!(line, "Validation Error: missing dependency");
    }

    #[test]
    fn other_messages_are_tagged() {
        let line = format_debug_message(
            vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            Some("UNASSIGNED-BestPractices"),
            "slow path",
        );
        assert_eq!(line, "[PERFORMANCE] [UNASSIGNED-BestPractices] slow path");

        let line = format_debug_message(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL,
            None,
            "loader message",
        );
        assert_eq!(line, "[GENERAL] [-] loader message");
    }

    #[test]
    fn callback_tolerates_null_fields() {
        let message = CString::new("hello").unwrap();
        let mut data = vk::DebugUtilsMessengerCallbackDataEXT::default();
        data.p_message = message.as_ptr();
        // SAFETY: data outlives the call and its pointers are valid or null.
        let ret = unsafe {
            vulkan_debug_callback(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL,
                &data,
                std::ptr::null_mut(),
            )
        };
        assert_eq!(ret, vk::FALSE);

        // SAFETY: a null callback data pointer is handled explicitly.
        let ret = unsafe {
            vulkan_debug_callback(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
                std::ptr::null(),
                std::ptr::null_mut(),
            )
        };
        assert_eq!(ret, vk::FALSE);
    }
}

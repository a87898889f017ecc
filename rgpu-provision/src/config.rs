//! Startup configuration for the provisioning pipeline.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    catalog::{CapabilityCatalog, CapabilityEntry, Profile, ProfileSet},
    instance::VulkanLogLevel,
    select::SelectionPolicy,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("App name must not be empty or contain NUL bytes")]
    InvalidAppName,
}

/// Everything the lifecycle needs to know before it touches Vulkan.
///
/// Any field missing from a TOML document keeps its default.
///
/// ```toml
/// app-name = "probe"
/// profiles = ["windowed-present", "debug", "ray-tracing"]
/// selection-policy = "prefer-discrete"
/// debug-level = "warning"
///
/// [[extra-device-capabilities]]
/// name = "VK_KHR_present_wait"
/// requirement = "required"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ProvisionConfig {
    pub app_name: String,
    pub profiles: ProfileSet,
    pub selection_policy: SelectionPolicy,
    /// Forward `VK_EXT_debug_utils` messages at or above this level.
    /// `None` registers no messenger.
    pub debug_level: Option<VulkanLogLevel>,
    pub extra_device_capabilities: Vec<CapabilityEntry>,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        let mut profiles = ProfileSet::new().with(Profile::WindowedPresent);
        let mut debug_level = None;
        if cfg!(debug_assertions) {
            profiles.insert(Profile::Debug);
            debug_level = Some(VulkanLogLevel::Warning);
        }
        Self {
            app_name: env!("CARGO_PKG_NAME").to_owned(),
            profiles,
            selection_policy: SelectionPolicy::default(),
            debug_level,
            extra_device_capabilities: Vec::new(),
        }
    }
}

impl ProvisionConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_name.is_empty() || self.app_name.contains('\0') {
            return Err(ConfigError::InvalidAppName);
        }
        Ok(())
    }

    /// The capability catalog these settings select, with the platform
    /// surface extensions reported by the windowing system.
    pub fn catalog(
        &self,
        platform_surface_extensions: impl IntoIterator<Item = String>,
    ) -> CapabilityCatalog {
        CapabilityCatalog::new(self.profiles.clone())
            .with_platform_surface_extensions(platform_surface_extensions)
            .with_extra_device_entries(
                self.extra_device_capabilities.iter().cloned(),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CapabilityKind, Requirement};

    #[test]
    fn empty_document_is_default() {
        assert_eq!(
            ProvisionConfig::from_toml_str("").unwrap(),
            ProvisionConfig::default()
        );
    }

    #[test]
    fn default_presents_and_debugs_in_debug_builds() {
        let config = ProvisionConfig::default();
        assert!(config.profiles.contains(Profile::WindowedPresent));
        assert_eq!(
            config.profiles.contains(Profile::Debug),
            cfg!(debug_assertions)
        );
        assert_eq!(config.selection_policy, SelectionPolicy::CombinedDiscrete);
    }

    #[test]
    fn parses_full_document() {
        let config = ProvisionConfig::from_toml_str(
            r#"
            app-name = "probe"
            profiles = ["spatial", "qualcomm"]
            selection-policy = "prefer-discrete"
            debug-level = "info"

            [[extra-device-capabilities]]
            name = "VK_KHR_present_wait"
            requirement = "required"

            [[extra-device-capabilities]]
            name = "VK_LAYER_test"
            kind = "layer"
            "#,
        )
        .unwrap();

        assert_eq!(config.app_name, "probe");
        assert!(config.profiles.contains(Profile::Spatial));
        assert!(config.profiles.contains(Profile::Qualcomm));
        assert!(!config.profiles.contains(Profile::WindowedPresent));
        assert_eq!(config.selection_policy, SelectionPolicy::PreferDiscrete);
        assert_eq!(config.debug_level, Some(VulkanLogLevel::Info));
        assert_eq!(
            config.extra_device_capabilities,
            [
                CapabilityEntry::extension(
                    "VK_KHR_present_wait",
                    Requirement::Required
                ),
                CapabilityEntry {
                    name: "VK_LAYER_test".to_owned(),
                    kind: CapabilityKind::Layer,
                    requirement: Requirement::Optional,
                },
            ]
        );

        let device = config.catalog(Vec::new()).device_request();
        for name in ["VK_KHR_multiview", "VK_KHR_present_wait"] {
            assert!(device.get(name).is_some_and(|e| e.is_required()));
        }
    }

    #[test]
    fn rejects_unknown_keys_and_profiles() {
        assert!(matches!(
            ProvisionConfig::from_toml_str("app-nmae = \"typo\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            ProvisionConfig::from_toml_str("profiles = [\"vr\"]"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn rejects_empty_app_name() {
        assert!(matches!(
            ProvisionConfig::from_toml_str("app-name = \"\""),
            Err(ConfigError::InvalidAppName)
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(matches!(
            ProvisionConfig::from_path("/nonexistent/rgpu-provision.toml"),
            Err(ConfigError::Io(_))
        ));
    }
}

//! Capability catalog: which extensions and layers to ask for.
//!
//! The catalog is a plain table keyed by [`Profile`] tags. A
//! [`ProfileSet`] chosen at startup selects rows from it and produces
//! two [`CapabilityRequest`]s, one for instance creation and one for
//! device creation. Nothing here depends on the build target; the
//! negotiation code that consumes these requests has no
//! platform-specific branches.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Whether a capability is an extension or a layer. Layers and
/// extensions are enumerated separately by Vulkan, so a name only
/// matches against the list of its own kind.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum CapabilityKind {
    #[default]
    Extension,
    Layer,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Requirement {
    /// Missing on the device is fatal.
    Required,
    /// Missing on the device is logged and the entry is dropped.
    #[default]
    Optional,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapabilityEntry {
    pub name: String,
    #[serde(default)]
    pub kind: CapabilityKind,
    #[serde(default)]
    pub requirement: Requirement,
}

impl CapabilityEntry {
    pub fn extension(
        name: impl Into<String>,
        requirement: Requirement,
    ) -> Self {
        Self {
            name: name.into(),
            kind: CapabilityKind::Extension,
            requirement,
        }
    }

    pub fn layer(name: impl Into<String>, requirement: Requirement) -> Self {
        Self {
            name: name.into(),
            kind: CapabilityKind::Layer,
            requirement,
        }
    }

    pub fn is_required(&self) -> bool {
        self.requirement == Requirement::Required
    }
}

impl fmt::Display for CapabilityEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            CapabilityKind::Extension => "extension",
            CapabilityKind::Layer => "layer",
        };
        write!(f, "{} ({kind})", self.name)
    }
}

/// An ordered set of capability entries with unique, case-sensitive
/// names.
///
/// Iteration order is insertion order; negotiation reports missing
/// names in this order, so it must stay deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityRequest {
    entries: Vec<CapabilityEntry>,
}

impl CapabilityRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `entry`, keeping names unique.
    ///
    /// Re-inserting a name keeps its original position. A `Required`
    /// insert upgrades an existing `Optional` entry; the reverse never
    /// downgrades.
    pub fn insert(&mut self, entry: CapabilityEntry) {
        match self.entries.iter_mut().find(|e| e.name == entry.name) {
            Some(existing) => {
                if existing.kind != entry.kind {
                    tracing::warn!(
                        "Capability {} requested as both extension and \
                         layer; keeping the first ({:?})",
                        entry.name,
                        existing.kind,
                    );
                }
                if entry.is_required() {
                    existing.requirement = Requirement::Required;
                }
            }
            None => self.entries.push(entry),
        }
    }

    pub fn require_extension(&mut self, name: impl Into<String>) {
        self.insert(CapabilityEntry::extension(name, Requirement::Required));
    }

    pub fn optional_extension(&mut self, name: impl Into<String>) {
        self.insert(CapabilityEntry::extension(name, Requirement::Optional));
    }

    pub fn optional_layer(&mut self, name: impl Into<String>) {
        self.insert(CapabilityEntry::layer(name, Requirement::Optional));
    }

    pub fn get(&self, name: &str) -> Option<&CapabilityEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CapabilityEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<CapabilityEntry> for CapabilityRequest {
    fn from_iter<I: IntoIterator<Item = CapabilityEntry>>(iter: I) -> Self {
        let mut request = Self::new();
        for entry in iter {
            request.insert(entry);
        }
        request
    }
}

impl<'a> IntoIterator for &'a CapabilityRequest {
    type Item = &'a CapabilityEntry;
    type IntoIter = std::slice::Iter<'a, CapabilityEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Platform / build profile tags that add rows to the catalog.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize,
    Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Profile {
    /// Validation layer, debug messenger and profiling extensions.
    Debug,
    /// Rendering to a window surface.
    WindowedPresent,
    /// Tiled mobile GPUs.
    Mobile,
    /// Qualcomm vendor extensions, layered on `Mobile` / `Spatial`.
    Qualcomm,
    /// Multiview / foveated XR rendering.
    Spatial,
    RayTracing,
}

impl Profile {
    pub const ALL: [Profile; 6] = [
        Profile::Debug,
        Profile::WindowedPresent,
        Profile::Mobile,
        Profile::Qualcomm,
        Profile::Spatial,
        Profile::RayTracing,
    ];
}

/// A set of [`Profile`] tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileSet(Vec<Profile>);

impl ProfileSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, profile: Profile) -> Self {
        self.insert(profile);
        self
    }

    pub fn insert(&mut self, profile: Profile) {
        if !self.0.contains(&profile) {
            self.0.push(profile);
        }
    }

    pub fn without(mut self, profile: Profile) -> Self {
        self.0.retain(|p| *p != profile);
        self
    }

    pub fn contains(&self, profile: Profile) -> bool {
        self.0.contains(&profile)
    }

    pub fn iter(&self) -> impl Iterator<Item = Profile> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Profile> for ProfileSet {
    fn from_iter<I: IntoIterator<Item = Profile>>(iter: I) -> Self {
        let mut set = Self::new();
        for profile in iter {
            set.insert(profile);
        }
        set
    }
}

pub const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";
pub const DEBUG_UTILS: &str = "VK_EXT_debug_utils";
pub const SWAPCHAIN: &str = "VK_KHR_swapchain";

const SURFACE: &str = "VK_KHR_surface";
const GET_SURFACE_CAPABILITIES_2: &str = "VK_KHR_get_surface_capabilities2";
const GET_PHYSICAL_DEVICE_PROPERTIES_2: &str =
    "VK_KHR_get_physical_device_properties2";

/// Device extensions every profile asks for opportunistically.
const BASELINE_OPTIONAL: &[&str] = &[
    "VK_KHR_fragment_shading_rate",
    "VK_EXT_pipeline_creation_cache_control",
    "VK_EXT_multi_draw",
    "VK_EXT_rasterization_order_attachment_access",
    "VK_EXT_mesh_shader",
    "VK_EXT_memory_budget",
];

const SPATIAL_REQUIRED: &[&str] = &["VK_KHR_multiview"];
const SPATIAL_OPTIONAL: &[&str] =
    &["VK_EXT_fragment_density_map", "VK_EXT_fragment_density_map2"];
const SPATIAL_QCOM_OPTIONAL: &[&str] = &["VK_QCOM_fragment_density_map_offset"];

/// Instance-level counterpart of `VK_KHR_external_memory`.
const EXTERNAL_MEMORY_CAPABILITIES: &str =
    "VK_KHR_external_memory_capabilities";
const MOBILE_REQUIRED: &[&str] = &["VK_KHR_external_memory"];
const MOBILE_OPTIONAL: &[&str] = &["VK_EXT_shader_tile_image"];
const MOBILE_QCOM_OPTIONAL: &[&str] = &[
    "VK_QCOM_tile_properties",
    "VK_QCOM_render_pass_shader_resolve",
    "VK_QCOM_render_pass_transform",
    "VK_QCOM_render_pass_store_ops",
    "VK_QCOM_image_processing",
    "VK_QCOM_image_processing2",
];

const RAY_TRACING_REQUIRED: &[&str] = &[
    "VK_KHR_ray_tracing_position_fetch",
    "VK_KHR_ray_query",
    "VK_KHR_acceleration_structure",
    "VK_KHR_ray_tracing_pipeline",
];
const RAY_TRACING_DEBUG_REQUIRED: &[&str] = &["VK_NV_ray_tracing_validation"];
const RAY_TRACING_OPTIONAL: &[&str] = &["VK_NV_ray_tracing_motion_blur"];

const DEBUG_OPTIONAL: &[&str] =
    &["VK_KHR_performance_query", "VK_EXT_device_memory_report"];

/// Builds instance and device requests for a [`ProfileSet`].
#[derive(Debug, Clone)]
pub struct CapabilityCatalog {
    profiles: ProfileSet,
    platform_surface_extensions: Vec<String>,
    extra_device: Vec<CapabilityEntry>,
}

impl CapabilityCatalog {
    pub fn new(profiles: ProfileSet) -> Self {
        Self {
            profiles,
            platform_surface_extensions: Vec::new(),
            extra_device: Vec::new(),
        }
    }

    /// Platform surface extensions (e.g. `VK_KHR_xlib_surface`) as
    /// reported by the windowing system. Only used with
    /// [`Profile::WindowedPresent`].
    pub fn with_platform_surface_extensions(
        mut self,
        names: impl IntoIterator<Item = String>,
    ) -> Self {
        self.platform_surface_extensions.extend(names);
        self
    }

    /// Device entries appended after the built-in table.
    pub fn with_extra_device_entries(
        mut self,
        entries: impl IntoIterator<Item = CapabilityEntry>,
    ) -> Self {
        self.extra_device.extend(entries);
        self
    }

    pub fn instance_request(&self) -> CapabilityRequest {
        let mut request = CapabilityRequest::new();
        if self.profiles.contains(Profile::Debug) {
            request.optional_layer(VALIDATION_LAYER);
            request.optional_extension(DEBUG_UTILS);
        }
        if self.profiles.contains(Profile::WindowedPresent) {
            for name in &self.platform_surface_extensions {
                request.require_extension(name.clone());
            }
            request.require_extension(SURFACE);
            request.require_extension(GET_SURFACE_CAPABILITIES_2);
        }
        if self.profiles.contains(Profile::Mobile) {
            request.require_extension(EXTERNAL_MEMORY_CAPABILITIES);
        }
        request.require_extension(GET_PHYSICAL_DEVICE_PROPERTIES_2);
        request
    }

    pub fn device_request(&self) -> CapabilityRequest {
        let p = &self.profiles;
        let qcom = p.contains(Profile::Qualcomm);
        let mut request = CapabilityRequest::new();

        if p.contains(Profile::WindowedPresent) {
            request.require_extension(SWAPCHAIN);
        }
        extend(&mut request, BASELINE_OPTIONAL, Requirement::Optional);

        if p.contains(Profile::Spatial) {
            extend(&mut request, SPATIAL_REQUIRED, Requirement::Required);
            extend(&mut request, SPATIAL_OPTIONAL, Requirement::Optional);
            if qcom {
                extend(
                    &mut request,
                    SPATIAL_QCOM_OPTIONAL,
                    Requirement::Optional,
                );
            }
        }
        if p.contains(Profile::Mobile) {
            extend(&mut request, MOBILE_REQUIRED, Requirement::Required);
            extend(&mut request, MOBILE_OPTIONAL, Requirement::Optional);
            if qcom {
                extend(
                    &mut request,
                    MOBILE_QCOM_OPTIONAL,
                    Requirement::Optional,
                );
            }
        }
        if p.contains(Profile::RayTracing) {
            extend(&mut request, RAY_TRACING_REQUIRED, Requirement::Required);
            if p.contains(Profile::Debug) {
                extend(
                    &mut request,
                    RAY_TRACING_DEBUG_REQUIRED,
                    Requirement::Required,
                );
            }
            extend(&mut request, RAY_TRACING_OPTIONAL, Requirement::Optional);
        }
        if p.contains(Profile::Debug) {
            extend(&mut request, DEBUG_OPTIONAL, Requirement::Optional);
        }

        for entry in &self.extra_device {
            request.insert(entry.clone());
        }
        request
    }
}

fn extend(request: &mut CapabilityRequest, names: &[&str], req: Requirement) {
    for name in names {
        request.insert(CapabilityEntry::extension(*name, req));
    }
}

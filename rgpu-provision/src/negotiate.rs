//! Matching a [`CapabilityRequest`] against what a device (or the
//! loader) actually supports.

use ash::vk;
use thiserror::Error;

use crate::{
    catalog::{CapabilityEntry, CapabilityKind, CapabilityRequest},
    driver::Driver,
    enumerate::DeviceCandidate,
};

/// The outcome of negotiation. The three lists are disjoint and each
/// keeps request order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiationResult {
    pub satisfied: Vec<CapabilityEntry>,
    pub optional_missing: Vec<CapabilityEntry>,
    pub required_missing: Vec<CapabilityEntry>,
}

impl NegotiationResult {
    pub fn satisfied_names(&self, kind: CapabilityKind) -> Vec<String> {
        self.satisfied
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.name.clone())
            .collect()
    }

    pub fn is_satisfied(&self, name: &str) -> bool {
        self.satisfied.iter().any(|e| e.name == name)
    }

    /// Log dropped optional entries and every missing required entry,
    /// then fail on the first required one.
    pub fn into_checked(self, scope: &str) -> Result<Self, NegotiateError> {
        for entry in &self.optional_missing {
            tracing::warn!(
                "Optional {scope} {entry} is not supported, dropping it"
            );
        }
        for entry in &self.required_missing {
            tracing::error!("Required {scope} {entry} is not supported");
        }
        match self.required_missing.first() {
            Some(entry) => Err(NegotiateError::RequiredCapabilityMissing {
                name: entry.name.clone(),
            }),
            None => Ok(self),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiateError {
    #[error("Required capability {name} is not supported")]
    RequiredCapabilityMissing { name: String },
    #[error("Failed to query supported capabilities: {0}")]
    Query(vk::Result),
}

impl From<vk::Result> for NegotiateError {
    fn from(value: vk::Result) -> Self {
        NegotiateError::Query(value)
    }
}

/// Split `request` by what is supported. Names match exactly and
/// case-sensitively, extensions only against `extensions` and layers
/// only against `layers`.
pub fn partition(
    extensions: &[String],
    layers: &[String],
    request: &CapabilityRequest,
) -> NegotiationResult {
    let mut result = NegotiationResult::default();
    for entry in request {
        let supported = match entry.kind {
            CapabilityKind::Extension => extensions,
            CapabilityKind::Layer => layers,
        };
        let bucket = if supported.iter().any(|name| *name == entry.name) {
            &mut result.satisfied
        } else if entry.is_required() {
            &mut result.required_missing
        } else {
            &mut result.optional_missing
        };
        bucket.push(entry.clone());
    }
    result
}

/// Negotiate the device-level request against `candidate`.
///
/// # Safety
/// `candidate` must have been enumerated from `driver`.
pub unsafe fn negotiate<D: Driver + ?Sized>(
    driver: &D,
    candidate: &DeviceCandidate,
    request: &CapabilityRequest,
) -> Result<NegotiationResult, NegotiateError> {
    //SAFETY: caller guarantees candidate.handle came from driver
    let extensions =
        unsafe { driver.device_extension_names(candidate.handle) }?;
    //SAFETY: caller guarantees candidate.handle came from driver
    let layers = unsafe { driver.device_layer_names(candidate.handle) }?;

    let result =
        partition(&extensions, &layers, request).into_checked("device")?;
    tracing::debug!(
        "Negotiated {} device capabilities on {:?}",
        result.satisfied.len(),
        candidate.name
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::Requirement,
        enumerate::query_candidates,
        testing::{FakeDevice, FakeDriver, capture_logs, family},
    };

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| (*n).to_owned()).collect()
    }

    fn names(entries: &[CapabilityEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn partition_keeps_request_order() {
        let mut request = CapabilityRequest::new();
        request.optional_extension("VK_EXT_b");
        request.require_extension("VK_KHR_a");
        request.optional_extension("VK_EXT_c");
        request.require_extension("VK_KHR_d");
        request.optional_layer("VK_LAYER_x");

        let result = partition(
            &strings(&["VK_EXT_c", "VK_KHR_a"]),
            &strings(&["VK_LAYER_x"]),
            &request,
        );
        assert_eq!(
            names(&result.satisfied),
            ["VK_KHR_a", "VK_EXT_c", "VK_LAYER_x"]
        );
        assert_eq!(names(&result.optional_missing), ["VK_EXT_b"]);
        assert_eq!(names(&result.required_missing), ["VK_KHR_d"]);
    }

    #[test]
    fn matching_is_exact_and_per_kind() {
        let request: CapabilityRequest = [
            CapabilityEntry::extension(
                "VK_KHR_swapchain",
                Requirement::Optional,
            ),
            CapabilityEntry::layer(
                "VK_LAYER_KHRONOS_validation",
                Requirement::Optional,
            ),
        ]
        .into_iter()
        .collect();
        let result = partition(
            &strings(&["vk_khr_swapchain", "VK_LAYER_KHRONOS_validation"]),
            &[],
            &request,
        );
        assert!(result.satisfied.is_empty());
        assert_eq!(result.optional_missing.len(), 2);
    }

    #[test]
    fn optional_missing_is_dropped() {
        let driver = FakeDriver::new(vec![FakeDevice::discrete(
            "dgpu",
            vec![family(vk::QueueFlags::GRAPHICS, true)],
        )
        .with_extensions(&["VK_KHR_swapchain"])
        .with_layers(&["VK_LAYER_KHRONOS_validation"])]);
        let candidates = query_candidates(&driver).unwrap();

        let mut request = CapabilityRequest::new();
        request.require_extension("VK_KHR_swapchain");
        request.optional_extension("VK_EXT_mesh_shader");
        request.optional_layer("VK_LAYER_KHRONOS_validation");

        // SAFETY: candidates came from driver.
        let result =
            unsafe { negotiate(&driver, &candidates[0], &request) }.unwrap();
        assert_eq!(
            names(&result.satisfied),
            ["VK_KHR_swapchain", "VK_LAYER_KHRONOS_validation"]
        );
        assert_eq!(names(&result.optional_missing), ["VK_EXT_mesh_shader"]);
        assert_eq!(
            result.satisfied_names(CapabilityKind::Extension),
            ["VK_KHR_swapchain"]
        );
    }

    #[test]
    fn first_missing_required_is_reported() {
        let driver = FakeDriver::new(vec![FakeDevice::discrete(
            "dgpu",
            vec![family(vk::QueueFlags::GRAPHICS, true)],
        )
        .with_extensions(&["VK_KHR_swapchain"])]);
        let candidates = query_candidates(&driver).unwrap();

        let mut request = CapabilityRequest::new();
        request.require_extension("VK_KHR_swapchain");
        request.require_extension("VK_KHR_ray_query");
        request.require_extension("VK_KHR_acceleration_structure");

        request.optional_extension("VK_EXT_mesh_shader");

        let (result, logs) = capture_logs(|| {
            // SAFETY: candidates came from driver.
            unsafe { negotiate(&driver, &candidates[0], &request) }
        });
        assert_eq!(
            result,
            Err(NegotiateError::RequiredCapabilityMissing {
                name: "VK_KHR_ray_query".to_owned()
            })
        );
        for name in ["VK_KHR_ray_query", "VK_KHR_acceleration_structure"] {
            assert!(
                logs.lines()
                    .any(|l| l.contains("ERROR") && l.contains(name)),
                "{name} missing from {logs}"
            );
        }
        assert!(
            logs.lines().any(|l| l.contains("WARN")
                && l.contains("VK_EXT_mesh_shader")),
            "{logs}"
        );
        assert!(!logs.contains("Required device VK_KHR_swapchain"));
    }

    #[test]
    fn negotiation_is_deterministic() {
        let mut request = CapabilityRequest::new();
        request.optional_extension("VK_EXT_a");
        request.optional_extension("VK_EXT_b");
        let supported = strings(&["VK_EXT_b"]);
        assert_eq!(
            partition(&supported, &[], &request),
            partition(&supported, &[], &request)
        );
    }
}

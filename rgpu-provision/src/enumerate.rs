//! Physical device enumeration.
//!
//! Produces one [`DeviceCandidate`] per physical device, in the order the
//! driver reports them, with queue families in native order. Selection
//! breaks ties by "first matching index", so neither order may be
//! changed here.

use std::fmt;

use ash::vk;
use thiserror::Error;

use crate::{driver::Driver, instance::VkVersion};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnumerateError {
    #[error("The API context is not live")]
    ContextInvalid,
    #[error("Error fetching physical devices, memory exhaustion")]
    MemoryExhaustion,
    #[error("Error fetching physical devices, Unknown vulkan: {0}")]
    UnknownVulkan(vk::Result),
}

impl From<vk::Result> for EnumerateError {
    fn from(value: vk::Result) -> Self {
        match value {
            vk::Result::ERROR_INITIALIZATION_FAILED => Self::ContextInvalid,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::MemoryExhaustion,
            e => Self::UnknownVulkan(e),
        }
    }
}

/// Capabilities of one queue family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyCapability {
    pub index: u32,
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
    /// Presentation support against the target the candidate was
    /// enumerated with. Always `false` without a target.
    pub present: bool,
}

impl QueueFamilyCapability {
    pub fn graphics(&self) -> bool {
        self.flags.contains(vk::QueueFlags::GRAPHICS)
    }

    pub fn compute(&self) -> bool {
        self.flags.contains(vk::QueueFlags::COMPUTE)
    }

    pub fn transfer(&self) -> bool {
        self.flags.contains(vk::QueueFlags::TRANSFER)
    }

    /// Transfer-capable and neither graphics nor compute capable.
    pub fn is_dedicated_transfer(&self) -> bool {
        self.transfer() && !self.graphics() && !self.compute()
    }
}

impl fmt::Display for QueueFamilyCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = |on: bool, c: char| if on { c } else { '-' };
        write!(
            f,
            "[{}] {}{}{}{} x{}",
            self.index,
            mark(self.graphics(), 'G'),
            mark(self.compute(), 'C'),
            mark(self.transfer(), 'T'),
            mark(self.present, 'P'),
            self.queue_count,
        )
    }
}

/// A physical device and the facts selection needs about it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCandidate {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: VkVersion,
    pub queue_families: Vec<QueueFamilyCapability>,
}

impl DeviceCandidate {
    pub fn is_discrete(&self) -> bool {
        self.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
    }

    pub fn queue_family(&self, index: u32) -> Option<&QueueFamilyCapability> {
        self.queue_families.get(index as usize)
    }
}

/// Query every physical device without any presentation target.
///
/// This is the surface-independent part of enumeration;
/// [`crate::context::ApiContext`] caches it for the life of the
/// context.
pub fn query_candidates<D: Driver + ?Sized>(
    driver: &D,
) -> Result<Vec<DeviceCandidate>, EnumerateError> {
    if !driver.is_live() {
        return Err(EnumerateError::ContextInvalid);
    }
    let physical_devices = driver.raw_physical_devices()?;

    let candidates = physical_devices
        .into_iter()
        .map(|handle| {
            //SAFETY: handle was just enumerated from this driver
            let summary = unsafe { driver.physical_device_summary(handle) };
            //SAFETY: handle was just enumerated from this driver
            let families =
                unsafe { driver.raw_queue_family_properties(handle) };
            let queue_families = families
                .iter()
                .enumerate()
                .map(|(idx, props)| QueueFamilyCapability {
                    index: idx as u32,
                    flags: props.queue_flags,
                    queue_count: props.queue_count,
                    present: false,
                })
                .collect();
            DeviceCandidate {
                handle,
                name: summary.name,
                device_type: summary.device_type,
                api_version: summary.api_version,
                queue_families,
            }
        })
        .collect();
    Ok(candidates)
}

/// Fill in per-family presentation support for `target`.
///
/// Every family is tested individually against the surface; support is
/// never inferred from queue flags. A failed query counts as "cannot
/// present".
///
/// # Safety
/// `base` must have been queried from `driver`, and `target`, if any,
/// must have been created from it.
pub unsafe fn with_presentation<D: Driver + ?Sized>(
    driver: &D,
    base: &[DeviceCandidate],
    target: Option<vk::SurfaceKHR>,
) -> Result<Vec<DeviceCandidate>, EnumerateError> {
    if !driver.is_live() {
        return Err(EnumerateError::ContextInvalid);
    }
    let mut candidates = base.to_vec();
    for candidate in &mut candidates {
        for family in &mut candidate.queue_families {
            family.present = match target {
                None => false,
                //SAFETY: caller guarantees both handles came from driver
                Some(surface) => match unsafe {
                    driver.raw_surface_support(
                        candidate.handle,
                        family.index,
                        surface,
                    )
                } {
                    Ok(supported) => supported,
                    Err(e) => {
                        tracing::debug!(
                            "Surface support query failed for {:?} family \
                             {}: {e}",
                            candidate.name,
                            family.index
                        );
                        false
                    }
                },
            };
        }
        log_candidate(candidate);
    }
    Ok(candidates)
}

/// Enumerate candidates, testing presentation against `target`.
///
/// # Safety
/// `target`, if any, must have been created from `driver`.
pub unsafe fn enumerate<D: Driver + ?Sized>(
    driver: &D,
    target: Option<vk::SurfaceKHR>,
) -> Result<Vec<DeviceCandidate>, EnumerateError> {
    let base = query_candidates(driver)?;
    //SAFETY: base was just queried from driver; target is the caller's
    unsafe { with_presentation(driver, &base, target) }
}

fn log_candidate(candidate: &DeviceCandidate) {
    tracing::debug!(
        "Physical device {:?} (type: {:?}, api {})",
        candidate.name,
        candidate.device_type,
        candidate.api_version,
    );
    for family in &candidate.queue_families {
        tracing::debug!("    queue family {family}");
    }
}

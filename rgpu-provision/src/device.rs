//! Logical device creation ([`provision`]) and the per-device state it
//! produces ([`LogicalDevice`], [`CommandPoolSet`]).
//!
//! One queue is requested per distinct queue family, and one command
//! pool is created per distinct family. Roles that share a family share
//! the same `Arc<CommandPool>`, so the pool set destroys each handle
//! exactly once no matter how many roles point at it.

use std::collections::HashSet;
use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::{
    catalog::{CapabilityEntry, CapabilityKind},
    driver::{DeviceCreateRequest, Driver, QueueRequest},
    enumerate::DeviceCandidate,
    select::{QueueRole, QueueRoleAssignment},
};

pub const QUEUE_PRIORITY: f32 = 1.0;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("No graphics queue family was assigned")]
    MissingGraphicsRole,
    #[error("Failed to create logical device: {0}")]
    DeviceCreationFailed(vk::Result),
    #[error(
        "Failed to create command pool for queue family {family}: {result}"
    )]
    CommandPoolCreationFailed { family: u32, result: vk::Result },
}

/// One queue request per distinct family, in first-appearance order of
/// Graphics, Present, DedicatedTransfer.
pub fn queue_requests(roles: &QueueRoleAssignment) -> Vec<QueueRequest> {
    roles
        .unique_families()
        .into_iter()
        .map(|family| QueueRequest {
            family,
            count: 1,
            priority: QUEUE_PRIORITY,
        })
        .collect()
}

#[derive(Debug, PartialEq, Eq)]
pub struct CommandPool {
    handle: vk::CommandPool,
    family: u32,
}

impl CommandPool {
    pub fn raw_pool(&self) -> vk::CommandPool {
        self.handle
    }

    pub fn family(&self) -> u32 {
        self.family
    }
}

/// Command pools keyed by queue role.
#[derive(Debug, Default)]
pub struct CommandPoolSet {
    graphics: Option<Arc<CommandPool>>,
    present: Option<Arc<CommandPool>>,
    dedicated_transfer: Option<Arc<CommandPool>>,
}

impl CommandPoolSet {
    pub fn pool(&self, role: QueueRole) -> Option<&Arc<CommandPool>> {
        match role {
            QueueRole::Graphics => self.graphics.as_ref(),
            QueueRole::Present => self.present.as_ref(),
            QueueRole::DedicatedTransfer => self.dedicated_transfer.as_ref(),
        }
    }

    /// The pool to record transfers into: the dedicated transfer pool if
    /// there is one, otherwise the graphics pool.
    pub fn transfer_or_graphics(&self) -> Option<&Arc<CommandPool>> {
        self.dedicated_transfer.as_ref().or(self.graphics.as_ref())
    }

    fn slot(&mut self, role: QueueRole) -> &mut Option<Arc<CommandPool>> {
        match role {
            QueueRole::Graphics => &mut self.graphics,
            QueueRole::Present => &mut self.present,
            QueueRole::DedicatedTransfer => &mut self.dedicated_transfer,
        }
    }

    /// Distinct pool handles in role order.
    pub fn unique_handles(&self) -> Vec<vk::CommandPool> {
        let mut seen = HashSet::new();
        QueueRole::ALL
            .into_iter()
            .filter_map(|role| self.pool(role))
            .map(|pool| pool.handle)
            .filter(|handle| seen.insert(*handle))
            .collect()
    }

    /// Create one pool per distinct family in `roles`.
    ///
    /// On failure every pool created so far is destroyed before the
    /// error is returned.
    ///
    /// # Safety
    /// `device` must be a live device created by `driver` with a queue
    /// in every family of `roles`.
    pub unsafe fn create<D: Driver + ?Sized>(
        driver: &D,
        device: vk::Device,
        roles: &QueueRoleAssignment,
    ) -> Result<Self, ProvisionError> {
        let mut created: Vec<Arc<CommandPool>> = Vec::new();
        let mut set = CommandPoolSet::default();

        for (role, family) in roles.assigned() {
            if let Some(existing) = created.iter().find(|p| p.family == family)
            {
                *set.slot(role) = Some(Arc::clone(existing));
                continue;
            }

            //SAFETY: caller guarantees device is live and has a queue in
            //this family
            let raw = unsafe { driver.create_raw_command_pool(device, family) };
            let handle = match raw {
                Ok(handle) => handle,
                Err(result) => {
                    for pool in created.iter().rev() {
                        //SAFETY: pool was created above from device and never
                        //handed out
                        unsafe {
                            driver.destroy_raw_command_pool(device, pool.handle)
                        };
                    }
                    return Err(ProvisionError::CommandPoolCreationFailed {
                        family,
                        result,
                    });
                }
            };
            tracing::debug!(
                "Created command pool {handle:?} for family {family}"
            );
            let pool = Arc::new(CommandPool { handle, family });
            created.push(Arc::clone(&pool));
            *set.slot(role) = Some(pool);
        }
        Ok(set)
    }

    /// Destroy every distinct pool exactly once.
    ///
    /// # Safety
    /// The pools must have been created from `device` by `driver`, and no
    /// command buffer allocated from them may still be in use.
    pub unsafe fn destroy<D: Driver + ?Sized>(
        self,
        driver: &D,
        device: vk::Device,
    ) {
        for handle in self.unique_handles().into_iter().rev() {
            tracing::debug!("Dropping command pool {handle:?}");
            //SAFETY: handles are unique, so each pool is destroyed once; the
            //caller guarantees they came from device
            unsafe { driver.destroy_raw_command_pool(device, handle) };
        }
    }
}

/// A logical device, its queues and its command pools.
///
/// Not destroyed on drop: destruction needs the driver that created it,
/// see [`LogicalDevice::destroy`].
#[derive(Debug)]
pub struct LogicalDevice {
    handle: vk::Device,
    physical_device: vk::PhysicalDevice,
    name: String,
    roles: QueueRoleAssignment,
    enabled: Vec<CapabilityEntry>,
    queues: [Option<vk::Queue>; 3],
    pools: CommandPoolSet,
}

impl LogicalDevice {
    pub fn raw_device(&self) -> vk::Device {
        self.handle
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn roles(&self) -> &QueueRoleAssignment {
        &self.roles
    }

    pub fn enabled_capabilities(&self) -> &[CapabilityEntry] {
        &self.enabled
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.iter().any(|e| e.name == name)
    }

    pub fn queue(&self, role: QueueRole) -> Option<vk::Queue> {
        self.queues[role as usize]
    }

    pub fn pools(&self) -> &CommandPoolSet {
        &self.pools
    }

    /// Destroy the command pools, then the device.
    ///
    /// # Safety
    /// `driver` must be the driver that provisioned this device, and the
    /// device must be idle.
    pub unsafe fn destroy<D: Driver + ?Sized>(self, driver: &D) {
        //SAFETY: pools were created from self.handle by driver
        unsafe { self.pools.destroy(driver, self.handle) };
        tracing::debug!("Dropping device {:?}", self.handle);
        //SAFETY: every object derived from the device is destroyed above
        unsafe { driver.destroy_raw_device(self.handle) };
    }
}

/// Create the logical device for `candidate` with exactly the
/// `satisfied` capabilities enabled, fetch one queue per role and create
/// its command pools.
///
/// Nothing is left behind on failure.
///
/// # Safety
/// `candidate` must have been enumerated from `driver` and `roles`
/// assigned from its queue families.
pub unsafe fn provision<D: Driver + ?Sized>(
    driver: &D,
    candidate: &DeviceCandidate,
    roles: &QueueRoleAssignment,
    satisfied: &[CapabilityEntry],
) -> Result<LogicalDevice, ProvisionError> {
    if roles.graphics.is_none() {
        return Err(ProvisionError::MissingGraphicsRole);
    }

    let names = |kind: CapabilityKind| {
        satisfied
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.name.clone())
            .collect()
    };
    let request = DeviceCreateRequest {
        queues: queue_requests(roles),
        extensions: names(CapabilityKind::Extension),
        layers: names(CapabilityKind::Layer),
    };

    //SAFETY: caller guarantees candidate came from driver and every
    //family in roles exists on it
    let handle = unsafe { driver.create_raw_device(candidate.handle, &request) }
        .map_err(ProvisionError::DeviceCreationFailed)?;
    tracing::debug!(
        "Created device {handle:?} on {:?} with extensions {:?}",
        candidate.name,
        request.extensions
    );

    let mut queues = [None; 3];
    for (role, family) in roles.assigned() {
        //SAFETY: one queue was requested in every assigned family
        let queue = unsafe { driver.raw_device_queue(handle, family, 0) };
        queues[role as usize] = Some(queue);
    }

    //SAFETY: handle is live and has a queue in every family of roles
    let pools = match unsafe { CommandPoolSet::create(driver, handle, roles) } {
        Ok(pools) => pools,
        Err(e) => {
            tracing::debug!("Dropping device {handle:?} after pool failure");
            //SAFETY: no objects remain derived from the device
            unsafe { driver.destroy_raw_device(handle) };
            return Err(e);
        }
    };

    Ok(LogicalDevice {
        handle,
        physical_device: candidate.handle,
        name: candidate.name.clone(),
        roles: *roles,
        enabled: satisfied.to_vec(),
        queues,
        pools,
    })
}

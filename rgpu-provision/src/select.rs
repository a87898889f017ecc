//! Physical device selection and queue role assignment.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::enumerate::{DeviceCandidate, QueueFamilyCapability};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueRole {
    Graphics,
    Present,
    DedicatedTransfer,
}

impl QueueRole {
    /// Roles in queue-request order.
    pub const ALL: [QueueRole; 3] = [
        QueueRole::Graphics,
        QueueRole::Present,
        QueueRole::DedicatedTransfer,
    ];
}

impl fmt::Display for QueueRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QueueRole::Graphics => "graphics",
            QueueRole::Present => "present",
            QueueRole::DedicatedTransfer => "dedicated transfer",
        })
    }
}

/// Queue family index chosen for each role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueRoleAssignment {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
    pub dedicated_transfer: Option<u32>,
}

impl QueueRoleAssignment {
    pub fn get(&self, role: QueueRole) -> Option<u32> {
        match role {
            QueueRole::Graphics => self.graphics,
            QueueRole::Present => self.present,
            QueueRole::DedicatedTransfer => self.dedicated_transfer,
        }
    }

    /// Assigned roles in [`QueueRole::ALL`] order.
    pub fn assigned(&self) -> impl Iterator<Item = (QueueRole, u32)> + '_ {
        QueueRole::ALL
            .into_iter()
            .filter_map(|role| self.get(role).map(|family| (role, family)))
    }

    /// Distinct families in first-appearance order.
    pub fn unique_families(&self) -> Vec<u32> {
        let mut families = Vec::with_capacity(3);
        for (_, family) in self.assigned() {
            if !families.contains(&family) {
                families.push(family);
            }
        }
        families
    }

    pub fn is_viable(&self, requires_present: bool) -> bool {
        self.graphics.is_some() && (!requires_present || self.present.is_some())
    }

    pub fn graphics_presents(&self) -> bool {
        self.graphics.is_some() && self.graphics == self.present
    }
}

/// How to rank viable candidates that are not ideal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicy {
    /// A discrete device with a combined graphics/present family, else
    /// the first viable device.
    #[default]
    CombinedDiscrete,
    /// Like `CombinedDiscrete`, but any discrete device beats a
    /// non-discrete one before falling back to the first viable device.
    PreferDiscrete,
}

/// Which preference rule picked the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionTier {
    Ideal,
    Discrete,
    FirstViable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Position of the chosen device in the enumeration order.
    pub index: usize,
    pub candidate: DeviceCandidate,
    pub roles: QueueRoleAssignment,
    pub tier: SelectionTier,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectError {
    #[error("No physical device has the required queue families")]
    NoViableDevice,
}

/// Assign queue roles on one candidate.
///
/// A graphics family that can also present wins both roles, even when an
/// earlier family was graphics-only or present-only.
pub fn assign_roles(
    candidate: &DeviceCandidate,
    requires_present: bool,
) -> QueueRoleAssignment {
    let families = &candidate.queue_families;
    let combined = families
        .iter()
        .find(|f| f.graphics() && f.present)
        .map(|f| f.index);
    let first = |pred: fn(&QueueFamilyCapability) -> bool| {
        families.iter().find(|f| pred(f)).map(|f| f.index)
    };
    let graphics = combined.or_else(|| first(|f| f.graphics()));
    let present = if requires_present {
        combined.or_else(|| first(|f| f.present))
    } else {
        None
    };
    let dedicated_transfer = families
        .iter()
        .find(|f| f.is_dedicated_transfer())
        .map(|f| f.index);

    QueueRoleAssignment {
        graphics,
        present,
        dedicated_transfer,
    }
}

fn rejection_reason(
    roles: &QueueRoleAssignment,
    requires_present: bool,
) -> Option<&'static str> {
    if roles.graphics.is_none() {
        Some("no graphics queue family")
    } else if requires_present && roles.present.is_none() {
        Some("no queue family can present to the target")
    } else {
        None
    }
}

fn is_ideal(
    candidate: &DeviceCandidate,
    roles: &QueueRoleAssignment,
    requires_present: bool,
) -> bool {
    candidate.is_discrete() && (!requires_present || roles.graphics_presents())
}

/// Pick one candidate and its queue roles.
///
/// Deterministic: identical input always yields the same selection, and
/// ties go to the earliest enumerated device.
pub fn select(
    candidates: &[DeviceCandidate],
    requires_present: bool,
    policy: SelectionPolicy,
) -> Result<Selection, SelectError> {
    let mut viable = Vec::with_capacity(candidates.len());
    for (index, candidate) in candidates.iter().enumerate() {
        let roles = assign_roles(candidate, requires_present);
        match rejection_reason(&roles, requires_present) {
            Some(reason) => {
                tracing::info!("Rejecting {:?}: {reason}", candidate.name);
            }
            None => viable.push((index, candidate, roles)),
        }
    }

    let pick = |tier: SelectionTier| {
        viable.iter().find(|(_, candidate, roles)| match tier {
            SelectionTier::Ideal => {
                is_ideal(candidate, roles, requires_present)
            }
            SelectionTier::Discrete => candidate.is_discrete(),
            SelectionTier::FirstViable => true,
        })
    };

    let tiers: &[SelectionTier] = match policy {
        SelectionPolicy::CombinedDiscrete => {
            &[SelectionTier::Ideal, SelectionTier::FirstViable]
        }
        SelectionPolicy::PreferDiscrete => &[
            SelectionTier::Ideal,
            SelectionTier::Discrete,
            SelectionTier::FirstViable,
        ],
    };

    let (tier, &(index, candidate, roles)) = tiers
        .iter()
        .find_map(|&tier| pick(tier).map(|found| (tier, found)))
        .ok_or(SelectError::NoViableDevice)?;

    if tier == SelectionTier::Ideal {
        tracing::info!(
            "Selected {:?} (type: {:?}, graphics family: {:?}, present family: \
             {:?}, dedicated transfer family: {:?})",
            candidate.name,
            candidate.device_type,
            roles.graphics,
            roles.present,
            roles.dedicated_transfer,
        );
    } else {
        let skipped: Vec<&str> = viable
            .iter()
            .filter(|(i, c, _)| *i != index && c.is_discrete())
            .map(|(_, c, _)| c.name.as_str())
            .collect();
        tracing::warn!(
            "No ideal device found, selected {:?} (type: {:?}, \
             rule: {tier:?}); skipped discrete devices: {skipped:?}",
            candidate.name,
            candidate.device_type,
        );
    }

    Ok(Selection {
        index,
        candidate: candidate.clone(),
        roles,
        tier,
    })
}

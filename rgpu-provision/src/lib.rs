//! Vulkan device capability negotiation and provisioning, built on
//! [`ash`].
//!
//! The pipeline runs once at startup, before any rendering:
//!
//! ```text
//! Lifecycle::initialize            negotiate instance capabilities,
//!                                  create the API context
//! Lifecycle::create_surface_and_device
//!   ├── enumerate                  physical devices + queue families
//!   ├── select                     pick a device, assign queue roles
//!   ├── negotiate                  device extensions and layers
//!   └── provision                  logical device, queues, command pools
//! Lifecycle::terminate             pools → device → surface → context
//! ```
//!
//! Which capabilities are requested is decided by a [`catalog`] table
//! keyed by [`catalog::Profile`] tags, chosen through
//! [`config::ProvisionConfig`].
//!
//! # Naming conventions
//!
//! | prefix  | meaning                                   |
//! |---------|-------------------------------------------|
//! | `raw_*` | accepts or returns a raw `ash::vk` handle |
//! | `ash_*` | returns the `ash` wrapper object          |

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

pub mod catalog;
pub mod config;
pub mod context;
pub mod debug;
pub mod device;
pub mod driver;
pub mod enumerate;
pub mod instance;
pub mod lifecycle;
pub mod negotiate;
pub mod select;

#[cfg(test)]
mod testing;

pub use ash;
pub use raw_window_handle;
pub use raw_window_handle::HandleError as RwhHandleError;

//! The seam between the provisioning pipeline and the Vulkan API.
//!
//! Every native call the pipeline makes goes through [`Driver`] (a live
//! instance) or [`ContextLoader`] (the step that creates one). The
//! `ash`-backed implementations live in [`crate::instance`]; tests swap
//! in a recording fake so selection, negotiation and teardown ordering
//! can be checked without a GPU.
//!
//! Methods that accept raw handles are `unsafe fn`: Vulkan gives no
//! protection against handles from a different instance or device, so
//! provenance is the caller's burden, exactly as in the `raw_*` API of
//! the wrapper types.

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use thiserror::Error;

use crate::instance::{VkVersion, VulkanLogLevel};

/// Properties of a physical device that selection and logging care
/// about.
#[derive(Debug, Clone)]
pub struct PhysicalDeviceSummary {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: VkVersion,
}

/// One queue-creation entry of a [`DeviceCreateRequest`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueRequest {
    pub family: u32,
    pub count: u32,
    pub priority: f32,
}

/// Everything needed to create a logical device.
///
/// `extensions` and `layers` hold exactly the negotiated (satisfied)
/// names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceCreateRequest {
    pub queues: Vec<QueueRequest>,
    pub extensions: Vec<String>,
    pub layers: Vec<String>,
}

/// Parameters for creating the API context (a `VkInstance`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextCreateRequest {
    pub app_name: String,
    pub extensions: Vec<String>,
    pub layers: Vec<String>,
    /// `Some` registers a debug messenger forwarding messages at or
    /// above this level. Only set when `VK_EXT_debug_utils` is enabled.
    pub debug_level: Option<VulkanLogLevel>,
}

#[derive(Debug, Error)]
pub enum CreateContextError {
    #[error("Could not load Vulkan: {0}")]
    Loading(ash::LoadingError),
    #[error("Couldn't get display handle from passed value: {0}")]
    InvalidDisplayHandle(crate::RwhHandleError),
    #[error("Invalid app name was passed to context creation")]
    InvalidAppName,
    #[error("Capability name contains an interior NUL: {0:?}")]
    InvalidCapabilityName(String),
    #[error("Unknown Vulkan Error {0}")]
    UnknownVulkan(vk::Result),
}

impl From<vk::Result> for CreateContextError {
    fn from(value: vk::Result) -> Self {
        CreateContextError::UnknownVulkan(value)
    }
}

#[derive(Debug, Error)]
pub enum CreateSurfaceError {
    #[error("Couldn't get display handle: {0}")]
    InvalidDisplayHandle(crate::RwhHandleError),
    #[error("Couldn't get window handle: {0}")]
    InvalidWindowHandle(crate::RwhHandleError),
    #[error("Vulkan surface creation failed: {0}")]
    VulkanError(vk::Result),
    #[error(
        "Parent instance did not have the surface extensions \
         for this platform loaded"
    )]
    MissingExtension,
}

/// Creates API contexts.
///
/// Instance-level capability negotiation happens against what the
/// loader reports *before* a context exists, so those queries live here
/// rather than on [`Driver`].
pub trait ContextLoader {
    type Driver: Driver;

    fn available_instance_extensions(&self) -> Result<Vec<String>, vk::Result>;

    fn available_instance_layers(&self) -> Result<Vec<String>, vk::Result>;

    /// Instance extensions the windowing system needs to create a
    /// surface on this platform. Empty when no display was supplied.
    fn platform_surface_extensions(&self) -> Vec<String>;

    fn create_context(
        &self,
        request: &ContextCreateRequest,
    ) -> Result<Self::Driver, CreateContextError>;
}

/// A live API context and all raw operations the pipeline performs on
/// it.
pub trait Driver {
    /// `false` once [`destroy`](Self::destroy) has run.
    fn is_live(&self) -> bool;

    fn raw_physical_devices(
        &self,
    ) -> Result<Vec<vk::PhysicalDevice>, vk::Result>;

    /// # Safety
    /// `physical_device` must be derived from this context.
    unsafe fn physical_device_summary(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> PhysicalDeviceSummary;

    /// Queue families in the driver's native order.
    ///
    /// # Safety
    /// `physical_device` must be derived from this context.
    unsafe fn raw_queue_family_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Vec<vk::QueueFamilyProperties>;

    /// # Safety
    /// `physical_device` and `surface` must both be derived from this
    /// context.
    unsafe fn raw_surface_support(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
        surface: vk::SurfaceKHR,
    ) -> Result<bool, vk::Result>;

    /// # Safety
    /// `physical_device` must be derived from this context.
    unsafe fn device_extension_names(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<String>, vk::Result>;

    /// # Safety
    /// `physical_device` must be derived from this context.
    unsafe fn device_layer_names(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<String>, vk::Result>;

    /// # Safety
    /// `physical_device` must be derived from this context and every
    /// queue family in `request` must exist on it.
    unsafe fn create_raw_device(
        &self,
        physical_device: vk::PhysicalDevice,
        request: &DeviceCreateRequest,
    ) -> Result<vk::Device, vk::Result>;

    /// # Safety
    /// `device` must be a live device created by this context with at
    /// least `queue_index + 1` queues in `family`.
    unsafe fn raw_device_queue(
        &self,
        device: vk::Device,
        family: u32,
        queue_index: u32,
    ) -> vk::Queue;

    /// # Safety
    /// `device` must be a live device created by this context and
    /// `family` one of the families it was created with.
    unsafe fn create_raw_command_pool(
        &self,
        device: vk::Device,
        family: u32,
    ) -> Result<vk::CommandPool, vk::Result>;

    /// # Safety
    /// `pool` must have been created from `device` and must not be used
    /// (or destroyed) again.
    unsafe fn destroy_raw_command_pool(
        &self,
        device: vk::Device,
        pool: vk::CommandPool,
    );

    /// # Safety
    /// Every object created from `device` must already be destroyed.
    unsafe fn destroy_raw_device(&self, device: vk::Device);

    /// # Safety
    /// The window and display behind the raw handles must outlive the
    /// returned surface.
    unsafe fn create_raw_surface(
        &self,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<vk::SurfaceKHR, CreateSurfaceError>;

    /// # Safety
    /// `surface` must be derived from this context, and every object
    /// derived from it must already be destroyed.
    unsafe fn destroy_raw_surface(&self, surface: vk::SurfaceKHR);

    /// Destroys the debug messenger (if any) and then the context
    /// itself. Calling it again is a no-op.
    ///
    /// # Safety
    /// Every device and surface derived from this context must already
    /// be destroyed.
    unsafe fn destroy(&mut self);
}

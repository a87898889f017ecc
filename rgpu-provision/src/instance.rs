//! `ash`-backed [`ContextLoader`] and [`Driver`].
//!
//! [`InstanceLoader`] owns the loaded `ash::Entry` and answers the
//! pre-instance queries (available instance extensions and layers,
//! platform surface extensions). [`Instance`] wraps the created
//! `ash::Instance` together with its debug messenger, the surface
//! extension loader and a table of the logical devices created from it,
//! so raw `vk::Device` handles can be mapped back to their dispatch
//! tables.
//!
//! [`VkVersion`] is a thin newtype over the packed Vulkan version word.

use std::{
    collections::HashMap,
    ffi::{CStr, CString, c_char},
    fmt::{self, Debug},
    sync::{Mutex, MutexGuard, PoisonError},
};

use ash::vk;
use raw_window_handle::{HasDisplayHandle, RawDisplayHandle, RawWindowHandle};
use serde::{Deserialize, Serialize};

use crate::{
    debug,
    driver::{
        ContextCreateRequest, ContextLoader, CreateContextError,
        CreateSurfaceError, DeviceCreateRequest, Driver, PhysicalDeviceSummary,
    },
};

/// Minimum severity level for Vulkan validation layer messages.
///
/// Messages at or above the chosen level are forwarded to the
/// [`tracing`] subscriber; lower-severity messages are suppressed.
/// Variants are ordered least-to-most severe:
/// `Verbose < Info < Warning < Error`.
#[derive(
    Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum VulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

/// A packed Vulkan API version number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VkVersion(u32);

impl VkVersion {
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn new(variant: u32, major: u32, minor: u32, patch: u32) -> Self {
        Self(vk::make_api_version(variant, major, minor, patch))
    }

    pub fn variant(&self) -> u32 {
        vk::api_version_variant(self.0)
    }

    pub fn major(&self) -> u32 {
        vk::api_version_major(self.0)
    }
    pub fn minor(&self) -> u32 {
        vk::api_version_minor(self.0)
    }
    pub fn patch(&self) -> u32 {
        vk::api_version_patch(self.0)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for VkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.patch())
    }
}

const SURFACE_EXTENSION: &str = "VK_KHR_surface";

fn c_str_lossy(
    name: Result<&CStr, std::ffi::FromBytesUntilNulError>,
) -> String {
    name.map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn to_c_strings(names: &[String]) -> Result<Vec<CString>, CreateContextError> {
    names
        .iter()
        .map(|n| {
            CString::new(n.as_str()).map_err(|_| {
                CreateContextError::InvalidCapabilityName(n.clone())
            })
        })
        .collect()
}

/// Loads the Vulkan library and creates [`Instance`]s.
#[derive(Clone)]
pub struct InstanceLoader {
    entry: ash::Entry,
    platform_surface_extensions: Vec<String>,
}

impl Debug for InstanceLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceLoader")
            .field(
                "platform_surface_extensions",
                &self.platform_surface_extensions,
            )
            .finish_non_exhaustive()
    }
}

impl InstanceLoader {
    /// Load the Vulkan library.
    ///
    /// When `display_handle_source` is given, the instance extensions the
    /// platform needs for surface creation are recorded so the capability
    /// catalog can require them.
    ///
    /// # Safety
    /// This loads vulkan using libloading, meaning that there can be
    /// arbitrary code executed.
    pub unsafe fn new<D: HasDisplayHandle + ?Sized>(
        display_handle_source: Option<&D>,
    ) -> Result<Self, CreateContextError> {
        //SAFETY: We pass on the burden of the safety from loading dlls to the
        //caller. Every Instance holds a clone of the entry so the library
        //outlives all objects created through it
        let entry =
            unsafe { ash::Entry::load() }.map_err(CreateContextError::Loading)?;

        let platform_surface_extensions = match display_handle_source {
            Some(source) => {
                let raw = source
                    .display_handle()
                    .map_err(CreateContextError::InvalidDisplayHandle)?
                    .as_raw();
                ash_window::enumerate_required_extensions(raw)?
                    .iter()
                    //SAFETY: ash_window promises to hand us null
                    //terminated C strings with static lifetime
                    .map(|ptr| unsafe { CStr::from_ptr(*ptr) })
                    .map(|name| name.to_string_lossy().into_owned())
                    .collect()
            }
            None => Vec::new(),
        };

        Ok(Self {
            entry,
            platform_surface_extensions,
        })
    }

    /// Load the Vulkan library without any windowing system.
    ///
    /// # Safety
    /// Same as [`InstanceLoader::new`].
    pub unsafe fn headless() -> Result<Self, CreateContextError> {
        // SAFETY: forwarded to the caller
        unsafe { Self::new::<raw_window_handle::DisplayHandle<'static>>(None) }
    }
}

impl ContextLoader for InstanceLoader {
    type Driver = Instance;

    fn available_instance_extensions(&self) -> Result<Vec<String>, vk::Result> {
        // SAFETY: entry is a live Vulkan entry; passing None queries
        // global extensions and does not dereference any layer name.
        let props = unsafe {
            self.entry.enumerate_instance_extension_properties(None)
        }?;
        Ok(props
            .iter()
            .map(|p| c_str_lossy(p.extension_name_as_c_str()))
            .collect())
    }

    fn available_instance_layers(&self) -> Result<Vec<String>, vk::Result> {
        // SAFETY: entry is a live Vulkan entry;
        // vkEnumerateInstanceLayerProperties has no additional preconditions.
        let props =
            unsafe { self.entry.enumerate_instance_layer_properties() }?;
        Ok(props
            .iter()
            .map(|p| c_str_lossy(p.layer_name_as_c_str()))
            .collect())
    }

    fn platform_surface_extensions(&self) -> Vec<String> {
        self.platform_surface_extensions.clone()
    }

    fn create_context(
        &self,
        request: &ContextCreateRequest,
    ) -> Result<Instance, CreateContextError> {
        let app_name = CString::new(request.app_name.as_str())
            .map_err(|_| CreateContextError::InvalidAppName)?;
        let ext_names = to_c_strings(&request.extensions)?;
        let layer_names = to_c_strings(&request.layers)?;
        let ext_ptrs: Vec<*const c_char> =
            ext_names.iter().map(|n| n.as_ptr()).collect();
        let layer_ptrs: Vec<*const c_char> =
            layer_names.iter().map(|n| n.as_ptr()).collect();

        // SAFETY: entry is a live Vulkan entry; vkEnumerateInstanceVersion
        // has no preconditions beyond a valid entry point.
        let api_version = unsafe { self.entry.try_enumerate_instance_version() }
            .unwrap_or(Some(vk::API_VERSION_1_0))
            .unwrap_or(vk::API_VERSION_1_0);

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"rgpu-provision")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(api_version);

        // Chained into the instance create info so instance creation
        // itself is covered by the messenger.
        let mut debug_create_info =
            request.debug_level.map(debug::messenger_create_info);

        let mut instance_create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&ext_ptrs)
            .enabled_layer_names(&layer_ptrs);
        if let Some(ref mut debug_info) = debug_create_info {
            instance_create_info = instance_create_info.push_next(debug_info);
        }

        //SAFETY: instance_create_info and everything it points at lives
        //until the end of this call
        let instance =
            unsafe { self.entry.create_instance(&instance_create_info, None) }?;
        tracing::debug!(
            "Created instance {:?} (api {})",
            instance.handle(),
            VkVersion::from_raw(api_version)
        );

        let debug_messenger = match debug_create_info {
            Some(mut create_info) => {
                create_info.p_next = std::ptr::null();
                let debug_utils_instance = ash::ext::debug_utils::Instance::new(
                    &self.entry,
                    &instance,
                );
                //SAFETY: create_info is fully initialised and the instance
                //was created with VK_EXT_debug_utils enabled
                match unsafe {
                    debug_utils_instance
                        .create_debug_utils_messenger(&create_info, None)
                } {
                    Ok(messenger) => Some((messenger, debug_utils_instance)),
                    Err(e) => {
                        tracing::error!(
                            "Could not register the debug messenger, \
                             continuing without one: {e}"
                        );
                        None
                    }
                }
            }
            None => None,
        };

        let surface_instance = request
            .extensions
            .iter()
            .any(|e| e == SURFACE_EXTENSION)
            .then(|| ash::khr::surface::Instance::new(&self.entry, &instance));

        Ok(Instance {
            entry: self.entry.clone(),
            handle: instance,
            debug_messenger,
            surface_instance,
            ver: VkVersion::from_raw(api_version),
            devices: Mutex::new(HashMap::new()),
            destroyed: false,
        })
    }
}

/// A live `VkInstance`.
///
/// Destroyed explicitly through [`Driver::destroy`]; dropping a
/// still-live instance destroys it as a last resort.
pub struct Instance {
    entry: ash::Entry,
    handle: ash::Instance,
    debug_messenger:
        Option<(vk::DebugUtilsMessengerEXT, ash::ext::debug_utils::Instance)>,
    surface_instance: Option<ash::khr::surface::Instance>,
    ver: VkVersion,
    devices: Mutex<HashMap<vk::Device, ash::Device>>,
    destroyed: bool,
}

impl Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("handle", &self.handle.handle())
            .field("destroyed", &self.destroyed)
            .finish_non_exhaustive()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if !self.destroyed {
            tracing::warn!(
                "Instance {:?} dropped without explicit teardown",
                self.handle.handle()
            );
            //SAFETY: We are in drop so this is the last use of the instance
            unsafe { self.destroy() };
        }
    }
}

impl Instance {
    /// The version reported by `vkEnumerateInstanceVersion`.
    pub fn supported_ver(&self) -> VkVersion {
        self.ver
    }

    pub fn raw_instance(&self) -> vk::Instance {
        self.handle.handle()
    }

    pub fn ash_instance(&self) -> &ash::Instance {
        &self.handle
    }

    pub fn has_debug_messenger(&self) -> bool {
        self.debug_messenger.is_some()
    }

    fn devices(&self) -> MutexGuard<'_, HashMap<vk::Device, ash::Device>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The `ash` dispatch table for a device created by this instance.
    pub fn ash_device(&self, device: vk::Device) -> Option<ash::Device> {
        self.devices().get(&device).cloned()
    }
}

impl Driver for Instance {
    fn is_live(&self) -> bool {
        !self.destroyed
    }

    fn raw_physical_devices(
        &self,
    ) -> Result<Vec<vk::PhysicalDevice>, vk::Result> {
        //SAFETY: the instance is live; enumeration has no other
        //preconditions
        unsafe { self.handle.enumerate_physical_devices() }
    }

    unsafe fn physical_device_summary(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> PhysicalDeviceSummary {
        //SAFETY: physical_device was derived from this instance (caller)
        let props = unsafe {
            self.handle.get_physical_device_properties(physical_device)
        };
        let name = props
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_owned());
        PhysicalDeviceSummary {
            name,
            device_type: props.device_type,
            api_version: VkVersion::from_raw(props.api_version),
        }
    }

    unsafe fn raw_queue_family_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Vec<vk::QueueFamilyProperties> {
        //SAFETY: physical_device was derived from this instance (caller)
        unsafe {
            self.handle
                .get_physical_device_queue_family_properties(physical_device)
        }
    }

    unsafe fn raw_surface_support(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
        surface: vk::SurfaceKHR,
    ) -> Result<bool, vk::Result> {
        let surface_instance = self
            .surface_instance
            .as_ref()
            .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)?;
        //SAFETY: physical_device and surface were derived from this
        //instance (caller)
        unsafe {
            surface_instance.get_physical_device_surface_support(
                physical_device,
                queue_family_index,
                surface,
            )
        }
    }

    unsafe fn device_extension_names(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<String>, vk::Result> {
        //SAFETY: physical_device was derived from this instance (caller)
        let props = unsafe {
            self.handle
                .enumerate_device_extension_properties(physical_device)
        }?;
        Ok(props
            .iter()
            .map(|p| c_str_lossy(p.extension_name_as_c_str()))
            .collect())
    }

    unsafe fn device_layer_names(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<String>, vk::Result> {
        //SAFETY: physical_device was derived from this instance (caller)
        #[allow(deprecated)]
        let props = unsafe {
            self.handle.enumerate_device_layer_properties(physical_device)
        }?;
        Ok(props
            .iter()
            .map(|p| c_str_lossy(p.layer_name_as_c_str()))
            .collect())
    }

    unsafe fn create_raw_device(
        &self,
        physical_device: vk::PhysicalDevice,
        request: &DeviceCreateRequest,
    ) -> Result<vk::Device, vk::Result> {
        let to_c = |names: &[String]| -> Result<Vec<CString>, vk::Result> {
            names
                .iter()
                .map(|n| {
                    CString::new(n.as_str())
                        .map_err(|_| vk::Result::ERROR_EXTENSION_NOT_PRESENT)
                })
                .collect()
        };
        let ext_names = to_c(&request.extensions)?;
        let layer_names = to_c(&request.layers)?;
        let ext_ptrs: Vec<*const c_char> =
            ext_names.iter().map(|n| n.as_ptr()).collect();
        let layer_ptrs: Vec<*const c_char> =
            layer_names.iter().map(|n| n.as_ptr()).collect();

        let queue_priorities_storage: Vec<Vec<f32>> = request
            .queues
            .iter()
            .map(|q| vec![q.priority; q.count as usize])
            .collect();
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo<'_>> = request
            .queues
            .iter()
            .zip(queue_priorities_storage.iter())
            .map(|(q, priorities)| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(q.family)
                    .queue_priorities(priorities)
            })
            .collect();

        #[allow(deprecated)]
        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&ext_ptrs)
            .enabled_layer_names(&layer_ptrs);

        //SAFETY: physical_device was derived from this instance (caller);
        //device_create_info and its arrays live until the end of this call
        let device = unsafe {
            self.handle
                .create_device(physical_device, &device_create_info, None)
        }?;
        let raw = device.handle();
        self.devices().insert(raw, device);
        Ok(raw)
    }

    unsafe fn raw_device_queue(
        &self,
        device: vk::Device,
        family: u32,
        queue_index: u32,
    ) -> vk::Queue {
        match self.devices().get(&device) {
            //SAFETY: the device was created with this family and at least
            //queue_index + 1 queues (caller)
            Some(d) => unsafe { d.get_device_queue(family, queue_index) },
            None => {
                tracing::warn!(
                    "Queue requested from unknown device {device:?}"
                );
                vk::Queue::null()
            }
        }
    }

    unsafe fn create_raw_command_pool(
        &self,
        device: vk::Device,
        family: u32,
    ) -> Result<vk::CommandPool, vk::Result> {
        let devices = self.devices();
        let d = devices
            .get(&device)
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)?;
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        //SAFETY: create_info uses a queue family the device was created
        //with (caller)
        unsafe { d.create_command_pool(&create_info, None) }
    }

    unsafe fn destroy_raw_command_pool(
        &self,
        device: vk::Device,
        pool: vk::CommandPool,
    ) {
        match self.devices().get(&device) {
            //SAFETY: pool was created from this device and is not used
            //again (caller)
            Some(d) => unsafe { d.destroy_command_pool(pool, None) },
            None => tracing::warn!(
                "Command pool {pool:?} belongs to unknown device {device:?}"
            ),
        }
    }

    unsafe fn destroy_raw_device(&self, device: vk::Device) {
        match self.devices().remove(&device) {
            //SAFETY: All objects derived from this device were destroyed
            //before this call (caller)
            Some(d) => unsafe { d.destroy_device(None) },
            None => tracing::warn!(
                "Destroy requested for unknown device {device:?}"
            ),
        }
    }

    unsafe fn create_raw_surface(
        &self,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<vk::SurfaceKHR, CreateSurfaceError> {
        if self.surface_instance.is_none() {
            return Err(CreateSurfaceError::MissingExtension);
        }
        //SAFETY: The window and display outlive the surface (caller) and
        //the platform surface extensions were enabled on this instance
        unsafe {
            ash_window::create_surface(
                &self.entry,
                &self.handle,
                display,
                window,
                None,
            )
        }
        .map_err(CreateSurfaceError::VulkanError)
    }

    unsafe fn destroy_raw_surface(&self, surface: vk::SurfaceKHR) {
        match self.surface_instance {
            //SAFETY: surface is derived from this instance and nothing
            //derived from it is alive (caller)
            Some(ref surface_instance) => unsafe {
                surface_instance.destroy_surface(surface, None)
            },
            None => tracing::warn!(
                "Surface {surface:?} destroyed without the surface extension"
            ),
        }
    }

    unsafe fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        let leaked: Vec<ash::Device> =
            self.devices().drain().map(|(_, d)| d).collect();
        for device in leaked {
            tracing::warn!("Destroying leaked device {:?}", device.handle());
            //SAFETY: the instance is going away; the device must not outlive
            //it
            unsafe { device.destroy_device(None) };
        }
        tracing::debug!("Destroying instance {:?}", self.handle.handle());
        if let Some((debug_messenger, debug_utils_instance)) =
            self.debug_messenger.take()
        {
            //SAFETY: last use of this debug messenger. We made this debug
            //messenger from this instance. debug_utils_instance is derived from
            //this instance
            unsafe {
                debug_utils_instance
                    .destroy_debug_utils_messenger(debug_messenger, None)
            };
        }
        //SAFETY: Every object derived from this instance is gone (caller)
        unsafe { self.handle.destroy_instance(None) };
        self.destroyed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vk_version_raw_roundtrip() {
        let raw = vk::make_api_version(0, 1, 3, 275);
        let version = VkVersion::from_raw(raw);

        assert_eq!(version.to_raw(), raw);
        assert_eq!(version.variant(), 0);
        assert_eq!(version.major(), 1);
        assert_eq!(version.minor(), 3);
        assert_eq!(version.patch(), 275);
    }

    #[test]
    fn vk_version_orders_and_displays() {
        let old = VkVersion::new(0, 1, 2, 198);
        let new = VkVersion::new(0, 1, 3, 0);
        assert!(old < new);
        assert_eq!(new.to_string(), "1.3.0");
    }

    #[test]
    fn interior_nul_names_are_rejected() {
        let err = to_c_strings(&["VK_KHR\0surface".to_owned()]);
        assert!(matches!(
            err,
            Err(CreateContextError::InvalidCapabilityName(_))
        ));
    }
}

//! In-memory [`Driver`]/[`ContextLoader`] used by unit tests.
//!
//! Hands out `Handle::from_raw` handles and records every create and
//! destroy in a log shared between the loader and the drivers it makes,
//! so ordering and exactly-once teardown can be asserted.

use std::{
    cell::{Cell, RefCell},
    io,
    rc::Rc,
    sync::{Arc, Mutex},
};

use ash::vk::{self, Handle};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::{
    driver::{
        ContextCreateRequest, ContextLoader, CreateContextError,
        CreateSurfaceError, DeviceCreateRequest, Driver,
        PhysicalDeviceSummary,
    },
    instance::VkVersion,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateContext(ContextCreateRequest),
    CreateSurface(vk::SurfaceKHR),
    CreateDevice(vk::PhysicalDevice, DeviceCreateRequest),
    CreateCommandPool(u32, vk::CommandPool),
    DestroyCommandPool(vk::CommandPool),
    DestroyDevice(vk::Device),
    DestroySurface(vk::SurfaceKHR),
    DestroyContext,
}

pub type CallLog = Rc<RefCell<Vec<Call>>>;

#[derive(Debug, Clone, Copy)]
pub struct FakeFamily {
    pub flags: vk::QueueFlags,
    pub count: u32,
    pub present: bool,
}

pub fn family(flags: vk::QueueFlags, present: bool) -> FakeFamily {
    FakeFamily {
        flags,
        count: 1,
        present,
    }
}

#[derive(Debug, Clone)]
pub struct FakeDevice {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub families: Vec<FakeFamily>,
    pub extensions: Vec<String>,
    pub layers: Vec<String>,
}

impl FakeDevice {
    pub fn new(
        name: &str,
        device_type: vk::PhysicalDeviceType,
        families: Vec<FakeFamily>,
    ) -> Self {
        Self {
            name: name.to_owned(),
            device_type,
            families,
            extensions: Vec::new(),
            layers: Vec::new(),
        }
    }

    pub fn discrete(name: &str, families: Vec<FakeFamily>) -> Self {
        Self::new(name, vk::PhysicalDeviceType::DISCRETE_GPU, families)
    }

    pub fn integrated(name: &str, families: Vec<FakeFamily>) -> Self {
        Self::new(name, vk::PhysicalDeviceType::INTEGRATED_GPU, families)
    }

    pub fn with_extensions(mut self, names: &[&str]) -> Self {
        self.extensions.extend(names.iter().map(|n| (*n).to_owned()));
        self
    }

    pub fn with_layers(mut self, names: &[&str]) -> Self {
        self.layers.extend(names.iter().map(|n| (*n).to_owned()));
        self
    }
}

const PHYSICAL_DEVICE_BASE: u64 = 0x1000;

pub fn physical_handle(index: usize) -> vk::PhysicalDevice {
    vk::PhysicalDevice::from_raw(PHYSICAL_DEVICE_BASE + index as u64)
}

#[derive(Debug, Clone)]
pub struct FakeDriver {
    devices: Vec<FakeDevice>,
    log: CallLog,
    live: bool,
    next_handle: Rc<Cell<u64>>,
    enumeration_error: Option<vk::Result>,
    surface_support_fails: bool,
    surface_error: Option<vk::Result>,
    device_error: Option<vk::Result>,
    /// Zero-based index of the pool creation that fails.
    failing_pool: Option<usize>,
    pools_created: Rc<Cell<usize>>,
}

impl FakeDriver {
    pub fn new(devices: Vec<FakeDevice>) -> Self {
        Self {
            devices,
            log: CallLog::default(),
            live: true,
            next_handle: Rc::new(Cell::new(0x10_0000)),
            enumeration_error: None,
            surface_support_fails: false,
            surface_error: None,
            device_error: None,
            failing_pool: None,
            pools_created: Rc::new(Cell::new(0)),
        }
    }

    pub fn log(&self) -> CallLog {
        Rc::clone(&self.log)
    }

    pub fn failing_enumeration(mut self, error: vk::Result) -> Self {
        self.enumeration_error = Some(error);
        self
    }

    pub fn failing_surface_support(mut self) -> Self {
        self.surface_support_fails = true;
        self
    }

    pub fn failing_surface(mut self, error: vk::Result) -> Self {
        self.surface_error = Some(error);
        self
    }

    pub fn failing_device(mut self, error: vk::Result) -> Self {
        self.device_error = Some(error);
        self
    }

    pub fn failing_pool(mut self, nth: usize) -> Self {
        self.failing_pool = Some(nth);
        self
    }

    fn next_raw(&self) -> u64 {
        let raw = self.next_handle.get();
        self.next_handle.set(raw + 1);
        raw
    }

    fn device(&self, physical_device: vk::PhysicalDevice) -> &FakeDevice {
        let idx = physical_device.as_raw() - PHYSICAL_DEVICE_BASE;
        &self.devices[idx as usize]
    }

    fn record(&self, call: Call) {
        self.log.borrow_mut().push(call);
    }
}

impl Driver for FakeDriver {
    fn is_live(&self) -> bool {
        self.live
    }

    fn raw_physical_devices(
        &self,
    ) -> Result<Vec<vk::PhysicalDevice>, vk::Result> {
        if let Some(e) = self.enumeration_error {
            return Err(e);
        }
        Ok((0..self.devices.len()).map(physical_handle).collect())
    }

    unsafe fn physical_device_summary(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> PhysicalDeviceSummary {
        let device = self.device(physical_device);
        PhysicalDeviceSummary {
            name: device.name.clone(),
            device_type: device.device_type,
            api_version: VkVersion::new(0, 1, 3, 0),
        }
    }

    unsafe fn raw_queue_family_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Vec<vk::QueueFamilyProperties> {
        self.device(physical_device)
            .families
            .iter()
            .map(|f| vk::QueueFamilyProperties {
                queue_flags: f.flags,
                queue_count: f.count,
                ..Default::default()
            })
            .collect()
    }

    unsafe fn raw_surface_support(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
        _surface: vk::SurfaceKHR,
    ) -> Result<bool, vk::Result> {
        if self.surface_support_fails {
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        }
        Ok(self.device(physical_device).families[queue_family_index as usize]
            .present)
    }

    unsafe fn device_extension_names(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<String>, vk::Result> {
        Ok(self.device(physical_device).extensions.clone())
    }

    unsafe fn device_layer_names(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<String>, vk::Result> {
        Ok(self.device(physical_device).layers.clone())
    }

    unsafe fn create_raw_device(
        &self,
        physical_device: vk::PhysicalDevice,
        request: &DeviceCreateRequest,
    ) -> Result<vk::Device, vk::Result> {
        if let Some(e) = self.device_error {
            return Err(e);
        }
        self.record(Call::CreateDevice(physical_device, request.clone()));
        Ok(vk::Device::from_raw(self.next_raw()))
    }

    unsafe fn raw_device_queue(
        &self,
        device: vk::Device,
        family: u32,
        queue_index: u32,
    ) -> vk::Queue {
        vk::Queue::from_raw(
            (device.as_raw() << 16)
                | (u64::from(family) << 8)
                | u64::from(queue_index),
        )
    }

    unsafe fn create_raw_command_pool(
        &self,
        _device: vk::Device,
        family: u32,
    ) -> Result<vk::CommandPool, vk::Result> {
        let nth = self.pools_created.get();
        self.pools_created.set(nth + 1);
        if self.failing_pool == Some(nth) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let pool = vk::CommandPool::from_raw(self.next_raw());
        self.record(Call::CreateCommandPool(family, pool));
        Ok(pool)
    }

    unsafe fn destroy_raw_command_pool(
        &self,
        _device: vk::Device,
        pool: vk::CommandPool,
    ) {
        self.record(Call::DestroyCommandPool(pool));
    }

    unsafe fn destroy_raw_device(&self, device: vk::Device) {
        self.record(Call::DestroyDevice(device));
    }

    unsafe fn create_raw_surface(
        &self,
        _display: RawDisplayHandle,
        _window: RawWindowHandle,
    ) -> Result<vk::SurfaceKHR, CreateSurfaceError> {
        if let Some(e) = self.surface_error {
            return Err(CreateSurfaceError::VulkanError(e));
        }
        let surface = vk::SurfaceKHR::from_raw(self.next_raw());
        self.record(Call::CreateSurface(surface));
        Ok(surface)
    }

    unsafe fn destroy_raw_surface(&self, surface: vk::SurfaceKHR) {
        self.record(Call::DestroySurface(surface));
    }

    unsafe fn destroy(&mut self) {
        // Every call is recorded, even repeats, so tests can catch a
        // double destroy.
        self.record(Call::DestroyContext);
        self.live = false;
    }
}

/// Makes [`FakeDriver`]s that share the prototype's log and failure
/// settings.
#[derive(Debug, Clone)]
pub struct FakeLoader {
    prototype: FakeDriver,
    pub instance_extensions: Vec<String>,
    pub instance_layers: Vec<String>,
    pub platform_extensions: Vec<String>,
    pub context_error: Option<vk::Result>,
}

impl FakeLoader {
    pub fn new(prototype: FakeDriver) -> Self {
        Self {
            prototype,
            instance_extensions: vec![
                "VK_KHR_get_physical_device_properties2".to_owned(),
                "VK_KHR_surface".to_owned(),
                "VK_KHR_xlib_surface".to_owned(),
                "VK_KHR_get_surface_capabilities2".to_owned(),
                "VK_EXT_debug_utils".to_owned(),
            ],
            instance_layers: vec!["VK_LAYER_KHRONOS_validation".to_owned()],
            platform_extensions: vec!["VK_KHR_xlib_surface".to_owned()],
            context_error: None,
        }
    }
}

impl ContextLoader for FakeLoader {
    type Driver = FakeDriver;

    fn available_instance_extensions(&self) -> Result<Vec<String>, vk::Result> {
        Ok(self.instance_extensions.clone())
    }

    fn available_instance_layers(&self) -> Result<Vec<String>, vk::Result> {
        Ok(self.instance_layers.clone())
    }

    fn platform_surface_extensions(&self) -> Vec<String> {
        self.platform_extensions.clone()
    }

    fn create_context(
        &self,
        request: &ContextCreateRequest,
    ) -> Result<FakeDriver, CreateContextError> {
        if let Some(e) = self.context_error {
            return Err(CreateContextError::UnknownVulkan(e));
        }
        self.prototype.record(Call::CreateContext(request.clone()));
        Ok(self.prototype.clone())
    }
}

/// Index of the first logged call matching `pred`.
pub fn position(log: &CallLog, pred: impl Fn(&Call) -> bool) -> Option<usize> {
    log.borrow().iter().position(pred)
}

/// Number of logged calls matching `pred`.
pub fn count(log: &CallLog, pred: impl Fn(&Call) -> bool) -> usize {
    log.borrow().iter().filter(|c| pred(c)).count()
}

/// Shared sink for formatted log lines.
#[derive(Debug, Clone, Default)]
struct LogSink(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.lock() {
            Ok(mut bytes) => bytes.extend_from_slice(buf),
            Err(poisoned) => poisoned.into_inner().extend_from_slice(buf),
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `f` with a thread-local subscriber and return its result along
/// with everything it logged, one event per line.
pub fn capture_logs<R>(f: impl FnOnce() -> R) -> (R, String) {
    let sink = LogSink::default();
    let writer = sink.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_max_level(tracing::Level::TRACE)
        .with_ansi(false)
        .without_time()
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    let bytes = match sink.0.lock() {
        Ok(bytes) => bytes.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    (result, String::from_utf8_lossy(&bytes).into_owned())
}

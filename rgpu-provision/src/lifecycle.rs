//! Owned lifecycle of the API context, surface and logical device.
//!
//! [`Lifecycle`] is the only owner of native handles in the crate. It
//! moves through `Uninitialized -> ContextReady -> DeviceReady ->
//! TornDown`; a failed call leaves it in the state it started from with
//! everything that call created already destroyed.

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::{
    catalog::{CapabilityKind, DEBUG_UTILS, Profile},
    config::ProvisionConfig,
    context::ApiContext,
    device::{LogicalDevice, ProvisionError, provision},
    driver::{
        ContextCreateRequest, ContextLoader, CreateContextError,
        CreateSurfaceError, Driver,
    },
    enumerate::{DeviceCandidate, EnumerateError},
    negotiate::{NegotiateError, NegotiationResult, negotiate, partition},
    select::{SelectError, Selection, select},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    ContextReady,
    DeviceReady,
    TornDown,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("No live API context")]
    ContextInvalid,
    #[error("Already initialized")]
    AlreadyInitialized,
    #[error("Failed to query loader capabilities: {0}")]
    LoaderQuery(vk::Result),
    #[error("Failed to create API context: {0}")]
    ContextCreationFailed(#[from] CreateContextError),
    #[error("Failed to create presentation target: {0}")]
    PresentationTargetCreationFailed(#[from] CreateSurfaceError),
    #[error("Failed to enumerate devices: {0}")]
    Enumeration(EnumerateError),
    #[error("No physical device has the required queue families")]
    NoViableDevice,
    #[error("Required capability {name} is not supported")]
    RequiredCapabilityMissing { name: String },
    #[error("Failed to query device capabilities: {0}")]
    CapabilityQuery(vk::Result),
    #[error("Failed to create logical device: {0}")]
    DeviceCreationFailed(vk::Result),
    #[error(
        "Failed to create command pool for queue family {family}: {result}"
    )]
    CommandPoolCreationFailed { family: u32, result: vk::Result },
}

impl From<EnumerateError> for LifecycleError {
    fn from(value: EnumerateError) -> Self {
        match value {
            EnumerateError::ContextInvalid => LifecycleError::ContextInvalid,
            e => LifecycleError::Enumeration(e),
        }
    }
}

impl From<SelectError> for LifecycleError {
    fn from(value: SelectError) -> Self {
        match value {
            SelectError::NoViableDevice => LifecycleError::NoViableDevice,
        }
    }
}

impl From<NegotiateError> for LifecycleError {
    fn from(value: NegotiateError) -> Self {
        match value {
            NegotiateError::RequiredCapabilityMissing { name } => {
                LifecycleError::RequiredCapabilityMissing { name }
            }
            NegotiateError::Query(e) => LifecycleError::CapabilityQuery(e),
        }
    }
}

impl From<ProvisionError> for LifecycleError {
    fn from(value: ProvisionError) -> Self {
        match value {
            ProvisionError::MissingGraphicsRole => {
                LifecycleError::NoViableDevice
            }
            ProvisionError::DeviceCreationFailed(e) => {
                LifecycleError::DeviceCreationFailed(e)
            }
            ProvisionError::CommandPoolCreationFailed { family, result } => {
                LifecycleError::CommandPoolCreationFailed { family, result }
            }
        }
    }
}

struct Provisioned {
    selection: Selection,
    negotiation: NegotiationResult,
    device: LogicalDevice,
}

pub struct Lifecycle<L: ContextLoader> {
    loader: L,
    config: ProvisionConfig,
    state: LifecycleState,
    context: Option<ApiContext<L::Driver>>,
    surface: Option<vk::SurfaceKHR>,
    provisioned: Option<Provisioned>,
}

impl<L: ContextLoader> std::fmt::Debug for Lifecycle<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("state", &self.state)
            .field("surface", &self.surface)
            .field("device", &self.device().map(LogicalDevice::raw_device))
            .finish_non_exhaustive()
    }
}

impl<L: ContextLoader> Drop for Lifecycle<L> {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl<L: ContextLoader> Lifecycle<L> {
    pub fn new(loader: L, config: ProvisionConfig) -> Self {
        Self {
            loader,
            config,
            state: LifecycleState::Uninitialized,
            context: None,
            surface: None,
            provisioned: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    pub fn context(&self) -> Option<&ApiContext<L::Driver>> {
        self.context.as_ref()
    }

    pub fn driver(&self) -> Option<&L::Driver> {
        self.context.as_ref().map(ApiContext::driver)
    }

    pub fn surface(&self) -> Option<vk::SurfaceKHR> {
        self.surface
    }

    pub fn device(&self) -> Option<&LogicalDevice> {
        self.provisioned.as_ref().map(|p| &p.device)
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.provisioned.as_ref().map(|p| &p.selection)
    }

    pub fn negotiation(&self) -> Option<&NegotiationResult> {
        self.provisioned.as_ref().map(|p| &p.negotiation)
    }

    /// Negotiate instance capabilities and create the API context.
    pub fn initialize(&mut self) -> Result<(), LifecycleError> {
        if self.state != LifecycleState::Uninitialized {
            return Err(LifecycleError::AlreadyInitialized);
        }

        let request = self
            .config
            .catalog(self.loader.platform_surface_extensions())
            .instance_request();
        let extensions = self
            .loader
            .available_instance_extensions()
            .map_err(LifecycleError::LoaderQuery)?;
        let layers = self
            .loader
            .available_instance_layers()
            .map_err(LifecycleError::LoaderQuery)?;
        let negotiated =
            partition(&extensions, &layers, &request).into_checked("instance")?;

        let debug_level = match self.config.debug_level {
            Some(_) if !negotiated.is_satisfied(DEBUG_UTILS) => {
                tracing::warn!(
                    "Vulkan debug level set but {DEBUG_UTILS} is unavailable, \
                     no debug messenger will be registered"
                );
                None
            }
            level => level,
        };

        let create_request = ContextCreateRequest {
            app_name: self.config.app_name.clone(),
            extensions: negotiated.satisfied_names(CapabilityKind::Extension),
            layers: negotiated.satisfied_names(CapabilityKind::Layer),
            debug_level,
        };
        let driver = self.loader.create_context(&create_request)?;
        tracing::info!(
            "Created API context with extensions {:?} and layers {:?}",
            create_request.extensions,
            create_request.layers
        );

        self.context = Some(ApiContext::new(driver, negotiated));
        self.state = LifecycleState::ContextReady;
        Ok(())
    }

    fn check_can_provision(&self) -> Result<(), LifecycleError> {
        match self.state {
            LifecycleState::ContextReady => Ok(()),
            LifecycleState::DeviceReady => {
                Err(LifecycleError::AlreadyInitialized)
            }
            LifecycleState::Uninitialized | LifecycleState::TornDown => {
                Err(LifecycleError::ContextInvalid)
            }
        }
    }

    /// Create a surface for `window`, then select, negotiate and
    /// provision a device that can present to it.
    ///
    /// # Safety
    /// `window` must outlive this lifecycle's device, i.e. stay alive
    /// until [`terminate`](Self::terminate) or drop. The surface must be
    /// torn down before the window is, e.g. on winit suspend.
    pub unsafe fn create_surface_and_device<W>(
        &mut self,
        window: &W,
    ) -> Result<(), LifecycleError>
    where
        W: HasDisplayHandle + HasWindowHandle + ?Sized,
    {
        self.check_can_provision()?;
        let display = window
            .display_handle()
            .map_err(CreateSurfaceError::InvalidDisplayHandle)?
            .as_raw();
        let window = window
            .window_handle()
            .map_err(CreateSurfaceError::InvalidWindowHandle)?
            .as_raw();

        let context =
            self.context.as_ref().ok_or(LifecycleError::ContextInvalid)?;
        //SAFETY: caller guarantees the window outlives the surface
        let surface =
            unsafe { context.driver().create_raw_surface(display, window) }?;
        tracing::debug!("Created surface {surface:?}");

        //SAFETY: surface was just created from this context
        match unsafe { self.build_device(Some(surface)) } {
            Ok(provisioned) => {
                self.surface = Some(surface);
                self.provisioned = Some(provisioned);
                self.state = LifecycleState::DeviceReady;
                Ok(())
            }
            Err(e) => {
                tracing::debug!(
                    "Dropping surface {surface:?} after failed provisioning"
                );
                //SAFETY: nothing derived from the surface survived the failure
                unsafe { context.driver().destroy_raw_surface(surface) };
                Err(e)
            }
        }
    }

    /// Select, negotiate and provision a device without any presentation
    /// target.
    pub fn create_headless_device(&mut self) -> Result<(), LifecycleError> {
        self.check_can_provision()?;
        //SAFETY: no target
        let provisioned = unsafe { self.build_device(None) }?;
        self.provisioned = Some(provisioned);
        self.state = LifecycleState::DeviceReady;
        Ok(())
    }

    /// # Safety
    /// `target`, if any, must have been created from the current context.
    unsafe fn build_device(
        &self,
        target: Option<vk::SurfaceKHR>,
    ) -> Result<Provisioned, LifecycleError> {
        let context =
            self.context.as_ref().ok_or(LifecycleError::ContextInvalid)?;
        let driver = context.driver();

        //SAFETY: forwarded from the caller
        let candidates: Vec<DeviceCandidate> =
            unsafe { context.enumerate(target) }?;
        if candidates.is_empty() {
            tracing::error!("No physical devices were enumerated");
        }
        let selection = select(
            &candidates,
            target.is_some(),
            self.config.selection_policy,
        )?;

        let mut profiles = self.config.profiles.clone();
        if target.is_none() {
            profiles = profiles.without(Profile::WindowedPresent);
        }
        let request = ProvisionConfig {
            profiles,
            ..self.config.clone()
        }
        .catalog(self.loader.platform_surface_extensions())
        .device_request();

        //SAFETY: selection.candidate was enumerated from this context
        let negotiation =
            unsafe { negotiate(driver, &selection.candidate, &request) }?;
        //SAFETY: roles were assigned from selection.candidate's families
        let device = unsafe {
            provision(
                driver,
                &selection.candidate,
                &selection.roles,
                &negotiation.satisfied,
            )
        }?;
        tracing::info!(
            "Provisioned device {:?} on {:?}",
            device.raw_device(),
            device.name()
        );

        Ok(Provisioned {
            selection,
            negotiation,
            device,
        })
    }

    /// Tear everything down in reverse creation order. Calling it again
    /// is a no-op.
    pub fn terminate(&mut self) {
        if self.state == LifecycleState::TornDown {
            return;
        }
        if let Some(context) = self.context.as_mut() {
            if let Some(provisioned) = self.provisioned.take() {
                //SAFETY: the device was provisioned from this context and is
                //not used after this point
                unsafe { provisioned.device.destroy(context.driver()) };
            }
            if let Some(surface) = self.surface.take() {
                tracing::debug!("Dropping surface {surface:?}");
                //SAFETY: the only object derived from the surface was the
                //device, destroyed above
                unsafe { context.driver().destroy_raw_surface(surface) };
            }
            tracing::debug!("Dropping API context");
            //SAFETY: every device and surface is destroyed above
            unsafe { context.destroy() };
        }
        self.context = None;
        self.state = LifecycleState::TornDown;
    }
}

//! The live API context.

use std::cell::OnceCell;

use ash::vk;

use crate::{
    catalog::CapabilityKind,
    driver::Driver,
    enumerate::{self, DeviceCandidate, EnumerateError},
    negotiate::NegotiationResult,
};

/// A live driver plus what was negotiated to create it.
///
/// The surface-independent half of device enumeration is cached here on
/// first use and never refreshed; presentation support is re-tested on
/// every [`enumerate`](Self::enumerate) call because it depends on the
/// target.
pub struct ApiContext<D: Driver> {
    driver: D,
    instance_capabilities: NegotiationResult,
    candidates: OnceCell<Vec<DeviceCandidate>>,
}

impl<D: Driver> std::fmt::Debug for ApiContext<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiContext")
            .field("live", &self.driver.is_live())
            .field(
                "extensions",
                &self
                    .instance_capabilities
                    .satisfied_names(CapabilityKind::Extension),
            )
            .finish_non_exhaustive()
    }
}

impl<D: Driver> ApiContext<D> {
    pub fn new(driver: D, instance_capabilities: NegotiationResult) -> Self {
        Self {
            driver,
            instance_capabilities,
            candidates: OnceCell::new(),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Instance extensions and layers the context was created with.
    pub fn instance_capabilities(&self) -> &NegotiationResult {
        &self.instance_capabilities
    }

    pub fn is_live(&self) -> bool {
        self.driver.is_live()
    }

    /// Candidates with presentation support tested against `target`.
    ///
    /// # Safety
    /// `target`, if any, must have been created from this context.
    pub unsafe fn enumerate(
        &self,
        target: Option<vk::SurfaceKHR>,
    ) -> Result<Vec<DeviceCandidate>, EnumerateError> {
        let base = match self.candidates.get() {
            Some(base) => base,
            None => {
                let queried = enumerate::query_candidates(&self.driver)?;
                self.candidates.get_or_init(|| queried)
            }
        };
        //SAFETY: forwarded from the caller
        unsafe { enumerate::with_presentation(&self.driver, base, target) }
    }

    /// # Safety
    /// Every device and surface created from this context must already
    /// be destroyed.
    pub unsafe fn destroy(&mut self) {
        //SAFETY: forwarded from the caller
        unsafe { self.driver.destroy() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDevice, FakeDriver, family};
    use ash::vk::Handle;

    #[test]
    fn base_facts_are_cached_and_presentation_is_not() {
        let context = ApiContext::new(
            FakeDriver::new(vec![FakeDevice::discrete(
                "dgpu",
                vec![family(vk::QueueFlags::GRAPHICS, true)],
            )]),
            NegotiationResult::default(),
        );

        // SAFETY: no target.
        let headless = unsafe { context.enumerate(None) }.unwrap();
        assert!(!headless[0].queue_families[0].present);
        let surface = vk::SurfaceKHR::from_raw(0x5);
        // SAFETY: fake surface handles are never dereferenced.
        let windowed = unsafe { context.enumerate(Some(surface)) }.unwrap();
        assert!(windowed[0].queue_families[0].present);
        assert!(context.candidates.get().is_some());
    }

    #[test]
    fn destroyed_context_refuses_enumeration() {
        let mut context = ApiContext::new(
            FakeDriver::new(Vec::new()),
            NegotiationResult::default(),
        );
        // SAFETY: nothing was created from the context.
        unsafe { context.destroy() };
        assert!(!context.is_live());
        // SAFETY: no target.
        assert_eq!(
            unsafe { context.enumerate(None) },
            Err(EnumerateError::ContextInvalid)
        );
    }
}

//! Catalog of compiled-in video backends.
//!
//! The set of variants is decided at build time by cargo features; the
//! registry instance owns the backends and the active slot, so ownership
//! and shutdown order stay explicit instead of hanging off a process-wide
//! global.

use once_cell::sync::Lazy;

use crate::backend::VideoBackend;
use crate::error::VideoError;

type BackendFactory = fn() -> Box<dyn VideoBackend>;

#[cfg(feature = "backend-software")]
fn software_factory() -> Box<dyn VideoBackend> {
    Box::new(crate::soft::SoftwareBackend::new())
}

#[cfg(feature = "backend-null")]
fn null_factory() -> Box<dyn VideoBackend> {
    Box::new(crate::hw::HardwareBackend::new(
        crate::hw::NullDevice::default(),
    ))
}

static COMPILED_BACKENDS: Lazy<Vec<BackendFactory>> = Lazy::new(|| {
    let mut factories: Vec<BackendFactory> = Vec::new();
    #[cfg(feature = "backend-software")]
    factories.push(software_factory as BackendFactory);
    #[cfg(feature = "backend-null")]
    factories.push(null_factory as BackendFactory);
    factories
});

pub struct BackendRegistry {
    backends: Vec<Box<dyn VideoBackend>>,
    active: Option<usize>,
}

impl BackendRegistry {
    /// Instantiate every compiled-in backend variant. No backend is
    /// active until `activate` selects one, and activation never starts
    /// a backend; initialization is a separate lifecycle step.
    pub fn populate() -> Self {
        let backends: Vec<Box<dyn VideoBackend>> =
            COMPILED_BACKENDS.iter().map(|factory| factory()).collect();
        let names: Vec<&str> = backends.iter().map(|b| b.name()).collect();
        log::info!("video backends registered: {names:?}");
        Self {
            backends,
            active: None,
        }
    }

    /// Destroy every registered instance and release the active slot.
    pub fn clear(&mut self) {
        self.active = None;
        self.backends.clear();
    }

    /// Make the backend with this exact identifying name active. On an
    /// unknown name the active slot is left unchanged and the failure is
    /// reported.
    pub fn activate(&mut self, name: &str) -> Result<(), VideoError> {
        match self.backends.iter().position(|b| b.name() == name) {
            Some(index) => {
                self.active = Some(index);
                log::info!(
                    "active video backend: {}",
                    self.backends[index].display_name()
                );
                Ok(())
            }
            None => Err(VideoError::ActivationNotFound(name.to_owned())),
        }
    }

    pub fn active(&self) -> Option<&dyn VideoBackend> {
        self.active.map(|index| self.backends[index].as_ref())
    }

    pub fn active_mut(&mut self) -> Option<&mut (dyn VideoBackend + 'static)> {
        match self.active {
            Some(index) => Some(self.backends[index].as_mut()),
            None => None,
        }
    }

    /// (identifying name, display name) of every registered backend.
    pub fn names(&self) -> Vec<(&'static str, &'static str)> {
        self.backends
            .iter()
            .map(|b| (b.name(), b.display_name()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

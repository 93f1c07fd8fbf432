//! One-shot slots for the default options of controllers and webhooks.
//!
//! Controllers and webhooks read their options when they are added to the
//! [`Manager`][crate::manager::Manager]. The bootstrap sequence writes each slot exactly once
//! before that happens. Afterwards the options are shared read-only with every reconciliation,
//! so no locking is needed beyond the initialization barrier of [`OnceLock`].
use std::sync::OnceLock;

use snafu::Snafu;

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum RegistryError {
    #[snafu(display("default options of {name:?} have already been initialized"))]
    AlreadyInitialized { name: &'static str },

    #[snafu(display(
        "default options of {name:?} were read before they have been initialized"
    ))]
    NotInitialized { name: &'static str },
}

/// A write-once slot holding the default options of the component called `name`.
#[derive(Debug)]
pub struct DefaultOptions<T> {
    name: &'static str,
    value: OnceLock<T>,
}

impl<T> DefaultOptions<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            value: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stores `value`. Fails if the slot was written before.
    pub fn initialize(&self, value: T) -> Result<(), RegistryError> {
        self.value
            .set(value)
            .map_err(|_| RegistryError::AlreadyInitialized { name: self.name })
    }

    /// Returns the stored options. Fails if they have not been written yet.
    pub fn get(&self) -> Result<&T, RegistryError> {
        self.value
            .get()
            .ok_or(RegistryError::NotInitialized { name: self.name })
    }

    pub fn is_initialized(&self) -> bool {
        self.value.get().is_some()
    }
}

use std::sync::Arc;

use clap::{Arg, ArgAction};
use snafu::{ResultExt, Snafu};

use super::{ConfigError, Flags, OptionSet, ParsedFlags};
use crate::{BoxError, manager::Manager};

const DISABLE_CONTROLLERS: &str = "disable-controllers";
const DISABLE_WEBHOOKS: &str = "disable-webhooks";

/// Adds a controller to the [`Manager`], reading its options from the context `C`.
pub type AddToManagerFn<C> = Arc<dyn Fn(&mut Manager, &C) -> Result<(), BoxError> + Send + Sync>;

#[derive(Debug, Snafu)]
#[snafu(display("failed to add controller {name:?} to the manager"))]
pub struct AddControllerError {
    source: BoxError,
    name: String,
}

/// A named, individually disableable entry, for example a controller or a webhook.
pub struct Switch<F> {
    pub name: String,
    pub add: F,
}

impl<F> Switch<F> {
    pub fn new(name: impl Into<String>, add: F) -> Self {
        Self {
            name: name.into(),
            add,
        }
    }
}

/// Creates a [`Switch`] for a controller add function.
pub fn controller_switch<C, Func>(name: impl Into<String>, add: Func) -> Switch<AddToManagerFn<C>>
where
    Func: Fn(&mut Manager, &C) -> Result<(), BoxError> + Send + Sync + 'static,
{
    let add: AddToManagerFn<C> = Arc::new(add);
    Switch::new(name, add)
}

/// A set of switches which can be disabled on the command line.
pub struct SwitchOptions<F> {
    flag: &'static str,
    switches: Vec<Switch<F>>,
}

impl<F> SwitchOptions<F> {
    /// Switches disabled with `--disable-controllers`.
    pub fn controllers(switches: Vec<Switch<F>>) -> Self {
        Self {
            flag: DISABLE_CONTROLLERS,
            switches,
        }
    }

    /// Switches disabled with `--disable-webhooks`.
    pub fn webhooks(switches: Vec<Switch<F>>) -> Self {
        Self {
            flag: DISABLE_WEBHOOKS,
            switches,
        }
    }

    fn names(&self) -> Vec<String> {
        self.switches
            .iter()
            .map(|switch| switch.name.clone())
            .collect()
    }
}

/// The switches which remain enabled, in registration order.
pub struct CompletedSwitches<F> {
    enabled: Vec<Switch<F>>,
}

impl<F> CompletedSwitches<F> {
    pub fn iter(&self) -> impl Iterator<Item = &Switch<F>> {
        self.enabled.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.enabled.iter().map(|switch| switch.name.as_str())
    }
}

impl<C> CompletedSwitches<AddToManagerFn<C>> {
    /// Adds all enabled controllers to the manager.
    pub fn add_to_manager(&self, manager: &mut Manager, context: &C) -> Result<(), AddControllerError> {
        for switch in &self.enabled {
            tracing::debug!(controller = switch.name, "adding controller to manager");
            (switch.add)(manager, context).context(AddControllerSnafu {
                name: switch.name.clone(),
            })?;
        }

        Ok(())
    }
}

impl<F: Clone> OptionSet for SwitchOptions<F> {
    type Completed = CompletedSwitches<F>;

    fn add_flags(&self, flags: &mut Flags) {
        flags.add(
            Arg::new(self.flag)
                .long(self.flag)
                .value_name("NAMES")
                .value_delimiter(',')
                .action(ArgAction::Append)
                .help(format!(
                    "Comma-separated list of names to disable, known names are: {}",
                    self.names().join(", ")
                )),
        );
    }

    fn complete(&self, flags: &ParsedFlags<'_>) -> Result<Self::Completed, ConfigError> {
        let disabled: Vec<String> = flags.get_many(self.flag)?;
        let known = self.names();

        if let Some(unknown) = disabled.iter().find(|name| !known.contains(name)) {
            return Err(ConfigError::UnknownSwitch {
                flag: flags.qualified(self.flag),
                name: unknown.clone(),
                known,
            });
        }

        let enabled = self
            .switches
            .iter()
            .filter(|switch| !disabled.contains(&switch.name))
            .map(|switch| Switch {
                name: switch.name.clone(),
                add: switch.add.clone(),
            })
            .collect();

        Ok(CompletedSwitches { enabled })
    }
}

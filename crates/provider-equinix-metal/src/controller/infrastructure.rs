use std::sync::Arc;

use extension_framework::{
    BoxError,
    controller::{ExtensionControllerArgs, add_extension_controller},
    crd::extensions::Infrastructure,
    manager::Manager,
};

use super::StatusOnlyActuator;
use crate::{TYPE, registry::Registry};

pub const NAME: &str = "infrastructure";

pub fn add_to_manager(manager: &mut Manager, registry: &Registry) -> Result<(), BoxError> {
    let options = registry.infrastructure.get()?;

    add_extension_controller::<Infrastructure>(
        manager,
        ExtensionControllerArgs {
            name: NAME.to_owned(),
            extension_type: TYPE.to_owned(),
            controller: options.controller.clone(),
            ignore_operation_annotation: options.ignore_operation_annotation,
            actuator: Arc::new(StatusOnlyActuator),
        },
    )?;
    Ok(())
}

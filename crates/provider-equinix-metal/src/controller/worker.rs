use std::sync::Arc;

use extension_framework::{
    BoxError,
    controller::{ExtensionControllerArgs, add_extension_controller},
    crd::extensions::Worker,
    manager::Manager,
};

use super::StatusOnlyActuator;
use crate::{TYPE, registry::Registry};

pub const NAME: &str = "worker";

/// Adds the worker controller. Machines are created by the machine-controller-manager, whose CRDs
/// are deployed during bootstrap (see `--worker-deploy-crds`).
pub fn add_to_manager(manager: &mut Manager, registry: &Registry) -> Result<(), BoxError> {
    let options = registry.worker.get()?;

    add_extension_controller::<Worker>(
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

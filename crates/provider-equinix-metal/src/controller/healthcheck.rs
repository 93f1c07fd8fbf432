//! Health checks of the provider components running in the shoot control plane.
use extension_framework::{
    BoxError,
    controller::healthcheck::{DeploymentCheck, HealthCheckArgs, add_health_check_controller},
    crd::extensions::{ControlPlane, Worker},
    manager::Manager,
};

use crate::{TYPE, registry::Registry};

pub const NAME: &str = "healthcheck";

pub const CONTROL_PLANE_HEALTHY: &str = "ControlPlaneHealthy";
pub const SYSTEM_COMPONENTS_HEALTHY: &str = "SystemComponentsHealthy";

pub const CLOUD_CONTROLLER_MANAGER: &str = "cloud-controller-manager";
pub const MACHINE_CONTROLLER_MANAGER: &str = "machine-controller-manager";

pub const CONTROL_PLANE_CHECKS: [DeploymentCheck; 1] = [DeploymentCheck {
    condition_type: CONTROL_PLANE_HEALTHY,
    deployment: CLOUD_CONTROLLER_MANAGER,
}];

pub const WORKER_CHECKS: [DeploymentCheck; 1] = [DeploymentCheck {
    condition_type: SYSTEM_COMPONENTS_HEALTHY,
    deployment: MACHINE_CONTROLLER_MANAGER,
}];

/// Adds one health check controller for control planes and one for workers.
pub fn add_to_manager(manager: &mut Manager, registry: &Registry) -> Result<(), BoxError> {
    let options = registry.health_check.get()?;
    let args = |kind: &str, checks: &[DeploymentCheck]| HealthCheckArgs {
        name: format!("{NAME}-{kind}"),
        extension_type: TYPE.to_owned(),
        controller: options.controller.clone(),
        sync_period: options.health_check.sync_period.into(),
        checks: checks.to_vec(),
    };

    add_health_check_controller::<ControlPlane>(manager, args("controlplane", &CONTROL_PLANE_CHECKS))?;
    add_health_check_controller::<Worker>(manager, args("worker", &WORKER_CHECKS))?;
    Ok(())
}

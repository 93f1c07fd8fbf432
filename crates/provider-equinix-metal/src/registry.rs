//! Default options of the controllers and webhooks of the extension.
//!
//! The bootstrap sequence in [`crate::app`] writes every slot exactly once, the add functions of
//! the controllers and webhooks read them when they are added to the manager.
use extension_framework::{
    cli::ControllerConfig,
    k8s_openapi::api::admissionregistration::v1::MutatingWebhook,
    registry::DefaultOptions,
};

use crate::config::{EtcdStorage, HealthCheckConfig};

/// Options of the infrastructure and the worker controller.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExtensionControllerOptions {
    pub controller: ControllerConfig,
    pub ignore_operation_annotation: bool,
}

/// Options of the control plane controller.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ControlPlaneOptions {
    pub controller: ControllerConfig,
    pub ignore_operation_annotation: bool,

    /// The webhooks deployed into every shoot, known only after the webhooks were registered.
    pub shoot_webhooks: Vec<MutatingWebhook>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct HealthCheckOptions {
    pub controller: ControllerConfig,
    pub health_check: HealthCheckConfig,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ControlPlaneExposureOptions {
    pub etcd_storage: Option<EtcdStorage>,
}

#[derive(Debug)]
pub struct Registry {
    pub infrastructure: DefaultOptions<ExtensionControllerOptions>,
    pub control_plane: DefaultOptions<ControlPlaneOptions>,
    pub worker: DefaultOptions<ExtensionControllerOptions>,
    pub health_check: DefaultOptions<HealthCheckOptions>,
    pub control_plane_exposure: DefaultOptions<ControlPlaneExposureOptions>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            infrastructure: DefaultOptions::new("infrastructure"),
            control_plane: DefaultOptions::new("controlplane"),
            worker: DefaultOptions::new("worker"),
            health_check: DefaultOptions::new("healthcheck"),
            control_plane_exposure: DefaultOptions::new("controlplaneexposure"),
        }
    }
}

//! The `controlplaneexposure` webhook, adjusting control plane components in the seed to the way
//! Equinix Metal exposes them.
use std::sync::Arc;

use extension_framework::{
    BoxError,
    crd::druid::Etcd,
    k8s_openapi::api::apps::v1::Deployment,
    kube::core::ApiResource,
    manager::Manager,
    webhook::{Target, Webhook},
};

use crate::{TYPE, registry::Registry};

mod ensurer;

pub use ensurer::ControlPlaneExposureEnsurer;

pub const NAME: &str = "controlplaneexposure";

/// Creates the webhook from the options in the registry.
pub fn add_to_manager(manager: &Manager, registry: &Registry) -> Result<Webhook, BoxError> {
    let options = registry.control_plane_exposure.get()?;
    tracing::info!(etcd_storage = ?options.etcd_storage, "creating {NAME} webhook");

    let ensurer = ControlPlaneExposureEnsurer::new(
        Arc::new(manager.client().clone()),
        options.etcd_storage.clone(),
    );

    Ok(Webhook::mutating(
        manager,
        NAME,
        TYPE,
        Target::Seed,
        vec![
            ApiResource::erase::<Deployment>(&()),
            ApiResource::erase::<Etcd>(&()),
        ],
        ensurer,
    ))
}

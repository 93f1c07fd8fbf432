//! The extension controllers of the provider.
use extension_framework::{
    BoxError,
    controller::Actuator,
    crd::extensions::Extension,
    kube::{Client, ResourceExt},
};

pub mod controlplane;
pub mod healthcheck;
pub mod infrastructure;
pub mod worker;

/// An actuator which only records the operation.
///
/// Used for the kinds whose cloud resources are managed outside of this extension, the generic
/// reconciler still maintains finalizer and status.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatusOnlyActuator;

#[async_trait::async_trait]
impl<K: Extension> Actuator<K> for StatusOnlyActuator {
    async fn reconcile(&self, _client: &Client, object: &K) -> Result<(), BoxError> {
        tracing::info!(
            kind = %K::kind(&()),
            namespace = object.namespace(),
            name = object.name_any(),
            "reconciled"
        );
        Ok(())
    }

    async fn delete(&self, _client: &Client, object: &K) -> Result<(), BoxError> {
        tracing::info!(
            kind = %K::kind(&()),
            namespace = object.namespace(),
            name = object.name_any(),
            "deleted"
        );
        Ok(())
    }
}

//! The control plane controller.
//!
//! Besides the status bookkeeping, the actuator deploys the shoot webhooks of the extension: they
//! are rendered into a `MutatingWebhookConfiguration`, which is stored in a secret in the control
//! plane namespace and applied to the shoot by the resource manager.
use std::{collections::BTreeMap, sync::Arc};

use extension_framework::{
    BoxError,
    controller::{Actuator, ExtensionControllerArgs, add_extension_controller},
    crd::extensions::ControlPlane,
    k8s_openapi::{
        ByteString,
        api::{
            admissionregistration::v1::{MutatingWebhook, MutatingWebhookConfiguration},
            core::v1::Secret,
        },
        apimachinery::pkg::apis::meta::v1::ObjectMeta,
    },
    kube::{
        Api, Client, ResourceExt,
        api::{DeleteParams, Patch, PatchParams},
    },
    manager::Manager,
};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::{NAME as EXTENSION_NAME, TYPE, registry::Registry};

pub const NAME: &str = "controlplane";

/// Name of the secret holding the shoot webhook configuration.
pub const SHOOT_WEBHOOKS_SECRET: &str = "extension-controlplane-shoot-webhooks";

/// Key of the webhook configuration in [`SHOOT_WEBHOOKS_SECRET`].
pub const SHOOT_WEBHOOKS_KEY: &str = "mutatingwebhookconfiguration.yaml";

const FIELD_MANAGER: &str = "provider-equinix-metal-controlplane";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("control plane {name:?} has no namespace"))]
    MissingNamespace { name: String },

    #[snafu(display("failed to serialize the shoot webhook configuration"))]
    SerializeWebhookConfiguration { source: serde_yaml::Error },

    #[snafu(display("failed to apply secret {namespace}/{SHOOT_WEBHOOKS_SECRET}"))]
    ApplySecret {
        source: extension_framework::kube::Error,
        namespace: String,
    },

    #[snafu(display("failed to delete secret {namespace}/{SHOOT_WEBHOOKS_SECRET}"))]
    DeleteSecret {
        source: extension_framework::kube::Error,
        namespace: String,
    },
}

/// Renders the secret containing the `MutatingWebhookConfiguration` of the shoot webhooks.
pub fn shoot_webhooks_secret(namespace: &str, webhooks: &[MutatingWebhook]) -> Result<Secret, Error> {
    let configuration = MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(format!("gardener-extension-{EXTENSION_NAME}-shoot")),
            ..Default::default()
        },
        webhooks: Some(webhooks.to_vec()),
    };
    let rendered = serde_yaml::to_string(&configuration).context(SerializeWebhookConfigurationSnafu)?;

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(SHOOT_WEBHOOKS_SECRET.to_owned()),
            namespace: Some(namespace.to_owned()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            SHOOT_WEBHOOKS_KEY.to_owned(),
            ByteString(rendered.into_bytes()),
        )])),
        type_: Some("Opaque".to_owned()),
        ..Default::default()
    })
}

struct ControlPlaneActuator {
    shoot_webhooks: Vec<MutatingWebhook>,
}

impl ControlPlaneActuator {
    fn namespace(control_plane: &ControlPlane) -> Result<String, Error> {
        control_plane.namespace().context(MissingNamespaceSnafu {
            name: control_plane.name_any(),
        })
    }
}

#[async_trait::async_trait]
impl Actuator<ControlPlane> for ControlPlaneActuator {
    async fn reconcile(&self, client: &Client, control_plane: &ControlPlane) -> Result<(), BoxError> {
        if self.shoot_webhooks.is_empty() {
            return Ok(());
        }

        let namespace = Self::namespace(control_plane)?;
        let secret = shoot_webhooks_secret(&namespace, &self.shoot_webhooks)?;

        tracing::info!(%namespace, "deploying shoot webhooks");
        Api::<Secret>::namespaced(client.clone(), &namespace)
            .patch(
                SHOOT_WEBHOOKS_SECRET,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&secret),
            )
            .await
            .context(ApplySecretSnafu { namespace })?;
        Ok(())
    }

    async fn delete(&self, client: &Client, control_plane: &ControlPlane) -> Result<(), BoxError> {
        let namespace = Self::namespace(control_plane)?;

        let deleted = Api::<Secret>::namespaced(client.clone(), &namespace)
            .delete(SHOOT_WEBHOOKS_SECRET, &DeleteParams::default())
            .await;
        match deleted {
            Ok(_) => Ok(()),
            Err(extension_framework::kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(source) => Err(Error::DeleteSecret { source, namespace }.into()),
        }
    }
}

pub fn add_to_manager(manager: &mut Manager, registry: &Registry) -> Result<(), BoxError> {
    let options = registry.control_plane.get()?;

    add_extension_controller::<ControlPlane>(
        manager,
        ExtensionControllerArgs {
            name: NAME.to_owned(),
            extension_type: TYPE.to_owned(),
            controller: options.controller.clone(),
            ignore_operation_annotation: options.ignore_operation_annotation,
            actuator: Arc::new(ControlPlaneActuator {
                shoot_webhooks: options.shoot_webhooks.clone(),
            }),
        },
    )?;
    Ok(())
}

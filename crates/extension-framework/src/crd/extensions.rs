//! The extension resources of `extensions.gardener.cloud/v1alpha1` which provider extensions
//! reconcile.
//!
//! The specs only model what is common to all providers, the provider specific parts stay raw
//! JSON in `extra`.
use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{CustomResource, Resource, core::NamespaceResourceScope};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// The annotation telling an extension controller which operation to perform next.
pub const OPERATION_ANNOTATION: &str = "gardener.cloud/operation";
/// Value of [`OPERATION_ANNOTATION`] requesting a reconciliation.
pub const OPERATION_RECONCILE: &str = "reconcile";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, strum::Display)]
pub enum LastOperationType {
    Create,
    Reconcile,
    Delete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, strum::Display)]
pub enum LastOperationState {
    Processing,
    Succeeded,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    #[serde(rename = "type")]
    pub type_: LastOperationType,
    pub state: LastOperationState,
    pub description: String,
    pub last_update_time: Time,

    #[serde(default)]
    pub progress: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, strum::Display)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A Gardener condition, which (other than the Kubernetes one) also tracks the last update.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub last_transition_time: Time,
    pub last_update_time: Time,
    pub reason: String,
    pub message: String,
}

/// Status shared by all extension resources.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<LastOperation>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_status: Option<serde_json::Value>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Common accessors of the extension resources.
pub trait Extension:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + std::fmt::Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
    /// The provider type of the resource, like `equinixmetal`.
    fn extension_type(&self) -> &str;

    fn extension_status(&self) -> Option<&ExtensionStatus>;
}

macro_rules! extension_resource {
    ($(#[$doc:meta])* $spec:ident => $kind:tt, $plural:tt) => {
        $(#[$doc])*
        #[derive(Clone, CustomResource, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
        #[kube(
            group = "extensions.gardener.cloud",
            version = "v1alpha1",
            kind = $kind,
            plural = $plural,
            namespaced,
            status = "ExtensionStatus",
            schema = "disabled"
        )]
        #[serde(rename_all = "camelCase")]
        pub struct $spec {
            #[serde(rename = "type")]
            pub type_: String,

            #[serde(default, skip_serializing_if = "Option::is_none")]
            pub provider_config: Option<serde_json::Value>,

            #[serde(flatten)]
            pub extra: BTreeMap<String, serde_json::Value>,
        }
    };
}

macro_rules! impl_extension {
    ($($kind:ident),+) => {
        $(
            impl Extension for $kind {
                fn extension_type(&self) -> &str {
                    &self.spec.type_
                }

                fn extension_status(&self) -> Option<&ExtensionStatus> {
                    self.status.as_ref()
                }
            }
        )+
    };
}

extension_resource!(
    /// Infrastructure of a shoot cluster, like networks and security groups.
    InfrastructureSpec => "Infrastructure", "infrastructures"
);
extension_resource!(
    /// Provider specific control plane components of a shoot, like the cloud-controller-manager.
    ControlPlaneSpec => "ControlPlane", "controlplanes"
);
extension_resource!(
    /// Worker pools of a shoot, realised as machine deployments.
    WorkerSpec => "Worker", "workers"
);

impl_extension!(Infrastructure, ControlPlane, Worker);

//! The `Etcd` resource of etcd-druid.
use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// Name of the etcd cluster storing the shoot's main data.
pub const ETCD_MAIN: &str = "etcd-main";

/// Name of the etcd cluster storing shoot events.
pub const ETCD_EVENTS: &str = "etcd-events";

/// Spec of an etcd cluster managed by etcd-druid.
///
/// Only the storage fields are modelled, everything else is carried in `extra` so that no field is
/// lost when the object is mutated.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "druid.gardener.cloud",
    version = "v1alpha1",
    kind = "Etcd",
    plural = "etcds",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct EtcdSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_capacity: Option<Quantity>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

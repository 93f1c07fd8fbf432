//! Narrow capabilities on top of [`kube::Client`].
use std::fmt::Debug;

use async_trait::async_trait;
use kube::{Api, Client, Resource, core::NamespaceResourceScope};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::time::Duration;

/// Reads single namespaced objects of kind `K`.
///
/// Mutators only get this capability injected, which keeps them independent of a running API
/// server in tests.
#[async_trait]
pub trait ObjectReader<K>: Send + Sync {
    /// Returns the object, or [`None`] if it does not exist.
    async fn get_opt(&self, namespace: &str, name: &str) -> Result<Option<K>, kube::Error>;
}

#[async_trait]
impl<K> ObjectReader<K> for Client
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug + Send + Sync,
    <K as Resource>::DynamicType: Default,
{
    async fn get_opt(&self, namespace: &str, name: &str) -> Result<Option<K>, kube::Error> {
        Api::<K>::namespaced(self.clone(), namespace).get_opt(name).await
    }
}

/// Timeouts of the connection to the API server, as set in provider configuration files.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClientConnectionConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_timeout: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_timeout: Option<Duration>,
}

impl ClientConnectionConfiguration {
    /// Overrides the timeouts of `config` which are set in this configuration.
    pub fn apply_to(&self, config: &mut kube::Config) {
        if let Some(timeout) = self.connect_timeout {
            config.connect_timeout = Some(timeout.into());
        }
        if let Some(timeout) = self.read_timeout {
            config.read_timeout = Some(timeout.into());
        }
        if let Some(timeout) = self.write_timeout {
            config.write_timeout = Some(timeout.into());
        }
    }
}

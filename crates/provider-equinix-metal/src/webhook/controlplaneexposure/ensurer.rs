use std::sync::Arc;

use extension_framework::{
    client::ObjectReader,
    crd::druid::{ETCD_MAIN, Etcd},
    k8s_openapi::{
        api::{apps::v1::Deployment, core::v1::Service},
        apimachinery::pkg::api::resource::Quantity,
    },
    kube::ResourceExt,
    webhook::{
        EnsureError, Ensurer, MutationContext,
        mutator::{DependencyNotReadySnafu, GetObjectSnafu, InvalidObjectSnafu, KUBE_APISERVER},
        util::{container_with_name_mut, ensure_string_with_prefix},
    },
};
use snafu::{OptionExt, ResultExt};

use crate::config::EtcdStorage;

/// Label set on the kube-apiserver deployment when its exposure is handled by Gardener itself.
pub const APISERVER_EXPOSURE_LABEL: &str = "core.gardener.cloud/apiserver-exposure";
pub const APISERVER_EXPOSURE_MANAGED: &str = "gardener-managed";

const ADVERTISE_ADDRESS_FLAG: &str = "--advertise-address=";
const DEFAULT_ETCD_STORAGE_CAPACITY: &str = "10Gi";

/// Makes the kube-apiserver advertise the address of its load balancer and sizes etcd volumes.
pub struct ControlPlaneExposureEnsurer {
    services: Arc<dyn ObjectReader<Service>>,
    etcd_storage: Option<EtcdStorage>,
}

impl ControlPlaneExposureEnsurer {
    pub fn new(services: Arc<dyn ObjectReader<Service>>, etcd_storage: Option<EtcdStorage>) -> Self {
        Self {
            services,
            etcd_storage,
        }
    }

    /// Returns the IP of the last load balancer ingress of the kube-apiserver service.
    ///
    /// Hostnames are not considered, `--advertise-address` only accepts IPs.
    async fn load_balancer_ip(&self, ctx: &MutationContext, namespace: &str) -> Result<String, EnsureError> {
        let service = ctx
            .run(self.services.get_opt(namespace, KUBE_APISERVER))
            .await?
            .context(GetObjectSnafu {
                kind: "Service",
                namespace,
                name: KUBE_APISERVER,
            })?
            .context(DependencyNotReadySnafu {
                reason: format!("service {namespace}/{KUBE_APISERVER} does not exist yet"),
            })?;

        let ingress = service
            .status
            .and_then(|status| status.load_balancer)
            .and_then(|load_balancer| load_balancer.ingress)
            .unwrap_or_default();
        let last = ingress.last().context(DependencyNotReadySnafu {
            reason: "`.status.loadBalancer.ingress[]` has no elements yet, i.e. external load balancer has not been created",
        })?;

        last.ip
            .clone()
            .filter(|ip| !ip.is_empty())
            .context(DependencyNotReadySnafu {
                reason: "`.status.loadBalancer.ingress[-1]` has no IP address set yet",
            })
    }
}

#[async_trait::async_trait]
impl Ensurer for ControlPlaneExposureEnsurer {
    async fn ensure_kube_apiserver_deployment(
        &self,
        ctx: &MutationContext,
        new: &mut Deployment,
        _old: Option<&Deployment>,
    ) -> Result<(), EnsureError> {
        if new.labels().get(APISERVER_EXPOSURE_LABEL).map(String::as_str) == Some(APISERVER_EXPOSURE_MANAGED) {
            return Ok(());
        }

        let namespace = new.namespace();
        let Some(container) = new
            .spec
            .as_mut()
            .and_then(|spec| spec.template.spec.as_mut())
            .and_then(|pod| container_with_name_mut(&mut pod.containers, KUBE_APISERVER))
        else {
            return Ok(());
        };
        let namespace = namespace.context(InvalidObjectSnafu {
            reason: format!("deployment {KUBE_APISERVER} has no namespace"),
        })?;

        let ip = self.load_balancer_ip(ctx, &namespace).await?;
        tracing::debug!(%namespace, %ip, "setting advertise address of {KUBE_APISERVER}");
        ensure_string_with_prefix(
            container.command.get_or_insert_with(Vec::new),
            ADVERTISE_ADDRESS_FLAG,
            &ip,
        );
        Ok(())
    }

    async fn ensure_etcd(
        &self,
        _ctx: &MutationContext,
        new: &mut Etcd,
        _old: Option<&Etcd>,
    ) -> Result<(), EnsureError> {
        let mut capacity = Quantity(DEFAULT_ETCD_STORAGE_CAPACITY.to_owned());
        let mut class = String::new();

        if new.name_any() == ETCD_MAIN {
            if let Some(storage) = &self.etcd_storage {
                if let Some(configured) = &storage.capacity {
                    capacity = configured.clone();
                }
                if let Some(configured) = &storage.class_name {
                    class = configured.clone();
                }
            }
        }

        new.spec.storage_capacity = Some(capacity);
        new.spec.storage_class = Some(class);
        Ok(())
    }
}

//! Custom resource definitions of the machine-controller-manager (`machine.sapcloud.io`).
//!
//! The worker controller deploys them on startup unless disabled, because the
//! machine-controller-manager of every shoot expects them in the seed.
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionNames, CustomResourceDefinitionSpec,
    CustomResourceDefinitionVersion, CustomResourceSubresourceStatus, CustomResourceSubresources,
    CustomResourceValidation, JSONSchemaProps,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    Api, Client,
    api::{Patch, PatchParams},
    core::{ApiResource, GroupVersionKind},
};
use snafu::{ResultExt, Snafu};

pub const GROUP: &str = "machine.sapcloud.io";
pub const VERSION: &str = "v1alpha1";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to apply CRD {crd_name:?}"))]
    ApplyCrd {
        source: kube::Error,
        crd_name: String,
    },
}

/// A kind served by the machine-controller-manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MachineKind {
    pub kind: &'static str,
    pub plural: &'static str,
    pub short_names: &'static [&'static str],
    pub has_status: bool,
}

pub const MACHINE_KINDS: [MachineKind; 4] = [
    MachineKind {
        kind: "MachineClass",
        plural: "machineclasses",
        short_names: &["machcls"],
        has_status: false,
    },
    MachineKind {
        kind: "MachineDeployment",
        plural: "machinedeployments",
        short_names: &["machdeploy"],
        has_status: true,
    },
    MachineKind {
        kind: "MachineSet",
        plural: "machinesets",
        short_names: &["machset"],
        has_status: true,
    },
    MachineKind {
        kind: "Machine",
        plural: "machines",
        short_names: &["mach"],
        has_status: true,
    },
];

impl MachineKind {
    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(GROUP, VERSION, self.kind)
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk_with_plural(&self.gvk(), self.plural)
    }

    pub fn crd_name(&self) -> String {
        format!("{plural}.{GROUP}", plural = self.plural)
    }

    /// Builds the definition. The schema accepts any object, validation is done by the
    /// machine-controller-manager itself.
    pub fn crd(&self) -> CustomResourceDefinition {
        let schema = JSONSchemaProps {
            type_: Some("object".to_owned()),
            x_kubernetes_preserve_unknown_fields: Some(true),
            ..JSONSchemaProps::default()
        };

        CustomResourceDefinition {
            metadata: ObjectMeta {
                name: Some(self.crd_name()),
                ..ObjectMeta::default()
            },
            spec: CustomResourceDefinitionSpec {
                group: GROUP.to_owned(),
                names: CustomResourceDefinitionNames {
                    kind: self.kind.to_owned(),
                    list_kind: Some(format!("{kind}List", kind = self.kind)),
                    plural: self.plural.to_owned(),
                    singular: Some(self.kind.to_lowercase()),
                    short_names: Some(
                        self.short_names
                            .iter()
                            .map(|name| (*name).to_owned())
                            .collect(),
                    ),
                    ..CustomResourceDefinitionNames::default()
                },
                scope: "Namespaced".to_owned(),
                versions: vec![CustomResourceDefinitionVersion {
                    name: VERSION.to_owned(),
                    served: true,
                    storage: true,
                    schema: Some(CustomResourceValidation {
                        open_api_v3_schema: Some(schema),
                    }),
                    subresources: self.has_status.then(|| CustomResourceSubresources {
                        status: Some(CustomResourceSubresourceStatus(serde_json::json!({}))),
                        ..CustomResourceSubresources::default()
                    }),
                    ..CustomResourceDefinitionVersion::default()
                }],
                ..CustomResourceDefinitionSpec::default()
            },
            status: None,
        }
    }
}

/// Deploys all machine CRDs using server-side apply.
pub async fn apply_machine_crds(client: &Client, field_manager: &str) -> Result<(), Error> {
    let crd_api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let patch_params = PatchParams::apply(field_manager).force();

    for machine_kind in &MACHINE_KINDS {
        let crd = machine_kind.crd();
        let crd_name = machine_kind.crd_name();

        tracing::debug!(k8s.crd.name = crd_name, "applying custom resource definition");
        crd_api
            .patch(&crd_name, &patch_params, &Patch::Apply(&crd))
            .await
            .with_context(|_| ApplyCrdSnafu { crd_name })?;
    }

    tracing::info!(count = MACHINE_KINDS.len(), "machine custom resource definitions applied");
    Ok(())
}

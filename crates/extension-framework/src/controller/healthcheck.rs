//! Periodic health checks of provider components, reported as conditions of extension resources.
use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use k8s_openapi::{
    api::apps::v1::Deployment, apimachinery::pkg::apis::meta::v1::Time, jiff::Timestamp,
};
use kube::{
    Api, Client, ResourceExt,
    api::{Patch, PatchParams},
    runtime::{
        Controller,
        controller::{self, Action},
        watcher,
    },
};
use serde_json::json;
use snafu::{OptionExt, ResultExt, Snafu};

use super::{ERROR_REQUEUE, shutdown};
use crate::{
    cli::ControllerConfig,
    client::ObjectReader,
    crd::extensions::{Condition, ConditionStatus, Extension},
    manager::{self, Manager},
};

/// How often health checks run unless configured otherwise.
pub const DEFAULT_SYNC_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("object {name:?} has no namespace"))]
    MissingNamespace { name: String },

    #[snafu(display("failed to get deployment {namespace}/{name}"))]
    GetDeployment {
        source: kube::Error,
        namespace: String,
        name: String,
    },

    #[snafu(display("failed to update conditions of {name:?}"))]
    UpdateConditions { source: kube::Error, name: String },
}

/// Checks that a deployment in the namespace of the extension resource is healthy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeploymentCheck {
    /// The condition the result is written to, like `ControlPlaneHealthy`.
    pub condition_type: &'static str,
    pub deployment: &'static str,
}

pub struct HealthCheckArgs {
    pub name: String,
    pub extension_type: String,
    pub controller: ControllerConfig,
    pub sync_period: Duration,
    pub checks: Vec<DeploymentCheck>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckResult {
    pub status: ConditionStatus,
    pub reason: &'static str,
    pub message: String,
}

struct Context {
    client: Client,
    reader: Arc<dyn ObjectReader<Deployment>>,
    extension_type: String,
    sync_period: Duration,
    checks: Vec<DeploymentCheck>,
}

/// Adds a controller running `args.checks` for every `K` of the extension type.
pub fn add_health_check_controller<K: Extension>(
    manager: &mut Manager,
    args: HealthCheckArgs,
) -> Result<(), manager::Error> {
    let client = manager.client().clone();
    let ctx = Arc::new(Context {
        reader: Arc::new(client.clone()),
        client,
        extension_type: args.extension_type,
        sync_period: args.sync_period,
        checks: args.checks,
    });
    let concurrency = args.controller.max_concurrent_reconciles;
    let controller_name = args.name.clone();

    manager.add_controller(
        args.name,
        Box::new(move |cancel| {
            Box::pin(async move {
                let api = Api::<K>::all(ctx.client.clone());
                Controller::new(api, watcher::Config::default().any_semantic())
                    .with_config(controller::Config::default().concurrency(concurrency))
                    .graceful_shutdown_on(shutdown(cancel))
                    .run(check::<K>, error_policy::<K>, ctx)
                    .for_each(|result| {
                        if let Err(err) = result {
                            tracing::warn!(
                                controller = controller_name,
                                error = &err as &dyn std::error::Error,
                                "health check failed"
                            );
                        }
                        futures::future::ready(())
                    })
                    .await;
            })
        }),
    )
}

/// Evaluates the health of a deployment, [`None`] meaning it does not exist.
pub fn check_deployment(name: &str, deployment: Option<&Deployment>) -> CheckResult {
    let unhealthy = |reason, message: String| CheckResult {
        status: ConditionStatus::False,
        reason,
        message,
    };

    let Some(deployment) = deployment else {
        return unhealthy(
            "DeploymentMissing",
            format!("Deployment {name:?} does not exist"),
        );
    };
    let Some(status) = &deployment.status else {
        return unhealthy(
            "DeploymentUnhealthy",
            format!("Deployment {name:?} has not been observed yet"),
        );
    };

    if status.observed_generation < deployment.metadata.generation {
        return unhealthy(
            "DeploymentUnhealthy",
            format!("Deployment {name:?} has not observed its latest generation yet"),
        );
    }

    let available = status
        .conditions
        .iter()
        .flatten()
        .any(|condition| condition.type_ == "Available" && condition.status == "True");
    if !available {
        return unhealthy(
            "DeploymentUnhealthy",
            format!("Deployment {name:?} is not available"),
        );
    }

    let desired = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    let updated = status.updated_replicas.unwrap_or_default();
    if updated < desired {
        return unhealthy(
            "DeploymentUnhealthy",
            format!("Deployment {name:?} has {updated}/{desired} updated replicas"),
        );
    }

    CheckResult {
        status: ConditionStatus::True,
        reason: "DeploymentHealthy",
        message: format!("Deployment {name:?} is healthy"),
    }
}

/// Writes `results` into `existing`, keeping unrelated conditions.
///
/// The transition time of a condition only changes together with its status.
pub fn merge_conditions(
    existing: &[Condition],
    results: Vec<(&'static str, CheckResult)>,
    now: &Time,
) -> Vec<Condition> {
    let mut conditions = existing.to_vec();

    for (condition_type, result) in results {
        let last_transition_time = existing
            .iter()
            .find(|condition| condition.type_ == condition_type && condition.status == result.status)
            .map_or_else(|| now.clone(), |condition| condition.last_transition_time.clone());

        let updated = Condition {
            type_: condition_type.to_owned(),
            status: result.status,
            last_transition_time,
            last_update_time: now.clone(),
            reason: result.reason.to_owned(),
            message: result.message,
        };

        match conditions
            .iter_mut()
            .find(|condition| condition.type_ == condition_type)
        {
            Some(condition) => *condition = updated,
            None => conditions.push(updated),
        }
    }

    conditions
}

async fn check<K: Extension>(object: Arc<K>, ctx: Arc<Context>) -> Result<Action, Error> {
    if object.extension_type() != ctx.extension_type || object.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let name = object.name_any();
    let namespace = object
        .namespace()
        .context(MissingNamespaceSnafu { name: &name })?;

    let mut results = Vec::with_capacity(ctx.checks.len());
    for check in &ctx.checks {
        let deployment = ctx
            .reader
            .get_opt(&namespace, check.deployment)
            .await
            .context(GetDeploymentSnafu {
                namespace: &namespace,
                name: check.deployment,
            })?;
        results.push((
            check.condition_type,
            check_deployment(check.deployment, deployment.as_ref()),
        ));
    }

    let existing = object
        .extension_status()
        .map(|status| status.conditions.as_slice())
        .unwrap_or_default();
    let conditions = merge_conditions(existing, results, &Time(Timestamp::now()));

    Api::<K>::namespaced(ctx.client.clone(), &namespace)
        .patch_status(
            &name,
            &PatchParams::default(),
            &Patch::Merge(json!({"status": {"conditions": conditions}})),
        )
        .await
        .context(UpdateConditionsSnafu { name })?;

    Ok(Action::requeue(ctx.sync_period))
}

fn error_policy<K: Extension>(object: Arc<K>, error: &Error, _ctx: Arc<Context>) -> Action {
    tracing::error!(
        namespace = object.namespace(),
        name = object.name_any(),
        error = error as &dyn std::error::Error,
        "health check failed, requeueing"
    );
    Action::requeue(ERROR_REQUEUE)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentSpec, DeploymentStatus};
    use kube::api::ObjectMeta;
    use rstest::rstest;

    use super::*;

    fn deployment(generation: i64, observed: i64, available: &str, updated: i32) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("cloud-controller-manager".to_owned()),
                generation: Some(generation),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(2),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                observed_generation: Some(observed),
                updated_replicas: Some(updated),
                conditions: Some(vec![DeploymentCondition {
                    type_: "Available".to_owned(),
                    status: available.to_owned(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    #[rstest]
    #[case::healthy(Some(deployment(3, 3, "True", 2)), ConditionStatus::True, "DeploymentHealthy")]
    #[case::missing(None, ConditionStatus::False, "DeploymentMissing")]
    #[case::stale_generation(Some(deployment(3, 2, "True", 2)), ConditionStatus::False, "DeploymentUnhealthy")]
    #[case::unavailable(Some(deployment(3, 3, "False", 2)), ConditionStatus::False, "DeploymentUnhealthy")]
    #[case::rolling_out(Some(deployment(3, 3, "True", 1)), ConditionStatus::False, "DeploymentUnhealthy")]
    fn deployment_health(
        #[case] deployment: Option<Deployment>,
        #[case] status: ConditionStatus,
        #[case] reason: &str,
    ) {
        let result = check_deployment("cloud-controller-manager", deployment.as_ref());

        assert_eq!(result.status, status);
        assert_eq!(result.reason, reason);
    }

    #[test]
    fn transition_time_only_changes_with_status() {
        let before = Time("2024-01-01T00:00:00Z".parse().expect("valid timestamp"));
        let now = Time("2024-01-01T00:10:00Z".parse().expect("valid timestamp"));
        let existing = vec![
            Condition {
                type_: "ControlPlaneHealthy".to_owned(),
                status: ConditionStatus::True,
                last_transition_time: before.clone(),
                last_update_time: before.clone(),
                reason: "DeploymentHealthy".to_owned(),
                message: String::new(),
            },
            Condition {
                type_: "SystemComponentsHealthy".to_owned(),
                status: ConditionStatus::True,
                last_transition_time: before.clone(),
                last_update_time: before.clone(),
                reason: "DeploymentHealthy".to_owned(),
                message: String::new(),
            },
        ];

        let healthy = check_deployment("a", Some(&deployment(1, 1, "True", 2)));
        let missing = check_deployment("b", None);
        let merged = merge_conditions(
            &existing,
            vec![("ControlPlaneHealthy", healthy), ("SystemComponentsHealthy", missing)],
            &now,
        );

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].last_transition_time, before);
        assert_eq!(merged[0].last_update_time, now);
        assert_eq!(merged[1].status, ConditionStatus::False);
        assert_eq!(merged[1].last_transition_time, now);
    }

    #[test]
    fn new_conditions_are_appended() {
        let now = Time("2024-01-01T00:00:00Z".parse().expect("valid timestamp"));
        let merged = merge_conditions(
            &[],
            vec![("ControlPlaneHealthy", check_deployment("a", None))],
            &now,
        );

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].type_, "ControlPlaneHealthy");
        assert_eq!(merged[0].reason, "DeploymentMissing");
    }
}

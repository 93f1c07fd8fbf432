//! The generic reconciler of extension resources.
//!
//! Providers implement an [`Actuator`] per extension kind. The reconciler takes care of everything
//! else: filtering by provider type and operation annotation, the finalizer, the `lastOperation`
//! bookkeeping in the status and removing the operation annotation once the actuator succeeded.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, jiff::Timestamp};
use kube::{
    Api, Client, ResourceExt,
    api::{Patch, PatchParams},
    runtime::{
        Controller,
        controller::{self, Action},
        finalizer::{self, finalizer},
        watcher,
    },
};
use serde_json::json;
use snafu::{OptionExt, ResultExt, Snafu};
use tokio_util::sync::CancellationToken;

use crate::{
    BoxError,
    cli::ControllerConfig,
    crd::extensions::{
        Extension, LastOperation, LastOperationState, LastOperationType, OPERATION_ANNOTATION,
        OPERATION_RECONCILE,
    },
    manager::{self, Manager},
};

pub mod healthcheck;

/// Requeue delay after a failed reconciliation.
pub const ERROR_REQUEUE: Duration = Duration::from_secs(15);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("object {name:?} has no namespace"))]
    MissingNamespace { name: String },

    #[snafu(display("actuator failed to {operation} {kind} {name:?}"))]
    Actuate {
        source: BoxError,
        operation: LastOperationType,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to update status of {name:?}"))]
    UpdateStatus { source: kube::Error, name: String },

    #[snafu(display("failed to remove operation annotation from {name:?}"))]
    RemoveOperationAnnotation { source: kube::Error, name: String },

    #[snafu(display("failed to manage finalizer"))]
    Finalizer {
        #[snafu(source(from(finalizer::Error<Error>, Box::new)))]
        source: Box<finalizer::Error<Error>>,
    },
}

/// Provider specific logic of an extension controller.
#[async_trait]
pub trait Actuator<K>: Send + Sync {
    /// Brings the provider side in line with `object`.
    async fn reconcile(&self, client: &Client, object: &K) -> Result<(), BoxError>;

    /// Cleans up everything [`Actuator::reconcile`] created for `object`.
    async fn delete(&self, client: &Client, object: &K) -> Result<(), BoxError>;
}

/// Everything needed to add an extension controller to the [`Manager`].
pub struct ExtensionControllerArgs<K> {
    pub name: String,

    /// Objects of other provider types are ignored.
    pub extension_type: String,
    pub controller: ControllerConfig,
    pub ignore_operation_annotation: bool,
    pub actuator: Arc<dyn Actuator<K>>,
}

struct Context<K> {
    client: Client,
    finalizer: String,
    extension_type: String,
    ignore_operation_annotation: bool,
    actuator: Arc<dyn Actuator<K>>,
}

/// The finalizer extension controllers put on the objects of `extension_type`.
pub fn finalizer_name(extension_type: &str) -> String {
    format!("extensions.gardener.cloud/{extension_type}")
}

/// Adds a controller reconciling `K` with the given actuator.
pub fn add_extension_controller<K: Extension>(
    manager: &mut Manager,
    args: ExtensionControllerArgs<K>,
) -> Result<(), manager::Error> {
    let ExtensionControllerArgs {
        name,
        extension_type,
        controller,
        ignore_operation_annotation,
        actuator,
    } = args;

    let ctx = Arc::new(Context {
        client: manager.client().clone(),
        finalizer: finalizer_name(&extension_type),
        extension_type,
        ignore_operation_annotation,
        actuator,
    });
    let controller_name = name.clone();

    manager.add_controller(
        name,
        Box::new(move |cancel| {
            Box::pin(async move {
                let api = Api::<K>::all(ctx.client.clone());
                Controller::new(api, watcher::Config::default().any_semantic())
                    .with_config(
                        controller::Config::default().concurrency(controller.max_concurrent_reconciles),
                    )
                    .graceful_shutdown_on(shutdown(cancel))
                    .run(reconcile::<K>, error_policy::<K>, ctx)
                    .for_each(|result| {
                        match result {
                            Ok((object, _)) => {
                                tracing::debug!(controller = controller_name, %object, "reconciled");
                            }
                            Err(err) => tracing::warn!(
                                controller = controller_name,
                                error = &err as &dyn std::error::Error,
                                "reconciliation failed"
                            ),
                        }
                        futures::future::ready(())
                    })
                    .await;
                tracing::info!(controller = controller_name, "controller stopped");
            })
        }),
    )
}

pub(crate) async fn shutdown(cancel: CancellationToken) {
    cancel.cancelled().await;
}

/// Whether a change of `object` needs a reconciliation.
///
/// Unless `ignore_operation_annotation` is set, objects are only reconciled when they are being
/// deleted, carry the reconcile operation annotation, have a spec newer than the last observed one
/// or their last operation did not succeed.
pub fn should_reconcile<K: Extension>(object: &K, ignore_operation_annotation: bool) -> bool {
    if ignore_operation_annotation || object.meta().deletion_timestamp.is_some() {
        return true;
    }

    if object
        .annotations()
        .get(OPERATION_ANNOTATION)
        .is_some_and(|operation| operation == OPERATION_RECONCILE)
    {
        return true;
    }

    let Some(status) = object.extension_status() else {
        return true;
    };

    let newer_generation = match (object.meta().generation, status.observed_generation) {
        (Some(generation), Some(observed)) => generation > observed,
        (_, None) => true,
        (None, Some(_)) => false,
    };
    let unsuccessful = status
        .last_operation
        .as_ref()
        .is_none_or(|operation| operation.state != LastOperationState::Succeeded);

    newer_generation || unsuccessful
}

/// The type of the operation an apply of `object` performs.
pub fn operation_type<K: Extension>(object: &K) -> LastOperationType {
    let reconciled_before = object
        .extension_status()
        .and_then(|status| status.last_operation.as_ref())
        .is_some_and(|operation| operation.type_ != LastOperationType::Delete);

    if reconciled_before {
        LastOperationType::Reconcile
    } else {
        LastOperationType::Create
    }
}

fn last_operation(
    type_: LastOperationType,
    state: LastOperationState,
    description: String,
) -> LastOperation {
    LastOperation {
        type_,
        state,
        description,
        last_update_time: Time(Timestamp::now()),
        progress: match state {
            LastOperationState::Succeeded => 100,
            LastOperationState::Processing | LastOperationState::Error => 0,
        },
    }
}

async fn reconcile<K: Extension>(object: Arc<K>, ctx: Arc<Context<K>>) -> Result<Action, Error> {
    if object.extension_type() != ctx.extension_type
        || !should_reconcile(object.as_ref(), ctx.ignore_operation_annotation)
    {
        return Ok(Action::await_change());
    }

    let name = object.name_any();
    let namespace = object
        .namespace()
        .context(MissingNamespaceSnafu { name: &name })?;
    let api = Api::<K>::namespaced(ctx.client.clone(), &namespace);

    tracing::info!(kind = %K::kind(&()), namespace, name, "reconciling extension");
    finalizer(&api, &ctx.finalizer, object, |event| async {
        match event {
            finalizer::Event::Apply(object) => apply(&api, &ctx, &object).await,
            finalizer::Event::Cleanup(object) => cleanup(&api, &ctx, &object).await,
        }
    })
    .await
    .context(FinalizerSnafu)
}

async fn apply<K: Extension>(api: &Api<K>, ctx: &Context<K>, object: &K) -> Result<Action, Error> {
    let operation = operation_type(object);
    let result = actuate(api, ctx, object, operation).await?;

    if object.annotations().contains_key(OPERATION_ANNOTATION) {
        let name = object.name_any();
        let patch = json!({"metadata": {"annotations": {OPERATION_ANNOTATION: null}}});
        api.patch(&name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .context(RemoveOperationAnnotationSnafu { name })?;
    }

    Ok(result)
}

async fn cleanup<K: Extension>(api: &Api<K>, ctx: &Context<K>, object: &K) -> Result<Action, Error> {
    actuate(api, ctx, object, LastOperationType::Delete).await
}

/// Runs the actuator and records the operation in the status of `object`.
async fn actuate<K: Extension>(
    api: &Api<K>,
    ctx: &Context<K>,
    object: &K,
    operation: LastOperationType,
) -> Result<Action, Error> {
    let name = object.name_any();
    let kind = K::kind(&()).into_owned();

    update_status(
        api,
        object,
        last_operation(
            operation,
            LastOperationState::Processing,
            format!("Processing {operation} of {kind}"),
        ),
        false,
    )
    .await?;

    let result = match operation {
        LastOperationType::Delete => ctx.actuator.delete(&ctx.client, object).await,
        LastOperationType::Create | LastOperationType::Reconcile => {
            ctx.actuator.reconcile(&ctx.client, object).await
        }
    };

    match result {
        Ok(()) => {
            update_status(
                api,
                object,
                last_operation(
                    operation,
                    LastOperationState::Succeeded,
                    format!("{kind} has been successfully processed ({operation})"),
                ),
                operation != LastOperationType::Delete,
            )
            .await?;
            Ok(Action::await_change())
        }
        Err(source) => {
            let description = snafu::Report::from_error(source.as_ref()).to_string();
            update_status(
                api,
                object,
                last_operation(operation, LastOperationState::Error, description),
                false,
            )
            .await?;
            Err(Error::Actuate {
                source,
                operation,
                kind,
                name,
            })
        }
    }
}

async fn update_status<K: Extension>(
    api: &Api<K>,
    object: &K,
    last_operation: LastOperation,
    observe_generation: bool,
) -> Result<(), Error> {
    let name = object.name_any();
    let mut status = json!({"lastOperation": last_operation});
    if observe_generation {
        status["observedGeneration"] = json!(object.meta().generation);
    }

    api.patch_status(
        &name,
        &PatchParams::default(),
        &Patch::Merge(json!({"status": status})),
    )
    .await
    .context(UpdateStatusSnafu { name })?;
    Ok(())
}

fn error_policy<K: Extension>(object: Arc<K>, error: &Error, _ctx: Arc<Context<K>>) -> Action {
    tracing::error!(
        kind = %K::kind(&()),
        namespace = object.namespace(),
        name = object.name_any(),
        error = error as &dyn std::error::Error,
        "reconciliation failed, requeueing"
    );
    Action::requeue(ERROR_REQUEUE)
}

#[cfg(test)]
mod tests {
    use indoc::formatdoc;
    use rstest::rstest;

    use super::*;
    use crate::crd::extensions::ControlPlane;

    fn control_plane(extra_metadata: &str, status: &str) -> ControlPlane {
        serde_yaml::from_str(&formatdoc! {"
            apiVersion: extensions.gardener.cloud/v1alpha1
            kind: ControlPlane
            metadata:
              name: control-plane
              namespace: shoot--foo--bar
              generation: 2
            {extra_metadata}
            spec:
              type: equinixmetal
            {status}
        ", extra_metadata = extra_metadata, status = status})
        .expect("control plane must deserialize")
    }

    const SUCCEEDED: &str = "
status:
  observedGeneration: 2
  lastOperation:
    type: Reconcile
    state: Succeeded
    description: done
    lastUpdateTime: 2024-01-01T00:00:00Z";

    const FAILED: &str = "
status:
  observedGeneration: 2
  lastOperation:
    type: Reconcile
    state: Error
    description: boom
    lastUpdateTime: 2024-01-01T00:00:00Z";

    const OUTDATED: &str = "
status:
  observedGeneration: 1
  lastOperation:
    type: Reconcile
    state: Succeeded
    description: done
    lastUpdateTime: 2024-01-01T00:00:00Z";

    const ANNOTATED: &str = "  annotations:
    gardener.cloud/operation: reconcile";

    const DELETING: &str = "  deletionTimestamp: 2024-01-02T00:00:00Z";

    #[rstest]
    #[case::up_to_date("", SUCCEEDED, false)]
    #[case::never_reconciled("", "", true)]
    #[case::failed("", FAILED, true)]
    #[case::outdated("", OUTDATED, true)]
    #[case::annotated(ANNOTATED, SUCCEEDED, true)]
    #[case::deleting(DELETING, SUCCEEDED, true)]
    fn reconciliation_is_gated_by_operation_annotation(
        #[case] extra_metadata: &str,
        #[case] status: &str,
        #[case] expected: bool,
    ) {
        let object = control_plane(extra_metadata, status);

        assert_eq!(should_reconcile(&object, false), expected);
        assert!(should_reconcile(&object, true));
    }

    #[test]
    fn first_apply_is_a_create() {
        assert_eq!(operation_type(&control_plane("", "")), LastOperationType::Create);
        assert_eq!(
            operation_type(&control_plane("", SUCCEEDED)),
            LastOperationType::Reconcile
        );
    }

    #[test]
    fn finalizer_is_named_after_the_provider_type() {
        assert_eq!(
            finalizer_name("equinixmetal"),
            "extensions.gardener.cloud/equinixmetal"
        );
    }

    #[test]
    fn last_operation_progress_follows_state() {
        let succeeded = last_operation(
            LastOperationType::Reconcile,
            LastOperationState::Succeeded,
            String::new(),
        );
        assert_eq!(succeeded.progress, 100);

        let failed = last_operation(
            LastOperationType::Reconcile,
            LastOperationState::Error,
            "boom".to_owned(),
        );
        assert_eq!(failed.progress, 0);
        assert_eq!(failed.description, "boom");
    }
}

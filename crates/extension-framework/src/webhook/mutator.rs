//! The generic mutator for control plane components.
//!
//! Admission requests are dispatched by kind and name to the methods of an [`Ensurer`]. The
//! ensurer edits a typed copy of the object, the difference to the original object is returned to
//! the API server as JSON patch.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    Json,
    routing::{MethodRouter, post},
};
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    Resource,
    api::DynamicObject,
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
};
use serde::{Serialize, de::DeserializeOwned};
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;

use crate::{crd::druid::Etcd, manager::Scheme};

pub const KUBE_APISERVER: &str = "kube-apiserver";
pub const KUBE_CONTROLLER_MANAGER: &str = "kube-controller-manager";
pub const KUBE_SCHEDULER: &str = "kube-scheduler";

/// How long an ensurer may wait for external state before the request fails.
pub const DEFAULT_MUTATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors of [`Ensurer`] methods, returned to the admission caller.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum EnsureError {
    #[snafu(display("dependency not ready: {reason}"))]
    DependencyNotReady { reason: String },

    #[snafu(display("the admission request was cancelled"))]
    Cancelled,

    #[snafu(display("timed out after {timeout:?} while waiting for a dependency"))]
    Timeout { timeout: Duration },

    #[snafu(display("invalid object: {reason}"))]
    InvalidObject { reason: String },

    #[snafu(display("failed to get {kind} {namespace}/{name}"))]
    GetObject {
        source: kube::Error,
        kind: &'static str,
        namespace: String,
        name: String,
    },
}

impl EnsureError {
    /// Whether the caller can expect a later attempt to succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DependencyNotReady { .. } | Self::Timeout { .. } | Self::GetObject { .. }
        )
    }
}

/// Per request state handed to the [`Ensurer`].
#[derive(Clone, Debug)]
pub struct MutationContext {
    cancel: CancellationToken,
    timeout: Duration,
}

impl MutationContext {
    pub fn new(cancel: CancellationToken, timeout: Duration) -> Self {
        Self { cancel, timeout }
    }

    /// Awaits `future`, bounded by the request's cancellation and deadline.
    pub async fn run<F: Future>(&self, future: F) -> Result<F::Output, EnsureError> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => CancelledSnafu.fail(),
            result = tokio::time::timeout(self.timeout, future) => {
                result.map_err(|_| EnsureError::Timeout { timeout: self.timeout })
            }
        }
    }
}

/// Provider specific adjustments of control plane components.
///
/// Every method defaults to leaving the object untouched, so providers only implement what they
/// need. `new` is the object about to be persisted, `old` the currently persisted one (if any).
#[async_trait]
pub trait Ensurer: Send + Sync {
    async fn ensure_kube_apiserver_deployment(
        &self,
        _ctx: &MutationContext,
        _new: &mut Deployment,
        _old: Option<&Deployment>,
    ) -> Result<(), EnsureError> {
        Ok(())
    }

    async fn ensure_kube_controller_manager_deployment(
        &self,
        _ctx: &MutationContext,
        _new: &mut Deployment,
        _old: Option<&Deployment>,
    ) -> Result<(), EnsureError> {
        Ok(())
    }

    async fn ensure_kube_scheduler_deployment(
        &self,
        _ctx: &MutationContext,
        _new: &mut Deployment,
        _old: Option<&Deployment>,
    ) -> Result<(), EnsureError> {
        Ok(())
    }

    async fn ensure_etcd(
        &self,
        _ctx: &MutationContext,
        _new: &mut Etcd,
        _old: Option<&Etcd>,
    ) -> Result<(), EnsureError> {
        Ok(())
    }
}

/// An [`Ensurer`] which never changes anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopEnsurer;

impl Ensurer for NoopEnsurer {}

#[derive(Debug, Snafu)]
pub enum MutateError {
    #[snafu(display("failed to convert object to {kind}"))]
    ConvertObject {
        source: serde_json::Error,
        kind: &'static str,
    },

    #[snafu(display("failed to serialize {kind}"))]
    SerializeObject {
        source: serde_json::Error,
        kind: &'static str,
    },

    #[snafu(display("failed to mutate {kind} {name:?}"))]
    Ensure {
        source: EnsureError,
        kind: &'static str,
        name: String,
    },
}

/// Dispatches admission requests to an [`Ensurer`].
pub struct GenericMutator<E> {
    ensurer: E,
    scheme: Scheme,
}

impl<E: Ensurer> GenericMutator<E> {
    pub fn new(ensurer: E, scheme: Scheme) -> Self {
        Self { ensurer, scheme }
    }

    /// Returns the patch for the object of `request`, or [`None`] if nothing changes.
    ///
    /// Objects of kinds which are not registered in the scheme, requests without object (like
    /// deletions) and unknown names are passed through untouched.
    pub async fn mutate(
        &self,
        ctx: &MutationContext,
        request: &AdmissionRequest<DynamicObject>,
    ) -> Result<Option<json_patch::Patch>, MutateError> {
        let Some(object) = &request.object else {
            return Ok(None);
        };
        if !self.scheme.recognizes(&request.kind) {
            tracing::debug!(kind = request.kind.kind, "ignoring object of unregistered kind");
            return Ok(None);
        }

        let name = object.metadata.name.as_deref().unwrap_or(&request.name);

        if request.kind.group == Deployment::group(&()) && request.kind.kind == Deployment::kind(&()) {
            let mut before: Deployment = convert(object, "Deployment")?;
            default_namespace(&mut before, request);
            let old = request
                .old_object
                .as_ref()
                .map(|old| convert(old, "Deployment"))
                .transpose()?;
            let mut after = before.clone();

            let ensured = match name {
                KUBE_APISERVER => {
                    self.ensurer
                        .ensure_kube_apiserver_deployment(ctx, &mut after, old.as_ref())
                        .await
                }
                KUBE_CONTROLLER_MANAGER => {
                    self.ensurer
                        .ensure_kube_controller_manager_deployment(ctx, &mut after, old.as_ref())
                        .await
                }
                KUBE_SCHEDULER => {
                    self.ensurer
                        .ensure_kube_scheduler_deployment(ctx, &mut after, old.as_ref())
                        .await
                }
                _ => return Ok(None),
            };
            ensured.context(EnsureSnafu {
                kind: "Deployment",
                name,
            })?;

            return diff(&before, &after, "Deployment");
        }

        if request.kind.group == Etcd::group(&()) && request.kind.kind == Etcd::kind(&()) {
            let mut before: Etcd = convert(object, "Etcd")?;
            default_namespace(&mut before, request);
            let old = request
                .old_object
                .as_ref()
                .map(|old| convert(old, "Etcd"))
                .transpose()?;
            let mut after = before.clone();

            self.ensurer
                .ensure_etcd(ctx, &mut after, old.as_ref())
                .await
                .context(EnsureSnafu { kind: "Etcd", name })?;

            return diff(&before, &after, "Etcd");
        }

        Ok(None)
    }
}

/// Objects of CREATE requests may lack their namespace, which is then only set on the request.
fn default_namespace<K: Resource>(object: &mut K, request: &AdmissionRequest<DynamicObject>) {
    let metadata = object.meta_mut();
    if metadata.namespace.is_none() {
        metadata.namespace.clone_from(&request.namespace);
    }
}

fn convert<K: DeserializeOwned>(object: &DynamicObject, kind: &'static str) -> Result<K, MutateError> {
    serde_json::to_value(object)
        .and_then(serde_json::from_value)
        .context(ConvertObjectSnafu { kind })
}

fn diff<K: Serialize>(
    before: &K,
    after: &K,
    kind: &'static str,
) -> Result<Option<json_patch::Patch>, MutateError> {
    let before = serde_json::to_value(before).context(SerializeObjectSnafu { kind })?;
    let after = serde_json::to_value(after).context(SerializeObjectSnafu { kind })?;

    let patch = json_patch::diff(&before, &after);
    Ok((!patch.0.is_empty()).then_some(patch))
}

/// Turns an admission review into the response review.
///
/// Mutation errors deny the request with the full error chain as message.
pub async fn review<E: Ensurer>(
    mutator: &GenericMutator<E>,
    ctx: &MutationContext,
    review: AdmissionReview<DynamicObject>,
) -> AdmissionReview<DynamicObject> {
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(err) => {
            return AdmissionResponse::invalid(format!("failed to convert to request: {err}"))
                .into_review();
        }
    };

    let response = match mutator.mutate(ctx, &request).await {
        Ok(None) => AdmissionResponse::from(&request),
        Ok(Some(patch)) => AdmissionResponse::from(&request)
            .with_patch(patch)
            .unwrap_or_else(|err| {
                AdmissionResponse::from(&request).deny(format!("failed to serialize patch: {err}"))
            }),
        Err(err) => {
            let retryable = matches!(&err, MutateError::Ensure { source, .. } if source.is_retryable());
            let message = snafu::Report::from_error(err).to_string();
            tracing::warn!(
                kind = request.kind.kind,
                namespace = request.namespace.as_deref(),
                name = request.name,
                retryable,
                reason = message,
                "denying admission request"
            );
            AdmissionResponse::from(&request).deny(message)
        }
    };

    response.into_review()
}

/// Builds the axum handler serving admission reviews with `mutator`.
pub fn mutating_handler<E: Ensurer + 'static>(
    mutator: Arc<GenericMutator<E>>,
    cancel: CancellationToken,
    timeout: Duration,
) -> MethodRouter {
    post(
        move |Json(admission_review): Json<AdmissionReview<DynamicObject>>| async move {
            let ctx = MutationContext::new(cancel.child_token(), timeout);
            Json(review(&mutator, &ctx, admission_review).await)
        },
    )
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::{
        apps::v1::DeploymentSpec,
        core::v1::{Container, PodSpec, PodTemplateSpec},
    };
    use kube::core::{GroupVersionKind, admission::Operation};
    use serde_json::json;

    use super::*;

    struct AppendFlag;

    #[async_trait]
    impl Ensurer for AppendFlag {
        async fn ensure_kube_scheduler_deployment(
            &self,
            _ctx: &MutationContext,
            new: &mut Deployment,
            _old: Option<&Deployment>,
        ) -> Result<(), EnsureError> {
            let container = new
                .spec
                .as_mut()
                .and_then(|spec| spec.template.spec.as_mut())
                .and_then(|spec| spec.containers.first_mut())
                .expect("container must exist");
            container
                .command
                .get_or_insert_with(Vec::new)
                .push("--v=2".to_owned());
            Ok(())
        }

        async fn ensure_kube_apiserver_deployment(
            &self,
            _ctx: &MutationContext,
            _new: &mut Deployment,
            _old: Option<&Deployment>,
        ) -> Result<(), EnsureError> {
            DependencyNotReadySnafu {
                reason: "load balancer pending",
            }
            .fail()
        }
    }

    fn deployment(name: &str) -> serde_json::Value {
        serde_json::to_value(Deployment {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some("shoot--foo--bar".to_owned()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: name.to_owned(),
                            command: Some(vec![name.to_owned()]),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            status: None,
        })
        .expect("deployment must serialize")
    }

    fn admission_review(object: serde_json::Value) -> AdmissionReview<DynamicObject> {
        serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "apps", "version": "v1", "kind": "Deployment"},
                "resource": {"group": "apps", "version": "v1", "resource": "deployments"},
                "name": object["metadata"]["name"],
                "namespace": "shoot--foo--bar",
                "operation": "UPDATE",
                "userInfo": {},
                "object": object,
                "oldObject": null,
                "dryRun": false,
            }
        }))
        .expect("admission review must deserialize")
    }

    fn request(object: serde_json::Value) -> AdmissionRequest<DynamicObject> {
        admission_review(object)
            .try_into()
            .expect("review must contain a request")
    }

    fn mutator<E: Ensurer>(ensurer: E) -> GenericMutator<E> {
        let mut scheme = Scheme::default();
        scheme.add::<Deployment>();
        GenericMutator::new(ensurer, scheme)
    }

    fn ctx() -> MutationContext {
        MutationContext::new(CancellationToken::new(), DEFAULT_MUTATION_TIMEOUT)
    }

    #[tokio::test]
    async fn dispatches_by_name_and_returns_patch() {
        let request = request(deployment(KUBE_SCHEDULER));
        assert_eq!(request.operation, Operation::Update);

        let patch = mutator(AppendFlag)
            .mutate(&ctx(), &request)
            .await
            .expect("mutation must succeed")
            .expect("a patch must be returned");

        assert_eq!(
            serde_json::to_value(&patch).expect("patch must serialize"),
            json!([{
                "op": "add",
                "path": "/spec/template/spec/containers/0/command/1",
                "value": "--v=2",
            }])
        );
    }

    #[tokio::test]
    async fn unknown_names_and_noop_ensurers_produce_no_patch() {
        let other = request(deployment("gardener-resource-manager"));
        assert!(mutator(AppendFlag).mutate(&ctx(), &other).await.expect("no error").is_none());

        let scheduler = request(deployment(KUBE_SCHEDULER));
        assert!(mutator(NoopEnsurer).mutate(&ctx(), &scheduler).await.expect("no error").is_none());
    }

    #[tokio::test]
    async fn unregistered_kinds_are_passed_through() {
        let mutator = GenericMutator::new(AppendFlag, Scheme::default());
        let request = request(deployment(KUBE_SCHEDULER));

        assert!(mutator.mutate(&ctx(), &request).await.expect("no error").is_none());
    }

    #[tokio::test]
    async fn ensure_errors_deny_the_request() {
        let admission_review = admission_review(deployment(KUBE_APISERVER));
        let response = review(&mutator(AppendFlag), &ctx(), admission_review).await;
        let response = response.response.expect("response must be set");

        assert!(!response.allowed);
        assert!(response.result.message.contains("load balancer pending"));
    }

    #[test]
    fn read_failures_are_retryable_but_invalid_objects_are_not() {
        let read_failure = EnsureError::GetObject {
            source: kube::Error::Service("connection reset by peer".into()),
            kind: "Service",
            namespace: "shoot--dev--local".to_owned(),
            name: KUBE_APISERVER.to_owned(),
        };
        let invalid = EnsureError::InvalidObject {
            reason: "missing namespace".to_owned(),
        };

        assert!(read_failure.is_retryable());
        assert!(!invalid.is_retryable());
        assert!(!EnsureError::Cancelled.is_retryable());
    }

    #[tokio::test]
    async fn cancelled_context_wins_over_pending_work() {
        let cancel = CancellationToken::new();
        let ctx = MutationContext::new(cancel.clone(), DEFAULT_MUTATION_TIMEOUT);
        cancel.cancel();

        let result = ctx.run(std::future::pending::<()>()).await;
        assert!(matches!(result, Err(EnsureError::Cancelled)));
    }

    #[tokio::test]
    async fn slow_dependencies_time_out() {
        let ctx = MutationContext::new(CancellationToken::new(), Duration::from_millis(10));

        let result = ctx.run(std::future::pending::<()>()).await;
        assert!(matches!(&result, Err(error) if error.is_retryable()));
    }

    #[test]
    fn gvk_of_deployment_matches_request_kind() {
        assert!(mutator(NoopEnsurer)
            .scheme
            .recognizes(&GroupVersionKind::gvk("apps", "v1", "Deployment")));
    }
}

//! The runtime hosting the controllers and the webhook server of an extension.
//!
//! Controllers and webhook handlers are registered while bootstrapping, [`Manager::start`] then
//! runs everything until the cancellation token fires:
//!
//! - the webhook server starts right away and runs on every replica,
//! - controllers only start once this replica is the leader (if leader election is enabled),
//! - losing leadership stops all controllers and fails with [`Error::LeaderElection`].
use std::collections::HashSet;

use axum::{Router, routing::MethodRouter};
use futures::future::{BoxFuture, join_all};
use kube::{Client, Resource, core::GroupVersionKind};
use snafu::{ResultExt, Snafu, ensure};
use tokio_util::sync::CancellationToken;

use crate::{
    cli::{CompletedManagerOptions, LeaderElectionSettings},
    leader_election::{self, LeaderElector},
    webhook::{options::CompletedWebhookServerOptions, server},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: kube::Error },

    #[snafu(display("a webhook handler is already registered for path {path:?}"))]
    DuplicateWebhookPath { path: String },

    #[snafu(display("a controller named {name:?} is already registered"))]
    DuplicateController { name: String },

    #[snafu(display("failed to create webhook server"))]
    CreateWebhookServer { source: server::Error },

    #[snafu(display("failed to run webhook server"))]
    RunWebhookServer { source: server::Error },

    #[snafu(display("leader election failed"))]
    LeaderElection { source: leader_election::Error },
}

/// The kinds known to the [`Manager`]. Webhooks only handle objects of registered kinds.
#[derive(Clone, Debug, Default)]
pub struct Scheme {
    kinds: HashSet<GroupVersionKind>,
}

impl Scheme {
    /// Registers the kind of `K`.
    pub fn add<K>(&mut self) -> &mut Self
    where
        K: Resource<DynamicType = ()>,
    {
        self.add_kind(GroupVersionKind::gvk(
            &K::group(&()),
            &K::version(&()),
            &K::kind(&()),
        ))
    }

    pub fn add_kind(&mut self, gvk: GroupVersionKind) -> &mut Self {
        self.kinds.insert(gvk);
        self
    }

    pub fn recognizes(&self, gvk: &GroupVersionKind) -> bool {
        self.kinds.contains(gvk)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

/// A future running a controller until the given token is cancelled.
pub type ControllerRunner = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send>;

struct RegisteredController {
    name: String,
    run: ControllerRunner,
}

pub struct Manager {
    client: Client,
    leader_election: Option<LeaderElectionSettings>,
    webhook_server: CompletedWebhookServerOptions,
    scheme: Scheme,
    router: Router,
    webhook_paths: Vec<String>,
    controllers: Vec<RegisteredController>,
    shutdown: CancellationToken,
}

impl Manager {
    /// Creates the manager and its client from the (already adjusted) client config.
    pub fn new(
        config: kube::Config,
        options: &CompletedManagerOptions,
        webhook_server: &CompletedWebhookServerOptions,
    ) -> Result<Self, Error> {
        let client = Client::try_from(config).context(CreateClientSnafu)?;
        Ok(Self::from_client(client, options, webhook_server))
    }

    pub fn from_client(
        client: Client,
        options: &CompletedManagerOptions,
        webhook_server: &CompletedWebhookServerOptions,
    ) -> Self {
        Self {
            client,
            leader_election: options.leader_election.clone(),
            webhook_server: webhook_server.clone(),
            scheme: Scheme::default(),
            router: Router::new(),
            webhook_paths: Vec::new(),
            controllers: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn scheme_mut(&mut self) -> &mut Scheme {
        &mut self.scheme
    }

    pub fn webhook_server_options(&self) -> &CompletedWebhookServerOptions {
        &self.webhook_server
    }

    /// A token which is cancelled once [`Manager::start`] is asked to stop.
    ///
    /// Webhook handlers derive the cancellation of in-flight requests from it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serves `handler` on `path` of the webhook server.
    pub fn add_webhook_handler(
        &mut self,
        path: impl Into<String>,
        handler: MethodRouter,
    ) -> Result<(), Error> {
        let path = path.into();
        ensure!(
            !self.webhook_paths.contains(&path),
            DuplicateWebhookPathSnafu { path }
        );

        tracing::debug!(path, "registering webhook handler");
        self.router = std::mem::take(&mut self.router).route(&path, handler);
        self.webhook_paths.push(path);
        Ok(())
    }

    pub fn webhook_paths(&self) -> impl Iterator<Item = &str> {
        self.webhook_paths.iter().map(String::as_str)
    }

    /// Registers a controller which is started once this replica leads.
    pub fn add_controller(&mut self, name: impl Into<String>, run: ControllerRunner) -> Result<(), Error> {
        let name = name.into();
        ensure!(
            self.controllers.iter().all(|controller| controller.name != name),
            DuplicateControllerSnafu { name }
        );

        tracing::debug!(controller = name, "registering controller");
        self.controllers.push(RegisteredController { name, run });
        Ok(())
    }

    /// Names of the registered controllers, in registration order.
    pub fn controller_names(&self) -> impl Iterator<Item = &str> {
        self.controllers
            .iter()
            .map(|controller| controller.name.as_str())
    }

    /// Runs the webhook server and (once leading) all controllers until `cancel` fires.
    ///
    /// Returns after all controllers have drained and the webhook server has stopped.
    pub async fn start(self, cancel: CancellationToken) -> Result<(), Error> {
        let Self {
            client,
            leader_election,
            webhook_server,
            router,
            controllers,
            shutdown,
            ..
        } = self;

        let server = server::WebhookServer::new(&webhook_server, router)
            .await
            .context(CreateWebhookServerSnafu)?;

        let elector = leader_election.map(|settings| {
            let namespace = settings
                .namespace
                .unwrap_or_else(|| client.default_namespace().to_owned());
            LeaderElector::new(client.clone(), &namespace, settings.id)
        });

        let serve = async {
            let result = server.run(cancel.clone()).await;
            if result.is_err() {
                cancel.cancel();
            }
            result.context(RunWebhookServerSnafu)
        };

        let control = async {
            if let Some(elector) = &elector {
                if !elector.acquire(&cancel).await {
                    return Ok(());
                }
            }

            tracing::info!(controllers = controllers.len(), "starting controllers");
            let run_controllers = join_all(controllers.into_iter().map(|controller| {
                tracing::debug!(controller = controller.name, "starting controller");
                (controller.run)(cancel.clone())
            }));

            let hold_leadership = async {
                let result = match &elector {
                    Some(elector) => elector.hold(&cancel).await,
                    None => Ok(()),
                };
                if result.is_err() {
                    cancel.cancel();
                }
                result
            };

            let (_, leadership) = tokio::join!(run_controllers, hold_leadership);
            cancel.cancelled().await;
            leadership.context(LeaderElectionSnafu)
        };

        let propagate_shutdown = async {
            cancel.cancelled().await;
            shutdown.cancel();
        };

        let (served, controlled, ()) = tokio::join!(serve, control, propagate_shutdown);
        tracing::info!("manager stopped");

        controlled?;
        served
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use axum::routing::post;

    use super::*;

    pub(crate) fn test_client() -> Client {
        let mut config = kube::Config::new("https://localhost:6443".parse().expect("valid uri"));
        config.root_cert = Some(Vec::new());
        Client::try_from(config).expect("client must be constructible")
    }

    pub(crate) fn test_manager() -> Manager {
        Manager::from_client(
            test_client(),
            &CompletedManagerOptions {
                leader_election: None,
            },
            &CompletedWebhookServerOptions {
                namespace: Some("extension".to_owned()),
                server_port: 0,
                cert_dir: "/nonexistent".into(),
                service_name: "extension".to_owned(),
            },
        )
    }

    #[tokio::test]
    async fn duplicate_webhook_paths_are_rejected() {
        let mut manager = test_manager();
        manager
            .add_webhook_handler("/webhooks/a", post(|| async { "a" }))
            .expect("first registration must succeed");

        assert!(matches!(
            manager.add_webhook_handler("/webhooks/a", post(|| async { "b" })),
            Err(Error::DuplicateWebhookPath { .. })
        ));
        assert_eq!(manager.webhook_paths().collect::<Vec<_>>(), ["/webhooks/a"]);
    }

    #[tokio::test]
    async fn controllers_keep_registration_order() {
        let mut manager = test_manager();
        for name in ["infrastructure", "worker", "controlplane"] {
            manager
                .add_controller(name, Box::new(|_| Box::pin(async {})))
                .expect("registration must succeed");
        }

        assert!(matches!(
            manager.add_controller("worker", Box::new(|_| Box::pin(async {}))),
            Err(Error::DuplicateController { .. })
        ));
        assert_eq!(
            manager.controller_names().collect::<Vec<_>>(),
            ["infrastructure", "worker", "controlplane"]
        );
    }

    #[test]
    fn scheme_recognizes_registered_kinds() {
        use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service};

        let mut scheme = Scheme::default();
        scheme.add::<Deployment>();

        assert!(scheme.recognizes(&GroupVersionKind::gvk("apps", "v1", "Deployment")));
        assert!(!scheme.recognizes(&GroupVersionKind::gvk(
            &Service::group(&()),
            &Service::version(&()),
            &Service::kind(&()),
        )));
    }

    #[tokio::test]
    async fn start_fails_without_serving_certificate() {
        let manager = test_manager();
        assert!(matches!(
            manager.start(CancellationToken::new()).await,
            Err(Error::CreateWebhookServer { .. })
        ));
    }
}

//! Admission webhooks of an extension.
//!
//! Webhooks are created by factories (one per [`Switch`]), which can be disabled on the command
//! line with `--disable-webhooks`. [`CompletedAddToManagerOptions::add_to_manager`] serves every
//! enabled webhook on the webhook server of the [`Manager`] and renders the webhooks which target
//! shoot clusters, so that the control plane controller can deploy them into the shoot.
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::routing::MethodRouter;
use k8s_openapi::{
    ByteString,
    api::admissionregistration::v1::{MutatingWebhook, RuleWithOperations, WebhookClientConfig},
};
use kube::core::ApiResource;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::{
    BoxError,
    cli::{CompletedSwitches, ConfigError, Flags, OptionSet, ParsedFlags, Switch, SwitchOptions},
    manager::{self, Manager},
};

pub mod mutator;
pub mod options;
pub mod server;
pub mod util;

pub use mutator::{
    EnsureError, Ensurer, GenericMutator, MutationContext, NoopEnsurer, mutating_handler,
};
pub use options::{CompletedWebhookServerOptions, WebhookServerOptions};

/// Timeout the API server of a shoot applies when calling a shoot webhook.
pub const SHOOT_WEBHOOK_TIMEOUT_SECONDS: i32 = 10;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to create webhook {name:?}"))]
    BuildWebhook { source: BoxError, name: String },

    #[snafu(display("failed to register handler of webhook {name:?}"))]
    RegisterHandler {
        source: manager::Error,
        name: String,
    },

    #[snafu(display(
        "shoot webhooks require the namespace of the webhook service, set --webhook-config-namespace"
    ))]
    MissingNamespace,

    #[snafu(display("failed to read CA bundle {path:?}"))]
    ReadCaBundle {
        source: std::io::Error,
        path: PathBuf,
    },
}

/// The cluster whose API server calls a webhook.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Target {
    Seed,
    Shoot,
}

/// A webhook handler together with the metadata needed to register it.
pub struct Webhook {
    pub name: String,
    pub provider: String,
    pub target: Target,

    /// The path the handler is served on, like `/webhooks/controlplaneexposure`.
    pub path: String,

    /// The kinds of objects sent to the webhook.
    pub types: Vec<ApiResource>,
    pub handler: MethodRouter,
}

impl Webhook {
    /// Creates a webhook serving `mutator` on `/webhooks/<name>`.
    ///
    /// In-flight requests are cancelled once the manager shuts down.
    pub fn mutating<E: Ensurer + 'static>(
        manager: &Manager,
        name: impl Into<String>,
        provider: impl Into<String>,
        target: Target,
        types: Vec<ApiResource>,
        ensurer: E,
    ) -> Self {
        let name = name.into();
        let mutator = GenericMutator::new(ensurer, manager.scheme().clone());

        Self {
            path: format!("/webhooks/{name}"),
            name,
            provider: provider.into(),
            target,
            types,
            handler: mutating_handler(
                Arc::new(mutator),
                manager.shutdown_token(),
                mutator::DEFAULT_MUTATION_TIMEOUT,
            ),
        }
    }

    /// The name of the rendered webhook, unique across all extensions.
    pub fn qualified_name(&self) -> String {
        format!(
            "{name}.{provider}.extensions.gardener.cloud",
            name = self.name,
            provider = self.provider
        )
    }
}

/// Creates a webhook, reading its options from the context `C`.
pub type WebhookFactory<C> = Arc<dyn Fn(&Manager, &C) -> Result<Webhook, BoxError> + Send + Sync>;

/// Creates a [`Switch`] for a webhook factory.
pub fn webhook_switch<C, Func>(name: impl Into<String>, factory: Func) -> Switch<WebhookFactory<C>>
where
    Func: Fn(&Manager, &C) -> Result<Webhook, BoxError> + Send + Sync + 'static,
{
    let factory: WebhookFactory<C> = Arc::new(factory);
    Switch::new(name, factory)
}

/// Options of the webhook server and the webhooks it serves.
pub struct AddToManagerOptions<C> {
    pub server: WebhookServerOptions,
    pub switches: SwitchOptions<WebhookFactory<C>>,
}

impl<C> AddToManagerOptions<C> {
    pub fn new(server: WebhookServerOptions, switches: SwitchOptions<WebhookFactory<C>>) -> Self {
        Self { server, switches }
    }
}

pub struct CompletedAddToManagerOptions<C> {
    pub server: CompletedWebhookServerOptions,
    pub switches: CompletedSwitches<WebhookFactory<C>>,
}

/// The outcome of [`CompletedAddToManagerOptions::add_to_manager`].
pub struct RegisteredWebhooks {
    /// All webhooks served by the manager, in registration order.
    pub webhooks: Vec<Webhook>,

    /// The shoot targeted webhooks, to be deployed into every shoot.
    pub shoot_webhooks: Vec<MutatingWebhook>,
}

impl<C> CompletedAddToManagerOptions<C> {
    /// Serves all enabled webhooks and renders the shoot targeted ones.
    pub fn add_to_manager(&self, manager: &mut Manager, context: &C) -> Result<RegisteredWebhooks, Error> {
        let mut webhooks = Vec::new();

        for switch in self.switches.iter() {
            let name = switch.name.clone();
            let webhook = (switch.add)(manager, context).context(BuildWebhookSnafu { name: &name })?;

            tracing::info!(
                webhook = name,
                path = webhook.path,
                target = %webhook.target,
                "adding webhook to manager"
            );
            manager
                .add_webhook_handler(&webhook.path, webhook.handler.clone())
                .context(RegisterHandlerSnafu { name })?;
            webhooks.push(webhook);
        }

        let shoot_webhooks = self.render_shoot_webhooks(&webhooks)?;
        Ok(RegisteredWebhooks {
            webhooks,
            shoot_webhooks,
        })
    }

    fn render_shoot_webhooks(&self, webhooks: &[Webhook]) -> Result<Vec<MutatingWebhook>, Error> {
        let shoot: Vec<_> = webhooks
            .iter()
            .filter(|webhook| webhook.target == Target::Shoot)
            .collect();
        if shoot.is_empty() {
            return Ok(Vec::new());
        }

        let namespace = self.server.namespace.as_deref().context(MissingNamespaceSnafu)?;
        let ca_bundle = read_ca_bundle(&self.server.ca_file())?;

        Ok(shoot
            .into_iter()
            .map(|webhook| {
                let url = format!(
                    "https://{service}.{namespace}:{port}{path}",
                    service = self.server.service_name,
                    port = self.server.server_port,
                    path = webhook.path,
                );
                render_mutating_webhook(webhook, url, ca_bundle.clone())
            })
            .collect())
    }
}

impl<C> OptionSet for AddToManagerOptions<C> {
    type Completed = CompletedAddToManagerOptions<C>;

    fn add_flags(&self, flags: &mut Flags) {
        self.server.add_flags(flags);
        self.switches.add_flags(flags);
    }

    fn complete(&self, flags: &ParsedFlags<'_>) -> Result<Self::Completed, ConfigError> {
        Ok(CompletedAddToManagerOptions {
            server: self.server.complete(flags)?,
            switches: self.switches.complete(flags)?,
        })
    }
}

fn read_ca_bundle(path: &Path) -> Result<Option<ByteString>, Error> {
    match std::fs::read(path) {
        Ok(bundle) => Ok(Some(ByteString(bundle))),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(Error::ReadCaBundle {
            source,
            path: path.to_owned(),
        }),
    }
}

fn render_mutating_webhook(webhook: &Webhook, url: String, ca_bundle: Option<ByteString>) -> MutatingWebhook {
    let rules = webhook
        .types
        .iter()
        .map(|resource| RuleWithOperations {
            api_groups: Some(vec![resource.group.clone()]),
            api_versions: Some(vec![resource.version.clone()]),
            operations: Some(vec!["CREATE".to_owned(), "UPDATE".to_owned()]),
            resources: Some(vec![resource.plural.clone()]),
            ..Default::default()
        })
        .collect();

    MutatingWebhook {
        name: webhook.qualified_name(),
        admission_review_versions: vec!["v1".to_owned()],
        client_config: WebhookClientConfig {
            url: Some(url),
            ca_bundle,
            ..Default::default()
        },
        failure_policy: Some("Fail".to_owned()),
        side_effects: "None".to_owned(),
        rules: Some(rules),
        timeout_seconds: Some(SHOOT_WEBHOOK_TIMEOUT_SECONDS),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use axum::routing::post;
    use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service};

    use super::*;
    use crate::manager::tests::test_manager;

    fn fixed_webhook(name: &'static str, target: Target) -> Switch<WebhookFactory<()>> {
        webhook_switch(name, move |_: &Manager, (): &()| {
            Ok(Webhook {
                name: name.to_owned(),
                provider: "equinixmetal".to_owned(),
                target,
                path: format!("/webhooks/{name}"),
                types: vec![ApiResource::erase::<Deployment>(&())],
                handler: post(|| async { "ok" }),
            })
        })
    }

    fn complete(
        switches: Vec<Switch<WebhookFactory<()>>>,
        server: CompletedWebhookServerOptions,
        args: &[&str],
    ) -> CompletedAddToManagerOptions<()> {
        let options = AddToManagerOptions::new(
            WebhookServerOptions::new(server.service_name.clone()),
            SwitchOptions::webhooks(switches),
        );
        let mut flags = Flags::new("test");
        options.add_flags(&mut flags);
        let parsed = flags
            .try_parse_from(std::iter::once("test").chain(args.iter().copied()))
            .expect("arguments must parse");

        let completed = options.complete(&parsed.view()).expect("options must complete");
        CompletedAddToManagerOptions {
            server,
            switches: completed.switches,
        }
    }

    fn server_options(namespace: Option<&str>, cert_dir: PathBuf) -> CompletedWebhookServerOptions {
        CompletedWebhookServerOptions {
            namespace: namespace.map(ToOwned::to_owned),
            server_port: 443,
            cert_dir,
            service_name: "gardener-extension-provider-equinix-metal".to_owned(),
        }
    }

    #[tokio::test]
    async fn enabled_webhooks_are_served_and_shoot_webhooks_rendered() {
        let cert_dir = tempfile::tempdir().expect("temp dir must be created");
        std::fs::write(cert_dir.path().join("ca.crt"), b"ca-bundle").expect("ca must be written");

        let options = complete(
            vec![
                fixed_webhook("controlplane", Target::Seed),
                fixed_webhook("controlplaneexposure", Target::Shoot),
                fixed_webhook("infrastructure", Target::Seed),
            ],
            server_options(Some("extension-ns"), cert_dir.path().to_owned()),
            &["--disable-webhooks=infrastructure"],
        );

        let mut manager = test_manager();
        let registered = options
            .add_to_manager(&mut manager, &())
            .expect("webhooks must be added");

        assert_eq!(
            manager.webhook_paths().collect::<Vec<_>>(),
            ["/webhooks/controlplane", "/webhooks/controlplaneexposure"]
        );
        assert_eq!(registered.webhooks.len(), 2);

        let [shoot_webhook] = registered.shoot_webhooks.as_slice() else {
            panic!("expected exactly one shoot webhook");
        };
        assert_eq!(
            shoot_webhook.name,
            "controlplaneexposure.equinixmetal.extensions.gardener.cloud"
        );
        assert_eq!(
            shoot_webhook.client_config.url.as_deref(),
            Some(
                "https://gardener-extension-provider-equinix-metal.extension-ns:443/webhooks/controlplaneexposure"
            )
        );
        assert_eq!(
            shoot_webhook.client_config.ca_bundle,
            Some(ByteString(b"ca-bundle".to_vec()))
        );

        let rules = shoot_webhook.rules.as_deref().expect("rules must be set");
        assert_eq!(rules[0].resources, Some(vec!["deployments".to_owned()]));
        assert_eq!(rules[0].api_groups, Some(vec!["apps".to_owned()]));
    }

    #[tokio::test]
    async fn shoot_webhooks_need_the_service_namespace() {
        let options = complete(
            vec![fixed_webhook("controlplaneexposure", Target::Shoot)],
            server_options(None, PathBuf::from("/nonexistent")),
            &[],
        );

        let result = options.add_to_manager(&mut test_manager(), &());
        assert!(matches!(result, Err(Error::MissingNamespace)));
    }

    #[tokio::test]
    async fn seed_webhooks_render_nothing() {
        let options = complete(
            vec![fixed_webhook("controlplane", Target::Seed)],
            server_options(None, PathBuf::from("/nonexistent")),
            &[],
        );

        let registered = options
            .add_to_manager(&mut test_manager(), &())
            .expect("webhooks must be added");
        assert!(registered.shoot_webhooks.is_empty());
    }

    #[tokio::test]
    async fn failing_factories_abort_registration() {
        let failing = webhook_switch("broken", |_: &Manager, (): &()| Err("no client".into()));
        let options = complete(
            vec![failing, fixed_webhook("controlplane", Target::Seed)],
            server_options(None, PathBuf::from("/nonexistent")),
            &[],
        );

        let mut manager = test_manager();
        let result = options.add_to_manager(&mut manager, &());

        assert!(matches!(result, Err(Error::BuildWebhook { name, .. }) if name == "broken"));
        assert_eq!(manager.webhook_paths().count(), 0);
    }

    #[tokio::test]
    async fn mutating_webhooks_are_served_below_webhooks() {
        let manager = test_manager();

        let webhook = Webhook::mutating(
            &manager,
            "controlplaneexposure",
            "equinixmetal",
            Target::Seed,
            vec![ApiResource::erase::<Service>(&())],
            NoopEnsurer,
        );

        assert_eq!(webhook.path, "/webhooks/controlplaneexposure");
        assert_eq!(webhook.target.to_string(), "seed");
    }
}

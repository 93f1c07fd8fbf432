//! The controller manager of the extension.
//!
//! Bootstrapping is strictly sequential and stops at the first failure:
//!
//! 1. parse and complete all option sets,
//! 2. apply the connection settings of the config file to the client config,
//! 3. deploy the machine CRDs (unless disabled with `--worker-deploy-crds=false`),
//! 4. create the [`Manager`] and register the known kinds,
//! 5. write the default options of every controller and webhook into the [`Registry`],
//! 6. add the webhooks, which yields the webhooks to deploy into shoots,
//! 7. hand those to the control plane controller and add all controllers,
//! 8. run the manager until cancelled.
use extension_framework::{
    cli::{
        AddControllerError, AddToManagerFn, CompletedControllerOptions, CompletedManagerOptions,
        CompletedReconcilerOptions, CompletedRestOptions, CompletedSwitches, CompletedWorkerOptions,
        ConfigError, ControllerOptions, Flags, ManagerOptions, OptionAggregator, OptionSet,
        ParsedArguments, Prefixed, ReconcilerOptions, RestConfigError, RestOptions, SwitchOptions,
        WorkerOptions, prefix_option,
    },
    crd::{
        druid::Etcd,
        extensions::{ControlPlane, Infrastructure, Worker},
        machine::{self, MACHINE_KINDS, apply_machine_crds},
    },
    k8s_openapi::api::apps::v1::Deployment,
    kube::Client,
    manager::{self, Manager, Scheme},
    registry::RegistryError,
    telemetry::{CompletedTelemetryOptions, TelemetryOptions},
    webhook::{
        self, AddToManagerOptions, CompletedAddToManagerOptions, WebhookFactory, WebhookServerOptions,
    },
};
use std::{future::Future, time::Duration};

use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;

use crate::{
    NAME,
    cmd::{controller_switch_options, webhook_switch_options},
    config::{CompletedConfigOptions, ConfigOptions},
    registry::{
        ControlPlaneExposureOptions, ControlPlaneOptions, ExtensionControllerOptions, HealthCheckOptions,
        Registry,
    },
    service_name,
};

const FIELD_MANAGER: &str = "provider-equinix-metal-controller-manager";
const DEPLOY_CRDS_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to load the client config"))]
    LoadRestConfig { source: RestConfigError },

    #[snafu(display("failed to create the client for deploying the machine CRDs"))]
    CreateClient {
        source: extension_framework::kube::Error,
    },

    #[snafu(display("failed to deploy the machine CRDs"))]
    ApplyMachineCrds { source: machine::Error },

    #[snafu(display("deploying the machine CRDs did not finish within {timeout:?}"))]
    ApplyMachineCrdsTimeout {
        source: tokio::time::error::Elapsed,
        timeout: Duration,
    },

    #[snafu(display("cancelled while deploying the machine CRDs"))]
    ApplyMachineCrdsCancelled,

    #[snafu(display("failed to create the manager"))]
    CreateManager { source: manager::Error },

    #[snafu(display("failed to propagate the configuration into the default options"))]
    PropagateConfig { source: RegistryError },

    #[snafu(display("failed to add the webhooks to the manager"))]
    AddWebhooks { source: webhook::Error },

    #[snafu(display("failed to add the controllers to the manager"))]
    AddControllers { source: AddControllerError },

    #[snafu(display("failed to run the manager"))]
    RunManager { source: manager::Error },
}

type Members = (
    RestOptions,
    ManagerOptions,
    Prefixed<ControllerOptions>,
    Prefixed<ControllerOptions>,
    Prefixed<OptionAggregator<(ControllerOptions, WorkerOptions)>>,
    Prefixed<ControllerOptions>,
    SwitchOptions<AddToManagerFn<Registry>>,
    ConfigOptions,
    ReconcilerOptions,
    AddToManagerOptions<Registry>,
    TelemetryOptions,
);

type CompletedMembers = (
    CompletedRestOptions,
    CompletedManagerOptions,
    CompletedControllerOptions,
    CompletedControllerOptions,
    (CompletedControllerOptions, CompletedWorkerOptions),
    CompletedControllerOptions,
    CompletedSwitches<AddToManagerFn<Registry>>,
    CompletedConfigOptions,
    CompletedReconcilerOptions,
    CompletedAddToManagerOptions<Registry>,
    CompletedTelemetryOptions,
);

/// All option sets of the controller manager.
pub struct ControllerManagerOptions {
    options: OptionAggregator<Members>,
}

impl Default for ControllerManagerOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerManagerOptions {
    /// The options with all controllers and webhooks of the extension.
    pub fn new() -> Self {
        Self::with_switches(controller_switch_options(), webhook_switch_options())
    }

    pub fn with_switches(
        controllers: SwitchOptions<AddToManagerFn<Registry>>,
        webhooks: SwitchOptions<WebhookFactory<Registry>>,
    ) -> Self {
        let options = OptionAggregator::new((
            RestOptions::default(),
            ManagerOptions::new(NAME),
            prefix_option("controlplane-", ControllerOptions::new(5)),
            prefix_option("infrastructure-", ControllerOptions::new(5)),
            prefix_option(
                "worker-",
                OptionAggregator::new((ControllerOptions::new(5), WorkerOptions::new(true))),
            ),
            prefix_option("healthcheck-", ControllerOptions::new(1)),
            controllers,
            ConfigOptions::default(),
            ReconcilerOptions::default(),
            AddToManagerOptions::new(WebhookServerOptions::new(service_name()), webhooks),
            TelemetryOptions,
        ));

        Self { options }
    }

    /// The command line of the controller manager.
    pub fn flags(&self) -> Flags {
        let mut flags = Flags::new(format!("{NAME}-controller-manager"));
        self.options.add_flags(&mut flags);
        flags
    }

    pub fn complete(&self, arguments: &ParsedArguments) -> Result<CompletedOptions, ConfigError> {
        self.options.complete(&arguments.view()).map(CompletedOptions::from)
    }
}

/// The resolved configuration of the controller manager.
pub struct CompletedOptions {
    pub rest: CompletedRestOptions,
    pub manager: CompletedManagerOptions,
    pub control_plane: CompletedControllerOptions,
    pub infrastructure: CompletedControllerOptions,
    pub worker: CompletedControllerOptions,
    pub worker_reconciler: CompletedWorkerOptions,
    pub health_check: CompletedControllerOptions,
    pub controller_switches: CompletedSwitches<AddToManagerFn<Registry>>,
    pub config: CompletedConfigOptions,
    pub reconciler: CompletedReconcilerOptions,
    pub webhooks: CompletedAddToManagerOptions<Registry>,
    pub telemetry: CompletedTelemetryOptions,
}

impl From<CompletedMembers> for CompletedOptions {
    fn from(
        (
            rest,
            manager,
            control_plane,
            infrastructure,
            (worker, worker_reconciler),
            health_check,
            controller_switches,
            config,
            reconciler,
            webhooks,
            telemetry,
        ): CompletedMembers,
    ) -> Self {
        Self {
            rest,
            manager,
            control_plane,
            infrastructure,
            worker,
            worker_reconciler,
            health_check,
            controller_switches,
            config,
            reconciler,
            webhooks,
            telemetry,
        }
    }
}

/// Runs the controller manager until `cancel` fires.
pub async fn run(options: CompletedOptions, cancel: CancellationToken) -> Result<(), Error> {
    let mut config = options.rest.load().await.context(LoadRestConfigSnafu)?;
    options.config.apply_client_connection(&mut config);

    if options.worker_reconciler.deploy_crds {
        let client = Client::try_from(config.clone()).context(CreateClientSnafu)?;
        deploy_crds(
            &cancel,
            DEPLOY_CRDS_TIMEOUT,
            apply_machine_crds(&client, FIELD_MANAGER),
        )
        .await?;
    }

    let mut manager =
        Manager::new(config, &options.manager, &options.webhooks.server).context(CreateManagerSnafu)?;
    let registry = Registry::default();
    bootstrap(&mut manager, &registry, &options)?;

    tracing::info!("starting manager");
    manager.start(cancel).await.context(RunManagerSnafu)
}

/// Awaits `apply` until it finishes, `timeout` elapses or `cancel` fires.
async fn deploy_crds(
    cancel: &CancellationToken,
    timeout: Duration,
    apply: impl Future<Output = Result<(), machine::Error>>,
) -> Result<(), Error> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => ApplyMachineCrdsCancelledSnafu.fail(),
        result = tokio::time::timeout(timeout, apply) => result
            .context(ApplyMachineCrdsTimeoutSnafu { timeout })?
            .context(ApplyMachineCrdsSnafu),
    }
}

/// Registers everything with the manager, see the module documentation for the order.
pub fn bootstrap(manager: &mut Manager, registry: &Registry, options: &CompletedOptions) -> Result<(), Error> {
    register_kinds(manager.scheme_mut());

    let mut control_plane = propagate_config(registry, options).context(PropagateConfigSnafu)?;

    let registered = options
        .webhooks
        .add_to_manager(manager, registry)
        .context(AddWebhooksSnafu)?;
    control_plane.shoot_webhooks = registered.shoot_webhooks;
    registry
        .control_plane
        .initialize(control_plane)
        .context(PropagateConfigSnafu)?;

    options
        .controller_switches
        .add_to_manager(manager, registry)
        .context(AddControllersSnafu)
}

fn register_kinds(scheme: &mut Scheme) {
    scheme
        .add::<Infrastructure>()
        .add::<ControlPlane>()
        .add::<Worker>()
        .add::<Etcd>()
        .add::<Deployment>();
    for machine_kind in &MACHINE_KINDS {
        scheme.add_kind(machine_kind.gvk());
    }
}

/// Writes all default options except the ones of the control plane controller, which are
/// returned. They are completed once the shoot webhooks are known.
fn propagate_config(registry: &Registry, options: &CompletedOptions) -> Result<ControlPlaneOptions, RegistryError> {
    let mut etcd_storage = None;
    options.config.apply_etcd_storage(&mut etcd_storage);
    registry
        .control_plane_exposure
        .initialize(ControlPlaneExposureOptions { etcd_storage })?;

    let mut health_check = HealthCheckOptions::default();
    options
        .config
        .apply_health_check_config(&mut health_check.health_check);
    options.health_check.apply(&mut health_check.controller);
    registry.health_check.initialize(health_check)?;

    let mut infrastructure = ExtensionControllerOptions::default();
    options.infrastructure.apply(&mut infrastructure.controller);
    options
        .reconciler
        .apply(&mut infrastructure.ignore_operation_annotation);
    registry.infrastructure.initialize(infrastructure)?;

    let mut worker = ExtensionControllerOptions::default();
    options.worker.apply(&mut worker.controller);
    options.reconciler.apply(&mut worker.ignore_operation_annotation);
    registry.worker.initialize(worker)?;

    let mut control_plane = ControlPlaneOptions::default();
    options.control_plane.apply(&mut control_plane.controller);
    options
        .reconciler
        .apply(&mut control_plane.ignore_operation_annotation);
    Ok(control_plane)
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        path::Path,
        sync::{Arc, Mutex},
    };

    use extension_framework::{
        cli::controller_switch,
        k8s_openapi::apimachinery::pkg::api::resource::Quantity,
        kube::core::ApiResource,
        webhook::{NoopEnsurer, Target, Webhook, webhook_switch},
    };
    use indoc::indoc;
    use tempfile::{NamedTempFile, TempDir};

    use super::*;
    use crate::TYPE;

    fn config_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("temp file must be created");
        file.write_all(
            indoc! {"
                apiVersion: equinixmetal.provider.extensions.config.gardener.cloud/v1alpha1
                kind: ControllerConfiguration
                etcd:
                  storage:
                    className: gardener.cloud-fast
                    capacity: 25Gi
                healthCheckConfig:
                  syncPeriod: 1m
            "}
            .as_bytes(),
        )
        .expect("config must be written");
        file
    }

    fn complete(options: &ControllerManagerOptions, config_file: &Path, args: &[&str]) -> CompletedOptions {
        let config_file = format!("--config-file={}", config_file.display());
        let arguments = options
            .flags()
            .try_parse_from(
                ["provider-equinix-metal-controller-manager", config_file.as_str()]
                    .into_iter()
                    .chain(args.iter().copied()),
            )
            .expect("arguments must parse");
        options.complete(&arguments).expect("options must complete")
    }

    fn manager(options: &CompletedOptions) -> Manager {
        let mut config =
            extension_framework::kube::Config::new("https://localhost:6443".parse().expect("valid uri"));
        config.root_cert = Some(Vec::new());
        let client = Client::try_from(config).expect("client must be constructible");
        Manager::from_client(client, &options.manager, &options.webhooks.server)
    }

    #[test]
    fn defaults_and_prefixed_overrides() {
        let file = config_file();
        let options = ControllerManagerOptions::new();
        let completed = complete(
            &options,
            file.path(),
            &[
                "--infrastructure-max-concurrent-reconciles=2",
                "--worker-deploy-crds=false",
                "--leader-election-namespace=garden",
                "--disable-controllers=healthcheck",
            ],
        );

        assert_eq!(completed.control_plane.max_concurrent_reconciles, 5);
        assert_eq!(completed.infrastructure.max_concurrent_reconciles, 2);
        assert_eq!(completed.worker.max_concurrent_reconciles, 5);
        assert_eq!(completed.health_check.max_concurrent_reconciles, 1);
        assert!(!completed.worker_reconciler.deploy_crds);
        assert!(!completed.reconciler.ignore_operation_annotation);

        let leader_election = completed
            .manager
            .leader_election
            .expect("leader election must be enabled by default");
        assert_eq!(leader_election.id, "provider-equinix-metal-leader-election");
        assert_eq!(leader_election.namespace.as_deref(), Some("garden"));

        assert_eq!(
            completed.webhooks.server.service_name,
            "gardener-extension-provider-equinix-metal"
        );
        assert_eq!(
            completed.controller_switches.names().collect::<Vec<_>>(),
            ["controlplane", "infrastructure", "worker"]
        );
        assert_eq!(
            completed.webhooks.switches.names().collect::<Vec<_>>(),
            ["controlplaneexposure"]
        );
    }

    #[test]
    fn missing_config_file_is_rejected() {
        let options = ControllerManagerOptions::new();
        let arguments = options
            .flags()
            .try_parse_from(["provider-equinix-metal-controller-manager"])
            .expect("arguments must parse");

        assert!(matches!(
            options.complete(&arguments),
            Err(ConfigError::MissingFlag { flag }) if flag == "config-file"
        ));
    }

    #[tokio::test]
    async fn bootstrap_adds_every_component() {
        let file = config_file();
        let options = ControllerManagerOptions::new();
        let completed = complete(&options, file.path(), &["--ignore-operation-annotation"]);
        let mut manager = manager(&completed);
        let registry = Registry::default();

        bootstrap(&mut manager, &registry, &completed).expect("bootstrap must succeed");

        assert_eq!(
            manager.controller_names().collect::<Vec<_>>(),
            [
                "controlplane",
                "infrastructure",
                "worker",
                "healthcheck-controlplane",
                "healthcheck-worker",
            ]
        );
        assert_eq!(
            manager.webhook_paths().collect::<Vec<_>>(),
            ["/webhooks/controlplaneexposure"]
        );
        assert_eq!(manager.scheme().len(), 5 + MACHINE_KINDS.len());

        let exposure = registry.control_plane_exposure.get().expect("exposure options must be set");
        assert_eq!(
            exposure
                .etcd_storage
                .as_ref()
                .and_then(|storage| storage.capacity.clone()),
            Some(Quantity("25Gi".to_owned()))
        );

        let health_check = registry.health_check.get().expect("health check options must be set");
        assert_eq!(health_check.controller.max_concurrent_reconciles, 1);
        assert_eq!(
            *health_check.health_check.sync_period,
            std::time::Duration::from_secs(60)
        );

        let control_plane = registry.control_plane.get().expect("control plane options must be set");
        assert_eq!(control_plane.controller.max_concurrent_reconciles, 5);
        assert!(control_plane.ignore_operation_annotation);
        assert!(control_plane.shoot_webhooks.is_empty());

        let worker = registry.worker.get().expect("worker options must be set");
        assert!(worker.ignore_operation_annotation);
    }

    #[tokio::test]
    async fn cancelled_crd_deployment_returns_promptly() {
        let cancel = CancellationToken::new();
        let deployment = deploy_crds(
            &cancel,
            Duration::from_secs(3600),
            std::future::pending(),
        );
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), deployment)
            .await
            .expect("cancellation must end the deployment");

        assert!(matches!(result, Err(Error::ApplyMachineCrdsCancelled)), "{result:?}");
    }

    #[tokio::test]
    async fn stalled_crd_deployment_hits_the_deadline() {
        let result = deploy_crds(
            &CancellationToken::new(),
            Duration::from_millis(10),
            std::future::pending(),
        )
        .await;

        assert!(
            matches!(result, Err(Error::ApplyMachineCrdsTimeout { .. })),
            "{result:?}"
        );
    }

    #[tokio::test]
    async fn finished_crd_deployment_succeeds() {
        let result = deploy_crds(
            &CancellationToken::new(),
            Duration::from_secs(5),
            std::future::ready(Ok(())),
        )
        .await;

        assert!(result.is_ok(), "{result:?}");
    }

    type Events = Arc<Mutex<Vec<String>>>;

    fn record(events: &Events, event: String) {
        events.lock().expect("events lock must not be poisoned").push(event);
    }

    fn recording_controllers(events: &Events) -> SwitchOptions<AddToManagerFn<Registry>> {
        let events = events.clone();
        SwitchOptions::controllers(vec![controller_switch(
            "recorder",
            move |_manager: &mut Manager, registry: &Registry| {
                let control_plane = registry.control_plane.get()?;
                record(
                    &events,
                    format!("controllers shoot_webhooks={}", control_plane.shoot_webhooks.len()),
                );
                Ok(())
            },
        )])
    }

    #[tokio::test]
    async fn shoot_webhooks_reach_the_control_plane_before_controllers_are_added() {
        let events = Events::default();
        let webhook_events = events.clone();
        let webhooks = SwitchOptions::webhooks(vec![webhook_switch(
            "kubelet",
            move |manager: &Manager, registry: &Registry| {
                record(
                    &webhook_events,
                    format!(
                        "webhooks control_plane_initialized={}",
                        registry.control_plane.is_initialized()
                    ),
                );
                Ok(Webhook::mutating(
                    manager,
                    "kubelet",
                    TYPE,
                    Target::Shoot,
                    vec![ApiResource::erase::<Deployment>(&())],
                    NoopEnsurer,
                ))
            },
        )]);

        let file = config_file();
        let cert_dir = TempDir::new().expect("temp dir must be created");
        let cert_dir = format!("--webhook-config-cert-dir={}", cert_dir.path().display());
        let options = ControllerManagerOptions::with_switches(recording_controllers(&events), webhooks);
        let completed = complete(
            &options,
            file.path(),
            &["--webhook-config-namespace=garden", cert_dir.as_str()],
        );
        let mut manager = manager(&completed);
        let registry = Registry::default();

        bootstrap(&mut manager, &registry, &completed).expect("bootstrap must succeed");

        assert_eq!(
            *events.lock().expect("events lock must not be poisoned"),
            [
                "webhooks control_plane_initialized=false",
                "controllers shoot_webhooks=1",
            ]
        );

        let control_plane = registry.control_plane.get().expect("control plane options must be set");
        assert_eq!(control_plane.shoot_webhooks[0].name, "kubelet.equinixmetal.extensions.gardener.cloud");
        assert_eq!(
            control_plane.shoot_webhooks[0].client_config.url.as_deref(),
            Some("https://gardener-extension-provider-equinix-metal.garden:443/webhooks/kubelet")
        );
    }

    #[tokio::test]
    async fn failing_webhook_stops_bootstrap_before_controllers() {
        let events = Events::default();
        let webhooks = SwitchOptions::webhooks(vec![webhook_switch(
            "broken",
            |_manager: &Manager, _registry: &Registry| Err("no certificate".into()),
        )]);

        let file = config_file();
        let options = ControllerManagerOptions::with_switches(recording_controllers(&events), webhooks);
        let completed = complete(&options, file.path(), &[]);
        let mut manager = manager(&completed);
        let registry = Registry::default();

        let result = bootstrap(&mut manager, &registry, &completed);

        assert!(matches!(result, Err(Error::AddWebhooks { .. })), "{result:?}");
        assert!(events.lock().expect("events lock must not be poisoned").is_empty());
        assert!(!registry.control_plane.is_initialized());
        assert_eq!(manager.controller_names().count(), 0);
    }
}

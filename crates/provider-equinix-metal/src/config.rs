//! The configuration file of the controller manager, passed with `--config-file`.
use std::path::PathBuf;

use clap::{Arg, value_parser};
use extension_framework::{
    cli::{ConfigError, Flags, OptionSet, ParsedFlags},
    client::ClientConnectionConfiguration,
    controller::healthcheck,
    k8s_openapi::apimachinery::pkg::api::resource::Quantity,
    time::Duration,
};
use serde::{Deserialize, Serialize};

pub const API_VERSION: &str = "equinixmetal.provider.extensions.config.gardener.cloud/v1alpha1";
pub const KIND: &str = "ControllerConfiguration";

const CONFIG_FILE: &str = "config-file";

/// The contents of the configuration file.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ControllerConfiguration {
    pub api_version: String,
    pub kind: String,

    /// Overrides of the client connection to the seed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_connection: Option<ClientConnectionConfiguration>,

    #[serde(default)]
    pub etcd: EtcdConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_config: Option<HealthCheckConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EtcdConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<EtcdStorage>,
}

/// Storage of the main etcd of shoot control planes.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EtcdStorage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<Quantity>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HealthCheckConfig {
    #[serde(default = "HealthCheckConfig::default_sync_period")]
    pub sync_period: Duration,
}

impl HealthCheckConfig {
    fn default_sync_period() -> Duration {
        healthcheck::DEFAULT_SYNC_PERIOD.into()
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            sync_period: Self::default_sync_period(),
        }
    }
}

/// Reads the configuration file.
#[derive(Debug, Default)]
pub struct ConfigOptions {
    pub config_file: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompletedConfigOptions {
    pub config: ControllerConfiguration,
}

impl CompletedConfigOptions {
    pub fn apply_client_connection(&self, config: &mut extension_framework::kube::Config) {
        if let Some(client_connection) = &self.config.client_connection {
            client_connection.apply_to(config);
        }
    }

    pub fn apply_etcd_storage(&self, storage: &mut Option<EtcdStorage>) {
        storage.clone_from(&self.config.etcd.storage);
    }

    pub fn apply_health_check_config(&self, config: &mut HealthCheckConfig) {
        if let Some(health_check_config) = &self.config.health_check_config {
            config.clone_from(health_check_config);
        }
    }
}

impl OptionSet for ConfigOptions {
    type Completed = CompletedConfigOptions;

    fn add_flags(&self, flags: &mut Flags) {
        let arg = Arg::new(CONFIG_FILE)
            .long(CONFIG_FILE)
            .value_name("FILE")
            .value_parser(value_parser!(PathBuf))
            .help("Path to the configuration file of the controller manager");
        flags.add(match &self.config_file {
            Some(path) => arg.default_value(path.display().to_string()),
            None => arg,
        });
    }

    fn complete(&self, flags: &ParsedFlags<'_>) -> Result<Self::Completed, ConfigError> {
        let path = flags.get_required::<PathBuf>(CONFIG_FILE)?;
        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::ReadConfigFile {
            source,
            path: path.clone(),
        })?;
        let config: ControllerConfiguration = serde_yaml::from_str(&contents)
            .map_err(|source| ConfigError::DeserializeConfigFile {
                source,
                path: path.clone(),
            })?;

        if config.api_version != API_VERSION || config.kind != KIND {
            return Err(ConfigError::InvalidConfigFile {
                path,
                reason: format!(
                    "expected {KIND} of {API_VERSION}, found {kind} of {api_version}",
                    kind = config.kind,
                    api_version = config.api_version,
                ),
            });
        }

        Ok(CompletedConfigOptions { config })
    }
}

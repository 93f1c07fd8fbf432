use std::path::PathBuf;

use clap::{Arg, value_parser};
use hyper::Uri;
use kube::config::{InferConfigError, KubeConfigOptions, Kubeconfig, KubeconfigError};
use snafu::{ResultExt, Snafu};

use super::{ConfigError, Flags, InvalidValueSnafu, OptionSet, ParsedFlags};

const KUBECONFIG: &str = "kubeconfig";
const MASTER: &str = "master";

#[derive(Debug, Snafu)]
pub enum RestConfigError {
    #[snafu(display("failed to read kubeconfig {path:?}"))]
    ReadKubeconfig {
        source: KubeconfigError,
        path: PathBuf,
    },

    #[snafu(display("failed to build client config from kubeconfig {path:?}"))]
    LoadKubeconfig {
        source: KubeconfigError,
        path: PathBuf,
    },

    #[snafu(display("failed to infer client config from the environment"))]
    InferConfig { source: InferConfigError },
}

/// Options for the connection to the Kubernetes API server.
#[derive(Debug, Default)]
pub struct RestOptions {
    pub kubeconfig: Option<PathBuf>,
    pub master_url: Option<String>,
}

/// Where the client config of the [`Manager`][crate::manager::Manager] comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompletedRestOptions {
    /// In-cluster config or the default kubeconfig, whatever is available.
    Inferred,
    Kubeconfig(PathBuf),
    /// Like [`CompletedRestOptions::Inferred`], but talking to the given API server URL.
    Master(Uri),
}

impl CompletedRestOptions {
    /// Loads the client config.
    pub async fn load(&self) -> Result<kube::Config, RestConfigError> {
        match self {
            Self::Inferred => kube::Config::infer().await.context(InferConfigSnafu),
            Self::Kubeconfig(path) => {
                let kubeconfig =
                    Kubeconfig::read_from(path).context(ReadKubeconfigSnafu { path })?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .context(LoadKubeconfigSnafu { path })
            }
            Self::Master(uri) => {
                let mut config = kube::Config::infer().await.context(InferConfigSnafu)?;
                config.cluster_url = uri.clone();
                Ok(config)
            }
        }
    }
}

impl OptionSet for RestOptions {
    type Completed = CompletedRestOptions;

    fn add_flags(&self, flags: &mut Flags) {
        let kubeconfig = Arg::new(KUBECONFIG)
            .long(KUBECONFIG)
            .value_name("FILE")
            .value_parser(value_parser!(PathBuf))
            .help("Path to a kubeconfig, only required if out-of-cluster and not set via KUBECONFIG");
        flags.add(match &self.kubeconfig {
            Some(path) => kubeconfig.default_value(path.display().to_string()),
            None => kubeconfig,
        });

        let master = Arg::new(MASTER)
            .long(MASTER)
            .value_name("URL")
            .help("The address of the Kubernetes API server, overrides any value in kubeconfig");
        flags.add(match &self.master_url {
            Some(url) => master.default_value(url.clone()),
            None => master,
        });
    }

    fn complete(&self, flags: &ParsedFlags<'_>) -> Result<Self::Completed, ConfigError> {
        let kubeconfig = flags.get_one::<PathBuf>(KUBECONFIG)?;
        let master = flags.get_one::<String>(MASTER)?;

        match (kubeconfig, master) {
            (Some(_), Some(_)) => Err(ConfigError::MutuallyExclusive {
                first: flags.qualified(KUBECONFIG),
                second: flags.qualified(MASTER),
            }),
            (Some(path), None) => Ok(CompletedRestOptions::Kubeconfig(path)),
            (None, Some(master)) => {
                let uri = master.parse::<Uri>().map_err(|err| {
                    InvalidValueSnafu {
                        flag: flags.qualified(MASTER),
                        reason: err.to_string(),
                    }
                    .build()
                })?;
                Ok(CompletedRestOptions::Master(uri))
            }
            (None, None) => Ok(CompletedRestOptions::Inferred),
        }
    }
}

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};

use clap::{Arg, value_parser};

use crate::cli::{ConfigError, Flags, OptionSet, ParsedFlags};

const NAMESPACE: &str = "webhook-config-namespace";
const SERVER_PORT: &str = "webhook-config-server-port";
const CERT_DIR: &str = "webhook-config-cert-dir";
const SERVICE_NAME: &str = "webhook-config-service-name";

pub const DEFAULT_SERVER_PORT: u16 = 443;
pub const DEFAULT_CERT_DIR: &str = "/tmp/gardener-extensions-cert";

/// Options of the HTTPS server serving the admission webhooks.
#[derive(Debug)]
pub struct WebhookServerOptions {
    pub server_port: u16,
    pub cert_dir: PathBuf,

    /// Name of the service exposing the webhook server, usually the name of the extension.
    pub service_name: String,
}

impl WebhookServerOptions {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            server_port: DEFAULT_SERVER_PORT,
            cert_dir: PathBuf::from(DEFAULT_CERT_DIR),
            service_name: service_name.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedWebhookServerOptions {
    /// The namespace the extension (and its service) runs in.
    pub namespace: Option<String>,
    pub server_port: u16,

    /// Directory containing `tls.crt`, `tls.key` and optionally `ca.crt`.
    pub cert_dir: PathBuf,
    pub service_name: String,
}

impl CompletedWebhookServerOptions {
    pub const CERT_FILE: &str = "tls.crt";
    pub const KEY_FILE: &str = "tls.key";
    pub const CA_FILE: &str = "ca.crt";

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.server_port)
    }

    pub fn cert_file(&self) -> PathBuf {
        self.cert_dir.join(Self::CERT_FILE)
    }

    pub fn key_file(&self) -> PathBuf {
        self.cert_dir.join(Self::KEY_FILE)
    }

    pub fn ca_file(&self) -> PathBuf {
        self.cert_dir.join(Self::CA_FILE)
    }
}

impl OptionSet for WebhookServerOptions {
    type Completed = CompletedWebhookServerOptions;

    fn add_flags(&self, flags: &mut Flags) {
        flags.add(
            Arg::new(NAMESPACE)
                .long(NAMESPACE)
                .env("WEBHOOK_CONFIG_NAMESPACE")
                .help("The namespace the webhook service is deployed in"),
        );
        flags.add(
            Arg::new(SERVER_PORT)
                .long(SERVER_PORT)
                .value_parser(value_parser!(u16))
                .default_value(self.server_port.to_string())
                .help("The port the webhook server listens on"),
        );
        flags.add(
            Arg::new(CERT_DIR)
                .long(CERT_DIR)
                .value_name("DIRECTORY")
                .value_parser(value_parser!(PathBuf))
                .default_value(self.cert_dir.display().to_string())
                .help("The directory containing the serving certificate (tls.crt) and key (tls.key)"),
        );
        flags.add(
            Arg::new(SERVICE_NAME)
                .long(SERVICE_NAME)
                .default_value(self.service_name.clone())
                .help("The name of the service exposing the webhook server"),
        );
    }

    fn complete(&self, flags: &ParsedFlags<'_>) -> Result<Self::Completed, ConfigError> {
        Ok(CompletedWebhookServerOptions {
            namespace: flags
                .get_one::<String>(NAMESPACE)?
                .filter(|namespace| !namespace.is_empty()),
            server_port: flags.get_one(SERVER_PORT)?.unwrap_or(self.server_port),
            cert_dir: flags
                .get_one(CERT_DIR)?
                .unwrap_or_else(|| self.cert_dir.clone()),
            service_name: flags
                .get_one(SERVICE_NAME)?
                .unwrap_or_else(|| self.service_name.clone()),
        })
    }
}

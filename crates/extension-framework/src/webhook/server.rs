//! The HTTPS server admission webhooks are served by.
//!
//! TLS connections are terminated by [`tokio_rustls`], each connection is then handed to a hyper
//! connection builder which drives the axum [`Router`].
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::{Router, extract::Request, routing::get};
use hyper::{body::Incoming, service::service_fn};
use hyper_util::rt::{TokioExecutor, TokioIo};
use snafu::{ResultExt, Snafu};
use tokio::net::TcpListener;
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ServerConfig,
        crypto::ring::default_provider,
        pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject},
        version::{TLS12, TLS13},
    },
};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::Instrument;

use super::options::CompletedWebhookServerOptions;

pub const HEALTH_PATH: &str = "/healthz";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read {path:?}"))]
    ReadPemFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse PEM file {path:?}"))]
    ParsePemFile {
        source: tokio_rustls::rustls::pki_types::pem::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to set safe TLS protocol versions"))]
    SetSafeTlsProtocolVersions { source: tokio_rustls::rustls::Error },

    #[snafu(display("failed to use the serving certificate"))]
    UseCertificate { source: tokio_rustls::rustls::Error },

    #[snafu(display("failed to create TCP listener by binding to socket address {socket_addr:?}"))]
    BindTcpListener {
        source: std::io::Error,
        socket_addr: SocketAddr,
    },
}

/// A server which terminates TLS connections and passes the requests to an axum [`Router`].
pub struct WebhookServer {
    config: ServerConfig,
    socket_addr: SocketAddr,
    router: Router,
}

impl WebhookServer {
    /// Loads the serving certificate from the cert dir and prepares the server.
    ///
    /// A `GET /healthz` route is added to `router`.
    pub async fn new(options: &CompletedWebhookServerOptions, router: Router) -> Result<Self, Error> {
        let cert_path = options.cert_file();
        let key_path = options.key_file();

        let cert_pem = read_pem_file(&cert_path).await?;
        let certs = CertificateDer::pem_slice_iter(&cert_pem)
            .collect::<Result<Vec<_>, _>>()
            .context(ParsePemFileSnafu { path: &cert_path })?;
        let key_pem = read_pem_file(&key_path).await?;
        let key = PrivateKeyDer::from_pem_slice(&key_pem)
            .context(ParsePemFileSnafu { path: &key_path })?;

        let mut config = ServerConfig::builder_with_provider(default_provider().into())
            .with_protocol_versions(&[&TLS12, &TLS13])
            .context(SetSafeTlsProtocolVersionsSnafu)?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context(UseCertificateSnafu)?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(Self {
            config,
            socket_addr: options.socket_addr(),
            router: router.route(HEALTH_PATH, get(|| async { "ok" })),
        })
    }

    /// Accepts connections until `cancel` fires. Connections already accepted are served to
    /// completion in their own tasks.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), Error> {
        let tls_acceptor = TlsAcceptor::from(Arc::new(self.config));
        let tcp_listener = TcpListener::bind(self.socket_addr)
            .await
            .context(BindTcpListenerSnafu {
                socket_addr: self.socket_addr,
            })?;

        tracing::info!(socket_addr = %self.socket_addr, "webhook server listening");

        loop {
            let (tcp_stream, remote_addr) = tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("stopping webhook server");
                    return Ok(());
                }
                accepted = tcp_listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::trace!(%err, "failed to accept incoming TCP connection");
                        continue;
                    }
                },
            };

            let tls_acceptor = tls_acceptor.clone();
            let router = self.router.clone();
            let span = tracing::debug_span!("serve connection", %remote_addr);

            tokio::spawn(
                async move {
                    let tls_stream = match tls_acceptor.accept(tcp_stream).await {
                        Ok(tls_stream) => tls_stream,
                        Err(err) => {
                            tracing::trace!(%err, "error during tls handshake");
                            return;
                        }
                    };

                    // Hyper has its own IO and service traits, TokioIo and service_fn bridge them
                    // to tokio and tower.
                    let tls_stream = TokioIo::new(tls_stream);
                    let hyper_service = service_fn(move |request: Request<Incoming>| {
                        router.clone().oneshot(request)
                    });

                    if let Err(err) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection_with_upgrades(tls_stream, hyper_service)
                        .await
                    {
                        tracing::warn!(%err, "failed to serve connection");
                    }
                }
                .instrument(span),
            );
        }
    }
}

async fn read_pem_file(path: &Path) -> Result<Vec<u8>, Error> {
    tokio::fs::read(path).await.context(ReadPemFileSnafu { path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_certificate_is_reported_with_path() {
        let cert_dir = tempfile::tempdir().expect("temporary directory");
        let options = CompletedWebhookServerOptions {
            namespace: None,
            server_port: 0,
            cert_dir: cert_dir.path().to_path_buf(),
            service_name: "test".to_owned(),
        };

        match WebhookServer::new(&options, Router::new()).await {
            Err(Error::ReadPemFile { path, .. }) => assert_eq!(path, options.cert_file()),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("server must not start without a certificate"),
        }
    }

    #[tokio::test]
    async fn garbage_key_is_rejected() {
        let cert_dir = tempfile::tempdir().expect("temporary directory");
        std::fs::write(cert_dir.path().join("tls.crt"), "").expect("write certificate");
        std::fs::write(cert_dir.path().join("tls.key"), "not a key").expect("write key");
        let options = CompletedWebhookServerOptions {
            namespace: None,
            server_port: 0,
            cert_dir: cert_dir.path().to_path_buf(),
            service_name: "test".to_owned(),
        };

        assert!(matches!(
            WebhookServer::new(&options, Router::new()).await,
            Err(Error::ParsePemFile { .. })
        ));
    }
}

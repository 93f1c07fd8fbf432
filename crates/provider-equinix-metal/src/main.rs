use extension_framework::{cli::ConfigError, telemetry::Tracing};
use provider_equinix_metal::{
    NAME,
    app::{self, ControllerManagerOptions},
};
use snafu::{ResultExt, Snafu};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to complete the command line options"))]
    CompleteOptions { source: ConfigError },

    #[snafu(display("failed to initialize tracing"))]
    InitTracing {
        source: extension_framework::telemetry::Error,
    },

    #[snafu(display("failed to register signal handlers"))]
    RegisterSignalHandlers { source: std::io::Error },

    #[snafu(display("controller manager failed"))]
    Run { source: app::Error },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    let options = ControllerManagerOptions::new();
    let arguments = options.flags().parse();
    let completed = options.complete(&arguments).context(CompleteOptionsSnafu)?;

    let _tracing = Tracing::pre_configured(NAME, completed.telemetry.clone())
        .init()
        .context(InitTracingSnafu)?;

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone()).context(RegisterSignalHandlersSnafu)?;

    tracing::info!(
        controllers = ?completed.controller_switches.names().collect::<Vec<_>>(),
        webhooks = ?completed.webhooks.switches.names().collect::<Vec<_>>(),
        "starting {NAME} controller manager"
    );
    app::run(completed, cancel).await.context(RunSnafu)
}

/// Cancels `cancel` on the first SIGINT or SIGTERM.
fn cancel_on_signal(cancel: CancellationToken) -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        }
        cancel.cancel();
    });
    Ok(())
}

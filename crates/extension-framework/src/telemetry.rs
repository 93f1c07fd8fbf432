//! Initialises the tracing subscribers for console and (optionally) rolling file output.
//!
//! ```no_run
//! use extension_framework::telemetry::{CompletedTelemetryOptions, Tracing};
//!
//! let _tracing_guard = Tracing::pre_configured(
//!     "equinix-metal-controller-manager",
//!     CompletedTelemetryOptions::default(),
//! )
//! .init()
//! .unwrap();
//! ```
use std::path::PathBuf;

use clap::{Arg, ArgAction, value_parser};
use snafu::{ResultExt as _, Snafu};
use tracing::{level_filters::LevelFilter, subscriber::SetGlobalDefaultError};
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, Registry, filter::Directive, layer::SubscriberExt};

use crate::cli::{ConfigError, Flags, InvalidValueSnafu, OptionSet, ParsedFlags};

const CONSOLE_LOG_DISABLED: &str = "console-log-disabled";
const FILE_LOG_DIRECTORY: &str = "file-log-directory";
const FILE_LOG_ROTATION_PERIOD: &str = "file-log-rotation-period";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to initialize rolling file appender"))]
    InitRollingFileAppender { source: InitError },

    #[snafu(display("unable to set the global default subscriber"))]
    SetGlobalDefaultSubscriber { source: SetGlobalDefaultError },
}

/// Supported periods when the log file is rolled over.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "PascalCase", ascii_case_insensitive)]
pub enum RotationPeriod {
    Minutely,
    Hourly,
    Daily,

    #[default]
    Never,
}

impl From<RotationPeriod> for Rotation {
    fn from(value: RotationPeriod) -> Self {
        match value {
            RotationPeriod::Minutely => Self::MINUTELY,
            RotationPeriod::Hourly => Self::HOURLY,
            RotationPeriod::Daily => Self::DAILY,
            RotationPeriod::Never => Self::NEVER,
        }
    }
}

/// Logging flags. Levels are set through the `CONSOLE_LOG_LEVEL` and `FILE_LOG_LEVEL`
/// environment variables.
#[derive(Debug, Default)]
pub struct TelemetryOptions;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompletedTelemetryOptions {
    pub console_log_disabled: bool,
    pub file_log_directory: Option<PathBuf>,
    pub file_log_rotation_period: RotationPeriod,
}

impl OptionSet for TelemetryOptions {
    type Completed = CompletedTelemetryOptions;

    fn add_flags(&self, flags: &mut Flags) {
        flags.add(
            Arg::new(CONSOLE_LOG_DISABLED)
                .long(CONSOLE_LOG_DISABLED)
                .env("CONSOLE_LOG_DISABLED")
                .action(ArgAction::SetTrue)
                .help("Disable console logs"),
        );
        flags.add(
            Arg::new(FILE_LOG_DIRECTORY)
                .long(FILE_LOG_DIRECTORY)
                .env("FILE_LOG_DIRECTORY")
                .value_name("DIRECTORY")
                .value_parser(value_parser!(PathBuf))
                .help("Enable logging to files located in the specified DIRECTORY"),
        );
        flags.add(
            Arg::new(FILE_LOG_ROTATION_PERIOD)
                .long(FILE_LOG_ROTATION_PERIOD)
                .env("FILE_LOG_ROTATION_PERIOD")
                .value_name("PERIOD")
                .help("Time PERIOD after which log files are rolled over [Minutely, Hourly, Daily, Never]"),
        );
    }

    fn complete(&self, flags: &ParsedFlags<'_>) -> Result<Self::Completed, ConfigError> {
        let file_log_directory = flags.get_one::<PathBuf>(FILE_LOG_DIRECTORY)?;
        let file_log_rotation_period = match flags.get_one::<String>(FILE_LOG_ROTATION_PERIOD)? {
            Some(period) => period.parse().map_err(|_| {
                InvalidValueSnafu {
                    flag: flags.qualified(FILE_LOG_ROTATION_PERIOD),
                    reason: format!("unknown rotation period {period:?}"),
                }
                .build()
            })?,
            None => RotationPeriod::default(),
        };

        Ok(CompletedTelemetryOptions {
            console_log_disabled: flags.get_one(CONSOLE_LOG_DISABLED)?.unwrap_or_default(),
            file_log_directory,
            file_log_rotation_period,
        })
    }
}

/// The set of configured subscribers. They stay installed for the lifetime of the process, the
/// guard returned by [`Tracing::init`] flushes the file writer when dropped.
pub struct Tracing {
    service_name: &'static str,
    options: CompletedTelemetryOptions,
    file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

impl Tracing {
    /// The environment variable used to set the console log level filter.
    pub const CONSOLE_LOG_LEVEL: &str = "CONSOLE_LOG_LEVEL";
    /// The environment variable used to set the rolling file log level filter.
    pub const FILE_LOG_LEVEL: &str = "FILE_LOG_LEVEL";
    /// The filename suffix used for the rolling file logs.
    pub const FILE_LOG_SUFFIX: &str = "tracing-rs.json";

    /// Creates a [`Tracing`] instance with INFO as default level for both outputs.
    pub fn pre_configured(service_name: &'static str, options: CompletedTelemetryOptions) -> Self {
        Self {
            service_name,
            options,
            file_guard: None,
        }
    }

    /// Installs the subscribers. Name the returned guard, `let _ =` drops it immediately.
    pub fn init(mut self) -> Result<Self> {
        let mut layers: Vec<Box<dyn Layer<Registry> + Sync + Send>> = Vec::new();

        if !self.options.console_log_disabled {
            let env_filter_layer = env_filter_builder(Self::CONSOLE_LOG_LEVEL, LevelFilter::INFO);
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_filter(env_filter_layer)
                    .boxed(),
            );
        }

        if let Some(file_log_dir) = &self.options.file_log_directory {
            let env_filter_layer = env_filter_builder(Self::FILE_LOG_LEVEL, LevelFilter::INFO);

            let file_appender = RollingFileAppender::builder()
                .rotation(self.options.file_log_rotation_period.into())
                .filename_prefix(self.service_name)
                .filename_suffix(Self::FILE_LOG_SUFFIX)
                .build(file_log_dir)
                .context(InitRollingFileAppenderSnafu)?;
            let (writer, guard) = tracing_appender::non_blocking(file_appender);
            self.file_guard = Some(guard);

            layers.push(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_filter(env_filter_layer)
                    .boxed(),
            );
        }

        if !layers.is_empty() {
            tracing::subscriber::set_global_default(tracing_subscriber::registry().with(layers))
                .context(SetGlobalDefaultSubscriberSnafu)?;
        }

        Ok(self)
    }
}

/// Create an [`EnvFilter`] configured with the given environment variable and default [`Directive`].
fn env_filter_builder(env_var: &str, default_directive: impl Into<Directive>) -> EnvFilter {
    EnvFilter::builder()
        .with_env_var(env_var)
        .with_default_directive(default_directive.into())
        .from_env_lossy()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn complete(args: &[&str]) -> Result<CompletedTelemetryOptions, ConfigError> {
        let mut flags = Flags::new("test");
        TelemetryOptions.add_flags(&mut flags);
        let parsed = flags.try_parse_from(std::iter::once("test").chain(args.iter().copied()))?;
        TelemetryOptions.complete(&parsed.view())
    }

    #[rstest]
    #[case("Hourly", RotationPeriod::Hourly)]
    #[case("daily", RotationPeriod::Daily)]
    #[case("Never", RotationPeriod::Never)]
    fn rotation_period_is_parsed(#[case] input: &str, #[case] expected: RotationPeriod) {
        let completed = complete(&["--file-log-directory", "/tmp/logs", "--file-log-rotation-period", input])
            .expect("options must complete");

        assert_eq!(completed.file_log_rotation_period, expected);
        assert_eq!(completed.file_log_directory, Some(PathBuf::from("/tmp/logs")));
    }

    #[test]
    fn unknown_rotation_period_is_rejected() {
        assert!(matches!(
            complete(&["--file-log-rotation-period", "Weekly"]),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn pre_configured_keeps_service_name() {
        let tracing = Tracing::pre_configured("test", CompletedTelemetryOptions::default());
        assert_eq!(tracing.service_name, "test");
        assert!(tracing.file_guard.is_none());
    }
}

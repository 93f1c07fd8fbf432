//! Option sets for extension controller managers.
//!
//! Every subsystem of an extension (REST connection, manager, each controller, the webhook
//! server, ...) is configured through its own [`OptionSet`]. An option set registers its flags
//! with a shared [`Flags`] sink and, once the command line was parsed, produces an immutable
//! completed view of itself via [`OptionSet::complete`]. The completed view is the only way to
//! read the resolved configuration, which makes it impossible to use partially parsed values.
//!
//! Option sets are combined with [`OptionAggregator`], which itself is an option set. Flags of
//! a member can be namespaced using [`prefix_option`], so that the same option set type can be
//! used multiple times within one command:
//!
//! ```
//! use extension_framework::cli::{ControllerOptions, Flags, OptionAggregator, OptionSet, prefix_option};
//!
//! let options = OptionAggregator::new((
//!     prefix_option("controlplane-", ControllerOptions::new(5)),
//!     prefix_option("healthcheck-", ControllerOptions::new(1)),
//! ));
//!
//! let mut flags = Flags::new("my-controller-manager");
//! options.add_flags(&mut flags);
//!
//! let parsed = flags
//!     .try_parse_from(["my-controller-manager", "--healthcheck-max-concurrent-reconciles", "3"])
//!     .unwrap();
//! let (controlplane, healthcheck) = options.complete(&parsed.view()).unwrap();
//!
//! assert_eq!(controlplane.max_concurrent_reconciles, 5);
//! assert_eq!(healthcheck.max_concurrent_reconciles, 3);
//! ```
use std::path::PathBuf;

use clap::{Arg, ArgAction, ArgMatches, Command, parser::MatchesError, value_parser};
use snafu::{ResultExt, Snafu};

mod controller;
mod manager;
mod rest;
mod switch;

pub use controller::*;
pub use manager::*;
pub use rest::*;
pub use switch::*;

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("failed to parse command line arguments"))]
    ParseArguments { source: clap::Error },

    #[snafu(display("failed to read value of flag {flag:?}"))]
    ReadFlag { source: MatchesError, flag: String },

    #[snafu(display("required flag {flag:?} is not set"))]
    MissingFlag { flag: String },

    #[snafu(display("invalid value for flag {flag:?}: {reason}"))]
    #[snafu(visibility(pub(crate)))]
    InvalidValue { flag: String, reason: String },

    #[snafu(display("flags {first:?} and {second:?} are mutually exclusive"))]
    MutuallyExclusive { first: String, second: String },

    #[snafu(display("unknown name {name:?} passed to {flag:?}, known names are {known:?}"))]
    UnknownSwitch {
        flag: String,
        name: String,
        known: Vec<String>,
    },

    #[snafu(display("failed to read config file {path:?}"))]
    ReadConfigFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to deserialize config file {path:?}"))]
    DeserializeConfigFile {
        source: serde_yaml::Error,
        path: PathBuf,
    },

    #[snafu(display("invalid config file {path:?}: {reason}"))]
    InvalidConfigFile { path: PathBuf, reason: String },
}

/// A self-contained, parseable and validatable configuration unit of one subsystem.
pub trait OptionSet {
    /// The resolved, read-only view produced by [`OptionSet::complete`].
    type Completed;

    /// Registers all recognized flags with the given sink.
    fn add_flags(&self, flags: &mut Flags);

    /// Validates the parsed values and returns the completed view.
    fn complete(&self, flags: &ParsedFlags<'_>) -> Result<Self::Completed, ConfigError>;
}

/// The sink option sets register their flags with.
///
/// Flags added while a prefix is active (see [`Flags::with_prefix`]) get their id and long name
/// prefixed.
#[derive(Debug)]
pub struct Flags {
    command: Command,
    prefix: String,
}

impl Flags {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            command: Command::new(name.into()),
            prefix: String::new(),
        }
    }

    /// Adds a single flag, applying the currently active prefix.
    pub fn add(&mut self, arg: Arg) {
        let arg = if self.prefix.is_empty() {
            arg
        } else {
            let id = format!("{prefix}{id}", prefix = self.prefix, id = arg.get_id());
            let long = arg
                .get_long()
                .map(|long| format!("{prefix}{long}", prefix = self.prefix));

            match long {
                Some(long) => arg.id(id).long(long),
                None => arg.id(id),
            }
        };

        self.command = std::mem::take(&mut self.command).arg(arg);
    }

    /// Runs `f` with `prefix` appended to the currently active prefix.
    pub fn with_prefix(&mut self, prefix: &str, f: impl FnOnce(&mut Self)) {
        let outer_len = self.prefix.len();
        self.prefix.push_str(prefix);
        f(self);
        self.prefix.truncate(outer_len);
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Parses the process arguments. Prints help or usage errors and exits on failure, like any
    /// other clap based CLI.
    pub fn parse(self) -> ParsedArguments {
        ParsedArguments {
            matches: self.command.get_matches(),
        }
    }

    pub fn try_parse_from<I, T>(self, args: I) -> Result<ParsedArguments, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let matches = self
            .command
            .try_get_matches_from(args)
            .context(ParseArgumentsSnafu)?;

        Ok(ParsedArguments { matches })
    }
}

/// The parsed command line, owned.
#[derive(Debug)]
pub struct ParsedArguments {
    matches: ArgMatches,
}

impl ParsedArguments {
    /// Returns the unprefixed view option sets complete from.
    pub fn view(&self) -> ParsedFlags<'_> {
        ParsedFlags {
            matches: &self.matches,
            prefix: String::new(),
        }
    }
}

/// A (possibly prefixed) view onto the parsed command line.
#[derive(Debug, Clone)]
pub struct ParsedFlags<'a> {
    matches: &'a ArgMatches,
    prefix: String,
}

impl ParsedFlags<'_> {
    /// Returns a view which resolves flag ids with `prefix` appended to the current prefix.
    pub fn with_prefix(&self, prefix: &str) -> Self {
        Self {
            matches: self.matches,
            prefix: format!("{}{prefix}", self.prefix),
        }
    }

    /// The fully qualified id of a flag, as it appears on the command line (without dashes).
    pub fn qualified(&self, id: &str) -> String {
        format!("{}{id}", self.prefix)
    }

    pub fn get_one<T>(&self, id: &str) -> Result<Option<T>, ConfigError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let flag = self.qualified(id);
        let value = self
            .matches
            .try_get_one::<T>(&flag)
            .context(ReadFlagSnafu { flag: flag.clone() })?;

        Ok(value.cloned())
    }

    pub fn get_required<T>(&self, id: &str) -> Result<T, ConfigError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.get_one(id)?.ok_or_else(|| ConfigError::MissingFlag {
            flag: self.qualified(id),
        })
    }

    pub fn get_many<T>(&self, id: &str) -> Result<Vec<T>, ConfigError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let flag = self.qualified(id);
        let values = self
            .matches
            .try_get_many::<T>(&flag)
            .context(ReadFlagSnafu { flag: flag.clone() })?;

        Ok(values.map(|values| values.cloned().collect()).unwrap_or_default())
    }
}

/// Builds a boolean flag accepting `--name`, `--name=true` and `--name=false`.
pub fn bool_flag(name: &'static str, default: bool, help: &'static str) -> Arg {
    Arg::new(name)
        .long(name)
        .help(help)
        .value_parser(value_parser!(bool))
        .num_args(0..=1)
        .require_equals(true)
        .default_value(if default { "true" } else { "false" })
        .default_missing_value("true")
        .action(ArgAction::Set)
}

/// Composes several option sets into one.
///
/// The members are stored as a tuple. Flags are added and values are completed in tuple order,
/// the completed view is the tuple of the members' completed views.
#[derive(Debug)]
pub struct OptionAggregator<T>(T);

impl<T> OptionAggregator<T> {
    pub fn new(members: T) -> Self {
        Self(members)
    }
}

macro_rules! impl_option_set_for_aggregator {
    ($($member:ident: $index:tt),+) => {
        impl<$($member: OptionSet),+> OptionSet for OptionAggregator<($($member,)+)> {
            type Completed = ($($member::Completed,)+);

            fn add_flags(&self, flags: &mut Flags) {
                $(self.0.$index.add_flags(flags);)+
            }

            fn complete(&self, flags: &ParsedFlags<'_>) -> Result<Self::Completed, ConfigError> {
                Ok(($(self.0.$index.complete(flags)?,)+))
            }
        }
    };
}

impl_option_set_for_aggregator!(A: 0);
impl_option_set_for_aggregator!(A: 0, B: 1);
impl_option_set_for_aggregator!(A: 0, B: 1, C: 2);
impl_option_set_for_aggregator!(A: 0, B: 1, C: 2, D: 3);
impl_option_set_for_aggregator!(A: 0, B: 1, C: 2, D: 3, E: 4);
impl_option_set_for_aggregator!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
impl_option_set_for_aggregator!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);
impl_option_set_for_aggregator!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7);
impl_option_set_for_aggregator!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7, I: 8);
impl_option_set_for_aggregator!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7, I: 8, J: 9);
impl_option_set_for_aggregator!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7, I: 8, J: 9, K: 10);
impl_option_set_for_aggregator!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7, I: 8, J: 9, K: 10, L: 11);

/// An option set whose flags are namespaced with a prefix. See [`prefix_option`].
#[derive(Debug)]
pub struct Prefixed<O> {
    prefix: String,
    inner: O,
}

/// Wraps `inner` so that all its flags are registered (and read) as `<prefix><name>`.
pub fn prefix_option<O: OptionSet>(prefix: impl Into<String>, inner: O) -> Prefixed<O> {
    Prefixed {
        prefix: prefix.into(),
        inner,
    }
}

impl<O: OptionSet> OptionSet for Prefixed<O> {
    type Completed = O::Completed;

    fn add_flags(&self, flags: &mut Flags) {
        flags.with_prefix(&self.prefix, |flags| self.inner.add_flags(flags));
    }

    fn complete(&self, flags: &ParsedFlags<'_>) -> Result<Self::Completed, ConfigError> {
        self.inner.complete(&flags.with_prefix(&self.prefix))
    }
}

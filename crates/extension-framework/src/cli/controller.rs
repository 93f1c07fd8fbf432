use clap::{Arg, value_parser};
use snafu::ensure;

use super::{ConfigError, Flags, InvalidValueSnafu, OptionSet, ParsedFlags, bool_flag};

const MAX_CONCURRENT_RECONCILES: &str = "max-concurrent-reconciles";
const IGNORE_OPERATION_ANNOTATION: &str = "ignore-operation-annotation";
const DEPLOY_CRDS: &str = "deploy-crds";

/// Settings shared by all extension controllers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Upper bound of reconciliations running in parallel for one controller.
    pub max_concurrent_reconciles: u16,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: 1,
        }
    }
}

/// Concurrency options of a single controller.
#[derive(Debug)]
pub struct ControllerOptions {
    pub max_concurrent_reconciles: u16,
}

impl ControllerOptions {
    pub fn new(max_concurrent_reconciles: u16) -> Self {
        Self {
            max_concurrent_reconciles,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedControllerOptions {
    pub max_concurrent_reconciles: u16,
}

impl CompletedControllerOptions {
    pub fn apply(&self, config: &mut ControllerConfig) {
        config.max_concurrent_reconciles = self.max_concurrent_reconciles;
    }
}

impl OptionSet for ControllerOptions {
    type Completed = CompletedControllerOptions;

    fn add_flags(&self, flags: &mut Flags) {
        flags.add(
            Arg::new(MAX_CONCURRENT_RECONCILES)
                .long(MAX_CONCURRENT_RECONCILES)
                .help("The maximum number of concurrent reconciliations")
                .value_parser(value_parser!(u16))
                .default_value(self.max_concurrent_reconciles.to_string()),
        );
    }

    fn complete(&self, flags: &ParsedFlags<'_>) -> Result<Self::Completed, ConfigError> {
        let max_concurrent_reconciles =
            flags.get_one(MAX_CONCURRENT_RECONCILES)?.unwrap_or(self.max_concurrent_reconciles);

        ensure!(
            max_concurrent_reconciles > 0,
            InvalidValueSnafu {
                flag: flags.qualified(MAX_CONCURRENT_RECONCILES),
                reason: "must be at least 1",
            }
        );

        Ok(CompletedControllerOptions {
            max_concurrent_reconciles,
        })
    }
}

/// Options controlling how reconcilers react to the operation annotation.
#[derive(Debug, Default)]
pub struct ReconcilerOptions {
    pub ignore_operation_annotation: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedReconcilerOptions {
    pub ignore_operation_annotation: bool,
}

impl CompletedReconcilerOptions {
    pub fn apply(&self, ignore_operation_annotation: &mut bool) {
        *ignore_operation_annotation = self.ignore_operation_annotation;
    }
}

impl OptionSet for ReconcilerOptions {
    type Completed = CompletedReconcilerOptions;

    fn add_flags(&self, flags: &mut Flags) {
        flags.add(bool_flag(
            IGNORE_OPERATION_ANNOTATION,
            self.ignore_operation_annotation,
            "Reconcile on every change instead of only when the operation annotation is set",
        ));
    }

    fn complete(&self, flags: &ParsedFlags<'_>) -> Result<Self::Completed, ConfigError> {
        Ok(CompletedReconcilerOptions {
            ignore_operation_annotation: flags
                .get_one(IGNORE_OPERATION_ANNOTATION)?
                .unwrap_or(self.ignore_operation_annotation),
        })
    }
}

/// Options of the worker reconciler.
#[derive(Debug)]
pub struct WorkerOptions {
    /// Whether the machine CRDs should be deployed before the manager starts.
    pub deploy_crds: bool,
}

impl WorkerOptions {
    pub fn new(deploy_crds: bool) -> Self {
        Self { deploy_crds }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedWorkerOptions {
    pub deploy_crds: bool,
}

impl OptionSet for WorkerOptions {
    type Completed = CompletedWorkerOptions;

    fn add_flags(&self, flags: &mut Flags) {
        flags.add(bool_flag(
            DEPLOY_CRDS,
            self.deploy_crds,
            "Deploy the machine custom resource definitions on startup",
        ));
    }

    fn complete(&self, flags: &ParsedFlags<'_>) -> Result<Self::Completed, ConfigError> {
        Ok(CompletedWorkerOptions {
            deploy_crds: flags.get_one(DEPLOY_CRDS)?.unwrap_or(self.deploy_crds),
        })
    }
}

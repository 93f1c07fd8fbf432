//! Building blocks for Gardener provider extensions.
//!
//! A provider extension is a controller manager which runs a set of extension controllers
//! (infrastructure, control plane, worker, health checks) and an admission webhook server that
//! mutates control plane components of shoot clusters. This crate contains everything which does
//! not depend on a concrete provider:
//!
//! - [`cli`]: option sets, the option aggregator and controller/webhook switches
//! - [`registry`]: one-shot slots for the default options of controllers and webhooks
//! - [`manager`]: the runtime hosting controllers and the webhook server
//! - [`controller`]: the generic extension reconciler driving provider actuators
//! - [`webhook`]: webhook registration, the TLS server and the generic mutator
//! - [`crd`]: the external resource types extensions work with
//! - [`telemetry`]: console and file logging
pub mod cli;
pub mod client;
pub mod controller;
pub mod crd;
pub mod leader_election;
pub mod manager;
pub mod registry;
pub mod telemetry;
pub mod time;
pub mod webhook;

// External re-exports
pub use k8s_openapi;
pub use kube;

/// A type-erased error, used where provider code plugs into the framework.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

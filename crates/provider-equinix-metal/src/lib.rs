//! The Gardener extension for Equinix Metal.
//!
//! [`app`] wires the option sets, the default options [`registry`], the extension controllers and
//! the `controlplaneexposure` webhook into one controller manager.
pub mod app;
pub mod cmd;
pub mod config;
pub mod controller;
pub mod registry;
pub mod webhook;

/// The name of the extension.
pub const NAME: &str = "provider-equinix-metal";

/// The provider type, as used in the `spec.type` field of extension resources.
pub const TYPE: &str = "equinixmetal";

/// The name of the service exposing the webhook server of the extension.
pub fn service_name() -> String {
    format!("gardener-extension-{NAME}")
}

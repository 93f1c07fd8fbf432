//! The admission webhooks of the provider.
pub mod controlplaneexposure;

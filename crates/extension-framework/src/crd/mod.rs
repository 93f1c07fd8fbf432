//! Resource types extensions read and mutate, owned by other components of the landscape.
//!
//! None of these definitions is installed by extensions, except for the machine CRDs which the
//! worker controller may deploy on startup (see [`machine::apply_machine_crds`]).
pub mod druid;
pub mod extensions;
pub mod machine;

// src/config/mod.rs

//! Project configuration for the `resctl` binary.
//!
//! - `model.rs`: TOML data model plus [`ControllerConfig`], the event loop
//!   settings also used when embedding the controller as a library.
//! - `loader.rs`: read a file from disk.
//! - `validate.rs`: refs, kinds, cycles and value sanity.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path, parse_str};
pub use model::{
    ControllerConfig, ControllerSection, DeclaredResource, ProjectFile, RawProjectFile,
    ResourceConfig, StoreSection,
};
pub use validate::{KNOWN_KINDS, validate_config};

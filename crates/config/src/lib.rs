//! Configuration loading, validation, and env substitution.
//!
//! Config files: `firmbox.toml`, `firmbox.yaml`, or `firmbox.json`
//! Searched in `./` then `~/.config/firmbox/`.
//!
//! Supports `${ENV_VAR}` substitution in the raw file text.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod template;
pub mod validate;

pub use {
    loader::{
        IMAGE_ENV_VAR, apply_env_overrides, config_dir, discover_and_load,
        find_or_default_config_path, load_config,
    },
    schema::{
        DEFAULT_RUNTIME_IMAGE, EmulationConfig, FirmboxConfig, NetworkConfig, PortForward,
        RuntimeConfig, TimingConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult},
};

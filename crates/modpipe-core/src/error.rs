//! Error taxonomy for the orchestration engine.
//!
//! Every failure surfaced by the registry, loader, or lifecycle driver is
//! non-recoverable at this layer: errors propagate to the caller and abort
//! the remaining phases. Module hooks themselves return `anyhow::Result`;
//! the driver wraps a hook failure into [`CoreError::ModuleFailed`] so the
//! diagnostic always carries the offending module identifier and phase.

use std::path::PathBuf;

use thiserror::Error;

use crate::module::{ModuleIdentifier, Phase};

/// Convenience alias for results using the engine error type.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised while loading or validating the pipeline configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Fatal errors of the orchestration layer.
#[derive(Error, Debug)]
pub enum CoreError {
    /// The dynamic library backing a module section could not be located or
    /// opened. Lists every directory that was searched so a misconfigured
    /// module path is obvious from the diagnostic alone.
    #[error("module library `{library}` for section `{module}` could not be loaded: {reason} (searched {searched:?})")]
    PluginNotFound {
        module: String,
        library: String,
        reason: String,
        searched: Vec<PathBuf>,
    },

    /// The library loaded, but its entry point is missing or describes an
    /// inconsistent factory set.
    #[error("module `{module}` violates the plugin contract: {reason}")]
    PluginContractViolation { module: String, reason: String },

    /// Two configuration sections produced the same `(name, device)` identity
    /// at equal priority.
    #[error("ambiguous instantiation of `{identifier}`: two configuration sections produce it at priority {priority}")]
    AmbiguousInstantiation {
        identifier: ModuleIdentifier,
        priority: i32,
    },

    /// A per-device constructor did not bind the instance to the device it
    /// was asked for. Indicates a broken plugin constructor.
    #[error("module `{module}` did not bind to device `{expected}` (instance reports {actual:?})")]
    InvalidModuleBinding {
        module: String,
        expected: String,
        actual: Option<String>,
    },

    /// A `name` list in a module section references a device that does not
    /// exist in the device registry.
    #[error("section `{module}` names unknown device `{device}`")]
    UnknownDevice { module: String, device: String },

    /// A module factory returned an error while constructing an instance.
    #[error("module `{module}` failed to construct: {source}")]
    ConstructionFailed {
        module: String,
        #[source]
        source: anyhow::Error,
    },

    /// A lifecycle hook returned an error; the current phase is aborted.
    #[error("module `{identifier}` failed during {phase}: {source}")]
    ModuleFailed {
        identifier: ModuleIdentifier,
        phase: Phase,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

//! `modpipe-core`
//!
//! Orchestration engine for a pipeline of independently compiled processing
//! modules. Modules are loaded from dynamic libraries per configuration
//! section, instantiated once per pipeline or once per device, driven
//! through a fixed `init` → N × `run` → `finalize` lifecycle, and cooperate
//! exclusively through a typed publish/subscribe bus — no module ever calls
//! another.
//!
//! ## Key Types
//!
//! - [`PipelineConfig`]: the configuration model (engine settings, devices,
//!   ordered module sections)
//! - [`PluginLoader`] / [`LibrarySource`]: dynamic library discovery with
//!   load-time ABI validation
//! - [`ModuleManager`]: per-section instantiation, priority-based conflict
//!   resolution, and the phased lifecycle driver
//! - [`Messenger`] / [`BusClient`]: the type- and device-scoped message bus
//!
//! ## Example
//!
//! ```rust,no_run
//! use modpipe_core::{LibrarySource, ModuleManager, PipelineConfig, PluginLoader};
//!
//! # fn main() -> Result<(), modpipe_core::CoreError> {
//! let config = PipelineConfig::load_from("pipeline.toml")?;
//! let source = LibrarySource::new(config.engine.module_path.clone()).with_env_paths();
//! let mut loader = PluginLoader::new(source);
//!
//! let mut manager = ModuleManager::new(&config)?;
//! manager.load(&mut loader, &config.modules)?;
//! let report = manager.execute()?;
//! manager.shutdown();
//! # let _ = report;
//! # Ok(())
//! # }
//! ```
//!
//! The engine is strictly single-threaded and synchronous: phases are plain
//! sequential loops over a fixed instance order. Shared structures are
//! mutex-guarded only so the state stays `Send` for embedders that wire an
//! interrupt signal from another thread.

pub mod config;
pub mod device;
pub mod error;
pub mod messages;
pub mod messenger;
pub mod module;

pub use config::{DeviceDefinition, EngineSettings, ModuleSection, PipelineConfig};
pub use device::{Device, DeviceRegistry};
pub use error::{ConfigError, CoreError, Result};
pub use messenger::{
    BusClient, DeliveryScope, DispatchError, Messenger, MsgFlags, MultiBinding, SingleBinding,
};
pub use module::loader::{
    LibrarySource, LoadedPlugin, ModuleDescriptor, PluginLoader, PluginSource, StaticSource,
    ABI_VERSION, ENTRY_SYMBOL, MODULE_PATH_ENV,
};
pub use module::manager::{ModuleManager, PhaseOutcome, RunReport};
pub use module::{
    EngineContext, InstanceId, Module, ModuleIdentifier, Phase, PhaseContext,
};

/// Prelude for module authors.
pub mod prelude {
    pub use crate::config::ModuleSection;
    pub use crate::device::Device;
    pub use crate::export_module;
    pub use crate::messenger::{BusClient, MsgFlags, MultiBinding, SingleBinding};
    pub use crate::module::{EngineContext, Module, PhaseContext};
}

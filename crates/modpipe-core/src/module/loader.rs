//! Plugin discovery, loading, and ABI validation.
//!
//! Every module lives in its own dynamic library, named after the plugin it
//! provides: section `[[module]] plugin = "sampler"` resolves to
//! `libmodpipe_sampler.so` (platform prefix/suffix vary), searched through
//! `engine.module_path` and then the `MODPIPE_MODULE_PATH` environment
//! variable.
//!
//! A library exports exactly one well-known symbol returning a static
//! [`ModuleDescriptor`]: the ABI version, the per-device instantiation
//! policy, and the matching factory function. The descriptor is validated
//! once at load time — a missing symbol, version mismatch, or inconsistent
//! factory set fails immediately rather than at first call.
//!
//! [`PluginSource`] abstracts where plugins come from: [`LibrarySource`]
//! loads dynamic libraries, [`StaticSource`] serves factories registered
//! in-process (tests, built-ins). [`PluginLoader`] sits on top and caches:
//! each plugin is loaded at most once per process and never unloaded.

#![allow(unsafe_code)] // dynamic library loading requires unsafe FFI calls

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use libloading::{Library, Symbol};

use crate::config::ModuleSection;
use crate::device::Device;
use crate::error::CoreError;
use crate::messenger::BusClient;
use crate::module::{EngineContext, Module};

/// Version of the host/plugin contract. Bumped on any breaking change to
/// the descriptor or factory signatures.
pub const ABI_VERSION: u32 = 1;

/// The single symbol every module library must export.
pub const ENTRY_SYMBOL: &str = "modpipe_module_descriptor";

/// Environment variable with additional library search directories.
pub const MODULE_PATH_ENV: &str = "MODPIPE_MODULE_PATH";

/// Signature of the exported entry point.
pub type EntryFn = fn() -> &'static ModuleDescriptor;

/// Factory for a global (once per pipeline) module.
pub type GlobalCtor =
    fn(&ModuleSection, BusClient, &EngineContext) -> anyhow::Result<Box<dyn Module>>;

/// Factory for a per-device module.
pub type DeviceCtor =
    fn(&ModuleSection, BusClient, &EngineContext, Arc<Device>) -> anyhow::Result<Box<dyn Module>>;

/// Static description a module library exports.
///
/// Authored through [`export_module!`]; hand-written descriptors are only
/// expected in tests.
#[derive(Debug, Clone, Copy)]
pub struct ModuleDescriptor {
    /// Contract version the plugin was compiled against.
    pub abi_version: u32,
    /// True when the module is instantiated once per device rather than
    /// once per pipeline.
    pub per_device: bool,
    /// Factory for the global form. Must be `Some` iff `per_device` is
    /// false.
    pub create_global: Option<GlobalCtor>,
    /// Factory for the per-device form. Must be `Some` iff `per_device` is
    /// true.
    pub create_per_device: Option<DeviceCtor>,
}

/// Exports a module descriptor from a cdylib plugin crate.
///
/// ```rust,ignore
/// fn create(
///     section: &ModuleSection,
///     bus: BusClient,
///     ctx: &EngineContext,
///     device: Arc<Device>,
/// ) -> anyhow::Result<Box<dyn Module>> {
///     Ok(Box::new(MyModule::new(section, bus, device)?))
/// }
///
/// modpipe_core::export_module!(per_device create);
/// ```
#[macro_export]
macro_rules! export_module {
    (global $factory:expr) => {
        $crate::export_module!(@descriptor false, Some($factory), None);
    };
    (per_device $factory:expr) => {
        $crate::export_module!(@descriptor true, None, Some($factory));
    };
    (@descriptor $per_device:expr, $global:expr, $per_dev:expr) => {
        #[allow(unsafe_code)]
        #[no_mangle]
        pub extern "Rust" fn modpipe_module_descriptor(
        ) -> &'static $crate::module::loader::ModuleDescriptor {
            static DESCRIPTOR: $crate::module::loader::ModuleDescriptor =
                $crate::module::loader::ModuleDescriptor {
                    abi_version: $crate::module::loader::ABI_VERSION,
                    per_device: $per_device,
                    create_global: $global,
                    create_per_device: $per_dev,
                };
            &DESCRIPTOR
        }
    };
}

type GlobalFactory = Arc<
    dyn Fn(&ModuleSection, BusClient, &EngineContext) -> anyhow::Result<Box<dyn Module>>
        + Send
        + Sync,
>;
type DeviceFactory = Arc<
    dyn Fn(&ModuleSection, BusClient, &EngineContext, Arc<Device>) -> anyhow::Result<Box<dyn Module>>
        + Send
        + Sync,
>;

/// A validated, loaded plugin: the instantiation policy probe plus
/// strongly-typed factory closures.
#[derive(Clone)]
pub struct LoadedPlugin {
    name: String,
    per_device: bool,
    create_global: Option<GlobalFactory>,
    create_per_device: Option<DeviceFactory>,
    // Keeps the backing library mapped for as long as any factory is alive.
    // Libraries are never unloaded during normal operation.
    _library: Option<Arc<Library>>,
}

impl LoadedPlugin {
    /// Validates a descriptor and wraps its factories.
    pub fn from_descriptor(
        name: &str,
        descriptor: &ModuleDescriptor,
        library: Option<Arc<Library>>,
    ) -> Result<Self, CoreError> {
        let violation = |reason: String| CoreError::PluginContractViolation {
            module: name.to_string(),
            reason,
        };

        if descriptor.abi_version != ABI_VERSION {
            return Err(violation(format!(
                "compiled against ABI v{}, host speaks v{}",
                descriptor.abi_version, ABI_VERSION
            )));
        }

        match (
            descriptor.per_device,
            descriptor.create_global,
            descriptor.create_per_device,
        ) {
            (false, Some(ctor), None) => Ok(Self {
                name: name.to_string(),
                per_device: false,
                create_global: Some(Arc::new(ctor)),
                create_per_device: None,
                _library: library,
            }),
            (true, None, Some(ctor)) => Ok(Self {
                name: name.to_string(),
                per_device: true,
                create_global: None,
                create_per_device: Some(Arc::new(ctor)),
                _library: library,
            }),
            (false, None, _) => Err(violation("global plugin without a global factory".into())),
            (true, _, None) => Err(violation(
                "per-device plugin without a per-device factory".into(),
            )),
            _ => Err(violation(
                "descriptor provides a factory contradicting its per_device policy".into(),
            )),
        }
    }

    fn from_factories(
        name: &str,
        create_global: Option<GlobalFactory>,
        create_per_device: Option<DeviceFactory>,
    ) -> Self {
        Self {
            name: name.to_string(),
            per_device: create_per_device.is_some(),
            create_global,
            create_per_device,
            _library: None,
        }
    }

    /// Plugin name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instantiation policy: once per device, or once per pipeline.
    pub fn per_device(&self) -> bool {
        self.per_device
    }

    /// Constructs the global instance.
    pub fn create_global(
        &self,
        section: &ModuleSection,
        bus: BusClient,
        ctx: &EngineContext,
    ) -> Result<Box<dyn Module>, CoreError> {
        let factory =
            self.create_global
                .as_ref()
                .ok_or_else(|| CoreError::PluginContractViolation {
                    module: self.name.clone(),
                    reason: "global instantiation of a per-device plugin".into(),
                })?;
        factory(section, bus, ctx).map_err(|source| CoreError::ConstructionFailed {
            module: self.name.clone(),
            source,
        })
    }

    /// Constructs an instance bound to the given device.
    pub fn create_per_device(
        &self,
        section: &ModuleSection,
        bus: BusClient,
        ctx: &EngineContext,
        device: Arc<Device>,
    ) -> Result<Box<dyn Module>, CoreError> {
        let factory =
            self.create_per_device
                .as_ref()
                .ok_or_else(|| CoreError::PluginContractViolation {
                    module: self.name.clone(),
                    reason: "per-device instantiation of a global plugin".into(),
                })?;
        factory(section, bus, ctx, device).map_err(|source| CoreError::ConstructionFailed {
            module: self.name.clone(),
            source,
        })
    }
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("name", &self.name)
            .field("per_device", &self.per_device)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Plugin sources
// =============================================================================

/// Where plugins come from.
pub trait PluginSource: Send {
    /// Resolves and validates the plugin with the given name.
    fn resolve(&self, name: &str) -> Result<LoadedPlugin, CoreError>;
}

/// Loads module libraries from a list of search directories.
#[derive(Debug, Default)]
pub struct LibrarySource {
    search_paths: Vec<PathBuf>,
}

impl LibrarySource {
    /// Creates a source searching the given directories, in order.
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self { search_paths }
    }

    /// Appends directories from [`MODULE_PATH_ENV`], if set.
    pub fn with_env_paths(mut self) -> Self {
        if let Some(paths) = env::var_os(MODULE_PATH_ENV) {
            self.search_paths.extend(env::split_paths(&paths));
        }
        self
    }

    /// Directories searched, in order.
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Platform library file name for a plugin, derived from its name:
    /// `sampler` becomes `libmodpipe_sampler.so` on Linux.
    pub fn library_file_name(name: &str) -> String {
        format!(
            "{}modpipe_{}{}",
            env::consts::DLL_PREFIX,
            name,
            env::consts::DLL_SUFFIX
        )
    }

    fn locate(&self, name: &str) -> Result<PathBuf, CoreError> {
        let file_name = Self::library_file_name(name);
        for dir in &self.search_paths {
            let candidate = dir.join(&file_name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(CoreError::PluginNotFound {
            module: name.to_string(),
            library: file_name,
            reason: "no such file in any search directory".to_string(),
            searched: self.search_paths.clone(),
        })
    }
}

impl PluginSource for LibrarySource {
    fn resolve(&self, name: &str) -> Result<LoadedPlugin, CoreError> {
        let path = self.locate(name)?;
        tracing::info!(module = name, path = %path.display(), "loading module library");

        // SAFETY: loading foreign library code is inherently unsafe; the
        // descriptor contract is validated immediately below.
        let library = unsafe { Library::new(&path) }.map_err(|e| CoreError::PluginNotFound {
            module: name.to_string(),
            library: Self::library_file_name(name),
            reason: e.to_string(),
            searched: self.search_paths.clone(),
        })?;

        // SAFETY: the symbol type matches the exported signature; a missing
        // symbol is a contract violation, not undefined behavior.
        let entry: EntryFn = unsafe {
            let symbol: Symbol<'_, EntryFn> = library.get(ENTRY_SYMBOL.as_bytes()).map_err(|e| {
                CoreError::PluginContractViolation {
                    module: name.to_string(),
                    reason: format!("missing entry symbol `{ENTRY_SYMBOL}`: {e}"),
                }
            })?;
            *symbol
        };

        let descriptor = entry();
        LoadedPlugin::from_descriptor(name, descriptor, Some(Arc::new(library)))
    }
}

enum StaticEntry {
    Global(GlobalFactory),
    PerDevice(DeviceFactory),
}

/// Serves factories registered in-process.
///
/// Used by tests and by embedders that compile modules into the host binary
/// instead of shipping them as libraries.
#[derive(Default)]
pub struct StaticSource {
    modules: HashMap<String, StaticEntry>,
}

impl StaticSource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a global module factory under the given plugin name.
    pub fn register_global<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&ModuleSection, BusClient, &EngineContext) -> anyhow::Result<Box<dyn Module>>
            + Send
            + Sync
            + 'static,
    {
        self.modules
            .insert(name.to_string(), StaticEntry::Global(Arc::new(factory)));
    }

    /// Registers a per-device module factory under the given plugin name.
    pub fn register_per_device<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&ModuleSection, BusClient, &EngineContext, Arc<Device>) -> anyhow::Result<Box<dyn Module>>
            + Send
            + Sync
            + 'static,
    {
        self.modules
            .insert(name.to_string(), StaticEntry::PerDevice(Arc::new(factory)));
    }
}

impl PluginSource for StaticSource {
    fn resolve(&self, name: &str) -> Result<LoadedPlugin, CoreError> {
        match self.modules.get(name) {
            Some(StaticEntry::Global(factory)) => Ok(LoadedPlugin::from_factories(
                name,
                Some(Arc::clone(factory)),
                None,
            )),
            Some(StaticEntry::PerDevice(factory)) => Ok(LoadedPlugin::from_factories(
                name,
                None,
                Some(Arc::clone(factory)),
            )),
            None => Err(CoreError::PluginNotFound {
                module: name.to_string(),
                library: name.to_string(),
                reason: "not registered with this source".to_string(),
                searched: Vec::new(),
            }),
        }
    }
}

// =============================================================================
// Loader
// =============================================================================

/// Caching front end over a [`PluginSource`].
///
/// `load` is idempotent per name: the first call resolves and validates,
/// subsequent calls return the cached handle. Nothing is ever unloaded.
pub struct PluginLoader {
    source: Box<dyn PluginSource>,
    cache: HashMap<String, Arc<LoadedPlugin>>,
}

impl PluginLoader {
    /// Creates a loader over the given source.
    pub fn new(source: impl PluginSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            cache: HashMap::new(),
        }
    }

    /// Loads the named plugin, reusing the cache when possible.
    pub fn load(&mut self, name: &str) -> Result<Arc<LoadedPlugin>, CoreError> {
        if let Some(plugin) = self.cache.get(name) {
            tracing::debug!(module = name, "plugin cache hit");
            return Ok(Arc::clone(plugin));
        }
        let plugin = Arc::new(self.source.resolve(name)?);
        self.cache.insert(name.to_string(), Arc::clone(&plugin));
        Ok(plugin)
    }

    /// Whether the named plugin is already loaded.
    pub fn is_loaded(&self, name: &str) -> bool {
        self.cache.contains_key(name)
    }
}

impl std::fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLoader")
            .field("loaded", &self.cache.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::PhaseContext;

    struct Nop;
    impl Module for Nop {
        fn run(&mut self, _ctx: &PhaseContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn nop_global(
        _section: &ModuleSection,
        _bus: BusClient,
        _ctx: &EngineContext,
    ) -> anyhow::Result<Box<dyn Module>> {
        Ok(Box::new(Nop))
    }

    #[test]
    fn descriptor_abi_mismatch_is_a_contract_violation() {
        let descriptor = ModuleDescriptor {
            abi_version: ABI_VERSION + 1,
            per_device: false,
            create_global: Some(nop_global),
            create_per_device: None,
        };
        let err = LoadedPlugin::from_descriptor("demo", &descriptor, None).unwrap_err();
        assert!(matches!(err, CoreError::PluginContractViolation { .. }));
    }

    #[test]
    fn descriptor_policy_factory_mismatch_is_a_contract_violation() {
        let descriptor = ModuleDescriptor {
            abi_version: ABI_VERSION,
            per_device: true,
            create_global: Some(nop_global),
            create_per_device: None,
        };
        let err = LoadedPlugin::from_descriptor("demo", &descriptor, None).unwrap_err();
        match err {
            CoreError::PluginContractViolation { module, reason } => {
                assert_eq!(module, "demo");
                assert!(reason.contains("per-device"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn valid_descriptor_loads() {
        let descriptor = ModuleDescriptor {
            abi_version: ABI_VERSION,
            per_device: false,
            create_global: Some(nop_global),
            create_per_device: None,
        };
        let plugin = LoadedPlugin::from_descriptor("demo", &descriptor, None).unwrap();
        assert!(!plugin.per_device());
        assert_eq!(plugin.name(), "demo");
    }

    #[test]
    fn library_file_name_convention() {
        let file = LibrarySource::library_file_name("sampler");
        assert!(file.contains("modpipe_sampler"));
        assert!(file.starts_with(std::env::consts::DLL_PREFIX));
        assert!(file.ends_with(std::env::consts::DLL_SUFFIX));
    }

    #[test]
    fn missing_library_lists_searched_directories() {
        let dir = tempfile::tempdir().unwrap();
        let source = LibrarySource::new(vec![dir.path().to_path_buf()]);
        let err = source.resolve("ghost").unwrap_err();
        match err {
            CoreError::PluginNotFound {
                module, searched, ..
            } => {
                assert_eq!(module, "ghost");
                assert_eq!(searched, vec![dir.path().to_path_buf()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn loader_caches_by_name() {
        let mut source = StaticSource::new();
        source.register_global("demo", nop_global);
        let mut loader = PluginLoader::new(source);

        assert!(!loader.is_loaded("demo"));
        let first = loader.load("demo").unwrap();
        let second = loader.load("demo").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(loader.is_loaded("demo"));
    }

    #[test]
    fn unknown_static_plugin_is_not_found() {
        let loader_source = StaticSource::new();
        let err = loader_source.resolve("missing").unwrap_err();
        assert!(matches!(err, CoreError::PluginNotFound { .. }));
    }
}

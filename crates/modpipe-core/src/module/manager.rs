//! Module registry and lifecycle driver.
//!
//! The manager owns every live module instance. Loading walks the
//! configuration's module sections in order, resolves each section's plugin,
//! applies the instantiation policy, and reconciles the produced identities
//! against the registry:
//!
//! - per-device sections with an explicit `name` list instantiate at
//!   priority 1, claiming those devices for the module name;
//! - `type` lists instantiate at priority 2 for every device of a matching
//!   kind that has not been claimed by a `name` list of the same module;
//! - sections with neither instantiate at priority 0 for every device;
//! - global plugins always instantiate exactly once at priority 0.
//!
//! When two sections produce the same `(name, device)` key, the higher
//! priority wins and the loser's delegates are removed; equal priority is a
//! fatal ambiguity. A discarded lower-priority request is dropped without a
//! diagnostic beyond a debug line, but every discard is recorded and
//! queryable through [`ModuleManager::superseded`].
//!
//! Execution is a plain sequential loop in a fixed order: all `init`, then
//! `events` iterations of all `run`, then all `finalize`. Every hook call
//! runs inside a tracing span naming the module, phase, and event, so
//! diagnostics never rely on ambient state. An interrupt (see
//! [`ModuleManager::interrupt_handle`]) lets the current call finish, then
//! abandons the remaining phases.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{ModuleSection, PipelineConfig};
use crate::device::DeviceRegistry;
use crate::error::CoreError;
use crate::messenger::{BusClient, Messenger};
use crate::module::loader::{LoadedPlugin, PluginLoader};
use crate::module::{
    EngineContext, InstanceId, InstanceKey, Module, ModuleIdentifier, Phase, PhaseContext,
};

/// Outcome of a single lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// Every instance was driven through the phase.
    Completed,
    /// An interrupt was honored; the remaining calls were skipped.
    Interrupted,
}

/// Outcome of the run phase (or of [`ModuleManager::execute`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    /// Number of fully processed events.
    pub events_completed: u64,
    /// Whether an interrupt cut the run short.
    pub interrupted: bool,
}

struct ModuleEntry {
    identifier: ModuleIdentifier,
    module: Box<dyn Module>,
}

/// Owns and drives all module instances.
pub struct ModuleManager {
    context: EngineContext,
    messenger: Arc<Mutex<Messenger>>,
    instances: HashMap<InstanceId, ModuleEntry>,
    /// Execution order: insertion order, with a superseding instance taking
    /// the place at the end rather than the evicted one's slot.
    order: Vec<InstanceId>,
    by_key: HashMap<InstanceKey, InstanceId>,
    /// Devices claimed by `name` lists, per module name. `type` lists never
    /// instantiate for a claimed device.
    name_claims: HashMap<String, HashSet<String>>,
    superseded: Vec<ModuleIdentifier>,
    interrupt: Arc<AtomicBool>,
    next_id: u64,
}

impl ModuleManager {
    /// Builds an empty manager from the pipeline configuration (devices and
    /// engine settings; module sections are consumed by [`Self::load`]).
    pub fn new(config: &PipelineConfig) -> Result<Self, CoreError> {
        let devices = DeviceRegistry::from_definitions(&config.devices)?;
        Ok(Self {
            context: EngineContext {
                devices: Arc::new(devices),
                settings: config.engine.clone(),
            },
            messenger: Arc::new(Mutex::new(Messenger::new())),
            instances: HashMap::new(),
            order: Vec::new(),
            by_key: HashMap::new(),
            name_claims: HashMap::new(),
            superseded: Vec::new(),
            interrupt: Arc::new(AtomicBool::new(false)),
            next_id: 0,
        })
    }

    /// The shared bus.
    pub fn messenger(&self) -> Arc<Mutex<Messenger>> {
        Arc::clone(&self.messenger)
    }

    /// The device registry.
    pub fn devices(&self) -> Arc<DeviceRegistry> {
        Arc::clone(&self.context.devices)
    }

    /// Flag checked between lifecycle calls: setting it makes the driver
    /// finish the current call, skip the rest, and proceed to teardown.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Number of live instances.
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Identifiers of all live instances, in execution order.
    pub fn identifiers(&self) -> Vec<&ModuleIdentifier> {
        self.order
            .iter()
            .filter_map(|id| self.instances.get(id).map(|e| &e.identifier))
            .collect()
    }

    /// Identities that lost a priority conflict: lower-priority requests
    /// discarded on arrival, and instances evicted by a later
    /// higher-priority request.
    pub fn superseded(&self) -> &[ModuleIdentifier] {
        &self.superseded
    }

    fn next_instance_id(&mut self) -> InstanceId {
        let id = InstanceId::new(self.next_id);
        self.next_id += 1;
        id
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    fn bus_client(&self, id: InstanceId, identifier: &ModuleIdentifier) -> BusClient {
        BusClient::new(
            Arc::clone(&self.messenger),
            id,
            identifier.to_string(),
            identifier.device().map(str::to_string),
        )
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Loads and instantiates every module section, in order.
    ///
    /// Any error is fatal: the registry may hold a partial instance set
    /// afterwards, but no phase will run ([`Self::shutdown`] or drop cleans
    /// up).
    pub fn load(
        &mut self,
        loader: &mut PluginLoader,
        sections: &[ModuleSection],
    ) -> Result<(), CoreError> {
        for section in sections {
            let plugin = loader.load(&section.plugin)?;
            if plugin.per_device() {
                self.load_per_device_section(&plugin, section)?;
            } else {
                self.load_global_section(&plugin, section)?;
            }
        }
        tracing::info!(
            instances = self.instances.len(),
            superseded = self.superseded.len(),
            "module loading complete"
        );
        Ok(())
    }

    fn load_global_section(
        &mut self,
        plugin: &LoadedPlugin,
        section: &ModuleSection,
    ) -> Result<(), CoreError> {
        let identifier = ModuleIdentifier::global(&section.plugin);
        let id = self.next_instance_id();
        let bus = self.bus_client(id, &identifier);
        let module = match plugin.create_global(section, bus, &self.context) {
            Ok(module) => module,
            Err(e) => {
                // a failed constructor may already have registered delegates
                self.messenger.lock().remove_delegates_of(id);
                return Err(e);
            }
        };
        self.reconcile(id, identifier, module)
    }

    fn load_per_device_section(
        &mut self,
        plugin: &LoadedPlugin,
        section: &ModuleSection,
    ) -> Result<(), CoreError> {
        // Explicit device names claim their devices and win over kind
        // matches from any section of the same module.
        if let Some(names) = &section.name {
            for device_name in names {
                let device = self.context.devices.get(device_name).ok_or_else(|| {
                    CoreError::UnknownDevice {
                        module: section.plugin.clone(),
                        device: device_name.clone(),
                    }
                })?;
                self.instantiate_for_device(plugin, section, device, 1)?;
                self.name_claims
                    .entry(section.plugin.clone())
                    .or_default()
                    .insert(device_name.clone());
            }
        }

        if let Some(kinds) = &section.r#type {
            for kind in kinds {
                for device in self.context.devices.by_kind(kind) {
                    let claimed = self
                        .name_claims
                        .get(&section.plugin)
                        .is_some_and(|c| c.contains(device.name()));
                    if claimed {
                        tracing::debug!(
                            module = %section.plugin,
                            device = device.name(),
                            "device already claimed by name list, skipping kind match"
                        );
                        continue;
                    }
                    self.instantiate_for_device(plugin, section, device, 2)?;
                }
            }
        }

        if section.name.is_none() && section.r#type.is_none() {
            for device in self.context.devices.all().to_vec() {
                self.instantiate_for_device(plugin, section, device, 0)?;
            }
        }

        Ok(())
    }

    fn instantiate_for_device(
        &mut self,
        plugin: &LoadedPlugin,
        section: &ModuleSection,
        device: Arc<crate::device::Device>,
        priority: i32,
    ) -> Result<(), CoreError> {
        let identifier = ModuleIdentifier::per_device(&section.plugin, device.name(), priority);
        let id = self.next_instance_id();
        let bus = self.bus_client(id, &identifier);
        let module =
            match plugin.create_per_device(section, bus, &self.context, Arc::clone(&device)) {
                Ok(module) => module,
                Err(e) => {
                    // a failed constructor may already have registered delegates
                    self.messenger.lock().remove_delegates_of(id);
                    return Err(e);
                }
            };

        // Guard against constructors that drop or swap the device they were
        // handed: the instance must report exactly the requested binding.
        if module.device() != Some(device.name()) {
            let actual = module.device().map(str::to_string);
            self.messenger.lock().remove_delegates_of(id);
            return Err(CoreError::InvalidModuleBinding {
                module: section.plugin.clone(),
                expected: device.name().to_string(),
                actual,
            });
        }

        self.reconcile(id, identifier, module)
    }

    /// Inserts a produced instance, resolving identity conflicts by
    /// priority.
    fn reconcile(
        &mut self,
        id: InstanceId,
        identifier: ModuleIdentifier,
        module: Box<dyn Module>,
    ) -> Result<(), CoreError> {
        let key = identifier.key();

        if let Some(&existing_id) = self.by_key.get(&key) {
            let existing_priority = self
                .instances
                .get(&existing_id)
                .map(|e| e.identifier.priority())
                .unwrap_or_default();

            if identifier.priority() == existing_priority {
                self.messenger.lock().remove_delegates_of(id);
                return Err(CoreError::AmbiguousInstantiation {
                    identifier,
                    priority: existing_priority,
                });
            }

            if identifier.priority() < existing_priority {
                // Lower-priority newcomer: discard silently, but record the
                // event so the decision stays observable.
                tracing::debug!(identifier = %identifier, kept = existing_priority, "discarding lower-priority instantiation");
                self.messenger.lock().remove_delegates_of(id);
                self.superseded.push(identifier);
                return Ok(());
            }

            // Newcomer wins: tear the old instance down first.
            tracing::debug!(identifier = %identifier, evicted = existing_priority, "superseding lower-priority instance");
            self.messenger.lock().remove_delegates_of(existing_id);
            if let Some(old) = self.instances.remove(&existing_id) {
                self.superseded.push(old.identifier);
            }
            self.order.retain(|&other| other != existing_id);
            self.by_key.remove(&key);
        }

        self.instances.insert(id, ModuleEntry { identifier, module });
        self.order.push(id);
        self.by_key.insert(key, id);
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Runs the init phase across all instances.
    pub fn init(&mut self) -> Result<PhaseOutcome, CoreError> {
        self.drive_phase(Phase::Init, None)
    }

    /// Runs the configured number of events across all instances.
    pub fn run(&mut self) -> Result<RunReport, CoreError> {
        let events = self.context.settings.events;
        for event in 1..=events {
            if self.interrupted() {
                tracing::warn!(event, "interrupt received, abandoning remaining events");
                return Ok(RunReport {
                    events_completed: event - 1,
                    interrupted: true,
                });
            }
            tracing::debug!(event, of = events, "running event");
            self.messenger.lock().begin_event(event);
            if self.drive_phase(Phase::Run, Some(event))? == PhaseOutcome::Interrupted {
                return Ok(RunReport {
                    events_completed: event - 1,
                    interrupted: true,
                });
            }
        }
        Ok(RunReport {
            events_completed: events,
            interrupted: false,
        })
    }

    /// Runs the finalize phase across all instances.
    pub fn finalize(&mut self) -> Result<PhaseOutcome, CoreError> {
        self.drive_phase(Phase::Finalize, None)
    }

    /// Drives the full lifecycle: init, all events, finalize. An interrupt
    /// after any lifecycle call skips everything that remains.
    pub fn execute(&mut self) -> Result<RunReport, CoreError> {
        if self.init()? == PhaseOutcome::Interrupted {
            return Ok(RunReport {
                events_completed: 0,
                interrupted: true,
            });
        }
        let report = self.run()?;
        if report.interrupted {
            return Ok(report);
        }
        self.finalize()?;
        Ok(report)
    }

    fn drive_phase(
        &mut self,
        phase: Phase,
        event: Option<u64>,
    ) -> Result<PhaseOutcome, CoreError> {
        for id in self.order.clone() {
            if self.interrupted() {
                tracing::warn!(%phase, "interrupt received, abandoning phase");
                return Ok(PhaseOutcome::Interrupted);
            }
            let Some(entry) = self.instances.get_mut(&id) else {
                continue;
            };
            let ModuleEntry {
                ref identifier,
                ref mut module,
            } = *entry;

            let span = tracing::debug_span!("module", %phase, id = %identifier, event);
            let _guard = span.enter();

            let ctx = PhaseContext {
                identifier,
                phase,
                event,
            };
            let result = match phase {
                Phase::Init => module.init(&ctx),
                Phase::Run => module.run(&ctx),
                Phase::Finalize => module.finalize(&ctx),
            };
            if let Err(source) = result {
                return Err(CoreError::ModuleFailed {
                    identifier: identifier.clone(),
                    phase,
                    source,
                });
            }
        }
        Ok(PhaseOutcome::Completed)
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Removes every instance's delegates, then drops the instances.
    ///
    /// Delegates are unregistered before their owners are destroyed, so no
    /// delegate can ever be invoked after its module is gone. Idempotent.
    pub fn shutdown(&mut self) {
        let mut messenger = self.messenger.lock();
        for id in self.order.drain(..) {
            messenger.remove_delegates_of(id);
            self.instances.remove(&id);
        }
        drop(messenger);
        self.instances.clear();
        self.by_key.clear();
    }
}

impl Drop for ModuleManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ModuleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleManager")
            .field("instances", &self.instances.len())
            .field("superseded", &self.superseded.len())
            .field("events", &self.context.settings.events)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::module::loader::StaticSource;

    struct Recorder {
        device: Option<String>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Module for Recorder {
        fn init(&mut self, ctx: &PhaseContext<'_>) -> anyhow::Result<()> {
            self.log.lock().push(format!("init {}", ctx.identifier));
            Ok(())
        }

        fn run(&mut self, ctx: &PhaseContext<'_>) -> anyhow::Result<()> {
            self.log
                .lock()
                .push(format!("run {} e{}", ctx.identifier, ctx.event.unwrap_or(0)));
            Ok(())
        }

        fn finalize(&mut self, ctx: &PhaseContext<'_>) -> anyhow::Result<()> {
            self.log.lock().push(format!("finalize {}", ctx.identifier));
            Ok(())
        }

        fn device(&self) -> Option<&str> {
            self.device.as_deref()
        }
    }

    fn recording_source(log: Arc<Mutex<Vec<String>>>) -> StaticSource {
        let mut source = StaticSource::new();
        let global_log = Arc::clone(&log);
        source.register_global("probe", move |_, _, _| {
            Ok(Box::new(Recorder {
                device: None,
                log: Arc::clone(&global_log),
            }))
        });
        let device_log = log;
        source.register_per_device("scan", move |_, _, _, device| {
            Ok(Box::new(Recorder {
                device: Some(device.name().to_string()),
                log: Arc::clone(&device_log),
            }))
        });
        source
    }

    fn config(toml: &str) -> PipelineConfig {
        PipelineConfig::from_toml_str(toml).unwrap()
    }

    #[test]
    fn phases_execute_in_global_order() {
        let toml = r#"
            [engine]
            events = 2

            [[device]]
            name = "d0"
            kind = "pixel"

            [[module]]
            plugin = "probe"

            [[module]]
            plugin = "scan"
        "#;
        let cfg = config(toml);
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut loader = PluginLoader::new(recording_source(Arc::clone(&log)));
        let mut manager = ModuleManager::new(&cfg).unwrap();
        manager.load(&mut loader, &cfg.modules).unwrap();

        let report = manager.execute().unwrap();
        assert_eq!(report.events_completed, 2);
        assert!(!report.interrupted);

        let entries = log.lock().clone();
        assert_eq!(
            entries,
            vec![
                "init probe",
                "init scan:d0",
                "run probe e1",
                "run scan:d0 e1",
                "run probe e2",
                "run scan:d0 e2",
                "finalize probe",
                "finalize scan:d0",
            ]
        );
    }

    #[test]
    fn hook_error_aborts_the_phase() {
        struct Failing;
        impl Module for Failing {
            fn run(&mut self, ctx: &PhaseContext<'_>) -> anyhow::Result<()> {
                anyhow::bail!("broken at event {:?}", ctx.event)
            }
        }

        let toml = r#"
            [[module]]
            plugin = "bad"

            [[module]]
            plugin = "probe"
        "#;
        let cfg = config(toml);
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut source = recording_source(Arc::clone(&log));
        source.register_global("bad", |_, _, _| Ok(Box::new(Failing)));
        let mut loader = PluginLoader::new(source);
        let mut manager = ModuleManager::new(&cfg).unwrap();
        manager.load(&mut loader, &cfg.modules).unwrap();

        manager.init().unwrap();
        let err = manager.run().unwrap_err();
        match err {
            CoreError::ModuleFailed {
                identifier, phase, ..
            } => {
                assert_eq!(identifier.name(), "bad");
                assert_eq!(phase, Phase::Run);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // the probe module never ran: the phase aborted on the first failure
        let entries = log.lock().clone();
        assert_eq!(entries, vec!["init probe"]);
    }

    #[test]
    fn interrupt_skips_remaining_calls_and_phases() {
        struct Interrupting {
            flag: Arc<AtomicBool>,
        }
        impl Module for Interrupting {
            fn run(&mut self, _ctx: &PhaseContext<'_>) -> anyhow::Result<()> {
                self.flag.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        let toml = r#"
            [engine]
            events = 5

            [[module]]
            plugin = "stopper"

            [[module]]
            plugin = "probe"
        "#;
        let cfg = config(toml);
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = ModuleManager::new(&cfg).unwrap();
        let flag = manager.interrupt_handle();

        let mut source = recording_source(Arc::clone(&log));
        source.register_global("stopper", move |_, _, _| {
            Ok(Box::new(Interrupting {
                flag: Arc::clone(&flag),
            }))
        });
        let mut loader = PluginLoader::new(source);
        manager.load(&mut loader, &cfg.modules).unwrap();

        let report = manager.execute().unwrap();
        assert!(report.interrupted);
        assert_eq!(report.events_completed, 0);

        // the stopper's run finished; nothing after it was driven
        let entries = log.lock().clone();
        assert_eq!(entries, vec!["init probe"]);
    }

    #[test]
    fn shutdown_removes_all_delegates() {
        let toml = r#"
            [[device]]
            name = "d0"
            kind = "pixel"

            [[module]]
            plugin = "listener"
        "#;
        let cfg = config(toml);
        let mut source = StaticSource::new();
        source.register_global("listener", |_, bus, _| {
            bus.subscribe::<u32, _>(|_| {});
            struct Quiet;
            impl Module for Quiet {
                fn run(&mut self, _ctx: &PhaseContext<'_>) -> anyhow::Result<()> {
                    Ok(())
                }
            }
            Ok(Box::new(Quiet))
        });
        let mut loader = PluginLoader::new(source);
        let mut manager = ModuleManager::new(&cfg).unwrap();
        manager.load(&mut loader, &cfg.modules).unwrap();

        let messenger = manager.messenger();
        assert_eq!(messenger.lock().delegate_count(), 1);
        manager.shutdown();
        assert_eq!(messenger.lock().delegate_count(), 0);
        assert_eq!(manager.instance_count(), 0);
    }
}

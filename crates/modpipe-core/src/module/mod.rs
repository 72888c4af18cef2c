//! Module trait, identity, and lifecycle types.
//!
//! A module is an opaque processing unit driven through three phases:
//! `init` once, `run` once per event, `finalize` once. Modules come from
//! plugins (see [`loader`]) and are owned by the [`manager::ModuleManager`],
//! which fixes their execution order and threads an explicit
//! [`PhaseContext`] through every hook call.

pub mod loader;
pub mod manager;

use std::fmt;
use std::sync::Arc;

use crate::config::EngineSettings;
use crate::device::DeviceRegistry;

/// Stable token identifying one live module instance.
///
/// Instances are addressed by these tokens rather than by position, so
/// evicting one instance during conflict resolution cannot invalidate
/// references to any other (delegates keep the token as their non-owning
/// back-reference).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    /// Wraps a raw token value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Identity of one instantiation request.
///
/// Uniqueness key is `(name, device)`; `priority` breaks ties when two
/// configuration sections produce the same key. Higher priority wins, equal
/// priority is a fatal ambiguity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleIdentifier {
    name: String,
    device: Option<String>,
    priority: i32,
}

impl ModuleIdentifier {
    /// Identity of a global (once per pipeline) instance.
    pub fn global(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device: None,
            priority: 0,
        }
    }

    /// Identity of a per-device instance.
    pub fn per_device(name: impl Into<String>, device: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            device: Some(device.into()),
            priority,
        }
    }

    /// Module (plugin) name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bound device, if per-device.
    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    /// Tie-breaking priority of the instantiation request.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub(crate) fn key(&self) -> InstanceKey {
        InstanceKey {
            name: self.name.clone(),
            device: self.device.clone(),
        }
    }
}

impl fmt::Display for ModuleIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.device {
            Some(device) => write!(f, "{}:{}", self.name, device),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Uniqueness key of an identifier, without the priority.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct InstanceKey {
    pub(crate) name: String,
    pub(crate) device: Option<String>,
}

/// Lifecycle phases, in their global execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Run,
    Finalize,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Init => write!(f, "init"),
            Phase::Run => write!(f, "run"),
            Phase::Finalize => write!(f, "finalize"),
        }
    }
}

/// Execution context threaded through every lifecycle call.
///
/// Carries the module identity, the phase, and (during `run`) the 1-based
/// event number, so hooks and their diagnostics never depend on ambient
/// state.
#[derive(Debug)]
pub struct PhaseContext<'a> {
    /// Identity of the module being driven.
    pub identifier: &'a ModuleIdentifier,
    /// Current lifecycle phase.
    pub phase: Phase,
    /// Event number, set only during the run phase.
    pub event: Option<u64>,
}

/// The capability set every module exposes to the engine.
///
/// Hooks return `anyhow::Result`: any error aborts the current phase
/// immediately and is reported with the module identity attached. There is
/// no retry and no partial continuation.
pub trait Module: Send {
    /// Called once before the first event.
    fn init(&mut self, _ctx: &PhaseContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once per event, in registry order.
    fn run(&mut self, ctx: &PhaseContext<'_>) -> anyhow::Result<()>;

    /// Called once after the last event.
    fn finalize(&mut self, _ctx: &PhaseContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// The device this instance is bound to.
    ///
    /// Per-device constructors must report the device they were given; the
    /// manager verifies it right after construction. Global modules return
    /// `None`.
    fn device(&self) -> Option<&str> {
        None
    }
}

/// Shared engine state handed to module factories.
#[derive(Debug, Clone)]
pub struct EngineContext {
    /// All configured devices.
    pub devices: Arc<DeviceRegistry>,
    /// Global engine settings.
    pub settings: EngineSettings,
}

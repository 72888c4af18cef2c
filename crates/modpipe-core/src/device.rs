//! Device registry.
//!
//! A *device* is a named processing target declared in the pipeline
//! configuration (one `[[device]]` entry each). Per-device modules are
//! instantiated once for every device they are bound to; the registry
//! provides the lookups the module manager needs for that: by name, by kind
//! category, and ordered iteration over everything that is configured.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::DeviceDefinition;
use crate::error::ConfigError;

/// A single configured device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    name: String,
    kind: String,
}

impl Device {
    /// Creates a device with the given name and kind category.
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
        }
    }

    /// Unique device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind category, matched by the `type` key of module sections.
    pub fn kind(&self) -> &str {
        &self.kind
    }
}

/// Ordered registry of all configured devices.
///
/// Iteration order is configuration order; per-device instantiation without
/// an explicit `name`/`type` selection walks the registry in this order.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<Arc<Device>>,
    by_name: HashMap<String, usize>,
}

impl DeviceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from the configuration's device list.
    ///
    /// Duplicate device names are rejected: a device is an identity, not a
    /// label.
    pub fn from_definitions(definitions: &[DeviceDefinition]) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for def in definitions {
            registry.add(Device::new(&def.name, &def.kind))?;
        }
        Ok(registry)
    }

    /// Adds a device, rejecting duplicate names.
    pub fn add(&mut self, device: Device) -> Result<(), ConfigError> {
        if self.by_name.contains_key(device.name()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate device name `{}`",
                device.name()
            )));
        }
        self.by_name
            .insert(device.name().to_string(), self.devices.len());
        self.devices.push(Arc::new(device));
        Ok(())
    }

    /// Looks up a device by name.
    pub fn get(&self, name: &str) -> Option<Arc<Device>> {
        self.by_name.get(name).map(|&idx| self.devices[idx].clone())
    }

    /// All devices of the given kind, in configuration order.
    pub fn by_kind(&self, kind: &str) -> Vec<Arc<Device>> {
        self.devices
            .iter()
            .filter(|d| d.kind() == kind)
            .cloned()
            .collect()
    }

    /// All devices in configuration order.
    pub fn all(&self) -> &[Arc<Device>] {
        &self.devices
    }

    /// Number of configured devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Returns true when no devices are configured.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

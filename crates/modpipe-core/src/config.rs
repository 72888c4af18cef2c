//! Pipeline configuration model.
//!
//! Configuration is loaded from a TOML file merged with `MODPIPE_`-prefixed
//! environment variables (double underscore separates nesting levels, e.g.
//! `MODPIPE_ENGINE__EVENTS=10`).
//!
//! The file has three parts:
//! 1. `[engine]` — global settings (event count, module search path, log
//!    level). This is the "global header" of the pipeline; it is never
//!    instantiated as a module.
//! 2. `[[device]]` — the named processing targets per-device modules bind to.
//! 3. `[[module]]` — one section per module instantiation request, in
//!    pipeline order. Two keys are interpreted by the orchestration core:
//!    `name` (explicit device list) and `type` (device kind list). Every
//!    other key is opaque and passed through to the module untouched.
//!
//! Sections are ordered and may repeat the same plugin: the registry's
//! priority rules decide what happens when two sections produce the same
//! module identity.

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Global engine settings.
    #[serde(default)]
    pub engine: EngineSettings,
    /// Device definitions.
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceDefinition>,
    /// Module sections, in pipeline order.
    #[serde(default, rename = "module")]
    pub modules: Vec<ModuleSection>,
}

/// Global engine settings (the `[engine]` table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Number of events to process in the run phase.
    #[serde(default = "default_events")]
    pub events: u64,
    /// Directories searched for module libraries, in priority order.
    /// `MODPIPE_MODULE_PATH` entries are appended after these.
    #[serde(default)]
    pub module_path: Vec<PathBuf>,
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            events: default_events(),
            module_path: Vec::new(),
            log_level: default_log_level(),
        }
    }
}

/// One `[[device]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Unique device name.
    pub name: String,
    /// Kind category, matched by module `type` lists.
    pub kind: String,
}

/// One `[[module]]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleSection {
    /// Plugin this section instantiates; also determines the library name.
    pub plugin: String,
    /// Explicit device list for per-device plugins.
    #[serde(default)]
    pub name: Option<Vec<String>>,
    /// Device kind list for per-device plugins.
    #[serde(default)]
    pub r#type: Option<Vec<String>>,
    /// All remaining keys, passed through to the module untouched and in
    /// file order.
    #[serde(flatten)]
    pub params: toml::Table,
}

impl ModuleSection {
    /// Creates an empty section for the given plugin (mostly for tests).
    pub fn new(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            name: None,
            r#type: None,
            params: toml::Table::new(),
        }
    }

    /// Raw parameter lookup.
    pub fn get(&self, key: &str) -> Option<&toml::Value> {
        self.params.get(key)
    }

    /// String parameter lookup.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_str())
    }

    /// Float parameter lookup; integers are widened.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key)
            .and_then(|v| v.as_float().or_else(|| v.as_integer().map(|i| i as f64)))
    }

    /// Integer parameter lookup.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.as_integer())
    }

    /// Boolean parameter lookup.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.as_bool())
    }
}

fn default_events() -> u64 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

impl PipelineConfig {
    /// Loads configuration from a TOML file merged with `MODPIPE_`
    /// environment variables.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("MODPIPE_").split("__"))
            .extract()
            .map_err(ConfigError::Load)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from an in-memory TOML string (tests, tools).
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .map_err(ConfigError::Load)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates settings that parse but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.engine.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "invalid log_level `{}`, expected one of: {}",
                self.engine.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.engine.events == 0 {
            return Err(ConfigError::Invalid(
                "engine.events must be at least 1".to_string(),
            ));
        }

        for section in &self.modules {
            if section.plugin.is_empty() {
                return Err(ConfigError::Invalid(
                    "module section with empty plugin name".to_string(),
                ));
            }
            if matches!(&section.name, Some(names) if names.is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "section `{}` has an empty name list",
                    section.plugin
                )));
            }
            if matches!(&section.r#type, Some(kinds) if kinds.is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "section `{}` has an empty type list",
                    section.plugin
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [engine]
        events = 3
        module_path = ["plugins"]

        [[device]]
        name = "d0"
        kind = "strip"

        [[device]]
        name = "d1"
        kind = "pixel"

        [[module]]
        plugin = "sampler"
        name = ["d0"]
        amplitude = 1.5

        [[module]]
        plugin = "sampler"
        type = ["pixel"]

        [[module]]
        plugin = "recorder"
    "#;

    #[test]
    fn parses_full_config() {
        let config = PipelineConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.engine.events, 3);
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.modules.len(), 3);
    }

    #[test]
    fn sections_keep_file_order_and_duplicates() {
        let config = PipelineConfig::from_toml_str(SAMPLE).unwrap();
        let plugins: Vec<_> = config.modules.iter().map(|m| m.plugin.as_str()).collect();
        assert_eq!(plugins, vec!["sampler", "sampler", "recorder"]);
    }

    #[test]
    fn interpreted_keys_are_split_from_params() {
        let config = PipelineConfig::from_toml_str(SAMPLE).unwrap();
        let first = &config.modules[0];
        assert_eq!(first.name.as_deref(), Some(&["d0".to_string()][..]));
        assert_eq!(first.get_f64("amplitude"), Some(1.5));
        // interpreted keys must not leak into the opaque params
        assert!(first.get("name").is_none());
        assert!(first.get("plugin").is_none());

        let second = &config.modules[1];
        assert_eq!(second.r#type.as_deref(), Some(&["pixel".to_string()][..]));
    }

    #[test]
    fn defaults_apply() {
        let config = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(config.engine.events, 1);
        assert_eq!(config.engine.log_level, "info");
        assert!(config.devices.is_empty());
        assert!(config.modules.is_empty());
    }

    #[test]
    fn zero_events_rejected() {
        let err = PipelineConfig::from_toml_str("[engine]\nevents = 0\n").unwrap_err();
        assert!(err.to_string().contains("at least 1"));
    }

    #[test]
    fn empty_name_list_rejected() {
        let toml = "[[module]]\nplugin = \"sampler\"\nname = []\n";
        let err = PipelineConfig::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("empty name list"));
    }
}

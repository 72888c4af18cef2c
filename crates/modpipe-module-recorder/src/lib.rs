//! Recorder module: collects every published sample block and reports a
//! summary at finalize time.
//!
//! Instantiated once per pipeline. Subscribes to all
//! [`SampleBlock`](modpipe_core::messages::SampleBlock) traffic through a
//! multi-slot binding (wildcard scope, since the recorder is a global
//! module) and keeps running totals across events.

use anyhow::Context;

use modpipe_core::messages::SampleBlock;
use modpipe_core::prelude::*;

struct RecorderModule {
    blocks: MultiBinding<SampleBlock>,
    require_traffic: bool,
    blocks_seen: u64,
    samples_seen: u64,
    mean_accumulator: f64,
}

impl Module for RecorderModule {
    fn run(&mut self, ctx: &PhaseContext<'_>) -> anyhow::Result<()> {
        let received = self.blocks.messages();
        if received.is_empty() && self.require_traffic {
            anyhow::bail!(
                "no sample blocks received in event {}",
                ctx.event.unwrap_or(0)
            );
        }
        for block in received {
            self.blocks_seen += 1;
            self.samples_seen += block.samples.len() as u64;
            self.mean_accumulator += block.mean();
            tracing::trace!(
                device = %block.device,
                event = block.event,
                samples = block.samples.len(),
                "recorded block"
            );
        }
        Ok(())
    }

    fn finalize(&mut self, _ctx: &PhaseContext<'_>) -> anyhow::Result<()> {
        let mean_of_means = if self.blocks_seen > 0 {
            self.mean_accumulator / self.blocks_seen as f64
        } else {
            0.0
        };
        tracing::info!(
            blocks = self.blocks_seen,
            samples = self.samples_seen,
            mean = mean_of_means,
            "recording summary"
        );
        Ok(())
    }
}

/// Global factory, exported through the plugin ABI below.
///
/// Section parameter `require_traffic` (bool, default false) turns an event
/// without any sample block into a hard error.
pub fn create(
    section: &ModuleSection,
    bus: BusClient,
    _ctx: &EngineContext,
) -> anyhow::Result<Box<dyn Module>> {
    let require_traffic = match section.get("require_traffic") {
        Some(value) => value
            .as_bool()
            .context("`require_traffic` must be a boolean")?,
        None => false,
    };
    Ok(Box::new(RecorderModule {
        blocks: bus.bind_multi::<SampleBlock>(),
        require_traffic,
        blocks_seen: 0,
        samples_seen: 0,
        mean_accumulator: 0.0,
    }))
}

modpipe_core::export_module!(global create);

#[cfg(test)]
mod tests {
    use super::*;
    use modpipe_core::{ModuleManager, PipelineConfig, PluginLoader, StaticSource};

    fn run_pipeline(toml: &str) -> Result<(), modpipe_core::CoreError> {
        let cfg = PipelineConfig::from_toml_str(toml).unwrap();
        let mut source = StaticSource::new();
        source.register_global("recorder", create);
        source.register_per_device("sampler", modpipe_sampler_stub);
        let mut loader = PluginLoader::new(source);
        let mut manager = ModuleManager::new(&cfg)?;
        manager.load(&mut loader, &cfg.modules)?;
        manager.execute()?;
        Ok(())
    }

    fn modpipe_sampler_stub(
        _section: &ModuleSection,
        bus: BusClient,
        _ctx: &EngineContext,
        device: std::sync::Arc<Device>,
    ) -> anyhow::Result<Box<dyn Module>> {
        struct Stub {
            device: String,
            bus: BusClient,
        }
        impl Module for Stub {
            fn run(&mut self, ctx: &PhaseContext<'_>) -> anyhow::Result<()> {
                self.bus.dispatch(SampleBlock {
                    device: self.device.clone(),
                    event: ctx.event.unwrap_or(0),
                    samples: vec![1.0, 3.0],
                })?;
                Ok(())
            }
            fn device(&self) -> Option<&str> {
                Some(&self.device)
            }
        }
        Ok(Box::new(Stub {
            device: device.name().to_string(),
            bus,
        }))
    }

    #[test]
    fn records_traffic_without_errors() {
        run_pipeline(
            r#"
            [engine]
            events = 3

            [[device]]
            name = "d0"
            kind = "pixel"

            [[module]]
            plugin = "sampler"

            [[module]]
            plugin = "recorder"
        "#,
        )
        .unwrap();
    }

    #[test]
    fn require_traffic_fails_on_silent_event() {
        let err = run_pipeline(
            r#"
            [[module]]
            plugin = "recorder"
            require_traffic = true
        "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("recorder"));
    }
}

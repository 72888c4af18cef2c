//! Sampler module: reads out one device per event and publishes the block.
//!
//! Instantiated once per device. Each event it synthesizes a block of
//! samples for its device and dispatches it as a
//! [`SampleBlock`](modpipe_core::messages::SampleBlock); when nobody listens
//! the block is never built.
//!
//! Section parameters:
//! - `samples` (integer, default 16): samples per block
//! - `amplitude` (float, default 1.0): waveform amplitude

use std::sync::Arc;

use anyhow::Context;

use modpipe_core::messages::SampleBlock;
use modpipe_core::prelude::*;

const DEFAULT_SAMPLES: i64 = 16;

// Deterministic stand-in for a hardware readout.
fn waveform(amplitude: f64, samples: usize, event: u64, index: usize) -> f64 {
    let phase = (event as f64) + (index as f64) / (samples.max(1) as f64);
    amplitude * phase.sin()
}

struct SamplerModule {
    device: Arc<Device>,
    bus: BusClient,
    samples: usize,
    amplitude: f64,
}

impl SamplerModule {
    fn from_section(
        section: &ModuleSection,
        bus: BusClient,
        device: Arc<Device>,
    ) -> anyhow::Result<Self> {
        let samples = section.get_i64("samples").unwrap_or(DEFAULT_SAMPLES);
        let samples = usize::try_from(samples).context("`samples` must be non-negative")?;
        let amplitude = section.get_f64("amplitude").unwrap_or(1.0);
        Ok(Self {
            device,
            bus,
            samples,
            amplitude,
        })
    }
}

impl Module for SamplerModule {
    fn init(&mut self, _ctx: &PhaseContext<'_>) -> anyhow::Result<()> {
        tracing::debug!(
            device = self.device.name(),
            samples = self.samples,
            "sampler ready"
        );
        Ok(())
    }

    fn run(&mut self, ctx: &PhaseContext<'_>) -> anyhow::Result<()> {
        let event = ctx.event.unwrap_or(0);
        if !self.bus.has_receiver::<SampleBlock>() {
            tracing::trace!(device = self.device.name(), "no receiver, skipping readout");
            return Ok(());
        }
        let samples: Vec<f64> = (0..self.samples)
            .map(|i| waveform(self.amplitude, self.samples, event, i))
            .collect();
        self.bus.dispatch(SampleBlock {
            device: self.device.name().to_string(),
            event,
            samples,
        })?;
        Ok(())
    }

    fn device(&self) -> Option<&str> {
        Some(self.device.name())
    }
}

/// Per-device factory, exported through the plugin ABI below.
pub fn create(
    section: &ModuleSection,
    bus: BusClient,
    _ctx: &EngineContext,
    device: Arc<Device>,
) -> anyhow::Result<Box<dyn Module>> {
    Ok(Box::new(SamplerModule::from_section(section, bus, device)?))
}

modpipe_core::export_module!(per_device create);

//! Standard message payloads shipped with the engine.
//!
//! Any `'static + Send + Sync` type can travel over the bus; these are the
//! payloads the stock modules exchange. Messages are immutable once
//! dispatched — receivers get shared `Arc` handles, never copies they could
//! mutate under the sender.

/// A block of samples produced for one device in one event.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
    /// Device the samples were read from.
    pub device: String,
    /// Event number the block belongs to (1-based).
    pub event: u64,
    /// Sample values.
    pub samples: Vec<f64>,
}

impl SampleBlock {
    /// Arithmetic mean of the block, 0.0 when empty.
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}

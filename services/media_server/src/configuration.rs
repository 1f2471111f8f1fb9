use std::time::Duration;

use anyhow::{bail, Context, Result};
use edgestream_core::configuration::{
    AcceleratorConfiguration, CaptureConfiguration, SessionConfiguration,
};
use serde::{Deserialize, Serialize};
use twelf::{config, Layer};

fn default_address() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_tick_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_idle_sleep() -> Duration {
    Duration::from_millis(1)
}

fn default_max_reads_per_tick() -> usize {
    16
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ListenConfiguration {
    #[serde(default = "default_address")]
    pub address: String,
    /// Period of the per-connection timer.
    #[serde(default = "default_tick_interval")]
    pub tick_interval: Duration,
    /// Sleep of the service loop when no connection had work.
    #[serde(default = "default_idle_sleep")]
    pub idle_sleep: Duration,
    #[serde(default = "default_max_reads_per_tick")]
    pub max_reads_per_tick: usize,
    /// Peers that have not finished the WebSocket upgrade by then are dropped.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: Duration,
}

#[config]
#[derive(Debug, Serialize, Clone)]
pub struct ServiceConfiguration {
    pub listen: ListenConfiguration,
    pub capture: CaptureConfiguration,
    pub accelerator: AcceleratorConfiguration,
    pub session: SessionConfiguration,
}

impl ServiceConfiguration {
    pub(crate) fn validate(&self) -> Result<()> {
        let queue = &self.session.queue;
        if queue.capacity == 0 {
            bail!("Outbound queue capacity must be greater than zero!");
        }
        if queue.resume_margin >= queue.capacity {
            bail!(
                "Resume margin {} must be less than the queue capacity {}!",
                queue.resume_margin,
                queue.capacity
            );
        }
        if queue.low_water_mark > queue.capacity - queue.resume_margin {
            bail!(
                "Low water mark {} must not exceed the resume mark {}!",
                queue.low_water_mark,
                queue.capacity - queue.resume_margin
            );
        }
        if self.capture.max_devices == 0 || self.capture.buffer_count == 0 {
            bail!("Capture needs at least one device slot and one buffer!");
        }
        if self.accelerator.max_polls == 0 {
            bail!("Accelerator poll budget must be greater than zero!");
        }
        if self.listen.tick_interval.is_zero() {
            bail!("Tick interval must be greater than zero!");
        }
        if self.listen.handshake_timeout.is_zero() {
            bail!("Handshake timeout must be greater than zero!");
        }
        if !(1..=100).contains(&self.session.compression.quality) {
            bail!(
                "JPEG quality must be within 1..=100, got {}!",
                self.session.compression.quality
            );
        }
        Ok(())
    }

    pub fn new(path: &str) -> Result<Self> {
        let conf = Self::with_layers(&[Layer::Json(path.into())]).with_context(|| {
            format!("Failed to load configuration from {}", path)
        })?;
        conf.validate()?;
        Ok(conf)
    }
}

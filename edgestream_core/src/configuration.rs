use crate::capture::Resolution;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

fn default_max_devices() -> usize {
    32
}

fn default_buffer_count() -> u32 {
    8
}

fn default_resolution() -> Resolution {
    Resolution::new(640, 480)
}

fn default_fps() -> u32 {
    30
}

fn default_probe_limit() -> usize {
    999
}

fn default_path_prefix() -> String {
    "/dev/video".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CaptureConfiguration {
    #[serde(default = "default_max_devices")]
    pub max_devices: usize,
    #[serde(default = "default_buffer_count")]
    pub buffer_count: u32,
    #[serde(default = "default_resolution")]
    pub default_resolution: Resolution,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_probe_limit")]
    pub probe_limit: usize,
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
}

impl Default for CaptureConfiguration {
    fn default() -> Self {
        Self {
            max_devices: default_max_devices(),
            buffer_count: default_buffer_count(),
            default_resolution: default_resolution(),
            fps: default_fps(),
            probe_limit: default_probe_limit(),
            path_prefix: default_path_prefix(),
        }
    }
}

fn default_queue_capacity() -> usize {
    4096
}

fn default_low_water_mark() -> usize {
    3
}

fn default_resume_margin() -> usize {
    5
}

fn default_max_writes_per_tick() -> usize {
    16
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QueueConfiguration {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    /// Reads pause once the free count falls below this mark.
    #[serde(default = "default_low_water_mark")]
    pub low_water_mark: usize,
    /// Reads resume once the free count exceeds `capacity - resume_margin`.
    #[serde(default = "default_resume_margin")]
    pub resume_margin: usize,
    #[serde(default = "default_max_writes_per_tick")]
    pub max_writes_per_tick: usize,
}

impl Default for QueueConfiguration {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            low_water_mark: default_low_water_mark(),
            resume_margin: default_resume_margin(),
            max_writes_per_tick: default_max_writes_per_tick(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FrameEncoding {
    #[default]
    Jpeg,
    Raw,
}

fn default_quality() -> u8 {
    75
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CompressionConfiguration {
    #[serde(default)]
    pub encoding: FrameEncoding,
    #[serde(default = "default_quality")]
    pub quality: u8,
}

impl Default for CompressionConfiguration {
    fn default() -> Self {
        Self {
            encoding: FrameEncoding::default(),
            quality: default_quality(),
        }
    }
}

fn default_stats_period() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionConfiguration {
    #[serde(default)]
    pub queue: QueueConfiguration,
    #[serde(default)]
    pub compression: CompressionConfiguration,
    #[serde(default = "default_stats_period")]
    pub stats_period: Duration,
}

impl Default for SessionConfiguration {
    fn default() -> Self {
        Self {
            queue: QueueConfiguration::default(),
            compression: CompressionConfiguration::default(),
            stats_period: default_stats_period(),
        }
    }
}

fn default_device() -> PathBuf {
    PathBuf::from("/dev/drpai0")
}

fn default_models_root() -> PathBuf {
    PathBuf::from("/opt/edgestream/models")
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(5)
}

fn default_max_polls() -> u32 {
    1000
}

fn default_containment_epsilon() -> f32 {
    1.0
}

/// How a model's address map relates to device memory.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Addressing {
    /// Addresses are already device addresses.
    Absolute,
    /// Addresses are offsets from the input region and get rebased onto the
    /// device area.
    #[default]
    Relative,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AcceleratorConfiguration {
    #[serde(default = "default_device")]
    pub device: PathBuf,
    #[serde(default = "default_models_root")]
    pub models_root: PathBuf,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: Duration,
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
    #[serde(default = "default_containment_epsilon")]
    pub nms_containment_epsilon: f32,
    #[serde(default)]
    pub addressing: Addressing,
}

impl Default for AcceleratorConfiguration {
    fn default() -> Self {
        Self {
            device: default_device(),
            models_root: default_models_root(),
            poll_interval: default_poll_interval(),
            max_polls: default_max_polls(),
            nms_containment_epsilon: default_containment_epsilon(),
            addressing: Addressing::default(),
        }
    }
}

//! Capture device registry.
//!
//! The registry owns a fixed number of device slots. Each active slot holds
//! the opened device and an arena of memory-mapped buffers; a buffer handed
//! out by [`CaptureRegistry::acquire_buffer`] is marked checked out until it
//! is released back to the driver.

pub mod v4l2;

use crate::configuration::CaptureConfiguration;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capability {
    pub driver: String,
    pub card: String,
    pub version: u32,
    pub capabilities: u32,
    pub device_caps: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub device: String,
    pub driver: String,
    pub card: String,
    pub version: u32,
    pub capabilities: u32,
    pub device_caps: u32,
    pub resolutions: Vec<Resolution>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: usize,
    pub bytes_used: usize,
}

/// An opened video device. Dropping it closes the device.
pub trait VideoDevice {
    /// Mapped buffer memory, unmapped on drop.
    type Mapping: AsRef<[u8]>;

    fn query_capability(&self) -> io::Result<Capability>;
    fn frame_sizes(&self) -> io::Result<Vec<Resolution>>;
    /// Returns the resolution the driver actually accepted.
    fn set_format(&mut self, resolution: Resolution) -> io::Result<Resolution>;
    fn set_frame_rate(&mut self, fps: u32) -> io::Result<()>;
    /// Returns the number of buffers granted.
    fn request_buffers(&mut self, count: u32) -> io::Result<u32>;
    fn map_buffer(&mut self, index: u32) -> io::Result<Self::Mapping>;
    fn queue_buffer(&mut self, index: u32) -> io::Result<()>;
    /// `WouldBlock` when no filled buffer is ready yet.
    fn dequeue_buffer(&mut self) -> io::Result<DequeuedBuffer>;
    fn stream_on(&mut self) -> io::Result<()>;
    fn stream_off(&mut self) -> io::Result<()>;
}

pub trait DeviceProvider {
    type Device: VideoDevice;

    fn open(&self, path: &str) -> io::Result<Self::Device>;
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Device {path} is already active")]
    AlreadyActive { path: String },
    #[error("Capture registry is full ({capacity} devices)")]
    CapacityExceeded { capacity: usize },
    #[error("Device {path}: {op} failed: {source}")]
    Device {
        path: String,
        op: &'static str,
        source: io::Error,
    },
    #[error("Device {path} granted no capture buffers")]
    NoBuffers { path: String },
    #[error("Capture handle {0} is not active")]
    InactiveHandle(CaptureHandle),
    #[error("Buffer {index} is out of range")]
    BufferOutOfRange { index: usize },
    #[error("Buffer {index} is already checked out")]
    BufferCheckedOut { index: usize },
    #[error("Buffer {index} is not checked out")]
    BufferNotCheckedOut { index: usize },
    #[error("No frame is ready")]
    FrameNotReady,
}

impl CaptureError {
    fn device(path: &str, op: &'static str, source: io::Error) -> Self {
        CaptureError::Device {
            path: path.to_string(),
            op,
            source,
        }
    }
}

/// Slot index plus the generation of the activation that produced it, so a
/// handle of a stopped device never addresses a later activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CaptureHandle {
    index: usize,
    generation: u64,
}

impl CaptureHandle {
    pub fn id(&self) -> usize {
        self.index
    }
}

impl fmt::Display for CaptureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

/// Proof of ownership of one dequeued buffer. Not `Clone`: releasing
/// consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct BufferToken {
    handle: CaptureHandle,
    index: usize,
    bytes_used: usize,
    resolution: Resolution,
}

impl BufferToken {
    pub fn handle(&self) -> CaptureHandle {
        self.handle
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }
}

struct BufferSlot<M> {
    mapping: M,
    checked_out: bool,
}

struct CaptureSlot<D: VideoDevice> {
    path: String,
    generation: u64,
    resolution: Resolution,
    device: D,
    buffers: Vec<BufferSlot<D::Mapping>>,
}

pub struct CaptureRegistry<P: DeviceProvider> {
    provider: P,
    config: CaptureConfiguration,
    slots: Vec<Option<CaptureSlot<P::Device>>>,
    generation: u64,
}

impl<P: DeviceProvider> CaptureRegistry<P> {
    pub fn new(provider: P, config: CaptureConfiguration) -> Self {
        let slots = (0..config.max_devices).map(|_| None).collect();
        Self {
            provider,
            config,
            slots,
            generation: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn find(&self, path: &str) -> Option<CaptureHandle> {
        self.slots.iter().enumerate().find_map(|(index, s)| {
            s.as_ref()
                .filter(|s| s.path == path)
                .map(|s| CaptureHandle {
                    index,
                    generation: s.generation,
                })
        })
    }

    pub fn path(&self, handle: CaptureHandle) -> Option<&str> {
        self.slot(handle).ok().map(|s| s.path.as_str())
    }

    pub fn resolution(&self, handle: CaptureHandle) -> Option<Resolution> {
        self.slot(handle).ok().map(|s| s.resolution)
    }

    /// Probes `path_prefix0`, `path_prefix1`, ... until a node fails to open.
    /// Devices whose capability query fails are skipped.
    pub fn enumerate_devices(&self) -> Vec<DeviceInfo> {
        let mut devices = Vec::new();
        for n in 0..self.config.probe_limit {
            let path = format!("{}{}", self.config.path_prefix, n);
            let device = match self.provider.open(&path) {
                Ok(d) => d,
                Err(e) => {
                    debug!(target: "edgestream::capture", "Stop probing at {}: {}", path, e);
                    break;
                }
            };
            let cap = match device.query_capability() {
                Ok(c) => c,
                Err(e) => {
                    debug!(target: "edgestream::capture", "Skipping {}: {}", path, e);
                    continue;
                }
            };
            let resolutions = device.frame_sizes().unwrap_or_default();
            devices.push(DeviceInfo {
                device: path,
                driver: cap.driver,
                card: cap.card,
                version: cap.version,
                capabilities: cap.capabilities,
                device_caps: cap.device_caps,
                resolutions,
            });
        }
        devices
    }

    /// Activates `path`. Nothing is committed unless every step succeeds;
    /// partial state is closed and unmapped on the way out.
    pub fn start(
        &mut self,
        path: &str,
        requested: Resolution,
    ) -> Result<CaptureHandle, CaptureError> {
        if self.find(path).is_some() {
            return Err(CaptureError::AlreadyActive {
                path: path.to_string(),
            });
        }
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(CaptureError::CapacityExceeded {
                capacity: self.capacity(),
            })?;

        let resolution = if requested.is_valid() {
            requested
        } else {
            self.config.default_resolution
        };

        let mut device = self
            .provider
            .open(path)
            .map_err(|e| CaptureError::device(path, "open", e))?;
        let negotiated = device
            .set_format(resolution)
            .map_err(|e| CaptureError::device(path, "set format", e))?;
        if let Err(e) = device.set_frame_rate(self.config.fps) {
            warn!(
                target: "edgestream::capture",
                "Device {}: unable to set {} fps: {}", path, self.config.fps, e
            );
        }
        let granted = device
            .request_buffers(self.config.buffer_count)
            .map_err(|e| CaptureError::device(path, "request buffers", e))?;
        if granted == 0 {
            return Err(CaptureError::NoBuffers {
                path: path.to_string(),
            });
        }

        let mut buffers = Vec::with_capacity(granted as usize);
        for i in 0..granted {
            let mapping = device
                .map_buffer(i)
                .map_err(|e| CaptureError::device(path, "map buffer", e))?;
            buffers.push(BufferSlot {
                mapping,
                checked_out: false,
            });
            device
                .queue_buffer(i)
                .map_err(|e| CaptureError::device(path, "queue buffer", e))?;
        }
        device
            .stream_on()
            .map_err(|e| CaptureError::device(path, "stream on", e))?;

        self.generation += 1;
        let handle = CaptureHandle {
            index,
            generation: self.generation,
        };
        self.slots[index] = Some(CaptureSlot {
            path: path.to_string(),
            generation: self.generation,
            resolution: negotiated,
            device,
            buffers,
        });
        info!(
            target: "edgestream::capture",
            "Capture started on {} at {} with {} buffers, handle {}",
            path, negotiated, granted, handle
        );
        Ok(handle)
    }

    /// Returns whether a device was actually stopped.
    pub fn stop(&mut self, handle: CaptureHandle) -> bool {
        if self.slot(handle).is_err() {
            return false;
        }
        self.teardown(handle.index)
    }

    pub fn stop_path(&mut self, path: &str) -> bool {
        match self.find(path) {
            Some(handle) => self.teardown(handle.index),
            None => false,
        }
    }

    fn teardown(&mut self, index: usize) -> bool {
        let Some(CaptureSlot {
            path,
            mut device,
            buffers,
            ..
        }) = self.slots[index].take()
        else {
            return false;
        };
        if let Err(e) = device.stream_off() {
            warn!(target: "edgestream::capture", "Device {}: stream off failed: {}", path, e);
        }
        drop(device);
        let mapped = buffers.len();
        drop(buffers);
        info!(
            target: "edgestream::capture",
            "Capture stopped on {}, {} buffers unmapped", path, mapped
        );
        true
    }

    pub fn stop_all(&mut self) {
        for index in 0..self.slots.len() {
            self.teardown(index);
        }
    }

    /// Takes the next filled buffer from the driver.
    pub fn acquire_buffer(&mut self, handle: CaptureHandle) -> Result<BufferToken, CaptureError> {
        let slot = self.slot_mut(handle)?;
        let dq = match slot.device.dequeue_buffer() {
            Ok(dq) => dq,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(CaptureError::FrameNotReady)
            }
            Err(e) => return Err(CaptureError::device(&slot.path, "dequeue buffer", e)),
        };
        let buffer = slot
            .buffers
            .get_mut(dq.index)
            .ok_or(CaptureError::BufferOutOfRange { index: dq.index })?;
        if buffer.checked_out {
            return Err(CaptureError::BufferCheckedOut { index: dq.index });
        }
        buffer.checked_out = true;
        let len = buffer.mapping.as_ref().len();
        Ok(BufferToken {
            handle,
            index: dq.index,
            bytes_used: dq.bytes_used.min(len),
            resolution: slot.resolution,
        })
    }

    pub fn frame(&self, token: &BufferToken) -> Result<&[u8], CaptureError> {
        let slot = self.slot(token.handle)?;
        let buffer = slot
            .buffers
            .get(token.index)
            .ok_or(CaptureError::BufferOutOfRange { index: token.index })?;
        if !buffer.checked_out {
            return Err(CaptureError::BufferNotCheckedOut { index: token.index });
        }
        Ok(&buffer.mapping.as_ref()[..token.bytes_used])
    }

    /// Hands the buffer back to the driver; failures are only logged.
    pub fn release_buffer(&mut self, token: BufferToken) {
        let handle = token.handle;
        let index = token.index;
        if let Err(e) = self.try_release_buffer(token) {
            warn!(
                target: "edgestream::capture",
                "Failed to release buffer {} of handle {}: {}", index, handle, e
            );
        }
    }

    pub fn try_release_buffer(&mut self, token: BufferToken) -> Result<(), CaptureError> {
        let slot = self.slot_mut(token.handle)?;
        let buffer = slot
            .buffers
            .get_mut(token.index)
            .ok_or(CaptureError::BufferOutOfRange { index: token.index })?;
        if !buffer.checked_out {
            return Err(CaptureError::BufferNotCheckedOut { index: token.index });
        }
        if let Err(e) = slot.device.queue_buffer(token.index as u32) {
            // the slot would run one buffer short for good
            let err = CaptureError::device(&slot.path, "queue buffer", e);
            self.teardown(token.handle.index);
            return Err(err);
        }
        buffer.checked_out = false;
        Ok(())
    }

    fn slot(&self, handle: CaptureHandle) -> Result<&CaptureSlot<P::Device>, CaptureError> {
        self.slots
            .get(handle.index)
            .and_then(|s| s.as_ref())
            .filter(|s| s.generation == handle.generation)
            .ok_or(CaptureError::InactiveHandle(handle))
    }

    fn slot_mut(
        &mut self,
        handle: CaptureHandle,
    ) -> Result<&mut CaptureSlot<P::Device>, CaptureError> {
        self.slots
            .get_mut(handle.index)
            .and_then(|s| s.as_mut())
            .filter(|s| s.generation == handle.generation)
            .ok_or(CaptureError::InactiveHandle(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{MockFailure, MockProvider};

    fn config(max_devices: usize) -> CaptureConfiguration {
        CaptureConfiguration {
            max_devices,
            buffer_count: 4,
            ..CaptureConfiguration::default()
        }
    }

    #[test]
    fn test_start_same_path_twice() -> anyhow::Result<()> {
        let provider = MockProvider::default();
        let mut registry = CaptureRegistry::new(provider.clone(), config(4));
        registry.start("/dev/video0", Resolution::new(320, 240))?;
        let err = registry
            .start("/dev/video0", Resolution::new(320, 240))
            .unwrap_err();
        assert!(matches!(err, CaptureError::AlreadyActive { .. }));
        assert_eq!(registry.active_count(), 1);
        assert_eq!(provider.open_devices(), 1);
        Ok(())
    }

    #[test]
    fn test_capacity_exceeded_leaks_nothing() -> anyhow::Result<()> {
        let provider = MockProvider::default();
        let mut registry = CaptureRegistry::new(provider.clone(), config(2));
        registry.start("/dev/video0", Resolution::default())?;
        registry.start("/dev/video1", Resolution::default())?;
        let open = provider.open_devices();
        let mapped = provider.mapped_buffers();
        let err = registry
            .start("/dev/video2", Resolution::default())
            .unwrap_err();
        assert!(matches!(err, CaptureError::CapacityExceeded { capacity: 2 }));
        assert_eq!(provider.open_devices(), open);
        assert_eq!(provider.mapped_buffers(), mapped);
        Ok(())
    }

    #[test]
    fn test_partial_start_unwinds() {
        for failure in [
            MockFailure::MapBuffer(2),
            MockFailure::QueueBuffer(3),
            MockFailure::StreamOn,
            MockFailure::SetFormat,
        ] {
            let provider = MockProvider::default().with_failure(failure);
            let mut registry = CaptureRegistry::new(provider.clone(), config(4));
            let err = registry
                .start("/dev/video0", Resolution::default())
                .unwrap_err();
            assert!(matches!(err, CaptureError::Device { .. }), "{:?}", failure);
            assert_eq!(provider.open_devices(), 0, "{:?}", failure);
            assert_eq!(provider.mapped_buffers(), 0, "{:?}", failure);
            assert_eq!(registry.active_count(), 0);
            assert!(registry.find("/dev/video0").is_none());
        }
    }

    #[test]
    fn test_default_resolution_fallback() -> anyhow::Result<()> {
        let mut registry = CaptureRegistry::new(MockProvider::default(), config(1));
        let handle = registry.start("/dev/video0", Resolution::new(0, 480))?;
        assert_eq!(registry.resolution(handle), Some(Resolution::new(640, 480)));
        Ok(())
    }

    #[test]
    fn test_stop_is_idempotent() -> anyhow::Result<()> {
        let provider = MockProvider::default();
        let mut registry = CaptureRegistry::new(provider.clone(), config(2));
        let handle = registry.start("/dev/video0", Resolution::default())?;
        assert!(registry.stop(handle));
        assert!(!registry.stop(handle));
        assert!(!registry.stop_path("/dev/video0"));
        assert_eq!(provider.open_devices(), 0);
        assert_eq!(provider.mapped_buffers(), 0);
        assert_eq!(provider.stream_offs(), 1);
        Ok(())
    }

    #[test]
    fn test_acquire_release_cycle() -> anyhow::Result<()> {
        let provider = MockProvider::default();
        let mut registry = CaptureRegistry::new(provider.clone(), config(1));
        let handle = registry.start("/dev/video0", Resolution::new(4, 2))?;
        for _ in 0..10 {
            let token = registry.acquire_buffer(handle)?;
            assert_eq!(token.resolution(), Resolution::new(4, 2));
            let frame = registry.frame(&token)?;
            assert_eq!(frame.len(), 4 * 2 * 2);
            assert!(frame.iter().all(|b| *b == token.index() as u8));
            registry.try_release_buffer(token)?;
        }
        Ok(())
    }

    #[test]
    fn test_release_after_stop_is_rejected() -> anyhow::Result<()> {
        let provider = MockProvider::default();
        let mut registry = CaptureRegistry::new(provider.clone(), config(1));
        let handle = registry.start("/dev/video0", Resolution::default())?;
        let token = registry.acquire_buffer(handle)?;
        registry.stop(handle);
        // the same slot is reused by a new activation
        let second = registry.start("/dev/video0", Resolution::default())?;
        assert_eq!(second.id(), handle.id());
        assert!(registry.frame(&token).is_err());
        let err = registry.try_release_buffer(token).unwrap_err();
        assert!(matches!(err, CaptureError::InactiveHandle(_)));
        Ok(())
    }

    #[test]
    fn test_failed_requeue_stops_the_capture() -> anyhow::Result<()> {
        let provider = MockProvider::default().with_failure(MockFailure::RequeueBuffer(0));
        let mut registry = CaptureRegistry::new(provider.clone(), config(1));
        let handle = registry.start("/dev/video0", Resolution::default())?;
        let token = registry.acquire_buffer(handle)?;
        assert_eq!(token.index(), 0);
        let err = registry.try_release_buffer(token).unwrap_err();
        assert!(matches!(err, CaptureError::Device { op: "queue buffer", .. }));
        assert!(registry.find("/dev/video0").is_none());
        assert!(matches!(
            registry.acquire_buffer(handle),
            Err(CaptureError::InactiveHandle(_))
        ));
        assert_eq!(provider.open_devices(), 0);
        assert_eq!(provider.mapped_buffers(), 0);
        Ok(())
    }

    #[test]
    fn test_driver_returning_checked_out_buffer() -> anyhow::Result<()> {
        let provider = MockProvider::default().with_failure(MockFailure::RepeatDequeue);
        let mut registry = CaptureRegistry::new(provider, config(1));
        let handle = registry.start("/dev/video0", Resolution::default())?;
        let _token = registry.acquire_buffer(handle)?;
        let err = registry.acquire_buffer(handle).unwrap_err();
        assert!(matches!(err, CaptureError::BufferCheckedOut { index: 0 }));
        Ok(())
    }

    #[test]
    fn test_frame_not_ready() -> anyhow::Result<()> {
        let provider = MockProvider::default();
        let mut registry = CaptureRegistry::new(provider.clone(), config(1));
        let handle = registry.start("/dev/video0", Resolution::default())?;
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(registry.acquire_buffer(handle)?);
        }
        assert!(matches!(
            registry.acquire_buffer(handle),
            Err(CaptureError::FrameNotReady)
        ));
        for token in held {
            registry.release_buffer(token);
        }
        assert!(registry.acquire_buffer(handle).is_ok());
        Ok(())
    }

    #[test]
    fn test_enumerate_devices() {
        let provider = MockProvider::default()
            .with_nodes(3)
            .with_failure(MockFailure::QueryCapability("/dev/video1".to_string()));
        let registry = CaptureRegistry::new(provider.clone(), config(1));
        let devices = registry.enumerate_devices();
        let paths: Vec<_> = devices.iter().map(|d| d.device.as_str()).collect();
        assert_eq!(paths, vec!["/dev/video0", "/dev/video2"]);
        assert_eq!(devices[0].driver, "mock");
        assert_eq!(devices[0].resolutions[0], Resolution::new(640, 480));
        assert_eq!(provider.open_devices(), 0);
    }
}

//! In-memory doubles of the capture driver, the accelerator and the
//! client transport.

use crate::accelerator::{AcceleratorDevice, AcceleratorProvider, Region, RegionTable};
use crate::capture::{Capability, DequeuedBuffer, DeviceProvider, Resolution, VideoDevice};
use crate::outbound::OutboundMessage;
use crate::session::{Transport, TransportError};
use hashbrown::HashMap;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

fn injected(what: &str) -> io::Error {
    io::Error::other(format!("injected {} failure", what))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFailure {
    MapBuffer(u32),
    QueueBuffer(u32),
    /// Queueing fails once the stream is running.
    RequeueBuffer(u32),
    StreamOn,
    SetFormat,
    /// The driver keeps handing out buffer 0.
    RepeatDequeue,
    QueryCapability(String),
}

#[derive(Debug, Default)]
struct CaptureCounters {
    open_devices: usize,
    mapped_buffers: usize,
    stream_offs: usize,
}

#[derive(Debug, Clone)]
pub struct MockProvider {
    nodes: usize,
    failure: Option<MockFailure>,
    counters: Rc<RefCell<CaptureCounters>>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            nodes: 4,
            failure: None,
            counters: Rc::default(),
        }
    }
}

impl MockProvider {
    pub fn with_nodes(mut self, nodes: usize) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_failure(mut self, failure: MockFailure) -> Self {
        self.failure = Some(failure);
        self
    }

    pub fn open_devices(&self) -> usize {
        self.counters.borrow().open_devices
    }

    pub fn mapped_buffers(&self) -> usize {
        self.counters.borrow().mapped_buffers
    }

    pub fn stream_offs(&self) -> usize {
        self.counters.borrow().stream_offs
    }
}

impl DeviceProvider for MockProvider {
    type Device = MockDevice;

    fn open(&self, path: &str) -> io::Result<MockDevice> {
        let known = (0..self.nodes).any(|n| path == format!("/dev/video{}", n));
        if !known {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }
        self.counters.borrow_mut().open_devices += 1;
        Ok(MockDevice {
            path: path.to_string(),
            failure: self.failure.clone(),
            counters: self.counters.clone(),
            resolution: Resolution::new(640, 480),
            queued: VecDeque::new(),
            streaming: false,
        })
    }
}

pub struct MockDevice {
    path: String,
    failure: Option<MockFailure>,
    counters: Rc<RefCell<CaptureCounters>>,
    resolution: Resolution,
    queued: VecDeque<u32>,
    streaming: bool,
}

impl MockDevice {
    fn frame_len(&self) -> usize {
        self.resolution.width as usize * self.resolution.height as usize * 2
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.counters.borrow_mut().open_devices -= 1;
    }
}

/// Buffer memory filled with its own index.
pub struct MockMapping {
    data: Vec<u8>,
    counters: Rc<RefCell<CaptureCounters>>,
}

impl AsRef<[u8]> for MockMapping {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for MockMapping {
    fn drop(&mut self) {
        self.counters.borrow_mut().mapped_buffers -= 1;
    }
}

impl VideoDevice for MockDevice {
    type Mapping = MockMapping;

    fn query_capability(&self) -> io::Result<Capability> {
        if matches!(&self.failure, Some(MockFailure::QueryCapability(p)) if *p == self.path) {
            return Err(injected("capability"));
        }
        Ok(Capability {
            driver: "mock".to_string(),
            card: "Mock camera".to_string(),
            version: 1,
            capabilities: 0x8400_0001,
            device_caps: 0x0400_0001,
        })
    }

    fn frame_sizes(&self) -> io::Result<Vec<Resolution>> {
        Ok(vec![
            Resolution::new(640, 480),
            Resolution::new(320, 240),
            Resolution::new(1280, 720),
        ])
    }

    fn set_format(&mut self, resolution: Resolution) -> io::Result<Resolution> {
        if self.failure == Some(MockFailure::SetFormat) {
            return Err(injected("set format"));
        }
        self.resolution = resolution;
        Ok(resolution)
    }

    fn set_frame_rate(&mut self, _fps: u32) -> io::Result<()> {
        Ok(())
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        Ok(count)
    }

    fn map_buffer(&mut self, index: u32) -> io::Result<MockMapping> {
        if self.failure == Some(MockFailure::MapBuffer(index)) {
            return Err(injected("map"));
        }
        self.counters.borrow_mut().mapped_buffers += 1;
        Ok(MockMapping {
            data: vec![index as u8; self.frame_len()],
            counters: self.counters.clone(),
        })
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        if self.failure == Some(MockFailure::QueueBuffer(index)) {
            return Err(injected("queue"));
        }
        if self.streaming && self.failure == Some(MockFailure::RequeueBuffer(index)) {
            return Err(injected("requeue"));
        }
        self.queued.push_back(index);
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> io::Result<DequeuedBuffer> {
        let index = if self.failure == Some(MockFailure::RepeatDequeue) {
            0
        } else {
            self.queued
                .pop_front()
                .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?
        };
        Ok(DequeuedBuffer {
            index: index as usize,
            bytes_used: self.frame_len(),
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        if self.failure == Some(MockFailure::StreamOn) {
            return Err(injected("stream on"));
        }
        self.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.counters.borrow_mut().stream_offs += 1;
        self.streaming = false;
        Ok(())
    }
}

/// Output tensor of the `tiny` model: 2x2 grid, one box per cell, classes
/// `cat` and `dog`, a confident `dog` in cell (0, 0).
pub fn tiny_yolo_tensor() -> Vec<f32> {
    // channel-major, 7 channels x 4 cells
    let cells = 4;
    let mut raw = vec![-10.0f32; 7 * cells];
    for v in raw.iter_mut().take(4 * cells) {
        *v = 0.0;
    }
    raw[4 * cells] = 10.0;
    raw[6 * cells] = 10.0;
    raw
}

pub const MOCK_AREA: Region = Region {
    address: 0x8000_0000,
    size: 0x2000_0000,
};

#[derive(Debug, Default)]
struct AcceleratorState {
    written: HashMap<u32, Vec<u8>>,
    assigned: Region,
    read_offset: usize,
    remaining: u32,
    starts: usize,
    resets: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MockAccelerator {
    /// Status polls answered "running" after each start; `None` never
    /// finishes.
    busy_polls: Option<u32>,
    state: Rc<RefCell<AcceleratorState>>,
}

impl MockAccelerator {
    pub fn with_busy_polls(mut self, busy_polls: Option<u32>) -> Self {
        self.busy_polls = busy_polls;
        self
    }

    /// Bytes written per assigned region address.
    pub fn written(&self) -> HashMap<u32, Vec<u8>> {
        self.state.borrow().written.clone()
    }

    pub fn starts(&self) -> usize {
        self.state.borrow().starts
    }

    pub fn resets(&self) -> usize {
        self.state.borrow().resets
    }
}

impl AcceleratorProvider for MockAccelerator {
    type Device = MockAccelerator;

    fn open(&self) -> io::Result<MockAccelerator> {
        Ok(self.clone())
    }
}

impl Read for MockAccelerator {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let output: Vec<u8> = tiny_yolo_tensor()
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let mut state = self.state.borrow_mut();
        let start = state.read_offset.min(output.len());
        let n = buf.len().min(output.len() - start);
        buf[..n].copy_from_slice(&output[start..start + n]);
        state.read_offset += n;
        Ok(n)
    }
}

impl Write for MockAccelerator {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        let address = state.assigned.address;
        state.written.entry(address).or_default().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AcceleratorDevice for MockAccelerator {
    fn area(&mut self) -> io::Result<Region> {
        Ok(MOCK_AREA)
    }

    fn assign(&mut self, region: Region) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.assigned = region;
        state.read_offset = 0;
        Ok(())
    }

    fn start(&mut self, _regions: &RegionTable) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.starts += 1;
        state.remaining = self.busy_polls.unwrap_or(u32::MAX);
        Ok(())
    }

    fn is_running(&mut self) -> io::Result<bool> {
        if self.busy_polls.is_none() {
            return Ok(true);
        }
        let mut state = self.state.borrow_mut();
        if state.remaining > 0 {
            state.remaining -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn reset(&mut self) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.resets += 1;
        state.remaining = 0;
        Ok(())
    }
}

/// Writes the `name` package under `root` with relative addresses starting
/// at `input_address`. Every file-backed region is 16 bytes; the output
/// region holds [`tiny_yolo_tensor`].
pub fn write_model_package(root: &Path, name: &str, input_address: u32) -> io::Result<PathBuf> {
    let package = root.join(name);
    fs::create_dir_all(&package)?;
    let map = [
        ("data_in", input_address, 0x10),
        ("drp_config", input_address + 0x100, 0x10),
        ("drp_param", input_address + 0x200, 0x10),
        ("desc_aimac", input_address + 0x300, 0x10),
        ("desc_drp", input_address + 0x400, 0x10),
        ("weight", input_address + 0x1000, 0x10),
        ("data_out", input_address + 0x2000, 0x70),
    ]
    .iter()
    .map(|(key, address, size)| format!("{} {:08x} {:08x}\n", key, address, size))
    .collect::<String>();
    fs::write(package.join(format!("{}_addrmap_intm.txt", name)), map)?;
    for suffix in [
        "drpcfg.mem",
        "drp_param.bin",
        "aimac_desc.bin",
        "drp_desc.bin",
        "weight.dat",
    ] {
        fs::write(package.join(format!("{}_{}", name, suffix)), [0x5au8; 16])?;
    }
    fs::write(
        package.join(format!("{}.json", name)),
        r#"{
            "model_type": "yolov3",
            "labels": ["cat", "dog"],
            "model_in_w": 416,
            "model_in_h": 416,
            "num_bb": 1,
            "thresh_prob": 0.5,
            "thresh_nms": 0.5,
            "num_grids": [2],
            "anchors": [208, 208]
        }"#,
    )?;
    Ok(package)
}

/// Records everything the session hands to the connection.
#[derive(Debug, Default)]
pub struct MockTransport {
    pub written: Vec<OutboundMessage>,
    pub writable_requests: usize,
    pub choked: bool,
    pub fail: bool,
    pub reads_paused: bool,
    pub pauses: usize,
    pub resumes: usize,
}

impl Transport for MockTransport {
    fn request_writable(&mut self) {
        self.writable_requests += 1;
    }

    fn write(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
        if self.fail {
            return Err(TransportError::Closed);
        }
        self.written.push(message.clone());
        Ok(())
    }

    fn is_choked(&self) -> bool {
        self.choked
    }

    fn set_reads_paused(&mut self, paused: bool) {
        if paused {
            self.pauses += 1;
        } else {
            self.resumes += 1;
        }
        self.reads_paused = paused;
    }
}

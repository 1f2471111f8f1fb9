//! Inference accelerator coordinator.
//!
//! One hardware unit, at most one loaded model and at most one run in
//! flight. A run is either driven cooperatively with [`start`] and
//! [`poll_completion`] from the service loop, or synchronously with
//! [`run_and_wait`].
//!
//! [`start`]: AcceleratorCoordinator::start
//! [`poll_completion`]: AcceleratorCoordinator::poll_completion
//! [`run_and_wait`]: AcceleratorCoordinator::run_and_wait

pub mod address_map;
pub mod drpai;

use crate::capture::Resolution;
use crate::configuration::AcceleratorConfiguration;
use crate::detection::{DecodeError, Detection, ModelDescriptor};
use address_map::{AddressMap, ADDRESS_MAP_SUFFIX};
use log::{debug, info, warn};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

pub const REGION_COUNT: usize = 7;
const CHUNK_SIZE: usize = 1024;

/// Memory regions known to the driver, in driver index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    Input,
    DrpConfig,
    DrpParam,
    AimacDesc,
    DrpDesc,
    Weight,
    Output,
}

impl RegionKind {
    pub const ALL: [RegionKind; REGION_COUNT] = [
        RegionKind::Input,
        RegionKind::DrpConfig,
        RegionKind::DrpParam,
        RegionKind::AimacDesc,
        RegionKind::DrpDesc,
        RegionKind::Weight,
        RegionKind::Output,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "data_in" | "input" => Some(RegionKind::Input),
            "drp_config" => Some(RegionKind::DrpConfig),
            "drp_param" => Some(RegionKind::DrpParam),
            "desc_aimac" => Some(RegionKind::AimacDesc),
            "desc_drp" => Some(RegionKind::DrpDesc),
            "weight" => Some(RegionKind::Weight),
            "data_out" | "output" => Some(RegionKind::Output),
            _ => None,
        }
    }

    /// Suffix of the package file backing the region, if any.
    pub fn file_suffix(self) -> Option<&'static str> {
        match self {
            RegionKind::DrpConfig => Some("drpcfg.mem"),
            RegionKind::AimacDesc => Some("aimac_desc.bin"),
            RegionKind::DrpDesc => Some("drp_desc.bin"),
            RegionKind::DrpParam => Some("drp_param.bin"),
            RegionKind::Weight => Some("weight.dat"),
            RegionKind::Input | RegionKind::Output => None,
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Device address and size, laid out as the driver expects.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Region {
    pub address: u32,
    pub size: u32,
}

pub type RegionTable = [Region; REGION_COUNT];

/// The accelerator driver. Reads and writes go to the region selected by the
/// last [`assign`](AcceleratorDevice::assign).
pub trait AcceleratorDevice: Read + Write {
    fn area(&mut self) -> io::Result<Region>;
    fn assign(&mut self, region: Region) -> io::Result<()>;
    fn start(&mut self, regions: &RegionTable) -> io::Result<()>;
    fn is_running(&mut self) -> io::Result<bool>;
    fn reset(&mut self) -> io::Result<()>;
}

pub trait AcceleratorProvider {
    type Device: AcceleratorDevice;

    fn open(&self) -> io::Result<Self::Device>;
}

#[derive(Debug, thiserror::Error)]
pub enum AcceleratorError {
    #[error("Accelerator is unavailable: {0}")]
    Unavailable(io::Error),
    #[error("Accelerator {op} failed: {source}")]
    Io {
        op: &'static str,
        source: io::Error,
    },
    #[error("Model {0} not found")]
    ModelNotFound(String),
    #[error("No address map in {0}")]
    MissingAddressMap(PathBuf),
    #[error("Address map line {line}: {reason}")]
    InvalidAddressMap { line: usize, reason: String },
    #[error("Address map does not declare the {0} region")]
    MissingRegion(RegionKind),
    #[error("No file for the {region} region in {package}")]
    MissingRegionFile { region: RegionKind, package: PathBuf },
    #[error("{file}: size {actual} does not match {region} region size {expected}")]
    SizeMismatch {
        region: RegionKind,
        file: PathBuf,
        expected: u64,
        actual: u64,
    },
    #[error("No model is loaded")]
    NotLoaded,
    #[error("A run is already in flight")]
    AlreadyRunning,
    #[error("No matching run is in flight")]
    NoRunInFlight,
    #[error("Input is {actual} bytes, the model expects {expected}")]
    InputSize { expected: usize, actual: usize },
    #[error("timeout after {polls} polls")]
    Timeout { polls: u32 },
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

fn io_err(op: &'static str) -> impl FnOnce(io::Error) -> AcceleratorError {
    move |source| AcceleratorError::Io { op, source }
}

struct LoadedModel {
    name: String,
    regions: RegionTable,
    descriptor: ModelDescriptor,
}

struct RunState {
    id: u64,
    polls: u32,
    resolution: Resolution,
}

/// Issued by [`AcceleratorCoordinator::start`]; only the holder can collect
/// the run.
#[derive(Debug, PartialEq, Eq)]
pub struct RunTicket {
    id: u64,
}

#[derive(Debug)]
pub enum RunProgress {
    Running,
    Completed(Vec<Detection>),
}

pub struct AcceleratorCoordinator<P: AcceleratorProvider> {
    provider: P,
    config: AcceleratorConfiguration,
    device: Option<P::Device>,
    model: Option<LoadedModel>,
    run: Option<RunState>,
    next_run: u64,
}

fn open_device<'a, P: AcceleratorProvider>(
    provider: &P,
    device: &'a mut Option<P::Device>,
) -> Result<&'a mut P::Device, AcceleratorError> {
    if device.is_none() {
        let opened = provider.open().map_err(AcceleratorError::Unavailable)?;
        *device = Some(opened);
    }
    device.as_mut().ok_or(AcceleratorError::NotLoaded)
}

/// Returns the first entry in `package` whose name ends with `suffix`.
fn find_by_suffix(package: &Path, suffix: &str) -> Result<Option<PathBuf>, AcceleratorError> {
    let mut found: Vec<PathBuf> = fs::read_dir(package)
        .map_err(io_err("read model package"))?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(suffix))
        .map(|e| e.path())
        .collect();
    found.sort();
    Ok(found.into_iter().next())
}

fn load_region_file<D: AcceleratorDevice>(
    device: &mut D,
    kind: RegionKind,
    region: Region,
    path: &Path,
) -> Result<(), AcceleratorError> {
    let actual = fs::metadata(path).map_err(io_err("stat region file"))?.len();
    if actual != region.size as u64 {
        return Err(AcceleratorError::SizeMismatch {
            region: kind,
            file: path.to_path_buf(),
            expected: region.size as u64,
            actual,
        });
    }
    device.assign(region).map_err(io_err("assign"))?;
    let mut file = File::open(path).map_err(io_err("open region file"))?;
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut chunk).map_err(io_err("read region file"))?;
        if n == 0 {
            break;
        }
        device
            .write_all(&chunk[..n])
            .map_err(io_err("write region"))?;
    }
    Ok(())
}

impl<P: AcceleratorProvider> AcceleratorCoordinator<P> {
    pub fn new(provider: P, config: AcceleratorConfiguration) -> Self {
        Self {
            provider,
            config,
            device: None,
            model: None,
            run: None,
            next_run: 0,
        }
    }

    pub fn models_root(&self) -> &Path {
        &self.config.models_root
    }

    pub fn loaded_model(&self) -> Option<&str> {
        self.model.as_ref().map(|m| m.name.as_str())
    }

    pub fn descriptor(&self) -> Option<&ModelDescriptor> {
        self.model.as_ref().map(|m| &m.descriptor)
    }

    pub fn is_busy(&self) -> bool {
        self.run.is_some()
    }

    /// Loads the package `models_root/name`. On failure no model is loaded.
    pub fn load_model(&mut self, name: &str) -> Result<(), AcceleratorError> {
        if self.run.is_some() {
            return Err(AcceleratorError::AlreadyRunning);
        }
        if name.is_empty() || name.contains('/') || name == ".." {
            return Err(AcceleratorError::ModelNotFound(name.to_string()));
        }
        let package = self.config.models_root.join(name);
        if !package.is_dir() {
            return Err(AcceleratorError::ModelNotFound(name.to_string()));
        }

        let map_path = find_by_suffix(&package, ADDRESS_MAP_SUFFIX)?
            .ok_or_else(|| AcceleratorError::MissingAddressMap(package.clone()))?;
        let map = AddressMap::parse(
            &fs::read_to_string(&map_path).map_err(io_err("read address map"))?,
        )?;
        let descriptor = ModelDescriptor::from_package(
            &self.config.models_root,
            name,
            self.config.nms_containment_epsilon,
        )?;

        let mut files = Vec::new();
        for kind in RegionKind::ALL {
            let Some(suffix) = kind.file_suffix() else {
                continue;
            };
            match find_by_suffix(&package, suffix)? {
                Some(path) => files.push((kind, path)),
                None if map.get(kind).is_some_and(|r| r.size > 0) => {
                    return Err(AcceleratorError::MissingRegionFile {
                        region: kind,
                        package,
                    })
                }
                None => {}
            }
        }

        let device = open_device(&self.provider, &mut self.device)?;
        let area = device.area().map_err(io_err("get area"))?;
        let regions = map.resolve(area, self.config.addressing)?;
        debug!(
            target: "edgestream::accelerator",
            "Model {}: {:?} addressing, device area {:#x}+{:#x}",
            name,
            self.config.addressing,
            area.address,
            area.size
        );

        // device memory is about to be overwritten
        self.model = None;
        for (kind, path) in &files {
            load_region_file(device, *kind, regions[kind.index()], path)?;
        }

        info!(
            target: "edgestream::accelerator",
            "Model {} loaded: {:?}, {} labels",
            name,
            descriptor.family(),
            descriptor.labels().len()
        );
        self.model = Some(LoadedModel {
            name: name.to_string(),
            regions,
            descriptor,
        });
        Ok(())
    }

    /// Copies `input` into the input region and starts the hardware.
    /// `resolution` is the geometry detections are scaled to.
    pub fn start(
        &mut self,
        input: &[u8],
        resolution: Resolution,
    ) -> Result<RunTicket, AcceleratorError> {
        let model = self.model.as_ref().ok_or(AcceleratorError::NotLoaded)?;
        if self.run.is_some() {
            return Err(AcceleratorError::AlreadyRunning);
        }
        let device = self.device.as_mut().ok_or(AcceleratorError::NotLoaded)?;
        let input_region = model.regions[RegionKind::Input.index()];
        if input.len() != input_region.size as usize {
            return Err(AcceleratorError::InputSize {
                expected: input_region.size as usize,
                actual: input.len(),
            });
        }
        device.assign(input_region).map_err(io_err("assign"))?;
        device.write_all(input).map_err(io_err("write input"))?;
        device.start(&model.regions).map_err(io_err("start"))?;

        self.next_run += 1;
        self.run = Some(RunState {
            id: self.next_run,
            polls: 0,
            resolution,
        });
        Ok(RunTicket { id: self.next_run })
    }

    pub fn poll_is_running(&mut self) -> Result<bool, AcceleratorError> {
        match self.device.as_mut() {
            Some(device) => device.is_running().map_err(io_err("get status")),
            None => Ok(false),
        }
    }

    fn check_ticket(&self, ticket: &RunTicket) -> Result<(), AcceleratorError> {
        match &self.run {
            Some(run) if run.id == ticket.id => Ok(()),
            _ => Err(AcceleratorError::NoRunInFlight),
        }
    }

    /// One cooperative poll. Every call counts against the poll budget; a
    /// run still going once the budget is spent is reset and reported as
    /// `Timeout`.
    pub fn poll_completion(
        &mut self,
        ticket: &RunTicket,
    ) -> Result<RunProgress, AcceleratorError> {
        self.check_ticket(ticket)?;
        let running = match self.poll_is_running() {
            Ok(r) => r,
            Err(e) => {
                self.abort_run();
                return Err(e);
            }
        };
        if !running {
            return self.collect(ticket).map(RunProgress::Completed);
        }
        let polls = match self.run.as_mut() {
            Some(run) => {
                run.polls += 1;
                run.polls
            }
            None => return Err(AcceleratorError::NoRunInFlight),
        };
        if polls >= self.config.max_polls {
            self.abort_run();
            return Err(AcceleratorError::Timeout { polls });
        }
        Ok(RunProgress::Running)
    }

    /// Reads the output tensor of a finished run and decodes it.
    pub fn collect(&mut self, ticket: &RunTicket) -> Result<Vec<Detection>, AcceleratorError> {
        self.check_ticket(ticket)?;
        let Some(run) = self.run.take() else {
            return Err(AcceleratorError::NoRunInFlight);
        };
        let model = self.model.as_ref().ok_or(AcceleratorError::NotLoaded)?;
        let device = self.device.as_mut().ok_or(AcceleratorError::NotLoaded)?;
        let output = model.regions[RegionKind::Output.index()];
        device.assign(output).map_err(io_err("assign"))?;
        let mut bytes = vec![0u8; output.size as usize];
        device
            .read_exact(&mut bytes)
            .map_err(io_err("read output"))?;
        let raw: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(model
            .descriptor
            .postprocess(&raw, run.resolution.width, run.resolution.height)?)
    }

    /// Drops the run held by `ticket`, resetting the hardware if it is
    /// still busy.
    pub fn abandon(&mut self, ticket: RunTicket) {
        if self.check_ticket(&ticket).is_ok() {
            self.abort_run();
        }
    }

    fn abort_run(&mut self) {
        self.run = None;
        if let Some(device) = self.device.as_mut() {
            if let Err(e) = device.reset() {
                warn!(target: "edgestream::accelerator", "Accelerator reset failed: {}", e);
            }
        }
    }

    /// Starts a run and blocks, polling every `poll_interval`, for at most
    /// `timeout_ticks` polls.
    pub fn run_and_wait(
        &mut self,
        input: &[u8],
        resolution: Resolution,
        timeout_ticks: u32,
    ) -> Result<Vec<Detection>, AcceleratorError> {
        let ticket = self.start(input, resolution)?;
        for poll in 1..=timeout_ticks {
            match self.poll_is_running() {
                Ok(false) => return self.collect(&ticket),
                Ok(true) if poll < timeout_ticks => std::thread::sleep(self.config.poll_interval),
                Ok(true) => {}
                Err(e) => {
                    self.abandon(ticket);
                    return Err(e);
                }
            }
        }
        self.abandon(ticket);
        Err(AcceleratorError::Timeout {
            polls: timeout_ticks,
        })
    }

    /// Forgets the loaded model. The device stays open for the next load.
    pub fn unload_model(&mut self) {
        if let Some(ticket_id) = self.run.as_ref().map(|r| r.id) {
            self.abandon(RunTicket { id: ticket_id });
        }
        if let Some(model) = self.model.take() {
            info!(target: "edgestream::accelerator", "Model {} unloaded", model.name);
        }
    }
}

//! Per-connection orchestration.
//!
//! A [`Session`] is driven by transport events. Device and accelerator state
//! lives in the [`ServiceContext`] owned by the service loop and is passed
//! into every event handler.

pub mod flow_control;

pub use flow_control::{FlowControl, FlowSignal};

use crate::accelerator::{
    AcceleratorCoordinator, AcceleratorError, AcceleratorProvider, RunProgress, RunTicket,
};
use crate::capture::{
    BufferToken, CaptureError, CaptureHandle, CaptureRegistry, DeviceProvider, Resolution,
};
use crate::compress::{self, CompressError, FrameCompressor};
use crate::configuration::SessionConfiguration;
use crate::fps_meter::FpsMeter;
use crate::outbound::{OutboundMessage, OutboundQueue};
use crate::protocol::{self, Command, ProtocolError};
use log::{debug, info, warn};
use serde_json::Value;
use std::io;
use uuid::Uuid;

pub const CAMERA_STREAM: &str = "camera";
pub const ACCELERATOR_STREAM: &str = "drpai+camera";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection is closed")]
    Closed,
    #[error("Transport I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("Transport failed: {0}")]
    Other(String),
}

/// Calls the orchestrator makes back into the connection.
pub trait Transport {
    /// Asks for another writable opportunity.
    fn request_writable(&mut self);
    fn write(&mut self, message: &OutboundMessage) -> Result<(), TransportError>;
    /// True while the transport cannot take more bytes this opportunity.
    fn is_choked(&self) -> bool;
    fn set_reads_paused(&mut self, paused: bool);
}

/// Inbound message as delivered by the transport.
#[derive(Debug, Clone, Copy)]
pub struct Inbound<'a> {
    pub data: &'a [u8],
    pub first: bool,
    pub last: bool,
    pub binary: bool,
}

impl<'a> Inbound<'a> {
    pub fn text(data: &'a [u8]) -> Self {
        Self {
            data,
            first: true,
            last: true,
            binary: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Accelerator(#[from] AcceleratorError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Compress(#[from] CompressError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Failed to serialize response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{event} is not allowed while {state}")]
    IllegalTransition {
        state: &'static str,
        event: &'static str,
    },
    #[error("Device {0} is not captured by this connection")]
    NotCapturing(String),
}

/// Process-wide resources shared by all sessions of one service loop.
pub struct ServiceContext<P: DeviceProvider, A: AcceleratorProvider> {
    pub capture: CaptureRegistry<P>,
    pub accelerator: AcceleratorCoordinator<A>,
    pub config: SessionConfiguration,
}

impl<P: DeviceProvider, A: AcceleratorProvider> ServiceContext<P, A> {
    pub fn new(
        capture: CaptureRegistry<P>,
        accelerator: AcceleratorCoordinator<A>,
        config: SessionConfiguration,
    ) -> Self {
        Self {
            capture,
            accelerator,
            config,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Capturing(CaptureHandle),
}

impl SessionState {
    fn label(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Capturing(_) => "capturing",
        }
    }
}

enum CaptureEvent<'a> {
    Start {
        device: &'a str,
        resolution: Resolution,
    },
    Stop {
        device: Option<&'a str>,
    },
}

pub struct Session {
    id: Uuid,
    state: SessionState,
    queue: OutboundQueue,
    flow: FlowControl,
    compressor: Box<dyn FrameCompressor>,
    accelerator_enabled: bool,
    pending_run: Option<RunTicket>,
    max_writes_per_tick: usize,
    frames: FpsMeter,
    dropped: u64,
}

impl Session {
    /// Connection established.
    pub fn new(config: &SessionConfiguration) -> Self {
        let queue = &config.queue;
        let id = Uuid::now_v7();
        info!(target: "edgestream::session", "Session {} established", id);
        Self {
            id,
            state: SessionState::Idle,
            queue: OutboundQueue::new(queue.capacity),
            flow: FlowControl::new(queue.capacity, queue.low_water_mark, queue.resume_margin),
            compressor: compress::compressor(&config.compression),
            accelerator_enabled: false,
            pending_run: None,
            max_writes_per_tick: queue.max_writes_per_tick.max(1),
            frames: FpsMeter::new(config.stats_period),
            dropped: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn accelerator_enabled(&self) -> bool {
        self.accelerator_enabled
    }

    pub fn on_receive<P, A, T>(
        &mut self,
        ctx: &mut ServiceContext<P, A>,
        transport: &mut T,
        inbound: Inbound<'_>,
    ) where
        P: DeviceProvider,
        A: AcceleratorProvider,
        T: Transport,
    {
        if inbound.binary {
            debug!(
                target: "edgestream::session",
                "Session {}: dropping {} byte binary message", self.id, inbound.data.len()
            );
            return;
        }
        if !(inbound.first && inbound.last) {
            debug!(
                target: "edgestream::session",
                "Session {}: dropping fragmented message", self.id
            );
            return;
        }
        if self.queue.free_count() == 0 {
            warn!(
                target: "edgestream::session",
                "Session {}: outbound queue full, request dropped", self.id
            );
            self.dropped += 1;
            return;
        }

        let reply = match protocol::parse_request(inbound.data) {
            Ok(command) => {
                let name = command.name();
                match self.handle_command(ctx, command) {
                    Ok(value) => protocol::success(name, &value)
                        .unwrap_or_else(|e| protocol::failure(name, e)),
                    Err(e) => {
                        warn!(target: "edgestream::session", "Session {}: {} failed: {}", self.id, name, e);
                        protocol::failure(name, e)
                    }
                }
            }
            Err(e @ ProtocolError::InvalidPayload { .. }) => {
                warn!(target: "edgestream::session", "Session {}: {}", self.id, e);
                protocol::failure(e.name(), &e)
            }
            Err(e) => {
                warn!(target: "edgestream::session", "Session {}: {}", self.id, e);
                protocol::failure(e.name(), protocol::UNKNOWN_REQUEST)
            }
        };
        self.enqueue(OutboundMessage::text(reply));
        self.update_flow(transport);
        transport.request_writable();
    }

    fn handle_command<P, A>(
        &mut self,
        ctx: &mut ServiceContext<P, A>,
        command: Command,
    ) -> Result<Value, SessionError>
    where
        P: DeviceProvider,
        A: AcceleratorProvider,
    {
        match command {
            Command::ListDevices => Ok(serde_json::to_value(ctx.capture.enumerate_devices())?),
            Command::StartCapture { device, resolution } => self.apply(
                ctx,
                CaptureEvent::Start {
                    device: &device,
                    resolution,
                },
            ),
            Command::StopCapture { device } => self.apply(
                ctx,
                CaptureEvent::Stop {
                    device: device.as_deref(),
                },
            ),
            Command::LoadModel { model } => {
                self.abandon_run(ctx);
                self.accelerator_enabled = false;
                ctx.accelerator.load_model(&model)?;
                self.accelerator_enabled = true;
                Ok(Value::String(model))
            }
            Command::UnloadModel => {
                self.abandon_run(ctx);
                self.accelerator_enabled = false;
                Ok(Value::Null)
            }
        }
    }

    /// Capture state transitions.
    fn apply<P, A>(
        &mut self,
        ctx: &mut ServiceContext<P, A>,
        event: CaptureEvent<'_>,
    ) -> Result<Value, SessionError>
    where
        P: DeviceProvider,
        A: AcceleratorProvider,
    {
        match (self.state, event) {
            (SessionState::Idle, CaptureEvent::Start { device, resolution }) => {
                let handle = ctx.capture.start(device, resolution)?;
                self.state = SessionState::Capturing(handle);
                Ok(Value::from(handle.id()))
            }
            (state @ SessionState::Capturing(_), CaptureEvent::Start { .. }) => {
                Err(SessionError::IllegalTransition {
                    state: state.label(),
                    event: protocol::CAMERA_DEVICE_PLAY,
                })
            }
            (SessionState::Capturing(handle), CaptureEvent::Stop { device }) => {
                let path = ctx.capture.path(handle).unwrap_or_default().to_string();
                if let Some(requested) = device {
                    if requested != path {
                        return Err(SessionError::NotCapturing(requested.to_string()));
                    }
                }
                self.abandon_run(ctx);
                ctx.capture.stop(handle);
                self.state = SessionState::Idle;
                Ok(Value::String(path))
            }
            (SessionState::Idle, CaptureEvent::Stop { .. }) => Ok(Value::Null),
        }
    }

    /// Writable opportunity: retire last tick's writes, run the frame
    /// pipeline, then hand queued messages to the transport. A transport
    /// error means the connection must be closed.
    pub fn on_writable<P, A, T>(
        &mut self,
        ctx: &mut ServiceContext<P, A>,
        transport: &mut T,
    ) -> Result<(), SessionError>
    where
        P: DeviceProvider,
        A: AcceleratorProvider,
        T: Transport,
    {
        self.queue.complete_previous_writes();
        self.update_flow(transport);

        if let SessionState::Capturing(handle) = self.state {
            self.capture_frame(ctx, handle);
        }

        let mut written = 0;
        while written < self.max_writes_per_tick && !transport.is_choked() {
            let Some(message) = self.queue.next_unwritten() else {
                break;
            };
            transport.write(message)?;
            self.queue.mark_written();
            written += 1;
        }
        self.update_flow(transport);

        if matches!(self.state, SessionState::Capturing(_)) || !self.queue.is_empty() {
            transport.request_writable();
        }
        Ok(())
    }

    fn capture_frame<P, A>(&mut self, ctx: &mut ServiceContext<P, A>, handle: CaptureHandle)
    where
        P: DeviceProvider,
        A: AcceleratorProvider,
    {
        if self.queue.free_count() == 0 {
            return;
        }
        let token = match ctx.capture.acquire_buffer(handle) {
            Ok(token) => token,
            Err(CaptureError::FrameNotReady) => return,
            Err(e) => {
                warn!(
                    target: "edgestream::session",
                    "Session {}: capture failed, stopping: {}", self.id, e
                );
                self.abandon_run(ctx);
                ctx.capture.stop(handle);
                self.state = SessionState::Idle;
                self.enqueue(OutboundMessage::text(protocol::failure(
                    protocol::CAMERA_DEVICE_PLAY,
                    e,
                )));
                return;
            }
        };
        if let Err(e) = self.process_frame(ctx, &token) {
            warn!(target: "edgestream::session", "Session {}: frame dropped: {}", self.id, e);
        }
        ctx.capture.release_buffer(token);

        self.frames.increment();
        if let Some(fps) = self.frames.report() {
            info!(
                target: "edgestream::session",
                "Session {}: {:.1} fps, {} messages queued, {} dropped",
                self.id,
                fps,
                self.queue.len(),
                self.dropped
            );
        }
    }

    fn process_frame<P, A>(
        &mut self,
        ctx: &mut ServiceContext<P, A>,
        token: &BufferToken,
    ) -> Result<(), SessionError>
    where
        P: DeviceProvider,
        A: AcceleratorProvider,
    {
        let resolution = token.resolution();
        let frame = ctx.capture.frame(token)?;
        let compressed = self.compressor.compress(frame, resolution)?;

        let mut delivered = false;
        if self.accelerator_enabled {
            match self.pending_run.take() {
                None => match ctx.accelerator.start(frame, resolution) {
                    Ok(ticket) => {
                        self.pending_run = Some(ticket);
                        self.enqueue(OutboundMessage::video_frame(ACCELERATOR_STREAM, &compressed));
                        delivered = true;
                    }
                    // another connection holds the accelerator
                    Err(AcceleratorError::AlreadyRunning) => {}
                    Err(e) => {
                        self.accelerator_enabled = false;
                        self.enqueue(OutboundMessage::text(protocol::failure(
                            protocol::DETECTION_RESULT,
                            e,
                        )));
                    }
                },
                Some(ticket) => match ctx.accelerator.poll_completion(&ticket) {
                    Ok(RunProgress::Running) => self.pending_run = Some(ticket),
                    Ok(RunProgress::Completed(detections)) => {
                        let text = protocol::detection_result(&detections)?;
                        self.enqueue(OutboundMessage::text(text));
                    }
                    Err(e) => {
                        self.enqueue(OutboundMessage::text(protocol::failure(
                            protocol::DETECTION_RESULT,
                            e,
                        )));
                    }
                },
            }
        }
        if !delivered {
            self.enqueue(OutboundMessage::video_frame(CAMERA_STREAM, &compressed));
        }
        Ok(())
    }

    /// Timer tick: keeps an active pipeline and a non-empty queue moving.
    pub fn on_tick<T: Transport>(&mut self, transport: &mut T) {
        if matches!(self.state, SessionState::Capturing(_)) || !self.queue.is_empty() {
            transport.request_writable();
        }
    }

    /// Connection closed: stop capture, drop the accelerator run, drain the
    /// queue.
    pub fn on_close<P, A>(&mut self, ctx: &mut ServiceContext<P, A>)
    where
        P: DeviceProvider,
        A: AcceleratorProvider,
    {
        self.abandon_run(ctx);
        self.accelerator_enabled = false;
        if let SessionState::Capturing(handle) = self.state {
            ctx.capture.stop(handle);
            self.state = SessionState::Idle;
        }
        let drained = self.queue.drain();
        info!(
            target: "edgestream::session",
            "Session {} closed, {} queued messages discarded, {} dropped in total",
            self.id,
            drained,
            self.dropped
        );
    }

    fn abandon_run<P, A>(&mut self, ctx: &mut ServiceContext<P, A>)
    where
        P: DeviceProvider,
        A: AcceleratorProvider,
    {
        if let Some(ticket) = self.pending_run.take() {
            ctx.accelerator.abandon(ticket);
        }
    }

    fn enqueue(&mut self, message: OutboundMessage) {
        if !self.queue.insert(message) {
            self.dropped += 1;
            debug!(
                target: "edgestream::session",
                "Session {}: outbound queue full, message dropped", self.id
            );
        }
    }

    fn update_flow<T: Transport>(&mut self, transport: &mut T) {
        match self.flow.observe(self.queue.free_count()) {
            Some(FlowSignal::PauseReads) => {
                debug!(target: "edgestream::session", "Session {}: pausing reads", self.id);
                transport.set_reads_paused(true);
            }
            Some(FlowSignal::ResumeReads) => {
                debug!(target: "edgestream::session", "Session {}: resuming reads", self.id);
                transport.set_reads_paused(false);
            }
            None => {}
        }
    }
}

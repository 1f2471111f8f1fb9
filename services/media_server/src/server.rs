use std::io::{self, ErrorKind};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use edgestream_core::accelerator::AcceleratorProvider;
use edgestream_core::capture::DeviceProvider;
use edgestream_core::outbound::{MessageKind, OutboundMessage};
use edgestream_core::session::{
    Inbound, ServiceContext, Session, SessionError, Transport, TransportError,
};
use log::{debug, info, warn};
use tungstenite::handshake::server::{NoCallback, ServerHandshake};
use tungstenite::handshake::{HandshakeError, MidHandshake};
use tungstenite::{accept, Message, WebSocket};

use crate::configuration::ListenConfiguration;

fn transport_error(e: tungstenite::Error) -> TransportError {
    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::Closed
        }
        tungstenite::Error::Io(e) => TransportError::Io(e),
        e => TransportError::Other(e.to_string()),
    }
}

fn would_block(e: &tungstenite::Error) -> bool {
    matches!(e, tungstenite::Error::Io(e) if e.kind() == ErrorKind::WouldBlock)
}

/// A non-blocking WebSocket seen through the session transport contract.
pub struct WsTransport {
    ws: WebSocket<TcpStream>,
    wants_writable: bool,
    reads_paused: bool,
    choked: bool,
    writes: u64,
}

impl WsTransport {
    fn new(ws: WebSocket<TcpStream>) -> Self {
        Self {
            ws,
            wants_writable: false,
            reads_paused: false,
            choked: false,
            writes: 0,
        }
    }

    /// Pushes buffered frames to the socket. The transport stays choked
    /// while the socket refuses bytes.
    fn flush(&mut self) -> Result<(), TransportError> {
        match self.ws.flush() {
            Ok(()) => {
                self.choked = false;
                Ok(())
            }
            Err(e) if would_block(&e) => {
                self.choked = true;
                Ok(())
            }
            Err(e) => Err(transport_error(e)),
        }
    }
}

impl Transport for WsTransport {
    fn request_writable(&mut self) {
        self.wants_writable = true;
    }

    fn write(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
        let frame = match message.kind() {
            MessageKind::Text => {
                Message::Text(String::from_utf8_lossy(message.payload()).into_owned())
            }
            MessageKind::Binary => Message::Binary(message.payload().to_vec()),
        };
        self.writes += 1;
        match self.ws.write(frame) {
            Ok(()) => Ok(()),
            // buffered, the socket is full
            Err(e) if would_block(&e) => {
                self.choked = true;
                Ok(())
            }
            Err(e) => Err(transport_error(e)),
        }
    }

    fn is_choked(&self) -> bool {
        self.choked
    }

    fn set_reads_paused(&mut self, paused: bool) {
        self.reads_paused = paused;
    }
}

struct Connection {
    peer: SocketAddr,
    session: Session,
    transport: WsTransport,
    last_tick: Instant,
}

impl Connection {
    /// One pass over the connection. Returns whether anything happened.
    fn poll<P, A>(
        &mut self,
        ctx: &mut ServiceContext<P, A>,
        listen: &ListenConfiguration,
    ) -> Result<bool, TransportError>
    where
        P: DeviceProvider,
        A: AcceleratorProvider,
    {
        let mut busy = false;

        let mut reads = 0;
        while !self.transport.reads_paused && reads < listen.max_reads_per_tick {
            let message = match self.transport.ws.read() {
                Ok(m) => m,
                Err(e) if would_block(&e) => break,
                Err(e) => return Err(transport_error(e)),
            };
            reads += 1;
            busy = true;
            match message {
                Message::Text(text) => {
                    self.session
                        .on_receive(ctx, &mut self.transport, Inbound::text(text.as_bytes()))
                }
                Message::Binary(data) => self.session.on_receive(
                    ctx,
                    &mut self.transport,
                    Inbound {
                        data: &data,
                        first: true,
                        last: true,
                        binary: true,
                    },
                ),
                Message::Frame(frame) => self.session.on_receive(
                    ctx,
                    &mut self.transport,
                    Inbound {
                        data: frame.payload(),
                        first: false,
                        last: frame.header().is_final,
                        binary: false,
                    },
                ),
                Message::Close(_) => return Err(TransportError::Closed),
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }

        self.transport.flush()?;

        if self.last_tick.elapsed() >= listen.tick_interval {
            self.last_tick = Instant::now();
            self.session.on_tick(&mut self.transport);
        }

        if self.transport.wants_writable && !self.transport.choked {
            self.transport.wants_writable = false;
            let writes = self.transport.writes;
            self.session
                .on_writable(ctx, &mut self.transport)
                .map_err(|e| match e {
                    SessionError::Transport(e) => e,
                    e => TransportError::Other(e.to_string()),
                })?;
            self.transport.flush()?;
            busy |= self.transport.writes != writes;
        }
        Ok(busy)
    }

    fn close<P, A>(mut self, ctx: &mut ServiceContext<P, A>)
    where
        P: DeviceProvider,
        A: AcceleratorProvider,
    {
        self.session.on_close(ctx);
        let _ = self.transport.ws.close(None);
        let _ = self.transport.ws.flush();
        info!(target: "edgestream::server", "Connection from {} closed", self.peer);
    }
}

type ServerRole = ServerHandshake<TcpStream, NoCallback>;

/// A peer whose HTTP upgrade is still in progress.
struct PendingHandshake {
    peer: SocketAddr,
    since: Instant,
    handshake: MidHandshake<ServerRole>,
}

pub struct MediaServer<P: DeviceProvider, A: AcceleratorProvider> {
    listen: ListenConfiguration,
    listener: TcpListener,
    ctx: ServiceContext<P, A>,
    handshakes: Vec<PendingHandshake>,
    connections: Vec<Connection>,
}

impl<P: DeviceProvider, A: AcceleratorProvider> MediaServer<P, A> {
    pub fn bind(listen: ListenConfiguration, ctx: ServiceContext<P, A>) -> Result<Self> {
        let listener = TcpListener::bind(&listen.address)?;
        listener.set_nonblocking(true)?;
        info!(
            target: "edgestream::server",
            "Listening for WebSocket connections on {}",
            listener.local_addr()?
        );
        Ok(Self {
            listen,
            listener,
            ctx,
            handshakes: Vec::new(),
            connections: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!(target: "edgestream::server", "Connection from {} dropped: {}", peer, e);
                        continue;
                    }
                    let since = Instant::now();
                    self.advance_handshake(peer, since, accept(stream));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(target: "edgestream::server", "Accept failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Resumes every interrupted upgrade once. Peers that stay silent past
    /// `handshake_timeout` are dropped.
    fn process_handshakes(&mut self) {
        for pending in std::mem::take(&mut self.handshakes) {
            if pending.since.elapsed() >= self.listen.handshake_timeout {
                warn!(
                    target: "edgestream::server",
                    "Handshake with {} timed out", pending.peer
                );
                continue;
            }
            let result = pending.handshake.handshake();
            self.advance_handshake(pending.peer, pending.since, result);
        }
    }

    fn advance_handshake(
        &mut self,
        peer: SocketAddr,
        since: Instant,
        result: Result<WebSocket<TcpStream>, HandshakeError<ServerRole>>,
    ) {
        match result {
            Ok(ws) => self.admit(peer, ws),
            Err(HandshakeError::Interrupted(handshake)) => self.handshakes.push(PendingHandshake {
                peer,
                since,
                handshake,
            }),
            Err(HandshakeError::Failure(e)) => {
                warn!(target: "edgestream::server", "Handshake with {} failed: {}", peer, e);
            }
        }
    }

    fn admit(&mut self, peer: SocketAddr, ws: WebSocket<TcpStream>) {
        let _ = ws.get_ref().set_nodelay(true);
        let session = Session::new(&self.ctx.config);
        info!(
            target: "edgestream::server",
            "Connection from {} accepted, session {}",
            peer,
            session.id()
        );
        self.connections.push(Connection {
            peer,
            session,
            transport: WsTransport::new(ws),
            last_tick: Instant::now(),
        });
    }

    /// Runs until `shutdown` is raised, then closes every session.
    pub fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        while !shutdown.load(Ordering::Relaxed) {
            self.accept_pending();
            self.process_handshakes();

            let mut busy = false;
            let mut index = 0;
            while index < self.connections.len() {
                match self.connections[index].poll(&mut self.ctx, &self.listen) {
                    Ok(b) => {
                        busy |= b;
                        index += 1;
                    }
                    Err(e) => {
                        debug!(
                            target: "edgestream::server",
                            "Connection from {}: {}", self.connections[index].peer, e
                        );
                        let connection = self.connections.swap_remove(index);
                        connection.close(&mut self.ctx);
                    }
                }
            }

            if !busy {
                std::thread::sleep(self.listen.idle_sleep);
            }
        }

        info!(
            target: "edgestream::server",
            "Shutting down, closing {} connections",
            self.connections.len()
        );
        self.handshakes.clear();
        for connection in self.connections.drain(..) {
            connection.close(&mut self.ctx);
        }
        self.ctx.capture.stop_all();
        self.ctx.accelerator.unload_model();
        Ok(())
    }
}

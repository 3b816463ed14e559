//! # Rover Link
//!
//! This module provides the [`RoverLink`], which owns the one session the server holds with a
//! rover. It performs the handshake, runs the background receive loop which decodes telemetry and
//! publishes it on the link's [`ReadingBus`], and transmits commands.
//!
//! ## Threading
//!
//! The receive loop runs on its own thread and publishes synchronously, so every subscriber sees
//! reading N before reading N+1 and the next frame is not read until all subscribers returned.
//! The transport is shared between the receive loop and senders behind one mutex, which also
//! serialises sends. The loop polls with a short timeout and steps aside while a send is waiting
//! so that commands issued from other threads are not starved.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use chrono::Utc;
use comms_if::{
    net::{SocketOptions, Transport, TransportError, ZmqTransport},
    rover::{
        cmd,
        handshake::{self, HandshakeFrame},
        CmdError, Command, ConnectionStatus, HandshakeError, Reading,
    },
};
use log::{debug, error, info, trace, warn};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{bus::ReadingBus, lock, params::LinkParams};

// ------------------------------------------------------------------------------------------------
// TYPES
// ------------------------------------------------------------------------------------------------

type SharedTransport = Arc<Mutex<Option<Box<dyn Transport>>>>;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// How long the receive loop steps aside for while a send is waiting for the transport.
const SEND_BACKOFF: Duration = Duration::from_millis(1);

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// Something commands can be sent to.
pub trait CommandSink: Send + Sync {
    /// Send a command, returning once it has been written.
    fn send(&self, cmd: &Command) -> Result<(), LinkError>;
}

/// Something bound to a link which must stop when the link is disconnected.
pub trait Teardown: Send + Sync {
    fn teardown(&self);
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// The session with one rover.
pub struct RoverLink {
    params: LinkParams,

    state: Arc<Mutex<ConnectionState>>,

    transport: SharedTransport,

    bus: Arc<ReadingBus>,

    recv_loop: Mutex<Option<RecvLoop>>,

    /// Number of sends waiting for the transport, the receive loop yields while non-zero.
    pending_sends: Arc<AtomicUsize>,

    /// The autopilot currently driving through this link, if any.
    bound: Mutex<Option<(BindingId, Arc<dyn Teardown>)>>,

    next_binding: AtomicU64,

    /// Number of connection attempts which did not end in a session.
    connection_attempts: AtomicU32,
}

/// Identifies one autopilot binding.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BindingId(u64);

struct RecvLoop {
    shutdown: Arc<AtomicBool>,
    join_handle: JoinHandle<()>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// State of the connection to the rover.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    Connected,
    Faulted,
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("The link is already connected or connecting")]
    AlreadyConnected,

    #[error("The link is not connected")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("Handshake protocol violation: {0}")]
    Handshake(HandshakeError),

    #[error("The rover did not reply to the handshake within {0} ms")]
    HandshakeTimeout(u64),

    #[error("Invalid command: {0}")]
    InvalidCommand(CmdError),

    #[error("An autopilot is already bound to this link")]
    AutopilotAlreadyBound,

    #[error("Could not spawn the receive loop: {0}")]
    SpawnError(std::io::Error),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl RoverLink {
    pub fn new(params: LinkParams) -> Self {
        Self {
            params,
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            transport: Arc::new(Mutex::new(None)),
            bus: Arc::new(ReadingBus::new()),
            recv_loop: Mutex::new(None),
            pending_sends: Arc::new(AtomicUsize::new(0)),
            bound: Mutex::new(None),
            next_binding: AtomicU64::new(0),
            connection_attempts: AtomicU32::new(0),
        }
    }

    /// Connect to the rover at `endpoint` and open a session with `api_key`.
    ///
    /// Returns the rover's answer to the handshake. Only an `Ok` status leaves the link
    /// connected. Errors are returned for transport failures and for replies the protocol does not
    /// define, the latter leaving the link `Faulted`. No retry is attempted.
    pub fn connect(&self, endpoint: &str, api_key: &str) -> Result<ConnectionStatus, LinkError> {
        let socket_options = SocketOptions {
            block_on_first_connect: true,
            connect_timeout: self.params.connect_timeout_ms,
            recv_timeout: self.params.recv_timeout_ms,
            send_timeout: self.params.send_timeout_ms,
            linger: 0,
            ..Default::default()
        };

        info!("Connecting to rover at {}", endpoint);

        self.begin_handshake()?;

        let transport = match ZmqTransport::open(endpoint, &socket_options) {
            Ok(t) => t,
            Err(e) => {
                self.connection_attempts.fetch_add(1, Ordering::Relaxed);
                *lock(&self.state) = ConnectionState::Disconnected;
                return Err(LinkError::Transport(e));
            }
        };

        self.handshake(Box::new(transport), api_key)
    }

    /// Open a session over an already established transport.
    pub fn connect_with(
        &self,
        transport: Box<dyn Transport>,
        api_key: &str,
    ) -> Result<ConnectionStatus, LinkError> {
        self.begin_handshake()?;
        self.handshake(transport, api_key)
    }

    /// Send a command to the rover.
    ///
    /// The command is validated and encoded before anything is written. Sends are serialised, a
    /// send does not start writing until the previous one has completed.
    pub fn send(&self, cmd: &Command) -> Result<(), LinkError> {
        let frame = cmd::encode(cmd).map_err(LinkError::InvalidCommand)?;

        if self.state() != ConnectionState::Connected {
            return Err(LinkError::NotConnected);
        }

        self.pending_sends.fetch_add(1, Ordering::SeqCst);
        let result = {
            let mut transport = lock(&self.transport);

            // The link may have been closed while this send was queued
            let result = match transport.as_mut() {
                Some(t) if self.state() == ConnectionState::Connected => {
                    t.send(&frame).map_err(LinkError::Transport)
                }
                _ => Err(LinkError::NotConnected),
            };

            if let Err(LinkError::Transport(e)) = &result {
                if e.is_fatal() {
                    error!("Could not send command to the rover: {}", e);
                    transport.take();
                    *lock(&self.state) = ConnectionState::Faulted;
                }
            }

            result
        };
        self.pending_sends.fetch_sub(1, Ordering::SeqCst);

        if result.is_ok() {
            trace!("Sent {:?}", cmd);
        }

        result
    }

    /// Close the session.
    ///
    /// Tears down any bound autopilot, stops the receive loop and drops the transport. Sends made
    /// after this, or still queued behind a write when it is called, fail with `NotConnected`. A
    /// write already in progress on the transport is allowed to complete. Safe to call in any
    /// state.
    pub fn disconnect(&self) {
        let previous = std::mem::replace(&mut *lock(&self.state), ConnectionState::Disconnected);

        let bound = lock(&self.bound).take();
        if let Some((_, bound)) = bound {
            bound.teardown();
        }

        let recv_loop = lock(&self.recv_loop).take();
        if let Some(recv_loop) = recv_loop {
            recv_loop.shutdown.store(true, Ordering::SeqCst);

            // A subscriber may disconnect from the receive loop itself
            if recv_loop.join_handle.thread().id() != thread::current().id() {
                recv_loop.join_handle.join().ok();
            }
        }

        lock(&self.transport).take();

        // A failure seen while closing does not leave the link faulted
        *lock(&self.state) = ConnectionState::Disconnected;

        if previous != ConnectionState::Disconnected {
            info!("Disconnected from rover");
        }
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The bus on which every decoded reading is published.
    pub fn bus(&self) -> &Arc<ReadingBus> {
        &self.bus
    }

    /// Number of connection attempts which did not open a session.
    pub fn connection_attempts(&self) -> u32 {
        self.connection_attempts.load(Ordering::Relaxed)
    }

    /// Bind an autopilot to this link, which may only have one at a time.
    pub fn bind_autopilot(&self, autopilot: Arc<dyn Teardown>) -> Result<BindingId, LinkError> {
        let mut bound = lock(&self.bound);

        if bound.is_some() {
            return Err(LinkError::AutopilotAlreadyBound);
        }

        let id = BindingId(self.next_binding.fetch_add(1, Ordering::Relaxed));
        *bound = Some((id, autopilot));

        Ok(id)
    }

    /// Release a binding made by [`RoverLink::bind_autopilot`].
    ///
    /// Does nothing if the binding has already been released, for example by a disconnect.
    pub fn unbind_autopilot(&self, id: BindingId) {
        let mut bound = lock(&self.bound);

        if matches!(&*bound, Some((b, _)) if *b == id) {
            bound.take();
        }
    }

    pub fn has_autopilot(&self) -> bool {
        lock(&self.bound).is_some()
    }

    // ---- PRIVATE ----

    /// Move to `Handshaking`, refusing if a session is open or being opened.
    fn begin_handshake(&self) -> Result<(), LinkError> {
        let mut state = lock(&self.state);

        match *state {
            ConnectionState::Connected | ConnectionState::Handshaking => {
                Err(LinkError::AlreadyConnected)
            }
            ConnectionState::Disconnected | ConnectionState::Faulted => {
                *state = ConnectionState::Handshaking;
                Ok(())
            }
        }
    }

    fn handshake(
        &self,
        mut transport: Box<dyn Transport>,
        api_key: &str,
    ) -> Result<ConnectionStatus, LinkError> {
        let reply = match self.exchange_handshake(transport.as_mut(), api_key) {
            Ok(r) => r,
            Err(e) => return Err(self.fault(e)),
        };

        let status = match handshake::parse_reply(&reply) {
            Ok(s) => s,
            Err(e) => {
                error!("Rover sent an invalid handshake reply: {}", e);
                return Err(self.fault(LinkError::Handshake(e)));
            }
        };

        if status != ConnectionStatus::Ok {
            warn!("Rover refused the session: {:?}", status);
            self.connection_attempts.fetch_add(1, Ordering::Relaxed);
            *lock(&self.state) = ConnectionState::Disconnected;
            return Ok(status);
        }

        *lock(&self.transport) = Some(transport);
        *lock(&self.state) = ConnectionState::Connected;

        let shutdown = Arc::new(AtomicBool::new(false));
        let join_handle = {
            let transport = self.transport.clone();
            let state = self.state.clone();
            let bus = self.bus.clone();
            let pending_sends = self.pending_sends.clone();
            let shutdown = shutdown.clone();

            thread::Builder::new()
                .name("rover_recv".into())
                .spawn(move || recv_loop(transport, state, bus, pending_sends, shutdown))
        };

        let join_handle = match join_handle {
            Ok(jh) => jh,
            Err(e) => {
                lock(&self.transport).take();
                return Err(self.fault(LinkError::SpawnError(e)));
            }
        };

        *lock(&self.recv_loop) = Some(RecvLoop {
            shutdown,
            join_handle,
        });

        info!("Rover session open");

        Ok(ConnectionStatus::Ok)
    }

    /// Send the handshake request and wait for the single reply frame.
    fn exchange_handshake(
        &self,
        transport: &mut dyn Transport,
        api_key: &str,
    ) -> Result<String, LinkError> {
        let request = HandshakeFrame::new(api_key)
            .to_json()
            .map_err(LinkError::Handshake)?;

        transport.send(&request).map_err(LinkError::Transport)?;

        let deadline = Instant::now() + Duration::from_millis(self.params.handshake_timeout_ms);

        loop {
            match transport.recv() {
                Ok(Some(reply)) => {
                    debug!("Handshake reply: {:?}", reply);
                    return Ok(reply);
                }
                Ok(None) if Instant::now() >= deadline => {
                    return Err(LinkError::HandshakeTimeout(self.params.handshake_timeout_ms))
                }
                Ok(None) => continue,
                Err(TransportError::NonUtf8Frame) => {
                    return Err(LinkError::Handshake(HandshakeError::UnknownReply(
                        "<non UTF-8 frame>".into(),
                    )))
                }
                Err(e) => return Err(LinkError::Transport(e)),
            }
        }
    }

    /// Record a failed connection attempt, leaving the link faulted.
    fn fault(&self, e: LinkError) -> LinkError {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
        *lock(&self.state) = ConnectionState::Faulted;
        e
    }
}

impl CommandSink for RoverLink {
    fn send(&self, cmd: &Command) -> Result<(), LinkError> {
        RoverLink::send(self, cmd)
    }
}

impl Default for RoverLink {
    fn default() -> Self {
        Self::new(LinkParams::default())
    }
}

impl Drop for RoverLink {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn recv_loop(
    transport: SharedTransport,
    state: Arc<Mutex<ConnectionState>>,
    bus: Arc<ReadingBus>,
    pending_sends: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
) {
    debug!("Receive loop started");

    while !shutdown.load(Ordering::SeqCst) {
        // Let waiting sends go first
        if pending_sends.load(Ordering::SeqCst) > 0 {
            thread::sleep(SEND_BACKOFF);
            continue;
        }

        let frame = {
            let mut transport = lock(&transport);
            match transport.as_mut() {
                Some(t) => t.recv(),
                None => break,
            }
        };

        match frame {
            Ok(Some(frame)) => match Reading::from_json(&frame, Utc::now()) {
                Ok(reading) => bus.publish(&reading),
                Err(e) => warn!("Skipping telemetry frame: {}", e),
            },
            Ok(None) => (),
            Err(e) if !e.is_fatal() => warn!("Skipping telemetry frame: {}", e),
            Err(e) => {
                // A disconnect in progress is not a fault
                if !shutdown.load(Ordering::SeqCst) {
                    error!("Rover link failed: {}", e);
                    lock(&transport).take();
                    *lock(&state) = ConnectionState::Faulted;
                }
                break;
            }
        }
    }

    debug!("Receive loop exited");
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

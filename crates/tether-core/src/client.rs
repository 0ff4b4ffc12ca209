//! Client session state machine.
//!
//! A single logical channel to one server: a reliable stream for control
//! and ordered application traffic, plus a lazily bound datagram companion
//! once the session is established. The application drives [`Client::update`]
//! from its own loop; every transition and callback runs on that thread.
//!
//! # States
//!
//! ```text
//!                 connect()
//! NeedsConnect ─────────────> Connecting ──connect ok──> ReceivingId
//!      ^                          │                          │ id granted
//!      │        attempts exhausted│                          v
//!      ├──────────────────────────┴────────────── ReceivingDataList
//!      │                                                     │ last entry
//!      │   drop while established                            v
//!      └───────────< Reconnecting ──connect ok──> RequestingId ──> Connected
//!                         ^                                          │
//!                         └───────────── heartbeat lapse / reset ────┘
//! ```

use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, warn};

use tether_proto::{control::ControlId, decode_frame, session, ClientId, DataId, FrameStep, Packet};

use crate::buffer::RecvBuffer;
use crate::config::ClientConfig;
use crate::env::{ms_between, Environment};
use crate::error::{SendError, SendResult, TransmitError};
use crate::socket::{parse_endpoint, AddrFamily, DatagramSocket, SockError, StreamSocket};
use crate::symbol::{truncate_name, SymbolTable};
use crate::TransportKind;

/// Client lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Not connected and not trying; the initial and terminal state.
    NeedsConnect,
    /// Driving a first non-blocking connect.
    Connecting,
    /// Connected, waiting for the server's handshake and identity grant.
    ReceivingId,
    /// Receiving the symbol table stream.
    ReceivingDataList,
    /// Re-driving the connect after an established session dropped.
    Reconnecting,
    /// Reconnected at the socket level, negotiating identity resumption.
    RequestingId,
    /// Fully established; application traffic flows.
    Connected,
}

/// Handler for one application message kind.
pub type DataHandler<E> = Box<dyn FnMut(&mut Client<E>, &Packet, TransportKind)>;
/// Lifecycle hook with no arguments beyond the client.
pub type ClientHook<E> = Box<dyn FnMut(&mut Client<E>)>;
/// Hook observing every dispatched application packet.
pub type ReceiveHook<E> = Box<dyn FnMut(&mut Client<E>, &Packet, TransportKind)>;
/// Hook observing receive-side failures; the packet may be absent.
pub type TransmitErrorHook<E> =
    Box<dyn FnMut(&mut Client<E>, Option<&Packet>, TransportKind, TransmitError)>;

struct ClientHooks<E: Environment> {
    connect: Option<ClientHook<E>>,
    ready: Option<ClientHook<E>>,
    disconnect: Option<ClientHook<E>>,
    attempt_reconnect: Option<ClientHook<E>>,
    reconnect: Option<ClientHook<E>>,
    reconnect_failed: Option<ClientHook<E>>,
    handshake: Option<ClientHook<E>>,
    receive: Option<ReceiveHook<E>>,
    transmit_error: Option<TransmitErrorHook<E>>,
}

impl<E: Environment> Default for ClientHooks<E> {
    fn default() -> Self {
        Self {
            connect: None,
            ready: None,
            disconnect: None,
            attempt_reconnect: None,
            reconnect: None,
            reconnect_failed: None,
            handshake: None,
            receive: None,
            transmit_error: None,
        }
    }
}

/// Take a hook out, run it with `&mut self`, and put it back unless the
/// callback installed a replacement.
macro_rules! fire {
    ($self:ident, $slot:ident) => {
        if let Some(mut hook) = $self.hooks.$slot.take() {
            hook(&mut *$self);
            $self.hooks.$slot.get_or_insert(hook);
        }
    };
}

/// The client side of a session.
pub struct Client<E: Environment> {
    env: E,
    config: ClientConfig,
    state: ClientState,
    client_id: ClientId,
    server_addr: SocketAddr,
    family: AddrFamily,
    tcp: Option<E::Stream>,
    udp: Option<E::Datagram>,
    stream_bound: bool,
    symbols: SymbolTable<DataHandler<E>>,
    hooks: ClientHooks<E>,
    attempts: u32,
    conn_timer: Instant,
    aliveness_timer: Instant,
    timeout_timer: Instant,
    timeout_budget_ms: f64,
    ping_ms: f64,
    tcp_buf: RecvBuffer,
    udp_buf: RecvBuffer,
}

impl<E: Environment> Client<E> {
    /// Create an idle client.
    pub fn new(env: E, config: ClientConfig) -> Self {
        let now = env.now();
        Self {
            env,
            config,
            state: ClientState::NeedsConnect,
            client_id: 0,
            server_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            family: AddrFamily::Ipv4,
            tcp: None,
            udp: None,
            stream_bound: false,
            symbols: SymbolTable::new(),
            hooks: ClientHooks::default(),
            attempts: 0,
            conn_timer: now,
            aliveness_timer: now,
            timeout_timer: now,
            timeout_budget_ms: session::MAX_TIMEOUT_MS,
            ping_ms: 0.0,
            tcp_buf: RecvBuffer::new(),
            udp_buf: RecvBuffer::new(),
        }
    }

    // Registration -------------------------------------------------------

    /// Register a handler for an application message name.
    ///
    /// Appends to an existing name's handler chain at any time; a name new
    /// to this client can only be added before connecting. Names longer
    /// than the protocol limit are truncated. Returns whether the handler
    /// was accepted.
    pub fn register<F>(&mut self, name: &str, handler: F) -> bool
    where
        F: FnMut(&mut Client<E>, &Packet, TransportKind) + 'static,
    {
        let name = truncate_name(name);
        if let Some(idx) = self.symbols.find(name) {
            self.symbols.push_handler(idx, Box::new(handler));
            return true;
        }
        if self.state == ClientState::NeedsConnect {
            let idx = self.symbols.add(name.to_string());
            self.symbols.push_handler(idx, Box::new(handler));
            return true;
        }
        false
    }

    /// Set the hook fired once an identity is granted.
    pub fn on_connect<F: FnMut(&mut Client<E>) + 'static>(&mut self, hook: F) {
        self.hooks.connect = Some(Box::new(hook));
    }

    /// Set the hook fired when the session becomes fully established.
    pub fn on_ready<F: FnMut(&mut Client<E>) + 'static>(&mut self, hook: F) {
        self.hooks.ready = Some(Box::new(hook));
    }

    /// Set the hook fired when the client gives up and goes idle.
    pub fn on_disconnect<F: FnMut(&mut Client<E>) + 'static>(&mut self, hook: F) {
        self.hooks.disconnect = Some(Box::new(hook));
    }

    /// Set the hook fired when a dropped session enters reconnection.
    pub fn on_attempt_reconnect<F: FnMut(&mut Client<E>) + 'static>(&mut self, hook: F) {
        self.hooks.attempt_reconnect = Some(Box::new(hook));
    }

    /// Set the hook fired when the server resumes the prior identity.
    pub fn on_reconnect<F: FnMut(&mut Client<E>) + 'static>(&mut self, hook: F) {
        self.hooks.reconnect = Some(Box::new(hook));
    }

    /// Set the hook fired when resumption is refused and a fresh identity
    /// is issued instead.
    pub fn on_reconnect_failed<F: FnMut(&mut Client<E>) + 'static>(&mut self, hook: F) {
        self.hooks.reconnect_failed = Some(Box::new(hook));
    }

    /// Set the hook fired on each handshake from the server.
    pub fn on_handshake<F: FnMut(&mut Client<E>) + 'static>(&mut self, hook: F) {
        self.hooks.handshake = Some(Box::new(hook));
    }

    /// Set the hook observing every dispatched application packet.
    pub fn on_receive<F>(&mut self, hook: F)
    where
        F: FnMut(&mut Client<E>, &Packet, TransportKind) + 'static,
    {
        self.hooks.receive = Some(Box::new(hook));
    }

    /// Set the hook observing receive-side failures.
    pub fn on_transmit_error<F>(&mut self, hook: F)
    where
        F: FnMut(&mut Client<E>, Option<&Packet>, TransportKind, TransmitError) + 'static,
    {
        self.hooks.transmit_error = Some(Box::new(hook));
    }

    // Lifecycle ----------------------------------------------------------

    /// Begin connecting to a server address.
    pub fn connect(&mut self, addr: SocketAddr) {
        self.server_addr = addr;
        self.family = AddrFamily::of(addr);
        self.attempts = 0;
        self.tcp_buf.clear();
        self.udp_buf.clear();
        self.ping_ms = 0.0;
        self.state = ClientState::Connecting;
        debug!(%addr, "connecting");
        self.update();
    }

    /// Begin connecting to a `host[:port]` endpoint string.
    ///
    /// # Errors
    ///
    /// Returns the resolution error when the endpoint cannot be parsed.
    pub fn connect_host(&mut self, endpoint: &str) -> std::io::Result<()> {
        let addr = parse_endpoint(endpoint)?;
        self.connect(addr);
        Ok(())
    }

    /// Gracefully leave the session and go idle. No reconnection is
    /// attempted.
    pub fn disconnect(&mut self) {
        self.teardown(false);
    }

    /// Drive the state machine one tick: connect progress, heartbeat, and
    /// both receive pipelines.
    pub fn update(&mut self) {
        match self.state {
            ClientState::Connecting | ClientState::Reconnecting => self.drive_connect(),
            ClientState::NeedsConnect => {}
            _ => self.drive_session(),
        }
    }

    // Accessors ----------------------------------------------------------

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// The identity the server granted, visible once the symbol table
    /// exchange begins; zero otherwise.
    #[must_use]
    pub fn client_id(&self) -> ClientId {
        match self.state {
            ClientState::Connected | ClientState::ReceivingDataList => self.client_id,
            _ => 0,
        }
    }

    /// True in every state except idle.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state != ClientState::NeedsConnect
    }

    /// True once the socket-level connect has completed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.is_running()
            && self.state != ClientState::Connecting
            && self.state != ClientState::Reconnecting
    }

    /// True only in the idle state.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.state == ClientState::NeedsConnect
    }

    /// True once application traffic may flow.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == ClientState::Connected
    }

    /// Whether the datagram companion is bound.
    #[must_use]
    pub fn is_stream_bound(&self) -> bool {
        self.stream_bound
    }

    /// Most recent round-trip estimate in milliseconds.
    #[must_use]
    pub fn ping_ms(&self) -> f64 {
        self.ping_ms
    }

    /// The server address of the current or last session.
    #[must_use]
    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Local address of the stream socket, once connected.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Resolve a registered name to its session data id. Only meaningful
    /// once the session is ready; the unassigned sentinel otherwise.
    #[must_use]
    pub fn id_of(&self, name: &str) -> DataId {
        if self.state == ClientState::Connected {
            if let Some(id) = self.symbols.id_of(name) {
                return id;
            }
        }
        ControlId::Unknown.to_data_id()
    }

    /// Resolve a session data id back to its registered name.
    #[must_use]
    pub fn name_of(&self, id: DataId) -> Option<&str> {
        if self.state == ClientState::Connected {
            self.symbols.name_of(id)
        } else {
            None
        }
    }

    /// Build an empty packet tagged with the id of a registered name.
    #[must_use]
    pub fn create_pack(&self, name: &str) -> Packet {
        Packet::with_id(self.id_of(name))
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Replace the configuration. A changed heartbeat cadence is advertised
    /// to the server immediately so its timeout budget follows.
    pub fn set_config(&mut self, config: ClientConfig) {
        if self.is_running() && self.config.aliveness_delay != config.aliveness_delay {
            let beat =
                session::aliveness(session::advertised_budget(config.aliveness_delay, self.ping_ms));
            let _ = self.send_to_server(&beat, true);
        }
        self.config = config;
    }

    // Transmit -----------------------------------------------------------

    /// Send a packet over the reliable channel.
    ///
    /// With `block_until_sent`, a would-block is retried until the bytes
    /// are taken; otherwise it is surfaced directly.
    ///
    /// # Errors
    ///
    /// [`TransmitError::ClientNotConnected`] before the handshake phase or
    /// after disconnect; socket errors otherwise.
    pub fn send_to_server(&mut self, pack: &Packet, block_until_sent: bool) -> SendResult {
        match self.state {
            ClientState::NeedsConnect | ClientState::Connecting | ClientState::Reconnecting => {
                return Err(TransmitError::ClientNotConnected.into());
            }
            _ => {}
        }
        let sock = self
            .tcp
            .as_mut()
            .ok_or(SendError::Transmit(TransmitError::ClientNotConnected))?;
        let wire = pack.serialize();
        loop {
            match sock.send(&wire) {
                Ok(n) => return Ok(n),
                Err(SockError::WouldBlock) if block_until_sent => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Send a packet over the unreliable channel.
    ///
    /// Finalizes the packet with the sender-id flag and this client's
    /// public id if the caller has not finalized it already.
    ///
    /// # Errors
    ///
    /// [`TransmitError::ClientNotConnected`] outside a session,
    /// [`TransmitError::StreamNotBound`] before the companion socket is
    /// bound, socket errors otherwise.
    pub fn stream_to_server(&mut self, pack: &mut Packet, block_until_sent: bool) -> SendResult {
        match self.state {
            ClientState::NeedsConnect | ClientState::Connecting | ClientState::Reconnecting => {
                return Err(TransmitError::ClientNotConnected.into());
            }
            _ => {}
        }
        if !self.stream_bound {
            return Err(TransmitError::StreamNotBound.into());
        }
        if !pack.is_finalized() {
            let id = self.client_id();
            pack.finalize(false, true, id);
        }
        let wire = pack.serialize();
        let sock = self
            .udp
            .as_mut()
            .ok_or(SendError::Transmit(TransmitError::StreamNotBound))?;
        loop {
            match sock.send_to(&wire, self.server_addr) {
                Ok(n) => return Ok(n),
                Err(SockError::WouldBlock) if block_until_sent => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    // Connect driving ----------------------------------------------------

    fn drive_connect(&mut self) {
        let now = self.env.now();
        let delay_ms = self.config.connection_delay.as_secs_f64() * 1000.0;
        if self.attempts != 0 && ms_between(self.conn_timer, now) < delay_ms {
            return;
        }

        if self.tcp.is_none() {
            match self.env.stream_socket(self.family) {
                Ok(sock) => self.tcp = Some(sock),
                Err(err) => {
                    warn!(%err, "stream socket creation failed");
                    self.teardown(false);
                    return;
                }
            }
        }
        let result = match self.tcp.as_mut() {
            Some(sock) => sock.connect(self.server_addr),
            None => Err(SockError::Invalid),
        };

        match result {
            Ok(()) | Err(SockError::IsConn) => {
                self.state = if self.state == ClientState::Reconnecting {
                    ClientState::RequestingId
                } else {
                    ClientState::ReceivingId
                };
                debug!(state = ?self.state, "stream connected");
                let now = self.env.now();
                self.aliveness_timer = now;
                self.timeout_timer = now;
                self.timeout_budget_ms = session::MAX_TIMEOUT_MS;
                self.ping_ms = 0.0;
            }
            Err(err) => {
                self.attempts += 1;
                self.conn_timer = now;
                let ceiling = if self.state == ClientState::Connecting {
                    self.config.max_connection_attempts
                } else {
                    self.config.max_reconnection_attempts
                };
                if self.attempts >= ceiling || !err.is_transient() {
                    debug!(%err, attempts = self.attempts, "giving up on connect");
                    self.teardown(false);
                }
            }
        }
    }

    // Session driving ----------------------------------------------------

    fn drive_session(&mut self) {
        let now = self.env.now();
        let delay_ms = self.config.aliveness_delay.as_secs_f64() * 1000.0;
        if ms_between(self.aliveness_timer, now) >= delay_ms {
            self.aliveness_timer = now;
            let beat = session::aliveness(session::advertised_budget(
                self.config.aliveness_delay,
                self.ping_ms,
            ));
            let lapsed = ms_between(self.timeout_timer, now) >= self.timeout_budget_ms;
            if self.send_to_server(&beat, true).is_err() || lapsed {
                debug!("aliveness lapsed, dropping the session");
                self.teardown(true);
                return;
            }
        }

        self.pump_tcp();
        if !self.is_running() {
            return;
        }
        self.pump_udp();
    }

    fn pump_tcp(&mut self) {
        let mut reads = 0;
        loop {
            reads += 1;
            let n = {
                let Some(sock) = self.tcp.as_mut() else { return };
                let space = self.tcp_buf.space();
                if space.is_empty() {
                    break;
                }
                match sock.recv(space) {
                    Ok(n) => n,
                    Err(SockError::ConnReset) => {
                        debug!("stream reset by server");
                        self.teardown(true);
                        return;
                    }
                    Err(_) => break,
                }
            };
            if n == 0 {
                break;
            }
            self.tcp_buf.advance(n);
            self.drain(TransportKind::Tcp);
            if !self.is_running() {
                return;
            }
            if reads >= self.config.max_tcp_reads_per_update {
                break;
            }
        }
    }

    fn pump_udp(&mut self) {
        if !self.config.allow_udp || self.state != ClientState::Connected {
            return;
        }
        if !self.stream_bound {
            self.bind_stream();
            return;
        }
        let mut reads = 0;
        loop {
            reads += 1;
            let received = {
                let Some(sock) = self.udp.as_mut() else { return };
                let space = self.udp_buf.space();
                if space.is_empty() {
                    break;
                }
                sock.recv_from(space)
            };
            match received {
                Ok((n, from)) => {
                    if n == 0 {
                        break;
                    }
                    // datagrams from anyone but the server are dropped
                    if from == self.server_addr {
                        self.udp_buf.advance(n);
                        self.drain(TransportKind::Udp);
                    }
                }
                Err(SockError::ConnReset) => {
                    self.stream_bound = false;
                    self.udp_buf.clear();
                    self.udp = None;
                    return;
                }
                Err(_) => break,
            }
            if !self.is_running() || !self.stream_bound {
                return;
            }
            if reads >= self.config.max_udp_reads_per_update {
                break;
            }
        }
    }

    fn bind_stream(&mut self) {
        if self.udp.is_none() {
            self.udp = self.env.datagram_socket(self.family).ok();
        }
        let Some(local) = self.local_addr() else { return };
        let Some(sock) = self.udp.as_mut() else { return };
        match sock.bind(local) {
            Ok(()) | Err(SockError::IsConn) => {
                self.stream_bound = true;
                debug!(%local, "datagram companion bound");
            }
            Err(_) => {}
        }
    }

    fn drain(&mut self, method: TransportKind) {
        loop {
            if !self.is_running() {
                return;
            }
            if method == TransportKind::Udp && !self.stream_bound {
                return;
            }
            let step = {
                let buf = match method {
                    TransportKind::Tcp => &self.tcp_buf,
                    TransportKind::Udp => &self.udp_buf,
                };
                decode_frame(buf.data())
            };
            match step {
                FrameStep::Incomplete => return,
                FrameStep::Oversize => {
                    match method {
                        TransportKind::Tcp => self.tcp_buf.clear(),
                        TransportKind::Udp => self.udp_buf.clear(),
                    }
                    warn!(?method, "declared payload exceeds the frame budget, buffer discarded");
                    self.fire_transmit_error(None, method, TransmitError::InvalidPayloadSize);
                    return;
                }
                FrameStep::Frame { packet, size } => {
                    match method {
                        TransportKind::Tcp => self.tcp_buf.consume(size),
                        TransportKind::Udp => self.udp_buf.consume(size),
                    }
                    self.handle_frame(&packet, method);
                }
            }
        }
    }

    // Frame handling -----------------------------------------------------

    fn handle_frame(&mut self, pack: &Packet, method: TransportKind) {
        match ControlId::from_data_id(pack.data_id()) {
            Some(ControlId::Handshake) => self.on_handshake_frame(),
            Some(ControlId::InitClientId) => self.on_identity_frame(pack, false),
            Some(ControlId::Reconnect) => self.on_identity_frame(pack, true),
            Some(ControlId::Disconnect) => self.teardown(false),
            Some(ControlId::DataListEntry) => self.on_data_list_frame(pack),
            Some(ControlId::Aliveness) => self.on_aliveness_frame(pack),
            Some(ControlId::Unknown) | None => self.dispatch_data(pack, method),
        }
    }

    /// The server's handshake asks who we are: a fresh session requests a
    /// new identity, an interrupted one asks to resume its old id.
    fn on_handshake_frame(&mut self) {
        if self.state == ClientState::ReceivingId || self.client_id == 0 {
            let request = Packet::with_id(ControlId::InitClientId.to_data_id());
            let _ = self.send_to_server(&request, true);
        } else {
            let request = session::identity(ControlId::Reconnect, self.client_id);
            let _ = self.send_to_server(&request, true);
        }
        fire!(self, handshake);
    }

    /// An identity grant, either fresh (`InitClientId`) or resumed
    /// (`Reconnect`). A zero id means the server is not ready yet and the
    /// request matching the interrupted phase is repeated.
    fn on_identity_frame(&mut self, pack: &Packet, resumed: bool) {
        let now = self.env.now();
        self.timeout_timer = now;
        self.timeout_budget_ms = session::MAX_TIMEOUT_MS;
        self.ping_ms = 0.0;

        let beat = session::aliveness(session::advertised_budget(
            self.config.aliveness_delay,
            self.ping_ms,
        ));
        let _ = self.send_to_server(&beat, true);

        let granted: ClientId = pack.remove();
        let was_requesting = self.state == ClientState::RequestingId;

        if granted != 0 {
            self.client_id = granted;
            self.state = ClientState::ReceivingDataList;
            debug!(id = granted, resumed, "identity granted");
            if resumed {
                fire!(self, reconnect);
            } else {
                if was_requesting {
                    fire!(self, reconnect_failed);
                }
                fire!(self, connect);
            }
            let trigger = Packet::with_id(ControlId::DataListEntry.to_data_id());
            let _ = self.send_to_server(&trigger, true);
        } else if was_requesting {
            let again = session::identity(ControlId::Reconnect, self.client_id);
            let _ = self.send_to_server(&again, true);
        } else {
            let again = Packet::with_id(ControlId::InitClientId.to_data_id());
            let _ = self.send_to_server(&again, true);
        }
    }

    fn on_data_list_frame(&mut self, pack: &Packet) {
        let entry = session::DataListEntry::read(pack);
        self.symbols.upsert(truncate_name(&entry.name), entry.data_id);

        let last = u32::from(entry.index) + 1 >= u32::from(entry.total);
        if self.is_ready() || last {
            self.symbols.rebuild_maps();
            if !self.is_ready() {
                let done = Packet::with_id(ControlId::Handshake.to_data_id());
                let _ = self.send_to_server(&done, true);
                self.state = ClientState::Connected;
                debug!(names = self.symbols.len(), "session ready");
                fire!(self, ready);
            }
        }
    }

    fn on_aliveness_frame(&mut self, pack: &Packet) {
        let now = self.env.now();
        self.ping_ms = (ms_between(self.timeout_timer, now) - self.timeout_budget_ms).max(0.0);
        self.timeout_timer = now;
        self.timeout_budget_ms = f64::from(pack.remove::<f32>());
    }

    fn dispatch_data(&mut self, pack: &Packet, method: TransportKind) {
        // the control range never reaches handlers, even if a name in the
        // table still carries the unassigned sentinel
        let idx = if tether_proto::control::is_control(pack.data_id()) {
            None
        } else {
            self.symbols.index_by_id(pack.data_id())
        };
        let verified = method == TransportKind::Tcp || pack.is_valid();

        let Some(idx) = idx.filter(|_| verified) else {
            let err = if idx.is_none() {
                TransmitError::InvalidDataId
            } else {
                TransmitError::InvalidChecksum
            };
            self.fire_transmit_error(Some(pack), method, err);
            return;
        };

        if let Some(mut hook) = self.hooks.receive.take() {
            hook(&mut *self, pack, method);
            pack.reset();
            self.hooks.receive.get_or_insert(hook);
        }
        if !self.is_running() {
            return;
        }

        let mut handlers = self.symbols.take_handlers(idx);
        for handler in handlers.iter_mut().rev() {
            if self.is_disconnected() {
                break;
            }
            handler(&mut *self, pack, method);
            pack.reset();
        }
        self.symbols.restore_handlers(idx, handlers);
    }

    fn fire_transmit_error(
        &mut self,
        pack: Option<&Packet>,
        method: TransportKind,
        err: TransmitError,
    ) {
        warn!(?method, %err, "receive error");
        if let Some(mut hook) = self.hooks.transmit_error.take() {
            hook(&mut *self, pack, method, err);
            self.hooks.transmit_error.get_or_insert(hook);
        }
    }

    // Teardown -----------------------------------------------------------

    /// Drop the session. When `attempt_reconnect` is set and the session
    /// was fully established (and the config allows it), the client enters
    /// the reconnecting state instead of going idle.
    fn teardown(&mut self, attempt_reconnect: bool) {
        if !self.is_running() {
            return;
        }
        self.symbols.reset_ids();
        if self.tcp.is_some() {
            let bye = Packet::with_id(ControlId::Disconnect.to_data_id());
            let _ = self.send_to_server(&bye, false);
            self.tcp = None;
        }
        self.udp = None;
        self.stream_bound = false;

        if attempt_reconnect && self.config.attempt_reconnect && self.is_ready() {
            self.attempts = 0;
            self.tcp_buf.clear();
            self.udp_buf.clear();
            self.state = ClientState::Reconnecting;
            debug!("session dropped, reconnecting");
            fire!(self, attempt_reconnect);
        } else {
            self.state = ClientState::NeedsConnect;
            debug!("disconnected");
            fire!(self, disconnect);
        }
    }
}

impl<E: Environment> std::fmt::Debug for Client<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state)
            .field("client_id", &self.client_id)
            .field("server_addr", &self.server_addr)
            .field("stream_bound", &self.stream_bound)
            .field("names", &self.symbols.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::SystemEnv;

    #[test]
    fn starts_idle() {
        let client = Client::new(SystemEnv, ClientConfig::default());
        assert_eq!(client.state(), ClientState::NeedsConnect);
        assert!(client.is_disconnected());
        assert!(!client.is_running());
        assert_eq!(client.client_id(), 0);
    }

    #[test]
    fn registration_is_gated_by_state() {
        let mut client = Client::new(SystemEnv, ClientConfig::default());
        assert!(client.register("chat", |_, _, _| {}));
        // second handler for a known name is always accepted
        assert!(client.register("chat", |_, _, _| {}));
        // unknown ids resolve to the sentinel before the session is ready
        assert_eq!(client.id_of("chat"), ControlId::Unknown.to_data_id());
    }

    #[test]
    fn send_requires_a_session() {
        let mut client = Client::new(SystemEnv, ClientConfig::default());
        let pack = Packet::with_id(9);
        assert_eq!(
            client.send_to_server(&pack, true),
            Err(SendError::Transmit(TransmitError::ClientNotConnected))
        );
        assert_eq!(
            client.stream_to_server(&mut Packet::with_id(9), true),
            Err(SendError::Transmit(TransmitError::ClientNotConnected))
        );
    }
}

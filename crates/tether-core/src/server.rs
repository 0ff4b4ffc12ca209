//! Server session state machine.
//!
//! Listens for stream connections, walks each peer through identity
//! issuance and the symbol table exchange, heartbeats every live session,
//! and retains disconnected peers for a configurable window so a
//! reconnecting client can reclaim its identity and user data.
//!
//! The application drives [`Server::update`] from its own loop; every
//! transition and callback runs on that thread.

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, info, warn};

use tether_proto::{
    control::{ControlId, USER_DATA_START},
    decode_frame, session, ClientId, DataId, FrameStep, Packet, PacketFlags,
};

use crate::buffer::RecvBuffer;
use crate::config::ServerConfig;
use crate::env::{ms_between, Environment};
use crate::error::{SendError, SendResult, TransmitError};
use crate::policy::PolicyList;
use crate::socket::{any_addr, AddrFamily, DatagramSocket, SockError, StreamSocket};
use crate::symbol::{truncate_name, SymbolTable};
use crate::TransportKind;

/// The id the server uses for itself on the wire.
pub const SERVER_ID: ClientId = 0;

/// Server lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Not started; names may still be registered.
    NeedsStartup,
    /// Trying to bind the listen socket.
    Binding,
    /// Accepting and servicing peers.
    Loop,
}

/// Per-peer session states as the server tracks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Accepted, no identity settled yet.
    Init,
    /// Identity settled, symbol table exchange underway.
    DataListExchange,
    /// Fully established.
    Connected,
    /// Session over; the record may linger for identity resumption.
    Disconnected,
}

/// One connected (or recently disconnected) peer.
pub struct ClientEntry<E: Environment> {
    id: ClientId,
    address: SocketAddr,
    socket: Option<E::Stream>,
    state: EntryState,
    buf: RecvBuffer,
    timeout_timer: Instant,
    timeout_budget_ms: f64,
    ping_ms: f64,
    user_data: Option<Box<dyn Any>>,
}

impl<E: Environment> ClientEntry<E> {
    fn new(id: ClientId, address: SocketAddr, socket: E::Stream, now: Instant) -> Self {
        Self {
            id,
            address,
            socket: Some(socket),
            state: EntryState::Init,
            buf: RecvBuffer::new(),
            timeout_timer: now,
            timeout_budget_ms: session::MAX_TIMEOUT_MS,
            ping_ms: 0.0,
            user_data: None,
        }
    }

    /// This peer's session identity.
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// The peer's remote address.
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> EntryState {
        self.state
    }

    /// True once application traffic may flow to this peer.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == EntryState::Connected
    }

    /// True in every state except disconnected.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state != EntryState::Disconnected
    }

    /// Most recent round-trip estimate for this peer in milliseconds.
    #[must_use]
    pub fn ping_ms(&self) -> f64 {
        self.ping_ms
    }

    /// Refresh the timeout clock, folding the gap between the previous
    /// budget and the actual arrival into the ping estimate.
    pub fn reset_timeout(&mut self, now: Instant, budget_ms: f64) {
        self.ping_ms = (ms_between(self.timeout_timer, now) - self.timeout_budget_ms).max(0.0);
        self.timeout_timer = now;
        self.timeout_budget_ms = budget_ms;
    }

    /// Whether the timeout budget has lapsed.
    #[must_use]
    pub fn timed_out(&self, now: Instant) -> bool {
        ms_between(self.timeout_timer, now) >= self.timeout_budget_ms
    }

    /// Attach application data to this peer. The previous value, if any,
    /// is dropped.
    pub fn set_user_data<T: Any>(&mut self, data: T) {
        self.user_data = Some(Box::new(data));
    }

    /// Borrow the attached application data as `T`.
    #[must_use]
    pub fn user_data<T: Any>(&self) -> Option<&T> {
        self.user_data.as_ref()?.downcast_ref()
    }

    /// Mutably borrow the attached application data as `T`.
    pub fn user_data_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.user_data.as_mut()?.downcast_mut()
    }

    /// Detach the application data, leaving none.
    pub fn take_user_data(&mut self) -> Option<Box<dyn Any>> {
        self.user_data.take()
    }

    /// Send a packet to this peer over its reliable channel.
    ///
    /// # Errors
    ///
    /// [`TransmitError::ClientNotConnected`] once disconnected; socket
    /// errors otherwise.
    pub fn send(&mut self, pack: &Packet, block_until_sent: bool) -> SendResult {
        if self.state == EntryState::Disconnected {
            return Err(TransmitError::ClientNotConnected.into());
        }
        let sock = self
            .socket
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
}

impl<E: Environment> std::fmt::Debug for ClientEntry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientEntry")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("state", &self.state)
            .field("ping_ms", &self.ping_ms)
            .finish_non_exhaustive()
    }
}

/// Handler for one application message kind.
pub type DataHandler<E> =
    Box<dyn FnMut(&mut Server<E>, &Packet, &mut ClientEntry<E>, TransportKind)>;
/// Lifecycle hook carrying the affected peer.
pub type PeerHook<E> = Box<dyn FnMut(&mut Server<E>, &mut ClientEntry<E>)>;
/// Hook fired when the listen socket binds.
pub type BindHook<E> = Box<dyn FnMut(&mut Server<E>)>;
/// Admission veto; runs before a peer is recorded.
pub type ValidateHook<E> = Box<dyn FnMut(&ClientEntry<E>) -> bool>;
/// Hook observing every dispatched application packet.
pub type ReceiveHook<E> =
    Box<dyn FnMut(&mut Server<E>, &Packet, &mut ClientEntry<E>, TransportKind)>;
/// Hook observing receive-side failures; packet and peer may be absent.
pub type TransmitErrorHook<E> = Box<
    dyn FnMut(
        &mut Server<E>,
        Option<&Packet>,
        Option<&mut ClientEntry<E>>,
        TransportKind,
        TransmitError,
    ),
>;

struct ServerHooks<E: Environment> {
    bind: Option<BindHook<E>>,
    connect: Option<PeerHook<E>>,
    ready: Option<PeerHook<E>>,
    disconnect: Option<PeerHook<E>>,
    reconnect: Option<PeerHook<E>>,
    failed_reconnect: Option<PeerHook<E>>,
    initialize_client: Option<PeerHook<E>>,
    destroy_client: Option<PeerHook<E>>,
    reject: Option<PeerHook<E>>,
    validate: Option<ValidateHook<E>>,
    receive: Option<ReceiveHook<E>>,
    transmit_error: Option<TransmitErrorHook<E>>,
}

impl<E: Environment> Default for ServerHooks<E> {
    fn default() -> Self {
        Self {
            bind: None,
            connect: None,
            ready: None,
            disconnect: None,
            reconnect: None,
            failed_reconnect: None,
            initialize_client: None,
            destroy_client: None,
            reject: None,
            validate: None,
            receive: None,
            transmit_error: None,
        }
    }
}

/// Take a peer hook out, run it with `&mut self` and the entry, and put it
/// back unless the callback installed a replacement.
macro_rules! fire_peer {
    ($self:ident, $slot:ident, $entry:expr) => {
        if let Some(mut hook) = $self.hooks.$slot.take() {
            hook(&mut *$self, &mut *$entry);
            $self.hooks.$slot.get_or_insert(hook);
        }
    };
}

/// The server side of the session layer.
pub struct Server<E: Environment> {
    env: E,
    config: ServerConfig,
    state: ServerState,
    port: u16,
    family: AddrFamily,
    listener: Option<E::Stream>,
    udp: Option<E::Datagram>,
    stream_bound: bool,
    udp_buf: RecvBuffer,
    clients: HashMap<ClientId, ClientEntry<E>>,
    disconnected: HashMap<ClientId, ClientEntry<E>>,
    next_client_id: ClientId,
    symbols: SymbolTable<DataHandler<E>>,
    policy: PolicyList,
    hooks: ServerHooks<E>,
    aliveness_timer: Instant,
}

impl<E: Environment> Server<E> {
    /// Create an idle server.
    pub fn new(env: E, config: ServerConfig) -> Self {
        let now = env.now();
        Self {
            env,
            config,
            state: ServerState::NeedsStartup,
            port: 0,
            family: AddrFamily::Ipv4,
            listener: None,
            udp: None,
            stream_bound: false,
            udp_buf: RecvBuffer::new(),
            clients: HashMap::new(),
            disconnected: HashMap::new(),
            next_client_id: 1,
            symbols: SymbolTable::new(),
            policy: PolicyList::new(),
            hooks: ServerHooks::default(),
            aliveness_timer: now,
        }
    }

    // Registration -------------------------------------------------------

    /// Register an application message name with a handler.
    ///
    /// Appends to an existing name's chain at any time; a new name can only
    /// be added before the server starts. Returns whether the handler was
    /// accepted.
    pub fn register<F>(&mut self, name: &str, handler: F) -> bool
    where
        F: FnMut(&mut Server<E>, &Packet, &mut ClientEntry<E>, TransportKind) + 'static,
    {
        let name = truncate_name(name);
        if let Some(idx) = self.symbols.find(name) {
            self.symbols.push_handler(idx, Box::new(handler));
            return true;
        }
        if self.state == ServerState::NeedsStartup {
            let idx = self.symbols.add(name.to_string());
            self.symbols.push_handler(idx, Box::new(handler));
            return true;
        }
        false
    }

    /// Register an application message name with no handler; useful for
    /// send-only data.
    pub fn register_type(&mut self, name: &str) -> bool {
        let name = truncate_name(name);
        if self.symbols.find(name).is_some() {
            return true;
        }
        if self.state == ServerState::NeedsStartup {
            self.symbols.add(name.to_string());
            return true;
        }
        false
    }

    /// Set the hook fired when the listen socket binds.
    pub fn on_bind<F: FnMut(&mut Server<E>) + 'static>(&mut self, hook: F) {
        self.hooks.bind = Some(Box::new(hook));
    }

    /// Set the hook fired when a peer settles its identity.
    pub fn on_connect<F: FnMut(&mut Server<E>, &mut ClientEntry<E>) + 'static>(&mut self, hook: F) {
        self.hooks.connect = Some(Box::new(hook));
    }

    /// Set the hook fired when a peer becomes fully established.
    pub fn on_ready<F: FnMut(&mut Server<E>, &mut ClientEntry<E>) + 'static>(&mut self, hook: F) {
        self.hooks.ready = Some(Box::new(hook));
    }

    /// Set the hook fired when a peer's session ends.
    pub fn on_disconnect<F: FnMut(&mut Server<E>, &mut ClientEntry<E>) + 'static>(
        &mut self,
        hook: F,
    ) {
        self.hooks.disconnect = Some(Box::new(hook));
    }

    /// Set the hook fired when a peer reclaims its prior identity.
    pub fn on_reconnect<F: FnMut(&mut Server<E>, &mut ClientEntry<E>) + 'static>(
        &mut self,
        hook: F,
    ) {
        self.hooks.reconnect = Some(Box::new(hook));
    }

    /// Set the hook fired when identity resumption is refused.
    pub fn on_failed_reconnect<F: FnMut(&mut Server<E>, &mut ClientEntry<E>) + 'static>(
        &mut self,
        hook: F,
    ) {
        self.hooks.failed_reconnect = Some(Box::new(hook));
    }

    /// Set the hook fired when a peer needs fresh application state;
    /// the natural place to attach user data.
    pub fn on_initialize_client<F: FnMut(&mut Server<E>, &mut ClientEntry<E>) + 'static>(
        &mut self,
        hook: F,
    ) {
        self.hooks.initialize_client = Some(Box::new(hook));
    }

    /// Set the hook fired when a retained peer record is released; the
    /// place to drop user data.
    pub fn on_destroy_client<F: FnMut(&mut Server<E>, &mut ClientEntry<E>) + 'static>(
        &mut self,
        hook: F,
    ) {
        self.hooks.destroy_client = Some(Box::new(hook));
    }

    /// Set the hook fired when an accepted peer is rejected again by
    /// policy or validation.
    pub fn on_reject<F: FnMut(&mut Server<E>, &mut ClientEntry<E>) + 'static>(&mut self, hook: F) {
        self.hooks.reject = Some(Box::new(hook));
    }

    /// Set the admission veto. Peers are admitted only when it returns
    /// true; with no hook installed everyone passes.
    pub fn on_validate<F: FnMut(&ClientEntry<E>) -> bool + 'static>(&mut self, hook: F) {
        self.hooks.validate = Some(Box::new(hook));
    }

    /// Set the hook observing every dispatched application packet.
    pub fn on_receive<F>(&mut self, hook: F)
    where
        F: FnMut(&mut Server<E>, &Packet, &mut ClientEntry<E>, TransportKind) + 'static,
    {
        self.hooks.receive = Some(Box::new(hook));
    }

    /// Set the hook observing receive-side failures.
    pub fn on_transmit_error<F>(&mut self, hook: F)
    where
        F: FnMut(
                &mut Server<E>,
                Option<&Packet>,
                Option<&mut ClientEntry<E>>,
                TransportKind,
                TransmitError,
            ) + 'static,
    {
        self.hooks.transmit_error = Some(Box::new(hook));
    }

    // Policy -------------------------------------------------------------

    /// Denylist an address and disconnect any live peer behind it.
    pub fn deny_address(&mut self, addr: SocketAddr) {
        self.policy.deny(addr);
        self.disconnect_address(addr);
    }

    /// Remove an address from the denylist.
    pub fn remove_denied_address(&mut self, addr: SocketAddr) {
        self.policy.remove_deny(addr);
    }

    /// Allowlist an address.
    pub fn allow_address(&mut self, addr: SocketAddr) {
        self.policy.allow(addr);
    }

    /// Remove an address from the allowlist.
    pub fn remove_allowed_address(&mut self, addr: SocketAddr) {
        self.policy.remove_allow(addr);
    }

    // Lifecycle ----------------------------------------------------------

    /// Freeze the symbol table, numbering names in registration order, and
    /// begin binding `ANY:port`.
    pub fn start(&mut self, port: u16, family: AddrFamily) {
        self.port = port;
        self.family = family;
        self.symbols.assign_ids(USER_DATA_START);
        self.state = ServerState::Binding;
        info!(port, "starting");
        self.update();
    }

    /// Disconnect every peer, release every retained record, and go idle.
    pub fn stop(&mut self) {
        if self.state == ServerState::NeedsStartup {
            return;
        }
        let now = self.env.now();
        for id in self.clients.keys().copied().collect::<Vec<_>>() {
            if let Some(mut entry) = self.clients.remove(&id) {
                self.drop_peer(&mut entry, now, false);
            }
        }
        for id in self.disconnected.keys().copied().collect::<Vec<_>>() {
            if let Some(mut entry) = self.disconnected.remove(&id) {
                fire_peer!(self, destroy_client, &mut entry);
            }
        }
        self.listener = None;
        self.udp = None;
        self.stream_bound = false;
        self.udp_buf.clear();
        self.state = ServerState::NeedsStartup;
        info!("stopped");
    }

    /// Drive the state machine one tick: bind progress or, once bound,
    /// accept, heartbeat, flush, and both receive pipelines.
    pub fn update(&mut self) {
        match self.state {
            ServerState::NeedsStartup => {}
            ServerState::Binding => self.drive_bind(),
            ServerState::Loop => self.drive_loop(),
        }
    }

    // Accessors ----------------------------------------------------------

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        self.state
    }

    /// True in every state except idle.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state != ServerState::NeedsStartup
    }

    /// True once the listen socket is bound and peers are serviced.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == ServerState::Loop
    }

    /// Whether the shared datagram socket is bound.
    #[must_use]
    pub fn is_stream_bound(&self) -> bool {
        self.stream_bound
    }

    /// The id this server uses for itself: always zero.
    #[must_use]
    pub fn server_id(&self) -> ClientId {
        SERVER_ID
    }

    /// The port passed to [`Server::start`].
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Local address of the listen socket, once bound.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Borrow a live peer by id.
    #[must_use]
    pub fn client(&self, id: ClientId) -> Option<&ClientEntry<E>> {
        self.clients.get(&id)
    }

    /// Mutably borrow a live peer by id.
    pub fn client_mut(&mut self, id: ClientId) -> Option<&mut ClientEntry<E>> {
        self.clients.get_mut(&id)
    }

    /// Iterate over the live peers.
    pub fn clients(&self) -> impl Iterator<Item = &ClientEntry<E>> {
        self.clients.values()
    }

    /// Number of live peers.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Resolve a registered name to its data id; the unassigned sentinel
    /// for unknown names.
    #[must_use]
    pub fn id_of(&self, name: &str) -> DataId {
        self.symbols
            .id_of(name)
            .unwrap_or(ControlId::Unknown.to_data_id())
    }

    /// Resolve a data id back to its registered name.
    #[must_use]
    pub fn name_of(&self, id: DataId) -> Option<&str> {
        self.symbols.name_of(id)
    }

    /// Build an empty packet tagged with the id of a registered name.
    #[must_use]
    pub fn create_pack(&self, name: &str) -> Packet {
        Packet::with_id(self.id_of(name))
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Replace the configuration. A changed heartbeat cadence is broadcast
    /// immediately so every peer's timeout budget follows.
    pub fn set_config(&mut self, config: ServerConfig) {
        if self.is_running() && self.config.aliveness_delay != config.aliveness_delay {
            let beat =
                session::aliveness(session::advertised_budget(config.aliveness_delay, 0.0));
            self.send_to_all(&beat, true);
        }
        self.config = config;
    }

    // Transmit -----------------------------------------------------------

    /// Send a packet to one peer over its reliable channel.
    ///
    /// # Errors
    ///
    /// [`TransmitError::ClientNotFound`] for unknown ids, the entry's own
    /// errors otherwise.
    pub fn send_to(&mut self, pack: &Packet, id: ClientId, block_until_sent: bool) -> SendResult {
        let entry = self
            .clients
            .get_mut(&id)
            .ok_or(SendError::Transmit(TransmitError::ClientNotFound))?;
        entry.send(pack, block_until_sent)
    }

    /// Send a packet to every live peer; returns how many took it.
    pub fn send_to_all(&mut self, pack: &Packet, block_until_sent: bool) -> usize {
        let mut reached = 0;
        for entry in self.clients.values_mut() {
            if entry.state != EntryState::Disconnected
                && entry.send(pack, block_until_sent).is_ok()
            {
                reached += 1;
            }
        }
        reached
    }

    /// Send a packet to one peer over the unreliable channel, finalizing
    /// it with the server id if the caller has not.
    ///
    /// # Errors
    ///
    /// [`TransmitError::ClientNotFound`] for unknown ids,
    /// [`TransmitError::StreamNotBound`] before the datagram socket binds,
    /// socket errors otherwise.
    pub fn stream_to(&mut self, pack: &mut Packet, id: ClientId, block_until_sent: bool) -> SendResult {
        let target = self
            .clients
            .get(&id)
            .filter(|e| e.state != EntryState::Disconnected)
            .map(|e| e.address)
            .ok_or(SendError::Transmit(TransmitError::ClientNotFound))?;
        self.stream_raw(pack, target, block_until_sent)
    }

    /// Send a packet to a peer entry over the unreliable channel; the
    /// entry-handle twin of [`Server::stream_to`] for use inside handlers.
    ///
    /// # Errors
    ///
    /// As [`Server::stream_to`], with [`TransmitError::ClientNotConnected`]
    /// for a disconnected entry.
    pub fn stream_to_entry(
        &mut self,
        pack: &mut Packet,
        entry: &ClientEntry<E>,
        block_until_sent: bool,
    ) -> SendResult {
        if entry.state == EntryState::Disconnected {
            return Err(TransmitError::ClientNotConnected.into());
        }
        self.stream_raw(pack, entry.address, block_until_sent)
    }

    /// Send a packet to every live peer over the unreliable channel,
    /// exactly one datagram per peer; returns how many sends succeeded.
    pub fn stream_to_all(&mut self, pack: &mut Packet, block_until_sent: bool) -> usize {
        if !self.stream_bound {
            return 0;
        }
        let targets: Vec<SocketAddr> = self
            .clients
            .values()
            .filter(|e| e.state != EntryState::Disconnected)
            .map(|e| e.address)
            .collect();
        let mut reached = 0;
        for addr in targets {
            if self.stream_raw(pack, addr, block_until_sent).is_ok() {
                reached += 1;
            }
        }
        reached
    }

    fn stream_raw(
        &mut self,
        pack: &mut Packet,
        target: SocketAddr,
        block_until_sent: bool,
    ) -> SendResult {
        if !self.stream_bound {
            return Err(TransmitError::StreamNotBound.into());
        }
        if !pack.is_finalized() {
            pack.finalize(false, true, SERVER_ID);
        }
        let wire = pack.serialize();
        let sock = self
            .udp
            .as_mut()
            .ok_or(SendError::Transmit(TransmitError::StreamNotBound))?;
        loop {
            match sock.send_to(&wire, target) {
                Ok(n) => return Ok(n),
                Err(SockError::WouldBlock) if block_until_sent => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Disconnect one peer by id. The record moves to the retained map so
    /// the identity can be resumed within the flush window.
    pub fn disconnect_client(&mut self, id: ClientId) -> bool {
        let now = self.env.now();
        let Some(mut entry) = self.clients.remove(&id) else {
            return false;
        };
        self.drop_peer(&mut entry, now, true);
        self.reinstate(entry);
        true
    }

    /// Disconnect every live peer behind an address; returns how many.
    pub fn disconnect_address(&mut self, addr: SocketAddr) -> usize {
        let ids: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, e)| e.address == addr)
            .map(|(id, _)| *id)
            .collect();
        let mut dropped = 0;
        for id in ids {
            if self.disconnect_client(id) {
                dropped += 1;
            }
        }
        dropped
    }

    // Bind driving -------------------------------------------------------

    fn drive_bind(&mut self) {
        if self.listener.is_none() {
            self.listener = self.env.stream_socket(self.family).ok();
        }
        let Some(listener) = self.listener.as_mut() else { return };
        match listener.bind(any_addr(self.family, self.port)) {
            Ok(()) | Err(SockError::Already) => {
                self.state = ServerState::Loop;
                self.aliveness_timer = self.env.now();
                info!(port = self.port, "listen socket bound");
                if let Some(mut hook) = self.hooks.bind.take() {
                    hook(&mut *self);
                    self.hooks.bind.get_or_insert(hook);
                }
            }
            Err(err) => {
                warn!(%err, port = self.port, "bind failed, will retry");
            }
        }
    }

    // Loop driving -------------------------------------------------------

    fn drive_loop(&mut self) {
        if let Some(listener) = self.listener.as_mut() {
            let _ = listener.listen(self.config.backlog);
        }
        self.accept_peers();
        self.heartbeat_sweep();
        self.pump_tcp();
        if !self.is_running() {
            return;
        }
        self.pump_udp();
        self.sweep_disconnected();
    }

    fn accept_peers(&mut self) {
        let now = self.env.now();
        for _ in 0..self.config.backlog {
            let accepted = match self.listener.as_mut() {
                Some(listener) => listener.accept(),
                None => break,
            };
            let (sock, addr) = match accepted {
                Ok(pair) => pair,
                Err(_) => break,
            };

            let mut entry = ClientEntry::new(self.next_client_id, addr, sock, now);
            let admitted = self
                .policy
                .admits(addr, self.config.use_denylist, self.config.use_allowlist)
                && self.run_validate(&entry);

            if admitted {
                self.next_client_id += 1;
                let hello = Packet::with_id(ControlId::Handshake.to_data_id());
                let _ = entry.send(&hello, true);
                debug!(id = entry.id, %addr, "peer accepted");
                self.clients.insert(entry.id, entry);
            } else {
                debug!(%addr, "peer rejected");
                fire_peer!(self, reject, &mut entry);
                // rejected peers get the goodbye but leave no record behind
                self.drop_peer(&mut entry, now, false);
            }
        }
    }

    fn run_validate(&mut self, entry: &ClientEntry<E>) -> bool {
        if let Some(mut hook) = self.hooks.validate.take() {
            let verdict = hook(entry);
            self.hooks.validate.get_or_insert(hook);
            verdict
        } else {
            true
        }
    }

    fn heartbeat_sweep(&mut self) {
        let now = self.env.now();
        let delay_ms = self.config.aliveness_delay.as_secs_f64() * 1000.0;
        if ms_between(self.aliveness_timer, now) < delay_ms {
            return;
        }
        self.aliveness_timer = now;

        for id in self.clients.keys().copied().collect::<Vec<_>>() {
            let Some(mut entry) = self.clients.remove(&id) else { continue };
            let beat = session::aliveness(session::advertised_budget(
                self.config.aliveness_delay,
                entry.ping_ms,
            ));
            let failed = entry.send(&beat, true).is_err();
            if failed || entry.timed_out(now) {
                debug!(id, "peer aliveness lapsed");
                self.drop_peer(&mut entry, now, true);
            }
            self.reinstate(entry);
        }

        if self.config.flush_disconnected {
            for id in self.disconnected.keys().copied().collect::<Vec<_>>() {
                let lapsed = self
                    .disconnected
                    .get(&id)
                    .is_some_and(|e| e.timed_out(now));
                if lapsed {
                    if let Some(mut entry) = self.disconnected.remove(&id) {
                        debug!(id, "flushing disconnected peer record");
                        fire_peer!(self, destroy_client, &mut entry);
                    }
                }
            }
        }
    }

    fn pump_tcp(&mut self) {
        let now = self.env.now();
        for id in self.clients.keys().copied().collect::<Vec<_>>() {
            let Some(mut entry) = self.clients.remove(&id) else { continue };
            if !entry.is_running() {
                self.reinstate(entry);
                continue;
            }
            let mut reads = 0;
            loop {
                reads += 1;
                let n = {
                    let Some(sock) = entry.socket.as_mut() else { break };
                    let space = entry.buf.space();
                    if space.is_empty() {
                        break;
                    }
                    match sock.recv(space) {
                        Ok(n) => n,
                        Err(SockError::ConnReset) => {
                            debug!(id, "peer stream reset");
                            self.drop_peer(&mut entry, now, true);
                            break;
                        }
                        Err(_) => break,
                    }
                };
                if n == 0 {
                    break;
                }
                entry.buf.advance(n);
                self.drain_peer(&mut entry, TransportKind::Tcp);
                if !self.is_running() || !entry.is_running() {
                    break;
                }
                if reads >= self.config.max_tcp_reads_per_update {
                    break;
                }
            }
            self.reinstate(entry);
        }
    }

    fn drain_peer(&mut self, entry: &mut ClientEntry<E>, method: TransportKind) {
        loop {
            if !self.is_running() || !entry.is_running() {
                return;
            }
            match decode_frame(entry.buf.data()) {
                FrameStep::Incomplete => return,
                FrameStep::Oversize => {
                    entry.buf.clear();
                    warn!(
                        id = entry.id,
                        "declared payload exceeds the frame budget, buffer discarded"
                    );
                    self.fire_transmit_error(
                        None,
                        Some(&mut *entry),
                        method,
                        TransmitError::InvalidPayloadSize,
                    );
                    return;
                }
                FrameStep::Frame { packet, size } => {
                    entry.buf.consume(size);
                    self.handle_frame(&packet, Some(&mut *entry), method);
                }
            }
        }
    }

    fn pump_udp(&mut self) {
        if !self.config.allow_udp {
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
                Ok((n, _from)) => {
                    if n == 0 {
                        break;
                    }
                    self.udp_buf.advance(n);
                    self.drain_udp();
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
        let addr = any_addr(self.family, self.port);
        let Some(sock) = self.udp.as_mut() else { return };
        match sock.bind(addr) {
            Ok(()) | Err(SockError::IsConn) => {
                self.stream_bound = true;
                debug!(%addr, "datagram socket bound");
            }
            Err(_) => {}
        }
    }

    fn drain_udp(&mut self) {
        loop {
            if !self.is_running() || !self.stream_bound {
                return;
            }
            match decode_frame(self.udp_buf.data()) {
                FrameStep::Incomplete => return,
                FrameStep::Oversize => {
                    self.udp_buf.clear();
                    warn!("datagram declares an oversize payload, buffer discarded");
                    self.fire_transmit_error(
                        None,
                        None,
                        TransportKind::Udp,
                        TransmitError::InvalidPayloadSize,
                    );
                    return;
                }
                FrameStep::Frame { packet, size } => {
                    self.udp_buf.consume(size);
                    // the datagram's owner is whoever the footer names
                    let owner = if packet.flag(PacketFlags::SENDER_ID) {
                        self.clients.remove(&packet.sender_id())
                    } else {
                        None
                    };
                    match owner {
                        Some(mut entry) => {
                            self.handle_frame(&packet, Some(&mut entry), TransportKind::Udp);
                            self.reinstate(entry);
                        }
                        None => self.handle_frame(&packet, None, TransportKind::Udp),
                    }
                }
            }
        }
    }

    fn sweep_disconnected(&mut self) {
        let gone: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, e)| !e.is_running())
            .map(|(id, _)| *id)
            .collect();
        for id in gone {
            if let Some(entry) = self.clients.remove(&id) {
                self.disconnected.insert(entry.id, entry);
            }
        }
    }

    // Frame handling -----------------------------------------------------

    fn handle_frame(
        &mut self,
        pack: &Packet,
        entry: Option<&mut ClientEntry<E>>,
        method: TransportKind,
    ) {
        match ControlId::from_data_id(pack.data_id()) {
            Some(ControlId::Handshake) => {
                if let Some(entry) = entry {
                    if entry.state == EntryState::DataListExchange {
                        entry.state = EntryState::Connected;
                        debug!(id = entry.id, "peer session ready");
                        fire_peer!(self, ready, entry);
                    }
                }
            }
            Some(ControlId::InitClientId) => {
                if let Some(entry) = entry {
                    self.issue_identity(entry);
                }
            }
            Some(ControlId::Reconnect) => {
                if let Some(entry) = entry {
                    self.resume_identity(pack, entry);
                }
            }
            Some(ControlId::Disconnect) => {
                if let Some(entry) = entry {
                    let now = self.env.now();
                    debug!(id = entry.id, "peer requested disconnect");
                    self.drop_peer(entry, now, true);
                }
            }
            Some(ControlId::DataListEntry) => {
                if let Some(entry) = entry {
                    self.stream_data_list(entry);
                }
            }
            Some(ControlId::Aliveness) => {
                if let Some(entry) = entry {
                    let now = self.env.now();
                    let budget = f64::from(pack.remove::<f32>());
                    entry.reset_timeout(now, budget);
                }
            }
            Some(ControlId::Unknown) | None => self.dispatch_data(pack, entry, method),
        }
    }

    /// First-time identity issuance: echo the provisional id.
    fn issue_identity(&mut self, entry: &mut ClientEntry<E>) {
        let now = self.env.now();
        entry.reset_timeout(now, session::MAX_TIMEOUT_MS);

        let beat = session::aliveness(session::advertised_budget(
            self.config.aliveness_delay,
            entry.ping_ms,
        ));
        let _ = entry.send(&beat, true);

        let grant = session::identity(ControlId::InitClientId, entry.id);
        let _ = entry.send(&grant, true);
        if entry.state == EntryState::Init {
            entry.state = EntryState::DataListExchange;
        }
        debug!(id = entry.id, "identity issued");
        fire_peer!(self, connect, entry);
        fire_peer!(self, initialize_client, entry);
    }

    /// Identity resumption: reclaim the old id when it is free, otherwise
    /// fall back to issuing the provisional one.
    fn resume_identity(&mut self, pack: &Packet, entry: &mut ClientEntry<E>) {
        let now = self.env.now();
        entry.reset_timeout(now, session::MAX_TIMEOUT_MS);

        let beat = session::aliveness(session::advertised_budget(self.config.aliveness_delay, 0.0));
        let _ = entry.send(&beat, true);

        let old_id: ClientId = pack.remove();
        let occupied = old_id == 0 || self.clients.contains_key(&old_id);
        if occupied {
            let grant = session::identity(ControlId::InitClientId, entry.id);
            let _ = entry.send(&grant, true);
            if entry.state == EntryState::Init {
                entry.state = EntryState::DataListExchange;
            }
            debug!(id = entry.id, old_id, "identity resumption refused");
            fire_peer!(self, failed_reconnect, entry);
            fire_peer!(self, connect, entry);
            fire_peer!(self, initialize_client, entry);
        } else {
            entry.id = old_id;
            if let Some(mut retained) = self.disconnected.remove(&old_id) {
                entry.user_data = retained.take_user_data();
            } else {
                fire_peer!(self, initialize_client, entry);
            }
            let grant = session::identity(ControlId::Reconnect, old_id);
            let _ = entry.send(&grant, true);
            if entry.state == EntryState::Init {
                entry.state = EntryState::DataListExchange;
            }
            debug!(id = old_id, "identity resumed");
            fire_peer!(self, reconnect, entry);
        }
    }

    /// Stream the whole symbol table to one peer, one entry per packet.
    fn stream_data_list(&mut self, entry: &mut ClientEntry<E>) {
        let total = self.symbols.len() as u16;
        let records: Vec<session::DataListEntry> = self
            .symbols
            .iter()
            .enumerate()
            .map(|(index, (name, data_id))| session::DataListEntry {
                total,
                index: index as u16,
                name: name.to_string(),
                data_id,
            })
            .collect();
        let mut out = Packet::with_id(ControlId::DataListEntry.to_data_id());
        for record in records {
            out.clear();
            if record.write(&mut out).is_ok() {
                let _ = entry.send(&out, true);
            }
        }
    }

    fn dispatch_data(
        &mut self,
        pack: &Packet,
        entry: Option<&mut ClientEntry<E>>,
        method: TransportKind,
    ) {
        // the control range never reaches handlers, even if a name in the
        // table still carries the unassigned sentinel
        let idx = if tether_proto::control::is_control(pack.data_id()) {
            None
        } else {
            self.symbols.index_by_id(pack.data_id())
        };
        let verified = method == TransportKind::Tcp || pack.is_valid();

        match entry {
            Some(entry) if idx.is_some() && verified => {
                let Some(idx) = idx else { return };
                if let Some(mut hook) = self.hooks.receive.take() {
                    hook(&mut *self, pack, &mut *entry, method);
                    pack.reset();
                    self.hooks.receive.get_or_insert(hook);
                }

                let mut handlers = self.symbols.take_handlers(idx);
                for handler in handlers.iter_mut().rev() {
                    if !self.is_running() || !entry.is_running() {
                        break;
                    }
                    handler(&mut *self, pack, &mut *entry, method);
                    pack.reset();
                }
                self.symbols.restore_handlers(idx, handlers);
            }
            entry => {
                let err = match &entry {
                    None => TransmitError::ClientNotFound,
                    Some(_) if idx.is_none() => TransmitError::InvalidDataId,
                    Some(_) => TransmitError::InvalidChecksum,
                };
                self.fire_transmit_error(Some(pack), entry, method, err);
            }
        }
    }

    fn fire_transmit_error(
        &mut self,
        pack: Option<&Packet>,
        entry: Option<&mut ClientEntry<E>>,
        method: TransportKind,
        err: TransmitError,
    ) {
        warn!(?method, %err, "receive error");
        if let Some(mut hook) = self.hooks.transmit_error.take() {
            hook(&mut *self, pack, entry, method, err);
            self.hooks.transmit_error.get_or_insert(hook);
        }
    }

    // Teardown -----------------------------------------------------------

    /// End one peer's session: goodbye packet, state flip, disconnect
    /// hook, socket release. When `retain` is set the timeout clock is
    /// re-armed with the flush delay so the record survives for identity
    /// resumption; the caller moves it to the retained map afterwards.
    fn drop_peer(&mut self, entry: &mut ClientEntry<E>, now: Instant, retain: bool) {
        if entry.state == EntryState::Disconnected {
            return;
        }
        let bye = Packet::with_id(ControlId::Disconnect.to_data_id());
        let _ = entry.send(&bye, false);
        entry.state = EntryState::Disconnected;
        if retain && self.config.flush_disconnected {
            let flush_ms = self.config.disconnected_flush_delay.as_secs_f64() * 1000.0;
            entry.reset_timeout(now, flush_ms);
        }
        debug!(id = entry.id, "peer disconnected");
        fire_peer!(self, disconnect, entry);
        entry.socket = None;
    }

    /// Put a processed entry back where it belongs: the live map while
    /// running (under its current, possibly re-keyed id), the retained map
    /// once disconnected.
    fn reinstate(&mut self, entry: ClientEntry<E>) {
        if entry.state == EntryState::Disconnected {
            self.disconnected.insert(entry.id, entry);
        } else {
            self.clients.insert(entry.id, entry);
        }
    }
}

impl<E: Environment> std::fmt::Debug for Server<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.state)
            .field("port", &self.port)
            .field("clients", &self.clients.len())
            .field("disconnected", &self.disconnected.len())
            .field("names", &self.symbols.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::SystemEnv;

    #[test]
    fn starts_idle_with_monotonic_ids_pending() {
        let server = Server::new(SystemEnv, ServerConfig::default());
        assert_eq!(server.state(), ServerState::NeedsStartup);
        assert_eq!(server.server_id(), 0);
        assert_eq!(server.client_count(), 0);
    }

    #[test]
    fn names_are_numbered_in_registration_order() {
        let mut server = Server::new(SystemEnv, ServerConfig::default());
        assert!(server.register("alpha", |_, _, _, _| {}));
        assert!(server.register_type("beta"));
        server.symbols.assign_ids(USER_DATA_START);
        assert_eq!(server.id_of("alpha"), 7);
        assert_eq!(server.id_of("beta"), 8);
        assert_eq!(server.name_of(8), Some("beta"));
    }

    #[test]
    fn send_to_unknown_peer_is_client_not_found() {
        let mut server = Server::new(SystemEnv, ServerConfig::default());
        let pack = Packet::with_id(9);
        assert_eq!(
            server.send_to(&pack, 42, true),
            Err(SendError::Transmit(TransmitError::ClientNotFound))
        );
    }
}

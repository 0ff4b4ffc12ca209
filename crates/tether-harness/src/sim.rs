//! The in-memory network fabric.
//!
//! Single-threaded, like the session layer itself: everything lives behind
//! `Rc<RefCell<..>>` and no call ever blocks. Stream pipes
//! model TCP (ordered bytes, arbitrary read chunking, reset injection);
//! mailboxes model UDP (whole datagrams, optional loss). The clock is a
//! base instant plus a manually advanced offset.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tether_core::{AddrFamily, DatagramSocket, Environment, SockError, StreamSocket};

const EPHEMERAL_START: u16 = 49152;

/// One TCP-like byte pipe between a connecting side (`A`) and an accepted
/// side (`B`).
struct Pipe {
    a_to_b: VecDeque<u8>,
    b_to_a: VecDeque<u8>,
    a_addr: SocketAddr,
    b_addr: SocketAddr,
    a_open: bool,
    b_open: bool,
    reset: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    A,
    B,
}

struct Pending {
    pipe: Rc<RefCell<Pipe>>,
    peer: SocketAddr,
}

type Mailbox = Rc<RefCell<VecDeque<(SocketAddr, Vec<u8>)>>>;

struct Fabric {
    base: Instant,
    offset: Duration,
    next_port: u16,
    listeners: HashMap<u16, VecDeque<Pending>>,
    pipes: Vec<Rc<RefCell<Pipe>>>,
    mailboxes: HashMap<SocketAddr, Mailbox>,
    stream_read_cap: Option<usize>,
    drop_datagrams: bool,
}

impl Fabric {
    fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Duration::ZERO,
            next_port: EPHEMERAL_START,
            listeners: HashMap::new(),
            pipes: Vec::new(),
            mailboxes: HashMap::new(),
            stream_read_cap: None,
            drop_datagrams: false,
        }
    }

    fn ephemeral(&mut self) -> SocketAddr {
        let port = self.next_port;
        self.next_port = self.next_port.wrapping_add(1).max(EPHEMERAL_START);
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// Route a datagram: exact destination first, then a wildcard bind on
    /// the same port.
    fn route_datagram(&self, to: SocketAddr) -> Option<Mailbox> {
        if let Some(mb) = self.mailboxes.get(&to) {
            return Some(mb.clone());
        }
        self.mailboxes
            .iter()
            .find(|(addr, _)| addr.port() == to.port() && addr.ip().is_unspecified())
            .map(|(_, mb)| mb.clone())
    }
}

/// A sender address as the receiving side observes it: wildcard binds show
/// up as loopback.
fn observed_from(local: SocketAddr) -> SocketAddr {
    if local.ip().is_unspecified() {
        SocketAddr::from(([127, 0, 0, 1], local.port()))
    } else {
        local
    }
}

/// Handle on a simulated network: clock control and fault injection.
///
/// Clones share the same fabric.
#[derive(Clone)]
pub struct SimNet {
    fabric: Rc<RefCell<Fabric>>,
}

impl SimNet {
    /// Fresh, empty network with its clock at zero offset.
    #[must_use]
    pub fn new() -> Self {
        Self {
            fabric: Rc::new(RefCell::new(Fabric::new())),
        }
    }

    /// An [`Environment`] on this network, for constructing clients and
    /// servers.
    #[must_use]
    pub fn env(&self) -> SimEnv {
        SimEnv {
            fabric: self.fabric.clone(),
        }
    }

    /// Advance the virtual clock.
    pub fn advance(&self, by: Duration) {
        self.fabric.borrow_mut().offset += by;
    }

    /// Cap how many bytes a single stream `recv` may return, to exercise
    /// partial-frame reassembly. `None` removes the cap.
    pub fn set_stream_read_cap(&self, cap: Option<usize>) {
        self.fabric.borrow_mut().stream_read_cap = cap;
    }

    /// Silently drop every datagram in flight from now on.
    pub fn set_drop_datagrams(&self, drop: bool) {
        self.fabric.borrow_mut().drop_datagrams = drop;
    }

    /// Reset every stream pipe touching `addr`, as if the connection died
    /// abruptly. Both ends observe a connection reset.
    pub fn sever(&self, addr: SocketAddr) {
        let fabric = self.fabric.borrow();
        for pipe in &fabric.pipes {
            let mut pipe = pipe.borrow_mut();
            if pipe.a_addr == addr || pipe.b_addr == addr {
                pipe.reset = true;
            }
        }
    }
}

impl Default for SimNet {
    fn default() -> Self {
        Self::new()
    }
}

/// [`Environment`] implementation over a [`SimNet`] fabric.
#[derive(Clone)]
pub struct SimEnv {
    fabric: Rc<RefCell<Fabric>>,
}

impl Environment for SimEnv {
    type Stream = SimStream;
    type Datagram = SimDatagram;

    fn now(&self) -> Instant {
        let fabric = self.fabric.borrow();
        fabric.base + fabric.offset
    }

    fn stream_socket(&self, _family: AddrFamily) -> Result<Self::Stream, SockError> {
        Ok(SimStream {
            fabric: self.fabric.clone(),
            bound: None,
            role: Role::Idle,
        })
    }

    fn datagram_socket(&self, _family: AddrFamily) -> Result<Self::Datagram, SockError> {
        Ok(SimDatagram {
            fabric: self.fabric.clone(),
            local: None,
            mailbox: None,
        })
    }
}

enum Role {
    Idle,
    Listener {
        port: u16,
    },
    Stream {
        pipe: Rc<RefCell<Pipe>>,
        side: Side,
        local: SocketAddr,
    },
}

/// Simulated connection-oriented socket.
pub struct SimStream {
    fabric: Rc<RefCell<Fabric>>,
    bound: Option<SocketAddr>,
    role: Role,
}

impl StreamSocket for SimStream {
    fn connect(&mut self, addr: SocketAddr) -> Result<(), SockError> {
        match self.role {
            Role::Stream { .. } => Err(SockError::IsConn),
            Role::Listener { .. } => Err(SockError::Invalid),
            Role::Idle => {
                let mut fabric = self.fabric.borrow_mut();
                if !fabric.listeners.contains_key(&addr.port()) {
                    // nobody listening yet; a later retry may find them
                    return Err(SockError::InProgress);
                }
                let local = fabric.ephemeral();
                let dialed = observed_from(addr);
                let pipe = Rc::new(RefCell::new(Pipe {
                    a_to_b: VecDeque::new(),
                    b_to_a: VecDeque::new(),
                    a_addr: local,
                    b_addr: dialed,
                    a_open: true,
                    b_open: true,
                    reset: false,
                }));
                fabric.pipes.push(pipe.clone());
                if let Some(queue) = fabric.listeners.get_mut(&addr.port()) {
                    queue.push_back(Pending {
                        pipe: pipe.clone(),
                        peer: local,
                    });
                }
                self.role = Role::Stream {
                    pipe,
                    side: Side::A,
                    local,
                };
                Ok(())
            }
        }
    }

    fn bind(&mut self, addr: SocketAddr) -> Result<(), SockError> {
        match self.role {
            Role::Idle => {
                self.bound = Some(addr);
                Ok(())
            }
            _ => Err(SockError::Invalid),
        }
    }

    fn listen(&mut self, _backlog: u32) -> Result<(), SockError> {
        match self.role {
            Role::Listener { .. } => Ok(()),
            Role::Stream { .. } => Err(SockError::Invalid),
            Role::Idle => {
                let addr = self.bound.ok_or(SockError::Invalid)?;
                self.fabric
                    .borrow_mut()
                    .listeners
                    .entry(addr.port())
                    .or_default();
                self.role = Role::Listener { port: addr.port() };
                Ok(())
            }
        }
    }

    fn accept(&mut self) -> Result<(Self, SocketAddr), SockError> {
        let Role::Listener { port } = self.role else {
            return Err(SockError::Invalid);
        };
        let pending = self
            .fabric
            .borrow_mut()
            .listeners
            .get_mut(&port)
            .and_then(VecDeque::pop_front);
        let Some(Pending { pipe, peer }) = pending else {
            return Err(SockError::WouldBlock);
        };
        let local = pipe.borrow().b_addr;
        Ok((
            SimStream {
                fabric: self.fabric.clone(),
                bound: None,
                role: Role::Stream {
                    pipe,
                    side: Side::B,
                    local,
                },
            },
            peer,
        ))
    }

    fn send(&mut self, buf: &[u8]) -> Result<usize, SockError> {
        let Role::Stream { pipe, side, .. } = &self.role else {
            return Err(SockError::Invalid);
        };
        let mut pipe = pipe.borrow_mut();
        if pipe.reset {
            return Err(SockError::ConnReset);
        }
        let peer_open = match side {
            Side::A => pipe.b_open,
            Side::B => pipe.a_open,
        };
        if !peer_open {
            return Err(SockError::ConnReset);
        }
        match side {
            Side::A => pipe.a_to_b.extend(buf),
            Side::B => pipe.b_to_a.extend(buf),
        }
        Ok(buf.len())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, SockError> {
        let cap = self.fabric.borrow().stream_read_cap;
        let Role::Stream { pipe, side, .. } = &self.role else {
            return Err(SockError::Invalid);
        };
        let mut pipe = pipe.borrow_mut();
        if pipe.reset {
            return Err(SockError::ConnReset);
        }
        let peer_open = pipe.a_open && pipe.b_open;
        let inbound = match side {
            Side::A => &mut pipe.b_to_a,
            Side::B => &mut pipe.a_to_b,
        };
        if inbound.is_empty() {
            return if peer_open {
                Err(SockError::WouldBlock)
            } else {
                Ok(0)
            };
        }
        let mut want = buf.len().min(inbound.len());
        if let Some(cap) = cap {
            want = want.min(cap);
        }
        for slot in buf.iter_mut().take(want) {
            *slot = inbound.pop_front().unwrap_or(0);
        }
        Ok(want)
    }

    fn local_addr(&self) -> Result<SocketAddr, SockError> {
        match &self.role {
            Role::Stream { local, .. } => Ok(*local),
            Role::Listener { .. } | Role::Idle => self.bound.ok_or(SockError::Invalid),
        }
    }
}

impl Drop for SimStream {
    fn drop(&mut self) {
        if let Role::Stream { pipe, side, .. } = &self.role {
            let mut pipe = pipe.borrow_mut();
            match side {
                Side::A => pipe.a_open = false,
                Side::B => pipe.b_open = false,
            }
        }
    }
}

/// Simulated datagram socket.
pub struct SimDatagram {
    fabric: Rc<RefCell<Fabric>>,
    local: Option<SocketAddr>,
    mailbox: Option<Mailbox>,
}

impl DatagramSocket for SimDatagram {
    fn bind(&mut self, addr: SocketAddr) -> Result<(), SockError> {
        let mailbox: Mailbox = Rc::new(RefCell::new(VecDeque::new()));
        self.fabric
            .borrow_mut()
            .mailboxes
            .insert(addr, mailbox.clone());
        self.local = Some(addr);
        self.mailbox = Some(mailbox);
        Ok(())
    }

    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> Result<usize, SockError> {
        let local = self.local.ok_or(SockError::Invalid)?;
        let fabric = self.fabric.borrow();
        if !fabric.drop_datagrams {
            if let Some(mailbox) = fabric.route_datagram(addr) {
                mailbox
                    .borrow_mut()
                    .push_back((observed_from(local), buf.to_vec()));
            }
            // a missing receiver is silent loss, as on a real network
        }
        Ok(buf.len())
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SockError> {
        let mailbox = self.mailbox.as_ref().ok_or(SockError::Invalid)?;
        let Some((from, datagram)) = mailbox.borrow_mut().pop_front() else {
            return Err(SockError::WouldBlock);
        };
        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        Ok((n, from))
    }

    fn local_addr(&self) -> Result<SocketAddr, SockError> {
        self.local.ok_or(SockError::Invalid)
    }
}

impl Drop for SimDatagram {
    fn drop(&mut self) {
        if let Some(local) = self.local {
            self.fabric.borrow_mut().mailboxes.remove(&local);
        }
    }
}

//! Shared scaffolding for the scenario tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use tether_core::{AddrFamily, Client, Environment, Server, StreamSocket};
use tether_harness::sim::SimStream;
use tether_harness::{SimEnv, SimNet};
use tether_proto::{decode_frame, FrameStep, Packet};

/// The port every scenario's server listens on; each test owns its own
/// fabric, so there are no collisions.
pub const PORT: u16 = 4000;

/// The address clients dial.
pub fn server_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], PORT))
}

/// Tick both sides `ticks` times, advancing the virtual clock `step_ms`
/// between rounds.
pub fn drive(net: &SimNet, server: &mut Server<SimEnv>, client: &mut Client<SimEnv>, ticks: u32, step_ms: u64) {
    for _ in 0..ticks {
        server.update();
        client.update();
        net.advance(Duration::from_millis(step_ms));
    }
}

/// Start the server, connect the client, and drive both until the session
/// is fully established.
pub fn establish(net: &SimNet, server: &mut Server<SimEnv>, client: &mut Client<SimEnv>) {
    server.start(PORT, AddrFamily::Ipv4);
    server.update();
    client.connect(server_addr());
    drive(net, server, client, 40, 50);
    assert!(client.is_ready(), "client never became ready");
}

/// A hand-driven peer speaking raw frames, for protocol-level scenarios a
/// well-behaved `Client` cannot produce.
pub struct RawPeer {
    pub sock: SimStream,
    acc: Vec<u8>,
}

impl RawPeer {
    /// Dial the server directly; the listener must already exist.
    pub fn connect(env: &SimEnv, addr: SocketAddr) -> Self {
        let mut sock = env.stream_socket(AddrFamily::Ipv4).expect("sim socket");
        sock.connect(addr).expect("listener should be up");
        Self {
            sock,
            acc: Vec::new(),
        }
    }

    /// The address the server sees this peer under.
    pub fn local_addr(&self) -> SocketAddr {
        self.sock.local_addr().expect("connected")
    }

    /// Write one serialized packet to the stream.
    pub fn send_packet(&mut self, pack: &Packet) {
        self.sock.send(&pack.serialize()).expect("pipe open");
    }

    /// Write raw bytes to the stream.
    pub fn send_bytes(&mut self, bytes: &[u8]) {
        self.sock.send(bytes).expect("pipe open");
    }

    /// Pull everything pending off the stream and decode whole frames.
    pub fn read_packets(&mut self) -> Vec<Packet> {
        let mut tmp = [0u8; 2048];
        loop {
            match self.sock.recv(&mut tmp) {
                Ok(0) => break,
                Ok(n) => self.acc.extend_from_slice(&tmp[..n]),
                Err(_) => break,
            }
        }
        let mut out = Vec::new();
        loop {
            match decode_frame(&self.acc) {
                FrameStep::Frame { packet, size } => {
                    self.acc.drain(..size);
                    out.push(packet);
                }
                _ => break,
            }
        }
        out
    }
}

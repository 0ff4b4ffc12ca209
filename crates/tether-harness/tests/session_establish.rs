//! Session establishment: handshake, identity issuance, symbol table
//! exchange, and steady-state liveness.

mod support;

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use support::{drive, establish, server_addr, PORT};
use tether_core::{AddrFamily, Client, ClientConfig, ClientState, Server, ServerConfig};
use tether_harness::{init_tracing, SimNet};

#[test]
fn simple_connect() {
    init_tracing();
    let net = SimNet::new();
    let env = net.env();

    let mut server = Server::new(env.clone(), ServerConfig::default());
    server.register("message", |_, _, _, _| {});
    let server_ready = Rc::new(Cell::new(false));
    {
        let flag = server_ready.clone();
        server.on_ready(move |_, _| flag.set(true));
    }

    let mut client = Client::new(env, ClientConfig::default());
    client.register("message", |_, _, _| {});
    let client_ready = Rc::new(Cell::new(false));
    {
        let flag = client_ready.clone();
        client.on_ready(move |_| flag.set(true));
    }

    establish(&net, &mut server, &mut client);

    assert_eq!(client.state(), ClientState::Connected);
    assert!(client_ready.get(), "client ready hook never fired");
    assert!(server_ready.get(), "server ready hook never fired");
    assert_eq!(client.id_of("message"), 7);
    assert_eq!(server.id_of("message"), 7);
    assert_eq!(client.client_id(), 1);

    assert_eq!(server.client_count(), 1);
    let entry = server.clients().next().expect("one live peer");
    assert_eq!(entry.id(), 1);
    assert!(entry.is_ready());
}

#[test]
fn client_ids_are_monotonic_from_one() {
    let net = SimNet::new();
    let env = net.env();

    let mut server = Server::new(env.clone(), ServerConfig::default());
    server.register("message", |_, _, _, _| {});
    server.start(PORT, AddrFamily::Ipv4);
    server.update();

    let mut clients: Vec<Client<_>> = (0..3)
        .map(|_| {
            let mut client = Client::new(env.clone(), ClientConfig::default());
            client.register("message", |_, _, _| {});
            client.connect(server_addr());
            client
        })
        .collect();

    for _ in 0..60 {
        server.update();
        for client in &mut clients {
            client.update();
        }
        net.advance(Duration::from_millis(50));
    }

    for client in &clients {
        assert!(client.is_ready());
    }
    let mut ids: Vec<u32> = server.clients().map(|e| e.id()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3]);

    let mut client_ids: Vec<u32> = clients.iter().map(|c| c.client_id()).collect();
    client_ids.sort_unstable();
    assert_eq!(client_ids, vec![1, 2, 3]);
}

#[test]
fn symbol_table_agrees_on_every_name() {
    let net = SimNet::new();
    let env = net.env();

    let mut server = Server::new(env.clone(), ServerConfig::default());
    server.register("position", |_, _, _, _| {});
    server.register_type("inventory");
    server.register("chat", |_, _, _, _| {});

    // the client registers only one of the names up front; the exchange
    // teaches it the rest
    let mut client = Client::new(env, ClientConfig::default());
    client.register("chat", |_, _, _| {});

    establish(&net, &mut server, &mut client);

    for name in ["position", "inventory", "chat"] {
        assert_eq!(client.id_of(name), server.id_of(name), "{name} diverged");
    }
    assert_eq!(client.name_of(server.id_of("chat")), Some("chat"));
}

#[test]
fn sessions_do_not_drop_spontaneously() {
    let net = SimNet::new();
    let env = net.env();

    let mut server = Server::new(env.clone(), ServerConfig::default());
    server.register("message", |_, _, _, _| {});
    let peer_lost = Rc::new(Cell::new(false));
    {
        let flag = peer_lost.clone();
        server.on_disconnect(move |_, _| flag.set(true));
    }

    let mut client = Client::new(env, ClientConfig::default());
    client.register("message", |_, _, _| {});
    let dropped = Rc::new(Cell::new(false));
    {
        let flag = dropped.clone();
        client.on_disconnect(move |_| flag.set(true));
    }
    {
        let flag = dropped.clone();
        client.on_attempt_reconnect(move |_| flag.set(true));
    }

    establish(&net, &mut server, &mut client);

    // twenty virtual seconds of steady ticking at a rate well above the
    // heartbeat cadence
    drive(&net, &mut server, &mut client, 200, 100);

    assert!(client.is_ready());
    assert!(!dropped.get(), "client dropped spontaneously");
    assert!(!peer_lost.get(), "server dropped the peer spontaneously");
    assert_eq!(server.client_count(), 1);
}

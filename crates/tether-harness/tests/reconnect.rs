//! Identity resumption: reclaiming an id (with user data) after an abrupt
//! drop, and refusal when the id is already held.

mod support;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use support::{drive, establish, server_addr, RawPeer};
use tether_core::{Client, ClientConfig, Server, ServerConfig};
use tether_harness::{init_tracing, SimNet};
use tether_proto::{session, ControlId};

#[derive(Debug, PartialEq)]
struct Score(u32);

/// S4: an abrupt socket death, a reconnect inside the flush window, and
/// the same id plus user data on the far side.
#[test]
fn reconnect_preserves_identity_and_user_data() {
    init_tracing();
    let net = SimNet::new();
    let env = net.env();

    let mut server = Server::new(env.clone(), ServerConfig::default());
    server.register("message", |_, _, _, _| {});
    server.on_initialize_client(|_, entry| entry.set_user_data(Score(41)));
    let server_resumed = Rc::new(Cell::new(false));
    {
        let flag = server_resumed.clone();
        server.on_reconnect(move |_, _| flag.set(true));
    }

    let mut client = Client::new(env, ClientConfig::default());
    client.register("message", |_, _, _| {});
    let client_resumed = Rc::new(Cell::new(false));
    {
        let flag = client_resumed.clone();
        client.on_reconnect(move |_| flag.set(true));
    }

    establish(&net, &mut server, &mut client);
    assert_eq!(client.client_id(), 1);

    // application state accumulated during the session
    server
        .client_mut(1)
        .expect("live peer")
        .user_data_mut::<Score>()
        .expect("initialized")
        .0 = 99;

    // kill the transport out from under both ends
    net.sever(client.local_addr().expect("connected"));
    drive(&net, &mut server, &mut client, 40, 50);

    assert!(client.is_ready(), "client failed to re-establish");
    assert!(client_resumed.get(), "client reconnect hook never fired");
    assert!(server_resumed.get(), "server reconnect hook never fired");
    assert_eq!(client.client_id(), 1);

    assert_eq!(server.client_count(), 1);
    let entry = server.client(1).expect("peer under the original id");
    assert_eq!(entry.id(), 1);
    assert_eq!(entry.user_data::<Score>(), Some(&Score(99)));
}

/// S5: a resumption request for an id someone else holds gets a fresh
/// identity instead, with the refused-then-connected hook order.
#[test]
fn resumption_of_a_held_id_is_refused() {
    let net = SimNet::new();
    let env = net.env();

    let mut server = Server::new(env.clone(), ServerConfig::default());
    server.register("message", |_, _, _, _| {});
    let events = Rc::new(RefCell::new(Vec::<&'static str>::new()));
    {
        let events = events.clone();
        server.on_failed_reconnect(move |_, _| events.borrow_mut().push("failed_reconnect"));
    }
    {
        let events = events.clone();
        server.on_connect(move |_, _| events.borrow_mut().push("connect"));
    }
    {
        let events = events.clone();
        server.on_initialize_client(move |_, _| events.borrow_mut().push("initialize"));
    }

    // the first client legitimately holds id 1
    let mut holder = Client::new(env.clone(), ClientConfig::default());
    holder.register("message", |_, _, _| {});
    establish(&net, &mut server, &mut holder);
    assert_eq!(holder.client_id(), 1);
    events.borrow_mut().clear();

    // a raw peer claims to have been id 1 in a former life
    let mut pretender = RawPeer::connect(&env, server_addr());
    server.update();
    let greeting = pretender.read_packets();
    assert!(greeting
        .iter()
        .any(|p| p.data_id() == ControlId::Handshake.to_data_id()));

    pretender.send_packet(&session::identity(ControlId::Reconnect, 1));
    server.update();

    assert_eq!(
        events.borrow().as_slice(),
        ["failed_reconnect", "connect", "initialize"]
    );

    // the grant is a fresh identity, not the contested one
    let replies = pretender.read_packets();
    let grant = replies
        .iter()
        .find(|p| p.data_id() == ControlId::InitClientId.to_data_id())
        .expect("fresh identity grant");
    assert_eq!(grant.remove::<u32>(), 2);
    assert!(replies
        .iter()
        .all(|p| p.data_id() != ControlId::Reconnect.to_data_id()));
}

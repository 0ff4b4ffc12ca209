//! Application round trips over both channels, partial-frame reassembly
//! under hostile read chunking, and datagram loss tolerance.

mod support;

use std::cell::RefCell;
use std::rc::Rc;

use support::{drive, establish};
use tether_core::{Client, ClientConfig, Server, ServerConfig, TransportKind};
use tether_harness::{init_tracing, SimNet};

/// S2: client sends "hi" reliably; the server's handler replies over the
/// datagram channel with a finalized, checksummed packet.
#[test]
fn round_trip_over_both_channels() {
    init_tracing();
    let net = SimNet::new();
    let env = net.env();

    let heard = Rc::new(RefCell::new(Vec::<String>::new()));
    let mut server = Server::new(env.clone(), ServerConfig::default());
    {
        let heard = heard.clone();
        server.register("message", move |srv, pack, entry, method| {
            assert_eq!(method, TransportKind::Tcp);
            heard.borrow_mut().push(pack.remove_string());

            let mut reply = srv.create_pack("message");
            reply.add_string("hi").unwrap();
            reply.add(1u32).unwrap();
            reply.finalize(true, true, 0);
            srv.stream_to_entry(&mut reply, entry, true).unwrap();
        });
    }

    let echoed = Rc::new(RefCell::new(Vec::<(String, u32)>::new()));
    let mut client = Client::new(env, ClientConfig::default());
    {
        let echoed = echoed.clone();
        client.register("message", move |_, pack, method| {
            assert_eq!(method, TransportKind::Udp);
            assert!(pack.is_valid(), "checksummed reply failed verification");
            echoed.borrow_mut().push((pack.remove_string(), pack.remove()));
        });
    }

    establish(&net, &mut server, &mut client);
    // a few extra rounds so the datagram companion binds on both sides
    drive(&net, &mut server, &mut client, 5, 20);
    assert!(client.is_stream_bound());

    let mut pack = client.create_pack("message");
    pack.add_string("hi").unwrap();
    client.send_to_server(&pack, true).unwrap();

    drive(&net, &mut server, &mut client, 10, 20);

    assert_eq!(heard.borrow().as_slice(), ["hi"]);
    assert_eq!(echoed.borrow().as_slice(), [("hi".to_string(), 1u32)]);
}

/// Property: chopping the stream into tiny reads changes nothing; frames
/// are reassembled and dispatched in send order.
#[test]
fn establishment_and_data_survive_tiny_reads() {
    let net = SimNet::new();
    let env = net.env();
    net.set_stream_read_cap(Some(3));

    let heard = Rc::new(RefCell::new(Vec::<String>::new()));
    let mut server = Server::new(env.clone(), ServerConfig::default());
    {
        let heard = heard.clone();
        server.register("message", move |_, pack, _, _| {
            heard.borrow_mut().push(pack.remove_string());
        });
    }

    let mut client = Client::new(env, ClientConfig::default());
    client.register("message", |_, _, _| {});

    establish(&net, &mut server, &mut client);

    for text in ["one", "two", "three"] {
        let mut pack = client.create_pack("message");
        pack.add_string(text).unwrap();
        client.send_to_server(&pack, true).unwrap();
    }
    drive(&net, &mut server, &mut client, 30, 20);

    assert_eq!(heard.borrow().as_slice(), ["one", "two", "three"]);
}

/// Datagram loss never disturbs the session: heartbeats ride the reliable
/// channel.
#[test]
fn datagram_loss_is_tolerated() {
    let net = SimNet::new();
    let env = net.env();

    let mut server = Server::new(env.clone(), ServerConfig::default());
    server.register("burst", |_, _, _, _| {});
    let mut client = Client::new(env, ClientConfig::default());
    let got = Rc::new(RefCell::new(0u32));
    {
        let got = got.clone();
        client.register("burst", move |_, _, _| *got.borrow_mut() += 1);
    }

    establish(&net, &mut server, &mut client);
    drive(&net, &mut server, &mut client, 5, 20);

    net.set_drop_datagrams(true);
    let mut pack = server.create_pack("burst");
    assert_eq!(server.stream_to_all(&mut pack, true), 1);

    // several virtual seconds: the loss goes unnoticed by the session
    drive(&net, &mut server, &mut client, 50, 100);

    assert_eq!(*got.borrow(), 0);
    assert!(client.is_ready());
    assert_eq!(server.client_count(), 1);
}

//! S3: a silent server is detected through the heartbeat budget and the
//! client falls into reconnection.

mod support;

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use support::establish;
use tether_core::{Client, ClientConfig, ClientState, Server, ServerConfig};
use tether_harness::{init_tracing, SimNet};

#[test]
fn silent_server_times_the_client_out() {
    init_tracing();
    let net = SimNet::new();
    let env = net.env();

    let mut server = Server::new(env.clone(), ServerConfig::default());
    server.register("message", |_, _, _, _| {});

    let mut client = Client::new(env, ClientConfig::default());
    client.register("message", |_, _, _| {});
    let reconnecting = Rc::new(Cell::new(false));
    {
        let flag = reconnecting.clone();
        client.on_attempt_reconnect(move |_| flag.set(true));
    }

    establish(&net, &mut server, &mut client);

    // stop driving the server; the client's budget is the server's last
    // advertisement, (1000 + ping) x 3.1, so a little past three missed
    // beats the session must drop
    let mut ticks = 0;
    while !reconnecting.get() && ticks < 50 {
        net.advance(Duration::from_millis(250));
        client.update();
        ticks += 1;
    }

    assert!(reconnecting.get(), "client never noticed the silent server");
    assert_eq!(client.state(), ClientState::Reconnecting);
    // detection cannot beat the advertised budget: at least 3.1 seconds of
    // silence were needed
    assert!(ticks >= 12, "dropped after only {ticks} quarter-second ticks");
}

#[test]
fn timeout_honors_the_advertised_budget_after_config_change() {
    let net = SimNet::new();
    let env = net.env();

    let mut server = Server::new(env.clone(), ServerConfig::default());
    server.register("message", |_, _, _, _| {});

    // a snappier client cadence advertises a smaller budget to the server,
    // while its own patience still follows the server's advertisement
    let mut client = Client::new(
        env,
        ClientConfig {
            aliveness_delay: Duration::from_millis(200),
            ..ClientConfig::default()
        },
    );
    client.register("message", |_, _, _| {});
    let reconnecting = Rc::new(Cell::new(false));
    {
        let flag = reconnecting.clone();
        client.on_attempt_reconnect(move |_| flag.set(true));
    }

    establish(&net, &mut server, &mut client);

    let mut ticks = 0;
    while !reconnecting.get() && ticks < 100 {
        net.advance(Duration::from_millis(100));
        client.update();
        ticks += 1;
    }

    // the server advertises (1000 + ping) x 3.1 regardless of the client's
    // own cadence, so detection still waits out the full server budget
    assert!(reconnecting.get());
    assert!(ticks >= 31, "dropped after only {ticks} tenth-second ticks");
}

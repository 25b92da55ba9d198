use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use weave_io::rpc::{BytesProtocol, Configuration, MessageFlags, Service};
use weave_io::{Manager, Scheduler};

/// Two clients meet at a relaying server: C2 binds a name, C1 sends a
/// large message addressed to that name, and the bytes cross the
/// server without being decoded there.
#[test]
fn relay_between_two_clients() {
    let manager = Manager::new();
    let scheduler = Scheduler::new(manager.clone());
    scheduler.start(3).unwrap();

    // relay server: "join:<name>" binds the sending connection, any
    // message with a url is forwarded by the engine instead
    let mut server_cfg = Configuration::new(Arc::new(BytesProtocol));
    server_cfg.listener_address = Some("127.0.0.1:0".parse().unwrap());
    server_cfg.relay_enabled = true;
    server_cfg.connection_relay_buffer_count = 4;
    server_cfg.on_message = Some(Arc::new(|cc, received| {
        if !cc.is_server() {
            return;
        }
        let body = received.message.downcast::<Vec<u8>>().unwrap();
        if let Some(name) = body.strip_prefix(b"join:") {
            let name = String::from_utf8(name.to_vec()).unwrap();
            assert!(cc.register_relay_name(&name));
            cc.send_response(Box::new(b"ok".to_vec()), &received.header)
                .unwrap();
        }
    }));
    let server = Service::start(server_cfg, &scheduler).unwrap();
    let peer = server.listener_addr().unwrap().to_string();

    // C2: joins the room and waits for the relayed payload
    let (recv_tx, recv_rx) = mpsc::channel::<Vec<u8>>();
    let recv_tx = Arc::new(Mutex::new(recv_tx));
    let mut c2_cfg = Configuration::new(Arc::new(BytesProtocol));
    c2_cfg.on_message = Some(Arc::new(move |_cc, received| {
        let body = received.message.downcast::<Vec<u8>>().unwrap();
        let _ = recv_tx.lock().unwrap().send(*body);
    }));
    let c2 = Service::start(c2_cfg, &scheduler).unwrap();

    let (joined_tx, joined_rx) = mpsc::channel();
    c2.send_request(
        &peer,
        Box::new(b"join:room-b".to_vec()),
        MessageFlags::WAIT_RESPONSE,
        Box::new(move |completion| {
            assert!(completion.error.is_none(), "{:?}", completion.error);
            let _ = joined_tx.send(());
        }),
    )
    .unwrap();
    joined_rx.recv_timeout(Duration::from_secs(10)).unwrap();

    // C1: sends 10 KiB to the room; the payload spans several
    // packets, so the relay path sees continuations too
    let c1 = Service::start(Configuration::new(Arc::new(BytesProtocol)), &scheduler).unwrap();
    let payload: Vec<u8> = (0..10 * 1024u32).map(|i| (i % 251) as u8).collect();

    let (sent_tx, sent_rx) = mpsc::channel();
    c1.send_message(
        &peer,
        "room-b",
        Box::new(payload.clone()),
        MessageFlags::empty(),
        Some(Box::new(move |completion| {
            let _ = sent_tx.send(completion.error.clone());
        })),
    )
    .unwrap();

    assert!(sent_rx
        .recv_timeout(Duration::from_secs(10))
        .unwrap()
        .is_none());

    let relayed = recv_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(relayed.len(), payload.len());
    assert_eq!(relayed, payload);

    c1.stop();
    c2.stop();
    server.stop();
    scheduler.stop();
}

/// Relaying with zero relay buffers is a configuration error, not a
/// runtime surprise.
#[test]
fn relay_requires_buffers() {
    let manager = Manager::new();
    let scheduler = Scheduler::new(manager);
    scheduler.start(1).unwrap();

    let mut config = Configuration::new(Arc::new(BytesProtocol));
    config.relay_enabled = true;
    config.connection_relay_buffer_count = 0;

    assert!(Service::start(config, &scheduler).is_err());
    scheduler.stop();
}

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use weave_io::rpc::{
    BytesProtocol, Configuration, MessageFlags, Service,
};
use weave_io::{Error, Manager, Scheduler};

fn start_runtime() -> (Manager, Scheduler) {
    let manager = Manager::new();
    let scheduler = Scheduler::new(manager.clone());
    scheduler.start(2).unwrap();
    (manager, scheduler)
}

fn server_config() -> Configuration {
    let mut config = Configuration::new(Arc::new(BytesProtocol));
    config.listener_address = Some("127.0.0.1:0".parse().unwrap());
    config
}

#[test]
fn request_response_multiplexed() {
    let (_manager, scheduler) = start_runtime();

    // the server echoes every request body back, reversed
    let mut server_cfg = server_config();
    server_cfg.on_message = Some(Arc::new(|cc, received| {
        if cc.is_server() {
            let body = received.message.downcast::<Vec<u8>>().unwrap();
            let mut reply = *body;
            reply.reverse();
            cc.send_response(Box::new(reply), &received.header).unwrap();
        }
    }));
    let server = Service::start(server_cfg, &scheduler).unwrap();
    let addr = server.listener_addr().unwrap();

    let client_cfg = Configuration::new(Arc::new(BytesProtocol));
    let client = Service::start(client_cfg, &scheduler).unwrap();

    let peer = addr.to_string();
    let (tx, rx) = mpsc::channel();
    for i in 0u8..3 {
        let tx = tx.clone();
        let body = vec![i + 1; 8 + usize::from(i)];
        client
            .send_request(
                &peer,
                Box::new(body.clone()),
                MessageFlags::WAIT_RESPONSE,
                Box::new(move |completion| {
                    assert!(completion.error.is_none(), "{:?}", completion.error);
                    let response = completion
                        .response
                        .unwrap()
                        .downcast::<Vec<u8>>()
                        .unwrap();
                    let mut expect = body.clone();
                    expect.reverse();
                    assert_eq!(*response, expect);
                    let _ = tx.send(i);
                }),
            )
            .unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(rx.recv_timeout(Duration::from_secs(10)).unwrap());
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2]);

    client.stop();
    server.stop();
    scheduler.stop();
}

#[test]
fn synchronous_requests_arrive_in_order() {
    let (_manager, scheduler) = start_runtime();

    let (order_tx, order_rx) = mpsc::channel();
    let mut server_cfg = server_config();
    let order_tx = Arc::new(std::sync::Mutex::new(order_tx));
    server_cfg.on_message = Some(Arc::new(move |cc, received| {
        if cc.is_server() {
            let body = received.message.downcast::<Vec<u8>>().unwrap();
            let _ = order_tx.lock().unwrap().send(body[0]);
        }
    }));
    let server = Service::start(server_cfg, &scheduler).unwrap();
    let peer = server.listener_addr().unwrap().to_string();

    let client = Service::start(Configuration::new(Arc::new(BytesProtocol)), &scheduler).unwrap();

    for i in 0u8..8 {
        client
            .send(
                &peer,
                Box::new(vec![i; 600]),
                MessageFlags::SYNCHRONOUS,
            )
            .unwrap();
    }

    for expect in 0u8..8 {
        let got = order_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(got, expect);
    }

    client.stop();
    server.stop();
    scheduler.stop();
}

#[test]
fn cancel_in_flight_completes_once() {
    let (_manager, scheduler) = start_runtime();

    // a server that never responds
    let mut server_cfg = server_config();
    server_cfg.on_message = Some(Arc::new(|_cc, _received| {}));
    let server = Service::start(server_cfg, &scheduler).unwrap();
    let peer = server.listener_addr().unwrap().to_string();

    let client = Service::start(Configuration::new(Arc::new(BytesProtocol)), &scheduler).unwrap();

    let (tx, rx) = mpsc::channel();
    let id = client
        .send_request(
            &peer,
            Box::new(vec![7u8; 32]),
            MessageFlags::WAIT_RESPONSE,
            Box::new(move |completion| {
                let _ = tx.send(completion.error.clone());
            }),
        )
        .unwrap();

    std::thread::sleep(Duration::from_millis(50));
    client.cancel(id);

    let err = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(
        matches!(
            err,
            Some(Error::MessageCanceled) | Some(Error::MessageCanceledPeer)
        ),
        "unexpected completion: {:?}",
        err
    );
    // exactly one completion
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    client.stop();
    server.stop();
    scheduler.stop();
}

#[test]
fn graceful_stop_fails_pending_messages() {
    let (_manager, scheduler) = start_runtime();

    let mut server_cfg = server_config();
    server_cfg.on_message = Some(Arc::new(|_cc, _received| {}));
    let server = Service::start(server_cfg, &scheduler).unwrap();
    let peer = server.listener_addr().unwrap().to_string();

    let client = Service::start(Configuration::new(Arc::new(BytesProtocol)), &scheduler).unwrap();

    let (tx, rx) = mpsc::channel();
    const COUNT: usize = 100;
    for _ in 0..COUNT {
        let tx = tx.clone();
        client
            .send_request(
                &peer,
                Box::new(vec![1u8; 16]),
                MessageFlags::WAIT_RESPONSE,
                Box::new(move |completion| {
                    let _ = tx.send(completion.error.clone());
                }),
            )
            .unwrap();
    }
    drop(tx);

    // give some of them time to hit the wire, then shut down
    std::thread::sleep(Duration::from_millis(100));
    client.stop();

    let mut completions = 0;
    while let Ok(err) = rx.recv_timeout(Duration::from_secs(10)) {
        assert!(
            matches!(err, Some(Error::MessageConnection)),
            "unexpected completion: {:?}",
            err
        );
        completions += 1;
    }
    assert_eq!(completions, COUNT);

    server.stop();
    scheduler.stop();
}

#[test]
fn server_inactivity_timeout_closes_connection() {
    let (_manager, scheduler) = start_runtime();

    let mut server_cfg = server_config();
    server_cfg.inactivity_timeout_seconds = 1;
    server_cfg.on_message = Some(Arc::new(|_cc, _received| {}));
    let server = Service::start(server_cfg, &scheduler).unwrap();
    let peer = server.listener_addr().unwrap().to_string();

    let mut client_cfg = Configuration::new(Arc::new(BytesProtocol));
    // stay silent: no keepalive probes
    client_cfg.keepalive_timeout_seconds = 0;
    let client = Service::start(client_cfg, &scheduler).unwrap();

    let (tx, rx) = mpsc::channel();
    client
        .send_request(
            &peer,
            Box::new(vec![9u8; 8]),
            MessageFlags::WAIT_RESPONSE,
            Box::new(move |completion| {
                let _ = tx.send(completion.error.clone());
            }),
        )
        .unwrap();

    // the server goes quiet-deadline after ~2 intervals and drops the
    // connection; our waiting request fails with it
    let err = rx.recv_timeout(Duration::from_secs(15)).unwrap();
    assert!(
        matches!(err, Some(Error::MessageConnection)),
        "unexpected completion: {:?}",
        err
    );

    client.stop();
    server.stop();
    scheduler.stop();
}

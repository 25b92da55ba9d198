use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, UdpSocket};
use std::sync::mpsc;
use std::time::Duration;

use weave_io::event::{event_start, Event, EVENT_KILL, EVENT_START, GENERIC_EVENTS};
use weave_io::handle::{Datagram, Listener, Stream};
use weave_io::reactor::{ReactorContext, Ready};
use weave_io::sys::Socket;
use weave_io::{make_buffer, Actor, HandleId, Manager, Scheduler, SharedBuffer};

struct EchoServer {
    listener: Listener<EchoServer>,
    scheduler: Scheduler,
    service: usize,
    addr_tx: mpsc::Sender<SocketAddr>,
}

impl EchoServer {
    fn on_accept(
        s: &mut EchoServer,
        ctx: &mut ReactorContext<'_>,
        res: weave_io::Result<(Socket, SocketAddr)>,
    ) {
        let (sock, _peer) = res.unwrap();
        s.scheduler
            .start_actor(
                EchoConn {
                    sock: Stream::new(sock),
                },
                s.service,
                event_start(),
            )
            .unwrap();
        s.listener.post_accept(ctx, EchoServer::on_accept).unwrap();
    }
}

impl Actor for EchoServer {
    fn on_event(&mut self, ctx: &mut ReactorContext<'_>, event: Event) {
        if event.is(&GENERIC_EVENTS, EVENT_START) {
            let _ = self.addr_tx.send(self.listener.local_addr().unwrap());
            self.listener.post_accept(ctx, EchoServer::on_accept).unwrap();
        } else if event.is(&GENERIC_EVENTS, EVENT_KILL) {
            self.listener.deactivate(ctx);
            ctx.post_stop();
        }
    }

    fn on_completion(&mut self, ctx: &mut ReactorContext<'_>, handle: HandleId, ready: Ready) {
        if self.listener.handle() == handle {
            Listener::on_ready(self, ctx, |s| &mut s.listener, ready);
        }
    }
}

struct EchoConn {
    sock: Stream<EchoConn>,
}

impl EchoConn {
    fn post_recv(&mut self, ctx: &mut ReactorContext<'_>, buf: SharedBuffer) {
        let cap = buf.capacity();
        self.sock
            .post_recv_some(ctx, buf, 0..cap, EchoConn::on_recv)
            .unwrap();
    }

    fn on_recv(
        c: &mut EchoConn,
        ctx: &mut ReactorContext<'_>,
        buf: SharedBuffer,
        res: weave_io::Result<usize>,
    ) {
        match res {
            Ok(0) | Err(_) => ctx.post_stop(),
            Ok(n) => {
                c.sock
                    .post_send_all(ctx, buf, 0..n, EchoConn::on_sent)
                    .unwrap();
            }
        }
    }

    fn on_sent(
        c: &mut EchoConn,
        ctx: &mut ReactorContext<'_>,
        buf: SharedBuffer,
        res: weave_io::Result<()>,
    ) {
        match res {
            Ok(()) => c.post_recv(ctx, buf),
            Err(_) => ctx.post_stop(),
        }
    }
}

impl Actor for EchoConn {
    fn on_event(&mut self, ctx: &mut ReactorContext<'_>, event: Event) {
        if event.is(&GENERIC_EVENTS, EVENT_START) {
            let buf = make_buffer(2048);
            self.post_recv(ctx, buf);
        } else if event.is(&GENERIC_EVENTS, EVENT_KILL) {
            ctx.post_stop();
        }
    }

    fn on_completion(&mut self, ctx: &mut ReactorContext<'_>, handle: HandleId, ready: Ready) {
        if self.sock.handle() == handle {
            Stream::on_ready(self, ctx, |c| &mut c.sock, ready);
        }
    }
}

#[test]
fn tcp_echo_roundtrip() {
    let manager = Manager::new();
    let scheduler = Scheduler::new(manager.clone());
    scheduler.start(2).unwrap();
    let service = manager.register_service();

    let (addr_tx, addr_rx) = mpsc::channel();
    let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = Listener::bind(&bind, 16).unwrap();

    scheduler
        .start_actor(
            EchoServer {
                listener,
                scheduler: scheduler.clone(),
                service,
                addr_tx,
            },
            service,
            event_start(),
        )
        .unwrap();

    let addr = addr_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    client.write_all(b"0123456789").unwrap();

    let mut echoed = [0u8; 10];
    client.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"0123456789");

    // a second roundtrip over the same connection
    client.write_all(b"again").unwrap();
    let mut echoed = [0u8; 5];
    client.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"again");

    // orderly shutdown: the server side observes EOF and stops
    client.shutdown(Shutdown::Write).unwrap();
    let mut rest = [0u8; 8];
    assert_eq!(client.read(&mut rest).unwrap(), 0);

    manager.stop_service(service);
    scheduler.stop();
}

struct UdpEcho {
    sock: Datagram<UdpEcho>,
    addr_tx: mpsc::Sender<SocketAddr>,
}

impl UdpEcho {
    fn on_recv(
        u: &mut UdpEcho,
        ctx: &mut ReactorContext<'_>,
        buf: SharedBuffer,
        res: weave_io::Result<(usize, SocketAddr)>,
    ) {
        let (n, from) = res.unwrap();
        u.sock
            .post_send_to(ctx, buf, 0..n, from, UdpEcho::on_sent)
            .unwrap();
    }

    fn on_sent(
        u: &mut UdpEcho,
        ctx: &mut ReactorContext<'_>,
        buf: SharedBuffer,
        res: weave_io::Result<()>,
    ) {
        res.unwrap();
        let cap = buf.capacity();
        u.sock
            .post_recv_from(ctx, buf, 0..cap, UdpEcho::on_recv)
            .unwrap();
    }
}

impl Actor for UdpEcho {
    fn on_event(&mut self, ctx: &mut ReactorContext<'_>, event: Event) {
        if event.is(&GENERIC_EVENTS, EVENT_START) {
            let _ = self.addr_tx.send(self.sock.local_addr().unwrap());
            let buf = make_buffer(2048);
            let cap = buf.capacity();
            self.sock
                .post_recv_from(ctx, buf, 0..cap, UdpEcho::on_recv)
                .unwrap();
        } else if event.is(&GENERIC_EVENTS, EVENT_KILL) {
            self.sock.deactivate(ctx);
            ctx.post_stop();
        }
    }

    fn on_completion(&mut self, ctx: &mut ReactorContext<'_>, handle: HandleId, ready: Ready) {
        if self.sock.handle() == handle {
            Datagram::on_ready(self, ctx, |u| &mut u.sock, ready);
        }
    }
}

#[test]
fn udp_echo_roundtrip() {
    let manager = Manager::new();
    let scheduler = Scheduler::new(manager.clone());
    scheduler.start(1).unwrap();
    let service = manager.register_service();

    let (addr_tx, addr_rx) = mpsc::channel();
    let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();

    scheduler
        .start_actor(
            UdpEcho {
                sock: Datagram::bind(&bind).unwrap(),
                addr_tx,
            },
            service,
            event_start(),
        )
        .unwrap();

    let addr = addr_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client.send_to(b"ping pong", addr).unwrap();

    let mut buf = [0u8; 32];
    let (n, from) = client.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping pong");
    assert_eq!(from, addr);

    manager.stop_service(service);
    scheduler.stop();
}

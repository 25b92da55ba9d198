use std::sync::mpsc;
use std::time::{Duration, Instant};

use weave_io::event::{event_raise, event_start, EVENT_KILL, EVENT_RAISE, EVENT_START, GENERIC_EVENTS};
use weave_io::handle::Timer;
use weave_io::reactor::{ReactorContext, Ready};
use weave_io::{Actor, Event, HandleId, Manager, Scheduler};

struct Pinger {
    timer: Timer<Pinger>,
    tx: mpsc::Sender<&'static str>,
}

impl Pinger {
    fn on_timer(p: &mut Pinger, ctx: &mut ReactorContext<'_>, res: weave_io::Result<()>) {
        assert!(res.is_ok());
        let _ = p.tx.send("timer");
        ctx.post(event_raise());
    }
}

impl Actor for Pinger {
    fn on_event(&mut self, ctx: &mut ReactorContext<'_>, event: Event) {
        if event.is(&GENERIC_EVENTS, EVENT_START) {
            let _ = self.tx.send("start");
            self.timer
                .wait_for(ctx, Duration::from_millis(20), Pinger::on_timer)
                .unwrap();
        } else if event.is(&GENERIC_EVENTS, EVENT_RAISE) {
            let _ = self.tx.send("raise");
        } else if event.is(&GENERIC_EVENTS, EVENT_KILL) {
            ctx.post_stop();
        }
    }

    fn on_completion(&mut self, ctx: &mut ReactorContext<'_>, handle: HandleId, ready: Ready) {
        if self.timer.handle() == handle {
            Timer::on_ready(self, ctx, |p| &mut p.timer, ready);
        }
    }

    fn on_stopped(&mut self, _ctx: &mut ReactorContext<'_>) {
        let _ = self.tx.send("stopped");
    }
}

#[test]
fn actor_lifecycle_and_notification() {
    let manager = Manager::new();
    let scheduler = Scheduler::new(manager.clone());
    scheduler.start(2).unwrap();

    let service = manager.register_service();
    let (tx, rx) = mpsc::channel();

    let id = scheduler
        .start_actor(
            Pinger {
                timer: Timer::new(),
                tx,
            },
            service,
            event_start(),
        )
        .unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "start");
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "timer");
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "raise");

    // the actor is alive: notifications are accepted
    assert!(manager.notify(id, event_raise()));
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "raise");

    // stop it and wait for the registration to die
    assert!(manager.notify(id, weave_io::event::event_kill()));
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "stopped");

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if !manager.notify(id, event_raise()) {
            break;
        }
        assert!(Instant::now() < deadline, "stale id still accepts events");
        std::thread::sleep(Duration::from_millis(10));
    }

    scheduler.stop();
}

#[test]
fn stop_service_broadcasts_kill() {
    let manager = Manager::new();
    let scheduler = Scheduler::new(manager.clone());
    scheduler.start(1).unwrap();

    let service = manager.register_service();
    let (tx, rx) = mpsc::channel();

    for _ in 0..4 {
        scheduler
            .start_actor(
                Pinger {
                    timer: Timer::new(),
                    tx: tx.clone(),
                },
                service,
                event_start(),
            )
            .unwrap();
    }
    drop(tx);

    // all four saw their start event
    let mut starts = 0;
    while starts < 4 {
        if rx.recv_timeout(Duration::from_secs(5)).unwrap() == "start" {
            starts += 1;
        }
    }

    manager.stop_service(service);

    let mut stopped = 0;
    for msg in rx.iter() {
        if msg == "stopped" {
            stopped += 1;
        }
    }
    assert_eq!(stopped, 4);

    scheduler.stop();
}

#[test]
fn timer_cancel_reports_cancellation() {
    struct Canceler {
        timer: Timer<Canceler>,
        tx: mpsc::Sender<weave_io::Result<()>>,
    }

    impl Canceler {
        fn on_timer(c: &mut Canceler, _ctx: &mut ReactorContext<'_>, res: weave_io::Result<()>) {
            let _ = c.tx.send(res);
        }
    }

    impl Actor for Canceler {
        fn on_event(&mut self, ctx: &mut ReactorContext<'_>, event: Event) {
            if event.is(&GENERIC_EVENTS, EVENT_START) {
                self.timer
                    .wait_for(ctx, Duration::from_secs(60), Canceler::on_timer)
                    .unwrap();
                // cancel right away: the continuation must still run
                Timer::cancel(self, ctx, |c| &mut c.timer);
            } else if event.is(&GENERIC_EVENTS, EVENT_KILL) {
                ctx.post_stop();
            }
        }

        fn on_completion(&mut self, ctx: &mut ReactorContext<'_>, handle: HandleId, ready: Ready) {
            if self.timer.handle() == handle {
                Timer::on_ready(self, ctx, |c| &mut c.timer, ready);
            }
        }
    }

    let manager = Manager::new();
    let scheduler = Scheduler::new(manager.clone());
    scheduler.start(1).unwrap();
    let service = manager.register_service();
    let (tx, rx) = mpsc::channel();

    let id = scheduler
        .start_actor(
            Canceler {
                timer: Timer::new(),
                tx,
            },
            service,
            event_start(),
        )
        .unwrap();

    let res = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(res, Err(weave_io::Error::TimerCancel)));

    manager.notify(id, weave_io::event::event_kill());
    manager.stop_service(service);
    scheduler.stop();
}

use std::time::{Duration, Instant};

use crate::actor::{Actor, HandleId};
use crate::error::{Error, Result};
use crate::reactor::{ReactorContext, Ready};

pub type TimerFn<A> = fn(&mut A, &mut ReactorContext<'_>, Result<()>);

/// Steady-clock timer bound to one actor. Re-arming replaces the
/// pending wait; cancellation completes it with [`Error::TimerCancel`].
pub struct Timer<A> {
    hid: HandleId,
    f: Option<TimerFn<A>>,
}

impl<A: Actor> Timer<A> {
    pub fn new() -> Timer<A> {
        Timer {
            hid: HandleId::INVALID,
            f: None,
        }
    }

    pub fn handle(&self) -> HandleId {
        self.hid
    }

    pub fn is_armed(&self) -> bool {
        self.f.is_some()
    }

    pub fn wait_until(
        &mut self,
        ctx: &mut ReactorContext<'_>,
        deadline: Instant,
        f: TimerFn<A>,
    ) -> Result<()> {
        if !self.hid.is_valid() {
            self.hid = ctx
                .register_handle(None)
                .map_err(Error::stream_system)?;
        }
        ctx.arm_timer(self.hid, deadline);
        self.f = Some(f);
        Ok(())
    }

    pub fn wait_for(
        &mut self,
        ctx: &mut ReactorContext<'_>,
        duration: Duration,
        f: TimerFn<A>,
    ) -> Result<()> {
        let deadline = ctx.now() + duration;
        self.wait_until(ctx, deadline, f)
    }

    pub fn on_ready(
        actor: &mut A,
        ctx: &mut ReactorContext<'_>,
        proj: fn(&mut A) -> &mut Timer<A>,
        ready: Ready,
    ) {
        if ready.is_clear() {
            proj(actor).f = None;
            return;
        }
        if !ready.is_timer() {
            return;
        }
        if let Some(f) = proj(actor).f.take() {
            f(actor, ctx, Ok(()));
        }
    }

    /// Disarms the pending wait and delivers `TimerCancel` into its
    /// continuation.
    pub fn cancel(actor: &mut A, ctx: &mut ReactorContext<'_>, proj: fn(&mut A) -> &mut Timer<A>) {
        let f = {
            let t = proj(actor);
            if t.hid.is_valid() {
                ctx.cancel_timer(t.hid);
            }
            t.f.take()
        };
        if let Some(f) = f {
            f(actor, ctx, Err(Error::TimerCancel));
        }
    }

    /// Disarms without invoking the continuation.
    pub fn silent_cancel(&mut self, ctx: &mut ReactorContext<'_>) {
        if self.hid.is_valid() {
            ctx.cancel_timer(self.hid);
        }
        self.f = None;
    }

    pub fn deactivate(&mut self, ctx: &mut ReactorContext<'_>) {
        self.silent_cancel(ctx);
        if self.hid.is_valid() {
            ctx.deregister_handle(self.hid);
            self.hid = HandleId::INVALID;
        }
    }
}

impl<A: Actor> Default for Timer<A> {
    fn default() -> Timer<A> {
        Timer::new()
    }
}

use std::any::Any;
use std::fmt;
use std::ptr;

/// Static descriptor for a family of events. Identity is the address
/// of the descriptor, so two categories are equal only when they are
/// literally the same `static`.
pub struct EventCategory {
    name: &'static str,
}

impl EventCategory {
    pub const fn new(name: &'static str) -> EventCategory {
        EventCategory { name }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// An event addressed to an actor: `(category, id)` tag plus an
/// optional type-erased payload. Equality ignores the payload; payload
/// extraction is tag-checked through `Any`, never a blind cast.
pub struct Event {
    category: &'static EventCategory,
    id: usize,
    payload: Option<Box<dyn Any + Send>>,
}

impl Event {
    pub fn new(category: &'static EventCategory, id: usize) -> Event {
        Event {
            category,
            id,
            payload: None,
        }
    }

    pub fn with<P: Any + Send>(category: &'static EventCategory, id: usize, payload: P) -> Event {
        Event {
            category,
            id,
            payload: Some(Box::new(payload)),
        }
    }

    pub fn category(&self) -> &'static EventCategory {
        self.category
    }

    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn is(&self, category: &'static EventCategory, id: usize) -> bool {
        ptr::eq(self.category, category) && self.id == id
    }

    pub fn payload<P: Any>(&self) -> Option<&P> {
        self.payload.as_deref().and_then(|p| p.downcast_ref())
    }

    /// Moves the payload out when it has the expected type. The
    /// payload stays in place on a tag mismatch.
    pub fn take_payload<P: Any>(&mut self) -> Option<P> {
        if self.payload.as_deref().map(|p| p.is::<P>()) == Some(true) {
            let boxed = self.payload.take()?;
            match boxed.downcast::<P>() {
                Ok(p) => Some(*p),
                Err(_) => None,
            }
        } else {
            None
        }
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Event) -> bool {
        ptr::eq(self.category, other.category) && self.id == other.id
    }
}

impl Eq for Event {}

impl fmt::Debug for Event {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "Event({}:{}{})",
            self.category.name,
            self.id,
            if self.payload.is_some() { ", payload" } else { "" }
        )
    }
}

pub static GENERIC_EVENTS: EventCategory = EventCategory::new("generic");

pub const EVENT_DEFAULT: usize = 0;
pub const EVENT_START: usize = 1;
pub const EVENT_STOP: usize = 2;
pub const EVENT_RAISE: usize = 3;
pub const EVENT_KILL: usize = 4;

pub fn event_default() -> Event {
    Event::new(&GENERIC_EVENTS, EVENT_DEFAULT)
}

pub fn event_start() -> Event {
    Event::new(&GENERIC_EVENTS, EVENT_START)
}

pub fn event_stop() -> Event {
    Event::new(&GENERIC_EVENTS, EVENT_STOP)
}

pub fn event_raise() -> Event {
    Event::new(&GENERIC_EVENTS, EVENT_RAISE)
}

pub fn event_kill() -> Event {
    Event::new(&GENERIC_EVENTS, EVENT_KILL)
}

#[cfg(test)]
mod test {
    use super::*;

    static OTHER: EventCategory = EventCategory::new("other");

    #[test]
    fn equality_ignores_payload() {
        let plain = Event::new(&GENERIC_EVENTS, EVENT_RAISE);
        let loaded = Event::with(&GENERIC_EVENTS, EVENT_RAISE, 42u32);
        assert_eq!(plain, loaded);
        assert_ne!(plain, Event::new(&OTHER, EVENT_RAISE));
        assert_ne!(plain, event_kill());
    }

    #[test]
    fn payload_is_tag_checked() {
        let mut ev = Event::with(&GENERIC_EVENTS, EVENT_RAISE, String::from("hi"));
        assert!(ev.payload::<u32>().is_none());
        assert_eq!(ev.payload::<String>().map(String::as_str), Some("hi"));

        // wrong type leaves the payload in place
        assert!(ev.take_payload::<u32>().is_none());
        assert_eq!(ev.take_payload::<String>().as_deref(), Some("hi"));
        assert!(ev.take_payload::<String>().is_none());
    }
}

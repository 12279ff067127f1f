//! Fan-out pub/sub for session lifecycle events.
//!
//! Publishing never blocks: subscribers that fall behind simply lose events
//! (with a warning). Consumers subscribe with the event types they care
//! about and read from a bounded channel.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::catalog::Protocol;

pub const DEFAULT_BUFFER: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    SessionRequested,
    SessionReleased,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Requested {
        at: DateTime<Utc>,
        protocol: Protocol,
        browser_name: String,
        browser_version: String,
        /// Time from request to a ready session; absent on failure.
        start_duration: Option<Duration>,
        error: Option<String>,
    },
    Released {
        at: DateTime<Utc>,
        protocol: Protocol,
        browser_name: String,
        browser_version: String,
        session_duration: Duration,
    },
}

impl SessionEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            SessionEvent::Requested { .. } => EventType::SessionRequested,
            SessionEvent::Released { .. } => EventType::SessionReleased,
        }
    }
}

struct Subscriber {
    types: HashSet<EventType>,
    tx: mpsc::Sender<SessionEvent>,
}

struct BrokerState {
    subscribers: Vec<Subscriber>,
    closed: bool,
}

pub struct EventBroker {
    state: Mutex<BrokerState>,
    buffer: usize,
}

impl EventBroker {
    pub fn new(buffer: usize) -> Self {
        EventBroker {
            state: Mutex::new(BrokerState {
                subscribers: Vec::new(),
                closed: false,
            }),
            buffer,
        }
    }

    /// Register a subscriber for the given event types. The channel closes
    /// on broker shutdown.
    pub fn subscribe(&self, types: &[EventType]) -> mpsc::Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let mut st = self.state.lock().expect("broker lock poisoned");
        st.subscribers.push(Subscriber {
            types: types.iter().copied().collect(),
            tx,
        });
        rx
    }

    /// Deliver to every interested subscriber; a full channel drops the
    /// event for that subscriber only.
    pub fn publish(&self, event: SessionEvent) {
        let st = self.state.lock().expect("broker lock poisoned");
        if st.closed {
            return;
        }
        let event_type = event.event_type();
        for subscriber in &st.subscribers {
            if !subscriber.types.contains(&event_type) {
                continue;
            }
            if let Err(mpsc::error::TrySendError::Full(_)) = subscriber.tx.try_send(event.clone())
            {
                tracing::warn!(?event_type, "dropping published event, channel is full");
            }
        }
    }

    /// Close every subscriber channel exactly once.
    pub fn shutdown(&self) {
        let mut st = self.state.lock().expect("broker lock poisoned");
        st.closed = true;
        st.subscribers.clear();
        tracing::info!("event broker shutdown completed");
    }
}

impl Default for EventBroker {
    fn default() -> Self {
        EventBroker::new(DEFAULT_BUFFER)
    }
}

pub fn requested_event(
    protocol: Protocol,
    browser_name: &str,
    browser_version: &str,
    start_duration: Option<Duration>,
    error: Option<String>,
) -> SessionEvent {
    SessionEvent::Requested {
        at: Utc::now(),
        protocol,
        browser_name: browser_name.to_string(),
        browser_version: browser_version.to_string(),
        start_duration,
        error,
    }
}

pub fn released_event(
    protocol: Protocol,
    browser_name: &str,
    browser_version: &str,
    session_duration: Duration,
) -> SessionEvent {
    SessionEvent::Released {
        at: Utc::now(),
        protocol,
        browser_name: browser_name.to_string(),
        browser_version: browser_version.to_string(),
        session_duration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_matching_types_only() {
        let broker = EventBroker::default();
        let mut requested = broker.subscribe(&[EventType::SessionRequested]);
        let mut both = broker.subscribe(&[
            EventType::SessionRequested,
            EventType::SessionReleased,
        ]);

        broker.publish(released_event(
            Protocol::Webdriver,
            "chrome",
            "102.0",
            Duration::from_secs(1),
        ));
        broker.publish(requested_event(
            Protocol::Webdriver,
            "chrome",
            "102.0",
            None,
            None,
        ));

        let event = both.recv().await.unwrap();
        assert_eq!(event.event_type(), EventType::SessionReleased);
        let event = both.recv().await.unwrap();
        assert_eq!(event.event_type(), EventType::SessionRequested);

        let event = requested.recv().await.unwrap();
        assert_eq!(event.event_type(), EventType::SessionRequested);
        assert!(requested.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_subscriber_drops_events() {
        let broker = EventBroker::new(1);
        let mut rx = broker.subscribe(&[EventType::SessionRequested]);

        for _ in 0..3 {
            broker.publish(requested_event(
                Protocol::Playwright,
                "chromium",
                "",
                None,
                None,
            ));
        }
        // only the buffered one survives
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn shutdown_closes_channels_once() {
        let broker = EventBroker::default();
        let mut rx = broker.subscribe(&[EventType::SessionRequested]);
        broker.shutdown();
        assert!(rx.recv().await.is_none());
        // idempotent
        broker.shutdown();
        broker.publish(requested_event(Protocol::Webdriver, "chrome", "", None, None));
    }
}

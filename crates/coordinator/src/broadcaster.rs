//! Event fan-out to live sessions
//!
//! Each subscribed session has its own bounded broadcast channel. Publishing
//! never waits: a subscriber that falls behind loses its oldest events and is
//! told how many through [`SessionEvent::Lagged`]. Unsubscribing drops the
//! channel, which ends every stream of that session.

use protocol::{SessionEvent, SessionId};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Fans out registry and arbiter events
#[derive(Debug)]
pub struct EventBroadcaster {
    /// Per-subscriber buffer capacity
    capacity: usize,
    subscribers: RwLock<HashMap<SessionId, broadcast::Sender<SessionEvent>>>,
}

impl EventBroadcaster {
    /// Create a broadcaster with `capacity` buffered events per subscriber
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SessionId, broadcast::Sender<SessionEvent>>> {
        self.subscribers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SessionId, broadcast::Sender<SessionEvent>>> {
        self.subscribers.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe a session
    ///
    /// The stream starts with the next published event. Subscribing again
    /// yields another stream starting from that point.
    pub fn subscribe(&self, session: SessionId) -> EventStream {
        if let Some(sender) = self.read().get(&session) {
            return EventStream {
                session,
                receiver: sender.subscribe(),
            };
        }

        let mut subscribers = self.write();
        let sender = subscribers
            .entry(session)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        debug!("Session {} subscribed to events", session.0);
        EventStream {
            session,
            receiver: sender.subscribe(),
        }
    }

    /// Unsubscribe a session, ending all of its streams
    pub fn unsubscribe(&self, session: SessionId) {
        if self.write().remove(&session).is_some() {
            debug!("Session {} unsubscribed from events", session.0);
        }
    }

    /// Publish an event to every subscriber
    pub fn publish(&self, event: SessionEvent) {
        let subscribers = self.read();
        trace!(
            "Publishing {:?} to {} subscribers",
            event,
            subscribers.len()
        );
        for sender in subscribers.values() {
            // No receivers is fine: the session is not listening right now
            let _ = sender.send(event.clone());
        }
    }

    /// Number of subscribed sessions
    pub fn subscriber_count(&self) -> usize {
        self.read().len()
    }
}

/// Ordered stream of events for one session
#[derive(Debug)]
pub struct EventStream {
    session: SessionId,
    receiver: broadcast::Receiver<SessionEvent>,
}

impl EventStream {
    /// Session this stream belongs to
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Wait for the next event
    ///
    /// Returns `None` once the session has been unsubscribed and every
    /// buffered event has been consumed.
    pub async fn next(&mut self) -> Option<SessionEvent> {
        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                Some(SessionEvent::Lagged { missed })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Take the next event if one is buffered
    pub fn try_next(&mut self) -> Option<SessionEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                Some(SessionEvent::Lagged { missed })
            }
            Err(_) => None,
        }
    }

    /// Drain every buffered event
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        std::iter::from_fn(|| self.try_next()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::DeviceId;

    fn disconnected(id: u32) -> SessionEvent {
        SessionEvent::DeviceDisconnected {
            device: DeviceId(id),
            generation: 1,
        }
    }

    #[test]
    fn test_per_subscriber_order() {
        let broadcaster = EventBroadcaster::new(16);
        let mut a = broadcaster.subscribe(SessionId(1));
        let mut b = broadcaster.subscribe(SessionId(2));

        broadcaster.publish(disconnected(1));
        broadcaster.publish(disconnected(2));

        for stream in [&mut a, &mut b] {
            let ids: Vec<_> = stream.drain().iter().filter_map(|e| e.device_id()).collect();
            assert_eq!(ids, vec![DeviceId(1), DeviceId(2)]);
        }
    }

    #[test]
    fn test_slow_subscriber_drops_oldest() {
        let broadcaster = EventBroadcaster::new(2);
        let mut slow = broadcaster.subscribe(SessionId(1));

        for id in 0..5 {
            broadcaster.publish(disconnected(id));
        }

        let events = slow.drain();
        assert!(matches!(events[0], SessionEvent::Lagged { missed: 3 }));
        let ids: Vec<_> = events.iter().filter_map(|e| e.device_id()).collect();
        assert_eq!(ids, vec![DeviceId(3), DeviceId(4)]);
    }

    #[test]
    fn test_subscribe_starts_from_now() {
        let broadcaster = EventBroadcaster::new(8);
        let _first = broadcaster.subscribe(SessionId(1));
        broadcaster.publish(disconnected(1));

        let mut restarted = broadcaster.subscribe(SessionId(1));
        assert!(restarted.try_next().is_none());
        broadcaster.publish(disconnected(2));
        assert_eq!(
            restarted.try_next().and_then(|e| e.device_id()),
            Some(DeviceId(2))
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_stream() {
        let broadcaster = EventBroadcaster::new(8);
        let mut stream = broadcaster.subscribe(SessionId(7));
        broadcaster.publish(disconnected(1));
        broadcaster.unsubscribe(SessionId(7));

        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
        assert_eq!(broadcaster.subscriber_count(), 0);
    }
}

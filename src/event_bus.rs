// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! In-process publish/subscribe for the events named in spec.md §4.7.
//! Bounded per-subscriber queues that drop the oldest entry under load
//! rather than block a publisher map directly onto
//! `tokio::sync::broadcast`'s own lagged-receiver behavior, so this is a
//! thin wrapper rather than a hand-rolled queue-of-queues.

use base::time::Time;
use tokio::sync::broadcast;

/// Default per-subscriber queue depth (spec.md §4.7).
pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub enum Event {
    StreamDegraded { stream_name: String, consecutive_failures: u32 },
    StreamRecovered { stream_name: String },
    SegmentSealed { stream_name: String, segment_id: i64, start: Time, end: Time },
    SegmentDeleted { stream_name: String, segment_id: i64 },
    MotionStarted { stream_name: String, at: Time },
    MotionEnded { stream_name: String, at: Time },
    IndexReconciled { orphan_files_handled: u64, rows_marked_deleted: u64 },
}

/// Handle held by every component that publishes events. Cheap to clone;
/// publishing never blocks, even if every subscriber has fallen behind
/// (`broadcast::Sender::send` only fails if there are zero receivers,
/// which we treat as a no-op: the design doesn't require anyone to be
/// listening).
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

/// A single subscriber's lagging-tolerant view of the stream.
pub struct Subscription {
    rx: broadcast::Receiver<Event>,
}

impl EventBus {
    pub fn new() -> EventBus {
        EventBus::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> EventBus {
        let (tx, _rx) = broadcast::channel(capacity);
        EventBus { tx }
    }

    pub fn publish(&self, event: Event) {
        // A send error here means no subscriber is currently attached;
        // that's normal (e.g. no one is watching live) and not a fault.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription { rx: self.tx.subscribe() }
    }
}

impl Default for EventBus {
    fn default() -> EventBus {
        EventBus::new()
    }
}

impl Subscription {
    /// Awaits the next event. A subscriber that fell behind the bound
    /// silently skips forward to the oldest event still buffered
    /// (`broadcast`'s `Lagged` case) rather than erroring its caller;
    /// the drop is logged by whichever component owns this subscription,
    /// not by the bus itself.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        bus.publish(Event::MotionStarted { stream_name: "cam1".to_string(), at: Time::from_unix_millis(0) });
        match sub.recv().await.unwrap() {
            Event::MotionStarted { stream_name, .. } => assert_eq!(stream_name, "cam1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(Event::IndexReconciled { orphan_files_handled: 0, rows_marked_deleted: 0 });
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_forward_instead_of_erroring() {
        let bus = EventBus::with_capacity(2);
        let mut sub = bus.subscribe();
        for i in 0..10 {
            bus.publish(Event::SegmentDeleted { stream_name: "cam1".to_string(), segment_id: i });
        }
        // The subscriber fell behind; it should still get a next event,
        // not an error, and should eventually reach the last one.
        let mut last_id = -1;
        while let Some(Event::SegmentDeleted { segment_id, .. }) = sub.recv().await {
            last_id = segment_id;
        }
        assert_eq!(last_id, 9);
    }
}


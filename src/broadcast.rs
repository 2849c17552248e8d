//! In-process event fan-out.
//!
//! Each subscriber owns a bounded queue. `publish` never blocks: when a
//! subscriber's queue is full its oldest pending event is discarded to make
//! room, so a slow viewer always converges on the newest frame instead of
//! stalling the capture loop.
//!
//! ```text
//!   supervisor ──publish──► Broadcaster ──try_send──► [queue] ──► Subscription
//!                                       └─try_send──► [queue] ──► Subscription
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use serde::{Serialize, Serializer};

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 8;

/// A downscaled, JPEG-encoded frame ready for viewers.
#[derive(Clone, Debug, Serialize)]
pub struct FrameEvent {
    pub stream_id: String,
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    #[serde(serialize_with = "serialize_base64")]
    pub jpeg: Arc<[u8]>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Connected,
    Failed,
    Reconnecting,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusEvent {
    pub stream_id: String,
    pub status: LinkStatus,
    pub detail: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct AnalysisEvent {
    pub stream_id: String,
    pub text: String,
    /// Milliseconds since the UNIX epoch.
    pub timestamp_ms: u64,
    /// True when `text` describes why no analysis is available.
    pub failed: bool,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Frame(FrameEvent),
    Status(StatusEvent),
    Analysis(AnalysisEvent),
}

impl StreamEvent {
    pub fn stream_id(&self) -> &str {
        match self {
            StreamEvent::Frame(event) => &event.stream_id,
            StreamEvent::Status(event) => &event.stream_id,
            StreamEvent::Analysis(event) => &event.stream_id,
        }
    }
}

fn serialize_base64<S: Serializer>(bytes: &Arc<[u8]>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
}

struct Slot {
    tx: Sender<StreamEvent>,
    /// Second handle on the subscriber's queue, used to evict the oldest event.
    evict: Receiver<StreamEvent>,
}

/// Thread-safe publish/subscribe hub shared by all supervisors.
pub struct Broadcaster {
    capacity: usize,
    next_id: AtomicU64,
    dropped: AtomicU64,
    subscribers: Mutex<HashMap<u64, Slot>>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
            subscribers: Mutex::new(HashMap::new()),
        })
    }

    /// Register a subscriber. Only events published after this call are seen.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = crossbeam_channel::bounded(self.capacity);
        self.slots().insert(
            id,
            Slot {
                tx,
                evict: rx.clone(),
            },
        );
        log::debug!("subscriber {} attached", id);
        Subscription {
            id,
            rx,
            hub: Arc::downgrade(self),
        }
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let removed = self.slots().remove(&id).is_some();
        if removed {
            log::debug!("subscriber {} detached", id);
        }
        removed
    }

    /// Deliver `event` to every subscriber without blocking.
    pub fn publish(&self, event: StreamEvent) {
        let slots = self.slots();
        for slot in slots.values() {
            let mut pending = event.clone();
            loop {
                match slot.tx.try_send(pending) {
                    Ok(()) => break,
                    Err(TrySendError::Full(returned)) => {
                        if slot.evict.try_recv().is_ok() {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                        pending = returned;
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.slots().len()
    }

    /// Events discarded from full subscriber queues since creation.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Slot>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Receiving end of a subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: Receiver<StreamEvent>,
    hub: Weak<Broadcaster>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block until the next event. Returns `None` once the queue is drained
    /// and this subscription is detached or the broadcaster is gone; either
    /// drops the slot's only sender.
    pub fn recv(&self) -> Option<StreamEvent> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<StreamEvent> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<StreamEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Drain everything currently queued.
    pub fn drain(&self) -> Vec<StreamEvent> {
        self.rx.try_iter().collect()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(sequence: u64) -> StreamEvent {
        StreamEvent::Frame(FrameEvent {
            stream_id: "cam_1".to_string(),
            sequence,
            width: 2,
            height: 2,
            jpeg: Arc::from(vec![0xFF, 0xD8, 0xFF, 0xD9]),
        })
    }

    fn sequence_of(event: &StreamEvent) -> u64 {
        match event {
            StreamEvent::Frame(frame) => frame.sequence,
            other => panic!("expected frame event, got {:?}", other),
        }
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let hub = Broadcaster::new(4);
        hub.publish(frame(1));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn subscribers_only_see_later_events() {
        let hub = Broadcaster::new(4);
        hub.publish(frame(1));
        let sub = hub.subscribe();
        hub.publish(frame(2));
        let events = sub.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(sequence_of(&events[0]), 2);
    }

    #[test]
    fn full_queue_keeps_newest_events() {
        let hub = Broadcaster::new(2);
        let slow = hub.subscribe();
        for seq in 1..=10 {
            hub.publish(frame(seq));
        }
        let seen: Vec<u64> = slow.drain().iter().map(sequence_of).collect();
        assert_eq!(seen, vec![9, 10]);
        assert_eq!(hub.dropped_events(), 8);
    }

    #[test]
    fn every_subscriber_receives_each_event() {
        let hub = Broadcaster::new(4);
        let a = hub.subscribe();
        let b = hub.subscribe();
        hub.publish(frame(7));
        assert_eq!(sequence_of(&a.try_recv().unwrap()), 7);
        assert_eq!(sequence_of(&b.try_recv().unwrap()), 7);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let hub = Broadcaster::new(4);
        let sub = hub.subscribe();
        let id = sub.id();
        assert_eq!(hub.subscriber_count(), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
        assert!(!hub.unsubscribe(id));
    }

    #[test]
    fn recv_ends_when_hub_is_dropped() {
        let hub = Broadcaster::new(4);
        let sub = hub.subscribe();
        drop(hub);
        assert!(sub.recv().is_none());
    }

    #[test]
    fn recv_ends_after_unsubscribe() {
        let hub = Broadcaster::new(4);
        let sub = hub.subscribe();
        hub.publish(frame(1));
        assert!(hub.unsubscribe(sub.id()));
        assert_eq!(sequence_of(&sub.recv().unwrap()), 1);
        assert!(sub.recv().is_none());
    }

    #[test]
    fn blocked_recv_wakes_on_unsubscribe() {
        let hub = Broadcaster::new(4);
        let sub = hub.subscribe();
        let id = sub.id();
        let waiter = std::thread::spawn(move || sub.recv().is_none());
        std::thread::sleep(Duration::from_millis(20));
        assert!(hub.unsubscribe(id));
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn events_serialize_with_tag_and_base64() {
        let json = serde_json::to_value(frame(3)).unwrap();
        assert_eq!(json["event"], "frame");
        assert_eq!(json["sequence"], 3);
        assert_eq!(json["jpeg"], "/9j/2Q==");

        let status = StreamEvent::Status(StatusEvent {
            stream_id: "cam_2".to_string(),
            status: LinkStatus::Reconnecting,
            detail: None,
        });
        let json = serde_json::to_value(status).unwrap();
        assert_eq!(json["event"], "status");
        assert_eq!(json["status"], "reconnecting");
    }
}

//! Per-job fan-out of Progress Events to live subscribers.
//!
//! Publishing never waits on a subscriber. Each subscriber owns a bounded
//! queue: when it is full the oldest `Progress` event is dropped in favour of
//! the newest. The terminal event is kept outside that queue so it is always
//! delivered, after everything published before it, followed by the end of
//! the stream.

use crate::event::ProgressEvent;
use crate::types::JobState;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

/// Fan-out point for one job's events.
#[derive(Clone)]
pub struct Broadcaster {
    shared: Arc<Shared>,
}

struct Shared {
    job_id: String,
    capacity: usize,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_key: u64,
    slots: HashMap<u64, Arc<Slot>>,
    pending_terminal: Option<ProgressEvent>,
    closed: Option<JobState>,
}

#[derive(Default)]
struct Slot {
    queue: Mutex<SlotQueue>,
    notify: Notify,
}

#[derive(Default)]
struct SlotQueue {
    events: VecDeque<ProgressEvent>,
    terminal: Option<ProgressEvent>,
    closed: Option<JobState>,
    dropped: u64,
}

impl Broadcaster {
    /// Create a broadcaster for `job_id` with `capacity` buffered events per subscriber.
    pub fn new(job_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                job_id: job_id.into(),
                capacity: capacity.max(1),
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    /// Identifier of the job this broadcaster serves.
    pub fn job_id(&self) -> &str {
        &self.shared.job_id
    }

    /// Register a new subscriber.
    ///
    /// Subscribing after the job has finished yields a subscription that
    /// delivers the terminal event (if any) and then ends.
    pub fn subscribe(&self) -> Subscription {
        let mut inner = self.shared.inner.lock();
        let slot = Arc::new(Slot::default());

        if let Some(state) = inner.closed {
            let mut queue = slot.queue.lock();
            queue.terminal = inner.pending_terminal.clone();
            queue.closed = Some(state);
        }

        let key = inner.next_key;
        inner.next_key += 1;
        inner.slots.insert(key, Arc::clone(&slot));

        Subscription {
            key,
            slot,
            shared: Arc::downgrade(&self.shared),
            job_id: self.shared.job_id.clone(),
        }
    }

    /// Deliver an event to every live subscriber without blocking.
    ///
    /// A terminal event is held back from the bounded queues and delivered
    /// when [`Broadcaster::close`] runs, so it cannot be displaced.
    pub fn publish(&self, event: ProgressEvent) {
        let mut inner = self.shared.inner.lock();

        if inner.closed.is_some() {
            tracing::trace!(job_id = %self.shared.job_id, "publish after close ignored");
            return;
        }

        if event.is_terminal() {
            inner.pending_terminal = Some(event);
            return;
        }

        for slot in inner.slots.values() {
            {
                let mut queue = slot.queue.lock();
                if queue.events.len() >= self.shared.capacity {
                    queue.events.pop_front();
                    queue.dropped += 1;
                }
                queue.events.push_back(event.clone());
            }
            slot.notify.notify_one();
        }
    }

    /// Deliver the terminal event (if one was published) and end every
    /// subscription with `state` as the close marker. Idempotent.
    pub fn close(&self, state: JobState) {
        let mut inner = self.shared.inner.lock();
        if inner.closed.is_some() {
            return;
        }
        inner.closed = Some(state);

        for slot in inner.slots.values() {
            {
                let mut queue = slot.queue.lock();
                queue.terminal = inner.pending_terminal.clone();
                queue.closed = Some(state);
            }
            slot.notify.notify_one();
        }
    }

    /// Publish `terminal` and close in one step.
    pub fn finish(&self, terminal: Option<ProgressEvent>, state: JobState) {
        if let Some(event) = terminal {
            self.publish(event);
        }
        self.close(state);
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.shared.inner.lock().slots.len()
    }

    /// Whether the broadcaster has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.inner.lock().closed.is_some()
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Never leave a subscriber waiting on a broadcaster that no longer exists
        let inner = self.inner.get_mut();
        if inner.closed.is_some() {
            return;
        }
        for slot in inner.slots.values() {
            slot.queue.lock().closed = Some(JobState::Failed);
            slot.notify.notify_one();
        }
    }
}

/// A subscriber's handle on one job's event stream.
///
/// Dropping it unsubscribes.
pub struct Subscription {
    key: u64,
    slot: Arc<Slot>,
    shared: Weak<Shared>,
    job_id: String,
}

impl Subscription {
    /// Wait for the next event.
    ///
    /// Returns `None` once the job has finished and everything, including the
    /// terminal event, has been delivered.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            {
                let mut queue = self.slot.queue.lock();
                if let Some(event) = queue.events.pop_front() {
                    return Some(event);
                }
                if let Some(event) = queue.terminal.take() {
                    return Some(event);
                }
                if queue.closed.is_some() {
                    return None;
                }
            }
            self.slot.notify.notified().await;
        }
    }

    /// Final job state, available once the stream has been closed.
    pub fn closed_state(&self) -> Option<JobState> {
        self.slot.queue.lock().closed
    }

    /// Number of progress events dropped because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        self.slot.queue.lock().dropped
    }

    /// Identifier of the job this subscription follows.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.inner.lock().slots.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn progress(percentage: f64) -> ProgressEvent {
        ProgressEvent::Progress {
            percentage,
            speed: None,
            eta_seconds: None,
            status: None,
        }
    }

    fn complete() -> ProgressEvent {
        ProgressEvent::Complete {
            filename: "/tmp/a.mp3".to_string(),
            title: None,
        }
    }

    async fn drain(sub: &mut Subscription) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("subscription stalled")
        {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_delivers_in_order_then_terminal() {
        let broadcaster = Broadcaster::new("v1", 8);
        let mut sub = broadcaster.subscribe();

        broadcaster.publish(progress(10.0));
        broadcaster.publish(progress(55.0));
        broadcaster.finish(Some(complete()), JobState::Completed);

        let events = drain(&mut sub).await;
        assert_eq!(events, vec![progress(10.0), progress(55.0), complete()]);
        assert_eq!(sub.closed_state(), Some(JobState::Completed));
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_but_keeps_terminal() {
        let broadcaster = Broadcaster::new("v1", 2);
        let mut sub = broadcaster.subscribe();

        for p in [1.0, 2.0, 3.0, 4.0, 5.0] {
            broadcaster.publish(progress(p));
        }
        broadcaster.finish(Some(complete()), JobState::Completed);

        let events = drain(&mut sub).await;
        assert_eq!(events, vec![progress(4.0), progress(5.0), complete()]);
        assert_eq!(sub.dropped(), 3);
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_same_order() {
        let broadcaster = Broadcaster::new("v1", 16);
        let mut a = broadcaster.subscribe();
        let mut b = broadcaster.subscribe();

        let publisher = {
            let broadcaster = broadcaster.clone();
            tokio::spawn(async move {
                for p in 0..10 {
                    broadcaster.publish(progress(p as f64));
                    tokio::task::yield_now().await;
                }
                broadcaster.finish(
                    Some(ProgressEvent::Error {
                        message: "x".into(),
                    }),
                    JobState::Failed,
                );
            })
        };

        let (ea, eb) = tokio::join!(drain(&mut a), drain(&mut b));
        publisher.await.unwrap();

        assert_eq!(ea, eb);
        assert_eq!(ea.len(), 11);
        assert!(ea.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_block() {
        let broadcaster = Broadcaster::new("v1", 1);
        for p in 0..1000 {
            broadcaster.publish(progress(p as f64));
        }
        broadcaster.close(JobState::Cancelled);
        assert!(broadcaster.is_closed());
    }

    #[tokio::test]
    async fn test_subscribe_after_close() {
        let broadcaster = Broadcaster::new("v1", 4);
        broadcaster.publish(progress(10.0));
        broadcaster.finish(Some(complete()), JobState::Completed);

        let mut late = broadcaster.subscribe();
        assert_eq!(late.recv().await, Some(complete()));
        assert_eq!(late.recv().await, None);
        assert_eq!(late.closed_state(), Some(JobState::Completed));
    }

    #[tokio::test]
    async fn test_cancel_closes_without_terminal_event() {
        let broadcaster = Broadcaster::new("v3", 4);
        let mut sub = broadcaster.subscribe();
        broadcaster.publish(progress(5.0));
        broadcaster.close(JobState::Cancelled);
        // Late publishes are ignored
        broadcaster.publish(progress(6.0));

        assert_eq!(drain(&mut sub).await, vec![progress(5.0)]);
        assert_eq!(sub.closed_state(), Some(JobState::Cancelled));
    }

    #[test]
    fn test_drop_unsubscribes() {
        let broadcaster = Broadcaster::new("v1", 4);
        let a = broadcaster.subscribe();
        let b = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 2);
        drop(a);
        assert_eq!(broadcaster.subscriber_count(), 1);
        assert_eq!(b.job_id(), "v1");
    }

    #[tokio::test]
    async fn test_dropped_broadcaster_ends_subscriptions() {
        let broadcaster = Broadcaster::new("v1", 4);
        let mut sub = broadcaster.subscribe();
        drop(broadcaster);
        assert_eq!(sub.recv().await, None);
        assert_eq!(sub.closed_state(), Some(JobState::Failed));
    }
}

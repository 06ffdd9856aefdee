use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::SlotChange;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for slot availability flips, one channel per service.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<SlotChange>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to changes for a service. Creates the channel if needed.
    pub fn subscribe(&self, service_id: Ulid) -> broadcast::Receiver<SlotChange> {
        let sender = self
            .channels
            .entry(service_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a change. No-op if nobody is listening.
    pub fn send(&self, change: SlotChange) {
        if let Some(sender) = self.channels.get(&change.service_id) {
            let _ = sender.send(change);
        }
    }

    pub fn subscriber_count(&self, service_id: &Ulid) -> usize {
        self.channels
            .get(service_id)
            .map_or(0, |s| s.receiver_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Span;
    use chrono::NaiveDate;

    fn change(service_id: Ulid, is_available: bool) -> SlotChange {
        SlotChange {
            slot_id: Ulid::new(),
            service_id,
            date: NaiveDate::from_ymd_opt(2026, 10, 20).unwrap(),
            span: Span::new(600, 630),
            is_available,
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let sid = Ulid::new();
        let mut rx = hub.subscribe(sid);

        let sent = change(sid, false);
        hub.send(sent.clone());
        assert_eq!(rx.recv().await.unwrap(), sent);
    }

    #[tokio::test]
    async fn channels_are_scoped_per_service() {
        let hub = NotifyHub::new();
        let (a, b) = (Ulid::new(), Ulid::new());
        let mut rx_a = hub.subscribe(a);
        let _rx_b = hub.subscribe(b);

        hub.send(change(b, false));
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(change(Ulid::new(), true));
    }

    #[test]
    fn dropped_receivers_are_counted_out() {
        let hub = NotifyHub::new();
        let sid = Ulid::new();
        let rx = hub.subscribe(sid);
        assert_eq!(hub.subscriber_count(&sid), 1);
        drop(rx);
        assert_eq!(hub.subscriber_count(&sid), 0);
    }
}

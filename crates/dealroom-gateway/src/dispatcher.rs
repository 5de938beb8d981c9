use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::trace;

use dealroom_types::events::{ChannelName, FanoutEvent};

use crate::fanout::Publisher;

/// Per-channel buffer. A receiver that falls further behind than this loses
/// the oldest events, which the at-most-once contract allows.
const CHANNEL_CAPACITY: usize = 256;

/// In-process pub/sub transport: one broadcast hub per named channel.
///
/// Delivery is at-most-once with no replay. Publishing to a channel nobody
/// is subscribed to delivers nothing.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// channel -> hub; removed once its last receiver is gone
    channels: RwLock<HashMap<ChannelName, broadcast::Sender<FanoutEvent>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                channels: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to a channel. Only events published after this call are
    /// received.
    pub fn subscribe(&self, channel: ChannelName) -> broadcast::Receiver<FanoutEvent> {
        if let Some(tx) = self.inner.channels.read().get(&channel) {
            return tx.subscribe();
        }

        self.inner
            .channels
            .write()
            .entry(channel)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Drop the channel's hub if no receivers remain. Callers drop their
    /// receiver first.
    pub fn unsubscribe(&self, channel: &ChannelName) {
        let mut channels = self.inner.channels.write();
        if channels.get(channel).is_some_and(|tx| tx.receiver_count() == 0) {
            channels.remove(channel);
            trace!("Channel {} has no subscribers left, removed", channel);
        }
    }

    /// Publish an event. Returns how many receivers it was handed to.
    pub fn publish(&self, channel: &ChannelName, event: FanoutEvent) -> usize {
        let delivered = match self.inner.channels.read().get(channel) {
            Some(tx) => tx.send(event).unwrap_or(0),
            None => 0,
        };

        if delivered == 0 {
            // Nobody listening: prune a hub whose receivers were dropped
            // without an explicit unsubscribe
            self.unsubscribe(channel);
        }
        delivered
    }

    pub fn subscriber_count(&self, channel: &ChannelName) -> usize {
        self.inner
            .channels
            .read()
            .get(channel)
            .map_or(0, |tx| tx.receiver_count())
    }

    /// Number of channels that currently have a hub.
    pub fn channel_count(&self) -> usize {
        self.inner.channels.read().len()
    }
}

impl Publisher for Dispatcher {
    fn publish(&self, channel: &ChannelName, event: FanoutEvent) -> anyhow::Result<usize> {
        Ok(Dispatcher::publish(self, channel, event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dealroom_types::models::{Conversation, Participant, Role};
    use uuid::Uuid;

    fn event() -> FanoutEvent {
        let now = Utc::now();
        FanoutEvent::new_conversation(Conversation {
            id: Uuid::new_v4(),
            startup_id: Uuid::new_v4(),
            participants: vec![Participant { user_id: Uuid::new_v4(), role: Role::Investor }],
            is_team_chat: false,
            last_message: None,
            last_message_at: now,
            message_count: 0,
            created_at: now,
        })
    }

    #[tokio::test]
    async fn delivers_only_to_the_named_channel() {
        let dispatcher = Dispatcher::new();
        let a = ChannelName::User(Uuid::new_v4());
        let b = ChannelName::User(Uuid::new_v4());
        let mut rx_a = dispatcher.subscribe(a);
        let mut rx_b = dispatcher.subscribe(b);

        let sent = event();
        assert_eq!(dispatcher.publish(&a, sent.clone()), 1);

        assert_eq!(rx_a.recv().await.unwrap(), sent);
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn publish_without_subscribers_is_dropped() {
        let dispatcher = Dispatcher::new();
        let channel = ChannelName::Entity(Uuid::new_v4());
        assert_eq!(dispatcher.publish(&channel, event()), 0);

        // Late subscribers get no replay
        let mut rx = dispatcher.subscribe(channel);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn last_unsubscribe_removes_the_channel() {
        let dispatcher = Dispatcher::new();
        let channel = ChannelName::Entity(Uuid::new_v4());
        let first = dispatcher.subscribe(channel);
        let second = dispatcher.subscribe(channel);
        assert_eq!(dispatcher.subscriber_count(&channel), 2);

        drop(first);
        dispatcher.unsubscribe(&channel);
        assert_eq!(dispatcher.channel_count(), 1);

        drop(second);
        dispatcher.unsubscribe(&channel);
        assert_eq!(dispatcher.channel_count(), 0);
    }

    #[test]
    fn abandoned_hubs_are_pruned_on_publish() {
        let dispatcher = Dispatcher::new();
        let channel = ChannelName::User(Uuid::new_v4());
        drop(dispatcher.subscribe(channel));
        assert_eq!(dispatcher.channel_count(), 1);

        assert_eq!(dispatcher.publish(&channel, event()), 0);
        assert_eq!(dispatcher.channel_count(), 0);
    }
}

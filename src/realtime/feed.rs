//! Change-feed transport seam.
//!
//! A transport hands out one [`Subscription`] per table: an ordered event
//! stream plus a status signal. Reconnecting is the transport's job; the
//! listener only observes the statuses it is given.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

use crate::cache::lock::mutex_lock;

use super::events::ChangeEvent;

const SOURCE: &str = "realtime::feed";
pub(crate) const EVENT_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("change feed transport failed: {0}")]
    Transport(String),
    #[error("table `{0}` is already subscribed")]
    AlreadySubscribed(String),
    #[error("change feed is closed")]
    Closed,
}

/// Lifecycle of one table subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    Subscribed,
    /// The transport dropped; it is retrying.
    Lost,
    Unsubscribed,
}

/// Live subscription to one table.
pub struct Subscription {
    pub table: String,
    pub events: mpsc::Receiver<ChangeEvent>,
    pub status: watch::Receiver<ChannelStatus>,
    pub handle: SubscriptionHandle,
}

/// Cancels the transport side of a subscription when told to, or when
/// dropped.
#[derive(Debug, Default)]
pub struct SubscriptionHandle {
    task: Option<AbortHandle>,
}

impl SubscriptionHandle {
    pub fn new(task: AbortHandle) -> Self {
        Self { task: Some(task) }
    }

    /// A handle with nothing to cancel, for transports that push from outside.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn unsubscribe(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[async_trait]
pub trait ChangeFeedTransport: Send + Sync {
    async fn subscribe(&self, table: &str) -> Result<Subscription, FeedError>;
}

struct Channel {
    events: mpsc::Sender<ChangeEvent>,
    status: watch::Sender<ChannelStatus>,
}

/// In-process transport: whoever holds it publishes events and statuses by
/// hand. Used by tests and by embedders that bridge another event source.
#[derive(Clone, Default)]
pub struct ChannelTransport {
    channels: Arc<Mutex<HashMap<String, Channel>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to the subscriber of its table.
    pub async fn publish(&self, event: ChangeEvent) -> Result<(), FeedError> {
        let sender = mutex_lock(&self.channels, SOURCE, "publish")
            .get(&event.table)
            .map(|channel| channel.events.clone())
            .ok_or(FeedError::Closed)?;
        sender.send(event).await.map_err(|_| FeedError::Closed)
    }

    pub fn set_status(&self, table: &str, status: ChannelStatus) {
        if let Some(channel) = mutex_lock(&self.channels, SOURCE, "set_status").get(table) {
            channel.status.send_replace(status);
        }
    }

    pub fn is_subscribed(&self, table: &str) -> bool {
        mutex_lock(&self.channels, SOURCE, "is_subscribed")
            .get(table)
            .is_some_and(|channel| !channel.events.is_closed())
    }
}

#[async_trait]
impl ChangeFeedTransport for ChannelTransport {
    async fn subscribe(&self, table: &str) -> Result<Subscription, FeedError> {
        let mut channels = mutex_lock(&self.channels, SOURCE, "subscribe");
        if let Some(existing) = channels.get(table)
            && !existing.events.is_closed()
        {
            return Err(FeedError::AlreadySubscribed(table.to_string()));
        }
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Connecting);
        channels.insert(
            table.to_string(),
            Channel {
                events: events_tx,
                status: status_tx,
            },
        );
        Ok(Subscription {
            table: table.to_string(),
            events: events_rx,
            status: status_rx,
            handle: SubscriptionHandle::detached(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::events::Operation;

    #[tokio::test]
    async fn events_reach_the_subscriber_in_order() {
        let transport = ChannelTransport::new();
        let mut subscription = transport.subscribe("posts").await.expect("subscribe");
        for id in 1..=3 {
            let row = serde_json::json!({ "id": id });
            transport
                .publish(ChangeEvent::new("posts", Operation::Insert, Some(row), None))
                .await
                .expect("publish");
        }
        for id in 1..=3 {
            let event = subscription.events.recv().await.expect("event");
            assert_eq!(event.item_id(), Some(id));
        }
    }

    #[tokio::test]
    async fn second_live_subscription_is_rejected() {
        let transport = ChannelTransport::new();
        let first = transport.subscribe("posts").await.expect("subscribe");
        assert!(matches!(
            transport.subscribe("posts").await,
            Err(FeedError::AlreadySubscribed(_))
        ));
        drop(first);
        assert!(transport.subscribe("posts").await.is_ok());
    }

    #[tokio::test]
    async fn publishing_to_unknown_table_fails() {
        let transport = ChannelTransport::new();
        let event = ChangeEvent::new("posts", Operation::Delete, None, None);
        assert!(matches!(transport.publish(event).await, Err(FeedError::Closed)));
    }
}

use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    models::{EventScope, FileChangeEvent},
    services::metrics::MetricsService,
};

/// Which events a subscriber wants to see.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub owner: Option<String>,
    /// Matches against the event path relative to the data root.
    pub path_prefix: Option<String>,
    pub include_shared: bool,
}

impl SubscriptionFilter {
    /// Own files plus the shared area.
    pub fn for_user(owner: &str) -> Self {
        Self {
            owner: Some(owner.to_string()),
            path_prefix: None,
            include_shared: true,
        }
    }

    pub fn matches(&self, event: &FileChangeEvent) -> bool {
        let scoped = match &event.scope {
            EventScope::Shared => self.include_shared,
            EventScope::User(owner) => self.owner.as_deref().map_or(true, |o| o == owner),
        };

        scoped
            && self
                .path_prefix
                .as_deref()
                .map_or(true, |prefix| event.path.starts_with(prefix))
    }
}

pub struct Subscription {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<Arc<FileChangeEvent>>,
}

struct Subscriber {
    filter: SubscriptionFilter,
    sender: mpsc::Sender<Arc<FileChangeEvent>>,
}

/// Fans change events out to live clients. Publishing never blocks: a
/// subscriber whose buffer is full misses the event.
pub struct NotificationHub {
    subscribers: RwLock<HashMap<Uuid, Subscriber>>,
    buffer: usize,
    metrics: Arc<MetricsService>,
}

impl NotificationHub {
    pub fn new(buffer: usize, metrics: Arc<MetricsService>) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
            metrics,
        }
    }

    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let id = Uuid::new_v4();
        self.subscribers.write().insert(id, Subscriber { filter, sender });
        debug!(subscription = %id, "subscriber added");
        Subscription { id, receiver }
    }

    pub fn unsubscribe(&self, id: Uuid) -> bool {
        self.subscribers.write().remove(&id).is_some()
    }

    /// Returns the number of subscribers the event was delivered to.
    pub fn publish(&self, event: FileChangeEvent) -> usize {
        let event = Arc::new(event);
        let mut delivered = 0;
        let mut closed = Vec::new();

        {
            let subscribers = self.subscribers.read();
            for (id, subscriber) in subscribers.iter() {
                if !subscriber.filter.matches(&event) {
                    continue;
                }
                match subscriber.sender.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!(subscription = %id, path = %event.path, "subscriber buffer full, event dropped");
                        self.metrics.record_notification_dropped();
                    }
                    Err(TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in closed {
                subscribers.remove(&id);
                debug!(subscription = %id, "closed subscriber removed");
            }
        }

        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

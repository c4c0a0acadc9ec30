use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{stream, Stream};
use std::{convert::Infallible, sync::Arc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    handlers::AppState,
    middleware::AuthenticatedUser,
    models::{FileChangeEvent, NotificationRecord},
    services::{NotificationHub, SubscriptionFilter},
};

/// Unsubscribes when the client goes away and the stream is dropped.
struct SubscriptionGuard {
    hub: Arc<NotificationHub>,
    id: Uuid,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}

pub async fn stream_events(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state
        .hub
        .subscribe(SubscriptionFilter::for_user(&user.username));
    tracing::debug!(user = %user.username, subscription = %subscription.id, "event stream opened");

    let guard = SubscriptionGuard {
        hub: state.hub.clone(),
        id: subscription.id,
    };

    Sse::new(event_stream(subscription.receiver, guard)).keep_alive(KeepAlive::default())
}

fn event_stream(
    receiver: mpsc::Receiver<Arc<FileChangeEvent>>,
    guard: SubscriptionGuard,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold((receiver, guard), |(mut receiver, guard)| async move {
        let change = receiver.recv().await?;
        let record = NotificationRecord::from(change.as_ref());
        let event = Event::default()
            .event(record.record_type)
            .json_data(&record)
            .unwrap_or_else(|_| Event::default().comment("unencodable event"));
        Some((Ok(event), (receiver, guard)))
    })
}

//! Server-Sent Events feed.
//!
//! One long-lived response per subscriber: `event: <type>` / `data: <json>`
//! pairs from the internal bus, plus a `connected` heartbeat every 15
//! seconds. Slow subscribers whose buffer fills are disconnected rather
//! than allowed to back up the bus.

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{
    Context,
    Poll,
};

use axum::extract::State;
use axum::response::sse::{
    Event,
    Sse,
};
use futures_util::Stream;
use tokio::sync::{
    broadcast,
    mpsc,
};

use crate::api::Api;

/// Heartbeat cadence.
const HEARTBEAT: std::time::Duration = std::time::Duration::from_secs(15);

/// Queued events per subscriber before it is considered too slow.
const SUBSCRIBER_BUFFER: usize = 64;

pub async fn get_events(State(api): State<Api>) -> Sse<EventStream> {
    let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
    let subscription = api.events.subscribe();
    let shutdown = api.shutdown.clone();

    tokio::spawn(forward_events(subscription, sender, shutdown));

    Sse::new(EventStream { receiver })
}

/// Pump bus events (and the heartbeat) into one subscriber's queue. A full
/// queue means the client cannot keep up; dropping the sender ends its
/// stream.
async fn forward_events(
    mut subscription: broadcast::Receiver<crate::events::Event>,
    sender: mpsc::Sender<Event>,
    shutdown: tokio_util::sync::CancellationToken,
) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT);

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = heartbeat.tick() => Event::default().event("connected").data("{\"status\":\"ok\"}"),
            received = subscription.recv() => {
                match received {
                    Ok(event) => {
                        match Event::default().event(event.kind).json_data(&event.data) {
                            Ok(event) => event,
                            Err(error) => {
                                tracing::error!(?error, "unserializable event");
                                continue;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::debug!(missed, "SSE subscriber lagged the bus");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        match sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("dropping slow SSE subscriber");
                break;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
}

pub struct EventStream {
    receiver: mpsc::Receiver<Event>,
}

impl Stream for EventStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx).map(|event| event.map(Ok))
    }
}

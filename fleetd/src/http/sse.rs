//! Realtime stream: SSE scoped to the caller's homes, resumable via
//! `Last-Event-ID: <homeId>:<seq>`. A cursor that fell out of the ring
//! window gets a `resync` event and must refetch snapshots.

use std::collections::HashMap;
use std::convert::Infallible;

use axum::{
    Extension,
    extract::State,
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};

use fleet_core::fanout::{Replay, SequencedEvent, StreamEvent};
use fleet_core::model::HomeId;
use fleet_core::storage::Storage;

use crate::http::auth::AuthenticatedUser;
use crate::state::AppState;

pub async fn events(
    State(app): State<AppState>,
    Extension(authed): Extension<AuthenticatedUser>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let homes = app.store.home_ids_for_user(authed.user.id).await.unwrap_or_default();
    let cursor = parse_last_event_id(&headers);

    let (tx, rx) = mpsc::channel::<Event>(256);
    let hub = app.events.clone();
    tokio::spawn(async move {
        // subscribe before replaying so nothing falls in the gap
        let mut live = hub.subscribe();
        if tx.send(Event::default().event("ready").data("{}")).await.is_err() {
            return;
        }

        let mut last_sent: HashMap<HomeId, u64> = HashMap::new();
        if let Some((home, seq)) = cursor
            && homes.contains(&home)
        {
            match hub.replay_since(home, seq) {
                Replay::Events(replay) => {
                    for ev in replay {
                        last_sent.insert(ev.home_id, ev.seq);
                        if tx.send(to_sse(&ev)).await.is_err() {
                            return;
                        }
                    }
                }
                Replay::Resync => {
                    if tx.send(Event::default().event("resync").data("{}")).await.is_err() {
                        return;
                    }
                }
            }
        }

        loop {
            match live.recv().await {
                Ok(ev) => {
                    if !homes.contains(&ev.home_id) {
                        continue;
                    }
                    // replay already covered everything up to last_sent
                    let prev = last_sent.get(&ev.home_id).copied().unwrap_or(0);
                    if ev.seq <= prev {
                        continue;
                    }
                    last_sent.insert(ev.home_id, ev.seq);
                    if tx.send(to_sse(&ev)).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("sse consumer lagged by {n} events");
                    if tx.send(Event::default().event("resync").data("{}")).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    Sse::new(ReceiverStream::new(rx).map(Ok))
        .keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)))
}

fn parse_last_event_id(headers: &HeaderMap) -> Option<(HomeId, u64)> {
    let raw = headers.get("last-event-id")?.to_str().ok()?;
    let (home, seq) = raw.split_once(':')?;
    Some((HomeId(home.parse().ok()?), seq.parse().ok()?))
}

fn event_name(event: &StreamEvent) -> &'static str {
    match event {
        StreamEvent::DeviceStateUpdated { .. } => "device_state_updated",
        StreamEvent::DeviceStatusChanged { .. } => "device_status_changed",
        StreamEvent::DeviceEventCreated { .. } => "device_event_created",
        StreamEvent::CommandUpdated { .. } => "command_updated",
        StreamEvent::HubStatusChanged { .. } => "hub_status_changed",
    }
}

fn to_sse(ev: &SequencedEvent) -> Event {
    let data = serde_json::to_string(&ev.event).unwrap_or_else(|_| "{}".to_string());
    Event::default()
        .id(format!("{}:{}", ev.home_id.0, ev.seq))
        .event(event_name(&ev.event))
        .data(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert("last-event-id", "7:42".parse().unwrap());
        assert_eq!(parse_last_event_id(&headers), Some((HomeId(7), 42)));

        headers.insert("last-event-id", "junk".parse().unwrap());
        assert_eq!(parse_last_event_id(&headers), None);
    }
}

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use std::{collections::HashMap, time::Duration};
use tokio::{
    sync::{Mutex, broadcast},
    time::Instant,
};
use tracing::{debug, warn};
use unicorn_core::ProjectId;
use unicorn_protocol::BoardEvent;

use crate::routes::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Fan-out of board events, one channel per project.
pub struct ProjectHub {
    capacity: usize,
    channels: Mutex<HashMap<ProjectId, broadcast::Sender<String>>>,
}

impl ProjectHub {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), channels: Mutex::new(HashMap::new()) }
    }

    pub async fn subscribe(&self, project_id: ProjectId) -> broadcast::Receiver<String> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(project_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Sends `event` to the sockets watching its project. Channels nobody
    /// listens to any more are dropped.
    pub async fn publish(&self, event: &BoardEvent) {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(err) => {
                warn!(error = %err, "failed to serialize board event");
                return;
            }
        };

        let mut channels = self.channels.lock().await;
        let Some(sender) = channels.get(&event.project_id) else {
            return;
        };
        if sender.send(json).is_err() {
            debug!(project_id = %event.project_id, "no subscribers left, dropping channel");
            channels.remove(&event.project_id);
        }
    }

    #[cfg(test)]
    pub async fn channel_count(&self) -> usize {
        self.channels.lock().await.len()
    }
}

pub async fn project_socket(
    ws: WebSocketUpgrade,
    Path(project_id): Path<ProjectId>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let rx = state.hub.subscribe(project_id).await;
        debug!(%project_id, "socket subscribed");
        let (sender, receiver) = socket.split();
        run_socket_loop(sender, receiver, rx).await;
        debug!(%project_id, "socket closed");
    })
}

async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // First tick fires immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "socket lagged behind board events");
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use unicorn_protocol::EventKind;

    #[tokio::test]
    async fn events_reach_only_their_project() {
        let hub = ProjectHub::new(8);
        let watched = ProjectId::new();
        let other = ProjectId::new();
        let mut rx = hub.subscribe(watched).await;

        hub.publish(&BoardEvent::new(other, EventKind::TaskDeleted { task_id: "x".into() })).await;
        hub.publish(&BoardEvent::new(watched, EventKind::TaskDeleted { task_id: "y".into() })).await;

        let received: BoardEvent = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(received.project_id, watched);
        assert!(matches!(received.kind, EventKind::TaskDeleted { task_id } if task_id.as_str() == "y"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn abandoned_channels_are_pruned() {
        let hub = ProjectHub::new(8);
        let project = ProjectId::new();
        drop(hub.subscribe(project).await);
        assert_eq!(hub.channel_count().await, 1);

        hub.publish(&BoardEvent::new(project, EventKind::TaskDeleted { task_id: "x".into() })).await;
        assert_eq!(hub.channel_count().await, 0);
    }
}

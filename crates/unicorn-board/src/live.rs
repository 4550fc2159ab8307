use futures_util::StreamExt;
use thiserror::Error;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use unicorn_core::ProjectId;
use unicorn_protocol::BoardEvent;

use crate::client::BoardClient;
use crate::remote::TaskRemote;

#[derive(Debug, Error)]
pub enum LiveError {
    #[error("server url must start with http:// or https://, got {0}")]
    InvalidUrl(String),
    #[error("socket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Socket endpoint for a project's board events.
pub fn socket_url(base_url: &str, project_id: ProjectId) -> Result<String, LiveError> {
    let base = base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(LiveError::InvalidUrl(base_url.to_string()));
    };
    Ok(format!("{ws_base}/v1/projects/{project_id}/ws"))
}

/// Follows the project's board events until the server closes the socket,
/// refetching the scope after each one. `on_event` sees every event after
/// the refetch.
pub async fn watch<R, F>(
    client: &BoardClient<R>,
    base_url: &str,
    project_id: ProjectId,
    mut on_event: F,
) -> Result<(), LiveError>
where
    R: TaskRemote,
    F: FnMut(&BoardEvent),
{
    let url = socket_url(base_url, project_id)?;
    let (mut stream, _) = connect_async(url.as_str()).await?;
    info!(%project_id, %url, "watching board");

    // Pings are answered by tungstenite on the next read.
    while let Some(message) = stream.next().await {
        match message? {
            Message::Text(text) => {
                let event: BoardEvent = match serde_json::from_str(&text) {
                    Ok(event) => event,
                    Err(err) => {
                        warn!(error = %err, "ignoring malformed board event");
                        continue;
                    }
                };
                if event.project_id != project_id {
                    continue;
                }
                debug!(event_id = %event.event_id, "board event");
                if let Err(err) = client.refresh(project_id).await {
                    warn!(%project_id, error = %err, "refetch after board event failed");
                }
                on_event(&event);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    info!(%project_id, "board socket closed");
    Ok(())
}

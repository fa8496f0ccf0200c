// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! WebSocket session: the relay pushes descriptors down one duplex socket.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::{sync::mpsc, task::JoinSet};
use tokio_tungstenite::{
  connect_async,
  tungstenite::{
    client::IntoClientRequest,
    handshake::client::Request,
    http::{HeaderValue, StatusCode},
    Error as WsError, Message,
  },
};
use tracing::Instrument;

use super::{dispatch, AgentConfig, AgentError, OutboundHttp, RelayAgent};
use crate::{
  common::{authentication::API_KEY_HEADER, protocol::RequestDescriptor},
  util::cancellation::CancellationListener,
};

fn client_request(config: &AgentConfig) -> Result<Request, AgentError> {
  let mut request = config
    .server_url
    .as_str()
    .into_client_request()
    .map_err(|error| AgentError::InvalidConfiguration(error.to_string()))?;
  if let Some(key) = &config.api_key {
    let value = HeaderValue::from_str(key)
      .map_err(|_| AgentError::InvalidConfiguration("API key is not a valid header value".into()))?;
    request.headers_mut().insert(API_KEY_HEADER, value);
  }
  Ok(request)
}

fn connect_error(error: WsError) -> AgentError {
  match error {
    WsError::Http(response) if response.status() == StatusCode::UNAUTHORIZED => {
      AgentError::Unauthorized
    }
    error => AgentError::Connect(error.to_string()),
  }
}

/// Extracts a request descriptor from a data frame; anything malformed is logged and skipped
fn decode_request(payload: &[u8]) -> Option<RequestDescriptor> {
  match serde_json::from_slice::<RequestDescriptor>(payload) {
    Ok(descriptor) => Some(descriptor),
    Err(error) => {
      tracing::warn!(%error, "Ignoring malformed message from relay");
      None
    }
  }
}

fn spawn_dispatch(
  dispatches: &mut JoinSet<()>,
  outbound: &Arc<dyn OutboundHttp>,
  replies: &mpsc::UnboundedSender<Message>,
  descriptor: RequestDescriptor,
) {
  let outbound = Arc::clone(outbound);
  let replies = replies.clone();
  dispatches.spawn(
    async move {
      let response = dispatch(outbound.as_ref(), &descriptor).await;
      match serde_json::to_string(&response) {
        Ok(text) => {
          if replies.send(Message::text(text)).is_err() {
            tracing::debug!(request = %response.request_id, "Session ended before the result was sent");
          }
        }
        Err(error) => {
          tracing::error!(request = %response.request_id, %error, "Failed to encode response")
        }
      }
    }
    .in_current_span(),
  );
}

pub(super) async fn run_session(
  agent: &RelayAgent,
  shutdown: &CancellationListener,
) -> Result<(), AgentError> {
  let request = client_request(agent.config())?;
  let (socket, _) = tokio::select! {
    _ = shutdown.cancelled() => return Ok(()),
    connected = connect_async(request) => connected.map_err(connect_error)?,
  };
  let span = tracing::info_span!("push_session", server = %agent.config().server_url);

  async move {
    tracing::info!("Connected to relay");
    let (mut sink, mut stream) = socket.split();
    let (replies, mut outgoing) = mpsc::unbounded_channel::<Message>();
    let mut dispatches = JoinSet::new();

    let result = loop {
      tokio::select! {
        _ = shutdown.cancelled() => {
          let _ = sink.send(Message::Close(None)).await;
          break Ok(());
        }
        Some(message) = outgoing.recv() => {
          if let Err(error) = sink.send(message).await {
            break Err(AgentError::Transport(error.to_string()));
          }
        }
        message = stream.next() => match message {
          None => break Err(AgentError::Transport("Relay closed the socket".into())),
          Some(Err(error)) => break Err(AgentError::Transport(error.to_string())),
          Some(Ok(Message::Text(text))) => {
            if let Some(descriptor) = decode_request(text.as_bytes()) {
              spawn_dispatch(&mut dispatches, &agent.outbound, &replies, descriptor);
            }
          }
          Some(Ok(Message::Binary(data))) => {
            if let Some(descriptor) = decode_request(&data) {
              spawn_dispatch(&mut dispatches, &agent.outbound, &replies, descriptor);
            }
          }
          Some(Ok(Message::Close(frame))) => {
            tracing::debug!(?frame, "Relay sent close");
            break Err(AgentError::Transport("Relay closed the socket".into()));
          }
          // Pings are answered by tungstenite while reading
          Some(Ok(_)) => {}
        }
      }
      while dispatches.try_join_next().is_some() {}
    };

    // Results for a dead socket have nowhere to go
    dispatches.abort_all();
    result
  }
  .instrument(span)
  .await
}

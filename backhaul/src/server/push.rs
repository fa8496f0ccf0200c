// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use axum::{
  extract::{
    ws::{Message, WebSocket},
    State, WebSocketUpgrade,
  },
  http::HeaderMap,
  response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{error::ApiError, AppState};
use crate::common::{
  daemon::RelayDaemon,
  protocol::{
    transport::{
      push::{InboundFrame, SessionControl},
      PushFrame, PushTransport,
    },
    tunnel::{DuplexEndpoint, TunnelCloseReason},
  },
};

/// Admits a duplex peer; the credential is checked before the upgrade is accepted
pub(super) async fn upgrade(
  State(state): State<Arc<AppState>>,
  headers: HeaderMap,
  ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
  state.authenticate(&headers)?;
  let daemon = Arc::clone(&state.daemon);
  Ok(ws.on_upgrade(move |socket| run_session(daemon, socket)))
}

fn outbound_message(frame: PushFrame) -> Option<Message> {
  match frame {
    PushFrame::Request(descriptor) => match serde_json::to_string(&descriptor) {
      Ok(text) => Some(Message::Text(text)),
      Err(error) => {
        tracing::error!(request = %descriptor.request_id, %error, "Failed to encode request");
        None
      }
    },
    PushFrame::Ping => Some(Message::Ping(Vec::new())),
    PushFrame::Close => Some(Message::Close(None)),
  }
}

fn inbound_frame(message: Message) -> InboundFrame {
  match message {
    Message::Text(text) => InboundFrame::Text(text),
    Message::Binary(data) => InboundFrame::Binary(data),
    // The socket queues the pong on its own
    Message::Ping(_) => InboundFrame::Ping,
    Message::Pong(_) => InboundFrame::Pong,
    Message::Close(_) => InboundFrame::Close,
  }
}

async fn run_session(daemon: Arc<RelayDaemon>, socket: WebSocket) {
  let transport: Arc<PushTransport> = match daemon.transport().as_push() {
    Some(transport) => Arc::clone(transport),
    None => return,
  };
  let (mut session, endpoint) = daemon.register_push();
  let connection_id = match session.connection() {
    Some(connection) => connection.id(),
    None => return,
  };
  let span = tracing::info_span!("push_session", connection = %connection_id);

  async move {
    let DuplexEndpoint { frames, closer } = endpoint;
    let (sink, mut stream) = socket.split();
    let writer = tokio::task::spawn(write_frames(sink, frames, closer.clone()).in_current_span());

    let reason = loop {
      tokio::select! {
        _ = closer.cancelled() => break TunnelCloseReason::GracefulExit { remote_initiated: false },
        message = stream.next() => match message {
          None => break TunnelCloseReason::GracefulExit { remote_initiated: true },
          Some(Err(error)) => {
            tracing::warn!(%error, "WebSocket error");
            break TunnelCloseReason::transport_error(error);
          }
          Some(Ok(message)) => {
            if session.on_frame(&transport, inbound_frame(message)) == SessionControl::Close {
              break TunnelCloseReason::GracefulExit { remote_initiated: true };
            }
          }
        }
      }
    };

    session.close(daemon.registry(), reason);
    if writer.await.is_err() {
      tracing::error!("WebSocket writer panicked");
    }
  }
  .instrument(span)
  .await
}

async fn write_frames(
  mut sink: futures::stream::SplitSink<WebSocket, Message>,
  mut frames: tokio::sync::mpsc::UnboundedReceiver<PushFrame>,
  closer: CancellationToken,
) {
  loop {
    let frame = tokio::select! {
      _ = closer.cancelled() => break,
      frame = frames.recv() => match frame {
        Some(frame) => frame,
        None => break,
      },
    };
    let message = match outbound_message(frame) {
      Some(message) => message,
      None => continue,
    };
    if let Err(error) = sink.send(message).await {
      tracing::debug!(%error, "WebSocket write failed");
      closer.cancel();
      break;
    }
  }
  let _ = sink.send(Message::Close(None)).await;
  let _ = sink.close().await;
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::Result;
use backhaul::server::{RelayServer, ServerConfig};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cancels the returned token on the first SIGINT
pub(crate) fn sigint_shutdown() -> (CancellationToken, JoinHandle<()>) {
  let shutdown = CancellationToken::new();
  let shutdown_trigger = shutdown.clone();
  let sigint_handler_task = tokio::task::spawn(async move {
    let _ = tokio::signal::ctrl_c().await;
    tracing::trace!("SIGINT detected, initiating graceful shutdown");
    shutdown_trigger.cancel();
  });
  (shutdown, sigint_handler_task)
}

/// Run a relay server until interrupted
#[tracing::instrument(
skip(config),
fields(
addr=%config.socket_addr(),
mode=%config.transport_mode,
),
err
)]
pub async fn server_main(config: ServerConfig) -> Result<()> {
  let server = RelayServer::bind(config).await?;
  let (shutdown, sigint_handler_task) = sigint_shutdown();

  let served = server.run(shutdown).await;

  sigint_handler_task.abort();
  let _cancelled = sigint_handler_task.await;

  served
}

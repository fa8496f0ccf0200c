// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use backhaul::client::{AgentConfig, RelayAgent};

use crate::server::sigint_shutdown;

/// Run a relay agent, reconnecting to the relay until interrupted
#[tracing::instrument(
skip(config),
fields(
server=%config.server_url,
target=%config.target_api,
mode=%config.transport_mode,
),
err
)]
pub async fn agent_main(config: AgentConfig) -> Result<()> {
  let agent = RelayAgent::new(config).context("Failed to configure relay agent")?;
  let (shutdown, sigint_handler_task) = sigint_shutdown();

  let outcome = agent.run(shutdown.into()).await;

  sigint_handler_task.abort();
  let _cancelled = sigint_handler_task.await;

  outcome.context("Relay agent stopped")
}

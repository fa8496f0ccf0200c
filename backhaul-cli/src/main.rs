// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::Result;
use backhaul::{client::AgentConfig, server::ServerConfig, util};
use clap::{Arg, ArgMatches, Command};
use std::str::FromStr;

use util::validators::{
  parse_bool, parse_http_url, parse_interval_millis, parse_ipaddr, parse_millis, parse_port,
  parse_relay_url, parse_transport_mode, validate_bool, validate_http_url,
  validate_interval_millis, validate_ipaddr, validate_millis, validate_port, validate_relay_url,
  validate_transport_mode,
};

mod client;
mod server;

/// Dependencies that are chatty at the levels we run ours at
const QUIET_TARGETS: &str = "hyper=warn,hyper_util=warn,reqwest=warn,tungstenite=warn,tokio_tungstenite=warn";

fn validate_log_level(v: &str) -> Result<(), String> {
  tracing::Level::from_str(v)
    .map(|_| ())
    .map_err(|_| format!("{:?} is not one of trace, debug, info, warn, error", v))
}

fn init_tracing(log_level: &str) {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("{},{}", QUIET_TARGETS, log_level)));
  let collector = tracing_subscriber::fmt()
    .pretty()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
}

fn millis_arg(name: &'static str, env: &'static str, default: &'static str) -> Arg<'static> {
  Arg::new(name)
    .long(name)
    .env(env)
    .validator(validate_millis)
    .default_value(default)
    .takes_value(true)
}

fn interval_arg(name: &'static str, env: &'static str, default: &'static str) -> Arg<'static> {
  Arg::new(name)
    .long(name)
    .env(env)
    .validator(validate_interval_millis)
    .default_value(default)
    .takes_value(true)
}

fn mode_arg() -> Arg<'static> {
  Arg::new("mode")
    .help("Transport between relay and agent: push (WebSocket) or pull (long-polling)")
    .long("mode")
    .short('m')
    .env("TRANSPORT_MODE")
    .validator(validate_transport_mode)
    .default_value("push")
    .takes_value(true)
}

fn api_key_arg() -> Arg<'static> {
  Arg::new("api-key")
    .help("Shared key presented by agents and public callers")
    .long("api-key")
    .short('k')
    .env("API_KEY")
    .hide_env_values(true)
    .takes_value(true)
    .required(false)
}

fn command() -> Command<'static> {
  Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .arg(
      Arg::new("log-level")
        .long("log-level")
        .env("LOG_LEVEL")
        .validator(validate_log_level)
        .default_value("info")
        .takes_value(true)
        .global(true),
    )
    .subcommand(
      Command::new("server")
        .alias("-s")
        .about("Run the public relay, accepting agents and proxying requests to them")
        .arg(
          Arg::new("bind")
            .long("bind")
            .short('i')
            .env("BIND_ADDRESS")
            .validator(validate_ipaddr)
            .default_value("0.0.0.0")
            .takes_value(true),
        )
        .arg(
          Arg::new("port")
            .long("port")
            .short('p')
            .env("PORT")
            .validator(validate_port)
            .default_value("3000")
            .takes_value(true),
        )
        .arg(api_key_arg())
        .arg(mode_arg())
        .arg(
          interval_arg("ping-interval", "PING_INTERVAL_MS", "30000")
            .help("Probe period in milliseconds; long-polling agents expire after twice this"),
        )
        .arg(interval_arg("request-timeout", "REQUEST_TIMEOUT_MS", "30000"))
        .arg(interval_arg("poll-timeout", "POLL_TIMEOUT_MS", "30000"))
        .arg(interval_arg("rate-limit-window", "RATE_LIMIT_WINDOW_MS", "60000"))
        .arg(
          Arg::new("rate-limit-max")
            .help("Proxied requests allowed per client address each window; 0 disables limiting")
            .long("rate-limit-max")
            .env("RATE_LIMIT_MAX")
            .validator(|v| v.trim().parse::<u32>().map(|_| ()).map_err(|e| e.to_string()))
            .default_value("100")
            .takes_value(true),
        )
        .arg(
          Arg::new("socket-path")
            .long("socket-path")
            .env("SOCKET_PATH")
            .default_value("/ws")
            .takes_value(true),
        ),
    )
    .subcommand(
      Command::new("agent")
        .alias("-a")
        .about("Run next to a private API, relaying requests from the public relay")
        .arg(
          Arg::new("server")
            .help("Relay URL: ws(s):// socket in push mode, http(s):// base in pull mode")
            .long("server")
            .short('s')
            .env("SERVER_URL")
            .validator(validate_relay_url)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("target")
            .long("target")
            .short('t')
            .env("TARGET_API")
            .validator(validate_http_url)
            .takes_value(true)
            .required(true),
        )
        .arg(api_key_arg())
        .arg(mode_arg())
        .arg(interval_arg("reconnect-interval", "RECONNECT_INTERVAL_MS", "5000"))
        .arg(interval_arg("outbound-timeout", "OUTBOUND_TIMEOUT_MS", "25000"))
        .arg(interval_arg("heartbeat-interval", "HEARTBEAT_INTERVAL_MS", "10000"))
        .arg(millis_arg("poll-wait", "POLL_WAIT_MS", "25000"))
        .arg(
          Arg::new("insecure-target")
            .help("Skip TLS certificate validation when calling the target")
            .long("insecure-target")
            .env("ACCEPT_INVALID_TARGET_CERTS")
            .validator(validate_bool)
            .default_value("false")
            .takes_value(true),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true)
}

fn main() {
  let matches = command().get_matches();
  init_tracing(matches.value_of("log-level").unwrap_or("info"));
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

fn api_key(args: &ArgMatches) -> Option<String> {
  args
    .value_of("api-key")
    .map(str::trim)
    .filter(|key| !key.is_empty())
    .map(String::from)
}

// Arguments with defaults or `required` are always present once clap has validated them
fn value<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a str> {
  args
    .value_of(name)
    .ok_or_else(|| anyhow::Error::msg(format!("Missing argument {}", name)))
}

pub fn server_arg_handling(args: &ArgMatches) -> Result<ServerConfig> {
  Ok(ServerConfig {
    bind_address: parse_ipaddr(value(args, "bind")?)?,
    port: parse_port(value(args, "port")?)?,
    api_key: api_key(args),
    transport_mode: parse_transport_mode(value(args, "mode")?)?,
    ping_interval: parse_interval_millis(value(args, "ping-interval")?)?,
    request_timeout: parse_interval_millis(value(args, "request-timeout")?)?,
    poll_timeout: parse_interval_millis(value(args, "poll-timeout")?)?,
    rate_limit_window: parse_interval_millis(value(args, "rate-limit-window")?)?,
    rate_limit_max: value(args, "rate-limit-max")?.trim().parse()?,
    socket_path: value(args, "socket-path")?.to_owned(),
  })
}

pub fn agent_arg_handling(args: &ArgMatches) -> Result<AgentConfig> {
  let mut config = AgentConfig::new(
    parse_relay_url(value(args, "server")?)?,
    parse_http_url(value(args, "target")?)?,
  );
  config.api_key = api_key(args);
  config.transport_mode = parse_transport_mode(value(args, "mode")?)?;
  config.reconnect_interval = parse_interval_millis(value(args, "reconnect-interval")?)?;
  config.outbound_timeout = parse_interval_millis(value(args, "outbound-timeout")?)?;
  config.heartbeat_interval = parse_interval_millis(value(args, "heartbeat-interval")?)?;
  config.poll_wait = parse_millis(value(args, "poll-wait")?)?;
  config.accept_invalid_target_certs = parse_bool(value(args, "insecure-target")?)?;
  Ok(config)
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches.subcommand() {
    Some(("server", opts)) => {
      let config = server_arg_handling(opts)?;
      tracing::info!("Running as relay server with config {:#?}", config);
      server::server_main(config).await
    }
    Some(("agent", opts)) => {
      let config = agent_arg_handling(opts)?;
      tracing::info!("Running as relay agent with config {:#?}", config);
      client::agent_main(config).await
    }
    _ => Err(anyhow::Error::msg("A subcommand is required")),
  }
}

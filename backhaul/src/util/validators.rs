// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context, Error as AnyErr, Result};
use std::time::Duration;
use url::Url;

use crate::common::protocol::transport::TransportMode;

pub fn parse_ipaddr(v: &str) -> Result<std::net::IpAddr> {
  use std::net::{Ipv4Addr, Ipv6Addr};
  match v.parse::<Ipv4Addr>() {
    Ok(addr) => Ok(addr.into()),
    Err(_) => match v.parse::<Ipv6Addr>() {
      Ok(addr) => Ok(addr.into()),
      Err(_) => Err(anyhow::Error::msg(
        "Could not parse input as ipv4 or ipv6 address",
      )),
    },
  }
}

pub fn parse_port(v: &str) -> Result<u16> {
  v.trim()
    .parse::<u16>()
    .with_context(|| format!("{:?} is not a valid port", v))
}

/// Parses a whole number of milliseconds, as used by every interval setting
pub fn parse_millis(v: &str) -> Result<Duration> {
  let millis = v
    .trim()
    .parse::<u64>()
    .with_context(|| format!("{:?} is not a whole number of milliseconds", v))?;
  Ok(Duration::from_millis(millis))
}

/// Like [parse_millis], but rejects zero
pub fn parse_interval_millis(v: &str) -> Result<Duration> {
  let duration = parse_millis(v)?;
  if duration.is_zero() {
    return Err(AnyErr::msg("Interval must be greater than zero"));
  }
  Ok(duration)
}

pub fn parse_transport_mode(v: &str) -> Result<TransportMode> {
  v.parse::<TransportMode>()
}

pub fn parse_bool(v: &str) -> Result<bool> {
  match v.trim().to_ascii_lowercase().as_str() {
    "1" | "true" | "yes" | "on" => Ok(true),
    "0" | "false" | "no" | "off" | "" => Ok(false),
    other => Err(AnyErr::msg(format!("{:?} is not a boolean", other))),
  }
}

/// Parses a URL and checks that its scheme is one of `schemes`
pub fn parse_url_with_scheme(v: &str, schemes: &[&str]) -> Result<Url> {
  let url = Url::parse(v.trim()).with_context(|| format!("{:?} is not a valid URL", v))?;
  if !schemes.contains(&url.scheme()) {
    return Err(AnyErr::msg(format!(
      "URL scheme must be one of {:?}, found {:?}",
      schemes,
      url.scheme()
    )));
  }
  Ok(url)
}

pub fn parse_http_url(v: &str) -> Result<Url> {
  parse_url_with_scheme(v, &["http", "https"])
}

/// Accepts any URL a relay agent can dial, in either transport mode
pub fn parse_relay_url(v: &str) -> Result<Url> {
  parse_url_with_scheme(v, &["ws", "wss", "http", "https"])
}

pub fn validate_ipaddr(v: &str) -> Result<(), String> {
  parse_ipaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_port(v: &str) -> Result<(), String> {
  parse_port(v).map(|_| ()).map_err(|e| format!("{:#}", e))
}

pub fn validate_millis(v: &str) -> Result<(), String> {
  parse_millis(v).map(|_| ()).map_err(|e| format!("{:#}", e))
}

pub fn validate_interval_millis(v: &str) -> Result<(), String> {
  parse_interval_millis(v).map(|_| ()).map_err(|e| format!("{:#}", e))
}

pub fn validate_transport_mode(v: &str) -> Result<(), String> {
  parse_transport_mode(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_bool(v: &str) -> Result<(), String> {
  parse_bool(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_http_url(v: &str) -> Result<(), String> {
  parse_http_url(v).map(|_| ()).map_err(|e| format!("{:#}", e))
}

pub fn validate_relay_url(v: &str) -> Result<(), String> {
  parse_relay_url(v).map(|_| ()).map_err(|e| format!("{:#}", e))
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;

  #[test]
  fn durations_are_milliseconds() {
    assert_eq!(parse_millis("1500").unwrap(), Duration::from_millis(1500));
    assert_eq!(parse_millis("0").unwrap(), Duration::ZERO);
    assert!(parse_interval_millis("0").is_err());
    assert!(validate_millis("1.5s").is_err());
  }

  #[test]
  fn urls_must_use_expected_schemes() {
    assert!(parse_relay_url("wss://relay.example/ws").is_ok());
    assert!(parse_relay_url("https://relay.example").is_ok());
    assert!(parse_http_url("ws://relay.example/ws").is_err());
    assert!(validate_http_url("not a url").is_err());
  }

  #[test]
  fn addresses_and_flags() {
    assert!(parse_ipaddr("0.0.0.0").is_ok());
    assert!(parse_ipaddr("::").is_ok());
    assert!(validate_ipaddr("localhost:").is_err());
    assert_eq!(parse_port("3000").unwrap(), 3000);
    assert!(parse_port("70000").is_err());
    assert!(parse_bool("TRUE").unwrap());
    assert!(!parse_bool("off").unwrap());
    assert!(validate_bool("maybe").is_err());
  }
}

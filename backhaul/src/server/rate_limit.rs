// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Per-address rate limiting of the public proxy path.

use std::{
  net::{IpAddr, Ipv4Addr},
  num::NonZeroU32,
  time::Duration,
};

use governor::{clock::Clock, DefaultKeyedRateLimiter, Quota, RateLimiter};

use super::error::ApiError;

pub struct ProxyRateLimiter {
  limiter: Option<DefaultKeyedRateLimiter<IpAddr>>,
}

impl ProxyRateLimiter {
  /// Allows `max` requests per `window` for each address; `max == 0` disables limiting
  pub fn new(window: Duration, max: u32) -> Self {
    let limiter = NonZeroU32::new(max).and_then(|burst| {
      let period = window.checked_div(max)?;
      let quota = Quota::with_period(period)?.allow_burst(burst);
      Some(RateLimiter::keyed(quota))
    });
    if limiter.is_none() {
      tracing::debug!("Rate limiting of the proxy path is disabled");
    }
    Self { limiter }
  }

  /// Callers without a known address share one bucket
  pub fn check(&self, client: Option<IpAddr>) -> Result<(), ApiError> {
    let limiter = match self.limiter.as_ref() {
      Some(limiter) => limiter,
      None => return Ok(()),
    };
    let key = client.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    limiter.check_key(&key).map_err(|not_until| {
      let wait = not_until.wait_time_from(limiter_clock_now());
      tracing::debug!(client = %key, ?wait, "Rate limit exceeded");
      ApiError::RateLimited {
        retry_after_secs: wait.as_secs().max(1),
      }
    })
  }

  /// Drops state for addresses whose buckets have fully refilled
  pub fn retain_recent(&self) {
    if let Some(limiter) = self.limiter.as_ref() {
      limiter.retain_recent();
    }
  }
}

fn limiter_clock_now() -> governor::clock::QuantaInstant {
  governor::clock::DefaultClock::default().now()
}

#[cfg(test)]
mod tests {
  use std::{
    net::{IpAddr, Ipv4Addr},
    time::Duration,
  };

  use super::ProxyRateLimiter;
  use crate::server::error::ApiError;

  #[test]
  fn limits_each_address_separately() {
    let limiter = ProxyRateLimiter::new(Duration::from_secs(60), 2);
    let a = Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
    let b = Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
    assert!(limiter.check(a).is_ok());
    assert!(limiter.check(a).is_ok());
    assert!(matches!(limiter.check(a), Err(ApiError::RateLimited { .. })));
    assert!(limiter.check(b).is_ok());
  }

  #[test]
  fn zero_max_disables_limiting() {
    let limiter = ProxyRateLimiter::new(Duration::from_secs(60), 0);
    for _ in 0..1000 {
      assert!(limiter.check(None).is_ok());
    }
  }
}

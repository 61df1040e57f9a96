// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Weft proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// QUIC server address client libraries connect to
    pub bind_addr: SocketAddr,
    /// Timeout for proxy-initiated requests that expect a prompt reply
    pub request_timeout: Duration,
    /// How long `Terminate` waits for in-flight requests to drain
    pub terminate_grace: Duration,
    /// How long a task waits for a worker on its task queue
    pub worker_wait: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7933)),
            request_timeout: Duration::from_millis(30_000),
            terminate_grace: Duration::from_millis(5_000),
            worker_wait: Duration::from_millis(60_000),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `WEFT_PROXY_BIND`: Bind IP address (default: 0.0.0.0)
    /// - `WEFT_PROXY_PORT`: QUIC server port (default: 7933)
    /// - `WEFT_REQUEST_TIMEOUT_MS`: Proxy-initiated request timeout (default: 30000)
    /// - `WEFT_TERMINATE_GRACE_MS`: Drain period on terminate (default: 5000)
    /// - `WEFT_WORKER_WAIT_MS`: Max wait for a worker to appear (default: 60000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_ip: IpAddr = std::env::var("WEFT_PROXY_BIND")
            .unwrap_or_else(|_| Ipv4Addr::UNSPECIFIED.to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("WEFT_PROXY_BIND", "must be an IP address"))?;

        let port: u16 = std::env::var("WEFT_PROXY_PORT")
            .unwrap_or_else(|_| "7933".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("WEFT_PROXY_PORT", "must be a valid port number"))?;

        Ok(Self {
            bind_addr: SocketAddr::new(bind_ip, port),
            request_timeout: millis_var("WEFT_REQUEST_TIMEOUT_MS", 30_000)?,
            terminate_grace: millis_var("WEFT_TERMINATE_GRACE_MS", 5_000)?,
            worker_wait: millis_var("WEFT_WORKER_WAIT_MS", 60_000)?,
        })
    }

    /// Configuration for a proxy bound to localhost on the given port.
    pub fn localhost(port: u16) -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            ..Default::default()
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    pub fn with_worker_wait(mut self, wait: Duration) -> Self {
        self.worker_wait = wait;
        self
    }
}

fn millis_var(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::Invalid(key, "must be a non-negative integer (milliseconds)")),
        Err(_) => Ok(Duration::from_millis(default)),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

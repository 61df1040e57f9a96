// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client configuration for connecting to the weft proxy.

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{ClientError, Result};

const DEFAULT_PROXY_ADDR: ([u8; 4], u16) = ([127, 0, 0, 1], 7933);

/// Client configuration for connecting to the weft proxy.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Proxy address (default: "127.0.0.1:7933")
    pub proxy_addr: SocketAddr,
    /// Server name for TLS verification (default: "localhost")
    pub server_name: String,
    /// Skip TLS certificate verification (default: false, use true for dev)
    pub skip_cert_verification: bool,
    /// Connection timeout in milliseconds (default: 10_000)
    pub connect_timeout_ms: u64,
    /// Request timeout in milliseconds (default: 30_000)
    pub request_timeout_ms: u64,
    /// Heartbeat interval in milliseconds (default: 1_000).
    /// Set to 0 to disable heartbeats.
    pub heartbeat_interval_ms: u64,
    /// How long heartbeats may fail before the client gives up on the
    /// proxy and closes the session (default: 60_000)
    pub heartbeat_deadline_ms: u64,
    /// Identity reported to the proxy (default: none)
    pub identity: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            proxy_addr: SocketAddr::from(DEFAULT_PROXY_ADDR),
            server_name: "localhost".to_string(),
            skip_cert_verification: false,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            heartbeat_interval_ms: 1_000,
            heartbeat_deadline_ms: 60_000,
            identity: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables.
    ///
    /// # Optional Environment Variables
    /// - `WEFT_PROXY_ADDR` - Proxy address (default: "127.0.0.1:7933")
    /// - `WEFT_SERVER_NAME` - Server name for TLS (default: "localhost")
    /// - `WEFT_SKIP_CERT_VERIFICATION` - Skip TLS verification (default: false)
    /// - `WEFT_CONNECT_TIMEOUT_MS` - Connection timeout (default: 10000)
    /// - `WEFT_REQUEST_TIMEOUT_MS` - Request timeout (default: 30000)
    /// - `WEFT_HEARTBEAT_INTERVAL_MS` - Heartbeat interval (default: 1000, 0 to disable)
    /// - `WEFT_HEARTBEAT_DEADLINE_MS` - Heartbeat failure deadline (default: 60000)
    /// - `WEFT_IDENTITY` - Identity reported to the proxy
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let proxy_addr = match env::var("WEFT_PROXY_ADDR") {
            Ok(raw) => raw
                .parse()
                .map_err(|e| ClientError::Config(format!("invalid WEFT_PROXY_ADDR: {}", e)))?,
            Err(_) => defaults.proxy_addr,
        };

        let server_name = env::var("WEFT_SERVER_NAME").unwrap_or(defaults.server_name);

        let skip_cert_verification = env::var("WEFT_SKIP_CERT_VERIFICATION")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Ok(Self {
            proxy_addr,
            server_name,
            skip_cert_verification,
            connect_timeout_ms: millis_var("WEFT_CONNECT_TIMEOUT_MS", defaults.connect_timeout_ms)?,
            request_timeout_ms: millis_var("WEFT_REQUEST_TIMEOUT_MS", defaults.request_timeout_ms)?,
            heartbeat_interval_ms: millis_var(
                "WEFT_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval_ms,
            )?,
            heartbeat_deadline_ms: millis_var(
                "WEFT_HEARTBEAT_DEADLINE_MS",
                defaults.heartbeat_deadline_ms,
            )?,
            identity: env::var("WEFT_IDENTITY").ok().filter(|v| !v.is_empty()),
        })
    }

    /// Create a configuration for local development.
    ///
    /// Connects to `127.0.0.1:<port>` and skips TLS certificate verification.
    pub fn localhost(port: u16) -> Self {
        Self {
            proxy_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            skip_cert_verification: true,
            ..Default::default()
        }
    }

    /// Set the proxy address.
    pub fn with_proxy_addr(mut self, addr: SocketAddr) -> Self {
        self.proxy_addr = addr;
        self
    }

    /// Set the server name for TLS verification.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    /// Skip TLS certificate verification (for development only!).
    pub fn with_skip_cert_verification(mut self, skip: bool) -> Self {
        self.skip_cert_verification = skip;
        self
    }

    pub fn with_request_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = timeout_ms;
        self
    }

    /// Set the heartbeat interval. Set to 0 to disable heartbeats.
    pub fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn with_heartbeat_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.heartbeat_deadline_ms = deadline_ms;
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn millis_var(key: &str, default: u64) -> Result<u64> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ClientError::Config(format!("invalid {}: must be milliseconds", key))),
        Err(_) => Ok(default),
    }
}

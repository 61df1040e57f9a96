// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for weft-client tests.
//!
//! Runs the proxy in-process with the memory engine and connects clients to
//! it over `tokio::io::duplex`.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use weft_client::{ClientConfig, NamespaceRegistration, WeftClient};
use weft_proxy::engine::{MemoryEngine, MemoryEngineConfig};
use weft_proxy::{ProxyConfig, ProxyState, serve_session};

/// An in-process proxy backed by the memory engine.
pub struct TestProxy {
    pub state: Arc<ProxyState>,
    pub engine: MemoryEngine,
}

impl TestProxy {
    pub fn new() -> Self {
        let engine = MemoryEngine::with_config(MemoryEngineConfig {
            worker_wait: Duration::from_secs(5),
            redispatch_backoff: Duration::from_millis(10),
            stop_grace: Duration::from_millis(200),
        });
        let config = ProxyConfig::localhost(0)
            .with_request_timeout(Duration::from_secs(5))
            .with_terminate_grace(Duration::from_millis(200));
        let state = Arc::new(ProxyState::new(Arc::new(engine.clone()), config));
        Self { state, engine }
    }

    /// Connect a client with the test configuration.
    pub async fn client(&self) -> WeftClient {
        self.client_with(test_config()).await
    }

    pub async fn client_with(&self, config: ClientConfig) -> WeftClient {
        let (client_io, proxy_io) = tokio::io::duplex(256 * 1024);

        let (proxy_read, proxy_write) = tokio::io::split(proxy_io);
        let state = self.state.clone();
        tokio::spawn(async move {
            let _ = serve_session(proxy_read, proxy_write, state).await;
        });

        let (client_read, client_write) = tokio::io::split(client_io);
        WeftClient::connect_with(client_read, client_write, config)
            .await
            .expect("client should initialize")
    }

    /// Connect a client whose default namespace is `namespace`, registering
    /// the namespace first if needed.
    pub async fn client_in(&self, namespace: &str) -> WeftClient {
        let client = self.client().await;
        // Fails when an earlier client of this proxy registered it
        let _ = client
            .register_namespace(NamespaceRegistration::new(namespace))
            .await;
        client.use_namespace(namespace).await.unwrap();
        client
    }
}

pub fn test_config() -> ClientConfig {
    ClientConfig::localhost(0)
        .with_request_timeout_ms(5_000)
        .with_heartbeat_interval_ms(100)
        .with_identity("weft-client-tests")
}

/// Poll `check` until it returns true or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

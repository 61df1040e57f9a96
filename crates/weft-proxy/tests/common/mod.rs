// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for weft-proxy tests.
//!
//! Runs proxy sessions in-process over `tokio::io::duplex` and plays the
//! client library side with scripted workflow and activity behaviour.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use weft_protocol::messages::{
    ActivityInvokeReply, ActivityInvokeRequest, ActivityRegisterRequest, ActivityStoppingReply,
    InitializeRequest,
    NamespaceRegisterRequest, NewWorkerReply, NewWorkerRequest, WorkflowInvokeReply,
    WorkflowInvokeRequest, WorkflowQueryInvokeReply, WorkflowRegisterRequest,
    WorkflowSideEffectInvokeReply,
};
use weft_protocol::{
    Connection, ConnectionConfig, Envelope, Message, Payload, ProtocolError, ProxyError,
    ReplyMessage, ReplyValue, Request, RequestHandler, WorkerKind, build_reply,
};
use weft_proxy::engine::{MemoryEngine, MemoryEngineConfig};
use weft_proxy::{ProxyConfig, ProxyState, serve_session};

pub type WorkflowFn = Arc<
    dyn Fn(Connection, WorkflowInvokeRequest) -> BoxFuture<'static, Result<Payload, ProxyError>>
        + Send
        + Sync,
>;

pub type ActivityFn =
    Arc<dyn Fn(ActivityInvokeRequest) -> BoxFuture<'static, ActivityInvokeReply> + Send + Sync>;

pub fn payload(text: &str) -> Payload {
    Some(Bytes::from(text.to_string()))
}

pub fn text(payload: &Payload) -> String {
    payload
        .as_ref()
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default()
}

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

    /// Open a new session with the given client behaviour.
    pub fn connect(&self, behaviour: Behaviour) -> TestClient {
        let (client_io, proxy_io) = tokio::io::duplex(256 * 1024);

        let (proxy_read, proxy_write) = tokio::io::split(proxy_io);
        let state = self.state.clone();
        tokio::spawn(async move {
            let _ = serve_session(proxy_read, proxy_write, state).await;
        });

        let (client_read, client_write) = tokio::io::split(client_io);
        let (connection, driver) = Connection::new(
            client_read,
            client_write,
            ConnectionConfig {
                role: "client",
                request_timeout: Duration::from_secs(10),
            },
        );
        let handler = Arc::new(ScriptedClient {
            connection: connection.clone(),
            behaviour,
            invocations: Mutex::new(Vec::new()),
            activity_invocations: Mutex::new(Vec::new()),
            stopping: Mutex::new(Vec::new()),
            side_effects: Mutex::new(Vec::new()),
        });
        let driver_handler = handler.clone();
        tokio::spawn(async move {
            let _ = driver.run(driver_handler).await;
        });

        TestClient {
            connection,
            handler,
        }
    }
}

/// How the scripted client answers proxy-initiated requests.
#[derive(Clone, Default)]
pub struct Behaviour {
    pub workflow: Option<WorkflowFn>,
    pub activity: Option<ActivityFn>,
}

impl Behaviour {
    pub fn workflow<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Connection, WorkflowInvokeRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Payload, ProxyError>> + Send + 'static,
    {
        self.workflow = Some(Arc::new(move |conn, req| Box::pin(f(conn, req))));
        self
    }

    pub fn activity<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ActivityInvokeRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ActivityInvokeReply> + Send + 'static,
    {
        self.activity = Some(Arc::new(move |req| Box::pin(f(req))));
        self
    }
}

pub struct ScriptedClient {
    connection: Connection,
    behaviour: Behaviour,
    pub invocations: Mutex<Vec<WorkflowInvokeRequest>>,
    pub activity_invocations: Mutex<Vec<ActivityInvokeRequest>>,
    pub stopping: Mutex<Vec<i64>>,
    pub side_effects: Mutex<Vec<u64>>,
}

#[async_trait]
impl RequestHandler for ScriptedClient {
    async fn handle(&self, _request_id: u64, request: Request) -> Result<Envelope, ProtocolError> {
        match request {
            Request::WorkflowInvoke(req) => {
                self.invocations.lock().unwrap().push(req.clone());
                let reply = match &self.behaviour.workflow {
                    Some(workflow) => match workflow(self.connection.clone(), req).await {
                        Ok(result) => WorkflowInvokeReply {
                            result,
                            error: None,
                        },
                        Err(err) => WorkflowInvokeReply {
                            result: None,
                            error: Some(err),
                        },
                    },
                    None => WorkflowInvokeReply {
                        result: None,
                        error: Some(ProxyError::generic("no workflow behaviour")),
                    },
                };
                Ok(reply.into_envelope())
            }
            Request::ActivityInvoke(req) => {
                self.activity_invocations.lock().unwrap().push(req.clone());
                let reply = match &self.behaviour.activity {
                    Some(activity) => activity(req).await,
                    None => ActivityInvokeReply {
                        error: Some(ProxyError::generic("no activity behaviour")),
                        ..Default::default()
                    },
                };
                Ok(reply.into_envelope())
            }
            Request::WorkflowQueryInvoke(req) => Ok(WorkflowQueryInvokeReply {
                result: payload(&format!("{}:{}", req.query_name, text(&req.args))),
                error: None,
            }
            .into_envelope()),
            Request::WorkflowSideEffectInvoke(req) => {
                self.side_effects.lock().unwrap().push(req.seq);
                Ok(WorkflowSideEffectInvokeReply {
                    result: payload(&format!("side-effect-{}", req.seq)),
                    error: None,
                }
                .into_envelope())
            }
            Request::ActivityStopping(req) => {
                self.stopping.lock().unwrap().push(req.context_id);
                Ok(ActivityStoppingReply::default().into_envelope())
            }
            other => build_reply(
                other.kind(),
                Some(ProxyError::generic("unexpected request")),
                ReplyValue::Empty,
            ),
        }
    }
}

/// Client side of one session.
pub struct TestClient {
    pub connection: Connection,
    pub handler: Arc<ScriptedClient>,
}

impl TestClient {
    pub async fn initialize(&self) -> i64 {
        let reply = self
            .connection
            .request(InitializeRequest {
                library_address: "127.0.0.1".to_string(),
                library_port: 0,
                identity: Some("test-client".to_string()),
            })
            .await
            .expect("initialize request")
            .into_result()
            .expect("initialize reply");
        reply.client_id
    }

    pub async fn register_namespace(&self, name: &str) {
        self.connection
            .request(NamespaceRegisterRequest {
                name: name.to_string(),
                description: None,
                owner_email: None,
                retention_days: 3,
            })
            .await
            .expect("namespace register request")
            .into_result()
            .expect("namespace register reply");
    }

    pub async fn new_worker(&self, namespace: &str, task_queue: &str, kind: WorkerKind) -> NewWorkerReply {
        self.connection
            .request(NewWorkerRequest {
                namespace: namespace.to_string(),
                task_queue: task_queue.to_string(),
                worker_kind: kind,
            })
            .await
            .expect("new worker request")
    }

    /// Register a workflow type and start a workflow worker for it.
    pub async fn serve_workflows(&self, namespace: &str, task_queue: &str, workflow_type: &str) {
        self.connection
            .request(WorkflowRegisterRequest {
                workflow_type: workflow_type.to_string(),
            })
            .await
            .expect("workflow register request")
            .into_result()
            .expect("workflow register reply");
        self.new_worker(namespace, task_queue, WorkerKind::Workflow)
            .await
            .into_result()
            .expect("workflow worker");
    }

    /// Register an activity type and start an activity worker for it.
    pub async fn serve_activities(&self, namespace: &str, task_queue: &str, activity_type: &str) {
        self.connection
            .request(ActivityRegisterRequest {
                activity_type: activity_type.to_string(),
            })
            .await
            .expect("activity register request")
            .into_result()
            .expect("activity register reply");
        self.new_worker(namespace, task_queue, WorkerKind::Activity)
            .await
            .into_result()
            .expect("activity worker");
    }

    pub fn invocations(&self) -> Vec<WorkflowInvokeRequest> {
        self.handler.invocations.lock().unwrap().clone()
    }

    pub fn side_effects(&self) -> Vec<u64> {
        self.handler.side_effects.lock().unwrap().clone()
    }

    /// Wait until the proxy has invoked at least `count` workflows on this client.
    pub async fn wait_for_invocations(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.handler.invocations.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("workflow was not invoked in time");
    }

    pub fn activity_invocations(&self) -> Vec<ActivityInvokeRequest> {
        self.handler.activity_invocations.lock().unwrap().clone()
    }
}

//! Shared test doubles
//!
//! `MockConnector` stands in for the websocket: every accepted connection hands the test
//! a `MockPeer` that plays the TrueNAS side of the conversation.

#![allow(dead_code)]

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use truenas_session::config::SessionConfig;
use truenas_session::error::{Result, SessionError};
use truenas_session::truenas::codec::{self, Frame};
use truenas_session::truenas::transport::{Connector, Transport};
use truenas_session::truenas::types::{RequestId, RpcError};
use truenas_session::truenas::{ConnectionState, StateChange, TrueNasSession};

pub const API_KEY: &str = "test-key";

/// Outcome of one connection attempt
#[derive(Debug, Clone, Copy)]
pub enum Plan {
    Refuse,
    Accept,
    /// Accept, but the transport's close never completes
    AcceptStuckClose,
    /// The connect call never returns
    Stall,
}

/// Connector whose attempts follow a plan; attempts past the plan are accepted
pub struct MockConnector {
    plan: Mutex<VecDeque<Plan>>,
    attempts: AtomicUsize,
    peers: mpsc::UnboundedSender<MockPeer>,
}

impl MockConnector {
    pub fn new(plan: Vec<Plan>) -> (Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            plan: Mutex::new(plan.into()),
            attempts: AtomicUsize::new(0),
            peers,
        });
        (connector, rx)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let step = self.plan.lock().unwrap().pop_front().unwrap_or(Plan::Accept);

        match step {
            Plan::Refuse => Err(SessionError::ConnectionLost(
                "connection refused".to_string(),
            )),
            Plan::Stall => std::future::pending().await,
            Plan::Accept | Plan::AcceptStuckClose => {
                let (outgoing, from_client) = mpsc::unbounded_channel();
                let (to_client, incoming) = mpsc::unbounded_channel();
                let _ = self.peers.send(MockPeer {
                    from_client,
                    to_client: Some(to_client),
                });
                Ok(Box::new(MockTransport {
                    outgoing,
                    incoming,
                    close_hangs: matches!(step, Plan::AcceptStuckClose),
                }))
            }
        }
    }
}

struct MockTransport {
    outgoing: mpsc::UnboundedSender<String>,
    incoming: mpsc::UnboundedReceiver<Result<String>>,
    close_hangs: bool,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        self.outgoing
            .send(text)
            .map_err(|_| SessionError::ConnectionLost("peer went away".to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        self.incoming.recv().await
    }

    async fn close(&mut self) {
        if self.close_hangs {
            std::future::pending::<()>().await;
        }
        self.incoming.close();
    }
}

/// Server side of one accepted connection. Dropping it closes the connection.
pub struct MockPeer {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: Option<mpsc::UnboundedSender<Result<String>>>,
}

impl MockPeer {
    /// Next request the session sent, as (id, method, params)
    pub async fn next_request(&mut self) -> (RequestId, String, Value) {
        let text = timeout(Duration::from_secs(3600), self.from_client.recv())
            .await
            .expect("timed out waiting for a request")
            .expect("session closed the connection");

        match codec::decode(&text) {
            Frame::Request { id, method, params } => (id, method, params),
            other => panic!("expected a request, got {:?}", other),
        }
    }

    pub fn reply(&self, id: &RequestId, result: Value) {
        self.send_raw(codec::encode_result(id, &result).unwrap());
    }

    pub fn reply_error(&self, id: &RequestId, code: i64, message: &str, data: Option<Value>) {
        let error = RpcError {
            code,
            message: message.to_string(),
            data,
        };
        self.send_raw(codec::encode_error(id, &error).unwrap());
    }

    pub fn notify(&self, method: &str, params: Value) {
        self.send_raw(codec::encode_notification(method, &params).unwrap());
    }

    pub fn send_raw(&self, text: impl Into<String>) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(Ok(text.into()));
        }
    }

    /// Deliver a transport-level error instead of a frame
    pub fn send_error(&self, error: SessionError) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(Err(error));
        }
    }

    pub async fn accept_login(&mut self) {
        let (id, method, params) = self.next_request().await;
        assert_eq!(method, "auth.login_with_api_key");
        assert_eq!(params, json!([API_KEY]));
        self.reply(&id, json!(true));
    }

    pub async fn reject_login(&mut self) {
        let (id, method, _) = self.next_request().await;
        assert_eq!(method, "auth.login_with_api_key");
        self.reply(&id, json!(false));
    }

    /// Answer the login with a JSON-RPC error instead of a result
    pub async fn fail_login(&mut self) {
        let (id, method, _) = self.next_request().await;
        assert_eq!(method, "auth.login_with_api_key");
        self.reply_error(&id, 13, "Invalid API key", Some(json!({"errname": "EACCES"})));
    }

    /// Answer one expected request with `result`
    pub async fn expect_call(&mut self, expected: &str, result: Value) -> Value {
        let (id, method, params) = self.next_request().await;
        assert_eq!(method, expected);
        self.reply(&id, result);
        params
    }
}

/// Session settings for tests: no heartbeat, no jitter
pub fn test_config() -> SessionConfig {
    SessionConfig {
        heartbeat_interval_secs: 0,
        retry_jitter: false,
        ..SessionConfig::default()
    }
}

pub fn start_session(
    plan: Vec<Plan>,
    config: SessionConfig,
) -> (
    TrueNasSession,
    Arc<MockConnector>,
    mpsc::UnboundedReceiver<MockPeer>,
) {
    let (connector, peers) = MockConnector::new(plan);
    let session = TrueNasSession::start_with_connector(
        connector.clone(),
        SecretString::from(API_KEY),
        config,
    )
    .expect("valid session config");
    (session, connector, peers)
}

/// Start a session and bring it to Connected over the first accepted peer
pub async fn connected_session(
    config: SessionConfig,
) -> (TrueNasSession, MockPeer, mpsc::UnboundedReceiver<MockPeer>) {
    let (session, _connector, mut peers) = start_session(Vec::new(), config);
    let mut peer = next_peer(&mut peers).await;
    peer.accept_login().await;
    wait_for_state(&session, ConnectionState::Connected).await;
    (session, peer, peers)
}

pub async fn next_peer(peers: &mut mpsc::UnboundedReceiver<MockPeer>) -> MockPeer {
    timeout(Duration::from_secs(3600), peers.recv())
        .await
        .expect("timed out waiting for a connection attempt")
        .expect("connector dropped")
}

pub async fn wait_for_state(session: &TrueNasSession, wanted: ConnectionState) {
    let mut state = session.watch_state();
    timeout(Duration::from_secs(3600), async {
        loop {
            if *state.borrow_and_update() == wanted {
                return;
            }
            state.changed().await.expect("state channel closed");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", wanted));
}

/// Collect every transition the session reports
pub fn record_transitions(session: &TrueNasSession) -> Arc<Mutex<Vec<StateChange>>> {
    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = changes.clone();
    session.on_state_change(move |change| sink.lock().unwrap().push(change.clone()));
    changes
}

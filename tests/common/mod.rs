#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use ptygate::api::{router, AppState};
use ptygate::audit::{AuditEntry, Auditor, MemoryAuditSink};
use ptygate::auth::TokenGate;
use ptygate::connection::ConnectionConfig;
use ptygate::hub::Hub;
use ptygate::pty::{PtyError, PtyWriter};

pub const SECRET: &str = "integration-secret";

pub type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyCall {
    Write(String, Vec<u8>),
    Resize(String, u16, u16),
    Kill(String),
}

/// `PtyWriter` that only records what it was asked to do.
#[derive(Default)]
pub struct RecordingPty {
    calls: Mutex<Vec<PtyCall>>,
}

impl RecordingPty {
    pub fn calls(&self) -> Vec<PtyCall> {
        self.calls.lock().clone()
    }
}

impl PtyWriter for RecordingPty {
    fn write_pty(&self, session_id: &str, data: &[u8]) -> Result<(), PtyError> {
        self.calls.lock().push(PtyCall::Write(session_id.into(), data.to_vec()));
        Ok(())
    }
    fn resize_pty(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.calls.lock().push(PtyCall::Resize(session_id.into(), cols, rows));
        Ok(())
    }
    fn kill_pty(&self, session_id: &str) -> Result<(), PtyError> {
        self.calls.lock().push(PtyCall::Kill(session_id.into()));
        Ok(())
    }
}

/// A gateway listening on an ephemeral loopback port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub hub: Hub,
    pub pty: Arc<RecordingPty>,
    pub audit: MemoryAuditSink,
    pub gate: TokenGate,
    pub shutdown: CancellationToken,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(ConnectionConfig::default()).await
    }

    pub async fn start_with(connection: ConnectionConfig) -> Self {
        let hub = Hub::spawn_with_capacity(connection.outbound_capacity);
        let pty = Arc::new(RecordingPty::default());
        let audit = MemoryAuditSink::new();
        let gate = TokenGate::new(SECRET, 1);

        let state = AppState {
            hub: hub.clone(),
            pty: Some(pty.clone()),
            gate: Some(gate.clone()),
            auditor: Auditor::with_sink(Arc::new(audit.clone())),
            connection,
            rpc: None,
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(ptygate::server::serve(
            listener,
            router(state),
            None,
            shutdown.clone(),
        ));

        Self {
            addr,
            hub,
            pty,
            audit,
            gate,
            shutdown,
        }
    }

    pub fn token(&self, user_id: &str) -> String {
        self.gate.issue(user_id).unwrap()
    }

    /// Open `/ws?id=<session_id>` with the given raw Authorization value.
    pub async fn connect(
        &self,
        session_id: &str,
        authorization: Option<&str>,
    ) -> Result<WsClient, tokio_tungstenite::tungstenite::Error> {
        let mut request = format!("ws://{}/ws?id={}", self.addr, session_id)
            .into_client_request()
            .unwrap();
        if let Some(value) = authorization {
            request
                .headers_mut()
                .insert("authorization", HeaderValue::from_str(value).unwrap());
        }
        let (ws, _response) = tokio_tungstenite::connect_async(request).await?;
        Ok(ws)
    }

    /// Connect as `user_id` and wait until the hub has admitted the socket.
    pub async fn connect_as(&self, user_id: &str, session_id: &str) -> WsClient {
        let before = self.hub.connection_count().await;
        let token = self.token(user_id);
        let ws = self
            .connect(session_id, Some(&format!("Bearer {token}")))
            .await
            .unwrap();
        let hub = self.hub.clone();
        wait_until(|| {
            let hub = hub.clone();
            async move { hub.connection_count().await > before }
        })
        .await;
        ws
    }

    pub fn audit_entries(&self, action: &str) -> Vec<AuditEntry> {
        self.audit.with_action(action)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Poll `check` every 10ms for up to 5s.
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

//! Shared helpers for in-process tests: a scriptable tenant directory, a
//! fake SQL backend, and pgwire client plumbing.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use gatehouse_common::proto::tenant_directory_server::{TenantDirectory, TenantDirectoryServer};
use gatehouse_common::proto::{
    EnsurePodRequest, EnsurePodResponse, GetTenantRequest, GetTenantResponse, ListPodsRequest,
    ListPodsResponse, Pod, PodState, ReportFailureRequest, ReportFailureResponse,
    WatchPodsRequest, WatchPodsResponse,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Request, Response, Status};

use crate::admit::StartupMessage;

/// A tenant directory with scriptable failure behavior.
pub struct MockDirectory {
    pub known_tenant: u64,
    pub cluster_name: String,
    pub pods: Mutex<Vec<Pod>>,
    /// Pod sets swapped in, one per reported failure.
    pub pods_after_failure: Mutex<Vec<Vec<Pod>>>,
    /// Unary calls answered `Unavailable` before the service recovers.
    pub unavailable_before_success: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub failures_reported: Mutex<Vec<String>>,
}

impl MockDirectory {
    pub fn new(known_tenant: u64, cluster_name: &str, pods: Vec<Pod>) -> Arc<Self> {
        Arc::new(Self {
            known_tenant,
            cluster_name: cluster_name.to_string(),
            pods: Mutex::new(pods),
            pods_after_failure: Mutex::new(Vec::new()),
            unavailable_before_success: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            failures_reported: Mutex::new(Vec::new()),
        })
    }
}

type WatchStream =
    Pin<Box<dyn tokio_stream::Stream<Item = Result<WatchPodsResponse, Status>> + Send>>;

#[tonic::async_trait]
impl TenantDirectory for MockDirectory {
    async fn get_tenant(
        &self,
        request: Request<GetTenantRequest>,
    ) -> Result<Response<GetTenantResponse>, Status> {
        if self
            .unavailable_before_success
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Status::unavailable("directory overloaded"));
        }
        if request.into_inner().tenant_id != self.known_tenant {
            return Err(Status::not_found("no such tenant"));
        }
        Ok(Response::new(GetTenantResponse {
            cluster_name: self.cluster_name.clone(),
        }))
    }

    async fn list_pods(
        &self,
        _request: Request<ListPodsRequest>,
    ) -> Result<Response<ListPodsResponse>, Status> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Response::new(ListPodsResponse {
            pods: self.pods.lock().unwrap().clone(),
        }))
    }

    async fn ensure_pod(
        &self,
        _request: Request<EnsurePodRequest>,
    ) -> Result<Response<EnsurePodResponse>, Status> {
        Ok(Response::new(EnsurePodResponse {}))
    }

    async fn report_failure(
        &self,
        request: Request<ReportFailureRequest>,
    ) -> Result<Response<ReportFailureResponse>, Status> {
        self.failures_reported
            .lock()
            .unwrap()
            .push(request.into_inner().addr);
        let mut stages = self.pods_after_failure.lock().unwrap();
        if !stages.is_empty() {
            *self.pods.lock().unwrap() = stages.remove(0);
        }
        Ok(Response::new(ReportFailureResponse {}))
    }

    type WatchPodsStream = WatchStream;

    async fn watch_pods(
        &self,
        _request: Request<WatchPodsRequest>,
    ) -> Result<Response<Self::WatchPodsStream>, Status> {
        Ok(Response::new(Box::pin(tokio_stream::empty())))
    }
}

/// Serve the mock on an ephemeral port, returning its address.
pub async fn serve_mock(mock: Arc<MockDirectory>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(TenantDirectoryServer::from_arc(mock))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });
    addr.to_string()
}

pub fn running_pod(tenant_id: u64, addr: &str) -> Pod {
    Pod {
        tenant_id,
        addr: addr.to_string(),
        state: PodState::Running as i32,
    }
}

/// Reserve a port that nothing listens on.
pub fn dead_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

/// A fake SQL backend: accepts connections, records the startup message it
/// receives, answers the authentication handshake, and drains the relay
/// until the peer hangs up.
pub async fn spawn_fake_backend(auth_ok: bool) -> (String, mpsc::Receiver<StartupMessage>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (startup_tx, startup_rx) = mpsc::channel(8);

    tokio::spawn(async move {
        loop {
            let Ok((conn, _)) = listener.accept().await else {
                return;
            };
            let startup_tx = startup_tx.clone();
            tokio::spawn(async move {
                let _ = serve_backend_conn(conn, auth_ok, startup_tx).await;
            });
        }
    });

    (addr, startup_rx)
}

async fn serve_backend_conn(
    mut conn: TcpStream,
    auth_ok: bool,
    startup_tx: mpsc::Sender<StartupMessage>,
) -> std::io::Result<()> {
    let mut len_buf = [0u8; 4];
    conn.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len - 4];
    conn.read_exact(&mut payload).await?;
    if let Ok(msg) = StartupMessage::decode(&payload) {
        let _ = startup_tx.send(msg).await;
    }

    if auth_ok {
        // AuthenticationOk + ReadyForQuery(idle)
        conn.write_all(&[b'R', 0, 0, 0, 8, 0, 0, 0, 0]).await?;
        conn.write_all(&[b'Z', 0, 0, 0, 5, b'I']).await?;
        // Relay phase: discard traffic until the peer hangs up.
        let mut buf = [0u8; 1024];
        loop {
            match conn.read(&mut buf).await {
                Ok(0) | Err(_) => return Ok(()),
                Ok(_) => {}
            }
        }
    } else {
        let mut fields = Vec::new();
        fields.push(b'S');
        fields.extend_from_slice(b"FATAL");
        fields.push(0);
        fields.push(b'M');
        fields.extend_from_slice(b"password authentication failed");
        fields.push(0);
        fields.push(0);
        let mut msg = vec![b'E'];
        msg.extend_from_slice(&((4 + fields.len()) as u32).to_be_bytes());
        msg.extend_from_slice(&fields);
        conn.write_all(&msg).await?;
        Ok(())
    }
}

/// Read one typed pgwire message from the client side of a connection.
pub async fn read_client_message(conn: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; 5];
    conn.read_exact(&mut header).await.unwrap();
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let mut payload = vec![0u8; len - 4];
    conn.read_exact(&mut payload).await.unwrap();
    (header[0], payload)
}

/// Build a startup message from a parameter list.
pub fn startup_msg(params: &[(&str, &str)]) -> StartupMessage {
    StartupMessage {
        protocol_version: crate::admit::PROTOCOL_VERSION,
        parameters: params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

//! Mock local service placed behind a tunnel
//!
//! Stands in for the private service a client exposes: it echoes, answers with
//! a canned reply, or swallows input, and records what each connection sent.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::AbortHandle;

#[derive(Clone, Debug)]
pub enum TcpServiceMode {
    /// Write every received chunk straight back
    Echo,
    /// Wait for the first chunk, answer with this payload, then close
    FixedResponse(Vec<u8>),
    /// Read until EOF without answering
    Accumulate,
}

/// A finished connection and everything it sent
#[derive(Clone, Debug)]
pub struct RecordedTcpConnection {
    pub received_data: Vec<u8>,
    pub peer_addr: SocketAddr,
}

pub struct MockTcpService {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    connections: Arc<RwLock<Vec<RecordedTcpConnection>>>,
    acceptor: AbortHandle,
}

impl MockTcpService {
    pub async fn start() -> Self {
        Self::start_with_mode(TcpServiceMode::Echo).await
    }

    pub async fn start_with_mode(mode: TcpServiceMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock TCP service");
        let addr = listener.local_addr().expect("mock service address");

        let accepted = Arc::new(AtomicUsize::new(0));
        let connections = Arc::new(RwLock::new(Vec::new()));

        let task_accepted = accepted.clone();
        let task_connections = connections.clone();
        let acceptor = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        task_accepted.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(serve(stream, peer, task_connections.clone(), mode.clone()));
                    }
                    Err(e) => {
                        tracing::error!("Mock service on {} stopped accepting: {}", addr, e);
                        break;
                    }
                }
            }
        })
        .abort_handle();

        Self {
            addr,
            accepted,
            connections,
            acceptor,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Connections accepted so far, finished or not
    pub fn accepted_count(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Connections that have finished, in completion order
    pub fn get_connections(&self) -> Vec<RecordedTcpConnection> {
        self.connections.read().clone()
    }

    pub fn total_bytes_received(&self) -> usize {
        self.connections
            .read()
            .iter()
            .map(|c| c.received_data.len())
            .sum()
    }
}

impl Drop for MockTcpService {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

async fn serve(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    connections: Arc<RwLock<Vec<RecordedTcpConnection>>>,
    mode: TcpServiceMode,
) {
    let mut received_data = Vec::new();
    let mut buf = [0u8; 4096];

    match mode {
        TcpServiceMode::Echo => loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    received_data.extend_from_slice(&buf[..n]);
                    if let Err(e) = stream.write_all(&buf[..n]).await {
                        tracing::debug!("Echo write to {} failed: {}", peer_addr, e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("Echo read from {} failed: {}", peer_addr, e);
                    break;
                }
            }
        },
        TcpServiceMode::FixedResponse(response) => {
            if let Ok(n) = stream.read(&mut buf).await {
                received_data.extend_from_slice(&buf[..n]);
            }
            if let Err(e) = stream.write_all(&response).await {
                tracing::debug!("Fixed response to {} failed: {}", peer_addr, e);
            }
            let _ = stream.shutdown().await;
        }
        TcpServiceMode::Accumulate => loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => received_data.extend_from_slice(&buf[..n]),
            }
        },
    }

    connections.write().push(RecordedTcpConnection {
        received_data,
        peer_addr,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_echo_records_connection() {
        let service = MockTcpService::start().await;

        let mut stream = TcpStream::connect(service.addr()).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        drop(stream);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(service.accepted_count(), 1);
        assert_eq!(service.total_bytes_received(), 5);
    }

    #[tokio::test]
    async fn test_fixed_response_closes_after_reply() {
        let service =
            MockTcpService::start_with_mode(TcpServiceMode::FixedResponse(b"PONG".to_vec())).await;

        let mut stream = TcpStream::connect(service.addr()).await.unwrap();
        stream.write_all(b"PING").await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();

        assert_eq!(reply, b"PONG");
    }
}

//! A TCP proxy whose live connections can be cut on demand
//!
//! Clients dial the broker through the link; severing it drops every proxied
//! socket at once, which is what a network outage looks like to both ends.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::AbortHandle;

pub struct SeverableLink {
    addr: SocketAddr,
    live: Arc<Mutex<Vec<AbortHandle>>>,
    accepted: Arc<AtomicUsize>,
    acceptor: AbortHandle,
}

impl SeverableLink {
    /// Start proxying to `target` from an ephemeral loopback port
    pub async fn start(target: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind link");
        let addr = listener.local_addr().expect("link address");

        let live: Arc<Mutex<Vec<AbortHandle>>> = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));

        let task_live = live.clone();
        let task_accepted = accepted.clone();
        let acceptor = tokio::spawn(async move {
            loop {
                let (inbound, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::error!("Link accept error: {}", e);
                        break;
                    }
                };
                task_accepted.fetch_add(1, Ordering::SeqCst);
                let proxy = tokio::spawn(proxy(inbound, peer, target));
                let mut live = task_live.lock();
                live.retain(|handle| !handle.is_finished());
                live.push(proxy.abort_handle());
            }
        })
        .abort_handle();

        Self {
            addr,
            live,
            accepted,
            acceptor,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Connections proxied since the link started
    pub fn accepted_count(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Drop every live connection; new ones are still accepted
    pub fn sever(&self) {
        let handles: Vec<AbortHandle> = self.live.lock().drain(..).collect();
        tracing::debug!("Severing {} link connection(s)", handles.len());
        for handle in handles {
            handle.abort();
        }
    }
}

impl Drop for SeverableLink {
    fn drop(&mut self) {
        self.acceptor.abort();
        self.sever();
    }
}

async fn proxy(mut inbound: TcpStream, peer: SocketAddr, target: SocketAddr) {
    let mut outbound = match TcpStream::connect(target).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!("Link could not reach {} for {}: {}", target, peer, e);
            return;
        }
    };
    let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
}

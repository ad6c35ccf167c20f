//! Broker and client harnesses for end-to-end tests

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use burrow::{EstablishedTunnels, ResolvedClientConfig, TunnelConfig, TunnelOrchestrator};
use burrow_broker::{Broker, PortAllocator};
use burrow_common::transport::AccessPolicy;

use crate::certificates::TestCertificates;

pub const TEST_TOKEN: &str = "e2e-secret-token";

/// A broker serving on an ephemeral loopback port
pub struct TestBroker {
    pub control_addr: SocketAddr,
    pub certs: TestCertificates,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestBroker {
    pub async fn start() -> Self {
        Self::start_with_policy(AccessPolicy::Token(TEST_TOKEN.to_string())).await
    }

    pub async fn start_with_policy(policy: AccessPolicy) -> Self {
        let certs = TestCertificates::generate();
        let tls_config =
            burrow_common::load_server_config(&certs.broker_cert_pem, &certs.broker_key_pem)
                .expect("Failed to load broker TLS config");

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind control port");
        let control_addr = listener.local_addr().expect("control address");

        let broker = Broker::new(
            Arc::new(tls_config),
            Arc::new(policy),
            PortAllocator::new(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            Duration::from_secs(5),
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            tokio::select! {
                result = broker.run_with_listener(listener) => {
                    if let Err(e) = result {
                        tracing::error!("Test broker failed: {}", e);
                    }
                }
                _ = shutdown_rx => tracing::debug!("Test broker shutting down"),
            }
        });

        Self {
            control_addr,
            certs,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Client config trusting this broker's CA, with short timers
    pub fn client_config(&self, tunnels: Vec<TunnelConfig>) -> ResolvedClientConfig {
        self.client_config_via(self.control_addr, tunnels)
    }

    /// Like [`client_config`](Self::client_config) but dialing `addr`, e.g. a link
    pub fn client_config_via(
        &self,
        addr: SocketAddr,
        tunnels: Vec<TunnelConfig>,
    ) -> ResolvedClientConfig {
        ResolvedClientConfig {
            server_addr: addr.ip().to_string(),
            server_port: addr.port(),
            server_name: "localhost".to_string(),
            token: TEST_TOKEN.to_string(),
            ca_cert_pem: Some(self.certs.ca_cert_pem.clone()),
            keepalive_interval: Duration::from_secs(1),
            reconnect_delay: Duration::from_millis(200),
            dial_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            tunnels,
        }
    }

    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A tunnel to a local service with the broker choosing the public port
pub fn tunnel(name: &str, local_port: u16) -> TunnelConfig {
    tunnel_on(name, local_port, 0)
}

pub fn tunnel_on(name: &str, local_port: u16, remote_port: u16) -> TunnelConfig {
    TunnelConfig {
        name: name.to_string(),
        local_addr: "127.0.0.1".to_string(),
        local_port,
        remote_port,
    }
}

/// A running orchestrator; dropping it stops the client
pub struct TestClient {
    established: watch::Receiver<EstablishedTunnels>,
    task: JoinHandle<()>,
}

impl TestClient {
    pub fn start(config: ResolvedClientConfig) -> Self {
        let orchestrator =
            TunnelOrchestrator::new(config).expect("Failed to create orchestrator");
        let established = orchestrator.established();
        let task = tokio::spawn(async move { orchestrator.run().await });
        Self { established, task }
    }

    pub fn established(&self) -> watch::Receiver<EstablishedTunnels> {
        self.established.clone()
    }

    /// Wait until `name` is established and return its public port
    pub async fn port_of(&self, name: &str) -> u16 {
        wait_for_tunnel(&mut self.established(), name, Duration::from_secs(10)).await
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn wait_for_tunnel(
    established: &mut watch::Receiver<EstablishedTunnels>,
    name: &str,
    timeout: Duration,
) -> u16 {
    let ready = tokio::time::timeout(
        timeout,
        established.wait_for(|tunnels| tunnels.contains_key(name)),
    )
    .await
    .unwrap_or_else(|_| panic!("tunnel '{}' was not established in time", name))
    .expect("orchestrator dropped");
    ready[name]
}

pub async fn wait_for_tunnels_down(
    established: &mut watch::Receiver<EstablishedTunnels>,
    timeout: Duration,
) {
    tokio::time::timeout(timeout, established.wait_for(|tunnels| tunnels.is_empty()))
        .await
        .expect("tunnels were not torn down in time")
        .expect("orchestrator dropped");
}

/// A loopback port that was free a moment ago
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind a spare port");
    listener.local_addr().expect("spare address").port()
}

use std::collections::HashMap;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("port {0} is already registered")]
    PortTaken(u16),

    #[error("session is closing")]
    Closed,
}

/// A public listener owned by one session.
///
/// The accept task exits when `close` is called or when this handle is
/// dropped, which in turn closes the listening socket.
#[derive(Debug)]
pub struct ForwardListener {
    port: u16,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ForwardListener {
    pub fn new(port: u16, stop: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        Self {
            port,
            stop: Some(stop),
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting and wait until the listening socket is gone
    pub async fn close(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            if e.is_panic() {
                tracing::error!("Accept task for port {} panicked", self.port);
            }
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    listeners: HashMap<u16, ForwardListener>,
    closed: bool,
}

/// Per-session map from public port to the listener that owns it.
///
/// Membership is the single source of truth for whether a session still owns
/// a port. Every mutation happens under one lock, and no lock is held across
/// an await.
#[derive(Debug, Default)]
pub struct ForwardRegistry {
    state: Mutex<RegistryState>,
}

impl ForwardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `listener` as the owner of `port`.
    ///
    /// On failure the listener is dropped, which closes it.
    pub fn register(&self, port: u16, listener: ForwardListener) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(RegistryError::Closed);
        }
        if state.listeners.contains_key(&port) {
            return Err(RegistryError::PortTaken(port));
        }
        state.listeners.insert(port, listener);
        Ok(())
    }

    /// Remove one port, handing its listener back for closing
    pub fn release(&self, port: u16) -> Option<ForwardListener> {
        self.state.lock().listeners.remove(&port)
    }

    /// Remove every port and refuse further registrations.
    ///
    /// A second call returns nothing.
    pub fn release_all(&self) -> Vec<ForwardListener> {
        let mut state = self.state.lock();
        state.closed = true;
        state.listeners.drain().map(|(_, listener)| listener).collect()
    }

    pub fn contains(&self, port: u16) -> bool {
        self.state.lock().listeners.contains_key(&port)
    }

    /// Registered ports in ascending order
    #[cfg(test)]
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.state.lock().listeners.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub fn len(&self) -> usize {
        self.state.lock().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// A listener whose task records that it was stopped
    fn fake_listener(port: u16) -> (ForwardListener, Arc<AtomicBool>) {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let _ = stop_rx.await;
            flag.store(true, Ordering::SeqCst);
        });
        (ForwardListener::new(port, stop_tx, task), stopped)
    }

    #[tokio::test]
    async fn test_register_and_release() {
        let registry = ForwardRegistry::new();
        let (listener, stopped) = fake_listener(41000);
        registry.register(41000, listener).unwrap();
        assert!(registry.contains(41000));

        let listener = registry.release(41000).unwrap();
        assert_eq!(listener.port(), 41000);
        listener.close().await;
        assert!(stopped.load(Ordering::SeqCst));
        assert!(registry.is_empty());
        assert!(registry.release(41000).is_none());
    }

    #[tokio::test]
    async fn test_duplicate_port_is_rejected_and_original_kept() {
        let registry = ForwardRegistry::new();
        let (first, first_stopped) = fake_listener(41000);
        let (second, _) = fake_listener(41000);

        registry.register(41000, first).unwrap();
        assert_eq!(
            registry.register(41000, second),
            Err(RegistryError::PortTaken(41000))
        );
        assert_eq!(registry.ports(), vec![41000]);
        assert!(!first_stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_release_all_is_idempotent() {
        let registry = ForwardRegistry::new();
        for port in [41002, 41001] {
            let (listener, _) = fake_listener(port);
            registry.register(port, listener).unwrap();
        }
        assert_eq!(registry.ports(), vec![41001, 41002]);

        let drained = registry.release_all();
        assert_eq!(drained.len(), 2);
        for listener in drained {
            listener.close().await;
        }

        assert!(registry.release_all().is_empty());
        assert!(registry.is_empty());
        assert!(registry.is_closed());
    }

    #[tokio::test]
    async fn test_register_after_release_all_fails_and_closes_listener() {
        let registry = ForwardRegistry::new();
        registry.release_all();

        let (listener, stopped) = fake_listener(41000);
        assert_eq!(
            registry.register(41000, listener),
            Err(RegistryError::Closed)
        );
        assert!(registry.is_empty());

        // Dropping the handle stops the task
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !stopped.load(Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}

//! Graceful shutdown with in-flight request draining.
//!
//! On Ctrl+C or SIGTERM the listener stops accepting connections, requests
//! arriving on kept-alive connections are refused, and in-flight requests get
//! up to the configured timeout to finish.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Shutdown state shared between the server, the signal task and middleware.
#[derive(Clone)]
pub struct ShutdownSignal {
    is_shutting_down: Arc<AtomicBool>,
    notify: broadcast::Sender<()>,
    in_flight: Arc<AtomicUsize>,
    timeout: Duration,
}

impl ShutdownSignal {
    pub fn new(timeout: Duration) -> Self {
        let (notify, _) = broadcast::channel(1);
        Self {
            is_shutting_down: Arc::new(AtomicBool::new(false)),
            notify,
            in_flight: Arc::new(AtomicUsize::new(0)),
            timeout,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn initiate_shutdown(&self) {
        if !self.is_shutting_down.swap(true, Ordering::SeqCst) {
            let _ = self.notify.send(());
            info!(in_flight = self.in_flight_count(), "Shutdown initiated");
        }
    }

    /// Resolves once shutdown has been initiated.
    pub async fn notified(&self) {
        let mut rx = self.notify.subscribe();
        if self.is_shutting_down() {
            return;
        }
        let _ = rx.recv().await;
    }

    /// Resolves `timeout` after shutdown was initiated.
    pub async fn deadline(&self) {
        self.notified().await;
        tokio::time::sleep(self.timeout).await;
    }

    /// Track one request. `None` once shutdown has started.
    pub fn track(&self) -> Option<RequestGuard> {
        if self.is_shutting_down() {
            debug!("Rejecting new request during shutdown");
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(RequestGuard {
            counter: self.in_flight.clone(),
        })
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Decrements the in-flight counter when dropped.
pub struct RequestGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Listens for process signals and flips the shared [`ShutdownSignal`].
pub struct GracefulShutdown {
    signal: ShutdownSignal,
}

impl GracefulShutdown {
    pub fn new(timeout: Duration) -> Self {
        Self {
            signal: ShutdownSignal::new(timeout),
        }
    }

    pub fn signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    /// Wait for Ctrl+C or SIGTERM, then initiate shutdown.
    pub async fn wait_for_signal(self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
            _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
            _ = self.signal.notified() => {}
        }

        self.signal.initiate_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_track_requests() {
        let signal = ShutdownSignal::new(Duration::from_secs(5));
        assert!(!signal.is_shutting_down());

        let guard = signal.track();
        assert!(guard.is_some());
        assert_eq!(signal.in_flight_count(), 1);

        signal.initiate_shutdown();
        assert!(signal.is_shutting_down());
        assert!(signal.track().is_none());

        drop(guard);
        assert_eq!(signal.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_notified_after_initiate() {
        let signal = ShutdownSignal::new(Duration::from_secs(5));
        signal.initiate_shutdown();
        // Must not hang when shutdown already happened.
        timeout(Duration::from_secs(1), signal.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_notified_wakes_waiter() {
        let signal = ShutdownSignal::new(Duration::from_secs(5));
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.notified().await })
        };
        tokio::task::yield_now().await;
        signal.initiate_shutdown();
        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }
}

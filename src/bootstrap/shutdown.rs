use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

/// Shutdown state machine
///
/// States:
/// 1. Running - normal operation
/// 2. Draining - no new passes start, in-flight passes finish
/// 3. Terminated - everything stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Terminated,
}

/// Coordinates graceful shutdown with a bounded drain period
pub struct Shutdown {
    /// Current state
    state: watch::Sender<ShutdownState>,

    /// Drain period duration
    drain_timeout: Duration,

    /// Units of work that must finish before termination
    in_flight: AtomicU64,
}

impl Shutdown {
    pub fn new(drain_timeout: Duration) -> Arc<Self> {
        let (state, _) = watch::channel(ShutdownState::Running);

        Arc::new(Self {
            state,
            drain_timeout,
            in_flight: AtomicU64::new(0),
        })
    }

    /// Get current state
    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    /// Start draining (called on SIGTERM/SIGINT)
    pub fn start_drain(&self) {
        if self.state() != ShutdownState::Running {
            return;
        }

        info!(
            drain_timeout_secs = self.drain_timeout.as_secs(),
            in_flight = self.in_flight(),
            "starting graceful shutdown drain"
        );

        let _ = self.state.send(ShutdownState::Draining);
    }

    /// Wait until in-flight work finishes or the drain period expires.
    pub async fn wait_drained(&self) {
        let deadline = Instant::now() + self.drain_timeout;
        while self.in_flight() > 0 {
            if Instant::now() >= deadline {
                warn!(in_flight = self.in_flight(), "drain period expired");
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!("all work drained");
    }

    /// Complete shutdown
    pub fn terminate(&self) {
        if self.state() == ShutdownState::Terminated {
            return;
        }

        let active = self.in_flight();
        if active > 0 {
            warn!(in_flight = active, "force terminating with work in flight");
        }

        info!("shutdown complete");
        let _ = self.state.send(ShutdownState::Terminated);
    }

    /// Register a unit of work. Refused once draining.
    pub fn work_started(&self) -> bool {
        if self.state() != ShutdownState::Running {
            return false;
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Unregister a unit of work
    pub fn work_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Check if new work may start
    pub fn is_accepting(&self) -> bool {
        self.state() == ShutdownState::Running
    }
}

/// Wait for SIGINT or SIGTERM.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_state_machine() {
        let shutdown = Shutdown::new(Duration::from_secs(30));

        assert_eq!(shutdown.state(), ShutdownState::Running);
        assert!(shutdown.is_accepting());

        assert!(shutdown.work_started());
        assert_eq!(shutdown.in_flight(), 1);

        shutdown.start_drain();
        assert_eq!(shutdown.state(), ShutdownState::Draining);
        assert!(!shutdown.is_accepting());

        // New work rejected during drain
        assert!(!shutdown.work_started());

        shutdown.work_finished();
        shutdown.terminate();
        assert_eq!(shutdown.state(), ShutdownState::Terminated);
    }

    #[tokio::test]
    async fn test_wait_drained_returns_when_idle() {
        let shutdown = Shutdown::new(Duration::from_secs(5));
        assert!(shutdown.work_started());

        let s = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            s.work_finished();
        });

        shutdown.start_drain();
        shutdown.wait_drained().await;
        assert_eq!(shutdown.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_wait_drained_gives_up_after_timeout() {
        let shutdown = Shutdown::new(Duration::from_millis(60));
        assert!(shutdown.work_started());
        shutdown.start_drain();
        shutdown.wait_drained().await;
        assert_eq!(shutdown.in_flight(), 1);
    }
}

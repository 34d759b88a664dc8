//! Process shutdown signal owned by the application.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancels a token on SIGINT or SIGTERM.
///
/// The listener task is installed at most once per `ShutdownSignal`; it exits
/// when the token is cancelled by any other means.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
    installed: AtomicBool,
}

impl ShutdownSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when a shutdown signal arrives.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancels the token as if a signal had arrived.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    /// Spawns the signal listener. Must be called inside a Tokio runtime.
    ///
    /// Returns `false` if the listener was already installed.
    pub fn install(&self) -> bool {
        if self.installed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                signal = wait_for_signal() => {
                    info!(signal, "shutdown signal received");
                    token.cancel();
                }
            }
        });
        true
    }
}

async fn wait_for_signal() -> &'static str {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "SIGINT",
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGINT");
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                "SIGTERM"
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    tokio::select! {
        name = ctrl_c => name,
        name = terminate => name,
    }
}

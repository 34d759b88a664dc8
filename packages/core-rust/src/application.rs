//! The built host: configuration, logger, metrics, dependency graph and
//! lifecycle, driven by `run`.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{error, info};

use crate::config::{ConfigWatcher, Configuration};
use crate::container::ServiceProvider;
use crate::environment::HostEnvironment;
use crate::error::HostError;
use crate::lifecycle::{HostState, Lifecycle};
use crate::logging::Logger;
use crate::metrics::Metrics;
use crate::signal::ShutdownSignal;

/// A built host. Created by [`HostBuilder::build`](crate::builder::HostBuilder::build).
pub struct Application {
    pub(crate) config: Configuration,
    pub(crate) logger: Logger,
    pub(crate) metrics: Arc<dyn Metrics>,
    pub(crate) environment: HostEnvironment,
    pub(crate) provider: Arc<ServiceProvider>,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) signal: ShutdownSignal,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) watcher: Option<ConfigWatcher>,
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("environment", &self.environment)
            .field("state", &self.lifecycle.state())
            .field("services", &self.provider)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish_non_exhaustive()
    }
}

impl Application {
    #[must_use]
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    #[must_use]
    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<dyn Metrics> {
        &self.metrics
    }

    #[must_use]
    pub fn environment(&self) -> &HostEnvironment {
        &self.environment
    }

    /// The built dependency graph.
    #[must_use]
    pub fn services(&self) -> &Arc<ServiceProvider> {
        &self.provider
    }

    #[must_use]
    pub fn state(&self) -> HostState {
        self.lifecycle.state()
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Whether the config file watcher is active.
    #[must_use]
    pub fn is_watching_config(&self) -> bool {
        self.watcher.is_some()
    }

    /// Token cancelled by SIGINT/SIGTERM once [`run`](Self::run) installed the listener.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.signal.token()
    }

    /// Runs start hooks in registration order.
    ///
    /// # Errors
    ///
    /// Returns the first failing hook; hooks after it are not started.
    pub async fn start(&self, token: &CancellationToken) -> Result<(), HostError> {
        self.lifecycle
            .start(token)
            .with_subscriber(self.logger.dispatch().clone())
            .await
            .map_err(HostError::from)
    }

    /// Stops within the configured shutdown window.
    ///
    /// # Errors
    ///
    /// Returns every stop failure; see [`stop_within`](Self::stop_within).
    pub async fn stop(&self) -> Result<(), HostError> {
        self.stop_within(self.shutdown_timeout).await
    }

    /// Runs stop hooks of started services in reverse order, sharing `window`.
    ///
    /// # Errors
    ///
    /// Returns `LifecycleError::Stop` listing failures in the order encountered.
    pub async fn stop_within(&self, window: Duration) -> Result<(), HostError> {
        let token = CancellationToken::new();
        self.lifecycle
            .stop(&token, window)
            .with_subscriber(self.logger.dispatch().clone())
            .await
            .map_err(HostError::from)
    }

    /// Installs the SIGINT/SIGTERM listener and runs until it fires.
    ///
    /// # Errors
    ///
    /// See [`run_until`](Self::run_until).
    pub async fn run(&self) -> Result<(), HostError> {
        let token = self.install_shutdown_signal();
        self.run_until(token).await
    }

    /// Installs the SIGINT/SIGTERM listener (once) and returns its token.
    pub fn install_shutdown_signal(&self) -> CancellationToken {
        self.signal.install();
        self.signal.token()
    }

    /// Starts, waits for `token` to be cancelled, then stops.
    ///
    /// A start failure stops the services that did start and returns the
    /// start error.
    ///
    /// # Errors
    ///
    /// Returns the start error, or the stop error after a clean start.
    pub async fn run_until(&self, token: CancellationToken) -> Result<(), HostError> {
        self.run_inner(token)
            .with_subscriber(self.logger.dispatch().clone())
            .await
    }

    async fn run_inner(&self, token: CancellationToken) -> Result<(), HostError> {
        if let Err(start_err) = self.start(&token).await {
            error!(error = %start_err, "host failed to start");
            if let Err(stop_err) = self.stop().await {
                error!(error = %stop_err, "stopping partially started host failed");
            }
            return Err(start_err);
        }

        info!(environment = %self.environment.name(), "host running");
        token.cancelled().await;
        info!(timeout = ?self.shutdown_timeout, "host shutting down");
        self.stop().await
    }
}

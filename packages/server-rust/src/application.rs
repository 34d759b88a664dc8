//! A built web host: the base [`Application`] plus the assembled router.

use std::time::Duration;

use axum::Router;
use hostkit_core::{Application, CancellationToken, HostError};
use tokio::net::TcpListener;
use tracing::instrument::WithSubscriber;
use tracing::{error, info, warn};

use crate::network::config::WebHostOptions;
use crate::network::server::{bind, RunningServer};

/// Created by [`WebHostBuilder::build`](crate::builder::WebHostBuilder::build).
pub struct WebApplication {
    application: Application,
    router: Router,
    options: WebHostOptions,
}

impl std::fmt::Debug for WebApplication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebApplication")
            .field("application", &self.application)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl WebApplication {
    pub(crate) fn new(application: Application, router: Router, options: WebHostOptions) -> Self {
        Self {
            application,
            router,
            options,
        }
    }

    #[must_use]
    pub fn application(&self) -> &Application {
        &self.application
    }

    /// The bound `server` section.
    #[must_use]
    pub fn options(&self) -> &WebHostOptions {
        &self.options
    }

    /// A clone of the fully layered router.
    #[must_use]
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Installs the SIGINT/SIGTERM listener and runs until it fires.
    ///
    /// # Errors
    ///
    /// See [`run_until`](Self::run_until).
    pub async fn run(&self) -> Result<(), HostError> {
        let token = self.application.install_shutdown_signal();
        self.run_until(token).await
    }

    /// Binds the configured address and runs until `token` is cancelled.
    ///
    /// A bind failure is logged; the lifecycle still runs without a listener.
    ///
    /// # Errors
    ///
    /// Returns the start error, the drain timeout, or the stop error, in
    /// that order of precedence.
    pub async fn run_until(&self, token: CancellationToken) -> Result<(), HostError> {
        let listener = match bind(&self.options)
            .with_subscriber(self.application.logger().dispatch().clone())
            .await
        {
            Ok(listener) => Some(listener),
            Err(err) => {
                self.application.logger().in_scope(|| {
                    error!(address = %self.options.address(), error = %err, "failed to bind HTTP listener");
                });
                None
            }
        };
        self.serve(listener, token).await
    }

    /// Runs on an already bound listener until `token` is cancelled.
    ///
    /// # Errors
    ///
    /// See [`run_until`](Self::run_until).
    pub async fn run_with_listener(&self, listener: TcpListener, token: CancellationToken) -> Result<(), HostError> {
        self.serve(Some(listener), token).await
    }

    async fn serve(&self, listener: Option<TcpListener>, token: CancellationToken) -> Result<(), HostError> {
        self.serve_inner(listener, token)
            .with_subscriber(self.application.logger().dispatch().clone())
            .await
    }

    async fn serve_inner(&self, listener: Option<TcpListener>, token: CancellationToken) -> Result<(), HostError> {
        let server = match listener.map(|l| RunningServer::spawn(l, self.router.clone(), &self.options)) {
            Some(Ok(server)) => Some(server),
            Some(Err(err)) => {
                error!(error = %err, "failed to start HTTP server");
                None
            }
            None => None,
        };
        let grace = self.options.shutdown_timeout();

        if let Err(start_err) = self.application.start(&token).await {
            error!(error = %start_err, "web host failed to start");
            if let Err(err) = drain(server, grace).await {
                warn!(error = %err, "draining after failed start");
            }
            if let Err(err) = self.application.stop().await {
                error!(error = %err, "stopping partially started host failed");
            }
            return Err(start_err);
        }

        info!(
            environment = %self.application.environment().name(),
            address = %self.options.address(),
            "web host running"
        );
        token.cancelled().await;
        info!(grace = ?grace, "web host shutting down");

        let drained = drain(server, grace).await;
        let stopped = self.application.stop().await;
        match (drained, stopped) {
            (Err(drain_err), Err(stop_err)) => {
                error!(error = %stop_err, "stopping host failed");
                Err(drain_err)
            }
            (Err(err), Ok(())) | (Ok(()), Err(err)) => Err(err),
            (Ok(()), Ok(())) => {
                info!("web host stopped");
                Ok(())
            }
        }
    }
}

async fn drain(server: Option<RunningServer>, grace: Duration) -> Result<(), HostError> {
    match server {
        Some(server) => server.shutdown(grace).await,
        None => Ok(()),
    }
}

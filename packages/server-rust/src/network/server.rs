//! HTTP listener lifecycle: bind, serve on a spawned task, bounded drain.
//!
//! Serving goes through `axum-server` so the drain can be given a hard
//! deadline: when it expires, connections still open are closed and the
//! shutdown reports [`HostError::DrainTimeout`].

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum_server::Handle;
use hostkit_core::HostError;
use hyper_util::rt::TokioTimer;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::config::WebHostOptions;

/// Extra time granted to the server task to unwind after a forced close.
const FORCED_CLOSE_SETTLE: Duration = Duration::from_millis(250);

/// Binds the configured `host:port`.
///
/// # Errors
///
/// Returns the I/O error when the address cannot be bound.
pub async fn bind(options: &WebHostOptions) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(options.address()).await?;
    info!(addr = %listener.local_addr()?, "TCP listener bound");
    Ok(listener)
}

/// A listener being served on its own task.
pub struct RunningServer {
    local_addr: SocketAddr,
    handle: Handle,
    task: JoinHandle<()>,
}

impl RunningServer {
    /// Starts serving `router` on `listener`.
    ///
    /// Each connection gets a header-read deadline of `idle_timeout_secs`;
    /// request body and processing bounds are router layers.
    ///
    /// # Errors
    ///
    /// Returns `HostError::Server` when the listener cannot be handed over.
    pub fn spawn(listener: TcpListener, router: Router, options: &WebHostOptions) -> Result<Self, HostError> {
        let local_addr = listener.local_addr().map_err(HostError::Server)?;
        let std_listener = listener.into_std().map_err(HostError::Server)?;
        let handle = Handle::new();

        let mut server = axum_server::from_tcp(std_listener).handle(handle.clone());
        server
            .http_builder()
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(options.idle_timeout());

        let service = router.into_make_service_with_connect_info::<SocketAddr>();
        let task = tokio::spawn(async move {
            if let Err(err) = server.serve(service).await {
                error!(addr = %local_addr, error = %err, "HTTP server failed");
            }
        });
        info!(addr = %local_addr, mode = %options.serve_mode(), "serving HTTP");

        Ok(Self {
            local_addr,
            handle,
            task,
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Open connections, including idle keep-alive ones.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.handle.connection_count()
    }

    /// Stops accepting, lets in-flight requests finish for up to `grace`,
    /// then closes whatever is left.
    ///
    /// # Errors
    ///
    /// Returns `HostError::DrainTimeout` when connections had to be closed
    /// at the deadline.
    pub async fn shutdown(self, grace: Duration) -> Result<(), HostError> {
        let Self {
            local_addr,
            handle,
            mut task,
        } = self;
        let deadline = Instant::now() + grace;
        info!(
            addr = %local_addr,
            connections = handle.connection_count(),
            grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
            "draining HTTP connections"
        );
        handle.graceful_shutdown(Some(grace));

        let finished = tokio::time::timeout_at(deadline, &mut task).await.is_ok();
        if finished && Instant::now() < deadline {
            info!(addr = %local_addr, "HTTP connections drained");
            return Ok(());
        }

        warn!(
            addr = %local_addr,
            remaining = handle.connection_count(),
            "drain deadline reached; closing remaining connections"
        );
        if !finished && tokio::time::timeout(FORCED_CLOSE_SETTLE, &mut task).await.is_err() {
            task.abort();
        }
        Err(HostError::DrainTimeout { grace })
    }
}

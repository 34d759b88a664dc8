use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// BackgroundService trait
// ---------------------------------------------------------------------------

/// A long-running component whose start and stop are driven by the host.
///
/// Services are registered with a [`ServiceCollection`](crate::container::ServiceCollection),
/// resolved when the graph is built, started in registration order and
/// stopped in reverse registration order. A service that fails to start is
/// not stopped; services started before it are.
///
/// The token passed to `start` is cancelled when the host begins shutting
/// down. The token passed to `stop` is cancelled when the shutdown window
/// has elapsed.
#[async_trait]
pub trait BackgroundService: Send + Sync + 'static {
    /// Name used in logs and lifecycle errors.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn start(&self, ctx: &CancellationToken) -> anyhow::Result<()>;

    async fn stop(&self, ctx: &CancellationToken) -> anyhow::Result<()>;
}

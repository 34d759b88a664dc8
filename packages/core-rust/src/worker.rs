//! Headless host with optional start and stop callbacks.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::application::Application;
use crate::builder::HostBuilder;
use crate::error::HostError;
use crate::lifecycle::Hook;

/// Builds a [`WorkerApplication`].
#[derive(Debug, Default)]
pub struct WorkerHostBuilder {
    host: HostBuilder,
    hook: Option<Hook>,
}

impl WorkerHostBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an already configured host builder.
    #[must_use]
    pub fn from_host(host: HostBuilder) -> Self {
        Self { host, hook: None }
    }

    /// Applies `configure` to the underlying host builder.
    #[must_use]
    pub fn configure(mut self, configure: impl FnOnce(HostBuilder) -> HostBuilder) -> Self {
        self.host = configure(self.host);
        self
    }

    /// Runs after every background service has started.
    #[must_use]
    pub fn on_start<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hook = Some(self.hook.take().unwrap_or_else(worker_hook).on_start(f));
        self
    }

    /// Runs before any background service is stopped.
    #[must_use]
    pub fn on_stop<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hook = Some(self.hook.take().unwrap_or_else(worker_hook).on_stop(f));
        self
    }

    /// # Errors
    ///
    /// See [`HostBuilder::build`].
    pub fn build(self) -> Result<WorkerApplication, HostError> {
        let host = match self.hook {
            Some(hook) => self.host.add_hook(hook),
            None => self.host,
        };
        Ok(WorkerApplication {
            app: host.build()?,
        })
    }
}

fn worker_hook() -> Hook {
    Hook::new("worker")
}

/// A built headless host.
#[derive(Debug)]
pub struct WorkerApplication {
    app: Application,
}

impl WorkerApplication {
    #[must_use]
    pub fn application(&self) -> &Application {
        &self.app
    }

    /// # Errors
    ///
    /// See [`Application::run`].
    pub async fn run(&self) -> Result<(), HostError> {
        self.app.run().await
    }

    /// # Errors
    ///
    /// See [`Application::run_until`].
    pub async fn run_until(&self, token: CancellationToken) -> Result<(), HostError> {
        self.app.run_until(token).await
    }
}

//! Ordered start/stop hooks with a shared shutdown deadline.
//!
//! State machine: Building -> Built -> Starting -> Running -> Stopping -> Stopped

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{HookFailure, LifecycleError};
use crate::service::BackgroundService;

/// Host lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    /// Sources and bindings are still being collected.
    Building,
    /// The graph is built; nothing is running.
    Built,
    /// Start hooks are running.
    Starting,
    /// Every start hook succeeded.
    Running,
    /// Stop hooks are running.
    Stopping,
    /// Terminal.
    Stopped,
}

impl HostState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            HostState::Building => "building",
            HostState::Built => "built",
            HostState::Starting => "starting",
            HostState::Running => "running",
            HostState::Stopping => "stopping",
            HostState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Hook
// ---------------------------------------------------------------------------

type HookFn = Box<dyn Fn(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A named pair of optional start and stop callbacks.
pub struct Hook {
    name: String,
    on_start: Option<HookFn>,
    on_stop: Option<HookFn>,
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("name", &self.name)
            .field("on_start", &self.on_start.is_some())
            .field("on_stop", &self.on_stop.is_some())
            .finish()
    }
}

impl Hook {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            on_start: None,
            on_stop: None,
        }
    }

    #[must_use]
    pub fn on_start<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_start = Some(Box::new(move |token| f(token).boxed()));
        self
    }

    #[must_use]
    pub fn on_stop<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_stop = Some(Box::new(move |token| f(token).boxed()));
        self
    }

    /// Wires a background service's `start` and `stop` into a hook.
    #[must_use]
    pub fn from_service(service: Arc<dyn BackgroundService>) -> Self {
        let starter = Arc::clone(&service);
        let stopper = Arc::clone(&service);
        Self::new(service.name())
            .on_start(move |token| {
                let service = Arc::clone(&starter);
                async move { service.start(&token).await }
            })
            .on_stop(move |token| {
                let service = Arc::clone(&stopper);
                async move { service.stop(&token).await }
            })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Runs hooks in order on start and in reverse on stop.
///
/// A start failure leaves the started prefix recorded, so a later `stop`
/// only stops hooks whose start succeeded. `start` and `stop` are
/// serialized; concurrent callers wait for each other.
pub struct Lifecycle {
    hooks: Vec<Hook>,
    state: ArcSwap<HostState>,
    started: AtomicUsize,
    op: tokio::sync::Mutex<()>,
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("hooks", &self.hooks)
            .field("state", &self.state())
            .field("started", &self.started.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Lifecycle {
    /// Creates a lifecycle in the `Built` state.
    #[must_use]
    pub fn new(hooks: Vec<Hook>) -> Self {
        Self {
            hooks,
            state: ArcSwap::from_pointee(HostState::Built),
            started: AtomicUsize::new(0),
            op: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn state(&self) -> HostState {
        **self.state.load()
    }

    /// Number of hooks whose start succeeded.
    #[must_use]
    pub fn started_count(&self) -> usize {
        self.started.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn hook_names(&self) -> Vec<&str> {
        self.hooks.iter().map(Hook::name).collect()
    }

    fn set_state(&self, state: HostState) {
        debug!(state = %state, "lifecycle transition");
        self.state.store(Arc::new(state));
    }

    /// Runs every start hook in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the lifecycle is `Built` with nothing
    /// started, or `Start` naming the first failing hook.
    pub async fn start(&self, token: &CancellationToken) -> Result<(), LifecycleError> {
        let _op = self.op.lock().await;
        let state = self.state();
        if state != HostState::Built || self.started_count() > 0 {
            return Err(LifecycleError::InvalidState {
                operation: "start",
                state,
            });
        }

        self.set_state(HostState::Starting);
        for (index, hook) in self.hooks.iter().enumerate() {
            if let Some(on_start) = &hook.on_start {
                debug!(hook = %hook.name, "starting");
                if let Err(source) = on_start(token.clone()).await {
                    warn!(hook = %hook.name, error = %source, "start hook failed");
                    self.set_state(HostState::Built);
                    return Err(LifecycleError::Start {
                        hook: hook.name.clone(),
                        source,
                    });
                }
            }
            self.started.store(index + 1, Ordering::Release);
        }

        self.set_state(HostState::Running);
        info!(hooks = self.hooks.len(), "host started");
        Ok(())
    }

    /// Runs the stop hooks of the started prefix in reverse order.
    ///
    /// Every hook shares one deadline, `window` from now. When it passes,
    /// `token` is cancelled and the remaining hooks are still invoked.
    /// Stopping a stopped lifecycle is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `Stop` with every failure, in the order encountered.
    pub async fn stop(&self, token: &CancellationToken, window: Duration) -> Result<(), LifecycleError> {
        let _op = self.op.lock().await;
        if self.state() == HostState::Stopped {
            return Ok(());
        }

        self.set_state(HostState::Stopping);
        let deadline = Instant::now() + window;
        let started = self.started.swap(0, Ordering::AcqRel);
        let mut failures = Vec::new();

        for hook in self.hooks[..started].iter().rev() {
            let Some(on_stop) = &hook.on_stop else {
                continue;
            };
            debug!(hook = %hook.name, "stopping");
            match tokio::time::timeout_at(deadline, on_stop(token.clone())).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    warn!(hook = %hook.name, error = %error, "stop hook failed");
                    failures.push(HookFailure {
                        hook: hook.name.clone(),
                        error,
                    });
                }
                Err(_) => {
                    warn!(hook = %hook.name, window = ?window, "stop hook timed out");
                    token.cancel();
                    failures.push(HookFailure {
                        hook: hook.name.clone(),
                        error: LifecycleError::Timeout {
                            hook: hook.name.clone(),
                            window,
                        }
                        .into(),
                    });
                }
            }
        }

        self.set_state(HostState::Stopped);
        if failures.is_empty() {
            info!("host stopped");
            Ok(())
        } else {
            Err(LifecycleError::Stop { failures })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    type Log = Arc<Mutex<Vec<String>>>;

    fn hook(name: &'static str, log: &Log, fail_start: bool, fail_stop: bool) -> Hook {
        let start_log = Arc::clone(log);
        let stop_log = Arc::clone(log);
        Hook::new(name)
            .on_start(move |_| {
                let log = Arc::clone(&start_log);
                async move {
                    if fail_start {
                        anyhow::bail!("{name} refused to start");
                    }
                    log.lock().push(format!("start:{name}"));
                    Ok(())
                }
            })
            .on_stop(move |_| {
                let log = Arc::clone(&stop_log);
                async move {
                    log.lock().push(format!("stop:{name}"));
                    if fail_stop {
                        anyhow::bail!("{name} refused to stop");
                    }
                    Ok(())
                }
            })
    }

    #[tokio::test]
    async fn starts_in_order_and_stops_in_reverse() {
        let log: Log = Arc::default();
        let lifecycle = Lifecycle::new(vec![
            hook("a", &log, false, false),
            hook("b", &log, false, false),
            hook("c", &log, false, false),
        ]);
        let token = CancellationToken::new();

        lifecycle.start(&token).await.unwrap();
        assert_eq!(lifecycle.state(), HostState::Running);
        lifecycle.stop(&token, Duration::from_secs(1)).await.unwrap();
        assert_eq!(lifecycle.state(), HostState::Stopped);

        assert_eq!(
            *log.lock(),
            vec!["start:a", "start:b", "start:c", "stop:c", "stop:b", "stop:a"]
        );
    }

    #[tokio::test]
    async fn failed_start_stops_only_the_started_prefix() {
        let log: Log = Arc::default();
        let lifecycle = Lifecycle::new(vec![
            hook("a", &log, false, false),
            hook("b", &log, false, false),
            hook("c", &log, true, false),
            hook("d", &log, false, false),
        ]);
        let token = CancellationToken::new();

        let err = lifecycle.start(&token).await.unwrap_err();
        assert!(matches!(&err, LifecycleError::Start { hook, .. } if hook == "c"));
        assert_eq!(lifecycle.state(), HostState::Built);
        assert_eq!(lifecycle.started_count(), 2);

        lifecycle.stop(&token, Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            *log.lock(),
            vec!["start:a", "start:b", "stop:b", "stop:a"]
        );
    }

    #[tokio::test]
    async fn stop_failures_are_collected_in_encounter_order() {
        let log: Log = Arc::default();
        let lifecycle = Lifecycle::new(vec![
            hook("a", &log, false, true),
            hook("b", &log, false, false),
            hook("c", &log, false, true),
        ]);
        let token = CancellationToken::new();
        lifecycle.start(&token).await.unwrap();

        let err = lifecycle.stop(&token, Duration::from_secs(1)).await.unwrap_err();
        match err {
            LifecycleError::Stop { failures } => {
                let hooks: Vec<_> = failures.iter().map(|f| f.hook.as_str()).collect();
                assert_eq!(hooks, vec!["c", "a"]);
            }
            other => panic!("expected stop error, got {other}"),
        }
        assert_eq!(lifecycle.state(), HostState::Stopped);
        assert_eq!(log.lock().len(), 6);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let log: Log = Arc::default();
        let lifecycle = Lifecycle::new(vec![hook("a", &log, false, false)]);
        let token = CancellationToken::new();
        lifecycle.start(&token).await.unwrap();
        lifecycle.stop(&token, Duration::from_secs(1)).await.unwrap();
        lifecycle.stop(&token, Duration::from_secs(1)).await.unwrap();
        assert_eq!(log.lock().iter().filter(|e| e.starts_with("stop")).count(), 1);
    }

    #[tokio::test]
    async fn start_after_stop_is_rejected() {
        let lifecycle = Lifecycle::new(Vec::new());
        let token = CancellationToken::new();
        lifecycle.start(&token).await.unwrap();
        lifecycle.stop(&token, Duration::from_secs(1)).await.unwrap();
        let err = lifecycle.start(&token).await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidState {
                operation: "start",
                state: HostState::Stopped
            }
        ));
        assert_eq!(err.to_string(), "cannot start while host is stopped");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_stop_hook_times_out_and_cancels_token() {
        let log: Log = Arc::default();
        let slow = Hook::new("slow")
            .on_start(|_| async { anyhow::Ok(()) })
            .on_stop(|token: CancellationToken| async move {
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_secs(60)) => anyhow::Ok(()),
                    () = token.cancelled() => anyhow::Ok(()),
                }
            });
        let lifecycle = Lifecycle::new(vec![hook("fast", &log, false, false), slow]);
        let token = CancellationToken::new();
        lifecycle.start(&token).await.unwrap();

        let err = lifecycle
            .stop(&token, Duration::from_secs(2))
            .await
            .unwrap_err();
        match err {
            LifecycleError::Stop { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].hook, "slow");
                assert!(failures[0].to_string().contains("shutdown window"));
            }
            other => panic!("expected stop error, got {other}"),
        }
        assert!(token.is_cancelled());
        assert_eq!(*log.lock(), vec!["start:fast", "stop:fast"]);
    }
}

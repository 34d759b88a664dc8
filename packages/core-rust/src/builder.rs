//! Host builder: collects configuration sources, bindings and background
//! services, then builds an [`Application`].

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::application::Application;
use crate::config::{ConfigBuilder, Configuration};
use crate::container::ServiceCollection;
use crate::environment::HostEnvironment;
use crate::error::{ConfigError, HostError, ValidationErrors};
use crate::lifecycle::{Hook, Lifecycle};
use crate::logging::{LogOptions, Logger};
use crate::metrics::{DefaultMetrics, Metrics};
use crate::service::BackgroundService;
use crate::signal::ShutdownSignal;

/// Default stop window in seconds, under `host.shutdown_timeout_secs`.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

type OptionsBinder =
    Box<dyn FnOnce(&Configuration, &mut ServiceCollection) -> Result<(), ConfigError> + Send>;

/// Builds an [`Application`].
///
/// Environment variables and command-line flags are enabled by default and
/// can be replaced through [`configure_app_configuration`](Self::configure_app_configuration).
pub struct HostBuilder {
    config: ConfigBuilder,
    services: ServiceCollection,
    options: Vec<OptionsBinder>,
    hooks: Vec<Hook>,
    metrics: Option<Arc<dyn Metrics>>,
    logger: Option<Logger>,
    watch_config: bool,
}

impl std::fmt::Debug for HostBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBuilder")
            .field("config", &self.config)
            .field("services", &self.services)
            .field("options", &self.options.len())
            .field("watch_config", &self.watch_config)
            .finish_non_exhaustive()
    }
}

impl Default for HostBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBuilder {
    #[must_use]
    pub fn new() -> Self {
        let mut config = ConfigBuilder::new();
        config.add_environment().add_command_line();
        Self {
            config,
            services: ServiceCollection::new(),
            options: Vec::new(),
            hooks: Vec::new(),
            metrics: None,
            logger: None,
            watch_config: true,
        }
    }

    /// Adds configuration sources and defaults.
    #[must_use]
    pub fn configure_app_configuration(mut self, configure: impl FnOnce(&mut ConfigBuilder)) -> Self {
        configure(&mut self.config);
        self
    }

    /// Adds bindings to the dependency graph.
    #[must_use]
    pub fn configure_services(mut self, configure: impl FnOnce(&mut ServiceCollection)) -> Self {
        configure(&mut self.services);
        self
    }

    /// Binds `service` and runs it as a background service.
    #[must_use]
    pub fn add_background_service<S: BackgroundService>(mut self, service: S) -> Self {
        self.services.add_background_instance(service);
        self
    }

    /// Decodes the configuration section at `key` into `T` and binds it.
    #[must_use]
    pub fn configure_options<T>(mut self, key: impl Into<String>) -> Self
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let key = key.into();
        self.options.push(Box::new(move |config, services| {
            let options: T = config.section(&key)?;
            services.add_instance(options);
            Ok(())
        }));
        self
    }

    /// Appends a hook after every background service: it starts last and stops first.
    #[must_use]
    pub fn add_hook(mut self, hook: Hook) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Whether to re-merge config files when they change. Defaults to `true`.
    #[must_use]
    pub fn watch_config(mut self, enabled: bool) -> Self {
        self.watch_config = enabled;
        self
    }

    /// Uses `logger` instead of building one from the `log` section.
    #[must_use]
    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Uses `metrics` instead of a fresh [`DefaultMetrics`].
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Composes configuration, builds the logger and the dependency graph,
    /// and wires background services into the lifecycle.
    ///
    /// # Errors
    ///
    /// Returns configuration and logger errors directly. Options decoding
    /// failures are aggregated with graph errors into `HostError::Validation`;
    /// a graph error on its own is returned as `HostError::Container`.
    pub fn build(self) -> Result<Application, HostError> {
        let HostBuilder {
            mut config,
            mut services,
            options,
            hooks,
            metrics,
            logger,
            watch_config,
        } = self;

        config
            .merge_defaults("log", LogOptions::default())
            .set_default_if_absent("app.environment", HostEnvironment::PRODUCTION)
            .set_default_if_absent("host.shutdown_timeout_secs", DEFAULT_SHUTDOWN_TIMEOUT_SECS);
        let configuration = config.build()?;

        let logger = match logger {
            Some(logger) => logger,
            None => Logger::from_options(&configuration.section::<LogOptions>("log")?)?,
        };

        logger.in_scope(|| {
            let watcher = if watch_config && !configuration.files().is_empty() {
                let watcher = configuration.watch()?;
                debug!(dirs = ?watcher.watched(), "watching config files");
                Some(watcher)
            } else {
                None
            };

            let environment = HostEnvironment::new(
                configuration
                    .get_string("app.environment")
                    .unwrap_or_else(|| HostEnvironment::PRODUCTION.to_string()),
            );
            let shutdown_timeout = Duration::from_secs(configuration.get::<u64>("host.shutdown_timeout_secs")?);
            let metrics = metrics.unwrap_or_else(|| Arc::new(DefaultMetrics::new()) as Arc<dyn Metrics>);

            services
                .add_instance(configuration.clone())
                .add_instance(logger.clone())
                .add_singleton::<dyn Metrics>(Arc::clone(&metrics))
                .add_instance(environment.clone());

            let mut issues = ValidationErrors::default();
            for bind in options {
                if let Err(e) = bind(&configuration, &mut services) {
                    issues.push(e.to_string());
                }
            }
            let provider = match services.build() {
                Ok(provider) => Arc::new(provider),
                Err(e) if issues.is_empty() => return Err(HostError::Container(e)),
                Err(e) => {
                    issues.extend(HostError::Container(e).into_validation()?);
                    return Err(HostError::Validation(issues));
                }
            };
            issues.into_result()?;

            let mut lifecycle_hooks = Vec::with_capacity(provider.background_services().len() + hooks.len() + 1);
            lifecycle_hooks.push(host_hook(&metrics));
            lifecycle_hooks.extend(
                provider
                    .background_services()
                    .iter()
                    .map(|service| Hook::from_service(Arc::clone(service))),
            );
            lifecycle_hooks.extend(hooks);

            info!(
                environment = %environment.name(),
                services = provider.len(),
                background = provider.background_services().len(),
                "host built"
            );

            Ok(Application {
                config: configuration.clone(),
                logger: logger.clone(),
                metrics,
                environment,
                provider,
                lifecycle: Lifecycle::new(lifecycle_hooks),
                signal: ShutdownSignal::new(),
                shutdown_timeout,
                watcher,
            })
        })
    }
}

fn host_hook(metrics: &Arc<dyn Metrics>) -> Hook {
    let on_start = Arc::clone(metrics);
    let on_stop = Arc::clone(metrics);
    Hook::new("host")
        .on_start(move |_| {
            on_start.increment("host.start");
            async { anyhow::Ok(()) }
        })
        .on_stop(move |_| {
            on_stop.increment("host.stop");
            async { anyhow::Ok(()) }
        })
}

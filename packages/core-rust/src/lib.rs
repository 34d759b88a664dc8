//! `Hostkit` Core — layered configuration, structured logging, dependency
//! graph, background services and the ordered host lifecycle.

pub mod application;
pub mod builder;
pub mod config;
pub mod container;
pub mod environment;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod service;
pub mod signal;
pub mod worker;

pub use application::Application;
pub use builder::HostBuilder;
pub use config::{ConfigBuilder, Configuration};
pub use container::{Resolver, ServiceCollection, ServiceProvider};
pub use environment::HostEnvironment;
pub use error::{ConfigError, ContainerError, HostError, LifecycleError, ValidationErrors};
pub use lifecycle::{Hook, HostState};
pub use logging::{LogOptions, Logger};
pub use self::metrics::{DefaultMetrics, Metrics};
pub use service::BackgroundService;
pub use tokio_util::sync::CancellationToken;
pub use worker::{WorkerApplication, WorkerHostBuilder};

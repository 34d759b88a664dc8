//! Hostkit web host: route table with dependency-injected handlers, a
//! middleware chain, and an HTTP listener with bounded graceful shutdown,
//! all driven by the `hostkit-core` lifecycle.

pub mod application;
pub mod builder;
pub mod middleware;
pub mod network;
pub mod response;
pub mod routing;

pub use application::WebApplication;
pub use builder::WebHostBuilder;
pub use middleware::{Middleware, SkipPaths};
pub use network::{ServeMode, WebHostOptions};
pub use response::{ApiError, ApiResponse};
pub use routing::{handler, HttpMethod, InjectHandler, RouteGroup};

//! Web host builder: a [`HostBuilder`] plus routes, middlewares and the
//! HTTP listener settings.

use std::path::PathBuf;
use std::sync::Arc;

use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::get;
use axum::Router;
use hostkit_core::{BackgroundService, HostBuilder, HostError, ServiceCollection, ValidationErrors};
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};
use utoipa::openapi::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::application::WebApplication;
use crate::middleware::{apply_middlewares, log_requests, recover, Middleware};
use crate::network::config::WebHostOptions;
use crate::network::handlers::health_handler;
use crate::network::layers::{build_cors_layer, build_http_layers, build_timeout_layers};
use crate::routing::{normalize_path, HttpMethod, InjectHandler, PathClaims, RouteGroup, RouteTable};

/// Path of the built-in health endpoint.
pub const HEALTH_PATH: &str = "/health";
/// Mount point of the Swagger UI.
pub const SWAGGER_PATH: &str = "/swagger";
/// Where the OpenAPI document is served.
pub const OPENAPI_PATH: &str = "/api-docs/openapi.json";

/// Builds a [`WebApplication`].
///
/// Server options given to [`configure_web_server`](Self::configure_web_server)
/// become defaults of the `server` configuration section, so config files,
/// environment variables and flags still override them.
pub struct WebHostBuilder {
    host: HostBuilder,
    server: Option<WebHostOptions>,
    issues: ValidationErrors,
    routes: RouteTable,
    middlewares: Vec<Arc<dyn Middleware>>,
    health_check: bool,
    openapi: Option<OpenApi>,
    cors: Option<Vec<String>>,
    static_files: Vec<(String, PathBuf)>,
}

impl std::fmt::Debug for WebHostBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebHostBuilder")
            .field("host", &self.host)
            .field("server", &self.server)
            .field("routes", &self.routes)
            .field("middlewares", &self.middlewares.len())
            .field("health_check", &self.health_check)
            .finish_non_exhaustive()
    }
}

impl Default for WebHostBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WebHostBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::from_host(HostBuilder::new())
    }

    #[must_use]
    pub fn from_host(host: HostBuilder) -> Self {
        Self {
            host,
            server: None,
            issues: ValidationErrors::default(),
            routes: RouteTable::new(),
            middlewares: Vec::new(),
            health_check: false,
            openapi: None,
            cors: None,
            static_files: Vec::new(),
        }
    }

    /// Applies `configure` to the underlying host builder.
    #[must_use]
    pub fn configure(mut self, configure: impl FnOnce(HostBuilder) -> HostBuilder) -> Self {
        self.host = configure(self.host);
        self
    }

    #[must_use]
    pub fn configure_services(self, configure: impl FnOnce(&mut ServiceCollection)) -> Self {
        self.configure(|host| host.configure_services(configure))
    }

    #[must_use]
    pub fn add_background_service<S: BackgroundService>(self, service: S) -> Self {
        self.configure(|host| host.add_background_service(service))
    }

    /// Sets the listener options. Problems are recorded now and returned by
    /// [`build`](Self::build).
    #[must_use]
    pub fn configure_web_server(mut self, options: WebHostOptions) -> Self {
        for issue in options.validate() {
            warn!(%issue, "invalid web server options");
            self.issues.push(issue);
        }
        self.server = Some(options);
        self
    }

    /// Appends a middleware; middlewares run in registration order.
    #[must_use]
    pub fn use_middleware<M: Middleware>(mut self, middleware: M) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Serves `GET /health`.
    #[must_use]
    pub fn use_health_check(mut self) -> Self {
        self.health_check = true;
        self
    }

    /// Serves `openapi` at `/api-docs/openapi.json` with a Swagger UI under `/swagger`.
    #[must_use]
    pub fn use_swagger(mut self, openapi: OpenApi) -> Self {
        self.openapi = Some(openapi);
        self
    }

    /// Enables CORS for `origins`; an empty list uses `server.cors_origins`.
    #[must_use]
    pub fn use_cors<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cors = Some(origins.into_iter().map(Into::into).collect());
        self
    }

    /// Serves files under `dir` at `url`.
    #[must_use]
    pub fn use_static_files(mut self, url: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        self.static_files.push((url.into(), dir.into()));
        self
    }

    #[must_use]
    pub fn map<H, T>(mut self, method: HttpMethod, path: &str, handler: H) -> Self
    where
        H: InjectHandler<T>,
        T: 'static,
    {
        self.routes.add(method, path, handler);
        self
    }

    #[must_use]
    pub fn map_get<H: InjectHandler<T>, T: 'static>(self, path: &str, handler: H) -> Self {
        self.map(HttpMethod::Get, path, handler)
    }

    #[must_use]
    pub fn map_post<H: InjectHandler<T>, T: 'static>(self, path: &str, handler: H) -> Self {
        self.map(HttpMethod::Post, path, handler)
    }

    #[must_use]
    pub fn map_put<H: InjectHandler<T>, T: 'static>(self, path: &str, handler: H) -> Self {
        self.map(HttpMethod::Put, path, handler)
    }

    #[must_use]
    pub fn map_delete<H: InjectHandler<T>, T: 'static>(self, path: &str, handler: H) -> Self {
        self.map(HttpMethod::Delete, path, handler)
    }

    #[must_use]
    pub fn map_patch<H: InjectHandler<T>, T: 'static>(self, path: &str, handler: H) -> Self {
        self.map(HttpMethod::Patch, path, handler)
    }

    /// Registers routes under a shared path prefix.
    #[must_use]
    pub fn group(mut self, prefix: &str, configure: impl FnOnce(&mut RouteGroup<'_>)) -> Self {
        configure(&mut RouteGroup::new(prefix, &mut self.routes));
        self
    }

    /// Builds the base application, binds the `server` section and every
    /// route, and assembles the router.
    ///
    /// # Errors
    ///
    /// Configuration and logger failures are returned as they are. Every
    /// other problem (options, bindings, routes) is collected into a single
    /// `HostError::Validation`.
    pub fn build(self) -> Result<WebApplication, HostError> {
        let WebHostBuilder {
            host,
            server,
            mut issues,
            routes,
            middlewares,
            health_check,
            openapi,
            cors,
            static_files,
        } = self;

        let defaults = server.unwrap_or_default();
        let application = match host
            .configure_app_configuration(|config| {
                config.merge_defaults("server", &defaults);
            })
            .build()
        {
            Ok(application) => application,
            Err(err) => {
                issues.extend(err.into_validation()?);
                return Err(HostError::Validation(issues));
            }
        };

        application.logger().clone().in_scope(|| {
            let options = match application.config().section::<WebHostOptions>("server") {
                Ok(options) => {
                    for issue in options.validate() {
                        if !issues.0.contains(&issue) {
                            issues.push(issue);
                        }
                    }
                    options
                }
                Err(err) => {
                    issues.push(err.to_string());
                    defaults
                }
            };

            let entries = routes.entries();
            let route_count = routes.len();
            let mut claims = PathClaims::new();
            let routes = match routes.build(application.services(), &mut claims) {
                Ok(router) => router,
                Err(route_issues) => {
                    issues.extend(route_issues);
                    Router::new()
                }
            };
            check_reserved_paths(
                &entries,
                health_check,
                openapi.is_some(),
                &static_files,
                &mut claims,
                &mut issues,
            );
            issues.into_result()?;

            let mut router = routes;
            if health_check {
                router = router.route(HEALTH_PATH, get(health_handler));
            }
            if let Some(openapi) = openapi {
                router = router.merge(SwaggerUi::new(SWAGGER_PATH).url(OPENAPI_PATH, openapi));
            }
            for (url, dir) in static_files {
                debug!(url = %url, dir = %dir.display(), "serving static files");
                router = if url == "/" {
                    router.fallback_service(ServeDir::new(dir))
                } else {
                    router.nest_service(url.trim_end_matches('/'), ServeDir::new(dir))
                };
            }

            let mode = options.serve_mode();
            router = apply_middlewares(router, &middlewares)
                .layer(build_timeout_layers(options.read_timeout(), options.write_timeout()))
                .layer(from_fn(recover))
                .layer(from_fn_with_state(mode, log_requests));
            if let Some(origins) = cors {
                let origins = if origins.is_empty() {
                    options.cors_origins.clone()
                } else {
                    origins
                };
                router = router.layer(build_cors_layer(&origins));
            }
            router = router.layer(build_http_layers());

            info!(
                address = %options.address(),
                mode = %mode,
                routes = route_count,
                middlewares = middlewares.len(),
                "web host built"
            );
            Ok(WebApplication::new(application, router, options))
        })
    }
}

/// Records routes that would collide with built-in endpoints or static
/// mounts, then claims the built-in and mount paths themselves. A claim
/// failure is only reported when no route collision explains it.
fn check_reserved_paths(
    entries: &[(HttpMethod, String)],
    health_check: bool,
    swagger: bool,
    static_files: &[(String, PathBuf)],
    claims: &mut PathClaims,
    issues: &mut ValidationErrors,
) {
    if health_check {
        let mut collided = false;
        for (method, path) in entries.iter().filter(|(_, path)| path == HEALTH_PATH) {
            issues.push(format!("duplicate route {method} {path}"));
            collided = true;
        }
        if let Err(err) = claims.claim(HEALTH_PATH) {
            if !collided {
                issues.push(format!("health check {HEALTH_PATH}: {err}"));
            }
        }
    }

    if swagger {
        let mut collided = false;
        for (method, path) in entries {
            if path == OPENAPI_PATH || path == SWAGGER_PATH || path.starts_with("/swagger/") {
                issues.push(format!("route {method} {path} collides with the swagger endpoints"));
                collided = true;
            }
        }
        let swagger_paths = [
            SWAGGER_PATH.to_string(),
            format!("{SWAGGER_PATH}/"),
            format!("{SWAGGER_PATH}/{{*rest}}"),
            OPENAPI_PATH.to_string(),
        ];
        for path in &swagger_paths {
            if let Err(err) = claims.claim(path) {
                if !collided {
                    issues.push(format!("swagger endpoint {path}: {err}"));
                }
                break;
            }
        }
    }

    let mut root_mounted = false;
    for (url, _) in static_files {
        if !url.starts_with('/') {
            issues.push(format!("static file url {url:?} must start with '/'"));
            continue;
        }
        let mount = normalize_path(url.trim_end_matches('/'));
        if mount.is_empty() {
            if root_mounted {
                issues.push(format!("static files mounted twice at {url}"));
            }
            root_mounted = true;
            continue;
        }
        if mount.contains(['{', '}', '*', ':']) {
            issues.push(format!("static file url {url:?} must not contain parameters"));
            continue;
        }
        let mut collided = false;
        for (method, path) in entries {
            if *path == mount || path.starts_with(&format!("{mount}/")) {
                issues.push(format!("route {method} {path} collides with static files at {url}"));
                collided = true;
            }
        }
        let claimed = [format!("{mount}/{{*rest}}"), mount.clone(), format!("{mount}/")]
            .iter()
            .try_for_each(|path| claims.claim(path));
        if let Err(err) = claimed {
            if !collided {
                issues.push(format!("static file url {url}: {err}"));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

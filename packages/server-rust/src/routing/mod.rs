//! Route table: registered `(method, path, handler)` triples, checked and
//! bound against the service graph when the web host is built.

pub mod handler;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use axum::routing::{MethodFilter, MethodRouter};
use axum::Router;
use hostkit_core::{ContainerError, ServiceProvider, ValidationErrors};

pub use handler::InjectHandler;

// ---------------------------------------------------------------------------
// HttpMethod
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }

    #[must_use]
    pub fn filter(self) -> MethodFilter {
        match self {
            Self::Get => MethodFilter::GET,
            Self::Post => MethodFilter::POST,
            Self::Put => MethodFilter::PUT,
            Self::Delete => MethodFilter::DELETE,
            Self::Patch => MethodFilter::PATCH,
            Self::Head => MethodFilter::HEAD,
            Self::Options => MethodFilter::OPTIONS,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// PathClaims
// ---------------------------------------------------------------------------

/// Paths claimed so far, checked with the same matcher the router uses so
/// that an invalid or overlapping path is reported instead of panicking
/// when the router is assembled.
#[derive(Default)]
pub struct PathClaims {
    matcher: matchit::Router<()>,
}

impl PathClaims {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims a normalized path.
    ///
    /// # Errors
    ///
    /// Returns a description when the router would refuse `path`.
    pub fn claim(&mut self, path: &str) -> Result<(), String> {
        if let Some(segment) = path
            .split('/')
            .find(|s| s.starts_with(':') || s.starts_with('*'))
        {
            return Err(format!("segment {segment:?} must be a named parameter"));
        }
        self.matcher.insert(path, ()).map_err(|e| e.to_string())
    }
}

impl fmt::Debug for PathClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathClaims").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// RouteTable
// ---------------------------------------------------------------------------

type Binder = Box<dyn FnOnce(MethodFilter, &ServiceProvider) -> Result<MethodRouter, ContainerError> + Send>;

struct Route {
    method: HttpMethod,
    path: String,
    binder: Binder,
}

/// Routes in registration order. Nothing is checked until [`RouteTable::build`].
#[derive(Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler. Paths accept `{id}` / `{*rest}` as well as
    /// `:id` / `*rest` segments.
    pub fn add<H, T>(&mut self, method: HttpMethod, path: impl Into<String>, handler: H) -> &mut Self
    where
        H: InjectHandler<T>,
        T: 'static,
    {
        self.routes.push(Route {
            method,
            path: path.into(),
            binder: Box::new(move |filter: MethodFilter, provider: &ServiceProvider| {
                handler.bind(filter, provider)
            }),
        });
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// `(method, normalized path)` of every route, in registration order.
    #[must_use]
    pub fn entries(&self) -> Vec<(HttpMethod, String)> {
        self.routes
            .iter()
            .map(|r| (r.method, normalize_path(&r.path)))
            .collect()
    }

    /// Validates and binds every route.
    ///
    /// Rejects malformed paths, duplicate `(method, path)` pairs, paths
    /// that differ only in parameter names and paths the router cannot
    /// hold next to the others in `claims`; binding failures name the
    /// route and the missing type. All issues are collected before
    /// returning.
    ///
    /// # Errors
    ///
    /// Returns every issue found.
    pub fn build(self, provider: &ServiceProvider, claims: &mut PathClaims) -> Result<Router, ValidationErrors> {
        let mut issues = ValidationErrors::default();
        let mut seen = HashSet::new();
        let mut shapes: HashMap<String, String> = HashMap::new();
        let mut by_path: BTreeMap<String, (HttpMethod, MethodRouter)> = BTreeMap::new();

        for route in self.routes {
            if !route.path.starts_with('/') {
                issues.push(format!(
                    "route {} {:?}: path must start with '/'",
                    route.method, route.path
                ));
                continue;
            }
            let path = normalize_path(&route.path);

            if !seen.insert((route.method, path.clone())) {
                issues.push(format!("duplicate route {} {path}", route.method));
                continue;
            }
            let shape = path_shape(&path);
            match shapes.get(&shape) {
                Some(existing) if *existing != path => {
                    issues.push(format!("conflicting routes {existing} and {path}"));
                    continue;
                }
                Some(_) => {}
                None => {
                    shapes.insert(shape, path.clone());
                }
            }

            match (route.binder)(route.method.filter(), provider) {
                Ok(method_router) => {
                    let merged = match by_path.remove(&path) {
                        Some((first, existing)) => (first, existing.merge(method_router)),
                        None => (route.method, method_router),
                    };
                    by_path.insert(path, merged);
                }
                Err(err) => issues.push(format!("route {} {path}: {err}", route.method)),
            }
        }

        // Same order as the fold below, so the claims see what the router will.
        by_path.retain(|path, (method, _)| match claims.claim(path) {
            Ok(()) => true,
            Err(err) => {
                issues.push(format!("route {method} {path}: {err}"));
                false
            }
        });

        if !issues.is_empty() {
            return Err(issues);
        }
        Ok(by_path
            .into_iter()
            .fold(Router::new(), |router, (path, (_, method_router))| {
                router.route(&path, method_router)
            }))
    }
}

impl fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.routes.iter().map(|r| format!("{} {}", r.method, r.path)))
            .finish()
    }
}

/// Rewrites `:id` and `*rest` segments into axum's `{id}` and `{*rest}`.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if let Some(name) = segment.strip_prefix(':').filter(|n| !n.is_empty()) {
                format!("{{{name}}}")
            } else if let Some(name) = segment.strip_prefix('*').filter(|n| !n.is_empty()) {
                format!("{{*{name}}}")
            } else {
                segment.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Path with parameter names erased; two routes with the same shape collide.
fn path_shape(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if segment.starts_with("{*") {
                "{*}"
            } else if segment.starts_with('{') {
                "{}"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Joins a group prefix and a route path: `("/api/", "/todos")` gives `/api/todos`.
#[must_use]
pub fn join_path(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    match (prefix.is_empty(), path.is_empty()) {
        (true, _) => format!("/{path}"),
        (false, true) => prefix.to_string(),
        (false, false) => format!("{prefix}/{path}"),
    }
}

// ---------------------------------------------------------------------------
// RouteGroup
// ---------------------------------------------------------------------------

/// Routes registered under a shared path prefix.
pub struct RouteGroup<'a> {
    prefix: String,
    table: &'a mut RouteTable,
}

impl<'a> RouteGroup<'a> {
    pub fn new(prefix: impl Into<String>, table: &'a mut RouteTable) -> Self {
        Self {
            prefix: prefix.into(),
            table,
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn map<H, T>(&mut self, method: HttpMethod, path: &str, handler: H) -> &mut Self
    where
        H: InjectHandler<T>,
        T: 'static,
    {
        self.table.add(method, join_path(&self.prefix, path), handler);
        self
    }

    pub fn map_get<H: InjectHandler<T>, T: 'static>(&mut self, path: &str, handler: H) -> &mut Self {
        self.map(HttpMethod::Get, path, handler)
    }

    pub fn map_post<H: InjectHandler<T>, T: 'static>(&mut self, path: &str, handler: H) -> &mut Self {
        self.map(HttpMethod::Post, path, handler)
    }

    pub fn map_put<H: InjectHandler<T>, T: 'static>(&mut self, path: &str, handler: H) -> &mut Self {
        self.map(HttpMethod::Put, path, handler)
    }

    pub fn map_delete<H: InjectHandler<T>, T: 'static>(&mut self, path: &str, handler: H) -> &mut Self {
        self.map(HttpMethod::Delete, path, handler)
    }

    pub fn map_patch<H: InjectHandler<T>, T: 'static>(&mut self, path: &str, handler: H) -> &mut Self {
        self.map(HttpMethod::Patch, path, handler)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

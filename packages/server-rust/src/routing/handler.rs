//! Handler adapter: binds handlers whose trailing parameters are
//! dependencies resolved from the service graph.
//!
//! A handler takes an optional request extractor first (any axum
//! `FromRequest` type, including tuples of extractors) followed by up to
//! four `Arc<D>` dependencies:
//!
//! ```ignore
//! async fn create(Json(body): Json<NewTodo>, repo: Arc<dyn TodoRepo>) -> impl IntoResponse { .. }
//! ```
//!
//! Dependencies are resolved once, when the route is bound; the bound
//! handler captures them.

use std::future::Future;
use std::sync::Arc;

use axum::extract::FromRequest;
use axum::response::IntoResponse;
use axum::routing::{on, MethodFilter, MethodRouter};
use hostkit_core::{ContainerError, ServiceProvider};

/// A function that can be bound to a route by resolving its dependencies.
///
/// `T` is a marker for the handler's parameter list; it is inferred.
pub trait InjectHandler<T>: Clone + Send + Sync + Sized + 'static {
    /// Resolves every dependency and returns the routable handler.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError::Missing` naming the first unbound dependency.
    fn bind(self, filter: MethodFilter, provider: &ServiceProvider) -> Result<MethodRouter, ContainerError>;
}

impl<F, Fut, Res> InjectHandler<()> for F
where
    F: Fn() -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Res> + Send + 'static,
    Res: IntoResponse + 'static,
{
    fn bind(self, filter: MethodFilter, _provider: &ServiceProvider) -> Result<MethodRouter, ContainerError> {
        Ok(on(filter, move || (self.clone())()))
    }
}

impl<F, Fut, Res, M, C> InjectHandler<(M, C)> for F
where
    F: Fn(C) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Res> + Send + 'static,
    Res: IntoResponse + 'static,
    C: FromRequest<(), M> + Send + 'static,
    M: 'static,
{
    fn bind(self, filter: MethodFilter, _provider: &ServiceProvider) -> Result<MethodRouter, ContainerError> {
        Ok(on(filter, move |ctx: C| (self.clone())(ctx)))
    }
}

macro_rules! impl_inject_handler {
    ($($dep:ident => $var:ident),+) => {
        impl<F, Fut, Res, M, C, $($dep,)+> InjectHandler<(M, C, $(Arc<$dep>,)+)> for F
        where
            F: Fn(C, $(Arc<$dep>,)+) -> Fut + Clone + Send + Sync + 'static,
            Fut: Future<Output = Res> + Send + 'static,
            Res: IntoResponse + 'static,
            C: FromRequest<(), M> + Send + 'static,
            M: 'static,
            $($dep: ?Sized + Send + Sync + 'static,)+
        {
            fn bind(
                self,
                filter: MethodFilter,
                provider: &ServiceProvider,
            ) -> Result<MethodRouter, ContainerError> {
                $(let $var = provider.require::<$dep>()?;)+
                Ok(on(filter, move |ctx: C| {
                    let handler = self.clone();
                    $(let $var = Arc::clone(&$var);)+
                    async move { handler(ctx, $($var,)+).await }
                }))
            }
        }
    };
}

impl_inject_handler!(D1 => d1);
impl_inject_handler!(D1 => d1, D2 => d2);
impl_inject_handler!(D1 => d1, D2 => d2, D3 => d3);
impl_inject_handler!(D1 => d1, D2 => d2, D3 => d3, D4 => d4);

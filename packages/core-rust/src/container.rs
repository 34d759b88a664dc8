//! Dependency graph: typed singleton bindings resolved once at build.
//!
//! A [`ServiceCollection`] gathers bindings keyed by `TypeId`. `build()`
//! constructs every binding eagerly in registration order; factories may
//! resolve other bindings regardless of the order they were added in. The
//! resulting [`ServiceProvider`] has no mutation API.

use std::any::{type_name, Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::ContainerError;
use crate::service::BackgroundService;

type Instance = Box<dyn Any + Send + Sync>;
type Factory = Box<dyn FnOnce(&Resolver) -> Result<Instance, ContainerError> + Send>;
type BackgroundCast = fn(&Instance) -> Option<Arc<dyn BackgroundService>>;

struct Registration {
    type_id: TypeId,
    type_name: &'static str,
    factory: Factory,
}

fn cast_background<S: BackgroundService>(instance: &Instance) -> Option<Arc<dyn BackgroundService>> {
    instance
        .downcast_ref::<Arc<S>>()
        .map(|service| Arc::clone(service) as Arc<dyn BackgroundService>)
}

// ---------------------------------------------------------------------------
// ServiceCollection
// ---------------------------------------------------------------------------

/// Mutable set of bindings, consumed by [`build`](Self::build).
#[derive(Default)]
pub struct ServiceCollection {
    registrations: Vec<Registration>,
    bound: HashSet<TypeId>,
    background: Vec<(TypeId, BackgroundCast)>,
    issues: Vec<ContainerError>,
}

impl std::fmt::Debug for ServiceCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCollection")
            .field(
                "bindings",
                &self
                    .registrations
                    .iter()
                    .map(|r| r.type_name)
                    .collect::<Vec<_>>(),
            )
            .field("background", &self.background.len())
            .finish_non_exhaustive()
    }
}

impl ServiceCollection {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds an existing shared value. `T` may be a trait object.
    pub fn add_singleton<T>(&mut self, value: Arc<T>) -> &mut Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.add_factory::<T, _>(move |_| Ok(value))
    }

    /// Binds a value by wrapping it in an `Arc`.
    pub fn add_instance<T>(&mut self, value: T) -> &mut Self
    where
        T: Send + Sync + 'static,
    {
        self.add_singleton(Arc::new(value))
    }

    /// Binds `T` to a factory that runs once, when the graph is built.
    ///
    /// The factory receives a [`Resolver`] for its own dependencies. A
    /// `ContainerError` returned through `anyhow` (for example via `?` on
    /// [`Resolver::require`]) is reported unchanged.
    pub fn add_factory<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: ?Sized + Send + Sync + 'static,
        F: FnOnce(&Resolver) -> anyhow::Result<Arc<T>> + Send + 'static,
    {
        let type_id = TypeId::of::<T>();
        let type_name = type_name::<T>();
        if !self.bound.insert(type_id) {
            self.issues.push(ContainerError::Duplicate { type_name });
            return self;
        }
        self.registrations.push(Registration {
            type_id,
            type_name,
            factory: Box::new(move |resolver| match factory(resolver) {
                Ok(value) => Ok(Box::new(value) as Instance),
                Err(err) => Err(match err.downcast::<ContainerError>() {
                    Ok(container_err) => container_err,
                    Err(source) => ContainerError::Factory { type_name, source },
                }),
            }),
        });
        self
    }

    /// Binds `S` through a factory and records it as a background service.
    ///
    /// Background services are wired into the lifecycle in the order of
    /// these calls.
    pub fn add_background_service<S, F>(&mut self, factory: F) -> &mut Self
    where
        S: BackgroundService,
        F: FnOnce(&Resolver) -> anyhow::Result<Arc<S>> + Send + 'static,
    {
        let before = self.issues.len();
        self.add_factory::<S, F>(factory);
        if self.issues.len() == before {
            self.background
                .push((TypeId::of::<S>(), cast_background::<S> as BackgroundCast));
        }
        self
    }

    /// Binds an existing value and records it as a background service.
    pub fn add_background_instance<S: BackgroundService>(&mut self, service: S) -> &mut Self {
        let service = Arc::new(service);
        self.add_background_service::<S, _>(move |_| Ok(service))
    }

    #[must_use]
    pub fn contains<T: ?Sized + 'static>(&self) -> bool {
        self.bound.contains(&TypeId::of::<T>())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Constructs every binding and freezes the graph.
    ///
    /// # Errors
    ///
    /// Returns the registration issues (duplicates) if any were recorded,
    /// otherwise the first missing dependency, cycle or failing factory.
    pub fn build(self) -> Result<ServiceProvider, ContainerError> {
        let mut issues = self.issues;
        match issues.len() {
            0 => {}
            1 => return Err(issues.remove(0)),
            _ => return Err(ContainerError::Invalid(issues)),
        }

        let order: Vec<(TypeId, &'static str)> = self
            .registrations
            .iter()
            .map(|r| (r.type_id, r.type_name))
            .collect();
        let resolver = Resolver {
            pending: Mutex::new(
                self.registrations
                    .into_iter()
                    .map(|r| (r.type_id, r))
                    .collect(),
            ),
            built: Mutex::new(HashMap::new()),
            stack: Mutex::new(Vec::new()),
        };

        for &(type_id, name) in &order {
            resolver.resolve_erased(type_id, name)?;
        }

        let instances = resolver.built.into_inner();
        let background = self
            .background
            .iter()
            .filter_map(|(type_id, cast)| instances.get(type_id).and_then(cast))
            .collect();
        debug!(bindings = instances.len(), "service graph built");

        Ok(ServiceProvider {
            instances,
            names: order.into_iter().map(|(_, name)| name).collect(),
            background,
        })
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Build-time view of the graph handed to factories.
pub struct Resolver {
    pending: Mutex<HashMap<TypeId, Registration>>,
    built: Mutex<HashMap<TypeId, Instance>>,
    stack: Mutex<Vec<(TypeId, &'static str)>>,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("built", &self.built.lock().len())
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl Resolver {
    /// Resolves `T`, constructing it first if needed.
    ///
    /// # Errors
    ///
    /// Returns `Missing` if `T` is not bound, `Cycle` if `T` is already being
    /// constructed further up the chain, or the error of `T`'s factory.
    pub fn require<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>, ContainerError> {
        let type_id = TypeId::of::<T>();
        self.resolve_erased(type_id, type_name::<T>())?;
        self.built
            .lock()
            .get(&type_id)
            .and_then(|instance| instance.downcast_ref::<Arc<T>>())
            .cloned()
            .ok_or(ContainerError::Missing {
                type_name: type_name::<T>(),
            })
    }

    /// Resolves `T` if it is bound.
    ///
    /// # Errors
    ///
    /// Returns cycle and factory errors; a missing binding is `Ok(None)`.
    pub fn optional<T: ?Sized + Send + Sync + 'static>(
        &self,
    ) -> Result<Option<Arc<T>>, ContainerError> {
        match self.require::<T>() {
            Ok(value) => Ok(Some(value)),
            Err(ContainerError::Missing { type_name }) if type_name == std::any::type_name::<T>() => {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn resolve_erased(&self, type_id: TypeId, name: &'static str) -> Result<(), ContainerError> {
        if self.built.lock().contains_key(&type_id) {
            return Ok(());
        }

        let registration = {
            let mut stack = self.stack.lock();
            if let Some(pos) = stack.iter().position(|(id, _)| *id == type_id) {
                let mut path: Vec<&'static str> = stack[pos..].iter().map(|(_, n)| *n).collect();
                path.push(name);
                return Err(ContainerError::Cycle { path });
            }
            let Some(registration) = self.pending.lock().remove(&type_id) else {
                return Err(ContainerError::Missing { type_name: name });
            };
            stack.push((type_id, name));
            registration
        };

        // Locks are released: the factory may re-enter the resolver.
        let result = (registration.factory)(self);
        self.stack.lock().pop();

        let instance = result?;
        self.built.lock().insert(type_id, instance);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ServiceProvider
// ---------------------------------------------------------------------------

/// The built, immutable dependency graph.
pub struct ServiceProvider {
    instances: HashMap<TypeId, Instance>,
    names: Vec<&'static str>,
    background: Vec<Arc<dyn BackgroundService>>,
}

impl std::fmt::Debug for ServiceProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProvider")
            .field("bindings", &self.names)
            .field("background", &self.background.len())
            .finish()
    }
}

impl ServiceProvider {
    #[must_use]
    pub fn get<T: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.instances
            .get(&TypeId::of::<T>())
            .and_then(|instance| instance.downcast_ref::<Arc<T>>())
            .cloned()
    }

    /// Like [`get`](Self::get), naming the type when it is not bound.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError::Missing` if `T` is not bound.
    pub fn require<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>, ContainerError> {
        self.get::<T>().ok_or(ContainerError::Missing {
            type_name: type_name::<T>(),
        })
    }

    #[must_use]
    pub fn contains<T: ?Sized + 'static>(&self) -> bool {
        self.instances.contains_key(&TypeId::of::<T>())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Type names of every binding, in registration order.
    #[must_use]
    pub fn type_names(&self) -> &[&'static str] {
        &self.names
    }

    /// Background services, in registration order.
    #[must_use]
    pub fn background_services(&self) -> &[Arc<dyn BackgroundService>] {
        &self.background
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::*;

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct English;

    impl Greeter for English {
        fn greet(&self) -> String {
            "hello".to_string()
        }
    }

    struct Repo {
        dsn: String,
    }

    struct Handler {
        repo: Arc<Repo>,
        greeter: Arc<dyn Greeter>,
    }

    struct Ticker;

    #[async_trait]
    impl BackgroundService for Ticker {
        async fn start(&self, _ctx: &CancellationToken) -> anyhow::Result<()> {
            Ok(())
        }
        async fn stop(&self, _ctx: &CancellationToken) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn resolves_instances_and_trait_objects() {
        let mut services = ServiceCollection::new();
        services
            .add_instance(Repo {
                dsn: "mem".to_string(),
            })
            .add_singleton::<dyn Greeter>(Arc::new(English));
        let provider = services.build().unwrap();

        assert_eq!(provider.require::<Repo>().unwrap().dsn, "mem");
        assert_eq!(provider.get::<dyn Greeter>().unwrap().greet(), "hello");
        assert!(provider.contains::<dyn Greeter>());
        assert_eq!(provider.len(), 2);
    }

    #[test]
    fn factories_resolve_dependencies_registered_later() {
        let mut services = ServiceCollection::new();
        services
            .add_factory(|r: &Resolver| {
                Ok(Arc::new(Handler {
                    repo: r.require::<Repo>()?,
                    greeter: r.require::<dyn Greeter>()?,
                }))
            })
            .add_instance(Repo {
                dsn: "pg".to_string(),
            })
            .add_singleton::<dyn Greeter>(Arc::new(English));
        let provider = services.build().unwrap();

        let handler = provider.require::<Handler>().unwrap();
        assert_eq!(handler.repo.dsn, "pg");
        assert_eq!(handler.greeter.greet(), "hello");
        assert!(Arc::ptr_eq(&handler.repo, &provider.require::<Repo>().unwrap()));
    }

    #[test]
    fn each_factory_runs_exactly_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&calls);
        let mut services = ServiceCollection::new();
        services
            .add_factory(move |_| {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(Repo {
                    dsn: "x".to_string(),
                }))
            })
            .add_factory(|r: &Resolver| {
                Ok(Arc::new(Handler {
                    repo: r.require::<Repo>()?,
                    greeter: Arc::new(English),
                }))
            });
        let provider = services.build().unwrap();
        provider.require::<Repo>().unwrap();
        provider.require::<Handler>().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_dependency_names_the_type() {
        let mut services = ServiceCollection::new();
        services.add_factory(|r: &Resolver| {
            Ok(Arc::new(Handler {
                repo: r.require::<Repo>()?,
                greeter: Arc::new(English),
            }))
        });
        let err = services.build().unwrap_err();
        assert!(matches!(err, ContainerError::Missing { .. }));
        assert!(err.to_string().contains("Repo"), "{err}");
    }

    #[test]
    fn require_on_provider_names_missing_type() {
        let provider = ServiceCollection::new().build().unwrap();
        assert!(provider.is_empty());
        let Err(err) = provider.require::<dyn Greeter>() else {
            panic!("expected a missing binding");
        };
        assert!(err.to_string().contains("Greeter"));
    }

    #[test]
    fn duplicate_bindings_are_rejected() {
        let mut services = ServiceCollection::new();
        services
            .add_instance(Repo { dsn: "a".into() })
            .add_instance(Repo { dsn: "b".into() });
        let err = services.build().unwrap_err();
        assert!(matches!(err, ContainerError::Duplicate { .. }));
    }

    #[test]
    fn several_duplicates_are_aggregated() {
        let mut services = ServiceCollection::new();
        services
            .add_instance(Repo { dsn: "a".into() })
            .add_instance(Repo { dsn: "b".into() })
            .add_singleton::<dyn Greeter>(Arc::new(English))
            .add_singleton::<dyn Greeter>(Arc::new(English));
        match services.build().unwrap_err() {
            ContainerError::Invalid(errors) => assert_eq!(errors.len(), 2),
            other => panic!("expected aggregated error, got {other}"),
        }
    }

    struct A;
    struct B;

    #[test]
    fn cycles_are_reported_with_their_path() {
        let mut services = ServiceCollection::new();
        services
            .add_factory(|r: &Resolver| {
                r.require::<B>()?;
                Ok(Arc::new(A))
            })
            .add_factory(|r: &Resolver| {
                r.require::<A>()?;
                Ok(Arc::new(B))
            });
        match services.build().unwrap_err() {
            ContainerError::Cycle { path } => {
                assert_eq!(path.len(), 3);
                assert!(path[0].ends_with("::A"));
                assert!(path[1].ends_with("::B"));
                assert!(path[2].ends_with("::A"));
            }
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn failing_factory_is_wrapped_with_type_name() {
        let mut services = ServiceCollection::new();
        services.add_factory::<Repo, _>(|_| anyhow::bail!("connection refused"));
        let err = services.build().unwrap_err();
        assert!(matches!(err, ContainerError::Factory { .. }));
        let msg = err.to_string();
        assert!(msg.contains("Repo") && msg.contains("connection refused"), "{msg}");
    }

    #[test]
    fn optional_returns_none_for_unbound_types() {
        let mut services = ServiceCollection::new();
        services.add_factory(|r: &Resolver| {
            let greeter = r
                .optional::<dyn Greeter>()?
                .unwrap_or_else(|| Arc::new(English));
            Ok(Arc::new(Handler {
                repo: Arc::new(Repo { dsn: "x".into() }),
                greeter,
            }))
        });
        let provider = services.build().unwrap();
        assert_eq!(provider.require::<Handler>().unwrap().greeter.greet(), "hello");
    }

    #[test]
    fn background_services_keep_registration_order() {
        struct Second;

        #[async_trait]
        impl BackgroundService for Second {
            fn name(&self) -> &str {
                "second"
            }
            async fn start(&self, _ctx: &CancellationToken) -> anyhow::Result<()> {
                Ok(())
            }
            async fn stop(&self, _ctx: &CancellationToken) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let mut services = ServiceCollection::new();
        services
            .add_background_instance(Ticker)
            .add_instance(Repo { dsn: "x".into() })
            .add_background_service(|_| Ok(Arc::new(Second)));
        let provider = services.build().unwrap();

        let names: Vec<_> = provider
            .background_services()
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names[0].ends_with("Ticker"));
        assert_eq!(names[1], "second");
        assert!(provider.contains::<Ticker>());
    }
}

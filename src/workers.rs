//! Worker plugins and their registry.
//!
//! A worker is the unit of business logic a workflow template binds to by
//! plugin name. Templates reference workers by route id; the template's
//! `plugins` table maps a route id to a registered plugin name.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::error::WorkerError;

/// Business logic invoked by state machine actions, guards and decisions.
#[async_trait::async_trait]
pub trait Worker: Send + Sync {
    /// Perform the action at `route` for an instance.
    async fn invoke(&self, instance_id: &str, route: &str) -> Result<(), WorkerError>;

    /// Decide whether a guarded transition may proceed.
    async fn guard(&self, instance_id: &str, route: &str, state: &str, trigger: &str) -> Result<bool, WorkerError> {
        let _ = (instance_id, route, state, trigger);
        Err(WorkerError::Unsupported { capability: "guard" })
    }

    /// Compute the next state of a dynamic transition.
    async fn decide_transition(
        &self,
        instance_id: &str,
        route: &str,
        trigger: &str,
        state: &str,
    ) -> Result<String, WorkerError> {
        let _ = (instance_id, route, trigger, state);
        Err(WorkerError::Unsupported {
            capability: "decide_transition",
        })
    }

    /// Whether this worker handles the route pattern (canonical form, with
    /// placeholders unexpanded).
    fn supports_route(&self, pattern: &str) -> bool;
}

/// Adapter turning an async closure plus a route list into a [`Worker`].
pub struct FnWorker<F> {
    routes: Vec<String>,
    f: F,
}

#[async_trait::async_trait]
impl<F, Fut> Worker for FnWorker<F>
where
    F: Fn(String, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), WorkerError>> + Send + 'static,
{
    async fn invoke(&self, instance_id: &str, route: &str) -> Result<(), WorkerError> {
        (self.f)(instance_id.to_string(), route.to_string()).await
    }

    fn supports_route(&self, pattern: &str) -> bool {
        route_listed(&self.routes, pattern)
    }
}

/// `*` in a route list accepts every route.
pub fn route_listed(routes: &[String], pattern: &str) -> bool {
    routes.iter().any(|r| r == "*" || r.eq_ignore_ascii_case(pattern))
}

/// Immutable name → worker table.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    inner: Arc<HashMap<String, Arc<dyn Worker>>>,
}

pub struct WorkerRegistryBuilder {
    map: HashMap<String, Arc<dyn Worker>>,
    errors: Vec<String>,
}

impl WorkerRegistry {
    pub fn builder() -> WorkerRegistryBuilder {
        WorkerRegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Worker>> {
        let found = self.inner.get(name).cloned();
        if found.is_none() {
            tracing::debug!(
                target: "flowhost::workers",
                requested_name = %name,
                registered_names = ?self.list_names(),
                "worker registry lookup miss"
            );
        }
        found
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }
}

impl WorkerRegistryBuilder {
    /// Build, ignoring registration errors (later duplicates are dropped).
    pub fn build(self) -> WorkerRegistry {
        WorkerRegistry {
            inner: Arc::new(self.map),
        }
    }

    /// Build, failing with every registration error found.
    pub fn build_result(self) -> Result<WorkerRegistry, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }

    fn check_duplicate(&mut self, name: &str) -> bool {
        if self.map.contains_key(name) {
            self.errors.push(format!("duplicate worker registration: {name}"));
            true
        } else {
            false
        }
    }

    pub fn register(mut self, name: impl Into<String>, worker: Arc<dyn Worker>) -> Self {
        let name = name.into();
        if self.check_duplicate(&name) {
            return self;
        }
        self.map.insert(name, worker);
        self
    }

    /// Register an invoke-only worker from a closure taking `(instance_id, route)`.
    pub fn register_fn<F, Fut>(self, name: impl Into<String>, routes: &[&str], f: F) -> Self
    where
        F: Fn(String, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), WorkerError>> + Send + 'static,
    {
        let worker = FnWorker {
            routes: routes.iter().map(|r| r.to_string()).collect(),
            f,
        };
        self.register(name, Arc::new(worker))
    }
}

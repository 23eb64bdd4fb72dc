use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Shared per-worker resources handed to every handler invocation.
///
/// Built once by the startup hooks; resources are keyed by type, so a
/// handler asks for the concrete type it needs.
pub struct WorkerContext {
    worker_id: String,
    resources: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl WorkerContext {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            resources: HashMap::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Registers a shared resource, replacing any previous value of
    /// the same type.
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) {
        self.resources.insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.resources
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|resource| resource.downcast::<T>().ok())
    }
}

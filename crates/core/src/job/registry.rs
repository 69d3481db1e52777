use crate::error::Result;
use crate::job::runtime::JobRunContext;
use crate::types::JobResult;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

/// A statically registered job handler.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: Arc<JobRunContext>, parameters: Value) -> Result<JobResult>;
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<JobResult>> + Send>>;

struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<F> JobHandler for FnHandler<F>
where
    F: Fn(Arc<JobRunContext>, Value) -> HandlerFuture + Send + Sync,
{
    async fn run(&self, ctx: Arc<JobRunContext>, parameters: Value) -> Result<JobResult> {
        (self.0)(ctx, parameters).await
    }
}

/// Registry of static handlers and bundle-failure fallbacks, keyed by
/// job slug. Constructed explicitly and torn down with its owner; no
/// eager global state.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    fallbacks: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, slug: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.write().unwrap().insert(slug.into(), handler);
    }

    pub fn register_fn<F>(&self, slug: impl Into<String>, handler: F)
    where
        F: Fn(Arc<JobRunContext>, Value) -> HandlerFuture + Send + Sync + 'static,
    {
        self.register(slug, Arc::new(FnHandler(handler)));
    }

    /// Fallback used when bundle resolution for the slug keeps failing.
    pub fn register_fallback(&self, slug: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.fallbacks.write().unwrap().insert(slug.into(), handler);
    }

    pub fn register_fallback_fn<F>(&self, slug: impl Into<String>, handler: F)
    where
        F: Fn(Arc<JobRunContext>, Value) -> HandlerFuture + Send + Sync + 'static,
    {
        self.register_fallback(slug, Arc::new(FnHandler(handler)));
    }

    pub fn get(&self, slug: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().unwrap().get(slug).cloned()
    }

    pub fn fallback(&self, slug: &str) -> Option<Arc<dyn JobHandler>> {
        self.fallbacks.read().unwrap().get(slug).cloned()
    }

    pub fn unregister(&self, slug: &str) {
        self.handlers.write().unwrap().remove(slug);
        self.fallbacks.write().unwrap().remove(slug);
    }
}

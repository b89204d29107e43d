use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::task::{ExecutionContext, ExecutionFailure, HandlerError, TaskHandler, TaskRequest};

#[allow(unused_imports)]
use crate::dispatcher::Dispatcher;

/// Why a handler invocation failed, kept apart because a payload that no longer
/// deserializes is permanent and must not burn retry attempts
pub(crate) enum InvokeError {
    /// The persisted payload no longer matches the request type
    Deserialization(serde_json::Error),
    /// The handler itself returned an error
    Handler(HandlerError),
}

/// [`ErasedTaskHandler`] is the type-erased face of a [`TaskHandler`]. The registry wraps
/// every registered handler in an adapter implementing this trait so the executor can
/// drive any handler through one vtable: the adapter deserializes the persisted payload
/// into the concrete request type and forwards to the typed `handle`
#[async_trait]
pub(crate) trait ErasedTaskHandler: Send + Sync {
    /// Deserializes `payload` and executes one attempt
    async fn invoke(&self, payload: &str, ctx: ExecutionContext) -> Result<(), InvokeError>;

    async fn started(&self, ctx: &ExecutionContext);

    async fn completed(&self, ctx: &ExecutionContext);

    async fn errored(&self, ctx: &ExecutionContext, failure: &ExecutionFailure);

    async fn retried(
        &self,
        ctx: &ExecutionContext,
        attempt: u32,
        error: &HandlerError,
        delay: Duration,
    );

    fn retry_policy(&self) -> Option<RetryPolicy>;

    fn timeout(&self) -> Option<Duration>;

    fn queue_name(&self) -> Option<String>;
}

struct HandlerAdapter<H> {
    inner: H,
}

#[async_trait]
impl<H: TaskHandler> ErasedTaskHandler for HandlerAdapter<H> {
    async fn invoke(&self, payload: &str, ctx: ExecutionContext) -> Result<(), InvokeError> {
        let request: H::Request =
            serde_json::from_str(payload).map_err(InvokeError::Deserialization)?;
        self.inner
            .handle(request, ctx)
            .await
            .map_err(InvokeError::Handler)
    }

    async fn started(&self, ctx: &ExecutionContext) {
        self.inner.on_started(ctx).await;
    }

    async fn completed(&self, ctx: &ExecutionContext) {
        self.inner.on_completed(ctx).await;
    }

    async fn errored(&self, ctx: &ExecutionContext, failure: &ExecutionFailure) {
        self.inner.on_error(ctx, failure).await;
    }

    async fn retried(
        &self,
        ctx: &ExecutionContext,
        attempt: u32,
        error: &HandlerError,
        delay: Duration,
    ) {
        self.inner.on_retry(ctx, attempt, error, delay).await;
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        self.inner.retry_policy()
    }

    fn timeout(&self) -> Option<Duration> {
        self.inner.timeout()
    }

    fn queue_name(&self) -> Option<String> {
        self.inner.queue_name().map(str::to_owned)
    }
}

/// One registration row: the stable request type name, the handler's type name (persisted
/// for diagnostics) and the factory that constructs a fresh erased handler instance
pub(crate) struct RegisteredHandler {
    pub request_type: &'static str,
    pub handler_type: &'static str,
    factory: Box<dyn Fn() -> Arc<dyn ErasedTaskHandler> + Send + Sync>,
}

impl RegisteredHandler {
    /// Constructs a fresh handler instance through the registered factory
    pub fn construct(&self) -> Arc<dyn ErasedTaskHandler> {
        (self.factory)()
    }
}

/// [`HandlerRegistry`] maps request type names to handler factories. Registration happens
/// at startup (before the engine starts accepting dispatches), lookups happen on every
/// dispatch and execution, which is why the map is a read-mostly concurrent one.
///
/// There is no runtime reflection anywhere in the pipeline: the factory closure captures
/// the concrete handler type at registration and the erased adapter it produces knows how
/// to deserialize the matching request type.
///
/// # Constructor(s)
/// [`HandlerRegistry::new`] creates an empty registry, handlers are then added with
/// [`HandlerRegistry::register`] (for [`Default`] handlers) or
/// [`HandlerRegistry::register_with`] (for handlers needing captured state)
///
/// # Example
/// ```ignore
/// use evertask::registry::HandlerRegistry;
///
/// let registry = HandlerRegistry::new();
/// registry.register::<SendWelcomeMailHandler>();
/// registry.register_with(move || ReportHandler::new(pool.clone()));
/// ```
///
/// # See Also
/// - [`TaskHandler`]
/// - [`Dispatcher`]
pub struct HandlerRegistry {
    entries: DashMap<String, Arc<RegisteredHandler>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    /// Creates / Constructs an empty [`HandlerRegistry`]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Registers a [`Default`]-constructible handler for its request type. A later
    /// registration for the same request type replaces the earlier one
    pub fn register<H: TaskHandler + Default>(&self) {
        self.register_with(H::default);
    }

    /// Registers a handler through a factory closure, used when the handler carries
    /// captured state (connection pools, clients and so on). The factory runs once per
    /// execution when construction is lazy, or once per dispatch when it is eager
    pub fn register_with<H, F>(&self, factory: F)
    where
        H: TaskHandler,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let request_type = H::Request::request_type();
        let entry = RegisteredHandler {
            request_type,
            handler_type: std::any::type_name::<H>(),
            factory: Box::new(move || Arc::new(HandlerAdapter { inner: factory() })),
        };
        tracing::debug!(
            request_type,
            handler_type = entry.handler_type,
            "registered task handler"
        );
        self.entries.insert(request_type.to_string(), Arc::new(entry));
    }

    /// Whether a handler is registered for the given request type name
    pub fn contains(&self, request_type: &str) -> bool {
        self.entries.contains_key(request_type)
    }

    /// The number of registered handlers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn get(&self, request_type: &str) -> Option<Arc<RegisteredHandler>> {
        self.entries.get(request_type).map(|e| e.value().clone())
    }
}

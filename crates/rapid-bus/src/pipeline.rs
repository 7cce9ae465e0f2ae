//! # Processing Pipeline
//!
//! Reusable steps wrapped around the terminal handler call.
//!
//! ```text
//! step A ─▶ step B ─▶ handler
//!        ◀─        ◀─
//! ```
//!
//! The first registered step is the outermost. A step that never calls
//! `next` short-circuits everything inside it.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::context::EventContext;
use crate::error::{BusError, HandlerResult};
use crate::scope::{HandlerScope, Services};

/// The rest of the chain, from a step's point of view.
pub type EventDelegate = Arc<dyn Fn(EventContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Wraps a delegate in another.
pub type PipelineStep = Arc<dyn Fn(EventDelegate) -> EventDelegate + Send + Sync>;

/// Build an `EventDelegate` from an async closure.
pub fn delegate<F, Fut>(f: F) -> EventDelegate
where
    F: Fn(EventContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)) as BoxFuture<'static, HandlerResult>)
}

/// A pipeline step written as a type.
///
/// ```rust,ignore
/// struct Timing;
///
/// #[async_trait]
/// impl Middleware for Timing {
///     async fn invoke(&self, ctx: EventContext, next: EventDelegate) -> HandlerResult {
///         let started = Instant::now();
///         let result = next(ctx).await;
///         info!(elapsed_ms = started.elapsed().as_millis() as u64, "handled");
///         result
///     }
/// }
/// ```
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn invoke(&self, ctx: EventContext, next: EventDelegate) -> HandlerResult;
}

/// Constructor injection from the root scope.
pub trait FromScope: Sized {
    fn from_scope(scope: &HandlerScope) -> Result<Self, BusError>;
}

type MiddlewareFactory = Box<dyn FnOnce(&HandlerScope) -> Result<PipelineStep, BusError> + Send>;

enum StepSource {
    Step(PipelineStep),
    Middleware {
        name: &'static str,
        factory: MiddlewareFactory,
    },
}

/// Ordered step registrations, finalized by `build`.
#[derive(Default)]
pub struct PipelineBuilder {
    steps: Vec<StepSource>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a raw step.
    #[must_use]
    pub fn use_step<F>(mut self, step: F) -> Self
    where
        F: Fn(EventDelegate) -> EventDelegate + Send + Sync + 'static,
    {
        self.steps.push(StepSource::Step(Arc::new(step)));
        self
    }

    /// Add middleware `M`, constructed once from the root scope at build time.
    #[must_use]
    pub fn use_middleware<M>(mut self) -> Self
    where
        M: Middleware + FromScope,
    {
        self.steps.push(StepSource::Middleware {
            name: std::any::type_name::<M>(),
            factory: Box::new(|scope: &HandlerScope| -> Result<PipelineStep, BusError> {
                Ok(middleware_step(Arc::new(M::from_scope(scope)?)))
            }),
        });
        self
    }

    /// Add an already constructed middleware.
    #[must_use]
    pub fn use_middleware_instance<M: Middleware>(mut self, middleware: M) -> Self {
        self.steps
            .push(StepSource::Step(middleware_step(Arc::new(middleware))));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Instantiate middleware and freeze the step order.
    ///
    /// # Errors
    ///
    /// Whatever a middleware's `FromScope` returns, typically
    /// `ServiceNotFound`.
    pub fn build(self, services: &Services) -> Result<Pipeline, BusError> {
        let root = services.create_scope();
        let mut steps = Vec::with_capacity(self.steps.len());

        for source in self.steps {
            match source {
                StepSource::Step(step) => steps.push(step),
                StepSource::Middleware { name, factory } => {
                    let step = factory(&root).map_err(|e| {
                        BusError::Configuration(format!("cannot construct middleware {name}: {e}"))
                    })?;
                    steps.push(step);
                }
            }
        }

        Ok(Pipeline {
            steps: Arc::from(steps),
        })
    }
}

impl fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("steps", &self.steps.len())
            .finish()
    }
}

fn middleware_step<M: Middleware>(middleware: Arc<M>) -> PipelineStep {
    Arc::new(move |next: EventDelegate| {
        let middleware = Arc::clone(&middleware);
        Arc::new(move |ctx: EventContext| {
            let middleware = Arc::clone(&middleware);
            let next = Arc::clone(&next);
            Box::pin(async move { middleware.invoke(ctx, next).await })
                as BoxFuture<'static, HandlerResult>
        }) as EventDelegate
    })
}

/// Immutable, ordered step list shared by every dispatch unit.
#[derive(Clone)]
pub struct Pipeline {
    steps: Arc<[PipelineStep]>,
}

impl Pipeline {
    /// A pipeline with no steps.
    pub fn empty() -> Self {
        Self {
            steps: Arc::from(Vec::new()),
        }
    }

    /// Materialize the chain around `terminal`.
    pub fn wrap(&self, terminal: EventDelegate) -> EventDelegate {
        self.steps
            .iter()
            .rev()
            .fold(terminal, |next, step| step(next))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("steps", &self.steps.len())
            .finish()
    }
}

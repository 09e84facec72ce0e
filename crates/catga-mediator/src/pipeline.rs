//! Pipeline composition.
//!
//! A behavior is `(request, ctx, next) -> result`. The chain for each
//! request type is folded once at build time; the first declared stage ends
//! up outermost. At runtime a dispatch walks the pre-built closure chain,
//! there is no per-call assembly.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use catga_common::{CatgaResult, MessageContext, Request};

use crate::registry::RequestHandler;

/// Fully composed dispatch path for one request type.
pub type PipelineFn<R> = Arc<
    dyn Fn(R, MessageContext) -> BoxFuture<'static, CatgaResult<<R as Request>::Response>>
        + Send
        + Sync,
>;

/// The remainder of the pipeline after the current behavior.
pub struct Next<R: Request> {
    inner: PipelineFn<R>,
}

impl<R: Request> Clone for Next<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: Request> Next<R> {
    /// Continue with the rest of the pipeline. A behavior may call this
    /// zero times (short-circuit), once, or several times (retry).
    pub async fn run(&self, request: R, ctx: MessageContext) -> CatgaResult<R::Response> {
        (self.inner)(request, ctx).await
    }
}

/// Cross-cutting interceptor around handler execution.
///
/// Behaviors may short-circuit, transform the request or response, and
/// observe errors. Outside of idempotent replay a behavior must preserve or
/// widen a failure, never hide it.
#[async_trait]
pub trait Behavior<R: Request>: Send + Sync + 'static {
    async fn handle(
        &self,
        request: R,
        ctx: MessageContext,
        next: &Next<R>,
    ) -> CatgaResult<R::Response>;
}

/// Wrap the terminal handler call in a pipeline function.
pub(crate) fn terminal<R: Request>(handler: Arc<dyn RequestHandler<R>>) -> PipelineFn<R> {
    Arc::new(move |request, ctx| {
        let handler = handler.clone();
        Box::pin(async move { handler.handle(request, &ctx).await })
    })
}

/// Fold `behaviors` around `terminal`; the first element becomes the
/// outermost wrapper.
pub(crate) fn compose<R: Request>(
    terminal: PipelineFn<R>,
    behaviors: Vec<Arc<dyn Behavior<R>>>,
) -> PipelineFn<R> {
    let mut chain = terminal;
    for behavior in behaviors.into_iter().rev() {
        let next = Next { inner: chain };
        chain = Arc::new(move |request, ctx| {
            let behavior = behavior.clone();
            let next = next.clone();
            Box::pin(async move { behavior.handle(request, ctx, &next).await })
        });
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};

    use catga_common::{Message, MessageId};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Probe;

    impl Message for Probe {}
    impl Request for Probe {
        type Response = ();
    }

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Behavior<Probe> for Recorder {
        async fn handle(
            &self,
            request: Probe,
            ctx: MessageContext,
            next: &Next<Probe>,
        ) -> CatgaResult<()> {
            self.log.lock().push(self.label);
            next.run(request, ctx).await
        }
    }

    struct Terminal {
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl RequestHandler<Probe> for Terminal {
        async fn handle(&self, _request: Probe, _ctx: &MessageContext) -> CatgaResult<()> {
            self.log.lock().push("handler");
            Ok(())
        }
    }

    #[tokio::test]
    async fn first_declared_behavior_runs_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = compose(
            terminal(Arc::new(Terminal { log: log.clone() })),
            vec![
                Arc::new(Recorder {
                    label: "outer",
                    log: log.clone(),
                }),
                Arc::new(Recorder {
                    label: "inner",
                    log: log.clone(),
                }),
            ],
        );

        let ctx = MessageContext::for_message::<Probe>(MessageId::from_raw(1));
        pipeline(Probe, ctx).await.unwrap();

        assert_eq!(*log.lock(), vec!["outer", "inner", "handler"]);
    }
}

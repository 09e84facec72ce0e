//! Transparent retry of transient failures.

use async_trait::async_trait;

use catga_common::{CatgaResult, MessageContext, Request};
use catga_resilience::RetryPolicy;

use crate::pipeline::{Behavior, Next};

/// Re-runs the rest of the pipeline per the policy. Only `Unavailable` and
/// `Timeout` failures are retried.
#[derive(Debug, Clone)]
pub struct RetryBehavior {
    policy: RetryPolicy,
}

impl RetryBehavior {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl<R: Request> Behavior<R> for RetryBehavior {
    async fn handle(
        &self,
        request: R,
        ctx: MessageContext,
        next: &Next<R>,
    ) -> CatgaResult<R::Response> {
        self.policy
            .run(|attempt| {
                let mut ctx = ctx.clone();
                ctx.retry_count = attempt - 1;
                let request = request.clone();
                async move { next.run(request, ctx).await }
            })
            .await
    }
}

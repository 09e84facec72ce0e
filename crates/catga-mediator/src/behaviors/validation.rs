//! Input validation before the handler runs.

use async_trait::async_trait;

use catga_common::{CatgaResult, MessageContext, Request};

use crate::pipeline::{Behavior, Next};

/// Runs [`Request::validate`] and fails fast with `Validation` on bad input.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationBehavior;

impl ValidationBehavior {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl<R: Request> Behavior<R> for ValidationBehavior {
    async fn handle(
        &self,
        request: R,
        ctx: MessageContext,
        next: &Next<R>,
    ) -> CatgaResult<R::Response> {
        request.validate()?;
        next.run(request, ctx).await
    }
}

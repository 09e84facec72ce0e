//! Typed publish/subscribe over a byte-level transport.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{info_span, Instrument};

use catga_codec::{AnyCodec, Codec};
use catga_common::telemetry::{counters, MESSAGING_SYSTEM_NAME, OPERATION_PUBLISH};
use catga_common::{CatgaResult, Event, MessageContext};

use crate::{
    SubjectMapper, SubscribeOptions, SubscriberFn, Subscription, Transport, TransportEnvelope,
};

/// Encodes typed messages into wire envelopes and routes them by subject.
#[derive(Clone)]
pub struct MessageBus {
    transport: Arc<dyn Transport>,
    codec: AnyCodec,
    subjects: SubjectMapper,
}

impl MessageBus {
    pub fn new(transport: Arc<dyn Transport>, codec: AnyCodec) -> Self {
        Self {
            transport,
            codec,
            subjects: SubjectMapper::default(),
        }
    }

    pub fn with_subject_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.subjects = SubjectMapper::new(prefix);
        self
    }

    pub fn subjects(&self) -> &SubjectMapper {
        &self.subjects
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Publish one typed event under its type subject.
    pub async fn publish_event<E: Event>(&self, event: &E, ctx: &MessageContext) -> CatgaResult<()> {
        let payload = Bytes::from(self.codec.encode(event)?);
        let subject = self.subjects.subject_for::<E>();
        self.publish_envelope(&subject, TransportEnvelope::from_context(ctx, payload))
            .await
    }

    /// Publish a pre-encoded envelope under the subject for `message_type`.
    /// Used by the outbox publisher, which only has the stored type name and
    /// payload bytes.
    pub async fn publish_raw(
        &self,
        message_type: &str,
        envelope: TransportEnvelope,
    ) -> CatgaResult<()> {
        let subject = self.subjects.subject_for_type(message_type);
        self.publish_envelope(&subject, envelope).await
    }

    async fn publish_envelope(
        &self,
        subject: &str,
        envelope: TransportEnvelope,
    ) -> CatgaResult<()> {
        let span = info_span!(
            "catga.publish",
            "messaging.system" = MESSAGING_SYSTEM_NAME,
            "messaging.destination.name" = subject,
            "messaging.operation" = OPERATION_PUBLISH,
            "catga.message.id" = envelope.msg_id,
            "catga.message.type" = %envelope.msg_type,
            "catga.qos" = %envelope.qos,
            "catga.correlation_id" = envelope.corr_id,
            "catga.success" = tracing::field::Empty,
            "catga.error" = tracing::field::Empty,
            "catga.duration.ms" = tracing::field::Empty,
        );

        let started = Instant::now();
        let result = self
            .transport
            .publish(subject, envelope)
            .instrument(span.clone())
            .await;

        span.record("catga.success", result.is_ok());
        span.record("catga.duration.ms", started.elapsed().as_millis() as u64);
        if let Err(err) = &result {
            span.record("catga.error", err.code());
        }
        metrics::counter!(counters::EVENTS).increment(1);
        result
    }

    /// Point-to-point send of a typed message to one named destination.
    pub async fn send_message<M>(
        &self,
        destination: &str,
        message: &M,
        ctx: &MessageContext,
    ) -> CatgaResult<()>
    where
        M: catga_common::Message + serde::Serialize,
    {
        let payload = Bytes::from(self.codec.encode(message)?);
        self.transport
            .send(destination, TransportEnvelope::from_context(ctx, payload))
            .await
    }

    /// Subscribe a typed handler to the subject of `E`.
    pub async fn subscribe_event<E, H, Fut>(&self, handler: H) -> CatgaResult<Subscription>
    where
        E: Event,
        H: Fn(E, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CatgaResult<()>> + Send + 'static,
    {
        self.subscribe_event_with(handler, SubscribeOptions::default())
            .await
    }

    pub async fn subscribe_event_with<E, H, Fut>(
        &self,
        handler: H,
        options: SubscribeOptions,
    ) -> CatgaResult<Subscription>
    where
        E: Event,
        H: Fn(E, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CatgaResult<()>> + Send + 'static,
    {
        let codec = self.codec;
        let subject = self.subjects.subject_for::<E>();
        let handler = Arc::new(handler);

        let subscriber: SubscriberFn = Arc::new(move |envelope: TransportEnvelope| {
            let handler = handler.clone();
            Box::pin(async move {
                let event: E = codec.decode(&envelope.payload)?;
                let ctx = envelope.to_context();
                handler(event, ctx).await
            })
        });

        self.transport.subscribe(&subject, subscriber, options).await
    }
}

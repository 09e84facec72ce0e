//! Transport abstraction with three delivery guarantees.
//!
//! The byte-level [`Transport`] trait is what a broker backend implements;
//! [`MessageBus`] layers typed publish/subscribe on top of it. The shipped
//! [`InProcessTransport`] dispatches within the process and honors the same
//! QoS contract an external broker backend must satisfy:
//!
//! - `AtMostOnce`: fire-and-forget, handler errors swallowed
//! - `AtLeastOnce`: publisher waits for every subscriber, bounded retries
//! - `ExactlyOnce`: duplicate message ids inside the dedup window are
//!   dropped silently

pub mod bus;
pub mod dedup;
pub mod inproc;

pub use bus::MessageBus;
pub use dedup::{Deduplicator, InMemoryDeduplicator};
pub use inproc::{InProcessTransport, InProcessTransportConfig};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use catga_common::{
    CatgaResult, DeliveryMode, Message, MessageContext, MessageId, QosLevel,
};

/// Default subject prefix.
pub const DEFAULT_SUBJECT_PREFIX: &str = "catga";

/// The record that crosses process boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportEnvelope {
    pub msg_id: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub corr_id: Option<i64>,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub qos: QosLevel,
    #[serde(default)]
    pub delivery: DeliveryMode,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    pub payload: Bytes,
}

impl TransportEnvelope {
    pub fn from_context(ctx: &MessageContext, payload: Bytes) -> Self {
        Self {
            msg_id: ctx.message_id.raw(),
            corr_id: ctx.correlation_id.map(|id| id.raw()),
            msg_type: ctx.message_type.clone(),
            qos: ctx.qos,
            delivery: ctx.delivery_mode,
            sent_at: ctx.sent_at,
            retry_count: ctx.retry_count,
            payload,
        }
    }

    /// Rebuild the receive-side context.
    pub fn to_context(&self) -> MessageContext {
        let mut ctx = MessageContext::new(MessageId::from_raw(self.msg_id), self.msg_type.clone())
            .with_qos(self.qos)
            .with_delivery_mode(self.delivery);
        ctx.correlation_id = self.corr_id.map(MessageId::from_raw);
        ctx.sent_at = self.sent_at;
        ctx.retry_count = self.retry_count;
        ctx
    }
}

/// Maps message types to broker subjects: `<prefix>.<MessageTypeSimpleName>`.
#[derive(Debug, Clone)]
pub struct SubjectMapper {
    prefix: String,
}

impl SubjectMapper {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn subject_for_type(&self, message_type: &str) -> String {
        format!("{}.{}", self.prefix, message_type)
    }

    pub fn subject_for<M: Message>(&self) -> String {
        self.subject_for_type(M::message_type())
    }
}

impl Default for SubjectMapper {
    fn default() -> Self {
        Self::new(DEFAULT_SUBJECT_PREFIX)
    }
}

/// Handler invoked for each delivered envelope.
pub type SubscriberFn =
    Arc<dyn Fn(TransportEnvelope) -> BoxFuture<'static, CatgaResult<()>> + Send + Sync>;

/// Per-subscription delivery options.
#[derive(Debug, Clone, Copy)]
pub struct SubscribeOptions {
    /// Deliver envelopes to this subscriber one at a time, in publish order.
    /// Unordered subscriptions may handle envelopes concurrently.
    pub ordered: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self { ordered: true }
    }
}

/// Live subscription handle. Dropping the handle leaves the subscription
/// active; call [`Subscription::unsubscribe`] to stop deliveries.
pub struct Subscription {
    id: u64,
    subject: String,
    cancel: Box<dyn FnOnce() + Send>,
}

impl Subscription {
    pub fn new(id: u64, subject: impl Into<String>, cancel: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            id,
            subject: subject.into(),
            cancel,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Stop deliveries. After this returns the subscriber function will not
    /// be invoked for envelopes it had not already observed.
    pub fn unsubscribe(self) {
        (self.cancel)();
    }
}

/// Byte-level backend contract.
///
/// Any broker that can publish to a subject, subscribe a handler and honor
/// the QoS rules above can be plugged in behind this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identifier used in logs and spans.
    fn name(&self) -> &str;

    async fn publish(&self, subject: &str, envelope: TransportEnvelope) -> CatgaResult<()>;

    async fn publish_batch(
        &self,
        subject: &str,
        envelopes: Vec<TransportEnvelope>,
    ) -> CatgaResult<()> {
        for envelope in envelopes {
            self.publish(subject, envelope).await?;
        }
        Ok(())
    }

    /// Point-to-point variant: deliver to one named destination.
    async fn send(&self, destination: &str, envelope: TransportEnvelope) -> CatgaResult<()>;

    async fn subscribe(
        &self,
        subject: &str,
        handler: SubscriberFn,
        options: SubscribeOptions,
    ) -> CatgaResult<Subscription>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_mapping_uses_prefix_and_simple_name() {
        let mapper = SubjectMapper::default();
        assert_eq!(mapper.subject_for_type("OrderCreated"), "catga.OrderCreated");

        let custom = SubjectMapper::new("billing");
        assert_eq!(custom.subject_for_type("Invoiced"), "billing.Invoiced");
    }

    #[test]
    fn envelope_round_trips_context() {
        let ctx = MessageContext::new(MessageId::from_raw(42), "OrderCreated")
            .with_correlation(MessageId::from_raw(7))
            .with_qos(QosLevel::ExactlyOnce);
        let envelope = TransportEnvelope::from_context(&ctx, Bytes::from_static(b"{}"));

        let back = envelope.to_context();
        assert_eq!(back.message_id, ctx.message_id);
        assert_eq!(back.correlation_id, ctx.correlation_id);
        assert_eq!(back.message_type, "OrderCreated");
        assert_eq!(back.qos, QosLevel::ExactlyOnce);
    }

    #[test]
    fn envelope_wire_names_are_camel_case() {
        let ctx = MessageContext::new(MessageId::from_raw(42), "OrderCreated");
        let envelope = TransportEnvelope::from_context(&ctx, Bytes::from_static(b"{}"));
        let json = serde_json::to_value(&envelope).unwrap();

        assert!(json.get("msgId").is_some());
        assert!(json.get("type").is_some());
        assert!(json.get("sentAt").is_some());
        assert!(json.get("corrId").is_none());
    }
}

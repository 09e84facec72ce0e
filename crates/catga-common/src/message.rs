//! Message traits, delivery flags and the per-message context.
//!
//! A request targets exactly one handler and produces a typed response; an
//! event fans out to any number of handlers. Both are plain serde values --
//! the surrounding metadata travels in [`MessageContext`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CatgaResult;
use crate::id::MessageId;

/// Delivery guarantee selector. Cost and guarantees grow with the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum QosLevel {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QosLevel {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(QosLevel::AtMostOnce),
            1 => Some(QosLevel::AtLeastOnce),
            2 => Some(QosLevel::ExactlyOnce),
            _ => None,
        }
    }
}

impl Default for QosLevel {
    fn default() -> Self {
        QosLevel::AtLeastOnce
    }
}

impl std::fmt::Display for QosLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QosLevel::AtMostOnce => "at_most_once",
            QosLevel::AtLeastOnce => "at_least_once",
            QosLevel::ExactlyOnce => "exactly_once",
        };
        f.write_str(name)
    }
}

/// Whether a publisher blocks on delivery or hands retries to the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DeliveryMode {
    #[default]
    WaitForResult,
    AsyncRetry,
}

/// Anything that can travel through the mediator or a transport.
pub trait Message: Send + Sync + 'static {
    /// Short type name used for subjects, telemetry and persistence.
    fn message_type() -> &'static str
    where
        Self: Sized,
    {
        short_type_name::<Self>()
    }
}

/// A command/query with exactly one handler and a typed response.
pub trait Request: Message + Clone + Serialize + DeserializeOwned {
    type Response: Send + Serialize + DeserializeOwned + 'static;

    /// Input validation hook; the ValidationBehavior calls this before the
    /// handler runs.
    fn validate(&self) -> CatgaResult<()> {
        Ok(())
    }
}

/// A fact that happened; fans out to zero or more handlers.
pub trait Event: Message + Clone + Serialize + DeserializeOwned {}

/// Strip the module path (and any generic path segments) from a Rust type
/// name: `my_app::orders::OrderCreated` becomes `OrderCreated`.
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

/// Metadata that accompanies one message through pipeline, transport and
/// stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageContext {
    pub message_id: MessageId,
    pub correlation_id: Option<MessageId>,
    pub message_type: String,
    pub qos: QosLevel,
    pub delivery_mode: DeliveryMode,
    pub sent_at: DateTime<Utc>,
    pub retry_count: u32,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl MessageContext {
    pub fn new(message_id: MessageId, message_type: impl Into<String>) -> Self {
        Self {
            message_id,
            correlation_id: None,
            message_type: message_type.into(),
            qos: QosLevel::default(),
            delivery_mode: DeliveryMode::default(),
            sent_at: Utc::now(),
            retry_count: 0,
            metadata: HashMap::new(),
        }
    }

    pub fn for_message<M: Message>(message_id: MessageId) -> Self {
        Self::new(message_id, M::message_type())
    }

    pub fn with_correlation(mut self, correlation_id: MessageId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_qos(mut self, qos: QosLevel) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

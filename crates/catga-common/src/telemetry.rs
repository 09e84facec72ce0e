//! Telemetry names shared by every boundary component.
//!
//! All recording goes through the `metrics` and `tracing` facades, so it is
//! a no-op unless the host process installs a recorder/subscriber.

/// Counter names.
pub mod counters {
    pub const COMMANDS: &str = "catga_commands_total";
    pub const EVENTS: &str = "catga_events_total";
    pub const EVENT_HANDLER_FAILURES: &str = "catga_event_handler_failures_total";
    pub const OUTBOX_ADDED: &str = "catga_outbox_added_total";
    pub const OUTBOX_PUBLISHED: &str = "catga_outbox_published_total";
    pub const OUTBOX_FAILED: &str = "catga_outbox_failed_total";
    pub const INBOX_PROCESSED: &str = "catga_inbox_processed_total";
    pub const INBOX_LOCKED: &str = "catga_inbox_locked_total";
    pub const DLQ_ADDED: &str = "catga_dlq_added_total";
    pub const RESILIENCE_RETRIES: &str = "catga_resilience_retry_total";
    pub const BATCH_OVERFLOW: &str = "catga_batch_overflow_total";
    pub const TRANSPORT_DEDUP_DROPPED: &str = "catga_transport_dedup_dropped_total";
}

/// Span tag keys for boundary operations.
pub mod tags {
    pub const MESSAGING_SYSTEM: &str = "messaging.system";
    pub const DESTINATION: &str = "messaging.destination.name";
    pub const OPERATION: &str = "messaging.operation";
    pub const MESSAGE_ID: &str = "catga.message.id";
    pub const MESSAGE_TYPE: &str = "catga.message.type";
    pub const QOS: &str = "catga.qos";
    pub const CORRELATION_ID: &str = "catga.correlation_id";
    pub const SUCCESS: &str = "catga.success";
    pub const ERROR: &str = "catga.error";
    pub const DURATION_MS: &str = "catga.duration.ms";
}

/// `messaging.system` value for every Catga span.
pub const MESSAGING_SYSTEM_NAME: &str = "catga";

/// `messaging.operation` values.
pub const OPERATION_PUBLISH: &str = "publish";
pub const OPERATION_RECEIVE: &str = "receive";

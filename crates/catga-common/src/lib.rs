//! Core types shared by every Catga crate.
//!
//! - Time-ordered 64-bit message ids
//! - Message/Request/Event traits and the per-message context
//! - The `CatgaError` taxonomy and `CatgaResult`
//! - Logging bootstrap and telemetry name constants

pub mod error;
pub mod id;
pub mod logging;
pub mod message;
pub mod telemetry;

pub use error::{CatgaError, CatgaResult, ErrorKind};
pub use id::{next_message_id, ClockPolicy, IdGenerator, MessageId};
pub use message::{
    short_type_name, DeliveryMode, Event, Message, MessageContext, QosLevel, Request,
};

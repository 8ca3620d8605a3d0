//! Message broker: submission, subscription-based delivery, atomic claim,
//! request/response correlation, and broadcast fan-out with per-recipient
//! tracking.

pub mod broadcast;
#[allow(clippy::module_inception)]
pub mod broker;
pub mod error;
pub mod message;

pub use broadcast::{BroadcastTracker, DeliveryRecord, DeliveryStats};
pub use broker::{MessageBroker, DEFAULT_ASK_TIMEOUT};
pub use error::{BrokerError, Result};
pub use message::{
    DeliveryStatus, Message, MessageKind, MessageStatus, Submit, PROTOCOL_VERSION,
};

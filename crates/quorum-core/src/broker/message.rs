//! Message envelope and related types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version stamped on every message.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Message lifecycle status.
///
/// Direct messages move `pending -> processing -> done | failed`. Broadcast
/// rows stay `pending` until expiration; per-recipient progress is tracked
/// in delivery rows instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a consumer.
    Processing,
    /// Processed successfully.
    Done,
    /// Processing failed.
    Failed,
}

impl MessageStatus {
    /// String form stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Processing => "processing",
            MessageStatus::Done => "done",
            MessageStatus::Failed => "failed",
        }
    }

    /// Parses the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MessageStatus::Pending),
            "processing" => Some(MessageStatus::Processing),
            "done" => Some(MessageStatus::Done),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }
}

/// Semantic message type.
///
/// The standard variants are routing labels, not enforced schemas; anything
/// else flows through `Other` untouched so peers can introduce new types
/// without a lockstep upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum MessageKind {
    ContextQuery,
    ContextResponse,
    TaskClaim,
    TaskUpdate,
    VoteInitiate,
    VoteCast,
    VoteResult,
    Heartbeat,
    Broadcast,
    Other(String),
}

impl MessageKind {
    /// The dotted label stored and routed on, e.g. `context.query`.
    pub fn label(&self) -> &str {
        match self {
            MessageKind::ContextQuery => "context.query",
            MessageKind::ContextResponse => "context.response",
            MessageKind::TaskClaim => "task.claim",
            MessageKind::TaskUpdate => "task.update",
            MessageKind::VoteInitiate => "vote.initiate",
            MessageKind::VoteCast => "vote.cast",
            MessageKind::VoteResult => "vote.result",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Broadcast => "broadcast",
            MessageKind::Other(label) => label,
        }
    }

    /// Parses a dotted label; unknown labels become `Other`.
    pub fn from_label(label: &str) -> Self {
        match label {
            "context.query" => MessageKind::ContextQuery,
            "context.response" => MessageKind::ContextResponse,
            "task.claim" => MessageKind::TaskClaim,
            "task.update" => MessageKind::TaskUpdate,
            "vote.initiate" => MessageKind::VoteInitiate,
            "vote.cast" => MessageKind::VoteCast,
            "vote.result" => MessageKind::VoteResult,
            "heartbeat" => MessageKind::Heartbeat,
            "broadcast" => MessageKind::Broadcast,
            other => MessageKind::Other(other.to_string()),
        }
    }

    /// The response type paired with this request type: the last label
    /// segment is replaced with `response` (`context.query` ->
    /// `context.response`).
    pub fn response_kind(&self) -> MessageKind {
        let label = self.label();
        let response = match label.rsplit_once('.') {
            Some((base, _)) => format!("{}.response", base),
            None => "response".to_string(),
        };
        MessageKind::from_label(&response)
    }
}

impl From<String> for MessageKind {
    fn from(label: String) -> Self {
        MessageKind::from_label(&label)
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        kind.label().to_string()
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-recipient delivery state of a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Fanned out to the recipient, not yet acted on.
    Delivered,
    /// Claimed by the recipient.
    Acknowledged,
    /// Explicitly dismissed by the recipient.
    Skipped,
}

impl DeliveryStatus {
    /// String form stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Acknowledged => "acknowledged",
            DeliveryStatus::Skipped => "skipped",
        }
    }

    /// Parses the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "delivered" => Some(DeliveryStatus::Delivered),
            "acknowledged" => Some(DeliveryStatus::Acknowledged),
            "skipped" => Some(DeliveryStatus::Skipped),
            _ => None,
        }
    }
}

/// A message envelope as persisted in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub id: String,
    /// Semantic type (dotted label).
    pub kind: MessageKind,
    /// Protocol version the message was written with.
    pub version: String,
    /// Token linking a request to its reply.
    pub correlation_id: Option<String>,
    /// Sender agent id.
    pub from_agent: String,
    /// Recipient agent id; `None` means broadcast.
    pub to_agent: Option<String>,
    /// Routing channel.
    pub channel: String,
    /// Priority 1 (lowest) to 10 (highest).
    pub priority: u8,
    /// Opaque structured payload.
    pub payload: Value,
    /// Lifecycle status.
    pub status: MessageStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Expiration timestamp, if a TTL was given.
    pub expires_at: Option<DateTime<Utc>>,
    /// How many times the message was claimed.
    pub delivery_count: u32,
    /// Last claim timestamp.
    pub last_delivered_at: Option<DateTime<Utc>>,
    /// Error recorded on failed completion.
    pub error: Option<String>,
}

impl Message {
    /// Whether this message is a broadcast.
    pub fn is_broadcast(&self) -> bool {
        self.to_agent.is_none()
    }
}

/// Parameters for submitting a message.
#[derive(Debug, Clone)]
pub struct Submit {
    /// Sender agent id.
    pub from_agent: String,
    /// Recipient agent id; `None` broadcasts on the channel.
    pub to_agent: Option<String>,
    /// Semantic type.
    pub kind: MessageKind,
    /// Structured payload (must be a JSON object).
    pub payload: Value,
    /// Routing channel.
    pub channel: String,
    /// Priority 1-10.
    pub priority: u8,
    /// Correlation token for request/response pairs.
    pub correlation_id: Option<String>,
    /// Time to live in seconds.
    pub ttl_secs: Option<u64>,
}

impl Submit {
    /// Builds a direct message with defaults (channel `general`, priority 5).
    pub fn direct(
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        kind: MessageKind,
        payload: Value,
    ) -> Self {
        Self {
            from_agent: from_agent.into(),
            to_agent: Some(to_agent.into()),
            kind,
            payload,
            channel: "general".to_string(),
            priority: 5,
            correlation_id: None,
            ttl_secs: None,
        }
    }

    /// Builds a broadcast on `general` with priority 5.
    pub fn broadcast(from_agent: impl Into<String>, kind: MessageKind, payload: Value) -> Self {
        Self {
            from_agent: from_agent.into(),
            to_agent: None,
            kind,
            payload,
            channel: "general".to_string(),
            priority: 5,
            correlation_id: None,
            ttl_secs: None,
        }
    }

    /// Sets the routing channel.
    pub fn on_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Sets the time to live.
    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = Some(ttl_secs);
        self
    }
}

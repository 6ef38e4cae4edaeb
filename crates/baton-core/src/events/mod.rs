//! Domain events and the in-process bus that delivers them.
//!
//! Every event travels inside an [`EventEnvelope`]. The payload is a tagged
//! union ([`EventPayload`]) and its tag ([`EventType`]) is the only thing the
//! bus dispatches on.
//!
//! ```rust
//! use baton_core::events::{EventEnvelope, EventType, ExecutionCompleted};
//!
//! let envelope = EventEnvelope::new(ExecutionCompleted {
//!     execution_id: "exec-1".into(),
//!     agent_id: "agent-7".into(),
//!     success: true,
//!     duration_ms: 420,
//!     output: None,
//!     error: None,
//! })
//! .with_metadata("source", "worker-3");
//!
//! assert_eq!(envelope.event_type(), EventType::ExecutionCompleted);
//! ```

mod bus;
mod handler;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};
use uuid::Uuid;

pub use bus::{EventBus, EventBusStats};
pub use handler::{handler_fn, EventHandler, FnHandler, SubscriptionId};

// ============================================================================
// Tags
// ============================================================================

/// Discriminant of [`EventPayload`]; handlers subscribe by this.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventType {
    ExecutionRequested,
    ExecutionCompleted,
    RoutingDecision,
    FeedbackReceived,
    UserContextUpdated,
    AgentConfigChanged,
    SystemAlert,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// How the bus runs the handlers of one event.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum DispatchMode {
    /// Run all handlers concurrently and wait for every one before taking
    /// the next event. Handling follows publish order.
    #[default]
    AwaitAll,
    /// Spawn each handler and move on immediately. Handlers of consecutive
    /// events may overlap.
    Detached,
}

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequested {
    pub execution_id: String,
    pub agent_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub input: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionCompleted {
    pub execution_id: String,
    pub agent_id: String,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub request_id: String,
    pub user_id: String,
    pub agent_id: String,
    /// 0.0 to 1.0
    pub confidence: f64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackReceived {
    pub execution_id: String,
    pub user_id: String,
    pub rating: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContextUpdated {
    pub user_id: String,
    /// Names of the context fields that changed
    pub fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfigChanged {
    pub agent_id: String,
    pub change_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemAlert {
    pub severity: Severity,
    pub source: String,
    pub message: String,
}

/// Variant-specific event data, tagged by [`EventType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    ExecutionRequested(ExecutionRequested),
    ExecutionCompleted(ExecutionCompleted),
    RoutingDecision(RoutingDecision),
    FeedbackReceived(FeedbackReceived),
    UserContextUpdated(UserContextUpdated),
    AgentConfigChanged(AgentConfigChanged),
    SystemAlert(SystemAlert),
}

impl EventPayload {
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        match self {
            Self::ExecutionRequested(_) => EventType::ExecutionRequested,
            Self::ExecutionCompleted(_) => EventType::ExecutionCompleted,
            Self::RoutingDecision(_) => EventType::RoutingDecision,
            Self::FeedbackReceived(_) => EventType::FeedbackReceived,
            Self::UserContextUpdated(_) => EventType::UserContextUpdated,
            Self::AgentConfigChanged(_) => EventType::AgentConfigChanged,
            Self::SystemAlert(_) => EventType::SystemAlert,
        }
    }
}

macro_rules! payload_from {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for EventPayload {
                fn from(payload: $variant) -> Self {
                    Self::$variant(payload)
                }
            }

            impl From<$variant> for EventEnvelope {
                fn from(payload: $variant) -> Self {
                    Self::new(EventPayload::$variant(payload))
                }
            }
        )*
    };
}

payload_from!(
    ExecutionRequested,
    ExecutionCompleted,
    RoutingDecision,
    FeedbackReceived,
    UserContextUpdated,
    AgentConfigChanged,
    SystemAlert,
);

// ============================================================================
// Envelope
// ============================================================================

/// A published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// UUID v7, so ids sort by creation time.
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl EventEnvelope {
    pub fn new(payload: impl Into<EventPayload>) -> Self {
        Self {
            id: Uuid::now_v7(),
            timestamp: Utc::now(),
            payload: payload.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub const fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}

impl From<EventPayload> for EventEnvelope {
    fn from(payload: EventPayload) -> Self {
        Self::new(payload)
    }
}

//! Domain types for the Skvil-Piertotum broker and worker
//!
//! Strongly-typed domain values parsed at the API boundary, plus the quota
//! constants enforced by the broker state engine.

use chrono::{DateTime, Utc};
use nutype::nutype;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Maximum number of concurrently registered agents.
pub const MAX_AGENTS: usize = 100;

/// Maximum queued messages per agent; overflow drops the oldest.
pub const MAX_MESSAGES_PER_AGENT: usize = 200;

/// Maximum number of distinct context keys.
pub const MAX_CONTEXT_KEYS: usize = 1000;

/// Maximum serialized size of a context value in bytes (100 KiB).
pub const MAX_CONTEXT_VALUE_SIZE: usize = 100 * 1024;

/// Maximum message content size in bytes (512 KiB).
pub const MAX_MESSAGE_CONTENT_SIZE: usize = 512 * 1024;

/// Reserved sender id for operator-originated messages.
pub const BROKER_SENDER: &str = "broker";

/// Display name resolved for operator-originated messages.
pub const BROKER_DISPLAY_NAME: &str = "Operador";

/// Identifier of a registered agent
///
/// Any non-empty string is a valid id on the broker side; workers sanitize
/// their own ids to `[a-z0-9-]` before registering (see `config`).
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        Deref,
        TryFrom,
        Into
    )
)]
pub struct AgentId(String);

/// Display name of an agent
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        Deref,
        TryFrom,
        Into
    )
)]
pub struct AgentName(String);

/// Key in the shared context store
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        Deref,
        TryFrom,
        Into
    )
)]
pub struct ContextKey(String);

/// Broker-generated message identifier
///
/// Generated as `<millis>-<suffix>` where the suffix is random base-36.
/// Collisions are negligible within a broker process lifetime.
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    Deref,
    From,
    Into
))]
pub struct MessageId(String);

impl MessageId {
    /// Generates a fresh id for a message enqueued at `now`.
    pub fn generate(now: DateTime<Utc>) -> Self {
        Self::new(format!("{}-{}", now.timestamp_millis(), random_base36(6)))
    }
}

/// Worker poll interval in milliseconds, at least one second
#[nutype(
    validate(greater_or_equal = 1000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10_000
)]
pub struct PollIntervalMs(u64);

impl PollIntervalMs {
    /// Converts to a `Duration` for use with tokio timers.
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis((*self).into_inner())
    }
}

/// Kind tag carried by every message
///
/// Unknown wire values are coerced to `Text` rather than rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Code,
    Schema,
    Endpoint,
    Config,
}

impl MessageType {
    /// Parses the wire representation, defaulting unknown values to `Text`.
    pub fn from_wire(raw: Option<&str>) -> Self {
        match raw {
            Some("code") => Self::Code,
            Some("schema") => Self::Schema,
            Some("endpoint") => Self::Endpoint,
            Some("config") => Self::Config,
            _ => Self::Text,
        }
    }

    /// The type an autonomous reply carries: the incoming type, except that
    /// `config` is downgraded to `text` (replies are never configuration).
    pub fn reply_type(self) -> Self {
        match self {
            Self::Config => Self::Text,
            other => other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Code => "code",
            Self::Schema => "schema",
            Self::Endpoint => "endpoint",
            Self::Config => "config",
        }
    }
}

/// Returns `len` random characters drawn from `[0-9a-z]`.
pub fn random_base36(len: usize) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

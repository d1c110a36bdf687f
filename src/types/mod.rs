//! Core trust types: the taint lattice and channel message envelopes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Trust label attached to data, ordered from most to least trusted.
///
/// The derived `Ord` gives `Owner < Auth < External`, so the lattice
/// join is simply [`TaintLevel::join`] (= `max`). Taint only ratchets
/// upward through an execution: once external data touches a chain of
/// tool calls, everything downstream is external-tainted.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaintLevel {
    /// Owner-generated or owner-approved content.
    Owner,
    /// Content from authenticated third-party integrations.
    Auth,
    /// Raw external content — full taint.
    External,
}

impl TaintLevel {
    /// Lattice join: the higher (less trusted) of two levels.
    pub fn join(self, other: TaintLevel) -> TaintLevel {
        self.max(other)
    }

    /// String form stored in SQLite and emitted in audit events.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Auth => "auth",
            Self::External => "external",
        }
    }
}

impl std::fmt::Display for TaintLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaintLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Self::Owner),
            "auth" => Ok(Self::Auth),
            "external" => Ok(Self::External),
            other => Err(anyhow::anyhow!("unknown taint level: {other}")),
        }
    }
}

/// A normalized message from a channel adapter (CLI, Telegram, Web).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    /// Channel identifier (e.g. "cli", "telegram").
    pub channel: String,
    /// Channel-scoped sender identity.
    pub sender_id: String,
    /// Message text.
    pub text: String,
    /// When the message was received.
    pub timestamp: DateTime<Utc>,
    /// Attachment references.
    #[serde(default)]
    pub attachments: Vec<String>,
    /// Message this one replies to, if any.
    #[serde(default)]
    pub reply_to: Option<String>,
}

impl ChannelMessage {
    /// Build a message stamped with the current time and no attachments.
    pub fn new(channel: impl Into<String>, sender_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            sender_id: sender_id.into(),
            text: text.into(),
            timestamp: Utc::now(),
            attachments: Vec::new(),
            reply_to: None,
        }
    }
}

/// An inbound message after channel authentication.
///
/// The channel adapter authenticates the sender and attaches the
/// signature; the kernel never self-signs inbound content. `taint`
/// defaults to [`TaintLevel::External`] — trust must be established,
/// never assumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedMessage {
    /// The authenticated message.
    pub message: ChannelMessage,
    /// Channel-layer signature over the canonical message bytes.
    #[serde(with = "crate::approval::base64_bytes")]
    pub signature: Vec<u8>,
    /// Random 128-bit freshness nonce (hex).
    pub nonce: String,
    /// Trust classification of the sender context.
    pub taint: TaintLevel,
}

impl SignedMessage {
    /// Wrap a message with a fresh random nonce and the given taint.
    pub fn unsigned(message: ChannelMessage, taint: TaintLevel) -> Self {
        Self {
            message,
            signature: Vec::new(),
            nonce: fresh_nonce(),
            taint,
        }
    }
}

/// Canonical bytes a channel signature covers: `{text, timestamp, nonce}`.
pub fn signed_message_canonical_bytes(message: &ChannelMessage, nonce: &str) -> Vec<u8> {
    crate::canonical::to_canonical_bytes(&json!({
        "text": message.text,
        "timestamp": message.timestamp.to_rfc3339(),
        "nonce": nonce,
    }))
}

/// Generate a random 128-bit nonce as lowercase hex.
pub fn fresh_nonce() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taint_ordering() {
        assert!(TaintLevel::Owner < TaintLevel::Auth);
        assert!(TaintLevel::Auth < TaintLevel::External);
    }

    #[test]
    fn test_taint_join_is_max() {
        assert_eq!(
            TaintLevel::Owner.join(TaintLevel::External),
            TaintLevel::External
        );
        assert_eq!(TaintLevel::Auth.join(TaintLevel::Owner), TaintLevel::Auth);
        assert_eq!(TaintLevel::Owner.join(TaintLevel::Owner), TaintLevel::Owner);
    }

    #[test]
    fn test_taint_roundtrip() {
        for level in [TaintLevel::Owner, TaintLevel::Auth, TaintLevel::External] {
            let s = level.to_string();
            let parsed: TaintLevel = s.parse().expect("roundtrip should work");
            assert_eq!(level, parsed);
        }
    }

    #[test]
    fn test_taint_from_str_invalid() {
        assert!("bogus".parse::<TaintLevel>().is_err());
        assert!("".parse::<TaintLevel>().is_err());
    }

    #[test]
    fn test_taint_serde_lowercase() {
        let json = serde_json::to_string(&TaintLevel::External).expect("serialize");
        assert_eq!(json, "\"external\"");
    }

    #[test]
    fn test_fresh_nonce_is_128_bit_hex() {
        let nonce = fresh_nonce();
        assert_eq!(nonce.len(), 32);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(nonce, fresh_nonce());
    }

    #[test]
    fn test_canonical_bytes_include_nonce() {
        let msg = ChannelMessage::new("cli", "owner", "hello");
        let bytes = signed_message_canonical_bytes(&msg, "abc123");
        let text = String::from_utf8(bytes).expect("utf8");
        assert!(text.contains("\"nonce\":\"abc123\""));
        assert!(text.contains("\"text\":\"hello\""));
    }
}

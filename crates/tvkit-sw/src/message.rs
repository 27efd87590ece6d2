//! Page-to-worker control messages.

use serde::{Deserialize, Serialize};

use crate::ServiceWorkerId;

/// Message a page may post to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Activate now instead of waiting for every controlled page to close.
    SkipWaiting,
}

impl ControlMessage {
    /// Decode a message from its JSON wire form.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// A control message addressed to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlEnvelope {
    pub target: ServiceWorkerId,
    pub message: ControlMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_string(&ControlMessage::SkipWaiting).unwrap();
        assert_eq!(json, r#"{"type":"SKIP_WAITING"}"#);
        assert_eq!(
            ControlMessage::from_json(&json).unwrap(),
            ControlMessage::SkipWaiting
        );
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(ControlMessage::from_json(r#"{"type":"CLAIM"}"#).is_err());
    }
}

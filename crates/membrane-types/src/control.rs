//! Control frames on the observe endpoint.

use serde::{Deserialize, Serialize};

/// Subscriber-to-hub control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Subscribe { channels: Vec<String> },
    Unsubscribe { channels: Vec<String> },
}

impl ControlMessage {
    /// Parse a control frame.
    ///
    /// # Errors
    ///
    /// Returns the serde error for anything that is not a subscribe or
    /// unsubscribe frame.
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Hub-to-subscriber reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlReply {
    #[serde(rename = "subscribe.ack")]
    SubscribeAck { channels: Vec<String> },
    #[serde(rename = "unsubscribe.ack")]
    UnsubscribeAck { channels: Vec<String> },
    #[serde(rename = "error")]
    Error { message: String },
}

impl ControlReply {
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subscribe() {
        let msg = ControlMessage::parse(br#"{"type":"subscribe","channels":["a.b","c.d"]}"#).unwrap();
        assert_eq!(
            msg,
            ControlMessage::Subscribe {
                channels: vec!["a.b".into(), "c.d".into()]
            }
        );
    }

    #[test]
    fn test_reject_other_frames() {
        assert!(ControlMessage::parse(br#"{"type":"publish","channels":[]}"#).is_err());
        assert!(ControlMessage::parse(br#"{"type":"subscribe"}"#).is_err());
    }

    #[test]
    fn test_ack_shape() {
        let ack = ControlReply::SubscribeAck {
            channels: vec!["a.b".into()],
        };
        assert_eq!(ack.to_json(), r#"{"type":"subscribe.ack","channels":["a.b"]}"#);
    }
}

//! Channel naming.
//!
//! Accepted shapes:
//!
//! - `ecosystem/{ecosystem}/org/{org}/<domain>.<action>` (tenant scoped)
//! - `ecosystem/{ecosystem}/protocol/<domain>.<action>` (protocol scoped)
//! - `<domain>.<action>` (legacy global topic)

use std::fmt;

/// Topic the reporter publishes on when no scoped channel can be derived.
pub const GLOBAL_FAILURE_CHANNEL: &str = "failure.emit";

const FAILURE_TOPIC: &str = "failure.emit";

/// Where a channel lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelScope {
    Org { ecosystem: String, org: String },
    Protocol { ecosystem: String },
    Global,
}

/// A parsed channel name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelRoute {
    scope: ChannelScope,
    topic: String,
}

impl ChannelRoute {
    /// Parse a channel string. Returns `None` if it follows none of the
    /// accepted shapes.
    #[must_use]
    pub fn parse(channel: &str) -> Option<Self> {
        let parts: Vec<&str> = channel.split('/').collect();
        let (scope, topic) = match parts.as_slice() {
            [topic] => (ChannelScope::Global, *topic),
            ["ecosystem", eco, "org", org, topic] if valid_segment(eco) && valid_segment(org) => (
                ChannelScope::Org {
                    ecosystem: (*eco).to_string(),
                    org: (*org).to_string(),
                },
                *topic,
            ),
            ["ecosystem", eco, "protocol", topic] if valid_segment(eco) => (
                ChannelScope::Protocol {
                    ecosystem: (*eco).to_string(),
                },
                *topic,
            ),
            _ => return None,
        };

        if !valid_topic(topic) {
            return None;
        }
        Some(Self {
            scope,
            topic: topic.to_string(),
        })
    }

    #[must_use]
    pub fn scope(&self) -> &ChannelScope {
        &self.scope
    }

    /// `<domain>.<action>` part, e.g. `docs.view.request`.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Organization owning the channel, if tenant scoped.
    #[must_use]
    pub fn tenant(&self) -> Option<&str> {
        match &self.scope {
            ChannelScope::Org { org, .. } => Some(org),
            _ => None,
        }
    }

    /// Same scope, different topic.
    #[must_use]
    pub fn sibling(&self, topic: &str) -> Self {
        Self {
            scope: self.scope.clone(),
            topic: topic.to_string(),
        }
    }

    /// Reply channel for a `*.request` topic (`economy.quote.request` becomes
    /// `economy.quote.response`).
    #[must_use]
    pub fn reply(&self) -> Option<Self> {
        self.topic
            .strip_suffix(".request")
            .map(|stem| self.sibling(&format!("{stem}.response")))
    }

    /// Failure channel in the same scope.
    #[must_use]
    pub fn failure_channel(&self) -> String {
        self.sibling(FAILURE_TOPIC).to_string()
    }
}

impl fmt::Display for ChannelRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            ChannelScope::Org { ecosystem, org } => {
                write!(f, "ecosystem/{ecosystem}/org/{org}/{}", self.topic)
            }
            ChannelScope::Protocol { ecosystem } => {
                write!(f, "ecosystem/{ecosystem}/protocol/{}", self.topic)
            }
            ChannelScope::Global => f.write_str(&self.topic),
        }
    }
}

/// Failure channel for an arbitrary (possibly malformed) channel string.
#[must_use]
pub fn failure_channel_for(channel: Option<&str>) -> String {
    channel
        .and_then(ChannelRoute::parse)
        .map(|route| route.failure_channel())
        .unwrap_or_else(|| GLOBAL_FAILURE_CHANNEL.to_string())
}

fn valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn valid_topic(topic: &str) -> bool {
    let mut pieces = 0;
    for piece in topic.split('.') {
        if !valid_segment(piece) {
            return false;
        }
        pieces += 1;
    }
    pieces >= 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_org_channel() {
        let route = ChannelRoute::parse("ecosystem/mind/org/acme/docs.view.request").unwrap();
        assert_eq!(route.tenant(), Some("acme"));
        assert_eq!(route.topic(), "docs.view.request");
        assert_eq!(
            route.failure_channel(),
            "ecosystem/mind/org/acme/failure.emit"
        );
        assert_eq!(
            route.to_string(),
            "ecosystem/mind/org/acme/docs.view.request"
        );
    }

    #[test]
    fn test_protocol_channel() {
        let route = ChannelRoute::parse("ecosystem/mind/protocol/graph.delta").unwrap();
        assert_eq!(route.tenant(), None);
        assert_eq!(
            route.failure_channel(),
            "ecosystem/mind/protocol/failure.emit"
        );
    }

    #[test]
    fn test_legacy_channel() {
        let route = ChannelRoute::parse("docs.view.request").unwrap();
        assert_eq!(route.scope(), &ChannelScope::Global);
        assert_eq!(route.failure_channel(), GLOBAL_FAILURE_CHANNEL);
    }

    #[test]
    fn test_rejects_bad_shapes() {
        for bad in [
            "",
            "nodot",
            "ecosystem/mind/org/acme",
            "ecosystem//org/acme/docs.view",
            "ecosystem/mind/team/acme/docs.view",
            "ecosystem/mind/org/acme/docs..view",
            "a/b",
        ] {
            assert!(ChannelRoute::parse(bad).is_none(), "{bad} should not parse");
        }
    }

    #[test]
    fn test_reply_channel() {
        let route = ChannelRoute::parse("ecosystem/mind/org/acme/economy.quote.request").unwrap();
        assert_eq!(
            route.reply().unwrap().to_string(),
            "ecosystem/mind/org/acme/economy.quote.response"
        );
        assert!(ChannelRoute::parse("docs.view.result")
            .unwrap()
            .reply()
            .is_none());
    }

    #[test]
    fn test_failure_channel_for_garbage() {
        assert_eq!(failure_channel_for(None), GLOBAL_FAILURE_CHANNEL);
        assert_eq!(failure_channel_for(Some("///")), GLOBAL_FAILURE_CHANNEL);
    }
}

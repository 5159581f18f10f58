//! Topic grammar shared by the catalog, the publishers and the command router.
//!
//! Every entity lives under `<prefix>/<kind>/<node>/<node>_<object>`; state
//! is published to `…/state`, discovery documents to `…/config` and commands
//! arrive on `…/do` or `…/set`.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    BinarySensor,
    Button,
    Text,
    Number,
    Update,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::BinarySensor => "binary_sensor",
            EntityKind::Button => "button",
            EntityKind::Text => "text",
            EntityKind::Number => "number",
            EntityKind::Update => "update",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Imperative action (shutdown, restart, recreate, backup, update).
    Do,
    /// State-changing configuration.
    Set,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Do => "do",
            Verb::Set => "set",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "do" => Some(Verb::Do),
            "set" => Some(Verb::Set),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("topic {0:?} has too few levels")]
    MalformedTopic(String),
    #[error("unknown verb {0:?}")]
    UnknownVerb(String),
    #[error("object id {object:?} does not belong to node {node:?}")]
    ForeignNode { object: String, node: String },
    #[error("no handler named {0:?}")]
    UnknownCommand(String),
}

/// One inbound command, parsed from its topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub verb: Verb,
    pub action: String,
    pub channel: Option<u8>,
    pub eq_channel: Option<u8>,
    pub payload: String,
}

impl Command {
    pub fn parse(topic: &str, payload: &str, node_id: &str) -> Result<Self, RouteError> {
        let levels: Vec<&str> = topic.split('/').collect();
        if levels.len() < 5 {
            return Err(RouteError::MalformedTopic(topic.to_string()));
        }
        let verb_str = levels[levels.len() - 1];
        let object_id = levels[levels.len() - 2];

        let verb =
            Verb::parse(verb_str).ok_or_else(|| RouteError::UnknownVerb(verb_str.to_string()))?;

        let mut action = object_id
            .strip_prefix(node_id)
            .and_then(|rest| rest.strip_prefix('_'))
            .ok_or_else(|| RouteError::ForeignNode {
                object: object_id.to_string(),
                node: node_id.to_string(),
            })?;

        let channel = match split_numbered(action, "ch") {
            Some((n, rest)) => {
                action = rest;
                Some(n)
            }
            None => None,
        };
        let eq_channel = match split_numbered(action, "eq") {
            Some((n, rest)) => {
                action = rest;
                Some(n)
            }
            None => None,
        };

        Ok(Self {
            verb,
            action: action.to_string(),
            channel,
            eq_channel,
            payload: payload.to_string(),
        })
    }

    /// Registry key: `<verb>_<action>`.
    pub fn handler_key(&self) -> String {
        format!("{}_{}", self.verb.as_str(), self.action)
    }
}

/// Split `<tag><NN>_<rest>` into `(NN, rest)`; two ASCII digits are required.
fn split_numbered<'a>(action: &'a str, tag: &str) -> Option<(u8, &'a str)> {
    let rest = action.strip_prefix(tag)?;
    let digits = rest.get(..2)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let rest = rest[2..].strip_prefix('_')?;
    Some((digits.parse().ok()?, rest))
}

/// Topic builder for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
    node_id: String,
    presence: String,
}

impl Topics {
    pub fn new(
        prefix: impl Into<String>,
        node_id: impl Into<String>,
        presence: impl Into<String>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            node_id: node_id.into(),
            presence: presence.into(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Automation hub birth/will topic.
    pub fn presence(&self) -> &str {
        &self.presence
    }

    /// `<node>_<object>`
    pub fn object_id(&self, object: &str) -> String {
        format!("{}_{}", self.node_id, object)
    }

    /// Entity base topic (the `~` of a discovery document).
    pub fn base(&self, kind: EntityKind, object: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.prefix,
            kind.as_str(),
            self.node_id,
            self.object_id(object)
        )
    }

    pub fn state(&self, kind: EntityKind, object: &str) -> String {
        format!("{}/state", self.base(kind, object))
    }

    pub fn config(&self, kind: EntityKind, object: &str) -> String {
        format!("{}/config", self.base(kind, object))
    }

    pub fn command(&self, kind: EntityKind, object: &str, verb: Verb) -> String {
        format!("{}/{}", self.base(kind, object), verb.as_str())
    }

    pub fn subscriptions(&self) -> Vec<String> {
        [Verb::Do, Verb::Set]
            .iter()
            .map(|v| format!("{}/+/{}/+/{}", self.prefix, self.node_id, v.as_str()))
            .collect()
    }
}

/// `ch<NN>`
pub fn channel_object(channel: u8) -> String {
    format!("ch{:02}", channel)
}

/// `ch<NN>_<suffix>`
pub fn channel_suffixed(channel: u8, suffix: &str) -> String {
    format!("ch{:02}_{}", channel, suffix)
}

/// `ch<NN>_eq<BB>_eqsetting`
pub fn eq_band_object(channel: u8, band: u8) -> String {
    format!("ch{:02}_eq{:02}_eqsetting", channel, band)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODE: &str = "smab827ebaabbcc";

    #[test]
    fn parses_channel_and_band() {
        for kind in ["number", "text", "button"] {
            let topic = format!("homeassistant/{}/{}/{}_ch07_eq03_eqsetting/set", kind, NODE, NODE);
            let cmd = Command::parse(&topic, "70", NODE).unwrap();
            assert_eq!(cmd.verb, Verb::Set);
            assert_eq!(cmd.action, "eqsetting");
            assert_eq!(cmd.channel, Some(7));
            assert_eq!(cmd.eq_channel, Some(3));
            assert_eq!(cmd.payload, "70");
            assert_eq!(cmd.handler_key(), "set_eqsetting");
        }
    }

    #[test]
    fn parses_plain_action() {
        let topic = format!("homeassistant/button/{}/{}_compose_recreate/do", NODE, NODE);
        let cmd = Command::parse(&topic, "PRESS", NODE).unwrap();
        assert_eq!(cmd.verb, Verb::Do);
        assert_eq!(cmd.action, "compose_recreate");
        assert_eq!(cmd.channel, None);
        assert_eq!(cmd.eq_channel, None);
    }

    #[test]
    fn eqpreset_is_not_a_band() {
        let topic = format!("homeassistant/button/{}/{}_ch02_eqpreset/set", NODE, NODE);
        let cmd = Command::parse(&topic, "rock", NODE).unwrap();
        assert_eq!(cmd.action, "eqpreset");
        assert_eq!(cmd.channel, Some(2));
        assert_eq!(cmd.eq_channel, None);
    }

    #[test]
    fn rejects_bad_topics() {
        assert!(matches!(
            Command::parse("a/b/c", "", NODE),
            Err(RouteError::MalformedTopic(_))
        ));
        let topic = format!("homeassistant/text/{}/{}_lms_host/get", NODE, NODE);
        assert_eq!(
            Command::parse(&topic, "", NODE),
            Err(RouteError::UnknownVerb("get".to_string()))
        );
        let topic = "homeassistant/text/other/other_lms_host/set";
        assert!(matches!(
            Command::parse(topic, "", NODE),
            Err(RouteError::ForeignNode { .. })
        ));
    }

    #[test]
    fn builds_topics() {
        let t = Topics::new("homeassistant", NODE, "homeassistant/status");
        assert_eq!(
            t.state(EntityKind::Number, &eq_band_object(2, 9)),
            format!("homeassistant/number/{}/{}_ch02_eq09_eqsetting/state", NODE, NODE)
        );
        assert_eq!(
            t.subscriptions(),
            vec![
                format!("homeassistant/+/{}/+/do", NODE),
                format!("homeassistant/+/{}/+/set", NODE),
            ]
        );
        assert_eq!(channel_object(3), "ch03");
    }
}

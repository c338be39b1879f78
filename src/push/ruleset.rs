//! Declarative push-rule data model, wire-compatible with the Matrix
//! push rule JSON (five ordered collections, string-or-object actions).

use ruma::UserId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

/// Ordered per-user notification policy.
///
/// Evaluation walks the collections strictly in the order they are
/// declared here; the first matching rule wins.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Ruleset {
    #[serde(default, rename = "override")]
    pub override_: Vec<PushRule>,
    #[serde(default)]
    pub content: Vec<PushRule>,
    #[serde(default)]
    pub room: Vec<PushRule>,
    #[serde(default)]
    pub sender: Vec<PushRule>,
    #[serde(default)]
    pub underride: Vec<PushRule>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PushRule {
    pub rule_id: String,
    #[serde(default)]
    pub default: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Override/underride rules: all conditions must match (AND).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<PushCondition>,
    /// Content rules: pattern matched against the event body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default)]
    pub actions: Vec<PushAction>,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PushCondition {
    EventMatch {
        key: String,
        #[serde(default)]
        pattern: String,
    },
    ContainsDisplayName,
    RoomMemberCount {
        #[serde(default)]
        is: String,
    },
    /// Conditions this engine does not know evaluate to false, never to
    /// an error.
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PushAction {
    Simple(SimpleAction),
    SetTweak {
        set_tweak: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<JsonValue>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimpleAction {
    Notify,
    DontNotify,
    Coalesce,
}

impl PushAction {
    pub fn notify() -> Self {
        PushAction::Simple(SimpleAction::Notify)
    }

    pub fn highlight() -> Self {
        PushAction::SetTweak {
            set_tweak: "highlight".to_owned(),
            value: None,
        }
    }

    pub fn sound(name: &str) -> Self {
        PushAction::SetTweak {
            set_tweak: "sound".to_owned(),
            value: Some(json!(name)),
        }
    }
}

impl Ruleset {
    /// The common server-default rules, so a fresh session notifies
    /// sensibly before the account's real ruleset arrives.
    pub fn server_default(user_id: &UserId) -> Self {
        Ruleset {
            override_: vec![PushRule {
                rule_id: ".m.rule.contains_display_name".to_owned(),
                default: true,
                enabled: true,
                conditions: vec![PushCondition::ContainsDisplayName],
                pattern: None,
                actions: vec![
                    PushAction::notify(),
                    PushAction::sound("default"),
                    PushAction::highlight(),
                ],
            }],
            content: vec![PushRule {
                rule_id: ".m.rule.contains_user_name".to_owned(),
                default: true,
                enabled: true,
                conditions: Vec::new(),
                pattern: Some(user_id.localpart().to_owned()),
                actions: vec![
                    PushAction::notify(),
                    PushAction::sound("default"),
                    PushAction::highlight(),
                ],
            }],
            room: Vec::new(),
            sender: Vec::new(),
            underride: vec![
                PushRule {
                    rule_id: ".m.rule.room_one_to_one".to_owned(),
                    default: true,
                    enabled: true,
                    conditions: vec![
                        PushCondition::RoomMemberCount { is: "2".to_owned() },
                        PushCondition::EventMatch {
                            key: "type".to_owned(),
                            pattern: "m.room.message".to_owned(),
                        },
                    ],
                    pattern: None,
                    actions: vec![PushAction::notify(), PushAction::sound("default")],
                },
                PushRule {
                    rule_id: ".m.rule.message".to_owned(),
                    default: true,
                    enabled: true,
                    conditions: vec![PushCondition::EventMatch {
                        key: "type".to_owned(),
                        pattern: "m.room.message".to_owned(),
                    }],
                    pattern: None,
                    actions: vec![PushAction::notify()],
                },
            ],
        }
    }
}

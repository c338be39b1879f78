// =============================================================================
// Hearth Messaging Session Core - Push Rule Engine
// =============================================================================
//
// Evaluates the user's notification ruleset against an incoming event and
// the room's current state. The five collections are consulted strictly in
// order (override, content, room, sender, underride); the first collection
// producing a match wins and its actions reduce, in list order, to one
// decision. No match yields the neutral decision.
//
// A malformed pattern makes only that condition evaluate false; rule
// evaluation never fails.
//
// =============================================================================

pub mod ruleset;

use regex::Regex;
use ruma::OwnedUserId;
use serde_json::Value as JsonValue;
use tracing::{debug, instrument};

pub use ruleset::{PushAction, PushCondition, PushRule, Ruleset, SimpleAction};

use crate::{event::Event, rooms::Room};

/// The reduced outcome of a matched rule's action list.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PushDecision {
    pub notify: bool,
    /// Whether notify/dont_notify was explicitly specified by an action.
    pub notify_set: bool,
    pub highlight: bool,
    pub sound: Option<String>,
}

impl PushDecision {
    pub fn neutral() -> Self {
        Self::default()
    }

    pub fn should_play_sound(&self) -> bool {
        self.sound.is_some()
    }
}

pub struct PushRuleEngine {
    user_id: OwnedUserId,
    ruleset: Ruleset,
}

impl PushRuleEngine {
    pub fn new(user_id: OwnedUserId) -> Self {
        let ruleset = Ruleset::server_default(&user_id);
        Self { user_id, ruleset }
    }

    pub fn ruleset(&self) -> &Ruleset {
        &self.ruleset
    }

    /// Replaces the ruleset, normally from the account-data push rules
    /// event delivered by the protocol collaborator.
    pub fn set_ruleset(&mut self, ruleset: Ruleset) {
        self.ruleset = ruleset;
    }

    /// Evaluates the ruleset for one event in its room.
    #[instrument(skip(self, room, event), fields(event_id = %event.event_id))]
    pub fn get_actions(&self, room: &Room, event: &Event) -> PushDecision {
        for rule in &self.ruleset.override_ {
            if self.conditions_match(rule, room, event) {
                debug!(rule_id = %rule.rule_id, "override rule matched");
                return reduce_actions(&rule.actions);
            }
        }

        for rule in &self.ruleset.content {
            if rule.enabled && self.content_rule_matches(rule, event) {
                debug!(rule_id = %rule.rule_id, "content rule matched");
                return reduce_actions(&rule.actions);
            }
        }

        for rule in &self.ruleset.room {
            if rule.enabled && rule.rule_id == event.room_id.as_str() {
                debug!(rule_id = %rule.rule_id, "room rule matched");
                return reduce_actions(&rule.actions);
            }
        }

        for rule in &self.ruleset.sender {
            if rule.enabled && rule.rule_id == event.sender.as_str() {
                debug!(rule_id = %rule.rule_id, "sender rule matched");
                return reduce_actions(&rule.actions);
            }
        }

        for rule in &self.ruleset.underride {
            if self.conditions_match(rule, room, event) {
                debug!(rule_id = %rule.rule_id, "underride rule matched");
                return reduce_actions(&rule.actions);
            }
        }

        PushDecision::neutral()
    }

    /// Override/underride matching: enabled, and every condition holds.
    fn conditions_match(&self, rule: &PushRule, room: &Room, event: &Event) -> bool {
        rule.enabled
            && rule
                .conditions
                .iter()
                .all(|condition| self.condition_matches(condition, room, event))
    }

    fn condition_matches(&self, condition: &PushCondition, room: &Room, event: &Event) -> bool {
        match condition {
            PushCondition::EventMatch { key, pattern } => {
                // An empty pattern against state_key selects state-less
                // events; resolving the field would never see them.
                if key == "state_key" && pattern.is_empty() {
                    return event.state_key.is_none();
                }
                let Some(value) = event.match_field(key) else {
                    return false;
                };
                glob_matches(pattern, &value)
            }
            PushCondition::ContainsDisplayName => {
                if event.sender == self.user_id {
                    return false;
                }
                let Some(body) = event.body() else {
                    return false;
                };
                let Some(name) = room
                    .member(&self.user_id)
                    .and_then(|member| member.display_name.clone())
                else {
                    return false;
                };
                contains_word(body, &name)
            }
            PushCondition::RoomMemberCount { is } => {
                member_count_matches(is, room.member_count() as u64)
            }
            PushCondition::Unknown => false,
        }
    }

    /// Content rules match the event body; bare patterns are substring
    /// search, glob patterns match the whole body.
    fn content_rule_matches(&self, rule: &PushRule, event: &Event) -> bool {
        let Some(pattern) = rule.pattern.as_deref() else {
            return false;
        };
        let Some(body) = event.body() else {
            return false;
        };
        if pattern.contains('*') || pattern.contains('?') {
            glob_matches(pattern, body)
        } else {
            body.to_lowercase().contains(&pattern.to_lowercase())
        }
    }
}

/// Reduces an action list, in order, to a decision; later tweaks of the
/// same kind override earlier ones.
fn reduce_actions(actions: &[PushAction]) -> PushDecision {
    let mut decision = PushDecision::neutral();
    for action in actions {
        match action {
            PushAction::Simple(SimpleAction::Notify) | PushAction::Simple(SimpleAction::Coalesce) => {
                decision.notify = true;
                decision.notify_set = true;
            }
            PushAction::Simple(SimpleAction::DontNotify) => {
                decision.notify = false;
                decision.notify_set = true;
            }
            PushAction::SetTweak { set_tweak, value } => match set_tweak.as_str() {
                "highlight" => {
                    decision.highlight = value
                        .as_ref()
                        .and_then(JsonValue::as_bool)
                        .unwrap_or(true);
                }
                "sound" => {
                    let name = value
                        .as_ref()
                        .and_then(JsonValue::as_str)
                        .unwrap_or("default");
                    decision.sound = Some(name.to_owned());
                }
                _ => {}
            },
        }
    }
    decision
}

/// Compiles a glob into an anchored, case-insensitive regex and matches
/// the whole value. A pattern that fails to compile matches nothing.
fn glob_matches(pattern: &str, value: &str) -> bool {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push_str("(?i)^");
    for c in pattern.chars() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
    }
    regex.push('$');
    match Regex::new(&regex) {
        Ok(re) => re.is_match(value),
        Err(_) => false,
    }
}

/// Case-insensitive whole-word search: the needle must be bounded by
/// non-alphanumeric characters (or the string ends) on both sides.
fn contains_word(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let haystack = haystack.to_lowercase();
    let needle = needle.to_lowercase();
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(&needle) {
        let start = from + pos;
        let end = start + needle.len();
        let bounded_left = haystack[..start]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let bounded_right = haystack[end..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric());
        if bounded_left && bounded_right {
            return true;
        }
        from = end;
    }
    false
}

/// Parses an optional comparator prefix (`==`, `<`, `<=`, `>`, `>=`;
/// default `==`) and compares against the room's live member count.
fn member_count_matches(is: &str, count: u64) -> bool {
    let (op, rest) = if let Some(rest) = is.strip_prefix("==") {
        ("==", rest)
    } else if let Some(rest) = is.strip_prefix("<=") {
        ("<=", rest)
    } else if let Some(rest) = is.strip_prefix(">=") {
        (">=", rest)
    } else if let Some(rest) = is.strip_prefix('<') {
        ("<", rest)
    } else if let Some(rest) = is.strip_prefix('>') {
        (">", rest)
    } else {
        ("==", is)
    };
    let Ok(operand) = rest.trim().parse::<u64>() else {
        return false;
    };
    match op {
        "==" => count == operand,
        "<" => count < operand,
        "<=" => count <= operand,
        ">" => count > operand,
        ">=" => count >= operand,
        _ => unreachable!(),
    }
}

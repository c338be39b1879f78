//! Desktop-notification plumbing: turning a push decision into a
//! displayable notification and handing it to pluggable sink/sound
//! backends.
//!
//! The backends are traits so a frontend can route to its own toolkit;
//! sound playback runs on a detached task and a failing player is logged,
//! never propagated.

use std::sync::Arc;

use ruma::UserId;
use tracing::{debug, warn};

use crate::{event::Event, push::PushDecision, rooms::Room, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Urgency {
    Low,
    Normal,
    Critical,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub urgency: Urgency,
    pub sound: Option<String>,
}

impl Notification {
    /// Builds the notification a decision calls for, or `None` when the
    /// decision says not to notify.
    pub fn from_decision(
        room: &Room,
        own_user_id: &UserId,
        event: &Event,
        decision: &PushDecision,
    ) -> Option<Notification> {
        if !decision.notify {
            return None;
        }
        let sender = room.member_display_name(&event.sender);
        let body = match event.body() {
            Some(text) => format!("{sender}: {text}"),
            None => format!("{sender} sent a {} event", event.kind),
        };
        Some(Notification {
            title: room
                .display_name(own_user_id)
                .unwrap_or_else(|| event.room_id.to_string()),
            body,
            urgency: if decision.highlight {
                Urgency::Critical
            } else {
                Urgency::Normal
            },
            sound: decision.sound.clone(),
        })
    }
}

/// Where notifications get displayed. Implemented by the frontend.
pub trait NotificationSink: Send + Sync {
    fn show(&self, notification: &Notification) -> Result<()>;
}

/// Plays a named notification sound. Implemented by the frontend.
pub trait SoundPlayer: Send + Sync {
    fn play(&self, name: &str) -> Result<()>;
}

/// Shows the notification and kicks off its sound. Display failures
/// propagate; playback runs detached and only logs on failure so a broken
/// audio stack cannot stall sync processing.
pub fn deliver(
    sink: &dyn NotificationSink,
    player: &Arc<dyn SoundPlayer>,
    notification: &Notification,
) -> Result<()> {
    sink.show(notification)?;
    if let Some(sound) = &notification.sound {
        let player = Arc::clone(player);
        let sound = sound.clone();
        tokio::spawn(async move {
            if let Err(e) = player.play(&sound) {
                warn!(sound = %sound, "failed to play notification sound: {e}");
            } else {
                debug!(sound = %sound, "notification sound played");
            }
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use ruma::RoomId;
    use serde_json::json;

    use super::*;
    use crate::event::test_support::{member, message, state};

    const ROOM: &str = "!lounge:example.com";

    fn room_with_name() -> Room {
        let mut room = Room::new(RoomId::parse(ROOM).unwrap());
        room.apply_state(&state(
            ROOM,
            "@alice:example.com",
            "$name",
            "m.room.name",
            "",
            json!({"name": "Lounge"}),
        ));
        room.apply_state(&member(ROOM, "@alice:example.com", "join", Some("Alice")));
        room
    }

    fn own_user() -> ruma::OwnedUserId {
        UserId::parse("@bob:example.com").unwrap()
    }

    #[test]
    fn test_notify_decision_becomes_notification() {
        let room = room_with_name();
        let event = message(ROOM, "@alice:example.com", "$e1", "lunch?");
        let decision = PushDecision {
            notify: true,
            notify_set: true,
            highlight: false,
            sound: Some("default".to_owned()),
        };

        let notification =
            Notification::from_decision(&room, &own_user(), &event, &decision).unwrap();
        assert_eq!(notification.title, "Lounge");
        assert_eq!(notification.body, "Alice: lunch?");
        assert_eq!(notification.urgency, Urgency::Normal);
        assert_eq!(notification.sound.as_deref(), Some("default"));
    }

    #[test]
    fn test_highlight_raises_urgency() {
        let room = room_with_name();
        let event = message(ROOM, "@alice:example.com", "$e1", "hey bob");
        let decision = PushDecision {
            notify: true,
            notify_set: true,
            highlight: true,
            sound: None,
        };

        let notification =
            Notification::from_decision(&room, &own_user(), &event, &decision).unwrap();
        assert_eq!(notification.urgency, Urgency::Critical);
        assert!(notification.sound.is_none());
    }

    #[test]
    fn test_silent_decision_yields_no_notification() {
        let room = room_with_name();
        let event = message(ROOM, "@alice:example.com", "$e1", "ambient chatter");
        assert!(
            Notification::from_decision(&room, &own_user(), &event, &PushDecision::neutral())
                .is_none()
        );
    }

    #[test]
    fn test_bodyless_event_falls_back_to_kind() {
        let room = room_with_name();
        let mut event = message(ROOM, "@alice:example.com", "$e1", "x");
        event.kind = "m.sticker".to_owned();
        event.content = json!({"url": "mxc://example.com/abc"});
        let decision = PushDecision {
            notify: true,
            notify_set: true,
            highlight: false,
            sound: None,
        };

        let notification =
            Notification::from_decision(&room, &own_user(), &event, &decision).unwrap();
        assert_eq!(notification.body, "Alice sent a m.sticker event");
    }

    struct RecordingSink(Mutex<Vec<String>>);

    impl NotificationSink for RecordingSink {
        fn show(&self, notification: &Notification) -> Result<()> {
            self.0.lock().unwrap().push(notification.body.clone());
            Ok(())
        }
    }

    struct FailingPlayer;

    impl SoundPlayer for FailingPlayer {
        fn play(&self, _name: &str) -> Result<()> {
            Err(crate::Error::bad_database("no audio device"))
        }
    }

    #[tokio::test]
    async fn test_deliver_shows_even_when_player_fails() {
        let sink = RecordingSink(Mutex::new(Vec::new()));
        let player: Arc<dyn SoundPlayer> = Arc::new(FailingPlayer);
        let notification = Notification {
            title: "Lounge".to_owned(),
            body: "Alice: hi".to_owned(),
            urgency: Urgency::Normal,
            sound: Some("default".to_owned()),
        };

        deliver(&sink, &player, &notification).unwrap();
        // Let the detached playback task run; its failure is swallowed.
        tokio::task::yield_now().await;
        assert_eq!(*sink.0.lock().unwrap(), vec!["Alice: hi".to_owned()]);
    }
}

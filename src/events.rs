//! Event classes shared between the player side and the socket server.

use std::fmt;

use crate::metadata::Metadata;

/// Subscription category for socket clients, and the class a player event
/// is emitted under.
///
/// `Event` fires for every metadata, status, and seek event. `Player`
/// fires when the active-player identity changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    Metadata,
    Status,
    Seek,
    Event,
    Player,
}

impl EventClass {
    pub fn as_str(self) -> &'static str {
        match self {
            EventClass::Metadata => "ON_METADATA",
            EventClass::Status => "ON_STATUS",
            EventClass::Seek => "ON_SEEK",
            EventClass::Event => "ON_EVENT",
            EventClass::Player => "ON_PLAYER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ON_METADATA" => Some(EventClass::Metadata),
            "ON_STATUS" => Some(EventClass::Status),
            "ON_SEEK" => Some(EventClass::Seek),
            "ON_EVENT" => Some(EventClass::Event),
            "ON_PLAYER" => Some(EventClass::Player),
            _ => None,
        }
    }
}

impl fmt::Display for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single player emission, routed through the listener's dispatcher to
/// the socket server.
#[derive(Debug, Clone)]
pub struct PlayerEvent {
    pub player: String,
    pub class: EventClass,
    pub metadata: Metadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_all_five_classes() {
        for name in [
            "ON_METADATA",
            "ON_STATUS",
            "ON_SEEK",
            "ON_EVENT",
            "ON_PLAYER",
        ] {
            let class = EventClass::parse(name).unwrap();
            assert_eq!(class.as_str(), name);
        }
        assert_eq!(EventClass::parse("BOGUS"), None);
    }
}

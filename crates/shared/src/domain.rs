use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(DisplayId);
id_newtype!(PresentationId);
id_newtype!(GroupId);
id_newtype!(SlideId);
id_newtype!(EffectId);
id_newtype!(OverrideId);
id_newtype!(TicketId);

/// Group id reported by a client when the current slide did not come from
/// the display's presentation (override content). Persisted ids start at 1,
/// so the sentinel can never collide with a real group.
pub const OVERRIDE_GROUP_ID: i64 = -1;

/// Slide duration meaning "use the presentation's default delay".
pub const USE_PRESENTATION_DELAY: i64 = -1;

/// Recorded when a client never told us its address.
pub const UNKNOWN_IP: &str = "UNKNOWN";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayStatus {
    Disconnected,
    Running,
    Error,
}

impl DisplayStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DisplayStatus::Disconnected => "disconnected",
            DisplayStatus::Running => "running",
            DisplayStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "running" => DisplayStatus::Running,
            "error" => DisplayStatus::Error,
            _ => DisplayStatus::Disconnected,
        }
    }
}

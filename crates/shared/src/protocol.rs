use serde::{Deserialize, Serialize};

use crate::domain::{DisplayId, EffectId, GroupId, OverrideId, PresentationId, SlideId};

/// Shared operator channel; every display mutation publishes a compact
/// summary here in addition to the display's private channel.
pub const GENERAL_CHANNEL: &str = "general";

pub fn display_channel(display_id: DisplayId) -> String {
    format!("display_{}", display_id.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageEvent {
    Create,
    Update,
    Error,
    Data,
}

/// One outbound push frame. `data` is a flat object whose layout depends
/// on the event kind; see the engine's notification builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub channel: String,
    pub event: MessageEvent,
    pub data: serde_json::Value,
}

impl ChannelMessage {
    pub fn new(
        channel: impl Into<String>,
        event: MessageEvent,
        data: serde_json::Value,
    ) -> Self {
        Self {
            channel: channel.into(),
            event,
            data,
        }
    }
}

/// Requests a display client sends over its websocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum DisplayRequest {
    Hello {
        name: String,
        #[serde(default)]
        ip: Option<String>,
    },
    CurrentSlide {
        group_id: i64,
        slide_id: i64,
    },
    OverrideShown {
        override_id: i64,
    },
    Goodbye,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlideSnapshot {
    pub id: SlideId,
    pub group_id: GroupId,
    pub name: String,
    pub duration: i64,
    pub effect_id: EffectId,
    pub position: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresentationSnapshot {
    pub id: PresentationId,
    pub name: String,
    pub effect: EffectId,
    pub created_at: i64,
    pub updated_at: i64,
    pub total_groups: i64,
    pub total_slides: i64,
    pub slides: Vec<SlideSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideSnapshot {
    pub id: OverrideId,
    pub slide_id: SlideId,
    pub duration: i64,
    pub effect_id: EffectId,
    pub position: i64,
}

/// Full per-display payload pushed on the private channel as a `data`
/// event. Timestamps are unix seconds; `updated_at` is the newer of the
/// metadata and state update times.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayData {
    pub id: DisplayId,
    pub name: String,
    pub updated_at: i64,
    pub metadata_updated_at: i64,
    pub state_updated_at: i64,
    pub last_contact_at: Option<i64>,
    pub manual: bool,
    pub current_slide_id: Option<i64>,
    pub current_group_id: Option<i64>,
    pub created_at: i64,
    pub presentation: Option<PresentationSnapshot>,
    pub override_queue: Vec<OverrideSnapshot>,
}

/// Payload of an `error` event on both the general and private channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub id: DisplayId,
    pub message: String,
}

//! Post-commit notification building.
//!
//! Every display mutation fans out to two channels: a compact summary with
//! the changed fields on `general`, and the full display payload on the
//! display's private channel. Error status additionally produces an `error`
//! event on both.

use serde_json::{Map, Value};
use shared::{
    domain::DisplayStatus,
    protocol::{
        display_channel, ChannelMessage, DisplayData, ErrorNotice, MessageEvent, GENERAL_CHANNEL,
    },
};
use storage::StoredDisplay;
use tracing::error;

use crate::{sequencer, EngineContext};

/// Fallback line for an error event when no ticket is open.
const GENERIC_ERROR: &str = "Error has occurred!";

/// Changed-field map between two observations of one display. Connection
/// ids are correlation tokens and never leave the server, mirroring the
/// credential-field exclusion on the summary channel.
pub fn diff_displays(before: Option<&StoredDisplay>, after: &StoredDisplay) -> Map<String, Value> {
    let mut changes = Map::new();
    let mut put = |key: &str, old: Value, new: Value| {
        if before.is_none() || old != new {
            changes.insert(key.to_string(), new);
        }
    };

    let old = before.unwrap_or(after);
    put(
        "status",
        Value::from(old.state.status.as_str()),
        Value::from(after.state.status.as_str()),
    );
    put(
        "current_group_id",
        Value::from(old.state.current_group_id),
        Value::from(after.state.current_group_id),
    );
    put(
        "current_slide_id",
        Value::from(old.state.current_slide_id),
        Value::from(after.state.current_slide_id),
    );
    put(
        "last_contact_at",
        Value::from(old.state.last_contact_at.map(|t| t.timestamp())),
        Value::from(after.state.last_contact_at.map(|t| t.timestamp())),
    );
    put(
        "last_hello",
        Value::from(old.state.last_hello.map(|t| t.timestamp())),
        Value::from(after.state.last_hello.map(|t| t.timestamp())),
    );
    put(
        "ip",
        Value::from(old.state.ip.as_str()),
        Value::from(after.state.ip.as_str()),
    );
    put(
        "monitor",
        Value::from(old.state.monitor),
        Value::from(after.state.monitor),
    );
    put("manual", Value::from(old.manual), Value::from(after.manual));
    put(
        "do_overrides",
        Value::from(old.do_overrides),
        Value::from(after.do_overrides),
    );
    put("live", Value::from(old.live), Value::from(after.live));
    put(
        "presentation_id",
        Value::from(old.presentation_id.map(|p| p.0)),
        Value::from(after.presentation_id.map(|p| p.0)),
    );
    changes
}

/// Standard fan-out for a committed display mutation.
pub async fn display_messages(
    ctx: &EngineContext,
    display: &StoredDisplay,
    event: MessageEvent,
    changes: Map<String, Value>,
) -> anyhow::Result<Vec<ChannelMessage>> {
    let mut messages = vec![ChannelMessage::new(
        GENERAL_CHANNEL,
        event,
        serde_json::json!({
            "id": display.display_id.0,
            "name": display.name,
            "changes": Value::Object(changes),
        }),
    )];
    messages.push(display_data_message(ctx, display).await?);

    if display.state.status == DisplayStatus::Error {
        let message = match ctx.storage.open_ticket(display.display_id).await? {
            Some(ticket) => ticket
                .description
                .lines()
                .last()
                .unwrap_or(GENERIC_ERROR)
                .to_string(),
            None => GENERIC_ERROR.to_string(),
        };
        let display_id = display.display_id.0;
        error!(display_id, %message, "display is in error state");
        let notice = serde_json::to_value(ErrorNotice {
            id: display.display_id,
            message,
        })?;
        messages.push(ChannelMessage::new(
            GENERAL_CHANNEL,
            MessageEvent::Error,
            notice.clone(),
        ));
        messages.push(ChannelMessage::new(
            display_channel(display.display_id),
            MessageEvent::Error,
            notice,
        ));
    }

    Ok(messages)
}

/// The full display payload as a `data` event on the private channel.
pub async fn display_data_message(
    ctx: &EngineContext,
    display: &StoredDisplay,
) -> anyhow::Result<ChannelMessage> {
    let data = display_data(ctx, display).await?;
    Ok(ChannelMessage::new(
        display_channel(display.display_id),
        MessageEvent::Data,
        serde_json::to_value(data)?,
    ))
}

/// Assembles the full per-display hash: timestamps, playback pointers, the
/// nested presentation snapshot, and the override queue when the display
/// accepts overrides.
pub async fn display_data(
    ctx: &EngineContext,
    display: &StoredDisplay,
) -> anyhow::Result<DisplayData> {
    let metadata_updated_at = display.updated_at.timestamp();
    let state_updated_at = display.state.updated_at.timestamp();

    let presentation = match display.presentation_id {
        Some(presentation_id) => sequencer::presentation_snapshot(ctx, presentation_id).await?,
        None => None,
    };

    let override_queue = if display.do_overrides {
        ctx.storage
            .list_overrides(display.display_id)
            .await?
            .into_iter()
            .map(|entry| shared::protocol::OverrideSnapshot {
                id: entry.override_id,
                slide_id: entry.slide_id,
                duration: entry.duration,
                effect_id: entry.effect_id,
                position: entry.position,
            })
            .collect()
    } else {
        Vec::new()
    };

    Ok(DisplayData {
        id: display.display_id,
        name: display.name.clone(),
        updated_at: metadata_updated_at.max(state_updated_at),
        metadata_updated_at,
        state_updated_at,
        last_contact_at: display.state.last_contact_at.map(|t| t.timestamp()),
        manual: display.manual,
        current_slide_id: display.state.current_slide_id,
        current_group_id: display.state.current_group_id,
        created_at: display.created_at.timestamp(),
        presentation,
        override_queue,
    })
}

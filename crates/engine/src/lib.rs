//! Display live-state coordination engine.
//!
//! All mutating operations follow the same shape: validate against current
//! state, commit one row-scoped transaction through [`storage`], then return
//! the [`ChannelMessage`]s describing what changed. The caller publishes
//! those after the commit; delivery never feeds back into the mutation.

use chrono::{Duration, Utc};
use shared::{
    domain::{
        DisplayId, DisplayStatus, EffectId, GroupId, OverrideId, SlideId, TicketId,
        OVERRIDE_GROUP_ID,
    },
    error::{ApiError, ErrorCode},
    protocol::{ChannelMessage, MessageEvent, GENERAL_CHANNEL},
};
use storage::{Storage, StoredDisplay, StoredOverride};

mod notifications;
mod sequencer;

pub use notifications::{diff_displays, display_data, display_messages};
pub use sequencer::{presentation_duration, presentation_snapshot, uptime};

/// Minutes without contact before a monitored display counts as late.
pub const DEFAULT_TIMEOUT_MINUTES: i64 = 5;

#[derive(Clone)]
pub struct EngineContext {
    pub storage: Storage,
    pub timeout_minutes: i64,
}

impl EngineContext {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
        }
    }
}

/// Find-or-create handshake. Repeated hellos for one name update the same
/// record; status is forced to `running` either way.
pub async fn hello(
    ctx: &EngineContext,
    name: &str,
    ip: Option<&str>,
    connection_id: Option<&str>,
) -> Result<(StoredDisplay, Vec<ChannelMessage>), ApiError> {
    let name = name.trim();
    if name.is_empty() || name.len() > 50 {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "display name must be 1-50 characters",
        ));
    }

    let now = Utc::now();
    let (before, created) = ctx
        .storage
        .find_or_create_display(name, now)
        .await
        .map_err(internal)?;
    ctx.storage
        .record_hello(before.display_id, ip, connection_id, now)
        .await
        .map_err(internal)?;

    let after = load(ctx, before.display_id).await?;
    let event = if created {
        MessageEvent::Create
    } else {
        MessageEvent::Update
    };
    let changes = diff_displays(Some(&before), &after);
    let messages = display_messages(ctx, &after, event, changes)
        .await
        .map_err(internal)?;
    Ok((after, messages))
}

/// Updates the playback position reported by a client. Group `-1` marks
/// override content resolved from the global slide pool; any other group
/// must belong to the display's assigned presentation. A failed lookup
/// leaves the prior position untouched and degrades to an error ticket.
pub async fn set_current_slide(
    ctx: &EngineContext,
    display_id: DisplayId,
    group_id: i64,
    slide_id: i64,
    connection_id: Option<&str>,
) -> Result<(bool, Vec<ChannelMessage>), ApiError> {
    let before = load(ctx, display_id).await?;

    let resolved = if group_id == OVERRIDE_GROUP_ID {
        ctx.storage
            .find_slide(SlideId(slide_id))
            .await
            .map_err(internal)?
    } else {
        match before.presentation_id {
            Some(presentation_id) => ctx
                .storage
                .find_slide_in_presentation_group(
                    presentation_id,
                    GroupId(group_id),
                    SlideId(slide_id),
                )
                .await
                .map_err(internal)?,
            None => None,
        }
    };

    let Some(slide) = resolved else {
        let (_, messages) = add_error(ctx, display_id, "Invalid slide in set_current_slide").await?;
        return Ok((false, messages));
    };

    ctx.storage
        .commit_playback_position(
            display_id,
            group_id,
            slide.slide_id,
            connection_id,
            before.live,
            Utc::now(),
        )
        .await
        .map_err(internal)?;

    let after = load(ctx, display_id).await?;
    let changes = diff_displays(Some(&before), &after);
    let messages = display_messages(ctx, &after, MessageEvent::Update, changes)
        .await
        .map_err(internal)?;
    Ok((true, messages))
}

/// Consumes one named override entry: the slide becomes current (group
/// `-1`), the entry is deleted and the queue renumbered, all atomically.
/// Of two concurrent consumers of one entry id exactly one succeeds; the
/// loser records a fault and reports failure.
pub async fn override_shown(
    ctx: &EngineContext,
    display_id: DisplayId,
    override_id: OverrideId,
    connection_id: Option<&str>,
) -> Result<(bool, Vec<ChannelMessage>), ApiError> {
    let before = load(ctx, display_id).await?;

    let consumed = ctx
        .storage
        .consume_override(display_id, override_id, connection_id, before.live, Utc::now())
        .await
        .map_err(internal)?;

    if consumed.is_none() {
        let (_, messages) = add_error(ctx, display_id, "Invalid override in override_shown").await?;
        return Ok((false, messages));
    }

    let after = load(ctx, display_id).await?;
    let changes = diff_displays(Some(&before), &after);
    let messages = display_messages(ctx, &after, MessageEvent::Update, changes)
        .await
        .map_err(internal)?;
    Ok((true, messages))
}

/// Marks the display owning this connection id as disconnected. Connection
/// ids of unknown or already-reassigned clients are a no-op.
pub async fn disconnect(
    ctx: &EngineContext,
    connection_id: &str,
) -> Result<(Option<StoredDisplay>, Vec<ChannelMessage>), ApiError> {
    let Some(after) = ctx
        .storage
        .mark_disconnected(connection_id, Utc::now())
        .await
        .map_err(internal)?
    else {
        return Ok((None, Vec::new()));
    };

    let mut changes = serde_json::Map::new();
    changes.insert(
        "status".into(),
        serde_json::Value::from(DisplayStatus::Disconnected.as_str()),
    );
    let messages = display_messages(ctx, &after, MessageEvent::Update, changes)
        .await
        .map_err(internal)?;
    Ok((Some(after), messages))
}

/// Records a fault against the display: appends a timestamped line to the
/// open ticket (opening one if needed) and forces status to `error`.
pub async fn add_error(
    ctx: &EngineContext,
    display_id: DisplayId,
    message: &str,
) -> Result<(TicketId, Vec<ChannelMessage>), ApiError> {
    let now = Utc::now();
    let line = format!("{} {}", now.format("%Y-%m-%d %H:%M:%S"), message);
    let ticket_id = ctx
        .storage
        .append_error(display_id, &line, now)
        .await
        .map_err(internal)?;

    let after = load(ctx, display_id).await?;
    let mut changes = serde_json::Map::new();
    changes.insert(
        "status".into(),
        serde_json::Value::from(DisplayStatus::Error.as_str()),
    );
    let messages = display_messages(ctx, &after, MessageEvent::Update, changes)
        .await
        .map_err(internal)?;
    Ok((ticket_id, messages))
}

/// Appends an override entry for the display. Duration is mandatory; the
/// effect falls back to the globally-configured default when not given.
/// Validation happens before any mutation.
pub async fn add_to_override(
    ctx: &EngineContext,
    display_id: DisplayId,
    slide_id: SlideId,
    duration: i64,
    effect_id: Option<EffectId>,
) -> Result<(StoredOverride, Vec<ChannelMessage>), ApiError> {
    if duration <= 0 {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "override duration must be positive",
        ));
    }
    let display = load(ctx, display_id).await?;
    if ctx
        .storage
        .find_slide(slide_id)
        .await
        .map_err(internal)?
        .is_none()
    {
        return Err(ApiError::new(ErrorCode::NotFound, "slide not found"));
    }

    let effect_id = match effect_id {
        Some(effect_id) => {
            if !ctx.storage.effect_exists(effect_id).await.map_err(internal)? {
                return Err(ApiError::new(ErrorCode::NotFound, "effect not found"));
            }
            effect_id
        }
        None => ctx
            .storage
            .default_effect()
            .await
            .map_err(internal)?
            .ok_or_else(|| ApiError::new(ErrorCode::Validation, "no default effect configured"))?,
    };

    let entry = ctx
        .storage
        .append_override(display_id, slide_id, duration, effect_id)
        .await
        .map_err(internal)?;

    let mut messages = vec![ChannelMessage::new(
        GENERAL_CHANNEL,
        MessageEvent::Create,
        serde_json::json!({
            "id": entry.override_id.0,
            "display_id": display_id.0,
            "slide_id": entry.slide_id.0,
            "duration": entry.duration,
            "effect_id": entry.effect_id.0,
            "position": entry.position,
        }),
    )];
    messages.push(notifications::display_data_message(ctx, &display).await.map_err(internal)?);
    Ok((entry, messages))
}

/// Administrative removal; remaining positions renumber contiguously.
pub async fn remove_override(
    ctx: &EngineContext,
    display_id: DisplayId,
    override_id: OverrideId,
) -> Result<Vec<ChannelMessage>, ApiError> {
    let display = load(ctx, display_id).await?;
    let removed = ctx
        .storage
        .remove_override(display_id, override_id)
        .await
        .map_err(internal)?;
    if !removed {
        return Err(ApiError::new(ErrorCode::NotFound, "override entry not found"));
    }
    Ok(vec![notifications::display_data_message(ctx, &display)
        .await
        .map_err(internal)?])
}

pub async fn clear_overrides(
    ctx: &EngineContext,
    display_id: DisplayId,
) -> Result<(u64, Vec<ChannelMessage>), ApiError> {
    let display = load(ctx, display_id).await?;
    let removed = ctx
        .storage
        .clear_overrides(display_id)
        .await
        .map_err(internal)?;
    let messages = vec![notifications::display_data_message(ctx, &display)
        .await
        .map_err(internal)?];
    Ok((removed, messages))
}

/// Closes the open ticket. Status stays wherever it is; only a successful
/// hello, slide update, or override consumption returns it to `running`.
pub async fn resolve_ticket(
    ctx: &EngineContext,
    display_id: DisplayId,
    ticket_id: TicketId,
) -> Result<Vec<ChannelMessage>, ApiError> {
    let display = load(ctx, display_id).await?;
    let closed = ctx
        .storage
        .close_ticket(display_id, ticket_id, Utc::now())
        .await
        .map_err(internal)?;
    if !closed {
        return Err(ApiError::new(ErrorCode::NotFound, "no such open ticket"));
    }

    let mut messages = vec![ChannelMessage::new(
        GENERAL_CHANNEL,
        MessageEvent::Update,
        serde_json::json!({
            "id": ticket_id.0,
            "display_id": display_id.0,
            "changes": { "open": false },
        }),
    )];
    messages.push(notifications::display_data_message(ctx, &display).await.map_err(internal)?);
    Ok(messages)
}

/// Read-only staleness predicate. A display that never reported contact is
/// not late, and neither is one with monitoring switched off.
pub async fn is_late(ctx: &EngineContext, display_id: DisplayId) -> Result<bool, ApiError> {
    let display = load(ctx, display_id).await?;
    Ok(display_is_late(ctx, &display))
}

pub fn display_is_late(ctx: &EngineContext, display: &StoredDisplay) -> bool {
    if !display.state.monitor {
        return false;
    }
    match display.state.last_contact_at {
        Some(last_contact_at) => Utc::now() - last_contact_at > Duration::minutes(ctx.timeout_minutes),
        None => false,
    }
}

/// All monitored displays whose last contact exceeds the timeout, in one
/// indexed pass.
pub async fn late_displays(ctx: &EngineContext) -> Result<Vec<StoredDisplay>, ApiError> {
    let cutoff = Utc::now() - Duration::minutes(ctx.timeout_minutes);
    ctx.storage.late_displays(cutoff).await.map_err(internal)
}

async fn load(ctx: &EngineContext, display_id: DisplayId) -> Result<StoredDisplay, ApiError> {
    ctx.storage
        .load_display(display_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "display not found"))
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

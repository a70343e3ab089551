//! Presentation sequencing: resolving the ordered slide list a presentation
//! currently carries, plus the derived duration and snapshot queries. Owns
//! no mutable state.

use shared::{
    domain::{PresentationId, USE_PRESENTATION_DELAY},
    protocol::{PresentationSnapshot, SlideSnapshot},
};
use storage::StoredDisplay;

use crate::EngineContext;

/// Snapshot of a presentation with each slide's effective duration and
/// effect substituted (slides without an explicit effect inherit the
/// presentation's, `-1` durations inherit the presentation delay).
pub async fn presentation_snapshot(
    ctx: &EngineContext,
    presentation_id: PresentationId,
) -> anyhow::Result<Option<PresentationSnapshot>> {
    let Some(presentation) = ctx.storage.load_presentation(presentation_id).await? else {
        return Ok(None);
    };
    let slides = ctx.storage.presentation_slides(presentation_id).await?;

    let slides: Vec<SlideSnapshot> = slides
        .into_iter()
        .filter_map(|slide| {
            let group_id = slide.group_id?;
            Some(SlideSnapshot {
                id: slide.slide_id,
                group_id,
                name: slide.name,
                duration: if slide.duration == USE_PRESENTATION_DELAY {
                    presentation.delay
                } else {
                    slide.duration
                },
                effect_id: slide.effect_id.unwrap_or(presentation.effect_id),
                position: slide.position,
            })
        })
        .collect();

    Ok(Some(PresentationSnapshot {
        id: presentation.presentation_id,
        name: presentation.name,
        effect: presentation.effect_id,
        created_at: presentation.created_at.timestamp(),
        updated_at: presentation.updated_at.timestamp(),
        total_groups: presentation.total_groups,
        total_slides: slides.len() as i64,
        slides,
    }))
}

/// Total playback time of the presentation in seconds: the default delay
/// for every slide that uses it plus the explicit durations.
pub async fn presentation_duration(
    ctx: &EngineContext,
    presentation_id: PresentationId,
) -> anyhow::Result<Option<i64>> {
    let Some(presentation) = ctx.storage.load_presentation(presentation_id).await? else {
        return Ok(None);
    };
    let slides = ctx.storage.presentation_slides(presentation_id).await?;
    let total = slides
        .iter()
        .map(|slide| {
            if slide.duration == USE_PRESENTATION_DELAY {
                presentation.delay
            } else {
                slide.duration
            }
        })
        .sum();
    Ok(Some(total))
}

/// Time between the last hello and the last contact. The first thing a
/// client does is say hello, so this approximates time since its last
/// restart.
pub fn uptime(display: &StoredDisplay) -> Option<String> {
    let last_hello = display.state.last_hello?;
    let last_contact_at = display.state.last_contact_at?;
    let diff = (last_contact_at - last_hello).num_seconds().abs();
    if diff > 24 * 3600 {
        return Some("> 24h".to_string());
    }
    Some(format!(
        "{:02}:{:02}:{:02}",
        diff / 3600,
        (diff % 3600) / 60,
        diff % 60
    ))
}

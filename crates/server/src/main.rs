use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use engine::EngineContext;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{DisplayId, DisplayStatus, EffectId, OverrideId, SlideId, TicketId},
    error::{ApiError, ErrorCode},
    protocol::{display_channel, ChannelMessage, DisplayRequest, OverrideSnapshot},
};
use storage::{Storage, StoredDisplay};
use tokio::sync::broadcast;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

mod config;

use config::{load_settings, prepare_database_url};

const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone)]
struct AppState {
    engine: EngineContext,
    events: broadcast::Sender<ChannelMessage>,
}

#[derive(Debug, Deserialize)]
struct HelloRequest {
    name: String,
    #[serde(default)]
    ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CurrentSlideRequest {
    group_id: i64,
    slide_id: i64,
}

#[derive(Debug, Deserialize)]
struct OverrideShownRequest {
    override_id: i64,
}

#[derive(Debug, Deserialize)]
struct AddOverrideRequest {
    slide_id: i64,
    duration: i64,
    #[serde(default)]
    effect_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ResolveTicketRequest {
    ticket_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct OkResponse {
    ok: bool,
}

/// Compact row for fleet listings; the private channel carries the full
/// payload instead.
#[derive(Debug, Serialize, Deserialize)]
struct DisplayOverview {
    id: i64,
    name: String,
    status: DisplayStatus,
    last_contact_at: Option<i64>,
    late: bool,
    uptime: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(default)]
    channels: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let mut engine = EngineContext::new(storage);
    engine.timeout_minutes = settings.timeout_minutes;
    let (events, _) = broadcast::channel(256);

    let state = Arc::new(AppState { engine, events });
    tokio::spawn(liveness_sweep(
        state.clone(),
        settings.sweep_interval_seconds,
    ));

    let app = build_router(state);
    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/displays", get(http_list_displays))
        .route("/displays/hello", post(http_hello))
        .route("/displays/late", get(http_late_displays))
        .route("/displays/:display_id", get(http_get_display))
        .route("/displays/:display_id/current_slide", post(http_current_slide))
        .route("/displays/:display_id/override_shown", post(http_override_shown))
        .route(
            "/displays/:display_id/override",
            post(http_add_override).delete(http_clear_overrides),
        )
        .route(
            "/displays/:display_id/override/:override_id",
            delete(http_remove_override),
        )
        .route("/displays/:display_id/resolve_ticket", post(http_resolve_ticket))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

/// Delivery is fire-and-forget: a send error only means nobody is
/// listening right now, and it never affects the committed mutation.
fn publish(state: &AppState, messages: Vec<ChannelMessage>) {
    for message in messages {
        if state.events.send(message).is_err() {
            debug!("no subscribers for channel message");
        }
    }
}

/// Periodic staleness sweep. The engine only answers the late query; this
/// task decides to raise a fault for monitored displays that went quiet
/// while still marked running.
async fn liveness_sweep(state: Arc<AppState>, interval_seconds: u64) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_seconds));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let late = match engine::late_displays(&state.engine).await {
            Ok(late) => late,
            Err(error) => {
                error!(%error.message, "liveness sweep query failed");
                continue;
            }
        };
        for display in late {
            if display.state.status != DisplayStatus::Running {
                continue;
            }
            let display_name = display.name.as_str();
            warn!(%display_name, "display has stopped reporting");
            let note = format!(
                "No contact from display in over {} minutes",
                state.engine.timeout_minutes
            );
            match engine::add_error(&state.engine, display.display_id, &note).await {
                Ok((_, messages)) => publish(&state, messages),
                Err(error) => error!(%error.message, "failed to record liveness fault"),
            }
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

fn reject(error: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match error.code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(error))
}

fn overview(state: &AppState, display: &StoredDisplay) -> DisplayOverview {
    DisplayOverview {
        id: display.display_id.0,
        name: display.name.clone(),
        status: display.state.status,
        last_contact_at: display.state.last_contact_at.map(|t| t.timestamp()),
        late: engine::display_is_late(&state.engine, display),
        uptime: engine::uptime(display),
    }
}

async fn http_hello(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HelloRequest>,
) -> Result<Json<shared::protocol::DisplayData>, (StatusCode, Json<ApiError>)> {
    let (display, messages) = engine::hello(&state.engine, &req.name, req.ip.as_deref(), None)
        .await
        .map_err(reject)?;
    publish(&state, messages);
    let data = engine::display_data(&state.engine, &display)
        .await
        .map_err(|e| reject(ApiError::new(ErrorCode::Internal, e.to_string())))?;
    Ok(Json(data))
}

async fn http_list_displays(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<DisplayOverview>>, (StatusCode, Json<ApiError>)> {
    let displays = state
        .engine
        .storage
        .list_displays()
        .await
        .map_err(|e| reject(ApiError::new(ErrorCode::Internal, e.to_string())))?;
    Ok(Json(
        displays.iter().map(|d| overview(&state, d)).collect(),
    ))
}

async fn http_get_display(
    State(state): State<Arc<AppState>>,
    Path(display_id): Path<i64>,
) -> Result<Json<shared::protocol::DisplayData>, (StatusCode, Json<ApiError>)> {
    let display = state
        .engine
        .storage
        .load_display(DisplayId(display_id))
        .await
        .map_err(|e| reject(ApiError::new(ErrorCode::Internal, e.to_string())))?
        .ok_or_else(|| reject(ApiError::new(ErrorCode::NotFound, "display not found")))?;
    let data = engine::display_data(&state.engine, &display)
        .await
        .map_err(|e| reject(ApiError::new(ErrorCode::Internal, e.to_string())))?;
    Ok(Json(data))
}

async fn http_late_displays(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<DisplayOverview>>, (StatusCode, Json<ApiError>)> {
    let late = engine::late_displays(&state.engine).await.map_err(reject)?;
    Ok(Json(late.iter().map(|d| overview(&state, d)).collect()))
}

async fn http_current_slide(
    State(state): State<Arc<AppState>>,
    Path(display_id): Path<i64>,
    Json(req): Json<CurrentSlideRequest>,
) -> Result<Json<OkResponse>, (StatusCode, Json<ApiError>)> {
    let (ok, messages) = engine::set_current_slide(
        &state.engine,
        DisplayId(display_id),
        req.group_id,
        req.slide_id,
        None,
    )
    .await
    .map_err(reject)?;
    publish(&state, messages);
    Ok(Json(OkResponse { ok }))
}

async fn http_override_shown(
    State(state): State<Arc<AppState>>,
    Path(display_id): Path<i64>,
    Json(req): Json<OverrideShownRequest>,
) -> Result<Json<OkResponse>, (StatusCode, Json<ApiError>)> {
    let (ok, messages) = engine::override_shown(
        &state.engine,
        DisplayId(display_id),
        OverrideId(req.override_id),
        None,
    )
    .await
    .map_err(reject)?;
    publish(&state, messages);
    Ok(Json(OkResponse { ok }))
}

async fn http_add_override(
    State(state): State<Arc<AppState>>,
    Path(display_id): Path<i64>,
    Json(req): Json<AddOverrideRequest>,
) -> Result<Json<OverrideSnapshot>, (StatusCode, Json<ApiError>)> {
    let (entry, messages) = engine::add_to_override(
        &state.engine,
        DisplayId(display_id),
        SlideId(req.slide_id),
        req.duration,
        req.effect_id.map(EffectId),
    )
    .await
    .map_err(reject)?;
    publish(&state, messages);
    Ok(Json(OverrideSnapshot {
        id: entry.override_id,
        slide_id: entry.slide_id,
        duration: entry.duration,
        effect_id: entry.effect_id,
        position: entry.position,
    }))
}

async fn http_remove_override(
    State(state): State<Arc<AppState>>,
    Path((display_id, override_id)): Path<(i64, i64)>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let messages = engine::remove_override(
        &state.engine,
        DisplayId(display_id),
        OverrideId(override_id),
    )
    .await
    .map_err(reject)?;
    publish(&state, messages);
    Ok(StatusCode::NO_CONTENT)
}

async fn http_clear_overrides(
    State(state): State<Arc<AppState>>,
    Path(display_id): Path<i64>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let (removed, messages) = engine::clear_overrides(&state.engine, DisplayId(display_id))
        .await
        .map_err(reject)?;
    debug!(display_id, removed, "cleared override queue");
    publish(&state, messages);
    Ok(StatusCode::NO_CONTENT)
}

async fn http_resolve_ticket(
    State(state): State<Arc<AppState>>,
    Path(display_id): Path<i64>,
    Json(req): Json<ResolveTicketRequest>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let messages = engine::resolve_ticket(
        &state.engine,
        DisplayId(display_id),
        TicketId(req.ticket_id),
    )
    .await
    .map_err(reject)?;
    publish(&state, messages);
    Ok(StatusCode::NO_CONTENT)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    let channels: HashSet<String> = q
        .channels
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();
    ws.on_upgrade(move |socket| ws_connection(state, socket, channels))
}

/// One socket serves both roles: operators subscribe to channels via the
/// query string and just listen; display clients speak [`DisplayRequest`]
/// and are auto-subscribed to their private channel after a hello. The
/// socket's generated connection id correlates the disconnect.
async fn ws_connection(
    state: Arc<AppState>,
    socket: axum::extract::ws::WebSocket,
    channels: HashSet<String>,
) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let connection_id = Uuid::new_v4().to_string();
    let subscriptions = Arc::new(Mutex::new(channels));

    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.events.subscribe();

    let send_subscriptions = subscriptions.clone();
    let send_task = tokio::spawn(async move {
        while let Ok(message) = events_rx.recv().await {
            let wanted = send_subscriptions
                .lock()
                .map(|subs| subs.contains(&message.channel))
                .unwrap_or(false);
            if !wanted {
                continue;
            }
            let text = match serde_json::to_string(&message) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let request = match serde_json::from_str::<DisplayRequest>(&text) {
            Ok(request) => request,
            Err(error) => {
                debug!(%error, "ignoring malformed display request");
                continue;
            }
        };
        if matches!(request, DisplayRequest::Goodbye) {
            break;
        }
        if let Err(error) =
            handle_display_request(&state, &connection_id, &subscriptions, request).await
        {
            warn!(%error.message, "display request failed");
        }
    }

    send_task.abort();

    match engine::disconnect(&state.engine, &connection_id).await {
        Ok((display, messages)) => {
            if let Some(display) = display {
                let display_name = display.name.as_str();
                info!(%display_name, "display disconnected");
            }
            publish(&state, messages);
        }
        Err(error) => error!(%error.message, "disconnect handling failed"),
    }
}

async fn handle_display_request(
    state: &AppState,
    connection_id: &str,
    subscriptions: &Arc<Mutex<HashSet<String>>>,
    request: DisplayRequest,
) -> Result<(), ApiError> {
    match request {
        DisplayRequest::Hello { name, ip } => {
            let (display, messages) = engine::hello(
                &state.engine,
                &name,
                ip.as_deref(),
                Some(connection_id),
            )
            .await?;
            if let Ok(mut subs) = subscriptions.lock() {
                subs.insert(display_channel(display.display_id));
            }
            publish(state, messages);
        }
        DisplayRequest::CurrentSlide { group_id, slide_id } => {
            let Some(display) = display_for_connection(state, connection_id).await? else {
                return Err(ApiError::new(
                    ErrorCode::Validation,
                    "current_slide before hello",
                ));
            };
            let (_, messages) = engine::set_current_slide(
                &state.engine,
                display,
                group_id,
                slide_id,
                Some(connection_id),
            )
            .await?;
            publish(state, messages);
        }
        DisplayRequest::OverrideShown { override_id } => {
            let Some(display) = display_for_connection(state, connection_id).await? else {
                return Err(ApiError::new(
                    ErrorCode::Validation,
                    "override_shown before hello",
                ));
            };
            let (_, messages) = engine::override_shown(
                &state.engine,
                display,
                OverrideId(override_id),
                Some(connection_id),
            )
            .await?;
            publish(state, messages);
        }
        DisplayRequest::Goodbye => {}
    }
    Ok(())
}

async fn display_for_connection(
    state: &AppState,
    connection_id: &str,
) -> Result<Option<DisplayId>, ApiError> {
    let display = state
        .engine
        .storage
        .load_display_by_connection(connection_id)
        .await
        .map_err(|e| ApiError::new(ErrorCode::Internal, e.to_string()))?;
    Ok(display.map(|d| d.display_id))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;

use crate::AppState;
use crate::error::AppError;
use crate::helpers::{generate_guest_name, generate_id, generate_ticket_id, now};
use crate::session;
use crate::tracks;
use crate::validation;

use axum::{
    Json,
    extract::{FromRequestParts, Query, State, WebSocketUpgrade},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use axum_extra::TypedHeader;
use axum_macros::debug_handler;
use futures_util::StreamExt;
use headers::{Header, HeaderMapExt, HeaderName, HeaderValue};
use serde::Deserialize;
use std::sync::Arc;
use tilerace_db::{Ticket, TileCoords};

static X_TICKET: HeaderName = HeaderName::from_static("x-ticket");

/// The `x-ticket` session header.
#[derive(Debug, Clone, PartialEq)]
pub struct XTicket(pub String);

impl Header for XTicket {
    fn name() -> &'static HeaderName {
        &X_TICKET
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        let ticket = value.to_str().map_err(|_| headers::Error::invalid())?;
        if ticket.is_empty() {
            return Err(headers::Error::invalid());
        }
        Ok(XTicket(ticket.to_string()))
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        if let Ok(value) = HeaderValue::from_str(&self.0) {
            values.extend(std::iter::once(value));
        }
    }
}

/// The ticket of an authenticated request. Rejects with 401.
pub(crate) struct Authenticated(pub Ticket);

impl FromRequestParts<Arc<AppState>> for Authenticated {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let XTicket(ticket_id) = parts
            .headers
            .typed_get::<XTicket>()
            .ok_or(AppError::Unauthorized)?;

        match state.tickets.resolve(&ticket_id).await? {
            Some(ticket) => Ok(Authenticated(ticket)),
            None => Err(AppError::Unauthorized),
        }
    }
}

#[derive(Deserialize)]
pub(crate) struct TrackQuery {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TrackUpload {
    name: String,
    tile_coords: TileCoords,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TrackEdit {
    id: String,
    name: String,
    tile_coords: TileCoords,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ImpersonateRequest {
    player_id: Option<String>,
}

pub(crate) async fn ws(
    State(state): State<Arc<AppState>>,
    ticket: Option<TypedHeader<XTicket>>,
    ws: WebSocketUpgrade,
) -> Response {
    let ticket_id = ticket.map(|TypedHeader(XTicket(id))| id);
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        session::serve(state, ticket_id, sink, stream).await;
    })
}

// =============================================================================
// Auth
// =============================================================================

#[debug_handler]
pub(crate) async fn guest(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    let ticket = state
        .db
        .create_guest(generate_id(), generate_guest_name(), generate_ticket_id(), now())
        .await?;
    state.tickets.remember(ticket.clone()).await;

    tracing::info!(player_id = %ticket.player_id, "Registered guest");
    Ok(Json(ticket.id))
}

pub(crate) async fn auth_state(
    State(state): State<Arc<AppState>>,
    ticket: Option<TypedHeader<XTicket>>,
) -> Result<impl IntoResponse, AppError> {
    let known = match ticket {
        Some(TypedHeader(XTicket(id))) => state.tickets.resolve(&id).await?.is_some(),
        None => false,
    };

    Ok(if known { "1" } else { "0" })
}

/// Log out: close the live connection, revoke the ticket, and drop guest
/// accounts in the background.
pub(crate) async fn clear(
    State(state): State<Arc<AppState>>,
    ticket: Option<TypedHeader<XTicket>>,
) -> Result<impl IntoResponse, AppError> {
    let Some(TypedHeader(XTicket(ticket_id))) = ticket else {
        return Ok(StatusCode::OK);
    };
    let Some(ticket) = state.tickets.resolve(&ticket_id).await? else {
        return Ok(StatusCode::OK);
    };

    state.connections.disconnect(&ticket.player_id).await;
    state.tickets.revoke(&ticket.id).await?;

    if ticket.is_guest {
        let db = state.db.clone();
        let player_id = ticket.player_id.clone();
        tokio::spawn(async move {
            if let Err(err) = db.delete_player(player_id.clone()).await {
                tracing::error!(player_id = %player_id, ?err, "Failed to delete guest account");
            }
        });
    }

    tracing::info!(player_id = %ticket.player_id, "Player logged out");
    Ok(StatusCode::OK)
}

/// Hand out a ticket for any player. Development only.
pub(crate) async fn impersonate(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ImpersonateRequest>,
) -> Result<impl IntoResponse, AppError> {
    if !state.config.allow_impersonation {
        return Err(AppError::Unauthorized);
    }
    let player_id = payload
        .player_id
        .filter(|id| !id.is_empty())
        .ok_or(AppError::Unauthorized)?;

    let ticket = match state.tickets.resolve_by_player(&player_id).await? {
        Some(ticket) => ticket,
        None => state.tickets.create(&player_id, false).await?,
    };

    tracing::warn!(player_id = %player_id, "Impersonation ticket handed out");
    Ok(Json(ticket.id))
}

// =============================================================================
// Tracks
// =============================================================================

pub(crate) async fn get_track(
    State(state): State<Arc<AppState>>,
    _auth: Authenticated,
    Query(query): Query<TrackQuery>,
) -> Result<impl IntoResponse, AppError> {
    validation::validate_track_id(&query.id)?;

    let track = tracks::get(&state, query.id).await?;
    Ok(Json(track))
}

#[debug_handler]
pub(crate) async fn create_track(
    State(state): State<Arc<AppState>>,
    Authenticated(ticket): Authenticated,
    Json(payload): Json<TrackUpload>,
) -> Result<impl IntoResponse, AppError> {
    validation::validate_track_name(&payload.name)?;
    validation::validate_tile_coords(&payload.tile_coords)?;

    let track = tracks::create(&state, &ticket.player_id, payload.name, payload.tile_coords).await?;
    Ok(Json(track))
}

pub(crate) async fn update_track(
    State(state): State<Arc<AppState>>,
    Authenticated(ticket): Authenticated,
    Json(payload): Json<TrackEdit>,
) -> Result<impl IntoResponse, AppError> {
    validation::validate_track_id(&payload.id)?;
    validation::validate_track_name(&payload.name)?;
    validation::validate_tile_coords(&payload.tile_coords)?;

    let track = tracks::update(
        &state,
        &ticket.player_id,
        payload.id,
        payload.name,
        payload.tile_coords,
    )
    .await?;
    Ok(Json(track))
}

pub(crate) async fn delete_track(
    State(state): State<Arc<AppState>>,
    Authenticated(ticket): Authenticated,
    Query(query): Query<TrackQuery>,
) -> Result<impl IntoResponse, AppError> {
    validation::validate_track_id(&query.id)?;

    tracks::delete(&state, &ticket.player_id, query.id).await?;
    Ok(StatusCode::OK)
}

pub(crate) async fn play_track(
    State(state): State<Arc<AppState>>,
    _auth: Authenticated,
    Query(query): Query<TrackQuery>,
) -> Result<impl IntoResponse, AppError> {
    validation::validate_track_id(&query.id)?;

    let track = tracks::play(&state, query.id).await?;
    Ok(Json(track))
}

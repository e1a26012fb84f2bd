//! One WebSocket connection, from ticket check to cleanup.
//!
//! Frames of a connection are handled one at a time, in arrival order.
//! Outbound frames go through an unbounded channel that is drained by the
//! same loop, so handlers and other connections never touch the socket.

use crate::AppState;
use crate::client_data::ClientData;
use crate::connections::ConnectionHandle;
use crate::error::SessionError;
use crate::helpers::now;
use crate::protocol::{ClientEvent, ClientFrame, Inbound, Operation, ServerFrame};
use crate::tracks;
use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use std::fmt::Display;
use std::sync::Arc;
use tilerace_db::{Player, Track, TrackInfo};
use tokio::sync::mpsc;

/// Serve a connection until either side closes it.
///
/// Connections without a valid ticket are closed before any frame is sent.
pub async fn serve<S, R, E>(state: Arc<AppState>, ticket_id: Option<String>, mut sink: S, mut stream: R)
where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let ticket = match ticket_id {
        Some(id) => state.tickets.resolve(&id).await,
        None => Ok(None),
    };
    let ticket = match ticket {
        Ok(Some(ticket)) => ticket,
        Ok(None) => {
            tracing::debug!("Rejected connection without a valid ticket");
            let _ = sink.close().await;
            return;
        }
        Err(err) => {
            tracing::error!(?err, "Failed to resolve ticket");
            let _ = sink.close().await;
            return;
        }
    };
    let player_id = ticket.player_id;

    let (player, latest_tracks) = match load_client_data(&state, &player_id).await {
        Ok(loaded) => loaded,
        Err(err) => {
            tracing::error!(player_id = %player_id, ?err, "Failed to build client data");
            let frame = ServerFrame::push("Client_Data_Error", &());
            if let Ok(text) = frame.to_json() {
                let _ = sink.send(Message::Text(text.into())).await;
            }
            let _ = sink.close().await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = ConnectionHandle::new(tx.clone());
    let shutdown = handle.shutdown_signal();
    let guard = ConnectionGuard::new(state.clone(), player_id.clone(), handle.id);

    // Client_Data is queued before any broadcast can reach the connection
    let tiles = state.client_data.tiles();
    state
        .queue
        .register_connection(&player_id, handle, |races_queue| {
            let client_data = ClientData {
                tiles,
                player,
                latest_tracks,
                races_queue: races_queue.clone(),
            };
            let _ = tx.send(ServerFrame::push("Client_Data", &client_data));
        })
        .await;
    tracing::info!(player_id = %player_id, "Player connected");

    let mut writable = true;
    loop {
        tokio::select! {
            Some(frame) = rx.recv() => {
                if !write_frame(&mut sink, &frame).await {
                    writable = false;
                    break;
                }
            }
            message = stream.next() => {
                let parsed = match message {
                    Some(Ok(Message::Text(text))) => ClientFrame::parse(text.as_str()),
                    Some(Ok(Message::Binary(bytes))) => ClientFrame::parse_bytes(&bytes),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue, // ping/pong handled by axum
                    Some(Err(err)) => {
                        tracing::debug!(player_id = %player_id, %err, "Connection lost");
                        break;
                    }
                };

                match parsed {
                    Ok(frame) => dispatch(&state, &player_id, frame.into_inbound(&tx)).await,
                    Err(err) => {
                        tracing::warn!(player_id = %player_id, %err, "Closing connection on bad frame");
                        break;
                    }
                }
            }
            _ = shutdown.notified() => {
                tracing::debug!(player_id = %player_id, "Connection closed by server");
                break;
            }
        }
    }

    if writable {
        while let Ok(frame) = rx.try_recv() {
            if !write_frame(&mut sink, &frame).await {
                break;
            }
        }
    }

    guard.finish().await;
    let _ = sink.close().await;
}

async fn write_frame<S: Sink<Message> + Unpin>(sink: &mut S, frame: &ServerFrame) -> bool {
    match frame.to_json() {
        Ok(text) => sink.send(Message::Text(text.into())).await.is_ok(),
        Err(err) => {
            tracing::error!(event = %frame.event_name, ?err, "Failed to encode frame");
            true
        }
    }
}

async fn load_client_data(state: &AppState, player_id: &str) -> tilerace_db::Result<(Player, Vec<TrackInfo>)> {
    let player = state.db.get_full_player(player_id.to_string()).await?;
    let latest_tracks = state.client_data.latest_tracks().await?;
    Ok((player, latest_tracks))
}

/// Reply payload of a request.
#[derive(Serialize)]
#[serde(untagged)]
enum Reply {
    Track(Box<Track>),
    Empty,
}

/// Decode and run one frame. Failures never leave this function.
async fn dispatch(state: &Arc<AppState>, player_id: &str, inbound: Inbound) {
    let Inbound {
        event_name,
        data,
        operation,
    } = inbound;

    let event = match ClientEvent::decode(&event_name, data.as_deref()) {
        Ok(Some(event)) => event,
        Ok(None) => {
            if cfg!(debug_assertions) {
                tracing::debug!(event = %event_name, "Ignoring unknown event");
            }
            return;
        }
        Err(err) => {
            settle(operation, &event_name, player_id, Err(err.into()));
            return;
        }
    };

    let operation = match operation {
        Operation::Request(_) if !event.expects_reply() => {
            tracing::debug!(event = %event_name, player_id, "Exchange id on an unanswered event");
            Operation::Notification
        }
        operation => operation,
    };

    let result = handle(state, player_id, event).await;
    settle(operation, &event_name, player_id, result);
}

fn settle(operation: Operation, event_name: &str, player_id: &str, result: Result<Reply, SessionError>) {
    match (operation, result) {
        (Operation::Request(mut exchange), Ok(reply)) => {
            exchange.resolve(&reply);
        }
        (Operation::Request(mut exchange), Err(err)) => {
            exchange.reject(&err.client_message());
        }
        (Operation::Notification, Ok(_)) => {}
        (Operation::Notification, Err(err)) => {
            tracing::warn!(event = event_name, player_id, %err, "Notification failed");
        }
    }
}

async fn handle(state: &Arc<AppState>, player_id: &str, event: ClientEvent) -> Result<Reply, SessionError> {
    let reply = match event {
        ClientEvent::Track { track_id } => Reply::Track(Box::new(tracks::get(state, track_id).await?)),
        ClientEvent::TrackCreate(upload) => {
            let track = tracks::create(state, player_id, upload.name, upload.tile_coords).await?;
            Reply::Track(Box::new(track))
        }
        ClientEvent::TrackUpdate(edit) => {
            let track = tracks::update(state, player_id, edit.id, edit.name, edit.tile_coords).await?;
            Reply::Track(Box::new(track))
        }
        ClientEvent::TrackDelete { track_id } => {
            tracks::delete(state, player_id, track_id).await?;
            Reply::Empty
        }
        ClientEvent::PlayTrack { track_id } => Reply::Track(Box::new(tracks::play(state, track_id).await?)),
        ClientEvent::RaceQueueEnter { track_id } => {
            state.queue.enqueue(player_id, &track_id).await?;
            Reply::Empty
        }
        ClientEvent::RaceQueueLeave => {
            state.queue.dequeue(player_id).await;
            Reply::Empty
        }
        ClientEvent::RaceQueueReady => {
            state.queue.set_ready(player_id).await;
            Reply::Empty
        }
        ClientEvent::RaceCharacterUpdate(motion) => {
            state.races.character_update(player_id, motion).await;
            Reply::Empty
        }
        ClientEvent::RaceCharacterFinish => {
            state.races.character_finish(player_id).await;
            Reply::Empty
        }
    };

    Ok(reply)
}

/// Runs the disconnect cleanup of one connection exactly once, either
/// through [`ConnectionGuard::finish`] or, if the connection task is torn
/// down early, from `Drop`.
struct ConnectionGuard {
    state: Arc<AppState>,
    player_id: String,
    connection_id: u64,
    armed: bool,
}

impl ConnectionGuard {
    fn new(state: Arc<AppState>, player_id: String, connection_id: u64) -> Self {
        Self {
            state,
            player_id,
            connection_id,
            armed: true,
        }
    }

    async fn finish(mut self) {
        self.armed = false;
        cleanup(self.state.clone(), self.player_id.clone(), self.connection_id).await;
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;

        let state = self.state.clone();
        let player_id = std::mem::take(&mut self.player_id);
        let connection_id = self.connection_id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(cleanup(state, player_id, connection_id));
            }
            Err(_) => tracing::error!(player_id = %player_id, "Connection cleanup skipped, no runtime"),
        }
    }
}

async fn cleanup(state: Arc<AppState>, player_id: String, connection_id: u64) {
    // A superseding connection owns the queue and race state from now on
    if state.connections.unregister(&player_id, connection_id).await {
        state.queue.dequeue(&player_id).await;
        state.races.leave(&player_id).await;
    }

    if let Err(err) = state
        .db
        .update_player_last_seen(player_id.clone(), now())
        .await
    {
        tracing::warn!(player_id = %player_id, ?err, "Failed to record last seen");
    }

    tracing::info!(player_id = %player_id, "Player disconnected");
}

use axum::extract::ws::Message;
use futures_util::{sink, stream};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tilerace_backend::config::Config;
use tilerace_backend::{AppState, helpers, session};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(100);

/// A client driving `session::serve` through in-memory channels.
struct Client {
    to_server: Option<mpsc::UnboundedSender<Result<Message, String>>>,
    from_server: mpsc::UnboundedReceiver<Message>,
    task: JoinHandle<()>,
    next_exchange: u32,
    /// Pushes skipped while waiting for a reply
    backlog: Vec<Value>,
}

impl Client {
    fn connect(state: &Arc<AppState>, ticket: Option<&str>) -> Self {
        let (to_server, inbound) = mpsc::unbounded_channel::<Result<Message, String>>();
        let (outbound, from_server) = mpsc::unbounded_channel::<Message>();

        let socket_sink = Box::pin(sink::unfold(outbound, |outbound, message: Message| async move {
            outbound.send(message).map_err(|_| "client gone".to_string())?;
            Ok::<_, String>(outbound)
        }));
        let socket_stream = Box::pin(stream::unfold(inbound, |mut inbound| async move {
            inbound.recv().await.map(|message| (message, inbound))
        }));

        let task = tokio::spawn(session::serve(
            state.clone(),
            ticket.map(str::to_string),
            socket_sink,
            socket_stream,
        ));

        Self {
            to_server: Some(to_server),
            from_server,
            task,
            next_exchange: 0,
            backlog: Vec::new(),
        }
    }

    fn send_raw(&self, text: &str) {
        if let Some(to_server) = &self.to_server {
            let _ = to_server.send(Ok(Message::Text(text.to_string().into())));
        }
    }

    fn frame(&self, event: &str, data: Option<Value>, exchange_id: Option<&str>) {
        let data = data.map(|value| value.to_string());
        let frame = json!({ "eventName": event, "data": data, "exchangeId": exchange_id });
        self.send_raw(&frame.to_string());
    }

    /// Fire-and-forget event
    fn notify(&self, event: &str, data: Option<Value>) {
        self.frame(event, data, None);
    }

    /// Send a request and wait for its reply, skipping pushes in between
    async fn request(&mut self, event: &str, data: Option<Value>) -> Value {
        self.next_exchange += 1;
        let exchange_id = format!("x{}", self.next_exchange);
        self.frame(event, data, Some(&exchange_id));

        loop {
            let frame = self.recv().await.expect("connection closed before reply");
            if frame["exchangeId"] == exchange_id.as_str() {
                return frame;
            }
            self.backlog.push(frame);
        }
    }

    /// Wait until every frame sent so far has been handled, returning the
    /// pushes received in the meantime
    async fn barrier(&mut self) -> Vec<Value> {
        self.request("Track", Some(json!("barrier"))).await;
        std::mem::take(&mut self.backlog)
    }

    async fn recv(&mut self) -> Option<Value> {
        loop {
            match timeout(WAIT, self.from_server.recv()).await {
                Ok(Some(Message::Text(text))) => {
                    return Some(serde_json::from_str(text.as_str()).unwrap());
                }
                Ok(Some(_)) => continue,
                Ok(None) => return None,
                Err(_) => panic!("timed out waiting for a frame"),
            }
        }
    }

    /// Next frame of `event`, including pushes skipped by earlier requests
    async fn recv_event(&mut self, event: &str) -> Value {
        if let Some(position) = self.backlog.iter().position(|f| f["eventName"] == event) {
            return self.backlog.remove(position);
        }
        loop {
            let frame = self.recv().await.expect("connection closed");
            if frame["eventName"] == event {
                return frame;
            }
        }
    }

    /// Frames that arrive within a short quiet period
    async fn drain(&mut self) -> Vec<Value> {
        let mut frames = std::mem::take(&mut self.backlog);
        while let Ok(Some(message)) = timeout(QUIET, self.from_server.recv()).await {
            if let Message::Text(text) = message {
                frames.push(serde_json::from_str(text.as_str()).unwrap());
            }
        }
        frames
    }

    async fn expect_closed(&mut self) -> Vec<Value> {
        let mut frames = std::mem::take(&mut self.backlog);
        while let Some(frame) = self.recv().await {
            frames.push(frame);
        }
        frames
    }

    /// Close the client side and wait for the server to finish cleanup
    async fn disconnect(mut self) {
        self.to_server.take();
        timeout(WAIT, self.task)
            .await
            .expect("session did not end")
            .unwrap();
    }
}

fn payload(frame: &Value) -> Value {
    serde_json::from_str(frame["data"].as_str().expect("frame has no data")).unwrap()
}

fn count(frames: &[Value], event: &str) -> usize {
    frames.iter().filter(|f| f["eventName"] == event).count()
}

async fn setup() -> Arc<AppState> {
    let db = tilerace_db::Database::open_in_memory()
        .await
        .expect("Failed to create in-memory database");
    AppState::new(db, Config::default())
}

async fn create_player(state: &AppState, player_id: &str) -> String {
    state
        .db
        .create_player(player_id.to_string(), player_id.to_uppercase(), None, helpers::now())
        .await
        .unwrap();
    state.tickets.create(player_id, false).await.unwrap().id
}

async fn create_track(state: &AppState, author: &str, track_id: &str) {
    state
        .db
        .create_track(
            track_id.to_string(),
            author.to_string(),
            format!("Track {track_id}"),
            Default::default(),
            helpers::now(),
        )
        .await
        .unwrap();
}

/// Connect and consume the initial snapshot
async fn join(state: &Arc<AppState>, ticket: &str) -> Client {
    let mut client = Client::connect(state, Some(ticket));
    let first = client.recv().await.expect("no snapshot");
    assert_eq!(first["eventName"], "Client_Data");
    client
}

// =============================================================================
// HANDSHAKE
// =============================================================================

#[tokio::test]
async fn test_connection_without_ticket_gets_no_frames() {
    // GIVEN: A server
    let state = setup().await;

    // WHEN: Connecting without a ticket, or with an unknown one
    let mut anonymous = Client::connect(&state, None);
    let mut forged = Client::connect(&state, Some("forged"));

    // THEN: Both are closed with zero frames sent
    assert!(anonymous.expect_closed().await.is_empty());
    assert!(forged.expect_closed().await.is_empty());
    assert_eq!(state.connections.len().await, 0);
}

#[tokio::test]
async fn test_snapshot_is_first_frame() {
    // GIVEN: A player with a published track
    let state = setup().await;
    let ticket = create_player(&state, "a").await;
    create_track(&state, "a", "t1").await;

    // WHEN: Connecting
    let mut client = Client::connect(&state, Some(&ticket));
    let first = client.recv().await.unwrap();

    // THEN: The first frame is the snapshot push
    assert_eq!(first["eventName"], "Client_Data");
    assert!(first["exchangeId"].is_null());
    assert!(first["error"].is_null());

    let data = payload(&first);
    assert_eq!(data["tiles"].as_array().unwrap().len(), 18);
    assert_eq!(data["player"]["id"], "a");
    assert_eq!(data["player"]["trackInfos"][0]["id"], "t1");
    assert_eq!(data["latestTracks"][0]["id"], "t1");
    assert_eq!(data["racesQueue"], json!({}));
    assert!(state.connections.is_connected("a").await);
}

#[tokio::test]
async fn test_snapshot_failure_pushes_error_and_closes() {
    // GIVEN: A cached ticket whose player no longer exists
    let state = setup().await;
    let ticket = create_player(&state, "a").await;
    state.db.delete_player("a".to_string()).await.unwrap();

    // WHEN: Connecting with it
    let mut client = Client::connect(&state, Some(&ticket));

    // THEN: Exactly one Client_Data_Error, then close
    let frames = client.expect_closed().await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["eventName"], "Client_Data_Error");
    assert!(!state.connections.is_connected("a").await);
}

// =============================================================================
// PROTOCOL
// =============================================================================

#[tokio::test]
async fn test_malformed_frame_closes_connection() {
    let state = setup().await;
    let ticket = create_player(&state, "a").await;
    let mut client = join(&state, &ticket).await;

    client.send_raw(r#"{"eventName":"Track","exchangeId":"1","data":null,"bogus":true}"#);

    assert!(client.expect_closed().await.is_empty());
    client.disconnect().await;
    assert!(!state.connections.is_connected("a").await);
}

#[tokio::test]
async fn test_unknown_event_is_ignored() {
    let state = setup().await;
    let ticket = create_player(&state, "a").await;
    let mut client = join(&state, &ticket).await;

    client.frame("Dance", Some(json!(1)), Some("d1"));

    // No reply, and the connection keeps working
    assert!(client.barrier().await.is_empty());
}

#[tokio::test]
async fn test_error_replies() {
    let state = setup().await;
    let ticket = create_player(&state, "a").await;
    let mut client = join(&state, &ticket).await;

    let reply = client.request("Race_Queue_Enter", Some(json!("missing"))).await;
    assert_eq!(reply["eventName"], "Race_Queue_Enter_Error");
    assert_eq!(reply["error"], "Track not found");
    assert!(reply["data"].is_null());

    let reply = client.request("Track", Some(json!(42))).await;
    assert_eq!(reply["eventName"], "Track_Error");
    assert_eq!(reply["error"], "Invalid track id");

    let reply = client
        .request("Track_Create", Some(json!({ "name": "", "tileCoords": {} })))
        .await;
    assert_eq!(reply["eventName"], "Track_Create_Error");
    assert_eq!(reply["error"], "Track name cannot be empty");
}

#[tokio::test]
async fn test_failed_notification_gets_no_reply() {
    let state = setup().await;
    let ticket = create_player(&state, "a").await;
    let mut client = join(&state, &ticket).await;

    client.notify("Race_Queue_Enter", Some(json!("missing")));

    assert!(client.barrier().await.is_empty());
}

#[tokio::test]
async fn test_track_events_keep_latest_tracks_in_sync() {
    // GIVEN: A connected player
    let state = setup().await;
    let ticket = create_player(&state, "a").await;
    let mut client = join(&state, &ticket).await;

    // WHEN: Creating a track over the socket
    let reply = client
        .request(
            "Track_Create",
            Some(json!({ "name": "Loop", "tileCoords": { "2": [4, 5] } })),
        )
        .await;

    // THEN: The reply carries the track
    assert_eq!(reply["eventName"], "Track_Create_Success");
    let track = payload(&reply);
    assert_eq!(track["name"], "Loop");
    assert_eq!(track["author"], "A");
    let track_id = track["id"].as_str().unwrap().to_string();

    // AND: A new client sees it among the latest tracks
    let mut other = Client::connect(&state, Some(&ticket));
    let snapshot = payload(&other.recv().await.unwrap());
    assert_eq!(snapshot["latestTracks"][0]["id"], track_id.as_str());

    // WHEN: Playing and deleting it
    let reply = other.request("Play_Track", Some(json!(track_id))).await;
    assert_eq!(reply["eventName"], "Play_Track_Success");
    let reply = other.request("Track_Delete", Some(json!(track_id))).await;
    assert_eq!(reply["eventName"], "Track_Delete_Success");
    assert_eq!(reply["data"], "null");

    // THEN: It is gone from the latest tracks
    assert!(state.client_data.latest_tracks().await.unwrap().is_empty());
}

// =============================================================================
// QUEUE
// =============================================================================

#[tokio::test]
async fn test_two_players_ready_start_a_race() {
    // GIVEN: Players a and b connected, track t1 exists
    let state = setup().await;
    let ticket_a = create_player(&state, "a").await;
    let ticket_b = create_player(&state, "b").await;
    create_track(&state, "a", "t1").await;
    let mut a = join(&state, &ticket_a).await;
    let mut b = join(&state, &ticket_b).await;

    // WHEN: a enqueues for t1
    let reply = a.request("Race_Queue_Enter", Some(json!("t1"))).await;
    assert_eq!(reply["eventName"], "Race_Queue_Enter_Success");
    assert_eq!(reply["data"], "null");

    // THEN: Everyone sees it
    let enter = b.recv_event("Race_Queue_Enter").await;
    assert_eq!(payload(&enter)["trackId"], "t1");
    assert_eq!(payload(&enter)["player"]["id"], "a");

    // WHEN: b enqueues and a gets ready
    b.request("Race_Queue_Enter", Some(json!("t1"))).await;
    a.notify("Race_Queue_Ready", None);
    a.barrier().await;

    // THEN: No race yet, a is ready
    let entry = state.queue.entry("t1").await.unwrap();
    assert_eq!(entry.players.len(), 2);
    assert_eq!(entry.players_ready, vec!["a".to_string()]);
    assert_eq!(state.races.len().await, 0);

    // WHEN: b gets ready
    b.notify("Race_Queue_Ready", None);
    let pushed_to_b = b.barrier().await;

    // THEN: The lobby is gone and both receive exactly one Race_Start
    assert!(state.queue.entry("t1").await.is_none());
    assert_eq!(state.races.len().await, 1);

    let pushed_to_a = a.drain().await;
    for frames in [&pushed_to_a, &pushed_to_b] {
        assert_eq!(count(frames, "Race_Start"), 1);
    }
    assert_eq!(count(&pushed_to_a, "Race_Queue_Clear"), 1);

    let start = pushed_to_b
        .iter()
        .find(|f| f["eventName"] == "Race_Start")
        .unwrap();
    let race = payload(start);
    assert_eq!(race["track"]["id"], "t1");
    let roster: Vec<&str> = race["players"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["id"].as_str().unwrap())
        .collect();
    assert_eq!(roster, vec!["a", "b"]);
}

#[tokio::test]
async fn test_enqueue_twice_keeps_single_membership() {
    let state = setup().await;
    let ticket_a = create_player(&state, "a").await;
    let ticket_b = create_player(&state, "b").await;
    create_track(&state, "a", "t1").await;
    let mut a = join(&state, &ticket_a).await;
    let mut b = join(&state, &ticket_b).await;

    a.request("Race_Queue_Enter", Some(json!("t1"))).await;
    let reply = a.request("Race_Queue_Enter", Some(json!("t1"))).await;
    assert_eq!(reply["eventName"], "Race_Queue_Enter_Success");

    // The broadcast went out once; the repeat reached only a
    assert_eq!(state.queue.entry("t1").await.unwrap().players.len(), 1);
    assert_eq!(count(&a.drain().await, "Race_Queue_Enter"), 2);
    assert_eq!(count(&b.drain().await, "Race_Queue_Enter"), 1);
}

#[tokio::test]
async fn test_disconnect_cleans_up_exactly_once() {
    // GIVEN: a queued for t1, b watching
    let state = setup().await;
    let ticket_a = create_player(&state, "a").await;
    let ticket_b = create_player(&state, "b").await;
    create_track(&state, "a", "t1").await;
    let mut a = join(&state, &ticket_a).await;
    let mut b = join(&state, &ticket_b).await;
    a.request("Race_Queue_Enter", Some(json!("t1"))).await;
    b.recv_event("Race_Queue_Enter").await;
    let before = state.db.get_player_profile("a".to_string()).await.unwrap();

    // WHEN: a's transport closes
    a.disconnect().await;

    // THEN: a is unregistered, out of the queue, and b hears about it once
    assert!(!state.connections.is_connected("a").await);
    assert!(state.queue.snapshot().await.is_empty());

    let frames = b.drain().await;
    assert_eq!(count(&frames, "Race_Queue_Leave"), 1);
    let leave = frames
        .iter()
        .find(|f| f["eventName"] == "Race_Queue_Leave")
        .unwrap();
    assert_eq!(payload(leave), json!({ "trackId": "t1", "playerId": "a" }));

    // AND: last seen was recorded
    let after = state.db.get_player_profile("a".to_string()).await.unwrap();
    assert!(after.last_seen >= before.last_seen);
}

#[tokio::test]
async fn test_superseded_connection_leaves_queue_alone() {
    // GIVEN: a queued for t1 on its first connection
    let state = setup().await;
    let ticket = create_player(&state, "a").await;
    create_track(&state, "a", "t1").await;
    let mut first = join(&state, &ticket).await;
    first.request("Race_Queue_Enter", Some(json!("t1"))).await;

    // WHEN: a connects again
    let mut second = Client::connect(&state, Some(&ticket));
    let snapshot = payload(&second.recv_event("Client_Data").await);

    // THEN: The first connection is closed without touching the queue
    first.expect_closed().await;
    first.disconnect().await;
    assert!(state.connections.is_connected("a").await);
    assert_eq!(state.queue.queued_track("a").await.as_deref(), Some("t1"));
    assert_eq!(snapshot["racesQueue"]["t1"]["players"]["a"]["id"], "a");

    // AND: The second connection is live
    second.notify("Race_Queue_Leave", None);
    second.barrier().await;
    assert_eq!(state.queue.queued_track("a").await, None);
}

#[tokio::test]
async fn test_lobby_leave_and_ready_are_never_answered() {
    // GIVEN: a and b queued for t1
    let state = setup().await;
    let ticket_a = create_player(&state, "a").await;
    let ticket_b = create_player(&state, "b").await;
    create_track(&state, "a", "t1").await;
    let mut a = join(&state, &ticket_a).await;
    let _b = join(&state, &ticket_b).await;
    a.request("Race_Queue_Enter", Some(json!("t1"))).await;
    state.queue.enqueue("b", "t1").await.unwrap();

    // WHEN: a readies up and leaves, both frames carrying an exchange id
    a.frame("Race_Queue_Ready", None, Some("rd"));
    a.frame("Race_Queue_Leave", None, Some("lv"));
    let frames = a.barrier().await;

    // THEN: Both took effect, but neither got a reply
    assert_eq!(count(&frames, "Race_Queue_Ready"), 1);
    assert_eq!(count(&frames, "Race_Queue_Leave"), 1);
    assert!(frames.iter().all(|f| f["exchangeId"].is_null()));
    assert_eq!(state.queue.queued_track("a").await, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connecting_client_sees_concurrent_enqueue() {
    for _ in 0..20 {
        // GIVEN: a enqueues for t1 while b connects
        let state = setup().await;
        create_player(&state, "a").await;
        let ticket_b = create_player(&state, "b").await;
        create_track(&state, "a", "t1").await;

        let enqueue = tokio::spawn({
            let state = state.clone();
            async move { state.queue.enqueue("a", "t1").await.unwrap() }
        });
        let mut b = Client::connect(&state, Some(&ticket_b));
        let snapshot = payload(&b.recv_event("Client_Data").await);
        enqueue.await.unwrap();

        // THEN: b learns about a exactly once, from the snapshot or a broadcast
        let in_snapshot = !snapshot["racesQueue"]["t1"]["players"]["a"].is_null();
        let broadcasts = count(&b.drain().await, "Race_Queue_Enter");
        assert_eq!(usize::from(in_snapshot) + broadcasts, 1);
    }
}

#[tokio::test]
async fn test_logout_closes_live_connection() {
    let state = setup().await;
    let ticket = create_player(&state, "a").await;
    let mut client = join(&state, &ticket).await;

    assert!(state.connections.disconnect("a").await);

    client.expect_closed().await;
    client.disconnect().await;
    assert!(!state.connections.is_connected("a").await);
}

// =============================================================================
// RACE
// =============================================================================

async fn start_race(state: &Arc<AppState>) -> (Client, Client) {
    let ticket_a = create_player(state, "a").await;
    let ticket_b = create_player(state, "b").await;
    create_track(state, "a", "t1").await;
    let mut a = join(state, &ticket_a).await;
    let mut b = join(state, &ticket_b).await;

    a.request("Race_Queue_Enter", Some(json!("t1"))).await;
    b.request("Race_Queue_Enter", Some(json!("t1"))).await;
    a.notify("Race_Queue_Ready", None);
    a.barrier().await;
    b.notify("Race_Queue_Ready", None);
    a.recv_event("Race_Start").await;
    b.recv_event("Race_Start").await;
    a.drain().await;
    b.drain().await;
    (a, b)
}

#[tokio::test]
async fn test_character_update_is_relayed_and_clamped() {
    let state = setup().await;
    let (mut a, mut b) = start_race(&state).await;

    a.notify(
        "Race_Character_Update",
        Some(json!({ "x": 12.5, "y": 3, "vx": 1, "vy": -2, "ih": 4, "iv": -0.5 })),
    );

    let relayed = payload(&b.recv_event("Race_Character_Update").await);
    assert_eq!(relayed["id"], "a");
    assert_eq!(relayed["x"], 12.5);
    assert_eq!(relayed["ih"], 1.0);
    assert_eq!(relayed["iv"], -0.5);

    // The sender gets its own update back
    let echoed = payload(&a.recv_event("Race_Character_Update").await);
    assert_eq!(echoed["id"], "a");
}

#[tokio::test]
async fn test_character_update_outside_race_is_ignored() {
    let state = setup().await;
    let ticket_a = create_player(&state, "a").await;
    let ticket_b = create_player(&state, "b").await;
    let mut a = join(&state, &ticket_a).await;
    let mut b = join(&state, &ticket_b).await;

    a.notify("Race_Character_Update", Some(json!({ "x": 1 })));

    assert!(a.barrier().await.is_empty());
    assert!(b.drain().await.is_empty());
}

#[tokio::test]
async fn test_finish_is_relayed_to_other_racers() {
    let state = setup().await;
    let (mut a, mut b) = start_race(&state).await;

    a.notify("Race_Character_Finish", None);
    a.notify("Race_Character_Finish", None);

    let pushed_to_a = a.barrier().await;
    assert_eq!(count(&pushed_to_a, "Race_Character_Finish"), 0);

    let frames = b.drain().await;
    assert_eq!(count(&frames, "Race_Character_Finish"), 1);
    let finish = payload(&frames[0]);
    assert_eq!(finish["playerId"], "a");
    assert!(finish["time"].as_i64().unwrap() >= 0);

    // b leaving ends the race
    b.disconnect().await;
    assert_eq!(state.races.len().await, 0);
}

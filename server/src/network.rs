//! WebSocket edge: accept loop, per-connection tasks, dispatch, broadcast.
//!
//! Each accepted socket gets a reader loop and a writer task. The writer
//! drains an unbounded queue into the sink, so broadcasting to a session is
//! just pushing onto every member's queue; a dead peer fails its own send
//! and never blocks the others. Text frames are decoded as client envelopes
//! and dispatched against the registry under its write lock.
//!
//! A connection's session membership is decided by its registry binding, not
//! by the `sessionId` fields clients echo in payloads.

use crate::registry::{ConnectionId, RegistryError, SessionRegistry};
use crate::voting;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use shared::{ClientEnvelope, ClientMessage, ErrorCode, ServerEnvelope, ServerMessage};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

pub(crate) struct ServerState {
    registry: RwLock<SessionRegistry>,
    peers: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<Message>>>,
    next_conn_id: AtomicU64,
}

impl ServerState {
    fn new(auto_reveal: bool) -> Self {
        Self {
            registry: RwLock::new(SessionRegistry::new(auto_reveal)),
            peers: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }
}

/// The planning poker server. Binds a TCP listener and upgrades every
/// accepted connection to a WebSocket.
pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl Server {
    /// Binds to `addr`. `auto_reveal` is applied to every session created
    /// while this server runs.
    pub async fn bind(addr: &str, auto_reveal: bool) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            state: Arc::new(ServerState::new(auto_reveal)),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. Runs until the listener fails.
    pub async fn run(&self) -> std::io::Result<()> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                handle_connection(state, stream, addr).await;
            });
        }
    }
}

async fn handle_connection(state: Arc<ServerState>, stream: TcpStream, addr: SocketAddr) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };
    let conn = state.next_conn_id.fetch_add(1, Ordering::Relaxed);
    debug!("Connection {} established from {}", conn, addr);

    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    state.peers.write().await.insert(conn, tx);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => dispatch(&state, conn, &text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Connection {} read error: {}", conn, e);
                break;
            }
        }
    }

    handle_disconnect(&state, conn).await;
    state.peers.write().await.remove(&conn);
    writer.abort();
    debug!("Connection {} closed", conn);
}

/// Decodes one text frame and applies it. Decode failures only ever answer
/// the offending connection.
async fn dispatch(state: &Arc<ServerState>, conn: ConnectionId, text: &str) {
    let envelope: ClientEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("Connection {} sent an undecodable frame: {}", conn, e);
            send_to(
                state,
                conn,
                ServerMessage::SessionError {
                    message: "Invalid message format.".to_string(),
                    code: ErrorCode::InvalidMessage,
                },
            )
            .await;
            return;
        }
    };

    match envelope.message {
        ClientMessage::SessionCreate {
            session_name,
            participant_name,
        } => {
            let entry = state
                .registry
                .write()
                .await
                .create_session(conn, &session_name, &participant_name);
            send_to(
                state,
                conn,
                ServerMessage::SessionCreated {
                    session: entry.session,
                    join_code: entry.join_code,
                    participant: entry.participant,
                },
            )
            .await;
        }
        ClientMessage::SessionJoin {
            join_code,
            participant_name,
            as_observer,
        } => {
            let result = state.registry.write().await.join_session(
                conn,
                &join_code,
                &participant_name,
                as_observer,
            );
            match result {
                Ok(entry) => {
                    let session_id = entry.session.id.clone();
                    send_to(
                        state,
                        conn,
                        ServerMessage::SessionJoined {
                            session: entry.session.clone(),
                            join_code: entry.join_code,
                            participant: entry.participant.clone(),
                        },
                    )
                    .await;
                    broadcast(
                        state,
                        &session_id,
                        ServerMessage::ParticipantJoined {
                            participant: entry.participant,
                            session_id: session_id.clone(),
                        },
                        Some(conn),
                    )
                    .await;
                    broadcast(
                        state,
                        &session_id,
                        ServerMessage::SessionUpdated {
                            session: entry.session,
                        },
                        None,
                    )
                    .await;
                }
                Err(e) => error_reply(state, conn, e).await,
            }
        }
        ClientMessage::SessionLeave { .. } => {
            let result = state.registry.write().await.leave_session(conn);
            match result {
                Ok(outcome) => {
                    send_to(state, conn, ServerMessage::SessionLeft { success: true }).await;
                    if let Some(session) = outcome.session {
                        broadcast(
                            state,
                            &outcome.session_id,
                            ServerMessage::ParticipantLeft {
                                participant_id: outcome.participant_id,
                                session_id: outcome.session_id.clone(),
                            },
                            None,
                        )
                        .await;
                        broadcast(
                            state,
                            &outcome.session_id,
                            ServerMessage::SessionUpdated { session },
                            None,
                        )
                        .await;
                    }
                }
                Err(e) => error_reply(state, conn, e).await,
            }
        }
        ClientMessage::VoteSelect { value, .. } => {
            let result = state.registry.write().await.select_vote(conn, &value);
            match result {
                Ok(outcome) => {
                    let session_id = outcome.session.id.clone();
                    // Peers only see the value once cards are up
                    let visible = if outcome.session.cards_revealed {
                        Some(value)
                    } else {
                        None
                    };
                    broadcast(
                        state,
                        &session_id,
                        ServerMessage::ParticipantVoted {
                            participant_id: outcome.participant_id,
                            session_id: session_id.clone(),
                            value: visible,
                        },
                        Some(conn),
                    )
                    .await;
                    broadcast(
                        state,
                        &session_id,
                        ServerMessage::SessionUpdated {
                            session: outcome.session,
                        },
                        None,
                    )
                    .await;
                }
                Err(e) => error_reply(state, conn, e).await,
            }
        }
        ClientMessage::VoteReveal { .. } => {
            let result = state.registry.write().await.reveal_cards(conn);
            match result {
                Ok(session) => {
                    let result = voting::aggregate(&session);
                    info!(
                        "Session {} revealed: avg {:?}, median {:?}, mode {:?}, consensus {}",
                        session.id, result.average, result.median, result.mode,
                        result.has_consensus
                    );
                    broadcast_update(state, session).await;
                }
                Err(e) => error_reply(state, conn, e).await,
            }
        }
        ClientMessage::VoteReset { .. } => {
            let result = state.registry.write().await.reset_voting(conn);
            match result {
                Ok(session) => broadcast_update(state, session).await,
                Err(e) => error_reply(state, conn, e).await,
            }
        }
        ClientMessage::VotingStart {
            story, description, ..
        } => {
            let result = state
                .registry
                .write()
                .await
                .start_voting(conn, &story, description);
            match result {
                Ok(session) => broadcast_update(state, session).await,
                Err(e) => error_reply(state, conn, e).await,
            }
        }
        ClientMessage::StoryAdd {
            title, description, ..
        } => {
            let result = state
                .registry
                .write()
                .await
                .add_story(conn, &title, description);
            match result {
                Ok(session) => broadcast_update(state, session).await,
                Err(e) => error_reply(state, conn, e).await,
            }
        }
        ClientMessage::StoryRemove { story_id, .. } => {
            let result = state.registry.write().await.remove_story(conn, &story_id);
            match result {
                Ok(session) => broadcast_update(state, session).await,
                Err(e) => error_reply(state, conn, e).await,
            }
        }
        ClientMessage::StoryUpdate {
            story_id,
            title,
            description,
            ..
        } => {
            let result = state
                .registry
                .write()
                .await
                .update_story(conn, &story_id, &title, description);
            match result {
                Ok(session) => broadcast_update(state, session).await,
                Err(e) => error_reply(state, conn, e).await,
            }
        }
        ClientMessage::StoryNext { .. } => {
            let result = state.registry.write().await.next_story(conn);
            match result {
                Ok(session) => broadcast_update(state, session).await,
                Err(e) => error_reply(state, conn, e).await,
            }
        }
        ClientMessage::Ping {} => {
            send_to(state, conn, ServerMessage::Pong {}).await;
        }
    }
}

/// Treats a closed socket as an implicit leave. Connections that never
/// joined a session are simply dropped.
async fn handle_disconnect(state: &Arc<ServerState>, conn: ConnectionId) {
    let result = state.registry.write().await.leave_session(conn);
    if let Ok(outcome) = result {
        info!(
            "Connection {} disconnected, removed participant {} from session {}",
            conn, outcome.participant_id, outcome.session_id
        );
        if let Some(session) = outcome.session {
            broadcast(
                state,
                &outcome.session_id,
                ServerMessage::ParticipantLeft {
                    participant_id: outcome.participant_id,
                    session_id: outcome.session_id.clone(),
                },
                None,
            )
            .await;
            broadcast(
                state,
                &outcome.session_id,
                ServerMessage::SessionUpdated { session },
                None,
            )
            .await;
        }
    }
}

async fn error_reply(state: &Arc<ServerState>, conn: ConnectionId, error: RegistryError) {
    send_to(
        state,
        conn,
        ServerMessage::SessionError {
            message: error.to_string(),
            code: error.code(),
        },
    )
    .await;
}

/// Pushes a snapshot to everyone in the session, origin included.
async fn broadcast_update(state: &Arc<ServerState>, session: shared::Session) {
    let session_id = session.id.clone();
    broadcast(
        state,
        &session_id,
        ServerMessage::SessionUpdated { session },
        None,
    )
    .await;
}

async fn send_to(state: &Arc<ServerState>, conn: ConnectionId, message: ServerMessage) {
    let text = match serde_json::to_string(&ServerEnvelope::new(message)) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to encode server message: {}", e);
            return;
        }
    };
    if let Some(tx) = state.peers.read().await.get(&conn) {
        if tx.send(Message::Text(text)).is_err() {
            debug!("Dropping message for closed connection {}", conn);
        }
    }
}

/// Fans a message out to every connection bound to `session_id`, minus
/// `exclude`. Sends to dead peers are dropped; their reader loop will clean
/// them up.
async fn broadcast(
    state: &Arc<ServerState>,
    session_id: &str,
    message: ServerMessage,
    exclude: Option<ConnectionId>,
) {
    let conns = state
        .registry
        .read()
        .await
        .session_connections(session_id);
    let text = match serde_json::to_string(&ServerEnvelope::new(message)) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to encode broadcast: {}", e);
            return;
        }
    };
    let peers = state.peers.read().await;
    for conn in conns {
        if Some(conn) == exclude {
            continue;
        }
        if let Some(tx) = peers.get(&conn) {
            if tx.send(Message::Text(text.clone())).is_err() {
                debug!("Dropping broadcast for closed connection {}", conn);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::ServerMessageKind;

    fn test_state(auto_reveal: bool) -> Arc<ServerState> {
        Arc::new(ServerState::new(auto_reveal))
    }

    async fn register_peer(
        state: &Arc<ServerState>,
        conn: ConnectionId,
    ) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        state.peers.write().await.insert(conn, tx);
        rx
    }

    fn next_envelope(rx: &mut mpsc::UnboundedReceiver<Message>) -> ServerEnvelope {
        match rx.try_recv().expect("expected a queued message") {
            Message::Text(text) => serde_json::from_str(&text).expect("valid server envelope"),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    fn envelope(message: ClientMessage) -> String {
        serde_json::to_string(&ClientEnvelope::new(message)).unwrap()
    }

    async fn create_session(
        state: &Arc<ServerState>,
        conn: ConnectionId,
        rx: &mut mpsc::UnboundedReceiver<Message>,
    ) -> (String, String) {
        dispatch(
            state,
            conn,
            &envelope(ClientMessage::SessionCreate {
                session_name: "Sprint".to_string(),
                participant_name: "Ada".to_string(),
            }),
        )
        .await;
        match next_envelope(rx).message {
            ServerMessage::SessionCreated {
                session, join_code, ..
            } => (session.id, join_code),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    async fn join_session(
        state: &Arc<ServerState>,
        conn: ConnectionId,
        join_code: &str,
        rx: &mut mpsc::UnboundedReceiver<Message>,
    ) -> String {
        dispatch(
            state,
            conn,
            &envelope(ClientMessage::SessionJoin {
                join_code: join_code.to_string(),
                participant_name: "Brian".to_string(),
                as_observer: false,
            }),
        )
        .await;
        match next_envelope(rx).message {
            ServerMessage::SessionJoined { participant, .. } => participant.id,
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_session_replies_to_origin() {
        let state = test_state(false);
        let mut rx = register_peer(&state, 1).await;

        let (session_id, join_code) = create_session(&state, 1, &mut rx).await;
        assert!(!session_id.is_empty());
        assert_eq!(join_code.chars().count(), shared::JOIN_CODE_LENGTH);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_invalid_message() {
        let state = test_state(false);
        let mut rx = register_peer(&state, 1).await;

        dispatch(&state, 1, "this is not json").await;
        match next_envelope(&mut rx).message {
            ServerMessage::SessionError { code, .. } => {
                assert_eq!(code, ErrorCode::InvalidMessage);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_type_gets_invalid_message() {
        let state = test_state(false);
        let mut rx = register_peer(&state, 1).await;

        dispatch(
            &state,
            1,
            r#"{ "type": "session:nuke", "payload": {}, "timestamp": 1 }"#,
        )
        .await;
        match next_envelope(&mut rx).message {
            ServerMessage::SessionError { code, .. } => {
                assert_eq!(code, ErrorCode::InvalidMessage);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_join_notifies_existing_members() {
        let state = test_state(false);
        let mut host_rx = register_peer(&state, 1).await;
        let mut guest_rx = register_peer(&state, 2).await;

        let (session_id, join_code) = create_session(&state, 1, &mut host_rx).await;
        join_session(&state, 2, &join_code, &mut guest_rx).await;

        // Host sees the arrival then the fresh snapshot
        assert_eq!(
            next_envelope(&mut host_rx).message.kind(),
            ServerMessageKind::ParticipantJoined
        );
        match next_envelope(&mut host_rx).message {
            ServerMessage::SessionUpdated { session } => {
                assert_eq!(session.id, session_id);
                assert_eq!(session.participants.len(), 2);
            }
            other => panic!("unexpected message: {:?}", other),
        }
        // Guest gets the snapshot but not its own participant:joined
        assert_eq!(
            next_envelope(&mut guest_rx).message.kind(),
            ServerMessageKind::SessionUpdated
        );
        assert!(guest_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_join_with_bad_code_fails() {
        let state = test_state(false);
        let mut rx = register_peer(&state, 1).await;

        dispatch(
            &state,
            1,
            &envelope(ClientMessage::SessionJoin {
                join_code: "ZZZZZZ".to_string(),
                participant_name: "Brian".to_string(),
                as_observer: false,
            }),
        )
        .await;
        match next_envelope(&mut rx).message {
            ServerMessage::SessionError { code, .. } => {
                assert_eq!(code, ErrorCode::SessionNotFound);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_vote_value_hidden_until_reveal() {
        let state = test_state(false);
        let mut host_rx = register_peer(&state, 1).await;
        let mut guest_rx = register_peer(&state, 2).await;

        let (session_id, join_code) = create_session(&state, 1, &mut host_rx).await;
        join_session(&state, 2, &join_code, &mut guest_rx).await;
        while host_rx.try_recv().is_ok() {}
        while guest_rx.try_recv().is_ok() {}

        dispatch(
            &state,
            1,
            &envelope(ClientMessage::VotingStart {
                session_id: session_id.clone(),
                story: "Checkout flow".to_string(),
                description: None,
            }),
        )
        .await;
        while host_rx.try_recv().is_ok() {}
        while guest_rx.try_recv().is_ok() {}

        dispatch(
            &state,
            2,
            &envelope(ClientMessage::VoteSelect {
                session_id: session_id.clone(),
                value: "8".to_string(),
            }),
        )
        .await;

        match next_envelope(&mut host_rx).message {
            ServerMessage::ParticipantVoted { value, .. } => assert_eq!(value, None),
            other => panic!("unexpected message: {:?}", other),
        }
        match next_envelope(&mut host_rx).message {
            ServerMessage::SessionUpdated { session } => {
                assert!(!session.cards_revealed);
            }
            other => panic!("unexpected message: {:?}", other),
        }
        // The voter only gets the snapshot
        assert_eq!(
            next_envelope(&mut guest_rx).message.kind(),
            ServerMessageKind::SessionUpdated
        );
        assert!(guest_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_auto_reveal_exposes_value_to_peers() {
        let state = test_state(true);
        let mut host_rx = register_peer(&state, 1).await;

        let (session_id, _) = create_session(&state, 1, &mut host_rx).await;
        dispatch(
            &state,
            1,
            &envelope(ClientMessage::VotingStart {
                session_id: session_id.clone(),
                story: "Checkout flow".to_string(),
                description: None,
            }),
        )
        .await;
        while host_rx.try_recv().is_ok() {}

        // Sole voter completes the round; snapshot arrives revealed
        dispatch(
            &state,
            1,
            &envelope(ClientMessage::VoteSelect {
                session_id,
                value: "5".to_string(),
            }),
        )
        .await;
        match next_envelope(&mut host_rx).message {
            ServerMessage::SessionUpdated { session } => {
                assert!(session.cards_revealed);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_host_reveal_rejected() {
        let state = test_state(false);
        let mut host_rx = register_peer(&state, 1).await;
        let mut guest_rx = register_peer(&state, 2).await;

        let (session_id, join_code) = create_session(&state, 1, &mut host_rx).await;
        join_session(&state, 2, &join_code, &mut guest_rx).await;
        while host_rx.try_recv().is_ok() {}
        while guest_rx.try_recv().is_ok() {}

        dispatch(
            &state,
            2,
            &envelope(ClientMessage::VoteReveal { session_id }),
        )
        .await;
        match next_envelope(&mut guest_rx).message {
            ServerMessage::SessionError { code, .. } => {
                assert_eq!(code, ErrorCode::NotAuthorized);
            }
            other => panic!("unexpected message: {:?}", other),
        }
        // Nothing leaks to the host
        assert!(host_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_explicit_leave_acknowledged_and_broadcast() {
        let state = test_state(false);
        let mut host_rx = register_peer(&state, 1).await;
        let mut guest_rx = register_peer(&state, 2).await;

        let (session_id, join_code) = create_session(&state, 1, &mut host_rx).await;
        let guest_id = join_session(&state, 2, &join_code, &mut guest_rx).await;
        while host_rx.try_recv().is_ok() {}
        while guest_rx.try_recv().is_ok() {}

        dispatch(
            &state,
            2,
            &envelope(ClientMessage::SessionLeave {
                session_id: session_id.clone(),
            }),
        )
        .await;
        match next_envelope(&mut guest_rx).message {
            ServerMessage::SessionLeft { success } => assert!(success),
            other => panic!("unexpected message: {:?}", other),
        }
        match next_envelope(&mut host_rx).message {
            ServerMessage::ParticipantLeft { participant_id, .. } => {
                assert_eq!(participant_id, guest_id);
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert_eq!(
            next_envelope(&mut host_rx).message.kind(),
            ServerMessageKind::SessionUpdated
        );
    }

    #[tokio::test]
    async fn test_disconnect_transfers_host() {
        let state = test_state(false);
        let mut host_rx = register_peer(&state, 1).await;
        let mut guest_rx = register_peer(&state, 2).await;

        let (_, join_code) = create_session(&state, 1, &mut host_rx).await;
        let guest_id = join_session(&state, 2, &join_code, &mut guest_rx).await;
        while guest_rx.try_recv().is_ok() {}

        handle_disconnect(&state, 1).await;
        assert_eq!(
            next_envelope(&mut guest_rx).message.kind(),
            ServerMessageKind::ParticipantLeft
        );
        match next_envelope(&mut guest_rx).message {
            ServerMessage::SessionUpdated { session } => {
                assert_eq!(session.host_id, guest_id);
                assert_eq!(session.participants.len(), 1);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_without_session_is_silent() {
        let state = test_state(false);
        let mut rx = register_peer(&state, 7).await;
        handle_disconnect(&state, 7).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let state = test_state(false);
        let mut rx = register_peer(&state, 1).await;

        dispatch(&state, 1, &envelope(ClientMessage::Ping {})).await;
        assert_eq!(next_envelope(&mut rx).message, ServerMessage::Pong {});
    }

    #[tokio::test]
    async fn test_story_queue_exhaustion_reports_error() {
        let state = test_state(false);
        let mut rx = register_peer(&state, 1).await;

        let (session_id, _) = create_session(&state, 1, &mut rx).await;
        dispatch(
            &state,
            1,
            &envelope(ClientMessage::StoryNext { session_id }),
        )
        .await;
        match next_envelope(&mut rx).message {
            ServerMessage::SessionError { code, .. } => {
                assert_eq!(code, ErrorCode::NotAuthorized);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}

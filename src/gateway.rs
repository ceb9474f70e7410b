//! Realtime channel: one WebSocket per widget, events in and out as
//! `{"event", "data"}` frames.
//!
//! The receive loop only validates, persists and enqueues. Replies produced
//! by the worker come back through the [`ConnectionRegistry`] by socket id.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::error::{GatewayError, SocketError};
use crate::events::{InboundEvent, MessagePayload};
use crate::realtime::Outbound;
use crate::types::{
    ErrorNotice, EventEnvelopeIn, JobData, LeadPage, MessageEvent, NewJob, Pagination,
    ProcessMessageJob, ServerEvent, SocketResponse,
};

pub const GENERIC_FAILURE_NOTICE: &str = "I apologize, but I'm experiencing a technical \
     difficulty processing your request. Please try again or contact support if the issue \
     persists.";

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<String>,
}

/// One live connection as seen by event handlers.
#[derive(Debug, Clone)]
pub struct Connection {
    pub socket_id: String,
    pub session_id: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let session_id = params
        .session_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, session_id: Option<String>) {
    let conn = Connection {
        socket_id: Uuid::new_v4().to_string(),
        session_id,
    };
    let mut rx = state.registry.register(&conn.socket_id).await;
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Frame(frame) => {
                    if ws_sender.send(WsMessage::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = ws_sender.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
    });

    let connections = state.registry.len().await;
    info!(
        socket_id = %conn.socket_id,
        session_id = ?conn.session_id,
        connections,
        "socket connected"
    );
    send_history(&state, &conn).await;

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            WsMessage::Text(text) => text.to_string(),
            WsMessage::Close(_) => break,
            _ => continue,
        };

        let envelope = match serde_json::from_str::<EventEnvelopeIn>(&text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(socket_id = %conn.socket_id, error = %err, "invalid socket frame");
                continue;
            }
        };

        if !handle_frame(&state, &conn, &envelope).await {
            break;
        }
    }

    state.registry.unregister(&conn.socket_id).await;
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    info!(socket_id = %conn.socket_id, "socket disconnected");
}

/// Replay the latest turns of the session, oldest first.
async fn send_history(state: &AppState, conn: &Connection) {
    let Some(session_id) = conn.session_id.as_deref() else {
        return;
    };
    match state.messages.recent(session_id, state.history_limit).await {
        Ok(message_history) => {
            state
                .registry
                .emit(&conn.socket_id, &ServerEvent::Initialize { message_history })
                .await;
        }
        Err(err) => error!(session_id, error = %err, "failed to load message history"),
    }
}

/// Validate and run one inbound event. Returns `false` when the connection
/// must be closed.
pub async fn handle_frame(state: &AppState, conn: &Connection, envelope: &EventEnvelopeIn) -> bool {
    let result = match InboundEvent::parse(envelope) {
        Ok(Some(event)) => dispatch(state, conn, event).await,
        Ok(None) => {
            debug!(socket_id = %conn.socket_id, event = %envelope.event, "unhandled socket event");
            return true;
        }
        Err(err) => Err(GatewayError::Socket(err)),
    };

    match result {
        Ok(()) => true,
        Err(err) => report_failure(state, conn, err).await,
    }
}

/// Send the error frame for a failed event and queue a close when the error
/// asks for it. Returns `false` when the connection must be closed.
async fn report_failure(state: &AppState, conn: &Connection, err: GatewayError) -> bool {
    let (notice, disconnect) = error_notice(err, conn.session_id.as_deref());
    state
        .registry
        .emit(&conn.socket_id, &ServerEvent::Error(notice))
        .await;
    if disconnect {
        state.registry.close(&conn.socket_id).await;
        return false;
    }
    true
}

async fn dispatch(
    state: &AppState,
    conn: &Connection,
    event: InboundEvent,
) -> Result<(), GatewayError> {
    debug!(socket_id = %conn.socket_id, event = event.name(), "socket event");
    match event {
        InboundEvent::Message(payload) => handle_message(state, conn, payload).await,
        InboundEvent::FetchMessages { session_id } => {
            fetch_messages(state, conn, &session_id).await
        }
        InboundEvent::FetchLeads { page } => fetch_leads(state, conn, page).await,
    }
}

/// Convert a handler failure into the frame sent back, plus whether to disconnect.
pub fn error_notice(err: GatewayError, session_id: Option<&str>) -> (ErrorNotice, bool) {
    match err {
        GatewayError::Socket(err) => {
            warn!(session_id, error = %err, "socket event rejected");
            let mut notice = ErrorNotice::new(err.message, session_id);
            notice.data = err.data;
            notice.restart = err.restart;
            notice.disconnected = err.disconnect;
            (notice, err.disconnect)
        }
        GatewayError::Internal(err) => {
            error!(session_id, error = %err, "socket event failed");
            (ErrorNotice::new(GENERIC_FAILURE_NOTICE, session_id), false)
        }
    }
}

async fn handle_message(
    state: &AppState,
    conn: &Connection,
    payload: MessagePayload,
) -> Result<(), GatewayError> {
    let session_id = conn
        .session_id
        .as_deref()
        .ok_or_else(|| SocketError::new("An unexpected error occurred").with_restart())?;

    if let Err(err) = state
        .messages
        .append(session_id, &payload.content, MessageEvent::UserPrompt)
        .await
    {
        error!(session_id, error = %err, "failed to store user message");
        return Err(SocketError::new("Failed to create message").into());
    }

    let job = NewJob::new(JobData::ProcessMessage(ProcessMessageJob {
        message: payload.content,
        socket_id: conn.socket_id.clone(),
        session_id: session_id.to_string(),
        resumed_session: payload.resumed_session,
    }));
    if !state.queue.enqueue(job).await {
        warn!(session_id, "user message stored but not queued for processing");
    }
    Ok(())
}

async fn fetch_messages(
    state: &AppState,
    conn: &Connection,
    session_id: &str,
) -> Result<(), GatewayError> {
    let messages = state.messages.history_newest_first(session_id).await?;
    state
        .registry
        .emit(
            &conn.socket_id,
            &ServerEvent::FetchedMessages(SocketResponse {
                message: "Messages fetched successfully".to_string(),
                event: "fetched_messages".to_string(),
                data: messages,
            }),
        )
        .await;
    Ok(())
}

async fn fetch_leads(state: &AppState, conn: &Connection, page: i64) -> Result<(), GatewayError> {
    let (leads, total) = state.leads.page(page, state.leads_page_size).await?;
    state
        .registry
        .emit(
            &conn.socket_id,
            &ServerEvent::FetchedLeads(SocketResponse {
                message: "Leads fetched successfully".to_string(),
                event: "fetched_leads".to_string(),
                data: LeadPage {
                    data: leads,
                    pagination: Pagination::new(page, state.leads_page_size, total),
                },
            }),
        )
        .await;
    Ok(())
}

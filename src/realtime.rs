//! Connection registry and result routing by socket id.
//!
//! The worker never holds a connection. It hands each event to a
//! [`Notifier`], which either writes straight into the local registry (single
//! process) or publishes on the `socket_events` Postgres channel, where the
//! gateway's relay picks it up and delivers it to whichever connection owns
//! the socket id.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgListener, PgPool};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::types::ServerEvent;

pub const SOCKET_EVENTS_CHANNEL: &str = "socket_events";

/// Frames queued for one connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(String),
    Close,
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    clients: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Outbound>>>>,
}

impl ConnectionRegistry {
    pub async fn register(&self, socket_id: &str) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.clients.lock().await.insert(socket_id.to_string(), tx);
        rx
    }

    pub async fn unregister(&self, socket_id: &str) {
        self.clients.lock().await.remove(socket_id);
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Queue a frame for `socket_id`. Returns `false` when no such connection
    /// lives in this process.
    pub async fn send_frame(&self, socket_id: &str, frame: String) -> bool {
        let tx = {
            let clients = self.clients.lock().await;
            clients.get(socket_id).cloned()
        };
        match tx {
            Some(sender) => sender.send(Outbound::Frame(frame)).is_ok(),
            None => false,
        }
    }

    pub async fn emit(&self, socket_id: &str, event: &ServerEvent) -> bool {
        match event.to_frame() {
            Ok(frame) => self.send_frame(socket_id, frame).await,
            Err(err) => {
                warn!(socket_id, event = event.name(), error = %err, "failed to encode event");
                false
            }
        }
    }

    /// Ask the connection's writer to close after flushing what is queued.
    pub async fn close(&self, socket_id: &str) {
        let tx = {
            let clients = self.clients.lock().await;
            clients.get(socket_id).cloned()
        };
        if let Some(sender) = tx {
            let _ = sender.send(Outbound::Close);
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, socket_id: &str, event: ServerEvent) -> Result<(), AppError>;
}

#[async_trait]
impl Notifier for ConnectionRegistry {
    async fn notify(&self, socket_id: &str, event: ServerEvent) -> Result<(), AppError> {
        if !self.emit(socket_id, &event).await {
            debug!(socket_id, event = event.name(), "socket not connected, event dropped");
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoutedEvent {
    socket_id: String,
    frame: ServerEvent,
}

/// Publishes events through Postgres for a gateway in another process.
#[derive(Clone)]
pub struct PgNotifier {
    pool: PgPool,
}

impl PgNotifier {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Notifier for PgNotifier {
    async fn notify(&self, socket_id: &str, event: ServerEvent) -> Result<(), AppError> {
        let payload = serde_json::to_string(&RoutedEvent {
            socket_id: socket_id.to_string(),
            frame: event,
        })?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(SOCKET_EVENTS_CHANNEL)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(|err| AppError::Notify(err.to_string()))?;
        Ok(())
    }
}

/// Forward `socket_events` notifications to local connections until cancelled.
pub async fn relay_notifications(
    pool: PgPool,
    registry: ConnectionRegistry,
    cancel: CancellationToken,
) -> Result<(), AppError> {
    let mut listener = PgListener::connect_with(&pool).await?;
    listener.listen(SOCKET_EVENTS_CHANNEL).await?;
    info!(channel = SOCKET_EVENTS_CHANNEL, "notification relay listening");

    loop {
        let notification = tokio::select! {
            _ = cancel.cancelled() => break,
            received = listener.recv() => received?,
        };
        deliver_routed(&registry, notification.payload()).await;
    }

    info!("notification relay stopped");
    Ok(())
}

async fn deliver_routed(registry: &ConnectionRegistry, payload: &str) {
    match serde_json::from_str::<RoutedEvent>(payload) {
        Ok(routed) => {
            if !registry.emit(&routed.socket_id, &routed.frame).await {
                debug!(socket_id = %routed.socket_id, "relayed event for a socket not on this gateway");
            }
        }
        Err(err) => warn!(error = %err, "discarding malformed socket notification"),
    }
}

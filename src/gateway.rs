use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::chat::Message;
use crate::principal::PrincipalResolver;
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::store::Store;

/// Events the client may send over the socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Bind this connection to the principal the bearer token resolves to.
    Authenticate { token: String },
    JoinChat { chat_id: String },
    LeaveChat { chat_id: String },
}

/// Events the server pushes to connections.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Authenticated { principal_id: String },
    Joined { chat_id: String },
    Left { chat_id: String },
    NewMessage { chat_id: String, message: Message },
    Error { message: String },
}

/// Room-scoped fan-out of chat events to live connections.
///
/// Owns the connection registry; room joins are admitted only after the
/// store confirms the bound principal participates in the chat. Delivery is
/// best effort to whoever is connected right now; anyone offline catches up
/// through the REST fetch on reconnect.
#[derive(Clone)]
pub struct RealtimeGateway {
    registry: ConnectionRegistry,
    store: Store,
    resolver: PrincipalResolver,
}

impl RealtimeGateway {
    pub fn new(registry: ConnectionRegistry, store: Store, resolver: PrincipalResolver) -> Self {
        Self {
            registry,
            store,
            resolver,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Drive one socket connection until it closes: register it, forward
    /// queued outbound events, dispatch inbound events, and purge the
    /// registry on the way out.
    pub async fn handle_socket(&self, ws: WebSocket) {
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let conn = self.registry.register(tx);
        debug!(connection = %conn, "socket connected");

        let send_task = tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                if ws_tx.send(WsMessage::Text(payload)).await.is_err() {
                    break;
                }
            }
        });

        while let Some(frame) = ws_rx.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => self.handle_event(conn, &text).await,
                Ok(WsMessage::Close(_)) | Err(_) => break,
                _ => {}
            }
        }

        self.registry.remove(conn);
        send_task.abort();
        debug!(connection = %conn, "socket disconnected");
    }

    async fn handle_event(&self, conn: ConnectionId, text: &str) {
        let event = match serde_json::from_str::<ClientEvent>(text) {
            Ok(event) => event,
            Err(e) => {
                // Malformed frames get an error reply but keep the channel
                // open so the client can retry.
                self.reply(
                    conn,
                    &ServerEvent::Error {
                        message: format!("invalid event: {e}"),
                    },
                );
                return;
            }
        };

        match event {
            ClientEvent::Authenticate { token } => match self.resolver.resolve(Some(&token)).await
            {
                Ok(principal) => {
                    self.registry.authenticate(conn, &principal.id);
                    debug!(connection = %conn, principal = %principal.id, "socket authenticated");
                    self.reply(
                        conn,
                        &ServerEvent::Authenticated {
                            principal_id: principal.id,
                        },
                    );
                }
                Err(e) => {
                    self.reply(
                        conn,
                        &ServerEvent::Error {
                            message: e.to_string(),
                        },
                    );
                }
            },

            ClientEvent::JoinChat { chat_id } => {
                // Unauthenticated or non-participant joins no-op quietly;
                // answering would leak which chat ids exist.
                let Some(principal_id) = self.registry.principal_of(conn) else {
                    debug!(connection = %conn, chat_id, "join before authenticate ignored");
                    return;
                };
                match self.store.is_participant(&chat_id, &principal_id).await {
                    Ok(true) => {
                        self.registry.join_room(conn, &chat_id);
                        self.reply(conn, &ServerEvent::Joined { chat_id });
                    }
                    Ok(false) => {
                        debug!(connection = %conn, principal = %principal_id, chat_id,
                            "join refused, not a participant");
                    }
                    Err(e) => {
                        warn!(error = %e, chat_id, "participant check failed");
                    }
                }
            }

            ClientEvent::LeaveChat { chat_id } => {
                if self.registry.principal_of(conn).is_none() {
                    return;
                }
                self.registry.leave_room(conn, &chat_id);
                self.reply(conn, &ServerEvent::Left { chat_id });
            }
        }
    }

    /// Push a freshly appended message to every connection in the chat's
    /// room, the sender's other tabs included. Failures are logged and
    /// swallowed; persistence already succeeded.
    pub fn broadcast_new_message(&self, chat_id: &str, message: &Message) {
        let event = ServerEvent::NewMessage {
            chat_id: chat_id.to_string(),
            message: message.clone(),
        };
        match serde_json::to_string(&event) {
            Ok(payload) => {
                let delivered = self.registry.send_to_room(chat_id, &payload);
                debug!(chat_id, delivered, "broadcast new_message");
            }
            Err(e) => warn!(error = %e, chat_id, "failed to encode new_message event"),
        }
    }

    fn reply(&self, conn: ConnectionId, event: &ServerEvent) {
        match serde_json::to_string(event) {
            Ok(payload) => self.registry.send_to_connection(conn, &payload),
            Err(e) => warn!(error = %e, "failed to encode server event"),
        }
    }
}

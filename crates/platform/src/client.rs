//! WebSocket client for the platform's realtime endpoint.
//!
//! [`RealtimeClient`] holds the endpoint configuration. Each call to
//! [`open_channel`](RealtimeClient::open_channel) opens a fresh socket and
//! joins one channel on it, returning once the server accepted the join.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::messages::{classify, parse_frame, ChannelSpec, Inbound, PhoenixMessage};

pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Message reference generator, one per socket.
#[derive(Debug, Default)]
pub struct Refs(AtomicU64);

impl Refs {
    pub fn next(&self) -> String {
        (self.0.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }
}

/// A socket with one joined channel.
pub struct RealtimeConnection {
    pub topic: String,
    pub refs: Refs,
    pub ws_stream: WsStream,
}

impl RealtimeConnection {
    pub async fn send(&mut self, message: PhoenixMessage) -> Result<(), RealtimeClientError> {
        self.ws_stream
            .send(Message::Text(message.to_text()))
            .await
            .map_err(|e| RealtimeClientError::Protocol(e.to_string()))
    }

    /// Leave the channel and close the socket. Errors are ignored; the
    /// server drops the channel with the socket anyway.
    pub async fn leave(mut self) {
        let leave = PhoenixMessage::leave(&self.topic, self.refs.next());
        let _ = self.send(leave).await;
        let _ = self.ws_stream.close(None).await;
    }
}

pub struct RealtimeClient {
    ws_url: String,
    join_timeout: Duration,
}

impl RealtimeClient {
    /// * `ws_url`       - full WebSocket URL including `apikey` and `vsn`.
    /// * `join_timeout` - how long to wait for the join reply.
    pub fn new(ws_url: String, join_timeout: Duration) -> Self {
        Self {
            ws_url,
            join_timeout,
        }
    }

    /// Connect and join `spec`'s channel.
    pub async fn open_channel(
        &self,
        spec: &ChannelSpec,
    ) -> Result<RealtimeConnection, RealtimeClientError> {
        let (ws_stream, _response) = connect_async(&self.ws_url)
            .await
            .map_err(|e| RealtimeClientError::Connection(e.to_string()))?;

        let mut conn = RealtimeConnection {
            topic: spec.topic.clone(),
            refs: Refs::default(),
            ws_stream,
        };

        let join_ref = conn.refs.next();
        conn.send(spec.join(join_ref.clone())).await?;

        match tokio::time::timeout(self.join_timeout, await_reply(&mut conn, &join_ref)).await {
            Ok(Ok(())) => {
                tracing::info!(topic = %spec.topic, "Joined realtime channel");
                Ok(conn)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RealtimeClientError::JoinTimeout(self.join_timeout)),
        }
    }
}

async fn await_reply(
    conn: &mut RealtimeConnection,
    join_ref: &str,
) -> Result<(), RealtimeClientError> {
    while let Some(frame) = conn.ws_stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => return Err(RealtimeClientError::Protocol(e.to_string())),
        };
        let Ok(message) = parse_frame(&text) else {
            tracing::warn!(raw_message = %text, "Failed to parse realtime frame");
            continue;
        };
        match classify(&message, &conn.topic) {
            Inbound::Reply {
                reference,
                ok,
                response,
            } if reference.as_deref() == Some(join_ref) => {
                return if ok {
                    Ok(())
                } else {
                    Err(RealtimeClientError::JoinRejected(response.to_string()))
                };
            }
            Inbound::ChannelError(reason) => return Err(RealtimeClientError::JoinRejected(reason)),
            _ => {}
        }
    }
    Err(RealtimeClientError::Protocol(
        "socket closed before the join was acknowledged".into(),
    ))
}

#[derive(Debug, thiserror::Error)]
pub enum RealtimeClientError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Channel join rejected: {0}")]
    JoinRejected(String),

    #[error("No join reply within {0:?}")]
    JoinTimeout(Duration),
}

impl From<RealtimeClientError> for eryxon_realtime::RealtimeError {
    fn from(err: RealtimeClientError) -> Self {
        Self::Transport(err.to_string())
    }
}

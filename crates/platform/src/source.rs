//! [`ChangeEventSource`] over the platform's realtime channels.
//!
//! Each subscription owns one socket and one channel task. The task
//! forwards row changes, sends heartbeats, and when the socket drops it
//! reports a channel error, rejoins with backoff and reports recovery.
//! Unsubscribing cancels the task, which leaves the channel before
//! closing the socket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eryxon_realtime::ports::{
    ChangeEventSource, SourceEvent, SourceSubscription, SubscribeRequest, SubscriptionHandle,
};
use eryxon_realtime::RealtimeError;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::client::{RealtimeClient, RealtimeConnection};
use crate::config::PlatformConfig;
use crate::messages::{classify, parse_frame, ChannelSpec, Inbound, PhoenixMessage};
use crate::reconnect::{reconnect_loop, ReconnectConfig};

/// Buffered events per subscription before the channel task waits.
const EVENT_BUFFER: usize = 256;

pub struct RealtimeSource {
    client: Arc<RealtimeClient>,
    access_token: String,
    heartbeat_interval: Duration,
    reconnect: ReconnectConfig,
    close_timeout: Duration,
    channel_ids: AtomicU64,
    /// Parent of every channel task's token.
    cancel: CancellationToken,
}

impl RealtimeSource {
    pub fn new(config: &PlatformConfig) -> Self {
        Self {
            client: Arc::new(RealtimeClient::new(
                config.websocket_url(),
                config.request_timeout,
            )),
            access_token: config.bearer_token().to_string(),
            heartbeat_interval: config.heartbeat_interval,
            reconnect: ReconnectConfig::default(),
            close_timeout: Duration::from_secs(5),
            channel_ids: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Cancel every channel task. Subscriptions still held end with their
    /// streams closed.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl ChangeEventSource for RealtimeSource {
    async fn subscribe(
        &self,
        request: SubscribeRequest,
    ) -> Result<SourceSubscription, RealtimeError> {
        let channel_id = self.channel_ids.fetch_add(1, Ordering::Relaxed) + 1;
        let spec = ChannelSpec::for_request(&request, channel_id, &self.access_token);

        let conn = self.client.open_channel(&spec).await?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = self.cancel.child_token();
        let task = tokio::spawn(run_channel(
            ChannelTask {
                client: Arc::clone(&self.client),
                spec,
                heartbeat_interval: self.heartbeat_interval,
                reconnect: self.reconnect.clone(),
                tx,
                cancel: cancel.clone(),
            },
            conn,
        ));

        Ok(SourceSubscription {
            events: rx,
            handle: Box::new(ChannelHandle {
                cancel,
                task,
                close_timeout: self.close_timeout,
            }),
        })
    }
}

struct ChannelHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    close_timeout: Duration,
}

#[async_trait]
impl SubscriptionHandle for ChannelHandle {
    async fn unsubscribe(self: Box<Self>) {
        let ChannelHandle {
            cancel,
            mut task,
            close_timeout,
        } = *self;
        cancel.cancel();
        if tokio::time::timeout(close_timeout, &mut task).await.is_err() {
            tracing::warn!("Realtime channel task did not exit in time, aborting");
            task.abort();
        }
    }
}

struct ChannelTask {
    client: Arc<RealtimeClient>,
    spec: ChannelSpec,
    heartbeat_interval: Duration,
    reconnect: ReconnectConfig,
    tx: mpsc::Sender<SourceEvent>,
    cancel: CancellationToken,
}

/// Why [`pump`] returned.
enum Exit {
    Cancelled,
    /// The subscriber dropped its receiver.
    Abandoned,
    Lost(String),
}

/// Channel loop: pump -> report loss -> rejoin -> report recovery.
async fn run_channel(task: ChannelTask, mut conn: RealtimeConnection) {
    loop {
        match pump(&task, &mut conn).await {
            Exit::Cancelled => {
                conn.leave().await;
                tracing::info!(topic = %task.spec.topic, "Left realtime channel");
                return;
            }
            Exit::Abandoned => {
                conn.leave().await;
                return;
            }
            Exit::Lost(reason) => {
                tracing::warn!(topic = %task.spec.topic, reason = %reason, "Realtime channel lost");
                if task.tx.send(SourceEvent::ChannelError(reason)).await.is_err() {
                    return;
                }
            }
        }

        conn = match reconnect_loop(&task.client, &task.spec, &task.reconnect, &task.cancel).await {
            Some(conn) => conn,
            None => return,
        };
        if task.tx.send(SourceEvent::ChannelRecovered).await.is_err() {
            conn.leave().await;
            return;
        }
    }
}

/// Forward frames from one socket until it fails or the task ends.
async fn pump(task: &ChannelTask, conn: &mut RealtimeConnection) -> Exit {
    let start = tokio::time::Instant::now() + task.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(start, task.heartbeat_interval);
    let mut pending_heartbeat: Option<String> = None;

    loop {
        tokio::select! {
            biased;

            _ = task.cancel.cancelled() => return Exit::Cancelled,

            _ = task.tx.closed() => return Exit::Abandoned,

            _ = heartbeat.tick() => {
                if pending_heartbeat.is_some() {
                    return Exit::Lost("heartbeat timed out".into());
                }
                let reference = conn.refs.next();
                if let Err(e) = conn.send(PhoenixMessage::heartbeat(reference.clone())).await {
                    return Exit::Lost(e.to_string());
                }
                pending_heartbeat = Some(reference);
            }

            frame = conn.ws_stream.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(topic = %task.spec.topic, ?frame, "Realtime socket closed");
                        return Exit::Lost("socket closed".into());
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Exit::Lost(e.to_string()),
                    None => return Exit::Lost("socket closed".into()),
                };

                let message = match parse_frame(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!(error = %e, raw_message = %text, "Failed to parse realtime frame");
                        continue;
                    }
                };

                match classify(&message, &task.spec.topic) {
                    Inbound::Change(change) => {
                        tracing::trace!(topic = %task.spec.topic, entity = ?change.entity_type, "Row change");
                        if task.tx.send(SourceEvent::Change(change)).await.is_err() {
                            return Exit::Abandoned;
                        }
                    }
                    Inbound::Reply { reference, .. } if reference.is_some() && reference == pending_heartbeat => {
                        pending_heartbeat = None;
                    }
                    Inbound::ChannelError(reason) => return Exit::Lost(reason),
                    Inbound::Reply { .. } | Inbound::Ignored => {}
                }
            }
        }
    }
}

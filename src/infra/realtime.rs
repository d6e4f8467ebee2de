//! Websocket change-feed transport speaking the Phoenix channel protocol of
//! the hosted realtime service.
//!
//! Each table gets its own socket and channel (`realtime:public:{table}`). A
//! dropped socket is reopened with jittered exponential backoff, and every
//! transition is published on the subscription's status channel.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::lock::mutex_lock;
use crate::realtime::feed::EVENT_BUFFER;
use crate::realtime::{
    ChangeEvent, ChangeFeedTransport, ChannelStatus, FeedError, Subscription, SubscriptionHandle,
};

use super::error::InfraError;

const SOURCE: &str = "infra::realtime";
const PROTOCOL_VERSION: &str = "1.0.0";

#[derive(Debug, Clone)]
pub struct PhoenixOptions {
    /// Websocket endpoint, e.g. `wss://host/realtime/v1/websocket`.
    pub endpoint: Url,
    pub api_key: String,
    pub heartbeat: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl PhoenixOptions {
    /// Derive the websocket endpoint from the backend's REST base URL.
    pub fn endpoint_for(base_url: &Url) -> Result<Url, InfraError> {
        let mut endpoint = base_url
            .join("realtime/v1/websocket")
            .map_err(|err| InfraError::endpoint("realtime", err.to_string()))?;
        let scheme = match base_url.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => {
                return Err(InfraError::endpoint(
                    "realtime",
                    format!("unsupported backend scheme `{other}`"),
                ));
            }
        };
        endpoint
            .set_scheme(scheme)
            .map_err(|()| InfraError::endpoint("realtime", "cannot derive websocket scheme"))?;
        Ok(endpoint)
    }

    fn socket_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("apikey", &self.api_key)
            .append_pair("vsn", PROTOCOL_VERSION);
        url
    }
}

pub struct PhoenixTransport {
    options: Arc<PhoenixOptions>,
    subscribed: Arc<Mutex<HashSet<String>>>,
}

impl PhoenixTransport {
    pub fn new(options: PhoenixOptions) -> Self {
        Self {
            options: Arc::new(options),
            subscribed: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

#[async_trait]
impl ChangeFeedTransport for PhoenixTransport {
    async fn subscribe(&self, table: &str) -> Result<Subscription, FeedError> {
        if !mutex_lock(&self.subscribed, SOURCE, "subscribe").insert(table.to_string()) {
            return Err(FeedError::AlreadySubscribed(table.to_string()));
        }
        let registration = Registration {
            table: table.to_string(),
            registry: Arc::clone(&self.subscribed),
        };

        let (events_tx, events) = mpsc::channel(EVENT_BUFFER);
        let (status_tx, status) = watch::channel(ChannelStatus::Connecting);
        let channel = Channel {
            options: Arc::clone(&self.options),
            table: table.to_string(),
            topic: format!("realtime:public:{table}"),
            events: events_tx,
            status: status_tx,
        };
        let task = tokio::spawn(async move {
            let _registration = registration;
            channel.run().await;
        });

        Ok(Subscription {
            table: table.to_string(),
            events,
            status,
            handle: SubscriptionHandle::new(task.abort_handle()),
        })
    }
}

/// Frees the table name when the channel task ends or is aborted.
struct Registration {
    table: String,
    registry: Arc<Mutex<HashSet<String>>>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        mutex_lock(&self.registry, SOURCE, "release").remove(&self.table);
    }
}

#[derive(Debug, Deserialize)]
struct Frame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
}

enum SessionEnd {
    /// The server or network closed the socket.
    Dropped,
    /// The subscriber went away.
    Abandoned,
}

struct Channel {
    options: Arc<PhoenixOptions>,
    table: String,
    topic: String,
    events: mpsc::Sender<ChangeEvent>,
    status: watch::Sender<ChannelStatus>,
}

impl Channel {
    async fn run(self) {
        let mut backoff = self.options.backoff_min;
        loop {
            self.status.send_replace(ChannelStatus::Connecting);
            let mut joined = false;
            match self.session(&mut joined).await {
                Ok(SessionEnd::Abandoned) => break,
                Ok(SessionEnd::Dropped) => {
                    warn!(table = %self.table, "Realtime socket closed")
                }
                Err(err) => warn!(table = %self.table, error = %err, "Realtime session failed"),
            }
            if self.events.is_closed() {
                break;
            }
            if joined {
                backoff = self.options.backoff_min;
            }

            self.status.send_replace(ChannelStatus::Lost);
            let delay = jittered(backoff);
            debug!(
                table = %self.table,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting realtime channel"
            );
            tokio::time::sleep(delay).await;
            backoff = (backoff * 2).min(self.options.backoff_max);
        }
        self.status.send_replace(ChannelStatus::Unsubscribed);
    }

    async fn session(&self, joined: &mut bool) -> Result<SessionEnd, FeedError> {
        let url = self.options.socket_url();
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(transport)?;
        let (mut sink, mut stream) = socket.split();

        let mut next_ref = 1_u64;
        let join_ref = next_ref.to_string();
        let join = json!({
            "topic": self.topic,
            "event": "phx_join",
            "payload": {
                "config": {
                    "postgres_changes": [
                        { "event": "*", "schema": "public", "table": self.table }
                    ]
                },
                "access_token": self.options.api_key,
            },
            "ref": join_ref,
            "join_ref": join_ref,
        });
        sink.send(Message::Text(join.to_string()))
            .await
            .map_err(transport)?;

        let mut heartbeat = tokio::time::interval(self.options.heartbeat);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    next_ref += 1;
                    let beat = json!({
                        "topic": "phoenix",
                        "event": "heartbeat",
                        "payload": {},
                        "ref": next_ref.to_string(),
                    });
                    sink.send(Message::Text(beat.to_string()))
                        .await
                        .map_err(transport)?;
                }
                message = stream.next() => match message {
                    None | Some(Ok(Message::Close(_))) => return Ok(SessionEnd::Dropped),
                    Some(Err(err)) => return Err(transport(err)),
                    Some(Ok(Message::Text(text))) => {
                        let frame = match serde_json::from_str::<Frame>(&text) {
                            Ok(frame) => frame,
                            Err(err) => {
                                warn!(table = %self.table, error = %err, "Undecodable realtime frame");
                                continue;
                            }
                        };
                        if frame.topic != self.topic {
                            continue;
                        }
                        match self.handle(frame, &join_ref, joined).await? {
                            Some(end) => return Ok(end),
                            None => continue,
                        }
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    async fn handle(
        &self,
        frame: Frame,
        join_ref: &str,
        joined: &mut bool,
    ) -> Result<Option<SessionEnd>, FeedError> {
        match frame.event.as_str() {
            "phx_reply" if frame.reference.as_deref() == Some(join_ref) => {
                let status = frame.payload.get("status").and_then(Value::as_str);
                if status != Some("ok") {
                    return Err(FeedError::Transport(format!(
                        "join rejected: {}",
                        frame.payload.get("response").unwrap_or(&Value::Null)
                    )));
                }
                *joined = true;
                self.status.send_replace(ChannelStatus::Subscribed);
                info!(table = %self.table, "Realtime channel joined");
            }
            "postgres_changes" => match ChangeEvent::from_wire(&frame.payload) {
                Ok(event) => {
                    if self.events.send(event).await.is_err() {
                        return Ok(Some(SessionEnd::Abandoned));
                    }
                }
                Err(err) => warn!(table = %self.table, error = %err, "Undecodable change event"),
            },
            "phx_error" | "phx_close" => {
                warn!(table = %self.table, event = %frame.event, "Realtime channel closed by server");
                return Ok(Some(SessionEnd::Dropped));
            }
            other => debug!(table = %self.table, event = other, "Ignoring realtime frame"),
        }
        Ok(None)
    }
}

fn transport(err: impl std::fmt::Display) -> FeedError {
    FeedError::Transport(err.to_string())
}

/// `base` plus up to half of it again, seeded from the clock.
fn jittered(base: Duration) -> Duration {
    let spread = (base.as_millis() as u64 / 2).max(1);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_nanos(0))
        .subsec_nanos() as u64;
    base.saturating_add(Duration::from_millis(nanos % spread))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(endpoint: &str) -> PhoenixOptions {
        PhoenixOptions {
            endpoint: Url::parse(endpoint).expect("url"),
            api_key: "anon".into(),
            heartbeat: Duration::from_secs(30),
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }

    #[test]
    fn endpoint_follows_backend_scheme() {
        let base = Url::parse("https://project.example.co/").expect("url");
        let endpoint = PhoenixOptions::endpoint_for(&base).expect("endpoint");
        assert_eq!(endpoint.as_str(), "wss://project.example.co/realtime/v1/websocket");

        let local = Url::parse("http://127.0.0.1:54321/").expect("url");
        let endpoint = PhoenixOptions::endpoint_for(&local).expect("endpoint");
        assert_eq!(endpoint.scheme(), "ws");

        let bad = Url::parse("ftp://example.co/").expect("url");
        assert!(PhoenixOptions::endpoint_for(&bad).is_err());
    }

    #[test]
    fn socket_url_carries_key_and_version() {
        let url = options("wss://project.example.co/realtime/v1/websocket").socket_url();
        assert_eq!(
            url.query(),
            Some("apikey=anon&vsn=1.0.0"),
        );
    }

    #[test]
    fn jitter_stays_within_half_the_base() {
        let base = Duration::from_secs(4);
        for _ in 0..16 {
            let delay = jittered(base);
            assert!(delay >= base && delay < base + Duration::from_secs(2));
        }
    }

    #[test]
    fn frames_decode_with_optional_ref() {
        let frame: Frame = serde_json::from_str(
            r#"{"topic":"realtime:public:posts","event":"postgres_changes","payload":{}}"#,
        )
        .expect("frame");
        assert_eq!(frame.event, "postgres_changes");
        assert!(frame.reference.is_none());
    }

    #[tokio::test]
    async fn duplicate_subscription_is_rejected() {
        // Port 9 is discard; the channel task just keeps retrying.
        let transport = PhoenixTransport::new(options("ws://127.0.0.1:9/realtime/v1/websocket"));
        let first = transport.subscribe("posts").await.expect("first");
        let second = transport.subscribe("posts").await;
        assert!(matches!(second, Err(FeedError::AlreadySubscribed(table)) if table == "posts"));
        drop(first);
    }
}

//! Change feed over the backend's realtime websocket
//!
//! The feed joins one `postgres_changes` channel per collection and reports
//! the collection name of every change event it receives. Subscribers re-query
//! on each report, so the row payload itself is never decoded.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::error::Error;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Heartbeat and reconnect timing of the change feed
#[derive(Debug, Clone)]
pub struct RealtimeOptions {
    pub heartbeat_interval: Duration,
    pub reconnect_interval: Duration,
    pub reconnect_backoff_factor: f64,
    pub max_reconnect_interval: Duration,
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(1),
            reconnect_backoff_factor: 1.5,
            max_reconnect_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RealtimeMessage {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    message_ref: Value,
}

fn topic(table: &str) -> String {
    format!("realtime:public:{}", table)
}

pub(crate) fn websocket_url(base: &str, key: &str) -> Result<Url, Error> {
    let mut url = Url::parse(base)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(Error::realtime(format!(
                "unsupported URL scheme: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| Error::realtime(format!("cannot use {} with {}", scheme, base)))?;
    url.set_path("/realtime/v1/websocket");
    url.query_pairs_mut()
        .clear()
        .append_pair("apikey", key)
        .append_pair("vsn", "1.0.0");
    Ok(url)
}

/// A running change feed; the connection closes when this is dropped
pub(crate) struct ChangeFeed {
    task: JoinHandle<()>,
}

impl ChangeFeed {
    /// Connect, join every table and keep the connection alive in the background.
    ///
    /// The first connection attempt is awaited so that a wrong URL or key is
    /// reported to the caller. Later disconnects are retried with backoff.
    pub(crate) async fn start(
        base_url: &str,
        key: &str,
        access_token: Arc<RwLock<Option<String>>>,
        tables: Vec<String>,
        options: RealtimeOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<String>), Error> {
        let (changes, receiver) = mpsc::unbounded_channel();
        let mut connection = FeedConnection {
            url: websocket_url(base_url, key)?,
            tables,
            access_token,
            options,
            changes,
            next_ref: 0,
        };
        let socket = connection.open().await?;
        info!("Realtime change feed connected to {}", base_url);

        let task = tokio::spawn(connection.run(socket));
        Ok((Self { task }, receiver))
    }
}

impl Drop for ChangeFeed {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct FeedConnection {
    url: Url,
    tables: Vec<String>,
    access_token: Arc<RwLock<Option<String>>>,
    options: RealtimeOptions,
    changes: mpsc::UnboundedSender<String>,
    next_ref: u64,
}

impl FeedConnection {
    fn current_token(&self) -> Option<String> {
        self.access_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn message(&mut self, topic: &str, event: &str, payload: Value) -> Message {
        self.next_ref += 1;
        let message = RealtimeMessage {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            message_ref: Value::String(self.next_ref.to_string()),
        };
        // Serializing a struct of strings and JSON values cannot fail.
        Message::Text(serde_json::to_string(&message).unwrap_or_default())
    }

    fn join(&mut self, table: &str, token: Option<&str>) -> Message {
        let mut payload = json!({
            "config": {
                "postgres_changes": [
                    { "event": "*", "schema": "public", "table": table }
                ]
            }
        });
        if let Some(token) = token {
            payload["access_token"] = json!(token);
        }
        self.message(&topic(table), "phx_join", payload)
    }

    async fn open(&mut self) -> Result<Socket, Error> {
        debug!("Connecting realtime feed to {}", self.url.path());
        let (mut socket, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::realtime(format!("websocket connection failed: {}", e)))?;

        let token = self.current_token();
        for table in self.tables.clone() {
            let join = self.join(&table, token.as_deref());
            socket
                .send(join)
                .await
                .map_err(|e| Error::realtime(format!("failed to join {}: {}", table, e)))?;
        }
        Ok(socket)
    }

    /// Collection named by a change event, if the message is one
    fn changed_table(&self, text: &str) -> Option<String> {
        let message = match serde_json::from_str::<RealtimeMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring unparseable realtime message: {}", e);
                return None;
            }
        };

        match message.event.as_str() {
            "postgres_changes" | "INSERT" | "UPDATE" | "DELETE" => {
                let table = message
                    .payload
                    .pointer("/data/table")
                    .or_else(|| message.payload.get("table"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| message.topic.rsplit(':').next().map(str::to_string))?;
                if self.tables.contains(&table) {
                    Some(table)
                } else {
                    trace!("Change on unwatched table '{}'", table);
                    None
                }
            }
            "phx_reply" => {
                let status = message.payload.get("status").and_then(Value::as_str);
                if status != Some("ok") {
                    warn!("Realtime reply on '{}': {}", message.topic, message.payload);
                }
                None
            }
            "phx_error" | "phx_close" => {
                warn!("Realtime channel '{}' {}", message.topic, message.event);
                None
            }
            _ => None,
        }
    }

    /// Forward change events until the socket fails (`Err`) or nobody listens (`Ok`)
    async fn pump(&mut self, socket: &mut Socket) -> Result<(), Error> {
        let mut heartbeat = interval(self.options.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;
        let mut sent_token = self.current_token();

        loop {
            tokio::select! {
                incoming = socket.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(table) = self.changed_table(&text) {
                            debug!("Realtime change on '{}'", table);
                            if self.changes.send(table).is_err() {
                                return Ok(());
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return Err(Error::realtime(format!("closed by server: {:?}", frame)));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(Error::realtime(format!("read failed: {}", e))),
                    None => return Err(Error::realtime("stream ended")),
                },
                _ = heartbeat.tick() => {
                    let token = self.current_token();
                    if token != sent_token {
                        for table in self.tables.clone() {
                            let payload = json!({ "access_token": token });
                            let update = self.message(&topic(&table), "access_token", payload);
                            socket.send(update).await.map_err(|e| {
                                Error::realtime(format!("token update failed: {}", e))
                            })?;
                        }
                        sent_token = token;
                    }
                    let beat = self.message("phoenix", "heartbeat", json!({}));
                    socket
                        .send(beat)
                        .await
                        .map_err(|e| Error::realtime(format!("heartbeat failed: {}", e)))?;
                }
                _ = self.changes.closed() => return Ok(()),
            }
        }
    }

    async fn run(mut self, mut socket: Socket) {
        loop {
            match self.pump(&mut socket).await {
                Ok(()) => {
                    debug!("Realtime feed has no listeners left, closing");
                    return;
                }
                Err(e) => warn!("Realtime feed disconnected: {}", e),
            }

            let mut delay = self.options.reconnect_interval;
            socket = loop {
                if self.changes.is_closed() {
                    return;
                }
                sleep(delay).await;
                match self.open().await {
                    Ok(socket) => break socket,
                    Err(e) if e.is_network() => {
                        warn!("Realtime reconnect failed, retrying in {:?}: {}", delay, e);
                        delay = delay
                            .mul_f64(self.options.reconnect_backoff_factor)
                            .min(self.options.max_reconnect_interval);
                    }
                    Err(e) => {
                        error!("Realtime feed stopped: {}", e);
                        return;
                    }
                }
            };
            info!("Realtime feed reconnected");

            // Changes made while offline were missed.
            for table in &self.tables {
                if self.changes.send(table.clone()).is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_switches_scheme_and_path() {
        let url = websocket_url("https://db.example.org", "anon").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://db.example.org/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );

        let local = websocket_url("http://127.0.0.1:4000", "anon").unwrap();
        assert_eq!(local.scheme(), "ws");

        assert!(matches!(
            websocket_url("ftp://db.example.org", "anon"),
            Err(Error::Realtime(_))
        ));
    }

    #[test]
    fn change_events_name_their_table() {
        let (changes, _receiver) = mpsc::unbounded_channel();
        let connection = FeedConnection {
            url: websocket_url("http://localhost", "anon").unwrap(),
            tables: vec!["users".to_string(), "donations".to_string()],
            access_token: Arc::new(RwLock::new(None)),
            options: RealtimeOptions::default(),
            changes,
            next_ref: 0,
        };

        let change = json!({
            "topic": "realtime:public:users",
            "event": "postgres_changes",
            "payload": { "data": { "table": "users", "type": "UPDATE" } },
            "ref": null
        });
        assert_eq!(
            connection.changed_table(&change.to_string()),
            Some("users".to_string())
        );

        let legacy = json!({
            "topic": "realtime:public:donations",
            "event": "DELETE",
            "payload": {},
            "ref": null
        });
        assert_eq!(
            connection.changed_table(&legacy.to_string()),
            Some("donations".to_string())
        );

        let unwatched = json!({
            "topic": "realtime:public:audit",
            "event": "INSERT",
            "payload": { "table": "audit" },
            "ref": null
        });
        assert_eq!(connection.changed_table(&unwatched.to_string()), None);

        let reply = json!({
            "topic": "realtime:public:users",
            "event": "phx_reply",
            "payload": { "status": "ok", "response": {} },
            "ref": "1"
        });
        assert_eq!(connection.changed_table(&reply.to_string()), None);
    }
}

//! WebSocket Hub (C9): connection registry, subscription filters, and the
//! single-queue broadcast fan-out.

pub mod protocol;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::model::{AlertLevel, MetricKind};
use protocol::{Envelope, MessageType, SubscribeRequest, SubscriptionFilter};

const HEARTBEAT_IDLE_S: u64 = 30;
const DEAD_PONG_TIMEOUT_S: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

pub struct Connection {
    pub id: Uuid,
    pub peer_ip: String,
    pub user_agent: Option<String>,
    sink: mpsc::UnboundedSender<WsMessage>,
    pub state: RwLock<ConnectionState>,
    pub last_ping: RwLock<Instant>,
    pub last_pong: RwLock<Instant>,
    pub filter: RwLock<Option<SubscriptionFilter>>,
    pub messages_sent: std::sync::atomic::AtomicU64,
    pub messages_received: std::sync::atomic::AtomicU64,
}

impl Connection {
    fn send(&self, envelope: &Envelope) -> bool {
        let Ok(text) = serde_json::to_string(envelope) else {
            return false;
        };
        let ok = self.sink.send(WsMessage::Text(text)).is_ok();
        if ok {
            self.messages_sent.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        ok
    }
}

/// One item on the broadcast queue: either fans out to every connection,
/// or targets connections subscribed to `target_id` whose filter matches
/// the accompanying `metric_kind`/`alert_level`.
pub struct BroadcastItem {
    pub envelope: Envelope,
    pub target_id: Option<u64>,
    pub metric_kind: Option<MetricKind>,
    pub alert_level: Option<AlertLevel>,
    pub broadcast_all: bool,
}

impl BroadcastItem {
    pub fn all(envelope: Envelope) -> Self {
        BroadcastItem {
            envelope,
            target_id: None,
            metric_kind: None,
            alert_level: None,
            broadcast_all: true,
        }
    }

    pub fn targeted(envelope: Envelope, target_id: u64, metric_kind: Option<MetricKind>, alert_level: Option<AlertLevel>) -> Self {
        BroadcastItem {
            envelope,
            target_id: Some(target_id),
            metric_kind,
            alert_level,
            broadcast_all: false,
        }
    }
}

/// Registry of live connections plus the reverse index from target id to
/// subscribed connections. Registry mutations (add/remove/filter install)
/// take the exclusive lock; the broadcast loop takes a read-locked
/// snapshot so delivery never blocks registration.
pub struct Hub {
    connections: RwLock<HashMap<Uuid, Arc<Connection>>>,
    reverse_index: RwLock<HashMap<u64, HashSet<Uuid>>>,
    queue_tx: mpsc::UnboundedSender<Option<BroadcastItem>>,
    queue_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Option<BroadcastItem>>>>,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Arc::new(Hub {
            connections: RwLock::new(HashMap::new()),
            reverse_index: RwLock::new(HashMap::new()),
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(Some(queue_rx)),
        })
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Registers a freshly-accepted connection and sends it `connection_info`.
    pub fn register(&self, peer_ip: String, user_agent: Option<String>, sink: mpsc::UnboundedSender<WsMessage>) -> Arc<Connection> {
        let now = Instant::now();
        let conn = Arc::new(Connection {
            id: Uuid::new_v4(),
            peer_ip,
            user_agent,
            sink,
            state: RwLock::new(ConnectionState::Connected),
            last_ping: RwLock::new(now),
            last_pong: RwLock::new(now),
            filter: RwLock::new(None),
            messages_sent: std::sync::atomic::AtomicU64::new(0),
            messages_received: std::sync::atomic::AtomicU64::new(0),
        });
        self.connections.write().insert(conn.id, conn.clone());

        let supported: Vec<&str> = vec![
            "ping", "pong", "subscribe", "unsubscribe", "monitoring_update", "status_change",
            "server_online", "server_offline", "connection_info", "subscription_ack", "heartbeat", "error",
        ];
        conn.send(&Envelope::new(
            MessageType::ConnectionInfo,
            json!({ "connection_id": conn.id.to_string(), "supported_types": supported }),
        ));
        conn
    }

    pub fn unregister(&self, id: Uuid) {
        self.connections.write().remove(&id);
        let mut index = self.reverse_index.write();
        for set in index.values_mut() {
            set.remove(&id);
        }
        index.retain(|_, set| !set.is_empty());
    }

    /// Handles one inbound text frame; never closes the connection on a
    /// malformed payload, it replies with an `error` envelope instead.
    pub fn handle_incoming(&self, conn: &Arc<Connection>, raw: &str) {
        conn.messages_received.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let envelope: Envelope = match serde_json::from_str(raw) {
            Ok(e) => e,
            Err(e) => {
                conn.send(&Envelope::new(MessageType::Error, json!({ "reason": e.to_string() })));
                return;
            }
        };

        match envelope.kind {
            MessageType::Ping => {
                *conn.last_ping.write() = Instant::now();
                *conn.last_pong.write() = Instant::now();
                conn.send(&Envelope::new(MessageType::Pong, json!({})));
            }
            MessageType::Subscribe => match serde_json::from_value::<SubscribeRequest>(envelope.data) {
                Ok(req) => {
                    let filter = SubscriptionFilter::from_request(&req);
                    if let Some(ids) = &req.target_ids {
                        let mut index = self.reverse_index.write();
                        for id in ids {
                            index.entry(*id).or_default().insert(conn.id);
                        }
                    }
                    *conn.filter.write() = Some(filter);
                    conn.send(&Envelope::new(
                        MessageType::SubscriptionAck,
                        json!({ "success": true }),
                    ));
                }
                Err(e) => {
                    conn.send(&Envelope::new(MessageType::Error, json!({ "reason": e.to_string() })));
                }
            },
            MessageType::Unsubscribe => {
                *conn.filter.write() = None;
                let mut index = self.reverse_index.write();
                for set in index.values_mut() {
                    set.remove(&conn.id);
                }
                conn.send(&Envelope::new(
                    MessageType::SubscriptionAck,
                    json!({ "success": true, "subscription": null }),
                ));
            }
            _ => {
                conn.send(&Envelope::new(
                    MessageType::Error,
                    json!({ "reason": "unsupported message type from client" }),
                ));
            }
        }
    }

    pub fn enqueue(&self, item: BroadcastItem) {
        let _ = self.queue_tx.send(Some(item));
    }

    /// Runs the single broadcast delivery loop until a shutdown sentinel
    /// is received. Must be spawned exactly once.
    pub async fn run_broadcast_loop(self: Arc<Self>) {
        let mut rx = match self.queue_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };
        while let Some(item) = rx.recv().await {
            let Some(item) = item else { break };
            self.deliver(item);
        }
    }

    fn deliver(&self, item: BroadcastItem) {
        let targets: Vec<Arc<Connection>> = if item.broadcast_all {
            self.connections.read().values().cloned().collect()
        } else {
            let Some(target_id) = item.target_id else { return };
            let index = self.reverse_index.read();
            let connections = self.connections.read();
            match index.get(&target_id) {
                Some(ids) => ids
                    .iter()
                    .filter_map(|id| connections.get(id))
                    .filter(|c| {
                        c.filter
                            .read()
                            .as_ref()
                            .map(|f| f.matches(target_id, item.metric_kind, item.alert_level))
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect(),
                None => Vec::new(),
            }
        };

        let mut dead = Vec::new();
        for conn in targets {
            if !conn.send(&item.envelope) {
                dead.push(conn.id);
            }
        }
        for id in dead {
            self.unregister(id);
        }
    }

    /// Sends `heartbeat` to connections idle ≥ 30 s and disconnects any
    /// connection whose last pong is older than 60 s. Intended to be
    /// ticked every 30 s by the caller.
    pub fn run_heartbeat_tick(&self) {
        let now = Instant::now();
        let connections: Vec<Arc<Connection>> = self.connections.read().values().cloned().collect();
        let mut dead = Vec::new();
        for conn in connections {
            let idle = now.duration_since(*conn.last_ping.read());
            if idle >= Duration::from_secs(HEARTBEAT_IDLE_S) {
                conn.send(&Envelope::new(MessageType::Heartbeat, json!({})));
                *conn.last_ping.write() = now;
            }
            let since_pong = now.duration_since(*conn.last_pong.read());
            if since_pong > Duration::from_secs(DEAD_PONG_TIMEOUT_S) {
                dead.push(conn.id);
            }
        }
        for id in dead {
            self.unregister(id);
        }
    }

    /// Sends a shutdown sentinel to the broadcast loop, then closes every
    /// connection.
    pub fn shutdown(&self) {
        let _ = self.queue_tx.send(None);
        let ids: Vec<Uuid> = self.connections.read().keys().copied().collect();
        for id in ids {
            self.unregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub_with_connection(hub: &Arc<Hub>) -> (Arc<Connection>, mpsc::UnboundedReceiver<WsMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = hub.register("127.0.0.1".into(), None, tx);
        (conn, rx)
    }

    #[tokio::test]
    async fn subscribe_then_matching_broadcast_is_delivered() {
        let hub = Hub::new();
        let (conn, mut rx) = hub_with_connection(&hub);
        let _ = rx.recv().await; // connection_info

        hub.handle_incoming(
            &conn,
            &serde_json::to_string(&Envelope::new(
                MessageType::Subscribe,
                json!({ "target_ids": [1], "metric_kinds": ["cpu"], "alert_levels": ["warning", "critical"] }),
            ))
            .unwrap(),
        );
        let _ = rx.recv().await; // subscription_ack

        let hub_clone = hub.clone();
        let loop_handle = tokio::spawn(hub_clone.run_broadcast_loop());

        hub.enqueue(BroadcastItem::targeted(
            Envelope::new(MessageType::MonitoringUpdate, json!({})),
            1,
            Some(MetricKind::Cpu),
            Some(AlertLevel::Warning),
        ));

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(received.is_ok());
        hub.shutdown();
        let _ = loop_handle.await;
    }

    #[tokio::test]
    async fn non_matching_alert_level_is_not_delivered() {
        let hub = Hub::new();
        let (conn, mut rx) = hub_with_connection(&hub);
        let _ = rx.recv().await;

        hub.handle_incoming(
            &conn,
            &serde_json::to_string(&Envelope::new(
                MessageType::Subscribe,
                json!({ "target_ids": [1], "metric_kinds": ["cpu"], "alert_levels": ["critical"] }),
            ))
            .unwrap(),
        );
        let _ = rx.recv().await;

        let hub_clone = hub.clone();
        let loop_handle = tokio::spawn(hub_clone.run_broadcast_loop());
        hub.enqueue(BroadcastItem::targeted(
            Envelope::new(MessageType::MonitoringUpdate, json!({})),
            1,
            Some(MetricKind::Cpu),
            Some(AlertLevel::Ok),
        ));

        let received = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(received.is_err());
        hub.shutdown();
        let _ = loop_handle.await;
    }

    #[tokio::test]
    async fn malformed_payload_gets_error_reply_not_disconnect() {
        let hub = Hub::new();
        let (conn, mut rx) = hub_with_connection(&hub);
        let _ = rx.recv().await;
        hub.handle_incoming(&conn, "not json");
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, WsMessage::Text(_)));
        assert_eq!(hub.connection_count(), 1);
    }
}

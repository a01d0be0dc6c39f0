//! Fan-out of lifecycle, price and ledger events to connected clients.
//!
//! One bounded `tokio::sync::broadcast` channel carries every event with its
//! audience; each connection filters by its own room membership. A client
//! that falls behind loses events instead of slowing publishers down.

pub mod ws;

use crate::{
    models::{normalize_address, Position, Prediction, Round},
    oracle::OracleEvent,
    price::{Freshness, PriceSnapshot},
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info};

const CHANNEL_CAPACITY: usize = 1024;

/// Outbound events, serialized as `{"event": "...", "data": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    RoundStarted {
        round_id: u64,
        start_time: DateTime<Utc>,
        lock_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        start_price: Decimal,
    },
    #[serde(rename_all = "camelCase")]
    RoundLocked { round_id: u64, lock_price: Decimal },
    #[serde(rename_all = "camelCase")]
    RoundResolved {
        round_id: u64,
        end_price: Decimal,
        winning_position: Position,
    },
    #[serde(rename_all = "camelCase")]
    PriceUpdate {
        price: Decimal,
        change_24h: f64,
        timestamp: DateTime<Utc>,
        freshness: Freshness,
    },
    #[serde(rename_all = "camelCase")]
    PredictionMade {
        round_id: u64,
        user: String,
        position: Position,
        amount: Decimal,
    },
    #[serde(rename_all = "camelCase")]
    PredictionConfirmed {
        round_id: u64,
        position: Position,
        amount: Decimal,
        transaction_hash: String,
    },
    #[serde(rename_all = "camelCase")]
    RewardClaimed {
        round_id: u64,
        amount: Decimal,
        transaction_hash: Option<String>,
    },
    Notification { title: String, message: String },
}

impl ServerEvent {
    pub fn round_started(round: &Round) -> Self {
        ServerEvent::RoundStarted {
            round_id: round.round_id,
            start_time: round.start_time,
            lock_time: round.lock_time,
            end_time: round.end_time,
            start_price: round.start_price,
        }
    }

    /// `None` unless the round carries a lock price.
    pub fn round_locked(round: &Round) -> Option<Self> {
        Some(ServerEvent::RoundLocked {
            round_id: round.round_id,
            lock_price: round.lock_price?,
        })
    }

    /// `None` unless the round is resolved.
    pub fn round_resolved(round: &Round) -> Option<Self> {
        Some(ServerEvent::RoundResolved {
            round_id: round.round_id,
            end_price: round.end_price?,
            winning_position: round.winning_position?,
        })
    }

    pub fn price_update(snapshot: &PriceSnapshot) -> Self {
        ServerEvent::PriceUpdate {
            price: snapshot.price,
            change_24h: snapshot.change_24h,
            timestamp: snapshot.timestamp,
            freshness: snapshot.freshness,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::RoundStarted { .. } => "round_started",
            ServerEvent::RoundLocked { .. } => "round_locked",
            ServerEvent::RoundResolved { .. } => "round_resolved",
            ServerEvent::PriceUpdate { .. } => "price_update",
            ServerEvent::PredictionMade { .. } => "prediction_made",
            ServerEvent::PredictionConfirmed { .. } => "prediction_confirmed",
            ServerEvent::RewardClaimed { .. } => "reward_claimed",
            ServerEvent::Notification { .. } => "notification",
        }
    }
}

/// Who receives an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    All,
    Room(String),
}

pub fn round_room(round_id: u64) -> String {
    format!("round:{round_id}")
}

pub fn user_room(address: &str) -> String {
    format!("user:{}", address.trim().to_lowercase())
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub audience: Audience,
    pub event: ServerEvent,
}

pub type ConnectionId = u64;

#[derive(Debug, Default)]
struct ConnectionInfo {
    address: Option<String>,
    rooms: HashSet<String>,
}

#[derive(Debug, Default)]
struct Registry {
    connections: HashMap<ConnectionId, ConnectionInfo>,
    rooms: HashMap<String, HashSet<ConnectionId>>,
}

/// Registration returned to a transport when a client connects
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub rx: broadcast::Receiver<Envelope>,
}

pub struct EventBroadcaster {
    tx: broadcast::Sender<Envelope>,
    registry: RwLock<Registry>,
    next_id: AtomicU64,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            registry: RwLock::new(Registry::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Raw feed of every envelope, regardless of rooms.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    /// Returns the number of receivers the event was handed to.
    pub fn publish(&self, event: ServerEvent) -> usize {
        self.send(Audience::All, event)
    }

    pub fn publish_to(&self, room: &str, event: ServerEvent) -> usize {
        self.send(Audience::Room(room.to_string()), event)
    }

    fn send(&self, audience: Audience, event: ServerEvent) -> usize {
        let name = event.name();
        let delivered = self.tx.send(Envelope { audience, event }).unwrap_or(0);
        debug!(event = name, receivers = delivered, "event published");
        delivered
    }

    pub fn notify_user(&self, address: &str, title: &str, message: &str) -> usize {
        self.publish_to(
            &user_room(address),
            ServerEvent::Notification {
                title: title.to_string(),
                message: message.to_string(),
            },
        )
    }

    /// `prediction_made` to the round room and `prediction_confirmed` to the user.
    pub fn prediction_accepted(&self, prediction: &Prediction) {
        self.publish_to(
            &round_room(prediction.round_id),
            ServerEvent::PredictionMade {
                round_id: prediction.round_id,
                user: prediction.user.clone(),
                position: prediction.position,
                amount: prediction.amount,
            },
        );
        self.publish_to(
            &user_room(&prediction.user),
            ServerEvent::PredictionConfirmed {
                round_id: prediction.round_id,
                position: prediction.position,
                amount: prediction.amount,
                transaction_hash: prediction.transaction_hash.clone(),
            },
        );
    }

    pub fn register(&self) -> ConnectionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .write()
            .connections
            .insert(id, ConnectionInfo::default());
        info!(connection = id, "client connected");
        ConnectionHandle {
            id,
            rx: self.tx.subscribe(),
        }
    }

    /// Bind an address to the connection and join its user room. Returns
    /// the normalized address, or `None` if it is malformed.
    pub fn authenticate(&self, id: ConnectionId, address: &str) -> Option<String> {
        let address = normalize_address(address)?;
        {
            let mut registry = self.registry.write();
            let info = registry.connections.get_mut(&id)?;
            info.address = Some(address.clone());
        }
        self.join(id, &user_room(&address));
        Some(address)
    }

    pub fn subscribe_rooms<I, S>(&self, id: ConnectionId, rooms: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for room in rooms {
            self.join(id, room.as_ref());
        }
    }

    pub fn unsubscribe_rooms<I, S>(&self, id: ConnectionId, rooms: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut registry = self.registry.write();
        for room in rooms {
            let room = room.as_ref();
            if let Some(info) = registry.connections.get_mut(&id) {
                info.rooms.remove(room);
            }
            leave_room(&mut registry, id, room);
        }
    }

    fn join(&self, id: ConnectionId, room: &str) {
        let mut registry = self.registry.write();
        let Some(info) = registry.connections.get_mut(&id) else {
            return;
        };
        info.rooms.insert(room.to_string());
        registry
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(id);
        debug!(connection = id, room, "joined room");
    }

    pub fn disconnect(&self, id: ConnectionId) {
        let mut registry = self.registry.write();
        let Some(info) = registry.connections.remove(&id) else {
            return;
        };
        for room in &info.rooms {
            leave_room(&mut registry, id, room);
        }
        info!(connection = id, address = ?info.address, "client disconnected");
    }

    /// Whether `envelope` is meant for connection `id`.
    pub fn should_deliver(&self, id: ConnectionId, envelope: &Envelope) -> bool {
        match &envelope.audience {
            Audience::All => true,
            Audience::Room(room) => self
                .registry
                .read()
                .rooms
                .get(room)
                .is_some_and(|members| members.contains(&id)),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.registry.read().connections.len()
    }

    pub fn authenticated_count(&self) -> usize {
        self.registry
            .read()
            .connections
            .values()
            .filter(|c| c.address.is_some())
            .count()
    }

    pub fn room_size(&self, room: &str) -> usize {
        self.registry.read().rooms.get(room).map_or(0, |m| m.len())
    }

    /// Re-publish one oracle-side event. Lifecycle events are already
    /// published by the scheduler after it persists them, so only
    /// user-originated events are forwarded.
    pub fn relay_oracle_event(&self, event: OracleEvent) {
        match event {
            OracleEvent::PredictionMade {
                user,
                round_id,
                position,
                amount,
            } => {
                self.publish_to(
                    &round_room(round_id),
                    ServerEvent::PredictionMade {
                        round_id,
                        user,
                        position,
                        amount,
                    },
                );
            }
            OracleEvent::RewardClaimed {
                user,
                round_id,
                amount,
            } => {
                self.publish_to(
                    &user_room(&user),
                    ServerEvent::RewardClaimed {
                        round_id,
                        amount,
                        transaction_hash: None,
                    },
                );
            }
            other => debug!(event = ?other, "oracle lifecycle event observed"),
        }
    }

    /// Drain the oracle's event stream on its own task.
    pub fn spawn_oracle_relay(self: &Arc<Self>, mut rx: mpsc::Receiver<OracleEvent>) -> JoinHandle<()> {
        let broadcaster = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                broadcaster.relay_oracle_event(event);
            }
            info!("oracle event stream closed");
        })
    }
}

fn leave_room(registry: &mut Registry, id: ConnectionId, room: &str) {
    if let Some(members) = registry.rooms.get_mut(room) {
        members.remove(&id);
        if members.is_empty() {
            registry.rooms.remove(room);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    const ADDR: &str = "0xABCDEF0000000000000000000000000000000001";

    #[test]
    fn test_event_wire_shape() {
        let event = ServerEvent::RoundLocked {
            round_id: 7,
            lock_price: dec!(0.17),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "round_locked");
        assert_eq!(json["data"]["roundId"], 7);
        assert_eq!(json["data"]["lockPrice"], "0.17");

        let price = ServerEvent::PriceUpdate {
            price: dec!(0.15),
            change_24h: -1.25,
            timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
            freshness: Freshness::Stale,
        };
        let json = serde_json::to_value(&price).unwrap();
        assert_eq!(json["event"], "price_update");
        assert_eq!(json["data"]["change24h"], -1.25);
        assert_eq!(json["data"]["freshness"], "stale");
    }

    #[tokio::test]
    async fn test_room_delivery_filters_by_membership() {
        let broadcaster = EventBroadcaster::new();
        let mut a = broadcaster.register();
        let b = broadcaster.register();
        broadcaster.subscribe_rooms(a.id, ["round:1"]);

        broadcaster.publish_to(
            "round:1",
            ServerEvent::Notification {
                title: "t".into(),
                message: "m".into(),
            },
        );
        let envelope = a.rx.recv().await.unwrap();
        assert!(broadcaster.should_deliver(a.id, &envelope));
        assert!(!broadcaster.should_deliver(b.id, &envelope));

        broadcaster.publish(ServerEvent::RoundLocked {
            round_id: 1,
            lock_price: dec!(1),
        });
        let envelope = a.rx.recv().await.unwrap();
        assert!(broadcaster.should_deliver(b.id, &envelope));
    }

    #[test]
    fn test_authenticate_joins_user_room() {
        let broadcaster = EventBroadcaster::new();
        let conn = broadcaster.register();
        assert!(broadcaster.authenticate(conn.id, "not-an-address").is_none());

        let address = broadcaster.authenticate(conn.id, ADDR).unwrap();
        assert_eq!(address, ADDR.to_lowercase());
        assert_eq!(broadcaster.room_size(&user_room(ADDR)), 1);
        assert_eq!(broadcaster.authenticated_count(), 1);
    }

    #[test]
    fn test_disconnect_cleans_up_empty_rooms() {
        let broadcaster = EventBroadcaster::new();
        let a = broadcaster.register();
        let b = broadcaster.register();
        broadcaster.subscribe_rooms(a.id, ["round:1", "round:2"]);
        broadcaster.subscribe_rooms(b.id, ["round:1"]);

        broadcaster.unsubscribe_rooms(a.id, ["round:2"]);
        assert_eq!(broadcaster.room_size("round:2"), 0);

        broadcaster.disconnect(a.id);
        assert_eq!(broadcaster.room_size("round:1"), 1);
        broadcaster.disconnect(b.id);
        assert_eq!(broadcaster.room_size("round:1"), 0);
        assert_eq!(broadcaster.connection_count(), 0);
        assert!(broadcaster.registry.read().rooms.is_empty());
    }

    #[tokio::test]
    async fn test_publish_without_clients_is_harmless() {
        let broadcaster = EventBroadcaster::new();
        assert_eq!(broadcaster.notify_user(ADDR, "hi", "there"), 0);
    }

    #[tokio::test]
    async fn test_lagging_client_loses_events_but_publisher_continues() {
        let broadcaster = EventBroadcaster::with_capacity(2);
        let mut conn = broadcaster.register();
        for i in 0..5 {
            broadcaster.publish(ServerEvent::RoundLocked {
                round_id: i,
                lock_price: dec!(1),
            });
        }
        assert!(matches!(
            conn.rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        let next = conn.rx.recv().await.unwrap();
        assert!(matches!(next.event, ServerEvent::RoundLocked { round_id: 3, .. }));
    }

    #[tokio::test]
    async fn test_oracle_relay_forwards_user_events() {
        let broadcaster = Arc::new(EventBroadcaster::new());
        let mut feed = broadcaster.subscribe();
        let (tx, rx) = mpsc::channel(8);
        let relay = broadcaster.spawn_oracle_relay(rx);

        tx.send(OracleEvent::RoundLocked {
            round_id: 1,
            lock_price: dec!(1),
        })
        .await
        .unwrap();
        tx.send(OracleEvent::RewardClaimed {
            user: ADDR.to_string(),
            round_id: 1,
            amount: dec!(120.5),
        })
        .await
        .unwrap();
        drop(tx);
        relay.await.unwrap();

        let envelope = feed.recv().await.unwrap();
        assert_eq!(envelope.audience, Audience::Room(user_room(ADDR)));
        assert!(matches!(
            envelope.event,
            ServerEvent::RewardClaimed { round_id: 1, .. }
        ));
        assert!(feed.try_recv().is_err());
    }
}

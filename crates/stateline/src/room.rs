//! Room membership and broadcast
//!
//! A room is the broadcast domain for committed state: every member sees
//! every other member's committed updates. Membership is keyed by the
//! session's connection id, so a player reconnecting under a new session
//! replaces their old subscription instead of doubling up per player id.

use bytes::Bytes;
use stateline_net::{EnvelopeKind, Priority};
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

/// One committed update fanned out to a room.
#[derive(Debug, Clone)]
pub struct RoomUpdate {
    /// Player whose state changed.
    pub player_id: String,
    /// `Delta` or `Full`, matching what the receiving session should send.
    pub kind: EnvelopeKind,
    /// Serialized delta or snapshot, ready to seal into an envelope.
    pub payload: Bytes,
    pub priority: Priority,
}

/// All rooms on one server.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, HashMap<Uuid, mpsc::UnboundedSender<RoomUpdate>>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member to a room, returning its update channel.
    ///
    /// Idempotent per member id: joining again replaces the previous
    /// subscription, which closes the old receiver.
    pub async fn join(&self, room_id: &str, member: Uuid) -> mpsc::UnboundedReceiver<RoomUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut rooms = self.rooms.write().await;
        let members = rooms.entry(room_id.to_string()).or_default();
        members.insert(member, tx);
        info!(room = room_id, %member, members = members.len(), "member joined room");
        rx
    }

    /// Remove a member. Idempotent; empty rooms are dropped.
    pub async fn leave(&self, room_id: &str, member: Uuid) {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(room_id) {
            if members.remove(&member).is_some() {
                info!(room = room_id, %member, "member left room");
            }
            if members.is_empty() {
                rooms.remove(room_id);
            }
        }
    }

    /// Deliver an update to every member of the room except the origin.
    ///
    /// Returns the number of members the update reached. Members whose
    /// receiver has gone away are pruned on the spot.
    pub async fn publish(&self, room_id: &str, origin: Uuid, update: RoomUpdate) -> usize {
        let mut rooms = self.rooms.write().await;
        let Some(members) = rooms.get_mut(room_id) else {
            return 0;
        };

        let mut delivered = 0;
        members.retain(|member, tx| {
            if *member == origin {
                return true;
            }
            match tx.send(update.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                // Receiver dropped without leaving; reap it here.
                Err(_) => false,
            }
        });
        if members.is_empty() {
            rooms.remove(room_id);
        }
        debug!(room = room_id, player = %update.player_id, delivered, "published room update");
        delivered
    }

    /// Current member count of a room.
    pub async fn member_count(&self, room_id: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map_or(0, HashMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(player: &str) -> RoomUpdate {
        RoomUpdate {
            player_id: player.to_string(),
            kind: EnvelopeKind::Delta,
            payload: Bytes::from_static(b"delta"),
            priority: Priority::High,
        }
    }

    #[tokio::test]
    async fn publish_reaches_everyone_but_the_origin() {
        let rooms = RoomRegistry::new();
        let origin = Uuid::new_v4();
        let other = Uuid::new_v4();

        let mut origin_rx = rooms.join("arena", origin).await;
        let mut other_rx = rooms.join("arena", other).await;

        let delivered = rooms.publish("arena", origin, update("p1")).await;
        assert_eq!(delivered, 1);

        let received = other_rx.recv().await.unwrap();
        assert_eq!(received.player_id, "p1");
        assert!(origin_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn leave_is_idempotent_and_empty_rooms_vanish() {
        let rooms = RoomRegistry::new();
        let member = Uuid::new_v4();
        let _rx = rooms.join("arena", member).await;
        assert_eq!(rooms.member_count("arena").await, 1);

        rooms.leave("arena", member).await;
        rooms.leave("arena", member).await;
        assert_eq!(rooms.member_count("arena").await, 0);
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned_on_publish() {
        let rooms = RoomRegistry::new();
        let origin = Uuid::new_v4();
        let ghost = Uuid::new_v4();

        let _origin_rx = rooms.join("arena", origin).await;
        drop(rooms.join("arena", ghost).await);

        assert_eq!(rooms.publish("arena", origin, update("p1")).await, 0);
        assert_eq!(rooms.member_count("arena").await, 1);
    }

    #[tokio::test]
    async fn rejoining_replaces_the_previous_subscription() {
        let rooms = RoomRegistry::new();
        let member = Uuid::new_v4();
        let other = Uuid::new_v4();

        let mut stale_rx = rooms.join("arena", member).await;
        let mut fresh_rx = rooms.join("arena", member).await;
        let _other = rooms.join("arena", other).await;

        rooms.publish("arena", other, update("p2")).await;
        assert!(fresh_rx.recv().await.is_some());
        // The replaced sender was dropped, so the stale receiver is closed.
        assert!(stale_rx.recv().await.is_none());
    }
}

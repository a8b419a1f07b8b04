//! Room registry: named, password-protected broadcast groups.
//!
//! A room exists exactly while it has at least one participant. The first
//! successful join under an absent name creates the room with that join's
//! password; the last participant leaving deletes it.
//!
//! The table lock covers bookkeeping only. Broadcast takes a snapshot of the
//! recipients under the lock, writes to them with the lock released, and
//! re-acquires it to evict the participants whose write failed.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use roomhub_core::{HubError, HubResult};

/// Process-unique participant identifier.
pub type ParticipantId = u64;

/// Write side of a participant's link, as seen by the registry.
///
/// The registry never owns the link; it only writes broadcast payloads to it.
pub trait Outbound: Send + Sync {
    /// Deliver one message to the participant.
    fn deliver<'a>(
        &'a self,
        message: Message,
    ) -> Pin<Box<dyn Future<Output = HubResult<()>> + Send + 'a>>;
}

#[derive(Clone)]
struct Participant {
    id: ParticipantId,
    remote: SocketAddr,
    link: Arc<dyn Outbound>,
}

struct Room {
    password: String,
    participants: Vec<Participant>,
}

/// A successful join: the room name and the id assigned to the participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub room: String,
    pub id: ParticipantId,
}

/// Registry of rooms hosted by the hub.
pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, Room>>,
    next_participant: AtomicU64,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            next_participant: AtomicU64::new(1),
        }
    }

    /// Join `room`, creating it with `password` if it does not exist.
    ///
    /// On a password mismatch the link is not registered and the caller is
    /// responsible for closing it.
    pub async fn join(
        &self,
        room: &str,
        password: &str,
        remote: SocketAddr,
        link: Arc<dyn Outbound>,
    ) -> HubResult<Membership> {
        let mut rooms = self.rooms.lock().await;

        let creating = !rooms.contains_key(room);
        if creating {
            info!(remote = %remote, room = %room, "create room");
        }
        let entry = rooms.entry(room.to_string()).or_insert_with(|| Room {
            password: password.to_string(),
            participants: Vec::new(),
        });

        if !creating {
            debug!(
                remote = %remote,
                room = %room,
                participants = entry.participants.len(),
                "trying to enter room"
            );
            if entry.password != password {
                warn!(remote = %remote, room = %room, "invalid password provided");
                return Err(HubError::RoomPasswordMismatch {
                    room: room.to_string(),
                });
            }
        }

        let id = self.next_participant.fetch_add(1, Ordering::Relaxed);
        entry.participants.push(Participant { id, remote, link });

        info!(
            remote = %remote,
            room = %room,
            participant = id,
            participants = entry.participants.len(),
            "entered room"
        );

        Ok(Membership {
            room: room.to_string(),
            id,
        })
    }

    /// Send `message` to every participant of `room` except `source`.
    ///
    /// Participants whose delivery fails are evicted; the room is deleted if
    /// that empties it. Returns the number of successful deliveries, or
    /// `None` if `source` is not (or no longer) a member of `room`.
    pub async fn broadcast(
        &self,
        room: &str,
        source: ParticipantId,
        message: Message,
    ) -> Option<usize> {
        let targets: Vec<Participant> = {
            let rooms = self.rooms.lock().await;
            let r = rooms.get(room)?;
            if !r.participants.iter().any(|p| p.id == source) {
                debug!(room = %room, participant = source, "broadcast from non-member refused");
                return None;
            }
            r.participants
                .iter()
                .filter(|p| p.id != source)
                .cloned()
                .collect()
        };

        let size = message.len();
        let results = join_all(targets.iter().map(|p| {
            let message = message.clone();
            async move { (p, p.link.deliver(message).await) }
        }))
        .await;

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (participant, result) in results {
            match result {
                Ok(()) => {
                    trace!(room = %room, remote = %participant.remote, bytes = size, "delivered");
                    delivered += 1;
                }
                Err(e) => {
                    warn!(
                        room = %room,
                        remote = %participant.remote,
                        error = %e,
                        "delivery failed, evicting participant"
                    );
                    failed.push(participant.id);
                }
            }
        }

        if !failed.is_empty() {
            let mut rooms = self.rooms.lock().await;
            if let Some(r) = rooms.get_mut(room) {
                r.participants.retain(|p| !failed.contains(&p.id));
                if r.participants.is_empty() {
                    info!(room = %room, "no more participants, closing room");
                    rooms.remove(room);
                }
            }
        }

        Some(delivered)
    }

    /// Remove a participant. Returns `false` if it was not (or no longer) a member.
    pub async fn leave(&self, room: &str, id: ParticipantId) -> bool {
        let mut rooms = self.rooms.lock().await;
        let Some(r) = rooms.get_mut(room) else {
            return false;
        };

        let before = r.participants.len();
        r.participants.retain(|p| p.id != id);
        let removed = r.participants.len() != before;

        if removed {
            debug!(room = %room, participant = id, remaining = r.participants.len(), "participant left");
        }
        if r.participants.is_empty() {
            info!(room = %room, "no more participants, closing room");
            rooms.remove(room);
        }

        removed
    }

    /// Whether a room with this name currently exists.
    pub async fn contains(&self, room: &str) -> bool {
        self.rooms.lock().await.contains_key(room)
    }

    /// Participant count of a room, or `None` if it does not exist.
    pub async fn participant_count(&self, room: &str) -> Option<usize> {
        self.rooms
            .lock()
            .await
            .get(room)
            .map(|r| r.participants.len())
    }

    /// Number of rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }
}

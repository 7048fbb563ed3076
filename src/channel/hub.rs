//! Connected-node registry on the proxy.
//!
//! Every live backend connection registers an outbound queue here. `broadcast`
//! pushes each committed change onto every queue without awaiting; a queue that
//! is full or closed gets its node dropped, which ends that session and forces
//! the backend through reconnect + resync instead of silently losing events.
//!
//! Liveness follows the usual Alive → Suspect → Dead progression driven by the
//! time since the node was last heard from.

use super::protocol::SyncMessage;
use crate::model::types::{ChangeEvent, NodeId, now_ms};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
}

struct ConnectedNode {
    id: NodeId,
    peer: String,
    /// Distinguishes this session from earlier ones of the same node.
    session: u64,
    state: NodeState,
    connected_at: u64,
    last_seen: Instant,
    sender: mpsc::Sender<SyncMessage>,
}

/// Serializable view of a connected node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub id: NodeId,
    pub peer: String,
    pub session: u64,
    pub state: NodeState,
    pub connected_at: u64,
    pub last_seen_ms_ago: u64,
}

pub struct SyncHub {
    nodes: DashMap<NodeId, ConnectedNode>,
    next_session: AtomicU64,
    queue_capacity: usize,
    suspect_timeout: Duration,
    dead_timeout: Duration,
}

impl SyncHub {
    pub fn new(
        queue_capacity: usize,
        suspect_timeout: Duration,
        dead_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            nodes: DashMap::new(),
            next_session: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
            suspect_timeout,
            dead_timeout,
        })
    }

    /// Registers a node and returns its session id plus the queue the session
    /// drains. A node that reconnects replaces its previous session.
    pub fn on_connect(&self, id: NodeId, peer: String) -> (u64, mpsc::Receiver<SyncMessage>) {
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let session = self.next_session.fetch_add(1, Ordering::SeqCst);

        let node = ConnectedNode {
            id: id.clone(),
            peer: peer.clone(),
            session,
            state: NodeState::Alive,
            connected_at: now_ms(),
            last_seen: Instant::now(),
            sender,
        };

        if let Some(previous) = self.nodes.insert(id.clone(), node) {
            tracing::info!(
                "Node {} reconnected from {}, replacing session {}",
                id,
                peer,
                previous.session
            );
        } else {
            tracing::info!("Node {} connected from {} (session {})", id, peer, session);
        }

        (session, receiver)
    }

    /// Removes the node if `session` is still its current one.
    pub fn on_disconnect(&self, id: &NodeId, session: u64) -> bool {
        let removed = self
            .nodes
            .remove_if(id, |_, node| node.session == session)
            .is_some();
        if removed {
            tracing::info!("Node {} disconnected (session {})", id, session);
        }
        removed
    }

    /// Queues `event` for every connected node. Returns how many accepted it.
    pub fn broadcast(&self, event: &ChangeEvent) -> usize {
        let message = SyncMessage::change(event);
        let mut delivered = 0;
        let mut overflowed = Vec::new();

        for entry in self.nodes.iter() {
            let node = entry.value();
            match node.sender.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        "Outbound queue of node {} is full at change #{}, dropping session",
                        node.id,
                        event.sequence
                    );
                    overflowed.push((node.id.clone(), node.session));
                }
                Err(TrySendError::Closed(_)) => {
                    overflowed.push((node.id.clone(), node.session));
                }
            }
        }

        for (id, session) in overflowed {
            self.on_disconnect(&id, session);
        }

        tracing::debug!("Broadcast change #{} to {} nodes", event.sequence, delivered);
        delivered
    }

    /// Records that the node's session is alive.
    pub fn touch(&self, id: &NodeId, session: u64) {
        if let Some(mut node) = self.nodes.get_mut(id)
            && node.session == session
        {
            node.last_seen = Instant::now();
            if node.state == NodeState::Suspect {
                tracing::info!("Node {} is responsive again", id);
                node.state = NodeState::Alive;
            }
        }
    }

    pub fn is_connected(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn connected_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn connected_nodes(&self) -> Vec<NodeInfo> {
        let now = Instant::now();
        let mut nodes: Vec<NodeInfo> = self
            .nodes
            .iter()
            .map(|entry| {
                let node = entry.value();
                NodeInfo {
                    id: node.id.clone(),
                    peer: node.peer.clone(),
                    session: node.session,
                    state: node.state,
                    connected_at: node.connected_at,
                    last_seen_ms_ago: now.duration_since(node.last_seen).as_millis() as u64,
                }
            })
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// One pass of failure detection. Returns the nodes that were dropped.
    pub fn check_liveness(&self) -> Vec<NodeId> {
        let now = Instant::now();
        let mut dead = Vec::new();

        for mut entry in self.nodes.iter_mut() {
            let node = entry.value_mut();
            let elapsed = now.duration_since(node.last_seen);

            match node.state {
                NodeState::Alive => {
                    if elapsed > self.suspect_timeout {
                        tracing::warn!(
                            "Node {} suspected (no contact for {:?})",
                            node.id,
                            elapsed
                        );
                        node.state = NodeState::Suspect;
                    }
                }
                NodeState::Suspect => {
                    if elapsed > self.dead_timeout {
                        tracing::warn!(
                            "Node {} declared dead (no contact for {:?})",
                            node.id,
                            elapsed
                        );
                        node.state = NodeState::Dead;
                        dead.push((node.id.clone(), node.session));
                    }
                }
                NodeState::Dead => {
                    dead.push((node.id.clone(), node.session));
                }
            }
        }

        // Dropping the entry drops its sender, which ends the session task.
        dead.into_iter()
            .filter(|(id, session)| self.on_disconnect(id, *session))
            .map(|(id, _)| id)
            .collect()
    }

    pub async fn failure_detection_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let dropped = self.check_liveness();
            if !dropped.is_empty() {
                tracing::info!(
                    "Dropped {} unresponsive nodes, {} still connected",
                    dropped.len(),
                    self.connected_count()
                );
            }
        }
    }
}

//! The authoritative side of the network.
//!
//! Every committed write goes through one writer lock:
//! `store.set -> log.append -> hub.broadcast -> persist`. Snapshots for a resync
//! are taken under the same lock, so for any session the snapshot sequence and
//! the live queue line up: everything queued before the snapshot is covered by
//! it, everything queued after has a higher sequence number.

use crate::backoff::backoff_delay;
use crate::channel::hub::SyncHub;
use crate::channel::protocol::{SyncMessage, SyncRequest, WireError};
use crate::channel::transport::{MemoryAcceptor, PeerConnection, TcpAcceptor};
use crate::error::{Result, SyncError};
use crate::model::catalog::CapeCatalog;
use crate::model::types::{Assignment, CapeState, ChangeEvent, NodeId, PlayerId};
use crate::store::changelog::ChangeLog;
use crate::store::memory::AssignmentStore;
use crate::store::persistence::PersistenceBackend;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

/// How long a fresh connection may take to introduce itself.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Full state as of `sequence`.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub epoch: Uuid,
    pub sequence: u64,
    pub assignments: Vec<Assignment>,
}

pub struct ProxyService {
    store: Arc<AssignmentStore>,
    log: Arc<ChangeLog>,
    hub: Arc<SyncHub>,
    persistence: Option<Arc<dyn PersistenceBackend>>,
    /// Drawn once per process start.
    epoch: Uuid,
    writer: Mutex<()>,
}

impl ProxyService {
    pub fn new(
        store: Arc<AssignmentStore>,
        log: Arc<ChangeLog>,
        hub: Arc<SyncHub>,
        persistence: Option<Arc<dyn PersistenceBackend>>,
    ) -> Arc<Self> {
        let epoch = Uuid::new_v4();
        tracing::info!("Proxy service starting with epoch {}", epoch);
        Arc::new(Self {
            store,
            log,
            hub,
            persistence,
            epoch,
            writer: Mutex::new(()),
        })
    }

    pub fn epoch(&self) -> Uuid {
        self.epoch
    }

    pub fn head(&self) -> u64 {
        self.log.head()
    }

    pub fn hub(&self) -> &Arc<SyncHub> {
        &self.hub
    }

    pub fn catalog(&self) -> &Arc<CapeCatalog> {
        self.store.catalog()
    }

    pub fn is_available(&self) -> bool {
        self.store.is_available()
    }

    /// Loads persisted assignments and opens the store. Without a persistence
    /// backend the store opens empty.
    pub async fn load(&self) -> Result<usize> {
        let history = match &self.persistence {
            Some(backend) => {
                let backend = backend.clone();
                tokio::task::spawn_blocking(move || backend.load())
                    .await
                    .map_err(|e| SyncError::Persistence(e.to_string()))??
            }
            None => Vec::new(),
        };
        let count = history.len();
        self.store.load(history);
        Ok(count)
    }

    /// Keeps calling `load` until it succeeds. Reads and writes answer
    /// `StoreUnavailable` in the meantime.
    pub async fn load_with_retry(&self, base: Duration, cap: Duration) {
        let mut attempt = 0u32;
        loop {
            match self.load().await {
                Ok(count) => {
                    tracing::info!("Assignment store ready ({} versions loaded)", count);
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    let delay = backoff_delay(attempt, base, cap);
                    tracing::error!(
                        "Loading assignments failed (attempt {}): {}. Retrying in {:?}",
                        attempt,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Commits a new assignment version and fans it out to every backend.
    pub async fn set(
        &self,
        player: PlayerId,
        cape: CapeState,
        expected_version: Option<u64>,
    ) -> Result<Assignment> {
        let _guard = self.writer.lock().await;

        let assignment = match self.store.set(player, cape, expected_version) {
            Ok(assignment) => assignment,
            Err(e) => {
                tracing::debug!("Write for {} rejected: {}", player, e);
                return Err(e);
            }
        };
        let event = self.log.append(assignment.clone());
        let delivered = self.hub.broadcast(&event);

        tracing::info!(
            "Committed change #{}: {} -> {:?} (v{}, {} nodes)",
            event.sequence,
            player,
            assignment.cape.cape_id().map(|c| c.as_str()),
            assignment.version,
            delivered
        );

        self.persist().await;
        Ok(assignment)
    }

    pub fn get(&self, player: &PlayerId) -> Result<Assignment> {
        self.store.get(player)
    }

    pub fn history(&self, player: &PlayerId) -> Result<Vec<Assignment>> {
        self.store.history(player)
    }

    /// Retained change events with `sequence >= from`.
    pub fn changes_from(&self, from: u64) -> Result<Vec<ChangeEvent>> {
        Ok(self.log.read_from(from)?.collect())
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        let _guard = self.writer.lock().await;
        let assignments = self.store.snapshot_all()?;
        Ok(Snapshot {
            epoch: self.epoch,
            sequence: self.log.head(),
            assignments,
        })
    }

    /// Rewrites the full history while the writer lock is held, so commit
    /// latency grows with the number of stored versions.
    // TODO: debounce saves or move to an append-only file for large stores.
    async fn persist(&self) {
        let Some(backend) = self.persistence.clone() else {
            return;
        };
        let history = self.store.export();
        match tokio::task::spawn_blocking(move || backend.save(&history)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("Failed to persist assignments: {}", e),
            Err(e) => tracing::error!("Persistence task panicked: {}", e),
        }
    }

    // ============================================================
    // SESSIONS
    // ============================================================

    pub async fn serve_tcp(self: Arc<Self>, acceptor: TcpAcceptor) {
        loop {
            match acceptor.accept().await {
                Ok(link) => {
                    let service = self.clone();
                    tokio::spawn(async move { service.serve_link(link).await });
                }
                Err(e) => {
                    tracing::warn!("Accepting sync connection failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    pub async fn serve_memory(self: Arc<Self>, mut acceptor: MemoryAcceptor) {
        while let Some(link) = acceptor.accept().await {
            let service = self.clone();
            tokio::spawn(async move { service.serve_link(link).await });
        }
        tracing::debug!("In-process acceptor closed");
    }

    /// Runs one backend connection until either side goes away.
    pub async fn serve_link(self: Arc<Self>, mut link: PeerConnection) {
        let peer = link.peer();

        let node_id = match tokio::time::timeout(HELLO_TIMEOUT, link.recv()).await {
            Ok(Some(Ok(SyncRequest::Hello { node_id }))) => node_id,
            Ok(Some(Ok(other))) => {
                tracing::warn!("Connection from {} opened with {:?}, closing", peer, other);
                return;
            }
            Ok(Some(Err(e))) => {
                tracing::warn!("Handshake with {} failed: {}", peer, e);
                return;
            }
            Ok(None) => return,
            Err(_) => {
                tracing::warn!("No handshake from {} within {:?}", peer, HELLO_TIMEOUT);
                return;
            }
        };

        let (session, mut outbound) = self.hub.on_connect(node_id.clone(), peer);

        if let Err(e) = self
            .run_session(&node_id, session, &mut link, &mut outbound)
            .await
        {
            tracing::warn!("Session {} of node {} ended: {}", session, node_id, e);
        }

        self.hub.on_disconnect(&node_id, session);
    }

    async fn run_session(
        &self,
        node_id: &NodeId,
        session: u64,
        link: &mut PeerConnection,
        outbound: &mut mpsc::Receiver<SyncMessage>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                message = outbound.recv() => match message {
                    Some(message) => link.send(message).await?,
                    None => {
                        tracing::info!("Session {} of node {} dropped by hub", session, node_id);
                        return Ok(());
                    }
                },
                request = link.recv() => match request {
                    Some(Ok(request)) => {
                        self.hub.touch(node_id, session);
                        self.handle_request(node_id, request, link).await?;
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Ok(()),
                },
            }
        }
    }

    async fn handle_request(
        &self,
        node_id: &NodeId,
        request: SyncRequest,
        link: &mut PeerConnection,
    ) -> Result<()> {
        match request {
            SyncRequest::Resync => self.send_snapshot(node_id, link).await,
            SyncRequest::Ping { nonce } => link.send(SyncMessage::Pong { nonce }).await,
            SyncRequest::Assign {
                request_id,
                player_id,
                cape_id,
                expected_version,
            } => {
                let result = self
                    .set(player_id, CapeState::from(cape_id), expected_version)
                    .await;
                let reply = match result {
                    Ok(assignment) => SyncMessage::AssignResult {
                        request_id,
                        assignment: Some(assignment),
                        error: None,
                    },
                    Err(e) => SyncMessage::AssignResult {
                        request_id,
                        assignment: None,
                        error: Some(WireError::from(&e)),
                    },
                };
                link.send(reply).await
            }
            SyncRequest::Hello { .. } => {
                tracing::warn!("Node {} repeated its handshake, ignoring", node_id);
                Ok(())
            }
        }
    }

    async fn send_snapshot(&self, node_id: &NodeId, link: &mut PeerConnection) -> Result<()> {
        let snapshot = match self.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("Resync for node {} failed: {}", node_id, e);
                return link
                    .send(SyncMessage::ResyncFailed {
                        reason: e.to_string(),
                    })
                    .await;
            }
        };

        tracing::info!(
            "Sending snapshot at #{} ({} players) to node {}",
            snapshot.sequence,
            snapshot.assignments.len(),
            node_id
        );

        link.send(SyncMessage::ResyncStart {
            epoch: snapshot.epoch,
            sequence_number: snapshot.sequence,
            entries: snapshot.assignments.len(),
        })
        .await?;
        for assignment in &snapshot.assignments {
            link.send(SyncMessage::entry(assignment)).await?;
        }
        link.send(SyncMessage::ResyncEnd {
            epoch: snapshot.epoch,
            sequence_number: snapshot.sequence,
        })
        .await
    }
}

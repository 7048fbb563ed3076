//! Backend node: keeps one connection to the proxy alive and feeds it into the
//! reconciliation engine.

use super::engine::{EngineAction, EngineState, EngineStatus, ReconciliationEngine};
use crate::backoff::backoff_delay;
use crate::cache::local::LocalCache;
use crate::channel::protocol::{SyncMessage, SyncRequest, WireError};
use crate::channel::transport::{SyncConnection, SyncTransport};
use crate::error::{Result, SyncError};
use crate::model::catalog::{CapeCatalog, CapeDefinition};
use crate::model::types::{Assignment, CapeState, NodeId, PlayerId};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub node_id: NodeId,
    pub heartbeat_interval: Duration,
    /// Silence from the proxy for this long counts as a lost connection.
    pub dead_timeout: Duration,
    pub resync_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Upper bound for a forwarded write to be answered.
    pub request_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::new(),
            heartbeat_interval: Duration::from_secs(5),
            dead_timeout: Duration::from_secs(30),
            resync_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub node_id: NodeId,
    pub proxy: String,
    pub connections: u64,
    pub pending_requests: usize,
    pub engine: EngineStatus,
}

type PendingReply = (PlayerId, oneshot::Sender<Result<Assignment>>);

pub struct BackendNode {
    config: BackendConfig,
    transport: Arc<dyn SyncTransport>,
    engine: Arc<ReconciliationEngine>,
    catalog: Arc<CapeCatalog>,
    /// Request queue of the current connection, if any.
    outbound: Mutex<Option<mpsc::Sender<SyncRequest>>>,
    pending: DashMap<u64, PendingReply>,
    next_request: AtomicU64,
    connections: AtomicU64,
}

impl BackendNode {
    pub fn new(
        config: BackendConfig,
        transport: Arc<dyn SyncTransport>,
        cache: Arc<LocalCache>,
        catalog: Arc<CapeCatalog>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            transport,
            engine: ReconciliationEngine::new(cache),
            catalog,
            outbound: Mutex::new(None),
            pending: DashMap::new(),
            next_request: AtomicU64::new(1),
            connections: AtomicU64::new(0),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    pub fn engine(&self) -> &Arc<ReconciliationEngine> {
        &self.engine
    }

    pub fn cache(&self) -> &Arc<LocalCache> {
        self.engine.cache()
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move { node.run().await })
    }

    /// Connects, serves the connection until it fails, and reconnects with
    /// backoff. Never returns.
    pub async fn run(self: Arc<Self>) {
        let mut attempt = 0u32;
        loop {
            match self.transport.connect().await {
                Ok(connection) => {
                    attempt = 0;
                    self.connections.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        "Node {} connected to {}",
                        self.config.node_id,
                        self.transport.describe()
                    );
                    self.run_connection(connection).await;
                }
                Err(e) => {
                    tracing::warn!("Connecting to {} failed: {}", self.transport.describe(), e);
                }
            }

            attempt += 1;
            let delay = backoff_delay(attempt, self.config.backoff_base, self.config.backoff_cap);
            tracing::info!("Reconnecting in {:?} (attempt {})", delay, attempt);
            tokio::time::sleep(delay).await;
        }
    }

    async fn run_connection(&self, mut connection: SyncConnection) {
        let generation = self.engine.on_connect().await;
        let (tx, mut rx) = mpsc::channel(64);
        *self.outbound.lock() = Some(tx);

        if let Err(e) = self.drive(generation, &mut connection, &mut rx).await {
            tracing::warn!("Connection to proxy lost: {}", e);
        }

        // Closing the queue first makes a write that raced the teardown fail
        // on send instead of waiting out its timeout.
        *self.outbound.lock() = None;
        drop(rx);
        self.fail_pending();
        self.engine.on_disconnect(generation).await;
    }

    async fn drive(
        &self,
        generation: u64,
        connection: &mut SyncConnection,
        requests: &mut mpsc::Receiver<SyncRequest>,
    ) -> Result<()> {
        connection
            .send(SyncRequest::Hello {
                node_id: self.config.node_id.clone(),
            })
            .await?;
        connection.send(SyncRequest::Resync).await?;

        let mut resync_deadline = Some(Instant::now() + self.config.resync_timeout);
        let mut retry_at: Option<Instant> = None;
        let mut retry_attempt = 0u32;
        let mut last_heard = Instant::now();
        let mut nonce = 0u64;

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                incoming = connection.recv() => {
                    let message = match incoming {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => return Err(e),
                        None => {
                            return Err(SyncError::TransportFailure(
                                "proxy closed the connection".to_string(),
                            ))
                        }
                    };
                    last_heard = Instant::now();

                    match message {
                        SyncMessage::Pong { .. } => {}
                        SyncMessage::AssignResult {
                            request_id,
                            assignment,
                            error,
                        } => self.complete_request(request_id, assignment, error),
                        other => match self.engine.handle(generation, other).await {
                            EngineAction::None => {
                                if self.engine.state() == EngineState::Live {
                                    resync_deadline = None;
                                    retry_attempt = 0;
                                }
                            }
                            EngineAction::RequestResync => {
                                connection.send(SyncRequest::Resync).await?;
                                resync_deadline = Some(Instant::now() + self.config.resync_timeout);
                            }
                            EngineAction::RetryResync => {
                                retry_attempt += 1;
                                let delay = backoff_delay(
                                    retry_attempt,
                                    self.config.backoff_base,
                                    self.config.backoff_cap,
                                );
                                tracing::info!("Retrying resync in {:?}", delay);
                                retry_at = Some(Instant::now() + delay);
                                resync_deadline = None;
                            }
                        },
                    }
                }
                request = requests.recv() => {
                    if let Some(request) = request {
                        connection.send(request).await?;
                    }
                }
                _ = heartbeat.tick() => {
                    let silent = last_heard.elapsed();
                    if silent > self.config.dead_timeout {
                        return Err(SyncError::TransportFailure(format!(
                            "nothing heard from proxy for {:?}",
                            silent
                        )));
                    }
                    if let Some(deadline) = resync_deadline
                        && Instant::now() >= deadline
                    {
                        return Err(SyncError::TransportFailure(format!(
                            "snapshot not completed within {:?}",
                            self.config.resync_timeout
                        )));
                    }
                    nonce += 1;
                    connection.send(SyncRequest::Ping { nonce }).await?;
                }
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    retry_at = None;
                    if self.engine.begin_resync(generation).await {
                        connection.send(SyncRequest::Resync).await?;
                        resync_deadline = Some(Instant::now() + self.config.resync_timeout);
                    }
                }
            }
        }
    }

    fn complete_request(
        &self,
        request_id: u64,
        assignment: Option<Assignment>,
        error: Option<WireError>,
    ) {
        let Some((_, (player, reply))) = self.pending.remove(&request_id) else {
            tracing::debug!("Reply for unknown request {}", request_id);
            return;
        };
        let result = match (assignment, error) {
            (_, Some(error)) => Err(error.into_error(player)),
            (Some(assignment), None) => Ok(assignment),
            (None, None) => Err(SyncError::TransportFailure(
                "empty reply from proxy".to_string(),
            )),
        };
        let _ = reply.send(result);
    }

    fn fail_pending(&self) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, (_, reply))) = self.pending.remove(&id) {
                let _ = reply.send(Err(SyncError::TransportFailure(
                    "connection to proxy lost".to_string(),
                )));
            }
        }
    }

    /// Forwards a write to the proxy and waits for its verdict. A version
    /// conflict is returned to the caller as is.
    pub async fn request_set(
        &self,
        player: PlayerId,
        cape: CapeState,
        expected_version: Option<u64>,
    ) -> Result<Assignment> {
        let state = self.engine.state();
        if state != EngineState::Live {
            return Err(SyncError::NotLive(state.to_string()));
        }
        let sender = self
            .outbound
            .lock()
            .clone()
            .ok_or_else(|| SyncError::NotLive(EngineState::Disconnected.to_string()))?;

        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(request_id, (player, reply_tx));

        let request = SyncRequest::Assign {
            request_id,
            player_id: player,
            cape_id: cape.into(),
            expected_version,
        };
        if sender.send(request).await.is_err() {
            self.pending.remove(&request_id);
            return Err(SyncError::TransportFailure(
                "connection to proxy closed".to_string(),
            ));
        }

        match tokio::time::timeout(self.config.request_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::TransportFailure(
                "connection closed before the proxy replied".to_string(),
            )),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(SyncError::TransportFailure(format!(
                    "no reply within {:?}",
                    self.config.request_timeout
                )))
            }
        }
    }

    /// Last known assignment; never blocks on the network.
    pub fn lookup(&self, player: &PlayerId) -> Option<Assignment> {
        self.cache().lookup(player)
    }

    /// The cape to render for `player`: `NotFound` if nothing is known,
    /// `Ok(None)` for an explicit "no cape".
    pub fn resolve(&self, player: &PlayerId) -> Result<Option<Arc<CapeDefinition>>> {
        let assignment = self.lookup(player).ok_or(SyncError::NotFound(*player))?;
        match assignment.cape {
            CapeState::NoCape => Ok(None),
            CapeState::Cape(id) => self
                .catalog
                .get(id.as_str())
                .map(Some)
                .ok_or_else(|| SyncError::UnknownCape(id.to_string())),
        }
    }

    pub async fn status(&self) -> BackendStatus {
        BackendStatus {
            node_id: self.config.node_id.clone(),
            proxy: self.transport.describe(),
            connections: self.connections.load(Ordering::Relaxed),
            pending_requests: self.pending.len(),
            engine: self.engine.status().await,
        }
    }
}

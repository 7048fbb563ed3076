//! Proxy Module Tests
//!
//! ## Test Scopes
//! - **Commit Path**: writes reach the store, the log, the hub and persistence in order.
//! - **Availability**: nothing is served until persisted state is loaded.
//! - **Sessions**: handshake, snapshots, heartbeats and forwarded writes over an
//!   in-process link.
//! - **Admin API**: status codes and bodies of the HTTP handlers.

#[cfg(test)]
mod tests {
    use crate::channel::hub::SyncHub;
    use crate::channel::protocol::{SyncMessage, SyncRequest};
    use crate::channel::transport::{Link, MemoryTransport, SyncConnection, SyncTransport};
    use crate::error::SyncError;
    use crate::model::catalog::CapeCatalog;
    use crate::model::types::{Assignment, CapeId, CapeState, NodeId, PlayerId};
    use crate::proxy::handlers::{
        handle_assign, handle_get_assignment, handle_get_changes, handle_get_history,
        handle_list_capes,
    };
    use crate::proxy::protocol::{AssignRequest, ChangesQuery};
    use crate::proxy::service::ProxyService;
    use crate::store::changelog::ChangeLog;
    use crate::store::memory::AssignmentStore;
    use crate::store::persistence::{MemoryBackend, PersistenceBackend};
    use axum::Json;
    use axum::extract::{Extension, Path, Query};
    use axum::http::StatusCode;
    use std::sync::Arc;
    use std::time::Duration;

    fn build(persistence: Option<Arc<dyn PersistenceBackend>>) -> Arc<ProxyService> {
        let store = Arc::new(AssignmentStore::new(CapeCatalog::builtin()));
        let hub = SyncHub::new(64, Duration::from_secs(15), Duration::from_secs(30));
        ProxyService::new(store, ChangeLog::new(), hub, persistence)
    }

    async fn loaded() -> Arc<ProxyService> {
        let proxy = build(None);
        proxy.load().await.unwrap();
        proxy
    }

    /// Starts serving an in-process acceptor and returns a connected, greeted link.
    async fn connect(proxy: &Arc<ProxyService>, node: &str) -> SyncConnection {
        let (transport, acceptor) = MemoryTransport::new(node);
        tokio::spawn(proxy.clone().serve_memory(acceptor));

        let mut conn = transport.connect().await.unwrap();
        conn.send(SyncRequest::Hello {
            node_id: NodeId(node.to_string()),
        })
        .await
        .unwrap();
        conn
    }

    async fn next(conn: &mut SyncConnection) -> SyncMessage {
        tokio::time::timeout(Duration::from_secs(2), conn.recv())
            .await
            .expect("timed out waiting for proxy")
            .expect("link closed")
            .expect("decode failed")
    }

    async fn wait_connected(proxy: &Arc<ProxyService>, count: usize) {
        for _ in 0..200 {
            if proxy.hub().connected_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} connected nodes", count);
    }

    // ============================================================
    // COMMIT PATH TESTS
    // ============================================================

    #[tokio::test]
    async fn test_set_appends_to_log_and_broadcasts() {
        let proxy = loaded().await;
        let (_, mut rx) = proxy
            .hub()
            .on_connect(NodeId("watcher".to_string()), "test".to_string());
        let player = PlayerId::new();

        let assignment = proxy
            .set(player, CapeState::cape("vanilla"), None)
            .await
            .unwrap();

        assert_eq!(assignment.version, 1);
        assert_eq!(proxy.head(), 1);
        assert_eq!(proxy.get(&player).unwrap(), assignment);

        match rx.recv().await.unwrap() {
            SyncMessage::Change {
                sequence_number,
                player_id,
                cape_id,
                ..
            } => {
                assert_eq!(sequence_number, 1);
                assert_eq!(player_id, player);
                assert_eq!(cape_id, Some(CapeId::new("vanilla")));
            }
            other => panic!("expected change, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_conflict_leaves_log_untouched() {
        let proxy = loaded().await;
        let player = PlayerId::new();
        proxy.set(player, CapeState::cape("cobalt"), None).await.unwrap();

        let result = proxy.set(player, CapeState::NoCape, Some(0)).await;

        assert!(matches!(
            result,
            Err(SyncError::Conflict {
                expected: 0,
                current: 1,
                ..
            })
        ));
        assert_eq!(proxy.head(), 1);
        assert_eq!(proxy.history(&player).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_writers_get_consecutive_sequences() {
        let proxy = loaded().await;

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let proxy = proxy.clone();
            tasks.push(tokio::spawn(async move {
                proxy
                    .set(PlayerId::new(), CapeState::cape("scrolls"), None)
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let sequences: Vec<u64> = proxy
            .changes_from(1)
            .unwrap()
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(sequences, (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_snapshot_matches_head() {
        let proxy = loaded().await;
        let a = PlayerId::new();
        let b = PlayerId::new();
        proxy.set(a, CapeState::cape("cobalt"), None).await.unwrap();
        proxy.set(b, CapeState::cape("mojang"), None).await.unwrap();
        proxy.set(a, CapeState::NoCape, None).await.unwrap();

        let snapshot = proxy.snapshot().await.unwrap();

        assert_eq!(snapshot.sequence, 3);
        assert_eq!(snapshot.epoch, proxy.epoch());
        assert_eq!(snapshot.assignments.len(), 2);
        let a_state = snapshot.assignments.iter().find(|x| x.player == a).unwrap();
        assert_eq!(a_state.version, 2);
        assert_eq!(a_state.cape, CapeState::NoCape);
    }

    // ============================================================
    // AVAILABILITY & PERSISTENCE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_unloaded_store_is_unavailable() {
        let proxy = build(None);

        let write = proxy.set(PlayerId::new(), CapeState::NoCape, None).await;
        assert!(matches!(write, Err(SyncError::StoreUnavailable(_))));
        assert!(matches!(
            proxy.snapshot().await,
            Err(SyncError::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_load_restores_persisted_history() {
        let player = PlayerId::new();
        let backend = Arc::new(MemoryBackend::with_history(vec![
            Assignment {
                player,
                cape: CapeState::cape("cobalt"),
                version: 1,
                updated_at: 10,
            },
            Assignment {
                player,
                cape: CapeState::cape("prismarine"),
                version: 2,
                updated_at: 20,
            },
        ]));
        let proxy = build(Some(backend.clone()));

        assert_eq!(proxy.load().await.unwrap(), 2);
        assert_eq!(proxy.get(&player).unwrap().version, 2);

        // The next write continues the persisted version space and is saved.
        let next = proxy.set(player, CapeState::NoCape, Some(2)).await.unwrap();
        assert_eq!(next.version, 3);
        assert_eq!(backend.saved().len(), 3);
    }

    #[tokio::test]
    async fn test_every_commit_saves_full_history() {
        let backend = Arc::new(MemoryBackend::with_history(Vec::new()));
        let proxy = build(Some(backend.clone()));
        proxy.load().await.unwrap();
        let a = PlayerId::new();
        let b = PlayerId::new();

        proxy.set(a, CapeState::cape("cobalt"), None).await.unwrap();
        assert_eq!(backend.saved().len(), 1);

        proxy.set(b, CapeState::cape("vanilla"), None).await.unwrap();
        proxy.set(a, CapeState::NoCape, Some(1)).await.unwrap();

        let saved = backend.saved();
        assert_eq!(saved.len(), 3);
        assert_eq!(saved.iter().filter(|x| x.player == a).count(), 2);
        assert!(saved.iter().any(|x| x.player == b && x.version == 1));
    }

    #[tokio::test]
    async fn test_load_failure_keeps_store_closed() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_unavailable(true);
        let proxy = build(Some(backend.clone()));

        assert!(proxy.load().await.is_err());
        assert!(!proxy.is_available());

        backend.set_unavailable(false);
        proxy
            .load_with_retry(Duration::from_millis(1), Duration::from_millis(5))
            .await;
        assert!(proxy.is_available());
    }

    #[tokio::test]
    async fn test_failed_save_does_not_undo_commit() {
        let backend = Arc::new(MemoryBackend::new());
        let proxy = build(Some(backend.clone()));
        proxy.load().await.unwrap();
        backend.set_unavailable(true);

        let player = PlayerId::new();
        proxy.set(player, CapeState::cape("cobalt"), None).await.unwrap();

        assert_eq!(proxy.get(&player).unwrap().version, 1);
        assert!(backend.saved().is_empty());
    }

    // ============================================================
    // SESSION TESTS
    // ============================================================

    #[tokio::test]
    async fn test_resync_streams_full_snapshot() {
        let proxy = loaded().await;
        let players = [PlayerId::new(), PlayerId::new(), PlayerId::new()];
        for p in &players {
            proxy.set(*p, CapeState::cape("minecon_2011"), None).await.unwrap();
        }

        let mut conn = connect(&proxy, "lobby").await;
        conn.send(SyncRequest::Resync).await.unwrap();

        match next(&mut conn).await {
            SyncMessage::ResyncStart {
                epoch,
                sequence_number,
                entries,
            } => {
                assert_eq!(epoch, proxy.epoch());
                assert_eq!(sequence_number, 3);
                assert_eq!(entries, 3);
            }
            other => panic!("expected RESYNC_START, got {:?}", other),
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            let entry = next(&mut conn).await;
            seen.push(entry.assignment().unwrap().player);
        }
        seen.sort();
        let mut expected = players.to_vec();
        expected.sort();
        assert_eq!(seen, expected);

        assert!(matches!(
            next(&mut conn).await,
            SyncMessage::ResyncEnd {
                sequence_number: 3,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_live_changes_follow_handshake() {
        let proxy = loaded().await;
        let mut conn = connect(&proxy, "survival").await;
        wait_connected(&proxy, 1).await;

        let player = PlayerId::new();
        proxy.set(player, CapeState::cape("cherry_blossom"), None).await.unwrap();

        let change = next(&mut conn).await;
        assert_eq!(change.kind(), "CHANGE");
        assert_eq!(change.assignment().unwrap().player, player);
    }

    #[tokio::test]
    async fn test_ping_is_answered() {
        let proxy = loaded().await;
        let mut conn = connect(&proxy, "pinger").await;

        conn.send(SyncRequest::Ping { nonce: 42 }).await.unwrap();

        assert_eq!(next(&mut conn).await, SyncMessage::Pong { nonce: 42 });
    }

    #[tokio::test]
    async fn test_forwarded_write_and_conflict() {
        let proxy = loaded().await;
        let mut conn = connect(&proxy, "minigames").await;
        let player = PlayerId::new();

        conn.send(SyncRequest::Assign {
            request_id: 1,
            player_id: player,
            cape_id: Some(CapeId::new("birthday")),
            expected_version: Some(0),
        })
        .await
        .unwrap();

        // The committed change is broadcast to the writer's own session as well;
        // it may arrive before or after the reply.
        let mut reply = None;
        for _ in 0..2 {
            if let SyncMessage::AssignResult {
                request_id,
                assignment,
                error,
            } = next(&mut conn).await
            {
                assert_eq!(request_id, 1);
                assert!(error.is_none());
                reply = assignment;
            }
        }
        assert_eq!(reply.unwrap().version, 1);

        conn.send(SyncRequest::Assign {
            request_id: 2,
            player_id: player,
            cape_id: None,
            expected_version: Some(0),
        })
        .await
        .unwrap();

        match next(&mut conn).await {
            SyncMessage::AssignResult {
                request_id: 2,
                assignment: None,
                error: Some(error),
            } => {
                assert_eq!(error.kind, "conflict");
                assert_eq!(error.current, Some(1));
            }
            other => panic!("expected conflict result, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connection_without_hello_is_closed() {
        let proxy = loaded().await;
        let (transport, acceptor) = MemoryTransport::new("rude");
        tokio::spawn(proxy.clone().serve_memory(acceptor));

        let mut conn = transport.connect().await.unwrap();
        conn.send(SyncRequest::Resync).await.unwrap();

        let closed = tokio::time::timeout(Duration::from_secs(2), conn.recv())
            .await
            .unwrap();
        assert!(closed.is_none());
        assert_eq!(proxy.hub().connected_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_unregisters_node() {
        let proxy = loaded().await;
        let conn = connect(&proxy, "temporary").await;
        wait_connected(&proxy, 1).await;

        drop(conn);

        wait_connected(&proxy, 0).await;
    }

    // ============================================================
    // ADMIN API TESTS
    // ============================================================

    #[tokio::test]
    async fn test_http_assign_and_read_back() {
        let proxy = loaded().await;
        let player = PlayerId::new();

        let Json(assignment) = handle_assign(
            Extension(proxy.clone()),
            Json(AssignRequest {
                player_id: player,
                cape_id: Some(CapeId::new("Translator")),
                expected_version: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(assignment.cape, CapeState::cape("translator"));

        let Json(read) = handle_get_assignment(Extension(proxy.clone()), Path(player.to_string()))
            .await
            .unwrap();
        assert_eq!(read, assignment);

        let Json(history) = handle_get_history(Extension(proxy.clone()), Path(player.to_string()))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_http_error_statuses() {
        let proxy = loaded().await;
        let player = PlayerId::new();

        let (status, _) = handle_get_assignment(Extension(proxy.clone()), Path(player.to_string()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) =
            handle_get_assignment(Extension(proxy.clone()), Path("not-a-uuid".to_string()))
                .await
                .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, Json(body)) = handle_assign(
            Extension(proxy.clone()),
            Json(AssignRequest {
                player_id: player,
                cape_id: Some(CapeId::new("rainbow")),
                expected_version: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.kind, "unknown_cape");

        proxy.set(player, CapeState::NoCape, None).await.unwrap();
        let (status, Json(body)) = handle_assign(
            Extension(proxy.clone()),
            Json(AssignRequest {
                player_id: player,
                cape_id: None,
                expected_version: Some(5),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.expected, Some(5));
        assert_eq!(body.current, Some(1));
    }

    #[tokio::test]
    async fn test_http_changes_and_capes() {
        let proxy = loaded().await;
        for _ in 0..3 {
            proxy
                .set(PlayerId::new(), CapeState::cape("mojang_studios"), None)
                .await
                .unwrap();
        }

        let Json(changes) =
            handle_get_changes(Extension(proxy.clone()), Query(ChangesQuery { from: 2 }))
                .await
                .unwrap();
        assert_eq!(changes.head, 3);
        assert_eq!(
            changes.events.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![2, 3]
        );

        let Json(capes) = handle_list_capes(Extension(proxy.clone())).await;
        assert_eq!(capes.len(), CapeCatalog::builtin().len());
    }
}

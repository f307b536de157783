//! # Store Transport Flows
//!
//! Several buses sharing one store, the way separate processes share one
//! database.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use shared_bus::{MessageStore, TransportKind};

    use crate::fixtures::{score, shared_store, store_config, FlakyStore, Member, ScoreChanged, Wiring};

    const WAIT: Duration = Duration::from_secs(2);

    fn members(count: usize, store: &Arc<dyn MessageStore>) -> Vec<Member> {
        (0..count)
            .map(|_| {
                Member::new(
                    "arena",
                    store_config(20),
                    Wiring {
                        store: Some(store.clone()),
                        ..Wiring::default()
                    },
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_message_reaches_peer_exactly_once() {
        let store = shared_store();
        let mut group = members(2, &store);
        for member in &group {
            member.start().await;
        }
        assert_eq!(group[0].bus.transport_kind(), TransportKind::Store);

        let sent = score("ada", 10);
        assert!(group[0].bus.send(sent.clone()).await);

        let got = group[1].next(WAIT).await.expect("delivered");
        assert_eq!(got.id(), sent.id());
        assert_eq!(got.channel_id(), "arena");
        assert_eq!(
            got.payload_as::<ScoreChanged>(),
            Some(&ScoreChanged {
                player: "ada".into(),
                score: 10
            })
        );

        // Several more polls pass without a second delivery.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(group[1].drain().is_empty());
        assert!(group[0].drain().is_empty());

        for member in &group {
            member.bus.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_other_member() {
        let store = shared_store();
        let mut group = members(3, &store);
        for member in &group {
            member.start().await;
        }

        let sent = score("grace", 3);
        assert!(group[2].bus.send(sent.clone()).await);

        for member in group.iter_mut().take(2) {
            assert_eq!(member.next(WAIT).await.map(|m| m.id()), Some(sent.id()));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(group[2].drain().is_empty());

        for member in &group {
            member.bus.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_history_before_startup_is_not_replayed() {
        let store = shared_store();
        let mut group = members(2, &store);
        group[0].start().await;
        assert!(group[0].bus.send(score("old", 1)).await);

        group[1].start().await;
        let fresh = score("new", 2);
        assert!(group[0].bus.send(fresh.clone()).await);

        assert_eq!(group[1].next(WAIT).await.map(|m| m.id()), Some(fresh.id()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(group[1].drain().is_empty());

        for member in &group {
            member.bus.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_buses_with_different_names_do_not_mix() {
        let store = shared_store();
        let wiring = Wiring {
            store: Some(store.clone()),
            ..Wiring::default()
        };
        let arena = Member::new("arena", store_config(20), wiring.clone());
        let mut lobby = Member::new("lobby", store_config(20), wiring);
        arena.start().await;
        lobby.start().await;

        assert!(arena.bus.send(score("ada", 1)).await);
        assert!(lobby.next(Duration::from_millis(200)).await.is_none());

        arena.bus.shutdown().await;
        lobby.bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_delivery_resumes_after_failed_polls() {
        let flaky = Arc::new(FlakyStore::new(3));
        let store: Arc<dyn MessageStore> = flaky.clone();
        let mut group = members(2, &store);
        for member in &group {
            member.start().await;
        }

        let sent = score("linus", 7);
        assert!(group[0].bus.send(sent.clone()).await);

        assert_eq!(group[1].next(WAIT).await.map(|m| m.id()), Some(sent.id()));
        assert_eq!(flaky.remaining_failures(), 0);

        for member in &group {
            member.bus.shutdown().await;
        }
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_sqlite_file_shared_by_two_buses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bus.db");
        let open = || -> Arc<dyn MessageStore> {
            Arc::new(shared_bus::SqliteStore::open(&path).unwrap())
        };
        let a = Member::new(
            "arena",
            store_config(20),
            Wiring {
                store: Some(open()),
                ..Wiring::default()
            },
        );
        let mut b = Member::new(
            "arena",
            store_config(20),
            Wiring {
                store: Some(open()),
                ..Wiring::default()
            },
        );
        a.start().await;
        b.start().await;

        let sent = score("ken", 42);
        assert!(a.bus.send(sent.clone()).await);
        assert_eq!(b.next(WAIT).await.map(|m| m.id()), Some(sent.id()));

        a.bus.shutdown().await;
        b.bus.shutdown().await;
    }
}

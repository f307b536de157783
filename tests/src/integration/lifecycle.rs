//! # Lifecycle Flows
//!
//! The bus state machine as an embedding application sees it.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use shared_bus::{BusConfig, BusError, BusState, InMemoryStore, MessageStore, TransportError, TransportKind};

    use crate::fixtures::{config_of, score, shared_store, store_config, Member, Wiring};

    fn store_member(store: &Arc<dyn MessageStore>) -> Member {
        Member::new(
            "arena",
            store_config(20),
            Wiring {
                store: Some(store.clone()),
                ..Wiring::default()
            },
        )
    }

    #[tokio::test]
    async fn test_send_while_not_running_is_false_not_error() {
        let store = shared_store();
        let member = store_member(&store);

        assert!(!member.bus.send(score("early", 1)).await);
        member.bus.startup().await.unwrap();
        assert!(!member.bus.send(score("ready", 2)).await);
        member.bus.schedule_tasks().await.unwrap();
        assert!(member.bus.send(score("running", 3)).await);
        member.bus.shutdown().await;
        assert!(!member.bus.send(score("late", 4)).await);

        let stats = member.bus.stats();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.send_failures, 3);
    }

    #[tokio::test]
    async fn test_disabled_bus_ignores_everything() {
        let mut member = Member::new("arena", BusConfig::disabled(), Wiring::default());
        member.start().await;
        assert_eq!(member.bus.state(), BusState::Uninitialized);
        assert!(!member.bus.is_ready());
        assert_eq!(member.bus.transport_kind(), TransportKind::Store);

        assert!(!member.bus.send(score("ghost", 0)).await);
        member.bus.consume(score("ghost", 0));
        assert!(member.drain().is_empty());
        member.bus.shutdown().await;
        assert_eq!(member.bus.state(), BusState::Uninitialized);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_startup() {
        let store = Arc::new(InMemoryStore::new());
        store.set_available(false);
        let store: Arc<dyn MessageStore> = store;
        let member = store_member(&store);

        let err = member.bus.startup().await.unwrap_err();
        assert!(matches!(
            err,
            BusError::Transport(TransportError::Init { kind: TransportKind::Store, .. })
        ));
        assert_eq!(member.bus.state(), BusState::Stopped);
        assert!(!member.bus.send(score("x", 0)).await);
    }

    #[tokio::test]
    async fn test_host_local_without_host_fails_startup() {
        let member = Member::new("arena", config_of("host-local"), Wiring::default());
        let err = member.bus.startup().await.unwrap_err();
        assert!(matches!(
            err,
            BusError::Transport(TransportError::Init { kind: TransportKind::HostLocal, .. })
        ));
        member.bus.shutdown().await;
        assert_eq!(member.bus.state(), BusState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_after_shutdown_delivers_again() {
        let store = shared_store();
        let a = store_member(&store);
        let mut b = store_member(&store);
        a.start().await;
        b.start().await;

        b.bus.shutdown().await;
        assert!(a.bus.send(score("missed", 1)).await);
        tokio::time::sleep(Duration::from_millis(80)).await;

        b.start().await;
        assert_eq!(b.bus.state(), BusState::Running);
        let fresh = score("fresh", 2);
        assert!(a.bus.send(fresh.clone()).await);

        let got = b.next(Duration::from_secs(2)).await.expect("delivered");
        assert_eq!(got.id(), fresh.id());

        a.bus.shutdown().await;
        b.bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_inbound_ignored_after_shutdown() {
        let store = shared_store();
        let mut member = store_member(&store);
        member.start().await;
        member.bus.shutdown().await;

        member.bus.consume(score("late", 9));
        assert!(member.drain().is_empty());
        assert_eq!(member.bus.stats().ignored_not_running, 1);
    }

    #[tokio::test]
    async fn test_shared_bus_handle_across_tasks() {
        let store = shared_store();
        let a = store_member(&store);
        let mut b = store_member(&store);
        a.start().await;
        b.start().await;

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let bus = Arc::clone(&a.bus);
                tokio::spawn(async move { bus.send(score("task", i)).await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        let mut received = 0;
        while b.next(Duration::from_millis(300)).await.is_some() {
            received += 1;
        }
        assert_eq!(received, 4);

        a.bus.shutdown().await;
        b.bus.shutdown().await;
    }
}

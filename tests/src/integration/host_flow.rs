//! # Host-Local Flows
//!
//! Co-hosted buses sharing one [`LocalHostHub`]. Delivery is push based, so
//! every member also hears its own broadcast at the transport level and
//! relies on the dedup cache to drop it.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use shared_bus::{HostChannel, LocalHostHub, TransportKind};

    use crate::fixtures::{config_of, score, Member, Wiring};

    fn member(hub: &Arc<LocalHostHub>, self_delivery: bool) -> Member {
        Member::new(
            "arena",
            config_of("host-local"),
            Wiring {
                host_channel: Some(Arc::new(hub.port()) as Arc<dyn HostChannel>),
                self_delivery,
                ..Wiring::default()
            },
        )
    }

    #[tokio::test]
    async fn test_own_broadcast_is_not_redelivered() {
        let hub = LocalHostHub::new();
        let mut a = member(&hub, false);
        let mut b = member(&hub, false);
        a.start().await;
        b.start().await;
        assert_eq!(a.bus.transport_kind(), TransportKind::HostLocal);

        let sent = score("ada", 1);
        assert!(a.bus.send(sent.clone()).await);

        assert_eq!(
            b.next(Duration::from_secs(1)).await.map(|m| m.id()),
            Some(sent.id())
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a.drain().is_empty());
        assert_eq!(a.bus.stats().duplicates_dropped, 1);
        assert_eq!(b.bus.stats().received, 1);

        a.bus.shutdown().await;
        b.bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_self_delivery_mode_hears_itself() {
        let hub = LocalHostHub::new();
        let mut solo = member(&hub, true);
        solo.start().await;

        let sent = score("echo", 5);
        assert!(solo.bus.send(sent.clone()).await);
        assert_eq!(
            solo.next(Duration::from_secs(1)).await.map(|m| m.id()),
            Some(sent.id())
        );
        solo.bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_releases_the_channel() {
        let hub = LocalHostHub::new();
        let a = member(&hub, false);
        let b = member(&hub, false);
        a.start().await;
        b.start().await;
        assert_eq!(hub.listeners("arena:message"), 2);

        b.bus.shutdown().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hub.listeners("arena:message"), 1);

        let c = member(&hub, false);
        c.start().await;
        assert_eq!(hub.listeners("arena:message"), 2);
        a.bus.shutdown().await;
        c.bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_sends_all_arrive() {
        let hub = LocalHostHub::new();
        let a = member(&hub, false);
        let mut b = member(&hub, false);
        a.start().await;
        b.start().await;

        let sends: Vec<_> = (0..20).map(|i| a.bus.send(score("bulk", i))).collect();
        for send in sends {
            assert!(send.await);
        }

        let mut scores = Vec::new();
        while let Some(message) = b.next(Duration::from_millis(300)).await {
            scores.push(message);
        }
        assert_eq!(scores.len(), 20);

        a.bus.shutdown().await;
        b.bus.shutdown().await;
    }
}

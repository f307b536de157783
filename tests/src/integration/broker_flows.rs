//! # Broker Flows
//!
//! Two buses on each push transport against a broker on localhost with
//! default ports. Ignored unless run with `--ignored`.
//!
//! The reconnect flows put the receiving bus behind a [`SeverableProxy`],
//! cut its connections mid-run and expect delivery to resume on its own.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use shared_bus::{BusState, TransportKind};

    use crate::fixtures::{config_at, config_of, score, Member, SeverableProxy, Wiring};

    const RECONNECT: Duration = Duration::from_millis(200);

    async fn exchange_between_two_members(kind: &str, expected: TransportKind) {
        let a = Member::new("arena", config_of(kind), Wiring::default());
        let mut b = Member::new("arena", config_of(kind), Wiring::default());
        a.start().await;
        b.start().await;
        assert_eq!(a.bus.transport_kind(), expected);

        // Give subscriptions time to settle on the broker.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let sent = score("ada", 1);
        assert!(a.bus.send(sent.clone()).await);
        let got = b.next(Duration::from_secs(3)).await.expect("delivered");
        assert_eq!(got.id(), sent.id());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut a = a;
        assert!(a.drain().is_empty(), "own broadcast must be dropped");

        a.bus.shutdown().await;
        b.bus.shutdown().await;
    }

    #[tokio::test]
    #[ignore = "requires a Redis server on localhost:6379"]
    async fn test_kv_pubsub_exchange() {
        exchange_between_two_members("kv-pubsub", TransportKind::KvPubsub).await;
    }

    #[tokio::test]
    #[ignore = "requires an AMQP broker on localhost:5672"]
    async fn test_amqp_exchange() {
        exchange_between_two_members("amqp", TransportKind::Amqp).await;
    }

    #[tokio::test]
    #[ignore = "requires a NATS server on localhost:4222"]
    async fn test_lightweight_pubsub_exchange() {
        exchange_between_two_members("lightweight-pubsub", TransportKind::LightweightPubsub).await;
    }

    async fn delivery_resumes_after_connection_drop(kind: &str, broker: &str) {
        let proxy = SeverableProxy::start(broker).await.expect("proxy listening");
        let a = Member::new("arena", config_of(kind), Wiring::default());
        let mut b = Member::new(
            "arena",
            config_at(kind, &proxy.address()),
            Wiring {
                reconnect_delay: Some(RECONNECT),
                ..Wiring::default()
            },
        );
        a.start().await;
        b.start().await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let before = score("ada", 1);
        assert!(a.bus.send(before.clone()).await);
        assert_eq!(
            b.next(Duration::from_secs(3)).await.map(|m| m.id()),
            Some(before.id())
        );

        assert!(proxy.sever() > 0);
        // Backoff plus time to resubscribe.
        tokio::time::sleep(RECONNECT + Duration::from_secs(1)).await;
        assert_eq!(b.bus.state(), BusState::Running);

        let after = score("ada", 2);
        assert!(a.bus.send(after.clone()).await);
        let got = b
            .next(Duration::from_secs(3))
            .await
            .expect("delivered after reconnect");
        assert_eq!(got.id(), after.id());

        a.bus.shutdown().await;
        b.bus.shutdown().await;
    }

    #[tokio::test]
    #[ignore = "requires a Redis server on localhost:6379"]
    async fn test_kv_pubsub_resubscribes_after_connection_drop() {
        delivery_resumes_after_connection_drop("kv-pubsub", "127.0.0.1:6379").await;
    }

    #[tokio::test]
    #[ignore = "requires an AMQP broker on localhost:5672"]
    async fn test_amqp_reconnects_after_connection_drop() {
        delivery_resumes_after_connection_drop("amqp", "127.0.0.1:5672").await;
    }

    #[tokio::test]
    async fn test_severed_proxy_closes_live_connections() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let echo = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = echo.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });

        let proxy = SeverableProxy::start(&echo_addr).await.unwrap();
        let mut client = tokio::net::TcpStream::connect(proxy.address()).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert_eq!(proxy.sever(), 1);
        let mut rest = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(1), client.read_to_end(&mut rest)).await;
        assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))));

        let mut again = tokio::net::TcpStream::connect(proxy.address()).await.unwrap();
        again.write_all(b"pong").await.unwrap();
        again.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_unreachable_broker_fails_startup_cleanly() {
        let config = shared_bus::BusConfig::resolve(shared_bus::RawBusConfig {
            transport_type: "kv-pubsub".into(),
            address: Some(serde_json::json!("127.0.0.1:1")),
            ..shared_bus::RawBusConfig::default()
        })
        .unwrap();
        let member = Member::new("arena", config, Wiring::default());

        assert!(member.bus.startup().await.is_err());
        assert_eq!(member.bus.state(), shared_bus::BusState::Stopped);
        member.bus.shutdown().await;
    }
}

//! # Configuration Flows
//!
//! A `[messaging]` document resolved and used to run buses.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use shared_bus::{BusConfig, RawBusConfig, TransportKind};
    use shared_types::ConfigurationError;

    use crate::fixtures::{score, shared_store, Member, Wiring};

    #[tokio::test(start_paused = true)]
    async fn test_clamped_intervals_still_deliver() {
        let config = BusConfig::from_toml_str(
            r#"
            [messaging]
            type = "database"
            polling-interval = 90000
            cleanup-interval = 1000
            "#,
        )
        .unwrap();
        assert_eq!(config.transport_kind(), TransportKind::Store);
        assert_eq!(config.cleanup_interval(), Duration::from_secs(10));
        assert_eq!(config.polling_interval(), Duration::from_millis(3333));

        let store = shared_store();
        let wiring = Wiring {
            store: Some(store),
            ..Wiring::default()
        };
        let a = Member::new("arena", config.clone(), wiring.clone());
        let mut b = Member::new("arena", config, wiring);
        a.start().await;
        b.start().await;

        let sent = score("ada", 1);
        assert!(a.bus.send(sent.clone()).await);
        let got = b.next(Duration::from_secs(4)).await.expect("delivered within one poll");
        assert_eq!(got.id(), sent.id());

        a.bus.shutdown().await;
        b.bus.shutdown().await;
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut raw = RawBusConfig::from_toml_str(
            r#"
            [messaging]
            type = "redis"
            address = "cache:6379"
            password = "from-file"
            "#,
        )
        .unwrap();
        let env: HashMap<&str, &str> = [
            ("BUS_MESSAGING_TYPE", "nats"),
            ("BUS_MESSAGING_ADDRESS", "n1:4222, n2"),
            ("BUS_MESSAGING_PASSWORD", "from-env"),
        ]
        .into_iter()
        .collect();
        raw.apply_env_with(|key| env.get(key).map(|v| v.to_string()));

        let config = BusConfig::resolve(raw).unwrap();
        assert_eq!(config.transport_kind(), TransportKind::LightweightPubsub);
        assert_eq!(config.endpoints().to_connection_strings(), vec!["n1:4222", "n2"]);
        assert_eq!(config.password(), "from-env");
    }

    #[test]
    fn test_unknown_type_falls_back_to_store() {
        let config = BusConfig::from_toml_str("[messaging]\ntype = \"carrier-pigeon\"\n").unwrap();
        assert_eq!(config.transport_kind(), TransportKind::Store);
    }

    #[test]
    fn test_bad_addresses_are_configuration_errors() {
        let err = BusConfig::from_toml_str("[messaging]\naddress = \"cache:70000\"\n").unwrap_err();
        assert_eq!(err, ConfigurationError::PortOutOfRange { port: 70000 });

        let err = BusConfig::from_toml_str("[messaging]\naddress = \":6379\"\n").unwrap_err();
        assert!(matches!(err, ConfigurationError::EmptyHost { .. }));
    }

    #[tokio::test]
    async fn test_disabled_by_file_keeps_bus_inert() {
        let config = BusConfig::from_toml_str("[messaging]\nenabled = false\ntype = \"amqp\"\n").unwrap();
        let member = Member::new("arena", config, Wiring::default());
        member.start().await;
        assert_eq!(member.bus.transport_kind(), TransportKind::Store);
        assert!(!member.bus.send(score("nobody", 0)).await);
    }
}

//! Connection lifecycle and room reconciliation tests

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use parking_lot::Mutex;
    use realm_comms::{
        loopback::{Establish, LoopbackFactory, LoopbackHub},
        protocol::{encode, ChatData, CommsMessage},
        transport::InboundPacket,
        CommsError, ConnectionState, PeerId, Position, ProtocolVersion, Realm,
        WorldInstanceConnection,
    };
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::Duration;

    fn realm(host: &str) -> Realm {
        Realm::new(ProtocolVersion::V2, host, host)
    }

    fn connection(
        hub: &Arc<LoopbackHub>,
        peer: &str,
    ) -> (Arc<LoopbackFactory>, Arc<WorldInstanceConnection>) {
        let factory = Arc::new(LoopbackFactory::new(hub.clone(), peer));
        let conn = Arc::new(WorldInstanceConnection::new(factory.clone()));
        (factory, conn)
    }

    fn rooms(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn chat_packet(generation: u64) -> InboundPacket {
        InboundPacket {
            generation,
            sender: PeerId::new("bob"),
            room: "37:37".into(),
            payload: encode(
                1.0,
                &CommsMessage::Chat(ChatData {
                    message_id: "m1".into(),
                    text: "hi".into(),
                }),
            ),
        }
    }

    // -----------------------------------------------------------------------
    // Room reconciliation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn setting_the_same_topics_twice_does_nothing_the_second_time() {
        let hub = LoopbackHub::new();
        let (factory, conn) = connection(&hub, "me");
        conn.change_realm(realm("r")).await.unwrap();

        let first = conn.set_topics(["1:1", "1:2"]).await;
        assert_eq!(first.joined.len(), 2);

        let second = conn.set_topics(["1:2", "1:1"]).await;
        assert!(second.is_noop());

        let transport = &factory.live()[0];
        assert_eq!(transport.join_calls(), 2);
        assert_eq!(transport.leave_calls(), 0);
        assert_eq!(conn.joined_rooms(), rooms(&["1:1", "1:2"]));
    }

    #[tokio::test]
    async fn concurrent_reconciliation_joins_each_room_once() {
        let hub = LoopbackHub::new();
        let (factory, conn) = connection(&hub, "me");
        conn.change_realm(realm("r")).await.unwrap();

        let (a, b) = futures::join!(conn.set_topics(["5:5"]), conn.set_topics(["5:5"]));
        assert_eq!(a.joined.len() + b.joined.len(), 1);
        assert_eq!(factory.live()[0].join_calls(), 1);
        assert_eq!(conn.joined_rooms(), rooms(&["5:5"]));
    }

    #[tokio::test]
    async fn moving_leaves_old_rooms_and_joins_new_ones() {
        let hub = LoopbackHub::new();
        let (_factory, conn) = connection(&hub, "me");
        conn.change_realm(realm("r")).await.unwrap();

        conn.set_topics(["1:1", "1:2"]).await;
        let report = conn.set_topics(["1:2", "1:3"]).await;
        assert_eq!(report.joined, vec!["1:3".to_string()]);
        assert_eq!(report.left, vec!["1:1".to_string()]);
        assert_eq!(conn.joined_rooms(), rooms(&["1:2", "1:3"]));
    }

    #[tokio::test]
    async fn refused_join_does_not_break_the_others() {
        let hub = LoopbackHub::new();
        let (factory, conn) = connection(&hub, "me");
        factory.fail_joins_for("bad");
        conn.change_realm(realm("r")).await.unwrap();

        let report = conn.set_topics(["good", "bad"]).await;
        assert_eq!(report.joined, vec!["good".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "bad");
        assert_eq!(conn.joined_rooms(), rooms(&["good"]));
        assert_eq!(conn.status().state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn desired_topics_are_rejoined_after_realm_change() {
        let hub = LoopbackHub::new();
        let (factory, conn) = connection(&hub, "me");
        conn.change_realm(realm("a")).await.unwrap();
        conn.set_topics(["7:7"]).await;

        conn.change_realm(realm("b")).await.unwrap();
        assert_eq!(factory.live().len(), 1);
        assert_eq!(conn.joined_rooms(), rooms(&["7:7"]));
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn sending_to_a_room_just_left_is_not_an_error() {
        let hub = LoopbackHub::new();
        let (_factory, conn) = connection(&hub, "me");
        conn.change_realm(realm("r")).await.unwrap();
        conn.set_topics(["2:2"]).await;
        conn.set_topics(Vec::<String>::new()).await;

        conn.send_chat("2:2", "anyone?").await.unwrap();
        assert_eq!(conn.status().state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn chat_reaches_a_peer_in_the_same_room() {
        let hub = LoopbackHub::new();
        let (_fa, alice) = connection(&hub, "alice");
        let (_fb, bob) = connection(&hub, "bob");
        alice.change_realm(realm("r")).await.unwrap();
        bob.change_realm(realm("r")).await.unwrap();
        alice.set_topics(["37:37"]).await;
        bob.set_topics(["37:37"]).await;

        let received = Arc::new(Mutex::new(Vec::new()));
        {
            let received = received.clone();
            bob.on_chat(move |pkg| received.lock().push((pkg.sender, pkg.data.text)));
        }

        let id = alice.send_chat("37:37", "hello").await.unwrap();
        assert!(!id.is_empty());
        assert_eq!(bob.process_pending(), 1);
        assert_eq!(
            *received.lock(),
            vec![(PeerId::new("alice"), "hello".to_string())]
        );
        assert_eq!(alice.connected_peers(), 1);
    }

    #[tokio::test]
    async fn optimistic_kinds_may_be_dropped_under_load_but_chat_is_not() {
        let hub = LoopbackHub::new();
        let (_fa, alice) = connection(&hub, "alice");
        let (_fb, bob) = connection(&hub, "bob");
        alice.change_realm(realm("r")).await.unwrap();
        bob.change_realm(realm("r")).await.unwrap();
        alice.set_topics(["37:37"]).await;
        bob.set_topics(["37:37"]).await;

        let positions = Arc::new(Mutex::new(0));
        let chats = Arc::new(Mutex::new(Vec::new()));
        {
            let positions = positions.clone();
            bob.on_position(move |_| *positions.lock() += 1);
            let chats = chats.clone();
            bob.on_chat(move |pkg| chats.lock().push(pkg.data.text));
        }

        hub.set_drop_optimistic(true);
        alice
            .send("37:37", &CommsMessage::Position(Position::new(1.0, 0.0, 1.0)))
            .await
            .unwrap();
        alice
            .send(
                "37:37",
                &CommsMessage::Chat(ChatData {
                    message_id: "m2".into(),
                    text: "still here".into(),
                }),
            )
            .await
            .unwrap();

        assert_eq!(bob.process_pending(), 1);
        assert_eq!(*positions.lock(), 0);
        assert_eq!(*chats.lock(), vec!["still here".to_string()]);

        hub.set_drop_optimistic(false);
        alice
            .send("37:37", &CommsMessage::Position(Position::new(2.0, 0.0, 2.0)))
            .await
            .unwrap();
        assert_eq!(bob.process_pending(), 1);
        assert_eq!(*positions.lock(), 1);
    }

    // -----------------------------------------------------------------------
    // Realm changes
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn realm_change_during_pending_connect_leaves_one_transport() {
        let hub = LoopbackHub::new();
        let (factory, conn) = connection(&hub, "me");
        factory.set_behavior("stuck", Establish::Never);

        let first = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.change_realm(realm("stuck")).await })
        };
        while factory.opened().is_empty() {
            tokio::task::yield_now().await;
        }

        conn.change_realm(realm("fine")).await.unwrap();

        assert!(matches!(first.await.unwrap(), Err(CommsError::Superseded)));
        let opened = factory.opened();
        assert_eq!(opened.len(), 2);
        assert!(opened[0].is_disposed());
        assert_eq!(factory.live().len(), 1);
        assert_eq!(conn.realm(), Some(realm("fine")));
        assert_eq!(conn.status().state, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_realm_times_out_into_error() {
        let hub = LoopbackHub::new();
        let factory = Arc::new(LoopbackFactory::new(hub, "me"));
        factory.set_behavior("void", Establish::Never);
        let conn = WorldInstanceConnection::with_timeout(factory, Duration::from_secs(60));

        let err = conn.change_realm(realm("void")).await.unwrap_err();
        assert!(matches!(err, CommsError::Connection(_)));
        assert_eq!(conn.status().state, ConnectionState::Error);
    }

    #[tokio::test]
    async fn connect_with_live_peers_returns_without_reopening() {
        let hub = LoopbackHub::new();
        let (factory, alice) = connection(&hub, "alice");
        let (_fb, bob) = connection(&hub, "bob");
        alice.change_realm(realm("r")).await.unwrap();
        bob.change_realm(realm("r")).await.unwrap();

        alice.connect().await.unwrap();
        let status = alice.status();
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.connected_peers, 1);
        assert_eq!(factory.opened().len(), 1);
        assert_eq!(alice.connected_peers(), 1);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let hub = LoopbackHub::new();
        let (factory, conn) = connection(&hub, "me");
        conn.change_realm(realm("r")).await.unwrap();

        conn.disconnect().await;
        conn.disconnect().await;
        assert!(factory.live().is_empty());
        assert_eq!(conn.status().state, ConnectionState::Disconnected);
        assert_eq!(conn.realm(), None);
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn bad_packets_are_dropped_without_side_effects() {
        let hub = LoopbackHub::new();
        let (_factory, conn) = connection(&hub, "me");
        conn.change_realm(realm("r")).await.unwrap();
        conn.on_chat(|_| {});
        let generation = conn.generation();

        assert!(conn.handle_packet(chat_packet(generation)));
        assert!(!conn.handle_packet(chat_packet(generation - 1)));

        let mut malformed = chat_packet(generation);
        malformed.payload = Bytes::from_static(&[1, 0, 0]);
        assert!(!conn.handle_packet(malformed));

        let mut unknown = chat_packet(generation);
        unknown.payload = Bytes::from_static(&[99, 1, 2, 3]);
        assert!(!conn.handle_packet(unknown));

        let mut empty = chat_packet(generation);
        empty.payload = Bytes::new();
        assert!(!conn.handle_packet(empty));

        assert_eq!(conn.status().state, ConnectionState::Connected);
    }
}

//! Realm discovery and priority tests

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use realm_comms::{
        cache::{MemoryCache, RealmCache},
        candidates::{filter_by_min_version, StaticCandidateSource},
        connection::WorldInstanceConnection,
        loopback::{LoopbackFactory, LoopbackHub},
        saga::{CommsPhase, Gates, RealmSaga, SessionRequest},
        selection::RealmPinger,
        Candidate, CommsConfig, ProtocolVersion, Realm,
    };
    use std::sync::Arc;

    fn candidate(host: &str, version: &str, protocol: ProtocolVersion) -> Candidate {
        Candidate {
            realm: Realm::new(protocol, host, host),
            users_count: 1,
            max_users: Some(100),
            version: version.into(),
            elapsed_ms: 30,
            users_parcels: vec![],
        }
    }

    /// Answers pings for a fixed set of hosts and records every ping.
    #[derive(Default)]
    struct ScriptedPinger {
        reachable: Vec<String>,
        pinged: Mutex<Vec<String>>,
    }

    impl ScriptedPinger {
        fn reaching(hosts: &[&str]) -> Self {
            Self {
                reachable: hosts.iter().map(|h| h.to_string()).collect(),
                pinged: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RealmPinger for ScriptedPinger {
        async fn ping(&self, realm: &Realm) -> bool {
            self.pinged.lock().push(realm.hostname.clone());
            self.reachable.contains(&realm.hostname)
        }
    }

    struct Session {
        saga: RealmSaga,
        source: Arc<StaticCandidateSource>,
        cache: Arc<MemoryCache>,
        pinger: Arc<ScriptedPinger>,
    }

    fn session(candidates: Vec<Candidate>, pinger: ScriptedPinger) -> Session {
        let source = Arc::new(StaticCandidateSource::new(candidates));
        let cache = Arc::new(MemoryCache::new());
        let pinger = Arc::new(pinger);
        let factory = Arc::new(LoopbackFactory::new(LoopbackHub::new(), "me"));
        let saga = RealmSaga::new(
            CommsConfig::default(),
            source.clone(),
            cache.clone(),
            pinger.clone(),
            Arc::new(WorldInstanceConnection::new(factory)),
            Arc::new(Gates::ready()),
        );
        Session {
            saga,
            source,
            cache,
            pinger,
        }
    }

    fn request(realm: Option<&str>) -> SessionRequest {
        SessionRequest {
            realm_param: realm.map(str::to_string),
            ..Default::default()
        }
    }

    // -----------------------------------------------------------------------
    // Version filter
    // -----------------------------------------------------------------------

    #[test]
    fn only_candidates_at_min_version_survive() {
        let kept = filter_by_min_version(
            vec![
                candidate("A", "1.0", ProtocolVersion::V2),
                candidate("B", "0.5", ProtocolVersion::V2),
            ],
            "1.0",
            &[],
        );
        let hosts: Vec<_> = kept.iter().map(|c| c.realm.hostname.as_str()).collect();
        assert_eq!(hosts, vec!["A"]);
    }

    #[test]
    fn pinned_host_below_min_version_survives() {
        let kept = filter_by_min_version(
            vec![
                candidate("A", "1.0", ProtocolVersion::V2),
                candidate("B", "0.5", ProtocolVersion::V2),
            ],
            "1.0",
            &["B".to_string()],
        );
        assert_eq!(kept.len(), 2);
    }

    #[tokio::test]
    async fn outdated_candidate_is_never_selected() {
        let s = session(
            vec![
                candidate("old", "0.9.9", ProtocolVersion::V1),
                candidate("new", "1.2.0", ProtocolVersion::V1),
            ],
            ScriptedPinger::default(),
        );
        // Asking for it by name does not bring it back.
        let realm = s.saga.resolve_realm(&request(Some("old"))).await.unwrap();
        assert_eq!(realm.hostname, "new");
        assert_eq!(s.saga.candidates().len(), 1);
    }

    // -----------------------------------------------------------------------
    // Priority
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn query_param_beats_cached_realm() {
        let s = session(
            vec![
                candidate("A", "1.0", ProtocolVersion::V2),
                candidate("B", "1.0", ProtocolVersion::V2),
            ],
            ScriptedPinger::reaching(&["B"]),
        );
        s.cache
            .save_realm("mainnet", &Realm::new(ProtocolVersion::V2, "A", "A"))
            .unwrap();

        let realm = s.saga.start(request(Some("B"))).await.unwrap();
        assert_eq!(realm.hostname, "B");
        assert_eq!(*s.pinger.pinged.lock(), vec!["B".to_string()]);
        assert_eq!(s.saga.gates().phase(), CommsPhase::Established(realm.clone()));
        assert_eq!(s.cache.load_realm("mainnet").unwrap(), Some(realm));
    }

    #[tokio::test]
    async fn unreachable_v2_query_param_falls_back_to_cache() {
        let s = session(
            vec![
                candidate("A", "1.0", ProtocolVersion::V2),
                candidate("B", "1.0", ProtocolVersion::V2),
            ],
            ScriptedPinger::reaching(&[]),
        );
        s.cache
            .save_realm("mainnet", &Realm::new(ProtocolVersion::V2, "A", "A"))
            .unwrap();

        let realm = s.saga.resolve_realm(&request(Some("B"))).await.unwrap();
        assert_eq!(realm.hostname, "A");
    }

    #[tokio::test]
    async fn v1_query_param_is_not_pinged() {
        let s = session(
            vec![candidate("legacy", "1.0", ProtocolVersion::V1)],
            ScriptedPinger::reaching(&[]),
        );
        let realm = s.saga.resolve_realm(&request(Some("legacy"))).await.unwrap();
        assert_eq!(realm.hostname, "legacy");
        assert!(s.pinger.pinged.lock().is_empty());
    }

    #[tokio::test]
    async fn cached_realm_is_used_without_candidate_scan() {
        let s = session(
            vec![candidate("A", "1.0", ProtocolVersion::V2)],
            ScriptedPinger::default(),
        );
        let cached = Realm::new(ProtocolVersion::V1, "gone.example", "gone");
        s.cache.save_realm("mainnet", &cached).unwrap();

        let realm = s.saga.start(request(None)).await.unwrap();
        // Taken as-is, even though no live candidate matches it.
        assert_eq!(realm, cached);
        assert_eq!(s.source.fetch_count(), 0);
    }

    #[tokio::test]
    async fn algorithm_picks_when_nothing_else_applies() {
        let mut busy = candidate("busy", "1.0", ProtocolVersion::V2);
        busy.users_count = 90;
        let s = session(
            vec![busy, candidate("calm", "1.0", ProtocolVersion::V2)],
            ScriptedPinger::default(),
        );
        let realm = s.saga.resolve_realm(&request(Some("unknown"))).await.unwrap();
        assert_eq!(realm.hostname, "calm");
        assert_eq!(s.source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn fetch_failure_with_nothing_cached_is_fatal() {
        let s = session(vec![], ScriptedPinger::default());
        s.source.set_failing(true);

        let err = s.saga.start(request(None)).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(s.saga.gates().phase(), CommsPhase::Failed(_)));
        assert_eq!(s.cache.load_candidates("mainnet").unwrap(), None);
    }
}

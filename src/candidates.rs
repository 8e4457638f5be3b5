//! Realm candidate repository.
//!
//! Discovers catalyst nodes and measures their live telemetry.
//!
//! ## HTTP contract
//!
//! | Request                 | Response                                           |
//! |-------------------------|----------------------------------------------------|
//! | `GET {endpoint}`        | `[{ "baseUrl": "https://node" }, ...]`             |
//! | `GET {host}/about`      | status document, see [`AboutResponse`]             |
//!
//! A host that is unreachable, unhealthy or speaks an unknown comms protocol
//! is skipped. Only when *every* host fails does a status fetch return
//! [`CommsError::Network`].
//!
//! ## Version filter
//!
//! Versions compare numerically as `major.minor.patch`. Missing components
//! count as zero and pre-release or build suffixes are ignored. Pinned hosts
//! bypass the filter entirely.

use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use serde::Deserialize;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};

use crate::error::{CommsError, Result};
use crate::types::{Candidate, Parcel, ProtocolVersion, Realm};

#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Full scan: node list from `endpoint`, then every node's status.
    async fn fetch_candidates(&self, endpoint: &str) -> Result<Vec<Candidate>>;

    /// Status refresh for an already known set of hosts.
    async fn fetch_statuses(&self, hosts: &[String]) -> Result<Vec<Candidate>>;
}

// ---------------------------------------------------------------------------
// Status documents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEntry {
    pub base_url: String,
}

/// `GET {host}/about`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AboutResponse {
    #[serde(default = "default_healthy")]
    pub healthy: bool,
    #[serde(default)]
    pub configurations: AboutConfigurations,
    pub comms: AboutComms,
    #[serde(default)]
    pub content: Option<AboutContent>,
}

fn default_healthy() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AboutConfigurations {
    #[serde(default)]
    pub realm_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AboutComms {
    pub protocol: String,
    #[serde(default)]
    pub users_count: u32,
    #[serde(default)]
    pub max_users: Option<u32>,
    #[serde(default)]
    pub layer: Option<String>,
    /// `[x, y]` parcel of every connected user.
    #[serde(default)]
    pub users_parcels: Vec<[i32; 2]>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AboutContent {
    pub version: String,
}

fn parse_protocol(protocol: &str) -> Option<ProtocolVersion> {
    match protocol.trim().to_ascii_lowercase().as_str() {
        "v1" => Some(ProtocolVersion::V1),
        "v2" => Some(ProtocolVersion::V2),
        _ => None,
    }
}

/// Normalize a node URL so hosts compare equal regardless of trailing slash.
pub fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('/').to_string()
}

/// Turn a status document into a candidate; `None` for unusable hosts.
pub fn candidate_from_about(
    host: &str,
    about: AboutResponse,
    elapsed_ms: u64,
) -> Option<Candidate> {
    if !about.healthy {
        debug!("Skipping unhealthy catalyst {}", host);
        return None;
    }
    let Some(protocol) = parse_protocol(&about.comms.protocol) else {
        debug!(
            "Skipping catalyst {} with unsupported comms protocol '{}'",
            host, about.comms.protocol
        );
        return None;
    };

    let hostname = normalize_host(host);
    let server_name = about
        .configurations
        .realm_name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| hostname.clone());
    let mut realm = Realm::new(protocol, hostname, server_name);
    realm.layer = about.comms.layer;

    Some(Candidate {
        realm,
        users_count: about.comms.users_count,
        max_users: about.comms.max_users,
        version: about.content.map(|c| c.version).unwrap_or_default(),
        elapsed_ms,
        users_parcels: about
            .comms
            .users_parcels
            .into_iter()
            .map(|[x, y]| Parcel::new(x, y))
            .collect(),
    })
}

// ---------------------------------------------------------------------------
// Version filter
// ---------------------------------------------------------------------------

/// `"5.1"` → `(5, 1, 0)`, `"v3.2.1-beta"` → `(3, 2, 1)`.
pub fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let version = version.trim();
    let version = version.strip_prefix(['v', 'V']).unwrap_or(version);
    let core = version.split(['-', '+']).next().unwrap_or_default();
    if core.is_empty() {
        return None;
    }

    let mut parts = [0u64; 3];
    for (i, part) in core.split('.').take(3).enumerate() {
        parts[i] = part.parse().ok()?;
    }
    Some((parts[0], parts[1], parts[2]))
}

/// `None` when either side is unparseable.
pub fn compare_versions(a: &str, b: &str) -> Option<Ordering> {
    Some(parse_version(a)?.cmp(&parse_version(b)?))
}

fn is_pinned(candidate: &Candidate, pinned_hosts: &[String]) -> bool {
    let host = normalize_host(&candidate.realm.hostname);
    pinned_hosts
        .iter()
        .any(|pinned| normalize_host(pinned).eq_ignore_ascii_case(&host))
}

/// Keep candidates at or above `min_version`, plus every pinned host.
pub fn filter_by_min_version(
    candidates: Vec<Candidate>,
    min_version: &str,
    pinned_hosts: &[String],
) -> Vec<Candidate> {
    if parse_version(min_version).is_none() {
        warn!(
            "Ignoring unparseable minimum catalyst version '{}'",
            min_version
        );
        return candidates;
    }

    candidates
        .into_iter()
        .filter(|candidate| {
            if is_pinned(candidate, pinned_hosts) {
                return true;
            }
            match compare_versions(&candidate.version, min_version) {
                Some(Ordering::Less) => {
                    debug!(
                        "Dropping {} (version {} < {})",
                        candidate.realm.hostname, candidate.version, min_version
                    );
                    false
                }
                Some(_) => true,
                None => {
                    debug!(
                        "Dropping {} (unparseable version '{}')",
                        candidate.realm.hostname, candidate.version
                    );
                    false
                }
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// HTTP source
// ---------------------------------------------------------------------------

#[cfg(feature = "http")]
pub use http::{HttpCandidateSource, HttpRealmPinger};

#[cfg(feature = "http")]
mod http {
    use super::*;
    use crate::selection::RealmPinger;
    use futures::future::join_all;
    use std::time::{Duration, Instant};

    pub struct HttpCandidateSource {
        client: reqwest::Client,
    }

    impl HttpCandidateSource {
        /// `status_timeout` bounds every individual request.
        pub fn new(status_timeout: Duration) -> Result<Self> {
            let client = reqwest::Client::builder()
                .timeout(status_timeout)
                .build()
                .map_err(|e| CommsError::Network(e.to_string()))?;
            Ok(Self { client })
        }

        async fn fetch_nodes(&self, endpoint: &str) -> Result<Vec<String>> {
            let response = self
                .client
                .get(endpoint)
                .send()
                .await
                .map_err(|e| CommsError::Network(format!("{}: {}", endpoint, e)))?;
            let status = response.status();
            if !status.is_success() {
                return Err(CommsError::Network(format!(
                    "{} answered {}",
                    endpoint, status
                )));
            }
            let nodes: Vec<NodeEntry> = response
                .json()
                .await
                .map_err(|e| CommsError::Network(format!("{}: {}", endpoint, e)))?;
            Ok(nodes.into_iter().map(|n| normalize_host(&n.base_url)).collect())
        }

        async fn fetch_status(&self, host: &str) -> Result<Option<Candidate>> {
            let url = format!("{}/about", normalize_host(host));
            let started = Instant::now();
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| CommsError::Network(format!("{}: {}", url, e)))?;
            let status = response.status();
            if !status.is_success() {
                return Err(CommsError::Network(format!("{} answered {}", url, status)));
            }
            let about: AboutResponse = response
                .json()
                .await
                .map_err(|e| CommsError::Network(format!("{}: {}", url, e)))?;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            Ok(candidate_from_about(host, about, elapsed_ms))
        }
    }

    #[async_trait]
    impl CandidateSource for HttpCandidateSource {
        async fn fetch_candidates(&self, endpoint: &str) -> Result<Vec<Candidate>> {
            let hosts = self.fetch_nodes(endpoint).await?;
            debug!("{} lists {} catalysts", endpoint, hosts.len());
            self.fetch_statuses(&hosts).await
        }

        async fn fetch_statuses(&self, hosts: &[String]) -> Result<Vec<Candidate>> {
            if hosts.is_empty() {
                return Ok(Vec::new());
            }

            let results = join_all(hosts.iter().map(|host| self.fetch_status(host))).await;

            let mut candidates = Vec::new();
            let mut failures = 0;
            for (host, result) in hosts.iter().zip(results) {
                match result {
                    Ok(Some(candidate)) => candidates.push(candidate),
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Status fetch for {} failed: {}", host, e);
                        failures += 1;
                    }
                }
            }

            if failures == hosts.len() {
                return Err(CommsError::Network(format!(
                    "all {} catalysts unreachable",
                    failures
                )));
            }
            Ok(candidates)
        }
    }

    /// Pings a realm by fetching its status document.
    pub struct HttpRealmPinger {
        client: reqwest::Client,
    }

    impl HttpRealmPinger {
        pub fn new(timeout: Duration) -> Result<Self> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| CommsError::Network(e.to_string()))?;
            Ok(Self { client })
        }
    }

    #[async_trait]
    impl RealmPinger for HttpRealmPinger {
        async fn ping(&self, realm: &Realm) -> bool {
            let url = format!("{}/about", normalize_host(&realm.hostname));
            match self.client.get(&url).send().await {
                Ok(response) => response.status().is_success(),
                Err(e) => {
                    debug!("Ping {} failed: {}", url, e);
                    false
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Static source
// ---------------------------------------------------------------------------

/// Serves a fixed candidate list; counts fetches and can be told to fail.
#[derive(Default)]
pub struct StaticCandidateSource {
    candidates: Mutex<Vec<Candidate>>,
    fetches: AtomicUsize,
    failing: AtomicBool,
}

impl StaticCandidateSource {
    pub fn new(candidates: Vec<Candidate>) -> Self {
        Self {
            candidates: Mutex::new(candidates),
            ..Default::default()
        }
    }

    pub fn set_candidates(&self, candidates: Vec<Candidate>) {
        *self.candidates.lock() = candidates;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, AtomicOrdering::SeqCst);
    }

    /// Number of fetch calls served so far, failed ones included.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(AtomicOrdering::SeqCst)
    }

    fn begin_fetch(&self) -> Result<()> {
        self.fetches.fetch_add(1, AtomicOrdering::SeqCst);
        if self.failing.load(AtomicOrdering::SeqCst) {
            return Err(CommsError::Network("static source set to fail".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CandidateSource for StaticCandidateSource {
    async fn fetch_candidates(&self, _endpoint: &str) -> Result<Vec<Candidate>> {
        self.begin_fetch()?;
        Ok(self.candidates.lock().clone())
    }

    async fn fetch_statuses(&self, hosts: &[String]) -> Result<Vec<Candidate>> {
        self.begin_fetch()?;
        let wanted: Vec<String> = hosts.iter().map(|h| normalize_host(h)).collect();
        Ok(self
            .candidates
            .lock()
            .iter()
            .filter(|c| wanted.contains(&normalize_host(&c.realm.hostname)))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(host: &str, version: &str) -> Candidate {
        Candidate {
            realm: Realm::new(ProtocolVersion::V2, host, host),
            users_count: 0,
            max_users: None,
            version: version.into(),
            elapsed_ms: 10,
            users_parcels: vec![],
        }
    }

    #[test]
    fn versions_compare_numerically() {
        assert_eq!(parse_version("5.1"), Some((5, 1, 0)));
        assert_eq!(parse_version("v3.2.1-beta.4"), Some((3, 2, 1)));
        assert_eq!(parse_version("1.2.3+build7"), Some((1, 2, 3)));
        assert_eq!(parse_version("nope"), None);
        assert_eq!(parse_version(""), None);
        assert_eq!(compare_versions("1.10.0", "1.9.9"), Some(Ordering::Greater));
        assert_eq!(compare_versions("1.0", "1.0.0"), Some(Ordering::Equal));
        assert_eq!(compare_versions("x", "1.0"), None);
    }

    #[test]
    fn filter_drops_old_and_unparseable_versions() {
        let kept = filter_by_min_version(
            vec![
                candidate("a", "1.0"),
                candidate("b", "0.5"),
                candidate("c", "garbage"),
                candidate("d", "2.0.0-rc1"),
            ],
            "1.0",
            &[],
        );
        let hosts: Vec<_> = kept.iter().map(|c| c.realm.hostname.as_str()).collect();
        assert_eq!(hosts, vec!["a", "d"]);
    }

    #[test]
    fn pinned_hosts_bypass_the_filter() {
        let kept = filter_by_min_version(
            vec![candidate("https://b.org", "0.5"), candidate("c", "garbage")],
            "1.0",
            &["https://b.org/".to_string(), "C".to_string()],
        );
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn about_document_becomes_candidate() {
        let about: AboutResponse = serde_json::from_str(
            r#"{
                "healthy": true,
                "configurations": { "realmName": "zeus" },
                "comms": {
                    "protocol": "v2",
                    "usersCount": 12,
                    "maxUsers": 100,
                    "usersParcels": [[0, 0], [-3, 7]]
                },
                "content": { "version": "5.1.0" }
            }"#,
        )
        .unwrap();
        let c = candidate_from_about("https://zeus.org/", about, 42).unwrap();
        assert_eq!(c.realm.server_name, "zeus");
        assert_eq!(c.realm.hostname, "https://zeus.org");
        assert_eq!(c.realm.protocol, ProtocolVersion::V2);
        assert_eq!(c.users_count, 12);
        assert_eq!(c.max_users, Some(100));
        assert_eq!(c.version, "5.1.0");
        assert_eq!(c.elapsed_ms, 42);
        assert_eq!(c.users_parcels[1], Parcel::new(-3, 7));
    }

    #[test]
    fn unhealthy_or_unknown_protocol_hosts_are_skipped() {
        let unhealthy: AboutResponse =
            serde_json::from_str(r#"{"healthy": false, "comms": {"protocol": "v2"}}"#).unwrap();
        assert!(candidate_from_about("h", unhealthy, 1).is_none());

        let unknown: AboutResponse =
            serde_json::from_str(r#"{"comms": {"protocol": "v9"}}"#).unwrap();
        assert!(candidate_from_about("h", unknown, 1).is_none());
    }

    #[test]
    fn static_source_counts_and_fails_on_demand() {
        let source = StaticCandidateSource::new(vec![candidate("a", "1.0"), candidate("b", "1.0")]);
        let all = tokio_test::block_on(source.fetch_candidates("ignored")).unwrap();
        assert_eq!(all.len(), 2);

        let some = tokio_test::block_on(source.fetch_statuses(&["b/".to_string()])).unwrap();
        assert_eq!(some.len(), 1);

        source.set_failing(true);
        assert!(matches!(
            tokio_test::block_on(source.fetch_candidates("ignored")),
            Err(CommsError::Network(_))
        ));
        assert_eq!(source.fetch_count(), 3);
    }
}

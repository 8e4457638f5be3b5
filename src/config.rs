//! Layered configuration.
//!
//! Sources, lowest priority first:
//!
//! 1. built-in defaults,
//! 2. an optional TOML file,
//! 3. `REALM_COMMS_*` environment variables,
//! 4. CLI flags (applied by the binary).
//!
//! | Key                    | Default                    | Description                          |
//! |------------------------|----------------------------|--------------------------------------|
//! | `network_id`           | `mainnet`                  | Cache namespace                      |
//! | `candidates_endpoint`  | catalyst server list       | Node list URL                        |
//! | `min_catalyst_version` | `1.0.0`                    | Version filter floor                 |
//! | `pinned_hosts`         | `[]`                       | Hosts exempt from the version filter |
//! | `selection_algorithm`  | unset (default chain)      | JSON strategy list                   |
//! | `connect_timeout_ms`   | `60000`                    | Transport establishment bound        |
//! | `status_timeout_ms`    | `5000`                     | Per-host status request bound        |
//! | `cache_dir`            | `.realm-comms`             | [`JsonFileCache`] directory          |
//! | `island_radius`        | `1`                        | Neighbouring islands to subscribe    |
//! | `peer_timeout_ms`      | `30000`                    | Silence before a peer is expired     |
//!
//! [`JsonFileCache`]: crate::cache::JsonFileCache

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::selection::SelectionAlgorithm;

pub const ENV_PREFIX: &str = "REALM_COMMS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommsConfig {
    pub network_id: String,
    pub candidates_endpoint: String,
    pub min_catalyst_version: String,
    pub pinned_hosts: Vec<String>,
    /// JSON list of strategies; see [`SelectionAlgorithm::from_json`].
    pub selection_algorithm: Option<String>,
    pub connect_timeout_ms: u64,
    pub status_timeout_ms: u64,
    pub cache_dir: PathBuf,
    pub island_radius: u32,
    pub peer_timeout_ms: u64,
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self {
            network_id: "mainnet".into(),
            candidates_endpoint: "https://peer.decentraland.org/lambdas/contracts/servers".into(),
            min_catalyst_version: "1.0.0".into(),
            pinned_hosts: Vec::new(),
            selection_algorithm: None,
            connect_timeout_ms: 60_000,
            status_timeout_ms: 5_000,
            cache_dir: PathBuf::from(".realm-comms"),
            island_radius: 1,
            peer_timeout_ms: 30_000,
        }
    }
}

impl CommsConfig {
    /// Defaults, then `path` (if given), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("pinned_hosts"),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn selection(&self) -> SelectionAlgorithm {
        match &self.selection_algorithm {
            Some(json) => SelectionAlgorithm::from_json(json),
            None => SelectionAlgorithm::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::StrategyConfig;

    #[test]
    fn defaults_without_sources() {
        let config = CommsConfig::load(None).unwrap();
        assert_eq!(config.connect_timeout(), Duration::from_secs(60));
        assert_eq!(config.selection(), SelectionAlgorithm::default());
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("comms.toml");
        std::fs::write(
            &path,
            r#"
network_id = "testnet"
pinned_hosts = ["https://b.org"]
island_radius = 2
selection_algorithm = '[{"type": "LowestLatency"}]'
"#,
        )
        .unwrap();

        let config = CommsConfig::load(Some(&path)).unwrap();
        assert_eq!(config.network_id, "testnet");
        assert_eq!(config.pinned_hosts, vec!["https://b.org".to_string()]);
        assert_eq!(config.island_radius, 2);
        assert_eq!(config.status_timeout_ms, 5_000);
        assert_eq!(
            config.selection().strategies(),
            &[StrategyConfig::LowestLatency]
        );
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CommsConfig::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, crate::error::CommsError::Config(_)));
    }
}

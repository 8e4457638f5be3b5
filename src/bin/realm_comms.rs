//! realm-comms binary
//!
//! Inspect realm candidates, dry-run realm selection, hash positions into
//! island topics, or run a two-peer loopback demo.
//!
//! ## Configuration (env / TOML via `config` crate)
//!
//! | Key                                | Default        | Description                      |
//! |------------------------------------|----------------|----------------------------------|
//! | `REALM_COMMS_NETWORK_ID`           | `mainnet`      | Cache namespace                  |
//! | `REALM_COMMS_CANDIDATES_ENDPOINT`  | catalyst list  | Node list URL                    |
//! | `REALM_COMMS_MIN_CATALYST_VERSION` | `1.0.0`        | Version filter floor             |
//! | `REALM_COMMS_PINNED_HOSTS`         | –              | Comma separated pin list         |
//! | `REALM_COMMS_CACHE_DIR`            | `.realm-comms` | File cache directory             |
//! | `REALM_COMMS_ISLAND_RADIUS`        | `1`            | Neighbouring islands to join     |
//! | `REALM_COMMS_PEER_TIMEOUT_MS`      | `30000`        | Silence before a peer is dropped |

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use realm_comms::{
    bridge::LogBridge,
    candidates::{filter_by_min_version, CandidateSource, HttpCandidateSource, HttpRealmPinger},
    connection::WorldInstanceConnection,
    fanout::CommsFanout,
    loopback::{LoopbackFactory, LoopbackHub},
    saga::{Gates, RealmSaga, SessionRequest},
    topics::{island_topics, position_hash},
    CommsConfig, JsonFileCache, Parcel, Position, ProtocolVersion, Realm,
};
use std::path::PathBuf;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "realm-comms", about = "Realm selection and peer comms", version)]
struct Args {
    /// TOML config file
    #[arg(long, global = true, env = "REALM_COMMS_CONFIG")]
    config: Option<PathBuf>,

    /// Cache namespace
    #[arg(long, global = true)]
    network_id: Option<String>,

    /// Node list URL
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Minimum catalyst version
    #[arg(long, global = true)]
    min_version: Option<String>,

    /// Host exempt from the version filter (repeatable)
    #[arg(long = "pin", global = true)]
    pinned_hosts: Vec<String>,

    /// File cache directory
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch and print version-filtered candidates
    Candidates,

    /// Resolve the realm a session would join
    Select {
        /// Realm requested by name (as in `?realm=`)
        #[arg(long)]
        realm: Option<String>,
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        x: i32,
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        y: i32,
    },

    /// Print the island topic for a world position
    Hash {
        #[arg(long, allow_hyphen_values = true)]
        x: f32,
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        y: f32,
        #[arg(long, allow_hyphen_values = true)]
        z: f32,
    },

    /// Two loopback peers exchanging position and chat
    Demo,
}

impl Args {
    fn apply(&self, config: &mut CommsConfig) {
        if let Some(network_id) = &self.network_id {
            config.network_id = network_id.clone();
        }
        if let Some(endpoint) = &self.endpoint {
            config.candidates_endpoint = endpoint.clone();
        }
        if let Some(min_version) = &self.min_version {
            config.min_catalyst_version = min_version.clone();
        }
        if !self.pinned_hosts.is_empty() {
            config.pinned_hosts = self.pinned_hosts.clone();
        }
        if let Some(cache_dir) = &self.cache_dir {
            config.cache_dir = cache_dir.clone();
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("realm_comms=debug".parse()?),
        )
        .init();

    let args = Args::parse();
    let mut config =
        CommsConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    args.apply(&mut config);

    match &args.command {
        Command::Candidates => candidates(&config).await,
        Command::Select { realm, x, y } => {
            select(&config, realm.clone(), Parcel::new(*x, *y)).await
        }
        Command::Hash { x, y, z } => {
            hash(&config, Position::new(*x, *y, *z));
            Ok(())
        }
        Command::Demo => demo(&config).await,
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn candidates(config: &CommsConfig) -> Result<()> {
    let source = HttpCandidateSource::new(config.status_timeout())?;
    let fetched = source
        .fetch_candidates(&config.candidates_endpoint)
        .await
        .with_context(|| format!("failed to fetch {}", config.candidates_endpoint))?;
    let total = fetched.len();
    let kept = filter_by_min_version(fetched, &config.min_catalyst_version, &config.pinned_hosts);

    println!(
        "{:<24} {:<4} {:>7} {:>7} {:>8}  {}",
        "realm", "prot", "users", "max", "ping ms", "version"
    );
    for c in &kept {
        println!(
            "{:<24} {:<4} {:>7} {:>7} {:>8}  {}",
            c.realm.server_name,
            c.realm.protocol.to_string(),
            c.users_count,
            c.max_users.map(|m| m.to_string()).unwrap_or_else(|| "-".into()),
            c.elapsed_ms,
            c.version,
        );
    }
    println!(
        "{} of {} candidates at or above {}",
        kept.len(),
        total,
        config.min_catalyst_version
    );
    Ok(())
}

async fn select(config: &CommsConfig, realm: Option<String>, origin: Parcel) -> Result<()> {
    let source = Arc::new(HttpCandidateSource::new(config.status_timeout())?);
    let pinger = Arc::new(HttpRealmPinger::new(config.status_timeout())?);
    let cache = Arc::new(JsonFileCache::new(&config.cache_dir)?);
    // Resolution never opens a transport; the loopback factory is inert.
    let connection = Arc::new(WorldInstanceConnection::new(Arc::new(LoopbackFactory::new(
        LoopbackHub::new(),
        "cli",
    ))));
    let saga = RealmSaga::new(
        config.clone(),
        source,
        cache,
        pinger,
        connection,
        Arc::new(Gates::ready()),
    );

    let request = SessionRequest {
        realm_param: realm,
        origin,
    };
    let chosen = saga.resolve_realm(&request).await?;
    println!("{}", chosen);
    Ok(())
}

fn hash(config: &CommsConfig, position: Position) {
    println!("parcel  {}", position.parcel());
    println!("island  {}", position_hash(&position));
    println!(
        "nearby  {}",
        island_topics(&position, config.island_radius).join(" ")
    );
}

async fn demo(config: &CommsConfig) -> Result<()> {
    let hub = LoopbackHub::new();
    let realm = Realm::new(ProtocolVersion::V2, "loopback.local", "loopback");

    let mut peers = Vec::new();
    for name in ["alice", "bob"] {
        let factory = Arc::new(LoopbackFactory::new(hub.clone(), name));
        let connection = Arc::new(WorldInstanceConnection::with_timeout(
            factory,
            config.connect_timeout(),
        ));
        connection.change_realm(realm.clone()).await?;
        let fanout =
            CommsFanout::attach(connection.clone(), Arc::new(LogBridge), config.island_radius);
        let pump = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.run_inbound().await })
        };
        fanout.spawn_peer_expiry(config.peer_timeout());
        peers.push((name, connection, fanout, pump));
    }

    for (i, (_, _, fanout, _)) in peers.iter().enumerate() {
        let offset = i as f32 * 3.0;
        fanout
            .report_position(Position::new(8.0 + offset, 0.0, 8.0 + offset))
            .await?;
    }
    for (name, _, fanout, _) in &peers {
        fanout.send_chat(format!("hello from {}", name)).await?;
    }
    // Let the pumps drain.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    for (name, connection, fanout, pump) in peers {
        tracing::info!(
            "{} sees {} peers on {}",
            name,
            fanout.peers().len(),
            fanout.current_island().unwrap_or_default()
        );
        connection.close().await;
        pump.await?;
    }
    Ok(())
}

use crate::error::{Error, Result};
use crate::peer::{Peer, PeerId, Rank};
use crate::world_view::{Quorum, QuorumPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub id: PeerId,
    /// Defaults to the position of `id` among all configured ids.
    pub rank: Option<Rank>,
    pub floors: Option<usize>,
    /// UDP address heartbeats and world views are received on.
    pub address: String,
    pub handoff_address: Option<String>,
    pub peer: Option<Vec<PeerConfig>>,
    pub timing: Option<TimingConfig>,
    pub optimizer: Option<OptimizerConfig>,
    pub quorum: Option<QuorumPolicy>,
    pub driver_address: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PeerConfig {
    pub id: PeerId,
    pub address: String,
    pub handoff_address: Option<String>,
    pub rank: Option<Rank>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TimingConfig {
    pub heartbeat_interval_ms: Option<u64>,
    pub liveness_timeout_ms: Option<u64>,
    pub broadcast_interval_ms: Option<u64>,
    pub assign_interval_ms: Option<u64>,
    pub assignment_timeout_ms: Option<u64>,
    pub door_open_ms: Option<u64>,
    pub travel_timeout_ms: Option<u64>,
    pub io_timeout_ms: Option<u64>,
    pub optimizer_timeout_ms: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct OptimizerConfig {
    pub path: Option<String>,
    pub args: Option<Vec<String>>,
}

fn millis(value: Option<u64>, default: u64) -> Duration {
    Duration::from_millis(value.unwrap_or(default))
}

impl TimingConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        millis(self.heartbeat_interval_ms, 50)
    }

    pub fn liveness_timeout(&self) -> Duration {
        millis(self.liveness_timeout_ms, 500)
    }

    pub fn broadcast_interval(&self) -> Duration {
        millis(self.broadcast_interval_ms, 50)
    }

    pub fn assign_interval(&self) -> Duration {
        millis(self.assign_interval_ms, 250)
    }

    pub fn assignment_timeout(&self) -> Duration {
        millis(self.assignment_timeout_ms, 20_000)
    }

    pub fn door_open(&self) -> Duration {
        millis(self.door_open_ms, 3_000)
    }

    pub fn travel_timeout(&self) -> Duration {
        millis(self.travel_timeout_ms, 4_000)
    }

    /// Upper bound for a single network call.
    pub fn io_timeout(&self) -> Duration {
        millis(self.io_timeout_ms, 200)
    }

    pub fn optimizer_timeout(&self) -> Duration {
        millis(self.optimizer_timeout_ms, 1_000)
    }
}

impl OptimizerConfig {
    pub fn path(&self) -> String {
        self.path
            .clone()
            .unwrap_or_else(|| "hall_request_assigner".to_string())
    }

    pub fn args(&self) -> Vec<String> {
        self.args.clone().unwrap_or_default()
    }
}

impl Config {
    pub fn parse(s: &str) -> Result<Config> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
        Config::parse(&std::fs::read_to_string(path)?)
    }

    pub fn floors(&self) -> usize {
        self.floors.unwrap_or(4)
    }

    pub fn timing(&self) -> TimingConfig {
        self.timing.clone().unwrap_or_default()
    }

    pub fn optimizer(&self) -> OptimizerConfig {
        self.optimizer.clone().unwrap_or_default()
    }

    pub fn quorum(&self) -> Quorum {
        Quorum::new(self.quorum.unwrap_or_default(), self.cluster_size())
    }

    pub fn driver_address(&self) -> String {
        self.driver_address
            .clone()
            .unwrap_or_else(|| "localhost:15657".to_string())
    }

    pub fn cluster_size(&self) -> usize {
        self.peer.as_ref().map(|p| p.len()).unwrap_or(0) + 1
    }

    fn peer_configs(&self) -> &[PeerConfig] {
        self.peer.as_ref().map(|p| p.as_slice()).unwrap_or(&[])
    }

    fn default_rank(&self, id: &PeerId) -> Rank {
        let ids: BTreeSet<&PeerId> = self
            .peer_configs()
            .iter()
            .map(|p| &p.id)
            .chain(std::iter::once(&self.id))
            .collect();
        ids.iter().position(|i| *i == id).unwrap_or(0) as Rank
    }

    pub fn rank(&self) -> Rank {
        self.rank.unwrap_or_else(|| self.default_rank(&self.id))
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.peer_configs()
            .iter()
            .map(|p| Peer {
                id: p.id.clone(),
                address: p.address.clone(),
                handoff_address: p.handoff_address.clone(),
                rank: p.rank.unwrap_or_else(|| self.default_rank(&p.id)),
            })
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.floors() < 2 {
            return Err(Error::Config(format!(
                "need at least 2 floors, got {}",
                self.floors()
            )));
        }
        let timing = self.timing();
        if timing.liveness_timeout() < timing.heartbeat_interval() * 3 {
            return Err(Error::Config(format!(
                "liveness timeout {:?} must be at least three heartbeat intervals ({:?})",
                timing.liveness_timeout(),
                timing.heartbeat_interval()
            )));
        }
        if timing.heartbeat_interval() == Duration::from_millis(0) {
            return Err(Error::Config("heartbeat interval must be positive".to_string()));
        }

        let mut ids = BTreeSet::new();
        let mut ranks = BTreeSet::new();
        ids.insert(self.id.clone());
        ranks.insert(self.rank());
        for peer in self.peers() {
            if !ids.insert(peer.id.clone()) {
                return Err(Error::Config(format!("duplicate peer id {}", peer.id)));
            }
            if !ranks.insert(peer.rank) {
                return Err(Error::Config(format!(
                    "peer {} shares rank {} with another peer",
                    peer.id, peer.rank
                )));
            }
        }
        Ok(())
    }
}

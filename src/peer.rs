use log::{debug, info, trace};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::time::Instant;

pub type PeerId = String;
/// Election order; lower ranks win.
pub type Rank = u32;

#[derive(Clone, Debug)]
pub struct Peer {
    pub id: PeerId,
    pub address: String,
    pub handoff_address: Option<String>,
    pub rank: Rank,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerRecord {
    pub id: PeerId,
    pub last_seen_at: Instant,
    pub rank: Rank,
}

/// Changes in the alive set since the previous poll.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerUpdate {
    /// Alive peers and their ranks, always including this node.
    pub alive: BTreeMap<PeerId, Rank>,
    pub newly_alive: BTreeSet<PeerId>,
    pub newly_lost: BTreeSet<PeerId>,
}

impl PeerUpdate {
    pub fn alive_ids(&self) -> BTreeSet<PeerId> {
        self.alive.keys().cloned().collect()
    }

    /// The alive peer with the lowest rank.
    pub fn lowest_rank(&self) -> Option<(&PeerId, Rank)> {
        self.alive
            .iter()
            .min_by_key(|(id, rank)| (**rank, (*id).clone()))
            .map(|(id, rank)| (id, *rank))
    }

    pub fn is_alive(&self, id: &PeerId) -> bool {
        self.alive.contains_key(id)
    }
}

/// Tracks when each peer was last heard from.
pub struct LivenessMonitor {
    id: PeerId,
    rank: Rank,
    timeout: Duration,
    configured_ranks: BTreeMap<PeerId, Rank>,
    records: BTreeMap<PeerId, PeerRecord>,
    last_alive: BTreeSet<PeerId>,
}

impl LivenessMonitor {
    pub fn new(id: PeerId, rank: Rank, timeout: Duration, peers: &[Peer]) -> LivenessMonitor {
        let mut last_alive = BTreeSet::new();
        last_alive.insert(id.clone());
        LivenessMonitor {
            id,
            rank,
            timeout,
            configured_ranks: peers.iter().map(|p| (p.id.clone(), p.rank)).collect(),
            records: BTreeMap::new(),
            last_alive,
        }
    }

    /// Ranks are fixed by configuration; the advertised rank is only used for
    /// peers the configuration does not know.
    pub fn heartbeat(&mut self, id: &PeerId, advertised_rank: Rank, at: Instant) {
        if *id == self.id {
            return;
        }
        let rank = self.rank_of(id).unwrap_or(advertised_rank);
        match self.records.get_mut(id) {
            Some(record) => {
                if at > record.last_seen_at {
                    record.last_seen_at = at;
                }
            }
            None => {
                trace!(target: "liveness", "First heartbeat from {}", id);
                self.records.insert(
                    id.clone(),
                    PeerRecord {
                        id: id.clone(),
                        last_seen_at: at,
                        rank,
                    },
                );
            }
        }
    }

    pub fn rank_of(&self, id: &PeerId) -> Option<Rank> {
        if *id == self.id {
            return Some(self.rank);
        }
        self.configured_ranks
            .get(id)
            .or_else(|| self.records.get(id).map(|r| &r.rank))
            .copied()
    }

    /// The current alive set, without touching the poll baseline.
    pub fn alive(&self, now: Instant) -> BTreeMap<PeerId, Rank> {
        let mut alive: BTreeMap<PeerId, Rank> = self
            .records
            .values()
            .filter(|r| now.saturating_duration_since(r.last_seen_at) < self.timeout)
            .map(|r| (r.id.clone(), r.rank))
            .collect();
        alive.insert(self.id.clone(), self.rank);
        alive
    }

    /// Computes the alive set and its difference to the previous poll. Peers
    /// silent for longer than the timeout are pruned.
    pub fn poll(&mut self, now: Instant) -> PeerUpdate {
        let alive = self.alive(now);
        let timeout = self.timeout;
        self.records
            .retain(|_, r| now.saturating_duration_since(r.last_seen_at) < timeout);

        let ids: BTreeSet<PeerId> = alive.keys().cloned().collect();
        let newly_alive: BTreeSet<PeerId> = ids.difference(&self.last_alive).cloned().collect();
        let newly_lost: BTreeSet<PeerId> = self.last_alive.difference(&ids).cloned().collect();
        for id in newly_alive.iter() {
            info!(target: "liveness", "Peer {} is alive", id);
        }
        for id in newly_lost.iter() {
            info!(target: "liveness", "Peer {} was lost", id);
        }
        if !newly_alive.is_empty() || !newly_lost.is_empty() {
            debug!(target: "liveness", "Alive peers: {:?}", ids);
        }
        self.last_alive = ids;

        PeerUpdate {
            alive,
            newly_alive,
            newly_lost,
        }
    }
}

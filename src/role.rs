use crate::peer::{PeerId, PeerUpdate, Rank};
use crate::time::Timer;
use crate::world_view::PrimaryClaim;
use log::{debug, info};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Idle,
    Backup,
    Primary,
}

/// What the node has to do after an evaluation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Stay,
    BecomeBackup,
    /// Publish a primary claim under `epoch`.
    Promote { epoch: u64 },
    /// Lost a priority race against a lower-ranked primary.
    Demote,
    /// Still primary, but another claim overtook ours; publish a newer one.
    Reassert { epoch: u64 },
}

/// Decides the local role from the alive set and the merged primary claim.
///
/// Every node applies the same rule to the same inputs: the lowest-ranked
/// alive peer takes over when there is no live primary. No votes are
/// exchanged.
pub struct RoleController {
    id: PeerId,
    rank: Rank,
    role: Role,
    discovery: Timer,
}

impl RoleController {
    /// `discovery` is how long an idle node listens for an existing primary
    /// before it may elect itself.
    pub fn new(id: PeerId, rank: Rank, discovery: Duration) -> RoleController {
        let mut timer = Timer::new();
        timer.start(discovery);
        RoleController {
            id,
            rank,
            role: Role::Idle,
            discovery: timer,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    fn is_lowest_alive(&self, peers: &PeerUpdate) -> bool {
        peers
            .lowest_rank()
            .map(|(id, _)| *id == self.id)
            .unwrap_or(true)
    }

    pub fn evaluate(&mut self, peers: &PeerUpdate, claim: Option<&PrimaryClaim>) -> Decision {
        let next_epoch = claim.map(|c| c.epoch).unwrap_or(0) + 1;
        // A claim only counts while its author is alive; our own claim from a
        // previous incarnation does not count either.
        let live_claimant = claim.filter(|c| c.id != self.id && peers.is_alive(&c.id));

        let decision = match self.role {
            Role::Idle => match live_claimant {
                Some(c) => {
                    debug!(target: "role", "Found primary {} in epoch {}", c.id, c.epoch);
                    Decision::BecomeBackup
                }
                None if self.discovery.timed_out() && self.is_lowest_alive(peers) => {
                    Decision::Promote { epoch: next_epoch }
                }
                None => Decision::Stay,
            },
            Role::Backup => match live_claimant {
                Some(_) => Decision::Stay,
                None if self.is_lowest_alive(peers) => Decision::Promote { epoch: next_epoch },
                None => Decision::Stay,
            },
            Role::Primary => match claim {
                Some(c) if c.id == self.id => Decision::Stay,
                Some(c) if peers.is_alive(&c.id) && c.rank < self.rank => Decision::Demote,
                _ => Decision::Reassert { epoch: next_epoch },
            },
        };

        match decision {
            Decision::Stay => {}
            Decision::BecomeBackup => {
                info!(target: "role", "{:?} -> Backup", self.role);
                self.role = Role::Backup;
            }
            Decision::Promote { epoch } => {
                info!(target: "role", "{:?} -> Primary in epoch {}", self.role, epoch);
                self.role = Role::Primary;
            }
            Decision::Demote => {
                info!(target: "role", "Primary -> Backup; lost priority race");
                self.role = Role::Backup;
            }
            Decision::Reassert { epoch } => {
                info!(target: "role", "Re-asserting primary claim in epoch {}", epoch);
            }
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn peers(alive: &[(&str, Rank)]) -> PeerUpdate {
        PeerUpdate {
            alive: alive
                .iter()
                .map(|(id, rank)| (id.to_string(), *rank))
                .collect::<BTreeMap<_, _>>(),
            ..PeerUpdate::default()
        }
    }

    fn claim(id: &str, rank: Rank, epoch: u64) -> PrimaryClaim {
        PrimaryClaim {
            epoch,
            rank,
            id: id.to_string(),
        }
    }

    fn controller(id: &str, rank: Rank) -> RoleController {
        RoleController::new(id.to_string(), rank, Duration::from_millis(0))
    }

    #[tokio::test]
    async fn idle_joins_existing_primary() {
        let mut c = controller("a", 0);
        let all = peers(&[("a", 0), ("b", 1)]);
        let primary = claim("b", 1, 3);
        assert_eq!(c.evaluate(&all, Some(&primary)), Decision::BecomeBackup);
        assert_eq!(c.role(), Role::Backup);
        assert_eq!(c.evaluate(&all, Some(&primary)), Decision::Stay, "no preemption");
    }

    #[tokio::test]
    async fn idle_waits_for_discovery_window() {
        let mut c = RoleController::new("a".to_string(), 0, Duration::from_secs(60));
        assert_eq!(c.evaluate(&peers(&[("a", 0)]), None), Decision::Stay);
        assert_eq!(c.role(), Role::Idle);
    }

    #[tokio::test]
    async fn lowest_rank_bootstraps() {
        let all = peers(&[("a", 0), ("b", 1), ("c", 2)]);
        let mut a = controller("a", 0);
        let mut b = controller("b", 1);
        assert_eq!(a.evaluate(&all, None), Decision::Promote { epoch: 1 });
        assert_eq!(b.evaluate(&all, None), Decision::Stay);
        assert_eq!(b.evaluate(&all, Some(&claim("a", 0, 1))), Decision::BecomeBackup);
    }

    #[tokio::test]
    async fn failover_promotes_next_lowest_rank() {
        let before = peers(&[("a", 0), ("b", 1), ("c", 2)]);
        let after = peers(&[("b", 1), ("c", 2)]);
        let primary = claim("a", 0, 1);
        let mut b = controller("b", 1);
        let mut c = controller("c", 2);
        b.evaluate(&before, Some(&primary));
        c.evaluate(&before, Some(&primary));

        assert_eq!(b.evaluate(&after, Some(&primary)), Decision::Promote { epoch: 2 });
        assert_eq!(c.evaluate(&after, Some(&primary)), Decision::Stay);
        assert_eq!(b.role(), Role::Primary);
        assert_eq!(c.role(), Role::Backup);
    }

    #[tokio::test]
    async fn split_brain_resolves_to_lowest_rank() {
        let all = peers(&[("a", 0), ("b", 1)]);
        let mut a = controller("a", 0);
        let mut b = controller("b", 1);
        a.evaluate(&peers(&[("a", 0)]), None);
        b.evaluate(&peers(&[("b", 1)]), None);
        assert_eq!(a.role(), Role::Primary);
        assert_eq!(b.role(), Role::Primary);

        // After healing, the merged claim is b's (newer epoch).
        let merged = claim("b", 1, 2);
        assert_eq!(a.evaluate(&all, Some(&merged)), Decision::Reassert { epoch: 3 });
        let merged = claim("a", 0, 3);
        assert_eq!(b.evaluate(&all, Some(&merged)), Decision::Demote);
        assert_eq!(a.role(), Role::Primary);
        assert_eq!(b.role(), Role::Backup);
    }

    #[tokio::test]
    async fn election_ignores_arrival_order() {
        let orders = vec![
            peers(&[("c", 2), ("b", 1), ("d", 3)]),
            peers(&[("d", 3), ("c", 2), ("b", 1)]),
        ];
        for all in orders {
            let mut promoted = Vec::new();
            for (id, rank) in all.alive.iter() {
                let mut c = controller(id, *rank);
                if let Decision::Promote { .. } = c.evaluate(&all, None) {
                    promoted.push(id.clone());
                }
            }
            assert_eq!(promoted, vec!["b".to_string()]);
        }
    }

    #[tokio::test]
    async fn stale_self_claim_is_ignored_when_idle() {
        let mut a = controller("a", 0);
        let all = peers(&[("a", 0), ("b", 1)]);
        assert_eq!(
            a.evaluate(&all, Some(&claim("a", 0, 4))),
            Decision::Promote { epoch: 5 }
        );
    }
}

use crate::assign::Assignments;
use crate::peer::{PeerId, Rank};
use crate::world_view::{
    ElevatorEntry, ElevatorState, Floor, HallButton, PrimaryClaim, Quorum, WorldView,
};
use async_channel::{Receiver, Sender};
use async_lock::Mutex;
use log::{debug, info, trace};
use std::collections::BTreeSet;
use std::sync::Arc;

/// The single shared replica of the world view on a node.
///
/// All access goes through the mutex, so a remote merge and a local write
/// never interleave. Readers get owned snapshots.
#[derive(Clone)]
pub struct WorldViewStore {
    id: PeerId,
    quorum: Quorum,
    inner: Arc<Mutex<Inner>>,
    changes: Sender<()>,
}

struct Inner {
    view: WorldView,
    alive: BTreeSet<PeerId>,
    restored_cab_requests: Option<BTreeSet<Floor>>,
    cab_restore_done: bool,
}

impl WorldViewStore {
    /// Creates the store and the receiver that is signalled after every change.
    pub fn new(
        id: PeerId,
        floors: usize,
        initial_sequence: u64,
        quorum: Quorum,
    ) -> (WorldViewStore, Receiver<()>) {
        let (changes, changes_rx) = async_channel::bounded(1);
        let mut alive = BTreeSet::new();
        alive.insert(id.clone());
        let inner = Inner {
            view: WorldView::new(id.clone(), floors, initial_sequence),
            alive,
            restored_cab_requests: None,
            cab_restore_done: false,
        };
        (
            WorldViewStore {
                id,
                quorum,
                inner: Arc::new(Mutex::new(inner)),
                changes,
            },
            changes_rx,
        )
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub async fn snapshot(&self) -> WorldView {
        self.inner.lock().await.view.clone()
    }

    fn notify(&self) {
        // A full channel already holds a pending wakeup.
        let _ = self.changes.try_send(());
    }

    /// Overwrites this node's own elevator entry.
    pub async fn apply_local_elevator_state(&self, state: ElevatorState) {
        let mut inner = self.inner.lock().await;
        let view = &mut inner.view;
        view.sequence += 1;
        let entry = ElevatorEntry {
            sequence: view.sequence,
            state,
        };
        view.elevators.insert(self.id.clone(), entry);
        drop(inner);
        self.notify();
    }

    /// Merges a snapshot received from a peer. Our own entry is never taken
    /// from a remote. Returns true if the local view changed.
    pub async fn merge_remote(&self, mut remote: WorldView) -> bool {
        if remote.author == self.id {
            return false;
        }
        let mut inner = self.inner.lock().await;
        if let Some(entry) = remote.elevators.remove(&self.id) {
            if !inner.cab_restore_done {
                inner.cab_restore_done = true;
                if !entry.state.cab_requests.is_empty() {
                    info!(
                        target: "store",
                        "Restoring cab requests {:?} from {}",
                        entry.state.cab_requests, remote.author
                    );
                    inner.restored_cab_requests = Some(entry.state.cab_requests);
                }
            }
        }

        let before = inner.view.clone();
        inner.view.merge(&remote);
        let alive = inner.alive.clone();
        inner.view.ack_all(&self.id, &self.quorum, &alive);

        let changed = inner.view != before;
        if changed {
            inner.view.sequence = before.sequence + 1;
            trace!(target: "store", "Merged view from {} (seq {})", remote.author, remote.sequence);
        }
        drop(inner);
        if changed {
            self.notify();
        }
        changed
    }

    /// Cab requests recovered from a peer's replica of this node, once.
    pub async fn take_restored_cab_requests(&self) -> Option<BTreeSet<Floor>> {
        self.inner.lock().await.restored_cab_requests.take()
    }

    pub async fn set_alive(&self, alive: BTreeSet<PeerId>) {
        self.inner.lock().await.alive = alive;
    }

    pub async fn alive(&self) -> BTreeSet<PeerId> {
        self.inner.lock().await.alive.clone()
    }

    async fn mutate<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut WorldView, &BTreeSet<PeerId>, &Quorum) -> T,
    {
        let mut inner = self.inner.lock().await;
        let before = inner.view.clone();
        let alive = inner.alive.clone();
        let result = f(&mut inner.view, &alive, &self.quorum);
        let changed = inner.view != before;
        if changed {
            inner.view.sequence = before.sequence + 1;
        }
        drop(inner);
        if changed {
            self.notify();
        }
        result
    }

    /// A hall button was pressed on this node.
    pub async fn request_hall(&self, floor: Floor, button: HallButton) -> bool {
        let id = self.id.clone();
        self.mutate(move |view, _, _| view.request_hall(floor, button, &id))
            .await
    }

    pub async fn record_ack(&self, floor: Floor, button: HallButton, by: &PeerId) -> bool {
        self.mutate(|view, alive, quorum| view.record_ack(floor, button, by, quorum, alive))
            .await
    }

    /// Forgets a lost peer. Returns the requests that were stepped back.
    pub async fn drop_peer(&self, id: &PeerId) -> Vec<(Floor, HallButton)> {
        let demoted = self
            .mutate(|view, alive, quorum| view.drop_peer(id, quorum, alive))
            .await;
        if !demoted.is_empty() {
            debug!(target: "store", "Peer {} lost; demoted {:?}", id, demoted);
        }
        demoted
    }

    pub async fn complete_hall_request(&self, floor: Floor, button: HallButton) -> bool {
        self.mutate(|view, _, _| view.complete_hall_request(floor, button))
            .await
    }

    pub async fn reassign(&self, floor: Floor, button: HallButton) -> bool {
        self.mutate(|view, _, _| view.reassign(floor, button))
            .await
    }

    /// Publishes a primary claim for this node under `epoch`.
    pub async fn claim_primary(&self, epoch: u64, rank: Rank) {
        let claim = PrimaryClaim {
            epoch,
            rank,
            id: self.id.clone(),
        };
        self.mutate(move |view, _, _| {
            if Some(&claim) > view.primary.as_ref() {
                view.primary = Some(claim);
            }
        })
        .await
    }

    /// Writes the optimizer's output back under this node's primary claim.
    /// Nothing is written once the merged view names another primary.
    /// Returns how many requests changed hands.
    pub async fn apply_assignments(&self, assignments: &Assignments) -> usize {
        self.mutate(|view, alive, quorum| {
            let claim = match view.primary {
                Some(ref claim) if claim.id == self.id => claim.clone(),
                _ => {
                    debug!(target: "store", "Not the primary in {:?}; dropping assignments", view.primary);
                    return 0;
                }
            };
            let mut pending: BTreeSet<(Floor, HallButton)> =
                view.pending(alive).into_iter().collect();
            let mut applied = 0;
            for (peer, requests) in assignments.iter() {
                for request in requests.iter() {
                    // Removing from `pending` keeps the first assignee when the
                    // optimizer hands out a request twice.
                    if !pending.remove(request) {
                        continue;
                    }
                    let (floor, button) = *request;
                    view.apply_assignment(floor, button, peer, &claim, quorum, alive);
                    applied += 1;
                }
            }
            applied
        })
        .await
    }
}

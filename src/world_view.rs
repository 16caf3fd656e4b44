//! The replicated world view and its merge rules.
//!
//! Every field of a [`WorldView`] forms a join-semilattice, so [`WorldView::merge`]
//! is commutative, associative and idempotent. Replicas converge no matter how
//! snapshots are reordered or duplicated on the network.
use crate::peer::{PeerId, Rank};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

pub type Floor = usize;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Stop,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Behaviour {
    Idle,
    Moving,
    DoorOpen,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HallButton {
    Up,
    Down,
}

impl HallButton {
    pub const ALL: [HallButton; 2] = [HallButton::Up, HallButton::Down];

    pub fn index(self) -> usize {
        match self {
            HallButton::Up => 0,
            HallButton::Down => 1,
        }
    }
}

/// Lifecycle of a hall call: `Absent -> Unconfirmed -> Confirmed -> Absent`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HallRequestStatus {
    Absent,
    Unconfirmed,
    Confirmed,
}

impl Default for HallRequestStatus {
    fn default() -> Self {
        HallRequestStatus::Absent
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ElevatorState {
    /// Last floor the car passed; `None` until the first floor sensor hit.
    pub floor: Option<Floor>,
    pub direction: Direction,
    pub behaviour: Behaviour,
    pub cab_requests: BTreeSet<Floor>,
    pub available: bool,
}

impl Default for ElevatorState {
    fn default() -> Self {
        ElevatorState {
            floor: None,
            direction: Direction::Stop,
            behaviour: Behaviour::Idle,
            cab_requests: BTreeSet::new(),
            available: true,
        }
    }
}

/// An elevator state stamped with its author's sequence number.
///
/// Field order matters: the derived `Ord` compares `sequence` first, which is
/// the per-author last-writer-wins rule.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ElevatorEntry {
    pub sequence: u64,
    pub state: ElevatorState,
}

/// One hall call slot.
///
/// Whether a call exists is decided by `presses` and `served` alone: both
/// are per-peer grow-only maps, and a call is outstanding while some press
/// stamp is not covered by a completion. A stale replica can therefore
/// neither erase a press it never saw nor bring back a served call.
///
/// The remaining fields are the assignment record. Records are ordered by
/// `(claim, version, phase)`, so writes made under a higher-priority
/// primary claim win over those of a stale primary.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct HallRequest {
    /// Claim of the primary known to the node that last rewrote the record.
    pub claim: Option<PrimaryClaim>,
    /// Bumped by every rewrite that is not a monotone step within the cycle.
    pub version: u64,
    pub phase: HallRequestStatus,
    pub assignee: Option<PeerId>,
    pub ack_set: BTreeSet<PeerId>,
    /// Latest press stamp per pressing peer.
    pub presses: BTreeMap<PeerId, u64>,
    /// Press stamps covered by completions.
    pub served: BTreeMap<PeerId, u64>,
}

fn join_max(mine: &mut BTreeMap<PeerId, u64>, theirs: &BTreeMap<PeerId, u64>) {
    for (id, stamp) in theirs.iter() {
        let entry = mine.entry(id.clone()).or_insert(0);
        *entry = (*entry).max(*stamp);
    }
}

impl HallRequest {
    fn key(&self) -> (Option<&PrimaryClaim>, u64, HallRequestStatus) {
        (self.claim.as_ref(), self.version, self.phase)
    }

    /// Some press has not been served yet.
    pub fn outstanding(&self) -> bool {
        self.presses
            .iter()
            .any(|(id, stamp)| self.served.get(id).map_or(true, |s| s < stamp))
    }

    pub fn status(&self) -> HallRequestStatus {
        match (self.outstanding(), self.phase) {
            (false, _) => HallRequestStatus::Absent,
            (true, HallRequestStatus::Absent) => HallRequestStatus::Unconfirmed,
            (true, phase) => phase,
        }
    }

    /// The assigned car, while the call is outstanding.
    pub fn assignee(&self) -> Option<&PeerId> {
        if self.outstanding() {
            self.assignee.as_ref()
        } else {
            None
        }
    }

    fn join(&mut self, other: &HallRequest) {
        join_max(&mut self.presses, &other.presses);
        join_max(&mut self.served, &other.served);
        match self.key().cmp(&other.key()) {
            Ordering::Greater => {}
            Ordering::Less => {
                self.claim = other.claim.clone();
                self.version = other.version;
                self.phase = other.phase;
                self.assignee = other.assignee.clone();
                self.ack_set = other.ack_set.clone();
            }
            Ordering::Equal => {
                self.ack_set.extend(other.ack_set.iter().cloned());
                if other.assignee > self.assignee {
                    self.assignee = other.assignee.clone();
                }
            }
        }
    }

    fn rewrite(&mut self, claim: Option<PrimaryClaim>, phase: HallRequestStatus) {
        self.version += 1;
        if claim.as_ref() > self.claim.as_ref() {
            self.claim = claim;
        }
        self.phase = phase;
    }
}

/// The claim a node publishes when it takes the primary role.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PrimaryClaim {
    pub epoch: u64,
    pub rank: Rank,
    pub id: PeerId,
}

impl Ord for PrimaryClaim {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then(other.rank.cmp(&self.rank))
            .then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for PrimaryClaim {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum QuorumPolicy {
    /// Only the assigned peer has to acknowledge.
    AssignedOnly,
    /// Every peer currently alive has to acknowledge.
    AllAlive,
    /// A strict majority of the configured cluster has to acknowledge.
    Majority,
}

impl Default for QuorumPolicy {
    fn default() -> Self {
        QuorumPolicy::AssignedOnly
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quorum {
    pub policy: QuorumPolicy,
    pub cluster_size: usize,
}

impl Quorum {
    pub fn new(policy: QuorumPolicy, cluster_size: usize) -> Quorum {
        Quorum {
            policy,
            cluster_size,
        }
    }

    /// The assignee must always be among the acknowledgers.
    pub fn is_met(&self, request: &HallRequest, alive: &BTreeSet<PeerId>) -> bool {
        let assignee = match request.assignee {
            Some(ref a) => a,
            None => return false,
        };
        if !request.ack_set.contains(assignee) {
            return false;
        }
        match self.policy {
            QuorumPolicy::AssignedOnly => true,
            QuorumPolicy::AllAlive => alive.iter().all(|p| request.ack_set.contains(p)),
            QuorumPolicy::Majority => request.ack_set.len() * 2 > self.cluster_size,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorldView {
    pub author: PeerId,
    pub sequence: u64,
    pub primary: Option<PrimaryClaim>,
    pub elevators: BTreeMap<PeerId, ElevatorEntry>,
    pub hall_requests: Vec<[HallRequest; 2]>,
}

impl WorldView {
    pub fn new(author: PeerId, floors: usize, sequence: u64) -> WorldView {
        WorldView {
            author,
            sequence,
            primary: None,
            elevators: BTreeMap::new(),
            hall_requests: vec![Default::default(); floors],
        }
    }

    pub fn floors(&self) -> usize {
        self.hall_requests.len()
    }

    pub fn hall(&self, floor: Floor, button: HallButton) -> Option<&HallRequest> {
        self.hall_requests.get(floor).map(|f| &f[button.index()])
    }

    fn hall_mut(&mut self, floor: Floor, button: HallButton) -> Option<&mut HallRequest> {
        self.hall_requests
            .get_mut(floor)
            .map(|f| &mut f[button.index()])
    }

    pub fn status(&self, floor: Floor, button: HallButton) -> HallRequestStatus {
        self.hall(floor, button)
            .map(HallRequest::status)
            .unwrap_or(HallRequestStatus::Absent)
    }

    pub fn primary_id(&self) -> Option<&PeerId> {
        self.primary.as_ref().map(|c| &c.id)
    }

    pub fn epoch(&self) -> u64 {
        self.primary.as_ref().map(|c| c.epoch).unwrap_or(0)
    }

    /// Joins `other` into `self`. The snapshot header (`author`, `sequence`)
    /// is left untouched.
    pub fn merge(&mut self, other: &WorldView) {
        if other.primary > self.primary {
            self.primary = other.primary.clone();
        }
        for (id, entry) in other.elevators.iter() {
            self.merge_elevator(id, entry);
        }
        if other.hall_requests.len() > self.hall_requests.len() {
            self.hall_requests
                .resize(other.hall_requests.len(), Default::default());
        }
        for (mine, theirs) in self.hall_requests.iter_mut().zip(other.hall_requests.iter()) {
            mine[0].join(&theirs[0]);
            mine[1].join(&theirs[1]);
        }
    }

    /// Accepts `entry` iff it is newer than the held entry for the same peer.
    /// Sequence numbers are never compared across peers.
    pub fn merge_elevator(&mut self, id: &PeerId, entry: &ElevatorEntry) -> bool {
        match self.elevators.get_mut(id) {
            Some(current) if *current >= *entry => false,
            Some(current) => {
                *current = entry.clone();
                true
            }
            None => {
                self.elevators.insert(id.clone(), entry.clone());
                true
            }
        }
    }

    /// A new hall button press by `by`. Returns true if no call was
    /// outstanding.
    ///
    /// The press stamp is above both this view's sequence and any earlier
    /// stamp of `by`, so it is never mistaken for an already served press.
    pub fn request_hall(&mut self, floor: Floor, button: HallButton, by: &PeerId) -> bool {
        let claim = self.primary.clone();
        let sequence = self.sequence;
        match self.hall_mut(floor, button) {
            Some(req) if req.status() == HallRequestStatus::Absent => {
                let previous = req
                    .presses
                    .get(by)
                    .copied()
                    .max(req.served.get(by).copied())
                    .unwrap_or(0);
                req.presses.insert(by.clone(), previous.max(sequence) + 1);
                req.rewrite(claim, HallRequestStatus::Unconfirmed);
                req.assignee = None;
                req.ack_set.clear();
                req.ack_set.insert(by.clone());
                true
            }
            _ => false,
        }
    }

    /// Records the optimizer's choice, made under `claim`. The request is
    /// confirmed at once if the quorum only needs the assignee.
    pub fn apply_assignment(
        &mut self,
        floor: Floor,
        button: HallButton,
        assignee: &PeerId,
        claim: &PrimaryClaim,
        quorum: &Quorum,
        alive: &BTreeSet<PeerId>,
    ) -> HallRequestStatus {
        let req = match self.hall_mut(floor, button) {
            Some(req) if req.outstanding() => req,
            _ => return HallRequestStatus::Absent,
        };
        req.rewrite(Some(claim.clone()), HallRequestStatus::Unconfirmed);
        req.assignee = Some(assignee.clone());
        req.ack_set.clear();
        req.ack_set.insert(assignee.clone());
        if quorum.is_met(req, alive) {
            req.phase = HallRequestStatus::Confirmed;
        }
        req.status()
    }

    /// Adds `by` to the acknowledgers. Promotes an assigned request to
    /// `Confirmed` once the quorum is reached. Returns true on any change.
    pub fn record_ack(
        &mut self,
        floor: Floor,
        button: HallButton,
        by: &PeerId,
        quorum: &Quorum,
        alive: &BTreeSet<PeerId>,
    ) -> bool {
        let req = match self.hall_mut(floor, button) {
            Some(req) if req.outstanding() && req.phase != HallRequestStatus::Absent => req,
            _ => return false,
        };
        let mut changed = req.ack_set.insert(by.clone());
        if req.phase == HallRequestStatus::Unconfirmed && quorum.is_met(req, alive) {
            req.phase = HallRequestStatus::Confirmed;
            changed = true;
        }
        changed
    }

    /// Acknowledges every assigned request `by` has not yet acknowledged.
    pub fn ack_all(&mut self, by: &PeerId, quorum: &Quorum, alive: &BTreeSet<PeerId>) -> bool {
        let mut changed = false;
        for floor in 0..self.floors() {
            for button in HallButton::ALL.iter() {
                let assigned = self
                    .hall(floor, *button)
                    .map(|r| r.assignee().is_some())
                    .unwrap_or(false);
                if assigned {
                    changed |= self.record_ack(floor, *button, by, quorum, alive);
                }
            }
        }
        changed
    }

    /// Forgets a lost peer: strips its acknowledgements and steps back any
    /// request whose quorum no longer holds. Requests assigned to the lost
    /// peer lose their assignee. Nothing is demoted below `Unconfirmed`.
    pub fn drop_peer(
        &mut self,
        id: &PeerId,
        quorum: &Quorum,
        alive: &BTreeSet<PeerId>,
    ) -> Vec<(Floor, HallButton)> {
        let claim = self.primary.clone();
        let mut demoted = Vec::new();
        for (floor, buttons) in self.hall_requests.iter_mut().enumerate() {
            for button in HallButton::ALL.iter() {
                let req = &mut buttons[button.index()];
                let status = req.status();
                if status == HallRequestStatus::Absent {
                    continue;
                }
                req.ack_set.remove(id);
                if req.assignee.as_ref() == Some(id) {
                    req.rewrite(claim.clone(), HallRequestStatus::Unconfirmed);
                    req.assignee = None;
                    demoted.push((floor, *button));
                } else if status == HallRequestStatus::Confirmed && !quorum.is_met(req, alive) {
                    req.rewrite(claim.clone(), HallRequestStatus::Unconfirmed);
                    demoted.push((floor, *button));
                } else if req.phase == HallRequestStatus::Unconfirmed && quorum.is_met(req, alive) {
                    req.phase = HallRequestStatus::Confirmed;
                }
            }
        }
        demoted
    }

    /// The request was served: the car stopped and cycled its doors. Every
    /// press known here is marked served.
    pub fn complete_hall_request(&mut self, floor: Floor, button: HallButton) -> bool {
        let claim = self.primary.clone();
        match self.hall_mut(floor, button) {
            Some(req) if req.outstanding() => {
                let presses = req.presses.clone();
                join_max(&mut req.served, &presses);
                req.rewrite(claim, HallRequestStatus::Absent);
                req.assignee = None;
                req.ack_set.clear();
                true
            }
            _ => false,
        }
    }

    /// Withdraws an assignment so the request is handed out again.
    pub fn reassign(&mut self, floor: Floor, button: HallButton) -> bool {
        let claim = self.primary.clone();
        match self.hall_mut(floor, button) {
            Some(req) if req.assignee().is_some() => {
                req.rewrite(claim, HallRequestStatus::Unconfirmed);
                req.assignee = None;
                req.ack_set.clear();
                true
            }
            _ => false,
        }
    }

    /// Requests waiting for an assignment: `Unconfirmed` and either
    /// unassigned or assigned to a peer that is no longer alive.
    pub fn pending(&self, alive: &BTreeSet<PeerId>) -> Vec<(Floor, HallButton)> {
        self.requests()
            .filter(|(_, _, r)| r.status() == HallRequestStatus::Unconfirmed)
            .filter(|(_, _, r)| match r.assignee() {
                Some(a) => !alive.contains(a),
                None => true,
            })
            .map(|(f, b, _)| (f, b))
            .collect()
    }

    /// Confirmed requests assigned to `id`.
    pub fn assigned_to(&self, id: &PeerId) -> Vec<(Floor, HallButton)> {
        self.requests()
            .filter(|(_, _, r)| r.status() == HallRequestStatus::Confirmed)
            .filter(|(_, _, r)| r.assignee() == Some(id))
            .map(|(f, b, _)| (f, b))
            .collect()
    }

    pub fn requests(&self) -> impl Iterator<Item = (Floor, HallButton, &HallRequest)> {
        self.hall_requests.iter().enumerate().flat_map(|(floor, b)| {
            HallButton::ALL
                .iter()
                .map(move |button| (floor, *button, &b[button.index()]))
        })
    }
}

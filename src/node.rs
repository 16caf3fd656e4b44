//! Wires the components of one node together. Every component runs as its
//! own task; they talk over bounded channels and share nothing but the
//! world view store.
use crate::assign::{AssignmentAdapter, Optimizer};
use crate::config::{Config, TimingConfig};
use crate::dispatch::{self, Dispatcher};
use crate::error::{Error, Result};
use crate::io::{HardwareCommand, HardwareEvent};
use crate::peer::{LivenessMonitor, Peer, PeerId, PeerUpdate, Rank};
use crate::role::{Decision, Role, RoleController};
use crate::rpc::{Handoff, Message, Transport};
use crate::store::WorldViewStore;
use crate::time::Timer;
use crate::world_view::{Floor, HallButton, HallRequestStatus, PrimaryClaim};
use async_channel::{Receiver, Sender, TrySendError};
use async_lock::Mutex;
use futures::prelude::*;
use futures::select;
use log::{debug, error, info, trace, warn};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// The hardware side of a node: events from the car, commands to it.
pub struct Io {
    pub events: Receiver<HardwareEvent>,
    pub commands: Sender<HardwareCommand>,
}

pub struct NodeHandle {
    id: PeerId,
    store: WorldViewStore,
    role: Arc<Mutex<Role>>,
    tasks: Vec<JoinHandle<Result<()>>>,
}

impl NodeHandle {
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn store(&self) -> &WorldViewStore {
        &self.store
    }

    pub async fn role(&self) -> Role {
        *self.role.lock().await
    }

    /// Stops every task of the node at once, as a crash would.
    pub fn shutdown(self) {
        info!("Shutting down node {}", self.id);
        for task in self.tasks {
            task.abort();
        }
    }

    /// Waits until the first task ends and returns its error.
    pub async fn join(self) -> Result<()> {
        let (result, _, rest) = future::select_all(self.tasks).await;
        for task in rest {
            task.abort();
        }
        match result {
            Ok(result) => result,
            Err(e) => {
                error!("Node task failed: {}", e);
                Err(Error::Terminated)
            }
        }
    }
}

/// Milliseconds since the epoch, read once at start-up. Seeding the sequence
/// counter with it lets a restarted node supersede its previous incarnation.
fn incarnation() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn spawn<F>(name: &'static str, task: F) -> JoinHandle<Result<()>>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let result = task.await;
        match result {
            Ok(()) => debug!("Task {} finished", name),
            Err(Error::Terminated) => debug!("Task {} terminated", name),
            Err(ref e) => error!("Task {} failed: {}", name, e),
        }
        result
    })
}

pub fn start<T, H, O>(config: &Config, transport: T, handoff: H, optimizer: O, io: Io) -> NodeHandle
where
    T: Transport,
    H: Handoff,
    O: Optimizer,
{
    let id = config.id.clone();
    let rank = config.rank();
    let peers = config.peers();
    let timing = config.timing();
    info!(
        "Starting node {} (rank {}) with {} peers",
        id,
        rank,
        peers.len()
    );

    let (store, changes) =
        WorldViewStore::new(id.clone(), config.floors(), incarnation(), config.quorum());
    let (heartbeats_tx, heartbeats_rx) = async_channel::bounded(64);
    let (updates_tx, updates_rx) = async_channel::bounded(1);
    let role = Arc::new(Mutex::new(Role::Idle));

    let monitor = LivenessMonitor::new(id.clone(), rank, timing.liveness_timeout(), &peers);
    let controller = RoleController::new(id.clone(), rank, timing.liveness_timeout());
    let dispatcher = Dispatcher::new(
        id.clone(),
        config.floors(),
        timing.door_open(),
        timing.travel_timeout(),
    );
    let (promotions_tx, promotions_rx) = async_channel::bounded(1);
    let coordinator = Coordinator {
        store: store.clone(),
        rank,
        controller,
        current_role: role.clone(),
        peer_updates: updates_rx,
        promotions: promotions_tx,
    };
    let assigner = Assigner {
        store: store.clone(),
        peers,
        timing: timing.clone(),
        current_role: role.clone(),
        handoff,
        adapter: AssignmentAdapter::new(optimizer, timing.optimizer_timeout()),
        assignment_timers: BTreeMap::new(),
        promotions: promotions_rx,
    };

    let tasks = vec![
        spawn(
            "receive",
            receive(transport.clone(), store.clone(), heartbeats_tx, timing.io_timeout()),
        ),
        spawn(
            "heartbeat",
            heartbeat(transport.clone(), id.clone(), rank, timing.heartbeat_interval()),
        ),
        spawn(
            "broadcast",
            broadcast(transport, store.clone(), timing.clone()),
        ),
        spawn(
            "liveness",
            liveness(monitor, heartbeats_rx, updates_tx, timing.heartbeat_interval()),
        ),
        spawn("coordinator", coordinator.run()),
        spawn("assigner", assigner.run()),
        spawn(
            "dispatch",
            dispatch::run(dispatcher, store.clone(), io.events, io.commands, changes),
        ),
    ];

    NodeHandle {
        id,
        store,
        role,
        tasks,
    }
}

async fn receive<T: Transport>(
    transport: T,
    store: WorldViewStore,
    heartbeats: Sender<(PeerId, Rank, Instant)>,
    backoff: Duration,
) -> Result<()> {
    loop {
        let data = match transport.recv().await {
            Ok(data) => data,
            Err(e) => {
                warn!(target: "net", "Receive failed: {}", e);
                crate::time::delay_for(backoff).await;
                continue;
            }
        };
        match Message::decode(&data) {
            Ok(Message::Heartbeat { id, rank }) => {
                if id != *store.id() {
                    // A full queue sheds heartbeats instead of stalling merges.
                    match heartbeats.try_send((id, rank, Instant::now())) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            trace!(target: "net", "Heartbeat queue full; dropping heartbeat")
                        }
                        Err(TrySendError::Closed(_)) => return Err(Error::Terminated),
                    }
                }
            }
            Ok(Message::WorldView(view)) => {
                store.merge_remote(view).await;
            }
            Err(e) => trace!(target: "net", "Dropping malformed message: {}", e),
        }
    }
}

async fn heartbeat<T: Transport>(
    transport: T,
    id: PeerId,
    rank: Rank,
    interval: Duration,
) -> Result<()> {
    let message = Message::Heartbeat { id, rank }.encode()?;
    loop {
        if let Err(e) = transport.broadcast(message.clone()).await {
            warn!(target: "net", "Heartbeat failed: {}", e);
        }
        // Jitter of up to a tenth of the period.
        let jitter = {
            let max = (interval.as_millis() as u64 / 10).max(1);
            Duration::from_millis(rand::thread_rng().gen_range(0..max))
        };
        crate::time::delay_for(interval + jitter).await;
    }
}

async fn broadcast<T: Transport>(
    transport: T,
    store: WorldViewStore,
    timing: TimingConfig,
) -> Result<()> {
    loop {
        let message = Message::WorldView(store.snapshot().await).encode()?;
        match crate::time::timeout(timing.io_timeout(), transport.broadcast(message)).await {
            Some(Ok(())) => {}
            Some(Err(e)) => warn!(target: "net", "World view broadcast failed: {}", e),
            None => warn!(target: "net", "World view broadcast timed out"),
        }
        crate::time::delay_for(timing.broadcast_interval()).await;
    }
}

async fn liveness(
    mut monitor: LivenessMonitor,
    heartbeats: Receiver<(PeerId, Rank, Instant)>,
    updates: Sender<PeerUpdate>,
    interval: Duration,
) -> Result<()> {
    let mut tick = Timer::new();
    tick.start(interval);
    loop {
        let deadline = tick.clone();
        select! {
            heartbeat = heartbeats.recv().fuse() => match heartbeat {
                Ok((id, rank, at)) => monitor.heartbeat(&id, rank, at),
                Err(_) => return Err(Error::Terminated),
            },
            _ = deadline.expired().fuse() => {
                tick.start(interval);
                let update = monitor.poll(Instant::now());
                updates.send(update).await.map_err(|_| Error::Terminated)?;
            }
        }
    }
}

/// Runs the role controller on every liveness update. Only store writes
/// happen here, so liveness updates are consumed promptly.
struct Coordinator {
    store: WorldViewStore,
    rank: Rank,
    controller: RoleController,
    current_role: Arc<Mutex<Role>>,
    peer_updates: Receiver<PeerUpdate>,
    promotions: Sender<()>,
}

impl Coordinator {
    async fn run(mut self) -> Result<()> {
        loop {
            let update = self
                .peer_updates
                .recv()
                .await
                .map_err(|_| Error::Terminated)?;
            self.on_peer_update(update).await;
        }
    }

    async fn on_peer_update(&mut self, update: PeerUpdate) {
        self.store.set_alive(update.alive_ids()).await;
        for id in update.newly_lost.iter() {
            self.store.drop_peer(id).await;
        }

        let view = self.store.snapshot().await;
        let decision = self.controller.evaluate(&update, view.primary.as_ref());
        match decision {
            Decision::Promote { epoch } | Decision::Reassert { epoch } => {
                self.store.claim_primary(epoch, self.rank).await;
            }
            Decision::Stay | Decision::BecomeBackup | Decision::Demote => {}
        }
        *self.current_role.lock().await = self.controller.role();
        if let Decision::Promote { .. } = decision {
            // A pending wakeup already covers this promotion.
            let _ = self.promotions.try_send(());
        }
    }
}

/// Drives the optimizer while this node is primary: pulls peer replicas on
/// promotion, assigns pending calls every cycle and withdraws assignments
/// that were not served in time.
struct Assigner<H: Handoff, O: Optimizer> {
    store: WorldViewStore,
    peers: Vec<Peer>,
    timing: TimingConfig,
    current_role: Arc<Mutex<Role>>,
    handoff: H,
    adapter: AssignmentAdapter<O>,
    /// Confirmed requests by the record they were confirmed under.
    assignment_timers: BTreeMap<(Floor, HallButton), ((Option<PrimaryClaim>, u64), Timer)>,
    promotions: Receiver<()>,
}

impl<H: Handoff, O: Optimizer> Assigner<H, O> {
    async fn run(mut self) -> Result<()> {
        let promotions = self.promotions.clone();
        let mut tick = Timer::new();
        tick.start(self.timing.assign_interval());
        loop {
            let deadline = tick.clone();
            select! {
                promoted = promotions.recv().fuse() => match promoted {
                    Ok(()) => {
                        self.pull_world_views().await;
                        self.assignment_cycle().await;
                    }
                    Err(_) => return Err(Error::Terminated),
                },
                _ = deadline.expired().fuse() => {
                    tick.start(self.timing.assign_interval());
                    if *self.current_role.lock().await == Role::Primary {
                        self.check_assignment_timeouts().await;
                        self.assignment_cycle().await;
                    } else {
                        self.assignment_timers.clear();
                    }
                }
            }
        }
    }

    /// Merges the replicas held by every alive peer, so nothing the old
    /// primary had accepted is missed by the new one.
    async fn pull_world_views(&self) {
        let alive = self.store.alive().await;
        for peer in self.peers.iter().filter(|p| alive.contains(&p.id)) {
            let address = match peer.handoff_address {
                Some(ref address) => address,
                None => continue,
            };
            match crate::time::timeout(self.timing.io_timeout(), self.handoff.fetch(address)).await {
                Some(Ok(view)) => {
                    debug!(target: "role", "Pulled world view from {}", peer.id);
                    self.store.merge_remote(view).await;
                }
                Some(Err(e)) => warn!(target: "role", "Handoff from {} failed: {}", peer.id, e),
                None => warn!(target: "role", "Handoff from {} timed out", peer.id),
            }
        }
    }

    async fn assignment_cycle(&self) {
        let view = self.store.snapshot().await;
        let alive = self.store.alive().await;
        match self.adapter.assign(&view, &alive).await {
            Ok(assignments) => {
                if !assignments.is_empty() {
                    let applied = self.store.apply_assignments(&assignments).await;
                    debug!(target: "assign", "Applied {} assignments", applied);
                }
            }
            Err(e) => warn!(target: "assign", "Assignment failed, retrying next cycle: {}", e),
        }
    }

    /// Sends confirmed requests that were not served in time back for
    /// reassignment.
    async fn check_assignment_timeouts(&mut self) {
        let view = self.store.snapshot().await;
        let mut confirmed = BTreeMap::new();
        for (floor, button, request) in view.requests() {
            if request.status() == HallRequestStatus::Confirmed {
                confirmed.insert((floor, button), (request.claim.clone(), request.version));
            }
        }
        self.assignment_timers
            .retain(|key, entry| confirmed.get(key) == Some(&entry.0));

        let mut expired = Vec::new();
        for (key, record) in confirmed {
            let timeout = self.timing.assignment_timeout();
            let (_, timer) = self.assignment_timers.entry(key).or_insert_with(|| {
                let mut timer = Timer::new();
                timer.start(timeout);
                (record, timer)
            });
            if timer.timed_out() {
                expired.push(key);
            }
        }
        for (floor, button) in expired {
            warn!(
                target: "assign",
                "Hall call {:?} at floor {} not served in time; reassigning",
                button, floor
            );
            self.assignment_timers.remove(&(floor, button));
            self.store.reassign(floor, button).await;
        }
    }
}

#![allow(dead_code)]

use async_lock::Mutex;
use async_trait::async_trait;
use bytes::Bytes;
use futures::prelude::*;
use futures::select;
use liftnet::assign::{HraInput, HraOutput, Optimizer};
use liftnet::io::{HardwareCommand, HardwareEvent};
use liftnet::rpc::{Handoff, Transport};
use liftnet::time::Timer;
use liftnet::world_view::{Direction, Floor};
use liftnet::{Config, Error, Io, NodeHandle, PeerId, Role, WorldView, WorldViewStore};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

pub fn setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub const CONFIG_A: &str = r#"
id = "a"
address = "mem://a"
handoff_address = "mem://a"
[[peer]]
id = "b"
address = "mem://b"
handoff_address = "mem://b"
[[peer]]
id = "c"
address = "mem://c"
handoff_address = "mem://c"
"#;
pub const CONFIG_B: &str = r#"
id = "b"
address = "mem://b"
handoff_address = "mem://b"
[[peer]]
id = "a"
address = "mem://a"
handoff_address = "mem://a"
[[peer]]
id = "c"
address = "mem://c"
handoff_address = "mem://c"
"#;
pub const CONFIG_C: &str = r#"
id = "c"
address = "mem://c"
handoff_address = "mem://c"
[[peer]]
id = "a"
address = "mem://a"
handoff_address = "mem://a"
[[peer]]
id = "b"
address = "mem://b"
handoff_address = "mem://b"
"#;
pub const CONFIG_SOLO: &str = r#"
id = "solo"
address = "mem://solo"
floors = 6
"#;

/// Time for the simulated car to move one floor.
pub const FLOOR_TRAVEL: Duration = Duration::from_millis(1000);

#[derive(Default)]
struct NetworkInner {
    inboxes: BTreeMap<PeerId, async_channel::Sender<Bytes>>,
    stores: BTreeMap<String, (PeerId, WorldViewStore)>,
    disconnected: BTreeSet<PeerId>,
}

/// A lossy in-process network. Disconnected nodes neither send nor receive.
#[derive(Clone)]
pub struct Network {
    inner: Arc<Mutex<NetworkInner>>,
}

impl Network {
    pub fn new() -> Network {
        Network {
            inner: Arc::new(Mutex::new(NetworkInner::default())),
        }
    }

    pub async fn join(&self, id: &str) -> MemTransport {
        let (tx, rx) = async_channel::bounded(256);
        self.inner.lock().await.inboxes.insert(id.to_string(), tx);
        MemTransport {
            id: id.to_string(),
            network: self.clone(),
            inbox: rx,
        }
    }

    pub async fn serve_handoff(&self, address: &str, id: &str, store: WorldViewStore) {
        self.inner
            .lock()
            .await
            .stores
            .insert(address.to_string(), (id.to_string(), store));
    }

    pub async fn disconnect(&self, id: &str) {
        self.inner.lock().await.disconnected.insert(id.to_string());
    }

    pub async fn reconnect(&self, id: &str) {
        self.inner.lock().await.disconnected.remove(id);
    }
}

#[derive(Clone)]
pub struct MemTransport {
    id: PeerId,
    network: Network,
    inbox: async_channel::Receiver<Bytes>,
}

#[async_trait]
impl Transport for MemTransport {
    async fn broadcast(&self, message: Bytes) -> liftnet::Result<()> {
        let inner = self.network.inner.lock().await;
        if inner.disconnected.contains(&self.id) {
            return Ok(());
        }
        for (id, inbox) in inner.inboxes.iter() {
            if *id != self.id && !inner.disconnected.contains(id) {
                // Full inboxes drop, like a congested link.
                let _ = inbox.try_send(message.clone());
            }
        }
        Ok(())
    }

    async fn recv(&self) -> liftnet::Result<Bytes> {
        self.inbox.recv().await.map_err(|_| Error::Terminated)
    }
}

#[derive(Clone)]
pub struct MemHandoff {
    network: Network,
}

#[async_trait]
impl Handoff for MemHandoff {
    async fn fetch(&self, address: &str) -> liftnet::Result<WorldView> {
        let inner = self.network.inner.lock().await;
        match inner.stores.get(address) {
            Some((id, store)) if !inner.disconnected.contains(id) => Ok(store.snapshot().await),
            _ => Err(Error::Handoff(format!("{} unreachable", address))),
        }
    }
}

/// Hands every call to the closest car; ties go to the lowest id.
pub struct NearestOptimizer;

#[async_trait]
impl Optimizer for NearestOptimizer {
    async fn optimize(&self, input: &HraInput) -> liftnet::Result<HraOutput> {
        let floors = input.hall_requests.len();
        let mut output: HraOutput = input
            .states
            .keys()
            .map(|id| (id.clone(), vec![[false; 2]; floors]))
            .collect();
        for (floor, buttons) in input.hall_requests.iter().enumerate() {
            for button in 0..2 {
                if !buttons[button] {
                    continue;
                }
                let best = input
                    .states
                    .iter()
                    .min_by_key(|(id, s)| ((s.floor as i64 - floor as i64).abs(), (*id).clone()))
                    .map(|(id, _)| id.clone());
                if let Some(id) = best {
                    if let Some(matrix) = output.get_mut(&id) {
                        matrix[floor][button] = true;
                    }
                }
            }
        }
        Ok(output)
    }
}

/// Never answers; the node's optimizer timeout decides when it gives up.
pub struct StalledOptimizer;

#[async_trait]
impl Optimizer for StalledOptimizer {
    async fn optimize(&self, _input: &HraInput) -> liftnet::Result<HraOutput> {
        future::pending().await
    }
}

/// A car in a shaft: follows motor commands one floor per `FLOOR_TRAVEL`
/// and reports every floor it reaches.
async fn shaft(
    mut floor: Floor,
    floors: usize,
    events: async_channel::Sender<HardwareEvent>,
    commands: async_channel::Receiver<HardwareCommand>,
) {
    if events.send(HardwareEvent::FloorArrival(floor)).await.is_err() {
        return;
    }
    let mut motor = Direction::Stop;
    let mut travel = Timer::new();
    loop {
        let deadline = travel.clone();
        select! {
            command = commands.recv().fuse() => match command {
                Ok(HardwareCommand::MotorDirection(direction)) => {
                    if direction != motor {
                        motor = direction;
                        match motor {
                            Direction::Stop => travel.stop(),
                            _ => travel.start(FLOOR_TRAVEL),
                        }
                    }
                }
                Ok(_) => {}
                Err(_) => return,
            },
            _ = deadline.expired().fuse() => {
                floor = match motor {
                    Direction::Up => (floor + 1).min(floors - 1),
                    Direction::Down => floor.saturating_sub(1),
                    Direction::Stop => floor,
                };
                travel.start(FLOOR_TRAVEL);
                if events.send(HardwareEvent::FloorArrival(floor)).await.is_err() {
                    return;
                }
            }
        }
    }
}

pub struct TestNode {
    pub handle: NodeHandle,
    /// Injects hardware events, such as button presses, into the node.
    pub events: async_channel::Sender<HardwareEvent>,
}

impl TestNode {
    pub fn store(&self) -> &WorldViewStore {
        self.handle.store()
    }

    pub async fn press(&self, floor: Floor, button: liftnet::io::Button) {
        self.events
            .send(HardwareEvent::ButtonPress { floor, button })
            .await
            .unwrap();
    }
}

/// Starts a node from `config` on `network`, its car standing at `floor`.
pub async fn node(config: &str, network: &Network, floor: Floor) -> TestNode {
    node_with(config, network, floor, NearestOptimizer).await
}

pub async fn node_with<O: Optimizer>(
    config: &str,
    network: &Network,
    floor: Floor,
    optimizer: O,
) -> TestNode {
    let config = Config::parse(config).unwrap();
    let transport = network.join(&config.id).await;
    let handoff = MemHandoff {
        network: network.clone(),
    };
    let (events_tx, events_rx) = async_channel::bounded(64);
    let (commands_tx, commands_rx) = async_channel::bounded(64);
    tokio::spawn(shaft(floor, config.floors(), events_tx.clone(), commands_rx));

    let handle = liftnet::start(
        &config,
        transport,
        handoff,
        optimizer,
        Io {
            events: events_rx,
            commands: commands_tx,
        },
    );
    if let Some(ref address) = config.handoff_address {
        network
            .serve_handoff(address, &config.id, handle.store().clone())
            .await;
    }
    TestNode {
        handle,
        events: events_tx,
    }
}

/// Polls `store` until `check` holds, for up to 30 seconds of test time.
pub async fn wait_for_view<F>(store: &WorldViewStore, what: &str, check: F) -> WorldView
where
    F: Fn(&WorldView) -> bool,
{
    for _ in 0..600 {
        let view = store.snapshot().await;
        if check(&view) {
            return view;
        }
        liftnet::time::delay_for(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {} at {}", what, store.id());
}

pub async fn wait_for_role(node: &TestNode, role: Role) {
    for _ in 0..600 {
        if node.handle.role().await == role {
            return;
        }
        liftnet::time::delay_for(Duration::from_millis(50)).await;
    }
    panic!(
        "timed out waiting for {} to become {:?}",
        node.handle.id(),
        role
    );
}

//! The local car: turns assigned calls and hardware events into motor and
//! door commands, and reports its own state back to the world view.
use crate::error::{Error, Result};
use crate::io::{Button, HardwareCommand, HardwareEvent};
use crate::peer::PeerId;
use crate::requests::Requests;
use crate::store::WorldViewStore;
use crate::time::Timer;
use crate::world_view::{
    Behaviour, Direction, ElevatorState, Floor, HallButton, HallRequestStatus, WorldView,
};
use async_channel::{Receiver, Sender};
use futures::prelude::*;
use futures::select;
use log::{debug, info, trace, warn};
use std::collections::BTreeSet;
use std::time::Duration;

/// Something the dispatch task has to carry out on behalf of the car.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Command(HardwareCommand),
    /// A hall button was pressed here; it goes to the world view, not to us.
    RequestHall(Floor, HallButton),
    CompleteHall(Floor, HallButton),
    Publish(ElevatorState),
}

pub struct Dispatcher {
    id: PeerId,
    floors: usize,
    door_open: Duration,
    travel_timeout: Duration,

    floor: Option<Floor>,
    direction: Direction,
    behaviour: Behaviour,
    initializing: bool,
    cab: BTreeSet<Floor>,
    hall: BTreeSet<(Floor, HallButton)>,
    hall_lamps: BTreeSet<(Floor, HallButton)>,

    obstructed: bool,
    /// The doors were held open past a full door cycle.
    blocked: bool,
    /// The motor ran without reaching the next floor in time.
    stalled: bool,
    door: Timer,
    travel: Timer,

    lamps: Vec<[bool; 3]>,
    published: Option<ElevatorState>,
    actions: Vec<Action>,
}

impl Dispatcher {
    pub fn new(id: PeerId, floors: usize, door_open: Duration, travel_timeout: Duration) -> Dispatcher {
        Dispatcher {
            id,
            floors,
            door_open,
            travel_timeout,
            floor: None,
            direction: Direction::Stop,
            behaviour: Behaviour::Idle,
            initializing: false,
            cab: BTreeSet::new(),
            hall: BTreeSet::new(),
            hall_lamps: BTreeSet::new(),
            obstructed: false,
            blocked: false,
            stalled: false,
            door: Timer::new(),
            travel: Timer::new(),
            // Unknown lamp state; the first flush turns everything off.
            lamps: vec![[true; 3]; floors],
            published: None,
            actions: Vec::new(),
        }
    }

    pub fn state(&self) -> ElevatorState {
        ElevatorState {
            floor: self.floor,
            direction: self.direction,
            behaviour: self.behaviour,
            cab_requests: self.cab.clone(),
            available: !self.blocked && !self.stalled,
        }
    }

    pub fn door_timer(&self) -> Timer {
        self.door.clone()
    }

    pub fn travel_timer(&self) -> Timer {
        self.travel.clone()
    }

    /// Brings the car to a known floor. Without a floor reading the car
    /// drives down until the first sensor hit.
    pub fn start(&mut self) -> Vec<Action> {
        self.command(HardwareCommand::DoorLamp(false));
        if self.floor.is_none() {
            info!(target: "dispatch", "Floor unknown; moving down to initialize");
            self.initializing = true;
            self.direction = Direction::Down;
            self.behaviour = Behaviour::Moving;
            self.command(HardwareCommand::MotorDirection(Direction::Down));
            self.travel.start(self.travel_timeout);
        }
        self.flush()
    }

    pub fn on_event(&mut self, event: HardwareEvent) -> Vec<Action> {
        trace!(target: "dispatch", "Hardware event {:?}", event);
        match event {
            HardwareEvent::FloorArrival(floor) => self.on_floor_arrival(floor),
            HardwareEvent::ButtonPress { floor, button } => match button.hall() {
                Some(hall) => self.actions.push(Action::RequestHall(floor, hall)),
                None => self.on_cab_press(floor),
            },
            HardwareEvent::Obstruction(obstructed) => {
                debug!(target: "dispatch", "Obstruction {}", obstructed);
                self.obstructed = obstructed;
            }
            HardwareEvent::Stop(pressed) => {
                warn!(target: "dispatch", "Stop button {}", if pressed { "pressed" } else { "released" });
                self.command(HardwareCommand::StopLamp(pressed));
            }
        }
        self.flush()
    }

    /// Picks up the confirmed calls assigned to this car and the hall lamp
    /// state from a fresh world view.
    pub fn on_view(&mut self, view: &WorldView) -> Vec<Action> {
        self.hall = view
            .assigned_to(&self.id)
            .into_iter()
            .filter(|(floor, _)| *floor < self.floors)
            .collect();
        self.hall_lamps = view
            .requests()
            .filter(|(floor, _, r)| *floor < self.floors && r.status() == HallRequestStatus::Confirmed)
            .map(|(floor, button, _)| (floor, button))
            .collect();

        if self.behaviour == Behaviour::DoorOpen {
            if let Some(floor) = self.floor {
                let direction = self.direction;
                let served: Vec<HallButton> = self
                    .hall
                    .iter()
                    .filter(|(f, b)| Requests::should_clear_immediately(floor, direction, *f, (*b).into()))
                    .map(|(_, b)| *b)
                    .collect();
                if !served.is_empty() {
                    self.door.start(self.door_open);
                    for button in served {
                        self.hall.remove(&(floor, button));
                        self.actions.push(Action::CompleteHall(floor, button));
                    }
                }
            }
        }
        self.start_if_idle();
        self.flush()
    }

    /// Cab calls recovered from a peer after a restart.
    pub fn restore_cab_requests(&mut self, floors: BTreeSet<Floor>) -> Vec<Action> {
        let count = self.floors;
        self.cab.extend(floors.into_iter().filter(|f| *f < count));
        self.start_if_idle();
        self.flush()
    }

    pub fn on_door_timeout(&mut self) -> Vec<Action> {
        if self.behaviour != Behaviour::DoorOpen {
            self.door.stop();
            return self.flush();
        }
        if self.obstructed {
            if !self.blocked {
                warn!(target: "dispatch", "Doors obstructed; out of service until cleared");
            }
            self.blocked = true;
            self.door.start(self.door_open);
            return self.flush();
        }
        self.blocked = false;
        self.door.stop();

        let floor = match self.floor {
            Some(floor) => floor,
            None => return self.flush(),
        };
        let (direction, behaviour) = self.requests().choose_direction(floor, self.direction);
        self.direction = direction;
        self.behaviour = behaviour;
        match behaviour {
            Behaviour::DoorOpen => {
                self.door.start(self.door_open);
                self.clear_at_current_floor(floor);
            }
            Behaviour::Moving => {
                self.command(HardwareCommand::DoorLamp(false));
                self.command(HardwareCommand::MotorDirection(direction));
                self.travel.start(self.travel_timeout);
            }
            Behaviour::Idle => {
                self.command(HardwareCommand::DoorLamp(false));
            }
        }
        self.flush()
    }

    pub fn on_travel_timeout(&mut self) -> Vec<Action> {
        self.travel.stop();
        if self.behaviour == Behaviour::Moving {
            warn!(target: "dispatch", "No floor reached in {:?}; out of service", self.travel_timeout);
            self.stalled = true;
        }
        self.flush()
    }

    fn on_floor_arrival(&mut self, floor: Floor) {
        if floor >= self.floors {
            warn!(target: "dispatch", "Ignoring arrival at unknown floor {}", floor);
            return;
        }
        if self.floor != Some(floor) {
            self.command(HardwareCommand::FloorIndicator(floor));
        }
        self.floor = Some(floor);
        if self.stalled {
            info!(target: "dispatch", "Reached floor {}; back in service", floor);
            self.stalled = false;
        }

        if self.initializing {
            self.initializing = false;
            self.travel.stop();
            self.command(HardwareCommand::MotorDirection(Direction::Stop));
            self.direction = Direction::Stop;
            self.behaviour = Behaviour::Idle;
            self.start_if_idle();
            return;
        }
        if self.behaviour != Behaviour::Moving {
            return;
        }
        if self.requests().should_stop(floor, self.direction) {
            self.travel.stop();
            self.command(HardwareCommand::MotorDirection(Direction::Stop));
            self.open_doors(floor);
        } else {
            self.travel.start(self.travel_timeout);
        }
    }

    fn on_cab_press(&mut self, floor: Floor) {
        if floor >= self.floors {
            return;
        }
        if self.behaviour == Behaviour::DoorOpen
            && self
                .floor
                .map(|f| Requests::should_clear_immediately(f, self.direction, floor, Button::Cab))
                .unwrap_or(false)
        {
            self.door.start(self.door_open);
            return;
        }
        self.cab.insert(floor);
        self.start_if_idle();
    }

    fn start_if_idle(&mut self) {
        if self.behaviour != Behaviour::Idle || self.initializing {
            return;
        }
        let floor = match self.floor {
            Some(floor) => floor,
            None => return,
        };
        let (direction, behaviour) = self.requests().choose_direction(floor, self.direction);
        self.direction = direction;
        match behaviour {
            Behaviour::DoorOpen => self.open_doors(floor),
            Behaviour::Moving => {
                self.behaviour = Behaviour::Moving;
                self.command(HardwareCommand::MotorDirection(direction));
                self.travel.start(self.travel_timeout);
            }
            Behaviour::Idle => {}
        }
    }

    fn open_doors(&mut self, floor: Floor) {
        self.behaviour = Behaviour::DoorOpen;
        self.command(HardwareCommand::DoorLamp(true));
        self.door.start(self.door_open);
        self.clear_at_current_floor(floor);
    }

    fn clear_at_current_floor(&mut self, floor: Floor) {
        let mut requests = self.requests();
        for button in requests.clear_at_current_floor(floor, self.direction) {
            match button.hall() {
                Some(hall) => {
                    self.hall.remove(&(floor, hall));
                    self.actions.push(Action::CompleteHall(floor, hall));
                }
                None => {
                    self.cab.remove(&floor);
                }
            }
        }
    }

    fn requests(&self) -> Requests {
        let mut requests = Requests::new(self.floors);
        for floor in self.cab.iter() {
            requests.set(*floor, Button::Cab, true);
        }
        for (floor, button) in self.hall.iter() {
            requests.set(*floor, (*button).into(), true);
        }
        requests
    }

    fn command(&mut self, command: HardwareCommand) {
        self.actions.push(Action::Command(command));
    }

    /// Appends lamp changes and a state publication if anything changed,
    /// and hands the collected actions out.
    fn flush(&mut self) -> Vec<Action> {
        for floor in 0..self.floors {
            for button in Button::ALL.iter() {
                let on = match button.hall() {
                    Some(hall) => self.hall_lamps.contains(&(floor, hall)),
                    None => self.cab.contains(&floor),
                };
                if self.lamps[floor][button.index()] != on {
                    self.lamps[floor][button.index()] = on;
                    self.command(HardwareCommand::ButtonLamp {
                        floor,
                        button: *button,
                        on,
                    });
                }
            }
        }
        let state = self.state();
        if self.published.as_ref() != Some(&state) {
            self.published = Some(state.clone());
            self.actions.push(Action::Publish(state));
        }
        std::mem::replace(&mut self.actions, Vec::new())
    }
}

async fn apply(
    store: &WorldViewStore,
    commands: &Sender<HardwareCommand>,
    actions: Vec<Action>,
) -> Result<()> {
    for action in actions {
        match action {
            Action::Command(command) => commands
                .send(command)
                .await
                .map_err(|_| Error::Terminated)?,
            Action::RequestHall(floor, button) => {
                if store.request_hall(floor, button).await {
                    debug!(target: "dispatch", "Hall call {:?} at floor {}", button, floor);
                }
            }
            Action::CompleteHall(floor, button) => {
                if store.complete_hall_request(floor, button).await {
                    info!(target: "dispatch", "Served hall call {:?} at floor {}", button, floor);
                }
            }
            Action::Publish(state) => store.apply_local_elevator_state(state).await,
        }
    }
    Ok(())
}

/// Runs the car until the hardware goes away.
pub async fn run(
    mut dispatcher: Dispatcher,
    store: WorldViewStore,
    events: Receiver<HardwareEvent>,
    commands: Sender<HardwareCommand>,
    changes: Receiver<()>,
) -> Result<()> {
    apply(&store, &commands, dispatcher.start()).await?;
    loop {
        let door = dispatcher.door_timer();
        let travel = dispatcher.travel_timer();
        let actions = select! {
            event = events.recv().fuse() => match event {
                Ok(event) => dispatcher.on_event(event),
                Err(_) => {
                    info!(target: "dispatch", "Hardware events closed; stopping");
                    return Err(Error::Terminated);
                }
            },
            change = changes.recv().fuse() => {
                if change.is_err() {
                    return Err(Error::Terminated);
                }
                let mut actions = match store.take_restored_cab_requests().await {
                    Some(floors) => dispatcher.restore_cab_requests(floors),
                    None => Vec::new(),
                };
                actions.extend(dispatcher.on_view(&store.snapshot().await));
                actions
            },
            _ = door.expired().fuse() => dispatcher.on_door_timeout(),
            _ = travel.expired().fuse() => dispatcher.on_travel_timeout(),
        };
        apply(&store, &commands, actions).await?;
    }
}

//! Client for the elevator server (hardware or simulator) speaking the
//! fixed 4-byte TCP protocol. Inputs are polled and turned into edge events.
use crate::error::{Error, Result};
use crate::io::{Button, HardwareCommand, HardwareEvent};
use crate::time::Timer;
use crate::world_view::{Direction, Floor};
use async_channel::{Receiver, Sender};
use futures::prelude::*;
use futures::select;
use log::{debug, info, trace, warn};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const POLL_INTERVAL: Duration = Duration::from_millis(25);
const RECONNECT_BACKOFF: Duration = Duration::from_millis(100);
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

const MOTOR_DIRECTION: u8 = 1;
const BUTTON_LAMP: u8 = 2;
const FLOOR_INDICATOR: u8 = 3;
const DOOR_LAMP: u8 = 4;
const STOP_LAMP: u8 = 5;
const BUTTON: u8 = 6;
const FLOOR: u8 = 7;
const STOP: u8 = 8;
const OBSTRUCTION: u8 = 9;

pub fn encode(command: HardwareCommand) -> [u8; 4] {
    match command {
        HardwareCommand::MotorDirection(direction) => {
            let d = match direction {
                Direction::Up => 1,
                Direction::Down => -1i8 as u8,
                Direction::Stop => 0,
            };
            [MOTOR_DIRECTION, d, 0, 0]
        }
        HardwareCommand::ButtonLamp { floor, button, on } => {
            [BUTTON_LAMP, button.index() as u8, floor as u8, on as u8]
        }
        HardwareCommand::FloorIndicator(floor) => [FLOOR_INDICATOR, floor as u8, 0, 0],
        HardwareCommand::DoorLamp(on) => [DOOR_LAMP, on as u8, 0, 0],
        HardwareCommand::StopLamp(on) => [STOP_LAMP, on as u8, 0, 0],
    }
}

fn timed_out(what: &str) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("elevator server did not answer {}", what),
    ))
}

pub struct ElevatorServer {
    address: String,
    stream: TcpStream,
    floors: usize,
    timeout: Duration,
}

impl ElevatorServer {
    pub async fn connect(address: &str, floors: usize, timeout: Duration) -> Result<ElevatorServer> {
        let stream = open(address, timeout).await?;
        info!(target: "dispatch", "Connected to elevator server at {}", address);
        Ok(ElevatorServer {
            address: address.to_string(),
            stream,
            floors,
            timeout,
        })
    }

    async fn reopen(&mut self) -> Result<()> {
        self.stream = open(&self.address, self.timeout).await?;
        info!(target: "dispatch", "Reconnected to elevator server at {}", self.address);
        Ok(())
    }

    pub async fn execute(&mut self, command: HardwareCommand) -> Result<()> {
        trace!(target: "dispatch", "Command {:?}", command);
        crate::time::timeout(self.timeout, self.stream.write_all(&encode(command)))
            .await
            .ok_or_else(|| timed_out("a command"))??;
        Ok(())
    }

    async fn query(&mut self, request: [u8; 4]) -> Result<[u8; 4]> {
        let stream = &mut self.stream;
        let exchange = async move {
            stream.write_all(&request).await?;
            let mut reply = [0u8; 4];
            stream.read_exact(&mut reply).await?;
            Ok::<_, std::io::Error>(reply)
        };
        let reply = crate::time::timeout(self.timeout, exchange)
            .await
            .ok_or_else(|| timed_out("a query"))??;
        if reply[0] != request[0] {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("reply {:?} to request {:?}", reply, request),
            )));
        }
        Ok(reply)
    }

    pub async fn button(&mut self, floor: Floor, button: Button) -> Result<bool> {
        let reply = self.query([BUTTON, button.index() as u8, floor as u8, 0]).await?;
        Ok(reply[1] != 0)
    }

    pub async fn floor(&mut self) -> Result<Option<Floor>> {
        let reply = self.query([FLOOR, 0, 0, 0]).await?;
        Ok(if reply[1] != 0 {
            Some(reply[2] as Floor)
        } else {
            None
        })
    }

    pub async fn stop_button(&mut self) -> Result<bool> {
        Ok(self.query([STOP, 0, 0, 0]).await?[1] != 0)
    }

    pub async fn obstruction(&mut self) -> Result<bool> {
        Ok(self.query([OBSTRUCTION, 0, 0, 0]).await?[1] != 0)
    }
}

async fn open(address: &str, timeout: Duration) -> Result<TcpStream> {
    let stream = crate::time::timeout(timeout, TcpStream::connect(address))
        .await
        .ok_or_else(|| timed_out("the connection"))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Last polled input values, for edge detection.
struct Inputs {
    buttons: Vec<[bool; 3]>,
    floor: Option<Floor>,
    stop: bool,
    obstruction: Option<bool>,
}

/// Latest value written to every output. A reconnected server starts from
/// scratch, so these are written again.
#[derive(Default)]
struct Outputs {
    motor: Option<Direction>,
    floor_indicator: Option<Floor>,
    door: Option<bool>,
    stop: Option<bool>,
    lamps: BTreeMap<(Floor, Button), bool>,
}

impl Outputs {
    fn record(&mut self, command: HardwareCommand) {
        match command {
            HardwareCommand::MotorDirection(direction) => self.motor = Some(direction),
            HardwareCommand::ButtonLamp { floor, button, on } => {
                self.lamps.insert((floor, button), on);
            }
            HardwareCommand::FloorIndicator(floor) => self.floor_indicator = Some(floor),
            HardwareCommand::DoorLamp(on) => self.door = Some(on),
            HardwareCommand::StopLamp(on) => self.stop = Some(on),
        }
    }

    /// Lamps first, the motor last.
    fn replay(&self) -> Vec<HardwareCommand> {
        let mut commands: Vec<HardwareCommand> = self
            .lamps
            .iter()
            .map(|(&(floor, button), &on)| HardwareCommand::ButtonLamp { floor, button, on })
            .collect();
        commands.extend(self.floor_indicator.map(HardwareCommand::FloorIndicator));
        commands.extend(self.door.map(HardwareCommand::DoorLamp));
        commands.extend(self.stop.map(HardwareCommand::StopLamp));
        commands.extend(self.motor.map(HardwareCommand::MotorDirection));
        commands
    }
}

async fn poll(server: &mut ElevatorServer, last: &mut Inputs) -> Result<Vec<HardwareEvent>> {
    let mut events = Vec::new();
    for floor in 0..server.floors {
        for button in Button::ALL.iter() {
            let pressed = server.button(floor, *button).await?;
            let was = &mut last.buttons[floor][button.index()];
            if pressed && !*was {
                events.push(HardwareEvent::ButtonPress {
                    floor,
                    button: *button,
                });
            }
            *was = pressed;
        }
    }
    let floor = server.floor().await?;
    if let Some(f) = floor {
        if last.floor != Some(f) {
            events.push(HardwareEvent::FloorArrival(f));
        }
    }
    last.floor = floor;

    let stop = server.stop_button().await?;
    if stop != last.stop {
        events.push(HardwareEvent::Stop(stop));
    }
    last.stop = stop;

    let obstruction = server.obstruction().await?;
    if Some(obstruction) != last.obstruction {
        events.push(HardwareEvent::Obstruction(obstruction));
    }
    last.obstruction = Some(obstruction);
    Ok(events)
}

/// Reconnects with a doubling backoff. Commands arriving meanwhile are only
/// recorded, then every output is written again once the server is back.
/// Returns false if the command channel closed.
async fn reconnect(
    server: &mut ElevatorServer,
    commands: &Receiver<HardwareCommand>,
    outputs: &mut Outputs,
) -> bool {
    let mut backoff = RECONNECT_BACKOFF;
    loop {
        let mut wait = Timer::new();
        wait.start(backoff);
        while !wait.timed_out() {
            let deadline = wait.clone();
            select! {
                command = commands.recv().fuse() => match command {
                    Ok(command) => outputs.record(command),
                    Err(_) => return false,
                },
                _ = deadline.expired().fuse() => {},
            }
        }
        match server.reopen().await {
            Ok(()) => break,
            Err(e) => {
                warn!(target: "dispatch", "Elevator server unreachable: {}", e);
                backoff = (backoff * 2).min(MAX_RECONNECT_BACKOFF);
            }
        }
    }
    for command in outputs.replay() {
        if let Err(e) = server.execute(command).await {
            warn!(target: "dispatch", "Restoring outputs failed: {}", e);
            break;
        }
    }
    true
}

/// Forwards commands to the server and polled input edges to `events`
/// until either channel closes. A lost server connection is re-established;
/// it never ends the driver.
pub async fn run(
    mut server: ElevatorServer,
    events: Sender<HardwareEvent>,
    commands: Receiver<HardwareCommand>,
) -> Result<()> {
    let mut last = Inputs {
        buttons: vec![[false; 3]; server.floors],
        floor: None,
        stop: false,
        obstruction: None,
    };
    let mut outputs = Outputs::default();
    let mut poll_timer = Timer::new();
    poll_timer.start(POLL_INTERVAL);
    loop {
        let deadline = poll_timer.clone();
        let step = select! {
            command = commands.recv().fuse() => match command {
                Ok(command) => {
                    outputs.record(command);
                    server.execute(command).await.map(|()| Vec::new())
                }
                Err(_) => {
                    debug!(target: "dispatch", "Command channel closed; driver stopping");
                    return Ok(());
                }
            },
            _ = deadline.expired().fuse() => {
                poll_timer.start(POLL_INTERVAL);
                poll(&mut server, &mut last).await
            }
        };
        match step {
            Ok(polled) => {
                for event in polled {
                    if events.send(event).await.is_err() {
                        return Ok(());
                    }
                }
            }
            Err(e) => {
                warn!(target: "dispatch", "Elevator server connection lost: {}", e);
                if !reconnect(&mut server, &commands, &mut outputs).await {
                    return Ok(());
                }
                poll_timer.start(POLL_INTERVAL);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn commands_match_wire_format() {
        assert_eq!(encode(HardwareCommand::MotorDirection(Direction::Down)), [1, 255, 0, 0]);
        assert_eq!(
            encode(HardwareCommand::ButtonLamp {
                floor: 3,
                button: Button::Cab,
                on: true
            }),
            [2, 2, 3, 1]
        );
        assert_eq!(encode(HardwareCommand::FloorIndicator(2)), [3, 2, 0, 0]);
        assert_eq!(encode(HardwareCommand::DoorLamp(true)), [4, 1, 0, 0]);
        assert_eq!(encode(HardwareCommand::StopLamp(false)), [5, 0, 0, 0]);
    }

    /// A simulator with the car at floor 2 and the cab button for floor 1
    /// held down. Every write that is not a query is forwarded.
    async fn serve(mut socket: TcpStream, writes: Sender<[u8; 4]>) {
        let mut buf = [0u8; 4];
        while socket.read_exact(&mut buf).await.is_ok() {
            let reply = match buf[0] {
                BUTTON => Some([BUTTON, (buf[1] == 2 && buf[2] == 1) as u8, 0, 0]),
                FLOOR => Some([FLOOR, 1, 2, 0]),
                STOP | OBSTRUCTION => Some([buf[0], 0, 0, 0]),
                _ => None,
            };
            match reply {
                Some(reply) => socket.write_all(&reply).await.unwrap(),
                None => {
                    let _ = writes.send(buf).await;
                }
            }
        }
    }

    async fn simulator(listener: TcpListener, writes: Sender<[u8; 4]>) {
        let (socket, _) = listener.accept().await.unwrap();
        serve(socket, writes).await;
    }

    #[tokio::test]
    async fn polls_edges_and_forwards_commands() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (writes_tx, writes_rx) = async_channel::unbounded();
        tokio::spawn(simulator(listener, writes_tx));

        let server = ElevatorServer::connect(&address, 4, Duration::from_secs(1))
            .await
            .unwrap();
        let (events_tx, events_rx) = async_channel::bounded(16);
        let (commands_tx, commands_rx) = async_channel::bounded(16);
        let driver = tokio::spawn(run(server, events_tx, commands_rx));

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(events_rx.recv().await.unwrap());
        }
        assert!(seen.contains(&HardwareEvent::ButtonPress {
            floor: 1,
            button: Button::Cab
        }));
        assert!(seen.contains(&HardwareEvent::FloorArrival(2)));
        assert!(seen.contains(&HardwareEvent::Obstruction(false)));

        crate::time::delay_for(POLL_INTERVAL * 4).await;
        assert!(events_rx.try_recv().is_err(), "held inputs are reported once");

        commands_tx.send(HardwareCommand::DoorLamp(true)).await.unwrap();
        assert_eq!(writes_rx.recv().await.unwrap(), [4, 1, 0, 0]);

        drop(commands_tx);
        assert!(driver.await.unwrap().is_ok());
    }

    #[test]
    fn outputs_replay_latest_values_motor_last() {
        let mut outputs = Outputs::default();
        outputs.record(HardwareCommand::MotorDirection(Direction::Up));
        outputs.record(HardwareCommand::ButtonLamp {
            floor: 2,
            button: Button::HallDown,
            on: true,
        });
        outputs.record(HardwareCommand::DoorLamp(true));
        outputs.record(HardwareCommand::DoorLamp(false));
        outputs.record(HardwareCommand::MotorDirection(Direction::Stop));
        assert_eq!(
            outputs.replay(),
            vec![
                HardwareCommand::ButtonLamp {
                    floor: 2,
                    button: Button::HallDown,
                    on: true
                },
                HardwareCommand::DoorLamp(false),
                HardwareCommand::MotorDirection(Direction::Stop),
            ]
        );
    }

    #[tokio::test]
    async fn lost_connection_is_reestablished() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (writes_tx, writes_rx) = async_channel::unbounded();
        tokio::spawn(async move {
            let (first, _) = listener.accept().await.unwrap();
            drop(first);
            simulator(listener, writes_tx).await;
        });

        let server = ElevatorServer::connect(&address, 4, Duration::from_millis(200))
            .await
            .unwrap();
        let (events_tx, events_rx) = async_channel::bounded(16);
        let (commands_tx, commands_rx) = async_channel::bounded(16);
        let driver = tokio::spawn(run(server, events_tx, commands_rx));
        commands_tx.send(HardwareCommand::DoorLamp(true)).await.unwrap();

        assert_eq!(writes_rx.recv().await.unwrap(), [4, 1, 0, 0], "outputs restored");
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(events_rx.recv().await.unwrap());
        }
        assert!(seen.contains(&HardwareEvent::FloorArrival(2)));

        drop(commands_tx);
        assert!(driver.await.unwrap().is_ok());
    }
}

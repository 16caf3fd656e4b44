//! The hardware boundary: events in, commands out.
use crate::world_view::{Direction, Floor, HallButton};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Button {
    HallUp,
    HallDown,
    Cab,
}

impl Button {
    pub const ALL: [Button; 3] = [Button::HallUp, Button::HallDown, Button::Cab];

    pub fn index(self) -> usize {
        match self {
            Button::HallUp => 0,
            Button::HallDown => 1,
            Button::Cab => 2,
        }
    }

    pub fn hall(self) -> Option<HallButton> {
        match self {
            Button::HallUp => Some(HallButton::Up),
            Button::HallDown => Some(HallButton::Down),
            Button::Cab => None,
        }
    }
}

impl From<HallButton> for Button {
    fn from(b: HallButton) -> Self {
        match b {
            HallButton::Up => Button::HallUp,
            HallButton::Down => Button::HallDown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareEvent {
    FloorArrival(Floor),
    ButtonPress { floor: Floor, button: Button },
    Obstruction(bool),
    Stop(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareCommand {
    MotorDirection(Direction),
    ButtonLamp { floor: Floor, button: Button, on: bool },
    FloorIndicator(Floor),
    DoorLamp(bool),
    StopLamp(bool),
}

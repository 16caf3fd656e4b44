//! Which way a single car should go, given the calls it has to serve.
use crate::io::Button;
use crate::world_view::{Behaviour, Direction, Floor};

/// The calls one car serves, indexed by floor then `Button::index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requests {
    matrix: Vec<[bool; 3]>,
}

impl Requests {
    pub fn new(floors: usize) -> Requests {
        Requests {
            matrix: vec![[false; 3]; floors],
        }
    }

    pub fn set(&mut self, floor: Floor, button: Button, on: bool) {
        if let Some(f) = self.matrix.get_mut(floor) {
            f[button.index()] = on;
        }
    }

    pub fn get(&self, floor: Floor, button: Button) -> bool {
        self.matrix
            .get(floor)
            .map(|f| f[button.index()])
            .unwrap_or(false)
    }

    pub fn above(&self, floor: Floor) -> bool {
        self.matrix
            .iter()
            .skip(floor + 1)
            .any(|f| f.iter().any(|b| *b))
    }

    pub fn below(&self, floor: Floor) -> bool {
        self.matrix.iter().take(floor).any(|f| f.iter().any(|b| *b))
    }

    pub fn here(&self, floor: Floor) -> bool {
        self.matrix
            .get(floor)
            .map(|f| f.iter().any(|b| *b))
            .unwrap_or(false)
    }

    pub fn choose_direction(&self, floor: Floor, direction: Direction) -> (Direction, Behaviour) {
        let (above, here, below) = (self.above(floor), self.here(floor), self.below(floor));
        match direction {
            Direction::Up if above => (Direction::Up, Behaviour::Moving),
            Direction::Up if here => (Direction::Down, Behaviour::DoorOpen),
            Direction::Up if below => (Direction::Down, Behaviour::Moving),
            Direction::Down if below => (Direction::Down, Behaviour::Moving),
            Direction::Down if here => (Direction::Up, Behaviour::DoorOpen),
            Direction::Down if above => (Direction::Up, Behaviour::Moving),
            Direction::Stop if here => (Direction::Stop, Behaviour::DoorOpen),
            Direction::Stop if above => (Direction::Up, Behaviour::Moving),
            Direction::Stop if below => (Direction::Down, Behaviour::Moving),
            _ => (Direction::Stop, Behaviour::Idle),
        }
    }

    pub fn should_stop(&self, floor: Floor, direction: Direction) -> bool {
        match direction {
            Direction::Down => {
                self.get(floor, Button::HallDown) || self.get(floor, Button::Cab) || !self.below(floor)
            }
            Direction::Up => {
                self.get(floor, Button::HallUp) || self.get(floor, Button::Cab) || !self.above(floor)
            }
            Direction::Stop => true,
        }
    }

    /// A call at the floor where the doors already stand open, and that the
    /// car serves in its current direction, needs no new stop.
    pub fn should_clear_immediately(
        floor: Floor,
        direction: Direction,
        call_floor: Floor,
        button: Button,
    ) -> bool {
        floor == call_floor
            && match (direction, button) {
                (_, Button::Cab) => true,
                (Direction::Stop, _) => true,
                (Direction::Up, Button::HallUp) => true,
                (Direction::Down, Button::HallDown) => true,
                _ => false,
            }
    }

    /// Clears the calls served by opening the doors here, only taking the
    /// hall call in the opposite direction if nothing lies ahead. Returns the
    /// cleared buttons.
    pub fn clear_at_current_floor(&mut self, floor: Floor, direction: Direction) -> Vec<Button> {
        let mut cleared = Vec::new();
        let mut clear = |requests: &mut Requests, button: Button| {
            if requests.get(floor, button) {
                requests.set(floor, button, false);
                cleared.push(button);
            }
        };
        clear(self, Button::Cab);
        match direction {
            Direction::Up => {
                if !self.above(floor) && !self.get(floor, Button::HallUp) {
                    clear(self, Button::HallDown);
                }
                clear(self, Button::HallUp);
            }
            Direction::Down => {
                if !self.below(floor) && !self.get(floor, Button::HallDown) {
                    clear(self, Button::HallUp);
                }
                clear(self, Button::HallDown);
            }
            Direction::Stop => {
                clear(self, Button::HallUp);
                clear(self, Button::HallDown);
            }
        }
        cleared
    }
}

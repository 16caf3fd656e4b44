//! Bridge between the world view and the external hall request optimizer.
use crate::error::{Error, Result};
use crate::peer::PeerId;
use crate::world_view::{Behaviour, Direction, Floor, HallButton, WorldView};
use async_trait::async_trait;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

/// Hall calls handed to each peer.
pub type Assignments = BTreeMap<PeerId, BTreeSet<(Floor, HallButton)>>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HraElevatorState {
    pub behaviour: Behaviour,
    pub floor: Floor,
    pub direction: Direction,
    pub cab_requests: Vec<bool>,
}

/// Input document of the optimizer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HraInput {
    pub hall_requests: Vec<[bool; 2]>,
    pub states: BTreeMap<PeerId, HraElevatorState>,
}

/// Output document of the optimizer: per peer, the hall matrix it serves.
pub type HraOutput = BTreeMap<PeerId, Vec<[bool; 2]>>;

/// A black-box, pure function from the hall matrix and elevator states to
/// per-elevator assignments. It may fail; failures are never fatal.
#[async_trait]
pub trait Optimizer: Send + Sync + 'static {
    async fn optimize(&self, input: &HraInput) -> Result<HraOutput>;
}

/// Runs an external executable as `<path> [args..] -i <json>` and reads the
/// assignment as JSON from its standard output.
#[derive(Clone, Debug)]
pub struct ExecutableOptimizer {
    path: PathBuf,
    args: Vec<String>,
}

impl ExecutableOptimizer {
    pub fn new<P: Into<PathBuf>>(path: P, args: Vec<String>) -> ExecutableOptimizer {
        ExecutableOptimizer {
            path: path.into(),
            args,
        }
    }
}

#[async_trait]
impl Optimizer for ExecutableOptimizer {
    async fn optimize(&self, input: &HraInput) -> Result<HraOutput> {
        let json = serde_json::to_string(input)?;
        let output = tokio::process::Command::new(&self.path)
            .args(&self.args)
            .arg("-i")
            .arg(&json)
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::Optimizer(format!(
                "{} exited with {}: {}",
                self.path.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

pub struct AssignmentAdapter<O: Optimizer> {
    optimizer: O,
    timeout: Duration,
}

impl<O: Optimizer> AssignmentAdapter<O> {
    pub fn new(optimizer: O, timeout: Duration) -> AssignmentAdapter<O> {
        AssignmentAdapter { optimizer, timeout }
    }

    /// Packages the pending hall calls and every eligible elevator. Returns
    /// `None` when there is nothing to assign or nobody to assign it to.
    pub fn build_input(view: &WorldView, alive: &BTreeSet<PeerId>) -> Option<HraInput> {
        let pending = view.pending(alive);
        if pending.is_empty() {
            return None;
        }
        let floors = view.floors();
        let mut hall_requests = vec![[false; 2]; floors];
        for (floor, button) in pending {
            hall_requests[floor][button.index()] = true;
        }

        let states: BTreeMap<PeerId, HraElevatorState> = view
            .elevators
            .iter()
            .filter(|(id, entry)| alive.contains(*id) && entry.state.available)
            .filter_map(|(id, entry)| {
                let state = &entry.state;
                let floor = state.floor?.min(floors - 1);
                let cab_requests = (0..floors).map(|f| state.cab_requests.contains(&f)).collect();
                Some((
                    id.clone(),
                    HraElevatorState {
                        behaviour: state.behaviour,
                        floor,
                        direction: state.direction,
                        cab_requests,
                    },
                ))
            })
            .collect();
        if states.is_empty() {
            return None;
        }
        Some(HraInput {
            hall_requests,
            states,
        })
    }

    /// Runs one assignment cycle. Optimizer errors, timeouts and malformed
    /// output all surface as `Err`; the caller leaves the requests pending
    /// and retries next cycle.
    pub async fn assign(&self, view: &WorldView, alive: &BTreeSet<PeerId>) -> Result<Assignments> {
        let input = match Self::build_input(view, alive) {
            Some(input) => input,
            None => return Ok(Assignments::new()),
        };
        trace!(target: "assign", "Optimizer input: {:?}", input);
        let output = crate::time::timeout(self.timeout, self.optimizer.optimize(&input))
            .await
            .ok_or(Error::OptimizerTimeout)??;
        let assignments = decode(&input, output)?;
        debug!(target: "assign", "Assignments: {:?}", assignments);
        Ok(assignments)
    }
}

/// Validates the optimizer output against the input it was given and keeps
/// only hall calls that were actually pending.
fn decode(input: &HraInput, output: HraOutput) -> Result<Assignments> {
    let floors = input.hall_requests.len();
    let mut assignments = Assignments::new();
    for (id, matrix) in output {
        if !input.states.contains_key(&id) {
            return Err(Error::Optimizer(format!("unknown elevator {} in output", id)));
        }
        if matrix.len() != floors {
            return Err(Error::Optimizer(format!(
                "expected {} floors for {}, got {}",
                floors,
                id,
                matrix.len()
            )));
        }
        let mut mine = BTreeSet::new();
        for (floor, buttons) in matrix.iter().enumerate() {
            for button in HallButton::ALL.iter() {
                if !buttons[button.index()] {
                    continue;
                }
                if input.hall_requests[floor][button.index()] {
                    mine.insert((floor, *button));
                } else {
                    warn!(
                        target: "assign",
                        "Optimizer assigned {:?} at floor {} to {} but it was not pending",
                        button, floor, id
                    );
                }
            }
        }
        if !mine.is_empty() {
            assignments.insert(id, mine);
        }
    }
    Ok(assignments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world_view::{ElevatorEntry, ElevatorState};

    struct Fixed(HraOutput);

    #[async_trait]
    impl Optimizer for Fixed {
        async fn optimize(&self, _input: &HraInput) -> Result<HraOutput> {
            Ok(self.0.clone())
        }
    }

    struct Failing;

    #[async_trait]
    impl Optimizer for Failing {
        async fn optimize(&self, _input: &HraInput) -> Result<HraOutput> {
            Err(Error::Optimizer("exit status 1".to_string()))
        }
    }

    struct Slow;

    #[async_trait]
    impl Optimizer for Slow {
        async fn optimize(&self, _input: &HraInput) -> Result<HraOutput> {
            crate::time::delay_for(Duration::from_secs(60)).await;
            Ok(HraOutput::new())
        }
    }

    fn alive(ids: &[&str]) -> BTreeSet<PeerId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn view() -> WorldView {
        let mut view = WorldView::new("a".to_string(), 4, 0);
        for (id, floor) in [("a", 0), ("b", 3)].iter() {
            view.elevators.insert(
                id.to_string(),
                ElevatorEntry {
                    sequence: 1,
                    state: ElevatorState {
                        floor: Some(*floor),
                        cab_requests: [1].iter().cloned().collect(),
                        ..ElevatorState::default()
                    },
                },
            );
        }
        view.request_hall(2, HallButton::Up, &"a".to_string());
        view
    }

    fn matrix(floor: Floor, button: HallButton) -> Vec<[bool; 2]> {
        let mut m = vec![[false; 2]; 4];
        m[floor][button.index()] = true;
        m
    }

    #[test]
    fn input_matches_optimizer_contract() {
        let input = AssignmentAdapter::<Failing>::build_input(&view(), &alive(&["a", "b"])).unwrap();
        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(json["hallRequests"][2], serde_json::json!([true, false]));
        assert_eq!(json["states"]["b"]["behaviour"], "idle");
        assert_eq!(json["states"]["b"]["direction"], "stop");
        assert_eq!(json["states"]["b"]["floor"], 3);
        assert_eq!(
            json["states"]["a"]["cabRequests"],
            serde_json::json!([false, true, false, false])
        );
    }

    #[test]
    fn input_skips_lost_and_unavailable_elevators() {
        let mut v = view();
        v.elevators.get_mut("b").unwrap().state.available = false;
        let input = AssignmentAdapter::<Failing>::build_input(&v, &alive(&["a", "b"])).unwrap();
        assert_eq!(input.states.keys().collect::<Vec<_>>(), vec!["a"]);

        let input = AssignmentAdapter::<Failing>::build_input(&view(), &alive(&["b"])).unwrap();
        assert_eq!(input.states.keys().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn nothing_pending_means_no_input() {
        let mut v = view();
        v.complete_hall_request(2, HallButton::Up);
        assert!(AssignmentAdapter::<Failing>::build_input(&v, &alive(&["a"])).is_none());
    }

    #[tokio::test]
    async fn assigns_pending_requests() {
        let mut output = HraOutput::new();
        output.insert("b".to_string(), matrix(2, HallButton::Up));
        output.insert("a".to_string(), matrix(0, HallButton::Down));
        let adapter = AssignmentAdapter::new(Fixed(output), Duration::from_secs(1));

        let assignments = adapter.assign(&view(), &alive(&["a", "b"])).await.unwrap();
        assert_eq!(assignments.len(), 1, "non-pending calls are discarded");
        assert_eq!(
            assignments["b"],
            [(2, HallButton::Up)].iter().cloned().collect()
        );
    }

    #[tokio::test]
    async fn malformed_output_is_rejected() {
        let mut output = HraOutput::new();
        output.insert("z".to_string(), matrix(2, HallButton::Up));
        let adapter = AssignmentAdapter::new(Fixed(output), Duration::from_secs(1));
        assert!(adapter.assign(&view(), &alive(&["a", "b"])).await.is_err());

        let mut output = HraOutput::new();
        output.insert("a".to_string(), vec![[true, false]]);
        let adapter = AssignmentAdapter::new(Fixed(output), Duration::from_secs(1));
        assert!(adapter.assign(&view(), &alive(&["a", "b"])).await.is_err());
    }

    #[tokio::test]
    async fn failure_is_reported_not_raised() {
        let adapter = AssignmentAdapter::new(Failing, Duration::from_secs(1));
        match adapter.assign(&view(), &alive(&["a"])).await {
            Err(Error::Optimizer(_)) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_optimizer_times_out() {
        let adapter = AssignmentAdapter::new(Slow, Duration::from_millis(100));
        match adapter.assign(&view(), &alive(&["a"])).await {
            Err(Error::OptimizerTimeout) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_executable_is_an_error() {
        let adapter = AssignmentAdapter::new(
            ExecutableOptimizer::new("/nonexistent/hall_request_assigner", Vec::new()),
            Duration::from_secs(1),
        );
        assert!(adapter.assign(&view(), &alive(&["a"])).await.is_err());
    }
}

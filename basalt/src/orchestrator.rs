use crate::{
    config::AccelConfig,
    error::AccelError,
    geometry::InstanceDesc,
    job::{JobId, JobReport},
    task::{TaskOutput, TaskPoll},
    top::TopResult,
};
use std::mem;
use strum::{Display, IntoStaticStr};

/// Per-frame change signals for one structure set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SceneChanges {
    /// Topology or the set of geometries changed.
    pub geometry_changed: bool,
    /// Only instance placements moved.
    pub transform_only_changed: bool,
}

impl SceneChanges {
    pub const NONE: Self = Self {
        geometry_changed: false,
        transform_only_changed: false,
    };

    pub fn any(&self) -> bool {
        self.geometry_changed || self.transform_only_changed
    }

    fn merge(&mut self, other: SceneChanges) {
        self.geometry_changed |= other.geometry_changed;
        self.transform_only_changed |= other.transform_only_changed;
    }
}

/// Supplies change signals every frame and a full snapshot whenever a rebuild starts.
pub trait SceneSource {
    fn changes(&mut self, set: &str) -> SceneChanges;

    fn snapshot(&mut self, set: &str) -> Vec<InstanceDesc>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "kebab_case")]
pub enum SpawnReason {
    Forced,
    GeometryChanged,
    TransformsChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "kebab_case")]
pub enum Decision {
    Idle,
    InProgress,
    CoolingDown,
    Spawn(SpawnReason),
    Faulted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecisionInputs {
    pub dirty: SceneChanges,
    pub force: bool,
    pub in_progress: bool,
    pub cooldown: u32,
    pub faulted: bool,
}

/// The per-frame decision table.
pub fn decide(inputs: &DecisionInputs) -> Decision {
    if inputs.in_progress {
        Decision::InProgress
    } else if inputs.faulted {
        Decision::Faulted
    } else if inputs.force {
        Decision::Spawn(SpawnReason::Forced)
    } else if inputs.cooldown > 0 {
        Decision::CoolingDown
    } else if inputs.dirty.geometry_changed {
        Decision::Spawn(SpawnReason::GeometryChanged)
    } else if inputs.dirty.transform_only_changed {
        Decision::Spawn(SpawnReason::TransformsChanged)
    } else {
        Decision::Idle
    }
}

struct InFlight {
    job: JobId,
    output: TaskOutput<TopResult>,
    consumed: SceneChanges,
    forced: bool,
}

pub enum Completion {
    Published(JobReport),
    Failed(AccelError),
}

/// Rebuild bookkeeping for one structure set.
pub struct RebuildState {
    dirty: SceneChanges,
    force: bool,
    cooldown: u32,
    fault: Option<AccelError>,
    in_flight: Option<InFlight>,
    cooldown_frames: u32,
    failure_cooldown_frames: u32,
}

impl RebuildState {
    pub fn new(config: &AccelConfig) -> Self {
        Self {
            // a new set has never been built
            dirty: SceneChanges {
                geometry_changed: true,
                transform_only_changed: false,
            },
            force: false,
            cooldown: 0,
            fault: None,
            in_flight: None,
            cooldown_frames: config.cooldown_frames(),
            failure_cooldown_frames: config.failure_cooldown_frames,
        }
    }

    pub fn note_changes(&mut self, changes: SceneChanges) {
        self.dirty.merge(changes);
    }

    pub fn request_force(&mut self) {
        self.force = true;
    }

    pub fn dirty(&self) -> SceneChanges {
        self.dirty
    }

    pub fn cooldown(&self) -> u32 {
        self.cooldown
    }

    pub fn fault(&self) -> Option<&AccelError> {
        self.fault.as_ref()
    }

    pub fn clear_fault(&mut self) {
        self.fault = None;
    }

    pub fn in_flight_job(&self) -> Option<JobId> {
        self.in_flight.as_ref().map(|in_flight| in_flight.job)
    }

    pub fn inputs(&self) -> DecisionInputs {
        DecisionInputs {
            dirty: self.dirty,
            force: self.force,
            in_progress: self.in_flight.is_some(),
            cooldown: self.cooldown,
            faulted: self.fault.is_some(),
        }
    }

    /// Runs the decision table and applies its side effect on the cooldown counter.
    pub fn step(&mut self) -> Decision {
        let decision = decide(&self.inputs());
        if decision == Decision::CoolingDown {
            self.cooldown -= 1;
        }
        decision
    }

    /// Takes the dirty flags a new job will consume. They come back if the job fails.
    pub fn begin_spawn(&mut self, job: JobId, output: TaskOutput<TopResult>) {
        let consumed = mem::take(&mut self.dirty);
        let forced = mem::take(&mut self.force);
        self.in_flight = Some(InFlight {
            job,
            output,
            consumed,
            forced,
        });
    }

    /// Non-blocking check for the in-flight job.
    pub fn poll_completion(&mut self) -> Option<Completion> {
        let in_flight = self.in_flight.as_mut()?;
        let result = match in_flight.output.poll() {
            TaskPoll::Pending => return None,
            TaskPoll::Ready(result) => result,
            TaskPoll::Abandoned => Err(AccelError::Abandoned { job: in_flight.job }),
        };
        let in_flight = self.in_flight.take()?;
        Some(match result {
            Ok(report) => {
                self.cooldown = self.cooldown_frames;
                Completion::Published(report)
            }
            Err(err) => {
                self.dirty.merge(in_flight.consumed);
                self.force |= in_flight.forced;
                self.cooldown = self.failure_cooldown_frames;
                if err.is_fatal() {
                    log::error!("job {} failed fatally, rebuilds stopped: {}", in_flight.job, err);
                    self.fault = Some(err.clone());
                }
                Completion::Failed(err)
            }
        })
    }
}

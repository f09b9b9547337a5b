//! Primitive commands, compiled plans and the command log.
//!
//! A high-level [`Operation`] is compiled by the sequencer into a [`Plan`]: an
//! ordered list of [`Step`]s, each pairing one [`Primitive`] with the registry
//! [`Effect`] that becomes true once the primitive has completed. Plans are
//! plain data, so protocol variants (single-use vs reusable tips, operator
//! placement vs pre-positioned labware) only change what gets compiled.
//!
//! Every executed plan leaves a [`CommandRecord`] in the experiment's log.

use crate::actors::ActorKind;
use crate::labware::{Labware, Liquid, Location};
use crate::registry::{ContainerId, LockTarget, Portion, TipId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Parameters of a timed hold in the incubator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Incubation {
    /// How long the container is held.
    pub duration: Duration,
    /// Target temperature in degrees Celsius; ambient when absent.
    pub temperature_c: Option<f64>,
    /// Keep the container protected from light.
    pub dark: bool,
}

impl Incubation {
    /// Ambient-temperature hold in the light.
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            temperature_c: None,
            dark: false,
        }
    }

    /// Holds at `temperature_c` degrees Celsius.
    pub fn at(mut self, temperature_c: f64) -> Self {
        self.temperature_c = Some(temperature_c);
        self
    }

    /// Protects the container from light.
    pub fn in_dark(mut self) -> Self {
        self.dark = true;
        self
    }
}

/// Parameters of a wash: buffer in, optional soak and mix, then out to waste.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Wash {
    /// Buffer volume pipetted into each target per cycle.
    pub volume: f64,
    /// Number of passes over all targets.
    pub cycles: u32,
    /// Hold between the buffer transfer and the mix.
    pub soak: Option<Duration>,
    /// Mix cycles per pass; `0` skips the mix.
    pub mix_cycles: u32,
    /// Defaults to the buffer volume delivered into the target.
    pub mix_volume: Option<f64>,
}

impl Wash {
    /// Three cycles of `volume`, without soak or mix.
    pub fn new(volume: f64) -> Self {
        Self {
            volume,
            cycles: 3,
            soak: None,
            mix_cycles: 0,
            mix_volume: None,
        }
    }

    /// Sets the number of passes.
    pub fn cycles(mut self, cycles: u32) -> Self {
        self.cycles = cycles;
        self
    }

    /// Lets the buffer sit for `duration` before mixing and removal.
    pub fn soak(mut self, duration: Duration) -> Self {
        self.soak = Some(duration);
        self
    }

    /// Mixes `cycles` times after the soak.
    pub fn mix(mut self, cycles: u32) -> Self {
        self.mix_cycles = cycles;
        self
    }

    /// Mixes with `volume` instead of the delivered buffer volume.
    pub fn mix_volume(mut self, volume: f64) -> Self {
        self.mix_volume = Some(volume);
        self
    }
}

/// A single irreducible action executed by one actor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "primitive", rename_all = "snake_case")]
pub enum Primitive {
    /// Operator puts labware at a location.
    Place {
        /// Label of the labware.
        item: String,
        /// Where it goes.
        location: Location,
    },
    /// Operator carries an item (labware or reagent) between locations.
    Move {
        /// Labware label or liquid name.
        item: String,
        /// Pick-up location.
        from: Location,
        /// Drop-off location.
        to: Location,
    },
    /// Operator free-form instruction.
    Command {
        /// Instruction name.
        name: String,
        /// Instruction arguments, passed through verbatim.
        args: Vec<String>,
    },
    /// Operator keeps a container under the given conditions.
    Hold {
        /// Container being held.
        location: Location,
        /// Hold conditions.
        incubation: Incubation,
    },
    /// Robot positions the pipette.
    MovePipette {
        /// Target position.
        location: Location,
    },
    /// Robot draws liquid into the attached tip.
    Aspirate {
        /// Microliters.
        volume: f64,
    },
    /// Robot releases liquid from the attached tip.
    Dispense {
        /// Microliters.
        volume: f64,
    },
    /// Robot picks up a fresh tip.
    AttachTip {
        /// Tip handle assigned by the registry.
        tip: TipId,
    },
    /// Robot ejects the attached tip.
    DiscardTip,
    /// Photometer reading at one wavelength.
    ReadAbsorbance {
        /// Sample position.
        location: Location,
        /// Wavelength in nanometers.
        wavelength_nm: f64,
    },
}

impl Primitive {
    /// Actor responsible for executing this primitive.
    pub fn actor(&self) -> ActorKind {
        match self {
            Primitive::Place { .. }
            | Primitive::Move { .. }
            | Primitive::Command { .. }
            | Primitive::Hold { .. } => ActorKind::Operator,
            Primitive::MovePipette { .. }
            | Primitive::Aspirate { .. }
            | Primitive::Dispense { .. }
            | Primitive::AttachTip { .. }
            | Primitive::DiscardTip => ActorKind::Robot,
            Primitive::ReadAbsorbance { .. } => ActorKind::Photometer,
        }
    }

    /// Stable primitive name, as used in logs and fault injection.
    pub fn name(&self) -> &'static str {
        match self {
            Primitive::Place { .. } => "place",
            Primitive::Move { .. } => "move",
            Primitive::Command { .. } => "command",
            Primitive::Hold { .. } => "hold",
            Primitive::MovePipette { .. } => "move_pipette",
            Primitive::Aspirate { .. } => "aspirate",
            Primitive::Dispense { .. } => "dispense",
            Primitive::AttachTip { .. } => "attach_tip",
            Primitive::DiscardTip => "discard_tip",
            Primitive::ReadAbsorbance { .. } => "read_absorbance",
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Primitive::Place { item, location } => write!(f, "place {} at {}", item, location),
            Primitive::Move { item, from, to } => write!(f, "move {} from {} to {}", item, from, to),
            Primitive::Command { name, args } => write!(f, "command {}({})", name, args.join(", ")),
            Primitive::Hold {
                location,
                incubation,
            } => write!(f, "hold {} for {:?}", location, incubation.duration),
            Primitive::MovePipette { location } => write!(f, "move pipette to {}", location),
            Primitive::Aspirate { volume } => write!(f, "aspirate {} uL", volume),
            Primitive::Dispense { volume } => write!(f, "dispense {} uL", volume),
            Primitive::AttachTip { tip } => write!(f, "attach tip {}", tip),
            Primitive::DiscardTip => f.write_str("discard tip"),
            Primitive::ReadAbsorbance {
                location,
                wavelength_nm,
            } => write!(f, "read absorbance of {} at {} nm", location, wavelength_nm),
        }
    }
}

/// Where a dispense ends up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Destination {
    /// A registered container.
    Container(ContainerId),
    /// The waste station.
    Waste,
}

/// Registry mutation that holds once a primitive has completed.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Nothing tracked changes.
    None,
    /// Reagent brought into a container.
    Fill {
        /// Receiving container.
        container: ContainerId,
        /// What was brought.
        portion: Portion,
    },
    /// The tip is now on the pipette.
    AttachTip {
        /// Attached tip.
        tip: TipId,
    },
    /// Liquid moves from the container into the tip.
    Aspirate {
        /// Tip taking the liquid up.
        tip: TipId,
        /// Source container.
        from: ContainerId,
        /// Microliters.
        volume: f64,
    },
    /// Liquid leaves the tip; `loss_fraction` of it is written off as dead volume.
    Dispense {
        /// Tip releasing the liquid.
        tip: TipId,
        /// Container or waste.
        into: Destination,
        /// Microliters leaving the tip.
        volume: f64,
        /// Share of `volume` that never reaches the container.
        loss_fraction: f64,
    },
    /// The tip left the pipette for good.
    DiscardTip {
        /// Discarded tip.
        tip: TipId,
    },
}

/// One primitive plus its registry effect.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// What an actor is asked to do.
    pub primitive: Primitive,
    /// What becomes true in the registry once it is done.
    pub effect: Effect,
}

impl Step {
    /// A step whose completion applies `effect`.
    pub fn new(primitive: Primitive, effect: Effect) -> Self {
        Self { primitive, effect }
    }

    /// A step with no registry consequence (pipette moves, holds, readings).
    pub fn plain(primitive: Primitive) -> Self {
        Self::new(primitive, Effect::None)
    }
}

/// Compiled form of one high-level operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    /// Operation the plan was compiled from.
    pub operation: Operation,
    /// Targets held exclusively while the plan runs.
    pub locks: Vec<LockTarget>,
    /// Issued strictly in order.
    pub steps: Vec<Step>,
}

impl Plan {
    /// Empty plan for `operation`.
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            locks: Vec::new(),
            steps: Vec::new(),
        }
    }

    /// Adds a target to hold while the plan runs.
    pub fn lock(mut self, target: LockTarget) -> Self {
        self.locks.push(target);
        self
    }

    /// Appends a step.
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// The plan's primitives, in issue order.
    pub fn primitives(&self) -> impl Iterator<Item = &Primitive> {
        self.steps.iter().map(|s| &s.primitive)
    }
}

/// Technician-level operation together with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Operation {
    /// Register, place and fill a container.
    Load {
        /// Container label.
        label: String,
        /// Vessel kind.
        labware: Labware,
        /// Resolved capacity in microliters.
        capacity: f64,
        /// Initial liquid, if any.
        contents: Option<(Liquid, f64)>,
    },
    /// Operator brings more liquid into a container.
    Bring {
        /// Receiving container.
        container: ContainerId,
        /// Liquid brought.
        liquid: Liquid,
        /// Microliters.
        volume: f64,
    },
    /// Pipette from one source into one or more destinations.
    Transfer {
        /// Source container.
        source: ContainerId,
        /// Each receives `volume`.
        destinations: Vec<ContainerId>,
        /// Microliters per destination.
        volume: f64,
    },
    /// Aspirate and dispense in place.
    Mix {
        /// Mixed container.
        container: ContainerId,
        /// Microliters per cycle.
        volume: f64,
        /// Number of cycles.
        cycles: u32,
    },
    /// Timed hold by the operator.
    Incubate {
        /// Held container.
        container: ContainerId,
        /// Hold conditions.
        incubation: Incubation,
    },
    /// Photometer reading, optionally against a blank.
    MeasureAbsorbance {
        /// Sample container.
        container: ContainerId,
        /// Wavelength in nanometers.
        wavelength_nm: f64,
        /// Blank container, if any.
        blank: Option<ContainerId>,
    },
    /// Pipette liquid out of a container into the waste.
    DiscardLiquid {
        /// Emptied container.
        container: ContainerId,
        /// Microliters removed.
        volume: f64,
    },
    /// Eject the attached tip.
    DiscardTip {
        /// Discarded tip.
        tip: TipId,
    },
    /// Free-form instruction to the operator.
    OperatorCommand {
        /// Instruction name.
        name: String,
        /// Instruction arguments.
        args: Vec<String>,
    },
}

impl Operation {
    /// The operation's type, without parameters.
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Load { .. } => OperationKind::Load,
            Operation::Bring { .. } => OperationKind::Bring,
            Operation::Transfer { .. } => OperationKind::Transfer,
            Operation::Mix { .. } => OperationKind::Mix,
            Operation::Incubate { .. } => OperationKind::Incubate,
            Operation::MeasureAbsorbance { .. } => OperationKind::MeasureAbsorbance,
            Operation::DiscardLiquid { .. } => OperationKind::DiscardLiquid,
            Operation::DiscardTip { .. } => OperationKind::DiscardTip,
            Operation::OperatorCommand { .. } => OperationKind::OperatorCommand,
        }
    }
}

/// Operation type without parameters, used for statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// See [`Operation::Load`].
    Load,
    /// See [`Operation::Bring`].
    Bring,
    /// See [`Operation::Transfer`].
    Transfer,
    /// See [`Operation::Mix`].
    Mix,
    /// See [`Operation::Incubate`].
    Incubate,
    /// See [`Operation::MeasureAbsorbance`].
    MeasureAbsorbance,
    /// See [`Operation::DiscardLiquid`].
    DiscardLiquid,
    /// See [`Operation::DiscardTip`].
    DiscardTip,
    /// See [`Operation::OperatorCommand`].
    OperatorCommand,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Load => "load",
            OperationKind::Bring => "bring",
            OperationKind::Transfer => "transfer",
            OperationKind::Mix => "mix",
            OperationKind::Incubate => "incubate",
            OperationKind::MeasureAbsorbance => "measure_absorbance",
            OperationKind::DiscardLiquid => "discard_liquid",
            OperationKind::DiscardTip => "discard_tip",
            OperationKind::OperatorCommand => "operator_command",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a logged command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    /// Compiled, locks not yet taken.
    Pending,
    /// Primitives are being issued.
    Executing,
    /// Every primitive completed.
    Done,
    /// A primitive or its effect failed.
    Failed,
}

/// Outcome of one primitive within a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not issued yet.
    Pending,
    /// Completed by the actor.
    Done,
    /// Reported failure by the actor.
    Failed,
    /// Never issued because an earlier step failed.
    Aborted,
}

/// Log entry for one primitive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    /// Actor the primitive was routed to.
    pub actor: ActorKind,
    /// The primitive itself.
    pub primitive: Primitive,
    /// How far it got.
    pub status: StepStatus,
}

/// Log entry for one issued high-level operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandRecord {
    /// 1-based position in the log.
    pub seq: u64,
    /// Operation the command was compiled from.
    pub operation: Operation,
    /// One entry per compiled primitive.
    pub steps: Vec<StepRecord>,
    /// Overall outcome.
    pub status: CommandStatus,
    /// Index into `steps` of the primitive that failed.
    pub failed_step: Option<usize>,
    /// Failure message, if any.
    pub error: Option<String>,
    /// When the command was compiled.
    pub issued_at: DateTime<Utc>,
}

impl CommandRecord {
    /// Builds a pending record for the plan's primitives.
    pub fn pending(seq: u64, plan: &Plan) -> Self {
        Self {
            seq,
            operation: plan.operation.clone(),
            steps: plan
                .primitives()
                .map(|p| StepRecord {
                    actor: p.actor(),
                    primitive: p.clone(),
                    status: StepStatus::Pending,
                })
                .collect(),
            status: CommandStatus::Pending,
            failed_step: None,
            error: None,
            issued_at: Utc::now(),
        }
    }

    /// Number of primitives that were actually issued to an actor.
    pub fn issued_primitives(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Done | StepStatus::Failed))
            .count()
    }

    /// Marks everything after `index` as aborted; the step itself completed
    /// but its registry effect could not be applied.
    pub(crate) fn abort_after(&mut self, index: usize, error: String) {
        for step in self.steps.iter_mut().skip(index + 1) {
            step.status = StepStatus::Aborted;
        }
        self.status = CommandStatus::Failed;
        self.failed_step = Some(index);
        self.error = Some(error);
    }

    pub(crate) fn fail_at(&mut self, index: usize, error: String) {
        for (i, step) in self.steps.iter_mut().enumerate() {
            if i == index {
                step.status = StepStatus::Failed;
            } else if i > index {
                step.status = StepStatus::Aborted;
            }
        }
        self.status = CommandStatus::Failed;
        self.failed_step = Some(index);
        self.error = Some(error);
    }
}

//! Core library for the rust_lab orchestration system.
//!
//! An experiment session accepts high-level technician operations (load,
//! transfer, mix, incubate, measure...), tracks every container and pipette
//! tip in a resource registry and compiles each operation into ordered
//! primitives for three actors: a human operator, a liquid-handling robot and
//! a photometer. Real hardware drivers and the in-process simulation in
//! [`actors::sim`] implement the same capability traits.
//!
//! ```rust,ignore
//! use rust_lab::prelude::*;
//!
//! let lab = SimulatedLab::new();
//! let mut session = ExperimentSession::new(lab.actors());
//! let id = session.experiment_init(ExperimentConfig::new("demo")).await?;
//! let a = session.load(ContainerSpec::new("A", Labware::TestTube).with_liquid("water", 100.0)).await?;
//! let b = session.load(ContainerSpec::new("B", Labware::TestTube)).await?;
//! session.transfer(a, b, 25.0).await?;
//! session.experiment_end(id).await?;
//! ```

pub mod actors;
pub mod config;
pub mod deck;
pub mod error;
pub mod labware;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod sequencer;
pub mod session;

/// Commonly used types for driving an experiment.
pub mod prelude {
    pub use crate::actors::sim::SimulatedLab;
    pub use crate::actors::{ActorKind, ActorSet, OperatorActor, Photometer, RobotActor};
    pub use crate::config::{ExperimentConfig, LabConfig, Placement, ProtocolConfig, TipPolicy};
    pub use crate::error::{LabError, LabResult, ResourceError};
    pub use crate::labware::{Labware, Liquid, Location};
    pub use crate::protocol::{Incubation, Wash};
    pub use crate::registry::{ContainerId, ContainerSpec, TipId};
    pub use crate::sequencer::{AbsorbanceReading, AbsorbanceRequest};
    pub use crate::session::{ExperimentSession, ExperimentSummary, LifecycleState};
}

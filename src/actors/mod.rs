//! Capability traits for the actors executing primitives.
//!
//! The sequencer never knows what is behind these traits: a simulated device,
//! a hardware driver or an adapter prompting a human. Each primitive is
//! awaited to completion before the next one is issued, so an `Ok(())` means
//! the physical action has finished.
//!
//! - [`OperatorActor`]: the human operator (placing labware, bringing
//!   reagents, incubator holds, free-form instructions).
//! - [`RobotActor`]: the robotic liquid handler's single-channel pipette.
//! - [`Photometer`]: the absorbance reader.

pub mod sim;

use crate::labware::Location;
use crate::protocol::{Incubation, Primitive};
use crate::registry::TipId;
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Capability set of the human operator.
#[async_trait]
pub trait OperatorActor: Send + Sync {
    /// Put labware (or a plate) at `location`.
    async fn place(&self, item: &str, location: &Location) -> Result<()>;
    /// Carry an item, typically a reagent from storage, between locations.
    async fn move_item(&self, item: &str, from: &Location, to: &Location) -> Result<()>;
    /// Generic escape hatch for instructions without a dedicated primitive.
    async fn command(&self, name: &str, args: &[String]) -> Result<()>;
    /// Keep the container at `location` under `incubation` until it elapses.
    async fn hold(&self, location: &Location, incubation: &Incubation) -> Result<()>;
}

/// Capability set of the robotic liquid handler.
#[async_trait]
pub trait RobotActor: Send + Sync {
    /// Position the pipette over `location`.
    async fn move_pipette(&self, location: &Location) -> Result<()>;
    /// Draw `volume` microliters into the attached tip.
    async fn aspirate(&self, volume: f64) -> Result<()>;
    /// Release `volume` microliters from the attached tip.
    async fn dispense(&self, volume: f64) -> Result<()>;
    /// Pick up a fresh tip from the supply.
    async fn attach_tip(&self, tip: TipId) -> Result<()>;
    /// Eject the attached tip into the tip waste.
    async fn discard_tip(&self) -> Result<()>;
}

/// Measurement collaborator used by `measure_absorbance`.
#[async_trait]
pub trait Photometer: Send + Sync {
    /// Absorbance of the sample at `location`.
    async fn read_absorbance(&self, location: &Location, wavelength_nm: f64) -> Result<f64>;
}

/// Which actor executes a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    /// The human operator.
    Operator,
    /// The liquid-handling robot.
    Robot,
    /// The absorbance reader.
    Photometer,
}

impl fmt::Display for ActorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActorKind::Operator => "operator",
            ActorKind::Robot => "robot",
            ActorKind::Photometer => "photometer",
        };
        f.write_str(name)
    }
}

/// The actors injected into an experiment session.
#[derive(Clone)]
pub struct ActorSet {
    /// Executes placement, reagent and hold primitives.
    pub operator: Arc<dyn OperatorActor>,
    /// Executes pipetting and tip primitives.
    pub robot: Arc<dyn RobotActor>,
    /// Executes absorbance readings.
    pub photometer: Arc<dyn Photometer>,
}

impl ActorSet {
    /// Bundles the three actors of one lab.
    pub fn new(
        operator: Arc<dyn OperatorActor>,
        robot: Arc<dyn RobotActor>,
        photometer: Arc<dyn Photometer>,
    ) -> Self {
        Self {
            operator,
            robot,
            photometer,
        }
    }

    /// Executes one primitive on the actor responsible for it.
    ///
    /// Returns the reading for measurement primitives, `None` otherwise.
    pub async fn dispatch(&self, primitive: &Primitive) -> Result<Option<f64>> {
        match primitive {
            Primitive::Place { item, location } => self.operator.place(item, location).await?,
            Primitive::Move { item, from, to } => self.operator.move_item(item, from, to).await?,
            Primitive::Command { name, args } => self.operator.command(name, args).await?,
            Primitive::Hold {
                location,
                incubation,
            } => self.operator.hold(location, incubation).await?,
            Primitive::MovePipette { location } => self.robot.move_pipette(location).await?,
            Primitive::Aspirate { volume } => self.robot.aspirate(*volume).await?,
            Primitive::Dispense { volume } => self.robot.dispense(*volume).await?,
            Primitive::AttachTip { tip } => self.robot.attach_tip(*tip).await?,
            Primitive::DiscardTip => self.robot.discard_tip().await?,
            Primitive::ReadAbsorbance {
                location,
                wavelength_nm,
            } => {
                let reading = self
                    .photometer
                    .read_absorbance(location, *wavelength_nm)
                    .await?;
                return Ok(Some(reading));
            }
        }
        Ok(None)
    }
}

impl fmt::Debug for ActorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorSet").finish_non_exhaustive()
    }
}

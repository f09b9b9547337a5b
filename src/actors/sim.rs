//! Simulated actors
//!
//! Provides in-process operator, robot and photometer implementations for
//! tests and dry runs without lab hardware. All three share one
//! [`SimulatedLab`] which
//!
//! - journals every primitive it receives, in order;
//! - models the pipette physically (a tip must be on before aspirating,
//!   a tip cannot dispense more than it holds);
//! - injects faults on request, e.g. "fail the 2nd dispense from now".
//!
//! # Example
//!
//! ```rust,ignore
//! let lab = SimulatedLab::new();
//! lab.fail_on("dispense", 1);
//! let mut session = ExperimentSession::new(lab.actors());
//! ```

use super::{ActorSet, OperatorActor, Photometer, RobotActor};
use crate::labware::Location;
use crate::protocol::{Incubation, Primitive};
use crate::registry::{TipId, VOLUME_TOLERANCE};
use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Reading returned for locations without a configured value.
pub const DEFAULT_ABSORBANCE: f64 = 0.05;

/// One primitive received by a simulated actor.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    /// What was asked of the actor.
    pub primitive: Primitive,
    /// False when the primitive was rejected (fault or physical impossibility).
    pub completed: bool,
}

#[derive(Debug)]
struct Fault {
    primitive: String,
    /// Matching calls still to let through before failing.
    skip: usize,
    persistent: bool,
}

#[derive(Debug, Default)]
struct SimState {
    journal: Vec<JournalEntry>,
    faults: Vec<Fault>,
    tip: Option<TipId>,
    tip_volume: f64,
    readings: HashMap<Location, f64>,
}

impl SimState {
    /// Consumes a matching fault, returning true if this call must fail.
    fn take_fault(&mut self, name: &str) -> bool {
        let Some(index) = self.faults.iter().position(|f| f.primitive == name) else {
            return false;
        };
        let fault = &mut self.faults[index];
        if fault.skip > 0 {
            fault.skip -= 1;
            return false;
        }
        if !fault.persistent {
            self.faults.remove(index);
        }
        true
    }
}

/// Shared state behind the simulated actors.
#[derive(Clone, Default)]
pub struct SimulatedLab {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedLab {
    /// A lab with no faults, no tip on the pipette and default readings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Actor set backed by this simulation.
    pub fn actors(&self) -> ActorSet {
        ActorSet::new(
            Arc::new(SimOperator { lab: self.clone() }),
            Arc::new(SimRobot { lab: self.clone() }),
            Arc::new(SimPhotometer { lab: self.clone() }),
        )
    }

    /// Fails the `occurrence`-th call (1-based, counted from now) of `primitive`.
    pub fn fail_on(&self, primitive: &str, occurrence: usize) {
        self.state.lock().faults.push(Fault {
            primitive: primitive.to_string(),
            skip: occurrence.saturating_sub(1),
            persistent: false,
        });
    }

    /// Fails every call of `primitive` until [`clear_faults`](Self::clear_faults).
    pub fn fail_always(&self, primitive: &str) {
        self.state.lock().faults.push(Fault {
            primitive: primitive.to_string(),
            skip: 0,
            persistent: true,
        });
    }

    /// Removes every pending fault, persistent ones included.
    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Configures the absorbance reported for a location.
    pub fn set_reading(&self, location: Location, absorbance: f64) {
        self.state.lock().readings.insert(location, absorbance);
    }

    /// Every primitive received so far, including rejected ones.
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.state.lock().journal.clone()
    }

    /// Completed primitives, in execution order.
    pub fn completed(&self) -> Vec<Primitive> {
        self.state
            .lock()
            .journal
            .iter()
            .filter(|e| e.completed)
            .map(|e| e.primitive.clone())
            .collect()
    }

    /// Names of completed primitives, in execution order.
    pub fn completed_names(&self) -> Vec<&'static str> {
        self.completed().iter().map(Primitive::name).collect()
    }

    /// How many times `primitive` completed.
    pub fn count(&self, primitive: &str) -> usize {
        self.completed()
            .iter()
            .filter(|p| p.name() == primitive)
            .count()
    }

    /// Tip currently on the simulated pipette.
    pub fn tip(&self) -> Option<TipId> {
        self.state.lock().tip
    }

    /// Liquid volume inside the simulated tip.
    pub fn tip_volume(&self) -> f64 {
        self.state.lock().tip_volume
    }

    fn execute<F>(&self, primitive: Primitive, apply: F) -> Result<()>
    where
        F: FnOnce(&mut SimState) -> Result<()>,
    {
        let mut state = self.state.lock();
        let name = primitive.name();
        let outcome = if state.take_fault(name) {
            Err(anyhow::anyhow!("simulated fault on {}", name))
        } else {
            apply(&mut state)
        };
        debug!(primitive = %primitive, ok = outcome.is_ok(), "simulated primitive");
        state.journal.push(JournalEntry {
            primitive,
            completed: outcome.is_ok(),
        });
        outcome
    }
}

/// Simulated human operator.
pub struct SimOperator {
    lab: SimulatedLab,
}

#[async_trait]
impl OperatorActor for SimOperator {
    async fn place(&self, item: &str, location: &Location) -> Result<()> {
        self.lab.execute(
            Primitive::Place {
                item: item.to_string(),
                location: location.clone(),
            },
            |_| Ok(()),
        )
    }

    async fn move_item(&self, item: &str, from: &Location, to: &Location) -> Result<()> {
        self.lab.execute(
            Primitive::Move {
                item: item.to_string(),
                from: from.clone(),
                to: to.clone(),
            },
            |_| Ok(()),
        )
    }

    async fn command(&self, name: &str, args: &[String]) -> Result<()> {
        self.lab.execute(
            Primitive::Command {
                name: name.to_string(),
                args: args.to_vec(),
            },
            |_| Ok(()),
        )
    }

    async fn hold(&self, location: &Location, incubation: &Incubation) -> Result<()> {
        // Timing is not simulated; the hold completes immediately.
        tokio::task::yield_now().await;
        self.lab.execute(
            Primitive::Hold {
                location: location.clone(),
                incubation: incubation.clone(),
            },
            |_| Ok(()),
        )
    }
}

/// Simulated single-channel liquid handler.
pub struct SimRobot {
    lab: SimulatedLab,
}

#[async_trait]
impl RobotActor for SimRobot {
    async fn move_pipette(&self, location: &Location) -> Result<()> {
        self.lab.execute(
            Primitive::MovePipette {
                location: location.clone(),
            },
            |_| Ok(()),
        )
    }

    async fn aspirate(&self, volume: f64) -> Result<()> {
        self.lab
            .execute(Primitive::Aspirate { volume }, |state| {
                if state.tip.is_none() {
                    bail!("cannot aspirate without a tip");
                }
                state.tip_volume += volume;
                Ok(())
            })
    }

    async fn dispense(&self, volume: f64) -> Result<()> {
        self.lab
            .execute(Primitive::Dispense { volume }, |state| {
                if state.tip.is_none() {
                    bail!("cannot dispense without a tip");
                }
                if volume > state.tip_volume + VOLUME_TOLERANCE {
                    bail!(
                        "tip holds {} uL, cannot dispense {} uL",
                        state.tip_volume,
                        volume
                    );
                }
                state.tip_volume = (state.tip_volume - volume).max(0.0);
                Ok(())
            })
    }

    async fn attach_tip(&self, tip: TipId) -> Result<()> {
        self.lab.execute(Primitive::AttachTip { tip }, |state| {
            if let Some(current) = state.tip {
                bail!("tip {} already attached", current);
            }
            state.tip = Some(tip);
            state.tip_volume = 0.0;
            Ok(())
        })
    }

    async fn discard_tip(&self) -> Result<()> {
        self.lab.execute(Primitive::DiscardTip, |state| {
            state.tip = None;
            state.tip_volume = 0.0;
            Ok(())
        })
    }
}

/// Simulated plate reader.
pub struct SimPhotometer {
    lab: SimulatedLab,
}

#[async_trait]
impl Photometer for SimPhotometer {
    async fn read_absorbance(&self, location: &Location, wavelength_nm: f64) -> Result<f64> {
        let mut reading = DEFAULT_ABSORBANCE;
        self.lab.execute(
            Primitive::ReadAbsorbance {
                location: location.clone(),
                wavelength_nm,
            },
            |state| {
                if let Some(value) = state.readings.get(location) {
                    reading = *value;
                }
                Ok(())
            },
        )?;
        Ok(reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labware::{Equipment, Labware};

    #[tokio::test]
    async fn robot_requires_a_tip() {
        let lab = SimulatedLab::new();
        let actors = lab.actors();

        assert!(actors.robot.aspirate(10.0).await.is_err());
        let journal = lab.journal();
        assert_eq!(journal.len(), 1);
        assert!(!journal[0].completed);
    }

    #[tokio::test]
    async fn robot_tracks_tip_volume() {
        let lab = SimulatedLab::new();
        let actors = lab.actors();
        let tip = crate::registry::ResourceRegistry::default()
            .register_tip()
            .unwrap();

        actors.robot.attach_tip(tip).await.unwrap();
        assert!(actors.robot.attach_tip(tip).await.is_err());
        actors.robot.aspirate(30.0).await.unwrap();
        assert!(actors.robot.dispense(40.0).await.is_err());
        actors.robot.dispense(30.0).await.unwrap();
        actors.robot.discard_tip().await.unwrap();

        assert_eq!(lab.tip(), None);
        assert_eq!(
            lab.completed_names(),
            vec!["attach_tip", "aspirate", "dispense", "discard_tip"]
        );
    }

    #[tokio::test]
    async fn faults_fire_on_the_requested_occurrence() {
        let lab = SimulatedLab::new();
        let actors = lab.actors();
        let loc = Location::new(Equipment::LiquidHandler, 1, Labware::TestTube);
        lab.fail_on("move_pipette", 2);

        actors.robot.move_pipette(&loc).await.unwrap();
        assert!(actors.robot.move_pipette(&loc).await.is_err());
        actors.robot.move_pipette(&loc).await.unwrap();
        assert_eq!(lab.count("move_pipette"), 2);
    }

    #[tokio::test]
    async fn persistent_faults_until_cleared() {
        let lab = SimulatedLab::new();
        let actors = lab.actors();
        lab.fail_always("discard_tip");

        assert!(actors.robot.discard_tip().await.is_err());
        assert!(actors.robot.discard_tip().await.is_err());
        lab.clear_faults();
        actors.robot.discard_tip().await.unwrap();
    }

    #[tokio::test]
    async fn dispatch_routes_to_the_owning_actor() {
        let lab = SimulatedLab::new();
        let actors = lab.actors();
        let command = Primitive::Command {
            name: "label_plate".to_string(),
            args: vec!["plate-1".to_string()],
        };
        let read = Primitive::ReadAbsorbance {
            location: Location::well(Equipment::LiquidHandler, 1, "B3"),
            wavelength_nm: 450.0,
        };

        assert_eq!(actors.dispatch(&command).await.unwrap(), None);
        assert_eq!(
            actors.dispatch(&read).await.unwrap(),
            Some(DEFAULT_ABSORBANCE)
        );
        assert_eq!(lab.completed(), vec![command, read]);
    }

    #[tokio::test]
    async fn photometer_uses_configured_readings() {
        let lab = SimulatedLab::new();
        let actors = lab.actors();
        let loc = Location::well(Equipment::LiquidHandler, 1, "A1");
        let other = Location::well(Equipment::LiquidHandler, 1, "A2");
        lab.set_reading(loc.clone(), 0.8);

        let value = actors.photometer.read_absorbance(&loc, 600.0).await.unwrap();
        assert_eq!(value, 0.8);
        let value = actors
            .photometer
            .read_absorbance(&other, 600.0)
            .await
            .unwrap();
        assert_eq!(value, DEFAULT_ABSORBANCE);
    }
}

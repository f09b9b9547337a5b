//! Experiment session: the technician-facing API.
//!
//! A session owns one experiment's resource registry and command sequencer
//! and enforces the lifecycle `Init → Active → Ended`:
//!
//! - `Init`: only [`ExperimentSession::experiment_init`] is accepted.
//! - `Active`: technician operations are compiled and executed one at a time.
//! - `Ended`: nothing is accepted; the command log stays readable.
//!
//! # Example
//!
//! ```rust,ignore
//! let lab = SimulatedLab::new();
//! let mut session = ExperimentSession::new(lab.actors());
//! let id = session.experiment_init(ExperimentConfig::new("Serial Dilution")).await?;
//!
//! let a = session.load(ContainerSpec::new("A", Labware::TestTube).with_liquid("water", 100.0)).await?;
//! let b = session.load(ContainerSpec::new("B", Labware::TestTube)).await?;
//! session.transfer(a, b, 20.0).await?;
//!
//! let summary = session.experiment_end(id).await?;
//! ```

use crate::actors::ActorSet;
use crate::config::ExperimentConfig;
use crate::deck::Deck;
use crate::error::{LabError, LabResult};
use crate::labware::Liquid;
use crate::protocol::{CommandRecord, CommandStatus, Incubation, OperationKind, Wash};
use crate::registry::{Container, ContainerId, ContainerSpec, LossRecord, ResourceRegistry};
use crate::sequencer::{AbsorbanceReading, AbsorbanceRequest, CommandSequencer, OperationStats};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Waiting for `experiment_init`.
    Init,
    /// Accepting technician operations.
    Active,
    /// Torn down.
    Ended,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Init => "init",
            LifecycleState::Active => "active",
            LifecycleState::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// Identity of one experiment, issued by `experiment_init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ExperimentId(Uuid);

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Report returned by `experiment_end`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentSummary {
    /// Experiment identity.
    pub id: ExperimentId,
    /// Name given at `experiment_init`.
    pub name: String,
    /// When `experiment_init` succeeded.
    pub started_at: DateTime<Utc>,
    /// When teardown completed.
    pub ended_at: DateTime<Utc>,
    /// Per-operation counters.
    pub operations: BTreeMap<OperationKind, OperationStats>,
    /// Commands in the log.
    pub commands: usize,
    /// Commands that ended in a failure.
    pub failed_commands: usize,
    /// Tips issued from the supply.
    pub tips_used: usize,
    /// Tip attachments, summed over all tips.
    pub tips_attached: u32,
    /// Tip discards, summed over all tips.
    pub tips_discarded: u32,
    /// Microliters dispensed into the waste station.
    pub total_waste: f64,
    /// Microliters written to the loss ledger.
    pub total_loss: f64,
}

#[derive(Debug)]
struct Experiment {
    id: ExperimentId,
    name: String,
    started_at: DateTime<Utc>,
    registry: ResourceRegistry,
    sequencer: CommandSequencer,
}

impl Experiment {
    fn summary(&self, ended_at: DateTime<Utc>) -> ExperimentSummary {
        let log = self.sequencer.log();
        ExperimentSummary {
            id: self.id,
            name: self.name.clone(),
            started_at: self.started_at,
            ended_at,
            operations: self.sequencer.stats().clone(),
            commands: log.len(),
            failed_commands: log
                .iter()
                .filter(|r| r.status == CommandStatus::Failed)
                .count(),
            tips_used: self.registry.tips().count(),
            tips_attached: self.registry.tips().map(|t| t.attach_count).sum(),
            tips_discarded: self.registry.tips().map(|t| t.discard_count).sum(),
            total_waste: self.registry.total_waste(),
            total_loss: self.registry.total_loss(),
        }
    }
}

/// One experiment run, driven by a technician.
#[derive(Debug)]
pub struct ExperimentSession {
    actors: ActorSet,
    state: LifecycleState,
    experiment: Option<Experiment>,
}

impl ExperimentSession {
    /// A session in `Init`, driving the given actors.
    pub fn new(actors: ActorSet) -> Self {
        Self {
            actors,
            state: LifecycleState::Init,
            experiment: None,
        }
    }

    /// Current lifecycle phase.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Identity of the current (or finished) experiment.
    pub fn id(&self) -> Option<ExperimentId> {
        self.experiment.as_ref().map(|e| e.id)
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Starts the experiment with an empty registry.
    pub async fn experiment_init(&mut self, config: ExperimentConfig) -> LabResult<ExperimentId> {
        if self.state != LifecycleState::Init {
            return Err(LabError::state(format!(
                "experiment_init called in state {}",
                self.state
            )));
        }
        config.protocol.validate()?;
        if config.deck.liquid_handler_slots == 0 {
            return Err(LabError::validation("deck needs at least one slot"));
        }

        let id = ExperimentId(Uuid::new_v4());
        let registry = ResourceRegistry::new(config.protocol.max_tips)
            .with_cross_contamination(config.protocol.allow_cross_contamination);
        let sequencer = CommandSequencer::new(
            self.actors.clone(),
            config.protocol.clone(),
            Deck::new(&config.deck),
        );

        info!(
            experiment = %id,
            name = %config.name,
            tip_policy = ?config.protocol.tip_policy,
            placement = ?config.protocol.placement,
            "experiment started"
        );
        self.experiment = Some(Experiment {
            id,
            name: config.name,
            started_at: Utc::now(),
            registry,
            sequencer,
        });
        self.state = LifecycleState::Active;
        Ok(id)
    }

    /// Tears the experiment down and reports on it.
    ///
    /// Discards the attached tip (once), then requires every tip to be settled
    /// and no lock to be held. On failure the session stays active so the
    /// technician can correct the situation and retry.
    pub async fn experiment_end(&mut self, id: ExperimentId) -> LabResult<ExperimentSummary> {
        let experiment = self.active()?;
        if experiment.id != id {
            return Err(LabError::state(format!(
                "experiment {} is not the active experiment {}",
                id, experiment.id
            )));
        }

        let span = info_span!("experiment_end", experiment = %id);
        let summary = async {
            experiment
                .sequencer
                .discard_tip(&mut experiment.registry)
                .await
                .map_err(|e| LabError::Teardown(format!("force discard failed: {}", e)))?;

            let unsettled = experiment.registry.unsettled_resources();
            if !unsettled.is_empty() {
                warn!(unsettled = ?unsettled, "teardown blocked");
                return Err(LabError::Teardown(format!(
                    "unsettled resources: {}",
                    unsettled.join("; ")
                )));
            }

            let summary = experiment.summary(Utc::now());
            match serde_json::to_string(&summary) {
                Ok(json) => info!(summary = %json, "experiment ended"),
                Err(e) => warn!(error = %e, "failed to serialize experiment summary"),
            }
            experiment.registry.clear();
            Ok::<_, LabError>(summary)
        }
        .instrument(span)
        .await?;

        self.state = LifecycleState::Ended;
        Ok(summary)
    }

    // ---------------------------------------------------------------------
    // Technician operations
    // ---------------------------------------------------------------------

    /// Registers a container and has it placed on the deck (and filled).
    pub async fn load(&mut self, spec: ContainerSpec) -> LabResult<ContainerId> {
        let experiment = self.active()?;
        let span = info_span!("load", experiment = %experiment.id, label = %spec.label);
        experiment
            .sequencer
            .load(&mut experiment.registry, &spec)
            .instrument(span)
            .await
    }

    /// Adds more of a liquid to a loaded container.
    pub async fn bring(
        &mut self,
        container: ContainerId,
        liquid: impl Into<Liquid>,
        volume: f64,
    ) -> LabResult<()> {
        let liquid = liquid.into();
        let experiment = self.active()?;
        let span = info_span!("bring", experiment = %experiment.id, container = %container, liquid = %liquid, volume);
        experiment
            .sequencer
            .bring(&mut experiment.registry, container, &liquid, volume)
            .instrument(span)
            .await
    }

    /// Transfers `volume` from `source` into `destination`.
    pub async fn transfer(
        &mut self,
        source: ContainerId,
        destination: ContainerId,
        volume: f64,
    ) -> LabResult<()> {
        self.transfer_many(source, &[destination], volume).await
    }

    /// Transfers `volume` into every destination with a single tip.
    pub async fn transfer_many(
        &mut self,
        source: ContainerId,
        destinations: &[ContainerId],
        volume: f64,
    ) -> LabResult<()> {
        let experiment = self.active()?;
        let span = info_span!(
            "transfer",
            experiment = %experiment.id,
            source = %source,
            destinations = destinations.len(),
            volume
        );
        experiment
            .sequencer
            .transfer(&mut experiment.registry, source, destinations, volume)
            .instrument(span)
            .await
    }

    /// Mixes the container's contents in place.
    pub async fn mix(&mut self, container: ContainerId, volume: f64, cycles: u32) -> LabResult<()> {
        let experiment = self.active()?;
        let span = info_span!("mix", experiment = %experiment.id, container = %container, volume, cycles);
        experiment
            .sequencer
            .mix(&mut experiment.registry, container, volume, cycles)
            .instrument(span)
            .await
    }

    /// Holds the container for `duration` at ambient conditions.
    pub async fn incubate(&mut self, container: ContainerId, duration: Duration) -> LabResult<()> {
        self.incubate_with(container, Incubation::new(duration)).await
    }

    /// Holds the container under explicit conditions.
    pub async fn incubate_with(
        &mut self,
        container: ContainerId,
        incubation: Incubation,
    ) -> LabResult<()> {
        let experiment = self.active()?;
        let span = info_span!(
            "incubate",
            experiment = %experiment.id,
            container = %container,
            duration_s = incubation.duration.as_secs_f64()
        );
        experiment
            .sequencer
            .incubate(&mut experiment.registry, container, &incubation)
            .instrument(span)
            .await
    }

    /// Reads absorbance at the protocol's default wavelength.
    pub async fn measure_absorbance(&mut self, container: ContainerId) -> LabResult<AbsorbanceReading> {
        self.measure_absorbance_with(container, AbsorbanceRequest::default())
            .await
    }

    /// Reads absorbance with an explicit wavelength and/or blank.
    pub async fn measure_absorbance_with(
        &mut self,
        container: ContainerId,
        request: AbsorbanceRequest,
    ) -> LabResult<AbsorbanceReading> {
        let experiment = self.active()?;
        let span = info_span!("measure_absorbance", experiment = %experiment.id, container = %container);
        experiment
            .sequencer
            .measure_absorbance(&mut experiment.registry, container, &request)
            .instrument(span)
            .await
    }

    /// Pipettes `volume` out of the container into the waste station.
    pub async fn discard_liquid(&mut self, container: ContainerId, volume: f64) -> LabResult<()> {
        let experiment = self.active()?;
        let span = info_span!("discard_liquid", experiment = %experiment.id, container = %container, volume);
        experiment
            .sequencer
            .discard_liquid(&mut experiment.registry, container, volume)
            .instrument(span)
            .await
    }

    /// Discards the tip currently on the pipette, if any.
    pub async fn discard_tip(&mut self) -> LabResult<()> {
        let experiment = self.active()?;
        let span = info_span!("discard_tip", experiment = %experiment.id);
        experiment
            .sequencer
            .discard_tip(&mut experiment.registry)
            .instrument(span)
            .await
    }

    /// Passes a free-form instruction to the operator, e.g. labelling a plate.
    pub async fn operator_command(&mut self, name: &str, args: &[&str]) -> LabResult<()> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let experiment = self.active()?;
        let span = info_span!("operator_command", experiment = %experiment.id, command = %name);
        experiment
            .sequencer
            .operator_command(&mut experiment.registry, name, &args)
            .instrument(span)
            .await
    }

    /// Rinses every target with `buffer`.
    ///
    /// Each cycle visits the targets in order: buffer transfer, optional soak
    /// (one incubation hold), optional mix, then the delivered buffer volume
    /// goes to waste.
    pub async fn wash(
        &mut self,
        targets: &[ContainerId],
        buffer: ContainerId,
        wash: &Wash,
    ) -> LabResult<()> {
        let loss = self.active()?.sequencer.protocol().dead_volume_fraction;
        if targets.is_empty() {
            return Err(LabError::validation("wash needs at least one target"));
        }
        if wash.cycles == 0 {
            return Err(LabError::validation("wash needs at least one cycle"));
        }
        if let Some(mix_volume) = wash.mix_volume {
            if !mix_volume.is_finite() || mix_volume <= 0.0 {
                return Err(LabError::validation(format!(
                    "invalid wash mix volume {}",
                    mix_volume
                )));
            }
        }
        if wash.soak.is_some_and(|soak| soak.is_zero()) {
            return Err(LabError::validation("wash soak must be positive"));
        }

        // Only the delivered volume can be taken back out.
        let delivered = wash.volume * (1.0 - loss);
        let mix_volume = wash.mix_volume.unwrap_or(delivered);
        for cycle in 1..=wash.cycles {
            info!(targets = targets.len(), cycle, cycles = wash.cycles, "wash cycle");
            for &target in targets {
                self.transfer(buffer, target, wash.volume).await?;
                if let Some(soak) = wash.soak {
                    self.incubate(target, soak).await?;
                }
                if wash.mix_cycles > 0 {
                    self.mix(target, mix_volume, wash.mix_cycles).await?;
                }
                self.discard_liquid(target, delivered).await?;
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Read-only accessors
    // ---------------------------------------------------------------------

    /// Current volume of a container.
    pub fn volume(&self, container: ContainerId) -> LabResult<f64> {
        Ok(self.experiment()?.registry.get_volume(container)?)
    }

    /// Snapshot of a container.
    pub fn container(&self, container: ContainerId) -> LabResult<Container> {
        Ok(self.experiment()?.registry.container(container)?.clone())
    }

    /// Snapshot of a container, looked up by label.
    pub fn container_by_label(&self, label: &str) -> LabResult<Container> {
        Ok(self.experiment()?.registry.container_by_label(label)?.clone())
    }

    /// Read access to the experiment's registry.
    pub fn registry(&self) -> LabResult<&ResourceRegistry> {
        Ok(&self.experiment()?.registry)
    }

    /// Commands issued so far; empty before `experiment_init`.
    pub fn command_log(&self) -> &[CommandRecord] {
        self.experiment
            .as_ref()
            .map(|e| e.sequencer.log())
            .unwrap_or_default()
    }

    /// The loss ledger; empty before `experiment_init`.
    pub fn losses(&self) -> &[LossRecord] {
        self.experiment
            .as_ref()
            .map(|e| e.registry.losses())
            .unwrap_or_default()
    }

    /// Per-operation counters, once initialized.
    pub fn stats(&self) -> Option<&BTreeMap<OperationKind, OperationStats>> {
        self.experiment.as_ref().map(|e| e.sequencer.stats())
    }

    fn experiment(&self) -> LabResult<&Experiment> {
        self.experiment
            .as_ref()
            .ok_or_else(|| LabError::state("no experiment has been initialized"))
    }

    fn active(&mut self) -> LabResult<&mut Experiment> {
        if self.state != LifecycleState::Active {
            return Err(LabError::state(format!(
                "operation requires an active experiment (state: {})",
                self.state
            )));
        }
        self.experiment
            .as_mut()
            .ok_or_else(|| LabError::state("active session without experiment"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::sim::SimulatedLab;
    use crate::labware::{Labware, Location};
    use crate::protocol::Primitive;
    use tracing_test::traced_test;

    async fn started() -> (SimulatedLab, ExperimentSession, ExperimentId) {
        let lab = SimulatedLab::new();
        let mut session = ExperimentSession::new(lab.actors());
        let id = session
            .experiment_init(ExperimentConfig::new("unit"))
            .await
            .unwrap();
        (lab, session, id)
    }

    #[tokio::test]
    async fn operations_before_init_are_state_errors() {
        let lab = SimulatedLab::new();
        let mut session = ExperimentSession::new(lab.actors());

        let err = session
            .load(ContainerSpec::new("A", Labware::TestTube))
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::State(_)));
        assert!(matches!(session.discard_tip().await, Err(LabError::State(_))));
        assert!(lab.journal().is_empty());
        assert!(session.command_log().is_empty());
    }

    #[tokio::test]
    async fn init_twice_is_a_state_error() {
        let (_lab, mut session, _) = started().await;
        let err = session
            .experiment_init(ExperimentConfig::new("again"))
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::State(_)));
        assert_eq!(session.state(), LifecycleState::Active);
    }

    #[tokio::test]
    async fn invalid_protocol_is_rejected_at_init() {
        let lab = SimulatedLab::new();
        let mut session = ExperimentSession::new(lab.actors());
        let mut config = ExperimentConfig::new("bad");
        config.protocol.dead_volume_fraction = 2.0;

        let err = session.experiment_init(config).await.unwrap_err();
        assert!(matches!(err, LabError::Config(_)));
        assert_eq!(session.state(), LifecycleState::Init);
    }

    #[tokio::test]
    async fn end_requires_matching_id() {
        let (_lab, mut session, id) = started().await;
        let other = ExperimentId(Uuid::new_v4());

        let err = session.experiment_end(other).await.unwrap_err();
        assert!(matches!(err, LabError::State(_)));
        session.experiment_end(id).await.unwrap();
        assert_eq!(session.state(), LifecycleState::Ended);

        let err = session.experiment_end(id).await.unwrap_err();
        assert!(matches!(err, LabError::State(_)));
    }

    #[tokio::test]
    async fn end_deregisters_containers() {
        let (_lab, mut session, id) = started().await;
        let a = session
            .load(ContainerSpec::new("A", Labware::Reservoir).with_liquid("water", 500.0))
            .await
            .unwrap();
        assert_eq!(session.volume(a).unwrap(), 500.0);

        let summary = session.experiment_end(id).await.unwrap();
        assert_eq!(summary.name, "unit");
        assert_eq!(summary.operations[&OperationKind::Load].calls, 1);
        assert!(session.volume(a).is_err());
        assert_eq!(session.command_log().len(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn operations_are_traced() {
        let (_lab, mut session, id) = started().await;
        let a = session
            .load(ContainerSpec::new("A", Labware::TestTube).with_liquid("water", 50.0))
            .await
            .unwrap();
        let b = session
            .load(ContainerSpec::new("B", Labware::TestTube))
            .await
            .unwrap();
        session.transfer(a, b, 10.0).await.unwrap();
        assert!(logs_contain("command issued"));
        assert!(logs_contain("operation=transfer"));

        let _ = session.transfer(a, b, 500.0).await;
        assert!(logs_contain("operation rejected before issuing primitives"));

        session.experiment_end(id).await.unwrap();
        assert!(logs_contain("experiment ended"));
    }

    #[tokio::test]
    async fn wash_returns_target_to_its_volume() {
        let (lab, mut session, _) = started().await;
        let buffer = session
            .load(ContainerSpec::new("buffer", Labware::Reservoir).with_liquid("buffer", 1000.0))
            .await
            .unwrap();
        let well = session
            .load(ContainerSpec::new("well", Labware::Wellplate))
            .await
            .unwrap();

        session
            .wash(&[well], buffer, &Wash::new(40.0).mix(2))
            .await
            .unwrap();

        assert_eq!(session.volume(well).unwrap(), 0.0);
        assert_eq!(session.volume(buffer).unwrap(), 880.0);
        assert_eq!(session.registry().unwrap().total_waste(), 120.0);
        assert_eq!(lab.count("attach_tip"), 9);
    }

    #[tokio::test]
    async fn wash_soaks_every_target_in_each_cycle() {
        let (lab, mut session, _) = started().await;
        let buffer = session
            .load(ContainerSpec::new("buffer", Labware::Reservoir).with_liquid("buffer", 1000.0))
            .await
            .unwrap();
        let first = session
            .load(ContainerSpec::new("w1", Labware::Wellplate))
            .await
            .unwrap();
        let second = session
            .load(ContainerSpec::new("w2", Labware::Wellplate))
            .await
            .unwrap();
        let before = lab.completed().len();
        let soak = Duration::from_secs(30);

        session
            .wash(
                &[first, second],
                buffer,
                &Wash::new(20.0).cycles(2).soak(soak).mix(1).mix_volume(10.0),
            )
            .await
            .unwrap();

        let pass = [
            // transfer
            "attach_tip",
            "move_pipette",
            "aspirate",
            "move_pipette",
            "dispense",
            "discard_tip",
            // soak
            "hold",
            // mix
            "attach_tip",
            "move_pipette",
            "aspirate",
            "dispense",
            "discard_tip",
            // out to waste
            "attach_tip",
            "move_pipette",
            "aspirate",
            "move_pipette",
            "dispense",
            "discard_tip",
        ];
        let expected: Vec<&str> = pass.iter().copied().cycle().take(4 * pass.len()).collect();
        assert_eq!(lab.completed_names().split_off(before), expected);

        let first_at = session.container(first).unwrap().location;
        let second_at = session.container(second).unwrap().location;
        let holds: Vec<(Location, Duration)> = lab
            .completed()
            .into_iter()
            .filter_map(|p| match p {
                Primitive::Hold {
                    location,
                    incubation,
                } => Some((location, incubation.duration)),
                _ => None,
            })
            .collect();
        assert_eq!(
            holds,
            vec![
                (first_at.clone(), soak),
                (second_at.clone(), soak),
                (first_at, soak),
                (second_at, soak),
            ]
        );
        let mixes = lab
            .completed()
            .into_iter()
            .filter(|p| *p == Primitive::Aspirate { volume: 10.0 })
            .count();
        assert_eq!(mixes, 4);

        assert_eq!(session.volume(first).unwrap(), 0.0);
        assert_eq!(session.volume(second).unwrap(), 0.0);
        assert_eq!(session.volume(buffer).unwrap(), 920.0);
        assert_eq!(session.registry().unwrap().total_waste(), 80.0);
    }

    #[tokio::test]
    async fn wash_rejects_bad_parameters_before_issuing_anything() {
        let (lab, mut session, _) = started().await;
        let buffer = session
            .load(ContainerSpec::new("buffer", Labware::Reservoir).with_liquid("buffer", 100.0))
            .await
            .unwrap();
        let well = session
            .load(ContainerSpec::new("well", Labware::Wellplate))
            .await
            .unwrap();
        let issued = lab.journal().len();

        for (targets, wash) in [
            (vec![], Wash::new(10.0)),
            (vec![well], Wash::new(10.0).cycles(0)),
            (vec![well], Wash::new(10.0).mix(1).mix_volume(-1.0)),
            (vec![well], Wash::new(10.0).soak(Duration::ZERO)),
        ] {
            let err = session.wash(&targets, buffer, &wash).await.unwrap_err();
            assert!(matches!(err, LabError::Validation(_)), "{:?}", wash);
        }
        assert_eq!(lab.journal().len(), issued);
    }

    #[tokio::test]
    async fn operator_command_reaches_the_operator() {
        let (lab, mut session, _) = started().await;

        session
            .operator_command("label_plate", &["plate-1"])
            .await
            .unwrap();

        assert_eq!(lab.count("command"), 1);
        let stats = session.stats().unwrap();
        assert_eq!(stats[&OperationKind::OperatorCommand].primitives, 1);
    }
}

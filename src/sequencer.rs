//! Compilation and execution of technician operations.
//!
//! Every operation goes through the same three phases:
//!
//! 1. **Pre-flight**: parameters, handles, volumes, tip availability and
//!    lock contention are checked against the registry. Nothing is sent to an
//!    actor, so a rejected operation has no physical side effect.
//! 2. **Compile**: the operation becomes a [`Plan`] whose shape depends on the
//!    protocol configuration (tip policy, placement).
//! 3. **Run**: targets are locked, steps are issued strictly in order and the
//!    registry effect of each step is applied right after its primitive
//!    completes. The first failing primitive aborts the rest of the plan.
//!    Targets are unlocked on every exit path.
//!
//! Because effects follow completed primitives, a plan that fails midway
//! leaves the registry describing exactly what physically happened. If a
//! dispense fails after its aspirate succeeded, the liquid is recorded as held
//! in the tip.

use crate::actors::ActorSet;
use crate::config::{Placement, ProtocolConfig, TipPolicy};
use crate::deck::Deck;
use crate::error::{LabError, LabResult, ResourceError};
use crate::labware::{Liquid, Location};
use crate::protocol::{
    CommandRecord, CommandStatus, Destination, Effect, Incubation, Operation, OperationKind,
    Plan, Primitive, Step, StepStatus,
};
use crate::registry::{
    ContainerId, ContainerSpec, LockTarget, LossReason, LossRecord, Portion, ResourceRegistry,
    TipId,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Per-operation counters reported in the experiment summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OperationStats {
    /// Technician calls, including rejected ones.
    pub calls: u32,
    /// Primitives issued to actors.
    pub primitives: u32,
    /// Rejected or failed calls.
    pub failures: u32,
}

/// Optional parameters of an absorbance measurement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AbsorbanceRequest {
    /// Defaults to the protocol's configured wavelength.
    pub wavelength_nm: Option<f64>,
    /// Container whose reading is subtracted from the sample's.
    pub blank: Option<ContainerId>,
}

/// Result of `measure_absorbance`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbsorbanceReading {
    /// Sample container.
    pub container: ContainerId,
    /// Wavelength the reading was taken at.
    pub wavelength_nm: f64,
    /// Blank-corrected absorbance.
    pub absorbance: f64,
    /// Uncorrected sample reading.
    pub raw: f64,
    /// Blank reading, when a blank was given.
    pub blank: Option<f64>,
}

/// Turns technician operations into primitive plans and runs them.
#[derive(Debug)]
pub struct CommandSequencer {
    actors: ActorSet,
    protocol: ProtocolConfig,
    deck: Deck,
    log: Vec<CommandRecord>,
    stats: BTreeMap<OperationKind, OperationStats>,
}

fn validate_volume(volume: f64) -> LabResult<()> {
    if !volume.is_finite() || volume <= 0.0 {
        return Err(LabError::validation(format!(
            "volume must be a positive number of microliters, got {}",
            volume
        )));
    }
    Ok(())
}

fn ensure_unlocked(registry: &ResourceRegistry, targets: &[LockTarget]) -> LabResult<()> {
    for target in targets {
        if registry.is_locked(*target) {
            return Err(ResourceError::Contended(target.to_string()).into());
        }
    }
    Ok(())
}

fn liquids_of(registry: &ResourceRegistry, id: ContainerId) -> LabResult<Vec<Liquid>> {
    Ok(registry.container(id)?.contents().liquids().cloned().collect())
}

impl CommandSequencer {
    /// Sequencer with an empty log.
    pub fn new(actors: ActorSet, protocol: ProtocolConfig, deck: Deck) -> Self {
        Self {
            actors,
            protocol,
            deck,
            log: Vec::new(),
            stats: BTreeMap::new(),
        }
    }

    /// Settings plans are compiled with.
    pub fn protocol(&self) -> &ProtocolConfig {
        &self.protocol
    }

    /// Every command issued so far, in order.
    pub fn log(&self) -> &[CommandRecord] {
        &self.log
    }

    /// Per-operation counters.
    pub fn stats(&self) -> &BTreeMap<OperationKind, OperationStats> {
        &self.stats
    }

    // ---------------------------------------------------------------------
    // Technician operations
    // ---------------------------------------------------------------------

    /// Registers a container and has it placed and filled.
    pub async fn load(
        &mut self,
        registry: &mut ResourceRegistry,
        spec: &ContainerSpec,
    ) -> LabResult<ContainerId> {
        let compiled = self.compile_load(registry, spec);
        let (id, plan) = self.preflight(OperationKind::Load, compiled)?;
        self.run(registry, plan).await?;
        Ok(id)
    }

    /// Has the operator bring more of a liquid into an existing container.
    pub async fn bring(
        &mut self,
        registry: &mut ResourceRegistry,
        container: ContainerId,
        liquid: &Liquid,
        volume: f64,
    ) -> LabResult<()> {
        let compiled = self.compile_bring(registry, container, liquid, volume);
        let plan = self.preflight(OperationKind::Bring, compiled)?;
        self.run(registry, plan).await.map(|_| ())
    }

    /// Moves `volume` from `source` into each destination, on one tip.
    pub async fn transfer(
        &mut self,
        registry: &mut ResourceRegistry,
        source: ContainerId,
        destinations: &[ContainerId],
        volume: f64,
    ) -> LabResult<()> {
        let compiled = self.compile_transfer(registry, source, destinations, volume);
        let plan = self.preflight(OperationKind::Transfer, compiled)?;
        self.run(registry, plan).await.map(|_| ())
    }

    /// Aspirates and dispenses `volume` back into the container `cycles` times.
    pub async fn mix(
        &mut self,
        registry: &mut ResourceRegistry,
        container: ContainerId,
        volume: f64,
        cycles: u32,
    ) -> LabResult<()> {
        let compiled = self.compile_mix(registry, container, volume, cycles);
        let plan = self.preflight(OperationKind::Mix, compiled)?;
        self.run(registry, plan).await.map(|_| ())
    }

    /// Hands the container to the operator for a timed hold.
    pub async fn incubate(
        &mut self,
        registry: &mut ResourceRegistry,
        container: ContainerId,
        incubation: &Incubation,
    ) -> LabResult<()> {
        let compiled = self.compile_incubate(registry, container, incubation);
        let plan = self.preflight(OperationKind::Incubate, compiled)?;
        self.run(registry, plan).await.map(|_| ())
    }

    /// Reads the container's absorbance, optionally blank-corrected.
    pub async fn measure_absorbance(
        &mut self,
        registry: &mut ResourceRegistry,
        container: ContainerId,
        request: &AbsorbanceRequest,
    ) -> LabResult<AbsorbanceReading> {
        let compiled = self.compile_measure(registry, container, request);
        let (wavelength_nm, plan) = self.preflight(OperationKind::MeasureAbsorbance, compiled)?;
        let readings = self.run(registry, plan).await?;

        let raw = readings.first().copied().ok_or_else(|| {
            LabError::validation("photometer returned no reading for the sample")
        })?;
        let blank = readings.get(1).copied();
        let absorbance = raw - blank.unwrap_or(0.0);
        info!(container = %container, wavelength_nm, absorbance, "absorbance measured");
        Ok(AbsorbanceReading {
            container,
            wavelength_nm,
            absorbance,
            raw,
            blank,
        })
    }

    /// Removes `volume` from the container into the waste station.
    pub async fn discard_liquid(
        &mut self,
        registry: &mut ResourceRegistry,
        container: ContainerId,
        volume: f64,
    ) -> LabResult<()> {
        let compiled = self.compile_discard_liquid(registry, container, volume);
        let plan = self.preflight(OperationKind::DiscardLiquid, compiled)?;
        self.run(registry, plan).await.map(|_| ())
    }

    /// Discards the tip on the pipette. Does nothing when no tip is attached.
    pub async fn discard_tip(&mut self, registry: &mut ResourceRegistry) -> LabResult<()> {
        let compiled = self.compile_discard_tip(registry);
        match self.preflight(OperationKind::DiscardTip, compiled)? {
            Some(plan) => self.run(registry, plan).await.map(|_| ()),
            None => Ok(()),
        }
    }

    /// Passes a free-form instruction to the operator.
    pub async fn operator_command(
        &mut self,
        registry: &mut ResourceRegistry,
        name: &str,
        args: &[String],
    ) -> LabResult<()> {
        let compiled = Self::compile_operator_command(name, args);
        let plan = self.preflight(OperationKind::OperatorCommand, compiled)?;
        self.run(registry, plan).await.map(|_| ())
    }

    // ---------------------------------------------------------------------
    // Compilation (pre-flight included)
    // ---------------------------------------------------------------------

    fn compile_load(
        &mut self,
        registry: &mut ResourceRegistry,
        spec: &ContainerSpec,
    ) -> LabResult<(ContainerId, Plan)> {
        if spec.label.trim().is_empty() {
            return Err(LabError::validation("container label must not be empty"));
        }
        let capacity = spec.resolved_capacity();
        if !capacity.is_finite() || capacity <= 0.0 {
            return Err(ResourceError::InvalidCapacity {
                label: spec.label.clone(),
                capacity,
            }
            .into());
        }
        if let Some((liquid, volume)) = &spec.contents {
            if !volume.is_finite() || *volume < 0.0 {
                return Err(LabError::validation(format!(
                    "initial volume must be a non-negative number of microliters, got {}",
                    volume
                )));
            }
            if *volume > capacity {
                return Err(LabError::validation(format!(
                    "{} uL of {} does not fit into '{}' ({} uL capacity)",
                    volume, liquid, spec.label, capacity
                )));
            }
        }
        if registry.container_by_label(&spec.label).is_ok() {
            return Err(ResourceError::DuplicateLabel(spec.label.clone()).into());
        }

        // Declared-empty contents load like a container without liquid.
        let contents = spec.contents.clone().filter(|(_, volume)| *volume > 0.0);

        let location = self.deck.allocate(spec.labware, &spec.label)?;
        let id = registry.register_container(spec, location.clone())?;

        let pre_positioned =
            spec.pre_positioned || self.protocol.placement == Placement::PrePositioned;
        let mut plan = Plan::new(Operation::Load {
            label: spec.label.clone(),
            labware: spec.labware,
            capacity,
            contents: contents.clone(),
        })
        .lock(LockTarget::Container(id));

        if !pre_positioned {
            plan = plan.step(Step::plain(Primitive::Place {
                item: spec.label.clone(),
                location: location.clone(),
            }));
        }
        if let Some((liquid, volume)) = contents {
            let portion = Portion::single(liquid.clone(), volume);
            if pre_positioned {
                // Pre-positioned labware arrives already filled.
                registry.deposit(id, &portion)?;
            } else {
                plan = plan.step(Step::new(
                    Primitive::Move {
                        item: liquid.to_string(),
                        from: Location::storage(),
                        to: location,
                    },
                    Effect::Fill {
                        container: id,
                        portion,
                    },
                ));
            }
        }
        Ok((id, plan))
    }

    fn compile_bring(
        &mut self,
        registry: &mut ResourceRegistry,
        container: ContainerId,
        liquid: &Liquid,
        volume: f64,
    ) -> LabResult<Plan> {
        validate_volume(volume)?;
        let location = registry.container(container)?.location.clone();
        registry.check_deposit(container, volume)?;
        ensure_unlocked(registry, &[LockTarget::Container(container)])?;

        Ok(Plan::new(Operation::Bring {
            container,
            liquid: liquid.clone(),
            volume,
        })
        .lock(LockTarget::Container(container))
        .step(Step::new(
            Primitive::Move {
                item: liquid.to_string(),
                from: Location::storage(),
                to: location,
            },
            Effect::Fill {
                container,
                portion: Portion::single(liquid.clone(), volume),
            },
        )))
    }

    fn compile_transfer(
        &mut self,
        registry: &mut ResourceRegistry,
        source: ContainerId,
        destinations: &[ContainerId],
        volume: f64,
    ) -> LabResult<Plan> {
        validate_volume(volume)?;
        if destinations.is_empty() {
            return Err(LabError::validation(
                "transfer needs at least one destination",
            ));
        }
        if destinations.contains(&source) {
            return Err(LabError::validation(format!(
                "cannot transfer from {} into itself",
                source
            )));
        }
        let unique: BTreeSet<_> = destinations.iter().collect();
        if unique.len() != destinations.len() {
            return Err(LabError::validation("transfer destinations must be distinct"));
        }

        let source_location = registry.container(source)?.location.clone();
        registry.check_withdraw(source, volume * destinations.len() as f64)?;
        let delivered = volume * (1.0 - self.protocol.dead_volume_fraction);
        let mut targets = vec![(source, source_location)];
        for &destination in destinations {
            let location = registry.container(destination)?.location.clone();
            registry.check_deposit(destination, delivered)?;
            targets.push((destination, location));
        }

        let liquids = liquids_of(registry, source)?;
        let attached = self.check_tip(registry, &liquids)?;
        let mut locks: Vec<LockTarget> = targets
            .iter()
            .map(|(id, _)| LockTarget::Container(*id))
            .collect();
        ensure_unlocked(registry, &locks)?;
        let (tip, fresh) = self.claim_tip(registry, attached)?;
        locks.push(LockTarget::Tip(tip));

        let mut plan = Plan::new(Operation::Transfer {
            source,
            destinations: destinations.to_vec(),
            volume,
        });
        plan.locks = locks;
        plan = self.attach_step(plan, tip, fresh);

        let (_, source_location) = &targets[0];
        for (destination, location) in &targets[1..] {
            plan = plan
                .step(Step::plain(Primitive::MovePipette {
                    location: source_location.clone(),
                }))
                .step(Step::new(
                    Primitive::Aspirate { volume },
                    Effect::Aspirate {
                        tip,
                        from: source,
                        volume,
                    },
                ))
                .step(Step::plain(Primitive::MovePipette {
                    location: location.clone(),
                }))
                .step(Step::new(
                    Primitive::Dispense { volume },
                    Effect::Dispense {
                        tip,
                        into: Destination::Container(*destination),
                        volume,
                        loss_fraction: self.protocol.dead_volume_fraction,
                    },
                ));
        }
        Ok(self.discard_step(plan, tip))
    }

    fn compile_mix(
        &mut self,
        registry: &mut ResourceRegistry,
        container: ContainerId,
        volume: f64,
        cycles: u32,
    ) -> LabResult<Plan> {
        if cycles == 0 {
            return Err(LabError::validation("mix needs at least one cycle"));
        }
        validate_volume(volume)?;
        let location = registry.container(container)?.location.clone();
        registry.check_withdraw(container, volume)?;

        let liquids = liquids_of(registry, container)?;
        let attached = self.check_tip(registry, &liquids)?;
        ensure_unlocked(registry, &[LockTarget::Container(container)])?;
        let (tip, fresh) = self.claim_tip(registry, attached)?;

        let mut plan = Plan::new(Operation::Mix {
            container,
            volume,
            cycles,
        })
        .lock(LockTarget::Container(container))
        .lock(LockTarget::Tip(tip));
        plan = self.attach_step(plan, tip, fresh);

        for _ in 0..cycles {
            plan = plan
                .step(Step::plain(Primitive::MovePipette {
                    location: location.clone(),
                }))
                .step(Step::new(
                    Primitive::Aspirate { volume },
                    Effect::Aspirate {
                        tip,
                        from: container,
                        volume,
                    },
                ))
                .step(Step::new(
                    Primitive::Dispense { volume },
                    Effect::Dispense {
                        tip,
                        into: Destination::Container(container),
                        volume,
                        loss_fraction: 0.0,
                    },
                ));
        }
        Ok(self.discard_step(plan, tip))
    }

    fn compile_incubate(
        &mut self,
        registry: &mut ResourceRegistry,
        container: ContainerId,
        incubation: &Incubation,
    ) -> LabResult<Plan> {
        if incubation.duration.is_zero() {
            return Err(LabError::validation("incubation duration must be positive"));
        }
        if let Some(temperature) = incubation.temperature_c {
            if !temperature.is_finite() {
                return Err(LabError::validation(format!(
                    "invalid incubation temperature {}",
                    temperature
                )));
            }
        }
        let location = registry.container(container)?.location.clone();
        ensure_unlocked(registry, &[LockTarget::Container(container)])?;

        Ok(Plan::new(Operation::Incubate {
            container,
            incubation: incubation.clone(),
        })
        .lock(LockTarget::Container(container))
        .step(Step::plain(Primitive::Hold {
            location,
            incubation: incubation.clone(),
        })))
    }

    fn compile_measure(
        &mut self,
        registry: &mut ResourceRegistry,
        container: ContainerId,
        request: &AbsorbanceRequest,
    ) -> LabResult<(f64, Plan)> {
        let wavelength_nm = request
            .wavelength_nm
            .unwrap_or(self.protocol.default_wavelength_nm);
        if !wavelength_nm.is_finite() || wavelength_nm <= 0.0 {
            return Err(LabError::validation(format!(
                "invalid wavelength {} nm",
                wavelength_nm
            )));
        }
        if request.blank == Some(container) {
            return Err(LabError::validation(
                "a container cannot be its own blank",
            ));
        }

        let mut readings = vec![(container, registry.container(container)?.location.clone())];
        if let Some(blank) = request.blank {
            readings.push((blank, registry.container(blank)?.location.clone()));
        }
        let locks: Vec<LockTarget> = readings
            .iter()
            .map(|(id, _)| LockTarget::Container(*id))
            .collect();
        ensure_unlocked(registry, &locks)?;

        let mut plan = Plan::new(Operation::MeasureAbsorbance {
            container,
            wavelength_nm,
            blank: request.blank,
        });
        plan.locks = locks;
        for (_, location) in readings {
            plan = plan.step(Step::plain(Primitive::ReadAbsorbance {
                location,
                wavelength_nm,
            }));
        }
        Ok((wavelength_nm, plan))
    }

    fn compile_discard_liquid(
        &mut self,
        registry: &mut ResourceRegistry,
        container: ContainerId,
        volume: f64,
    ) -> LabResult<Plan> {
        validate_volume(volume)?;
        let location = registry.container(container)?.location.clone();
        registry.check_withdraw(container, volume)?;

        let liquids = liquids_of(registry, container)?;
        let attached = self.check_tip(registry, &liquids)?;
        ensure_unlocked(registry, &[LockTarget::Container(container)])?;
        let (tip, fresh) = self.claim_tip(registry, attached)?;

        let mut plan = Plan::new(Operation::DiscardLiquid { container, volume })
            .lock(LockTarget::Container(container))
            .lock(LockTarget::Tip(tip));
        plan = self
            .attach_step(plan, tip, fresh)
            .step(Step::plain(Primitive::MovePipette { location }))
            .step(Step::new(
                Primitive::Aspirate { volume },
                Effect::Aspirate {
                    tip,
                    from: container,
                    volume,
                },
            ))
            .step(Step::plain(Primitive::MovePipette {
                location: Location::waste(),
            }))
            .step(Step::new(
                Primitive::Dispense { volume },
                Effect::Dispense {
                    tip,
                    into: Destination::Waste,
                    volume,
                    loss_fraction: 0.0,
                },
            ));
        Ok(self.discard_step(plan, tip))
    }

    fn compile_discard_tip(&mut self, registry: &mut ResourceRegistry) -> LabResult<Option<Plan>> {
        let Some(tip) = registry.attached_tip() else {
            return Ok(None);
        };
        ensure_unlocked(registry, &[LockTarget::Tip(tip)])?;
        Ok(Some(
            Plan::new(Operation::DiscardTip { tip })
                .lock(LockTarget::Tip(tip))
                .step(Step::new(Primitive::DiscardTip, Effect::DiscardTip { tip })),
        ))
    }

    fn compile_operator_command(name: &str, args: &[String]) -> LabResult<Plan> {
        if name.trim().is_empty() {
            return Err(LabError::validation("operator command needs a name"));
        }
        // Touches no tracked resource, so nothing is locked.
        Ok(Plan::new(Operation::OperatorCommand {
            name: name.to_string(),
            args: args.to_vec(),
        })
        .step(Step::plain(Primitive::Command {
            name: name.to_string(),
            args: args.to_vec(),
        })))
    }

    // ---------------------------------------------------------------------
    // Tip handling
    // ---------------------------------------------------------------------

    /// Pre-flight for the pipette tip an operation will take `liquids` up with.
    ///
    /// Returns the attached tip when it can be reused, `None` when a fresh tip
    /// is needed (and available).
    fn check_tip(
        &self,
        registry: &ResourceRegistry,
        liquids: &[Liquid],
    ) -> LabResult<Option<TipId>> {
        match registry.attached_tip() {
            Some(tip) => {
                let state = registry.tip(tip)?;
                if !state.held.is_empty() {
                    return Err(ResourceError::TipHoldsLiquid {
                        tip,
                        volume: state.held.volume(),
                    }
                    .into());
                }
                registry.check_uptake(tip, liquids)?;
                ensure_unlocked(registry, &[LockTarget::Tip(tip)])?;
                Ok(Some(tip))
            }
            None if registry.tips_remaining() == 0 => {
                Err(ResourceError::TipsExhausted(registry.tips().count()).into())
            }
            None => Ok(None),
        }
    }

    /// Resolves the tip chosen by [`check_tip`](Self::check_tip), registering a
    /// fresh one if needed. Returns the tip and whether it must be attached.
    fn claim_tip(
        &self,
        registry: &mut ResourceRegistry,
        attached: Option<TipId>,
    ) -> LabResult<(TipId, bool)> {
        match attached {
            Some(tip) => Ok((tip, false)),
            None => Ok((registry.register_tip()?, true)),
        }
    }

    fn attach_step(&self, plan: Plan, tip: TipId, fresh: bool) -> Plan {
        if fresh {
            plan.step(Step::new(
                Primitive::AttachTip { tip },
                Effect::AttachTip { tip },
            ))
        } else {
            plan
        }
    }

    fn discard_step(&self, plan: Plan, tip: TipId) -> Plan {
        match self.protocol.tip_policy {
            TipPolicy::SingleUse => {
                plan.step(Step::new(Primitive::DiscardTip, Effect::DiscardTip { tip }))
            }
            TipPolicy::Reuse => plan,
        }
    }

    // ---------------------------------------------------------------------
    // Execution
    // ---------------------------------------------------------------------

    /// Counts a call and passes the pre-flight outcome through.
    fn preflight<T>(&mut self, kind: OperationKind, compiled: LabResult<T>) -> LabResult<T> {
        let stats = self.stats.entry(kind).or_default();
        stats.calls += 1;
        if let Err(err) = &compiled {
            stats.failures += 1;
            warn!(operation = %kind, error = %err, "operation rejected before issuing primitives");
        }
        compiled
    }

    /// Executes a compiled plan; returns the readings of measurement steps.
    async fn run(&mut self, registry: &mut ResourceRegistry, plan: Plan) -> LabResult<Vec<f64>> {
        let kind = plan.operation.kind();
        let seq = self.log.len() as u64 + 1;
        let mut record = CommandRecord::pending(seq, &plan);

        let mut held = Vec::with_capacity(plan.locks.len());
        for target in &plan.locks {
            if let Err(err) = registry.lock(*target) {
                Self::release(registry, &held);
                self.stats.entry(kind).or_default().failures += 1;
                return Err(err.into());
            }
            held.push(*target);
        }

        record.status = CommandStatus::Executing;
        info!(seq, operation = %kind, steps = plan.steps.len(), "command issued");

        let mut readings = Vec::new();
        let mut failure = None;
        for (index, step) in plan.steps.iter().enumerate() {
            let actor = step.primitive.actor();
            debug!(seq, step = index, actor = %actor, primitive = %step.primitive, "issuing primitive");

            match self.actors.dispatch(&step.primitive).await {
                Ok(reading) => {
                    record.steps[index].status = StepStatus::Done;
                    readings.extend(reading);
                    if let Err(err) = Self::apply(registry, &step.effect) {
                        warn!(seq, step = index, error = %err, "registry rejected effect of completed primitive");
                        record.abort_after(index, err.to_string());
                        failure = Some(err.into());
                        break;
                    }
                }
                Err(err) => {
                    let message = format!("{:#}", err);
                    let state = Self::describe_state(registry, &plan);
                    warn!(
                        seq,
                        step = index,
                        actor = %actor,
                        primitive = %step.primitive,
                        error = %message,
                        "primitive failed, aborting command"
                    );
                    record.fail_at(index, message.clone());
                    failure = Some(LabError::Actor {
                        actor,
                        step: index,
                        primitive: step.primitive.to_string(),
                        message,
                        state,
                    });
                    break;
                }
            }
        }

        Self::release(registry, &held);

        let stats = self.stats.entry(kind).or_default();
        stats.primitives += record.issued_primitives() as u32;
        let result = match failure {
            Some(err) => {
                stats.failures += 1;
                Err(err)
            }
            None => {
                record.status = CommandStatus::Done;
                Ok(readings)
            }
        };
        self.log.push(record);
        result
    }

    fn release(registry: &mut ResourceRegistry, held: &[LockTarget]) {
        for target in held.iter().rev() {
            if let Err(err) = registry.unlock(*target) {
                warn!(target = %target, error = %err, "failed to release lock");
            }
        }
    }

    /// Applies the registry consequence of a completed primitive.
    fn apply(registry: &mut ResourceRegistry, effect: &Effect) -> Result<(), ResourceError> {
        match effect {
            Effect::None => Ok(()),
            Effect::Fill { container, portion } => registry.deposit(*container, portion),
            Effect::AttachTip { tip } => registry.attach(*tip),
            Effect::Aspirate { tip, from, volume } => {
                let liquids: Vec<Liquid> =
                    registry.container(*from)?.contents().liquids().cloned().collect();
                registry.mark_used(*tip, &liquids)?;
                let portion = registry.withdraw(*from, *volume)?;
                registry.load_tip(*tip, &portion)
            }
            Effect::Dispense {
                tip,
                into,
                volume,
                loss_fraction,
            } => match into {
                Destination::Container(id) => {
                    registry.check_deposit(*id, volume * (1.0 - loss_fraction))?;
                    let portion = registry.unload_tip(*tip, *volume)?;
                    if *loss_fraction > 0.0 {
                        let lost = portion.scaled(*loss_fraction);
                        registry.deposit(*id, &portion.scaled(1.0 - loss_fraction))?;
                        registry.record_loss(LossRecord {
                            container: Some(*id),
                            tip: Some(*tip),
                            portion: lost,
                            reason: LossReason::DeadVolume,
                        });
                        Ok(())
                    } else {
                        registry.deposit(*id, &portion)
                    }
                }
                Destination::Waste => {
                    let portion = registry.unload_tip(*tip, *volume)?;
                    registry.deposit_waste(&portion);
                    Ok(())
                }
            },
            Effect::DiscardTip { tip } => registry.discard(*tip).map(|_| ()),
        }
    }

    /// Summarizes what a failed plan left behind, for the operator.
    fn describe_state(registry: &ResourceRegistry, plan: &Plan) -> String {
        let mut parts: Vec<String> = plan
            .locks
            .iter()
            .filter_map(|target| match target {
                LockTarget::Container(id) => registry.container(*id).ok(),
                LockTarget::Tip(_) => None,
            })
            .map(|c| format!("{} '{}' holds {} uL", c.id, c.label, c.volume()))
            .collect();
        match registry.attached_tip().and_then(|t| registry.tip(t).ok()) {
            Some(tip) if !tip.held.is_empty() => {
                parts.push(format!("tip {} attached holding {}", tip.id, tip.held))
            }
            Some(tip) => parts.push(format!("tip {} attached, empty", tip.id)),
            None => parts.push("no tip attached".to_string()),
        }
        parts.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::sim::SimulatedLab;
    use crate::config::DeckConfig;
    use crate::labware::Labware;

    fn setup(protocol: ProtocolConfig) -> (SimulatedLab, CommandSequencer, ResourceRegistry) {
        let lab = SimulatedLab::new();
        let registry = ResourceRegistry::new(protocol.max_tips)
            .with_cross_contamination(protocol.allow_cross_contamination);
        let sequencer =
            CommandSequencer::new(lab.actors(), protocol, Deck::new(&DeckConfig::default()));
        (lab, sequencer, registry)
    }

    async fn two_tubes(
        sequencer: &mut CommandSequencer,
        registry: &mut ResourceRegistry,
    ) -> (ContainerId, ContainerId) {
        let a = sequencer
            .load(
                registry,
                &ContainerSpec::new("A", Labware::TestTube)
                    .with_capacity(1000.0)
                    .with_liquid("water", 1000.0),
            )
            .await
            .unwrap();
        let b = sequencer
            .load(
                registry,
                &ContainerSpec::new("B", Labware::TestTube).with_capacity(1000.0),
            )
            .await
            .unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn load_places_and_fills() {
        let (lab, mut sequencer, mut registry) = setup(ProtocolConfig::default());
        let (a, b) = two_tubes(&mut sequencer, &mut registry).await;

        assert_eq!(lab.completed_names(), vec!["place", "move", "place"]);
        assert_eq!(registry.get_volume(a).unwrap(), 1000.0);
        assert_eq!(registry.get_volume(b).unwrap(), 0.0);
        assert_eq!(sequencer.log().len(), 2);
    }

    #[tokio::test]
    async fn pre_positioned_load_issues_nothing() {
        let protocol = ProtocolConfig {
            placement: Placement::PrePositioned,
            ..ProtocolConfig::default()
        };
        let (lab, mut sequencer, mut registry) = setup(protocol);
        let (a, _) = two_tubes(&mut sequencer, &mut registry).await;

        assert!(lab.completed().is_empty());
        assert_eq!(registry.get_volume(a).unwrap(), 1000.0);
        assert_eq!(sequencer.log()[0].status, CommandStatus::Done);
    }

    #[tokio::test]
    async fn zero_initial_volume_loads_an_empty_container() {
        let (lab, mut sequencer, mut registry) = setup(ProtocolConfig::default());
        let b = sequencer
            .load(
                &mut registry,
                &ContainerSpec::new("B", Labware::TestTube)
                    .with_capacity(1000.0)
                    .with_liquid("water", 0.0),
            )
            .await
            .unwrap();

        assert_eq!(lab.completed_names(), vec!["place"]);
        assert_eq!(registry.get_volume(b).unwrap(), 0.0);
        assert!(registry.container(b).unwrap().contents().is_empty());

        for volume in [-1.0, f64::NAN, f64::INFINITY] {
            let err = sequencer
                .load(
                    &mut registry,
                    &ContainerSpec::new(format!("bad {}", volume), Labware::TestTube)
                        .with_liquid("water", volume),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, LabError::Validation(_)), "volume {}", volume);
        }
    }

    #[tokio::test]
    async fn transfer_primitive_order() {
        let (lab, mut sequencer, mut registry) = setup(ProtocolConfig::default());
        let (a, b) = two_tubes(&mut sequencer, &mut registry).await;
        let before = lab.completed().len();

        sequencer.transfer(&mut registry, a, &[b], 200.0).await.unwrap();

        let names: Vec<_> = lab.completed_names().split_off(before);
        assert_eq!(
            names,
            vec![
                "attach_tip",
                "move_pipette",
                "aspirate",
                "move_pipette",
                "dispense",
                "discard_tip"
            ]
        );
        assert_eq!(registry.get_volume(a).unwrap(), 800.0);
        assert_eq!(registry.get_volume(b).unwrap(), 200.0);
        assert_eq!(registry.attached_tip(), None);
        assert!(!registry.is_locked(LockTarget::Container(a)));
    }

    #[tokio::test]
    async fn transfer_to_many_uses_one_tip() {
        let (lab, mut sequencer, mut registry) = setup(ProtocolConfig::default());
        let (a, b) = two_tubes(&mut sequencer, &mut registry).await;
        let c = sequencer
            .load(&mut registry, &ContainerSpec::new("C", Labware::TestTube))
            .await
            .unwrap();

        sequencer.transfer(&mut registry, a, &[b, c], 50.0).await.unwrap();

        assert_eq!(lab.count("attach_tip"), 1);
        assert_eq!(lab.count("aspirate"), 2);
        assert_eq!(lab.count("discard_tip"), 1);
        assert_eq!(registry.get_volume(a).unwrap(), 900.0);
        assert_eq!(registry.get_volume(c).unwrap(), 50.0);
    }

    #[tokio::test]
    async fn reuse_policy_keeps_the_tip() {
        let protocol = ProtocolConfig {
            tip_policy: TipPolicy::Reuse,
            ..ProtocolConfig::default()
        };
        let (lab, mut sequencer, mut registry) = setup(protocol);
        let (a, b) = two_tubes(&mut sequencer, &mut registry).await;

        sequencer.transfer(&mut registry, a, &[b], 10.0).await.unwrap();
        sequencer.transfer(&mut registry, a, &[b], 10.0).await.unwrap();

        assert_eq!(lab.count("attach_tip"), 1);
        assert_eq!(lab.count("discard_tip"), 0);
        assert!(registry.attached_tip().is_some());

        sequencer.discard_tip(&mut registry).await.unwrap();
        assert_eq!(registry.attached_tip(), None);
        sequencer.discard_tip(&mut registry).await.unwrap();
        assert_eq!(lab.count("discard_tip"), 1);
    }

    #[tokio::test]
    async fn reused_tip_guards_against_cross_contamination() {
        let protocol = ProtocolConfig {
            tip_policy: TipPolicy::Reuse,
            ..ProtocolConfig::default()
        };
        let (lab, mut sequencer, mut registry) = setup(protocol);
        let (a, b) = two_tubes(&mut sequencer, &mut registry).await;
        let stock = sequencer
            .load(
                &mut registry,
                &ContainerSpec::new("stock", Labware::TestTube).with_liquid("stock", 50.0),
            )
            .await
            .unwrap();

        sequencer.transfer(&mut registry, a, &[b], 10.0).await.unwrap();
        let issued = lab.completed().len();
        let err = sequencer
            .transfer(&mut registry, stock, &[b], 10.0)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            LabError::Resource(ResourceError::CrossContamination { .. })
        ));
        assert_eq!(lab.completed().len(), issued);
        assert_eq!(registry.get_volume(stock).unwrap(), 50.0);
    }

    #[tokio::test]
    async fn insufficient_source_is_rejected_before_any_primitive() {
        let (lab, mut sequencer, mut registry) = setup(ProtocolConfig::default());
        let (a, b) = two_tubes(&mut sequencer, &mut registry).await;
        let issued = lab.journal().len();

        let err = sequencer
            .transfer(&mut registry, a, &[b], 1200.0)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            LabError::Resource(ResourceError::Underflow { .. })
        ));
        assert_eq!(lab.journal().len(), issued);
        assert_eq!(registry.tips().count(), 0);
        assert_eq!(sequencer.stats()[&OperationKind::Transfer].failures, 1);
    }

    #[tokio::test]
    async fn destination_overflow_is_rejected() {
        let (_lab, mut sequencer, mut registry) = setup(ProtocolConfig::default());
        let (a, _) = two_tubes(&mut sequencer, &mut registry).await;
        let small = sequencer
            .load(
                &mut registry,
                &ContainerSpec::new("small", Labware::TestTube).with_capacity(20.0),
            )
            .await
            .unwrap();

        let err = sequencer
            .transfer(&mut registry, a, &[small], 50.0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LabError::Resource(ResourceError::Overflow { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_parameters_are_validation_errors() {
        let (_lab, mut sequencer, mut registry) = setup(ProtocolConfig::default());
        let (a, b) = two_tubes(&mut sequencer, &mut registry).await;

        for volume in [0.0, -5.0, f64::NAN] {
            let err = sequencer
                .transfer(&mut registry, a, &[b], volume)
                .await
                .unwrap_err();
            assert!(matches!(err, LabError::Validation(_)));
        }
        let err = sequencer
            .transfer(&mut registry, a, &[a], 5.0)
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::Validation(_)));
        let err = sequencer.mix(&mut registry, a, 5.0, 0).await.unwrap_err();
        assert!(matches!(err, LabError::Validation(_)));
    }

    #[tokio::test]
    async fn dispense_failure_leaves_liquid_in_tip() {
        let (lab, mut sequencer, mut registry) = setup(ProtocolConfig::default());
        let (a, b) = two_tubes(&mut sequencer, &mut registry).await;
        lab.fail_on("dispense", 1);

        let err = sequencer
            .transfer(&mut registry, a, &[b], 200.0)
            .await
            .unwrap_err();

        match err {
            LabError::Actor {
                step,
                primitive,
                state,
                ..
            } => {
                assert_eq!(step, 4);
                assert!(primitive.starts_with("dispense"));
                assert!(state.contains("holding"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(registry.get_volume(a).unwrap(), 800.0);
        assert_eq!(registry.get_volume(b).unwrap(), 0.0);
        let tip = registry.attached_tip().unwrap();
        assert_eq!(registry.tip(tip).unwrap().held.volume(), 200.0);
        assert!(!registry.is_locked(LockTarget::Container(a)));
        assert!(!registry.is_locked(LockTarget::Tip(tip)));

        let record = sequencer.log().last().unwrap();
        assert_eq!(record.status, CommandStatus::Failed);
        assert_eq!(record.failed_step, Some(4));
        assert_eq!(record.steps[5].status, StepStatus::Aborted);

        // A loaded tip blocks further liquid handling until discarded.
        let err = sequencer
            .transfer(&mut registry, a, &[b], 10.0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LabError::Resource(ResourceError::TipHoldsLiquid { .. })
        ));

        sequencer.discard_tip(&mut registry).await.unwrap();
        assert_eq!(registry.total_loss(), 200.0);
    }

    #[tokio::test]
    async fn mix_keeps_volume() {
        let (lab, mut sequencer, mut registry) = setup(ProtocolConfig::default());
        let (a, _) = two_tubes(&mut sequencer, &mut registry).await;
        let before = lab.completed().len();

        sequencer.mix(&mut registry, a, 100.0, 3).await.unwrap();

        assert_eq!(registry.get_volume(a).unwrap(), 1000.0);
        let names = lab.completed_names().split_off(before);
        assert_eq!(names.len(), 1 + 3 * 3 + 1);
        assert_eq!(names.first(), Some(&"attach_tip"));
        assert_eq!(names.last(), Some(&"discard_tip"));
    }

    #[tokio::test]
    async fn mix_larger_than_contents_is_rejected() {
        let (_lab, mut sequencer, mut registry) = setup(ProtocolConfig::default());
        let (_, b) = two_tubes(&mut sequencer, &mut registry).await;
        let err = sequencer.mix(&mut registry, b, 10.0, 1).await.unwrap_err();
        assert!(matches!(
            err,
            LabError::Resource(ResourceError::Underflow { .. })
        ));
    }

    #[tokio::test]
    async fn dead_volume_is_accounted() {
        let protocol = ProtocolConfig {
            dead_volume_fraction: 0.1,
            ..ProtocolConfig::default()
        };
        let (_lab, mut sequencer, mut registry) = setup(protocol);
        let (a, b) = two_tubes(&mut sequencer, &mut registry).await;

        sequencer.transfer(&mut registry, a, &[b], 100.0).await.unwrap();

        assert_eq!(registry.get_volume(a).unwrap(), 900.0);
        assert!((registry.get_volume(b).unwrap() - 90.0).abs() < 1e-9);
        assert!((registry.total_loss() - 10.0).abs() < 1e-9);
        assert_eq!(registry.losses()[0].reason, LossReason::DeadVolume);
    }

    #[tokio::test]
    async fn tip_exhaustion_is_a_resource_error() {
        let protocol = ProtocolConfig {
            max_tips: 1,
            ..ProtocolConfig::default()
        };
        let (_lab, mut sequencer, mut registry) = setup(protocol);
        let (a, b) = two_tubes(&mut sequencer, &mut registry).await;

        sequencer.transfer(&mut registry, a, &[b], 10.0).await.unwrap();
        let err = sequencer
            .transfer(&mut registry, a, &[b], 10.0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LabError::Resource(ResourceError::TipsExhausted(1))
        ));
    }

    #[tokio::test]
    async fn discard_liquid_goes_to_waste() {
        let (lab, mut sequencer, mut registry) = setup(ProtocolConfig::default());
        let (a, _) = two_tubes(&mut sequencer, &mut registry).await;

        sequencer.discard_liquid(&mut registry, a, 300.0).await.unwrap();

        assert_eq!(registry.get_volume(a).unwrap(), 700.0);
        assert_eq!(registry.total_waste(), 300.0);
        let moves: Vec<Location> = lab
            .completed()
            .into_iter()
            .filter_map(|p| match p {
                Primitive::MovePipette { location } => Some(location),
                _ => None,
            })
            .collect();
        assert_eq!(moves.last(), Some(&Location::waste()));
    }

    #[tokio::test]
    async fn incubate_issues_a_single_hold() {
        let (lab, mut sequencer, mut registry) = setup(ProtocolConfig::default());
        let (a, _) = two_tubes(&mut sequencer, &mut registry).await;
        let incubation = Incubation::new(std::time::Duration::from_secs(60)).at(37.0);

        sequencer.incubate(&mut registry, a, &incubation).await.unwrap();
        assert_eq!(lab.count("hold"), 1);

        let err = sequencer
            .incubate(
                &mut registry,
                a,
                &Incubation::new(std::time::Duration::ZERO),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::Validation(_)));
    }

    #[tokio::test]
    async fn absorbance_is_blank_corrected() {
        let (lab, mut sequencer, mut registry) = setup(ProtocolConfig::default());
        let (a, b) = two_tubes(&mut sequencer, &mut registry).await;
        lab.set_reading(registry.container(a).unwrap().location.clone(), 0.9);
        lab.set_reading(registry.container(b).unwrap().location.clone(), 0.1);

        let reading = sequencer
            .measure_absorbance(
                &mut registry,
                a,
                &AbsorbanceRequest {
                    wavelength_nm: Some(450.0),
                    blank: Some(b),
                },
            )
            .await
            .unwrap();

        assert_eq!(reading.wavelength_nm, 450.0);
        assert_eq!(reading.raw, 0.9);
        assert_eq!(reading.blank, Some(0.1));
        assert!((reading.absorbance - 0.8).abs() < 1e-12);
        assert_eq!(registry.get_volume(a).unwrap(), 1000.0);
    }

    #[tokio::test]
    async fn operator_command_is_issued_and_logged() {
        let (lab, mut sequencer, mut registry) = setup(ProtocolConfig::default());
        let args = vec!["plate-1".to_string(), "blue".to_string()];

        sequencer
            .operator_command(&mut registry, "label_plate", &args)
            .await
            .unwrap();

        assert_eq!(
            lab.completed(),
            vec![Primitive::Command {
                name: "label_plate".to_string(),
                args: args.clone(),
            }]
        );
        let record = sequencer.log().last().unwrap();
        assert_eq!(record.operation.kind(), OperationKind::OperatorCommand);
        assert_eq!(record.status, CommandStatus::Done);

        let err = sequencer
            .operator_command(&mut registry, " ", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::Validation(_)));
        assert_eq!(lab.journal().len(), 1);
    }

    #[tokio::test]
    async fn locked_target_is_contention() {
        let (lab, mut sequencer, mut registry) = setup(ProtocolConfig::default());
        let (a, b) = two_tubes(&mut sequencer, &mut registry).await;
        registry.lock(LockTarget::Container(b)).unwrap();
        let issued = lab.journal().len();

        let err = sequencer
            .transfer(&mut registry, a, &[b], 10.0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LabError::Resource(ResourceError::Contended(_))
        ));
        assert_eq!(lab.journal().len(), issued);
        assert!(!registry.is_locked(LockTarget::Container(a)));
    }
}

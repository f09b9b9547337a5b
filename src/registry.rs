//! Authoritative state of containers, liquids and tips.
//!
//! Every volume and tip-state invariant is checked here rather than at the
//! call sites. Each method either applies its whole mutation or returns a
//! [`ResourceError`] leaving the registry untouched.
//!
//! Invariants upheld by this module:
//!
//! - every container volume stays within `[0, capacity]`;
//! - aspirate/dispense bookkeeping (`mark_used`, `load_tip`, `unload_tip`)
//!   requires an attached tip, and only one tip is on the pipette at a time;
//! - a target can be locked by one operation at a time. Locking a held target
//!   fails immediately instead of waiting.

use crate::error::ResourceError;
use crate::labware::{Labware, Liquid, Location};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use tracing::{debug, warn};

/// Volumes closer than this are considered equal (microliters).
pub const VOLUME_TOLERANCE: f64 = 1e-9;

/// Opaque handle to a registered container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(u64);

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// Opaque handle to a registered pipette tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TipId(u64);

impl fmt::Display for TipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// An amount of liquid broken down by liquid identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Portion {
    parts: BTreeMap<Liquid, f64>,
}

impl Portion {
    /// A portion made of a single liquid.
    pub fn single(liquid: Liquid, volume: f64) -> Self {
        let mut parts = BTreeMap::new();
        if volume > VOLUME_TOLERANCE {
            parts.insert(liquid, volume);
        }
        Self { parts }
    }

    /// Total volume of the portion.
    pub fn volume(&self) -> f64 {
        self.parts.values().sum()
    }

    /// True when no liquid is left.
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Amount of one liquid in the portion.
    pub fn amount(&self, liquid: &Liquid) -> f64 {
        self.parts.get(liquid).copied().unwrap_or(0.0)
    }

    /// Liquids present, in name order.
    pub fn liquids(&self) -> impl Iterator<Item = &Liquid> {
        self.parts.keys()
    }

    /// `(liquid, volume)` pairs, in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&Liquid, f64)> {
        self.parts.iter().map(|(l, v)| (l, *v))
    }

    /// Adds every liquid of `other` into this portion.
    pub fn merge(&mut self, other: &Portion) {
        for (liquid, volume) in other.iter() {
            *self.parts.entry(liquid.clone()).or_insert(0.0) += volume;
        }
    }

    /// A copy with every part multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> Portion {
        let parts = self
            .parts
            .iter()
            .map(|(l, v)| (l.clone(), v * factor))
            .filter(|(_, v)| *v > VOLUME_TOLERANCE)
            .collect();
        Portion { parts }
    }

    /// Removes `volume` proportionally across all liquids and returns it.
    ///
    /// The returned portion sums to exactly `volume` (capped at the total).
    pub fn split_off(&mut self, volume: f64) -> Portion {
        let total = self.volume();
        if total <= VOLUME_TOLERANCE || volume <= 0.0 {
            return Portion::default();
        }
        if volume >= total - VOLUME_TOLERANCE {
            return std::mem::take(self);
        }

        let ratio = volume / total;
        let count = self.parts.len();
        let mut remaining = volume;
        let mut taken = BTreeMap::new();
        for (i, (liquid, amount)) in self.parts.iter_mut().enumerate() {
            let share = if i + 1 == count {
                remaining.min(*amount)
            } else {
                (*amount * ratio).min(remaining)
            };
            *amount -= share;
            remaining -= share;
            if share > VOLUME_TOLERANCE {
                taken.insert(liquid.clone(), share);
            }
        }
        self.prune();
        Portion { parts: taken }
    }

    fn adjust(&mut self, liquid: &Liquid, delta: f64) {
        *self.parts.entry(liquid.clone()).or_insert(0.0) += delta;
        self.prune();
    }

    fn prune(&mut self) {
        self.parts.retain(|_, v| *v > VOLUME_TOLERANCE);
    }
}

impl fmt::Display for Portion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.parts.is_empty() {
            return f.write_str("nothing");
        }
        let parts: Vec<String> = self
            .parts
            .iter()
            .map(|(l, v)| format!("{} uL {}", v, l))
            .collect();
        f.write_str(&parts.join(" + "))
    }
}

/// Everything needed to register a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Researcher-facing identifier, unique per experiment.
    pub label: String,
    /// Vessel kind.
    pub labware: Labware,
    /// Defaults to the labware's nominal maximum.
    pub capacity: Option<f64>,
    /// Liquid the container is filled with when loaded.
    pub contents: Option<(Liquid, f64)>,
    /// Already on the deck; no `place` primitive is needed.
    pub pre_positioned: bool,
}

impl ContainerSpec {
    /// Empty container at the labware's nominal capacity.
    pub fn new(label: impl Into<String>, labware: Labware) -> Self {
        Self {
            label: label.into(),
            labware,
            capacity: None,
            contents: None,
            pre_positioned: false,
        }
    }

    /// Overrides the nominal capacity.
    pub fn with_capacity(mut self, capacity: f64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Fills the container on load. A volume of `0` loads it empty.
    pub fn with_liquid(mut self, liquid: impl Into<Liquid>, volume: f64) -> Self {
        self.contents = Some((liquid.into(), volume));
        self
    }

    /// Marks the labware as already on the deck and filled.
    pub fn pre_positioned(mut self) -> Self {
        self.pre_positioned = true;
        self
    }

    /// Capacity the container will be registered with.
    pub fn resolved_capacity(&self) -> f64 {
        self.capacity.unwrap_or_else(|| self.labware.max_capacity())
    }
}

/// A registered liquid-holding vessel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Container {
    /// Handle issued at registration.
    pub id: ContainerId,
    /// Unique label.
    pub label: String,
    /// Vessel kind.
    pub labware: Labware,
    /// Deck position.
    pub location: Location,
    /// Maximum volume in microliters.
    pub capacity: f64,
    contents: Portion,
}

impl Container {
    /// Current total volume, always the sum of the contents.
    pub fn volume(&self) -> f64 {
        self.contents.volume()
    }

    /// Remaining room before reaching capacity.
    pub fn free(&self) -> f64 {
        (self.capacity - self.volume()).max(0.0)
    }

    /// Liquids currently in the container.
    pub fn contents(&self) -> &Portion {
        &self.contents
    }
}

/// A pipette tip and its usage state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tip {
    /// Handle issued at registration.
    pub id: TipId,
    /// Currently on the pipette.
    pub attached: bool,
    /// Liquids this tip has taken up since it was attached.
    pub used_with: BTreeSet<Liquid>,
    /// Liquid currently inside the tip (between aspirate and dispense).
    pub held: Portion,
    /// Times the tip was attached.
    pub attach_count: u32,
    /// Times the tip was discarded while attached.
    pub discard_count: u32,
    /// Gone for good.
    pub discarded: bool,
}

impl Tip {
    fn new(id: TipId) -> Self {
        Self {
            id,
            attached: false,
            used_with: BTreeSet::new(),
            held: Portion::default(),
            attach_count: 0,
            discard_count: 0,
            discarded: false,
        }
    }

    /// Has taken up liquid since it was attached.
    pub fn is_used(&self) -> bool {
        !self.used_with.is_empty()
    }

    /// Unattached, unused and empty: nothing left to clean up.
    pub fn is_settled(&self) -> bool {
        !self.attached && !self.is_used() && self.held.is_empty()
    }
}

/// Something a high-level operation can hold exclusively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LockTarget {
    /// A registered container.
    Container(ContainerId),
    /// A registered tip.
    Tip(TipId),
}

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockTarget::Container(id) => write!(f, "container {}", id),
            LockTarget::Tip(id) => write!(f, "tip {}", id),
        }
    }
}

/// Why liquid left the model without reaching a container or the waste.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LossReason {
    /// Configured dead-volume fraction of a transfer.
    DeadVolume,
    /// Liquid still inside a tip when it was discarded.
    DiscardedWithTip,
}

/// One entry of the loss ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LossRecord {
    /// Container the liquid was headed to or came from, if known.
    pub container: Option<ContainerId>,
    /// Tip involved, if any.
    pub tip: Option<TipId>,
    /// What was lost.
    pub portion: Portion,
    /// Why it was lost.
    pub reason: LossReason,
}

impl LossRecord {
    /// Total lost volume.
    pub fn volume(&self) -> f64 {
        self.portion.volume()
    }
}

/// Registry of all resources of one experiment.
#[derive(Debug)]
pub struct ResourceRegistry {
    containers: BTreeMap<ContainerId, Container>,
    labels: HashMap<String, ContainerId>,
    tips: BTreeMap<TipId, Tip>,
    attached: Option<TipId>,
    locks: HashSet<LockTarget>,
    next_container: u64,
    next_tip: u64,
    max_tips: usize,
    allow_cross_contamination: bool,
    losses: Vec<LossRecord>,
    waste: Portion,
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

impl ResourceRegistry {
    /// Creates an empty registry able to issue at most `max_tips` tips.
    pub fn new(max_tips: usize) -> Self {
        Self {
            containers: BTreeMap::new(),
            labels: HashMap::new(),
            tips: BTreeMap::new(),
            attached: None,
            locks: HashSet::new(),
            next_container: 1,
            next_tip: 1,
            max_tips,
            allow_cross_contamination: false,
            losses: Vec::new(),
            waste: Portion::default(),
        }
    }

    /// Lets used tips take up liquids they have not touched yet.
    pub fn with_cross_contamination(mut self, allow: bool) -> Self {
        self.allow_cross_contamination = allow;
        self
    }

    // ---------------------------------------------------------------------
    // Containers
    // ---------------------------------------------------------------------

    /// Registers an empty container at `location`.
    ///
    /// Initial contents are not added here; they are deposited once
    /// the liquid has actually been brought to the container.
    pub fn register_container(
        &mut self,
        spec: &ContainerSpec,
        location: Location,
    ) -> Result<ContainerId, ResourceError> {
        if self.labels.contains_key(&spec.label) {
            return Err(ResourceError::DuplicateLabel(spec.label.clone()));
        }
        let capacity = spec.resolved_capacity();
        if !capacity.is_finite() || capacity <= 0.0 {
            return Err(ResourceError::InvalidCapacity {
                label: spec.label.clone(),
                capacity,
            });
        }

        let id = ContainerId(self.next_container);
        self.next_container += 1;
        self.labels.insert(spec.label.clone(), id);
        self.containers.insert(
            id,
            Container {
                id,
                label: spec.label.clone(),
                labware: spec.labware,
                location,
                capacity,
                contents: Portion::default(),
            },
        );
        debug!(container = %id, label = %spec.label, capacity, "container registered");
        Ok(id)
    }

    /// Looks up a container by handle.
    pub fn container(&self, id: ContainerId) -> Result<&Container, ResourceError> {
        self.containers
            .get(&id)
            .ok_or(ResourceError::UnknownContainer(id))
    }

    fn container_mut(&mut self, id: ContainerId) -> Result<&mut Container, ResourceError> {
        self.containers
            .get_mut(&id)
            .ok_or(ResourceError::UnknownContainer(id))
    }

    /// Looks a container up by its researcher-facing label.
    pub fn container_by_label(&self, label: &str) -> Result<&Container, ResourceError> {
        self.labels
            .get(label)
            .and_then(|id| self.containers.get(id))
            .ok_or_else(|| ResourceError::UnknownLabel(label.to_string()))
    }

    /// All registered containers, in registration order.
    pub fn containers(&self) -> impl Iterator<Item = &Container> {
        self.containers.values()
    }

    /// Current volume of a container.
    pub fn get_volume(&self, id: ContainerId) -> Result<f64, ResourceError> {
        Ok(self.container(id)?.volume())
    }

    /// Changes the amount of one liquid in a container by `delta`.
    pub fn adjust_volume(
        &mut self,
        id: ContainerId,
        liquid: &Liquid,
        delta: f64,
    ) -> Result<(), ResourceError> {
        let container = self.container_mut(id)?;
        let present = container.contents.amount(liquid);
        if present + delta < -VOLUME_TOLERANCE {
            return Err(ResourceError::Underflow {
                container: id,
                requested: -delta,
                available: present,
            });
        }
        if delta > 0.0 && delta > container.free() + VOLUME_TOLERANCE {
            return Err(ResourceError::Overflow {
                container: id,
                requested: delta,
                available: container.free(),
            });
        }
        container.contents.adjust(liquid, delta);
        Ok(())
    }

    /// Fails unless `volume` can be taken out of the container.
    pub fn check_withdraw(&self, id: ContainerId, volume: f64) -> Result<(), ResourceError> {
        let available = self.get_volume(id)?;
        if volume > available + VOLUME_TOLERANCE {
            return Err(ResourceError::Underflow {
                container: id,
                requested: volume,
                available,
            });
        }
        Ok(())
    }

    /// Fails unless `volume` fits into the container.
    pub fn check_deposit(&self, id: ContainerId, volume: f64) -> Result<(), ResourceError> {
        let available = self.container(id)?.free();
        if volume > available + VOLUME_TOLERANCE {
            return Err(ResourceError::Overflow {
                container: id,
                requested: volume,
                available,
            });
        }
        Ok(())
    }

    /// Removes `volume` from a container proportionally across its contents.
    pub fn withdraw(&mut self, id: ContainerId, volume: f64) -> Result<Portion, ResourceError> {
        self.check_withdraw(id, volume)?;
        let container = self.container_mut(id)?;
        Ok(container.contents.split_off(volume))
    }

    /// Adds a liquid portion to a container.
    pub fn deposit(&mut self, id: ContainerId, portion: &Portion) -> Result<(), ResourceError> {
        self.check_deposit(id, portion.volume())?;
        for (liquid, volume) in portion.iter() {
            self.adjust_volume(id, liquid, volume)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Tips
    // ---------------------------------------------------------------------

    /// Takes a fresh tip from the supply.
    pub fn register_tip(&mut self) -> Result<TipId, ResourceError> {
        if self.tips.len() >= self.max_tips {
            return Err(ResourceError::TipsExhausted(self.max_tips));
        }
        let id = TipId(self.next_tip);
        self.next_tip += 1;
        self.tips.insert(id, Tip::new(id));
        debug!(tip = %id, "tip registered");
        Ok(id)
    }

    /// Number of fresh tips that can still be registered.
    pub fn tips_remaining(&self) -> usize {
        self.max_tips.saturating_sub(self.tips.len())
    }

    /// Looks up a tip by handle.
    pub fn tip(&self, id: TipId) -> Result<&Tip, ResourceError> {
        self.tips.get(&id).ok_or(ResourceError::UnknownTip(id))
    }

    fn tip_mut(&mut self, id: TipId) -> Result<&mut Tip, ResourceError> {
        self.tips.get_mut(&id).ok_or(ResourceError::UnknownTip(id))
    }

    fn attached_tip_mut(&mut self, id: TipId) -> Result<&mut Tip, ResourceError> {
        let tip = self.tip_mut(id)?;
        if !tip.attached {
            return Err(ResourceError::TipNotAttached(id));
        }
        Ok(tip)
    }

    /// Every tip issued so far, discarded ones included.
    pub fn tips(&self) -> impl Iterator<Item = &Tip> {
        self.tips.values()
    }

    /// Tip currently on the pipette, if any.
    pub fn attached_tip(&self) -> Option<TipId> {
        self.attached
    }

    /// Puts a tip on the pipette. Re-attaching the attached tip is a no-op.
    pub fn attach(&mut self, id: TipId) -> Result<(), ResourceError> {
        match self.attached {
            Some(current) if current == id => return Ok(()),
            Some(current) => {
                return Err(ResourceError::PipetteOccupied {
                    tip: id,
                    attached: current,
                })
            }
            None => {}
        }
        let tip = self.tip_mut(id)?;
        if tip.discarded {
            return Err(ResourceError::TipDiscarded(id));
        }
        tip.attached = true;
        tip.attach_count += 1;
        self.attached = Some(id);
        Ok(())
    }

    /// Fails if taking up these liquids would contaminate a used tip.
    pub fn check_uptake<'a>(
        &self,
        id: TipId,
        liquids: impl IntoIterator<Item = &'a Liquid>,
    ) -> Result<(), ResourceError> {
        let tip = self.tip(id)?;
        if self.allow_cross_contamination || !tip.is_used() {
            return Ok(());
        }
        for liquid in liquids {
            if !tip.used_with.contains(liquid) {
                let used: Vec<&str> = tip.used_with.iter().map(|l| l.name()).collect();
                return Err(ResourceError::CrossContamination {
                    tip: id,
                    used: used.join(", "),
                    liquid: liquid.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Records that an attached tip has touched these liquids.
    pub fn mark_used<'a>(
        &mut self,
        id: TipId,
        liquids: impl IntoIterator<Item = &'a Liquid> + Clone,
    ) -> Result<(), ResourceError> {
        self.attached_tip_mut(id)?;
        self.check_uptake(id, liquids.clone())?;
        let tip = self.attached_tip_mut(id)?;
        tip.used_with.extend(liquids.into_iter().cloned());
        Ok(())
    }

    /// Adds aspirated liquid to the attached tip.
    pub fn load_tip(&mut self, id: TipId, portion: &Portion) -> Result<(), ResourceError> {
        let tip = self.attached_tip_mut(id)?;
        tip.held.merge(portion);
        Ok(())
    }

    /// Releases `volume` of the liquid held by the attached tip.
    pub fn unload_tip(&mut self, id: TipId, volume: f64) -> Result<Portion, ResourceError> {
        let tip = self.attached_tip_mut(id)?;
        let held = tip.held.volume();
        if volume > held + VOLUME_TOLERANCE {
            return Err(ResourceError::TipUnderflow {
                tip: id,
                requested: volume,
                held,
            });
        }
        Ok(tip.held.split_off(volume))
    }

    /// Discards a tip, clearing attached and used state.
    ///
    /// Idempotent: discarding a discarded tip does nothing. Liquid still held
    /// by the tip is written to the loss ledger and returned.
    pub fn discard(&mut self, id: TipId) -> Result<Option<Portion>, ResourceError> {
        let tip = self.tip_mut(id)?;
        if tip.discarded {
            return Ok(None);
        }
        let was_attached = tip.attached;
        if was_attached {
            tip.discard_count += 1;
        }
        tip.attached = false;
        tip.discarded = true;
        tip.used_with.clear();
        let held = std::mem::take(&mut tip.held);

        if self.attached == Some(id) {
            self.attached = None;
        }
        if held.is_empty() {
            return Ok(None);
        }
        warn!(tip = %id, held = %held, "tip discarded while holding liquid");
        self.losses.push(LossRecord {
            container: None,
            tip: Some(id),
            portion: held.clone(),
            reason: LossReason::DiscardedWithTip,
        });
        Ok(Some(held))
    }

    // ---------------------------------------------------------------------
    // Locks
    // ---------------------------------------------------------------------

    /// Claims exclusive use of a target. Never blocks.
    pub fn lock(&mut self, target: LockTarget) -> Result<(), ResourceError> {
        match target {
            LockTarget::Container(id) => {
                self.container(id)?;
            }
            LockTarget::Tip(id) => {
                self.tip(id)?;
            }
        }
        if !self.locks.insert(target) {
            return Err(ResourceError::Contended(target.to_string()));
        }
        Ok(())
    }

    /// Releases a held target.
    pub fn unlock(&mut self, target: LockTarget) -> Result<(), ResourceError> {
        if !self.locks.remove(&target) {
            return Err(ResourceError::NotLocked(target.to_string()));
        }
        Ok(())
    }

    /// True while an operation holds the target.
    pub fn is_locked(&self, target: LockTarget) -> bool {
        self.locks.contains(&target)
    }

    // ---------------------------------------------------------------------
    // Accounting
    // ---------------------------------------------------------------------

    /// Appends to the loss ledger.
    pub fn record_loss(&mut self, record: LossRecord) {
        self.losses.push(record);
    }

    /// The loss ledger, oldest first.
    pub fn losses(&self) -> &[LossRecord] {
        &self.losses
    }

    /// Sum of the loss ledger.
    pub fn total_loss(&self) -> f64 {
        self.losses.iter().map(LossRecord::volume).sum()
    }

    /// Accounts liquid dispensed into the waste station.
    pub fn deposit_waste(&mut self, portion: &Portion) {
        self.waste.merge(portion);
    }

    /// Microliters dispensed into the waste station.
    pub fn total_waste(&self) -> f64 {
        self.waste.volume()
    }

    /// Describes every resource that blocks teardown; empty when settled.
    pub fn unsettled_resources(&self) -> Vec<String> {
        let mut problems: Vec<String> = self
            .tips
            .values()
            .filter(|tip| !tip.is_settled())
            .map(|tip| {
                format!(
                    "tip {} (attached: {}, used: {}, holding {} uL)",
                    tip.id,
                    tip.attached,
                    tip.is_used(),
                    tip.held.volume()
                )
            })
            .collect();
        problems.extend(self.locks.iter().map(|t| format!("{} still locked", t)));
        problems
    }

    /// Deregisters every container and tip.
    pub fn clear(&mut self) {
        self.containers.clear();
        self.labels.clear();
        self.tips.clear();
        self.locks.clear();
        self.attached = None;
    }
}

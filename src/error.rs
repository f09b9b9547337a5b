//! Custom error types for the orchestration layer.
//!
//! `LabError` is the single error surfaced to technician-facing callers. It is
//! built with `thiserror` and keeps the failure taxonomy small and explicit:
//!
//! - **`State`**: the call is not valid for the experiment's lifecycle phase
//!   (anything before `experiment_init`, anything after `experiment_end`).
//! - **`Validation`**: malformed parameters such as a zero volume, a zero mix
//!   cycle count or an incubation without duration. Raised before any actor
//!   primitive is issued.
//! - **`Resource`**: registry-level failures, see [`ResourceError`]. Raised
//!   during the pre-flight of an operation whenever possible.
//! - **`Actor`**: a primitive reported failure. Carries the failing step and a
//!   description of the state left behind so an operator can resolve it.
//! - **`Teardown`**: `experiment_end` found unsettled resources.
//! - **`Config`**: configuration loading or validation failed.
//!
//! Actor implementations themselves return `anyhow::Result`, as hardware-facing
//! code does elsewhere; the sequencer converts those into `LabError::Actor`.

use crate::actors::ActorKind;
use crate::config::ConfigError;
use crate::registry::{ContainerId, TipId};
use thiserror::Error;

/// Convenience alias for results using the orchestration error type.
pub type LabResult<T> = std::result::Result<T, LabError>;

/// Errors returned by the technician API.
#[derive(Error, Debug)]
pub enum LabError {
    /// Operation invalid for the current lifecycle phase.
    #[error("State error: {0}")]
    State(String),

    /// Malformed operation parameters.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Registry-level failure (unknown handle, volume bounds, contention...).
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    /// A primitive dispatched to an actor reported failure.
    #[error("Actor error: {actor} failed at step {step} ({primitive}): {message}; state left: {state}")]
    Actor {
        /// Actor that executed the failing primitive.
        actor: ActorKind,
        /// Zero-based index of the failing step in the compiled plan.
        step: usize,
        /// Human-readable rendering of the failing primitive.
        primitive: String,
        /// Message reported by the actor.
        message: String,
        /// What the registry looks like after the abort.
        state: String,
    },

    /// Teardown invariant unmet at `experiment_end`.
    #[error("Teardown error: {0}")]
    Teardown(String),

    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl LabError {
    /// Shorthand for a lifecycle violation.
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Shorthand for a parameter validation failure.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Returns true for errors raised before any primitive was issued.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            LabError::State(_) | LabError::Validation(_) | LabError::Resource(_)
        )
    }
}

/// Failures of the resource registry.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResourceError {
    /// No container is registered under this handle.
    #[error("unknown container {0}")]
    UnknownContainer(ContainerId),

    /// No container carries this label.
    #[error("unknown container label '{0}'")]
    UnknownLabel(String),

    /// No tip is registered under this handle.
    #[error("unknown tip {0}")]
    UnknownTip(TipId),

    /// Labels are unique within an experiment.
    #[error("container label '{0}' already exists")]
    DuplicateLabel(String),

    /// Capacity is not a positive finite volume.
    #[error("invalid capacity {capacity} for container '{label}'")]
    InvalidCapacity {
        /// Label of the rejected container.
        label: String,
        /// Offending capacity in microliters.
        capacity: f64,
    },

    /// Adding liquid would exceed the container's capacity.
    #[error("{container} would overflow: {requested} uL requested, {available} uL free")]
    Overflow {
        /// Receiving container.
        container: ContainerId,
        /// Volume that was to be added.
        requested: f64,
        /// Free volume left in the container.
        available: f64,
    },

    /// Removing liquid would take the container below zero.
    #[error("{container} would underflow: {requested} uL requested, {available} uL present")]
    Underflow {
        /// Container the liquid was to come from.
        container: ContainerId,
        /// Volume that was to be removed.
        requested: f64,
        /// Volume actually present.
        available: f64,
    },

    /// Target is held by another operation.
    #[error("{0} is locked by another operation")]
    Contended(String),

    /// Unlock of a target nobody holds.
    #[error("{0} is not locked")]
    NotLocked(String),

    /// Pipetting bookkeeping on a tip that is not on the pipette.
    #[error("tip {0} is not attached")]
    TipNotAttached(TipId),

    /// Discarded tips cannot be attached or discarded again.
    #[error("tip {0} was already discarded")]
    TipDiscarded(TipId),

    /// The single-channel pipette already carries a tip.
    #[error("tip {tip} cannot attach: tip {attached} is already on the pipette")]
    PipetteOccupied {
        /// Tip that was to be attached.
        tip: TipId,
        /// Tip currently on the pipette.
        attached: TipId,
    },

    /// The attached tip still carries liquid from a failed dispense.
    #[error("tip {tip} still holds {volume} uL of unresolved liquid")]
    TipHoldsLiquid {
        /// Loaded tip.
        tip: TipId,
        /// Microliters held.
        volume: f64,
    },

    /// Dispense of more than the tip holds.
    #[error("tip {tip} holds {held} uL, cannot release {requested} uL")]
    TipUnderflow {
        /// Tip being emptied.
        tip: TipId,
        /// Volume that was to be released.
        requested: f64,
        /// Volume actually held.
        held: f64,
    },

    /// A used tip would take up a liquid it has not touched before.
    #[error("tip {tip} was used with [{used}] and cannot take up '{liquid}'")]
    CrossContamination {
        /// Attached tip.
        tip: TipId,
        /// Liquids the tip has touched, comma separated.
        used: String,
        /// Liquid that was refused.
        liquid: String,
    },

    /// Every tip of the supply has been issued.
    #[error("tip supply exhausted after {0} tips")]
    TipsExhausted(usize),

    /// No slot or well left for new labware.
    #[error("no free deck position for {0}")]
    DeckFull(String),
}

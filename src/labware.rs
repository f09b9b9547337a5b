//! Physical vocabulary of the lab: equipment, labware, locations and liquids.
//!
//! These are plain value types. They carry no state of their own; the
//! [`ResourceRegistry`](crate::registry::ResourceRegistry) decides which
//! container sits where and what it holds.

use crate::error::{LabError, LabResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of wells on a standard plate.
pub const WELLPLATE_MAX_WELLS: usize = 96;
/// Wells per plate row (columns 1..=12).
pub const WELLPLATE_ROW_SIZE: usize = 12;

/// A piece of lab equipment that can host labware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Equipment {
    /// Operator bench next to the liquid handler.
    Workbench,
    /// Deck of the robotic liquid handler.
    LiquidHandler,
    /// Temperature-controlled incubator.
    Incubator,
    /// Plate reader used for absorbance measurements.
    Spectrophotometer,
    /// Reagent store the operator brings liquids from.
    Storage,
    /// Waste station of the liquid handler.
    Waste,
}

impl fmt::Display for Equipment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Equipment::Workbench => "workbench",
            Equipment::LiquidHandler => "liquid_handler",
            Equipment::Incubator => "incubator",
            Equipment::Spectrophotometer => "spectrophotometer",
            Equipment::Storage => "storage",
            Equipment::Waste => "waste",
        };
        f.write_str(name)
    }
}

/// Kind of liquid-holding vessel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Labware {
    /// Bulk reagent reservoir.
    Reservoir,
    /// One well of a 96-well plate.
    Wellplate,
    /// Single test tube.
    TestTube,
    /// Measurement cuvette.
    Cuvette,
}

impl Labware {
    /// Nominal maximum working volume in microliters.
    pub fn max_capacity(self) -> f64 {
        match self {
            Labware::Reservoir => 1000.0,
            Labware::Wellplate => 50.0,
            Labware::TestTube => 100.0,
            Labware::Cuvette => 100.0,
        }
    }
}

impl fmt::Display for Labware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Labware::Reservoir => "reservoir",
            Labware::Wellplate => "wellplate",
            Labware::TestTube => "testtube",
            Labware::Cuvette => "cuvette",
        };
        f.write_str(name)
    }
}

/// Converts a zero-based well index into its row-major name (`0 -> A1`, `12 -> B1`).
pub fn well_name(index: usize) -> String {
    let row = (b'A' + (index / WELLPLATE_ROW_SIZE) as u8) as char;
    format!("{}{}", row, index % WELLPLATE_ROW_SIZE + 1)
}

/// Physical position of a container (or of a station such as the waste).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    /// Equipment the position belongs to.
    pub equipment: Equipment,
    /// 1-based deck slot; `0` for stations without slots.
    pub slot: usize,
    /// Kind of labware expected there, if any.
    pub labware: Option<Labware>,
    /// Well name, only meaningful for wellplates.
    pub well: Option<String>,
}

impl Location {
    /// Builds a deck location for the given labware.
    pub fn new(equipment: Equipment, slot: usize, labware: Labware) -> Self {
        Self {
            equipment,
            slot,
            labware: Some(labware),
            well: None,
        }
    }

    /// Builds the location of a single well on a plate.
    pub fn well(equipment: Equipment, slot: usize, well: impl Into<String>) -> Self {
        Self {
            equipment,
            slot,
            labware: Some(Labware::Wellplate),
            well: Some(well.into()),
        }
    }

    /// The reagent store liquids are brought from.
    pub fn storage() -> Self {
        Self {
            equipment: Equipment::Storage,
            slot: 0,
            labware: None,
            well: None,
        }
    }

    /// The liquid handler's waste station.
    pub fn waste() -> Self {
        Self {
            equipment: Equipment::Waste,
            slot: 0,
            labware: None,
            well: None,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.labware, &self.well) {
            (Some(Labware::Wellplate), Some(well)) => write!(
                f,
                "[{}:slot-{}:{}:{}]",
                self.equipment,
                self.slot,
                Labware::Wellplate,
                well
            ),
            (Some(labware), _) => write!(f, "[{}:slot-{}:{}]", self.equipment, self.slot, labware),
            (None, _) => write!(f, "[{}]", self.equipment),
        }
    }
}

/// Standard reagents that may be referred to by their bare name.
pub const STANDARD_REAGENTS: [&str; 8] = [
    "Water", "Acetone", "Ethanol", "Benzene", "Toluene", "Hexane", "Heptane", "Octane",
];

/// A named liquid. Identity never changes once introduced into a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Liquid(String);

impl Liquid {
    /// An arbitrary researcher-provided material.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// A reagent from [`STANDARD_REAGENTS`].
    pub fn standard(name: &str) -> LabResult<Self> {
        if STANDARD_REAGENTS.contains(&name) {
            Ok(Self(name.to_string()))
        } else {
            Err(LabError::validation(format!(
                "'{}' is not a standard reagent. Available reagents: {}",
                name,
                STANDARD_REAGENTS.join(", ")
            )))
        }
    }

    /// A user-defined reagent, namespaced with a `custom-` prefix.
    pub fn custom(name: &str) -> Self {
        Self(format!("custom-{}", name))
    }

    /// The liquid's name.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Liquid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Liquid {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

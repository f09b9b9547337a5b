//! Deck layout: deciding where newly loaded labware goes.
//!
//! Reservoirs, tubes and cuvettes each take a whole liquid-handler slot.
//! Wellplate containers are single wells; consecutive wells fill the current
//! plate row by row and a new plate slot is opened once it is full.

use crate::config::DeckConfig;
use crate::error::ResourceError;
use crate::labware::{well_name, Equipment, Labware, Location, WELLPLATE_MAX_WELLS};

/// Slot allocator for the liquid handler deck.
#[derive(Debug, Clone)]
pub struct Deck {
    slots: usize,
    used_slots: usize,
    /// Slot of the plate currently being filled and its next free well.
    open_plate: Option<(usize, usize)>,
}

impl Deck {
    /// Empty deck with the configured number of slots.
    pub fn new(config: &DeckConfig) -> Self {
        Self {
            slots: config.liquid_handler_slots,
            used_slots: 0,
            open_plate: None,
        }
    }

    /// Picks the location for a new container of the given labware.
    pub fn allocate(&mut self, labware: Labware, label: &str) -> Result<Location, ResourceError> {
        match labware {
            Labware::Wellplate => {
                if let Some((slot, next)) = self.open_plate {
                    if next < WELLPLATE_MAX_WELLS {
                        self.open_plate = Some((slot, next + 1));
                        return Ok(Location::well(Equipment::LiquidHandler, slot, well_name(next)));
                    }
                }
                let slot = self.take_slot(label)?;
                self.open_plate = Some((slot, 1));
                Ok(Location::well(Equipment::LiquidHandler, slot, well_name(0)))
            }
            other => {
                let slot = self.take_slot(label)?;
                Ok(Location::new(Equipment::LiquidHandler, slot, other))
            }
        }
    }

    fn take_slot(&mut self, label: &str) -> Result<usize, ResourceError> {
        if self.used_slots >= self.slots {
            return Err(ResourceError::DeckFull(label.to_string()));
        }
        self.used_slots += 1;
        Ok(self.used_slots)
    }
}

//! Configuration system using Figment
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `RUSTLAB_`
//! 2. TOML configuration file (default: `config/lab.toml`)
//!
//! Nested keys are separated by a double underscore in environment variables:
//!
//! ```text
//! RUSTLAB_APPLICATION__LOG_LEVEL=debug
//! RUSTLAB_PROTOCOL__TIP_POLICY=reuse
//! RUSTLAB_PROTOCOL__DEAD_VOLUME_FRACTION=0.02
//! ```
//!
//! # Example
//!
//! ```no_run
//! use rust_lab::config::LabConfig;
//!
//! let config = LabConfig::load()?;
//! println!("Log level: {}", config.application.log_level);
//! # Ok::<(), rust_lab::config::ConfigError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File or environment could not be parsed.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// Values parsed but are out of range.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Protocol compilation settings
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Deck layout
    #[serde(default)]
    pub deck: DeckConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// What happens to the tip at the end of a liquid-moving operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TipPolicy {
    /// Discard the tip after every transfer/mix.
    #[default]
    SingleUse,
    /// Keep the tip attached across operations until explicitly discarded.
    Reuse,
}

/// Who puts newly loaded labware on the deck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// The operator places each container (a `place` primitive is issued).
    #[default]
    Operator,
    /// Labware is already on the deck; loading only registers it.
    PrePositioned,
}

/// Settings that shape the primitive plans compiled by the sequencer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Tip handling at the end of liquid-moving operations.
    #[serde(default)]
    pub tip_policy: TipPolicy,
    /// Whether `load` issues placement primitives.
    #[serde(default)]
    pub placement: Placement,
    /// Fraction of each transferred volume lost as dead volume, in `[0, 1)`.
    #[serde(default)]
    pub dead_volume_fraction: f64,
    /// Lets a used tip take up liquids it has not touched before.
    #[serde(default)]
    pub allow_cross_contamination: bool,
    /// Size of the tip supply for one experiment.
    #[serde(default = "default_max_tips")]
    pub max_tips: usize,
    /// Wavelength used by `measure_absorbance` when none is given.
    #[serde(default = "default_wavelength")]
    pub default_wavelength_nm: f64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            tip_policy: TipPolicy::default(),
            placement: Placement::default(),
            dead_volume_fraction: 0.0,
            allow_cross_contamination: false,
            max_tips: default_max_tips(),
            default_wavelength_nm: default_wavelength(),
        }
    }
}

/// Deck layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeckConfig {
    /// Number of labware slots on the liquid handler deck
    #[serde(default = "default_lh_slots")]
    pub liquid_handler_slots: usize,
}

impl Default for DeckConfig {
    fn default() -> Self {
        Self {
            liquid_handler_slots: default_lh_slots(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "rust-lab".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_tips() -> usize {
    384
}

fn default_wavelength() -> f64 {
    600.0
}

fn default_lh_slots() -> usize {
    12
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl LabConfig {
    /// Load configuration from `config/lab.toml` and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/lab.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// Missing keys fall back to their defaults; a missing file is treated as
    /// empty. The merged result is validated before it is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(LabConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RUSTLAB_").split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        self.protocol.validate()?;

        if self.deck.liquid_handler_slots == 0 {
            return Err(ConfigError::ValidationError(
                "deck.liquid_handler_slots must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

impl ProtocolConfig {
    /// Checks numeric bounds of the protocol settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let loss = self.dead_volume_fraction;
        if !loss.is_finite() || !(0.0..1.0).contains(&loss) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid dead_volume_fraction {}. Must be in [0, 1)",
                loss
            )));
        }
        if self.max_tips == 0 {
            return Err(ConfigError::ValidationError(
                "max_tips must be at least 1".to_string(),
            ));
        }
        if !(self.default_wavelength_nm.is_finite() && self.default_wavelength_nm > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid default_wavelength_nm {}",
                self.default_wavelength_nm
            )));
        }
        Ok(())
    }
}

/// Per-experiment configuration handed to `experiment_init`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Experiment name, e.g. "Serial Dilution"
    pub name: String,
    /// Protocol compilation settings
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Deck layout
    #[serde(default)]
    pub deck: DeckConfig,
}

impl ExperimentConfig {
    /// Experiment with default protocol and deck settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protocol: ProtocolConfig::default(),
            deck: DeckConfig::default(),
        }
    }

    /// Experiment inheriting protocol and deck settings from a loaded config.
    pub fn from_lab_config(name: impl Into<String>, config: &LabConfig) -> Self {
        Self {
            name: name.into(),
            protocol: config.protocol.clone(),
            deck: config.deck.clone(),
        }
    }

    /// Replaces the protocol settings.
    pub fn with_protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = protocol;
        self
    }

    /// Replaces the deck layout.
    pub fn with_deck(mut self, deck: DeckConfig) -> Self {
        self.deck = deck;
        self
    }
}

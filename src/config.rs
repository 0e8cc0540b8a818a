//! Protocol Configuration using Figment
//!
//! Configuration is layered, highest precedence last:
//! 1. Built-in defaults ([`ProtocolConfig::default`], the validated chemistry)
//! 2. A TOML file (optional)
//! 3. Environment variables prefixed with `POLARTRON_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! POLARTRON_APPLICATION__LOG_LEVEL=debug
//! POLARTRON_SAMPLES__COUNT=2
//! POLARTRON_SETTLE__ETHANOL=2m
//! ```
//!
//! # Example
//!
//! ```no_run
//! use polartron::config::ProtocolConfig;
//!
//! let config = ProtocolConfig::load_from("config/polartron.toml")?;
//! println!("Lanes: {}", config.samples.count);
//! # Ok::<(), polartron::config::ConfigError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::compound::SupernatantProfile;
use crate::hardware::{FlowRates, ThermalStep};
use crate::layout::DeckLayout;
use crate::wash::BufferClass;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Figment could not merge or extract the sources
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// A value is out of range
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Name, logging and file locations
    pub application: ApplicationConfig,
    /// Lane count
    pub samples: SampleConfig,
    /// Channel default rates
    pub pipettes: PipetteConfig,
    /// Labware geometry
    pub geometry: GeometryConfig,
    /// Pellet settle times
    pub settle: SettleConfig,
    /// Incubation and drying times
    pub incubation: IncubationConfig,
    /// Transfer and mix volumes
    pub volumes: VolumeConfig,
    /// Mix repetitions and resuspension rates
    pub mixing: MixingConfig,
    /// Supernatant removal profiles
    pub supernatant: SupernatantConfig,
    /// Thermocycler program
    pub thermal: ThermalConfig,
    /// Deck positions of racks, plates and reagents
    pub layout: DeckLayout,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name used in log output
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Directory for persisted run logs; `None` disables file logging
    pub run_log_dir: Option<PathBuf>,
    /// Directory holding the alert sound files
    pub sounds_dir: PathBuf,
}

/// Sample lanes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleConfig {
    /// Number of sample lanes processed in lockstep
    pub count: usize,
}

/// Channel power-on flow rates in µl/s
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipetteConfig {
    /// 20 µl channel
    pub low_volume_default_rate: f64,
    /// 300 µl channel
    pub high_volume_default_rate: f64,
}

/// Labware geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometryConfig {
    /// Liquid height gained per µl in the LoBind wells (mm/µl)
    pub well_fill_rate: f64,
    /// Magnet height for the LoBind plate (mm)
    pub magnet_engage_height_mm: f64,
}

/// Pellet settle time after magnet engagement, per buffer viscosity class
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettleConfig {
    /// After binding-buffer mixing
    #[serde(with = "humantime_serde")]
    pub binding: Duration,
    /// Detergent (MagBead buffer) washes
    #[serde(with = "humantime_serde")]
    pub detergent: Duration,
    /// Ethanol washes
    #[serde(with = "humantime_serde")]
    pub ethanol: Duration,
    /// Before eluate transfer
    #[serde(with = "humantime_serde")]
    pub elution: Duration,
}

/// Fixed incubation times
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IncubationConfig {
    /// Lysis after proteinase K addition
    #[serde(with = "humantime_serde")]
    pub proteinase_k: Duration,
    /// Nucleic acid binding before pelleting
    #[serde(with = "humantime_serde")]
    pub bead_binding: Duration,
    /// Air-dry after residual ethanol removal
    #[serde(with = "humantime_serde")]
    pub bead_drying: Duration,
}

/// Per-lane transfer volumes in µl
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Sample volume loaded by the operator
    pub sample: f64,
    /// Proteinase K master mix per sample
    pub proteinase_k: f64,
    /// RT-PCR master mix per half reaction
    pub rt_pcr_master_mix: f64,
    /// Viral buffer with MagBeads
    pub bead_buffer: f64,
    /// Viral buffer without beads
    pub viral_buffer: f64,
    /// MagBead buffer per wash
    pub detergent_wash: f64,
    /// Ethanol per wash
    pub ethanol_wash: f64,
    /// Per draw when clearing residual ethanol
    pub residual_ethanol: f64,
    /// Elution buffer
    pub elution: f64,
    /// Eluate moved into each RT-PCR pool
    pub eluate_transfer: f64,
    /// Oil drawn per lane
    pub mineral_oil: f64,
    /// Oil laid on each reaction
    pub oil_overlay: f64,
    /// Liquid removed per viral-buffer tip after binding
    pub binding_removal: f64,
    /// Proteinase K master mix premix
    pub proteinase_k_premix: f64,
    /// RT-PCR master mix premix
    pub rt_pcr_premix: f64,
    /// Bead stock resuspension
    pub bead_stock_mix: f64,
    /// Beads into sample
    pub binding_mix: f64,
    /// Proteinase K into sample
    pub proteinase_k_mix: f64,
    /// Beads into elution buffer
    pub elution_mix: f64,
    /// Eluate into master mix
    pub eluate_mix: f64,
}

/// Mix repetitions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MixingConfig {
    /// Resuspension cycles per wash
    pub wash_reps: u32,
    /// Rates used for bead resuspension
    pub resuspend_rates: FlowRates,
    /// Master-mix premix
    pub premix_reps: u32,
    /// Bead stock resuspension
    pub bead_stock_reps: u32,
    /// Beads into sample
    pub binding_reps: u32,
    /// Proteinase K into sample
    pub proteinase_k_reps: u32,
    /// Beads into elution buffer
    pub elution_reps: u32,
    /// Eluate into master mix
    pub eluate_reps: u32,
}

/// Supernatant removal per buffer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupernatantConfig {
    /// Profile for wash-buffer removal
    pub wash: SupernatantProfile,
    /// Profile for binding-buffer removal
    pub binding: SupernatantProfile,
}

/// Thermocycler program
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermalConfig {
    /// Block and module temperature while loading
    pub precool_c: f64,
    /// Heated lid
    pub lid_c: f64,
    /// Reaction volume reported to the block
    pub block_max_volume_ul: f64,
    /// Isothermal holds before cycling (UDG pre-treatment, RT, activation)
    pub holds: Vec<ThermalStep>,
    /// Steps of one amplification cycle
    pub cycle: Vec<ThermalStep>,
    /// Amplification cycles
    pub cycles: u32,
    /// Block hold once cycling ends
    pub final_hold_c: f64,
}

// ============================================================================
// Default values
// ============================================================================

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            samples: SampleConfig::default(),
            pipettes: PipetteConfig::default(),
            geometry: GeometryConfig::default(),
            settle: SettleConfig::default(),
            incubation: IncubationConfig::default(),
            volumes: VolumeConfig::default(),
            mixing: MixingConfig::default(),
            supernatant: SupernatantConfig::default(),
            thermal: ThermalConfig::default(),
            layout: DeckLayout::default(),
        }
    }
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "POLARtron".to_string(),
            log_level: "info".to_string(),
            run_log_dir: None,
            sounds_dir: PathBuf::from("sounds"),
        }
    }
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self { count: 4 }
    }
}

impl Default for PipetteConfig {
    fn default() -> Self {
        Self {
            low_volume_default_rate: 7.56,
            high_volume_default_rate: 92.86,
        }
    }
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            well_fill_rate: 0.032,
            magnet_engage_height_mm: 7.4,
        }
    }
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            binding: Duration::from_secs(12 * 60),
            detergent: Duration::from_secs(5 * 60),
            ethanol: Duration::from_secs(3 * 60),
            elution: Duration::from_secs(3 * 60),
        }
    }
}

impl SettleConfig {
    /// Settle time for a wash buffer's viscosity class.
    pub fn for_class(&self, class: BufferClass) -> Duration {
        match class {
            BufferClass::Binding => self.binding,
            BufferClass::Detergent => self.detergent,
            BufferClass::Ethanol => self.ethanol,
        }
    }
}

impl Default for IncubationConfig {
    fn default() -> Self {
        Self {
            proteinase_k: Duration::from_secs(10 * 60),
            bead_binding: Duration::from_secs(10 * 60),
            bead_drying: Duration::from_secs(5 * 60),
        }
    }
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            sample: 100.0,
            proteinase_k: 25.0,
            rt_pcr_master_mix: 12.5,
            bead_buffer: 125.0,
            viral_buffer: 125.0,
            detergent_wash: 150.0,
            ethanol_wash: 175.0,
            residual_ethanol: 50.0,
            elution: 20.0,
            eluate_transfer: 7.5,
            mineral_oil: 65.0,
            oil_overlay: 30.0,
            binding_removal: 200.0,
            proteinase_k_premix: 100.0,
            rt_pcr_premix: 80.0,
            bead_stock_mix: 180.0,
            binding_mix: 180.0,
            proteinase_k_mix: 90.0,
            elution_mix: 16.0,
            eluate_mix: 15.0,
        }
    }
}

impl Default for MixingConfig {
    fn default() -> Self {
        Self {
            wash_reps: 20,
            resuspend_rates: FlowRates::uniform(400.0),
            premix_reps: 30,
            bead_stock_reps: 60,
            binding_reps: 30,
            proteinase_k_reps: 30,
            elution_reps: 20,
            eluate_reps: 5,
        }
    }
}

impl Default for SupernatantConfig {
    fn default() -> Self {
        Self {
            wash: SupernatantProfile::default(),
            binding: SupernatantProfile::binding_buffer(),
        }
    }
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            precool_c: 4.0,
            lid_c: 105.0,
            block_max_volume_ul: 50.0,
            holds: vec![
                ThermalStep::new(25.0, Duration::from_secs(3 * 60)),
                ThermalStep::new(55.0, Duration::from_secs(15 * 60)),
                ThermalStep::new(95.0, Duration::from_secs(2 * 60)),
            ],
            cycle: vec![
                ThermalStep::new(95.0, Duration::from_secs(15)),
                ThermalStep::new(63.0, Duration::from_secs(180)),
            ],
            cycles: 30,
            final_hold_c: 4.0,
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl ProtocolConfig {
    /// Defaults overlaid with `POLARTRON_` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::extract(Self::figment())
    }

    /// Defaults overlaid with a TOML file, then environment variables.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::extract(Self::figment().merge(Toml::file(path.as_ref())))
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(ProtocolConfig::default()))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment
            .merge(Env::prefixed("POLARTRON_").split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - At least one sample lane
    /// - Rates, volumes and geometry constants are positive
    /// - Supernatant split fractions lie strictly between 0 and 1
    /// - Thermal profile has at least one step and one cycle
    /// - Reagent addresses are unique and declared on the reservoir
    /// - One shared low-volume tip per RT-PCR pool
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.samples.count == 0 {
            return Err(ConfigError::ValidationError(
                "samples.count must be at least 1".to_string(),
            ));
        }

        let positives = [
            ("pipettes.low_volume_default_rate", self.pipettes.low_volume_default_rate),
            ("pipettes.high_volume_default_rate", self.pipettes.high_volume_default_rate),
            ("geometry.well_fill_rate", self.geometry.well_fill_rate),
            ("geometry.magnet_engage_height_mm", self.geometry.magnet_engage_height_mm),
            ("volumes.sample", self.volumes.sample),
            ("volumes.proteinase_k", self.volumes.proteinase_k),
            ("volumes.rt_pcr_master_mix", self.volumes.rt_pcr_master_mix),
            ("volumes.bead_buffer", self.volumes.bead_buffer),
            ("volumes.viral_buffer", self.volumes.viral_buffer),
            ("volumes.detergent_wash", self.volumes.detergent_wash),
            ("volumes.ethanol_wash", self.volumes.ethanol_wash),
            ("volumes.residual_ethanol", self.volumes.residual_ethanol),
            ("volumes.elution", self.volumes.elution),
            ("volumes.eluate_transfer", self.volumes.eluate_transfer),
            ("volumes.mineral_oil", self.volumes.mineral_oil),
            ("volumes.oil_overlay", self.volumes.oil_overlay),
            ("volumes.binding_removal", self.volumes.binding_removal),
            ("volumes.proteinase_k_premix", self.volumes.proteinase_k_premix),
            ("volumes.rt_pcr_premix", self.volumes.rt_pcr_premix),
            ("volumes.bead_stock_mix", self.volumes.bead_stock_mix),
            ("volumes.binding_mix", self.volumes.binding_mix),
            ("volumes.proteinase_k_mix", self.volumes.proteinase_k_mix),
            ("volumes.elution_mix", self.volumes.elution_mix),
            ("volumes.eluate_mix", self.volumes.eluate_mix),
            ("supernatant.wash.rate", self.supernatant.wash.rate),
            ("supernatant.binding.rate", self.supernatant.binding.rate),
        ];
        for (key, value) in positives {
            if value.is_nan() || value <= 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be positive, got {}",
                    key, value
                )));
            }
        }

        for (key, profile) in [
            ("supernatant.wash", &self.supernatant.wash),
            ("supernatant.binding", &self.supernatant.binding),
        ] {
            if profile.first_fraction.is_nan()
                || profile.first_fraction <= 0.0
                || profile.first_fraction >= 1.0
            {
                return Err(ConfigError::ValidationError(format!(
                    "{}.first_fraction must be between 0 and 1, got {}",
                    key, profile.first_fraction
                )));
            }
        }

        let mut seen = HashSet::new();
        for (name, address) in self.layout.reagents.entries() {
            if !seen.insert(address) {
                return Err(ConfigError::ValidationError(format!(
                    "Reagent '{}' shares reservoir well {} with another reagent",
                    name, address
                )));
            }
            if !self.layout.reservoir.wells.contains(&address) {
                return Err(ConfigError::ValidationError(format!(
                    "Reagent '{}' is at {}, which the reservoir does not declare",
                    name, address
                )));
            }
        }

        if self.layout.shared_low_volume_tips.len() < 2 {
            return Err(ConfigError::ValidationError(format!(
                "layout.shared_low_volume_tips needs one tip per RT-PCR pool (2), got {}",
                self.layout.shared_low_volume_tips.len()
            )));
        }

        if self.thermal.cycle.is_empty() || self.thermal.cycles == 0 {
            return Err(ConfigError::ValidationError(
                "thermal.cycle needs at least one step and thermal.cycles at least 1".to_string(),
            ));
        }

        if self.mixing.wash_reps == 0 {
            return Err(ConfigError::ValidationError(
                "mixing.wash_reps must be at least 1 for detergent washes".to_string(),
            ));
        }

        Ok(())
    }

    /// Default flow rates for a channel.
    pub fn default_rates(&self, channel: crate::labware::ChannelClass) -> FlowRates {
        match channel {
            crate::labware::ChannelClass::LowVolume => {
                FlowRates::uniform(self.pipettes.low_volume_default_rate)
            }
            crate::labware::ChannelClass::HighVolume => {
                FlowRates::uniform(self.pipettes.high_volume_default_rate)
            }
        }
    }
}

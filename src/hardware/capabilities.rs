//! Capability traits for the robot control surface.
//!
//! The host application supplies implementations of these traits; the
//! choreography core never talks to firmware directly. Every call is fallible
//! and the boundary error is propagated unmodified.
//!
//! Motion and module calls are `async` and complete only when the device
//! reports completion. Flow-rate and speed setters are plain property writes on
//! the host side and are therefore synchronous, which lets scoped overrides
//! restore them from `Drop`.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::labware::{ChannelClass, Location, TipSlot};

/// Aspirate/dispense flow rates in µl/s.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlowRates {
    /// Aspirate rate
    pub aspirate: f64,
    /// Dispense rate
    pub dispense: f64,
}

impl FlowRates {
    /// Rates from their two components.
    pub const fn new(aspirate: f64, dispense: f64) -> Self {
        Self { aspirate, dispense }
    }

    /// Same rate for aspirate and dispense.
    pub const fn uniform(rate: f64) -> Self {
        Self::new(rate, rate)
    }
}

/// Pipetting arm with one pipette per [`ChannelClass`].
#[async_trait]
pub trait LiquidHandler: Send + Sync {
    /// Pick up the tip at `slot` on the given channel.
    async fn pick_up_tip(&self, channel: ChannelClass, slot: &TipSlot) -> Result<()>;

    /// Return the held tip to the rack slot it was picked from.
    async fn return_tip(&self, channel: ChannelClass) -> Result<()>;

    /// Draw `volume_ul` at `location`.
    async fn aspirate(&self, channel: ChannelClass, volume_ul: f64, location: &Location)
        -> Result<()>;

    /// Dispense `volume_ul`; `None` dispenses at the current position.
    async fn dispense(
        &self,
        channel: ChannelClass,
        volume_ul: f64,
        location: Option<&Location>,
    ) -> Result<()>;

    /// Aspirate/dispense `repetitions` times; `None` mixes at the current position.
    async fn mix(
        &self,
        channel: ChannelClass,
        repetitions: u32,
        volume_ul: f64,
        location: Option<&Location>,
    ) -> Result<()>;

    /// Expel all liquid and air; `None` blows out at the current position.
    async fn blow_out(&self, channel: ChannelClass, location: Option<&Location>) -> Result<()>;

    /// Move the channel to `location` without liquid handling.
    async fn move_to(&self, channel: ChannelClass, location: &Location) -> Result<()>;

    /// Aspirate/dispense rates used by subsequent calls on the channel.
    fn set_flow_rates(&self, channel: ChannelClass, rates: FlowRates) -> Result<()>;

    /// Blow-out rate in µl/s; `None` restores the pipette default.
    fn set_blow_out_rate(&self, channel: ChannelClass, rate: Option<f64>) -> Result<()>;

    /// Gantry travel speed in mm/s while this channel moves; `None` restores the default.
    fn set_default_speed(&self, channel: ChannelClass, speed: Option<f64>) -> Result<()>;

    /// Maximum speed of both vertical (Z/A) axes in mm/s; `None` removes the limit.
    fn set_vertical_max_speed(&self, speed: Option<f64>) -> Result<()>;

    /// Liquid currently held by the channel in µl.
    fn current_volume(&self, channel: ChannelClass) -> f64;

    /// Whether the channel currently holds a tip.
    fn has_tip(&self, channel: ChannelClass) -> bool;
}

/// Robot-level controls not tied to a pipette.
#[async_trait]
pub trait RobotControl: Send + Sync {
    /// Block for a fixed duration (liquid settle, incubation, pellet formation).
    async fn delay(&self, duration: Duration) -> Result<()>;

    /// Home all axes.
    async fn home(&self) -> Result<()>;

    /// Switch the deck lights.
    async fn set_rail_lights(&self, on: bool) -> Result<()>;

    /// Wait for operator acknowledgement.
    async fn pause(&self, message: &str) -> Result<()>;

    /// Show a message in the host run log.
    fn comment(&self, message: &str);

    /// True during a dry run on the host.
    fn is_simulating(&self) -> bool;
}

/// Magnetic bead separation module.
#[async_trait]
pub trait MagneticModule: Send + Sync {
    /// Raise the magnets to `height_mm` above the plate base.
    async fn engage(&self, height_mm: f64) -> Result<()>;
    /// Lower the magnets.
    async fn disengage(&self) -> Result<()>;
}

/// Temperature block holding cold reagents.
#[async_trait]
pub trait TemperatureModule: Send + Sync {
    /// Reach and hold `celsius`.
    async fn set_temperature(&self, celsius: f64) -> Result<()>;
    /// Stop temperature control.
    async fn deactivate(&self) -> Result<()>;
}

/// One step of a thermocycler profile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThermalStep {
    /// Block target
    pub temperature_c: f64,
    /// Hold time once the target is reached
    #[serde(with = "humantime_serde")]
    pub hold: Duration,
}

impl ThermalStep {
    /// Step holding `temperature_c` for `hold`.
    pub fn new(temperature_c: f64, hold: Duration) -> Self {
        Self {
            temperature_c,
            hold,
        }
    }
}

/// Thermocycler with heated lid.
#[async_trait]
pub trait Thermocycler: Send + Sync {
    /// Open the lid.
    async fn open_lid(&self) -> Result<()>;
    /// Close the lid.
    async fn close_lid(&self) -> Result<()>;
    /// Heat the lid to `celsius`.
    async fn set_lid_temperature(&self, celsius: f64) -> Result<()>;

    /// Reach `celsius` and, if given, hold it for `hold`.
    async fn set_block_temperature(
        &self,
        celsius: f64,
        hold: Option<Duration>,
        max_volume_ul: Option<f64>,
    ) -> Result<()>;

    /// Run `steps` in order, `repetitions` times.
    async fn execute_profile(
        &self,
        steps: &[ThermalStep],
        repetitions: u32,
        max_volume_ul: Option<f64>,
    ) -> Result<()>;
}

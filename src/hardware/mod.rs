//! Hardware boundary.
//!
//! - [`capabilities`]: control-surface traits implemented by the host
//! - [`mock`]: recording in-process deck used for dry runs and tests

pub mod capabilities;
pub mod mock;

use std::sync::Arc;

pub use capabilities::{
    FlowRates, LiquidHandler, MagneticModule, RobotControl, TemperatureModule, ThermalStep,
    Thermocycler,
};

/// Handles to every device the protocol drives.
#[derive(Clone)]
pub struct Deck {
    /// Pipetting arm
    pub handler: Arc<dyn LiquidHandler>,
    /// Robot-level controls
    pub robot: Arc<dyn RobotControl>,
    /// Magnetic module
    pub magnet: Arc<dyn MagneticModule>,
    /// Temperature module
    pub temperature: Arc<dyn TemperatureModule>,
    /// Thermocycler
    pub thermocycler: Arc<dyn Thermocycler>,
}

impl Deck {
    /// Deck whose devices are all served by one object.
    pub fn from_single<T>(device: Arc<T>) -> Self
    where
        T: LiquidHandler
            + RobotControl
            + MagneticModule
            + TemperatureModule
            + Thermocycler
            + 'static,
    {
        Self {
            handler: device.clone(),
            robot: device.clone(),
            magnet: device.clone(),
            temperature: device.clone(),
            thermocycler: device,
        }
    }
}

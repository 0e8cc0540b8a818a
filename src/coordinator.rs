//! Module coordinator: magnet, temperature module and thermocycler.
//!
//! Owns the only mutable view of module state. Every call awaits completion
//! on the control surface before returning, so module transitions never
//! overlap arm motion.
//!
//! Ordering rules enforced here:
//! - magnet engage/disengage strictly alternate
//! - the magnet counts as settled only once the settle delay has elapsed
//! - block holds and profiles run with the lid closed

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{AppResult, ChoreoError};
use crate::hardware::{Deck, MagneticModule, RobotControl, TemperatureModule, ThermalStep, Thermocycler};

/// Magnet position and pellet readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MagnetState {
    /// Magnets lowered
    Disengaged,
    /// Magnets raised
    Engaged {
        /// Settle delay has completed
        settled: bool,
    },
}

impl MagnetState {
    /// Raised, settled or not.
    pub fn is_engaged(&self) -> bool {
        matches!(self, MagnetState::Engaged { .. })
    }
}

/// Thermocycler lid position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LidState {
    /// Plate accessible
    Open,
    /// Ready for reaction steps
    Closed,
}

/// Snapshot of every module.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleState {
    /// Magnet position
    pub magnet: MagnetState,
    /// Temperature module target; `None` when deactivated
    pub module_temperature_c: Option<f64>,
    /// Lid position
    pub lid: LidState,
    /// Lid target; `None` until set
    pub lid_temperature_c: Option<f64>,
    /// Block target; `None` until set
    pub block_temperature_c: Option<f64>,
}

impl Default for ModuleState {
    fn default() -> Self {
        Self {
            magnet: MagnetState::Disengaged,
            module_temperature_c: None,
            lid: LidState::Closed,
            lid_temperature_c: None,
            block_temperature_c: None,
        }
    }
}

/// Sole owner of module state. Every module call goes through here so that
/// ordering rules are checked before the hardware is touched.
pub struct ModuleCoordinator {
    magnet: Arc<dyn MagneticModule>,
    temperature: Arc<dyn TemperatureModule>,
    thermocycler: Arc<dyn Thermocycler>,
    robot: Arc<dyn RobotControl>,
    engage_height_mm: f64,
    state: ModuleState,
}

impl ModuleCoordinator {
    /// Coordinator for the deck's modules, all idle.
    pub fn new(deck: &Deck, engage_height_mm: f64) -> Self {
        Self {
            magnet: deck.magnet.clone(),
            temperature: deck.temperature.clone(),
            thermocycler: deck.thermocycler.clone(),
            robot: deck.robot.clone(),
            engage_height_mm,
            state: ModuleState::default(),
        }
    }

    /// Last commanded state of every module.
    pub fn state(&self) -> &ModuleState {
        &self.state
    }

    // -------------------------------------------------------------------------
    // Magnet
    // -------------------------------------------------------------------------

    /// Raise the magnet and wait `settle` for the pellet to form.
    pub async fn engage_magnet(&mut self, settle: Duration) -> AppResult<()> {
        if self.state.magnet.is_engaged() {
            return Err(ChoreoError::InvalidModuleSequence(
                "magnet engaged twice without an intervening disengage".to_string(),
            ));
        }
        self.magnet.engage(self.engage_height_mm).await?;
        self.state.magnet = MagnetState::Engaged { settled: false };
        info!(
            height_mm = self.engage_height_mm,
            settle_s = settle.as_secs(),
            "Magnet engaged"
        );

        if !settle.is_zero() {
            self.robot.delay(settle).await?;
        }
        self.state.magnet = MagnetState::Engaged { settled: true };
        Ok(())
    }

    /// Lower the magnet; fails if it is not raised.
    pub async fn disengage_magnet(&mut self) -> AppResult<()> {
        if !self.state.magnet.is_engaged() {
            return Err(ChoreoError::InvalidModuleSequence(
                "magnet disengaged while already disengaged".to_string(),
            ));
        }
        self.magnet.disengage().await?;
        self.state.magnet = MagnetState::Disengaged;
        info!("Magnet disengaged");
        Ok(())
    }

    /// Beads must be liquid-accessible before resuspension.
    pub fn require_disengaged(&self, step: &str) -> AppResult<()> {
        if self.state.magnet.is_engaged() {
            return Err(ChoreoError::InvalidModuleSequence(format!(
                "{} requires the magnet disengaged",
                step
            )));
        }
        Ok(())
    }

    /// Supernatant may only be drawn off a fully formed pellet.
    pub fn require_settled(&self, step: &str) -> AppResult<()> {
        match self.state.magnet {
            MagnetState::Engaged { settled: true } => Ok(()),
            MagnetState::Engaged { settled: false } => Err(ChoreoError::InvalidModuleSequence(
                format!("{} started before the pellet settled", step),
            )),
            MagnetState::Disengaged => Err(ChoreoError::InvalidModuleSequence(format!(
                "{} requires the magnet engaged",
                step
            ))),
        }
    }

    // -------------------------------------------------------------------------
    // Temperature module
    // -------------------------------------------------------------------------

    /// Hold the temperature module at `celsius`.
    pub async fn set_module_temperature(&mut self, celsius: f64) -> AppResult<()> {
        self.temperature.set_temperature(celsius).await?;
        self.state.module_temperature_c = Some(celsius);
        info!(celsius, "Temperature module set");
        Ok(())
    }

    /// Stop temperature control.
    pub async fn deactivate_temperature_module(&mut self) -> AppResult<()> {
        self.temperature.deactivate().await?;
        self.state.module_temperature_c = None;
        info!("Temperature module deactivated");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Thermocycler
    // -------------------------------------------------------------------------

    /// Open the thermocycler lid.
    pub async fn open_lid(&mut self) -> AppResult<()> {
        self.thermocycler.open_lid().await?;
        self.state.lid = LidState::Open;
        debug!("Thermocycler lid opened");
        Ok(())
    }

    /// Close the thermocycler lid.
    pub async fn close_lid(&mut self) -> AppResult<()> {
        self.thermocycler.close_lid().await?;
        self.state.lid = LidState::Closed;
        debug!("Thermocycler lid closed");
        Ok(())
    }

    /// Heat the lid.
    pub async fn set_lid_temperature(&mut self, celsius: f64) -> AppResult<()> {
        self.thermocycler.set_lid_temperature(celsius).await?;
        self.state.lid_temperature_c = Some(celsius);
        info!(celsius, "Lid temperature set");
        Ok(())
    }

    /// Bring the block to `celsius`, optionally holding it.
    ///
    /// A non-zero hold is a reaction step and needs the lid closed; a bare
    /// temperature change (pre-cooling) is allowed with the lid open.
    pub async fn set_block_temperature(
        &mut self,
        celsius: f64,
        hold: Option<Duration>,
        max_volume_ul: Option<f64>,
    ) -> AppResult<()> {
        let holding = hold.is_some_and(|h| !h.is_zero());
        if holding && self.state.lid == LidState::Open {
            return Err(ChoreoError::InvalidModuleSequence(format!(
                "block hold at {} °C with the lid open",
                celsius
            )));
        }
        self.thermocycler
            .set_block_temperature(celsius, hold, max_volume_ul)
            .await?;
        self.state.block_temperature_c = Some(celsius);
        info!(celsius, hold_s = hold.map(|h| h.as_secs()), "Block temperature set");
        Ok(())
    }

    /// Run `repetitions` cycles of `steps`.
    pub async fn run_thermocycler_profile(
        &mut self,
        steps: &[ThermalStep],
        repetitions: u32,
        max_volume_ul: Option<f64>,
    ) -> AppResult<()> {
        if steps.is_empty() || repetitions == 0 {
            return Err(ChoreoError::InvalidModuleSequence(
                "thermocycler profile needs at least one step and one repetition".to_string(),
            ));
        }
        if self.state.lid == LidState::Open {
            return Err(ChoreoError::InvalidModuleSequence(
                "thermocycler profile started with the lid open".to_string(),
            ));
        }
        info!(steps = steps.len(), repetitions, "Running thermocycler profile");
        self.thermocycler
            .execute_profile(steps, repetitions, max_volume_ul)
            .await?;
        if let Some(last) = steps.last() {
            self.state.block_temperature_c = Some(last.temperature_c);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{CallKind, HardwareEvent, MockDeck};

    fn setup() -> (Arc<MockDeck>, ModuleCoordinator) {
        let mock = Arc::new(MockDeck::new());
        let deck = Deck::from_single(mock.clone());
        (mock, ModuleCoordinator::new(&deck, 7.4))
    }

    #[tokio::test]
    async fn test_engage_waits_settle() {
        let (mock, mut modules) = setup();
        modules.engage_magnet(Duration::from_secs(300)).await.unwrap();

        assert_eq!(
            mock.events(),
            vec![
                HardwareEvent::MagnetEngage { height_mm: 7.4 },
                HardwareEvent::Delay(Duration::from_secs(300)),
            ]
        );
        assert_eq!(modules.state().magnet, MagnetState::Engaged { settled: true });
        assert!(modules.require_settled("removal").is_ok());
        assert!(modules.require_disengaged("resuspension").is_err());
    }

    #[tokio::test]
    async fn test_engage_twice_rejected() {
        let (mock, mut modules) = setup();
        modules.engage_magnet(Duration::ZERO).await.unwrap();
        let err = modules.engage_magnet(Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, ChoreoError::InvalidModuleSequence(_)));
        assert_eq!(mock.events_of(CallKind::MagnetEngage).len(), 1);
    }

    #[tokio::test]
    async fn test_disengage_when_disengaged_rejected() {
        let (mock, mut modules) = setup();
        assert!(modules.disengage_magnet().await.is_err());
        assert!(mock.events().is_empty());
    }

    #[tokio::test]
    async fn test_not_settled_if_delay_fails() {
        let (mock, mut modules) = setup();
        mock.fail_next(CallKind::Delay);
        assert!(modules.engage_magnet(Duration::from_secs(60)).await.is_err());
        assert_eq!(modules.state().magnet, MagnetState::Engaged { settled: false });
        assert!(matches!(
            modules.require_settled("removal"),
            Err(ChoreoError::InvalidModuleSequence(_))
        ));
    }

    #[tokio::test]
    async fn test_block_hold_requires_closed_lid() {
        let (_mock, mut modules) = setup();
        modules.open_lid().await.unwrap();
        // Pre-cooling without a hold is fine
        modules.set_block_temperature(4.0, None, None).await.unwrap();
        assert!(modules
            .set_block_temperature(55.0, Some(Duration::from_secs(900)), Some(50.0))
            .await
            .is_err());

        modules.close_lid().await.unwrap();
        modules
            .set_block_temperature(55.0, Some(Duration::from_secs(900)), Some(50.0))
            .await
            .unwrap();
        assert_eq!(modules.state().block_temperature_c, Some(55.0));
    }

    #[tokio::test]
    async fn test_profile_validation() {
        let (mock, mut modules) = setup();
        let steps = [ThermalStep::new(95.0, Duration::from_secs(15))];
        assert!(modules.run_thermocycler_profile(&[], 30, None).await.is_err());
        assert!(modules.run_thermocycler_profile(&steps, 0, None).await.is_err());
        modules.run_thermocycler_profile(&steps, 30, Some(50.0)).await.unwrap();
        assert_eq!(mock.events_of(CallKind::Profile).len(), 1);
    }

    #[tokio::test]
    async fn test_temperature_module_tracking() {
        let (_mock, mut modules) = setup();
        modules.set_module_temperature(4.0).await.unwrap();
        assert_eq!(modules.state().module_temperature_c, Some(4.0));
        modules.deactivate_temperature_module().await.unwrap();
        assert_eq!(modules.state().module_temperature_c, None);
    }
}

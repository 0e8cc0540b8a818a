//! Mock Deck Implementation
//!
//! Simulated robot, pipettes and modules for dry runs and tests. Every accepted
//! call is appended to an event log that tests inspect to check ordering
//! properties (tip exclusivity, magnet alternation, flow-rate restoration).
//!
//! # Behaviour
//!
//! - Delays are recorded, never slept, so a full protocol runs instantly
//! - Pipette volume is tracked: aspirate adds, dispense subtracts, blow-out empties
//! - Tip handling is checked: no double pick-up, no liquid handling without a tip
//! - Faults can be injected per call kind to exercise error propagation
//!
//! # Example
//!
//! ```rust,ignore
//! let mock = Arc::new(MockDeck::new());
//! mock.fail_after(CallKind::Aspirate, 2);
//! let deck = Deck::from_single(mock.clone());
//! ```

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

use crate::hardware::capabilities::{
    FlowRates, LiquidHandler, MagneticModule, RobotControl, TemperatureModule, ThermalStep,
    Thermocycler,
};
use crate::labware::{ChannelClass, Location, TipSlot};

// =============================================================================
// Event log
// =============================================================================

/// One accepted call on the simulated control surface.
///
/// Variants are named after the trait call they record and their fields
/// mirror its arguments.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum HardwareEvent {
    PickUpTip { channel: ChannelClass, slot: TipSlot },
    ReturnTip { channel: ChannelClass, slot: TipSlot },
    Aspirate { channel: ChannelClass, volume_ul: f64, location: Location },
    Dispense { channel: ChannelClass, volume_ul: f64, location: Option<Location> },
    Mix { channel: ChannelClass, repetitions: u32, volume_ul: f64, location: Option<Location> },
    BlowOut { channel: ChannelClass, location: Option<Location> },
    MoveTo { channel: ChannelClass, location: Location },
    SetFlowRates { channel: ChannelClass, rates: FlowRates },
    /// `None` restores the channel default
    SetBlowOutRate { channel: ChannelClass, rate: Option<f64> },
    SetDefaultSpeed { channel: ChannelClass, speed: Option<f64> },
    SetVerticalMaxSpeed { speed: Option<f64> },
    Delay(Duration),
    Home,
    RailLights(bool),
    Pause(String),
    Comment(String),
    MagnetEngage { height_mm: f64 },
    MagnetDisengage,
    ModuleTemperature(f64),
    ModuleDeactivate,
    LidOpen,
    LidClose,
    LidTemperature(f64),
    BlockTemperature { celsius: f64, hold: Option<Duration>, max_volume_ul: Option<f64> },
    Profile { steps: Vec<ThermalStep>, repetitions: u32, max_volume_ul: Option<f64> },
}

impl HardwareEvent {
    /// Category of this event.
    pub fn kind(&self) -> CallKind {
        match self {
            HardwareEvent::PickUpTip { .. } => CallKind::PickUpTip,
            HardwareEvent::ReturnTip { .. } => CallKind::ReturnTip,
            HardwareEvent::Aspirate { .. } => CallKind::Aspirate,
            HardwareEvent::Dispense { .. } => CallKind::Dispense,
            HardwareEvent::Mix { .. } => CallKind::Mix,
            HardwareEvent::BlowOut { .. } => CallKind::BlowOut,
            HardwareEvent::MoveTo { .. } => CallKind::MoveTo,
            HardwareEvent::SetFlowRates { .. } => CallKind::SetFlowRates,
            HardwareEvent::SetBlowOutRate { .. } => CallKind::SetBlowOutRate,
            HardwareEvent::SetDefaultSpeed { .. } => CallKind::SetDefaultSpeed,
            HardwareEvent::SetVerticalMaxSpeed { .. } => CallKind::SetVerticalMaxSpeed,
            HardwareEvent::Delay(_) => CallKind::Delay,
            HardwareEvent::Home => CallKind::Home,
            HardwareEvent::RailLights(_) => CallKind::RailLights,
            HardwareEvent::Pause(_) => CallKind::Pause,
            HardwareEvent::Comment(_) => CallKind::Comment,
            HardwareEvent::MagnetEngage { .. } => CallKind::MagnetEngage,
            HardwareEvent::MagnetDisengage => CallKind::MagnetDisengage,
            HardwareEvent::ModuleTemperature(_) => CallKind::ModuleTemperature,
            HardwareEvent::ModuleDeactivate => CallKind::ModuleDeactivate,
            HardwareEvent::LidOpen => CallKind::LidOpen,
            HardwareEvent::LidClose => CallKind::LidClose,
            HardwareEvent::LidTemperature(_) => CallKind::LidTemperature,
            HardwareEvent::BlockTemperature { .. } => CallKind::BlockTemperature,
            HardwareEvent::Profile { .. } => CallKind::Profile,
        }
    }
}

/// Call categories used for fault injection and event filtering.
///
/// One variant per [`HardwareEvent`] variant, same name.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    PickUpTip,
    ReturnTip,
    Aspirate,
    Dispense,
    Mix,
    BlowOut,
    MoveTo,
    SetFlowRates,
    SetBlowOutRate,
    SetDefaultSpeed,
    SetVerticalMaxSpeed,
    Delay,
    Home,
    RailLights,
    Pause,
    Comment,
    MagnetEngage,
    MagnetDisengage,
    ModuleTemperature,
    ModuleDeactivate,
    LidOpen,
    LidClose,
    LidTemperature,
    BlockTemperature,
    Profile,
}

// =============================================================================
// Simulated state
// =============================================================================

#[derive(Debug, Clone)]
struct PipetteState {
    tip: Option<TipSlot>,
    volume_ul: f64,
    rates: FlowRates,
    blow_out_rate: Option<f64>,
}

impl PipetteState {
    fn new(rates: FlowRates) -> Self {
        Self {
            tip: None,
            volume_ul: 0.0,
            rates,
            blow_out_rate: None,
        }
    }
}

#[derive(Debug)]
struct MockState {
    events: Vec<HardwareEvent>,
    pipettes: HashMap<ChannelClass, PipetteState>,
    magnet_engaged: bool,
    lid_open: bool,
    /// Call kind → number of calls still allowed to succeed before the fault fires
    faults: HashMap<CallKind, usize>,
}

/// Recording mock of the whole deck.
pub struct MockDeck {
    state: Mutex<MockState>,
    simulating: bool,
}

impl MockDeck {
    /// Mock deck with stock default flow rates, reporting simulation mode.
    pub fn new() -> Self {
        Self::with_default_rates(FlowRates::uniform(7.56), FlowRates::uniform(92.86))
    }

    /// Mock deck with explicit power-on flow rates per channel.
    pub fn with_default_rates(low_volume: FlowRates, high_volume: FlowRates) -> Self {
        let mut pipettes = HashMap::new();
        pipettes.insert(ChannelClass::LowVolume, PipetteState::new(low_volume));
        pipettes.insert(ChannelClass::HighVolume, PipetteState::new(high_volume));
        Self {
            state: Mutex::new(MockState {
                events: Vec::new(),
                pipettes,
                magnet_engaged: false,
                lid_open: false,
                faults: HashMap::new(),
            }),
            simulating: true,
        }
    }

    /// Report real-hardware mode to callers (enables run-log files and alerts).
    pub fn hardware_mode(mut self) -> Self {
        self.simulating = false;
        self
    }

    /// Reject the next call of `kind`.
    pub fn fail_next(&self, kind: CallKind) {
        self.fail_after(kind, 0);
    }

    /// Let `successes` calls of `kind` through, then reject the following one.
    pub fn fail_after(&self, kind: CallKind, successes: usize) {
        self.state.lock().faults.insert(kind, successes);
    }

    /// Snapshot of every accepted call, in order.
    pub fn events(&self) -> Vec<HardwareEvent> {
        self.state.lock().events.clone()
    }

    /// Accepted calls of one kind, in order.
    pub fn events_of(&self, kind: CallKind) -> Vec<HardwareEvent> {
        self.state
            .lock()
            .events
            .iter()
            .filter(|event| event.kind() == kind)
            .cloned()
            .collect()
    }

    /// Forget every recorded call.
    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    /// Flow rates currently configured on a channel.
    pub fn flow_rates(&self, channel: ChannelClass) -> FlowRates {
        let mut state = self.state.lock();
        Self::pipette(&mut state, channel).rates
    }

    /// Blow-out rate override on a channel; `None` while at the default.
    pub fn blow_out_rate(&self, channel: ChannelClass) -> Option<f64> {
        let mut state = self.state.lock();
        Self::pipette(&mut state, channel).blow_out_rate
    }

    /// Whether the magnets are raised.
    pub fn magnet_engaged(&self) -> bool {
        self.state.lock().magnet_engaged
    }

    /// Whether the thermocycler lid is open.
    pub fn lid_open(&self) -> bool {
        self.state.lock().lid_open
    }

    /// Check for an injected fault, then apply `effect` and record `event`.
    fn accept<F>(&self, event: HardwareEvent, effect: F) -> Result<()>
    where
        F: FnOnce(&mut MockState) -> Result<()>,
    {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let kind = event.kind();
        match state.faults.get(&kind).copied() {
            Some(0) => {
                state.faults.remove(&kind);
                bail!("MockDeck: injected fault on {:?}", kind);
            }
            Some(remaining) => {
                state.faults.insert(kind, remaining - 1);
            }
            None => {}
        }
        effect(state)?;
        state.events.push(event);
        Ok(())
    }

    fn pipette(state: &mut MockState, channel: ChannelClass) -> &mut PipetteState {
        state
            .pipettes
            .entry(channel)
            .or_insert_with(|| PipetteState::new(FlowRates::uniform(0.0)))
    }

    fn require_tip(state: &mut MockState, channel: ChannelClass) -> Result<&mut PipetteState> {
        let pipette = Self::pipette(state, channel);
        if pipette.tip.is_none() {
            bail!("MockDeck: {} channel has no tip", channel);
        }
        Ok(pipette)
    }
}

impl Default for MockDeck {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// LiquidHandler
// =============================================================================

#[async_trait]
impl LiquidHandler for MockDeck {
    async fn pick_up_tip(&self, channel: ChannelClass, slot: &TipSlot) -> Result<()> {
        let event = HardwareEvent::PickUpTip {
            channel,
            slot: slot.clone(),
        };
        self.accept(event, |state| {
            let pipette = Self::pipette(state, channel);
            if let Some(held) = &pipette.tip {
                bail!("MockDeck: {} channel already holds tip at {}", channel, held);
            }
            pipette.tip = Some(slot.clone());
            pipette.volume_ul = 0.0;
            Ok(())
        })
    }

    async fn return_tip(&self, channel: ChannelClass) -> Result<()> {
        let slot = {
            let mut state = self.state.lock();
            Self::pipette(&mut state, channel)
                .tip
                .clone()
                .ok_or_else(|| anyhow!("MockDeck: {} channel has no tip to return", channel))?
        };
        self.accept(HardwareEvent::ReturnTip { channel, slot }, |state| {
            let pipette = Self::pipette(state, channel);
            pipette.tip = None;
            pipette.volume_ul = 0.0;
            Ok(())
        })
    }

    async fn aspirate(
        &self,
        channel: ChannelClass,
        volume_ul: f64,
        location: &Location,
    ) -> Result<()> {
        let event = HardwareEvent::Aspirate {
            channel,
            volume_ul,
            location: location.clone(),
        };
        self.accept(event, |state| {
            let pipette = Self::require_tip(state, channel)?;
            pipette.volume_ul += volume_ul;
            Ok(())
        })
    }

    async fn dispense(
        &self,
        channel: ChannelClass,
        volume_ul: f64,
        location: Option<&Location>,
    ) -> Result<()> {
        let event = HardwareEvent::Dispense {
            channel,
            volume_ul,
            location: location.cloned(),
        };
        self.accept(event, |state| {
            let pipette = Self::require_tip(state, channel)?;
            pipette.volume_ul = (pipette.volume_ul - volume_ul).max(0.0);
            Ok(())
        })
    }

    async fn mix(
        &self,
        channel: ChannelClass,
        repetitions: u32,
        volume_ul: f64,
        location: Option<&Location>,
    ) -> Result<()> {
        let event = HardwareEvent::Mix {
            channel,
            repetitions,
            volume_ul,
            location: location.cloned(),
        };
        self.accept(event, |state| Self::require_tip(state, channel).map(|_| ()))
    }

    async fn blow_out(&self, channel: ChannelClass, location: Option<&Location>) -> Result<()> {
        let event = HardwareEvent::BlowOut {
            channel,
            location: location.cloned(),
        };
        self.accept(event, |state| {
            Self::require_tip(state, channel)?.volume_ul = 0.0;
            Ok(())
        })
    }

    async fn move_to(&self, channel: ChannelClass, location: &Location) -> Result<()> {
        let event = HardwareEvent::MoveTo {
            channel,
            location: location.clone(),
        };
        self.accept(event, |_| Ok(()))
    }

    fn set_flow_rates(&self, channel: ChannelClass, rates: FlowRates) -> Result<()> {
        self.accept(HardwareEvent::SetFlowRates { channel, rates }, |state| {
            Self::pipette(state, channel).rates = rates;
            Ok(())
        })
    }

    fn set_blow_out_rate(&self, channel: ChannelClass, rate: Option<f64>) -> Result<()> {
        self.accept(HardwareEvent::SetBlowOutRate { channel, rate }, |state| {
            Self::pipette(state, channel).blow_out_rate = rate;
            Ok(())
        })
    }

    fn set_default_speed(&self, channel: ChannelClass, speed: Option<f64>) -> Result<()> {
        self.accept(HardwareEvent::SetDefaultSpeed { channel, speed }, |_| Ok(()))
    }

    fn set_vertical_max_speed(&self, speed: Option<f64>) -> Result<()> {
        self.accept(HardwareEvent::SetVerticalMaxSpeed { speed }, |_| Ok(()))
    }

    fn current_volume(&self, channel: ChannelClass) -> f64 {
        let mut state = self.state.lock();
        Self::pipette(&mut state, channel).volume_ul
    }

    fn has_tip(&self, channel: ChannelClass) -> bool {
        let mut state = self.state.lock();
        Self::pipette(&mut state, channel).tip.is_some()
    }
}

// =============================================================================
// Robot and modules
// =============================================================================

#[async_trait]
impl RobotControl for MockDeck {
    async fn delay(&self, duration: Duration) -> Result<()> {
        self.accept(HardwareEvent::Delay(duration), |_| Ok(()))
    }

    async fn home(&self) -> Result<()> {
        self.accept(HardwareEvent::Home, |_| Ok(()))
    }

    async fn set_rail_lights(&self, on: bool) -> Result<()> {
        self.accept(HardwareEvent::RailLights(on), |_| Ok(()))
    }

    async fn pause(&self, message: &str) -> Result<()> {
        self.accept(HardwareEvent::Pause(message.to_string()), |_| Ok(()))
    }

    fn comment(&self, message: &str) {
        // Comments are informational; an injected fault only drops the entry.
        let _ = self.accept(HardwareEvent::Comment(message.to_string()), |_| Ok(()));
    }

    fn is_simulating(&self) -> bool {
        self.simulating
    }
}

#[async_trait]
impl MagneticModule for MockDeck {
    async fn engage(&self, height_mm: f64) -> Result<()> {
        self.accept(HardwareEvent::MagnetEngage { height_mm }, |state| {
            state.magnet_engaged = true;
            Ok(())
        })
    }

    async fn disengage(&self) -> Result<()> {
        self.accept(HardwareEvent::MagnetDisengage, |state| {
            state.magnet_engaged = false;
            Ok(())
        })
    }
}

#[async_trait]
impl TemperatureModule for MockDeck {
    async fn set_temperature(&self, celsius: f64) -> Result<()> {
        self.accept(HardwareEvent::ModuleTemperature(celsius), |_| Ok(()))
    }

    async fn deactivate(&self) -> Result<()> {
        self.accept(HardwareEvent::ModuleDeactivate, |_| Ok(()))
    }
}

#[async_trait]
impl Thermocycler for MockDeck {
    async fn open_lid(&self) -> Result<()> {
        self.accept(HardwareEvent::LidOpen, |state| {
            state.lid_open = true;
            Ok(())
        })
    }

    async fn close_lid(&self) -> Result<()> {
        self.accept(HardwareEvent::LidClose, |state| {
            state.lid_open = false;
            Ok(())
        })
    }

    async fn set_lid_temperature(&self, celsius: f64) -> Result<()> {
        self.accept(HardwareEvent::LidTemperature(celsius), |_| Ok(()))
    }

    async fn set_block_temperature(
        &self,
        celsius: f64,
        hold: Option<Duration>,
        max_volume_ul: Option<f64>,
    ) -> Result<()> {
        let event = HardwareEvent::BlockTemperature {
            celsius,
            hold,
            max_volume_ul,
        };
        self.accept(event, |_| Ok(()))
    }

    async fn execute_profile(
        &self,
        steps: &[ThermalStep],
        repetitions: u32,
        max_volume_ul: Option<f64>,
    ) -> Result<()> {
        let event = HardwareEvent::Profile {
            steps: steps.to_vec(),
            repetitions,
            max_volume_ul,
        };
        self.accept(event, |_| Ok(()))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labware::{WellAddress, WellResource};

    fn slot() -> TipSlot {
        TipSlot {
            rack: "9".into(),
            address: WellAddress::row_a(12).unwrap(),
        }
    }

    fn well() -> WellResource {
        WellResource::new("reservoir", WellAddress::row_a(1).unwrap(), 15_000.0)
    }

    #[tokio::test]
    async fn test_volume_tracking() {
        let deck = MockDeck::new();
        let ch = ChannelClass::HighVolume;
        deck.pick_up_tip(ch, &slot()).await.unwrap();
        deck.aspirate(ch, 100.0, &well().bottom(1.0)).await.unwrap();
        assert_eq!(deck.current_volume(ch), 100.0);

        deck.dispense(ch, 40.0, None).await.unwrap();
        assert_eq!(deck.current_volume(ch), 60.0);

        deck.blow_out(ch, None).await.unwrap();
        assert_eq!(deck.current_volume(ch), 0.0);
    }

    #[tokio::test]
    async fn test_rejects_double_pick_up() {
        let deck = MockDeck::new();
        let ch = ChannelClass::LowVolume;
        deck.pick_up_tip(ch, &slot()).await.unwrap();
        assert!(deck.pick_up_tip(ch, &slot()).await.is_err());
        assert!(deck.has_tip(ch));
    }

    #[tokio::test]
    async fn test_aspirate_without_tip_fails() {
        let deck = MockDeck::new();
        let result = deck
            .aspirate(ChannelClass::HighVolume, 10.0, &well().bottom(0.0))
            .await;
        assert!(result.is_err());
        assert!(deck.events().is_empty());
    }

    #[tokio::test]
    async fn test_fault_injection_fires_once() {
        let deck = MockDeck::new();
        deck.fail_after(CallKind::Delay, 1);

        deck.delay(Duration::from_secs(1)).await.unwrap();
        assert!(deck.delay(Duration::from_secs(1)).await.is_err());
        deck.delay(Duration::from_secs(1)).await.unwrap();

        assert_eq!(deck.events_of(CallKind::Delay).len(), 2);
    }

    #[tokio::test]
    async fn test_return_tip_records_slot() {
        let deck = MockDeck::new();
        let ch = ChannelClass::HighVolume;
        deck.pick_up_tip(ch, &slot()).await.unwrap();
        deck.return_tip(ch).await.unwrap();

        assert!(!deck.has_tip(ch));
        assert_eq!(
            deck.events_of(CallKind::ReturnTip),
            vec![HardwareEvent::ReturnTip {
                channel: ch,
                slot: slot()
            }]
        );
    }

    #[test]
    fn test_blow_out_rate_override_and_restore() {
        let deck = MockDeck::new();
        let ch = ChannelClass::HighVolume;
        deck.set_blow_out_rate(ch, Some(10.0)).unwrap();
        assert_eq!(deck.blow_out_rate(ch), Some(10.0));
        assert_eq!(deck.blow_out_rate(ChannelClass::LowVolume), None);

        deck.set_blow_out_rate(ch, None).unwrap();
        assert_eq!(deck.blow_out_rate(ch), None);
    }
}

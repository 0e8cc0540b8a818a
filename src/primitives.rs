//! Motion primitives.
//!
//! [`Pipette`] binds one channel to the control surface and is the only path
//! compound operations use to reach the hardware. Rate and speed overrides
//! are scoped guards: the channel default is restored when the guard drops,
//! including on the error path of the guarded operation. Liquid moved into
//! or out of a well is booked against the well's fill estimate once the
//! hardware call succeeds.
//!
//! # Example
//!
//! ```rust,ignore
//! let _rates = pipette.set_flow_profile(&FlowProfile::uniform(10.0))?;
//! pipette.aspirate(140.0, &well.bottom(1.0), None).await?;
//! // default rates restored here, even if aspirate failed
//!
//! // Same thing for a single call, shifted 1.5 mm off the pellet
//! let profile = FlowProfile::uniform(10.0).with_offset(Offset::new(1.5, 0.0, 0.0));
//! pipette.aspirate(140.0, &well.bottom(1.0), Some(&profile)).await?;
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

use crate::error::AppResult;
use crate::hardware::{Deck, FlowRates, LiquidHandler, RobotControl};
use crate::labware::{ChannelClass, Location, Offset, TipSlot, WellResource};

/// Dwell after aspiration so the liquid column stabilises before withdrawal.
pub const SETTLE_DWELL: Duration = Duration::from_secs(1);

/// Vertical axis limit while withdrawing from a well (mm/s).
pub const SLOW_EXIT_SPEED: f64 = 10.0;

/// Aspirate/dispense rate pair plus an optional geometric offset.
///
/// Passed to a single primitive, the rates apply for that call only and the
/// offset shifts its target location.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlowProfile {
    /// Aspirate rate (µl/s)
    pub aspirate: f64,
    /// Dispense rate (µl/s)
    pub dispense: f64,
    /// Shift applied to the target location
    #[serde(default)]
    pub offset: Offset,
}

impl FlowProfile {
    /// Profile without an offset.
    pub const fn new(aspirate: f64, dispense: f64) -> Self {
        Self {
            aspirate,
            dispense,
            offset: Offset::new(0.0, 0.0, 0.0),
        }
    }

    /// Same rate both ways.
    pub const fn uniform(rate: f64) -> Self {
        Self::new(rate, rate)
    }

    /// Replace the offset.
    pub fn with_offset(mut self, offset: Offset) -> Self {
        self.offset = offset;
        self
    }

    /// Rate pair without the offset.
    pub fn rates(&self) -> FlowRates {
        FlowRates::new(self.aspirate, self.dispense)
    }

    /// Apply the profile's offset to a location.
    pub fn place(&self, location: Location) -> Location {
        location.shifted(self.offset)
    }
}

impl From<FlowRates> for FlowProfile {
    fn from(rates: FlowRates) -> Self {
        Self::new(rates.aspirate, rates.dispense)
    }
}

/// One pipette channel bound to the control surface.
#[derive(Clone)]
pub struct Pipette {
    channel: ChannelClass,
    default_rate: f64,
    handler: Arc<dyn LiquidHandler>,
    robot: Arc<dyn RobotControl>,
}

impl std::fmt::Debug for Pipette {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipette")
            .field("channel", &self.channel)
            .field("default_rate", &self.default_rate)
            .finish()
    }
}

impl Pipette {
    /// Bind `channel` to the control surface.
    pub fn new(
        channel: ChannelClass,
        default_rate: f64,
        handler: Arc<dyn LiquidHandler>,
        robot: Arc<dyn RobotControl>,
    ) -> Self {
        Self {
            channel,
            default_rate,
            handler,
            robot,
        }
    }

    /// Channel this pipette drives.
    pub fn channel(&self) -> ChannelClass {
        self.channel
    }

    /// Power-on aspirate/dispense rates of this channel.
    pub fn default_rates(&self) -> FlowRates {
        FlowRates::uniform(self.default_rate)
    }

    /// Liquid currently held in µl.
    pub fn current_volume(&self) -> f64 {
        self.handler.current_volume(self.channel)
    }

    /// Whether a tip is mounted.
    pub fn has_tip(&self) -> bool {
        self.handler.has_tip(self.channel)
    }

    // -------------------------------------------------------------------------
    // Scoped overrides
    // -------------------------------------------------------------------------

    /// Override aspirate/dispense rates until the guard drops.
    pub fn set_flow_profile(&self, profile: &FlowProfile) -> AppResult<FlowGuard<'_>> {
        self.handler.set_flow_rates(self.channel, profile.rates())?;
        Ok(FlowGuard { pipette: self })
    }

    /// Shorthand for [`Pipette::set_flow_profile`] without an offset.
    pub fn set_rates(&self, aspirate: f64, dispense: f64) -> AppResult<FlowGuard<'_>> {
        self.set_flow_profile(&FlowProfile::new(aspirate, dispense))
    }

    /// Limit gantry travel speed for this channel until the guard drops.
    pub fn with_default_speed(&self, mm_per_s: f64) -> AppResult<SpeedGuard<'_>> {
        self.handler.set_default_speed(self.channel, Some(mm_per_s))?;
        Ok(SpeedGuard { pipette: self })
    }

    /// Limit both vertical axes until the guard drops.
    pub fn throttle_vertical(&self, mm_per_s: f64) -> AppResult<VerticalGuard<'_>> {
        self.handler.set_vertical_max_speed(Some(mm_per_s))?;
        Ok(VerticalGuard { pipette: self })
    }

    /// Override the blow-out rate until the guard drops.
    pub fn set_blow_out_rate(&self, rate: f64) -> AppResult<BlowOutGuard<'_>> {
        self.handler.set_blow_out_rate(self.channel, Some(rate))?;
        Ok(BlowOutGuard { pipette: self })
    }

    /// Rates for one call, plus its target shifted by the profile offset.
    fn scoped(
        &self,
        location: Option<&Location>,
        profile: Option<&FlowProfile>,
    ) -> AppResult<(Option<FlowGuard<'_>>, Option<Location>)> {
        let guard = profile.map(|p| self.set_flow_profile(p)).transpose()?;
        let location = location.map(|l| match profile {
            Some(p) => p.place(l.clone()),
            None => l.clone(),
        });
        Ok((guard, location))
    }

    // -------------------------------------------------------------------------
    // Tips
    // -------------------------------------------------------------------------

    /// Mount the tip at `slot`.
    pub async fn pick_up_tip(&self, slot: &TipSlot) -> AppResult<()> {
        self.handler.pick_up_tip(self.channel, slot).await?;
        Ok(())
    }

    /// Put the mounted tip back in its rack slot.
    pub async fn return_tip(&self) -> AppResult<()> {
        self.handler.return_tip(self.channel).await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Liquid handling
    // -------------------------------------------------------------------------

    /// Draw `volume_ul` at `location`, optionally under a one-call profile.
    pub async fn aspirate(
        &self,
        volume_ul: f64,
        location: &Location,
        profile: Option<&FlowProfile>,
    ) -> AppResult<()> {
        let (_rates, target) = self.scoped(Some(location), profile)?;
        let target = target.unwrap_or_else(|| location.clone());
        trace!(channel = %self.channel, volume_ul, at = %target, "aspirate");
        self.handler.aspirate(self.channel, volume_ul, &target).await?;
        target.well.fill.remove(volume_ul);
        Ok(())
    }

    /// Aspirate at `well.bottom(height)` then dwell for [`SETTLE_DWELL`].
    pub async fn aspirate_with_settle(
        &self,
        volume_ul: f64,
        well: &WellResource,
        height: f64,
        profile: Option<&FlowProfile>,
    ) -> AppResult<()> {
        self.aspirate(volume_ul, &well.bottom(height), profile).await?;
        self.delay(SETTLE_DWELL).await
    }

    /// Dispense `volume_ul`; `None` dispenses at the current position.
    pub async fn dispense(
        &self,
        volume_ul: f64,
        location: Option<&Location>,
        profile: Option<&FlowProfile>,
    ) -> AppResult<()> {
        let (_rates, target) = self.scoped(location, profile)?;
        trace!(channel = %self.channel, volume_ul, "dispense");
        self.handler
            .dispense(self.channel, volume_ul, target.as_ref())
            .await?;
        if let Some(target) = &target {
            target.well.fill.add(volume_ul);
        }
        Ok(())
    }

    /// Dispense everything the channel currently holds.
    pub async fn dispense_all(&self, location: Option<&Location>) -> AppResult<()> {
        self.dispense(self.current_volume(), location, None).await
    }

    /// Mix in place; the well's fill is unchanged.
    pub async fn mix(
        &self,
        repetitions: u32,
        volume_ul: f64,
        location: Option<&Location>,
    ) -> AppResult<()> {
        self.handler
            .mix(self.channel, repetitions, volume_ul, location)
            .await?;
        Ok(())
    }

    /// Expel everything held; `None` blows out at the current position.
    pub async fn blow_out(&self, location: Option<&Location>) -> AppResult<()> {
        let held = self.current_volume();
        self.handler.blow_out(self.channel, location).await?;
        if let Some(location) = location {
            location.well.fill.add(held);
        }
        Ok(())
    }

    /// Move without liquid handling.
    pub async fn move_to(&self, location: &Location) -> AppResult<()> {
        self.handler.move_to(self.channel, location).await?;
        Ok(())
    }

    /// Withdraw to `well.top(height)` with the vertical axes at
    /// [`SLOW_EXIT_SPEED`]. The limit is lifted even if the move fails.
    pub async fn slow_exit(&self, well: &WellResource, height: f64) -> AppResult<()> {
        self.slow_move_to(&well.top(height)).await
    }

    /// Throttled vertical move to an arbitrary location.
    pub async fn slow_move_to(&self, location: &Location) -> AppResult<()> {
        let _throttle = self.throttle_vertical(SLOW_EXIT_SPEED)?;
        self.move_to(location).await
    }

    /// Robot-level dwell.
    pub async fn delay(&self, duration: Duration) -> AppResult<()> {
        self.robot.delay(duration).await?;
        Ok(())
    }
}

// =============================================================================
// Guards
// =============================================================================

/// Restores the channel's default flow rates on drop.
#[must_use = "rates are restored as soon as the guard is dropped"]
pub struct FlowGuard<'a> {
    pipette: &'a Pipette,
}

impl Drop for FlowGuard<'_> {
    fn drop(&mut self) {
        let pipette = self.pipette;
        if let Err(e) = pipette
            .handler
            .set_flow_rates(pipette.channel, pipette.default_rates())
        {
            warn!(channel = %pipette.channel, "Failed to restore default flow rates: {:#}", e);
        }
    }
}

/// Restores the channel's default blow-out rate on drop.
#[must_use = "the rate is restored as soon as the guard is dropped"]
pub struct BlowOutGuard<'a> {
    pipette: &'a Pipette,
}

impl Drop for BlowOutGuard<'_> {
    fn drop(&mut self) {
        let pipette = self.pipette;
        if let Err(e) = pipette.handler.set_blow_out_rate(pipette.channel, None) {
            warn!(channel = %pipette.channel, "Failed to restore blow-out rate: {:#}", e);
        }
    }
}

/// Restores unlimited gantry speed on drop.
#[must_use = "speed is restored as soon as the guard is dropped"]
pub struct SpeedGuard<'a> {
    pipette: &'a Pipette,
}

impl Drop for SpeedGuard<'_> {
    fn drop(&mut self) {
        let pipette = self.pipette;
        if let Err(e) = pipette.handler.set_default_speed(pipette.channel, None) {
            warn!(channel = %pipette.channel, "Failed to restore gantry speed: {:#}", e);
        }
    }
}

/// Lifts the vertical axis limit on drop.
#[must_use = "the limit is lifted as soon as the guard is dropped"]
pub struct VerticalGuard<'a> {
    pipette: &'a Pipette,
}

impl Drop for VerticalGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.pipette.handler.set_vertical_max_speed(None) {
            warn!("Failed to lift vertical speed limit: {:#}", e);
        }
    }
}

// =============================================================================
// Pipette pair
// =============================================================================

/// Both mounted pipettes.
#[derive(Debug, Clone)]
pub struct Pipettes {
    /// 20 µl channel
    pub low: Pipette,
    /// 300 µl channel
    pub high: Pipette,
}

impl Pipettes {
    /// Bind both channels with their power-on uniform rates.
    pub fn from_deck(deck: &Deck, low_volume_rate: f64, high_volume_rate: f64) -> Self {
        Self {
            low: Pipette::new(
                ChannelClass::LowVolume,
                low_volume_rate,
                deck.handler.clone(),
                deck.robot.clone(),
            ),
            high: Pipette::new(
                ChannelClass::HighVolume,
                high_volume_rate,
                deck.handler.clone(),
                deck.robot.clone(),
            ),
        }
    }

    /// Pipette driving `channel`.
    pub fn for_channel(&self, channel: ChannelClass) -> &Pipette {
        match channel {
            ChannelClass::LowVolume => &self.low,
            ChannelClass::HighVolume => &self.high,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{CallKind, HardwareEvent, MockDeck};
    use crate::labware::WellAddress;

    fn setup() -> (Arc<MockDeck>, Pipettes) {
        let mock = Arc::new(MockDeck::new());
        let deck = Deck::from_single(mock.clone());
        (mock, Pipettes::from_deck(&deck, 7.56, 92.86))
    }

    fn well() -> WellResource {
        WellResource::new("magnetic_plate", WellAddress::row_a(2).unwrap(), 500.0)
    }

    fn slot() -> TipSlot {
        TipSlot {
            rack: "9".into(),
            address: WellAddress::row_a(12).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_aspirate_with_settle_dwells() {
        let (mock, pipettes) = setup();
        pipettes.high.pick_up_tip(&slot()).await.unwrap();
        pipettes.high.aspirate_with_settle(50.0, &well(), 1.0, None).await.unwrap();

        let events = mock.events();
        let n = events.len();
        assert!(matches!(
            &events[n - 2],
            HardwareEvent::Aspirate { location, .. } if *location == well().bottom(1.0)
        ));
        assert_eq!(events[n - 1], HardwareEvent::Delay(SETTLE_DWELL));
    }

    #[tokio::test]
    async fn test_slow_exit_restores_after_failed_move() {
        let (mock, pipettes) = setup();
        mock.fail_next(CallKind::MoveTo);

        assert!(pipettes.high.slow_exit(&well(), 0.0).await.is_err());
        assert_eq!(
            mock.events_of(CallKind::SetVerticalMaxSpeed),
            vec![
                HardwareEvent::SetVerticalMaxSpeed {
                    speed: Some(SLOW_EXIT_SPEED)
                },
                HardwareEvent::SetVerticalMaxSpeed { speed: None },
            ]
        );
    }

    #[tokio::test]
    async fn test_flow_profile_restored_when_operation_fails() {
        let (mock, pipettes) = setup();
        let pipette = &pipettes.low;
        pipette.pick_up_tip(&slot()).await.unwrap();
        mock.fail_next(CallKind::Aspirate);

        let result = async {
            let _rates = pipette.set_flow_profile(&FlowProfile::uniform(5.0))?;
            assert_eq!(mock.flow_rates(ChannelClass::LowVolume), FlowRates::uniform(5.0));
            pipette.aspirate(10.0, &well().bottom(0.0), None).await
        }
        .await;

        assert!(matches!(result, Err(crate::error::ChoreoError::HardwareFault(_))));
        assert_eq!(mock.flow_rates(ChannelClass::LowVolume), FlowRates::uniform(7.56));
    }

    #[tokio::test]
    async fn test_speed_guard_restores_unlimited() {
        let (mock, pipettes) = setup();
        {
            let _speed = pipettes.high.with_default_speed(20.0).unwrap();
        }
        assert_eq!(
            mock.events_of(CallKind::SetDefaultSpeed),
            vec![
                HardwareEvent::SetDefaultSpeed {
                    channel: ChannelClass::HighVolume,
                    speed: Some(20.0)
                },
                HardwareEvent::SetDefaultSpeed {
                    channel: ChannelClass::HighVolume,
                    speed: None
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_dispense_all_empties_channel() {
        let (mock, pipettes) = setup();
        let pipette = &pipettes.high;
        pipette.pick_up_tip(&slot()).await.unwrap();
        pipette.aspirate(42.0, &well().bottom(1.0), None).await.unwrap();
        pipette.dispense_all(None).await.unwrap();

        assert_eq!(pipette.current_volume(), 0.0);
        assert!(mock
            .events_of(CallKind::Dispense)
            .iter()
            .any(|e| matches!(e, HardwareEvent::Dispense { volume_ul, .. } if *volume_ul == 42.0)));
    }

    #[tokio::test]
    async fn test_call_profile_shifts_target_and_restores_rates() {
        let (mock, pipettes) = setup();
        let pipette = &pipettes.high;
        pipette.pick_up_tip(&slot()).await.unwrap();
        let profile = FlowProfile::uniform(10.0).with_offset(Offset::new(-1.5, 0.0, 0.0));

        pipette
            .aspirate_with_settle(50.0, &well(), 1.0, Some(&profile))
            .await
            .unwrap();
        pipette
            .dispense(50.0, Some(&well().bottom(3.0)), Some(&profile))
            .await
            .unwrap();

        let expected = well().bottom(1.0).shifted(Offset::new(-1.5, 0.0, 0.0));
        assert!(matches!(
            &mock.events_of(CallKind::Aspirate)[0],
            HardwareEvent::Aspirate { location, .. } if *location == expected
        ));
        assert!(matches!(
            &mock.events_of(CallKind::Dispense)[0],
            HardwareEvent::Dispense { location: Some(location), .. }
                if location.offset == Offset::new(-1.5, 0.0, 3.0)
        ));
        // Override and restore around each call
        assert_eq!(
            mock.events_of(CallKind::SetFlowRates),
            vec![
                HardwareEvent::SetFlowRates {
                    channel: ChannelClass::HighVolume,
                    rates: FlowRates::uniform(10.0)
                },
                HardwareEvent::SetFlowRates {
                    channel: ChannelClass::HighVolume,
                    rates: FlowRates::uniform(92.86)
                },
                HardwareEvent::SetFlowRates {
                    channel: ChannelClass::HighVolume,
                    rates: FlowRates::uniform(10.0)
                },
                HardwareEvent::SetFlowRates {
                    channel: ChannelClass::HighVolume,
                    rates: FlowRates::uniform(92.86)
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_call_profile_restored_when_dispense_fails() {
        let (mock, pipettes) = setup();
        let pipette = &pipettes.low;
        pipette.pick_up_tip(&slot()).await.unwrap();
        mock.fail_next(CallKind::Dispense);

        let result = pipette
            .dispense(5.0, Some(&well().bottom(1.0)), Some(&FlowProfile::uniform(2.0)))
            .await;
        assert!(result.is_err());
        assert_eq!(mock.flow_rates(ChannelClass::LowVolume), FlowRates::uniform(7.56));
    }

    #[tokio::test]
    async fn test_fill_estimate_follows_liquid() {
        let (_mock, pipettes) = setup();
        let pipette = &pipettes.high;
        pipette.pick_up_tip(&slot()).await.unwrap();
        let source = WellResource::new("reservoir", WellAddress::row_a(1).unwrap(), 15_000.0);
        source.fill.set(1000.0);
        let target = well();

        pipette.aspirate(150.0, &source.bottom(1.0), None).await.unwrap();
        assert_eq!(source.fill_ul(), 850.0);

        pipette.dispense(100.0, Some(&target.bottom(2.0)), None).await.unwrap();
        pipette.blow_out(Some(&target.top(-5.0))).await.unwrap();
        assert_eq!(target.fill_ul(), 150.0);

        // Mixing and dispensing in place leave wells untouched
        pipette.aspirate(20.0, &target.bottom(0.0), None).await.unwrap();
        pipette.mix(3, 20.0, Some(&target.bottom(0.0))).await.unwrap();
        pipette.dispense_all(None).await.unwrap();
        assert_eq!(target.fill_ul(), 130.0);
    }

    #[tokio::test]
    async fn test_failed_aspirate_leaves_fill() {
        let (mock, pipettes) = setup();
        pipettes.high.pick_up_tip(&slot()).await.unwrap();
        let target = well();
        target.fill.set(200.0);
        mock.fail_next(CallKind::Aspirate);

        assert!(pipettes.high.aspirate(50.0, &target.bottom(1.0), None).await.is_err());
        assert_eq!(target.fill_ul(), 200.0);
    }

    #[tokio::test]
    async fn test_blow_out_rate_restored_when_blow_out_fails() {
        let (mock, pipettes) = setup();
        let pipette = &pipettes.high;
        pipette.pick_up_tip(&slot()).await.unwrap();
        mock.fail_next(CallKind::BlowOut);

        let result = async {
            let _blow_out = pipette.set_blow_out_rate(10.0)?;
            assert_eq!(mock.blow_out_rate(ChannelClass::HighVolume), Some(10.0));
            pipette.blow_out(None).await
        }
        .await;

        assert!(result.is_err());
        assert_eq!(mock.blow_out_rate(ChannelClass::HighVolume), None);
        assert_eq!(
            mock.events_of(CallKind::SetBlowOutRate),
            vec![
                HardwareEvent::SetBlowOutRate {
                    channel: ChannelClass::HighVolume,
                    rate: Some(10.0)
                },
                HardwareEvent::SetBlowOutRate {
                    channel: ChannelClass::HighVolume,
                    rate: None
                },
            ]
        );
    }
}

//! Compound operations built from motion primitives.
//!
//! Every operation routes through [`Pipette`], so rate and speed overrides
//! are always scoped. Lateral offsets that must avoid a magnetic pellet use
//! [`bead_side`]: positive x points away from the pellet.
//!
//! | Operation | Rates (asp/disp) | Notes |
//! |---|---|---|
//! | [`resuspend_beads`] | caller, 400/400 by default | 80 % of volume per cycle |
//! | [`remove_supernatant`] | [`SupernatantProfile::rate`] | two phases, dwell between |
//! | [`well_wash`] | 50/50 | four rim points, gantry 20 mm/s |
//! | [`side_dispense`] | 50/50 by default | gantry 25 mm/s |
//! | [`touch_tip`] | n/a | gantry 20 mm/s |
//! | [`collect_dispense_touch`] | caller or defaults | optional slow blow-out |
//! | [`wash_tip`] | defaults | shared wash well |
//! | [`trash_tip`] | defaults | consumes the tip |

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{AppResult, ChoreoError};
use crate::hardware::FlowRates;
use crate::labware::{bead_side, Offset, TipResource, WellResource};
use crate::pool::ResourcePool;
use crate::primitives::{FlowProfile, Pipette, Pipettes, SETTLE_DWELL};

/// Fraction of the volume moved per resuspension cycle.
const RESUSPEND_FRACTION: f64 = 0.8;
/// Lateral shift of the resuspension dispense, towards the bead-free wall (mm).
const RESUSPEND_SHIFT_MM: f64 = 1.5;

const WELL_WASH_RATE: f64 = 50.0;
const WELL_WASH_SPEED: f64 = 20.0;
const WELL_WASH_REACH_MM: f64 = 3.0;
const WELL_WASH_DEPTH_MM: f64 = -3.0;

const SIDE_DISPENSE_SPEED: f64 = 25.0;
const SIDE_DISPENSE_REACH_MM: f64 = 4.5;
const SIDE_DISPENSE_DEPTH_MM: f64 = -5.0;

/// Default touch depth relative to the well top (mm).
pub const TOUCH_DEPTH_MM: f64 = -5.0;
const TOUCH_SPEED: f64 = 20.0;
const TOUCH_REACH_MM: f64 = 4.5;

const SLOW_BLOW_OUT_RATE: f64 = 10.0;
const SLOW_BLOW_OUT_DEPTH_MM: f64 = -10.0;
const SLOW_BLOW_OUT_DWELL: Duration = Duration::from_secs(5);

const TIP_WASH_REPS: u32 = 5;
const TIP_WASH_BLOW_OUT_HEIGHT_MM: f64 = 5.0;
const TRASH_DISPENSE_HEIGHT_MM: f64 = 5.0;

/// Liquid height in mm for `volume_ul` in a well with the given fill rate.
pub fn liquid_level(volume_ul: f64, fill_rate: f64) -> f64 {
    volume_ul * fill_rate
}

// =============================================================================
// Tip handling
// =============================================================================

/// Pick up a tip on its channel.
///
/// The pool validates and records the transition first; if the hardware
/// pick-up then fails, the ledger entry is rolled back.
pub async fn fetch_tip(pipettes: &Pipettes, pool: &ResourcePool, tip: &TipResource) -> AppResult<()> {
    let previous = pool.pick_up(tip)?;
    trace!(tip = %tip, "pick up");
    if let Err(e) = pipettes.for_channel(tip.channel).pick_up_tip(&tip.slot).await {
        pool.cancel_pick_up(tip, previous)?;
        return Err(e);
    }
    Ok(())
}

/// Return the channel's tip to its rack slot for later reuse.
pub async fn park_tip(pipette: &Pipette, pool: &ResourcePool) -> AppResult<()> {
    let tip = held_tip(pipette, pool, "park")?;
    pipette.return_tip().await?;
    pool.park(&tip)
}

fn held_tip(pipette: &Pipette, pool: &ResourcePool, action: &'static str) -> AppResult<TipResource> {
    pool.current_tip(pipette.channel())
        .ok_or_else(|| ChoreoError::InvalidTipTransition {
            tip: format!("<none on {} channel>", pipette.channel()),
            action,
            state: "not held".to_string(),
        })
}

/// Discard the tip of whichever channel currently holds one.
///
/// Residual liquid is dispensed into the trash and blown out before the tip
/// goes back to its rack slot; the pool marks it consumed.
pub async fn trash_tip(pipettes: &Pipettes, pool: &ResourcePool, trash: &WellResource) -> AppResult<()> {
    let pipette = if pipettes.high.has_tip() {
        &pipettes.high
    } else if pipettes.low.has_tip() {
        &pipettes.low
    } else {
        return Err(ChoreoError::InvalidTipTransition {
            tip: "<none>".to_string(),
            action: "trash",
            state: "absent from both channels".to_string(),
        });
    };
    let tip = held_tip(pipette, pool, "trash")?;

    let _rates = pipette.set_flow_profile(&pipette.default_rates().into())?;
    if pipette.current_volume() > 0.0 {
        pipette
            .dispense_all(Some(&trash.bottom(TRASH_DISPENSE_HEIGHT_MM)))
            .await?;
        pipette.blow_out(None).await?;
        pipette.slow_exit(trash, 0.0).await?;
    }
    pipette.return_tip().await?;
    pool.consume(&tip)?;
    debug!(tip = %tip, "tip trashed");
    Ok(())
}

// =============================================================================
// Bead handling
// =============================================================================

/// Break up a pellet with `reps` aspirate/dispense cycles.
///
/// Each cycle aspirates 80 % of `volume_ul` at `bottom(1)` and dispenses it at
/// `bottom(3)` shifted 1.5 mm away from the pellet. `reps == 0` is a no-op.
pub async fn resuspend_beads(
    pipette: &Pipette,
    reps: u32,
    volume_ul: f64,
    well: &WellResource,
    rates: FlowRates,
) -> AppResult<()> {
    if reps == 0 {
        return Ok(());
    }
    let side = bead_side(well);
    let volume = volume_ul * RESUSPEND_FRACTION;
    let draw = FlowProfile::from(rates);
    let release = draw.with_offset(Offset::new(RESUSPEND_SHIFT_MM * side, 0.0, 0.0));

    for _ in 0..reps {
        pipette.aspirate(volume, &well.bottom(1.0), Some(&draw)).await?;
        pipette
            .dispense(volume, Some(&well.bottom(3.0)), Some(&release))
            .await?;
    }
    debug!(well = %well, reps, volume_ul, "beads resuspended");
    Ok(())
}

/// Where and how supernatant is drawn off a pellet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupernatantProfile {
    /// Share of the volume taken in the first phase
    pub first_fraction: f64,
    /// Aspirate rate for both phases (µl/s)
    pub rate: f64,
    /// First-phase height above the bottom; `None` follows the liquid left
    /// after the first phase
    pub first_height_mm: Option<f64>,
    /// Second-phase height above the bottom
    pub second_height_mm: f64,
    /// Distance from the pellet wall in the first phase (mm)
    pub first_offset_mm: f64,
    /// Distance from the pellet wall in the second phase (mm)
    pub second_offset_mm: f64,
    /// Dwell between the phases
    #[serde(with = "humantime_serde")]
    pub phase_dwell: Duration,
    /// Dwell after the second phase
    #[serde(with = "humantime_serde")]
    pub final_dwell: Duration,
}

impl Default for SupernatantProfile {
    /// Wash-buffer removal: 70/30 at 10 µl/s, 5 s between phases.
    fn default() -> Self {
        Self {
            first_fraction: 0.7,
            rate: 10.0,
            first_height_mm: None,
            second_height_mm: 1.0,
            first_offset_mm: 1.5,
            second_offset_mm: 1.0,
            phase_dwell: Duration::from_secs(5),
            final_dwell: Duration::ZERO,
        }
    }
}

impl SupernatantProfile {
    /// Binding-buffer removal: 90/10 at 50 µl/s, 2 mm from the pellet.
    pub fn binding_buffer() -> Self {
        Self {
            first_fraction: 0.9,
            rate: 50.0,
            first_height_mm: Some(1.0),
            second_height_mm: 0.5,
            first_offset_mm: 2.0,
            second_offset_mm: 2.0,
            phase_dwell: Duration::ZERO,
            final_dwell: SETTLE_DWELL,
        }
    }
}

/// Draw `volume_ul` off a settled pellet in two phases.
///
/// The first phase takes `first_fraction` of the volume from a raised point
/// offset away from the pellet, the second takes the rest from lower down.
/// Each phase runs under its own profile: the aspirate rate from `profile`,
/// the channel's default dispense rate, and the pellet-avoiding offset.
pub async fn remove_supernatant(
    pipette: &Pipette,
    volume_ul: f64,
    well: &WellResource,
    profile: &SupernatantProfile,
    fill_rate: f64,
) -> AppResult<()> {
    let side = bead_side(well);
    let first = volume_ul * profile.first_fraction;
    let second = volume_ul - first;
    let first_height = profile
        .first_height_mm
        .unwrap_or_else(|| liquid_level(second, fill_rate));

    let rates = FlowProfile::new(profile.rate, pipette.default_rates().dispense);
    let away = |mm: f64| rates.with_offset(Offset::new(-mm * side, 0.0, 0.0));

    pipette
        .aspirate(first, &well.bottom(first_height), Some(&away(profile.first_offset_mm)))
        .await?;
    if !profile.phase_dwell.is_zero() {
        pipette.delay(profile.phase_dwell).await?;
    }
    pipette
        .aspirate(
            second,
            &well.bottom(profile.second_height_mm),
            Some(&away(profile.second_offset_mm)),
        )
        .await?;
    if !profile.final_dwell.is_zero() {
        pipette.delay(profile.final_dwell).await?;
    }
    debug!(well = %well, volume_ul, "supernatant removed");
    Ok(())
}

// =============================================================================
// Dispense patterns
// =============================================================================

/// Rinse the rim: the held volume is quartered over four points inside the
/// top of the well, then blown out.
pub async fn well_wash(pipette: &Pipette, well: &WellResource) -> AppResult<()> {
    let quarter = pipette.current_volume() / 4.0;
    let _rates = pipette.set_rates(WELL_WASH_RATE, WELL_WASH_RATE)?;
    pipette.move_to(&well.top(WELL_WASH_DEPTH_MM)).await?;
    {
        let _speed = pipette.with_default_speed(WELL_WASH_SPEED)?;
        for side in [1.0, -1.0] {
            for offset in [
                Offset::new(side * WELL_WASH_REACH_MM, 0.0, WELL_WASH_DEPTH_MM),
                Offset::new(0.0, side * WELL_WASH_REACH_MM, WELL_WASH_DEPTH_MM),
            ] {
                let point = well.top(0.0).shifted(offset);
                pipette.move_to(&point).await?;
                pipette.dispense(quarter, Some(&point), None).await?;
            }
        }
        pipette.blow_out(None).await?;
        pipette.delay(SETTLE_DWELL).await?;
        pipette.move_to(&well.top(0.0)).await?;
    }
    trace!(well = %well, "well washed");
    Ok(())
}

/// Options for [`side_dispense`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SideDispense {
    /// Volume to dispense; `None` dispenses everything held
    pub volume_ul: Option<f64>,
    /// Rates while dispensing
    pub rates: FlowRates,
    /// Blow out at the dispense point afterwards
    pub blow_out: bool,
}

impl Default for SideDispense {
    fn default() -> Self {
        Self {
            volume_ul: None,
            rates: FlowRates::uniform(50.0),
            blow_out: true,
        }
    }
}

/// Dispense against one wall just inside the rim.
pub async fn side_dispense(
    pipette: &Pipette,
    well: &WellResource,
    options: SideDispense,
) -> AppResult<()> {
    let _rates = pipette.set_flow_profile(&options.rates.into())?;
    let volume = options.volume_ul.unwrap_or_else(|| pipette.current_volume());
    let point = well
        .top(0.0)
        .shifted(Offset::new(0.0, SIDE_DISPENSE_REACH_MM, SIDE_DISPENSE_DEPTH_MM));

    pipette.move_to(&well.top(0.0)).await?;
    let _speed = pipette.with_default_speed(SIDE_DISPENSE_SPEED)?;
    pipette.dispense(volume, Some(&point), None).await?;
    pipette.delay(SETTLE_DWELL).await?;
    if options.blow_out {
        pipette.blow_out(Some(&point)).await?;
        pipette.delay(SETTLE_DWELL).await?;
    }
    pipette.move_to(&well.top(0.0)).await
}

/// Shed droplets by touching the wall at four points `depth` mm below the top.
pub async fn touch_tip(pipette: &Pipette, well: &WellResource, depth: f64) -> AppResult<()> {
    pipette.slow_exit(well, depth).await?;
    let _speed = pipette.with_default_speed(TOUCH_SPEED)?;
    for side in [1.0, -1.0] {
        pipette
            .move_to(&well.top(depth).shifted(Offset::new(side * TOUCH_REACH_MM, 0.0, 0.0)))
            .await?;
        pipette
            .move_to(&well.top(depth).shifted(Offset::new(0.0, side * TOUCH_REACH_MM, 0.0)))
            .await?;
    }
    pipette.move_to(&well.top(depth)).await
}

/// Throttled blow-out `SLOW_BLOW_OUT_DEPTH_MM` below the top of a well.
///
/// The blow-out rate is back at the channel default on return, even when
/// the blow-out fails.
pub async fn slow_blow_out(pipette: &Pipette, well: &WellResource) -> AppResult<()> {
    pipette.slow_exit(well, SLOW_BLOW_OUT_DEPTH_MM).await?;
    {
        let _blow_out = pipette.set_blow_out_rate(SLOW_BLOW_OUT_RATE)?;
        pipette
            .blow_out(Some(&well.top(SLOW_BLOW_OUT_DEPTH_MM)))
            .await?;
    }
    pipette.delay(SLOW_BLOW_OUT_DWELL).await
}

/// Options for [`collect_dispense_touch`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CollectOptions {
    /// Rate override; `None` keeps the channel defaults
    pub rates: Option<FlowRates>,
    /// Finish with [`slow_blow_out`]
    pub blow_out: bool,
    /// Finish with [`touch_tip`]
    pub touch_tip: bool,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            rates: None,
            blow_out: false,
            touch_tip: true,
        }
    }
}

/// Gather liquid from the bottom of a well and lay it back at its surface,
/// finishing with an optional slow blow-out and touch-tip.
pub async fn collect_dispense_touch(
    pipette: &Pipette,
    volume_ul: f64,
    well: &WellResource,
    options: CollectOptions,
    fill_rate: f64,
) -> AppResult<()> {
    let rates = options.rates.unwrap_or_else(|| pipette.default_rates());
    let _rates = pipette.set_flow_profile(&rates.into())?;

    pipette.aspirate(volume_ul, &well.bottom(0.0), None).await?;
    pipette.delay(SETTLE_DWELL).await?;
    pipette
        .dispense_all(Some(&well.bottom(liquid_level(volume_ul, fill_rate))))
        .await?;
    pipette.delay(SETTLE_DWELL).await?;
    if options.blow_out {
        slow_blow_out(pipette, well).await?;
    }
    if options.touch_tip {
        touch_tip(pipette, well, TOUCH_DEPTH_MM).await?;
    }
    pipette.slow_exit(well, 0.0).await
}

/// Decontaminate a tip reused across lanes in a shared wash well.
///
/// A blow-out at `bottom(5)` runs only when the channel holds liquid.
pub async fn wash_tip(pipette: &Pipette, wash_well: &WellResource, volume_ul: f64) -> AppResult<()> {
    if pipette.current_volume() > 0.0 {
        pipette
            .blow_out(Some(&wash_well.bottom(TIP_WASH_BLOW_OUT_HEIGHT_MM)))
            .await?;
    }
    let _rates = pipette.set_flow_profile(&FlowProfile::from(pipette.default_rates()))?;
    pipette
        .mix(TIP_WASH_REPS, volume_ul, Some(&wash_well.bottom(0.0)))
        .await?;
    let _throttle = pipette.throttle_vertical(crate::primitives::SLOW_EXIT_SPEED)?;
    pipette
        .blow_out(Some(&wash_well.top(SLOW_BLOW_OUT_DEPTH_MM)))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{CallKind, HardwareEvent, MockDeck};
    use crate::hardware::Deck;
    use crate::labware::{ChannelClass, Location, TipSlot, WellAddress};
    use crate::layout::DeckLayout;
    use crate::pool::{TipRole, TipState};
    use std::sync::Arc;

    const FILL: f64 = 0.032;

    fn setup() -> (Arc<MockDeck>, Pipettes) {
        let mock = Arc::new(MockDeck::new());
        let deck = Deck::from_single(mock.clone());
        (mock, Pipettes::from_deck(&deck, 7.56, 92.86))
    }

    fn well(column: u8) -> WellResource {
        WellResource::new("magnetic_plate", WellAddress::row_a(column).unwrap(), 500.0)
    }

    async fn tipped(pipette: &Pipette) {
        let slot = TipSlot {
            rack: "9".into(),
            address: WellAddress::row_a(12).unwrap(),
        };
        pipette.pick_up_tip(&slot).await.unwrap();
    }

    fn aspirations(mock: &MockDeck) -> Vec<(f64, Location)> {
        mock.events_of(CallKind::Aspirate)
            .into_iter()
            .filter_map(|e| match e {
                HardwareEvent::Aspirate {
                    volume_ul, location, ..
                } => Some((volume_ul, location)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_remove_supernatant_two_phases() {
        let (mock, pipettes) = setup();
        tipped(&pipettes.high).await;
        let target = well(4);

        remove_supernatant(&pipettes.high, 150.0, &target, &SupernatantProfile::default(), FILL)
            .await
            .unwrap();

        let draws = aspirations(&mock);
        assert_eq!(draws.len(), 2);
        let total: f64 = draws.iter().map(|(v, _)| v).sum();
        assert!((total - 150.0).abs() < 1e-9);
        assert!((draws[0].0 - 105.0).abs() < 1e-9);
        assert!((draws[1].0 - 45.0).abs() < 1e-9);

        // Even column: pellet side is -1, so offsets point to +x
        assert!((draws[0].1.offset.x - 1.5).abs() < 1e-9);
        assert!((draws[0].1.offset.z - 45.0 * FILL).abs() < 1e-9);
        assert!((draws[1].1.offset.x - 1.0).abs() < 1e-9);
        assert!((draws[1].1.offset.z - 1.0).abs() < 1e-9);

        // Dwell sits between the phases
        let events = mock.events();
        let position = |kind: CallKind, nth: usize| {
            events
                .iter()
                .enumerate()
                .filter(|(_, e)| e.kind() == kind)
                .nth(nth)
                .map(|(i, _)| i)
                .unwrap()
        };
        let dwell = position(CallKind::Delay, 0);
        assert_eq!(events[dwell], HardwareEvent::Delay(Duration::from_secs(5)));
        assert!(position(CallKind::Aspirate, 0) < dwell);
        assert!(dwell < position(CallKind::Aspirate, 1));

        // Aspirate rate applies only for the draws
        assert!(mock.events().contains(&HardwareEvent::SetFlowRates {
            channel: ChannelClass::HighVolume,
            rates: FlowRates::new(10.0, 92.86),
        }));
        assert_eq!(mock.flow_rates(ChannelClass::HighVolume), FlowRates::uniform(92.86));
    }

    #[tokio::test]
    async fn test_binding_profile_split() {
        let (mock, pipettes) = setup();
        tipped(&pipettes.high).await;
        remove_supernatant(
            &pipettes.high,
            200.0,
            &well(1),
            &SupernatantProfile::binding_buffer(),
            FILL,
        )
        .await
        .unwrap();

        let draws = aspirations(&mock);
        assert!((draws[0].0 - 180.0).abs() < 1e-9);
        assert!((draws[1].0 - 20.0).abs() < 1e-9);
        assert!((draws[0].1.offset.x + 2.0).abs() < 1e-9);
        assert_eq!(draws[1].1.offset.z, 0.5);
    }

    #[tokio::test]
    async fn test_resuspend_zero_reps_is_noop() {
        let (mock, pipettes) = setup();
        tipped(&pipettes.high).await;
        mock.clear_events();
        resuspend_beads(&pipettes.high, 0, 150.0, &well(1), FlowRates::uniform(400.0))
            .await
            .unwrap();
        assert!(mock.events().is_empty());
    }

    #[tokio::test]
    async fn test_resuspend_dispenses_away_from_pellet() {
        let (mock, pipettes) = setup();
        tipped(&pipettes.high).await;
        resuspend_beads(&pipettes.high, 3, 100.0, &well(1), FlowRates::uniform(400.0))
            .await
            .unwrap();

        let dispenses = mock.events_of(CallKind::Dispense);
        assert_eq!(dispenses.len(), 3);
        match &dispenses[0] {
            HardwareEvent::Dispense {
                volume_ul,
                location: Some(location),
                ..
            } => {
                assert!((volume_ul - 80.0).abs() < 1e-9);
                assert_eq!(location.offset, Offset::new(1.5, 0.0, 3.0));
            }
            other => panic!("unexpected event {:?}", other),
        }
        // Draws stay on the vertical axis
        assert!(aspirations(&mock)
            .iter()
            .all(|(_, location)| location.offset == Offset::z(1.0)));
        assert_eq!(mock.flow_rates(ChannelClass::HighVolume), FlowRates::uniform(92.86));
    }

    #[tokio::test]
    async fn test_well_wash_quarters_volume() {
        let (mock, pipettes) = setup();
        tipped(&pipettes.high).await;
        pipettes.high.aspirate(100.0, &well(3).bottom(1.0), None).await.unwrap();
        well_wash(&pipettes.high, &well(1)).await.unwrap();

        let dispenses = mock.events_of(CallKind::Dispense);
        assert_eq!(dispenses.len(), 4);
        assert!(dispenses
            .iter()
            .all(|e| matches!(e, HardwareEvent::Dispense { volume_ul, .. } if *volume_ul == 25.0)));
        assert_eq!(mock.events_of(CallKind::BlowOut).len(), 1);
        assert_eq!(pipettes.high.current_volume(), 0.0);
    }

    #[tokio::test]
    async fn test_touch_tip_visits_four_points() {
        let (mock, pipettes) = setup();
        touch_tip(&pipettes.high, &well(2), TOUCH_DEPTH_MM).await.unwrap();

        let moves = mock.events_of(CallKind::MoveTo);
        // slow exit + four touches + return
        assert_eq!(moves.len(), 6);
        assert_eq!(
            moves[1],
            HardwareEvent::MoveTo {
                channel: ChannelClass::HighVolume,
                location: well(2).top(TOUCH_DEPTH_MM).shifted(Offset::new(4.5, 0.0, 0.0)),
            }
        );
    }

    #[tokio::test]
    async fn test_wash_tip_skips_blow_out_when_empty() {
        let (mock, pipettes) = setup();
        tipped(&pipettes.high).await;
        wash_tip(&pipettes.high, &well(11), 100.0).await.unwrap();

        let blow_outs = mock.events_of(CallKind::BlowOut);
        assert_eq!(blow_outs.len(), 1);
        assert_eq!(mock.events_of(CallKind::Mix).len(), 1);
    }

    #[tokio::test]
    async fn test_trash_tip_uses_tipped_channel() {
        let (mock, pipettes) = setup();
        let layout = DeckLayout::default();
        let mut pool = ResourcePool::new(1);
        pool.allocate_tips(&TipRole::LOW_VOLUME, &layout.low_volume_racks, ChannelClass::LowVolume)
            .unwrap();
        let tip = pool.lane(0).unwrap().tip(TipRole::RtPcrPool1).unwrap().clone();

        fetch_tip(&pipettes, &pool, &tip).await.unwrap();
        pipettes.low.aspirate(5.0, &well(3).bottom(0.0), None).await.unwrap();
        trash_tip(&pipettes, &pool, &layout.trash).await.unwrap();

        assert!(!pipettes.low.has_tip());
        assert_eq!(pool.tip_state(&tip).unwrap(), TipState::Consumed);
        assert!(mock.events().iter().any(|e| matches!(
            e,
            HardwareEvent::Dispense { channel: ChannelClass::LowVolume, volume_ul, .. } if *volume_ul == 5.0
        )));
        assert!(fetch_tip(&pipettes, &pool, &tip).await.is_err());
    }

    #[tokio::test]
    async fn test_trash_without_tip_fails() {
        let (_mock, pipettes) = setup();
        let pool = ResourcePool::new(1);
        let err = trash_tip(&pipettes, &pool, &DeckLayout::default().trash)
            .await
            .unwrap_err();
        assert!(matches!(err, ChoreoError::InvalidTipTransition { .. }));
    }

    #[tokio::test]
    async fn test_collect_dispense_touch_restores_rates() {
        let (mock, pipettes) = setup();
        tipped(&pipettes.high).await;
        let options = CollectOptions {
            rates: Some(FlowRates::new(100.0, 5.0)),
            blow_out: true,
            touch_tip: true,
        };
        collect_dispense_touch(&pipettes.high, 150.0, &well(1), options, FILL)
            .await
            .unwrap();

        assert!(mock
            .events()
            .contains(&HardwareEvent::SetBlowOutRate {
                channel: ChannelClass::HighVolume,
                rate: Some(10.0)
            }));
        assert!(mock.events().contains(&HardwareEvent::Delay(Duration::from_secs(5))));
        assert_eq!(mock.flow_rates(ChannelClass::HighVolume), FlowRates::uniform(92.86));
        assert_eq!(mock.blow_out_rate(ChannelClass::HighVolume), None);
    }

    #[tokio::test]
    async fn test_slow_blow_out_restores_rate_when_blow_out_fails() {
        let (mock, pipettes) = setup();
        tipped(&pipettes.high).await;
        mock.fail_next(CallKind::BlowOut);

        let err = slow_blow_out(&pipettes.high, &well(1)).await.unwrap_err();
        assert!(matches!(err, ChoreoError::HardwareFault(_)));
        assert_eq!(mock.blow_out_rate(ChannelClass::HighVolume), None);
        assert_eq!(
            mock.events_of(CallKind::SetBlowOutRate).last(),
            Some(&HardwareEvent::SetBlowOutRate {
                channel: ChannelClass::HighVolume,
                rate: None
            })
        );
        // No dwell after a failed blow-out
        assert!(mock.events_of(CallKind::Delay).is_empty());
    }

    #[tokio::test]
    async fn test_failed_pick_up_leaves_tip_available() {
        let (mock, pipettes) = setup();
        let layout = DeckLayout::default();
        let mut pool = ResourcePool::new(1);
        pool.allocate_tips(&TipRole::HIGH_VOLUME, &layout.high_volume_racks, ChannelClass::HighVolume)
            .unwrap();
        let tip = pool.lane(0).unwrap().tip(TipRole::Mix).unwrap().clone();
        mock.fail_next(CallKind::PickUpTip);

        let err = fetch_tip(&pipettes, &pool, &tip).await.unwrap_err();
        assert!(matches!(err, ChoreoError::HardwareFault(_)));
        assert_eq!(pool.tip_state(&tip).unwrap(), TipState::Unused);
        assert_eq!(pool.current_tip(ChannelClass::HighVolume), None);
        assert!(!pipettes.high.has_tip());

        // Ledger and channel agree, so a retry goes through
        fetch_tip(&pipettes, &pool, &tip).await.unwrap();
        assert_eq!(pool.tip_state(&tip).unwrap(), TipState::Held(ChannelClass::HighVolume));
    }

    #[tokio::test]
    async fn test_failed_pick_up_of_parked_tip_stays_parked() {
        let (mock, pipettes) = setup();
        let layout = DeckLayout::default();
        let mut pool = ResourcePool::new(1);
        pool.allocate_tips(&TipRole::HIGH_VOLUME, &layout.high_volume_racks, ChannelClass::HighVolume)
            .unwrap();
        let tip = pool.lane(0).unwrap().tip(TipRole::Elution).unwrap().clone();
        fetch_tip(&pipettes, &pool, &tip).await.unwrap();
        park_tip(&pipettes.high, &pool).await.unwrap();

        mock.fail_next(CallKind::PickUpTip);
        assert!(fetch_tip(&pipettes, &pool, &tip).await.is_err());
        assert_eq!(pool.tip_state(&tip).unwrap(), TipState::Parked);
    }
}

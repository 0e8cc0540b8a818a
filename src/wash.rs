//! Wash-beads cycle.
//!
//! ```text
//! DispenseBuffer ──▶ Resuspend? ──▶ EngageMagnet(settle) ──▶ RemoveSupernatant ──▶ Done
//! ```
//!
//! Each state runs across every lane before the cycle advances, so magnet
//! transitions stay global. Lane tips are parked between states and trashed
//! after supernatant removal.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

use crate::compound::{
    collect_dispense_touch, fetch_tip, park_tip, remove_supernatant, resuspend_beads,
    side_dispense, trash_tip, well_wash, CollectOptions, SideDispense, SupernatantProfile,
};
use crate::coordinator::ModuleCoordinator;
use crate::error::AppResult;
use crate::hardware::FlowRates;
use crate::labware::WellResource;
use crate::pool::{ResourcePool, TipRole, WellRole};
use crate::primitives::Pipettes;

/// Viscosity class of a wash buffer. Drives settle time and dispense pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferClass {
    /// Viral DNA/RNA binding buffer
    Binding,
    /// MagBead wash buffer
    Detergent,
    /// Volatile, rinsed around the rim with [`well_wash`]
    Ethanol,
}

/// Position of a lane within a wash cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WashState {
    /// Buffer going into the well
    DispenseBuffer,
    /// Beads being broken up
    Resuspend,
    /// Pellet forming
    EngageMagnet,
    /// Buffer being drawn off
    RemoveSupernatant,
    /// Cycle complete
    Done,
}

impl fmt::Display for WashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WashState::DispenseBuffer => "dispense buffer",
            WashState::Resuspend => "resuspend",
            WashState::EngageMagnet => "engage magnet",
            WashState::RemoveSupernatant => "remove supernatant",
            WashState::Done => "done",
        };
        f.write_str(name)
    }
}

/// Rates for dispensing buffer straight onto an undisturbed pellet.
const DIRECT_DISPENSE_RATES: FlowRates = FlowRates::new(100.0, 10.0);
/// Dispense rate for buffer laid against the wall before resuspension.
const SIDE_DISPENSE_RATE: f64 = 5.0;
/// Rates for the collect-dispense-touch that finishes resuspension.
const COLLECT_RATES: FlowRates = FlowRates::new(100.0, 5.0);
/// Aspiration height for drawing buffer from the reservoir (mm).
const BUFFER_DRAW_HEIGHT_MM: f64 = 1.0;

/// Everything a cycle needs from its surroundings.
pub struct WashContext<'a> {
    /// Both channels
    pub pipettes: &'a Pipettes,
    /// Lane bindings and tip ledger
    pub pool: &'a ResourcePool,
    /// Magnet owner
    pub modules: &'a mut ModuleCoordinator,
    /// Where supernatant tips are emptied
    pub trash: &'a WellResource,
    /// How supernatant is drawn off
    pub supernatant: &'a SupernatantProfile,
    /// Rates for bead resuspension
    pub resuspend_rates: FlowRates,
    /// Liquid height per µl (mm/µl)
    pub fill_rate: f64,
}

/// One wash of every lane's beads with a single buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct WashCycle {
    /// Buffer per lane
    pub volume_ul: f64,
    /// Reservoir well holding the buffer
    pub buffer: WellResource,
    /// Viscosity class of the buffer
    pub buffer_class: BufferClass,
    /// Lane well being washed
    pub well_role: WellRole,
    /// Lane tip used for the whole cycle
    pub tip_role: TipRole,
    /// Resuspension cycles
    pub reps: u32,
    /// Break up the pellet before settling
    pub resuspend: bool,
    /// Settle time after engaging the magnet
    pub settle: Duration,
}

impl WashCycle {
    /// Resuspending cycle; `reps` and `settle` can be adjusted afterwards.
    pub fn new(
        volume_ul: f64,
        buffer: WellResource,
        buffer_class: BufferClass,
        well_role: WellRole,
        tip_role: TipRole,
        settle: Duration,
    ) -> Self {
        Self {
            volume_ul,
            buffer,
            buffer_class,
            well_role,
            tip_role,
            reps: 15,
            resuspend: true,
            settle,
        }
    }

    /// Override the resuspension cycle count.
    pub fn with_reps(mut self, reps: u32) -> Self {
        self.reps = reps;
        self
    }

    /// Lay buffer onto the pellet without mixing. Forces reps and settle to 0.
    pub fn without_resuspend(mut self) -> Self {
        self.resuspend = false;
        self
    }

    fn effective(&self) -> (u32, Duration) {
        if self.resuspend {
            (self.reps, self.settle)
        } else {
            (0, Duration::ZERO)
        }
    }

    /// Drive the cycle to completion across every lane.
    pub async fn run(&self, ctx: &mut WashContext<'_>) -> AppResult<()> {
        let mut state = WashState::DispenseBuffer;
        info!(
            buffer = %self.buffer,
            volume_ul = self.volume_ul,
            resuspend = self.resuspend,
            "Wash cycle started"
        );
        while state != WashState::Done {
            debug!(state = %state, "wash state");
            state = match state {
                WashState::DispenseBuffer => {
                    self.dispense_buffer(ctx).await?;
                    if self.resuspend {
                        WashState::Resuspend
                    } else {
                        WashState::EngageMagnet
                    }
                }
                WashState::Resuspend => {
                    self.resuspend_lanes(ctx).await?;
                    WashState::EngageMagnet
                }
                WashState::EngageMagnet => {
                    let (_, settle) = self.effective();
                    ctx.modules.engage_magnet(settle).await?;
                    WashState::RemoveSupernatant
                }
                WashState::RemoveSupernatant => {
                    self.remove_lanes(ctx).await?;
                    WashState::Done
                }
                WashState::Done => WashState::Done,
            };
        }
        info!(buffer = %self.buffer, "Wash cycle complete");
        Ok(())
    }

    async fn dispense_buffer(&self, ctx: &mut WashContext<'_>) -> AppResult<()> {
        if !self.resuspend {
            // The cycle engages once; it cannot start on an engaged magnet.
            ctx.modules.require_disengaged("direct buffer dispense")?;
        } else if ctx.modules.state().magnet.is_engaged() {
            ctx.modules.disengage_magnet().await?;
        }
        let pipette = ctx.pipettes.for_channel(self.tip_role.channel());

        for lane in ctx.pool.lanes() {
            let tip = lane.tip(self.tip_role)?;
            let well = lane.well(self.well_role)?;
            debug!(lane = lane.index(), role = %self.tip_role, volume_ul = self.volume_ul, "dispense buffer");

            fetch_tip(ctx.pipettes, ctx.pool, tip).await?;
            pipette
                .aspirate_with_settle(self.volume_ul, &self.buffer, BUFFER_DRAW_HEIGHT_MM, None)
                .await?;
            if self.buffer_class == BufferClass::Ethanol {
                well_wash(pipette, well).await?;
            } else if !self.resuspend {
                let _rates = pipette.set_flow_profile(&DIRECT_DISPENSE_RATES.into())?;
                pipette.dispense_all(Some(&well.bottom(0.0))).await?;
                pipette.slow_exit(well, 0.0).await?;
            } else {
                let options = SideDispense {
                    rates: FlowRates::new(SideDispense::default().rates.aspirate, SIDE_DISPENSE_RATE),
                    ..SideDispense::default()
                };
                side_dispense(pipette, well, options).await?;
                pipette.slow_exit(well, 0.0).await?;
            }
            park_tip(pipette, ctx.pool).await?;
        }
        Ok(())
    }

    async fn resuspend_lanes(&self, ctx: &mut WashContext<'_>) -> AppResult<()> {
        ctx.modules.require_disengaged("bead resuspension")?;
        let (reps, _) = self.effective();
        let pipette = ctx.pipettes.for_channel(self.tip_role.channel());
        let collect = CollectOptions {
            rates: Some(COLLECT_RATES),
            blow_out: true,
            touch_tip: true,
        };

        for lane in ctx.pool.lanes() {
            let well = lane.well(self.well_role)?;
            debug!(lane = lane.index(), reps, "resuspend");
            fetch_tip(ctx.pipettes, ctx.pool, lane.tip(self.tip_role)?).await?;
            resuspend_beads(pipette, reps, self.volume_ul, well, ctx.resuspend_rates).await?;
            collect_dispense_touch(pipette, self.volume_ul, well, collect, ctx.fill_rate).await?;
            park_tip(pipette, ctx.pool).await?;
        }
        Ok(())
    }

    async fn remove_lanes(&self, ctx: &mut WashContext<'_>) -> AppResult<()> {
        ctx.modules.require_settled("supernatant removal")?;
        let pipette = ctx.pipettes.for_channel(self.tip_role.channel());

        for lane in ctx.pool.lanes() {
            let well = lane.well(self.well_role)?;
            debug!(lane = lane.index(), volume_ul = self.volume_ul, "remove supernatant");
            fetch_tip(ctx.pipettes, ctx.pool, lane.tip(self.tip_role)?).await?;
            remove_supernatant(pipette, self.volume_ul, well, ctx.supernatant, ctx.fill_rate).await?;
            pipette.slow_exit(well, 0.0).await?;
            trash_tip(ctx.pipettes, ctx.pool, ctx.trash).await?;
        }
        Ok(())
    }
}

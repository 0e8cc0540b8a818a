//! Protocol choreographer.
//!
//! Drives the eleven protocol stages strictly in order. All lane resources
//! are allocated in [`Choreographer::new`], before any hardware call, so an
//! over-subscribed deck fails fast with `ResourceExhausted`.
//!
//! Each stage is narrated before and after. The first error aborts the run;
//! stages that already completed are reported by
//! [`Choreographer::completed_stages`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::compound::{
    collect_dispense_touch, fetch_tip, liquid_level, park_tip, remove_supernatant, side_dispense,
    touch_tip, trash_tip, CollectOptions, SideDispense,
};
use crate::config::ProtocolConfig;
use crate::coordinator::ModuleCoordinator;
use crate::error::{AppResult, ChoreoError};
use crate::hardware::{Deck, FlowRates, RobotControl};
use crate::labware::{bead_side, ChannelClass, Offset, TipResource, WellResource};
use crate::layout::DeckLayout;
use crate::narration::{AlertCue, AlertSink, CommandAlertSink, Narrator, RunId};
use crate::pool::{ResourcePool, SampleLane, TipRole, WellRole};
use crate::primitives::{FlowProfile, Pipettes};
use crate::wash::{BufferClass, WashContext, WashCycle};

/// Operator prompt shown once the deck is prepared.
const LOAD_PROMPT: &str = "Place sample plate onto magnetic module and press resume to begin.";

/// Reagent aspiration height above the well bottom (mm).
const REAGENT_DRAW_HEIGHT_MM: f64 = 1.0;
/// Master-mix aspiration height on the cold plate (mm).
const MASTER_MIX_DRAW_HEIGHT_MM: f64 = 0.5;

const PREMIX_HEIGHT_MM: f64 = 1.5;
const PREMIX_EXIT_DEPTH_MM: f64 = -2.5;
const PREMIX_BLOW_OUT_RATE: f64 = 10.0;

/// Each RT-PCR pool is plated in two halves; the first lands four rows down
/// the column (9 mm pitch).
const HALF_REACTION_SHIFT_MM: f64 = -36.0;
const HALF_REACTION_HEIGHT_MM: f64 = 1.0;

const BEAD_STOCK_DISPENSE_HEIGHT_MM: f64 = 5.0;
const BINDING_MIX_DISPENSE_HEIGHT_MM: f64 = 5.0;
/// Buffer additions: fast draw, slow release onto the sample.
const BUFFER_ADD_RATES: FlowRates = FlowRates::new(100.0, 5.0);
const BINDING_COLLECT_DISPENSE_RATE: f64 = 5.0;

const RESIDUAL_ETHANOL_HEIGHTS_MM: [f64; 2] = [0.0, -1.0];
const RESIDUAL_ETHANOL_EXIT_DEPTH_MM: f64 = -15.0;

const ELUATE_APPROACH_DEPTH_MM: f64 = -10.0;
const ELUATE_ASPIRATE_RATE: f64 = 5.0;
/// Eluate is drawn from the wall opposite the pellet (mm).
const ELUATE_SHIFT_MM: f64 = 3.0;
const ELUATE_MIX_RATES: FlowRates = FlowRates::uniform(20.0);

// =============================================================================
// Stages
// =============================================================================

/// The fixed protocol phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolStage {
    /// Lights on, lid open, modules cooled
    ModulePrecool,
    /// Operator loads the sample plate
    OperatorLoad,
    /// Proteinase K and extraction control
    ProteinaseK,
    /// RT-PCR master mixes plated
    RtPcrPlating,
    /// Beads and binding buffer added, mixed and removed
    MagBeadBinding,
    /// Two MagBead buffer washes
    DetergentWashes,
    /// Two ethanol washes and drying
    EthanolWashes,
    /// Elution buffer added and mixed
    Elution,
    /// Eluate moved into both RT-PCR pools
    EluateTransfer,
    /// Oil laid over the reactions
    MineralOilOverlay,
    /// Thermocycler program
    ThermalProfile,
}

impl ProtocolStage {
    /// Every stage in execution order.
    pub const ALL: [ProtocolStage; 11] = [
        ProtocolStage::ModulePrecool,
        ProtocolStage::OperatorLoad,
        ProtocolStage::ProteinaseK,
        ProtocolStage::RtPcrPlating,
        ProtocolStage::MagBeadBinding,
        ProtocolStage::DetergentWashes,
        ProtocolStage::EthanolWashes,
        ProtocolStage::Elution,
        ProtocolStage::EluateTransfer,
        ProtocolStage::MineralOilOverlay,
        ProtocolStage::ThermalProfile,
    ];

    /// Human-readable stage name used in narration.
    pub fn title(&self) -> &'static str {
        match self {
            ProtocolStage::ModulePrecool => "Module set up",
            ProtocolStage::OperatorLoad => "Sample loading",
            ProtocolStage::ProteinaseK => "Extraction control and Proteinase K",
            ProtocolStage::RtPcrPlating => "RT-PCR plating",
            ProtocolStage::MagBeadBinding => "MagBead binding",
            ProtocolStage::DetergentWashes => "MagBead buffer washes",
            ProtocolStage::EthanolWashes => "Ethanol washes",
            ProtocolStage::Elution => "Elution",
            ProtocolStage::EluateTransfer => "Eluate transfer",
            ProtocolStage::MineralOilOverlay => "Mineral oil overlay",
            ProtocolStage::ThermalProfile => "RT-PCR",
        }
    }
}

impl fmt::Display for ProtocolStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Identifier of the run
    pub run_id: RunId,
    /// Experiment name, if given
    pub experiment: Option<String>,
    /// Final lane bindings with well fill estimates
    pub lanes: Vec<SampleLane>,
    /// Stages that finished
    pub completed_stages: Vec<ProtocolStage>,
}

/// Tips used outside a single lane.
#[derive(Debug)]
struct SharedTips {
    /// Lane 0's first viral-buffer tip, reused for the Proteinase K premix
    proteinase_k_premix: TipResource,
    /// Lane 0's first ethanol tip, reused for the RT-PCR premix
    rt_pcr_premix: TipResource,
    bead_stock: TipResource,
    /// Reserved low-volume tips, one per RT-PCR pool
    pool_plating: [TipResource; 2],
}

impl SharedTips {
    fn reserve(pool: &mut ResourcePool, layout: &DeckLayout) -> AppResult<Self> {
        let first = pool.lane(0)?;
        let viral = first.tip(TipRole::ViralBuffer1)?.clone();
        let ethanol = first.tip(TipRole::Ethanol1)?.clone();

        let declared = &layout.shared_low_volume_tips;
        let slot = |index: usize| {
            declared
                .get(index)
                .cloned()
                .ok_or_else(|| ChoreoError::ResourceExhausted {
                    resource: "shared low-volume tips".to_string(),
                    requested: 2,
                    available: declared.len(),
                })
        };
        let pool_1 = pool.reserve_tip(ChannelClass::LowVolume, slot(0)?)?;
        let pool_2 = pool.reserve_tip(ChannelClass::LowVolume, slot(1)?)?;

        Ok(Self {
            proteinase_k_premix: viral.clone(),
            rt_pcr_premix: ethanol,
            bead_stock: viral,
            pool_plating: [pool_1, pool_2],
        })
    }
}

// =============================================================================
// Choreographer
// =============================================================================

/// Runs the protocol once against a deck.
pub struct Choreographer {
    deck: Deck,
    config: ProtocolConfig,
    pool: ResourcePool,
    pipettes: Pipettes,
    modules: ModuleCoordinator,
    narrator: Narrator,
    shared: SharedTips,
    started: bool,
    completed: Vec<ProtocolStage>,
}

impl Choreographer {
    /// Validate `config` and allocate every lane resource.
    ///
    /// No hardware call is made here.
    pub fn new(deck: Deck, config: ProtocolConfig, experiment: Option<String>) -> AppResult<Self> {
        config.validate()?;
        let layout = &config.layout;
        let lanes = config.samples.count;
        info!(lanes, "Allocating lane resources");

        let mut pool = ResourcePool::new(lanes);
        pool.allocate_tips(&TipRole::LOW_VOLUME, &layout.low_volume_racks, ChannelClass::LowVolume)?;
        pool.allocate_tips(&TipRole::HIGH_VOLUME, &layout.high_volume_racks, ChannelClass::HighVolume)?;
        pool.allocate_wells(&WellRole::MAGNETIC_PLATE, &layout.magnetic_plate)?;
        pool.allocate_wells(&WellRole::RT_PCR_PLATE, &layout.rt_pcr_plate)?;
        pool.allocate_wells(&[WellRole::IndexPcr], &layout.index_pcr_plate)?;
        pool.allocate_wells(&[WellRole::IndexPrimer], &layout.cold_plate)?;
        let shared = SharedTips::reserve(&mut pool, layout)?;

        let pipettes = Pipettes::from_deck(
            &deck,
            config.pipettes.low_volume_default_rate,
            config.pipettes.high_volume_default_rate,
        );
        let modules = ModuleCoordinator::new(&deck, config.geometry.magnet_engage_height_mm);
        let alerts = CommandAlertSink::new(
            config.application.sounds_dir.clone(),
            deck.robot.is_simulating(),
        );
        let narrator = Narrator::new(
            RunId::new(),
            experiment,
            deck.robot.clone(),
            config.application.run_log_dir.clone(),
            Arc::new(alerts),
        );
        debug!(run_id = %narrator.run_id(), tips = pool.registered_tips().len(), "Resources allocated");

        Ok(Self {
            deck,
            config,
            pool,
            pipettes,
            modules,
            narrator,
            shared,
            started: false,
            completed: Vec::new(),
        })
    }

    /// Use a different alert sink (the default plays sounds through `mpg123`).
    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.narrator = self.narrator.with_alert_sink(alerts);
        self
    }

    /// Identifier used in narration and the run log name.
    pub fn run_id(&self) -> RunId {
        self.narrator.run_id()
    }

    /// Lane bindings and tip ledger.
    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    /// Module state.
    pub fn modules(&self) -> &ModuleCoordinator {
        &self.modules
    }

    /// Stages finished so far, in order.
    pub fn completed_stages(&self) -> &[ProtocolStage] {
        &self.completed
    }

    /// Execute every stage once, in order.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by a stage. A choreographer runs at most
    /// once; a second call fails with `InvalidModuleSequence`.
    pub async fn run(&mut self) -> AppResult<RunSummary> {
        if self.started {
            return Err(ChoreoError::InvalidModuleSequence(
                "protocol already started on this deck".to_string(),
            ));
        }
        self.started = true;
        info!(
            run_id = %self.narrator.run_id(),
            lanes = self.pool.lanes().len(),
            experiment = self.narrator.experiment().unwrap_or(""),
            "Protocol run started"
        );

        for stage in ProtocolStage::ALL {
            self.narrator.narrate(&format!("{} started.", stage.title()));
            if let Err(e) = self.run_stage(stage).await {
                error!(stage = %stage, "Stage failed: {}", e);
                self.narrator.alert(AlertCue::Stop).await;
                return Err(e);
            }
            self.narrator.narrate(&format!("{} complete.", stage.title()));
            self.completed.push(stage);
        }

        info!(run_id = %self.narrator.run_id(), "Protocol run complete");
        Ok(self.summary())
    }

    fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.narrator.run_id(),
            experiment: self.narrator.experiment().map(str::to_string),
            lanes: self.pool.lanes().to_vec(),
            completed_stages: self.completed.clone(),
        }
    }

    async fn run_stage(&mut self, stage: ProtocolStage) -> AppResult<()> {
        match stage {
            ProtocolStage::ModulePrecool => self.module_precool().await,
            ProtocolStage::OperatorLoad => self.operator_load().await,
            ProtocolStage::ProteinaseK => self.proteinase_k().await,
            ProtocolStage::RtPcrPlating => self.rt_pcr_plating().await,
            ProtocolStage::MagBeadBinding => self.mag_bead_binding().await,
            ProtocolStage::DetergentWashes => self.detergent_washes().await,
            ProtocolStage::EthanolWashes => self.ethanol_washes().await,
            ProtocolStage::Elution => self.elution().await,
            ProtocolStage::EluateTransfer => self.eluate_transfer().await,
            ProtocolStage::MineralOilOverlay => self.mineral_oil_overlay().await,
            ProtocolStage::ThermalProfile => self.thermal_profile().await,
        }
    }

    // -------------------------------------------------------------------------
    // 1-2: set up and loading
    // -------------------------------------------------------------------------

    async fn module_precool(&mut self) -> AppResult<()> {
        let precool_c = self.config.thermal.precool_c;
        self.deck.robot.set_rail_lights(true).await?;
        self.modules.open_lid().await?;
        // Raised so the sample plate seats against the magnet during loading.
        self.modules.engage_magnet(Duration::ZERO).await?;

        self.narrator
            .narrate(&format!("Cooling thermocycler plate to {} °C.", precool_c));
        self.modules.set_block_temperature(precool_c, None, None).await?;
        self.narrator
            .narrate(&format!("Cooling temperature module to {} °C.", precool_c));
        self.modules.set_module_temperature(precool_c).await
    }

    async fn operator_load(&mut self) -> AppResult<()> {
        self.narrator.narrate("Awaiting samples to be loaded.");
        self.narrator.pause(LOAD_PROMPT, AlertCue::Alert).await?;
        for lane in self.pool.lanes() {
            lane.well(WellRole::Extraction)?
                .fill
                .set(self.config.volumes.sample);
        }
        self.modules.disengage_magnet().await
    }

    // -------------------------------------------------------------------------
    // 3-4: lysis and RT-PCR plating
    // -------------------------------------------------------------------------

    async fn proteinase_k(&mut self) -> AppResult<()> {
        let volumes = &self.config.volumes;
        let mixing = &self.config.mixing;
        let fill = self.config.geometry.well_fill_rate;
        let layout = &self.config.layout;
        let master_mix = layout.cold_reagent(layout.cold_reagents.proteinase_k_mix);
        let pipette = &self.pipettes.high;

        self.narrator
            .narrate("Mixing Proteinase K and extraction control master mix.");
        premix(
            &self.pipettes,
            &self.pool,
            &self.shared.proteinase_k_premix,
            &master_mix,
            mixing.premix_reps,
            volumes.proteinase_k_premix,
        )
        .await?;

        self.narrator
            .narrate("Adding Proteinase K master mix to each sample.");
        self.modules.require_disengaged("Proteinase K mixing")?;
        for lane in self.pool.lanes() {
            let well = lane.well(WellRole::Extraction)?;
            debug!(lane = lane.index(), volume_ul = volumes.proteinase_k, "proteinase K");
            fetch_tip(&self.pipettes, &self.pool, lane.tip(TipRole::Mix)?).await?;
            pipette
                .aspirate_with_settle(volumes.proteinase_k, &master_mix, REAGENT_DRAW_HEIGHT_MM, None)
                .await?;
            pipette.slow_exit(&master_mix, 0.0).await?;
            pipette.dispense_all(Some(&well.bottom(0.0))).await?;
            {
                let _rates = pipette.set_flow_profile(&mixing.resuspend_rates.into())?;
                pipette
                    .mix(mixing.proteinase_k_reps, volumes.proteinase_k_mix, None)
                    .await?;
            }
            collect_dispense_touch(
                pipette,
                volumes.proteinase_k_mix,
                well,
                CollectOptions::default(),
                fill,
            )
            .await?;
            park_tip(pipette, &self.pool).await?;
        }

        self.narrator.narrate("Incubating samples with Proteinase K.");
        self.deck.robot.delay(self.config.incubation.proteinase_k).await?;
        Ok(())
    }

    async fn rt_pcr_plating(&mut self) -> AppResult<()> {
        let volume = self.config.volumes.rt_pcr_master_mix;
        let layout = &self.config.layout;
        let pool_mixes = [
            layout.cold_reagent(layout.cold_reagents.rt_pcr_pool_1_mix),
            layout.cold_reagent(layout.cold_reagents.rt_pcr_pool_2_mix),
        ];

        self.narrator.narrate("Mixing RT-PCR master mixes.");
        premix(
            &self.pipettes,
            &self.pool,
            &self.shared.rt_pcr_premix,
            &pool_mixes[0],
            self.config.mixing.premix_reps,
            self.config.volumes.rt_pcr_premix,
        )
        .await?;

        let pipette = &self.pipettes.low;
        let roles = WellRole::RT_PCR_PLATE;
        let pools = roles
            .iter()
            .zip(&self.shared.pool_plating)
            .zip(&pool_mixes);
        for (number, ((role, tip), master_mix)) in pools.enumerate() {
            self.narrator
                .narrate(&format!("Plating pool {} RT-PCR master mix.", number + 1));
            fetch_tip(&self.pipettes, &self.pool, tip).await?;
            for lane in self.pool.lanes() {
                let well = lane.well(*role)?;
                let half = Offset::new(0.0, HALF_REACTION_SHIFT_MM, 0.0);
                debug!(lane = lane.index(), role = %role, volume_ul = volume, "plate master mix");

                pipette
                    .aspirate_with_settle(volume, master_mix, MASTER_MIX_DRAW_HEIGHT_MM, None)
                    .await?;
                pipette.slow_exit(master_mix, 0.0).await?;
                pipette
                    .dispense(
                        volume,
                        Some(&well.bottom(HALF_REACTION_HEIGHT_MM).shifted(half)),
                        None,
                    )
                    .await?;
                pipette.slow_move_to(&well.top(0.0).shifted(half)).await?;

                pipette
                    .aspirate_with_settle(volume, master_mix, MASTER_MIX_DRAW_HEIGHT_MM, None)
                    .await?;
                pipette.slow_exit(master_mix, 0.0).await?;
                pipette.move_to(&well.top(0.0)).await?;
                pipette.dispense(volume, Some(&well.bottom(0.0)), None).await?;
                pipette.slow_exit(well, 0.0).await?;
            }
            park_tip(pipette, &self.pool).await?;
        }

        self.narrator
            .narrate("Closing thermocycler lid and deactivating temperature module.");
        self.modules.deactivate_temperature_module().await?;
        self.modules.close_lid().await?;
        self.deck.robot.home().await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // 5-7: binding and washes
    // -------------------------------------------------------------------------

    async fn mag_bead_binding(&mut self) -> AppResult<()> {
        let volumes = &self.config.volumes;
        let mixing = &self.config.mixing;
        let fill = self.config.geometry.well_fill_rate;
        let layout = &self.config.layout;
        let beads = layout.reagent(layout.reagents.viral_buffer_beads);
        let buffer = layout.reagent(layout.reagents.viral_buffer);
        let pipette = &self.pipettes.high;

        self.narrator
            .narrate("Resuspending MagBeads in viral DNA/RNA buffer.");
        fetch_tip(&self.pipettes, &self.pool, &self.shared.bead_stock).await?;
        {
            let _rates = pipette.set_flow_profile(&mixing.resuspend_rates.into())?;
            for _ in 0..mixing.bead_stock_reps {
                pipette
                    .aspirate(volumes.bead_stock_mix, &beads.bottom(0.0), None)
                    .await?;
                pipette
                    .dispense_all(Some(&beads.bottom(BEAD_STOCK_DISPENSE_HEIGHT_MM)))
                    .await?;
            }
        }
        pipette.slow_exit(&beads, 0.0).await?;
        park_tip(pipette, &self.pool).await?;

        let additions = [
            (
                "Adding viral DNA/RNA buffer with MagBeads to every sample.",
                TipRole::ViralBuffer1,
                &beads,
                volumes.bead_buffer,
            ),
            (
                "Adding viral DNA/RNA buffer to every sample.",
                TipRole::ViralBuffer2,
                &buffer,
                volumes.viral_buffer,
            ),
        ];
        for (message, role, source, volume) in additions {
            self.narrator.narrate(message);
            for lane in self.pool.lanes() {
                let well = lane.well(WellRole::Extraction)?;
                debug!(lane = lane.index(), role = %role, volume_ul = volume, "add binding buffer");
                fetch_tip(&self.pipettes, &self.pool, lane.tip(role)?).await?;
                let _rates = pipette.set_flow_profile(&BUFFER_ADD_RATES.into())?;
                pipette
                    .aspirate_with_settle(volume, source, REAGENT_DRAW_HEIGHT_MM, None)
                    .await?;
                pipette.slow_exit(source, 0.0).await?;
                // Release at the surface the well will have once this addition lands
                let surface = liquid_level(well.fill_ul() + pipette.current_volume(), fill);
                pipette.dispense_all(Some(&well.bottom(surface))).await?;
                pipette.slow_exit(well, 0.0).await?;
                park_tip(pipette, &self.pool).await?;
            }
        }

        self.narrator
            .narrate("Mixing MagBeads into every sample.");
        self.modules.require_disengaged("binding mix")?;
        let collect = CollectOptions {
            rates: Some(FlowRates::new(
                pipette.default_rates().aspirate,
                BINDING_COLLECT_DISPENSE_RATE,
            )),
            blow_out: true,
            touch_tip: true,
        };
        for lane in self.pool.lanes() {
            let well = lane.well(WellRole::Extraction)?;
            debug!(lane = lane.index(), reps = mixing.binding_reps, "binding mix");
            fetch_tip(&self.pipettes, &self.pool, lane.tip(TipRole::ViralBuffer1)?).await?;
            for _ in 0..mixing.binding_reps {
                pipette
                    .aspirate(volumes.binding_mix, &well.bottom(0.0), None)
                    .await?;
                pipette
                    .dispense_all(Some(&well.bottom(BINDING_MIX_DISPENSE_HEIGHT_MM)))
                    .await?;
            }
            collect_dispense_touch(pipette, volumes.binding_mix, well, collect, fill).await?;
            pipette.slow_exit(well, 0.0).await?;
            park_tip(pipette, &self.pool).await?;
        }

        self.narrator.narrate("Allowing nucleic acid to bind to MagBeads.");
        self.deck.robot.delay(self.config.incubation.bead_binding).await?;

        self.narrator.narrate("Pelleting MagBeads.");
        self.modules
            .engage_magnet(self.config.settle.for_class(BufferClass::Binding))
            .await?;

        self.narrator.narrate("Removing viral DNA/RNA buffer.");
        self.modules.require_settled("binding buffer removal")?;
        for role in [TipRole::ViralBuffer1, TipRole::ViralBuffer2] {
            for lane in self.pool.lanes() {
                let well = lane.well(WellRole::Extraction)?;
                debug!(lane = lane.index(), role = %role, "remove binding buffer");
                fetch_tip(&self.pipettes, &self.pool, lane.tip(role)?).await?;
                pipette.move_to(&well.top(0.0)).await?;
                remove_supernatant(
                    pipette,
                    volumes.binding_removal,
                    well,
                    &self.config.supernatant.binding,
                    fill,
                )
                .await?;
                pipette.slow_exit(well, 0.0).await?;
                trash_tip(&self.pipettes, &self.pool, &layout.trash).await?;
            }
        }
        Ok(())
    }

    async fn detergent_washes(&mut self) -> AppResult<()> {
        let reagents = &self.config.layout.reagents;
        let buffers = [
            (TipRole::MagbeadBuffer1, reagents.magbead_buffer_1),
            (TipRole::MagbeadBuffer2, reagents.magbead_buffer_2),
        ];
        for (number, (tip_role, address)) in buffers.into_iter().enumerate() {
            self.narrator
                .narrate(&format!("Washing MagBeads with MagBead wash buffer {}.", number + 1));
            let cycle = WashCycle::new(
                self.config.volumes.detergent_wash,
                self.config.layout.reagent(address),
                BufferClass::Detergent,
                WellRole::Extraction,
                tip_role,
                self.config.settle.for_class(BufferClass::Detergent),
            )
            .with_reps(self.config.mixing.wash_reps);
            self.wash(&cycle).await?;
        }
        Ok(())
    }

    async fn ethanol_washes(&mut self) -> AppResult<()> {
        let [first, second] = self.config.layout.ethanol_wells();
        for (number, (tip_role, buffer)) in [(TipRole::Ethanol1, first), (TipRole::Ethanol2, second)]
            .into_iter()
            .enumerate()
        {
            self.narrator
                .narrate(&format!("Washing MagBeads with ethanol ({} of 2).", number + 1));
            let cycle = WashCycle::new(
                self.config.volumes.ethanol_wash,
                buffer,
                BufferClass::Ethanol,
                WellRole::Extraction,
                tip_role,
                self.config.settle.for_class(BufferClass::Ethanol),
            )
            .with_reps(self.config.mixing.wash_reps);
            self.wash(&cycle).await?;
        }

        self.narrator
            .narrate("Removing residual ethanol left in each well.");
        self.modules.require_settled("residual ethanol removal")?;
        let pipette = &self.pipettes.high;
        let volume = self.config.volumes.residual_ethanol;
        for lane in self.pool.lanes() {
            let well = lane.well(WellRole::Extraction)?;
            debug!(lane = lane.index(), volume_ul = volume, "residual ethanol");
            fetch_tip(&self.pipettes, &self.pool, lane.tip(TipRole::Ethanol3)?).await?;
            for height in RESIDUAL_ETHANOL_HEIGHTS_MM {
                pipette.aspirate(volume, &well.bottom(height), None).await?;
            }
            pipette.slow_exit(well, RESIDUAL_ETHANOL_EXIT_DEPTH_MM).await?;
            trash_tip(&self.pipettes, &self.pool, &self.config.layout.trash).await?;
        }

        self.narrator.narrate("Allowing MagBeads to dry.");
        self.modules.disengage_magnet().await?;
        self.deck.robot.delay(self.config.incubation.bead_drying).await?;
        Ok(())
    }

    async fn wash(&mut self, cycle: &WashCycle) -> AppResult<()> {
        let mut ctx = WashContext {
            pipettes: &self.pipettes,
            pool: &self.pool,
            modules: &mut self.modules,
            trash: &self.config.layout.trash,
            supernatant: &self.config.supernatant.wash,
            resuspend_rates: self.config.mixing.resuspend_rates,
            fill_rate: self.config.geometry.well_fill_rate,
        };
        cycle.run(&mut ctx).await
    }

    // -------------------------------------------------------------------------
    // 8-11: elution, transfer and cycling
    // -------------------------------------------------------------------------

    async fn elution(&mut self) -> AppResult<()> {
        let volumes = &self.config.volumes;
        let mixing = &self.config.mixing;
        let layout = &self.config.layout;
        let buffer = layout.reagent(layout.reagents.elution_buffer);
        let pipette = &self.pipettes.high;

        self.narrator.narrate("Opening thermocycler lid.");
        self.modules.open_lid().await?;

        self.narrator.narrate("Adding elution buffer to every sample.");
        for lane in self.pool.lanes() {
            let well = lane.well(WellRole::Extraction)?;
            debug!(lane = lane.index(), volume_ul = volumes.elution, "add elution buffer");
            fetch_tip(&self.pipettes, &self.pool, lane.tip(TipRole::Elution)?).await?;
            pipette
                .aspirate_with_settle(volumes.elution, &buffer, REAGENT_DRAW_HEIGHT_MM, None)
                .await?;
            pipette.slow_exit(&buffer, 0.0).await?;
            pipette.dispense_all(Some(&well.bottom(0.0))).await?;
            pipette.slow_exit(well, 0.0).await?;
            park_tip(pipette, &self.pool).await?;
        }

        self.narrator.narrate("Mixing MagBeads into elution buffer.");
        self.modules.require_disengaged("elution mix")?;
        for lane in self.pool.lanes() {
            let well = lane.well(WellRole::Extraction)?;
            fetch_tip(&self.pipettes, &self.pool, lane.tip(TipRole::Elution)?).await?;
            {
                let _rates = pipette.set_flow_profile(&mixing.resuspend_rates.into())?;
                pipette
                    .mix(mixing.elution_reps, volumes.elution_mix, Some(&well.bottom(0.0)))
                    .await?;
            }
            pipette.slow_exit(well, 0.0).await?;
            park_tip(pipette, &self.pool).await?;
        }

        self.narrator.narrate("Pelleting MagBeads.");
        self.modules
            .engage_magnet(self.config.settle.elution)
            .await
    }

    async fn eluate_transfer(&mut self) -> AppResult<()> {
        let volumes = &self.config.volumes;
        let reps = self.config.mixing.eluate_reps;
        let pipette = &self.pipettes.low;

        self.modules.require_settled("eluate transfer")?;
        let pools = [
            (TipRole::RtPcrPool1, WellRole::RtPcrPool1),
            (TipRole::RtPcrPool2, WellRole::RtPcrPool2),
        ];
        for (number, (tip_role, well_role)) in pools.into_iter().enumerate() {
            self.narrator
                .narrate(&format!("Transferring eluate into pool {} reactions.", number + 1));
            for lane in self.pool.lanes() {
                let source = lane.well(WellRole::Extraction)?;
                let target = lane.well(well_role)?;
                let draw = FlowProfile::new(ELUATE_ASPIRATE_RATE, pipette.default_rates().dispense)
                    .with_offset(Offset::new(-ELUATE_SHIFT_MM * bead_side(source), 0.0, 0.0));
                debug!(lane = lane.index(), role = %well_role, volume_ul = volumes.eluate_transfer, "transfer eluate");

                fetch_tip(&self.pipettes, &self.pool, lane.tip(tip_role)?).await?;
                pipette.move_to(&source.top(ELUATE_APPROACH_DEPTH_MM)).await?;
                pipette
                    .aspirate(volumes.eluate_transfer, &source.bottom(0.0), Some(&draw))
                    .await?;
                pipette.slow_exit(source, 0.0).await?;
                pipette.dispense_all(Some(&target.bottom(0.0))).await?;
                {
                    let _rates = pipette.set_flow_profile(&ELUATE_MIX_RATES.into())?;
                    pipette
                        .mix(reps, volumes.eluate_mix, Some(&target.bottom(0.0)))
                        .await?;
                }
                pipette.slow_exit(target, 0.0).await?;
                park_tip(pipette, &self.pool).await?;
            }
        }
        Ok(())
    }

    async fn mineral_oil_overlay(&mut self) -> AppResult<()> {
        let volumes = &self.config.volumes;
        let layout = &self.config.layout;
        let oil = layout.reagent(layout.reagents.mineral_oil);
        let pipette = &self.pipettes.high;
        let overlay = SideDispense {
            volume_ul: Some(volumes.oil_overlay),
            blow_out: false,
            ..SideDispense::default()
        };

        self.narrator
            .narrate("Adding mineral oil overlay to RT-PCR reactions.");
        for lane in self.pool.lanes() {
            debug!(lane = lane.index(), volume_ul = volumes.mineral_oil, "oil overlay");
            fetch_tip(&self.pipettes, &self.pool, lane.tip(TipRole::BeadWash)?).await?;
            pipette
                .aspirate(volumes.mineral_oil, &oil.bottom(0.0), None)
                .await?;
            pipette.slow_exit(&oil, 0.0).await?;
            for role in WellRole::RT_PCR_PLATE {
                let well = lane.well(role)?;
                side_dispense(pipette, well, overlay).await?;
                pipette.slow_exit(well, 0.0).await?;
            }
            park_tip(pipette, &self.pool).await?;
        }

        self.modules.disengage_magnet().await
    }

    async fn thermal_profile(&mut self) -> AppResult<()> {
        let thermal = &self.config.thermal;
        let max_volume = Some(thermal.block_max_volume_ul);

        self.narrator.narrate("Closing thermocycler lid.");
        self.modules.close_lid().await?;
        self.deck.robot.home().await?;
        self.modules.set_lid_temperature(thermal.lid_c).await?;

        for step in &thermal.holds {
            self.narrator.narrate(&format!(
                "Holding block at {} °C for {} s.",
                step.temperature_c,
                step.hold.as_secs()
            ));
            self.modules
                .set_block_temperature(step.temperature_c, Some(step.hold), max_volume)
                .await?;
        }

        self.narrator.narrate(&format!(
            "Performing amplicon generation ({} cycles).",
            thermal.cycles
        ));
        self.modules
            .run_thermocycler_profile(&thermal.cycle, thermal.cycles, max_volume)
            .await?;
        self.modules
            .set_block_temperature(thermal.final_hold_c, None, max_volume)
            .await
    }
}

/// Mix a shared master mix in place with a borrowed tip, then park the tip.
async fn premix(
    pipettes: &Pipettes,
    pool: &ResourcePool,
    tip: &TipResource,
    well: &WellResource,
    reps: u32,
    volume_ul: f64,
) -> AppResult<()> {
    let pipette = pipettes.for_channel(tip.channel);
    fetch_tip(pipettes, pool, tip).await?;
    pipette
        .mix(reps, volume_ul, Some(&well.bottom(PREMIX_HEIGHT_MM)))
        .await?;
    pipette.slow_exit(well, PREMIX_EXIT_DEPTH_MM).await?;
    {
        let _blow_out = pipette.set_blow_out_rate(PREMIX_BLOW_OUT_RATE)?;
        pipette.blow_out(None).await?;
    }
    touch_tip(pipette, well, PREMIX_EXIT_DEPTH_MM).await?;
    park_tip(pipette, pool).await
}

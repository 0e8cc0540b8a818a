//! Resource pool: exclusive tips and wells per sample lane.
//!
//! The pool is populated once, before any hardware motion, and lane bindings
//! never change afterwards. Exclusivity is proven at allocation time so no
//! runtime locking of lane resources is needed:
//!
//! - [`ResourcePool::allocate_tips`]: role-major round robin over the
//!   enumerated racks (rack-by-rack, then position-by-position)
//! - [`ResourcePool::allocate_wells`]: lane-major over a plate's declared wells
//! - [`ResourcePool::reserve_tip`]: an explicitly addressed tip shared by all lanes
//!
//! # Tip lifecycle
//!
//! ```text
//! Unused ──pick_up──▶ Held ──park────▶ Parked ──pick_up──▶ Held
//!                       └───consume──▶ Consumed (terminal)
//! ```
//!
//! The ledger also records which tip each channel holds, so at most one tip
//! is held per channel at any instant.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use tracing::{debug, trace};

use crate::error::{AppResult, ChoreoError};
use crate::labware::{
    ChannelClass, Plate, TipId, TipRack, TipResource, TipSlot, WellAddress, WellResource,
};

// =============================================================================
// Roles
// =============================================================================

/// What a lane uses a tip for. Declaration order is allocation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TipRole {
    /// Sample premix and proteinase K addition
    Mix,
    /// First viral binding buffer addition
    ViralBuffer1,
    /// Second viral binding buffer addition
    ViralBuffer2,
    /// First bead/binding buffer addition
    MagbeadBuffer1,
    /// Second bead/binding buffer addition
    MagbeadBuffer2,
    /// Ethanol wash, first pass
    Ethanol1,
    /// Ethanol wash, second pass
    Ethanol2,
    /// Ethanol wash, third pass
    Ethanol3,
    /// Elution buffer and eluate transfer
    Elution,
    /// Tagmentation stop buffer
    Stop,
    /// Post-tagmentation bead washes
    BeadWash,
    /// Index PCR master mix
    Pcr,
    /// Transfer into RT-PCR pool 1
    RtPcrPool1,
    /// Transfer into RT-PCR pool 2
    RtPcrPool2,
    /// Tagmentation bead mix
    BltBead,
}

impl TipRole {
    /// Roles drawn from the 300 µl racks.
    pub const HIGH_VOLUME: [TipRole; 12] = [
        TipRole::Mix,
        TipRole::ViralBuffer1,
        TipRole::ViralBuffer2,
        TipRole::MagbeadBuffer1,
        TipRole::MagbeadBuffer2,
        TipRole::Ethanol1,
        TipRole::Ethanol2,
        TipRole::Ethanol3,
        TipRole::Elution,
        TipRole::Stop,
        TipRole::BeadWash,
        TipRole::Pcr,
    ];

    /// Roles drawn from the 20 µl racks.
    pub const LOW_VOLUME: [TipRole; 3] = [TipRole::RtPcrPool1, TipRole::RtPcrPool2, TipRole::BltBead];

    /// Channel whose racks supply this role.
    pub fn channel(&self) -> ChannelClass {
        match self {
            TipRole::RtPcrPool1 | TipRole::RtPcrPool2 | TipRole::BltBead => ChannelClass::LowVolume,
            _ => ChannelClass::HighVolume,
        }
    }

    /// Snake-case name, as serialized.
    pub fn as_str(&self) -> &'static str {
        match self {
            TipRole::Mix => "mix",
            TipRole::ViralBuffer1 => "viral_buffer_1",
            TipRole::ViralBuffer2 => "viral_buffer_2",
            TipRole::MagbeadBuffer1 => "magbead_buffer_1",
            TipRole::MagbeadBuffer2 => "magbead_buffer_2",
            TipRole::Ethanol1 => "ethanol_1",
            TipRole::Ethanol2 => "ethanol_2",
            TipRole::Ethanol3 => "ethanol_3",
            TipRole::Elution => "elution",
            TipRole::Stop => "stop",
            TipRole::BeadWash => "bead_wash",
            TipRole::Pcr => "pcr",
            TipRole::RtPcrPool1 => "rt_pcr_pool_1",
            TipRole::RtPcrPool2 => "rt_pcr_pool_2",
            TipRole::BltBead => "blt_bead",
        }
    }
}

impl fmt::Display for TipRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a lane uses a well for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WellRole {
    /// Sample well on the magnetic plate
    Extraction,
    /// Magnetic-plate well holding the lane's bead wash buffer
    BeadWash,
    /// Magnetic-plate well for rinsing shared tips
    TipWash,
    /// Thermocycler well for RT-PCR pool 1
    RtPcrPool1,
    /// Thermocycler well for RT-PCR pool 2
    RtPcrPool2,
    /// Thermocycler well for the index PCR
    IndexPcr,
    /// Per-lane index primer on the cold plate
    IndexPrimer,
}

impl WellRole {
    /// Roles bound on the magnetic plate, lane-major.
    pub const MAGNETIC_PLATE: [WellRole; 3] = [WellRole::Extraction, WellRole::BeadWash, WellRole::TipWash];
    /// Roles bound on the thermocycler plate for RT-PCR.
    pub const RT_PCR_PLATE: [WellRole; 2] = [WellRole::RtPcrPool1, WellRole::RtPcrPool2];

    /// Snake-case name, as serialized.
    pub fn as_str(&self) -> &'static str {
        match self {
            WellRole::Extraction => "extraction",
            WellRole::BeadWash => "bead_wash",
            WellRole::TipWash => "tip_wash",
            WellRole::RtPcrPool1 => "rt_pcr_pool_1",
            WellRole::RtPcrPool2 => "rt_pcr_pool_2",
            WellRole::IndexPcr => "index_pcr",
            WellRole::IndexPrimer => "index_primer",
        }
    }
}

impl fmt::Display for WellRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Lanes
// =============================================================================

/// One sample's resources, processed in lockstep with the other lanes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleLane {
    index: usize,
    tips: BTreeMap<TipRole, TipResource>,
    wells: BTreeMap<WellRole, WellResource>,
}

impl SampleLane {
    fn new(index: usize) -> Self {
        Self {
            index,
            tips: BTreeMap::new(),
            wells: BTreeMap::new(),
        }
    }

    /// Position of the lane, starting at 0.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Tip bound to `role`.
    pub fn tip(&self, role: TipRole) -> AppResult<&TipResource> {
        self.tips.get(&role).ok_or_else(|| {
            ChoreoError::AllocationConflict(format!("lane {} has no tip bound for {}", self.index, role))
        })
    }

    /// Well bound to `role`.
    pub fn well(&self, role: WellRole) -> AppResult<&WellResource> {
        self.wells.get(&role).ok_or_else(|| {
            ChoreoError::AllocationConflict(format!("lane {} has no well bound for {}", self.index, role))
        })
    }

    /// Every tip binding, in role order.
    pub fn tips(&self) -> impl Iterator<Item = (TipRole, &TipResource)> {
        self.tips.iter().map(|(role, tip)| (*role, tip))
    }

    /// Every well binding, in role order.
    pub fn wells(&self) -> impl Iterator<Item = (WellRole, &WellResource)> {
        self.wells.iter().map(|(role, well)| (*role, well))
    }
}

// =============================================================================
// Tip ledger
// =============================================================================

/// Lifecycle state of a registered tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TipState {
    /// Still in the rack, never picked up
    Unused,
    /// Mounted on the given channel
    Held(ChannelClass),
    /// Returned to its rack slot, reusable by the same role
    Parked,
    /// Discarded after supernatant removal
    Consumed,
}

impl fmt::Display for TipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TipState::Unused => f.write_str("unused"),
            TipState::Held(channel) => write!(f, "held on the {} channel", channel),
            TipState::Parked => f.write_str("parked"),
            TipState::Consumed => f.write_str("consumed"),
        }
    }
}

#[derive(Debug, Default)]
struct TipLedger {
    states: HashMap<TipId, TipState>,
    held: HashMap<ChannelClass, TipId>,
}

impl TipLedger {
    fn state(&self, tip: &TipResource) -> AppResult<TipState> {
        self.states
            .get(&tip.id)
            .copied()
            .ok_or_else(|| ChoreoError::AllocationConflict(format!("tip {} is not registered", tip)))
    }
}

fn invalid(tip: &TipResource, action: &'static str, state: TipState) -> ChoreoError {
    ChoreoError::InvalidTipTransition {
        tip: tip.to_string(),
        action,
        state: state.to_string(),
    }
}

// =============================================================================
// Pool
// =============================================================================

/// Owner of every lane binding and of the tip ledger.
#[derive(Debug)]
pub struct ResourcePool {
    lanes: Vec<SampleLane>,
    registered: Vec<TipResource>,
    slots: HashSet<TipSlot>,
    allocated_wells: HashSet<(String, WellAddress)>,
    ledger: Mutex<TipLedger>,
}

impl ResourcePool {
    /// Empty pool for `lane_count` lanes.
    pub fn new(lane_count: usize) -> Self {
        Self {
            lanes: (0..lane_count).map(SampleLane::new).collect(),
            registered: Vec::new(),
            slots: HashSet::new(),
            allocated_wells: HashSet::new(),
            ledger: Mutex::new(TipLedger::default()),
        }
    }

    /// Every lane in order.
    pub fn lanes(&self) -> &[SampleLane] {
        &self.lanes
    }

    /// Lane by index.
    pub fn lane(&self, index: usize) -> AppResult<&SampleLane> {
        self.lanes
            .get(index)
            .ok_or_else(|| ChoreoError::AllocationConflict(format!("no lane {}", index)))
    }

    /// Bind one tip per (lane, role) from `racks`.
    ///
    /// Tips are enumerated rack-by-rack in each rack's declared position order.
    /// Roles are visited in the given order and, within a role, lanes in order,
    /// each drawing the next enumerated tip.
    ///
    /// # Errors
    ///
    /// - `ResourceExhausted` if the racks hold fewer tips than roles × lanes
    /// - `AllocationConflict` if a rack slot is already registered or a role is
    ///   already bound for a lane
    ///
    /// Nothing is bound when an error is returned.
    pub fn allocate_tips(
        &mut self,
        roles: &[TipRole],
        racks: &[TipRack],
        channel: ChannelClass,
    ) -> AppResult<()> {
        let enumerated: Vec<TipSlot> = racks
            .iter()
            .flat_map(|rack| {
                rack.positions.iter().map(move |address| TipSlot {
                    rack: rack.deck_slot.clone(),
                    address: *address,
                })
            })
            .collect();

        let requested = roles.len() * self.lanes.len();
        if requested > enumerated.len() {
            return Err(ChoreoError::ResourceExhausted {
                resource: format!("{} tips", channel),
                requested,
                available: enumerated.len(),
            });
        }

        {
            let mut seen = HashSet::new();
            for slot in &enumerated {
                if self.slots.contains(slot) || !seen.insert(slot) {
                    return Err(ChoreoError::AllocationConflict(format!(
                        "tip at {} is already registered",
                        slot
                    )));
                }
            }
        }

        let mut seen_roles = HashSet::new();
        for role in roles {
            if role.channel() != channel {
                return Err(ChoreoError::AllocationConflict(format!(
                    "role {} uses the {} channel, not {}",
                    role,
                    role.channel(),
                    channel
                )));
            }
            if !seen_roles.insert(role) {
                return Err(ChoreoError::AllocationConflict(format!("role {} requested twice", role)));
            }
            if let Some(lane) = self.lanes.iter().find(|lane| lane.tips.contains_key(role)) {
                return Err(ChoreoError::AllocationConflict(format!(
                    "role {} is already bound for lane {}",
                    role, lane.index
                )));
            }
        }

        let mut slots = enumerated.into_iter();
        for role in roles {
            for lane_index in 0..self.lanes.len() {
                // Length checked above
                let Some(slot) = slots.next() else { break };
                let tip = self.register(channel, slot);
                trace!(lane = lane_index, role = %role, tip = %tip, "tip bound");
                self.lanes[lane_index].tips.insert(*role, tip);
            }
        }

        debug!(
            channel = %channel,
            roles = roles.len(),
            lanes = self.lanes.len(),
            "tips allocated"
        );
        Ok(())
    }

    /// Bind one well per (lane, role) from the plate's declared wells,
    /// lane-major: lane 0 takes the first `roles.len()` wells, and so on.
    ///
    /// # Errors
    ///
    /// - `ResourceExhausted` if the plate declares fewer wells than roles × lanes
    /// - `AllocationConflict` if a role is already bound or a well is already
    ///   assigned to another role
    pub fn allocate_wells(&mut self, roles: &[WellRole], plate: &Plate) -> AppResult<()> {
        let requested = roles.len() * self.lanes.len();
        if requested > plate.wells.len() {
            return Err(ChoreoError::ResourceExhausted {
                resource: format!("{} wells", plate.id),
                requested,
                available: plate.wells.len(),
            });
        }

        for role in roles {
            if let Some(lane) = self.lanes.iter().find(|lane| lane.wells.contains_key(role)) {
                return Err(ChoreoError::AllocationConflict(format!(
                    "well role {} is already bound for lane {}",
                    role, lane.index
                )));
            }
        }

        let wells: Vec<WellResource> = plate.declared_wells().take(requested).collect();
        let mut seen = HashSet::new();
        for well in &wells {
            let key = (well.plate.clone(), well.address);
            if self.allocated_wells.contains(&key) || !seen.insert(key) {
                return Err(ChoreoError::AllocationConflict(format!(
                    "well {} is already assigned",
                    well
                )));
            }
        }

        let mut wells = wells.into_iter();
        for lane in &mut self.lanes {
            for role in roles {
                let Some(well) = wells.next() else { break };
                self.allocated_wells.insert((well.plate.clone(), well.address));
                lane.wells.insert(*role, well);
            }
        }

        debug!(plate = %plate.id, roles = roles.len(), "wells allocated");
        Ok(())
    }

    /// Register an explicitly addressed tip shared by every lane.
    pub fn reserve_tip(&mut self, channel: ChannelClass, slot: TipSlot) -> AppResult<TipResource> {
        if self.slots.contains(&slot) {
            return Err(ChoreoError::AllocationConflict(format!(
                "tip at {} is already registered",
                slot
            )));
        }
        let tip = self.register(channel, slot);
        debug!(tip = %tip, "shared tip reserved");
        Ok(tip)
    }

    fn register(&mut self, channel: ChannelClass, slot: TipSlot) -> TipResource {
        let tip = TipResource {
            id: TipId(self.registered.len()),
            channel,
            slot,
        };
        self.slots.insert(tip.slot.clone());
        self.ledger.lock().states.insert(tip.id, TipState::Unused);
        self.registered.push(tip.clone());
        tip
    }

    /// Every registered tip in registration order.
    pub fn registered_tips(&self) -> &[TipResource] {
        &self.registered
    }

    /// Ledger state of a registered tip.
    pub fn tip_state(&self, tip: &TipResource) -> AppResult<TipState> {
        self.ledger.lock().state(tip)
    }

    /// Mark `tip` as held by its channel and return the state it left.
    ///
    /// The tip must be unused or parked, and its channel must be free.
    pub fn pick_up(&self, tip: &TipResource) -> AppResult<TipState> {
        let mut ledger = self.ledger.lock();
        let state = ledger.state(tip)?;
        if !matches!(state, TipState::Unused | TipState::Parked) {
            return Err(invalid(tip, "pick up", state));
        }
        if let Some(held) = ledger.held.get(&tip.channel) {
            return Err(ChoreoError::InvalidTipTransition {
                tip: tip.to_string(),
                action: "pick up",
                state: format!("blocked by tip #{} on the {} channel", held.0, tip.channel),
            });
        }
        ledger.states.insert(tip.id, TipState::Held(tip.channel));
        ledger.held.insert(tip.channel, tip.id);
        Ok(state)
    }

    /// Undo a [`ResourcePool::pick_up`] whose hardware move failed, putting
    /// the tip back in the state `pick_up` returned.
    pub fn cancel_pick_up(&self, tip: &TipResource, previous: TipState) -> AppResult<()> {
        if !matches!(previous, TipState::Unused | TipState::Parked) {
            return Err(invalid(tip, "cancel pick up", previous));
        }
        self.release(tip, "cancel pick up", previous)
    }

    /// Mark a held tip as returned to its rack for later reuse.
    pub fn park(&self, tip: &TipResource) -> AppResult<()> {
        self.release(tip, "park", TipState::Parked)
    }

    /// Mark a held tip as discarded. Consumed tips are never picked up again.
    pub fn consume(&self, tip: &TipResource) -> AppResult<()> {
        self.release(tip, "consume", TipState::Consumed)
    }

    fn release(&self, tip: &TipResource, action: &'static str, next: TipState) -> AppResult<()> {
        let mut ledger = self.ledger.lock();
        let state = ledger.state(tip)?;
        if state != TipState::Held(tip.channel) {
            return Err(invalid(tip, action, state));
        }
        ledger.states.insert(tip.id, next);
        ledger.held.remove(&tip.channel);
        Ok(())
    }

    /// Tip currently held by `channel`, if any.
    pub fn current_tip(&self, channel: ChannelClass) -> Option<TipResource> {
        let id = *self.ledger.lock().held.get(&channel)?;
        self.registered.get(id.0).cloned()
    }
}

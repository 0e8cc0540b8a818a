//! Deck layout: tip racks, plates and reagent positions.
//!
//! The stock layout matches a single-mount-row multi-channel workflow on a
//! 96-well deck: four 300 µl tip racks, one 20 µl rack, a 12-channel reagent
//! reservoir, a cold reagent plate on the temperature module, a LoBind plate
//! on the magnetic module and a PCR plate in the thermocycler. All of it can be
//! overridden from configuration.

use serde::{Deserialize, Serialize};

use crate::labware::{Plate, TipRack, TipSlot, WellAddress, WellResource};

/// Reservoir channels holding shared, read-only reagents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ReagentMap {
    pub viral_buffer_beads: WellAddress,
    pub viral_buffer: WellAddress,
    pub magbead_buffer_1: WellAddress,
    pub magbead_buffer_2: WellAddress,
    pub ethanol_1: WellAddress,
    pub ethanol_2: WellAddress,
    pub elution_buffer: WellAddress,
    pub mineral_oil: WellAddress,
    pub stop_buffer: WellAddress,
    pub bead_wash_buffer: WellAddress,
    pub tip_wash: WellAddress,
}

impl ReagentMap {
    /// Every reagent address with its name, in reservoir order.
    pub fn entries(&self) -> [(&'static str, WellAddress); 11] {
        [
            ("viral_buffer_beads", self.viral_buffer_beads),
            ("viral_buffer", self.viral_buffer),
            ("magbead_buffer_1", self.magbead_buffer_1),
            ("magbead_buffer_2", self.magbead_buffer_2),
            ("ethanol_1", self.ethanol_1),
            ("ethanol_2", self.ethanol_2),
            ("elution_buffer", self.elution_buffer),
            ("mineral_oil", self.mineral_oil),
            ("stop_buffer", self.stop_buffer),
            ("bead_wash_buffer", self.bead_wash_buffer),
            ("tip_wash", self.tip_wash),
        ]
    }
}

/// Master mixes kept cold on the temperature module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColdReagentMap {
    /// Proteinase K and extraction control master mix
    pub proteinase_k_mix: WellAddress,
    /// RT-PCR pool 1 master mix
    pub rt_pcr_pool_1_mix: WellAddress,
    /// RT-PCR pool 2 master mix
    pub rt_pcr_pool_2_mix: WellAddress,
}

/// Where everything sits on the deck.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeckLayout {
    /// 300 µl racks, enumerated rack-by-rack then position-by-position
    pub high_volume_racks: Vec<TipRack>,
    /// 20 µl racks
    pub low_volume_racks: Vec<TipRack>,
    /// Low-volume tips outside the lane enumeration, one per RT-PCR pool
    pub shared_low_volume_tips: Vec<TipSlot>,
    /// 12-channel reagent reservoir
    pub reservoir: Plate,
    /// Reagent channels in the reservoir
    pub reagents: ReagentMap,
    /// Fixed trash well
    pub trash: WellResource,
    /// Cold plate region holding per-lane index primers
    pub cold_plate: Plate,
    /// Master-mix wells on the cold plate
    pub cold_reagents: ColdReagentMap,
    /// LoBind plate on the magnetic module
    pub magnetic_plate: Plate,
    /// Thermocycler wells for the two RT-PCR pools
    pub rt_pcr_plate: Plate,
    /// Thermocycler wells kept free for indexing PCR
    pub index_pcr_plate: Plate,
}

fn row_a(columns: impl IntoIterator<Item = u8>) -> Vec<WellAddress> {
    columns.into_iter().filter_map(WellAddress::row_a).collect()
}

const fn address(row: char, column: u8) -> WellAddress {
    WellAddress::from_parts(row, column)
}

impl Default for DeckLayout {
    fn default() -> Self {
        let reservoir = Plate::new("reservoir", 15_000.0, row_a(1..=12));
        Self {
            high_volume_racks: ["9", "6", "5", "8"]
                .into_iter()
                .map(|slot| TipRack::row_a(slot, (1..=12).rev()))
                .collect(),
            low_volume_racks: vec![TipRack::row_a("2", 1..=12)],
            shared_low_volume_tips: vec![
                TipSlot {
                    rack: "2".into(),
                    address: address('E', 4),
                },
                TipSlot {
                    rack: "2".into(),
                    address: address('E', 5),
                },
            ],
            reagents: ReagentMap {
                viral_buffer_beads: address('A', 1),
                viral_buffer: address('A', 2),
                magbead_buffer_1: address('A', 3),
                magbead_buffer_2: address('A', 4),
                ethanol_1: address('A', 5),
                ethanol_2: address('A', 6),
                elution_buffer: address('A', 7),
                mineral_oil: address('A', 8),
                stop_buffer: address('A', 9),
                bead_wash_buffer: address('A', 10),
                tip_wash: address('A', 11),
            },
            reservoir,
            trash: WellResource::new("trash", address('A', 1), 290_000.0),
            cold_plate: Plate::new("cold_plate", 200.0, row_a(9..=12)),
            cold_reagents: ColdReagentMap {
                proteinase_k_mix: address('A', 1),
                rt_pcr_pool_1_mix: address('A', 4),
                rt_pcr_pool_2_mix: address('E', 4),
            },
            magnetic_plate: Plate::new("magnetic_plate", 500.0, row_a(1..=12)),
            rt_pcr_plate: Plate::new("thermocycler_plate", 200.0, row_a(3..=10)),
            index_pcr_plate: Plate::new("thermocycler_plate", 200.0, row_a([1, 2, 11, 12])),
        }
    }
}

impl DeckLayout {
    /// Reservoir well for a reagent address.
    pub fn reagent(&self, address: WellAddress) -> WellResource {
        self.reservoir.well(address)
    }

    /// Cold-plate well for a master-mix address.
    pub fn cold_reagent(&self, address: WellAddress) -> WellResource {
        self.cold_plate.well(address)
    }

    /// Both ethanol reservoir wells.
    pub fn ethanol_wells(&self) -> [WellResource; 2] {
        [
            self.reagent(self.reagents.ethanol_1),
            self.reagent(self.reagents.ethanol_2),
        ]
    }
}

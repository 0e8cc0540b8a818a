//! Addressable deck resources.
//!
//! Deck geometry is opaque to the choreography core: a well is identified by
//! its plate and a row/column address, and every physical position is
//! expressed relative to the well's top or bottom plus a lateral offset. The
//! control surface resolves those into coordinates.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

// =============================================================================
// Channels
// =============================================================================

/// Pipette channel class. One multi-channel pipette of each class is mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelClass {
    /// 20 µl multi-channel pipette (right mount)
    LowVolume,
    /// 300 µl multi-channel pipette (left mount)
    HighVolume,
}

impl ChannelClass {
    /// Short name used in logs and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelClass::LowVolume => "low-volume",
            ChannelClass::HighVolume => "high-volume",
        }
    }
}

impl fmt::Display for ChannelClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Well addresses
// =============================================================================

/// Row/column address on a plate or tip rack, e.g. `A12`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WellAddress {
    row: char,
    column: u8,
}

impl WellAddress {
    /// Build an address from a row letter and a 1-based column.
    pub fn new(row: char, column: u8) -> Option<Self> {
        let row = row.to_ascii_uppercase();
        if row.is_ascii_uppercase() && column >= 1 {
            Some(Self { row, column })
        } else {
            None
        }
    }

    /// Address from literal parts, for static layout tables.
    pub(crate) const fn from_parts(row: char, column: u8) -> Self {
        Self { row, column }
    }

    /// Address in row A, the row addressed by multi-channel pipettes.
    pub fn row_a(column: u8) -> Option<Self> {
        Self::new('A', column)
    }

    /// Row letter, upper case.
    pub fn row(&self) -> char {
        self.row
    }

    /// 1-based column.
    pub fn column(&self) -> u8 {
        self.column
    }
}

impl fmt::Display for WellAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.row, self.column)
    }
}

/// Error returned when a well address string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid well address '{0}'")]
pub struct ParseWellAddressError(String);

impl FromStr for WellAddress {
    type Err = ParseWellAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.trim().chars();
        let row = chars
            .next()
            .ok_or_else(|| ParseWellAddressError(s.to_string()))?;
        let column: u8 = chars
            .as_str()
            .parse()
            .map_err(|_| ParseWellAddressError(s.to_string()))?;
        Self::new(row, column).ok_or_else(|| ParseWellAddressError(s.to_string()))
    }
}

impl Serialize for WellAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for WellAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Wells and locations
// =============================================================================

/// Running estimate of the liquid in a well (µl).
///
/// Clones share one estimate, so a lane's well binding and every [`Location`]
/// built from it observe the same level. Never drops below zero.
#[derive(Debug, Clone, Default)]
pub struct FillEstimate(Arc<Mutex<f64>>);

impl FillEstimate {
    /// Estimate starting at `volume_ul`.
    pub fn new(volume_ul: f64) -> Self {
        Self(Arc::new(Mutex::new(volume_ul.max(0.0))))
    }

    /// Current estimate in µl.
    pub fn volume_ul(&self) -> f64 {
        *self.0.lock()
    }

    /// Overwrite the estimate, e.g. after the operator loads a plate.
    pub fn set(&self, volume_ul: f64) {
        *self.0.lock() = volume_ul.max(0.0);
    }

    /// Record liquid dispensed into the well.
    pub fn add(&self, volume_ul: f64) {
        *self.0.lock() += volume_ul.max(0.0);
    }

    /// Record liquid drawn from the well.
    pub fn remove(&self, volume_ul: f64) {
        let mut level = self.0.lock();
        *level = (*level - volume_ul.max(0.0)).max(0.0);
    }
}

impl Serialize for FillEstimate {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.volume_ul())
    }
}

impl<'de> Deserialize<'de> for FillEstimate {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        f64::deserialize(deserializer).map(Self::new)
    }
}

/// An addressable liquid-holding location.
///
/// Reagent wells are shared and only ever aspirated from; sample wells belong
/// to exactly one lane. Equality is identity (plate, address, capacity); the
/// fill estimate is state, not identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WellResource {
    /// Plate identifier (e.g. "magnetic_plate")
    pub plate: String,
    /// Position on the plate
    pub address: WellAddress,
    /// Nominal capacity in µl
    pub capacity_ul: f64,
    /// Current fill estimate, updated by the pipette primitives
    #[serde(default, rename = "fill_ul")]
    pub fill: FillEstimate,
}

impl PartialEq for WellResource {
    fn eq(&self, other: &Self) -> bool {
        self.plate == other.plate
            && self.address == other.address
            && self.capacity_ul == other.capacity_ul
    }
}

impl WellResource {
    /// Empty well.
    pub fn new(plate: impl Into<String>, address: WellAddress, capacity_ul: f64) -> Self {
        Self {
            plate: plate.into(),
            address,
            capacity_ul,
            fill: FillEstimate::default(),
        }
    }

    /// Current fill estimate in µl.
    pub fn fill_ul(&self) -> f64 {
        self.fill.volume_ul()
    }

    /// Location `z` mm above the well bottom.
    pub fn bottom(&self, z: f64) -> Location {
        Location {
            well: self.clone(),
            anchor: Anchor::Bottom,
            offset: Offset::z(z),
        }
    }

    /// Location `z` mm relative to the well top (negative is inside the well).
    pub fn top(&self, z: f64) -> Location {
        Location {
            well: self.clone(),
            anchor: Anchor::Top,
            offset: Offset::z(z),
        }
    }
}

impl fmt::Display for WellResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.plate, self.address)
    }
}

/// Bead-avoidance direction for a well.
///
/// Magnets sit between columns, so pellets in even and odd columns form on
/// opposite walls: even column → `-1.0`, odd column → `+1.0`.
pub fn bead_side(well: &WellResource) -> f64 {
    if well.address.column() % 2 == 0 {
        -1.0
    } else {
        1.0
    }
}

/// Vertical reference point of a [`Location`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Anchor {
    /// Rim of the well
    Top,
    /// Floor of the well
    Bottom,
}

/// Geometric offset in mm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Offset {
    /// Along the plate row, positive to the right
    pub x: f64,
    /// Along the plate column, positive towards row A
    pub y: f64,
    /// Vertical, positive up
    pub z: f64,
}

impl Offset {
    /// Offset from its three components.
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Purely vertical offset.
    pub const fn z(z: f64) -> Self {
        Self { x: 0.0, y: 0.0, z }
    }
}

impl std::ops::Add for Offset {
    type Output = Offset;

    fn add(self, rhs: Offset) -> Offset {
        Offset::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

/// A physical point relative to a well.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Well the point is relative to
    pub well: WellResource,
    /// Vertical reference
    pub anchor: Anchor,
    /// Offset from the anchor
    pub offset: Offset,
}

impl Location {
    /// Same anchor, shifted by an additional offset.
    pub fn shifted(mut self, by: Offset) -> Self {
        self.offset = self.offset + by;
        self
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let anchor = match self.anchor {
            Anchor::Top => "top",
            Anchor::Bottom => "bottom",
        };
        write!(
            f,
            "{}.{}({:+.2},{:+.2},{:+.2})",
            self.well, anchor, self.offset.x, self.offset.y, self.offset.z
        )
    }
}

// =============================================================================
// Tips
// =============================================================================

/// Physical tip position: tip-rack deck slot plus address within the rack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TipSlot {
    /// Deck slot of the rack
    pub rack: String,
    /// Position within the rack
    pub address: WellAddress,
}

impl fmt::Display for TipSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rack {}:{}", self.rack, self.address)
    }
}

/// Pool-unique tip identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TipId(
    /// Registration index
    pub usize,
);

/// A single-use pipette tip known to the resource pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TipResource {
    /// Registration index in the pool
    pub id: TipId,
    /// Channel able to pick the tip up
    pub channel: ChannelClass,
    /// Where the tip lives between uses
    pub slot: TipSlot,
}

impl fmt::Display for TipResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({} {})", self.id.0, self.channel, self.slot)
    }
}

/// A tip rack on the deck with its positions in enumeration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TipRack {
    /// Deck slot the rack sits in
    pub deck_slot: String,
    /// Tip positions in enumeration order
    pub positions: Vec<WellAddress>,
}

impl TipRack {
    /// Rack using row A only, columns in the given order.
    pub fn row_a(deck_slot: impl Into<String>, columns: impl IntoIterator<Item = u8>) -> Self {
        Self {
            deck_slot: deck_slot.into(),
            positions: columns.into_iter().filter_map(WellAddress::row_a).collect(),
        }
    }
}

/// A plate: declared wells in allocation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plate {
    /// Plate identifier carried by its wells
    pub id: String,
    /// Nominal capacity of each well in µl
    pub capacity_ul: f64,
    /// Wells available for lane allocation, in order
    pub wells: Vec<WellAddress>,
}

impl Plate {
    /// Plate with the given declared wells.
    pub fn new(id: impl Into<String>, capacity_ul: f64, wells: Vec<WellAddress>) -> Self {
        Self {
            id: id.into(),
            capacity_ul,
            wells,
        }
    }

    /// Any well of this plate, declared for allocation or not.
    pub fn well(&self, address: WellAddress) -> WellResource {
        WellResource::new(self.id.clone(), address, self.capacity_ul)
    }

    /// Declared wells as resources, in allocation order.
    pub fn declared_wells(&self) -> impl Iterator<Item = WellResource> + '_ {
        self.wells.iter().map(|address| self.well(*address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn well(address: &str) -> WellResource {
        WellResource::new("magnetic_plate", address.parse().unwrap(), 500.0)
    }

    #[test]
    fn test_parse_well_address() {
        let addr: WellAddress = "a12".parse().unwrap();
        assert_eq!(addr.row(), 'A');
        assert_eq!(addr.column(), 12);
        assert_eq!(addr.to_string(), "A12");

        assert!("".parse::<WellAddress>().is_err());
        assert!("A".parse::<WellAddress>().is_err());
        assert!("A0".parse::<WellAddress>().is_err());
        assert!("1A".parse::<WellAddress>().is_err());
    }

    #[test]
    fn test_bead_side_follows_column_parity() {
        assert_eq!(bead_side(&well("A1")), 1.0);
        assert_eq!(bead_side(&well("A2")), -1.0);
        assert_eq!(bead_side(&well("H11")), 1.0);
        assert_eq!(bead_side(&well("E12")), -1.0);
    }

    #[test]
    fn test_bead_side_is_stable() {
        let w = well("A7");
        let first = bead_side(&w);
        for _ in 0..10 {
            assert_eq!(bead_side(&w), first);
        }
        // Row does not matter, only column
        assert_eq!(bead_side(&well("D7")), first);
    }

    #[test]
    fn test_location_offsets_accumulate() {
        let loc = well("A3")
            .bottom(1.0)
            .shifted(Offset::new(1.5, 0.0, 0.5));
        assert_eq!(loc.anchor, Anchor::Bottom);
        assert_eq!(loc.offset, Offset::new(1.5, 0.0, 1.5));
    }

    #[test]
    fn test_fill_estimate_shared_by_clones() {
        let w = well("A1");
        let location = w.bottom(0.0);
        location.well.fill.add(125.0);
        assert_eq!(w.fill_ul(), 125.0);

        w.fill.remove(200.0);
        assert_eq!(location.well.fill_ul(), 0.0);

        // Fill is state, not identity
        let fresh = well("A1");
        assert_eq!(fresh.fill_ul(), 0.0);
        w.fill.set(40.0);
        assert_eq!(fresh, w);
    }

    #[test]
    fn test_fill_estimate_serializes_as_volume() {
        let w = well("B2");
        w.fill.set(62.5);
        let json = serde_json::to_value(&w).unwrap();
        assert_eq!(json["fill_ul"], 62.5);

        let back: WellResource = serde_json::from_value(json).unwrap();
        assert_eq!(back.fill_ul(), 62.5);
        let bare: WellResource =
            serde_json::from_str(r#"{"plate":"p","address":"A1","capacity_ul":200.0}"#).unwrap();
        assert_eq!(bare.fill_ul(), 0.0);
    }

    #[test]
    fn test_row_a_rack_keeps_declared_order() {
        let rack = TipRack::row_a("9", (1..=12).rev());
        assert_eq!(rack.positions.first().unwrap().to_string(), "A12");
        assert_eq!(rack.positions.last().unwrap().to_string(), "A1");
        assert_eq!(rack.positions.len(), 12);
    }
}

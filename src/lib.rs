//! Choreography core for the POLARtron extraction and RT-PCR setup protocol.
//!
//! The crate drives a liquid-handling robot with a magnetic module, a
//! temperature module and a thermocycler through a fixed eleven-stage
//! workflow. Layers, leaf first:
//!
//! - [`pool`]: exclusive tips and wells per sample lane, tip state ledger
//! - [`primitives`]: pipette wrappers with scoped flow-rate and speed overrides
//! - [`compound`]: bead resuspension, supernatant removal, well wash and friends
//! - [`wash`]: the wash-beads cycle state machine
//! - [`coordinator`]: magnet and thermal module state
//! - [`choreographer`]: ordered stage driver
//! - [`narration`]: run log, alerts and operator pauses
//!
//! The robot itself is reached only through the traits in [`hardware`].

pub mod choreographer;
pub mod compound;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod hardware;
pub mod labware;
pub mod layout;
pub mod logging;
pub mod narration;
pub mod pool;
pub mod primitives;
pub mod wash;

pub use choreographer::{Choreographer, ProtocolStage, RunSummary};
pub use error::{AppResult, ChoreoError};

//! Shared primitives for the sealing pipeline: piece-size arithmetic with
//! the Fr32 padding rules, sector identifiers and the seal-proof registry.

mod piece;
mod sector;

pub use piece::{
    required_padding, PaddedPieceSize, PaddedPieceSizeError, UnpaddedPieceSize,
    UnpaddedPieceSizeError,
};
pub use sector::{
    ActorId, RegisteredSealProof, SectorId, SectorNumber, SectorNumberError, SectorSize,
    MAX_SECTORS,
};

/// A tick of the underlying chain. One epoch lasts `block_delay_secs` seconds.
pub type ChainEpoch = u64;

/// On-chain identifier of a published storage deal.
pub type DealId = u64;

/// Token amounts (deposits, fees) in the chain's smallest denomination.
pub type Currency = u128;

/// Actor method number of an on-chain message.
pub type MethodNum = u64;
